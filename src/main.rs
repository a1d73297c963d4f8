mod browser;
mod coordinator;
mod csv_writer;
mod excel_writer;
mod logger;
mod models;
mod scraper;
mod store;
mod walk;

use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Local;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{error, info, warn};

use crate::browser::DashboardBrowser;
use crate::coordinator::{CoordinatorHandle, Event};
use crate::csv_writer::CsvExporter;
use crate::excel_writer::ExcelExporter;
use crate::logger::Logger;
use crate::models::{ExtractionResult, ExtractionStatus, LogSeverity};
use crate::store::ExtractionStore;

struct CliArgs {
    command: String,
    headed: bool,
    out: Option<PathBuf>,
    csv: bool,
    xlsx: bool,
    data_dir: PathBuf,
}

impl CliArgs {
    fn parse() -> Result<Self> {
        let mut args = CliArgs {
            command: "run".to_string(),
            headed: false,
            out: None,
            csv: false,
            xlsx: false,
            data_dir: PathBuf::from("data"),
        };

        let mut iter = env::args().skip(1);
        let mut command_seen = false;
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--headed" => args.headed = true,
                "--csv" => args.csv = true,
                "--xlsx" => args.xlsx = true,
                "--out" => {
                    let value = iter.next().context("--out requires a path")?;
                    args.out = Some(PathBuf::from(value));
                }
                "--data-dir" => {
                    let value = iter.next().context("--data-dir requires a path")?;
                    args.data_dir = PathBuf::from(value);
                }
                flag if flag.starts_with("--") => bail!("unknown flag {flag}"),
                command if !command_seen => {
                    args.command = command.to_string();
                    command_seen = true;
                }
                extra => bail!("unexpected argument {extra}"),
            }
        }
        Ok(args)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = CliArgs::parse()?;
    match args.command.as_str() {
        "run" => run(args).await,
        "result" => show_result(&args),
        "clear" => clear(&args),
        "clear-logs" => clear_logs(&args),
        other => bail!("unknown command {other} (expected run, result, clear, or clear-logs)"),
    }
}

async fn run(args: CliArgs) -> Result<()> {
    info!("Starting MicroLeap portfolio scraper");
    if args.headed {
        info!("Running in headed mode (browser visible)");
    }

    let store = ExtractionStore::new(&args.data_dir)?;
    if store.load_state()?.is_some() {
        info!("Found a persisted extraction in progress, it will be resumed");
    }

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    tokio::spawn(render_events(events_rx));

    let logger = Logger::new(store.clone(), events_tx.clone());
    let session = DashboardBrowser::launch(!args.headed).await?;
    let handle = coordinator::spawn(session, store.clone(), logger, events_tx);

    if !handle.check_connection().await? {
        warn!("Dashboard appears unreachable, trying anyway");
    }

    if !handle.open_dashboard().await? {
        info!("Please log in to the dashboard in the opened browser window");
        wait_for_login(&handle).await?;
    }
    info!("Logged in, starting extraction");

    spawn_cancel_on_ctrl_c(handle.clone());

    let result = handle.start_extraction().await?;
    write_exports(&args, &result)?;
    handle.shutdown().await?;

    match result.status {
        ExtractionStatus::Completed => info!(
            "Extraction complete: {} investments, {} with payment schedules",
            result.total_investments, result.investments_with_schedules
        ),
        ExtractionStatus::Cancelled => warn!(
            "Extraction cancelled with {} investments collected",
            result.total_investments
        ),
        ExtractionStatus::InProgress => warn!("Extraction ended while still in progress"),
    }
    Ok(())
}

async fn wait_for_login(handle: &CoordinatorHandle) -> Result<()> {
    loop {
        tokio::time::sleep(Duration::from_secs(2)).await;
        if handle.check_login().await? {
            return Ok(());
        }
    }
}

fn spawn_cancel_on_ctrl_c(handle: CoordinatorHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, cancelling extraction");
            if let Err(e) = handle.cancel_extraction().await {
                error!("could not cancel extraction: {e:#}");
            }
        }
    });
}

fn write_exports(args: &CliArgs, result: &ExtractionResult) -> Result<()> {
    let json_path = args.out.clone().unwrap_or_else(|| {
        PathBuf::from(format!(
            "microleap-investments-{}.json",
            Local::now().format("%Y-%m-%d")
        ))
    });
    fs::write(&json_path, serde_json::to_string_pretty(result)?)
        .with_context(|| format!("failed to write {}", json_path.display()))?;
    info!("Portfolio written to {}", json_path.display());

    if args.csv {
        let path = json_path.with_extension("csv");
        let mut exporter = CsvExporter::new(&path)?;
        exporter.write_header()?;
        for investment in &result.investments {
            exporter.write_investment(investment)?;
        }
        exporter.finalize()?;
        info!("CSV written to {}", path.display());
    }

    if args.xlsx {
        let path = json_path.with_extension("xlsx");
        let mut exporter = ExcelExporter::new();
        exporter.write_portfolio(&result.investments)?;
        exporter.save(path.to_str().context("export path is not valid UTF-8")?)?;
        info!("Workbook written to {}", path.display());
    }

    Ok(())
}

fn show_result(args: &CliArgs) -> Result<()> {
    let store = ExtractionStore::new(&args.data_dir)?;
    match store.load_result()? {
        Some(result) => println!("{}", serde_json::to_string_pretty(&result)?),
        None => println!("No extraction result stored"),
    }
    Ok(())
}

fn clear(args: &CliArgs) -> Result<()> {
    let store = ExtractionStore::new(&args.data_dir)?;
    store.clear_result()?;
    store.clear_state()?;
    info!("Stored extraction data cleared");
    Ok(())
}

fn clear_logs(args: &CliArgs) -> Result<()> {
    let store = ExtractionStore::new(&args.data_dir)?;
    store.clear_logs()?;
    info!("Log history cleared");
    Ok(())
}

async fn render_events(mut events: UnboundedReceiver<Event>) {
    while let Some(event) = events.recv().await {
        match event {
            Event::Log { message, severity } => match severity {
                LogSeverity::Error => error!("{message}"),
                LogSeverity::Warning => warn!("{message}"),
                _ => info!("{message}"),
            },
            Event::Progress { percent, message } => info!("[{percent:>3}%] {message}"),
            Event::Complete(result) => info!(
                "Extraction completed with {} investments ({} with schedules)",
                result.total_investments, result.investments_with_schedules
            ),
            Event::Error(message) => error!("Extraction error: {message}"),
        }
    }
}
