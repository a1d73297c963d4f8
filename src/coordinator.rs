use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{error, info, warn};

use crate::logger::Logger;
use crate::models::{ExtractionResult, LogSeverity};
use crate::scraper::DashboardScraper;
use crate::store::ExtractionStore;
use crate::walk::{DashboardSession, ExtractionWalk};

/// Control operations resolve within this window or fail.
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);
/// A full extraction is allowed to run this long before the caller gives up.
pub const EXTRACTION_TIMEOUT: Duration = Duration::from_secs(300);

/// Fire-and-forget events forwarded to the UI surface.
#[derive(Debug, Clone)]
pub enum Event {
    Log {
        message: String,
        severity: LogSeverity,
    },
    Progress {
        percent: u8,
        message: String,
    },
    Complete(ExtractionResult),
    Error(String),
}

pub type EventSender = mpsc::UnboundedSender<Event>;

type Responder<T> = oneshot::Sender<Result<T>>;

enum Command {
    OpenDashboard(Responder<bool>),
    CheckConnection(Responder<bool>),
    CheckLogin(Responder<bool>),
    StartExtraction(Responder<ExtractionResult>),
    GetProgress(Responder<u8>),
    GetResult(Responder<Option<ExtractionResult>>),
    ClearResult(Responder<()>),
    CancelExtraction(Responder<()>),
    Shutdown(Responder<()>),
}

/// Request/response front for the coordinator task. Every call resolves to a
/// failure after its timeout instead of hanging.
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<Command>,
}

impl CoordinatorHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(Responder<T>) -> Command,
        deadline: Duration,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .context("coordinator is not running")?;
        match time::timeout(deadline, rx).await {
            Err(_) => bail!("operation timed out after {}s", deadline.as_secs()),
            Ok(Err(_)) => bail!("coordinator dropped the request"),
            Ok(Ok(response)) => response,
        }
    }

    /// Open or focus the dashboard; payload is whether the user appears
    /// logged in.
    pub async fn open_dashboard(&self) -> Result<bool> {
        self.request(Command::OpenDashboard, CONTROL_TIMEOUT).await
    }

    pub async fn check_connection(&self) -> Result<bool> {
        self.request(Command::CheckConnection, CONTROL_TIMEOUT).await
    }

    pub async fn check_login(&self) -> Result<bool> {
        self.request(Command::CheckLogin, CONTROL_TIMEOUT).await
    }

    /// Run the full extraction walk. Resolves when the walk completes, is
    /// cancelled, or fails.
    pub async fn start_extraction(&self) -> Result<ExtractionResult> {
        self.request(Command::StartExtraction, EXTRACTION_TIMEOUT)
            .await
    }

    pub async fn get_progress(&self) -> Result<u8> {
        self.request(Command::GetProgress, CONTROL_TIMEOUT).await
    }

    pub async fn get_result(&self) -> Result<Option<ExtractionResult>> {
        self.request(Command::GetResult, CONTROL_TIMEOUT).await
    }

    pub async fn clear_result(&self) -> Result<()> {
        self.request(Command::ClearResult, CONTROL_TIMEOUT).await
    }

    pub async fn cancel_extraction(&self) -> Result<()> {
        self.request(Command::CancelExtraction, CONTROL_TIMEOUT)
            .await
    }

    /// Close the browser session and stop the coordinator.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown, CONTROL_TIMEOUT).await
    }
}

/// Message relay between the control surface and the walk. Holds exactly one
/// piece of its own state: the in-progress guard that refuses a second
/// concurrent walk.
struct Coordinator<S> {
    session: Arc<Mutex<S>>,
    store: ExtractionStore,
    logger: Logger,
    events: EventSender,
    commands: mpsc::Receiver<Command>,
    cancel: watch::Sender<bool>,
    progress: Arc<AtomicU8>,
    walk_task: Option<JoinHandle<()>>,
}

/// Spawn the coordinator task over a dashboard session.
pub fn spawn<S: DashboardSession + 'static>(
    session: S,
    store: ExtractionStore,
    logger: Logger,
    events: EventSender,
) -> CoordinatorHandle {
    let (tx, rx) = mpsc::channel(32);
    let coordinator = Coordinator {
        session: Arc::new(Mutex::new(session)),
        store,
        logger,
        events,
        commands: rx,
        cancel: watch::channel(false).0,
        progress: Arc::new(AtomicU8::new(0)),
        walk_task: None,
    };
    tokio::spawn(coordinator.run());
    CoordinatorHandle { commands: tx }
}

impl<S: DashboardSession + 'static> Coordinator<S> {
    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            self.handle(command).await;
        }
        info!("coordinator channel closed, shutting down");
    }

    fn extraction_in_progress(&self) -> bool {
        self.walk_task
            .as_ref()
            .map_or(false, |task| !task.is_finished())
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::OpenDashboard(respond) => {
                let outcome = self.session.lock().await.open_dashboard().await;
                if let Ok(logged_in) = &outcome {
                    self.logger.info(if *logged_in {
                        "Dashboard opened successfully"
                    } else {
                        "Please log in manually"
                    });
                }
                let _ = respond.send(outcome);
            }
            Command::CheckConnection(respond) => {
                let outcome = self.session.lock().await.check_connection().await;
                let _ = respond.send(outcome);
            }
            Command::CheckLogin(respond) => {
                let outcome = self.session.lock().await.is_logged_in().await;
                let _ = respond.send(outcome);
            }
            Command::StartExtraction(respond) => self.start_extraction(respond),
            Command::GetProgress(respond) => {
                let _ = respond.send(Ok(self.progress.load(Ordering::Relaxed)));
            }
            Command::GetResult(respond) => {
                let _ = respond.send(self.store.load_result());
            }
            Command::ClearResult(respond) => {
                let outcome = self
                    .store
                    .clear_result()
                    .and_then(|()| self.store.clear_state());
                if outcome.is_ok() {
                    self.logger.info("Stored extraction data cleared");
                }
                let _ = respond.send(outcome);
            }
            Command::CancelExtraction(respond) => {
                let _ = self.cancel.send(true);
                // A step already in flight completes before cancellation
                // takes effect.
                if let Some(task) = self.walk_task.take() {
                    let _ = task.await;
                }
                if let Err(e) = self.store.cancel() {
                    let _ = respond.send(Err(e));
                    return;
                }
                self.logger.warning("Cancellation requested");
                let _ = respond.send(Ok(()));
            }
            Command::Shutdown(respond) => {
                let outcome = self.session.lock().await.close().await;
                let _ = respond.send(outcome);
                self.commands.close();
            }
        }
    }

    fn start_extraction(&mut self, respond: Responder<ExtractionResult>) {
        if self.extraction_in_progress() {
            warn!("rejecting start request, extraction already in progress");
            let _ = respond.send(Err(anyhow::anyhow!("extraction already in progress")));
            return;
        }

        let scraper = match DashboardScraper::new() {
            Ok(scraper) => scraper,
            Err(e) => {
                let _ = respond.send(Err(e));
                return;
            }
        };

        // Fresh cancel flag per walk.
        self.cancel = watch::channel(false).0;
        self.progress.store(0, Ordering::Relaxed);

        let walk = ExtractionWalk::new(
            self.session.clone(),
            Box::new(scraper),
            self.store.clone(),
            self.logger.clone(),
            self.events.clone(),
            self.cancel.subscribe(),
            self.progress.clone(),
        );
        let events = self.events.clone();

        self.walk_task = Some(tokio::spawn(async move {
            let outcome = walk.run().await;
            match &outcome {
                Ok(result) => info!("walk finished with status {:?}", result.status),
                Err(e) => {
                    error!("extraction failed: {e:#}");
                    let _ = events.send(Event::Error(format!("{e:#}")));
                }
            }
            let _ = respond.send(outcome);
        }));
    }
}
