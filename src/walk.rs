use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::coordinator::{Event, EventSender};
use crate::logger::Logger;
use crate::models::{ExtractionRecord, ExtractionResult, ExtractionState, ExtractionStatus};
use crate::scraper::PageScraper;
use crate::store::ExtractionStore;

/// Navigation seam between the walk and the browser. Each call performs a
/// real page navigation and returns the loaded page's HTML.
#[async_trait]
pub trait DashboardSession: Send {
    /// Open or focus the dashboard. Returns whether the user appears logged in.
    async fn open_dashboard(&mut self) -> Result<bool>;

    /// Whether the current URL looks like a logged-in page.
    async fn is_logged_in(&mut self) -> Result<bool>;

    /// Whether the dashboard origin is reachable at all.
    async fn check_connection(&mut self) -> Result<bool>;

    /// Navigate to the investment list page, widen the page-size control
    /// best-effort, and return the page HTML.
    async fn open_list_page(&mut self) -> Result<String>;

    /// Navigate to one investment's detail page and return the page HTML.
    async fn open_detail_page(&mut self, id: &str) -> Result<String>;

    /// Release the underlying browser. A no-op for sessions without one.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Sequential, resumable traversal over all investments. Every step reloads
/// the continuation state from the store and checkpoints before moving on, so
/// the current step is a function of persisted state alone: a run killed
/// between steps resumes at `current_index` and produces the same final set.
pub struct ExtractionWalk<S> {
    session: Arc<Mutex<S>>,
    scraper: Box<dyn PageScraper>,
    store: ExtractionStore,
    logger: Logger,
    events: EventSender,
    cancelled: watch::Receiver<bool>,
    progress: Arc<AtomicU8>,
}

impl<S: DashboardSession> ExtractionWalk<S> {
    pub fn new(
        session: Arc<Mutex<S>>,
        scraper: Box<dyn PageScraper>,
        store: ExtractionStore,
        logger: Logger,
        events: EventSender,
        cancelled: watch::Receiver<bool>,
        progress: Arc<AtomicU8>,
    ) -> Self {
        Self {
            session,
            scraper,
            store,
            logger,
            events,
            cancelled,
            progress,
        }
    }

    pub async fn run(mut self) -> Result<ExtractionResult> {
        match self.store.load_state()? {
            Some(state) => {
                self.logger.info(format!(
                    "Resuming extraction at {}/{}",
                    state.current_index,
                    state.investment_list.len()
                ));
            }
            None => {
                if self.is_cancelled() {
                    return self.cancel_now();
                }
                self.list().await?;
            }
        }

        loop {
            if self.is_cancelled() {
                return self.cancel_now();
            }
            // Rehydrate from the store every step. A missing record means the
            // walk was cancelled from outside.
            let Some(state) = self.store.load_state()? else {
                return self.cancel_now();
            };
            if state.is_complete() {
                return self.complete(&state);
            }
            self.step(state).await?;
        }
    }

    /// Listing phase: fetch the list page, scrape it, write the first
    /// checkpoint. An empty list is terminal.
    async fn list(&mut self) -> Result<()> {
        self.progress(10, "Extracting investment list...");
        let html = self
            .session
            .lock()
            .await
            .open_list_page()
            .await
            .context("failed to load investment list page")?;

        if self.is_cancelled() {
            return Ok(());
        }

        let investments = self.scraper.scrape_list(&html);
        for inv in &investments {
            self.logger.info(format!(
                "extracting investment list: {}: {}: {}: {}",
                inv.id, inv.note, inv.status, inv.amount
            ));
        }
        if investments.is_empty() {
            bail!("no investments found in the list");
        }

        self.progress(
            15,
            format!(
                "Found {} investments. Extracting details...",
                investments.len()
            ),
        );
        let state = ExtractionState::new(investments);
        self.store.checkpoint(&state)?;
        Ok(())
    }

    /// One walk step: navigate to the current investment's detail page,
    /// scrape it, advance the index, checkpoint.
    async fn step(&mut self, mut state: ExtractionState) -> Result<()> {
        let total = state.investment_list.len();
        let index = state.current_index;
        let summary = state.investment_list[index].clone();

        self.progress(
            walk_percent(index, total),
            format!("Processing investment {}/{}: {}", index + 1, total, summary.id),
        );
        self.logger.info(format!(
            "Starting extraction for investment {} ({}/{})",
            summary.id,
            index + 1,
            total
        ));

        // Navigation failure is fatal; a scrape failure on a loaded page is
        // recoverable per item and handled inside scrape_record.
        let html = self
            .session
            .lock()
            .await
            .open_detail_page(&summary.id)
            .await
            .with_context(|| format!("failed to load detail page for {}", summary.id))?;
        let record = self.scrape_record(&summary, &html);

        state.detailed_investments.push(record);
        state.current_index += 1;

        if self.is_cancelled() {
            // Do not persist past the cancellation point.
            return Ok(());
        }
        self.store.checkpoint(&state)?;

        self.progress(
            walk_percent(state.current_index, total),
            format!("Completed {}/{} investments", state.current_index, total),
        );
        Ok(())
    }

    fn scrape_record(
        &self,
        summary: &crate::models::InvestmentSummary,
        html: &str,
    ) -> ExtractionRecord {
        match self.scraper.scrape_detail(html) {
            Ok(details) => {
                for (label, value) in &details {
                    self.logger
                        .info(format!("extracting details: {label}: {value}"));
                }
                let schedule = self.scraper.scrape_schedule(html);
                if schedule.is_empty() {
                    warn!("no payment schedule table for {}", summary.id);
                }
                for (i, payment) in schedule.iter().enumerate() {
                    self.logger.info(format!(
                        "Payment {}: {} - Status: {} - Total: {}",
                        i + 1,
                        payment.payment_date,
                        payment.repayment_status,
                        payment.total_settled
                    ));
                }
                self.logger.success(format!(
                    "Found {} detail fields and {} payment entries for {}",
                    details.len(),
                    schedule.len(),
                    summary.id
                ));
                ExtractionRecord::new(summary, details, schedule)
            }
            Err(e) => {
                self.logger
                    .error(format!("Error extracting details for {}: {e}", summary.id));
                ExtractionRecord::scrape_failed(summary, e.to_string())
            }
        }
    }

    fn complete(&self, state: &ExtractionState) -> Result<ExtractionResult> {
        let result = self.store.finish(state)?;
        self.progress(100, "Extraction completed successfully!");
        info!(
            "extraction complete: {} investments, {} with schedules",
            result.total_investments, result.investments_with_schedules
        );
        let _ = self.events.send(Event::Complete(result.clone()));
        Ok(result)
    }

    fn cancel_now(&self) -> Result<ExtractionResult> {
        info!("extraction cancelled, clearing continuation state");
        let stamped = self.store.cancel()?;
        self.logger.warning("Extraction cancelled");
        Ok(stamped.unwrap_or_else(|| {
            let mut result = ExtractionResult::from_state(
                &ExtractionState::new(Vec::new()),
                ExtractionStatus::Cancelled,
            );
            result.mark_cancelled();
            result
        }))
    }

    fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    fn progress(&self, percent: u8, message: impl Into<String>) {
        self.progress.store(percent, Ordering::Relaxed);
        let _ = self.events.send(Event::Progress {
            percent,
            message: message.into(),
        });
    }
}

/// Listing occupies the first 20%, the walk itself 20-90.
fn walk_percent(index: usize, total: usize) -> u8 {
    if total == 0 {
        return 20;
    }
    (20.0 + (index as f64 / total as f64) * 70.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InvestmentSummary;
    use crate::scraper::DashboardScraper;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const LIST_PAGE: &str = r#"
        <table><tbody>
          <tr><td>1</td><td>ML-0001</td><td>Working Capital</td><td>Active</td><td>RM 500.00</td></tr>
          <tr><td>2</td><td></td><td>Blank id</td><td>Active</td><td>RM 100.00</td></tr>
          <tr><td>3</td><td>ML-0002</td><td>Invoice Financing</td><td>Completed</td><td>RM 1,000.00</td></tr>
        </tbody></table>"#;

    const DETAIL_WITH_SCHEDULE: &str = r#"
        <table>
          <tr><td>Note Type</td><td>:</td><td>Islamic</td></tr>
          <tr><td>Tenor</td><td>:</td><td>6 months</td></tr>
        </table>
        <table><tbody>
          <tr>
            <td>1</td><td>Month 1 (05/06/2024)</td><td>Paid</td><td>-</td><td>RM 1.00</td>
            <td>RM 50.00</td><td>RM 40.00</td><td>RM 10.00</td><td>RM 50.00</td>
            <td>RM 0.00</td><td>RM 49.00</td>
          </tr>
        </tbody></table>"#;

    const DETAIL_NO_SCHEDULE: &str = r#"
        <table>
          <tr><td>Note Type</td><td>:</td><td>Conventional</td></tr>
        </table>"#;

    struct MockSession {
        list_html: String,
        detail_html: HashMap<String, String>,
        list_opens: usize,
        detail_opens: Vec<String>,
    }

    impl MockSession {
        fn new(list_html: &str, details: &[(&str, &str)]) -> Self {
            Self {
                list_html: list_html.to_string(),
                detail_html: details
                    .iter()
                    .map(|(id, html)| (id.to_string(), html.to_string()))
                    .collect(),
                list_opens: 0,
                detail_opens: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl DashboardSession for MockSession {
        async fn open_dashboard(&mut self) -> Result<bool> {
            Ok(true)
        }

        async fn is_logged_in(&mut self) -> Result<bool> {
            Ok(true)
        }

        async fn check_connection(&mut self) -> Result<bool> {
            Ok(true)
        }

        async fn open_list_page(&mut self) -> Result<String> {
            self.list_opens += 1;
            Ok(self.list_html.clone())
        }

        async fn open_detail_page(&mut self, id: &str) -> Result<String> {
            self.detail_opens.push(id.to_string());
            self.detail_html
                .get(id)
                .cloned()
                .with_context(|| format!("unknown investment {id}"))
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        store: ExtractionStore,
        session: Arc<Mutex<MockSession>>,
        cancel_tx: watch::Sender<bool>,
        events_rx: mpsc::UnboundedReceiver<Event>,
        walk: ExtractionWalk<MockSession>,
    }

    fn harness(session: MockSession) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = ExtractionStore::new(dir.path()).unwrap();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let logger = Logger::with_window(store.clone(), events_tx.clone(), Duration::ZERO);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let session = Arc::new(Mutex::new(session));
        let walk = ExtractionWalk::new(
            session.clone(),
            Box::new(DashboardScraper::new().unwrap()),
            store.clone(),
            logger,
            events_tx,
            cancel_rx,
            Arc::new(AtomicU8::new(0)),
        );
        Harness {
            _dir: dir,
            store,
            session,
            cancel_tx,
            events_rx,
            walk,
        }
    }

    #[tokio::test]
    async fn walks_all_investments_to_completion() {
        let mut h = harness(MockSession::new(
            LIST_PAGE,
            &[
                ("ML-0001", DETAIL_WITH_SCHEDULE),
                ("ML-0002", DETAIL_NO_SCHEDULE),
            ],
        ));

        let result = h.walk.run().await.unwrap();
        assert_eq!(result.status, ExtractionStatus::Completed);
        assert_eq!(result.total_investments, 2);
        assert_eq!(result.investments_with_schedules, 1);
        assert_eq!(result.investments[0].details["note_type"], "Islamic");
        assert_eq!(
            result.investments[0].payment_schedule[0].payment_date,
            "05/06/2024"
        );

        // State is gone, result survives.
        assert!(h.store.load_state().unwrap().is_none());
        let stored = h.store.load_result().unwrap().unwrap();
        assert_eq!(stored.status, ExtractionStatus::Completed);

        let visited = h.session.lock().await.detail_opens.clone();
        assert_eq!(visited, vec!["ML-0001", "ML-0002"]);

        // Completion event carries the result.
        let mut saw_complete = false;
        while let Ok(event) = h.events_rx.try_recv() {
            if let Event::Complete(r) = event {
                assert_eq!(r.total_investments, 2);
                saw_complete = true;
            }
        }
        assert!(saw_complete);
    }

    #[tokio::test]
    async fn empty_list_is_fatal() {
        let mut h = harness(MockSession::new("<table><tbody></tbody></table>", &[]));
        let err = h.walk.run().await.unwrap_err();
        assert!(err.to_string().contains("no investments found"));
    }

    #[tokio::test]
    async fn detail_scrape_failure_records_error_and_continues() {
        let mut h = harness(MockSession::new(
            LIST_PAGE,
            &[
                ("ML-0001", "<html><body><p>no tables here</p></body></html>"),
                ("ML-0002", DETAIL_NO_SCHEDULE),
            ],
        ));

        let result = h.walk.run().await.unwrap();
        assert_eq!(result.status, ExtractionStatus::Completed);
        assert_eq!(result.total_investments, 2);
        assert!(result.investments[0].error.is_some());
        assert!(result.investments[0].payment_schedule.is_empty());
        assert!(result.investments[1].error.is_none());
    }

    #[tokio::test]
    async fn resumes_from_persisted_state() {
        // First run to completion, capturing the expected outcome.
        let mut h = harness(MockSession::new(
            LIST_PAGE,
            &[
                ("ML-0001", DETAIL_WITH_SCHEDULE),
                ("ML-0002", DETAIL_NO_SCHEDULE),
            ],
        ));
        let uninterrupted = h.walk.run().await.unwrap();

        // Second harness simulating a restart after the first investment:
        // persisted state already has ML-0001 done.
        let mut h2 = harness(MockSession::new(
            LIST_PAGE,
            &[
                ("ML-0001", DETAIL_WITH_SCHEDULE),
                ("ML-0002", DETAIL_NO_SCHEDULE),
            ],
        ));
        let mut state = ExtractionState::new(uninterrupted.investments.iter().map(|r| {
            InvestmentSummary {
                id: r.id.clone(),
                note: r.note.clone(),
                status: r.status.clone(),
                amount: r.amount.clone(),
            }
        }).collect());
        state.detailed_investments.push(uninterrupted.investments[0].clone());
        state.current_index = 1;
        h2.store.checkpoint(&state).unwrap();

        let resumed = h2.walk.run().await.unwrap();
        assert_eq!(resumed.status, ExtractionStatus::Completed);
        assert_eq!(resumed.investments, uninterrupted.investments);

        // The resumed run never re-listed or revisited the finished item.
        let session = h2.session.lock().await;
        assert_eq!(session.list_opens, 0);
        assert_eq!(session.detail_opens, vec!["ML-0002"]);
    }

    #[tokio::test]
    async fn cancellation_keeps_accumulated_investments() {
        let mut h = harness(MockSession::new(
            LIST_PAGE,
            &[
                ("ML-0001", DETAIL_WITH_SCHEDULE),
                ("ML-0002", DETAIL_NO_SCHEDULE),
            ],
        ));

        // Simulate a walk stopped after one investment, then cancelled.
        let investments = vec![
            InvestmentSummary {
                id: "ML-0001".to_string(),
                note: "Working Capital".to_string(),
                status: "Active".to_string(),
                amount: "RM 500.00".to_string(),
            },
            InvestmentSummary {
                id: "ML-0002".to_string(),
                note: "Invoice Financing".to_string(),
                status: "Completed".to_string(),
                amount: "RM 1,000.00".to_string(),
            },
        ];
        let first = investments[0].clone();
        let mut state = ExtractionState::new(investments);
        state
            .detailed_investments
            .push(ExtractionRecord::new(&first, Default::default(), Vec::new()));
        state.current_index = 1;
        h.store.checkpoint(&state).unwrap();

        h.cancel_tx.send(true).unwrap();
        let result = h.walk.run().await.unwrap();
        assert_eq!(result.status, ExtractionStatus::Cancelled);
        assert!(result.cancelled_at.is_some());
        assert_eq!(result.investments.len(), 1);
        assert!(h.store.load_state().unwrap().is_none());

        // No further navigation happened.
        assert!(h.session.lock().await.detail_opens.is_empty());
    }

    #[tokio::test]
    async fn cancel_before_listing_never_navigates() {
        let mut h = harness(MockSession::new(LIST_PAGE, &[]));
        h.cancel_tx.send(true).unwrap();
        let result = h.walk.run().await.unwrap();
        assert_eq!(result.status, ExtractionStatus::Cancelled);
        assert!(h.session.lock().await.list_opens == 0);
    }
}
