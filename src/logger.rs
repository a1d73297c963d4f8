use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

use crate::coordinator::Event;
use crate::models::{LogEntry, LogSeverity};
use crate::store::{ExtractionStore, LOG_HISTORY_CAP};

/// Identical messages arriving within this window are suppressed so redundant
/// load events don't flood the history.
pub const DUPLICATE_WINDOW: Duration = Duration::from_millis(2000);

struct LoggerInner {
    entries: Vec<LogEntry>,
    recent: HashMap<String, Instant>,
    window: Duration,
}

/// Rolling log history shared across the walk and the coordinator: capped at
/// the most recent 100 entries, persisted through the store, forwarded to the
/// event stream for the UI surface.
#[derive(Clone)]
pub struct Logger {
    inner: Arc<Mutex<LoggerInner>>,
    store: ExtractionStore,
    events: UnboundedSender<Event>,
}

impl Logger {
    pub fn new(store: ExtractionStore, events: UnboundedSender<Event>) -> Self {
        Self::with_window(store, events, DUPLICATE_WINDOW)
    }

    pub fn with_window(
        store: ExtractionStore,
        events: UnboundedSender<Event>,
        window: Duration,
    ) -> Self {
        let entries = store.load_logs().unwrap_or_else(|e| {
            warn!("could not load log history: {e:#}");
            Vec::new()
        });
        Self {
            inner: Arc::new(Mutex::new(LoggerInner {
                entries,
                recent: HashMap::new(),
                window,
            })),
            store,
            events,
        }
    }

    /// Append a message to the history. Returns false when the message was
    /// suppressed as a duplicate of one seen inside the window.
    pub fn log(&self, severity: LogSeverity, message: impl Into<String>) -> bool {
        let message = message.into();
        let entry = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            let window = inner.window;
            inner.recent.retain(|_, seen| now.duration_since(*seen) <= window);

            let key = format!("{message}\u{1f}{severity:?}");
            if inner.recent.contains_key(&key) {
                return false;
            }
            inner.recent.insert(key, now);

            let entry = LogEntry::new(message, severity);
            inner.entries.push(entry.clone());
            if inner.entries.len() > LOG_HISTORY_CAP {
                let drop = inner.entries.len() - LOG_HISTORY_CAP;
                inner.entries.drain(..drop);
            }
            if let Err(e) = self.store.save_logs(&inner.entries) {
                warn!("could not persist log history: {e:#}");
            }
            entry
        };

        let _ = self.events.send(Event::Log {
            message: entry.message,
            severity: entry.severity,
        });
        true
    }

    pub fn info(&self, message: impl Into<String>) -> bool {
        self.log(LogSeverity::Info, message)
    }

    pub fn success(&self, message: impl Into<String>) -> bool {
        self.log(LogSeverity::Success, message)
    }

    pub fn warning(&self, message: impl Into<String>) -> bool {
        self.log(LogSeverity::Warning, message)
    }

    pub fn error(&self, message: impl Into<String>) -> bool {
        self.log(LogSeverity::Error, message)
    }

    pub fn history(&self) -> Vec<LogEntry> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .clone()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.entries.clear();
        inner.recent.clear();
        if let Err(e) = self.store.clear_logs() {
            warn!("could not clear log history: {e:#}");
        }
    }
}
