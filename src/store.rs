use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::models::{ExtractionResult, ExtractionState, ExtractionStatus, LogEntry};

const STATE_FILE: &str = "extraction_state.json";
const RESULT_FILE: &str = "extraction_result.json";
const LOG_FILE: &str = "log_history.json";

/// Most recent entries kept in the persisted log history.
pub const LOG_HISTORY_CAP: usize = 100;

/// File-backed key-value store for the three persisted records: walk
/// continuation state, user-facing extraction result, and the rolling log
/// history. Each record is independently readable, writable, and clearable.
///
/// Writes go through a temp file and rename so a crash never leaves a
/// half-written record behind.
#[derive(Clone)]
pub struct ExtractionStore {
    dir: PathBuf,
}

impl ExtractionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create data directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn read_record<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let path = self.dir.join(name);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        let record = serde_json::from_str(&raw)
            .with_context(|| format!("corrupt record {}", path.display()))?;
        Ok(Some(record))
    }

    fn write_record<T: Serialize + ?Sized>(&self, name: &str, record: &T) -> Result<()> {
        let path = self.dir.join(name);
        let tmp = self.dir.join(format!("{name}.tmp"));
        let raw = serde_json::to_string_pretty(record)?;
        fs::write(&tmp, raw).with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }

    fn clear_record(&self, name: &str) -> Result<()> {
        let path = self.dir.join(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
        }
    }

    pub fn load_state(&self) -> Result<Option<ExtractionState>> {
        self.read_record(STATE_FILE)
    }

    pub fn clear_state(&self) -> Result<()> {
        self.clear_record(STATE_FILE)
    }

    pub fn load_result(&self) -> Result<Option<ExtractionResult>> {
        self.read_record(RESULT_FILE)
    }

    pub fn save_result(&self, result: &ExtractionResult) -> Result<()> {
        self.write_record(RESULT_FILE, result)
    }

    pub fn clear_result(&self) -> Result<()> {
        self.clear_record(RESULT_FILE)
    }

    /// Persist the walk's continuation state and the result snapshot derived
    /// from it. The result is always computed from the state being written,
    /// so the two records cannot drift apart by more than one snapshot.
    pub fn checkpoint(&self, state: &ExtractionState) -> Result<()> {
        self.write_record(STATE_FILE, state)?;
        let result = ExtractionResult::from_state(state, ExtractionStatus::InProgress);
        self.write_record(RESULT_FILE, &result)
    }

    /// Finish the walk: write the completed result and delete the
    /// continuation state. The result record survives until cleared.
    pub fn finish(&self, state: &ExtractionState) -> Result<ExtractionResult> {
        let result = ExtractionResult::from_state(state, ExtractionStatus::Completed);
        self.write_record(RESULT_FILE, &result)?;
        self.clear_record(STATE_FILE)?;
        Ok(result)
    }

    /// Cancel the walk: delete the continuation state and, when a result
    /// record already exists, stamp it cancelled. Accumulated investments
    /// stay in the result.
    pub fn cancel(&self) -> Result<Option<ExtractionResult>> {
        self.clear_record(STATE_FILE)?;
        let Some(mut result) = self.load_result()? else {
            return Ok(None);
        };
        result.mark_cancelled();
        self.save_result(&result)?;
        Ok(Some(result))
    }

    pub fn load_logs(&self) -> Result<Vec<LogEntry>> {
        Ok(self.read_record(LOG_FILE)?.unwrap_or_default())
    }

    /// Persist the log history, keeping only the most recent
    /// [`LOG_HISTORY_CAP`] entries.
    pub fn save_logs(&self, entries: &[LogEntry]) -> Result<()> {
        let start = entries.len().saturating_sub(LOG_HISTORY_CAP);
        self.write_record(LOG_FILE, &entries[start..])
    }

    pub fn clear_logs(&self) -> Result<()> {
        self.clear_record(LOG_FILE)
    }
}
