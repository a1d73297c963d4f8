use std::collections::BTreeMap;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

/// One row of the investment list page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvestmentSummary {
    pub id: String,
    pub note: String,
    pub status: String,
    pub amount: String,
}

/// Normalized label -> trimmed value pairs from a detail page's main table.
pub type InvestmentDetail = BTreeMap<String, String>;

/// One row of a detail page's payment schedule table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentScheduleEntry {
    pub payment_date: String,
    pub repayment_status: String,
    pub action: String,
    pub investor_fee: String,
    pub total_returns: String,
    pub principal_due: String,
    pub profit_due: String,
    pub total_paid: String,
    pub withholding_tax: String,
    pub total_settled: String,
}

/// A list-page summary merged with everything scraped from its detail page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionRecord {
    pub id: String,
    pub note: String,
    pub status: String,
    pub amount: String,
    #[serde(flatten)]
    pub details: InvestmentDetail,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub payment_schedule: Vec<PaymentScheduleEntry>,
}

impl ExtractionRecord {
    pub fn new(
        summary: &InvestmentSummary,
        details: InvestmentDetail,
        payment_schedule: Vec<PaymentScheduleEntry>,
    ) -> Self {
        Self {
            id: summary.id.clone(),
            note: summary.note.clone(),
            status: summary.status.clone(),
            amount: summary.amount.clone(),
            details,
            error: None,
            payment_schedule,
        }
    }

    /// Minimal record kept when a detail page fails to scrape. The walk still
    /// advances past the investment instead of aborting the whole run.
    pub fn scrape_failed(summary: &InvestmentSummary, error: String) -> Self {
        Self {
            id: summary.id.clone(),
            note: summary.note.clone(),
            status: summary.status.clone(),
            amount: summary.amount.clone(),
            details: InvestmentDetail::new(),
            error: Some(error),
            payment_schedule: Vec::new(),
        }
    }
}

/// Continuation state for the extraction walk, persisted after every detail
/// page so the walk can resume at `current_index` after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionState {
    pub investment_list: Vec<InvestmentSummary>,
    pub current_index: usize,
    pub detailed_investments: Vec<ExtractionRecord>,
    pub start_time: DateTime<Utc>,
}

impl ExtractionState {
    pub fn new(investment_list: Vec<InvestmentSummary>) -> Self {
        Self {
            investment_list,
            current_index: 0,
            detailed_investments: Vec::new(),
            start_time: Utc::now(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.current_index >= self.investment_list.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    InProgress,
    Completed,
    Cancelled,
}

/// User-facing extraction result. Unlike the state record this survives after
/// the walk ends, until explicitly cleared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub extraction_date: String,
    pub total_investments: usize,
    pub investments_with_schedules: usize,
    pub investments: Vec<ExtractionRecord>,
    pub status: ExtractionStatus,
    pub progress: usize,
    pub total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<String>,
}

impl ExtractionResult {
    /// Derive a result snapshot from the walk's continuation state. The result
    /// is never written from independent bookkeeping, so it cannot describe
    /// progress the state does not have.
    pub fn from_state(state: &ExtractionState, status: ExtractionStatus) -> Self {
        let with_schedules = state
            .detailed_investments
            .iter()
            .filter(|inv| !inv.payment_schedule.is_empty())
            .count();

        Self {
            extraction_date: state.start_time.to_rfc3339(),
            total_investments: state.detailed_investments.len(),
            investments_with_schedules: with_schedules,
            investments: state.detailed_investments.clone(),
            status,
            progress: state.current_index,
            total: state.investment_list.len(),
            completion_date: match status {
                ExtractionStatus::Completed => Some(Utc::now().to_rfc3339()),
                _ => None,
            },
            cancelled_at: None,
        }
    }

    pub fn mark_cancelled(&mut self) {
        self.status = ExtractionStatus::Cancelled;
        self.cancelled_at = Some(Utc::now().to_rfc3339());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSeverity {
    Info,
    Success,
    Warning,
    Error,
}

/// One entry of the rolling log history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub message: String,
    pub severity: LogSeverity,
    pub date: String,
}

impl LogEntry {
    pub fn new(message: String, severity: LogSeverity) -> Self {
        let now = Local::now();
        Self {
            timestamp: now.format("%H:%M:%S").to_string(),
            message,
            severity,
            date: now.format("%Y-%m-%d").to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(id: &str) -> InvestmentSummary {
        InvestmentSummary {
            id: id.to_string(),
            note: format!("Note {id}"),
            status: "Active".to_string(),
            amount: "RM 500.00".to_string(),
        }
    }

    #[test]
    fn result_counts_match_investments() {
        let mut state = ExtractionState::new(vec![summary("ML-1"), summary("ML-2")]);
        state.detailed_investments.push(ExtractionRecord::new(
            &summary("ML-1"),
            InvestmentDetail::new(),
            vec![PaymentScheduleEntry::default()],
        ));
        state
            .detailed_investments
            .push(ExtractionRecord::scrape_failed(
                &summary("ML-2"),
                "no tables found".to_string(),
            ));
        state.current_index = 2;

        let result = ExtractionResult::from_state(&state, ExtractionStatus::Completed);
        assert_eq!(result.total_investments, result.investments.len());
        assert_eq!(result.total_investments, 2);
        assert_eq!(result.investments_with_schedules, 1);
        assert_eq!(result.progress, 2);
        assert_eq!(result.total, 2);
        assert!(result.completion_date.is_some());
    }

    #[test]
    fn record_serializes_detail_fields_flat() {
        let mut details = InvestmentDetail::new();
        details.insert("note_type".to_string(), "Islamic".to_string());
        let record = ExtractionRecord::new(&summary("ML-9"), details, Vec::new());

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["id"], "ML-9");
        assert_eq!(json["note_type"], "Islamic");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&ExtractionStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }

    #[test]
    fn cancelled_result_keeps_investments() {
        let mut state = ExtractionState::new(vec![summary("ML-1"), summary("ML-2")]);
        state.detailed_investments.push(ExtractionRecord::new(
            &summary("ML-1"),
            InvestmentDetail::new(),
            Vec::new(),
        ));
        state.current_index = 1;

        let mut result = ExtractionResult::from_state(&state, ExtractionStatus::InProgress);
        result.mark_cancelled();
        assert_eq!(result.status, ExtractionStatus::Cancelled);
        assert!(result.cancelled_at.is_some());
        assert_eq!(result.investments.len(), 1);
    }
}
