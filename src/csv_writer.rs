use std::fs::File;
use std::path::Path;

use anyhow::Result;
use csv::Writer;

use crate::models::ExtractionRecord;

/// Detail fields promoted to their own CSV columns. Everything else stays in
/// the JSON export only.
const DETAIL_COLUMNS: &[&str] = &[
    "investment_note_reference",
    "note_type",
    "tenor",
    "credit_risk_rating",
    "investment_amount",
    "profit_rate",
    "total_profit",
    "investor_fee",
    "withholding_tax",
    "pledged_on",
    "disbursed_on",
];

pub struct CsvExporter {
    writer: Writer<File>,
}

impl CsvExporter {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let writer = Writer::from_path(path)?;
        Ok(Self { writer })
    }

    pub fn write_header(&mut self) -> Result<()> {
        let mut header = vec!["id", "note", "status", "amount"];
        header.extend_from_slice(DETAIL_COLUMNS);
        header.push("payments");
        header.push("error");
        self.writer.write_record(&header)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn write_investment(&mut self, record: &ExtractionRecord) -> Result<()> {
        let mut row = vec![
            record.id.clone(),
            record.note.clone(),
            record.status.clone(),
            record.amount.clone(),
        ];
        for column in DETAIL_COLUMNS {
            row.push(record.details.get(*column).cloned().unwrap_or_default());
        }
        row.push(record.payment_schedule.len().to_string());
        row.push(record.error.clone().unwrap_or_default());
        self.writer.write_record(&row)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn finalize(mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InvestmentDetail, InvestmentSummary};

    #[test]
    fn rows_line_up_with_the_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portfolio.csv");

        let mut details = InvestmentDetail::new();
        details.insert("note_type".to_string(), "Islamic".to_string());
        details.insert("tenor".to_string(), "6 months".to_string());
        let record = ExtractionRecord::new(
            &InvestmentSummary {
                id: "ML-0001".to_string(),
                note: "Working Capital".to_string(),
                status: "Active".to_string(),
                amount: "RM 500.00".to_string(),
            },
            details,
            Vec::new(),
        );

        let mut exporter = CsvExporter::new(&path).unwrap();
        exporter.write_header().unwrap();
        exporter.write_investment(&record).unwrap();
        exporter.finalize().unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let mut lines = raw.lines();
        let header = lines.next().unwrap();
        let row = lines.next().unwrap();
        assert_eq!(header.split(',').count(), row.split(',').count());
        assert!(row.starts_with("ML-0001,Working Capital,Active,RM 500.00"));
        assert!(row.contains("Islamic"));
        assert!(row.contains("6 months"));
    }
}
