use std::sync::OnceLock;

use anyhow::{anyhow, bail, Result};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use crate::models::{InvestmentDetail, InvestmentSummary, PaymentScheduleEntry};

/// Site-markup adapter: everything that knows about the dashboard's table
/// layout lives behind this trait, so markup changes touch one implementation.
pub trait PageScraper: Send + Sync {
    /// Extract investment summaries from the list page. Rows that don't match
    /// the expected shape are silently ignored.
    fn scrape_list(&self, html: &str) -> Vec<InvestmentSummary>;

    /// Extract label/value fields from a detail page's main table. Fails when
    /// the page has no tables at all.
    fn scrape_detail(&self, html: &str) -> Result<InvestmentDetail>;

    /// Extract the payment schedule from a detail page's second table. A
    /// missing schedule table is a valid terminal state, not an error.
    fn scrape_schedule(&self, html: &str) -> Vec<PaymentScheduleEntry>;
}

/// `PageScraper` implementation tied to the current MicroLeap dashboard
/// markup: list rows are `<tr>` with id/note/status/amount at cells 1..=4,
/// detail rows carry the label at cell 0 and the value at cell 2, payment
/// rows have eleven fixed columns.
pub struct DashboardScraper {
    table: Selector,
    list_row: Selector,
    row: Selector,
    body_row: Selector,
    cell: Selector,
}

fn sel(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow!("invalid selector {css:?}: {e}"))
}

impl DashboardScraper {
    pub fn new() -> Result<Self> {
        Ok(Self {
            table: sel("table")?,
            list_row: sel("table tbody tr")?,
            row: sel("tr")?,
            body_row: sel("tbody tr")?,
            cell: sel("td")?,
        })
    }

    fn cells<'a>(&self, row: &ElementRef<'a>) -> Vec<ElementRef<'a>> {
        row.select(&self.cell).collect()
    }
}

impl PageScraper for DashboardScraper {
    fn scrape_list(&self, html: &str) -> Vec<InvestmentSummary> {
        let doc = Html::parse_document(html);
        let mut investments = Vec::new();

        for row in doc.select(&self.list_row) {
            let cells = self.cells(&row);
            if cells.len() < 4 {
                continue;
            }
            let id = cell_text(&cells, 1);
            if id.is_empty() {
                continue;
            }
            investments.push(InvestmentSummary {
                id,
                note: cell_text(&cells, 2),
                status: cell_text(&cells, 3),
                amount: cell_text(&cells, 4),
            });
        }

        investments
    }

    fn scrape_detail(&self, html: &str) -> Result<InvestmentDetail> {
        let doc = Html::parse_document(html);
        let Some(details_table) = doc.select(&self.table).next() else {
            bail!("no tables found on investment details page");
        };

        let mut details = InvestmentDetail::new();
        for row in details_table.select(&self.row) {
            let cells = self.cells(&row);
            if cells.len() < 3 {
                continue;
            }
            let label = cell_text(&cells, 0);
            let value = cell_text(&cells, 2);
            if label.is_empty() || value.is_empty() {
                continue;
            }
            details.insert(normalize_label(&label), value);
        }

        Ok(details)
    }

    fn scrape_schedule(&self, html: &str) -> Vec<PaymentScheduleEntry> {
        let doc = Html::parse_document(html);
        let Some(schedule_table) = doc.select(&self.table).nth(1) else {
            return Vec::new();
        };

        let mut schedule = Vec::new();
        for row in schedule_table.select(&self.body_row) {
            let cells = self.cells(&row);
            if cells.len() < 11 {
                continue;
            }
            schedule.push(PaymentScheduleEntry {
                payment_date: extract_date(&cell_text(&cells, 1)),
                repayment_status: cell_text(&cells, 2),
                action: cell_text(&cells, 3),
                investor_fee: cell_text(&cells, 4),
                total_returns: cell_text(&cells, 5),
                principal_due: cell_text(&cells, 6),
                profit_due: cell_text(&cells, 7),
                total_paid: cell_text(&cells, 8),
                withholding_tax: cell_text(&cells, 9),
                total_settled: cell_text(&cells, 10),
            });
        }

        schedule
    }
}

fn cell_text(cells: &[ElementRef<'_>], index: usize) -> String {
    cells
        .get(index)
        .map(|cell| collapse_ws(&cell.text().collect::<String>()))
        .unwrap_or_default()
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalize a table label into a field key: lower-case, strip everything
/// that is not alphanumeric or whitespace, join words with underscores.
/// "Total Gross Return (%)" becomes "total_gross_return".
pub fn normalize_label(label: &str) -> String {
    let cleaned: String = label
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || c.is_whitespace())
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join("_")
}

/// Date cells sometimes embed the real date in parentheses appended to
/// descriptive text ("Month 3 (05/06/2024)"). The parenthesized group, when
/// present, is the canonical value.
pub fn extract_date(text: &str) -> String {
    static PAREN: OnceLock<Regex> = OnceLock::new();
    let paren = PAREN.get_or_init(|| Regex::new(r"\(([^)]+)\)").unwrap());
    match paren.captures(text) {
        Some(caps) => caps[1].trim().to_string(),
        None => text.trim().to_string(),
    }
}
