use anyhow::Result;
use rust_xlsxwriter::{Color, Format, FormatBorder, Workbook};

use crate::models::ExtractionRecord;

const INVESTMENT_HEADERS: &[(&str, f64)] = &[
    ("ID", 14.0),
    ("Note", 30.0),
    ("Status", 14.0),
    ("Amount", 14.0),
    ("Note Type", 16.0),
    ("Tenor", 12.0),
    ("Credit Risk Rating", 18.0),
    ("Profit Rate", 12.0),
    ("Total Profit", 12.0),
    ("Pledged On", 14.0),
    ("Disbursed On", 14.0),
    ("Payments", 10.0),
    ("Error", 30.0),
];

const SCHEDULE_HEADERS: &[(&str, f64)] = &[
    ("Investment ID", 14.0),
    ("Payment Date", 14.0),
    ("Repayment Status", 16.0),
    ("Action", 10.0),
    ("Investor Fee", 12.0),
    ("Total Returns", 12.0),
    ("Principal Due", 12.0),
    ("Profit Due", 12.0),
    ("Total Paid", 12.0),
    ("Withholding Tax", 14.0),
    ("Total Settled", 12.0),
];

pub struct ExcelExporter {
    workbook: Workbook,
}

impl ExcelExporter {
    pub fn new() -> Self {
        Self {
            workbook: Workbook::new(),
        }
    }

    fn header_format() -> Format {
        Format::new()
            .set_bold()
            .set_background_color(Color::RGB(0x000080))
            .set_font_color(Color::White)
            .set_border(FormatBorder::Thin)
    }

    pub fn write_portfolio(&mut self, investments: &[ExtractionRecord]) -> Result<()> {
        let header_format = Self::header_format();
        let cell_format = Format::new().set_border(FormatBorder::Thin);

        let worksheet = self.workbook.add_worksheet().set_name("Investments")?;
        for (col, (header, width)) in INVESTMENT_HEADERS.iter().enumerate() {
            worksheet.write_with_format(0, col as u16, *header, &header_format)?;
            worksheet.set_column_width(col as u16, *width)?;
        }
        worksheet.set_freeze_panes(1, 0)?;

        for (row_idx, inv) in investments.iter().enumerate() {
            let row = (row_idx + 1) as u32;
            let detail = |key: &str| inv.details.get(key).map(String::as_str).unwrap_or("");
            let cells = [
                inv.id.as_str(),
                inv.note.as_str(),
                inv.status.as_str(),
                inv.amount.as_str(),
                detail("note_type"),
                detail("tenor"),
                detail("credit_risk_rating"),
                detail("profit_rate"),
                detail("total_profit"),
                detail("pledged_on"),
                detail("disbursed_on"),
            ];
            for (col, value) in cells.iter().enumerate() {
                worksheet.write_with_format(row, col as u16, *value, &cell_format)?;
            }
            worksheet.write_with_format(
                row,
                11,
                inv.payment_schedule.len() as u32,
                &cell_format,
            )?;
            worksheet.write_with_format(
                row,
                12,
                inv.error.as_deref().unwrap_or(""),
                &cell_format,
            )?;
        }

        self.write_schedules(investments)?;
        Ok(())
    }

    fn write_schedules(&mut self, investments: &[ExtractionRecord]) -> Result<()> {
        let header_format = Self::header_format();
        let cell_format = Format::new().set_border(FormatBorder::Thin);

        let worksheet = self.workbook.add_worksheet().set_name("Payment Schedule")?;
        for (col, (header, width)) in SCHEDULE_HEADERS.iter().enumerate() {
            worksheet.write_with_format(0, col as u16, *header, &header_format)?;
            worksheet.set_column_width(col as u16, *width)?;
        }
        worksheet.set_freeze_panes(1, 0)?;

        let mut row: u32 = 1;
        for inv in investments {
            for payment in &inv.payment_schedule {
                let cells = [
                    inv.id.as_str(),
                    payment.payment_date.as_str(),
                    payment.repayment_status.as_str(),
                    payment.action.as_str(),
                    payment.investor_fee.as_str(),
                    payment.total_returns.as_str(),
                    payment.principal_due.as_str(),
                    payment.profit_due.as_str(),
                    payment.total_paid.as_str(),
                    payment.withholding_tax.as_str(),
                    payment.total_settled.as_str(),
                ];
                for (col, value) in cells.iter().enumerate() {
                    worksheet.write_with_format(row, col as u16, *value, &cell_format)?;
                }
                row += 1;
            }
        }
        Ok(())
    }

    pub fn save(mut self, filename: &str) -> Result<()> {
        self.workbook.save(filename)?;
        Ok(())
    }
}

impl Default for ExcelExporter {
    fn default() -> Self {
        Self::new()
    }
}
