// src/export.rs
//
// Summary statistics, `;`-separated CSV and a standalone HTML report for payment lists.

use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io;
use thiserror::Error;

use crate::models::Payment;
use crate::rates::round_money;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("CSV error")]
    Csv(#[from] csv::Error),
    #[error("I/O error while exporting")]
    Io(#[from] io::Error),
    #[error("Export produced invalid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

pub const CSV_HEADER: [&str; 9] = [
    "Employee ID",
    "Employee",
    "Month",
    "Base salary",
    "Tax",
    "Deductions",
    "Net salary",
    "Status",
    "Paid at",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Bucket {
    pub count: usize,
    pub total_net: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PaymentStats {
    pub count: usize,
    pub total_base: Decimal,
    pub total_tax: Decimal,
    pub total_deductions: Decimal,
    pub total_net: Decimal,
    pub average_net: Decimal,
    pub by_status: BTreeMap<String, Bucket>,
    pub by_month: BTreeMap<String, Bucket>,
}

pub fn summarize<'a, I>(payments: I) -> PaymentStats
where
    I: IntoIterator<Item = &'a Payment>,
{
    let mut stats = PaymentStats::default();
    for p in payments {
        stats.count += 1;
        stats.total_base += p.base_salary;
        stats.total_tax += p.tax_amount;
        stats.total_deductions += p.deduction_amount;
        stats.total_net += p.net_salary;

        let status = stats
            .by_status
            .entry(p.payment_status.to_string())
            .or_default();
        status.count += 1;
        status.total_net += p.net_salary;

        let month = stats.by_month.entry(p.month_year.clone()).or_default();
        month.count += 1;
        month.total_net += p.net_salary;
    }
    if stats.count > 0 {
        stats.average_net = round_money(stats.total_net / Decimal::from(stats.count));
    }
    stats
}

pub fn write_csv<'a, W, I>(writer: W, payments: I) -> Result<(), ExportError>
where
    W: io::Write,
    I: IntoIterator<Item = &'a Payment>,
{
    let mut wtr = csv::WriterBuilder::new().delimiter(b';').from_writer(writer);
    wtr.write_record(CSV_HEADER)?;
    for p in payments {
        wtr.write_record([
            p.employee_id.clone(),
            p.display_name(),
            p.month_year.clone(),
            round_money(p.base_salary).to_string(),
            round_money(p.tax_amount).to_string(),
            round_money(p.deduction_amount).to_string(),
            round_money(p.net_salary).to_string(),
            p.payment_status.to_string(),
            p.paid_at.clone().unwrap_or_default(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn to_csv<'a, I>(payments: I) -> Result<String, ExportError>
where
    I: IntoIterator<Item = &'a Payment>,
{
    let mut buf = Vec::new();
    write_csv(&mut buf, payments)?;
    Ok(String::from_utf8(buf)?)
}

pub fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

/// Self-contained report page. Every interpolated value is escaped.
pub fn html_report(title: &str, payments: &[Payment]) -> String {
    let stats = summarize(payments);
    let mut html = String::new();

    // Writing into a String cannot fail.
    let _ = write!(
        html,
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{title}</title>\n\
         <style>body{{font-family:sans-serif}}table{{border-collapse:collapse}}\
         td,th{{border:1px solid #ccc;padding:4px 8px}}td.num{{text-align:right}}</style>\n\
         </head>\n<body>\n<h1>{title}</h1>\n",
        title = escape_html(title)
    );
    let _ = write!(
        html,
        "<p>{} payments, total net {}, average net {}</p>\n<table>\n<tr>",
        stats.count,
        round_money(stats.total_net),
        stats.average_net
    );
    for heading in CSV_HEADER {
        let _ = write!(html, "<th>{}</th>", escape_html(heading));
    }
    html.push_str("</tr>\n");

    for p in payments {
        let _ = writeln!(
            html,
            "<tr><td>{}</td><td>{}</td><td>{}</td><td class=\"num\">{}</td><td class=\"num\">{}</td>\
             <td class=\"num\">{}</td><td class=\"num\">{}</td><td>{}</td><td>{}</td></tr>",
            escape_html(&p.employee_id),
            escape_html(&p.display_name()),
            escape_html(&p.month_year),
            round_money(p.base_salary),
            round_money(p.tax_amount),
            round_money(p.deduction_amount),
            round_money(p.net_salary),
            escape_html(p.payment_status.as_str()),
            escape_html(p.paid_at.as_deref().unwrap_or_default()),
        );
    }
    html.push_str("</table>\n</body>\n</html>\n");
    html
}
