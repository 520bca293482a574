// src/models.rs

use chrono::{DateTime, Months, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

static MONTH_YEAR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]{4}-[0-9]{2}$").expect("month-year pattern is a valid regex"));

// --- Month key ---

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MonthYearError {
    #[error("'{0}' is not a month in YYYY-MM format")]
    Format(String),
    #[error("'{input}' has month {month}, expected 01-12")]
    MonthOutOfRange { input: String, month: u32 },
}

/// Canonical `YYYY-MM` key of a pay month.
///
/// Both calendar bounds are resolved at parse time, so a `MonthYear` that exists is always a
/// real calendar month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MonthYear {
    start: NaiveDate,
    end: NaiveDate,
}

impl MonthYear {
    /// Strict `YYYY-MM` with ASCII digits only; surrounding whitespace is rejected.
    pub fn parse(input: &str) -> Result<Self, MonthYearError> {
        if !MONTH_YEAR_PATTERN.is_match(input) {
            return Err(MonthYearError::Format(input.to_string()));
        }

        let year: i32 = input[..4]
            .parse()
            .map_err(|_| MonthYearError::Format(input.to_string()))?;
        let month: u32 = input[5..]
            .parse()
            .map_err(|_| MonthYearError::Format(input.to_string()))?;

        let out_of_range = || MonthYearError::MonthOutOfRange {
            input: input.to_string(),
            month,
        };
        let start = NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(out_of_range)?;
        let end = start
            .checked_add_months(Months::new(1))
            .and_then(|next| next.pred_opt())
            .ok_or_else(out_of_range)?;

        Ok(Self { start, end })
    }

    pub fn start_date(&self) -> NaiveDate {
        self.start
    }

    pub fn end_date(&self) -> NaiveDate {
        self.end
    }

    /// Display label, e.g. "March 2024".
    pub fn month_name(&self) -> String {
        self.start.format("%B %Y").to_string()
    }

    pub fn as_key(&self) -> String {
        self.start.format("%Y-%m").to_string()
    }
}

impl fmt::Display for MonthYear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.start.format("%Y-%m"))
    }
}

impl FromStr for MonthYear {
    type Err = MonthYearError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for MonthYear {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_key())
    }
}

impl<'de> Deserialize<'de> for MonthYear {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        MonthYear::parse(&raw).map_err(serde::de::Error::custom)
    }
}

// --- Pay month ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonthStatus {
    Draft,
    Calculated,
    Approved,
    Paid,
    Closed,
    /// Intermediate server state while a mark-as-paid run is executing.
    Processing,
    Pending,
    #[serde(other)]
    Unknown,
}

impl MonthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonthStatus::Draft => "draft",
            MonthStatus::Calculated => "calculated",
            MonthStatus::Approved => "approved",
            MonthStatus::Paid => "paid",
            MonthStatus::Closed => "closed",
            MonthStatus::Processing => "processing",
            MonthStatus::Pending => "pending",
            MonthStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for MonthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for MonthStatus {
    fn default() -> Self {
        MonthStatus::Draft
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayMonth {
    pub month_year: MonthYear,
    #[serde(default)]
    pub month_name: Option<String>,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub status: MonthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub paid_by: Option<String>,
}

impl PayMonth {
    /// A fresh `draft` month with its derived label and calendar bounds filled in.
    pub fn new_draft(month_year: MonthYear) -> Self {
        Self {
            month_year,
            month_name: Some(month_year.month_name()),
            start_date: Some(month_year.start_date()),
            end_date: Some(month_year.end_date()),
            status: MonthStatus::Draft,
            paid_at: None,
            paid_by: None,
        }
    }

    pub fn display_name(&self) -> String {
        self.month_name
            .clone()
            .unwrap_or_else(|| self.month_year.month_name())
    }
}

// --- Salary configuration ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LineItemKind {
    #[default]
    Fixed,
    Percentage,
}

/// Allowance or deduction entry. `amount` is `None` when the stored value is missing or
/// not numeric; such items contribute nothing to totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "lenient_opt_decimal")]
    pub amount: Option<Decimal>,
    #[serde(rename = "type", default)]
    pub kind: LineItemKind,
}

impl LineItem {
    pub fn fixed(name: &str, amount: Decimal) -> Self {
        Self {
            name: name.to_string(),
            amount: Some(amount),
            kind: LineItemKind::Fixed,
        }
    }

    pub fn percentage(name: &str, percent: Decimal) -> Self {
        Self {
            name: name.to_string(),
            amount: Some(percent),
            kind: LineItemKind::Percentage,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    #[default]
    BankTransfer,
    Check,
    Cash,
    MobileMoney,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContractType {
    #[default]
    Permanent,
    FixedTerm,
    Intern,
    Freelance,
}

fn default_working_days() -> Decimal {
    dec!(22)
}

fn default_daily_hours() -> Decimal {
    dec!(8)
}

fn default_overtime_multiplier() -> Decimal {
    dec!(1.5)
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalaryConfiguration {
    #[serde(deserialize_with = "lenient_string")]
    pub employee_id: String,
    #[serde(deserialize_with = "lenient_decimal")]
    pub base_salary: Decimal,
    // Stored independently of base_salary; the server never recomputes these.
    #[serde(default, deserialize_with = "lenient_opt_decimal")]
    pub daily_rate: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_opt_decimal")]
    pub hourly_rate: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_opt_decimal")]
    pub overtime_rate: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub tax_rate: Decimal,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub social_security_rate: Decimal,
    #[serde(default = "default_working_days")]
    pub working_days: Decimal,
    #[serde(default = "default_daily_hours")]
    pub daily_hours: Decimal,
    #[serde(default = "default_overtime_multiplier")]
    pub overtime_multiplier: Decimal,
    #[serde(default)]
    pub allowances: Vec<LineItem>,
    #[serde(default)]
    pub deductions: Vec<LineItem>,
    #[serde(default)]
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub bank_name: Option<String>,
    #[serde(default)]
    pub bank_account: Option<String>,
    #[serde(default)]
    pub iban: Option<String>,
    #[serde(default)]
    pub contract_type: ContractType,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl SalaryConfiguration {
    /// New active configuration carrying the form defaults (22 days, 8 hours, x1.5 overtime).
    pub fn new(employee_id: &str, base_salary: Decimal) -> Self {
        Self {
            employee_id: employee_id.to_string(),
            base_salary,
            daily_rate: None,
            hourly_rate: None,
            overtime_rate: None,
            tax_rate: Decimal::ZERO,
            social_security_rate: Decimal::ZERO,
            working_days: default_working_days(),
            daily_hours: default_daily_hours(),
            overtime_multiplier: default_overtime_multiplier(),
            allowances: Vec::new(),
            deductions: Vec::new(),
            payment_method: PaymentMethod::default(),
            bank_name: None,
            bank_account: None,
            iban: None,
            contract_type: ContractType::default(),
            is_active: true,
        }
    }
}

// --- Payments ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    #[default]
    Pending,
    Calculated,
    Approved,
    Paid,
    Failed,
    #[serde(other)]
    Unknown,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Calculated => "calculated",
            PaymentStatus::Approved => "approved",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(PaymentStatus::Pending),
            "calculated" => Ok(PaymentStatus::Calculated),
            "approved" => Ok(PaymentStatus::Approved),
            "paid" => Ok(PaymentStatus::Paid),
            "failed" => Ok(PaymentStatus::Failed),
            other => Err(format!("unknown payment status '{}'", other)),
        }
    }
}

/// One employee's payment for one pay month. History responses join a few employee fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub id: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub employee_id: String,
    pub month_year: String,
    #[serde(default)]
    pub employee_name: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub base_salary: Decimal,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub tax_amount: Decimal,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub deduction_amount: Decimal,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub net_salary: Decimal,
    #[serde(default)]
    pub payment_status: PaymentStatus,
    #[serde(default)]
    pub paid_at: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub paid_by: Option<String>,
}

impl Payment {
    pub fn display_name(&self) -> String {
        if let Some(name) = self.employee_name.as_ref().filter(|n| !n.trim().is_empty()) {
            return name.clone();
        }
        let joined = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .filter(|part| !part.trim().is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if joined.is_empty() {
            self.employee_id.clone()
        } else {
            joined
        }
    }

    pub fn is_payable(&self) -> bool {
        self.net_salary > Decimal::ZERO
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Employee {
    #[serde(deserialize_with = "lenient_string")]
    pub id: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub has_salary_config: bool,
}

impl Employee {
    pub fn full_name(&self) -> String {
        let name = format!(
            "{} {}",
            self.first_name.as_deref().unwrap_or_default(),
            self.last_name.as_deref().unwrap_or_default()
        );
        let trimmed = name.trim();
        if trimmed.is_empty() {
            self.id.clone()
        } else {
            trimmed.to_string()
        }
    }
}

// --- Operation payloads ---

/// Response of `POST /payroll/calculate`. The same shape comes back inside the error body
/// when a run only partially succeeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CalculationResult {
    #[serde(default, deserialize_with = "lenient_u32")]
    pub calculated: u32,
    #[serde(default, deserialize_with = "lenient_u32")]
    pub failed: u32,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub total_amount: Decimal,
    #[serde(default)]
    pub errors: Vec<Value>,
}

impl CalculationResult {
    /// Flattens the heterogeneous `errors[]` entries (plain strings or objects) into lines.
    pub fn error_messages(&self) -> Vec<String> {
        self.errors
            .iter()
            .map(|entry| match entry {
                Value::String(s) => s.clone(),
                Value::Object(map) => {
                    let who = map
                        .get("employee_name")
                        .or_else(|| map.get("employee_id"))
                        .map(value_to_plain_string);
                    let what = map
                        .get("error")
                        .or_else(|| map.get("message"))
                        .map(value_to_plain_string)
                        .unwrap_or_else(|| entry.to_string());
                    match who {
                        Some(who) => format!("{}: {}", who, what),
                        None => what,
                    }
                }
                other => other.to_string(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarkPaidMetadata {
    /// Random per-submission key the server may use to drop duplicates.
    pub request_id: String,
    pub requested_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
    pub employee_count: usize,
    pub total_net: Decimal,
    pub send_emails: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarkPaidRequest {
    pub month_year: MonthYear,
    pub metadata: MarkPaidMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MarkPaidResult {
    #[serde(default, deserialize_with = "lenient_u32")]
    pub employees_paid: u32,
    #[serde(default, deserialize_with = "lenient_u32")]
    pub emails_sent: u32,
    #[serde(default, deserialize_with = "lenient_u32")]
    pub emails_failed: u32,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub total_paid: Decimal,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResetMonthRequest {
    pub month_year: MonthYear,
    pub force: bool,
    pub reason: String,
}

// --- Lenient field decoding ---

fn value_to_plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Reads a decimal out of a JSON number or numeric string. Anything else is `None`.
pub fn decimal_from_json(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .ok()
            .or_else(|| n.as_f64().and_then(Decimal::from_f64)),
        Value::String(s) => {
            let trimmed = s.trim();
            Decimal::from_str(trimmed)
                .ok()
                .or_else(|| Decimal::from_scientific(trimmed).ok())
        }
        _ => None,
    }
}

fn lenient_opt_decimal<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw.as_ref().and_then(decimal_from_json))
}

fn lenient_decimal<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_opt_decimal(deserializer)?.unwrap_or_default())
}

fn lenient_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(Value::Number(n)) => n.as_u64().and_then(|v| u32::try_from(v).ok()).unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    })
}

fn lenient_opt_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(match raw {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    lenient_opt_string(deserializer)?
        .ok_or_else(|| serde::de::Error::custom("expected a string or number identifier"))
}
