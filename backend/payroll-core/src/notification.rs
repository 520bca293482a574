// src/notification.rs
//
// The success callback shared by the calculate and mark-as-paid flows carries one of two
// opposite events. `CallbackPayload` names them explicitly; `is_payment_notification` remains
// for payloads that still arrive as untyped JSON.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::models::{MonthYear, MonthYearError};

/// `type` values that mark a completed payment run.
pub const PAYMENT_COMPLETION_TYPES: &[&str] = &[
    "PAYMENT_COMPLETED",
    "PAYMENT_NOTIFICATION",
    "PAYMENT_SUCCESS",
    "MONTH_MARKED_AS_PAID",
];

/// `action` values meaning "marked as paid". Compared case-insensitively.
pub const MARKED_AS_PAID_ACTIONS: &[&str] = &["marked_as_paid", "mark_as_paid", "markaspaid"];

/// Boolean flags that, when `true`, suppress any recalculation.
pub const SUPPRESSION_FLAGS: &[&str] = &[
    "isPaymentNotification",
    "is_payment_notification",
    "skipCalculation",
    "skip_calculation",
    "preventRecalculation",
    "fromMarkAsPaid",
];

pub const PAYMENT_NOTIFICATION_SENTINEL: &str = "[PAYMENT_NOTIFICATION]";

/// Phrases (lowercase) in a success message meaning the month is already or was just paid.
const PAID_PHRASES: &[&str] = &[
    "already paid",
    "marked as paid",
    "was paid",
    "déjà payé",
    "marqué comme payé",
];

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PaymentNotificationDetails {
    pub employees_paid: u32,
    pub emails_sent: u32,
    pub emails_failed: u32,
    pub total_paid: Decimal,
    pub paid_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallbackPayload {
    /// Run the salary calculation for this month.
    Recalculate { month_year: MonthYear },
    /// A month was just marked as paid. Never triggers a calculation.
    PaymentNotification {
        month_year: Option<MonthYear>,
        details: PaymentNotificationDetails,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LegacyPayloadError {
    #[error("Callback payload carries no month identifier")]
    MissingMonth,
    #[error(transparent)]
    InvalidMonth(#[from] MonthYearError),
}

impl CallbackPayload {
    pub fn month_year(&self) -> Option<&MonthYear> {
        match self {
            CallbackPayload::Recalculate { month_year } => Some(month_year),
            CallbackPayload::PaymentNotification { month_year, .. } => month_year.as_ref(),
        }
    }

    /// Classifies an untyped payload. Payment notifications are recognised before any month
    /// is extracted, so a malformed notification still never reaches the calculate flow.
    pub fn from_legacy(payload: &Value) -> Result<Self, LegacyPayloadError> {
        if is_payment_notification(payload) {
            return Ok(CallbackPayload::PaymentNotification {
                month_year: extract_month_year(payload).ok(),
                details: notification_details(payload),
            });
        }
        Ok(CallbackPayload::Recalculate {
            month_year: extract_month_year(payload)?,
        })
    }
}

pub fn is_payment_notification(payload: &Value) -> bool {
    let Some(map) = payload.as_object() else {
        return false;
    };

    if let Some(kind) = map.get("type").and_then(Value::as_str) {
        if PAYMENT_COMPLETION_TYPES.contains(&kind) {
            return true;
        }
    }

    if let Some(action) = map.get("action").and_then(Value::as_str) {
        let action = action.to_ascii_lowercase();
        if MARKED_AS_PAID_ACTIONS.contains(&action.as_str()) {
            return true;
        }
    }

    if SUPPRESSION_FLAGS
        .iter()
        .any(|flag| map.get(*flag).and_then(Value::as_bool) == Some(true))
    {
        return true;
    }

    let message = map.get("message").and_then(Value::as_str).unwrap_or_default();
    if message.contains(PAYMENT_NOTIFICATION_SENTINEL) {
        return true;
    }

    let succeeded = map.get("success").and_then(Value::as_bool) == Some(true);
    if succeeded {
        let lowered = message.to_lowercase();
        if PAID_PHRASES.iter().any(|phrase| lowered.contains(phrase)) {
            return true;
        }
    }

    false
}

/// Month key from a bare string or from an object's `month_year`, `id` or `value` field.
pub fn extract_month_year(payload: &Value) -> Result<MonthYear, LegacyPayloadError> {
    let raw = match payload {
        Value::String(s) => Some(s.as_str()),
        Value::Object(map) => ["month_year", "id", "value"]
            .iter()
            .find_map(|field| map.get(*field).and_then(Value::as_str)),
        _ => None,
    };
    let raw = raw.ok_or(LegacyPayloadError::MissingMonth)?;
    Ok(MonthYear::parse(raw)?)
}

fn notification_details(payload: &Value) -> PaymentNotificationDetails {
    let count = |field: &str| {
        payload
            .get(field)
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0)
    };
    PaymentNotificationDetails {
        employees_paid: count("employees_paid"),
        emails_sent: count("emails_sent"),
        emails_failed: count("emails_failed"),
        total_paid: payload
            .get("total_paid")
            .and_then(crate::models::decimal_from_json)
            .unwrap_or_default(),
        paid_at: payload
            .get("paid_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc)),
    }
}
