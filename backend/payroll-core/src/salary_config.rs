// src/salary_config.rs
//
// Per-employee salary configuration: local validation, rate derivation and persistence.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::models::{Employee, LineItem, LineItemKind, PaymentMethod, SalaryConfiguration};
use crate::payroll_client::PayrollApi;
use crate::rates::{derive_rates, estimate_net_salary, DerivedRates, NetSalaryEstimate, RateError};
use crate::workflow::{classify_api_error, WorkflowError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub errors: Vec<FieldError>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        write!(f, "Invalid salary configuration: {}", joined)
    }
}

impl ValidationError {
    pub fn has_field(&self, field: &str) -> bool {
        self.errors.iter().any(|e| e.field == field)
    }
}

struct Checker {
    errors: Vec<FieldError>,
}

impl Checker {
    fn check(&mut self, ok: bool, field: impl Into<String>, message: impl Into<String>) {
        if !ok {
            self.errors.push(FieldError {
                field: field.into(),
                message: message.into(),
            });
        }
    }

    fn line_items(&mut self, prefix: &str, items: &[LineItem]) {
        for (i, item) in items.iter().enumerate() {
            let field = |name: &str| format!("{}[{}].{}", prefix, i, name);
            self.check(!item.name.trim().is_empty(), field("name"), "name is required");
            match item.amount {
                None => self.check(false, field("amount"), "amount must be a number"),
                Some(amount) => {
                    self.check(amount >= Decimal::ZERO, field("amount"), "amount must not be negative");
                    if item.kind == LineItemKind::Percentage {
                        self.check(
                            amount <= dec!(100),
                            field("amount"),
                            "percentage must not exceed 100",
                        );
                    }
                }
            }
        }
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

impl SalaryConfiguration {
    /// Checks every form rule and reports all violations at once.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut c = Checker { errors: Vec::new() };
        let percent = |v: Decimal| v >= Decimal::ZERO && v <= dec!(100);

        c.check(!self.employee_id.trim().is_empty(), "employee_id", "employee is required");
        c.check(self.base_salary > Decimal::ZERO, "base_salary", "must be greater than zero");
        c.check(percent(self.tax_rate), "tax_rate", "must be between 0 and 100");
        c.check(
            percent(self.social_security_rate),
            "social_security_rate",
            "must be between 0 and 100",
        );
        c.check(
            self.working_days > Decimal::ZERO && self.working_days <= dec!(31),
            "working_days",
            "must be between 1 and 31",
        );
        c.check(
            self.daily_hours > Decimal::ZERO && self.daily_hours <= dec!(24),
            "daily_hours",
            "must be between 1 and 24",
        );
        c.check(
            self.overtime_multiplier >= dec!(1) && self.overtime_multiplier <= dec!(3),
            "overtime_multiplier",
            "must be between 1 and 3",
        );
        c.line_items("allowances", &self.allowances);
        c.line_items("deductions", &self.deductions);
        c.check(
            self.net_salary_estimate().is_ok(),
            "base_salary",
            "amounts are too large to compute a net salary",
        );

        if self.payment_method == PaymentMethod::BankTransfer {
            c.check(!is_blank(&self.bank_name), "bank_name", "required for bank transfers");
            c.check(
                !is_blank(&self.bank_account),
                "bank_account",
                "required for bank transfers",
            );
        }

        if c.errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { errors: c.errors })
        }
    }

    pub fn derived_rates(&self) -> Result<DerivedRates, RateError> {
        derive_rates(
            self.base_salary,
            self.working_days,
            self.daily_hours,
            self.overtime_multiplier,
        )
    }

    /// Copy with the three stored rates recomputed from the current base salary.
    pub fn with_derived_rates(&self) -> Result<Self, RateError> {
        let rates = self.derived_rates()?;
        Ok(Self {
            daily_rate: Some(rates.daily_rate),
            hourly_rate: Some(rates.hourly_rate),
            overtime_rate: Some(rates.overtime_rate),
            ..self.clone()
        })
    }

    pub fn net_salary_estimate(&self) -> Result<NetSalaryEstimate, RateError> {
        estimate_net_salary(
            self.base_salary,
            &self.allowances,
            &self.deductions,
            self.tax_rate,
            self.social_security_rate,
        )
    }

    /// Stored rates differ from what the base salary now implies.
    pub fn rates_out_of_date(&self) -> bool {
        match self.derived_rates() {
            Ok(rates) => {
                self.daily_rate != Some(rates.daily_rate)
                    || self.hourly_rate != Some(rates.hourly_rate)
                    || self.overtime_rate != Some(rates.overtime_rate)
            }
            Err(_) => false,
        }
    }
}

pub struct SalaryConfigService {
    api: Arc<dyn PayrollApi>,
}

impl SalaryConfigService {
    pub fn new(api: Arc<dyn PayrollApi>) -> Self {
        Self { api }
    }

    /// `None` when the employee has no configuration yet.
    pub async fn load(&self, employee_id: &str) -> Result<Option<SalaryConfiguration>, WorkflowError> {
        let config = self
            .api
            .get_salary_config(employee_id)
            .await
            .map_err(classify_api_error)?;
        if let Some(config) = &config {
            if config.rates_out_of_date() {
                debug!(
                    "Stored rates for employee {} do not match base salary {}",
                    employee_id, config.base_salary
                );
            }
        }
        Ok(config)
    }

    /// Validates locally, then saves. With `recompute_rates` the stored daily, hourly and
    /// overtime rates are rederived from the base salary before sending; otherwise whatever
    /// the configuration carries is sent unchanged.
    pub async fn save(
        &self,
        config: &SalaryConfiguration,
        recompute_rates: bool,
    ) -> Result<SalaryConfiguration, WorkflowError> {
        config.validate()?;

        let to_save = if recompute_rates {
            config
                .with_derived_rates()
                .map_err(|e| WorkflowError::Validation(e.to_string()))?
        } else {
            if config.rates_out_of_date() {
                warn!(
                    "Saving configuration for employee {} with stale derived rates",
                    config.employee_id
                );
            }
            config.clone()
        };

        self.api
            .configure_salary(&to_save)
            .await
            .map_err(classify_api_error)?;
        info!(
            "Saved salary configuration for employee {} (base {})",
            to_save.employee_id, to_save.base_salary
        );
        Ok(to_save)
    }

    pub async fn employees(&self) -> Result<Vec<Employee>, WorkflowError> {
        self.api.list_employees().await.map_err(classify_api_error)
    }

    pub async fn unconfigured_employees(&self) -> Result<Vec<Employee>, WorkflowError> {
        let employees = self.employees().await?;
        Ok(employees
            .into_iter()
            .filter(|e| !e.has_salary_config)
            .collect())
    }
}
