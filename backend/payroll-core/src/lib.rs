// src/lib.rs

pub mod audit;
pub mod cache;
pub mod export;
pub mod history;
pub mod models;
pub mod notification;
pub mod payroll_client;
pub mod rates;
pub mod salary_config;
pub mod workflow;

#[cfg(test)]
mod test_support;

pub use models::{MonthStatus, MonthYear, PayMonth, Payment, SalaryConfiguration};
pub use payroll_client::{PayrollApi, PayrollClient, PayrollConfig, PayrollError};
pub use workflow::{Confirmer, PayMonthWorkflow, WorkflowError, WorkflowSettings, WorkflowStep};
