// src/test_support.rs
//
// In-memory payroll backend and scripted operator for tests.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use crate::models::{
    CalculationResult, Employee, MarkPaidRequest, MarkPaidResult, MonthStatus, MonthYear,
    PayMonth, Payment, PaymentStatus, ResetMonthRequest, SalaryConfiguration,
};
use crate::payroll_client::{api_error_from_body, PayrollApi, PayrollError};
use crate::rates::round_money;
use crate::workflow::{ConfirmationRequest, Confirmer, WorkflowSettings};

pub fn month(raw: &str) -> MonthYear {
    MonthYear::parse(raw).unwrap()
}

/// Settings for tests: short timeouts and no cooldown unless a test asks for one.
pub fn fast_settings() -> WorkflowSettings {
    WorkflowSettings {
        status_timeout: Duration::from_millis(200),
        submit_timeout: Duration::from_secs(2),
        submit_cooldown: Duration::ZERO,
        operator: Some("tester@example.com".to_string()),
        send_emails: false,
    }
}

pub fn payment(month_year: &str, employee_id: &str, name: &str, net: Decimal) -> Payment {
    Payment {
        id: Some(format!("{}-{}", month_year, employee_id)),
        employee_id: employee_id.to_string(),
        month_year: month_year.to_string(),
        employee_name: Some(name.to_string()),
        first_name: None,
        last_name: None,
        department: None,
        base_salary: net,
        tax_amount: Decimal::ZERO,
        deduction_amount: Decimal::ZERO,
        net_salary: net,
        payment_status: PaymentStatus::Calculated,
        paid_at: None,
        paid_by: None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    ListPayMonths,
    GetPayMonth,
    CreatePayMonth,
    Calculate,
    ListPayments,
    MarkPaid,
    ResetMonth,
    GetConfig,
    Configure,
    ListEmployees,
    History,
}

#[derive(Debug, Clone)]
pub enum InjectedFailure {
    /// Non-2xx answer with the given raw body.
    Status(u16, String),
    Timeout,
}

impl InjectedFailure {
    fn to_error(&self, op: Op) -> PayrollError {
        match self {
            InjectedFailure::Status(code, body) => {
                api_error_from_body(StatusCode::from_u16(*code).unwrap(), body)
            }
            InjectedFailure::Timeout => PayrollError::Timeout {
                operation: format!("{:?}", op),
            },
        }
    }
}

#[derive(Default)]
struct MockState {
    months: BTreeMap<MonthYear, PayMonth>,
    payments: BTreeMap<MonthYear, Vec<Payment>>,
    employees: Vec<Employee>,
    configs: HashMap<String, SalaryConfiguration>,
    history: Vec<Payment>,
    reset_unsupported: bool,
    calls: HashMap<Op, usize>,
    delays: HashMap<Op, Duration>,
    failures: HashMap<Op, InjectedFailure>,
    one_shot_failures: HashMap<Op, VecDeque<InjectedFailure>>,
    mark_paid_requests: Vec<MarkPaidRequest>,
    reset_requests: Vec<ResetMonthRequest>,
}

#[derive(Clone, Default)]
pub struct MockPayrollApi {
    state: Arc<Mutex<MockState>>,
}

impl MockPayrollApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    // --- Seeding ---

    pub fn with_month(self, raw: &str, status: MonthStatus) -> Self {
        let mut pay_month = PayMonth::new_draft(month(raw));
        pay_month.status = status;
        self.lock().months.insert(pay_month.month_year, pay_month);
        self
    }

    pub fn with_paid_month(self, raw: &str, paid_at: &str, paid_by: &str) -> Self {
        let mut pay_month = PayMonth::new_draft(month(raw));
        pay_month.status = MonthStatus::Paid;
        pay_month.paid_at = Some(paid_at.to_string());
        pay_month.paid_by = Some(paid_by.to_string());
        self.lock().months.insert(pay_month.month_year, pay_month);
        self
    }

    pub fn with_payments(self, raw: &str, payments: Vec<Payment>) -> Self {
        self.lock().payments.insert(month(raw), payments);
        self
    }

    /// Adds an employee with an active configuration.
    pub fn with_configured_employee(self, id: &str, first_name: &str, base_salary: Decimal) -> Self {
        {
            let mut state = self.lock();
            state.employees.push(Employee {
                id: id.to_string(),
                first_name: Some(first_name.to_string()),
                last_name: None,
                email: None,
                department: None,
                position: None,
                has_salary_config: true,
            });
            state
                .configs
                .insert(id.to_string(), SalaryConfiguration::new(id, base_salary));
        }
        self
    }

    pub fn with_employee(self, id: &str, first_name: &str) -> Self {
        self.lock().employees.push(Employee {
            id: id.to_string(),
            first_name: Some(first_name.to_string()),
            last_name: None,
            email: None,
            department: None,
            position: None,
            has_salary_config: false,
        });
        self
    }

    pub fn with_history(self, history: Vec<Payment>) -> Self {
        self.lock().history = history;
        self
    }

    pub fn without_reset_endpoint(self) -> Self {
        self.lock().reset_unsupported = true;
        self
    }

    // --- Behaviour control ---

    pub fn fail(&self, op: Op, failure: InjectedFailure) {
        self.lock().failures.insert(op, failure);
    }

    pub fn fail_once(&self, op: Op, failure: InjectedFailure) {
        self.lock()
            .one_shot_failures
            .entry(op)
            .or_default()
            .push_back(failure);
    }

    pub fn clear_failure(&self, op: Op) {
        let mut state = self.lock();
        state.failures.remove(&op);
        state.one_shot_failures.remove(&op);
    }

    pub fn set_delay(&self, op: Op, delay: Duration) {
        self.lock().delays.insert(op, delay);
    }

    pub fn clear_delay(&self, op: Op) {
        self.lock().delays.remove(&op);
    }

    pub fn set_status(&self, raw: &str, status: MonthStatus) {
        if let Some(pay_month) = self.lock().months.get_mut(&month(raw)) {
            pay_month.status = status;
        }
    }

    // --- Inspection ---

    pub fn status(&self, raw: &str) -> Option<MonthStatus> {
        self.lock().months.get(&month(raw)).map(|m| m.status)
    }

    pub fn payments(&self, raw: &str) -> Vec<Payment> {
        self.lock()
            .payments
            .get(&month(raw))
            .cloned()
            .unwrap_or_default()
    }

    pub fn config(&self, employee_id: &str) -> Option<SalaryConfiguration> {
        self.lock().configs.get(employee_id).cloned()
    }

    pub fn calls(&self, op: Op) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.lock().calls.values().sum()
    }

    pub fn mark_paid_requests(&self) -> Vec<MarkPaidRequest> {
        self.lock().mark_paid_requests.clone()
    }

    pub fn reset_requests(&self) -> Vec<ResetMonthRequest> {
        self.lock().reset_requests.clone()
    }

    /// Counts the call, applies any configured latency, then any injected failure.
    async fn enter(&self, op: Op) -> Result<(), PayrollError> {
        let delay = {
            let mut state = self.lock();
            *state.calls.entry(op).or_insert(0) += 1;
            state.delays.get(&op).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        let one_shot = state
            .one_shot_failures
            .get_mut(&op)
            .and_then(VecDeque::pop_front);
        if let Some(failure) = one_shot.or_else(|| state.failures.get(&op).cloned()) {
            debug!("Mock injecting failure for {:?}: {:?}", op, failure);
            return Err(failure.to_error(op));
        }
        Ok(())
    }
}

fn not_found(what: &str) -> PayrollError {
    api_error_from_body(
        StatusCode::NOT_FOUND,
        &format!(r#"{{"message":"{} not found"}}"#, what),
    )
}

#[async_trait]
impl PayrollApi for MockPayrollApi {
    async fn list_pay_months(&self) -> Result<Vec<PayMonth>, PayrollError> {
        self.enter(Op::ListPayMonths).await?;
        Ok(self.lock().months.values().cloned().collect())
    }

    async fn get_pay_month(&self, month: &MonthYear) -> Result<PayMonth, PayrollError> {
        self.enter(Op::GetPayMonth).await?;
        self.lock()
            .months
            .get(month)
            .cloned()
            .ok_or_else(|| not_found("Pay month"))
    }

    async fn create_pay_month(&self, pay_month: &PayMonth) -> Result<PayMonth, PayrollError> {
        self.enter(Op::CreatePayMonth).await?;
        let mut state = self.lock();
        if state.months.contains_key(&pay_month.month_year) {
            return Err(api_error_from_body(
                StatusCode::CONFLICT,
                r#"{"message":"Pay month already exists"}"#,
            ));
        }
        state.months.insert(pay_month.month_year, pay_month.clone());
        Ok(pay_month.clone())
    }

    async fn calculate_salaries(&self, month: &MonthYear) -> Result<CalculationResult, PayrollError> {
        self.enter(Op::Calculate).await?;
        let mut state = self.lock();
        let status = state
            .months
            .get(month)
            .map(|m| m.status)
            .ok_or_else(|| not_found("Pay month"))?;
        let payment_status = if status == MonthStatus::Paid {
            PaymentStatus::Paid
        } else {
            PaymentStatus::Calculated
        };

        let mut payments = Vec::new();
        for employee in &state.employees {
            let Some(config) = state.configs.get(&employee.id).filter(|c| c.is_active) else {
                continue;
            };
            let estimate = config.net_salary_estimate().map_err(|e| {
                api_error_from_body(StatusCode::UNPROCESSABLE_ENTITY, &e.to_string())
            })?;
            payments.push(Payment {
                id: Some(format!("{}-{}", month, employee.id)),
                employee_id: employee.id.clone(),
                month_year: month.to_string(),
                employee_name: Some(employee.full_name()),
                first_name: employee.first_name.clone(),
                last_name: employee.last_name.clone(),
                department: employee.department.clone(),
                base_salary: config.base_salary,
                tax_amount: estimate.tax,
                deduction_amount: estimate.deductions,
                net_salary: estimate.net,
                payment_status,
                paid_at: None,
                paid_by: None,
            });
        }
        let total_amount = round_money(payments.iter().map(|p| p.net_salary).sum());
        let calculated = payments.len() as u32;
        state.payments.insert(*month, payments);
        if let Some(pay_month) = state.months.get_mut(month) {
            if pay_month.status != MonthStatus::Paid {
                pay_month.status = MonthStatus::Calculated;
            }
        }

        Ok(CalculationResult {
            calculated,
            failed: 0,
            total_amount,
            errors: Vec::new(),
        })
    }

    async fn list_payments(&self, month: &MonthYear) -> Result<Vec<Payment>, PayrollError> {
        self.enter(Op::ListPayments).await?;
        Ok(self.lock().payments.get(month).cloned().unwrap_or_default())
    }

    async fn mark_month_as_paid(&self, request: &MarkPaidRequest) -> Result<MarkPaidResult, PayrollError> {
        self.enter(Op::MarkPaid).await?;
        let mut state = self.lock();
        state.mark_paid_requests.push(request.clone());
        let month = request.month_year;
        let pay_month = state
            .months
            .get_mut(&month)
            .ok_or_else(|| not_found("Pay month"))?;
        if pay_month.status == MonthStatus::Paid {
            return Err(api_error_from_body(
                StatusCode::BAD_REQUEST,
                &format!(r#"{{"message":"Month {} is already paid"}}"#, month),
            ));
        }
        let paid_at = Utc::now().to_rfc3339();
        pay_month.status = MonthStatus::Paid;
        pay_month.paid_at = Some(paid_at.clone());
        pay_month.paid_by = request.metadata.requested_by.clone();

        let mut employees_paid = 0;
        let mut total_paid = Decimal::ZERO;
        if let Some(payments) = state.payments.get_mut(&month) {
            for p in payments.iter_mut().filter(|p| p.is_payable()) {
                p.payment_status = PaymentStatus::Paid;
                p.paid_at = Some(paid_at.clone());
                employees_paid += 1;
                total_paid += p.net_salary;
            }
        }
        Ok(MarkPaidResult {
            employees_paid,
            emails_sent: if request.metadata.send_emails { employees_paid } else { 0 },
            emails_failed: 0,
            total_paid,
            message: Some(format!("Month {} marked as paid", month)),
        })
    }

    async fn reset_month_status(&self, request: &ResetMonthRequest) -> Result<(), PayrollError> {
        self.enter(Op::ResetMonth).await?;
        let mut state = self.lock();
        if state.reset_unsupported {
            return Err(api_error_from_body(StatusCode::NOT_FOUND, "Not Found"));
        }
        state.reset_requests.push(request.clone());
        if let Some(pay_month) = state.months.get_mut(&request.month_year) {
            pay_month.status = MonthStatus::Calculated;
        }
        Ok(())
    }

    async fn get_salary_config(&self, employee_id: &str) -> Result<Option<SalaryConfiguration>, PayrollError> {
        self.enter(Op::GetConfig).await?;
        Ok(self.lock().configs.get(employee_id).cloned())
    }

    async fn configure_salary(&self, config: &SalaryConfiguration) -> Result<(), PayrollError> {
        self.enter(Op::Configure).await?;
        let mut state = self.lock();
        state
            .configs
            .insert(config.employee_id.clone(), config.clone());
        if let Some(employee) = state.employees.iter_mut().find(|e| e.id == config.employee_id) {
            employee.has_salary_config = true;
        }
        Ok(())
    }

    async fn list_employees(&self) -> Result<Vec<Employee>, PayrollError> {
        self.enter(Op::ListEmployees).await?;
        Ok(self.lock().employees.clone())
    }

    async fn payment_history(&self) -> Result<Vec<Payment>, PayrollError> {
        self.enter(Op::History).await?;
        Ok(self.lock().history.clone())
    }
}

/// Answers confirmations from a script, falling back to a default once it runs out.
pub struct ScriptedConfirmer {
    answers: Mutex<VecDeque<bool>>,
    default_answer: bool,
    asked: Mutex<Vec<ConfirmationRequest>>,
}

impl ScriptedConfirmer {
    pub fn always(answer: bool) -> Arc<Self> {
        Self::script(Vec::new(), answer)
    }

    pub fn script(answers: Vec<bool>, default_answer: bool) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.into()),
            default_answer,
            asked: Mutex::new(Vec::new()),
        })
    }

    pub fn asked(&self) -> Vec<ConfirmationRequest> {
        self.asked.lock().unwrap().clone()
    }
}

impl Confirmer for ScriptedConfirmer {
    fn confirm(&self, request: &ConfirmationRequest) -> bool {
        self.asked.lock().unwrap().push(request.clone());
        let answer = self
            .answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.default_answer);
        debug!("Scripted confirmation {:?} -> {}", request, answer);
        answer
    }
}
