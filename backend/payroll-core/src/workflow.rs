// src/workflow.rs
//
// Month-end payroll workflow: select a month, preview it, run the salary calculation, then
// mark it as paid. The month status lives on the server; this module only decides which
// actions are legal from the last status it saw and mediates the two irreversible calls.

use chrono::Utc;
use rand::{distributions::Alphanumeric, thread_rng, Rng};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::AbortHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditSink, RecalculationAuditEntry};
use crate::models::{
    CalculationResult, MarkPaidMetadata, MarkPaidRequest, MonthStatus, MonthYear, MonthYearError,
    PayMonth, Payment, PaymentStatus, ResetMonthRequest,
};
use crate::notification::{CallbackPayload, LegacyPayloadError};
use crate::payroll_client::{PayrollApi, PayrollError};
use crate::salary_config::ValidationError;

pub const DEFAULT_SUBMIT_COOLDOWN_MS: u64 = 2000;

// --- Errors ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    Precondition,
    Conflict,
    Transient,
    Cancelled,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    Timeout,
    Network,
    Server,
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransientKind::Timeout => "the server did not answer in time",
            TransientKind::Network => "the server could not be reached",
            TransientKind::Server => "the server failed while processing the request",
        })
    }
}

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Invalid month: {0}")]
    InvalidMonth(#[from] MonthYearError),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error(transparent)]
    InvalidConfiguration(#[from] ValidationError),

    #[error("{reason}")]
    Precondition {
        reason: String,
        route_to: WorkflowStep,
    },

    #[error("Cancelled by operator")]
    Declined,

    #[error("A submission for this month is already in progress")]
    SubmissionInProgress,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Temporary failure ({kind}): {message}")]
    Transient { kind: TransientKind, message: String },

    #[error("Superseded by a newer request")]
    Superseded,

    #[error("Payroll API error")]
    Api(#[source] PayrollError),
}

impl WorkflowError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            WorkflowError::InvalidMonth(_)
            | WorkflowError::Validation(_)
            | WorkflowError::InvalidConfiguration(_) => ErrorCategory::Validation,
            WorkflowError::Precondition { .. } => ErrorCategory::Precondition,
            WorkflowError::Conflict(_) | WorkflowError::SubmissionInProgress => {
                ErrorCategory::Conflict
            }
            WorkflowError::Transient { .. } => ErrorCategory::Transient,
            WorkflowError::Declined | WorkflowError::Superseded => ErrorCategory::Cancelled,
            WorkflowError::Api(_) => ErrorCategory::Other,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    /// Step the operator should be sent back to, for precondition failures.
    pub fn route_to(&self) -> Option<WorkflowStep> {
        match self {
            WorkflowError::Precondition { route_to, .. } => Some(*route_to),
            _ => None,
        }
    }
}

impl From<LegacyPayloadError> for WorkflowError {
    fn from(e: LegacyPayloadError) -> Self {
        match e {
            LegacyPayloadError::InvalidMonth(inner) => WorkflowError::InvalidMonth(inner),
            LegacyPayloadError::MissingMonth => WorkflowError::Validation(e.to_string()),
        }
    }
}

/// Maps a backend error onto the workflow taxonomy. 409 is a conflict; timeouts, connection
/// failures and 5xx are transient; everything else stays an API error.
pub fn classify_api_error(e: PayrollError) -> WorkflowError {
    if e.is_timeout() {
        return WorkflowError::Transient {
            kind: TransientKind::Timeout,
            message: e.to_string(),
        };
    }
    match &e {
        PayrollError::Request(_) => WorkflowError::Transient {
            kind: TransientKind::Network,
            message: e.to_string(),
        },
        PayrollError::Api { status, message, .. } if status.as_u16() == 409 => {
            WorkflowError::Conflict(message.clone())
        }
        PayrollError::Api { status, message, .. } if status.is_server_error() => {
            WorkflowError::Transient {
                kind: TransientKind::Server,
                message: message.clone(),
            }
        }
        _ => WorkflowError::Api(e),
    }
}

// --- Steps and gates ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStep {
    Select,
    Preview,
    Calculate,
    MarkPaid,
    Complete,
}

impl fmt::Display for WorkflowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WorkflowStep::Select => "select",
            WorkflowStep::Preview => "preview",
            WorkflowStep::Calculate => "calculate",
            WorkflowStep::MarkPaid => "mark-paid",
            WorkflowStep::Complete => "complete",
        })
    }
}

/// Recalculation is always allowed once preview data is loaded, `paid` months included.
pub fn can_calculate(preview_loaded: bool) -> bool {
    preview_loaded
}

pub fn can_mark_as_paid(
    status: Option<MonthStatus>,
    preview_loaded: bool,
    calculated_this_session: bool,
) -> bool {
    preview_loaded
        && (status == Some(MonthStatus::Calculated) || calculated_this_session)
        && status != Some(MonthStatus::Paid)
}

// --- Operator confirmation ---

#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmationRequest {
    RecalculatePaidMonth {
        month: MonthYear,
    },
    MarkAsPaid {
        month: MonthYear,
        employee_count: usize,
        total_net: Decimal,
    },
    MarkAsPaidFinal {
        month: MonthYear,
        employee_count: usize,
    },
    ForceReset {
        month: MonthYear,
    },
}

impl fmt::Display for ConfirmationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfirmationRequest::RecalculatePaidMonth { month } => write!(
                f,
                "{} is already paid. Recalculating will change the recorded payment amounts but the month stays paid. Continue?",
                month.month_name()
            ),
            ConfirmationRequest::MarkAsPaid {
                month,
                employee_count,
                total_net,
            } => write!(
                f,
                "Mark {} as paid for {} employees (total net {})?",
                month.month_name(),
                employee_count,
                total_net
            ),
            ConfirmationRequest::MarkAsPaidFinal {
                month,
                employee_count,
            } => write!(
                f,
                "This cannot be undone and will email payslips to {} employees. Really mark {} as paid?",
                employee_count,
                month.month_name()
            ),
            ConfirmationRequest::ForceReset { month } => write!(
                f,
                "{} appears stuck in processing. Force-reset its status so the payment can be retried?",
                month.month_name()
            ),
        }
    }
}

pub trait Confirmer: Send + Sync {
    fn confirm(&self, request: &ConfirmationRequest) -> bool;
}

// --- Submission guard ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    Idle,
    Submitting,
    Cooldown { until: Instant },
}

/// Client-side debounce for irreversible submissions. The server remains the authority on
/// duplicates; the guard only keeps one client from firing twice.
#[derive(Debug, Clone)]
pub struct SubmissionGuard {
    state: Arc<Mutex<GuardState>>,
    cooldown: Duration,
}

impl SubmissionGuard {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(GuardState::Idle)),
            cooldown,
        }
    }

    fn lock(&self) -> MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> GuardState {
        let mut state = self.lock();
        if let GuardState::Cooldown { until } = *state {
            if Instant::now() >= until {
                *state = GuardState::Idle;
            }
        }
        *state
    }

    /// Check-and-set with no await in between.
    pub fn try_acquire(&self) -> Option<SubmissionTicket> {
        let mut state = self.lock();
        let available = match *state {
            GuardState::Idle => true,
            GuardState::Submitting => false,
            GuardState::Cooldown { until } => Instant::now() >= until,
        };
        if !available {
            return None;
        }
        *state = GuardState::Submitting;
        Some(SubmissionTicket {
            state: Arc::clone(&self.state),
            cooldown: self.cooldown,
            submitted: false,
        })
    }
}

/// Held while a submission runs. Dropping it releases the guard: straight to `Idle` if
/// nothing reached the network, otherwise through the cooldown window.
#[derive(Debug)]
pub struct SubmissionTicket {
    state: Arc<Mutex<GuardState>>,
    cooldown: Duration,
    submitted: bool,
}

impl SubmissionTicket {
    pub fn mark_submitted(&mut self) {
        self.submitted = true;
    }
}

impl Drop for SubmissionTicket {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = if self.submitted && !self.cooldown.is_zero() {
            GuardState::Cooldown {
                until: Instant::now() + self.cooldown,
            }
        } else {
            GuardState::Idle
        };
    }
}

// --- Session ---

#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    pub status_timeout: Duration,
    pub submit_timeout: Duration,
    pub submit_cooldown: Duration,
    pub operator: Option<String>,
    pub send_emails: bool,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            status_timeout: Duration::from_secs(3),
            submit_timeout: Duration::from_secs(45),
            submit_cooldown: Duration::from_millis(DEFAULT_SUBMIT_COOLDOWN_MS),
            operator: None,
            send_emails: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalculationSummary {
    pub calculated: u32,
    pub failed: u32,
    pub total_amount: Decimal,
    pub errors: Vec<String>,
}

impl From<&CalculationResult> for CalculationSummary {
    fn from(result: &CalculationResult) -> Self {
        Self {
            calculated: result.calculated,
            failed: result.failed,
            total_amount: result.total_amount,
            errors: result.error_messages(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalculationReport {
    pub month: MonthYear,
    pub summary: CalculationSummary,
    /// The server reported an error but some employees were calculated.
    pub partial: bool,
    pub recalculated_paid_month: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentReport {
    pub month: MonthYear,
    pub employees_paid: u32,
    pub emails_sent: u32,
    pub emails_failed: u32,
    pub total_paid: Decimal,
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MarkPaidOutcome {
    Paid(PaymentReport),
    /// Nothing was submitted because the month is already paid.
    AlreadyPaid {
        month: MonthYear,
        paid_at: Option<String>,
        paid_by: Option<String>,
    },
    /// A month stuck in `processing` was reset (or reloaded when the reset endpoint is
    /// missing). The operator may retry.
    Recovered {
        month: MonthYear,
        status: Option<MonthStatus>,
        reset_applied: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonthPreview {
    pub month: MonthYear,
    pub pay_month: Option<PayMonth>,
    pub payments: Vec<Payment>,
}

impl MonthPreview {
    pub fn payable(&self) -> impl Iterator<Item = &Payment> {
        self.payments.iter().filter(|p| p.is_payable())
    }

    pub fn total_net(&self) -> Decimal {
        self.payable().map(|p| p.net_salary).sum()
    }
}

#[derive(Debug, Clone)]
struct MonthSession {
    month: MonthYear,
    pay_month: Option<PayMonth>,
    payments: Vec<Payment>,
    preview_loaded: bool,
    calculated_this_session: bool,
}

impl MonthSession {
    fn new(month: MonthYear) -> Self {
        Self {
            month,
            pay_month: None,
            payments: Vec::new(),
            preview_loaded: false,
            calculated_this_session: false,
        }
    }

    fn status(&self) -> Option<MonthStatus> {
        self.pay_month.as_ref().map(|m| m.status)
    }

    fn set_status(&mut self, status: MonthStatus) {
        match self.pay_month.as_mut() {
            Some(pay_month) => pay_month.status = status,
            None => {
                let mut pay_month = PayMonth::new_draft(self.month);
                pay_month.status = status;
                self.pay_month = Some(pay_month);
            }
        }
    }
}

#[derive(Debug)]
struct SessionState {
    step: WorkflowStep,
    current: Option<MonthSession>,
}

enum Preflight {
    Known(PayMonth),
    Missing,
    Unknown,
}

pub struct PayMonthWorkflow {
    api: Arc<dyn PayrollApi>,
    confirmer: Arc<dyn Confirmer>,
    audit: Option<Arc<dyn AuditSink>>,
    settings: WorkflowSettings,
    state: Mutex<SessionState>,
    calculate_guard: SubmissionGuard,
    mark_paid_guard: SubmissionGuard,
    preview_generation: AtomicU64,
    preview_task: Mutex<Option<AbortHandle>>,
}

impl PayMonthWorkflow {
    pub fn new(
        api: Arc<dyn PayrollApi>,
        confirmer: Arc<dyn Confirmer>,
        settings: WorkflowSettings,
    ) -> Self {
        let cooldown = settings.submit_cooldown;
        Self {
            api,
            confirmer,
            audit: None,
            settings,
            state: Mutex::new(SessionState {
                step: WorkflowStep::Select,
                current: None,
            }),
            calculate_guard: SubmissionGuard::new(cooldown),
            mark_paid_guard: SubmissionGuard::new(cooldown),
            preview_generation: AtomicU64::new(0),
            preview_task: Mutex::new(None),
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn step(&self) -> WorkflowStep {
        self.lock_state().step
    }

    pub fn selected_month(&self) -> Option<MonthYear> {
        self.lock_state().current.as_ref().map(|s| s.month)
    }

    /// Last status seen for the selected month.
    pub fn known_status(&self) -> Option<MonthStatus> {
        self.lock_state().current.as_ref().and_then(|s| s.status())
    }

    pub fn preview(&self) -> Option<MonthPreview> {
        self.lock_state().current.as_ref().map(|s| MonthPreview {
            month: s.month,
            pay_month: s.pay_month.clone(),
            payments: s.payments.clone(),
        })
    }

    pub fn mark_paid_guard_state(&self) -> GuardState {
        self.mark_paid_guard.state()
    }

    pub fn can_calculate(&self) -> bool {
        let state = self.lock_state();
        can_calculate(state.current.as_ref().map_or(false, |s| s.preview_loaded))
    }

    pub fn can_mark_as_paid(&self) -> bool {
        let state = self.lock_state();
        state.current.as_ref().map_or(false, |s| {
            can_mark_as_paid(s.status(), s.preview_loaded, s.calculated_this_session)
        })
    }

    // --- Step machine ---

    /// Starts a fresh session for `month_year`, cancelling any preview still loading.
    pub fn select_month(&self, month_year: &str) -> Result<MonthYear, WorkflowError> {
        let month = MonthYear::parse(month_year)?;
        self.cancel_preview_load();
        let mut state = self.lock_state();
        state.current = Some(MonthSession::new(month));
        state.step = WorkflowStep::Preview;
        info!("Selected pay month {}", month);
        Ok(month)
    }

    fn ensure_selected(&self, month: MonthYear) {
        let mut state = self.lock_state();
        if state.current.as_ref().map(|s| s.month) != Some(month) {
            debug!("Switching workflow session to {}", month);
            state.current = Some(MonthSession::new(month));
            state.step = WorkflowStep::Preview;
        }
    }

    /// Moves the step indicator. Going back is always allowed except out of `complete`;
    /// going forward requires the matching gate.
    pub fn go_to(&self, target: WorkflowStep) -> Result<WorkflowStep, WorkflowError> {
        let mut state = self.lock_state();
        let current = state.step;
        if current == target {
            return Ok(current);
        }
        if current == WorkflowStep::Complete {
            return Err(WorkflowError::Precondition {
                reason: "The month is complete; select a month to start a new run".to_string(),
                route_to: WorkflowStep::Complete,
            });
        }

        if target > current {
            let session = state.current.as_ref();
            let allowed = match target {
                WorkflowStep::Select => true,
                WorkflowStep::Preview => session.is_some(),
                WorkflowStep::Calculate => session.map_or(false, |s| can_calculate(s.preview_loaded)),
                WorkflowStep::MarkPaid => session.map_or(false, |s| {
                    can_mark_as_paid(s.status(), s.preview_loaded, s.calculated_this_session)
                }),
                WorkflowStep::Complete => false,
            };
            if !allowed {
                return Err(WorkflowError::Precondition {
                    reason: format!("Cannot move from {} to {} yet", current, target),
                    route_to: current,
                });
            }
        }

        debug!("Workflow step {} -> {}", current, target);
        state.step = target;
        Ok(target)
    }

    // --- Preview loading ---

    fn cancel_preview_load(&self) {
        self.preview_generation.fetch_add(1, Ordering::SeqCst);
        let previous = self
            .preview_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = previous {
            debug!("Cancelling in-flight preview load");
            handle.abort();
        }
    }

    /// Loads the selected month's status and payments. A newer load or month selection
    /// cancels this one, which then returns `Superseded` without touching the session.
    pub async fn load_preview(&self) -> Result<MonthPreview, WorkflowError> {
        let month = self.selected_month().ok_or_else(|| WorkflowError::Precondition {
            reason: "Select a month first".to_string(),
            route_to: WorkflowStep::Select,
        })?;

        self.cancel_preview_load();
        let generation = self.preview_generation.load(Ordering::SeqCst);

        let api = Arc::clone(&self.api);
        let task = tokio::spawn(async move { fetch_month_data(api.as_ref(), month).await });
        *self
            .preview_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task.abort_handle());

        let fetched = match task.await {
            Ok(result) => result,
            Err(join_error) if join_error.is_cancelled() => {
                debug!("Preview load for {} was superseded", month);
                return Err(WorkflowError::Superseded);
            }
            Err(join_error) => {
                error!("Preview task for {} failed: {}", month, join_error);
                return Err(WorkflowError::Validation(format!(
                    "Preview task failed: {}",
                    join_error
                )));
            }
        };

        if self.preview_generation.load(Ordering::SeqCst) != generation {
            debug!("Discarding stale preview for {}", month);
            return Err(WorkflowError::Superseded);
        }
        let (pay_month, payments) = fetched.map_err(classify_api_error)?;

        let mut state = self.lock_state();
        let session = match state.current.as_mut() {
            Some(session) if session.month == month => session,
            _ => return Err(WorkflowError::Superseded),
        };
        session.pay_month = pay_month.clone();
        session.payments = payments.clone();
        session.preview_loaded = true;
        if state.step < WorkflowStep::Preview {
            state.step = WorkflowStep::Preview;
        }
        info!(
            "Loaded preview for {}: status={}, payments={}",
            month,
            pay_month
                .as_ref()
                .map_or("none".to_string(), |m| m.status.to_string()),
            payments.len()
        );

        Ok(MonthPreview {
            month,
            pay_month,
            payments,
        })
    }

    async fn preflight_status(&self, month: MonthYear) -> Preflight {
        match timeout(self.settings.status_timeout, self.api.get_pay_month(&month)).await {
            Ok(Ok(pay_month)) => {
                debug!("Pre-flight status for {}: {}", month, pay_month.status);
                Preflight::Known(pay_month)
            }
            Ok(Err(e)) if e.is_not_found() => Preflight::Missing,
            Ok(Err(e)) => {
                warn!(
                    "Pre-flight status check for {} failed ({}); proceeding with last known status",
                    month, e
                );
                Preflight::Unknown
            }
            Err(_) => {
                warn!(
                    "Pre-flight status check for {} timed out after {:?}; proceeding with last known status",
                    month, self.settings.status_timeout
                );
                Preflight::Unknown
            }
        }
    }

    /// Best-effort refresh after a write. Failures are logged and leave the session as is.
    async fn refresh_after_write(&self, month: MonthYear) {
        match fetch_month_data(self.api.as_ref(), month).await {
            Ok((pay_month, payments)) => {
                let mut state = self.lock_state();
                if let Some(session) = state.current.as_mut().filter(|s| s.month == month) {
                    if pay_month.is_some() {
                        session.pay_month = pay_month;
                    }
                    session.payments = payments;
                    session.preview_loaded = true;
                }
            }
            Err(e) => warn!("Refresh after write for {} failed: {}", month, e),
        }
    }

    fn update_session<F: FnOnce(&mut MonthSession)>(&self, month: MonthYear, f: F) {
        let mut state = self.lock_state();
        if let Some(session) = state.current.as_mut().filter(|s| s.month == month) {
            f(session);
        }
    }

    fn set_step(&self, step: WorkflowStep) {
        self.lock_state().step = step;
    }

    fn precondition(&self, reason: impl Into<String>, route_to: WorkflowStep) -> WorkflowError {
        let reason = reason.into();
        warn!("{}; routing to {}", reason, route_to);
        self.set_step(route_to);
        WorkflowError::Precondition { reason, route_to }
    }

    // --- Pay months ---

    pub async fn list_pay_months(&self) -> Result<Vec<PayMonth>, WorkflowError> {
        self.api.list_pay_months().await.map_err(classify_api_error)
    }

    /// Creates a `draft` month. Rejected locally when the month is already listed, and
    /// mapped to a conflict when the server answers 409.
    pub async fn create_pay_month(&self, month_year: &str) -> Result<PayMonth, WorkflowError> {
        let month = MonthYear::parse(month_year)?;
        let existing = self.list_pay_months().await?;
        if existing.iter().any(|m| m.month_year == month) {
            return Err(WorkflowError::Conflict(format!(
                "Pay month {} already exists",
                month
            )));
        }

        let created = self
            .api
            .create_pay_month(&PayMonth::new_draft(month))
            .await
            .map_err(|e| match e.status() {
                Some(status) if status.as_u16() == 409 => {
                    WorkflowError::Conflict(format!("Pay month {} already exists", month))
                }
                _ => classify_api_error(e),
            })?;
        info!("Created pay month {}", created.month_year);
        Ok(created)
    }

    // --- Calculation ---

    pub async fn request_calculate(
        &self,
        month_year: &str,
    ) -> Result<CalculationReport, WorkflowError> {
        let month = MonthYear::parse(month_year)?;
        let mut ticket = self
            .calculate_guard
            .try_acquire()
            .ok_or(WorkflowError::SubmissionInProgress)?;
        self.ensure_selected(month);

        let previous_status = match self.preflight_status(month).await {
            Preflight::Known(pay_month) => {
                let status = pay_month.status;
                self.update_session(month, |s| s.pay_month = Some(pay_month));
                Some(status)
            }
            Preflight::Missing => None,
            Preflight::Unknown => self.known_status(),
        };

        let recalculating_paid = previous_status == Some(MonthStatus::Paid);
        if recalculating_paid
            && !self
                .confirmer
                .confirm(&ConfirmationRequest::RecalculatePaidMonth { month })
        {
            info!("Recalculation of paid month {} declined", month);
            return Err(WorkflowError::Declined);
        }

        info!("Calculating salaries for {}", month);
        ticket.mark_submitted();
        let outcome = timeout(self.settings.submit_timeout, self.api.calculate_salaries(&month)).await;

        let (summary, partial) = match outcome {
            Err(_) => {
                error!("Salary calculation for {} timed out", month);
                return Err(WorkflowError::Transient {
                    kind: TransientKind::Timeout,
                    message: format!(
                        "Calculation for {} did not finish within {:?}",
                        month, self.settings.submit_timeout
                    ),
                });
            }
            Ok(Ok(result)) => (CalculationSummary::from(&result), false),
            Ok(Err(e)) => match partial_calculation(&e) {
                Some(summary) => {
                    warn!(
                        "Calculation for {} partially succeeded ({} calculated, {} failed): {}",
                        month, summary.calculated, summary.failed, e
                    );
                    (summary, true)
                }
                None => {
                    error!("Calculation for {} failed: {}", month, e);
                    return Err(classify_api_error(e));
                }
            },
        };

        if recalculating_paid {
            self.audit_recalculation(month, &summary, partial);
        }

        self.refresh_after_write(month).await;
        self.update_session(month, |s| {
            s.calculated_this_session = true;
            if s.status() != Some(MonthStatus::Paid) {
                s.set_status(MonthStatus::Calculated);
            }
        });
        self.set_step(WorkflowStep::MarkPaid);

        info!(
            "Calculation for {} done: {} calculated, {} failed, total {}",
            month, summary.calculated, summary.failed, summary.total_amount
        );
        Ok(CalculationReport {
            month,
            summary,
            partial,
            recalculated_paid_month: recalculating_paid,
        })
    }

    fn audit_recalculation(&self, month: MonthYear, summary: &CalculationSummary, partial: bool) {
        warn!("Paid month {} was recalculated; payment amounts changed", month);
        let Some(audit) = &self.audit else {
            return;
        };
        let entry = RecalculationAuditEntry {
            month_year: month,
            previous_status: MonthStatus::Paid,
            operator: self.settings.operator.clone(),
            recorded_at: Utc::now(),
            calculated: summary.calculated,
            failed: summary.failed,
            partial,
        };
        if let Err(e) = audit.record(&entry) {
            error!("Failed to record recalculation audit entry for {}: {}", month, e);
        }
    }

    // --- Mark as paid ---

    pub async fn request_mark_as_paid(
        &self,
        month_year: &str,
    ) -> Result<MarkPaidOutcome, WorkflowError> {
        let month = MonthYear::parse(month_year)?;
        let mut ticket = self.mark_paid_guard.try_acquire().ok_or_else(|| {
            warn!("Mark-as-paid for {} rejected: submission already in progress", month);
            WorkflowError::SubmissionInProgress
        })?;
        self.ensure_selected(month);

        let (payable_count, total_net, local_status, calculated_here) = {
            let state = self.lock_state();
            let session = state.current.as_ref().filter(|s| s.month == month);
            let payable: Vec<&Payment> = session
                .map(|s| s.payments.iter().filter(|p| p.is_payable()).collect())
                .unwrap_or_default();
            (
                payable.len(),
                payable.iter().map(|p| p.net_salary).sum::<Decimal>(),
                session.and_then(|s| s.status()),
                session.map_or(false, |s| s.calculated_this_session),
            )
        };

        if payable_count == 0 {
            return Err(self.precondition(
                format!("Nothing to pay for {}: no payments with a positive net salary", month),
                WorkflowStep::Calculate,
            ));
        }
        let locally_ready = calculated_here
            || matches!(local_status, Some(MonthStatus::Calculated) | Some(MonthStatus::Paid));
        if !locally_ready {
            return Err(self.precondition(
                format!(
                    "{} must be calculated before it can be marked as paid (status: {})",
                    month,
                    local_status.map_or("unknown".to_string(), |s| s.to_string())
                ),
                WorkflowStep::Calculate,
            ));
        }

        if !self.confirmer.confirm(&ConfirmationRequest::MarkAsPaid {
            month,
            employee_count: payable_count,
            total_net,
        }) {
            info!("Mark-as-paid for {} declined at first confirmation", month);
            return Err(WorkflowError::Declined);
        }
        if !self.confirmer.confirm(&ConfirmationRequest::MarkAsPaidFinal {
            month,
            employee_count: payable_count,
        }) {
            info!("Mark-as-paid for {} declined at final confirmation", month);
            return Err(WorkflowError::Declined);
        }

        match self.preflight_status(month).await {
            Preflight::Known(pay_month) => match pay_month.status {
                MonthStatus::Paid => {
                    info!("{} is already paid; nothing to submit", month);
                    return Ok(self.finish_already_paid(month, Some(pay_month)));
                }
                MonthStatus::Processing => return self.recover_stuck_month(month).await,
                MonthStatus::Calculated => {
                    self.update_session(month, |s| s.pay_month = Some(pay_month));
                }
                other => {
                    return Err(self.precondition(
                        format!(
                            "{} is {} on the server and must be calculated first",
                            month, other
                        ),
                        WorkflowStep::Calculate,
                    ));
                }
            },
            Preflight::Missing => {
                return Err(self.precondition(
                    format!("Pay month {} does not exist on the server", month),
                    WorkflowStep::Calculate,
                ));
            }
            Preflight::Unknown => {
                warn!("Submitting mark-as-paid for {} without a fresh status", month);
            }
        }

        let request = MarkPaidRequest {
            month_year: month,
            metadata: MarkPaidMetadata {
                request_id: new_request_id(),
                requested_at: Utc::now(),
                requested_by: self.settings.operator.clone(),
                employee_count: payable_count,
                total_net,
                send_emails: self.settings.send_emails,
            },
        };

        info!(
            "Submitting mark-as-paid for {} ({} employees, request {})",
            month, payable_count, request.metadata.request_id
        );
        ticket.mark_submitted();
        let outcome = timeout(
            self.settings.submit_timeout,
            self.api.mark_month_as_paid(&request),
        )
        .await;

        match outcome {
            Err(_) => {
                error!("Mark-as-paid for {} timed out", month);
                Err(WorkflowError::Transient {
                    kind: TransientKind::Timeout,
                    message: format!(
                        "No answer within {:?}; check the month status before retrying",
                        self.settings.submit_timeout
                    ),
                })
            }
            Ok(Ok(result)) => {
                info!(
                    "{} marked as paid: {} employees, {} emails sent, {} failed",
                    month, result.employees_paid, result.emails_sent, result.emails_failed
                );
                self.update_session(month, |s| {
                    s.set_status(MonthStatus::Paid);
                    for payment in s.payments.iter_mut() {
                        payment.payment_status = PaymentStatus::Paid;
                    }
                });
                self.set_step(WorkflowStep::Complete);
                Ok(MarkPaidOutcome::Paid(PaymentReport {
                    month,
                    employees_paid: result.employees_paid,
                    emails_sent: result.emails_sent,
                    emails_failed: result.emails_failed,
                    total_paid: result.total_paid,
                    request_id: request.metadata.request_id,
                }))
            }
            Ok(Err(e)) if is_already_paid_error(&e) => {
                info!("Server reports {} already paid; treating as success", month);
                let refreshed = match self.preflight_status(month).await {
                    Preflight::Known(pay_month) => Some(pay_month),
                    _ => None,
                };
                Ok(self.finish_already_paid(month, refreshed))
            }
            Ok(Err(e)) => {
                error!("Mark-as-paid for {} failed: {}", month, e);
                Err(match classify_api_error(e) {
                    WorkflowError::Conflict(_) => WorkflowError::Conflict(format!(
                        "A conflicting operation is already in progress for {}",
                        month
                    )),
                    other => other,
                })
            }
        }
    }

    fn finish_already_paid(&self, month: MonthYear, pay_month: Option<PayMonth>) -> MarkPaidOutcome {
        let (paid_at, paid_by) = pay_month
            .as_ref()
            .map_or((None, None), |m| (m.paid_at.clone(), m.paid_by.clone()));
        self.update_session(month, |s| {
            if let Some(pay_month) = pay_month {
                s.pay_month = Some(pay_month);
            }
            s.set_status(MonthStatus::Paid);
        });
        self.set_step(WorkflowStep::Complete);
        MarkPaidOutcome::AlreadyPaid {
            month,
            paid_at,
            paid_by,
        }
    }

    async fn recover_stuck_month(&self, month: MonthYear) -> Result<MarkPaidOutcome, WorkflowError> {
        warn!("{} is stuck in processing", month);
        if !self
            .confirmer
            .confirm(&ConfirmationRequest::ForceReset { month })
        {
            return Err(WorkflowError::Conflict(format!(
                "{} is being processed by another operation",
                month
            )));
        }

        let request = ResetMonthRequest {
            month_year: month,
            force: true,
            reason: "Month stuck in processing; reset requested by operator".to_string(),
        };
        let reset_applied = match self.api.reset_month_status(&request).await {
            Ok(()) => {
                info!("Force-reset status of {}", month);
                true
            }
            Err(e) if e.is_endpoint_missing() => {
                warn!("Reset endpoint unavailable ({}); reloading {} instead", e, month);
                false
            }
            Err(e) => return Err(classify_api_error(e)),
        };

        self.refresh_after_write(month).await;
        let status = self.known_status();
        self.set_step(WorkflowStep::MarkPaid);
        Ok(MarkPaidOutcome::Recovered {
            month,
            status,
            reset_applied,
        })
    }

    // --- Callback channel ---

    /// Reacts to the shared success callback. Payment notifications never trigger a
    /// calculation.
    pub async fn handle_callback(
        &self,
        payload: CallbackPayload,
    ) -> Result<Option<CalculationReport>, WorkflowError> {
        match payload {
            CallbackPayload::PaymentNotification { month_year, .. } => {
                debug!(
                    "Ignoring payment notification for {:?}; no recalculation",
                    month_year.map(|m| m.to_string())
                );
                Ok(None)
            }
            CallbackPayload::Recalculate { month_year } => self
                .request_calculate(&month_year.to_string())
                .await
                .map(Some),
        }
    }

    pub async fn handle_legacy_callback(
        &self,
        payload: &Value,
    ) -> Result<Option<CalculationReport>, WorkflowError> {
        let payload = CallbackPayload::from_legacy(payload)?;
        self.handle_callback(payload).await
    }
}

async fn fetch_month_data(
    api: &dyn PayrollApi,
    month: MonthYear,
) -> Result<(Option<PayMonth>, Vec<Payment>), PayrollError> {
    let pay_month = match api.get_pay_month(&month).await {
        Ok(pay_month) => Some(pay_month),
        Err(e) if e.is_not_found() => None,
        Err(e) => return Err(e),
    };
    let payments = match api.list_payments(&month).await {
        Ok(payments) => payments,
        Err(e) if e.is_not_found() => Vec::new(),
        Err(e) => return Err(e),
    };
    Ok((pay_month, payments))
}

/// A failed calculation whose error body still reports `calculated > 0` counts as a
/// best-effort success.
fn partial_calculation(e: &PayrollError) -> Option<CalculationSummary> {
    let details = match e {
        PayrollError::Api {
            details: Some(details),
            ..
        } => details,
        _ => return None,
    };
    let result: CalculationResult = serde_json::from_value(details.clone()).ok()?;
    if result.calculated == 0 {
        return None;
    }
    let mut summary = CalculationSummary::from(&result);
    if summary.errors.is_empty() {
        summary.errors.push(e.api_message().to_string());
    }
    Some(summary)
}

fn is_already_paid_error(e: &PayrollError) -> bool {
    if e.status().map(|s| s.as_u16()) != Some(400) {
        return false;
    }
    let message = e.api_message().to_lowercase();
    message.contains("already paid") || message.contains("déjà payé")
}

fn new_request_id() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect()
}
