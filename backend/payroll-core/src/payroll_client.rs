// src/payroll_client.rs

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::models::{
    CalculationResult, Employee, MarkPaidRequest, MarkPaidResult, MonthYear, PayMonth, Payment,
    ResetMonthRequest, SalaryConfiguration,
};

// Constants
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000/api";
pub const DEFAULT_CACHE_DIR: &str = "./payroll_cache";
pub const DEFAULT_CACHE_DURATION_SECS: u64 = 24 * 60 * 60; // 24 hours
pub const DEFAULT_STATUS_TIMEOUT_SECS: u64 = 3;
pub const DEFAULT_SUBMIT_TIMEOUT_SECS: u64 = 45;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Error, Debug)]
pub enum PayrollError {
    #[error("HTTP request failed")]
    Request(#[from] reqwest::Error),

    #[error("JSON processing error")]
    Json(#[from] serde_json::Error),

    #[error("File I/O error: {context}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },

    #[error("URL parsing error")]
    UrlParse(#[from] url::ParseError),

    #[error("Payroll API error: Status={status}, Message='{message}'")]
    Api {
        status: StatusCode,
        message: String,
        /// Parsed JSON error body, when the server sent one.
        details: Option<Value>,
    },

    #[error("Timed out waiting for '{operation}'")]
    Timeout { operation: String },

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl PayrollError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            PayrollError::Api { status, .. } => Some(*status),
            PayrollError::Request(e) => e.status(),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND)
    }

    /// The server has no such route: 404, or 405 when the path exists for other methods.
    pub fn is_endpoint_missing(&self) -> bool {
        matches!(
            self.status(),
            Some(StatusCode::NOT_FOUND) | Some(StatusCode::METHOD_NOT_ALLOWED)
        )
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            PayrollError::Timeout { .. } => true,
            PayrollError::Request(e) => e.is_timeout(),
            _ => false,
        }
    }

    /// Server message text for API errors, empty otherwise.
    pub fn api_message(&self) -> &str {
        match self {
            PayrollError::Api { message, .. } => message,
            _ => "",
        }
    }

    /// Field from the JSON error body, e.g. `calculated` on a partially successful run.
    pub fn detail(&self, field: &str) -> Option<&Value> {
        match self {
            PayrollError::Api {
                details: Some(details),
                ..
            } => details.get(field),
            _ => None,
        }
    }
}

// Helper to create context-aware IO errors
pub(crate) fn io_context<E: Into<std::io::Error>, S: Into<String>>(
    source: E,
    context: S,
) -> PayrollError {
    PayrollError::Io {
        source: source.into(),
        context: context.into(),
    }
}

#[derive(Clone, Debug)]
pub struct PayrollConfig {
    pub api_base_url: String,
    pub api_token: Option<String>,
    pub cache_dir: PathBuf,
    pub cache_duration_secs: u64,
    pub status_timeout: Duration,
    pub submit_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for PayrollConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            api_token: None,
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            cache_duration_secs: DEFAULT_CACHE_DURATION_SECS,
            status_timeout: Duration::from_secs(DEFAULT_STATUS_TIMEOUT_SECS),
            submit_timeout: Duration::from_secs(DEFAULT_SUBMIT_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }
}

/// The backend operations the workflows depend on. `PayrollClient` talks HTTP; tests plug in
/// an in-memory implementation.
#[async_trait]
pub trait PayrollApi: Send + Sync {
    async fn list_pay_months(&self) -> Result<Vec<PayMonth>, PayrollError>;

    /// Always a fresh read, never served from any cache.
    async fn get_pay_month(&self, month: &MonthYear) -> Result<PayMonth, PayrollError>;

    async fn create_pay_month(&self, month: &PayMonth) -> Result<PayMonth, PayrollError>;

    async fn calculate_salaries(&self, month: &MonthYear)
        -> Result<CalculationResult, PayrollError>;

    async fn list_payments(&self, month: &MonthYear) -> Result<Vec<Payment>, PayrollError>;

    async fn mark_month_as_paid(
        &self,
        request: &MarkPaidRequest,
    ) -> Result<MarkPaidResult, PayrollError>;

    async fn reset_month_status(&self, request: &ResetMonthRequest) -> Result<(), PayrollError>;

    async fn get_salary_config(
        &self,
        employee_id: &str,
    ) -> Result<Option<SalaryConfiguration>, PayrollError>;

    async fn configure_salary(&self, config: &SalaryConfiguration) -> Result<(), PayrollError>;

    async fn list_employees(&self) -> Result<Vec<Employee>, PayrollError>;

    async fn payment_history(&self) -> Result<Vec<Payment>, PayrollError>;
}

// The backend answers either with the bare payload or with `{ "success": .., "data": .. }`.
#[derive(Deserialize)]
#[serde(untagged)]
enum Envelope<T> {
    Wrapped { data: T },
    Bare(T),
}

impl<T> Envelope<T> {
    fn into_inner(self) -> T {
        match self {
            Envelope::Wrapped { data } => data,
            Envelope::Bare(data) => data,
        }
    }
}

#[derive(Clone)]
pub struct PayrollClient {
    config: Arc<PayrollConfig>,
    http_client: Client,
}

impl PayrollClient {
    pub fn new(config: PayrollConfig) -> Result<Self, PayrollError> {
        Url::parse(&config.api_base_url)?;
        let http_client = Client::builder().timeout(config.request_timeout).build()?;

        Ok(Self {
            config: Arc::new(config),
            http_client,
        })
    }

    pub fn config(&self) -> &PayrollConfig {
        &self.config
    }

    pub fn endpoint_url(&self, endpoint: &str) -> Result<String, PayrollError> {
        let base = self.config.api_base_url.trim_end_matches('/');
        let url = if endpoint.starts_with("http") {
            endpoint.to_string()
        } else if endpoint.starts_with('/') {
            format!("{}{}", base, endpoint)
        } else {
            format!("{}/{}", base, endpoint)
        };
        Url::parse(&url)?;
        Ok(url)
    }

    pub fn build_request(
        &self,
        method: Method,
        endpoint: &str,
    ) -> Result<RequestBuilder, PayrollError> {
        let url = self.endpoint_url(endpoint)?;

        let builder = self
            .http_client
            .request(method, &url)
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json");

        Ok(match &self.config.api_token {
            Some(token) => builder.header(AUTHORIZATION, format!("Bearer {}", token)),
            None => builder,
        })
    }

    pub async fn send_and_deserialize<T: DeserializeOwned>(
        &self,
        request_builder: RequestBuilder,
        context_msg: &str,
    ) -> Result<T, PayrollError> {
        let body = self.send(request_builder, context_msg).await?;
        match serde_json::from_slice::<Envelope<T>>(&body) {
            Ok(envelope) => {
                debug!("Successfully deserialized response for '{}'", context_msg);
                Ok(envelope.into_inner())
            }
            Err(e) => {
                error!("JSON deserialization failed for '{}': {}", context_msg, e);
                Err(PayrollError::Json(e))
            }
        }
    }

    async fn send(
        &self,
        request_builder: RequestBuilder,
        context_msg: &str,
    ) -> Result<Vec<u8>, PayrollError> {
        let request = match request_builder.build() {
            Ok(req) => req,
            Err(e) => {
                error!("Request build failed for '{}': {}", context_msg, e);
                return Err(PayrollError::Request(e));
            }
        };
        let request_url = request.url().to_string();
        debug!("Sending request for '{}' to URL: {}", context_msg, request_url);

        let resp = match self.http_client.execute(request).await {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => {
                warn!("Request for '{}' (URL: {}) timed out", context_msg, request_url);
                return Err(PayrollError::Timeout {
                    operation: context_msg.to_string(),
                });
            }
            Err(e) => {
                // Network, DNS, TLS: nothing came back from the server.
                error!(
                    "HTTP execution failed before receiving response for '{}' (URL: {}): {}",
                    context_msg, request_url, e
                );
                return Err(PayrollError::Request(e));
            }
        };

        let status = resp.status();
        info!(
            "Received response for '{}' (URL: {}): Status={}",
            context_msg, request_url, status
        );

        if status.is_success() {
            let bytes = resp.bytes().await.map_err(|e| {
                if e.is_timeout() {
                    PayrollError::Timeout {
                        operation: context_msg.to_string(),
                    }
                } else {
                    PayrollError::Request(e)
                }
            })?;
            if let Ok(text) = std::str::from_utf8(&bytes) {
                debug!("Raw Success Response Body for '{}': {}", context_msg, text);
            }
            return Ok(bytes.to_vec());
        }

        let error_body = resp
            .text()
            .await
            .unwrap_or_else(|e| format!("Failed to read error body: {}", e));
        error!(
            "API Error Response: Status={}, Body='{}' for URL: {}",
            status, error_body, request_url
        );
        Err(api_error_from_body(status, &error_body))
    }

    async fn get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        context_msg: &str,
    ) -> Result<T, PayrollError> {
        let request = self.build_request(Method::GET, endpoint)?;
        self.send_and_deserialize(request, context_msg).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &B,
        timeout: Option<Duration>,
        context_msg: &str,
    ) -> Result<T, PayrollError> {
        let mut request = self.build_request(Method::POST, endpoint)?.json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        self.send_and_deserialize(request, context_msg).await
    }

    /// POST whose success body carries nothing the caller needs; an empty 2xx (e.g. 204) is fine.
    async fn post_discarding_body<B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &B,
        context_msg: &str,
    ) -> Result<(), PayrollError> {
        let request = self.build_request(Method::POST, endpoint)?.json(body);
        self.send(request, context_msg).await?;
        Ok(())
    }
}

/// Builds `PayrollError::Api`, lifting `message`/`error` out of a JSON body when present.
pub fn api_error_from_body(status: StatusCode, body: &str) -> PayrollError {
    let details = serde_json::from_str::<Value>(body).ok();
    let message = details
        .as_ref()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.get("error"))
                .or_else(|| v.get("detail"))
        })
        .and_then(|m| m.as_str().map(str::to_string))
        .unwrap_or_else(|| body.to_string());
    PayrollError::Api {
        status,
        message,
        details,
    }
}

#[async_trait]
impl PayrollApi for PayrollClient {
    async fn list_pay_months(&self) -> Result<Vec<PayMonth>, PayrollError> {
        self.get("/payroll/pay-months", "List Pay Months").await
    }

    async fn get_pay_month(&self, month: &MonthYear) -> Result<PayMonth, PayrollError> {
        let endpoint = format!("/payroll/pay-months/{}", month);
        let request = self
            .build_request(Method::GET, &endpoint)?
            .header(CACHE_CONTROL, "no-cache")
            .timeout(self.config.status_timeout);
        self.send_and_deserialize(request, "Get Pay Month").await
    }

    async fn create_pay_month(&self, month: &PayMonth) -> Result<PayMonth, PayrollError> {
        self.post("/payroll/pay-months", month, None, "Create Pay Month")
            .await
    }

    async fn calculate_salaries(
        &self,
        month: &MonthYear,
    ) -> Result<CalculationResult, PayrollError> {
        #[derive(Serialize)]
        struct CalculateBody<'a> {
            month_year: &'a MonthYear,
        }

        self.post(
            "/payroll/calculate",
            &CalculateBody { month_year: month },
            Some(self.config.submit_timeout),
            "Calculate Salaries",
        )
        .await
    }

    async fn list_payments(&self, month: &MonthYear) -> Result<Vec<Payment>, PayrollError> {
        let endpoint = format!("/payroll/payments/{}", month);
        self.get(&endpoint, "List Payments").await
    }

    async fn mark_month_as_paid(
        &self,
        request: &MarkPaidRequest,
    ) -> Result<MarkPaidResult, PayrollError> {
        self.post(
            "/payroll/mark-month-as-paid",
            request,
            Some(self.config.submit_timeout),
            "Mark Month As Paid",
        )
        .await
    }

    async fn reset_month_status(&self, request: &ResetMonthRequest) -> Result<(), PayrollError> {
        self.post_discarding_body("/payroll/reset-month-status", request, "Reset Month Status")
            .await
    }

    async fn get_salary_config(
        &self,
        employee_id: &str,
    ) -> Result<Option<SalaryConfiguration>, PayrollError> {
        let endpoint = format!("/payroll/config/{}", employee_id);
        let raw: Value = match self.get(&endpoint, "Get Salary Config").await {
            Ok(raw) => raw,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        salary_config_from_response(raw)
    }

    async fn configure_salary(&self, config: &SalaryConfiguration) -> Result<(), PayrollError> {
        self.post_discarding_body("/payroll/configure", config, "Configure Salary")
            .await
    }

    async fn list_employees(&self) -> Result<Vec<Employee>, PayrollError> {
        self.get("/payroll/employees", "List Employees").await
    }

    async fn payment_history(&self) -> Result<Vec<Payment>, PayrollError> {
        self.get("/payroll/history", "Payment History").await
    }
}

/// Reads the config endpoint's `{exists, data}` answer. Some deployments name the fields
/// `has_config`/`config` or return the record bare.
pub fn salary_config_from_response(raw: Value) -> Result<Option<SalaryConfiguration>, PayrollError> {
    let exists = raw
        .get("exists")
        .or_else(|| raw.get("has_config"))
        .and_then(Value::as_bool);
    if exists == Some(false) {
        return Ok(None);
    }

    let record = raw
        .get("data")
        .or_else(|| raw.get("config"))
        .cloned()
        .unwrap_or(raw);
    if record.is_null() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_value(record)?))
}
