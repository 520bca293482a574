// src/history.rs
//
// Payment history. The network is authoritative; the file cache only covers outages.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::cache::JsonFileCache;
use crate::models::{Payment, PaymentStatus};
use crate::payroll_client::PayrollApi;
use crate::workflow::{classify_api_error, WorkflowError};

pub const HISTORY_CACHE_KEY: &str = "payroll_history_cache";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorySnapshot {
    pub timestamp: DateTime<Utc>,
    pub payments: Vec<Payment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistorySource {
    Network,
    Cache {
        cached_at: DateTime<Utc>,
        age: Duration,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryLoad {
    pub payments: Vec<Payment>,
    pub source: HistorySource,
}

impl HistoryLoad {
    pub fn is_stale_copy(&self) -> bool {
        matches!(self.source, HistorySource::Cache { .. })
    }
}

pub struct HistoryService {
    api: Arc<dyn PayrollApi>,
    cache: JsonFileCache,
    ttl: Duration,
}

impl HistoryService {
    pub fn new(api: Arc<dyn PayrollApi>, cache: JsonFileCache, ttl: Duration) -> Self {
        Self { api, cache, ttl }
    }

    /// Fetches the history and refreshes the cache. When the fetch fails, a cached copy
    /// younger than the TTL is served instead; otherwise the fetch error is returned.
    pub async fn load(&self) -> Result<HistoryLoad, WorkflowError> {
        match self.api.payment_history().await {
            Ok(payments) => {
                let snapshot = HistorySnapshot {
                    timestamp: Utc::now(),
                    payments,
                };
                if let Err(e) = self.cache.put(HISTORY_CACHE_KEY, &snapshot, self.ttl) {
                    warn!("Failed to cache payment history: {}", e);
                }
                info!("Loaded {} payment records", snapshot.payments.len());
                Ok(HistoryLoad {
                    payments: snapshot.payments,
                    source: HistorySource::Network,
                })
            }
            Err(fetch_err) => {
                warn!("Payment history fetch failed: {}. Trying cache.", fetch_err);
                let cached = match self.cache.get::<HistorySnapshot>(HISTORY_CACHE_KEY) {
                    Ok(cached) => cached,
                    Err(cache_err) => {
                        error!("Reading history cache failed: {}", cache_err);
                        None
                    }
                };
                match cached {
                    Some(entry) => {
                        let age = Utc::now() - entry.value.timestamp;
                        info!(
                            "Serving {} cached payment records from {}",
                            entry.value.payments.len(),
                            entry.value.timestamp
                        );
                        Ok(HistoryLoad {
                            payments: entry.value.payments,
                            source: HistorySource::Cache {
                                cached_at: entry.value.timestamp,
                                age,
                            },
                        })
                    }
                    None => Err(classify_api_error(fetch_err)),
                }
            }
        }
    }

    pub fn invalidate(&self) -> Result<(), WorkflowError> {
        self.cache
            .invalidate(HISTORY_CACHE_KEY)
            .map_err(WorkflowError::Api)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryFilter {
    pub month_year: Option<String>,
    pub employee_id: Option<String>,
    pub status: Option<PaymentStatus>,
    /// Case-insensitive match against the employee's display name.
    pub search: Option<String>,
}

impl HistoryFilter {
    pub fn matches(&self, payment: &Payment) -> bool {
        if let Some(month) = &self.month_year {
            if &payment.month_year != month {
                return false;
            }
        }
        if let Some(employee_id) = &self.employee_id {
            if &payment.employee_id != employee_id {
                return false;
            }
        }
        if let Some(status) = self.status {
            if payment.payment_status != status {
                return false;
            }
        }
        if let Some(search) = self.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            let needle = search.to_lowercase();
            if !payment.display_name().to_lowercase().contains(&needle) {
                return false;
            }
        }
        true
    }

    pub fn apply<'a>(&self, payments: &'a [Payment]) -> Vec<&'a Payment> {
        payments.iter().filter(|p| self.matches(p)).collect()
    }
}

/// Most recent month first; within a month, by employee name.
pub fn sort_newest_first(payments: &mut [Payment]) {
    payments.sort_by_cached_key(|p| (Reverse(p.month_year.clone()), p.display_name().to_lowercase()));
}
