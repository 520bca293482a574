// src/audit.rs
//
// Recalculating a month that is already `paid` rewrites historical payment amounts while the
// month keeps its `paid` status. Every such run leaves a record here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use tracing::info;

use crate::models::{MonthStatus, MonthYear};
use crate::payroll_client::{io_context, PayrollError};

pub const AUDIT_FILE_NAME: &str = "recalculation_audit.jsonl";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecalculationAuditEntry {
    pub month_year: MonthYear,
    pub previous_status: MonthStatus,
    pub operator: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub calculated: u32,
    pub failed: u32,
    pub partial: bool,
}

pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &RecalculationAuditEntry) -> Result<(), PayrollError>;
}

/// Appends one JSON object per line.
#[derive(Debug, Clone)]
pub struct FileAuditSink {
    path: PathBuf,
}

impl FileAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self::new(dir.into().join(AUDIT_FILE_NAME))
    }

    pub fn read_all(&self) -> Result<Vec<RecalculationAuditEntry>, PayrollError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)
            .map_err(|e| io_context(e, format!("Failed to read audit log: {:?}", self.path)))?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(PayrollError::from))
            .collect()
    }
}

impl AuditSink for FileAuditSink {
    fn record(&self, entry: &RecalculationAuditEntry) -> Result<(), PayrollError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                io_context(e, format!("Failed to create directory for audit log: {:?}", parent))
            })?;
        }
        let line = serde_json::to_string(entry)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| io_context(e, format!("Failed to open audit log: {:?}", self.path)))?;
        writeln!(file, "{}", line)
            .map_err(|e| io_context(e, format!("Failed to append to audit log: {:?}", self.path)))?;

        info!(
            "Recorded recalculation of {} month {} in audit log",
            entry.previous_status, entry.month_year
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<RecalculationAuditEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<RecalculationAuditEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, entry: &RecalculationAuditEntry) -> Result<(), PayrollError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());
        Ok(())
    }
}
