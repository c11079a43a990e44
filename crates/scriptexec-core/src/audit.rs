//! Audit sink.
//!
//! A write-only append surface with no backpressure. Every terminal
//! transition of an execution — success, failure, denial, pending
//! short-circuit — produces one record. A failing sink never fails the
//! execution; failures are counted and logged so health surfaces can see
//! them.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::script::ScriptSource;

/// One audit record.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    /// Record kind; always `script_execution`.
    pub event: &'static str,
    /// Execution id.
    pub execution_id: String,
    /// Requesting user.
    pub user: String,
    /// Runbook id.
    pub runbook_id: String,
    /// SHA-256 of the script body; empty for path-mode runs.
    pub script_hash: String,
    /// Script source kind.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script_source: Option<String>,
    /// `name/key` (or path) of the backing object, when there is one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script_ref: Option<String>,
    /// Terminal outcome: `succeeded`, `failed`, `denied`, or `pending`.
    pub outcome: String,
    /// Wall-clock duration in seconds, when a workload ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    /// Exit code, when a workload ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// When the record was emitted.
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    /// Starts a record for one execution's terminal transition.
    #[must_use]
    pub fn new(execution_id: &str, user: &str, runbook_id: &str, outcome: &str) -> Self {
        Self {
            event: "script_execution",
            execution_id: execution_id.to_string(),
            user: user.to_string(),
            runbook_id: runbook_id.to_string(),
            script_hash: String::new(),
            script_source: None,
            script_ref: None,
            outcome: outcome.to_string(),
            duration_seconds: None,
            exit_code: None,
            timestamp: Utc::now(),
        }
    }

    /// Attaches source attribution.
    #[must_use]
    pub fn with_source(mut self, source: &ScriptSource) -> Self {
        self.script_source = Some(source.kind().to_string());
        self.script_ref = source.reference();
        self
    }
}

/// Write-only audit surface.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Appends one record. Implementations swallow their own failures.
    async fn emit(&self, record: &AuditRecord);

    /// Count of records that could not be written.
    fn write_failures(&self) -> u64 {
        0
    }
}

/// Sink that drops every record; used when audit is disabled.
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait]
impl AuditSink for NullSink {
    async fn emit(&self, _record: &AuditRecord) {}
}

/// JSONL file sink, one record per line.
pub struct JsonlSink {
    file: Mutex<File>,
    write_failures: AtomicU64,
}

impl JsonlSink {
    /// Opens (or creates) the audit file for appending.
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            file: Mutex::new(file),
            write_failures: AtomicU64::new(0),
        })
    }

    async fn write_line(&self, record: &AuditRecord) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await
    }
}

#[async_trait]
impl AuditSink for JsonlSink {
    async fn emit(&self, record: &AuditRecord) {
        if let Err(err) = self.write_line(record).await {
            self.write_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                execution_id = %record.execution_id,
                error = %err,
                "audit write failed"
            );
        }
    }

    fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }
}
