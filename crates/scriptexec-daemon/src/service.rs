//! Executor service facade.
//!
//! The four operations the remote-procedure transport mounts. The wire
//! schema itself lives with the transport; this facade works in the core's
//! native types.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use scriptexec_core::execution::{ExecStatus, ExecuteRequest, ExecuteResponse, Manager};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::metrics::ExecutorMetrics;

/// Executor name reported by `describe`.
pub const SERVICE_NAME: &str = "script";

/// Step type this executor serves.
pub const STEP_TYPE: &str = "script.run";

/// Service version reported by `describe` and `health`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Errors the facade surfaces to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The request names a step type this executor does not implement.
    #[error("unknown step type: {0}")]
    UnsupportedStepType(String),
}

/// Stage of a streaming execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    /// Validation and preparation.
    Starting,
    /// The workload is running.
    Running,
    /// Terminal; the event carries the response.
    Done,
}

/// One progress event of a streaming execution.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    /// Current stage.
    pub stage: ProgressStage,
    /// Monotonically non-decreasing completion percentage.
    pub percent_complete: u8,
    /// Human-readable progress message.
    pub message: String,
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
    /// The terminal response; only on the final event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<ExecuteResponse>,
}

impl ProgressEvent {
    fn new(stage: ProgressStage, percent_complete: u8, message: impl Into<String>) -> Self {
        Self {
            stage,
            percent_complete,
            message: message.into(),
            timestamp: Utc::now(),
            response: None,
        }
    }
}

/// Capability descriptor returned by `describe`.
#[derive(Debug, Clone, Serialize)]
pub struct Capabilities {
    /// Executor name.
    pub name: &'static str,
    /// Executor version.
    pub version: &'static str,
    /// Step types served.
    pub step_types: Vec<StepTypeCapability>,
}

/// One step type's capability entry.
#[derive(Debug, Clone, Serialize)]
pub struct StepTypeCapability {
    /// Step type discriminator.
    pub step_type: &'static str,
    /// Whether `execute_stream` is supported.
    pub supports_streaming: bool,
    /// Typical wall-clock duration.
    #[serde(with = "humantime_serde")]
    pub typical_duration: Duration,
    /// Human description.
    pub description: &'static str,
    /// Recognized optional parameter keys.
    pub optional_parameters: Vec<&'static str>,
}

/// Serving state reported by `health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// `serving` while the facade accepts requests.
    pub status: &'static str,
    /// When the status was sampled.
    pub timestamp: DateTime<Utc>,
    /// Executor version.
    pub version: &'static str,
    /// Count of audit records that could not be written.
    pub audit_write_failures: u64,
}

/// The executor service.
pub struct ExecutorService {
    manager: Arc<Manager>,
    metrics: Arc<ExecutorMetrics>,
    audit_failures: Arc<dyn Fn() -> u64 + Send + Sync>,
}

impl ExecutorService {
    /// Creates the facade over a pipeline manager.
    pub fn new(manager: Arc<Manager>, metrics: Arc<ExecutorMetrics>) -> Self {
        Self {
            manager,
            metrics,
            audit_failures: Arc::new(|| 0),
        }
    }

    /// Installs an audit-failure gauge source for `health`.
    #[must_use]
    pub fn with_audit_failures(
        mut self,
        source: impl Fn() -> u64 + Send + Sync + 'static,
    ) -> Self {
        self.audit_failures = Arc::new(source);
        self
    }

    /// Runs one step to a terminal response.
    pub async fn execute(
        &self,
        request: ExecuteRequest,
        cancel: CancellationToken,
    ) -> Result<ExecuteResponse, ServiceError> {
        if request.step_type != STEP_TYPE {
            return Err(ServiceError::UnsupportedStepType(request.step_type));
        }
        let started = std::time::Instant::now();
        let response = self.manager.execute(&request, cancel).await;
        self.metrics.observe_execution(&response, started.elapsed());
        Ok(response)
    }

    /// Runs one step, emitting progress events.
    ///
    /// Emits *starting*, *running*, and *done* with non-decreasing
    /// percentages; the final event carries the same response `execute`
    /// would return.
    pub fn execute_stream(
        &self,
        request: ExecuteRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ProgressEvent>, ServiceError> {
        if request.step_type != STEP_TYPE {
            return Err(ServiceError::UnsupportedStepType(request.step_type));
        }

        let (tx, rx) = mpsc::channel(4);
        let manager = Arc::clone(&self.manager);
        let metrics = Arc::clone(&self.metrics);
        tokio::spawn(async move {
            let _ = tx
                .send(ProgressEvent::new(
                    ProgressStage::Starting,
                    0,
                    "Validating and preparing script execution...",
                ))
                .await;

            let started = std::time::Instant::now();
            let response = manager.execute(&request, cancel).await;
            metrics.observe_execution(&response, started.elapsed());

            let _ = tx
                .send(ProgressEvent::new(
                    ProgressStage::Running,
                    50,
                    "Script execution in progress...",
                ))
                .await;

            let status = match response.status {
                ExecStatus::Succeeded => "succeeded",
                ExecStatus::Failed => "failed",
                ExecStatus::Pending => "pending",
            };
            let mut done = ProgressEvent::new(
                ProgressStage::Done,
                100,
                format!("Execution completed with status {status}"),
            );
            done.response = Some(response);
            let _ = tx.send(done).await;
        });
        Ok(rx)
    }

    /// Describes this executor's capabilities.
    #[must_use]
    pub fn describe(&self) -> Capabilities {
        Capabilities {
            name: SERVICE_NAME,
            version: VERSION,
            step_types: vec![StepTypeCapability {
                step_type: STEP_TYPE,
                supports_streaming: true,
                typical_duration: Duration::from_secs(5 * 60),
                description: "Execute shell, Python, or Ruby scripts in a secure cluster Job",
                optional_parameters: vec![
                    "inline_script",
                    "script_from_configmap",
                    "script_from_secret",
                    "script_path",
                    "script_id",
                    "image",
                    "image_ref",
                    "image_pull_policy",
                    "image_pull_secret",
                    "interpreter",
                    "args",
                    "working_dir",
                    "timeout",
                    "stdin",
                    "env",
                    "env_from_secret",
                    "env_from_configmap",
                    "secret_env_all",
                    "configmap_env_all",
                    "volumes_from_secret",
                    "volumes_from_configmap",
                    "node_selector",
                    "tolerations",
                    "affinity",
                    "priority_class_name",
                    "resources",
                    "approval_required",
                    "approvers",
                    "ttl_seconds_after_finished",
                    "backoff_limit",
                    "labels",
                    "annotations",
                ],
            }],
        }
    }

    /// Reports serving status.
    #[must_use]
    pub fn health(&self) -> HealthStatus {
        HealthStatus {
            status: "serving",
            timestamp: Utc::now(),
            version: VERSION,
            audit_write_failures: (self.audit_failures)(),
        }
    }
}
