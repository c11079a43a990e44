//! Request and response shapes for one step execution.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Step type this executor implements.
pub const STEP_TYPE_SCRIPT_RUN: &str = "script.run";

/// Identifiers the runbook orchestrator propagates with a step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepContext {
    /// Execution the step belongs to.
    pub execution_id: String,
    /// Runbook that issued the step.
    pub runbook_id: String,
    /// Requesting user.
    pub user: String,
    /// Step name within the runbook.
    pub step_name: String,
}

/// One step execution request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExecuteRequest {
    /// Step type discriminator; must be [`STEP_TYPE_SCRIPT_RUN`].
    pub step_type: String,
    /// Propagated identifiers.
    pub context: StepContext,
    /// The open parameter bag.
    pub parameters: serde_json::Value,
    /// Caller timeout override.
    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,
}

/// Terminal disposition of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecStatus {
    /// The workload ran and exited zero.
    Succeeded,
    /// Validation failed, approval was denied, or the workload failed.
    Failed,
    /// Awaiting approval; retry after the out-of-band decision.
    Pending,
}

/// Captured results of a workload run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    /// Container exit code.
    pub exit_code: i32,
    /// Combined captured output, stdout and stderr merged as the platform
    /// delivers them.
    pub output: String,
    /// Wall-clock duration of the workload in seconds.
    pub duration_seconds: f64,
    /// SHA-256 of the script body; empty for path-mode runs.
    pub script_hash: String,
    /// Workload name.
    pub job_name: String,
    /// Pod name.
    pub pod_name: String,
}

/// Response for one step execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    /// Terminal disposition.
    pub status: ExecStatus,
    /// Workload results, populated whenever a workload ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<ExecutionOutput>,
    /// Human-readable failure or pending reason; absent on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock time this executor spent handling the request.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}
