//! The execution pipeline.
//!
//! [`Manager`] wires the stages together: parameter extraction, script
//! loading and validation, image resolution and validation, the approval
//! gate, workload construction, submission, monitoring, and the audit
//! record. Stages run in strict sequence within a request; concurrent
//! requests share only the cluster client, the catalog, and the approval
//! store.

use thiserror::Error;

use crate::approval::ApprovalError;
use crate::cluster::ClusterError;
use crate::image::ImageError;
use crate::params::ParamError;
use crate::script::ScriptError;
use crate::security::ValidationError;

mod context;
mod manager;
mod monitor;
mod types;
mod workload;

pub use context::{ExecutionContext, KeyRef, VolumeRequest, build_context};
pub use manager::Manager;
pub use monitor::{ExecutionResult, Monitor, MonitorError};
pub use types::{ExecStatus, ExecuteRequest, ExecuteResponse, ExecutionOutput, StepContext};
pub use workload::WorkloadBuilder;

/// Everything that can end an execution before (or instead of) a clean
/// workload result.
#[derive(Debug, Error)]
pub enum ExecuteError {
    /// The step type discriminator is not `script.run`.
    #[error("unknown step type: {0}")]
    UnsupportedStepType(String),

    /// Script resolution failed.
    #[error(transparent)]
    Script(#[from] ScriptError),

    /// Script content validation failed.
    #[error("script validation: {0}")]
    Validation(#[from] ValidationError),

    /// Image resolution or validation failed.
    #[error("resolve image: {0}")]
    Image(#[from] ImageError),

    /// A parameter was present but unusable.
    #[error(transparent)]
    Param(#[from] ParamError),

    /// The approval store failed.
    #[error(transparent)]
    Approval(#[from] ApprovalError),

    /// A human denied the execution.
    #[error("execution was denied")]
    Denied,

    /// Workload submission was rejected.
    #[error("create workload: {0}")]
    Submit(#[source] ClusterError),

    /// Waiting for the workload failed.
    #[error(transparent)]
    Monitor(#[from] MonitorError),
}
