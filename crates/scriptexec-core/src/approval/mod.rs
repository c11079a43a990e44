//! Durable approval gating.
//!
//! Sensitive steps set `approval_required`; execution is then gated on a
//! persisted approval record keyed by `(execution_id, step_name)`. Records
//! are created pending, mutated to approved or denied by a human through
//! the out-of-band HTTP surface, and expire lazily after a configured
//! interval.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::ClusterError;

mod checker;
mod store;

pub use checker::Checker;
pub use store::{ConfigMapStore, Store};

/// Default interval after which a pending record expires.
pub const DEFAULT_EXPIRY: std::time::Duration = std::time::Duration::from_secs(24 * 60 * 60);

/// Approval record status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Awaiting a human decision.
    Pending,
    /// Cleared for execution.
    Approved,
    /// Refused; the step fails without running.
    Denied,
    /// The decision window passed without action.
    Expired,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Expired => "expired",
        })
    }
}

/// A persisted approval request.
///
/// Carries the full script body and hash so approvers review exactly what
/// will run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Synthetic record id.
    pub id: String,
    /// Execution the step belongs to; half of the logical key.
    pub execution_id: String,
    /// Step name; the other half of the logical key.
    pub step_name: String,
    /// Runbook that issued the step.
    pub runbook_id: String,
    /// User who requested execution.
    pub user: String,
    /// Script body under review.
    pub script: String,
    /// SHA-256 of the script body.
    pub script_hash: String,
    /// Principals allowed to decide.
    pub approvers: Vec<String>,
    /// Current status.
    pub status: Status,
    /// Who approved, once approved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    /// When approved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    /// Who denied, once denied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denied_by: Option<String>,
    /// When denied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denied_at: Option<DateTime<Utc>>,
    /// Free-form denial reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denial_reason: Option<String>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When a pending record lapses to expired.
    pub expires_at: DateTime<Utc>,
}

/// Errors from approval gating and mutation.
#[derive(Debug, Error)]
pub enum ApprovalError {
    /// No record exists for the logical key.
    #[error("approval request not found for {execution_id}/{step_name}")]
    NotFound {
        /// Execution id looked up.
        execution_id: String,
        /// Step name looked up.
        step_name: String,
    },

    /// The record is not pending, so it cannot be decided.
    #[error("cannot decide approval: status is {0}")]
    NotPending(Status),

    /// The acting user is not on the approver list.
    #[error("user {0} is not authorized to decide this request")]
    Unauthorized(String),

    /// A record could not be encoded or decoded.
    #[error("approval record encoding: {0}")]
    Encoding(String),

    /// The backing store failed.
    #[error(transparent)]
    Store(#[from] ClusterError),
}
