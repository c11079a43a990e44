//! Cluster access boundary.
//!
//! Everything the pipeline needs from the platform goes through
//! [`ClusterApi`]: configmap and secret reads for script and catalog
//! resolution, the approval store's configmap writes, Job submission and
//! watching, and pod/log collection for results. Production uses
//! [`HttpCluster`]; tests use [`FakeCluster`].

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod fake;
pub mod http;
pub mod quantity;
pub mod types;

pub use fake::FakeCluster;
pub use http::HttpCluster;
pub use quantity::{Quantity, QuantityError};
pub use types::*;

/// Buffer size for job watch channels. Watchers that fall behind miss
/// events; the monitor's periodic refetch covers the gap.
pub const WATCH_CHANNEL_CAPACITY: usize = 16;

/// Errors surfaced by cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The named object does not exist.
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        /// Object kind, e.g. `configmap`.
        kind: &'static str,
        /// Namespace looked in.
        namespace: String,
        /// Object name.
        name: String,
    },

    /// An object with this name already exists.
    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        /// Object kind.
        kind: &'static str,
        /// Namespace.
        namespace: String,
        /// Object name.
        name: String,
    },

    /// The platform rejected the request.
    #[error("cluster API error (status {status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Platform error message.
        message: String,
    },

    /// The request never reached the platform.
    #[error("cluster transport error: {0}")]
    Transport(String),

    /// A response body could not be decoded.
    #[error("decode cluster response: {0}")]
    Decode(String),
}

/// One change observed while watching a Job.
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// The Job was created or updated; carries the new state.
    Applied(Job),
    /// The Job was deleted out from under the watch.
    Deleted,
}

/// Narrow client surface over the container-orchestration platform.
///
/// Implementations must be safe for concurrent use; the service shares one
/// client across all in-flight requests.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fetches a configmap.
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap, ClusterError>;

    /// Creates a configmap.
    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, ClusterError>;

    /// Replaces a configmap.
    async fn update_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, ClusterError>;

    /// Fetches a secret.
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, ClusterError>;

    /// Submits a Job.
    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job, ClusterError>;

    /// Fetches a Job.
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Job, ClusterError>;

    /// Opens a change stream for the named Job.
    ///
    /// The stream may drop events under load or end early; callers combine
    /// it with periodic refetch.
    async fn watch_job(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<mpsc::Receiver<JobEvent>, ClusterError>;

    /// Lists pods matching a label selector.
    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Pod>, ClusterError>;

    /// Reads a container's combined log output.
    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<String, ClusterError>;
}
