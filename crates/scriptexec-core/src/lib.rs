//! # scriptexec-core
//!
//! Execution pipeline for the OpsControlRoom script executor: runs
//! operator-supplied shell, Python, or Ruby scripts inside isolated
//! single-shot cluster Jobs.
//!
//! Given one step request the pipeline:
//!
//! 1. resolves the script body from one of five sources and validates it,
//! 2. resolves and validates the container image,
//! 3. optionally gates execution behind a durable approval record,
//! 4. materializes a Job manifest with strict security, scheduling, and
//!    resource constraints,
//! 5. watches the Job to a terminal state and collects exit code, captured
//!    output, and duration,
//! 6. emits an audit record for the terminal outcome.
//!
//! The cluster itself is reached through the [`cluster::ClusterApi`] trait;
//! [`cluster::FakeCluster`] backs the test suites and
//! [`cluster::HttpCluster`] speaks the platform REST API in production.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use scriptexec_core::cluster::FakeCluster;
//! use scriptexec_core::config::ExecutorConfig;
//! use scriptexec_core::execution::{ExecuteRequest, Manager, StepContext};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() {
//! let cluster = Arc::new(FakeCluster::new());
//! let manager = Manager::new(ExecutorConfig::default(), cluster);
//!
//! let request = ExecuteRequest {
//!     step_type: "script.run".into(),
//!     context: StepContext {
//!         execution_id: "exec-42".into(),
//!         runbook_id: "rb-7".into(),
//!         user: "alice@example.com".into(),
//!         step_name: "disk-report".into(),
//!     },
//!     parameters: serde_json::json!({
//!         "inline_script": "df -h",
//!         "image": "alpine:3.20",
//!     }),
//!     timeout: None,
//! };
//!
//! let response = manager.execute(&request, CancellationToken::new()).await;
//! println!("{:?}", response.status);
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod approval;
pub mod audit;
pub mod cluster;
pub mod config;
pub mod execution;
pub mod image;
pub mod params;
pub mod script;
pub mod security;

pub use config::ExecutorConfig;
pub use execution::{ExecStatus, ExecuteRequest, ExecuteResponse, Manager};
