//! # scriptexec-daemon
//!
//! Hosting layer for the script executor: the service facade the RPC
//! transport mounts (`execute`, `execute_stream`, `describe`, `health`),
//! the human-facing approval HTTP surface, and Prometheus metrics.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod metrics;
pub mod service;

pub use service::ExecutorService;
