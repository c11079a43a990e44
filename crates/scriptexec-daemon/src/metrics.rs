//! Prometheus metrics for the executor.
//!
//! Three families, labelled by terminal status: an executions counter, an
//! execution-duration histogram, and an approvals counter driven by the
//! HTTP surface.

use std::sync::Arc;
use std::time::Duration;

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use scriptexec_core::execution::{ExecStatus, ExecuteResponse};
use thiserror::Error;

/// Errors from metrics registration or encoding.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// The underlying metrics library rejected an operation.
    #[error("metrics error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

/// Executor metric families.
pub struct ExecutorMetrics {
    executions_total: CounterVec,
    execution_duration_seconds: HistogramVec,
    approvals_total: CounterVec,
}

impl ExecutorMetrics {
    fn register(registry: &Registry) -> Result<Self, MetricsError> {
        let executions_total = CounterVec::new(
            Opts::new(
                "script_executor_executions_total",
                "Total number of script executions",
            ),
            &["status"],
        )?;
        let execution_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "script_executor_execution_duration_seconds",
                "Script execution duration in seconds",
            )
            .buckets(prometheus::exponential_buckets(1.0, 2.0, 12)?),
            &["status"],
        )?;
        let approvals_total = CounterVec::new(
            Opts::new("script_executor_approvals_total", "Total approval decisions"),
            &["status"],
        )?;

        registry.register(Box::new(executions_total.clone()))?;
        registry.register(Box::new(execution_duration_seconds.clone()))?;
        registry.register(Box::new(approvals_total.clone()))?;

        Ok(Self {
            executions_total,
            execution_duration_seconds,
            approvals_total,
        })
    }

    /// Records one terminal execution.
    pub fn observe_execution(&self, response: &ExecuteResponse, elapsed: Duration) {
        let status = match response.status {
            ExecStatus::Succeeded => "succeeded",
            ExecStatus::Failed => "failed",
            ExecStatus::Pending => "pending",
        };
        self.executions_total.with_label_values(&[status]).inc();
        self.execution_duration_seconds
            .with_label_values(&[status])
            .observe(elapsed.as_secs_f64());
    }

    /// Records one approval decision (`approved` or `denied`).
    pub fn observe_approval(&self, status: &str) {
        self.approvals_total.with_label_values(&[status]).inc();
    }
}

/// Registry wrapper owning the executor metric families.
pub struct MetricsRegistry {
    registry: Registry,
    executor: Arc<ExecutorMetrics>,
}

impl MetricsRegistry {
    /// Creates a registry with the executor families registered.
    ///
    /// Registration on a fresh registry only fails on duplicate metric
    /// names, which would be a programming error here.
    pub fn try_new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let executor = Arc::new(ExecutorMetrics::register(&registry)?);
        Ok(Self { registry, executor })
    }

    /// The executor metric families.
    #[must_use]
    pub fn executor_metrics(&self) -> Arc<ExecutorMetrics> {
        Arc::clone(&self.executor)
    }

    /// Encodes all families in the Prometheus text format.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
