//! Watching a submitted workload to its terminal state.
//!
//! The monitor combines the platform's change stream with a two-second
//! periodic refetch that covers missed or dropped events. An outer deadline
//! of the resolved timeout plus a grace period bounds the wait; on timeout
//! the workload is left for the platform's TTL cleanup, never deleted here.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cluster::types::{Job, Pod};
use crate::cluster::{ClusterApi, ClusterError, JobEvent};

use super::workload::SCRIPT_CONTAINER_NAME;

/// Refetch period covering missed watch events.
const REFETCH_INTERVAL: Duration = Duration::from_secs(2);

/// Grace added on top of the workload's own deadline before the monitor
/// gives up waiting.
const DEADLINE_GRACE: Duration = Duration::from_secs(30);

/// Errors from waiting on a workload.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// The workload was deleted while the monitor was waiting.
    #[error("workload {0} was deleted while waiting")]
    WorkloadDeleted(String),

    /// The outer deadline elapsed before the workload went terminal.
    #[error("workload {name} timed out after {waited:?}")]
    Timeout {
        /// Workload name.
        name: String,
        /// The bound that elapsed.
        waited: Duration,
    },

    /// The caller cancelled the request.
    #[error("execution cancelled")]
    Cancelled,

    /// The cluster API failed mid-wait.
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// Collected results of a terminal workload.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    /// Whether the workload completed successfully.
    pub succeeded: bool,
    /// Container exit code.
    pub exit_code: i32,
    /// Combined captured output.
    pub output: String,
    /// Wall-clock duration from pod start to the latest container finish.
    pub duration: Duration,
    /// Workload name.
    pub job_name: String,
    /// Pod name.
    pub pod_name: String,
}

/// Waits on submitted workloads and collects their results.
pub struct Monitor {
    cluster: Arc<dyn ClusterApi>,
    namespace: String,
}

impl Monitor {
    /// Creates a monitor for the executor namespace.
    pub fn new(cluster: Arc<dyn ClusterApi>, namespace: impl Into<String>) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
        }
    }

    /// Waits for the named workload to reach a terminal state.
    ///
    /// `timeout` is the workload's resolved timeout; the monitor waits that
    /// long plus a grace period, then surfaces [`MonitorError::Timeout`].
    /// Cancellation aborts the wait promptly.
    pub async fn wait(
        &self,
        job_name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, MonitorError> {
        let bound = timeout + DEADLINE_GRACE;
        let deadline = tokio::time::sleep(bound);
        tokio::pin!(deadline);

        let mut watch = self.cluster.watch_job(&self.namespace, job_name).await?;
        let mut refetch = tokio::time::interval(REFETCH_INTERVAL);
        refetch.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; spend it before the loop.
        refetch.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Err(MonitorError::Cancelled),

                () = &mut deadline => {
                    return Err(MonitorError::Timeout {
                        name: job_name.to_string(),
                        waited: bound,
                    });
                }

                event = watch.recv() => match event {
                    Some(JobEvent::Deleted) => {
                        return Err(MonitorError::WorkloadDeleted(job_name.to_string()));
                    }
                    Some(JobEvent::Applied(job)) => {
                        if job.is_complete() || job.is_failed() {
                            return self.collect(&job).await;
                        }
                    }
                    None => {
                        // Stream ended; reopen it and let the refetch cover
                        // the gap.
                        debug!(job = job_name, "job watch closed, reopening");
                        watch = self.cluster.watch_job(&self.namespace, job_name).await?;
                    }
                },

                _ = refetch.tick() => {
                    match self.cluster.get_job(&self.namespace, job_name).await {
                        Ok(job) if job.is_complete() || job.is_failed() => {
                            return self.collect(&job).await;
                        }
                        Ok(_) => {}
                        Err(ClusterError::NotFound { .. }) => {
                            return Err(MonitorError::WorkloadDeleted(job_name.to_string()));
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
            }
        }
    }

    /// Collects exit code, duration, and captured output for a terminal
    /// workload.
    async fn collect(&self, job: &Job) -> Result<ExecutionResult, MonitorError> {
        let mut result = ExecutionResult {
            succeeded: job.is_complete(),
            job_name: job.metadata.name.clone(),
            ..ExecutionResult::default()
        };

        let pods = self
            .cluster
            .list_pods(&self.namespace, &format!("job-name={}", job.metadata.name))
            .await?;
        let Some(pod) = pods.first() else {
            return Ok(result);
        };
        result.pod_name = pod.metadata.name.clone();
        result.duration = pod_duration(pod);
        result.exit_code = pod
            .status
            .container_statuses
            .iter()
            .find_map(|status| status.state.terminated.as_ref())
            .map_or(0, |terminated| terminated.exit_code);

        // The platform merges stdout and stderr at this interface. Log
        // fetch failures degrade to empty output rather than failing a
        // finished execution.
        match self
            .cluster
            .pod_logs(&self.namespace, &pod.metadata.name, SCRIPT_CONTAINER_NAME)
            .await
        {
            Ok(output) => result.output = output,
            Err(err) => debug!(pod = %pod.metadata.name, error = %err, "log fetch failed"),
        }

        Ok(result)
    }
}

/// Pod start to the latest container-terminated finish.
fn pod_duration(pod: &Pod) -> Duration {
    let Some(started) = pod.status.start_time else {
        return Duration::ZERO;
    };
    let finished = pod
        .status
        .container_statuses
        .iter()
        .filter_map(|status| status.state.terminated.as_ref())
        .filter_map(|terminated| terminated.finished_at)
        .max();
    match finished {
        Some(finished) => (finished - started).to_std().unwrap_or(Duration::ZERO),
        None => Duration::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::cluster::types::{Job, ObjectMeta};
    use crate::cluster::FakeCluster;

    use super::*;

    const NS: &str = "opscontrolroom-system";

    fn job(name: &str) -> Job {
        Job {
            metadata: ObjectMeta {
                name: name.into(),
                namespace: NS.into(),
                ..ObjectMeta::default()
            },
            ..Job::default()
        }
    }

    #[tokio::test]
    async fn collects_result_on_completion() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.create_job(NS, &job("script-exec-1")).await.unwrap();
        let monitor = Monitor::new(cluster.clone(), NS);

        let waiter = tokio::spawn({
            let cluster = cluster.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cluster.complete_job(NS, "script-exec-1", 0, "all good\n");
            }
        });

        let result = monitor
            .wait("script-exec-1", Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        waiter.await.unwrap();

        assert!(result.succeeded);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.output, "all good\n");
        assert_eq!(result.job_name, "script-exec-1");
        assert!(!result.pod_name.is_empty());
        assert!(result.duration > Duration::ZERO);
    }

    #[tokio::test]
    async fn failure_carries_exit_code() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.create_job(NS, &job("script-exec-2")).await.unwrap();
        cluster.fail_job(NS, "script-exec-2", 3, "boom\n");
        let monitor = Monitor::new(cluster, NS);

        let result = monitor
            .wait("script-exec-2", Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.succeeded);
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.output, "boom\n");
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_surfaces_timeout() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.create_job(NS, &job("script-exec-3")).await.unwrap();
        let monitor = Monitor::new(cluster, NS);

        let err = monitor
            .wait("script-exec-3", Duration::from_secs(2), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::Timeout { .. }));
    }

    #[tokio::test]
    async fn cancellation_aborts_promptly() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.create_job(NS, &job("script-exec-4")).await.unwrap();
        let monitor = Monitor::new(cluster, NS);

        let cancel = CancellationToken::new();
        let child = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            child.cancel();
        });

        let err = monitor
            .wait("script-exec-4", Duration::from_secs(300), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::Cancelled));
    }

    #[tokio::test]
    async fn deletion_mid_wait_aborts() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.create_job(NS, &job("script-exec-5")).await.unwrap();
        let monitor = Monitor::new(cluster.clone(), NS);

        tokio::spawn({
            let cluster = cluster.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                cluster.delete_job(NS, "script-exec-5");
            }
        });

        let err = monitor
            .wait("script-exec-5", Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::WorkloadDeleted(_)));
    }
}
