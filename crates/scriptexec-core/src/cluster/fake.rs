//! In-memory cluster for tests.
//!
//! Mirrors the semantics the pipeline relies on: name-keyed objects,
//! `AlreadyExists` on duplicate Job submission, watch channels notified on
//! job transitions, and pods labelled `job-name` for result collection.
//! Test hooks (`complete_job`, `fail_job`, `delete_job`, auto-completion)
//! stand in for the platform's controllers.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::mpsc;

use super::types::{
    ConfigMap, ContainerState, ContainerStateTerminated, ContainerStatus, Job, JobCondition,
    ObjectMeta, Pod, PodStatus, Secret,
};
use super::{ClusterApi, ClusterError, JobEvent, WATCH_CHANNEL_CAPACITY};

/// Terminal outcome applied to every submitted Job when auto-completion is
/// enabled.
#[derive(Debug, Clone)]
pub struct AutoOutcome {
    /// Whether the Job succeeds.
    pub succeed: bool,
    /// Exit code recorded on the pod.
    pub exit_code: i32,
    /// Combined log output.
    pub logs: String,
    /// Simulated wall-clock duration in seconds.
    pub duration_secs: i64,
}

impl AutoOutcome {
    /// A zero-exit success with the given log output.
    #[must_use]
    pub fn success(logs: &str) -> Self {
        Self {
            succeed: true,
            exit_code: 0,
            logs: logs.to_string(),
            duration_secs: 1,
        }
    }

    /// A failure with the given exit code and log output.
    #[must_use]
    pub fn failure(exit_code: i32, logs: &str) -> Self {
        Self {
            succeed: false,
            exit_code,
            logs: logs.to_string(),
            duration_secs: 1,
        }
    }
}

#[derive(Default)]
struct State {
    config_maps: HashMap<(String, String), ConfigMap>,
    secrets: HashMap<(String, String), Secret>,
    jobs: HashMap<(String, String), Job>,
    pods: HashMap<String, Vec<Pod>>,
    logs: HashMap<(String, String), String>,
    watchers: HashMap<(String, String), Vec<mpsc::Sender<JobEvent>>>,
    auto_outcome: Option<AutoOutcome>,
}

/// In-memory [`ClusterApi`] implementation.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    /// Creates an empty fake cluster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequently submitted Job reach the given terminal
    /// state immediately.
    pub fn set_auto_outcome(&self, outcome: AutoOutcome) {
        self.lock().auto_outcome = Some(outcome);
    }

    /// Seeds a configmap.
    pub fn insert_config_map(&self, config_map: ConfigMap) {
        let key = (
            config_map.metadata.namespace.clone(),
            config_map.metadata.name.clone(),
        );
        self.lock().config_maps.insert(key, config_map);
    }

    /// Seeds a secret.
    pub fn insert_secret(&self, secret: Secret) {
        let key = (
            secret.metadata.namespace.clone(),
            secret.metadata.name.clone(),
        );
        self.lock().secrets.insert(key, secret);
    }

    /// Returns a stored Job, if present.
    #[must_use]
    pub fn job(&self, namespace: &str, name: &str) -> Option<Job> {
        self.lock()
            .jobs
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Returns a stored configmap, if present.
    #[must_use]
    pub fn config_map(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        self.lock()
            .config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Marks a Job complete, creates its pod, and notifies watchers.
    pub fn complete_job(&self, namespace: &str, name: &str, exit_code: i32, logs: &str) {
        self.finish_job(namespace, name, true, exit_code, logs, 1);
    }

    /// Marks a Job failed, creates its pod, and notifies watchers.
    pub fn fail_job(&self, namespace: &str, name: &str, exit_code: i32, logs: &str) {
        self.finish_job(namespace, name, false, exit_code, logs, 1);
    }

    /// Removes a Job and notifies watchers of the deletion.
    pub fn delete_job(&self, namespace: &str, name: &str) {
        let mut state = self.lock();
        let key = (namespace.to_string(), name.to_string());
        state.jobs.remove(&key);
        notify(&mut state, &key, JobEvent::Deleted);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn finish_job(
        &self,
        namespace: &str,
        name: &str,
        succeed: bool,
        exit_code: i32,
        logs: &str,
        duration_secs: i64,
    ) {
        let mut state = self.lock();
        let key = (namespace.to_string(), name.to_string());
        let Some(job) = state.jobs.get_mut(&key) else {
            return;
        };

        if succeed {
            job.status.succeeded = 1;
            job.status.conditions.push(JobCondition {
                condition_type: "Complete".into(),
                status: "True".into(),
            });
        } else {
            job.status.failed = 1;
            job.status.conditions.push(JobCondition {
                condition_type: "Failed".into(),
                status: "True".into(),
            });
        }
        let updated = job.clone();

        let pod_name = format!("{name}-pod");
        let finished = Utc::now();
        let started = finished - ChronoDuration::seconds(duration_secs);
        let pod = Pod {
            metadata: ObjectMeta {
                name: pod_name.clone(),
                namespace: namespace.to_string(),
                labels: [("job-name".to_string(), name.to_string())].into(),
                ..ObjectMeta::default()
            },
            status: PodStatus {
                start_time: Some(started),
                container_statuses: vec![ContainerStatus {
                    name: "script".into(),
                    state: ContainerState {
                        terminated: Some(ContainerStateTerminated {
                            exit_code,
                            finished_at: Some(finished),
                        }),
                    },
                }],
            },
        };
        state
            .pods
            .entry(namespace.to_string())
            .or_default()
            .push(pod);
        state
            .logs
            .insert((namespace.to_string(), pod_name), logs.to_string());

        notify(&mut state, &key, JobEvent::Applied(updated));
    }
}

fn notify(state: &mut State, key: &(String, String), event: JobEvent) {
    if let Some(senders) = state.watchers.get_mut(key) {
        senders.retain(|tx| tx.try_send(event.clone()).is_ok());
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap, ClusterError> {
        self.lock()
            .config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| ClusterError::NotFound {
                kind: "configmap",
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, ClusterError> {
        let key = (
            config_map.metadata.namespace.clone(),
            config_map.metadata.name.clone(),
        );
        let mut state = self.lock();
        if state.config_maps.contains_key(&key) {
            return Err(ClusterError::AlreadyExists {
                kind: "configmap",
                namespace: key.0,
                name: key.1,
            });
        }
        state.config_maps.insert(key, config_map.clone());
        Ok(config_map.clone())
    }

    async fn update_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, ClusterError> {
        let key = (
            config_map.metadata.namespace.clone(),
            config_map.metadata.name.clone(),
        );
        let mut state = self.lock();
        if !state.config_maps.contains_key(&key) {
            return Err(ClusterError::NotFound {
                kind: "configmap",
                namespace: key.0,
                name: key.1,
            });
        }
        state.config_maps.insert(key, config_map.clone());
        Ok(config_map.clone())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, ClusterError> {
        self.lock()
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| ClusterError::NotFound {
                kind: "secret",
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job, ClusterError> {
        let key = (namespace.to_string(), job.metadata.name.clone());
        let auto = {
            let mut state = self.lock();
            if state.jobs.contains_key(&key) {
                return Err(ClusterError::AlreadyExists {
                    kind: "job",
                    namespace: key.0,
                    name: key.1,
                });
            }
            state.jobs.insert(key.clone(), job.clone());
            state.auto_outcome.clone()
        };

        if let Some(outcome) = auto {
            self.finish_job(
                namespace,
                &job.metadata.name,
                outcome.succeed,
                outcome.exit_code,
                &outcome.logs,
                outcome.duration_secs,
            );
        }
        Ok(job.clone())
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Job, ClusterError> {
        self.lock()
            .jobs
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| ClusterError::NotFound {
                kind: "job",
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    async fn watch_job(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<mpsc::Receiver<JobEvent>, ClusterError> {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let key = (namespace.to_string(), name.to_string());
        let mut state = self.lock();
        if let Some(job) = state.jobs.get(&key) {
            let _ = tx.try_send(JobEvent::Applied(job.clone()));
        }
        state.watchers.entry(key).or_default().push(tx);
        Ok(rx)
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Pod>, ClusterError> {
        let wanted: Vec<(&str, &str)> = label_selector
            .split(',')
            .filter_map(|pair| pair.split_once('='))
            .collect();
        let state = self.lock();
        let pods = state
            .pods
            .get(namespace)
            .map(|pods| {
                pods.iter()
                    .filter(|pod| {
                        wanted.iter().all(|(k, v)| {
                            pod.metadata.labels.get(*k).map(String::as_str) == Some(*v)
                        })
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(pods)
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        _container: &str,
    ) -> Result<String, ClusterError> {
        self.lock()
            .logs
            .get(&(namespace.to_string(), pod.to_string()))
            .cloned()
            .ok_or_else(|| ClusterError::NotFound {
                kind: "pod",
                namespace: namespace.to_string(),
                name: pod.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_job_submission_conflicts() {
        let cluster = FakeCluster::new();
        let job = Job {
            metadata: ObjectMeta {
                name: "script-exec-1".into(),
                namespace: "default".into(),
                ..ObjectMeta::default()
            },
            ..Job::default()
        };
        cluster.create_job("default", &job).await.unwrap();
        let err = cluster.create_job("default", &job).await.unwrap_err();
        assert!(matches!(err, ClusterError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn watch_sees_completion() {
        let cluster = FakeCluster::new();
        let job = Job {
            metadata: ObjectMeta {
                name: "script-exec-2".into(),
                namespace: "default".into(),
                ..ObjectMeta::default()
            },
            ..Job::default()
        };
        cluster.create_job("default", &job).await.unwrap();
        let mut rx = cluster.watch_job("default", "script-exec-2").await.unwrap();

        // Initial state, then the completion.
        let JobEvent::Applied(initial) = rx.recv().await.unwrap() else {
            panic!("expected applied event");
        };
        assert!(!initial.is_complete());

        cluster.complete_job("default", "script-exec-2", 0, "done\n");
        let JobEvent::Applied(done) = rx.recv().await.unwrap() else {
            panic!("expected applied event");
        };
        assert!(done.is_complete());

        let pods = cluster
            .list_pods("default", "job-name=script-exec-2")
            .await
            .unwrap();
        assert_eq!(pods.len(), 1);
        let logs = cluster
            .pod_logs("default", &pods[0].metadata.name, "script")
            .await
            .unwrap();
        assert_eq!(logs, "done\n");
    }
}
