//! Approval record persistence.
//!
//! The reference store keeps records in one configmap: keys are
//! `{execution_id}-{step_name}`, values are JSON-encoded [`Request`]s. The
//! read-modify-write cycle has no optimistic-concurrency guard; concurrent
//! writers race and the last update wins. Acceptable for human-paced
//! mutation — a deployment needing strict serializability supplies a
//! conditional-update [`Store`] instead.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use crate::cluster::types::{ConfigMap, ObjectMeta};
use crate::cluster::{ClusterApi, ClusterError};

use super::{ApprovalError, DEFAULT_EXPIRY, Request, Status};

/// Approval record store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Persists a new record, stamping id, pending status, and the
    /// creation/expiration timestamps. A record already present under the
    /// same logical key is overwritten.
    async fn create(&self, request: &mut Request) -> Result<(), ApprovalError>;

    /// Fetches the record for `(execution_id, step_name)`.
    ///
    /// A pending record past its expiration is rewritten to expired before
    /// being returned.
    async fn get(&self, execution_id: &str, step_name: &str) -> Result<Request, ApprovalError>;

    /// Replaces the record under its logical key.
    async fn update(&self, request: &Request) -> Result<(), ApprovalError>;

    /// Scans for records still awaiting a decision, oldest first.
    ///
    /// Pending records past their expiration are rewritten to expired and
    /// excluded, the same lazy expiry `get` applies.
    async fn list_pending(&self) -> Result<Vec<Request>, ApprovalError>;
}

/// Configmap-backed [`Store`].
pub struct ConfigMapStore {
    cluster: Arc<dyn ClusterApi>,
    namespace: String,
    name: String,
    expiry: Duration,
}

impl ConfigMapStore {
    /// Creates a store over the named configmap with the default expiry.
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::with_expiry(cluster, namespace, name, DEFAULT_EXPIRY)
    }

    /// Creates a store with an explicit pending-record expiry.
    pub fn with_expiry(
        cluster: Arc<dyn ClusterApi>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        expiry: Duration,
    ) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
            name: name.into(),
            expiry,
        }
    }

    fn record_key(execution_id: &str, step_name: &str) -> String {
        format!("{execution_id}-{step_name}")
    }

    async fn get_or_create_config_map(&self) -> Result<ConfigMap, ApprovalError> {
        match self.cluster.get_config_map(&self.namespace, &self.name).await {
            Ok(config_map) => Ok(config_map),
            Err(ClusterError::NotFound { .. }) => {
                let fresh = ConfigMap {
                    metadata: ObjectMeta {
                        name: self.name.clone(),
                        namespace: self.namespace.clone(),
                        ..ObjectMeta::default()
                    },
                    ..ConfigMap::default()
                };
                Ok(self.cluster.create_config_map(&fresh).await?)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn write(&self, request: &Request) -> Result<(), ApprovalError> {
        let encoded = serde_json::to_string(request)
            .map_err(|err| ApprovalError::Encoding(err.to_string()))?;
        let mut config_map = self.get_or_create_config_map().await?;
        config_map.data.insert(
            Self::record_key(&request.execution_id, &request.step_name),
            encoded,
        );
        self.cluster.update_config_map(&config_map).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for ConfigMapStore {
    async fn create(&self, request: &mut Request) -> Result<(), ApprovalError> {
        let now = Utc::now();
        request.id = Uuid::new_v4().to_string();
        request.status = Status::Pending;
        request.created_at = now;
        request.expires_at = now
            + chrono::Duration::from_std(self.expiry)
                .map_err(|err| ApprovalError::Encoding(err.to_string()))?;
        self.write(request).await
    }

    async fn get(&self, execution_id: &str, step_name: &str) -> Result<Request, ApprovalError> {
        let config_map = self
            .cluster
            .get_config_map(&self.namespace, &self.name)
            .await
            .map_err(|err| match err {
                ClusterError::NotFound { .. } => ApprovalError::NotFound {
                    execution_id: execution_id.to_string(),
                    step_name: step_name.to_string(),
                },
                other => other.into(),
            })?;

        let encoded = config_map
            .data
            .get(&Self::record_key(execution_id, step_name))
            .ok_or_else(|| ApprovalError::NotFound {
                execution_id: execution_id.to_string(),
                step_name: step_name.to_string(),
            })?;
        let mut request: Request = serde_json::from_str(encoded)
            .map_err(|err| ApprovalError::Encoding(err.to_string()))?;

        if request.status == Status::Pending && Utc::now() > request.expires_at {
            request.status = Status::Expired;
            if let Err(err) = self.update(&request).await {
                warn!(
                    execution_id,
                    step_name,
                    error = %err,
                    "failed to persist approval expiration"
                );
            }
        }
        Ok(request)
    }

    async fn update(&self, request: &Request) -> Result<(), ApprovalError> {
        self.write(request).await
    }

    async fn list_pending(&self) -> Result<Vec<Request>, ApprovalError> {
        let mut config_map = match self.cluster.get_config_map(&self.namespace, &self.name).await {
            Ok(config_map) => config_map,
            Err(ClusterError::NotFound { .. }) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let now = Utc::now();
        let mut pending = Vec::new();
        let mut lapsed = Vec::new();
        for (key, encoded) in &config_map.data {
            let Ok(mut request) = serde_json::from_str::<Request>(encoded) else {
                warn!(key = %key, "skipping undecodable approval record");
                continue;
            };
            if request.status != Status::Pending {
                continue;
            }
            if now > request.expires_at {
                request.status = Status::Expired;
                lapsed.push((key.clone(), request));
            } else {
                pending.push(request);
            }
        }

        if !lapsed.is_empty() {
            for (key, request) in &lapsed {
                match serde_json::to_string(request) {
                    Ok(encoded) => {
                        config_map.data.insert(key.clone(), encoded);
                    }
                    Err(err) => warn!(key = %key, error = %err, "failed to encode expired record"),
                }
            }
            if let Err(err) = self.cluster.update_config_map(&config_map).await {
                warn!(error = %err, "failed to persist approval expirations");
            }
        }

        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use crate::cluster::FakeCluster;

    use super::*;

    const NS: &str = "opscontrolroom-system";
    const STORE: &str = "script-approvals";

    fn request() -> Request {
        Request {
            id: String::new(),
            execution_id: "exec-1".into(),
            step_name: "step-a".into(),
            runbook_id: "rb-1".into(),
            user: "alice".into(),
            script: "echo hi".into(),
            script_hash: "abc".into(),
            approvers: vec!["bob".into()],
            status: Status::Pending,
            approved_by: None,
            approved_at: None,
            denied_by: None,
            denied_at: None,
            denial_reason: None,
            created_at: Utc::now(),
            expires_at: Utc::now(),
        }
    }

    fn store(cluster: Arc<dyn ClusterApi>) -> ConfigMapStore {
        ConfigMapStore::new(cluster, NS, STORE)
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let cluster = Arc::new(FakeCluster::new());
        let store = store(cluster.clone());
        let mut req = request();
        store.create(&mut req).await.unwrap();
        assert!(!req.id.is_empty());
        assert!(req.expires_at > req.created_at);

        let fetched = store.get("exec-1", "step-a").await.unwrap();
        assert_eq!(fetched, req);
    }

    #[tokio::test]
    async fn create_bootstraps_the_configmap() {
        let cluster = Arc::new(FakeCluster::new());
        assert!(cluster.config_map(NS, STORE).is_none());
        let store = store(cluster.clone());
        store.create(&mut request()).await.unwrap();
        assert!(cluster.config_map(NS, STORE).is_some());
    }

    #[tokio::test]
    async fn missing_record_is_not_found() {
        let cluster = Arc::new(FakeCluster::new());
        let store = store(cluster);
        let err = store.get("exec-9", "step-z").await.unwrap_err();
        assert!(matches!(err, ApprovalError::NotFound { .. }));
    }

    #[tokio::test]
    async fn second_create_overwrites_prior_record() {
        let cluster = Arc::new(FakeCluster::new());
        let store = store(cluster);
        let mut first = request();
        store.create(&mut first).await.unwrap();
        let mut second = request();
        second.script = "echo bye".into();
        store.create(&mut second).await.unwrap();

        let fetched = store.get("exec-1", "step-a").await.unwrap();
        assert_eq!(fetched.script, "echo bye");
        assert_eq!(fetched.execution_id, "exec-1");
        assert_ne!(fetched.id, first.id);
    }

    #[tokio::test]
    async fn list_pending_filters_decided_and_expired_records() {
        let cluster = Arc::new(FakeCluster::new());
        let store = store(cluster.clone());

        // One record stays pending, one gets approved, one lapses.
        let mut open = request();
        store.create(&mut open).await.unwrap();

        let mut decided = request();
        decided.step_name = "step-b".into();
        store.create(&mut decided).await.unwrap();
        decided.status = Status::Approved;
        store.update(&decided).await.unwrap();

        let lapsing_store = ConfigMapStore::with_expiry(cluster, NS, STORE, Duration::from_secs(0));
        let mut lapsed = request();
        lapsed.step_name = "step-c".into();
        lapsing_store.create(&mut lapsed).await.unwrap();

        let pending = store.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].step_name, "step-a");

        // The lapsed record was rewritten to expired, not just skipped.
        let lapsed = store.get("exec-1", "step-c").await.unwrap();
        assert_eq!(lapsed.status, Status::Expired);
    }

    #[tokio::test]
    async fn list_pending_on_missing_store_is_empty() {
        let cluster = Arc::new(FakeCluster::new());
        let store = store(cluster);
        assert!(store.list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pending_record_expires_lazily_on_get() {
        let cluster = Arc::new(FakeCluster::new());
        let store = ConfigMapStore::with_expiry(cluster, NS, STORE, Duration::from_secs(0));
        let mut req = request();
        store.create(&mut req).await.unwrap();

        let fetched = store.get("exec-1", "step-a").await.unwrap();
        assert_eq!(fetched.status, Status::Expired);
        // The rewrite persisted.
        let again = store.get("exec-1", "step-a").await.unwrap();
        assert_eq!(again.status, Status::Expired);
    }
}
