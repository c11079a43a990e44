//! REST client for the platform API.
//!
//! Speaks the platform's JSON API directly with a bearer token, the way an
//! in-cluster workload authenticates: token and CA bundle from the mounted
//! service-account volume, host and port from the environment. Watches use
//! the chunked change-stream endpoint and forward newline-delimited events
//! into a channel.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::types::{ConfigMap, Job, Pod, Secret};
use super::{ClusterApi, ClusterError, JobEvent, WATCH_CHANNEL_CAPACITY};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Connect timeout for API calls.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-request timeout for plain (non-watch) calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ApiStatus {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct WatchLine {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

/// [`ClusterApi`] implementation over the platform REST API.
pub struct HttpCluster {
    base_url: String,
    token: String,
    client: reqwest::Client,
    watch_client: reqwest::Client,
}

impl HttpCluster {
    /// Creates a client against an explicit API endpoint.
    ///
    /// `ca_pem` adds a trust root for the platform's serving certificate;
    /// pass `None` when the endpoint chains to a public root.
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        ca_pem: Option<&[u8]>,
    ) -> Result<Self, ClusterError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT);
        // Watch responses stay open indefinitely; only bound the connect.
        let mut watch_builder = reqwest::Client::builder().connect_timeout(CONNECT_TIMEOUT);

        if let Some(pem) = ca_pem {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|err| ClusterError::Transport(err.to_string()))?;
            builder = builder.add_root_certificate(cert.clone());
            watch_builder = watch_builder.add_root_certificate(cert);
        }

        let client = builder
            .build()
            .map_err(|err| ClusterError::Transport(err.to_string()))?;
        let watch_client = watch_builder
            .build()
            .map_err(|err| ClusterError::Transport(err.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            client,
            watch_client,
        })
    }

    /// Creates a client from the in-cluster service-account environment.
    pub fn in_cluster() -> Result<Self, ClusterError> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| ClusterError::Transport("KUBERNETES_SERVICE_HOST not set".into()))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".into());
        let token = std::fs::read_to_string(format!("{SERVICE_ACCOUNT_DIR}/token"))
            .map_err(|err| ClusterError::Transport(format!("read service-account token: {err}")))?;
        let ca = std::fs::read(format!("{SERVICE_ACCOUNT_DIR}/ca.crt"))
            .map_err(|err| ClusterError::Transport(format!("read service-account CA: {err}")))?;
        Self::new(
            format!("https://{host}:{port}"),
            token.trim().to_string(),
            Some(&ca),
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check<T: DeserializeOwned>(
        response: reqwest::Response,
        kind: &'static str,
        namespace: &str,
        name: &str,
    ) -> Result<T, ClusterError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|err| ClusterError::Decode(err.to_string()));
        }

        let message = response
            .json::<ApiStatus>()
            .await
            .map(|s| s.message)
            .unwrap_or_default();
        match status.as_u16() {
            404 => Err(ClusterError::NotFound {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
            409 => Err(ClusterError::AlreadyExists {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
            code => Err(ClusterError::Api {
                status: code,
                message,
            }),
        }
    }

    async fn get_object<T: DeserializeOwned>(
        &self,
        path: &str,
        kind: &'static str,
        namespace: &str,
        name: &str,
    ) -> Result<T, ClusterError> {
        let response = self
            .client
            .get(self.url(path))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| ClusterError::Transport(err.to_string()))?;
        Self::check(response, kind, namespace, name).await
    }
}

#[async_trait]
impl ClusterApi for HttpCluster {
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap, ClusterError> {
        self.get_object(
            &format!("/api/v1/namespaces/{namespace}/configmaps/{name}"),
            "configmap",
            namespace,
            name,
        )
        .await
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, ClusterError> {
        let namespace = &config_map.metadata.namespace;
        let response = self
            .client
            .post(self.url(&format!("/api/v1/namespaces/{namespace}/configmaps")))
            .bearer_auth(&self.token)
            .json(config_map)
            .send()
            .await
            .map_err(|err| ClusterError::Transport(err.to_string()))?;
        Self::check(response, "configmap", namespace, &config_map.metadata.name).await
    }

    async fn update_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, ClusterError> {
        let namespace = &config_map.metadata.namespace;
        let name = &config_map.metadata.name;
        let response = self
            .client
            .put(self.url(&format!(
                "/api/v1/namespaces/{namespace}/configmaps/{name}"
            )))
            .bearer_auth(&self.token)
            .json(config_map)
            .send()
            .await
            .map_err(|err| ClusterError::Transport(err.to_string()))?;
        Self::check(response, "configmap", namespace, name).await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, ClusterError> {
        self.get_object(
            &format!("/api/v1/namespaces/{namespace}/secrets/{name}"),
            "secret",
            namespace,
            name,
        )
        .await
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job, ClusterError> {
        let response = self
            .client
            .post(self.url(&format!("/apis/batch/v1/namespaces/{namespace}/jobs")))
            .bearer_auth(&self.token)
            .json(job)
            .send()
            .await
            .map_err(|err| ClusterError::Transport(err.to_string()))?;
        Self::check(response, "job", namespace, &job.metadata.name).await
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Job, ClusterError> {
        self.get_object(
            &format!("/apis/batch/v1/namespaces/{namespace}/jobs/{name}"),
            "job",
            namespace,
            name,
        )
        .await
    }

    async fn watch_job(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<mpsc::Receiver<JobEvent>, ClusterError> {
        let selector = format!("metadata.name={name}");
        let response = self
            .watch_client
            .get(self.url(&format!("/apis/batch/v1/namespaces/{namespace}/jobs")))
            .query(&[("watch", "true"), ("fieldSelector", selector.as_str())])
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| ClusterError::Transport(err.to_string()))?;

        if !response.status().is_success() {
            return Err(ClusterError::Api {
                status: response.status().as_u16(),
                message: format!("watch jobs in {namespace}"),
            });
        }

        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        tokio::spawn(forward_watch_events(response, tx));
        Ok(rx)
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Pod>, ClusterError> {
        let response = self
            .client
            .get(self.url(&format!("/api/v1/namespaces/{namespace}/pods")))
            .query(&[("labelSelector", label_selector)])
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| ClusterError::Transport(err.to_string()))?;
        let list: PodList = Self::check(response, "pod", namespace, label_selector).await?;
        Ok(list.items)
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<String, ClusterError> {
        let response = self
            .client
            .get(self.url(&format!("/api/v1/namespaces/{namespace}/pods/{pod}/log")))
            .query(&[("container", container)])
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| ClusterError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClusterError::Api {
                status: status.as_u16(),
                message: format!("logs for pod {namespace}/{pod}"),
            });
        }
        response
            .text()
            .await
            .map_err(|err| ClusterError::Decode(err.to_string()))
    }
}

/// Reads the chunked watch body and forwards decoded events until the
/// stream or the receiver goes away.
async fn forward_watch_events(mut response: reqwest::Response, tx: mpsc::Sender<JobEvent>) {
    let mut buffer = Vec::new();
    loop {
        let chunk = match response.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(err) => {
                debug!(error = %err, "job watch stream ended");
                break;
            }
        };
        buffer.extend_from_slice(&chunk);

        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            let line = &line[..line.len() - 1];
            if line.is_empty() {
                continue;
            }
            let event = match serde_json::from_slice::<WatchLine>(line) {
                Ok(line) => line,
                Err(err) => {
                    warn!(error = %err, "undecodable watch event");
                    continue;
                }
            };
            let forwarded = match event.event_type.as_str() {
                "DELETED" => JobEvent::Deleted,
                _ => match serde_json::from_value::<Job>(event.object) {
                    Ok(job) => JobEvent::Applied(job),
                    Err(err) => {
                        warn!(error = %err, "undecodable job in watch event");
                        continue;
                    }
                },
            };
            if tx.send(forwarded).await.is_err() {
                return;
            }
        }
    }
}
