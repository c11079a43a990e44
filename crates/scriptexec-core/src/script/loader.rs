//! Five-mode script loader.
//!
//! Priority order is a design contract: when more than one source field is
//! set, the earlier one wins — `inline_script`, then `script_from_configmap`,
//! then `script_from_secret`, then `script_path`, then `script_id`.

use std::sync::Arc;

use crate::cluster::ClusterApi;
use crate::params::Params;

use super::registry::Registry;
use super::{ScriptError, ScriptSource};

/// Fixed configmap holding the pre-mounted approved script bundle.
pub const APPROVED_SCRIPTS_CONFIG_MAP: &str = "approved-scripts";

/// Fixed configmap holding the script-id registry.
pub const SCRIPT_REGISTRY_CONFIG_MAP: &str = "script-registry";

/// Mount point of the approved bundle inside workload containers.
const SCRIPTS_MOUNT_PREFIX: &str = "/scripts/";

/// Resolves step parameters to a [`ScriptSource`].
pub struct Loader {
    cluster: Arc<dyn ClusterApi>,
    namespace: String,
    registry: Registry,
}

impl Loader {
    /// Creates a loader resolving relative references in `namespace`.
    pub fn new(cluster: Arc<dyn ClusterApi>, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            registry: Registry::new(Arc::clone(&cluster), namespace.clone()),
            cluster,
            namespace,
        }
    }

    /// Resolves the script source for one step request.
    pub async fn load(&self, params: Params<'_>) -> Result<ScriptSource, ScriptError> {
        let inline = params.string("inline_script", "");
        if !inline.is_empty() {
            return Ok(ScriptSource::Inline { content: inline });
        }

        let config_map_ref = params.map("script_from_configmap");
        if !config_map_ref.is_empty() {
            let name = config_map_ref.string("configmap_name", "");
            let key = config_map_ref.string("key", "");
            if name.is_empty() || key.is_empty() {
                return Err(ScriptError::InvalidSource(
                    "script_from_configmap requires configmap_name and key".into(),
                ));
            }
            let namespace = config_map_ref.string("namespace", &self.namespace);
            let content =
                fetch_config_map_key(self.cluster.as_ref(), &namespace, &name, &key).await?;
            return Ok(ScriptSource::ConfigMap {
                name,
                key,
                namespace,
                content,
            });
        }

        let secret_ref = params.map("script_from_secret");
        if !secret_ref.is_empty() {
            let name = secret_ref.string("secret_name", "");
            let key = secret_ref.string("key", "");
            if name.is_empty() || key.is_empty() {
                return Err(ScriptError::InvalidSource(
                    "script_from_secret requires secret_name and key".into(),
                ));
            }
            let namespace = secret_ref.string("namespace", &self.namespace);
            let content = fetch_secret_key(self.cluster.as_ref(), &namespace, &name, &key).await?;
            return Ok(ScriptSource::Secret {
                name,
                key,
                namespace,
                content,
            });
        }

        let path = params.string("script_path", "");
        if !path.is_empty() {
            self.verify_bundle_path(&path).await?;
            return Ok(ScriptSource::Path { path });
        }

        let script_id = params.string("script_id", "");
        if !script_id.is_empty() {
            return self.registry.load_by_id(&script_id).await;
        }

        Err(ScriptError::NoSourceProvided)
    }

    /// Checks that a `/scripts/<file>` path names a key of the approved
    /// bundle configmap. The content stays out-of-band; the workload runs
    /// the file from the mount.
    async fn verify_bundle_path(&self, path: &str) -> Result<(), ScriptError> {
        let Some(filename) = path.strip_prefix(SCRIPTS_MOUNT_PREFIX) else {
            return Err(ScriptError::InvalidSource(format!(
                "script_path must start with {SCRIPTS_MOUNT_PREFIX}"
            )));
        };
        if filename.is_empty() {
            return Err(ScriptError::InvalidSource(format!(
                "script_path must include a filename after {SCRIPTS_MOUNT_PREFIX}"
            )));
        }

        let bundle = self
            .cluster
            .get_config_map(&self.namespace, APPROVED_SCRIPTS_CONFIG_MAP)
            .await?;
        if !bundle.data.contains_key(filename) {
            return Err(ScriptError::PathNotApproved(path.to_string()));
        }
        Ok(())
    }
}

pub(super) async fn fetch_config_map_key(
    cluster: &dyn ClusterApi,
    namespace: &str,
    name: &str,
    key: &str,
) -> Result<String, ScriptError> {
    let config_map = cluster.get_config_map(namespace, name).await?;
    config_map
        .data
        .get(key)
        .cloned()
        .ok_or_else(|| ScriptError::KeyNotFound {
            kind: "configmap",
            namespace: namespace.to_string(),
            name: name.to_string(),
            key: key.to_string(),
        })
}

pub(super) async fn fetch_secret_key(
    cluster: &dyn ClusterApi,
    namespace: &str,
    name: &str,
    key: &str,
) -> Result<String, ScriptError> {
    let secret = cluster.get_secret(namespace, name).await?;
    let payload = secret
        .data
        .get(key)
        .ok_or_else(|| ScriptError::KeyNotFound {
            kind: "secret",
            namespace: namespace.to_string(),
            name: name.to_string(),
            key: key.to_string(),
        })?;
    String::from_utf8(payload.0.clone()).map_err(|_| {
        ScriptError::InvalidSource(format!("secret {namespace}/{name} key {key:?} is not UTF-8"))
    })
}
