//! Script-id registry.
//!
//! The fixed `script-registry` configmap carries a `registry.yaml` document
//! mapping script ids to a backing configmap or secret and a key. An entry
//! must name exactly one backing kind.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;

use crate::cluster::ClusterApi;

use super::loader::{SCRIPT_REGISTRY_CONFIG_MAP, fetch_config_map_key, fetch_secret_key};
use super::{ScriptError, ScriptSource};

/// Key within the registry configmap holding the YAML document.
const REGISTRY_DOCUMENT_KEY: &str = "registry.yaml";

/// One registry entry.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RegistryEntry {
    /// Backing configmap name.
    pub configmap: Option<String>,
    /// Backing secret name.
    pub secret: Option<String>,
    /// Key within the backing object.
    pub key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RegistryDocument {
    scripts: BTreeMap<String, RegistryEntry>,
}

/// Indirect script lookup by registry id.
pub struct Registry {
    cluster: Arc<dyn ClusterApi>,
    namespace: String,
}

impl Registry {
    /// Creates a registry reader for the executor namespace.
    pub fn new(cluster: Arc<dyn ClusterApi>, namespace: impl Into<String>) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
        }
    }

    /// Resolves a script id to its backing source, content included.
    pub async fn load_by_id(&self, script_id: &str) -> Result<ScriptSource, ScriptError> {
        let entry = self.entry(script_id).await?;
        let key = entry.key.unwrap_or_default();

        let source = if let Some(name) = entry.configmap {
            let content =
                fetch_config_map_key(self.cluster.as_ref(), &self.namespace, &name, &key).await?;
            ScriptSource::ConfigMap {
                name,
                key,
                namespace: self.namespace.clone(),
                content,
            }
        } else {
            // Validated below: exactly one of configmap/secret is set.
            let name = entry.secret.unwrap_or_default();
            let content =
                fetch_secret_key(self.cluster.as_ref(), &self.namespace, &name, &key).await?;
            ScriptSource::Secret {
                name,
                key,
                namespace: self.namespace.clone(),
                content,
            }
        };

        Ok(ScriptSource::Registry {
            id: script_id.to_string(),
            source: Box::new(source),
        })
    }

    async fn entry(&self, script_id: &str) -> Result<RegistryEntry, ScriptError> {
        let config_map = self
            .cluster
            .get_config_map(&self.namespace, SCRIPT_REGISTRY_CONFIG_MAP)
            .await?;
        let document =
            config_map
                .data
                .get(REGISTRY_DOCUMENT_KEY)
                .ok_or(ScriptError::RegistryInvalid {
                    id: "*".into(),
                    reason: format!("{REGISTRY_DOCUMENT_KEY} missing from registry configmap"),
                })?;
        let document: RegistryDocument =
            serde_yaml::from_str(document).map_err(|err| ScriptError::RegistryInvalid {
                id: "*".into(),
                reason: format!("parse {REGISTRY_DOCUMENT_KEY}: {err}"),
            })?;

        let entry = document
            .scripts
            .get(script_id)
            .cloned()
            .ok_or_else(|| ScriptError::UnknownScriptId(script_id.to_string()))?;

        let has_config_map = entry.configmap.as_deref().is_some_and(|s| !s.is_empty());
        let has_secret = entry.secret.as_deref().is_some_and(|s| !s.is_empty());
        let has_key = entry.key.as_deref().is_some_and(|s| !s.is_empty());
        if has_config_map && has_secret {
            return Err(ScriptError::RegistryInvalid {
                id: script_id.to_string(),
                reason: "entry names both configmap and secret".into(),
            });
        }
        if !(has_config_map || has_secret) || !has_key {
            return Err(ScriptError::RegistryInvalid {
                id: script_id.to_string(),
                reason: "entry must name a configmap or secret, and a key".into(),
            });
        }
        Ok(entry)
    }
}
