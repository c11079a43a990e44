//! Image catalog.
//!
//! A configmap-resident YAML document mapping short reference names
//! (`terraform`, `aws`) to full pull references and pull-secret names. The
//! catalog is reloaded on every resolve that needs it; there is no
//! cross-request cache.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;

use crate::cluster::ClusterApi;

use super::ImageError;

/// Key within the catalog configmap holding the YAML document.
const CATALOG_DOCUMENT_KEY: &str = "catalog.yaml";

/// One catalog entry.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CatalogEntry {
    /// Full image reference.
    pub image: String,
    /// Pull-secret name for this image.
    pub pull_secret: String,
    /// Human description.
    pub description: String,
    /// Tools the image ships.
    pub tools: Vec<String>,
    /// Who approved the entry.
    pub approved_by: String,
    /// When the entry was approved.
    pub approved_at: String,
}

/// Catalog reader.
pub struct Catalog {
    cluster: Arc<dyn ClusterApi>,
    namespace: String,
    name: String,
}

impl Catalog {
    /// Creates a reader for the named catalog configmap.
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Fetches and parses the catalog document.
    pub async fn load(&self) -> Result<BTreeMap<String, CatalogEntry>, ImageError> {
        let config_map = self
            .cluster
            .get_config_map(&self.namespace, &self.name)
            .await?;
        let document = config_map.data.get(CATALOG_DOCUMENT_KEY).ok_or_else(|| {
            ImageError::CatalogInvalid(format!(
                "{CATALOG_DOCUMENT_KEY} not found in configmap {}",
                self.name
            ))
        })?;
        serde_yaml::from_str(document)
            .map_err(|err| ImageError::CatalogInvalid(format!("parse {CATALOG_DOCUMENT_KEY}: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use crate::cluster::types::{ConfigMap, ObjectMeta};
    use crate::cluster::FakeCluster;

    use super::*;

    const NS: &str = "opscontrolroom-system";

    fn seed_catalog(cluster: &FakeCluster, yaml: &str) {
        cluster.insert_config_map(ConfigMap {
            metadata: ObjectMeta {
                name: "script-image-catalog".into(),
                namespace: NS.into(),
                ..ObjectMeta::default()
            },
            data: [(CATALOG_DOCUMENT_KEY.to_string(), yaml.to_string())].into(),
        });
    }

    #[tokio::test]
    async fn loads_entries() {
        let cluster = FakeCluster::new();
        seed_catalog(
            &cluster,
            "terraform:\n  image: harbor.internal/tools/terraform:1.7\n  pull_secret: harbor-pull\n  tools: [terraform]\n",
        );
        let catalog = Catalog::new(Arc::new(cluster), NS, "script-image-catalog");
        let entries = catalog.load().await.unwrap();
        let entry = &entries["terraform"];
        assert_eq!(entry.image, "harbor.internal/tools/terraform:1.7");
        assert_eq!(entry.pull_secret, "harbor-pull");
    }

    #[tokio::test]
    async fn reload_returns_same_mapping() {
        let cluster = FakeCluster::new();
        seed_catalog(&cluster, "alpine:\n  image: alpine:3.20\n");
        let catalog = Catalog::new(Arc::new(cluster), NS, "script-image-catalog");
        let first = catalog.load().await.unwrap();
        let second = catalog.load().await.unwrap();
        assert_eq!(first.len(), second.len());
        assert_eq!(first["alpine"].image, second["alpine"].image);
    }

    #[tokio::test]
    async fn missing_document_is_invalid() {
        let cluster = FakeCluster::new();
        cluster.insert_config_map(ConfigMap {
            metadata: ObjectMeta {
                name: "script-image-catalog".into(),
                namespace: NS.into(),
                ..ObjectMeta::default()
            },
            data: BTreeMap::new(),
        });
        let catalog = Catalog::new(Arc::new(cluster), NS, "script-image-catalog");
        assert!(matches!(
            catalog.load().await.unwrap_err(),
            ImageError::CatalogInvalid(_)
        ));
    }
}
