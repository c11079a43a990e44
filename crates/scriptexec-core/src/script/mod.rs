//! Script resolution.
//!
//! A step names its script in exactly one of five ways; [`Loader`] resolves
//! the request to a [`ScriptSource`] carrying the content (or, for
//! pre-mounted bundle scripts, the path alone). Modeling the source as an
//! enum makes "exactly one source" a property of construction rather than a
//! runtime check.

use thiserror::Error;

use crate::cluster::ClusterError;

mod loader;
mod registry;

pub use loader::{APPROVED_SCRIPTS_CONFIG_MAP, Loader, SCRIPT_REGISTRY_CONFIG_MAP};
pub use registry::{Registry, RegistryEntry};

/// Where a script body came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptSource {
    /// Supplied inline in the request.
    Inline {
        /// The script body.
        content: String,
    },
    /// Fetched from one key of a configmap.
    ConfigMap {
        /// Configmap name.
        name: String,
        /// Key within the configmap.
        key: String,
        /// Namespace fetched from.
        namespace: String,
        /// The script body.
        content: String,
    },
    /// Fetched from one key of a secret, decoded from the platform's
    /// byte-encoded form.
    Secret {
        /// Secret name.
        name: String,
        /// Key within the secret.
        key: String,
        /// Namespace fetched from.
        namespace: String,
        /// The script body.
        content: String,
    },
    /// A file in the pre-mounted approved bundle; no content in-band.
    Path {
        /// Absolute path under `/scripts/`.
        path: String,
    },
    /// Looked up by id in the script registry, backed by one of the
    /// fetchable variants.
    Registry {
        /// Registry id the request named.
        id: String,
        /// The resolved backing source.
        source: Box<ScriptSource>,
    },
}

impl ScriptSource {
    /// Short source-kind tag used in audit records and labels.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Inline { .. } => "inline",
            Self::ConfigMap { .. } => "configmap",
            Self::Secret { .. } => "secret",
            Self::Path { .. } => "path",
            Self::Registry { .. } => "registry",
        }
    }

    /// The script body, when it is in-band.
    #[must_use]
    pub fn content(&self) -> Option<&str> {
        match self {
            Self::Inline { content }
            | Self::ConfigMap { content, .. }
            | Self::Secret { content, .. } => Some(content),
            Self::Path { .. } => None,
            Self::Registry { source, .. } => source.content(),
        }
    }

    /// The bundle path, for path-mode sources.
    #[must_use]
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::Path { path } => Some(path),
            _ => None,
        }
    }

    /// `name/key` reference of the backing object, when there is one.
    #[must_use]
    pub fn reference(&self) -> Option<String> {
        match self {
            Self::Inline { .. } => None,
            Self::ConfigMap { name, key, .. } | Self::Secret { name, key, .. } => {
                Some(format!("{name}/{key}"))
            }
            Self::Path { path } => Some(path.clone()),
            Self::Registry { source, .. } => source.reference(),
        }
    }
}

/// Errors from script resolution.
#[derive(Debug, Error)]
pub enum ScriptError {
    /// None of the five source parameters was provided.
    #[error(
        "no script source provided (inline_script, script_from_configmap, \
         script_from_secret, script_path, or script_id)"
    )]
    NoSourceProvided,

    /// A source parameter is present but malformed.
    #[error("invalid script source: {0}")]
    InvalidSource(String),

    /// The backing object exists but lacks the requested key.
    #[error("key {key:?} not found in {kind} {namespace}/{name}")]
    KeyNotFound {
        /// Object kind, `configmap` or `secret`.
        kind: &'static str,
        /// Namespace fetched from.
        namespace: String,
        /// Object name.
        name: String,
        /// Missing key.
        key: String,
    },

    /// A path-mode script is not in the approved bundle.
    #[error("script not found in approved bundle: {0}")]
    PathNotApproved(String),

    /// The registry has no entry for this id.
    #[error("script {0:?} not found in registry")]
    UnknownScriptId(String),

    /// The registry document or one of its entries is malformed.
    #[error("invalid script registry entry for {id:?}: {reason}")]
    RegistryInvalid {
        /// Registry id, or `*` for document-level problems.
        id: String,
        /// What is wrong.
        reason: String,
    },

    /// The backing object could not be fetched.
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}
