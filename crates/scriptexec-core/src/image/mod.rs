//! Container image resolution and validation.

use thiserror::Error;

use crate::cluster::{ClusterError, PullPolicy};

mod catalog;
mod resolver;
mod validator;

pub use catalog::{Catalog, CatalogEntry};
pub use resolver::{Resolver, ResolverDefaults};
pub use validator::ImageValidator;

/// A pull-ready image reference with its pull settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    /// Full image reference.
    pub image: String,
    /// Pull-secret name; empty when none applies.
    pub pull_secret: String,
    /// Pull policy.
    pub pull_policy: PullPolicy,
}

/// Errors from image resolution and validation.
#[derive(Debug, Error)]
pub enum ImageError {
    /// The requested catalog reference does not exist.
    #[error("image_ref {0:?} not found in catalog")]
    UnknownImageRef(String),

    /// The catalog document is missing or malformed.
    #[error("invalid image catalog: {0}")]
    CatalogInvalid(String),

    /// The requested pull policy is not one of the platform's values.
    #[error("invalid image pull policy {0:?} (expected Always, IfNotPresent, or Never)")]
    InvalidPullPolicy(String),

    /// The image matches a blocked pattern.
    #[error("image {image} is blocked (matches {pattern})")]
    Blocked {
        /// The rejected image.
        image: String,
        /// The pattern it matched.
        pattern: String,
    },

    /// An approved list is configured and the image matches none of it.
    #[error("image {0} is not in the approved list")]
    NotApproved(String),

    /// The catalog configmap could not be fetched.
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// Exact match, or prefix match when the pattern ends with `*`. Blank
/// patterns never match.
pub(crate) fn matches_pattern(image: &str, pattern: &str) -> bool {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return false;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return image.starts_with(prefix);
    }
    image == pattern
}
