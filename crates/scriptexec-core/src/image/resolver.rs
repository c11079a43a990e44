//! Image reference resolution.
//!
//! Precedence: an explicit `image` is used verbatim; otherwise `image_ref`
//! is looked up in the catalog; otherwise the configured default applies.
//! Pull-secret precedence is catalog entry, then request parameter, then
//! configured default. Pull policy is the request value when present, else
//! the configured default.

use crate::cluster::PullPolicy;

use super::catalog::Catalog;
use super::{ImageError, ResolvedImage};

/// Fallbacks used when the request leaves image settings open.
#[derive(Debug, Clone, Default)]
pub struct ResolverDefaults {
    /// Default image reference.
    pub image: String,
    /// Default pull-secret name.
    pub pull_secret: String,
    /// Default pull policy.
    pub pull_policy: PullPolicy,
}

/// Resolves request image parameters to a [`ResolvedImage`].
pub struct Resolver {
    catalog: Catalog,
    defaults: ResolverDefaults,
}

impl Resolver {
    /// Creates a resolver over the given catalog and defaults.
    #[must_use]
    pub fn new(catalog: Catalog, defaults: ResolverDefaults) -> Self {
        Self { catalog, defaults }
    }

    /// Resolves the image, pull secret, and pull policy for one request.
    pub async fn resolve(
        &self,
        image: &str,
        image_ref: &str,
        pull_policy: &str,
        pull_secret: &str,
    ) -> Result<ResolvedImage, ImageError> {
        let mut resolved = ResolvedImage {
            image: String::new(),
            pull_secret: String::new(),
            pull_policy: self.defaults.pull_policy,
        };

        if !image.is_empty() {
            resolved.image = image.to_string();
        } else if !image_ref.is_empty() {
            let entries = self.catalog.load().await?;
            let entry = entries
                .get(image_ref)
                .ok_or_else(|| ImageError::UnknownImageRef(image_ref.to_string()))?;
            resolved.image = entry.image.clone();
            resolved.pull_secret = entry.pull_secret.clone();
        } else {
            resolved.image = self.defaults.image.clone();
        }

        if resolved.pull_secret.is_empty() {
            resolved.pull_secret = if pull_secret.is_empty() {
                self.defaults.pull_secret.clone()
            } else {
                pull_secret.to_string()
            };
        }

        if !pull_policy.is_empty() {
            resolved.pull_policy = pull_policy
                .parse()
                .map_err(|()| ImageError::InvalidPullPolicy(pull_policy.to_string()))?;
        }

        Ok(resolved)
    }
}
