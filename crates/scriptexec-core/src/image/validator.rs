//! Approved/blocked image pattern checks.

use super::{ImageError, matches_pattern};

/// Checks a resolved image against the configured pattern lists.
///
/// With both lists empty every image is allowed. Blocked patterns are
/// evaluated first; a non-empty approved list then requires a match.
#[derive(Debug, Clone, Default)]
pub struct ImageValidator {
    approved: Vec<String>,
    blocked: Vec<String>,
}

impl ImageValidator {
    /// Creates a validator over the configured lists.
    #[must_use]
    pub fn new(approved: Vec<String>, blocked: Vec<String>) -> Self {
        Self { approved, blocked }
    }

    /// Validates one image reference.
    pub fn validate(&self, image: &str) -> Result<(), ImageError> {
        if self.approved.is_empty() && self.blocked.is_empty() {
            return Ok(());
        }

        for pattern in &self.blocked {
            if matches_pattern(image, pattern) {
                return Err(ImageError::Blocked {
                    image: image.to_string(),
                    pattern: pattern.clone(),
                });
            }
        }

        if !self.approved.is_empty()
            && !self
                .approved
                .iter()
                .any(|pattern| matches_pattern(image, pattern))
        {
            return Err(ImageError::NotApproved(image.to_string()));
        }

        Ok(())
    }
}
