//! Resource quantities in the platform's suffix notation.
//!
//! Supports the decimal (`k`, `M`, `G`, `T`, `P`), binary (`Ki`, `Mi`, `Gi`,
//! `Ti`, `Pi`), and milli (`m`) suffixes, which is the subset the executor
//! configuration and request parameters use. Quantities compare by value, so
//! `"1024Mi"` equals `"1Gi"` and resource clamping works across notations.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Error parsing a quantity string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuantityError {
    /// The string is empty or contains no digits.
    #[error("empty quantity")]
    Empty,

    /// The numeric portion is not a valid decimal number.
    #[error("invalid number in quantity {0:?}")]
    InvalidNumber(String),

    /// The suffix is not one of the supported suffixes.
    #[error("unknown quantity suffix {suffix:?} in {value:?}")]
    UnknownSuffix {
        /// The unrecognized suffix.
        suffix: String,
        /// The full input.
        value: String,
    },

    /// The value overflows the internal representation.
    #[error("quantity {0:?} out of range")]
    OutOfRange(String),
}

/// Scale factors expressed in thousandths of a unit.
fn suffix_scale_millis(suffix: &str) -> Option<i128> {
    const KI: i128 = 1024;
    Some(match suffix {
        "" => 1_000,
        "m" => 1,
        "k" => 1_000_000,
        "M" => 1_000_000_000,
        "G" => 1_000_000_000_000,
        "T" => 1_000_000_000_000_000,
        "P" => 1_000_000_000_000_000_000,
        "Ki" => KI * 1_000,
        "Mi" => KI * KI * 1_000,
        "Gi" => KI * KI * KI * 1_000,
        "Ti" => KI * KI * KI * KI * 1_000,
        "Pi" => KI * KI * KI * KI * KI * 1_000,
        _ => return None,
    })
}

/// A resource quantity such as `"500m"`, `"256Mi"`, or `"2"`.
///
/// The original string is preserved for display and serialization; ordering
/// and equality use the parsed value.
#[derive(Debug, Clone)]
pub struct Quantity {
    raw: String,
    millis: i128,
}

impl Quantity {
    /// Parses a quantity from its string form.
    pub fn parse(input: &str) -> Result<Self, QuantityError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(QuantityError::Empty);
        }

        let digits_end = trimmed
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(trimmed.len());
        let (number, suffix) = trimmed.split_at(digits_end);
        if number.is_empty() {
            return Err(QuantityError::InvalidNumber(trimmed.to_string()));
        }

        let scale = suffix_scale_millis(suffix).ok_or_else(|| QuantityError::UnknownSuffix {
            suffix: suffix.to_string(),
            value: trimmed.to_string(),
        })?;

        let (int_part, frac_part) = match number.split_once('.') {
            Some((i, f)) => (i, f),
            None => (number, ""),
        };
        if frac_part.contains('.') {
            return Err(QuantityError::InvalidNumber(trimmed.to_string()));
        }

        let int_value: i128 = if int_part.is_empty() {
            0
        } else {
            int_part
                .parse()
                .map_err(|_| QuantityError::InvalidNumber(trimmed.to_string()))?
        };

        let mut millis = int_value
            .checked_mul(scale)
            .ok_or_else(|| QuantityError::OutOfRange(trimmed.to_string()))?;

        if !frac_part.is_empty() {
            let frac_value: i128 = frac_part
                .parse()
                .map_err(|_| QuantityError::InvalidNumber(trimmed.to_string()))?;
            let denom = 10_i128
                .checked_pow(frac_part.len() as u32)
                .ok_or_else(|| QuantityError::OutOfRange(trimmed.to_string()))?;
            let frac_millis = frac_value
                .checked_mul(scale)
                .ok_or_else(|| QuantityError::OutOfRange(trimmed.to_string()))?
                / denom;
            millis = millis
                .checked_add(frac_millis)
                .ok_or_else(|| QuantityError::OutOfRange(trimmed.to_string()))?;
        }

        Ok(Self {
            raw: trimmed.to_string(),
            millis,
        })
    }

    /// The value in thousandths of a unit (millicores for CPU, thousandths
    /// of a byte for memory).
    #[must_use]
    pub const fn millis(&self) -> i128 {
        self.millis
    }

    /// The original string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for Quantity {
    type Err = QuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialEq for Quantity {
    fn eq(&self, other: &Self) -> bool {
        self.millis == other.millis
    }
}

impl Eq for Quantity {}

impl PartialOrd for Quantity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Quantity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.millis.cmp(&other.millis)
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(D::Error::custom)
    }
}
