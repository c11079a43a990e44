//! Total projections over the dynamic parameter bag.
//!
//! Step parameters arrive as an open JSON document; recognized keys are
//! extracted here and unrecognized keys are ignored. Missing keys and
//! wrong-typed values degrade to the caller's default rather than failing —
//! the bag is an extension point, not a closed schema. The one exception is
//! [`Params::duration`]: a *present but unparsable* duration is a client
//! error, not an absence.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// Error for a parameter that is present but unusable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamError {
    /// A duration string did not parse.
    #[error("invalid duration for {key:?}: {value:?}")]
    InvalidDuration {
        /// Parameter key.
        key: String,
        /// The rejected value.
        value: String,
    },
}

/// Borrowing reader over a parameter bag.
///
/// Cheap to copy; reads never mutate the underlying document.
#[derive(Debug, Clone, Copy)]
pub struct Params<'a> {
    fields: Option<&'a serde_json::Map<String, Value>>,
}

impl<'a> Params<'a> {
    /// Wraps a JSON document. Non-object documents read as empty.
    #[must_use]
    pub fn new(value: &'a Value) -> Self {
        Self {
            fields: value.as_object(),
        }
    }

    /// An empty bag.
    #[must_use]
    pub const fn empty() -> Self {
        Self { fields: None }
    }

    fn get(&self, key: &str) -> Option<&'a Value> {
        self.fields.and_then(|fields| fields.get(key))
    }

    /// True when the bag has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.map_or(true, serde_json::Map::is_empty)
    }

    /// String value; missing, non-string, and empty all degrade to the
    /// default.
    #[must_use]
    pub fn string(&self, key: &str, default: &str) -> String {
        match self.get(key).and_then(Value::as_str) {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => default.to_string(),
        }
    }

    /// Sub-bag value; missing or non-object degrades to an empty bag.
    #[must_use]
    pub fn map(&self, key: &str) -> Params<'a> {
        Params {
            fields: self.get(key).and_then(Value::as_object),
        }
    }

    /// Iterates a sub-bag's entries, each value wrapped for further reads.
    pub fn entries(&self) -> impl Iterator<Item = (&'a str, &'a Value)> {
        self.fields
            .into_iter()
            .flat_map(|fields| fields.iter().map(|(k, v)| (k.as_str(), v)))
    }

    /// List value; missing or non-array degrades to an empty slice.
    #[must_use]
    pub fn list(&self, key: &str) -> &'a [Value] {
        self.get(key).and_then(Value::as_array).map_or(&[], Vec::as_slice)
    }

    /// List of strings; non-string elements are skipped.
    #[must_use]
    pub fn string_list(&self, key: &str) -> Vec<String> {
        self.list(key)
            .iter()
            .filter_map(Value::as_str)
            .map(ToString::to_string)
            .collect()
    }

    /// Map of string values; non-string entries are skipped.
    #[must_use]
    pub fn string_map(&self, key: &str) -> Vec<(String, String)> {
        self.map(key)
            .entries()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.to_string(), s.to_string())))
            .collect()
    }

    /// Boolean value; anything but a JSON `true` reads as `false`.
    #[must_use]
    pub fn bool(&self, key: &str) -> bool {
        self.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Integer value, if present and numeric.
    #[must_use]
    pub fn int(&self, key: &str) -> Option<i64> {
        let value = self.get(key)?;
        value
            .as_i64()
            .or_else(|| value.as_f64().map(|f| f as i64))
    }

    /// Raw value, if present.
    #[must_use]
    pub fn raw(&self, key: &str) -> Option<&'a Value> {
        self.get(key)
    }

    /// Duration value in humantime notation (`"30s"`, `"5m"`).
    ///
    /// Absence degrades to `None`; a present but unparsable value is an
    /// error.
    pub fn duration(&self, key: &str) -> Result<Option<Duration>, ParamError> {
        match self.get(key).and_then(Value::as_str) {
            None => Ok(None),
            Some("") => Ok(None),
            Some(raw) => humantime::parse_duration(raw)
                .map(Some)
                .map_err(|_| ParamError::InvalidDuration {
                    key: key.to_string(),
                    value: raw.to_string(),
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn absent_keys_degrade_to_defaults() {
        let doc = json!({"present": "yes"});
        let params = Params::new(&doc);
        assert_eq!(params.string("present", "no"), "yes");
        assert_eq!(params.string("absent", "no"), "no");
        assert!(!params.bool("absent"));
        assert!(params.int("absent").is_none());
        assert!(params.list("absent").is_empty());
        assert!(params.map("absent").is_empty());
        assert_eq!(params.duration("absent").unwrap(), None);
    }

    #[test]
    fn wrong_types_degrade_to_defaults() {
        let doc = json!({"n": 7, "s": "text", "flag": "true"});
        let params = Params::new(&doc);
        assert_eq!(params.string("n", "dflt"), "dflt");
        assert!(params.string_list("s").is_empty());
        // Truthy strings are not booleans.
        assert!(!params.bool("flag"));
        assert_eq!(params.int("n"), Some(7));
    }

    #[test]
    fn durations_parse_or_fail_loudly() {
        let doc = json!({"timeout": "5m", "bad": "soon"});
        let params = Params::new(&doc);
        assert_eq!(
            params.duration("timeout").unwrap(),
            Some(Duration::from_secs(300))
        );
        assert!(matches!(
            params.duration("bad"),
            Err(ParamError::InvalidDuration { .. })
        ));
    }

    #[test]
    fn nested_bags_read_through() {
        let doc = json!({
            "script_from_configmap": {"configmap_name": "scripts", "key": "run.sh"},
            "env": {"A": "1", "B": 2},
        });
        let params = Params::new(&doc);
        let sub = params.map("script_from_configmap");
        assert_eq!(sub.string("configmap_name", ""), "scripts");
        assert_eq!(params.string_map("env"), vec![("A".into(), "1".into())]);
    }

    #[test]
    fn non_object_document_reads_empty() {
        let doc = json!("just a string");
        let params = Params::new(&doc);
        assert!(params.is_empty());
        assert_eq!(params.string("anything", "d"), "d");
    }
}
