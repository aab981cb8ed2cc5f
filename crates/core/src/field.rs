//! Raw field values as delivered by the external source.
//!
//! Spreadsheet-style sources send a loosely typed map of column name to cell
//! value. `FieldValue` pins that down at the deserialization boundary so the
//! coercion rules below are exhaustive matches instead of runtime probing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single raw cell value.
///
/// Integer and floating JSON numbers both land in `Number`. Anything that is
/// not a string, number, string array or null (checkboxes, attachment objects,
/// nested records) is preserved in `Other` so one odd cell never rejects the
/// whole payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Text(String),
    Number(f64),
    List(Vec<String>),
    Other(serde_json::Value),
}

/// How a canonical attribute expects its raw value to be coerced.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FieldKind {
    /// Trimmed string; empty counts as unset.
    Text,
    /// Integer or floating number.
    Number,
    /// Single linked-record ID; one list level is unwrapped.
    Reference,
    /// RFC3339 timestamp.
    Timestamp,
}

impl core::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            FieldKind::Text => "text",
            FieldKind::Number => "number",
            FieldKind::Reference => "reference",
            FieldKind::Timestamp => "timestamp",
        };
        f.write_str(s)
    }
}

/// Field-level coercion failure. Never fatal for the record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoercionError {
    #[error("expected {expected}, found {found}")]
    TypeMismatch {
        expected: FieldKind,
        found: &'static str,
    },

    #[error("invalid timestamp {value:?}: {reason}")]
    InvalidTimestamp { value: String, reason: String },
}

impl FieldValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Null => "null",
            FieldValue::Text(_) => "text",
            FieldValue::Number(_) => "number",
            FieldValue::List(_) => "list",
            FieldValue::Other(_) => "other",
        }
    }

    fn mismatch(&self, expected: FieldKind) -> CoercionError {
        CoercionError::TypeMismatch {
            expected,
            found: self.type_name(),
        }
    }

    pub fn to_text(&self) -> Result<Option<String>, CoercionError> {
        match self {
            FieldValue::Null => Ok(None),
            FieldValue::Text(s) => Ok(non_empty(s)),
            other => Err(other.mismatch(FieldKind::Text)),
        }
    }

    pub fn to_number(&self) -> Result<Option<f64>, CoercionError> {
        match self {
            FieldValue::Null => Ok(None),
            FieldValue::Number(n) if n.is_finite() => Ok(Some(*n)),
            other => Err(other.mismatch(FieldKind::Number)),
        }
    }

    /// Linked-record fields arrive as `["recXXXX"]`; the first element wins.
    pub fn to_reference(&self) -> Result<Option<String>, CoercionError> {
        match self {
            FieldValue::Null => Ok(None),
            FieldValue::List(ids) => Ok(ids.first().and_then(|s| non_empty(s))),
            FieldValue::Text(s) => Ok(non_empty(s)),
            other => Err(other.mismatch(FieldKind::Reference)),
        }
    }

    pub fn to_timestamp(&self) -> Result<Option<DateTime<Utc>>, CoercionError> {
        match self {
            FieldValue::Null => Ok(None),
            FieldValue::Text(s) if s.trim().is_empty() => Ok(None),
            FieldValue::Text(s) => parse_rfc3339(s).map(Some),
            other => Err(other.mismatch(FieldKind::Timestamp)),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(value: Vec<String>) -> Self {
        FieldValue::List(value)
    }
}

/// Parse an RFC3339 timestamp into UTC.
pub fn parse_rfc3339(raw: &str) -> Result<DateTime<Utc>, CoercionError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CoercionError::InvalidTimestamp {
            value: raw.to_string(),
            reason: e.to_string(),
        })
}

fn non_empty(s: &str) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn decodes_each_variant() {
        let raw = json!({
            "a": null,
            "b": "KSEA-KLAX",
            "c": 125,
            "d": 125.5,
            "e": ["rec123", "rec456"],
            "f": true,
        });
        let map: std::collections::HashMap<String, FieldValue> =
            serde_json::from_value(raw).unwrap();

        assert_eq!(map["a"], FieldValue::Null);
        assert_eq!(map["b"], FieldValue::Text("KSEA-KLAX".into()));
        assert_eq!(map["c"], FieldValue::Number(125.0));
        assert_eq!(map["d"], FieldValue::Number(125.5));
        assert_eq!(map["e"], FieldValue::List(vec!["rec123".into(), "rec456".into()]));
        assert_eq!(map["f"], FieldValue::Other(json!(true)));
    }

    #[test]
    fn text_is_trimmed_and_blank_is_unset() {
        assert_eq!(
            FieldValue::from("  A320 ").to_text().unwrap(),
            Some("A320".to_string())
        );
        assert_eq!(FieldValue::from("   ").to_text().unwrap(), None);
        assert!(FieldValue::Number(1.0).to_text().is_err());
    }

    #[test]
    fn reference_unwraps_first_element() {
        let v = FieldValue::List(vec!["rec123".into(), "rec999".into()]);
        assert_eq!(v.to_reference().unwrap(), Some("rec123".to_string()));
        assert_eq!(FieldValue::List(vec![]).to_reference().unwrap(), None);
        assert_eq!(
            FieldValue::from("rec7").to_reference().unwrap(),
            Some("rec7".to_string())
        );
    }

    #[test]
    fn number_rejects_strings() {
        let err = FieldValue::from("125").to_number().unwrap_err();
        assert_eq!(
            err,
            CoercionError::TypeMismatch {
                expected: FieldKind::Number,
                found: "text"
            }
        );
    }

    #[test]
    fn timestamp_parses_rfc3339_and_rejects_garbage() {
        let ok = FieldValue::from("2024-03-01T12:30:00+02:00")
            .to_timestamp()
            .unwrap()
            .unwrap();
        assert_eq!(ok.to_rfc3339(), "2024-03-01T10:30:00+00:00");

        let err = FieldValue::from("yesterday").to_timestamp().unwrap_err();
        assert!(matches!(err, CoercionError::InvalidTimestamp { .. }));
    }

    proptest! {
        /// Property: text coercion never yields surrounding whitespace or an empty string.
        #[test]
        fn text_coercion_is_trimmed(s in "\\PC{0,40}") {
            if let Some(out) = FieldValue::Text(s).to_text().unwrap() {
                prop_assert!(!out.is_empty());
                prop_assert_eq!(out.trim(), out.as_str());
            }
        }

        /// Property: every finite number survives coercion unchanged.
        #[test]
        fn finite_numbers_pass_through(n in proptest::num::f64::NORMAL) {
            prop_assert_eq!(FieldValue::Number(n).to_number().unwrap(), Some(n));
        }
    }
}
