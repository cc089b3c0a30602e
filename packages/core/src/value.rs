//! The in-memory value model used to move record fields across the wire
//! codec boundary, and the float/decimal conversion the backend contract's
//! arbitrary-precision numeric attributes require.
//!
//! The backend represents every number as a string-encoded
//! arbitrary-precision decimal (this is how DynamoDB's own `N` attribute
//! type works: the wire value is a decimal-formatted string, not a binary
//! float). [`Decimal`] models exactly that representation rather than
//! pulling in a full decimal-arithmetic crate the engine does not need --
//! it is a transport type, not something we compute with.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};

/// An arbitrary-precision decimal in the backend's own wire representation:
/// a validated numeric string, exactly as DynamoDB's `N` attribute type
/// stores it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Decimal(String);

impl Decimal {
    /// Parses a numeric string into a `Decimal`, validating its shape.
    pub fn parse(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        if s.is_empty()
            || !s
                .trim_start_matches('-')
                .chars()
                .all(|c| c.is_ascii_digit() || c == '.')
        {
            return Err(StorageError::Validation(format!("not a valid decimal: {s}")));
        }
        Ok(Self(s))
    }

    /// The canonical numeric-string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Converts an integer to a decimal.
    #[must_use]
    pub fn from_i64(v: i64) -> Self {
        Self(v.to_string())
    }

    /// Converts a float to a decimal using its shortest round-tripping
    /// representation. This is the mandatory float-to-decimal conversion
    /// applied at the wire boundary (spec: "Floats -> arbitrary-precision
    /// decimal... mandatory and recursive into nested maps/lists").
    #[must_use]
    pub fn from_f64(v: f64) -> Self {
        Self(format!("{v}"))
    }

    /// Converts back to a float. Used when the schema declares a field as
    /// `float` or `list<float>`; untyped dict/list leaves stay as `Decimal`.
    pub fn to_f64(&self) -> Result<f64> {
        self.0
            .parse()
            .map_err(|_| StorageError::Validation(format!("decimal {} is not representable as f64", self.0)))
    }

    /// Converts back to an integer, failing if the value has a fractional part.
    pub fn to_i64(&self) -> Result<i64> {
        self.0
            .parse()
            .map_err(|_| StorageError::Validation(format!("decimal {} is not an integer", self.0)))
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for Decimal {
    fn from(v: i64) -> Self {
        Self::from_i64(v)
    }
}

impl From<f64> for Decimal {
    fn from(v: f64) -> Self {
        Self::from_f64(v)
    }
}

/// Declares how a field's raw JSON value should be coerced when decoding
/// the uncompressed wire form back into typed record fields.
///
/// Schema authors only need to declare this for fields where the backend's
/// value shape is ambiguous: plain numbers always decode to [`Decimal`]
/// unless the field is declared `Float`/`FloatList`, and plain lists of
/// strings decode as [`FieldValue::List`] unless declared `StringSet`/
/// `NumberSet`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FieldKind {
    /// No special coercion; decimals and lists stay as-is.
    #[default]
    Untyped,
    /// A single floating point field; decoded `Decimal` is coerced to `f64`.
    Float,
    /// A list of floats; every `Decimal` leaf is coerced to `f64`.
    FloatList,
    /// A DynamoDB string-set (`SS`): empty sets are omitted on encode,
    /// reconstructed from a JSON list on decode.
    StringSet,
    /// A DynamoDB number-set (`NS`): same rules as `StringSet`.
    NumberSet,
}

/// A value travelling across the wire-codec boundary between in-memory
/// record fields and backend item attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Absent / JSON null. Never written to the backend directly -- a
    /// `Null` field is either omitted (for sparse GSI attributes) or kept
    /// explicit depending on the call site.
    Null,
    /// Boolean.
    Bool(bool),
    /// UTF-8 string.
    String(String),
    /// Arbitrary-precision numeric value in the backend's own representation.
    Number(Decimal),
    /// Opaque binary payload (used for compressed record bodies).
    Bytes(Vec<u8>),
    /// Ordered list of values.
    List(Vec<FieldValue>),
    /// String-keyed map of values, ordered for deterministic encoding.
    Map(BTreeMap<String, FieldValue>),
    /// DynamoDB string-set.
    StringSet(BTreeSet<String>),
    /// DynamoDB number-set.
    NumberSet(BTreeSet<Decimal>),
}

impl FieldValue {
    /// Converts an arbitrary [`serde_json::Value`] into a [`FieldValue`],
    /// applying the mandatory float -> decimal conversion recursively into
    /// nested maps and lists.
    #[must_use]
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => FieldValue::Null,
            serde_json::Value::Bool(b) => FieldValue::Bool(b),
            serde_json::Value::String(s) => FieldValue::String(s),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    FieldValue::Number(Decimal::from_i64(i))
                } else {
                    FieldValue::Number(Decimal::from_f64(n.as_f64().unwrap_or_default()))
                }
            }
            serde_json::Value::Array(items) => {
                FieldValue::List(items.into_iter().map(FieldValue::from_json).collect())
            }
            serde_json::Value::Object(map) => FieldValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, FieldValue::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Converts back to a plain [`serde_json::Value`], applying `kind` at
    /// the top level (callers recurse for nested fields that need their own
    /// [`FieldKind`], e.g. a blob's canonical-JSON payload).
    pub fn into_json(self, kind: FieldKind) -> Result<serde_json::Value> {
        match (self, kind) {
            (FieldValue::Null, _) => Ok(serde_json::Value::Null),
            (FieldValue::Bool(b), _) => Ok(serde_json::Value::Bool(b)),
            (FieldValue::String(s), _) => Ok(serde_json::Value::String(s)),
            (FieldValue::Number(d), FieldKind::Float) => Ok(serde_json::json!(d.to_f64()?)),
            (FieldValue::Number(d), _) => {
                // Untyped leaves stay numeric-shaped JSON without losing precision
                // when possible; fall back to a JSON number via f64 otherwise.
                if let Ok(i) = d.to_i64() {
                    Ok(serde_json::json!(i))
                } else {
                    Ok(serde_json::json!(d.to_f64()?))
                }
            }
            (FieldValue::Bytes(b), _) => Ok(serde_json::Value::String(base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                b,
            ))),
            (FieldValue::List(items), FieldKind::FloatList) => {
                let coerced: Result<Vec<_>> = items
                    .into_iter()
                    .map(|v| v.into_json(FieldKind::Float))
                    .collect();
                Ok(serde_json::Value::Array(coerced?))
            }
            (FieldValue::List(items), _) => {
                let coerced: Result<Vec<_>> = items
                    .into_iter()
                    .map(|v| v.into_json(FieldKind::Untyped))
                    .collect();
                Ok(serde_json::Value::Array(coerced?))
            }
            (FieldValue::Map(map), _) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map {
                    out.insert(k, v.into_json(FieldKind::Untyped)?);
                }
                Ok(serde_json::Value::Object(out))
            }
            (FieldValue::StringSet(set), _) => {
                Ok(serde_json::Value::Array(set.into_iter().map(serde_json::Value::String).collect()))
            }
            (FieldValue::NumberSet(set), _) => Ok(serde_json::Value::Array(
                set.into_iter().map(|d| serde_json::json!(d.to_f64().unwrap_or_default())).collect(),
            )),
        }
    }

    /// `true` for the empty-set case the backend cannot represent; callers
    /// must omit the attribute entirely rather than writing an empty set.
    #[must_use]
    pub fn is_omittable_empty_set(&self) -> bool {
        matches!(self, FieldValue::StringSet(s) if s.is_empty())
            || matches!(self, FieldValue::NumberSet(s) if s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_round_trips_through_decimal() {
        let d = Decimal::from_f64(19.99);
        assert_eq!(d.as_str(), "19.99");
        assert!((d.to_f64().unwrap() - 19.99).abs() < f64::EPSILON);
    }

    #[test]
    fn nested_floats_convert_recursively() {
        let json = serde_json::json!({"price": 19.99, "tags": [1.5, 2.5], "count": 3});
        let value = FieldValue::from_json(json);
        match value {
            FieldValue::Map(map) => {
                assert!(matches!(map.get("price"), Some(FieldValue::Number(_))));
                match &map["tags"] {
                    FieldValue::List(items) => assert_eq!(items.len(), 2),
                    other => panic!("expected list, got {other:?}"),
                }
            }
            other => panic!("expected map, got {other:?}"),
        }
    }

    #[test]
    fn empty_set_is_omittable() {
        assert!(FieldValue::StringSet(BTreeSet::new()).is_omittable_empty_set());
        assert!(!FieldValue::StringSet(BTreeSet::from(["x".to_string()])).is_omittable_empty_set());
    }

    #[test]
    fn untyped_decimal_round_trips_to_int() {
        let value = FieldValue::Number(Decimal::from_i64(3));
        assert_eq!(value.into_json(FieldKind::Untyped).unwrap(), serde_json::json!(3));
    }
}
