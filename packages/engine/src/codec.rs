//! The wire codec: converts between [`RecordState`] and the backend's flat
//! item attribute map.
//!
//! Two encodings are supported per record type, chosen by
//! `RecordSchema::compress`:
//!
//! - Uncompressed: one backend attribute per record field, with the
//!   float -> decimal and set -> list transformations applied.
//! - Compressed: the whole field map (minus blob fields) is JSON-encoded,
//!   gzipped, and stored under a single `data` attribute. GSI-deriving
//!   attributes are still emitted at the top level either way, since the
//!   backend can only index top-level attributes.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use singletable_core::{FieldValue, RecordSchema};
use tracing::trace;

use crate::Result;

/// Attribute name the compressed payload is stored under.
pub const ATTR_DATA: &str = "data";

/// Control attributes never surfaced as decoded record fields.
pub fn is_control_attribute(name: &str, ttl_attribute_name: Option<&str>) -> bool {
    const ALWAYS: &[&str] = &[
        "pk",
        "sk",
        "gsitype",
        "gsitypesk",
        "gsi1pk",
        "gsi2pk",
        "gsi3pk",
        "gsi3sk",
        "_blob_fields",
        "_blob_versions",
        ATTR_DATA,
        "version",
    ];
    if ALWAYS.contains(&name) {
        return true;
    }
    ttl_attribute_name.is_some_and(|ttl| ttl == name)
}

/// Encodes a field map into backend attributes for `schema`, honoring
/// `schema.compress`. `blob_fields` have already been diverted to the blob
/// store by the caller and are excluded from `fields` before this is
/// called; this function only shapes what remains.
pub fn encode_fields(schema: &RecordSchema, fields: &BTreeMap<String, FieldValue>) -> Result<BTreeMap<String, FieldValue>> {
    if schema.compress {
        encode_compressed(fields)
    } else {
        Ok(encode_uncompressed(fields))
    }
}

fn encode_uncompressed(fields: &BTreeMap<String, FieldValue>) -> BTreeMap<String, FieldValue> {
    fields
        .iter()
        .filter(|(_, v)| !v.is_omittable_empty_set())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn encode_compressed(fields: &BTreeMap<String, FieldValue>) -> Result<BTreeMap<String, FieldValue>> {
    let filtered: BTreeMap<String, FieldValue> = fields
        .iter()
        .filter(|(_, v)| !v.is_omittable_empty_set())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let json = serde_json::to_vec(&filtered)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    let gzipped = encoder.finish()?;
    trace!(raw_bytes = json.len(), gzipped_bytes = gzipped.len(), "compressed record payload");
    let mut out = BTreeMap::new();
    out.insert(ATTR_DATA.to_string(), FieldValue::Bytes(gzipped));
    Ok(out)
}

/// Decodes backend attributes back into a field map for `schema`, reversing
/// [`encode_fields`] and applying the declared [`FieldKind`](singletable_core::FieldKind)
/// coercions (float / float-list / string-set / number-set).
pub fn decode_fields(
    schema: &RecordSchema,
    item: &BTreeMap<String, FieldValue>,
    ttl_attribute_name: Option<&str>,
) -> Result<BTreeMap<String, FieldValue>> {
    let raw = if schema.compress {
        decode_compressed(item)?
    } else {
        item.iter()
            .filter(|(k, _)| !is_control_attribute(k, ttl_attribute_name))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    };
    Ok(coerce_declared_kinds(schema, raw))
}

fn decode_compressed(item: &BTreeMap<String, FieldValue>) -> Result<BTreeMap<String, FieldValue>> {
    let Some(FieldValue::Bytes(gzipped)) = item.get(ATTR_DATA) else {
        return Ok(BTreeMap::new());
    };
    let mut decoder = GzDecoder::new(gzipped.as_slice());
    let mut json = Vec::new();
    decoder.read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}

fn coerce_declared_kinds(schema: &RecordSchema, mut raw: BTreeMap<String, FieldValue>) -> BTreeMap<String, FieldValue> {
    for (field, value) in raw.iter_mut() {
        use singletable_core::FieldKind;
        match schema.field_kind(field) {
            FieldKind::StringSet => {
                if let FieldValue::List(items) = value {
                    let set = items
                        .drain(..)
                        .filter_map(|v| match v {
                            FieldValue::String(s) => Some(s),
                            _ => None,
                        })
                        .collect();
                    *value = FieldValue::StringSet(set);
                }
            }
            FieldKind::NumberSet => {
                if let FieldValue::List(items) = value {
                    let set = items
                        .drain(..)
                        .filter_map(|v| match v {
                            FieldValue::Number(d) => Some(d),
                            _ => None,
                        })
                        .collect();
                    *value = FieldValue::NumberSet(set);
                }
            }
            // Float / FloatList coercion happens lazily at read time via
            // `FieldValue::into_json`, since `Decimal` already carries enough
            // precision to convert on demand and this keeps the in-memory
            // representation uniform for untyped leaves of the same shape.
            FieldKind::Float | FieldKind::FloatList | FieldKind::Untyped => {}
        }
    }
    raw
}

/// Approximates the backend-encoded size of an item, in bytes. Used by the
/// blob layer's `max_size_bytes` enforcement and by tests asserting the
/// compressed encoding actually shrinks a payload.
#[must_use]
pub fn encoded_item_size(item: &BTreeMap<String, FieldValue>) -> usize {
    serde_json::to_vec(item).map(|v| v.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use singletable_core::Decimal;

    #[test]
    fn uncompressed_round_trips_plain_fields() {
        let schema = RecordSchema::new("Doc");
        let mut fields = BTreeMap::new();
        fields.insert("title".to_string(), FieldValue::String("hello".to_string()));
        let encoded = encode_fields(&schema, &fields).unwrap();
        let decoded = decode_fields(&schema, &encoded, None).unwrap();
        assert_eq!(decoded, fields);
    }

    #[test]
    fn compressed_round_trips_and_shrinks_repetitive_payload() {
        let schema = RecordSchema::new("Doc").compressed();
        let mut fields = BTreeMap::new();
        fields.insert("content".to_string(), FieldValue::String("x".repeat(5000)));
        let encoded = encode_fields(&schema, &fields).unwrap();
        assert!(matches!(encoded.get(ATTR_DATA), Some(FieldValue::Bytes(_))));
        let decoded = decode_fields(&schema, &encoded, None).unwrap();
        assert_eq!(decoded, fields);
    }

    #[test]
    fn control_attributes_are_excluded_from_uncompressed_decode() {
        let schema = RecordSchema::new("Doc").with_ttl("expires_at", "ttl");
        let mut item = BTreeMap::new();
        item.insert("pk".to_string(), FieldValue::String("DOC#1".to_string()));
        item.insert("sk".to_string(), FieldValue::String("DOC#1".to_string()));
        item.insert("gsitype".to_string(), FieldValue::String("DOC".to_string()));
        item.insert("ttl".to_string(), FieldValue::Number(Decimal::from_i64(123)));
        item.insert("title".to_string(), FieldValue::String("kept".to_string()));
        let decoded = decode_fields(&schema, &item, Some("ttl")).unwrap();
        assert_eq!(decoded.len(), 1);
        assert!(decoded.contains_key("title"));
    }

    #[test]
    fn empty_set_is_omitted_on_encode() {
        use std::collections::BTreeSet;
        let schema = RecordSchema::new("Doc");
        let mut fields = BTreeMap::new();
        fields.insert("tags".to_string(), FieldValue::StringSet(BTreeSet::new()));
        let encoded = encode_fields(&schema, &fields).unwrap();
        assert!(!encoded.contains_key("tags"));
    }

    #[test]
    fn declared_string_set_reconstructs_from_list() {
        let schema = RecordSchema::new("Doc").with_set_field("tags", singletable_core::FieldKind::StringSet);
        let mut item = BTreeMap::new();
        item.insert(
            "tags".to_string(),
            FieldValue::List(vec![FieldValue::String("a".to_string()), FieldValue::String("b".to_string())]),
        );
        let decoded = decode_fields(&schema, &item, None).unwrap();
        match &decoded["tags"] {
            FieldValue::StringSet(set) => assert_eq!(set.len(), 2),
            other => panic!("expected string set, got {other:?}"),
        }
    }
}
