//! Primary/secondary key construction for the single-table schema
//! and pagination-cursor encoding.

use std::collections::BTreeMap;

use base64::Engine;
use tracing::warn;

use crate::error::Result;
use crate::value::FieldValue;

/// Backend attribute name for the partition key.
pub const ATTR_PK: &str = "pk";
/// Backend attribute name for the sort key.
pub const ATTR_SK: &str = "sk";
/// Sort key value for the "current" item of a versioned record.
pub const SK_V0: &str = "v0";

/// Attribute names for the always-on `gsitype` index and the three
/// user-declarable indexes.
pub const ATTR_GSITYPE: &str = "gsitype";
pub const ATTR_GSITYPESK: &str = "gsitypesk";
pub const ATTR_GSI1PK: &str = "gsi1pk";
pub const ATTR_GSI2PK: &str = "gsi2pk";
pub const ATTR_GSI3PK: &str = "gsi3pk";
pub const ATTR_GSI3SK: &str = "gsi3sk";

/// Control attributes carrying blob-field bookkeeping; excluded from
/// decoded record fields.
pub const ATTR_BLOB_FIELDS: &str = "_blob_fields";
pub const ATTR_BLOB_VERSIONS: &str = "_blob_versions";

/// Name of the index powering "list all records of type T by recency".
pub const INDEX_GSITYPE: &str = "gsitype";
pub const INDEX_GSI1: &str = "gsi1";
pub const INDEX_GSI2: &str = "gsi2";
pub const INDEX_GSI3: &str = "gsi3";

/// PK prefix used by the always-present audit-log record type.
pub const AUDIT_LOG_PREFIX: &str = "_INTERNAL#AuditLog";

/// Builds the sort key for a specific historical version.
#[must_use]
pub fn version_sort_key(version: u32) -> String {
    format!("v{version}")
}

/// Parses a `"v{n}"` sort key back into its numeric version, returning
/// `None` for `"v0"` or a malformed value.
#[must_use]
pub fn parse_version_sort_key(sk: &str) -> Option<u32> {
    let digits = sk.strip_prefix('v')?;
    let n: u32 = digits.parse().ok()?;
    if n == 0 {
        None
    } else {
        Some(n)
    }
}

/// Builds the partition key for a record of the given type prefix and id.
#[must_use]
pub fn partition_key(type_prefix: &str, resource_id: &str) -> String {
    format!("{type_prefix}#{resource_id}")
}

/// A fully-formed primary key pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryKey {
    pub pk: String,
    pub sk: String,
}

impl PrimaryKey {
    /// Primary key for a non-versioned record: `pk == sk`.
    #[must_use]
    pub fn non_versioned(type_prefix: &str, resource_id: &str) -> Self {
        let pk = partition_key(type_prefix, resource_id);
        Self { sk: pk.clone(), pk }
    }

    /// Primary key for the current (`v0`) item of a versioned record.
    #[must_use]
    pub fn versioned_current(type_prefix: &str, resource_id: &str) -> Self {
        Self {
            pk: partition_key(type_prefix, resource_id),
            sk: SK_V0.to_string(),
        }
    }

    /// Primary key for a specific historical version.
    #[must_use]
    pub fn versioned_history(type_prefix: &str, resource_id: &str, version: u32) -> Self {
        Self {
            pk: partition_key(type_prefix, resource_id),
            sk: version_sort_key(version),
        }
    }
}

/// Which of the four indexes (or none, meaning the main table) a query
/// targets. Determines both the key-condition attribute names and the
/// shape of any cursor synthesized from a trimmed result page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexName {
    Main,
    GsiType,
    Gsi1,
    Gsi2,
    Gsi3,
}

impl IndexName {
    /// Parses a backend index name, failing on anything unrecognized --
    /// per spec this is a fatal configuration error, not a soft failure.
    pub fn parse(name: Option<&str>) -> Result<Self> {
        Ok(match name {
            None => IndexName::Main,
            Some(INDEX_GSITYPE) => IndexName::GsiType,
            Some(INDEX_GSI1) => IndexName::Gsi1,
            Some(INDEX_GSI2) => IndexName::Gsi2,
            Some(INDEX_GSI3) => IndexName::Gsi3,
            Some(other) => {
                return Err(crate::error::StorageError::Configuration(format!(
                    "unrecognized index name: {other}"
                )))
            }
        })
    }

    /// The backend index name, or `None` for the main table.
    #[must_use]
    pub fn as_backend_name(&self) -> Option<&'static str> {
        match self {
            IndexName::Main => None,
            IndexName::GsiType => Some(INDEX_GSITYPE),
            IndexName::Gsi1 => Some(INDEX_GSI1),
            IndexName::Gsi2 => Some(INDEX_GSI2),
            IndexName::Gsi3 => Some(INDEX_GSI3),
        }
    }

    /// The attribute names a last-evaluated-key must carry for this index,
    /// per each index's own projection table.
    #[must_use]
    pub fn projected_attributes(&self) -> &'static [&'static str] {
        match self {
            IndexName::Main => &[ATTR_PK, ATTR_SK],
            IndexName::GsiType => &[ATTR_PK, ATTR_SK, ATTR_GSITYPE, ATTR_GSITYPESK],
            IndexName::Gsi1 => &[ATTR_PK, ATTR_SK, ATTR_GSI1PK],
            IndexName::Gsi2 => &[ATTR_PK, ATTR_SK, ATTR_GSI2PK],
            IndexName::Gsi3 => &[ATTR_PK, ATTR_SK, ATTR_GSI3PK, ATTR_GSI3SK],
        }
    }
}

/// An opaque last-evaluated-key, keyed by backend attribute name.
pub type LastEvaluatedKey = BTreeMap<String, FieldValue>;

/// Re-projects a full item down to exactly the attributes `index` requires
/// in a last-evaluated-key, used when the engine must synthesize a cursor
/// from a trimmed result page rather than forwarding the backend's own LEK.
#[must_use]
pub fn project_for_index(item: &BTreeMap<String, FieldValue>, index: IndexName) -> LastEvaluatedKey {
    index
        .projected_attributes()
        .iter()
        .filter_map(|attr| item.get(*attr).map(|v| ((*attr).to_string(), v.clone())))
        .collect()
}

/// Encodes a last-evaluated-key as the URL-safe base64 pagination cursor
/// handed back to callers.
#[must_use]
pub fn encode_cursor(lek: &LastEvaluatedKey) -> String {
    let json = serde_json::to_vec(lek).expect("LastEvaluatedKey always serializes");
    base64::engine::general_purpose::URL_SAFE.encode(json)
}

/// Decodes a pagination cursor back into a last-evaluated-key. Decode
/// failures are tolerated per spec: the caller proceeds as though no
/// cursor was supplied, after logging a warning.
#[must_use]
pub fn decode_cursor(cursor: &str) -> Option<LastEvaluatedKey> {
    let bytes = match base64::engine::general_purpose::URL_SAFE.decode(cursor) {
        Ok(b) => b,
        Err(err) => {
            warn!(error = %err, "failed to base64-decode pagination cursor; ignoring");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(lek) => Some(lek),
        Err(err) => {
            warn!(error = %err, "failed to parse pagination cursor; ignoring");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_versioned_key_mirrors_pk_and_sk() {
        let key = PrimaryKey::non_versioned("DOC", "abc123");
        assert_eq!(key.pk, "DOC#abc123");
        assert_eq!(key.sk, "DOC#abc123");
    }

    #[test]
    fn versioned_current_uses_v0() {
        let key = PrimaryKey::versioned_current("DOC", "abc123");
        assert_eq!(key.sk, "v0");
    }

    #[test]
    fn version_sort_key_round_trips() {
        assert_eq!(parse_version_sort_key("v14"), Some(14));
        assert_eq!(parse_version_sort_key("v0"), None);
        assert_eq!(parse_version_sort_key("garbage"), None);
    }

    #[test]
    fn unrecognized_index_is_configuration_error() {
        assert!(IndexName::parse(Some("gsi99")).is_err());
    }

    #[test]
    fn cursor_round_trips() {
        let mut lek = LastEvaluatedKey::new();
        lek.insert(ATTR_PK.to_string(), FieldValue::String("DOC#1".to_string()));
        lek.insert(ATTR_SK.to_string(), FieldValue::String("v0".to_string()));
        let cursor = encode_cursor(&lek);
        let decoded = decode_cursor(&cursor).unwrap();
        assert_eq!(decoded, lek);
    }

    #[test]
    fn malformed_cursor_decodes_to_none() {
        assert!(decode_cursor("not valid base64!!").is_none());
    }

    #[test]
    fn gsi3_projection_includes_sort_key() {
        let mut item = BTreeMap::new();
        item.insert(ATTR_PK.to_string(), FieldValue::String("A".into()));
        item.insert(ATTR_SK.to_string(), FieldValue::String("B".into()));
        item.insert(ATTR_GSI3PK.to_string(), FieldValue::String("C".into()));
        item.insert(ATTR_GSI3SK.to_string(), FieldValue::String("D".into()));
        item.insert(ATTR_GSI1PK.to_string(), FieldValue::String("E".into()));
        let projected = project_for_index(&item, IndexName::Gsi3);
        assert_eq!(projected.len(), 4);
        assert!(!projected.contains_key(ATTR_GSI1PK));
    }
}
