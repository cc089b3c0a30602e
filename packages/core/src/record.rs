//! The type-erased in-memory shape of a record instance as it crosses into
//! the schema/codec/GSI-derivation layer.
//!
//! An inheritance hierarchy of user model subclasses with field
//! introspection would decide things like "is this field a blob" or "what
//! is this GSI's partition key for this instance" at runtime. Rust has
//! neither inheritance nor runtime field introspection, so [`RecordState`]
//! plays the same role explicitly: a record becomes a flat, declared field map
//! before it ever reaches the schema registry, GSI derivation closures, or
//! the wire codec. Concrete per-type structs stay on the caller's side of
//! that boundary; see `singletable-engine`'s `persistence` module for the
//! typed `create_new`/`update_existing` entry points that build a
//! `RecordState` from caller-supplied data.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::value::FieldValue;

/// The identity and bookkeeping fields every record carries, independent of
/// whether it is versioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordIdentity {
    pub resource_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// `Some(n)` for versioned records (n >= 1); `None` for non-versioned.
    pub version: Option<u32>,
}

impl RecordIdentity {
    /// The set of attribute names considered "base" identity fields,
    /// excluded from audit field-diffing and blob/user-field iteration.
    #[must_use]
    pub fn base_field_names() -> &'static [&'static str] {
        &["resource_id", "created_at", "updated_at", "version"]
    }
}

/// A fully materialized record instance: identity plus a declared field map.
///
/// This is what GSI-derivation closures, the wire codec, and the audit
/// differ all operate on. User-defined fields live in `fields`; blob-typed
/// fields are represented there too (either as their real value, prior to
/// being diverted to the blob store, or omitted once hydration is deferred).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordState {
    pub identity: RecordIdentity,
    pub fields: BTreeMap<String, FieldValue>,
}

impl RecordState {
    #[must_use]
    pub fn new(identity: RecordIdentity) -> Self {
        Self {
            identity,
            fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn resource_id(&self) -> &str {
        &self.identity.resource_id
    }

    #[must_use]
    pub fn version(&self) -> Option<u32> {
        self.identity.version
    }

    /// Merges `patch` into this state's fields in place, used by
    /// `update_existing` to apply a partial update. Fields present in
    /// `clear_fields` are forced to [`FieldValue::Null`] regardless of
    /// whether `patch` also set them.
    pub fn apply_patch(&mut self, patch: BTreeMap<String, FieldValue>, clear_fields: &[String]) {
        for (k, v) in patch {
            self.fields.insert(k, v);
        }
        for field in clear_fields {
            self.fields.insert(field.clone(), FieldValue::Null);
        }
    }
}
