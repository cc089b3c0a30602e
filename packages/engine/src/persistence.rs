//! The persistence engine: typed create/read/update/delete over the
//! single-table schema, with transactional version invariants, blob
//! diversion, TTL emission, and audit derivation wired in at every mutation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use singletable_core::{keys, Decimal, FieldKind, FieldValue, Id, PrimaryKey, RecordIdentity, RecordSchema, RecordState, SchemaRegistry};
use tracing::debug;

use crate::audit::{self, AuditLogWriter, AuditOperation};
use crate::backend::{ConditionalCheckFailed, KeyCondition, ObjectMetadata, TableBackend, TransactWrite, WriteCondition};
use crate::blob::{self, BlobPlaceholder, BlobStore};
use crate::codec;
use crate::query::{PagedResults, QueryEngine, QueryParams};
use crate::stats::MemoryStats;
use crate::{Error, Result};

/// A user-defined record type: a stable name plus ordinary (de)serialization,
/// with every other fact
/// about the type (versioning, blobs, GSIs, audit) living in the
/// corresponding [`RecordSchema`] rather than on the type itself.
pub trait Model: Serialize + DeserializeOwned + Send + Sync + Clone + 'static {
    const TYPE_NAME: &'static str;
}

/// A fully materialized record as returned by the persistence engine: the
/// identity, the hydrated (or not-yet-hydrated) field map, and whichever
/// blob fields are still represented only as placeholders.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub identity: RecordIdentity,
    pub fields: BTreeMap<String, FieldValue>,
    pub blob_placeholders: Vec<BlobPlaceholder>,
    /// Per-blob-field version pointer; only populated for
    /// versioned schemas with declared blob fields.
    pub blob_versions: BTreeMap<String, u32>,
}

impl Record {
    #[must_use]
    pub fn has_unloaded_blobs(&self) -> bool {
        !self.blob_placeholders.is_empty()
    }

    #[must_use]
    pub fn unloaded_blob_fields(&self) -> Vec<&str> {
        self.blob_placeholders.iter().map(|p| p.field_name.as_str()).collect()
    }

    /// Projects this record onto a caller's typed model, merging identity
    /// and field map into one JSON object before deserializing.
    pub fn to_model<T: Model>(&self) -> Result<T> {
        let mut map = serde_json::Map::new();
        map.insert("resource_id".to_string(), serde_json::Value::String(self.identity.resource_id.clone()));
        map.insert("created_at".to_string(), serde_json::Value::String(self.identity.created_at.to_rfc3339()));
        map.insert("updated_at".to_string(), serde_json::Value::String(self.identity.updated_at.to_rfc3339()));
        if let Some(v) = self.identity.version {
            map.insert("version".to_string(), serde_json::json!(v));
        }
        for (k, v) in &self.fields {
            map.insert(k.clone(), v.clone().into_json(FieldKind::Untyped)?);
        }
        Ok(serde_json::from_value(serde_json::Value::Object(map))?)
    }
}

fn build_state(identity: RecordIdentity, mut fields: BTreeMap<String, FieldValue>) -> RecordState {
    fields.insert("created_at".to_string(), FieldValue::String(identity.created_at.to_rfc3339()));
    fields.insert("updated_at".to_string(), FieldValue::String(identity.updated_at.to_rfc3339()));
    let mut state = RecordState::new(identity);
    state.fields = fields;
    state
}

fn parse_timestamp(value: FieldValue) -> Option<DateTime<Utc>> {
    match value {
        FieldValue::String(s) => DateTime::parse_from_rfc3339(&s).ok().map(|dt| dt.with_timezone(&Utc)),
        _ => None,
    }
}

fn ttl_epoch_seconds(value: &FieldValue) -> Option<i64> {
    match value {
        FieldValue::Number(d) => d.to_i64().ok(),
        FieldValue::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.timestamp()),
        _ => None,
    }
}

pub(crate) fn conditional_check_failed(err: &Error) -> bool {
    matches!(err, Error::Backend(inner) if inner.downcast_ref::<ConditionalCheckFailed>().is_some())
}

/// The DynamoDB-shaped table contract the engine depends on, plus the
/// blob store, schema registry, and stats counter it composes everything
/// through.
pub struct PersistenceEngine {
    backend: Arc<dyn TableBackend>,
    blob_store: Arc<BlobStore>,
    schema_registry: Arc<SchemaRegistry>,
    audit_writer: AuditLogWriter,
    stats: MemoryStats,
    blob_key_prefix: Option<String>,
}

impl PersistenceEngine {
    /// `audit_backend`, when supplied, routes derived audit entries to a
    /// separate physical table; `None` shares the primary backend.
    #[must_use]
    pub fn new(
        backend: Arc<dyn TableBackend>,
        audit_backend: Option<Arc<dyn TableBackend>>,
        blob_store: Arc<BlobStore>,
        schema_registry: Arc<SchemaRegistry>,
        blob_key_prefix: Option<String>,
    ) -> Self {
        let audit_writer = AuditLogWriter::new(audit_backend.unwrap_or_else(|| backend.clone()));
        let stats = MemoryStats::new(backend.clone());
        Self { backend, blob_store, schema_registry, audit_writer, stats, blob_key_prefix }
    }

    #[must_use]
    pub fn stats(&self) -> &MemoryStats {
        &self.stats
    }

    #[must_use]
    pub fn schema_registry(&self) -> &Arc<SchemaRegistry> {
        &self.schema_registry
    }

    pub(crate) fn schema_for<T: Model>(&self) -> Result<Arc<RecordSchema>> {
        self.schema_registry
            .get(T::TYPE_NAME)
            .ok_or_else(|| Error::Configuration(format!("no schema registered for type {}", T::TYPE_NAME)))
    }

    /// Exposed to [`crate::transaction`], which applies queued increment/append
    /// operations directly against the current item key outside the
    /// transactional batch: numeric `ADD` is a single-item update primitive
    /// distinct from the multi-item conditional write path.
    pub(crate) fn backend(&self) -> &Arc<dyn TableBackend> {
        &self.backend
    }

    pub(crate) fn current_key(&self, schema: &RecordSchema, resource_id: &str) -> PrimaryKey {
        if schema.versioned {
            PrimaryKey::versioned_current(&schema.discriminator, resource_id)
        } else {
            PrimaryKey::non_versioned(&schema.discriminator, resource_id)
        }
    }

    /// Diverts a type's declared blob fields out of `fields`, writing new
    /// values to the blob store and carrying forward untouched references
    /// from `carry_forward_versions`/`carry_forward_placeholders`.
    /// Shared by `create_new`, `update_existing`, and `restore_version`:
    /// the only thing that differs between them is what they pass as the
    /// carry-forward source.
    async fn divert_blob_fields(
        &self,
        schema: &RecordSchema,
        resource_id: &str,
        new_version: Option<u32>,
        fields: &mut BTreeMap<String, FieldValue>,
        carry_forward_versions: &BTreeMap<String, u32>,
        carry_forward_placeholders: &[BlobPlaceholder],
    ) -> Result<(Vec<BlobPlaceholder>, BTreeMap<String, u32>)> {
        let mut placeholders = Vec::new();
        let mut blob_versions = BTreeMap::new();
        for (field_name, spec) in &schema.blob_fields {
            match fields.remove(field_name) {
                Some(FieldValue::Null) => {
                    // explicitly cleared: no placeholder, no version entry.
                }
                Some(value) => {
                    let json = value.into_json(FieldKind::Untyped)?;
                    let key = blob::blob_key(self.blob_key_prefix.as_deref(), &schema.type_name, resource_id, new_version, field_name);
                    let metadata = ObjectMetadata {
                        resource_type: schema.type_name.clone(),
                        resource_id: resource_id.to_string(),
                        field_name: field_name.clone(),
                        ..Default::default()
                    };
                    let placeholder = self.blob_store.put_value(&key, &json, spec, metadata).await?;
                    if let Some(v) = new_version {
                        blob_versions.insert(field_name.clone(), v);
                    }
                    placeholders.push(placeholder);
                }
                None => {
                    if let Some(&carried_version) = carry_forward_versions.get(field_name) {
                        if let Some(prior) = carry_forward_placeholders.iter().find(|p| &p.field_name == field_name) {
                            placeholders.push(prior.clone());
                        }
                        blob_versions.insert(field_name.clone(), carried_version);
                    } else if let Some(prior) = carry_forward_placeholders.iter().find(|p| &p.field_name == field_name) {
                        placeholders.push(prior.clone());
                    }
                }
            }
        }
        Ok((placeholders, blob_versions))
    }

    fn assemble_item_body(
        &self,
        schema: &RecordSchema,
        state: &RecordState,
        blob_field_names: &[String],
        blob_versions: &BTreeMap<String, u32>,
    ) -> Result<BTreeMap<String, FieldValue>> {
        let mut item = codec::encode_fields(schema, &state.fields)?;
        item.insert("gsitype".to_string(), FieldValue::String(schema.discriminator.clone()));
        item.insert("gsitypesk".to_string(), FieldValue::String(state.identity.updated_at.to_rfc3339()));
        if let Some(version) = state.identity.version {
            item.insert("version".to_string(), FieldValue::Number(Decimal::from_i64(i64::from(version))));
        }
        if let Some(gsi) = &schema.gsi_config.gsi1 {
            let key = gsi.derive(state);
            if let Some(pk) = key.pk {
                item.insert("gsi1pk".to_string(), FieldValue::String(pk));
            }
        }
        if let Some(gsi) = &schema.gsi_config.gsi2 {
            let key = gsi.derive(state);
            if let Some(pk) = key.pk {
                item.insert("gsi2pk".to_string(), FieldValue::String(pk));
            }
        }
        if let Some(gsi) = &schema.gsi_config.gsi3 {
            let key = gsi.derive(state);
            if let Some(pk) = key.pk {
                item.insert("gsi3pk".to_string(), FieldValue::String(pk));
            }
            if let Some(sk) = key.sk {
                item.insert("gsi3sk".to_string(), FieldValue::String(sk));
            }
        }
        if !blob_field_names.is_empty() {
            item.insert(
                "_blob_fields".to_string(),
                FieldValue::List(blob_field_names.iter().cloned().map(FieldValue::String).collect()),
            );
            if schema.versioned && !blob_versions.is_empty() {
                let map = blob_versions
                    .iter()
                    .map(|(k, v)| (k.clone(), FieldValue::Number(Decimal::from_i64(i64::from(*v)))))
                    .collect();
                item.insert("_blob_versions".to_string(), FieldValue::Map(map));
            }
        }
        if let Some(ttl) = &schema.ttl {
            if let Some(value) = state.fields.get(&ttl.ttl_field) {
                if let Some(epoch) = ttl_epoch_seconds(value) {
                    item.insert(ttl.ttl_attribute_name.clone(), FieldValue::Number(Decimal::from_i64(epoch)));
                }
            }
        }
        Ok(item)
    }

    async fn decode_record(&self, schema: &RecordSchema, item: &BTreeMap<String, FieldValue>, load_blobs: bool) -> Result<Record> {
        let pk = match item.get("pk") {
            Some(FieldValue::String(s)) => s.clone(),
            _ => return Err(Error::Validation("item missing pk".to_string())),
        };
        let resource_id = pk.strip_prefix(&format!("{}#", schema.discriminator)).unwrap_or(&pk).to_string();

        let version = if schema.versioned {
            match item.get("version") {
                Some(FieldValue::Number(d)) => Some(d.to_i64()?.max(0) as u32),
                _ => None,
            }
        } else {
            None
        };

        let ttl_attr = schema.ttl.as_ref().map(|t| t.ttl_attribute_name.as_str());
        let mut decoded = codec::decode_fields(schema, item, ttl_attr)?;

        let created_at = decoded.remove("created_at").and_then(parse_timestamp).unwrap_or_else(Utc::now);
        let updated_at = decoded.remove("updated_at").and_then(parse_timestamp).unwrap_or(created_at);
        let identity = RecordIdentity { resource_id: resource_id.clone(), created_at, updated_at, version };

        let blob_field_names: Vec<String> = match item.get("_blob_fields") {
            Some(FieldValue::List(items)) => items
                .iter()
                .filter_map(|v| match v {
                    FieldValue::String(s) => Some(s.clone()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };
        let blob_versions: BTreeMap<String, u32> = match item.get("_blob_versions") {
            Some(FieldValue::Map(m)) => m
                .iter()
                .filter_map(|(k, v)| match v {
                    FieldValue::Number(d) => d.to_i64().ok().map(|n| (k.clone(), n.max(0) as u32)),
                    _ => None,
                })
                .collect(),
            _ => BTreeMap::new(),
        };

        let mut placeholders = Vec::new();
        for field_name in &blob_field_names {
            let spec = schema.blob_fields.get(field_name);
            let blob_version = blob_versions.get(field_name).copied();
            let key = blob::blob_key(self.blob_key_prefix.as_deref(), &schema.type_name, &resource_id, blob_version, field_name);
            if load_blobs {
                let value = self.blob_store.get_value(&key).await?;
                decoded.insert(field_name.clone(), FieldValue::from_json(value));
            } else {
                placeholders.push(BlobPlaceholder {
                    field_name: field_name.clone(),
                    key,
                    size_bytes: 0,
                    content_type: spec.and_then(|s| s.content_type.clone()),
                    compressed: spec.is_some_and(|s| s.compress),
                });
            }
        }

        Ok(Record { identity, fields: decoded, blob_placeholders: placeholders, blob_versions })
    }

    async fn maybe_write_audit(
        &self,
        schema: &RecordSchema,
        operation: AuditOperation,
        resource_id: &str,
        old: Option<&Record>,
        new: Option<&Record>,
        changed_by: Option<String>,
        audit_metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        if schema.discriminator == audit::AUDIT_DISCRIMINATOR || !schema.audit_config.enabled {
            return Ok(());
        }
        let blob_field_set: BTreeSet<String> = schema.blob_fields.keys().cloned().collect();
        let source_fields = new.or(old).map(|r| r.fields.clone()).unwrap_or_default();
        let changed_by = audit::resolve_changed_by(changed_by, &source_fields, &schema.audit_config)?;

        let changed_fields = match (old, new) {
            (Some(old), Some(new)) => audit::compute_field_diff(
                &schema.audit_config,
                &blob_field_set,
                &old.fields,
                &new.fields,
                &old.blob_placeholders,
                &new.blob_placeholders,
                &old.blob_versions,
                &new.blob_versions,
            ),
            _ => None,
        };

        let resource_snapshot = if schema.audit_config.include_snapshot {
            new.map(|r| audit::build_snapshot(&blob_field_set, &r.fields, &r.blob_placeholders, &r.blob_versions))
        } else {
            None
        };

        debug!(resource_id, operation = ?operation, type_name = %schema.type_name, "deriving audit entry");
        self.audit_writer
            .write(audit::AuditEntryParams {
                audited_resource_type: schema.type_name.clone(),
                audited_resource_id: resource_id.to_string(),
                operation,
                changed_by,
                changed_fields,
                resource_snapshot,
                audit_metadata,
            })
            .await?;
        Ok(())
    }

    /// Non-versioned records write one absent-conditioned item;
    /// versioned records write `v1`+`v0` in one transaction, both absent.
    pub async fn create_new<T: Model>(
        &self,
        data: BTreeMap<String, FieldValue>,
        override_id: Option<String>,
        changed_by: Option<String>,
        audit_metadata: Option<serde_json::Value>,
    ) -> Result<Record> {
        let schema = self.schema_for::<T>()?;
        let resource_id = override_id.unwrap_or_else(|| Id::generate().to_string_encoded());
        let now = Utc::now();
        let version = schema.versioned.then_some(1u32);
        let identity = RecordIdentity { resource_id: resource_id.clone(), created_at: now, updated_at: now, version };

        let mut business_fields = data;
        let (placeholders, blob_versions) = self
            .divert_blob_fields(&schema, &resource_id, version, &mut business_fields, &BTreeMap::new(), &[])
            .await?;
        let blob_field_names: Vec<String> = placeholders.iter().map(|p| p.field_name.clone()).collect();

        let state = build_state(identity.clone(), business_fields.clone());
        let item_body = self.assemble_item_body(&schema, &state, &blob_field_names, &blob_versions)?;

        let write_result = if schema.versioned {
            let v1_key = PrimaryKey::versioned_history(&schema.discriminator, &resource_id, 1);
            let v0_key = PrimaryKey::versioned_current(&schema.discriminator, &resource_id);
            let mut v1_item = item_body.clone();
            v1_item.insert("pk".to_string(), FieldValue::String(v1_key.pk));
            v1_item.insert("sk".to_string(), FieldValue::String(v1_key.sk));
            let mut v0_item = item_body;
            v0_item.insert("pk".to_string(), FieldValue::String(v0_key.pk));
            v0_item.insert("sk".to_string(), FieldValue::String(v0_key.sk));
            self.backend
                .transact_write(vec![
                    TransactWrite::Put { item: v1_item, condition: Some(WriteCondition::Absent) },
                    TransactWrite::Put { item: v0_item, condition: Some(WriteCondition::Absent) },
                ])
                .await
        } else {
            let key = PrimaryKey::non_versioned(&schema.discriminator, &resource_id);
            let mut item = item_body;
            item.insert("pk".to_string(), FieldValue::String(key.pk));
            item.insert("sk".to_string(), FieldValue::String(key.sk));
            self.backend.put_item(item, Some(WriteCondition::Absent)).await
        };

        if let Err(err) = write_result {
            if conditional_check_failed(&err) {
                return Err(Error::Validation(format!("resource id collision creating {}: {resource_id}", schema.type_name)));
            }
            return Err(err);
        }

        self.stats.record_create().await?;
        let record = Record { identity, fields: business_fields, blob_placeholders: placeholders, blob_versions };
        self.maybe_write_audit(&schema, AuditOperation::Create, &resource_id, None, Some(&record), changed_by, audit_metadata)
            .await?;
        Ok(record)
    }

    pub async fn get_existing<T: Model>(&self, id: &str, version: Option<u32>, load_blobs: bool, consistent: bool) -> Result<Option<Record>> {
        let schema = self.schema_for::<T>()?;
        let key = match (schema.versioned, version) {
            (false, _) => PrimaryKey::non_versioned(&schema.discriminator, id),
            (true, None) => PrimaryKey::versioned_current(&schema.discriminator, id),
            (true, Some(v)) => PrimaryKey::versioned_history(&schema.discriminator, id, v),
        };
        match self.backend.get_item(&key.pk, &key.sk, consistent).await? {
            Some(item) => Ok(Some(self.decode_record(&schema, &item, load_blobs).await?)),
            None => Ok(None),
        }
    }

    pub async fn read_existing<T: Model>(&self, id: &str, version: Option<u32>, load_blobs: bool, consistent: bool) -> Result<Record> {
        self.get_existing::<T>(id, version, load_blobs, consistent)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{} {id}", T::TYPE_NAME)))
    }

    /// Versioned records go through the two-item transaction
    /// with the `v0.version == current` precondition; non-versioned records
    /// are a single unconditional replace.
    pub async fn update_existing<T: Model>(
        &self,
        existing: &Record,
        patch: BTreeMap<String, FieldValue>,
        clear_fields: Vec<String>,
        changed_by: Option<String>,
        audit_metadata: Option<serde_json::Value>,
    ) -> Result<Record> {
        let schema = self.schema_for::<T>()?;
        let resource_id = existing.identity.resource_id.clone();
        let now = Utc::now();

        let mut business_fields = existing.fields.clone();
        for (k, v) in patch {
            business_fields.insert(k, v);
        }
        for field in &clear_fields {
            business_fields.insert(field.clone(), FieldValue::Null);
        }

        if schema.versioned {
            let current_version = existing
                .identity
                .version
                .ok_or_else(|| Error::Configuration(format!("schema {} is versioned but record carries no version", schema.type_name)))?;
            let new_version = current_version + 1;
            let new_identity =
                RecordIdentity { resource_id: resource_id.clone(), created_at: existing.identity.created_at, updated_at: now, version: Some(new_version) };

            let (placeholders, blob_versions) = self
                .divert_blob_fields(&schema, &resource_id, Some(new_version), &mut business_fields, &existing.blob_versions, &existing.blob_placeholders)
                .await?;
            let blob_field_names: Vec<String> = placeholders.iter().map(|p| p.field_name.clone()).collect();

            let state = build_state(new_identity.clone(), business_fields.clone());
            let item_body = self.assemble_item_body(&schema, &state, &blob_field_names, &blob_versions)?;

            let vn_key = PrimaryKey::versioned_history(&schema.discriminator, &resource_id, new_version);
            let v0_key = PrimaryKey::versioned_current(&schema.discriminator, &resource_id);
            let mut vn_item = item_body.clone();
            vn_item.insert("pk".to_string(), FieldValue::String(vn_key.pk));
            vn_item.insert("sk".to_string(), FieldValue::String(vn_key.sk));
            let mut v0_item = item_body;
            v0_item.insert("pk".to_string(), FieldValue::String(v0_key.pk));
            v0_item.insert("sk".to_string(), FieldValue::String(v0_key.sk));

            let result = self
                .backend
                .transact_write(vec![
                    TransactWrite::Put { item: vn_item, condition: Some(WriteCondition::Absent) },
                    TransactWrite::Put { item: v0_item, condition: Some(WriteCondition::ExistsWithVersion(current_version)) },
                ])
                .await;
            if let Err(err) = result {
                if conditional_check_failed(&err) {
                    return Err(Error::VersionConflict(format!("record {resource_id} was not at version {current_version}; update rejected")));
                }
                return Err(err);
            }

            self.stats.record_update().await?;
            self.enforce_version_limit(&schema, &resource_id).await?;

            let new_record = Record { identity: new_identity, fields: business_fields, blob_placeholders: placeholders, blob_versions };
            self.maybe_write_audit(&schema, AuditOperation::Update, &resource_id, Some(existing), Some(&new_record), changed_by, audit_metadata)
                .await?;
            Ok(new_record)
        } else {
            let new_identity = RecordIdentity { resource_id: resource_id.clone(), created_at: existing.identity.created_at, updated_at: now, version: None };
            let (placeholders, blob_versions) = self
                .divert_blob_fields(&schema, &resource_id, None, &mut business_fields, &BTreeMap::new(), &existing.blob_placeholders)
                .await?;
            let blob_field_names: Vec<String> = placeholders.iter().map(|p| p.field_name.clone()).collect();
            let state = build_state(new_identity.clone(), business_fields.clone());
            let item_body = self.assemble_item_body(&schema, &state, &blob_field_names, &blob_versions)?;
            let key = PrimaryKey::non_versioned(&schema.discriminator, &resource_id);
            let mut item = item_body;
            item.insert("pk".to_string(), FieldValue::String(key.pk));
            item.insert("sk".to_string(), FieldValue::String(key.sk));
            self.backend.put_item(item, None).await?;
            self.stats.record_update().await?;
            let new_record = Record { identity: new_identity, fields: business_fields, blob_placeholders: placeholders, blob_versions };
            self.maybe_write_audit(&schema, AuditOperation::Update, &resource_id, Some(existing), Some(&new_record), changed_by, audit_metadata)
                .await?;
            Ok(new_record)
        }
    }

    /// For versioned records, targets one version; deleting
    /// the version currently mirrored at `v0` also removes `v0`.
    pub async fn delete_existing<T: Model>(&self, record: &Record, changed_by: Option<String>, audit_metadata: Option<serde_json::Value>) -> Result<()> {
        let schema = self.schema_for::<T>()?;
        let resource_id = &record.identity.resource_id;

        if schema.versioned {
            let version = record.identity.version.ok_or_else(|| Error::Configuration("versioned record missing version".to_string()))?;
            let vn_key = PrimaryKey::versioned_history(&schema.discriminator, resource_id, version);
            let v0_key = PrimaryKey::versioned_current(&schema.discriminator, resource_id);
            let v0_item = self.backend.get_item(&v0_key.pk, &v0_key.sk, true).await?;
            let is_latest = v0_item
                .as_ref()
                .is_some_and(|item| matches!(item.get("version"), Some(FieldValue::Number(d)) if d.to_i64().ok() == Some(i64::from(version))));
            self.backend.delete_item(&vn_key.pk, &vn_key.sk, None).await?;
            if is_latest {
                self.backend.delete_item(&v0_key.pk, &v0_key.sk, None).await?;
            }
        } else {
            let key = PrimaryKey::non_versioned(&schema.discriminator, resource_id);
            self.backend.delete_item(&key.pk, &key.sk, None).await?;
        }

        self.stats.record_delete().await?;
        self.maybe_write_audit(&schema, AuditOperation::Delete, resource_id, Some(record), None, changed_by, audit_metadata).await?;
        Ok(())
    }

    pub async fn delete_all_versions<T: Model>(&self, id: &str) -> Result<()> {
        let schema = self.schema_for::<T>()?;
        if schema.versioned {
            let pk = PrimaryKey::non_versioned(&schema.discriminator, id).pk;
            let condition = KeyCondition { index: None, partition_key: pk.clone(), sort_key_prefix: None, sort_key_between: None };
            let page = self.backend.query(condition, None, 10_000, true).await?;
            let delete_keys: Vec<(String, String)> = page
                .items
                .iter()
                .filter_map(|item| match item.get("sk") {
                    Some(FieldValue::String(sk)) => Some((pk.clone(), sk.clone())),
                    _ => None,
                })
                .collect();
            self.backend.batch_delete(delete_keys).await?;
        } else {
            let key = PrimaryKey::non_versioned(&schema.discriminator, id);
            self.backend.delete_item(&key.pk, &key.sk, None).await?;
        }
        let _ = self.blob_store.delete_all_blobs(self.blob_key_prefix.as_deref(), &schema.type_name, id).await;
        self.stats.record_delete().await?;
        Ok(())
    }

    /// Newest-first, excluding the `v0` mirror.
    pub async fn get_all_versions<T: Model>(&self, id: &str, load_blobs: bool) -> Result<Vec<Record>> {
        let schema = self.schema_for::<T>()?;
        if !schema.versioned {
            return Err(Error::Configuration(format!("schema {} is not versioned", schema.type_name)));
        }
        let pk = PrimaryKey::non_versioned(&schema.discriminator, id).pk;
        let condition = KeyCondition { index: None, partition_key: pk, sort_key_prefix: Some("v".to_string()), sort_key_between: None };
        let page = self.backend.query(condition, None, 10_000, true).await?;
        let mut records = Vec::new();
        for item in &page.items {
            let Some(FieldValue::String(sk)) = item.get("sk") else { continue };
            if keys::parse_version_sort_key(sk).is_none() {
                continue;
            }
            records.push(self.decode_record(&schema, item, load_blobs).await?);
        }
        records.sort_by(|a, b| b.identity.version.cmp(&a.identity.version));
        Ok(records)
    }

    /// Numeric sort (not lexicographic SK) over every historical
    /// item, batch-deleting the oldest beyond `max_versions`.
    async fn enforce_version_limit(&self, schema: &RecordSchema, resource_id: &str) -> Result<()> {
        let Some(max_versions) = schema.max_versions else { return Ok(()) };
        let pk = PrimaryKey::non_versioned(&schema.discriminator, resource_id).pk;
        let condition = KeyCondition { index: None, partition_key: pk.clone(), sort_key_prefix: Some("v".to_string()), sort_key_between: None };
        let page = self.backend.query(condition, None, 10_000, true).await?;
        let mut versions: Vec<(u32, String)> = page
            .items
            .iter()
            .filter_map(|item| {
                let sk = match item.get("sk") {
                    Some(FieldValue::String(s)) => s.clone(),
                    _ => return None,
                };
                let v = keys::parse_version_sort_key(&sk)?;
                Some((v, sk))
            })
            .collect();
        versions.sort_by_key(|(v, _)| *v);
        if versions.len() as u32 <= max_versions {
            return Ok(());
        }
        let excess = versions.len() - max_versions as usize;
        let to_delete: Vec<(String, String)> = versions[..excess].iter().map(|(_, sk)| (pk.clone(), sk.clone())).collect();
        self.backend.batch_delete(to_delete).await
    }

    /// Builds the write set a create would issue, without executing it.
    /// Mirrors `create_new`'s item assembly exactly; used by
    /// [`crate::transaction::TransactionCoordinator`] to batch several
    /// records' writes into one `transact_write` call.
    pub(crate) async fn prepare_create<T: Model>(
        &self,
        data: BTreeMap<String, FieldValue>,
        override_id: Option<String>,
    ) -> Result<(Vec<TransactWrite>, Record)> {
        let schema = self.schema_for::<T>()?;
        let resource_id = override_id.unwrap_or_else(|| Id::generate().to_string_encoded());
        let now = Utc::now();
        let version = schema.versioned.then_some(1u32);
        let identity = RecordIdentity { resource_id: resource_id.clone(), created_at: now, updated_at: now, version };

        let mut business_fields = data;
        let (placeholders, blob_versions) = self
            .divert_blob_fields(&schema, &resource_id, version, &mut business_fields, &BTreeMap::new(), &[])
            .await?;
        let blob_field_names: Vec<String> = placeholders.iter().map(|p| p.field_name.clone()).collect();

        let state = build_state(identity.clone(), business_fields.clone());
        let item_body = self.assemble_item_body(&schema, &state, &blob_field_names, &blob_versions)?;

        let writes = if schema.versioned {
            let v1_key = PrimaryKey::versioned_history(&schema.discriminator, &resource_id, 1);
            let v0_key = PrimaryKey::versioned_current(&schema.discriminator, &resource_id);
            let mut v1_item = item_body.clone();
            v1_item.insert("pk".to_string(), FieldValue::String(v1_key.pk));
            v1_item.insert("sk".to_string(), FieldValue::String(v1_key.sk));
            let mut v0_item = item_body;
            v0_item.insert("pk".to_string(), FieldValue::String(v0_key.pk));
            v0_item.insert("sk".to_string(), FieldValue::String(v0_key.sk));
            vec![
                TransactWrite::Put { item: v1_item, condition: Some(WriteCondition::Absent) },
                TransactWrite::Put { item: v0_item, condition: Some(WriteCondition::Absent) },
            ]
        } else {
            let key = PrimaryKey::non_versioned(&schema.discriminator, &resource_id);
            let mut item = item_body;
            item.insert("pk".to_string(), FieldValue::String(key.pk));
            item.insert("sk".to_string(), FieldValue::String(key.sk));
            vec![TransactWrite::Put { item, condition: Some(WriteCondition::Absent) }]
        };

        let record = Record { identity, fields: business_fields, blob_placeholders: placeholders, blob_versions };
        Ok((writes, record))
    }

    /// Builds the write set an update would issue, without executing it.
    /// Mirrors `update_existing`'s item assembly; see `prepare_create`.
    pub(crate) async fn prepare_update<T: Model>(
        &self,
        existing: &Record,
        patch: BTreeMap<String, FieldValue>,
        clear_fields: Vec<String>,
    ) -> Result<(Vec<TransactWrite>, Record)> {
        let schema = self.schema_for::<T>()?;
        let resource_id = existing.identity.resource_id.clone();
        let now = Utc::now();

        let mut business_fields = existing.fields.clone();
        for (k, v) in patch {
            business_fields.insert(k, v);
        }
        for field in &clear_fields {
            business_fields.insert(field.clone(), FieldValue::Null);
        }

        if schema.versioned {
            let current_version = existing
                .identity
                .version
                .ok_or_else(|| Error::Configuration(format!("schema {} is versioned but record carries no version", schema.type_name)))?;
            let new_version = current_version + 1;
            let new_identity =
                RecordIdentity { resource_id: resource_id.clone(), created_at: existing.identity.created_at, updated_at: now, version: Some(new_version) };

            let (placeholders, blob_versions) = self
                .divert_blob_fields(&schema, &resource_id, Some(new_version), &mut business_fields, &existing.blob_versions, &existing.blob_placeholders)
                .await?;
            let blob_field_names: Vec<String> = placeholders.iter().map(|p| p.field_name.clone()).collect();

            let state = build_state(new_identity.clone(), business_fields.clone());
            let item_body = self.assemble_item_body(&schema, &state, &blob_field_names, &blob_versions)?;

            let vn_key = PrimaryKey::versioned_history(&schema.discriminator, &resource_id, new_version);
            let v0_key = PrimaryKey::versioned_current(&schema.discriminator, &resource_id);
            let mut vn_item = item_body.clone();
            vn_item.insert("pk".to_string(), FieldValue::String(vn_key.pk));
            vn_item.insert("sk".to_string(), FieldValue::String(vn_key.sk));
            let mut v0_item = item_body;
            v0_item.insert("pk".to_string(), FieldValue::String(v0_key.pk));
            v0_item.insert("sk".to_string(), FieldValue::String(v0_key.sk));

            let writes = vec![
                TransactWrite::Put { item: vn_item, condition: Some(WriteCondition::Absent) },
                TransactWrite::Put { item: v0_item, condition: Some(WriteCondition::ExistsWithVersion(current_version)) },
            ];
            let record = Record { identity: new_identity, fields: business_fields, blob_placeholders: placeholders, blob_versions };
            Ok((writes, record))
        } else {
            let new_identity = RecordIdentity { resource_id: resource_id.clone(), created_at: existing.identity.created_at, updated_at: now, version: None };
            let (placeholders, blob_versions) = self
                .divert_blob_fields(&schema, &resource_id, None, &mut business_fields, &BTreeMap::new(), &existing.blob_placeholders)
                .await?;
            let blob_field_names: Vec<String> = placeholders.iter().map(|p| p.field_name.clone()).collect();
            let state = build_state(new_identity.clone(), business_fields.clone());
            let item_body = self.assemble_item_body(&schema, &state, &blob_field_names, &blob_versions)?;
            let key = PrimaryKey::non_versioned(&schema.discriminator, &resource_id);
            let mut item = item_body;
            item.insert("pk".to_string(), FieldValue::String(key.pk));
            item.insert("sk".to_string(), FieldValue::String(key.sk));
            let writes = vec![TransactWrite::Put { item, condition: None }];
            let record = Record { identity: new_identity, fields: business_fields, blob_placeholders: placeholders, blob_versions };
            Ok((writes, record))
        }
    }

    /// Builds the write set a delete would issue, without executing it.
    /// Targets only the current item (`v0` for versioned schemas) and never
    /// walks version history -- `delete_all_versions` remains the way to
    /// remove a versioned record's full history.
    pub(crate) fn prepare_delete<T: Model>(&self, record: &Record) -> Result<Vec<TransactWrite>> {
        let schema = self.schema_for::<T>()?;
        let key = self.current_key(&schema, &record.identity.resource_id);
        Ok(vec![TransactWrite::Delete { pk: key.pk, sk: key.sk, condition: None }])
    }

    pub(crate) async fn finalize_create(
        &self,
        schema: &RecordSchema,
        resource_id: &str,
        record: &Record,
        changed_by: Option<String>,
        audit_metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        self.stats.record_create().await?;
        self.maybe_write_audit(schema, AuditOperation::Create, resource_id, None, Some(record), changed_by, audit_metadata).await
    }

    pub(crate) async fn finalize_update(
        &self,
        schema: &RecordSchema,
        resource_id: &str,
        old: &Record,
        new: &Record,
        changed_by: Option<String>,
        audit_metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        self.stats.record_update().await?;
        self.enforce_version_limit(schema, resource_id).await?;
        self.maybe_write_audit(schema, AuditOperation::Update, resource_id, Some(old), Some(new), changed_by, audit_metadata).await
    }

    pub(crate) async fn finalize_delete(
        &self,
        schema: &RecordSchema,
        resource_id: &str,
        old: &Record,
        changed_by: Option<String>,
        audit_metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        self.stats.record_delete().await?;
        self.maybe_write_audit(schema, AuditOperation::Delete, resource_id, Some(old), None, changed_by, audit_metadata).await
    }

    /// Appends a new version whose field values equal a
    /// prior version's, carrying that version's blob references forward.
    pub async fn restore_version<T: Model>(&self, id: &str, version: u32, changed_by: Option<String>) -> Result<Record> {
        let schema = self.schema_for::<T>()?;
        if !schema.versioned {
            return Err(Error::Configuration(format!("schema {} is not versioned; cannot restore", schema.type_name)));
        }
        let historical = self
            .get_existing::<T>(id, Some(version), false, true)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{} version {version} for {id}", schema.type_name)))?;
        let current = self
            .get_existing::<T>(id, None, false, true)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{} {id}", schema.type_name)))?;

        let current_version = current.identity.version.unwrap_or(0);
        let new_version = current_version + 1;
        let now = Utc::now();
        let new_identity = RecordIdentity { resource_id: id.to_string(), created_at: current.identity.created_at, updated_at: now, version: Some(new_version) };

        let mut business_fields = historical.fields.clone();
        for field in current.fields.keys() {
            business_fields.entry(field.clone()).or_insert(FieldValue::Null);
        }

        let (placeholders, blob_versions) = self
            .divert_blob_fields(&schema, id, Some(new_version), &mut business_fields, &historical.blob_versions, &historical.blob_placeholders)
            .await?;
        let blob_field_names: Vec<String> = placeholders.iter().map(|p| p.field_name.clone()).collect();

        let state = build_state(new_identity.clone(), business_fields.clone());
        let item_body = self.assemble_item_body(&schema, &state, &blob_field_names, &blob_versions)?;

        let vn_key = PrimaryKey::versioned_history(&schema.discriminator, id, new_version);
        let v0_key = PrimaryKey::versioned_current(&schema.discriminator, id);
        let mut vn_item = item_body.clone();
        vn_item.insert("pk".to_string(), FieldValue::String(vn_key.pk));
        vn_item.insert("sk".to_string(), FieldValue::String(vn_key.sk));
        let mut v0_item = item_body;
        v0_item.insert("pk".to_string(), FieldValue::String(v0_key.pk));
        v0_item.insert("sk".to_string(), FieldValue::String(v0_key.sk));

        let result = self
            .backend
            .transact_write(vec![
                TransactWrite::Put { item: vn_item, condition: Some(WriteCondition::Absent) },
                TransactWrite::Put { item: v0_item, condition: Some(WriteCondition::ExistsWithVersion(current_version)) },
            ])
            .await;
        if let Err(err) = result {
            if conditional_check_failed(&err) {
                return Err(Error::VersionConflict(format!("record {id} changed concurrently during restore")));
            }
            return Err(err);
        }

        self.stats.record_update().await?;
        self.enforce_version_limit(&schema, id).await?;

        let new_record = Record { identity: new_identity, fields: business_fields, blob_placeholders: placeholders, blob_versions };
        self.maybe_write_audit(&schema, AuditOperation::Restore, id, Some(&current), Some(&new_record), changed_by, None).await?;
        Ok(new_record)
    }

    pub async fn increment_counter<T: Model>(&self, record: &Record, field: &str, by: f64) -> Result<f64> {
        let schema = self.schema_for::<T>()?;
        match record.fields.get(field) {
            Some(FieldValue::Number(_)) => {}
            Some(_) => return Err(Error::Validation(format!("field {field} is not numeric"))),
            None => return Err(Error::Validation(format!("unknown field: {field}"))),
        }
        let key = self.current_key(&schema, &record.identity.resource_id);
        self.backend.add_numeric(&key.pk, &key.sk, field, by).await
    }

    pub async fn add_to_set<T: Model>(&self, record: &Record, field: &str, value: &str) -> Result<()> {
        self.mutate_set::<T>(record, field, value, true).await
    }

    pub async fn remove_from_set<T: Model>(&self, record: &Record, field: &str, value: &str) -> Result<()> {
        self.mutate_set::<T>(record, field, value, false).await
    }

    async fn mutate_set<T: Model>(&self, record: &Record, field: &str, value: &str, add: bool) -> Result<()> {
        let schema = self.schema_for::<T>()?;
        if !matches!(schema.field_kind(field), FieldKind::StringSet | FieldKind::NumberSet) {
            return Err(Error::Validation(format!("field {field} is not declared as a set")));
        }
        let key = self.current_key(&schema, &record.identity.resource_id);
        self.backend.update_string_set(&key.pk, &key.sk, field, value, add).await
    }

    /// Both fields must be declared blob fields; source must exist;
    /// self-copy is rejected; mismatched compression only warns.
    pub async fn copy_blob<T: Model>(&self, src: &Record, src_field: &str, tgt: &Record, tgt_field: &str, delete_source: bool) -> Result<BlobPlaceholder> {
        let schema = self.schema_for::<T>()?;
        let src_spec = schema
            .blob_fields
            .get(src_field)
            .ok_or_else(|| Error::Validation(format!("{src_field} is not a declared blob field")))?;
        let tgt_spec = schema
            .blob_fields
            .get(tgt_field)
            .ok_or_else(|| Error::Validation(format!("{tgt_field} is not a declared blob field")))?;

        let src_version = if schema.versioned { src.blob_versions.get(src_field).copied() } else { None };
        let tgt_version = if schema.versioned { Some(tgt.identity.version.unwrap_or(1)) } else { None };

        let source_key = blob::blob_key(self.blob_key_prefix.as_deref(), &schema.type_name, &src.identity.resource_id, src_version, src_field);
        let dest_key = blob::blob_key(self.blob_key_prefix.as_deref(), &schema.type_name, &tgt.identity.resource_id, tgt_version, tgt_field);

        if source_key == dest_key {
            return Err(Error::Validation("cannot copy a blob onto itself".to_string()));
        }

        self.blob_store.copy_blob(&source_key, &dest_key, src_spec.compress, tgt_spec.compress).await?;
        let size_bytes = self.blob_store.get_raw(&dest_key).await.map(|b| b.len() as u64).unwrap_or(0);
        let placeholder = BlobPlaceholder {
            field_name: tgt_field.to_string(),
            key: dest_key,
            size_bytes,
            content_type: tgt_spec.content_type.clone(),
            compressed: tgt_spec.compress,
        };

        self.update_blob_reference(&schema, tgt, tgt_field, tgt_version).await?;

        if delete_source {
            self.blob_store.delete(&source_key).await?;
        }

        Ok(placeholder)
    }

    /// Verifies the external object exists,
    /// copies it into the managed key, then updates the record item the same
    /// way `copy_blob` does.
    pub async fn register_external_blob<T: Model>(
        &self,
        record: &Record,
        field: &str,
        source_key: &str,
        content_type: Option<String>,
        compressed: Option<bool>,
        delete_source: bool,
    ) -> Result<BlobPlaceholder> {
        let schema = self.schema_for::<T>()?;
        let spec = schema.blob_fields.get(field).ok_or_else(|| Error::Validation(format!("{field} is not a declared blob field")))?;
        let version = if schema.versioned { record.identity.version } else { None };
        let managed_key = blob::blob_key(self.blob_key_prefix.as_deref(), &schema.type_name, &record.identity.resource_id, version, field);

        self.blob_store.register_external(source_key, &managed_key).await?;
        let size_bytes = self.blob_store.get_raw(&managed_key).await.map(|b| b.len() as u64).unwrap_or(0);
        let placeholder = BlobPlaceholder {
            field_name: field.to_string(),
            key: managed_key,
            size_bytes,
            content_type: content_type.or_else(|| spec.content_type.clone()),
            compressed: compressed.unwrap_or(spec.compress),
        };

        self.update_blob_reference(&schema, record, field, version).await?;
        if delete_source {
            self.blob_store.delete(source_key).await?;
        }
        Ok(placeholder)
    }

    /// Patches `_blob_fields`/`_blob_versions` on the target record's
    /// current item (and, for versioned targets, its `v{n}` history item)
    /// without going through a full `update_existing` -- copy/register are
    /// metadata-only mutations, not new record versions.
    async fn update_blob_reference(&self, schema: &RecordSchema, tgt: &Record, tgt_field: &str, tgt_version: Option<u32>) -> Result<()> {
        let resource_id = &tgt.identity.resource_id;
        let mut keys_to_patch = vec![self.current_key(schema, resource_id)];
        if schema.versioned {
            keys_to_patch.push(PrimaryKey::versioned_history(&schema.discriminator, resource_id, tgt_version.unwrap_or(tgt.identity.version.unwrap_or(1))));
        }

        for key in keys_to_patch {
            let Some(mut item) = self.backend.get_item(&key.pk, &key.sk, true).await? else { continue };
            let mut blob_fields: Vec<String> = match item.get("_blob_fields") {
                Some(FieldValue::List(items)) => items
                    .iter()
                    .filter_map(|v| match v {
                        FieldValue::String(s) => Some(s.clone()),
                        _ => None,
                    })
                    .collect(),
                _ => Vec::new(),
            };
            if !blob_fields.iter().any(|f| f == tgt_field) {
                blob_fields.push(tgt_field.to_string());
            }
            item.insert("_blob_fields".to_string(), FieldValue::List(blob_fields.into_iter().map(FieldValue::String).collect()));
            if schema.versioned {
                let mut blob_versions: BTreeMap<String, FieldValue> = match item.get("_blob_versions") {
                    Some(FieldValue::Map(m)) => m.clone(),
                    _ => BTreeMap::new(),
                };
                if let Some(v) = tgt_version {
                    blob_versions.insert(tgt_field.to_string(), FieldValue::Number(Decimal::from_i64(i64::from(v))));
                }
                item.insert("_blob_versions".to_string(), FieldValue::Map(blob_versions));
            }
            self.backend.put_item(item, None).await?;
        }
        Ok(())
    }

    /// Thin pass-through to the query engine that also records stats.
    pub async fn paginated_query(&self, schema: &RecordSchema, params: QueryParams<'_>) -> Result<PagedResults> {
        let engine = QueryEngine::new(self.backend.clone());
        let result = engine.paginated_query(schema, params).await?;
        self.stats.record_query(result.api_calls_made).await?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLogQuerier;
    use crate::backend::memory::{MemoryObjectStoreBackend, MemoryTableBackend};
    use crate::blob::BlobCacheConfig;
    use serde::Deserialize;
    use singletable_core::schema::{AuditConfig, BlobFieldSpec};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Doc {
        resource_id: String,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        version: Option<u32>,
        title: String,
        #[serde(default)]
        price: Option<f64>,
        #[serde(default)]
        notes: Option<String>,
    }

    impl Model for Doc {
        const TYPE_NAME: &'static str = "Doc";
    }

    fn engine_with_schema(schema: RecordSchema) -> PersistenceEngine {
        let backend = Arc::new(MemoryTableBackend::new());
        let object_store = Arc::new(MemoryObjectStoreBackend::new());
        let blob_store = Arc::new(BlobStore::new(object_store, BlobCacheConfig::default()));
        let mut registry = SchemaRegistry::new();
        registry.register(schema);
        PersistenceEngine::new(backend, None, blob_store, Arc::new(registry), None)
    }

    fn field_map(pairs: &[(&str, FieldValue)]) -> BTreeMap<String, FieldValue> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn create_then_read_round_trips_non_versioned() {
        let engine = engine_with_schema(RecordSchema::new("Doc"));
        let record = engine
            .create_new::<Doc>(field_map(&[("title", FieldValue::String("hello".to_string()))]), None, None, None)
            .await
            .unwrap();
        let read = engine.read_existing::<Doc>(&record.identity.resource_id, None, false, true).await.unwrap();
        assert_eq!(read.fields.get("title"), Some(&FieldValue::String("hello".to_string())));
        assert_eq!(read.identity.version, None);
    }

    #[tokio::test]
    async fn versioned_update_increments_version_and_mirrors_v0() {
        let engine = engine_with_schema(RecordSchema::new("Doc").versioned());
        let created = engine
            .create_new::<Doc>(field_map(&[("title", FieldValue::String("v1".to_string()))]), None, None, None)
            .await
            .unwrap();
        assert_eq!(created.identity.version, Some(1));

        let updated = engine
            .update_existing::<Doc>(
                &created,
                field_map(&[("title", FieldValue::String("v2".to_string()))]),
                Vec::new(),
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(updated.identity.version, Some(2));

        let current = engine.read_existing::<Doc>(&created.identity.resource_id, None, false, true).await.unwrap();
        assert_eq!(current.identity.version, Some(2));
        assert_eq!(current.fields.get("title"), Some(&FieldValue::String("v2".to_string())));
    }

    #[tokio::test]
    async fn stale_update_from_non_latest_version_is_rejected() {
        let engine = engine_with_schema(RecordSchema::new("Doc").versioned());
        let v1 = engine
            .create_new::<Doc>(field_map(&[("title", FieldValue::String("v1".to_string()))]), None, None, None)
            .await
            .unwrap();
        engine
            .update_existing::<Doc>(&v1, field_map(&[("title", FieldValue::String("v2".to_string()))]), Vec::new(), None, None)
            .await
            .unwrap();

        let err = engine
            .update_existing::<Doc>(&v1, field_map(&[("title", FieldValue::String("v3-stale".to_string()))]), Vec::new(), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::VersionConflict(_)));
    }

    #[tokio::test]
    async fn max_versions_retains_only_the_highest_k_including_double_digits() {
        let engine = engine_with_schema(RecordSchema::new("Doc").versioned().with_max_versions(3));
        let mut record = engine
            .create_new::<Doc>(field_map(&[("title", FieldValue::String("v1".to_string()))]), None, None, None)
            .await
            .unwrap();
        for n in 2..=15 {
            record = engine
                .update_existing::<Doc>(&record, field_map(&[("title", FieldValue::String(format!("v{n}")))]), Vec::new(), None, None)
                .await
                .unwrap();
        }
        let versions = engine.get_all_versions::<Doc>(&record.identity.resource_id, false).await.unwrap();
        let mut numbers: Vec<u32> = versions.iter().map(|r| r.identity.version.unwrap()).collect();
        numbers.sort_unstable();
        assert_eq!(numbers, vec![13, 14, 15]);
    }

    #[tokio::test]
    async fn untouched_blob_field_is_preserved_across_update() {
        let schema = RecordSchema::new("Doc").versioned().with_blob_field("notes", BlobFieldSpec::default());
        let engine = engine_with_schema(schema);
        let created = engine
            .create_new::<Doc>(
                field_map(&[
                    ("title", FieldValue::String("v1".to_string())),
                    ("notes", FieldValue::String("original notes".to_string())),
                ]),
                None,
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(created.blob_versions.get("notes"), Some(&1));

        let updated = engine
            .update_existing::<Doc>(&created, field_map(&[("title", FieldValue::String("v2".to_string()))]), Vec::new(), None, None)
            .await
            .unwrap();
        assert_eq!(updated.identity.version, Some(2));
        // The blob field was never re-supplied: its reference must still
        // point at version 1's stored object, not version 2's.
        assert_eq!(updated.blob_versions.get("notes"), Some(&1));

        let hydrated = engine.read_existing::<Doc>(&updated.identity.resource_id, None, true, true).await.unwrap();
        assert_eq!(hydrated.fields.get("notes"), Some(&FieldValue::String("original notes".to_string())));
    }

    #[tokio::test]
    async fn audit_log_records_update_field_diff() {
        let schema = RecordSchema::new("Doc").with_audit_config(AuditConfig { enabled: true, ..Default::default() });
        let engine = engine_with_schema(schema);
        let record = engine
            .create_new::<Doc>(field_map(&[("title", FieldValue::String("first".to_string()))]), None, Some("alice".to_string()), None)
            .await
            .unwrap();
        engine
            .update_existing::<Doc>(
                &record,
                field_map(&[("title", FieldValue::String("second".to_string()))]),
                Vec::new(),
                Some("bob".to_string()),
                None,
            )
            .await
            .unwrap();

        let querier = AuditLogQuerier::new(engine.backend.clone());
        let logs = querier.get_logs_for_resource("Doc", &record.identity.resource_id, None, None).await.unwrap();
        assert_eq!(logs.results.len(), 2);
    }

    #[tokio::test]
    async fn audit_diff_carries_distinct_blob_versions_across_an_update() {
        let schema = RecordSchema::new("Doc")
            .versioned()
            .with_blob_field("content", BlobFieldSpec::default())
            .with_audit_config(AuditConfig { enabled: true, include_snapshot: true, ..Default::default() });
        let engine = engine_with_schema(schema);
        let created = engine
            .create_new::<Doc>(
                field_map(&[
                    ("title", FieldValue::String("doc".to_string())),
                    ("content", FieldValue::String("A".to_string())),
                ]),
                None,
                None,
                None,
            )
            .await
            .unwrap();
        engine
            .update_existing::<Doc>(&created, field_map(&[("content", FieldValue::String("B".to_string()))]), Vec::new(), None, None)
            .await
            .unwrap();

        let querier = AuditLogQuerier::new(engine.backend.clone());
        let logs = querier.get_logs_for_resource("Doc", &created.identity.resource_id, None, None).await.unwrap();
        assert_eq!(logs.results.len(), 2);
        let update_entry = logs
            .results
            .iter()
            .find(|entry| matches!(entry.get("operation"), Some(FieldValue::String(op)) if op == "UPDATE"))
            .unwrap();
        let Some(FieldValue::Map(changed_fields)) = update_entry.get("changed_fields") else {
            panic!("expected changed_fields map");
        };
        let Some(FieldValue::Map(content_change)) = changed_fields.get("content") else {
            panic!("expected a content diff entry");
        };
        let old_version = match content_change.get("old") {
            Some(FieldValue::Map(old)) => old.get("version").cloned(),
            _ => None,
        };
        let new_version = match content_change.get("new") {
            Some(FieldValue::Map(new)) => new.get("version").cloned(),
            _ => None,
        };
        assert_eq!(old_version, Some(FieldValue::Number(Decimal::from_i64(1))));
        assert_eq!(new_version, Some(FieldValue::Number(Decimal::from_i64(2))));
    }

    #[tokio::test]
    async fn float_field_round_trips_through_decimal_wire_form() {
        let engine = engine_with_schema(RecordSchema::new("Doc").with_float_field("price"));
        let created = engine
            .create_new::<Doc>(
                field_map(&[
                    ("title", FieldValue::String("priced".to_string())),
                    ("price", FieldValue::Number(Decimal::from_f64(19.99))),
                ]),
                None,
                None,
                None,
            )
            .await
            .unwrap();
        let model: Doc = created.to_model().unwrap();
        assert!((model.price.unwrap() - 19.99).abs() < 1e-9);
    }

    #[tokio::test]
    async fn increment_counter_rejects_unknown_field() {
        let engine = engine_with_schema(RecordSchema::new("Doc"));
        let record = engine
            .create_new::<Doc>(field_map(&[("title", FieldValue::String("x".to_string()))]), None, None, None)
            .await
            .unwrap();
        let err = engine.increment_counter::<Doc>(&record, "views", 1.0).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
