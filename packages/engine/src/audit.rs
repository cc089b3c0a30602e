//! The audit-log subsystem -- synchronous derivation of change records with
//! field-diffing, blob-reference redaction, and optional routing to a
//! separate physical table.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use singletable_core::schema::AuditConfig;
use singletable_core::{FieldValue, Id, PrimaryKey, RecordSchema};
use tracing::debug;

use crate::backend::{TableBackend, WriteCondition};
use crate::blob::BlobPlaceholder;
use crate::codec;
use crate::query::{PagedResults, QueryEngine, QueryParams};
use crate::{Error, Result};

/// PK prefix and `gsitype` discriminator for audit-log records. The same
/// string drives both, so the two can never independently drift out of
/// sync with each other.
pub const AUDIT_TYPE_NAME: &str = "AuditLog";
pub const AUDIT_DISCRIMINATOR: &str = "_INTERNAL#AuditLog";

/// `{ old, new }` for one changed field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub old: Option<serde_json::Value>,
    pub new: Option<serde_json::Value>,
}

/// The four operations an audit entry can record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditOperation {
    Create,
    Update,
    Delete,
    Restore,
}

/// The redacted blob descriptor substituted into a snapshot, and used as
/// the old/new value for blob-typed fields in a diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobDescriptor {
    #[serde(rename = "__blob_ref__")]
    pub blob_ref: bool,
    pub size_bytes: u64,
    pub version: Option<u32>,
    pub compressed: bool,
    pub content_type: Option<String>,
    pub key: String,
}

impl BlobDescriptor {
    /// `version` comes from the record's `_blob_versions` map, not the
    /// placeholder itself -- a [`BlobPlaceholder`] only knows its own key
    /// and size, while version pinning is per-record.
    #[must_use]
    fn from_placeholder(p: &BlobPlaceholder, version: Option<u32>) -> Self {
        Self {
            blob_ref: true,
            size_bytes: p.size_bytes,
            version,
            compressed: p.compressed,
            content_type: p.content_type.clone(),
            key: p.key.clone(),
        }
    }
}

/// Returns the field-change map for an UPDATE, or `None` if nothing the
/// audit config tracks actually differs.
#[must_use]
pub fn compute_field_diff(
    audit_config: &AuditConfig,
    blob_fields: &std::collections::BTreeSet<String>,
    old_fields: &BTreeMap<String, FieldValue>,
    new_fields: &BTreeMap<String, FieldValue>,
    old_blobs: &[BlobPlaceholder],
    new_blobs: &[BlobPlaceholder],
    old_blob_versions: &BTreeMap<String, u32>,
    new_blob_versions: &BTreeMap<String, u32>,
) -> Option<BTreeMap<String, FieldChange>> {
    if !audit_config.track_field_changes {
        return None;
    }
    let mut all_fields: std::collections::BTreeSet<&String> = old_fields.keys().chain(new_fields.keys()).collect();
    all_fields.extend(blob_fields.iter());

    let mut diff = BTreeMap::new();
    for field in all_fields {
        if audit_config.exclude_fields.contains(field) {
            continue;
        }
        if blob_fields.contains(field) {
            let old_desc = old_blobs
                .iter()
                .find(|p| &p.field_name == field)
                .map(|p| BlobDescriptor::from_placeholder(p, old_blob_versions.get(field).copied()));
            let new_desc = new_blobs
                .iter()
                .find(|p| &p.field_name == field)
                .map(|p| BlobDescriptor::from_placeholder(p, new_blob_versions.get(field).copied()));
            let old_json = old_desc.as_ref().map(|d| serde_json::to_value(d).unwrap_or(serde_json::Value::Null));
            let new_json = new_desc.as_ref().map(|d| serde_json::to_value(d).unwrap_or(serde_json::Value::Null));
            if old_json != new_json {
                diff.insert(field.clone(), FieldChange { old: old_json, new: new_json });
            }
            continue;
        }
        let old_json = old_fields.get(field).cloned().map(|v| v.into_json(singletable_core::FieldKind::Untyped).unwrap_or(serde_json::Value::Null));
        let new_json = new_fields.get(field).cloned().map(|v| v.into_json(singletable_core::FieldKind::Untyped).unwrap_or(serde_json::Value::Null));
        if old_json != new_json {
            diff.insert(field.clone(), FieldChange { old: old_json, new: new_json });
        }
    }
    if diff.is_empty() { None } else { Some(diff) }
}

/// Builds the redacted post-state snapshot: every field as plain JSON
/// except blob fields, which become [`BlobDescriptor`]s.
#[must_use]
pub fn build_snapshot(
    blob_fields: &std::collections::BTreeSet<String>,
    fields: &BTreeMap<String, FieldValue>,
    blobs: &[BlobPlaceholder],
    blob_versions: &BTreeMap<String, u32>,
) -> serde_json::Value {
    let mut out = serde_json::Map::new();
    for (field, value) in fields {
        if blob_fields.contains(field) {
            continue;
        }
        out.insert(
            field.clone(),
            value.clone().into_json(singletable_core::FieldKind::Untyped).unwrap_or(serde_json::Value::Null),
        );
    }
    for placeholder in blobs {
        let descriptor = BlobDescriptor::from_placeholder(placeholder, blob_versions.get(&placeholder.field_name).copied());
        out.insert(placeholder.field_name.clone(), serde_json::to_value(descriptor).unwrap_or(serde_json::Value::Null));
    }
    serde_json::Value::Object(out)
}

/// Resolves `changed_by`, preferring an explicit value over the configured
/// field, failing if `changed_by_required` and nothing resolved.
pub fn resolve_changed_by(
    explicit: Option<String>,
    record_fields: &BTreeMap<String, FieldValue>,
    audit_config: &AuditConfig,
) -> Result<Option<String>> {
    let resolved = explicit.or_else(|| {
        audit_config.changed_by_field.as_ref().and_then(|field| match record_fields.get(field) {
            Some(FieldValue::String(s)) if !s.is_empty() => Some(s.clone()),
            _ => None,
        })
    });
    if audit_config.changed_by_required && resolved.as_deref().is_none_or_str_empty() {
        return Err(Error::AuditRequirement);
    }
    Ok(resolved)
}

trait OptStrEmpty {
    fn is_none_or_str_empty(&self) -> bool;
}
impl OptStrEmpty for Option<&str> {
    fn is_none_or_str_empty(&self) -> bool {
        match self {
            None => true,
            Some(s) => s.is_empty(),
        }
    }
}

/// The fixed per-type configuration for the `AuditLog` record type itself --
/// it is a record type like any other, just with a configuration that
/// never varies by caller.
#[must_use]
pub fn audit_log_schema() -> RecordSchema {
    RecordSchema::new(AUDIT_TYPE_NAME)
        .with_discriminator(AUDIT_DISCRIMINATOR)
        .with_gsi1(singletable_core::schema::GsiSpec::tuple(|state| {
            let resource_type = match state.fields.get("audited_resource_type") {
                Some(FieldValue::String(s)) => s.clone(),
                _ => return None,
            };
            let resource_id = match state.fields.get("audited_resource_id") {
                Some(FieldValue::String(s)) => s.clone(),
                _ => return None,
            };
            Some((format!("{AUDIT_DISCRIMINATOR}#{resource_type}#{resource_id}"), state.resource_id().to_string()))
        }))
        .with_gsi2(singletable_core::schema::GsiSpec::tuple(|state| {
            let resource_type = match state.fields.get("audited_resource_type") {
                Some(FieldValue::String(s)) => s.clone(),
                _ => return None,
            };
            Some((format!("{AUDIT_DISCRIMINATOR}#{resource_type}"), state.resource_id().to_string()))
        }))
}

/// Parameters for deriving and persisting one audit entry.
pub struct AuditEntryParams {
    pub audited_resource_type: String,
    pub audited_resource_id: String,
    pub operation: AuditOperation,
    pub changed_by: Option<String>,
    pub changed_fields: Option<BTreeMap<String, FieldChange>>,
    pub resource_snapshot: Option<serde_json::Value>,
    pub audit_metadata: Option<serde_json::Value>,
}

/// Writes derived audit entries. Deliberately does not recurse through
/// `PersistenceEngine::create_new` -- doing so would make the persistence
/// and audit modules depend on each other. Instead this writes the single
/// non-versioned item directly, with exactly the key/GSI shape `create_new`
/// would have produced for a non-versioned `AuditLog` record, keeping the
/// two entry points indistinguishable from a reader's point of view.
pub struct AuditLogWriter {
    backend: Arc<dyn TableBackend>,
    schema: RecordSchema,
}

impl AuditLogWriter {
    #[must_use]
    pub fn new(backend: Arc<dyn TableBackend>) -> Self {
        Self { backend, schema: audit_log_schema() }
    }

    pub async fn write(&self, params: AuditEntryParams) -> Result<String> {
        let id = Id::generate();
        let resource_id = id.to_string_encoded();
        let now: DateTime<Utc> = Utc::now();
        let key = PrimaryKey::non_versioned(AUDIT_DISCRIMINATOR, &resource_id);

        let mut fields = BTreeMap::new();
        fields.insert("audited_resource_type".to_string(), FieldValue::String(params.audited_resource_type));
        fields.insert("audited_resource_id".to_string(), FieldValue::String(params.audited_resource_id));
        fields.insert("operation".to_string(), FieldValue::String(format!("{:?}", params.operation).to_uppercase()));
        if let Some(changed_by) = &params.changed_by {
            fields.insert("changed_by".to_string(), FieldValue::String(changed_by.clone()));
        }
        if let Some(changed_fields) = &params.changed_fields {
            fields.insert(
                "changed_fields".to_string(),
                FieldValue::from_json(serde_json::to_value(changed_fields).unwrap_or(serde_json::Value::Null)),
            );
        }
        if let Some(snapshot) = &params.resource_snapshot {
            fields.insert("resource_snapshot".to_string(), FieldValue::from_json(snapshot.clone()));
        }
        if let Some(metadata) = &params.audit_metadata {
            fields.insert("audit_metadata".to_string(), FieldValue::from_json(metadata.clone()));
        }

        let mut state = singletable_core::RecordState::new(singletable_core::RecordIdentity {
            resource_id: resource_id.clone(),
            created_at: now,
            updated_at: now,
            version: None,
        });
        state.fields = fields.clone();

        let mut item = codec::encode_fields(&self.schema, &fields)?;
        item.insert("pk".to_string(), FieldValue::String(key.pk.clone()));
        item.insert("sk".to_string(), FieldValue::String(key.sk.clone()));
        item.insert("gsitype".to_string(), FieldValue::String(self.schema.discriminator.clone()));
        item.insert("gsitypesk".to_string(), FieldValue::String(now.to_rfc3339()));
        if let Some(gsi1) = &self.schema.gsi_config.gsi1 {
            let derived = gsi1.derive(&state);
            if let Some(pk) = derived.pk {
                item.insert("gsi1pk".to_string(), FieldValue::String(pk));
            }
        }
        if let Some(gsi2) = &self.schema.gsi_config.gsi2 {
            let derived = gsi2.derive(&state);
            if let Some(pk) = derived.pk {
                item.insert("gsi2pk".to_string(), FieldValue::String(pk));
            }
        }

        debug!(resource_id, operation = ?params.operation, "writing audit log entry");
        self.backend.put_item(item, Some(WriteCondition::Absent)).await?;
        Ok(resource_id)
    }
}

/// Convenience readers over the audit table using the standard query
/// engine.
pub struct AuditLogQuerier {
    query_engine: QueryEngine,
    schema: RecordSchema,
}

impl AuditLogQuerier {
    #[must_use]
    pub fn new(backend: Arc<dyn TableBackend>) -> Self {
        Self { query_engine: QueryEngine::new(backend), schema: audit_log_schema() }
    }

    pub async fn get_logs_for_resource(
        &self,
        resource_type: &str,
        resource_id: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<PagedResults> {
        let partition_key = format!("{AUDIT_DISCRIMINATOR}#{resource_type}#{resource_id}");
        let sort_key_between = match (start, end) {
            (Some(s), Some(e)) => Some((
                singletable_core::Id::from_datetime_deterministic(s).to_string_encoded(),
                singletable_core::Id::from_datetime_deterministic(e).to_string_encoded(),
            )),
            _ => None,
        };
        self.query_engine
            .paginated_query(
                &self.schema,
                QueryParams {
                    index: Some("gsi1"),
                    partition_key,
                    sort_key_between,
                    ascending: false,
                    ..Default::default()
                },
            )
            .await
    }

    pub async fn get_logs_for_resource_type(&self, resource_type: &str) -> Result<PagedResults> {
        self.query_engine
            .paginated_query(
                &self.schema,
                QueryParams {
                    index: Some("gsi2"),
                    partition_key: format!("{AUDIT_DISCRIMINATOR}#{resource_type}"),
                    ascending: false,
                    ..Default::default()
                },
            )
            .await
    }

    pub async fn get_logs_by_operation(&self, resource_type: &str, operation: AuditOperation) -> Result<PagedResults> {
        let wanted = format!("{operation:?}").to_uppercase();
        let filter = move |fields: &BTreeMap<String, FieldValue>| matches!(fields.get("operation"), Some(FieldValue::String(s)) if *s == wanted);
        self.query_engine
            .paginated_query(
                &self.schema,
                QueryParams {
                    index: Some("gsi2"),
                    partition_key: format!("{AUDIT_DISCRIMINATOR}#{resource_type}"),
                    client_filter: Some(&filter),
                    ascending: false,
                    ..Default::default()
                },
            )
            .await
    }

    pub async fn get_logs_by_changer(&self, changed_by: &str, resource_type: Option<&str>) -> Result<PagedResults> {
        let wanted = changed_by.to_string();
        let filter = move |fields: &BTreeMap<String, FieldValue>| matches!(fields.get("changed_by"), Some(FieldValue::String(s)) if *s == wanted);
        let (index, partition_key) = match resource_type {
            Some(t) => (Some("gsi2"), format!("{AUDIT_DISCRIMINATOR}#{t}")),
            None => (Some("gsitype"), self.schema.discriminator.clone()),
        };
        self.query_engine
            .paginated_query(
                &self.schema,
                QueryParams { index, partition_key, client_filter: Some(&filter), ascending: false, ..Default::default() },
            )
            .await
    }

    /// Walks every log for a resource oldest-first, extracting each
    /// recorded old/new for `field`, seeding the initial value from the
    /// CREATE operation's snapshot.
    pub async fn get_field_history(&self, resource_type: &str, resource_id: &str, field: &str) -> Result<Vec<FieldChange>> {
        let mut logs = self.get_logs_for_resource(resource_type, resource_id, None, None).await?;
        logs.results.reverse();
        let mut history = Vec::new();
        for entry in logs.results {
            match entry.get("operation") {
                Some(FieldValue::String(op)) if op == "CREATE" => {
                    if let Some(FieldValue::Map(snapshot)) = entry.get("resource_snapshot") {
                        if let Some(value) = snapshot.get(field) {
                            let json = value.clone().into_json(singletable_core::FieldKind::Untyped)?;
                            history.push(FieldChange { old: None, new: Some(json) });
                        }
                    }
                }
                _ => {
                    if let Some(FieldValue::Map(changes)) = entry.get("changed_fields") {
                        if let Some(FieldValue::Map(change)) = changes.get(field) {
                            let old = change.get("old").cloned().map(|v| v.into_json(singletable_core::FieldKind::Untyped)).transpose()?;
                            let new = change.get("new").cloned().map(|v| v.into_json(singletable_core::FieldKind::Untyped)).transpose()?;
                            history.push(FieldChange { old, new });
                        }
                    }
                }
            }
        }
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryTableBackend;
    use singletable_core::schema::AuditConfig;

    #[test]
    fn field_diff_skips_excluded_fields() {
        let mut audit_config = AuditConfig { track_field_changes: true, ..Default::default() };
        audit_config.exclude_fields.insert("internal_note".to_string());
        let mut old = BTreeMap::new();
        old.insert("title".to_string(), FieldValue::String("a".to_string()));
        old.insert("internal_note".to_string(), FieldValue::String("x".to_string()));
        let mut new = old.clone();
        new.insert("title".to_string(), FieldValue::String("b".to_string()));
        new.insert("internal_note".to_string(), FieldValue::String("y".to_string()));
        let diff = compute_field_diff(&audit_config, &Default::default(), &old, &new, &[], &[], &BTreeMap::new(), &BTreeMap::new()).unwrap();
        assert_eq!(diff.len(), 1);
        assert!(diff.contains_key("title"));
    }

    #[test]
    fn field_diff_compares_blob_metadata_not_payload() {
        let audit_config = AuditConfig { track_field_changes: true, ..Default::default() };
        let mut blob_fields = std::collections::BTreeSet::new();
        blob_fields.insert("content".to_string());
        let old_blobs = vec![BlobPlaceholder {
            field_name: "content".to_string(),
            key: "k1".to_string(),
            size_bytes: 10,
            content_type: None,
            compressed: false,
        }];
        let new_blobs = vec![BlobPlaceholder {
            field_name: "content".to_string(),
            key: "k2".to_string(),
            size_bytes: 20,
            content_type: None,
            compressed: false,
        }];
        let old_versions = BTreeMap::from([("content".to_string(), 1u32)]);
        let new_versions = BTreeMap::from([("content".to_string(), 2u32)]);
        let diff = compute_field_diff(
            &audit_config,
            &blob_fields,
            &BTreeMap::new(),
            &BTreeMap::new(),
            &old_blobs,
            &new_blobs,
            &old_versions,
            &new_versions,
        )
        .unwrap();
        let change = &diff["content"];
        assert_ne!(change.old, change.new);
        assert_eq!(change.old.as_ref().unwrap()["version"], serde_json::json!(1));
        assert_eq!(change.new.as_ref().unwrap()["version"], serde_json::json!(2));
    }

    #[test]
    fn resolve_changed_by_requires_value_when_configured() {
        let audit_config = AuditConfig { changed_by_required: true, ..Default::default() };
        let err = resolve_changed_by(None, &BTreeMap::new(), &audit_config).unwrap_err();
        assert!(matches!(err, Error::AuditRequirement));
    }

    #[tokio::test]
    async fn audit_log_write_is_queryable_by_resource() {
        let backend = Arc::new(MemoryTableBackend::new());
        let writer = AuditLogWriter::new(backend.clone());
        writer
            .write(AuditEntryParams {
                audited_resource_type: "Doc".to_string(),
                audited_resource_id: "abc".to_string(),
                operation: AuditOperation::Create,
                changed_by: Some("alice".to_string()),
                changed_fields: None,
                resource_snapshot: None,
                audit_metadata: None,
            })
            .await
            .unwrap();
        let querier = AuditLogQuerier::new(backend);
        let page = querier.get_logs_for_resource("Doc", "abc", None, None).await.unwrap();
        assert_eq!(page.results.len(), 1);
    }
}
