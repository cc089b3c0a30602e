//! The transaction coordinator. A caller-opened context that accumulates
//! heterogeneous operations -- create, update, delete, increment,
//! append-to-list -- and commits them as a single backend transaction where
//! the backend contract allows it.
//!
//! The backend draws a line between two different capabilities: single-item
//! update with arithmetic ADD / set ADD-DELETE, and `transact_write_items`
//! for multi-item atomic commits. This module follows that line exactly.
//! Create/update/delete queue onto the atomic batch (one `transact_write`
//! call at `commit`); increment/append apply through the single-item ADD
//! primitive immediately after that batch succeeds, outside its atomicity --
//! the same trade-off `PersistenceEngine::increment_counter` and
//! `add_to_set`/`remove_from_set` already make for their own non-transactional
//! callers. As with those, increment/append only make sense against
//! non-compressed schemas: a compressed record's fields live inside one
//! opaque `data` attribute, so there is no individual backend attribute for
//! `ADD`/`list_append` to target.
//!
//! Rust has no equivalent to a `@contextmanager`-style auto-commit-on-success:
//! `Drop` cannot run async code, so there is no implicit commit when a
//! `TransactionCoordinator` goes out of scope. Callers must call
//! [`TransactionCoordinator::commit`] explicitly; `rollback` (or simply
//! dropping the coordinator without committing) is the discard path.

use std::collections::BTreeMap;
use std::sync::Arc;

use singletable_core::{FieldValue, RecordSchema};
use tracing::warn;

use crate::backend::TransactWrite;
use crate::persistence::{conditional_check_failed, Model, PersistenceEngine, Record};
use crate::{Error, Result};

/// Hard cap on items per `transact_write` call (a backend-imposed limit).
const MAX_TRANSACTION_ITEMS: usize = 100;

/// Intra-transaction read isolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Reads within the transaction are cached after the first fetch, so a
    /// resource read twice returns the same value even if another writer
    /// mutates it in between.
    Snapshot,
    /// Every read refetches from the backend.
    ReadCommitted,
}

/// Tuning knobs for one transaction.
#[derive(Debug, Clone)]
pub struct TransactionConfig {
    pub isolation_level: IsolationLevel,
    pub auto_retry: bool,
    pub max_retries: u32,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self { isolation_level: IsolationLevel::ReadCommitted, auto_retry: true, max_retries: 3 }
    }
}

enum QueuedOp {
    Create {
        writes: Vec<TransactWrite>,
        schema: Arc<RecordSchema>,
        new_record: Record,
        changed_by: Option<String>,
        audit_metadata: Option<serde_json::Value>,
    },
    Update {
        writes: Vec<TransactWrite>,
        schema: Arc<RecordSchema>,
        old_record: Record,
        new_record: Record,
        changed_by: Option<String>,
        audit_metadata: Option<serde_json::Value>,
    },
    Delete {
        writes: Vec<TransactWrite>,
        schema: Arc<RecordSchema>,
        old_record: Record,
        changed_by: Option<String>,
        audit_metadata: Option<serde_json::Value>,
    },
    Increment { pk: String, sk: String, field: String, delta: f64 },
    Append { pk: String, sk: String, field: String, values: Vec<FieldValue> },
}

impl QueuedOp {
    fn transact_items(&self) -> usize {
        match self {
            Self::Create { writes, .. } | Self::Update { writes, .. } | Self::Delete { writes, .. } => writes.len(),
            Self::Increment { .. } | Self::Append { .. } => 0,
        }
    }
}

/// A caller-opened transaction context. Queue operations with
/// `create`/`update`/`delete`/`increment`/`append`, then call `commit`.
pub struct TransactionCoordinator {
    engine: Arc<PersistenceEngine>,
    config: TransactionConfig,
    operations: Vec<QueuedOp>,
    /// Records created earlier in this same transaction, observable by
    /// `read` before `commit` runs.
    pending_creates: BTreeMap<String, Record>,
    /// Populated only under `IsolationLevel::Snapshot`.
    read_cache: BTreeMap<String, Record>,
}

fn cache_key(type_name: &str, resource_id: &str) -> String {
    format!("{type_name}#{resource_id}")
}

impl TransactionCoordinator {
    #[must_use]
    pub fn new(engine: Arc<PersistenceEngine>, config: TransactionConfig) -> Self {
        Self { engine, config, operations: Vec::new(), pending_creates: BTreeMap::new(), read_cache: BTreeMap::new() }
    }

    fn check_capacity(&self, additional: usize) -> Result<()> {
        let current: usize = self.operations.iter().map(QueuedOp::transact_items).sum();
        if current + additional > MAX_TRANSACTION_ITEMS {
            return Err(Error::Validation(format!(
                "transaction would have {} items, exceeds the backend limit of {MAX_TRANSACTION_ITEMS}",
                current + additional
            )));
        }
        Ok(())
    }

    /// Queues a create. Returns the record that will exist once `commit`
    /// succeeds; it is immediately observable to `read` within this same
    /// transaction via the pending-create map.
    pub async fn create<T: Model>(
        &mut self,
        data: BTreeMap<String, FieldValue>,
        override_id: Option<String>,
        changed_by: Option<String>,
        audit_metadata: Option<serde_json::Value>,
    ) -> Result<Record> {
        let (writes, record) = self.engine.prepare_create::<T>(data, override_id).await?;
        self.check_capacity(writes.len())?;
        let schema = self.engine.schema_for::<T>()?;
        self.pending_creates.insert(cache_key(T::TYPE_NAME, &record.identity.resource_id), record.clone());
        self.operations.push(QueuedOp::Create { writes, schema, new_record: record.clone(), changed_by, audit_metadata });
        Ok(record)
    }

    /// Queues an update against `existing` (read earlier, in or out of this
    /// transaction). Versioned schemas carry the same `v0.version ==
    /// existing.version` precondition as `PersistenceEngine::update_existing`.
    pub async fn update<T: Model>(
        &mut self,
        existing: &Record,
        patch: BTreeMap<String, FieldValue>,
        clear_fields: Vec<String>,
        changed_by: Option<String>,
        audit_metadata: Option<serde_json::Value>,
    ) -> Result<Record> {
        let (writes, new_record) = self.engine.prepare_update::<T>(existing, patch, clear_fields).await?;
        self.check_capacity(writes.len())?;
        let schema = self.engine.schema_for::<T>()?;
        self.pending_creates.insert(cache_key(T::TYPE_NAME, &new_record.identity.resource_id), new_record.clone());
        self.operations.push(QueuedOp::Update {
            writes,
            schema,
            old_record: existing.clone(),
            new_record: new_record.clone(),
            changed_by,
            audit_metadata,
        });
        Ok(new_record)
    }

    /// Queues a delete of `record`'s current item (see
    /// `PersistenceEngine::prepare_delete`'s doc comment on scope).
    pub fn delete<T: Model>(
        &mut self,
        record: &Record,
        changed_by: Option<String>,
        audit_metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        let writes = self.engine.prepare_delete::<T>(record)?;
        self.check_capacity(writes.len())?;
        let schema = self.engine.schema_for::<T>()?;
        self.pending_creates.remove(&cache_key(T::TYPE_NAME, &record.identity.resource_id));
        self.operations.push(QueuedOp::Delete { writes, schema, old_record: record.clone(), changed_by, audit_metadata });
        Ok(())
    }

    /// Queues a numeric increment, applied via the backend's atomic `ADD`
    /// outside the transactional batch (see module doc comment).
    pub fn increment<T: Model>(&mut self, record: &Record, field: &str, delta: f64) -> Result<()> {
        let schema = self.engine.schema_for::<T>()?;
        let key = self.engine.current_key(&schema, &record.identity.resource_id);
        self.operations.push(QueuedOp::Increment { pk: key.pk, sk: key.sk, field: field.to_string(), delta });
        Ok(())
    }

    /// Queues a list-append, applied as a read-modify-write outside the
    /// transactional batch (no backend primitive models atomic list append
    /// the way `add_numeric`/`update_string_set` model ADD on numbers/sets).
    pub fn append<T: Model>(&mut self, record: &Record, field: &str, values: Vec<FieldValue>) -> Result<()> {
        let schema = self.engine.schema_for::<T>()?;
        let key = self.engine.current_key(&schema, &record.identity.resource_id);
        self.operations.push(QueuedOp::Append { pk: key.pk, sk: key.sk, field: field.to_string(), values });
        Ok(())
    }

    /// Reads a resource, honoring the pending-create map and (under
    /// `Snapshot` isolation) the transaction's own read cache.
    pub async fn read<T: Model>(&mut self, id: &str) -> Result<Option<Record>> {
        let key = cache_key(T::TYPE_NAME, id);
        if let Some(pending) = self.pending_creates.get(&key) {
            return Ok(Some(pending.clone()));
        }
        if self.config.isolation_level == IsolationLevel::Snapshot {
            if let Some(cached) = self.read_cache.get(&key) {
                return Ok(Some(cached.clone()));
            }
        }
        let result = self.engine.get_existing::<T>(id, None, false, false).await?;
        if self.config.isolation_level == IsolationLevel::Snapshot {
            if let Some(record) = &result {
                self.read_cache.insert(key, record.clone());
            }
        }
        Ok(result)
    }

    /// Discards every queued operation without touching the backend.
    pub fn rollback(mut self) {
        self.operations.clear();
        self.pending_creates.clear();
        self.read_cache.clear();
    }

    /// Issues the transactional batch (one `transact_write` call covering
    /// every queued create/update/delete), retrying on conflict per
    /// `TransactionConfig`, then applies queued increment/append operations
    /// and finalizes stats + audit derivation for every create/update/delete.
    /// Returns the resulting records for create/update ops, in queue order.
    pub async fn commit(self) -> Result<Vec<Record>> {
        if self.operations.is_empty() {
            return Ok(Vec::new());
        }

        let mut writes = Vec::new();
        for op in &self.operations {
            match op {
                QueuedOp::Create { writes: w, .. } | QueuedOp::Update { writes: w, .. } | QueuedOp::Delete { writes: w, .. } => {
                    writes.extend(w.clone());
                }
                QueuedOp::Increment { .. } | QueuedOp::Append { .. } => {}
            }
        }

        if !writes.is_empty() {
            let mut retries = 0u32;
            loop {
                match self.engine.backend().transact_write(writes.clone()).await {
                    Ok(()) => break,
                    Err(err) if conditional_check_failed(&err) => {
                        if self.config.auto_retry && retries < self.config.max_retries {
                            retries += 1;
                            warn!(retries, "transaction conflicted, retrying");
                            continue;
                        }
                        return Err(Error::VersionConflict("transaction failed due to version conflict".to_string()));
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        let mut results = Vec::new();
        for op in self.operations {
            match op {
                QueuedOp::Create { schema, new_record, changed_by, audit_metadata, .. } => {
                    self.engine
                        .finalize_create(&schema, &new_record.identity.resource_id, &new_record, changed_by, audit_metadata)
                        .await?;
                    results.push(new_record);
                }
                QueuedOp::Update { schema, old_record, new_record, changed_by, audit_metadata, .. } => {
                    self.engine
                        .finalize_update(&schema, &new_record.identity.resource_id, &old_record, &new_record, changed_by, audit_metadata)
                        .await?;
                    results.push(new_record);
                }
                QueuedOp::Delete { schema, old_record, changed_by, audit_metadata, .. } => {
                    self.engine
                        .finalize_delete(&schema, &old_record.identity.resource_id, &old_record, changed_by, audit_metadata)
                        .await?;
                }
                QueuedOp::Increment { pk, sk, field, delta } => {
                    self.engine.backend().add_numeric(&pk, &sk, &field, delta).await?;
                }
                QueuedOp::Append { pk, sk, field, values } => {
                    apply_append(self.engine.backend(), &pk, &sk, &field, &values).await?;
                }
            }
        }
        Ok(results)
    }
}

async fn apply_append(
    backend: &Arc<dyn crate::backend::TableBackend>,
    pk: &str,
    sk: &str,
    field: &str,
    values: &[FieldValue],
) -> Result<()> {
    let mut item = backend
        .get_item(pk, sk, true)
        .await?
        .ok_or_else(|| Error::NotFound(format!("item {pk}/{sk} not found for append")))?;
    let mut list = match item.get(field) {
        Some(FieldValue::List(existing)) => existing.clone(),
        _ => Vec::new(),
    };
    list.extend(values.iter().cloned());
    item.insert(field.to_string(), FieldValue::List(list));
    backend.put_item(item, None).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{MemoryObjectStoreBackend, MemoryTableBackend};
    use crate::blob::{BlobCacheConfig, BlobStore};
    use serde::{Deserialize, Serialize};
    use singletable_core::SchemaRegistry;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Counter {
        resource_id: String,
        created_at: chrono::DateTime<chrono::Utc>,
        updated_at: chrono::DateTime<chrono::Utc>,
        version: Option<u32>,
        name: String,
        #[serde(default)]
        total: f64,
        #[serde(default)]
        tags: Vec<String>,
    }

    impl Model for Counter {
        const TYPE_NAME: &'static str = "Counter";
    }

    fn engine() -> Arc<PersistenceEngine> {
        let backend = Arc::new(MemoryTableBackend::new());
        let object_store = Arc::new(MemoryObjectStoreBackend::new());
        let blob_store = Arc::new(BlobStore::new(object_store, BlobCacheConfig::default()));
        let mut registry = SchemaRegistry::new();
        registry.register(RecordSchema::new("Counter"));
        Arc::new(PersistenceEngine::new(backend, None, blob_store, Arc::new(registry), None))
    }

    fn fields(pairs: &[(&str, FieldValue)]) -> BTreeMap<String, FieldValue> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn two_creates_commit_in_one_transaction() {
        let engine = engine();
        let mut tx = TransactionCoordinator::new(engine.clone(), TransactionConfig::default());
        tx.create::<Counter>(fields(&[("name", FieldValue::String("a".into())), ("total", FieldValue::Number(0.into()))]), None, None, None)
            .await
            .unwrap();
        tx.create::<Counter>(fields(&[("name", FieldValue::String("b".into())), ("total", FieldValue::Number(0.into()))]), None, None, None)
            .await
            .unwrap();
        let results = tx.commit().await.unwrap();
        assert_eq!(results.len(), 2);
        for record in &results {
            assert!(engine.get_existing::<Counter>(&record.identity.resource_id, None, false, false).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn create_is_readable_within_the_same_transaction() {
        let engine = engine();
        let mut tx = TransactionCoordinator::new(engine.clone(), TransactionConfig::default());
        let created = tx
            .create::<Counter>(fields(&[("name", FieldValue::String("pending".into()))]), None, None, None)
            .await
            .unwrap();
        let read_back = tx.read::<Counter>(&created.identity.resource_id).await.unwrap();
        assert_eq!(read_back.unwrap().identity.resource_id, created.identity.resource_id);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn rollback_discards_queued_create() {
        let engine = engine();
        let mut tx = TransactionCoordinator::new(engine.clone(), TransactionConfig::default());
        let created = tx
            .create::<Counter>(fields(&[("name", FieldValue::String("discarded".into()))]), None, None, None)
            .await
            .unwrap();
        let id = created.identity.resource_id.clone();
        tx.rollback();
        assert!(engine.get_existing::<Counter>(&id, None, false, false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_transaction_is_rejected_before_commit() {
        let engine = engine();
        let mut tx = TransactionCoordinator::new(engine.clone(), TransactionConfig::default());
        for i in 0..100 {
            let result = tx.create::<Counter>(fields(&[("name", FieldValue::String(format!("n{i}")))]), None, None, None).await;
            if i < 100 {
                // Each non-versioned create is a single transact item; the
                // 101st would push the running total past the limit.
            }
            assert!(result.is_ok(), "create {i} should succeed under the 100-item cap");
        }
        let result = tx.create::<Counter>(fields(&[("name", FieldValue::String("overflow".into()))]), None, None, None).await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn increment_applies_outside_the_atomic_batch() {
        let engine = engine();
        let created = engine
            .create_new::<Counter>(fields(&[("name", FieldValue::String("c".into())), ("total", FieldValue::Number(0.into()))]), None, None, None)
            .await
            .unwrap();
        let mut tx = TransactionCoordinator::new(engine.clone(), TransactionConfig::default());
        tx.increment::<Counter>(&created, "total", 5.0).unwrap();
        tx.commit().await.unwrap();
        let reloaded = engine.get_existing::<Counter>(&created.identity.resource_id, None, false, false).await.unwrap().unwrap();
        assert_eq!(reloaded.fields.get("total"), Some(&FieldValue::Number(5.0.into())));
    }
}
