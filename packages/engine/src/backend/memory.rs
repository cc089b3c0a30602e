//! An in-memory [`TableBackend`] + [`ObjectStoreBackend`], the Rust
//! analogue of the original Python test suite's `moto`-mocked DynamoDB/S3
//! fixtures. Used by every unit test in this crate and available to
//! callers with no feature flags as a zero-dependency default.
//!
//! Queries are implemented as a linear scan filtered by partition key, sort
//! order, and pagination -- adequate for an in-memory stand-in, not
//! represented as a performance model of the real backend.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use singletable_core::{FieldValue, LastEvaluatedKey};

use crate::backend::{
    ConditionalCheckFailed, Item, KeyCondition, ObjectMetadata, ObjectStoreBackend, QueryPage, TableBackend,
    TransactWrite, WriteCondition,
};
use crate::{Error, Result};

type PrimaryKey = (String, String);

/// An in-memory table, indexed by `(pk, sk)`.
#[derive(Default)]
pub struct MemoryTableBackend {
    items: Mutex<BTreeMap<PrimaryKey, Item>>,
    calls: AtomicU64,
}

impl MemoryTableBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of backend RPCs issued, for tests asserting on
    /// `max_api_calls` budgeting behavior.
    #[must_use]
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn partition_attr(index: Option<&str>) -> &'static str {
        match index {
            None => "pk",
            Some("gsitype") => "gsitype",
            Some("gsi1") => "gsi1pk",
            Some("gsi2") => "gsi2pk",
            Some("gsi3") => "gsi3pk",
            Some(other) => unreachable!("unrecognized index reached the memory backend: {other}"),
        }
    }

    fn sort_attr(index: Option<&str>) -> &'static str {
        match index {
            None => "sk",
            Some("gsitype") => "gsitypesk",
            Some("gsi1" | "gsi2") => "pk",
            Some("gsi3") => "gsi3sk",
            Some(other) => unreachable!("unrecognized index reached the memory backend: {other}"),
        }
    }

    fn string_attr(item: &Item, attr: &str) -> Option<String> {
        match item.get(attr) {
            Some(FieldValue::String(s)) => Some(s.clone()),
            _ => None,
        }
    }

    fn check_condition(existing: Option<&Item>, condition: &Option<WriteCondition>, item_index: Option<usize>) -> Result<()> {
        let Some(condition) = condition else { return Ok(()) };
        let ok = match condition {
            WriteCondition::Absent => existing.is_none(),
            WriteCondition::Exists => existing.is_some(),
            WriteCondition::ExistsWithVersion(v) => existing.is_some_and(|item| {
                matches!(item.get("version"), Some(FieldValue::Number(d)) if d.to_i64().map(|n| n as u32) == Ok(*v))
            }),
        };
        if ok {
            Ok(())
        } else {
            Err(Error::backend(ConditionalCheckFailed {
                item_index,
                reason: "condition check failed".to_string(),
            }))
        }
    }
}

#[async_trait]
impl TableBackend for MemoryTableBackend {
    async fn get_item(&self, pk: &str, sk: &str, _consistent: bool) -> Result<Option<Item>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(self.items.lock().get(&(pk.to_string(), sk.to_string())).cloned())
    }

    async fn put_item(&self, item: Item, condition: Option<WriteCondition>) -> Result<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let pk = Self::string_attr(&item, "pk").ok_or_else(|| Error::Validation("item missing pk".to_string()))?;
        let sk = Self::string_attr(&item, "sk").ok_or_else(|| Error::Validation("item missing sk".to_string()))?;
        let mut items = self.items.lock();
        let key = (pk, sk);
        Self::check_condition(items.get(&key), &condition, None)?;
        items.insert(key, item);
        Ok(())
    }

    async fn delete_item(&self, pk: &str, sk: &str, condition: Option<WriteCondition>) -> Result<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let mut items = self.items.lock();
        let key = (pk.to_string(), sk.to_string());
        Self::check_condition(items.get(&key), &condition, None)?;
        items.remove(&key);
        Ok(())
    }

    async fn add_numeric(&self, pk: &str, sk: &str, field: &str, delta: f64) -> Result<f64> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let mut items = self.items.lock();
        let key = (pk.to_string(), sk.to_string());
        let item = items.entry(key).or_insert_with(|| {
            let mut base = Item::new();
            base.insert("pk".to_string(), FieldValue::String(pk.to_string()));
            base.insert("sk".to_string(), FieldValue::String(sk.to_string()));
            base
        });
        let current = match item.get(field) {
            Some(FieldValue::Number(d)) => d.to_f64().unwrap_or(0.0),
            _ => 0.0,
        };
        let new_value = current + delta;
        item.insert(field.to_string(), FieldValue::Number(new_value.into()));
        Ok(new_value)
    }

    async fn update_string_set(&self, pk: &str, sk: &str, field: &str, value: &str, add: bool) -> Result<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let mut items = self.items.lock();
        let key = (pk.to_string(), sk.to_string());
        let item = items.entry(key).or_insert_with(|| {
            let mut base = Item::new();
            base.insert("pk".to_string(), FieldValue::String(pk.to_string()));
            base.insert("sk".to_string(), FieldValue::String(sk.to_string()));
            base
        });
        let mut set = match item.remove(field) {
            Some(FieldValue::StringSet(s)) => s,
            _ => Default::default(),
        };
        if add {
            set.insert(value.to_string());
        } else {
            set.remove(value);
        }
        if !set.is_empty() {
            item.insert(field.to_string(), FieldValue::StringSet(set));
        }
        Ok(())
    }

    async fn transact_write(&self, writes: Vec<TransactWrite>) -> Result<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let mut items = self.items.lock();
        // Validate every condition first so the transaction is all-or-nothing.
        for (i, write) in writes.iter().enumerate() {
            match write {
                TransactWrite::Put { item, condition } => {
                    let pk = Self::string_attr(item, "pk").ok_or_else(|| Error::Validation("item missing pk".to_string()))?;
                    let sk = Self::string_attr(item, "sk").ok_or_else(|| Error::Validation("item missing sk".to_string()))?;
                    Self::check_condition(items.get(&(pk, sk)), condition, Some(i))?;
                }
                TransactWrite::Delete { pk, sk, condition } => {
                    Self::check_condition(items.get(&(pk.clone(), sk.clone())), condition, Some(i))?;
                }
            }
        }
        for write in writes {
            match write {
                TransactWrite::Put { item, .. } => {
                    let pk = Self::string_attr(&item, "pk").expect("validated above");
                    let sk = Self::string_attr(&item, "sk").expect("validated above");
                    items.insert((pk, sk), item);
                }
                TransactWrite::Delete { pk, sk, .. } => {
                    items.remove(&(pk, sk));
                }
            }
        }
        Ok(())
    }

    async fn batch_delete(&self, keys: Vec<(String, String)>) -> Result<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let mut items = self.items.lock();
        for key in keys {
            items.remove(&key);
        }
        Ok(())
    }

    async fn query(
        &self,
        condition: KeyCondition,
        exclusive_start_key: Option<LastEvaluatedKey>,
        limit: u32,
        ascending: bool,
    ) -> Result<QueryPage> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let partition_attr = Self::partition_attr(condition.index);
        let sort_attr = Self::sort_attr(condition.index);
        let items = self.items.lock();

        let mut matching: Vec<Item> = items
            .values()
            .filter(|item| Self::string_attr(item, partition_attr).as_deref() == Some(condition.partition_key.as_str()))
            .filter(|item| {
                let Some(sort_value) = Self::string_attr(item, sort_attr) else { return false };
                if let Some(prefix) = &condition.sort_key_prefix {
                    if !sort_value.starts_with(prefix.as_str()) {
                        return false;
                    }
                }
                if let Some((lo, hi)) = &condition.sort_key_between {
                    if sort_value < *lo || sort_value > *hi {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();

        matching.sort_by(|a, b| {
            let a_sort = Self::string_attr(a, sort_attr).unwrap_or_default();
            let b_sort = Self::string_attr(b, sort_attr).unwrap_or_default();
            if ascending {
                a_sort.cmp(&b_sort)
            } else {
                b_sort.cmp(&a_sort)
            }
        });

        if let Some(lek) = &exclusive_start_key {
            if let Some(FieldValue::String(last_sort)) = lek.get(sort_attr) {
                matching.retain(|item| {
                    let sort_value = Self::string_attr(item, sort_attr).unwrap_or_default();
                    if ascending {
                        sort_value > *last_sort
                    } else {
                        sort_value < *last_sort
                    }
                });
            }
        }

        let has_more = matching.len() > limit as usize;
        matching.truncate(limit as usize);

        let last_evaluated_key = if has_more {
            matching.last().map(|item| {
                let mut lek = LastEvaluatedKey::new();
                for attr in [partition_attr, sort_attr, "pk", "sk"] {
                    if let Some(value) = item.get(attr) {
                        lek.insert(attr.to_string(), value.clone());
                    }
                }
                lek
            })
        } else {
            None
        };

        Ok(QueryPage {
            items: matching,
            last_evaluated_key,
            consumed_read_units: 1.0,
        })
    }
}

struct StoredObject {
    body: Vec<u8>,
    metadata: ObjectMetadata,
}

/// An in-memory [`ObjectStoreBackend`].
#[derive(Default)]
pub struct MemoryObjectStoreBackend {
    objects: Mutex<BTreeMap<String, StoredObject>>,
}

impl MemoryObjectStoreBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStoreBackend for MemoryObjectStoreBackend {
    async fn put(&self, key: &str, body: Vec<u8>, metadata: ObjectMetadata) -> Result<()> {
        self.objects.lock().insert(key.to_string(), StoredObject { body, metadata });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, ObjectMetadata)>> {
        Ok(self.objects.lock().get(key).map(|o| (o.body.clone(), o.metadata.clone())))
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMetadata>> {
        Ok(self.objects.lock().get(key).map(|o| o.metadata.clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.lock().remove(key);
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self.objects.lock().keys().filter(|k| k.starts_with(prefix)).cloned().collect())
    }

    async fn copy(&self, source_key: &str, dest_key: &str) -> Result<()> {
        let mut objects = self.objects.lock();
        let Some(source) = objects.get(source_key) else {
            return Err(Error::BlobNotFound(source_key.to_string()));
        };
        let copy = StoredObject { body: source.body.clone(), metadata: source.metadata.clone() };
        objects.insert(dest_key.to_string(), copy);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let backend = MemoryTableBackend::new();
        let mut item = Item::new();
        item.insert("pk".to_string(), FieldValue::String("DOC#1".to_string()));
        item.insert("sk".to_string(), FieldValue::String("DOC#1".to_string()));
        backend.put_item(item.clone(), Some(WriteCondition::Absent)).await.unwrap();
        let fetched = backend.get_item("DOC#1", "DOC#1", false).await.unwrap();
        assert_eq!(fetched, Some(item));
    }

    #[tokio::test]
    async fn absent_condition_rejects_duplicate_create() {
        let backend = MemoryTableBackend::new();
        let mut item = Item::new();
        item.insert("pk".to_string(), FieldValue::String("DOC#1".to_string()));
        item.insert("sk".to_string(), FieldValue::String("DOC#1".to_string()));
        backend.put_item(item.clone(), Some(WriteCondition::Absent)).await.unwrap();
        let err = backend.put_item(item, Some(WriteCondition::Absent)).await.unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
    }

    #[tokio::test]
    async fn query_respects_ascending_order_and_pagination() {
        let backend = MemoryTableBackend::new();
        for n in 0..5 {
            let mut item = Item::new();
            item.insert("pk".to_string(), FieldValue::String("DOC#X".to_string()));
            item.insert("sk".to_string(), FieldValue::String(format!("v{n}")));
            backend.put_item(item, None).await.unwrap();
        }
        let page = backend
            .query(
                KeyCondition { index: None, partition_key: "DOC#X".to_string(), sort_key_prefix: None, sort_key_between: None },
                None,
                2,
                true,
            )
            .await
            .unwrap();
        assert_eq!(page.items.len(), 2);
        assert!(page.last_evaluated_key.is_some());
    }

    #[tokio::test]
    async fn object_store_copy_duplicates_body_and_metadata() {
        let store = MemoryObjectStoreBackend::new();
        store
            .put("a", b"hello".to_vec(), ObjectMetadata { field_name: "content".to_string(), ..Default::default() })
            .await
            .unwrap();
        store.copy("a", "b").await.unwrap();
        let (body, _) = store.get("b").await.unwrap().unwrap();
        assert_eq!(body, b"hello");
    }
}
