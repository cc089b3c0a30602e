//! A filesystem-backed [`TableBackend`] + [`ObjectStoreBackend`] -- a
//! drop-in offline alternative to the cloud-backed implementations: it
//! implements the same contract, just against local files.
//!
//! Layout under `base_dir`:
//! - `tables/{TYPE_PREFIX}.json` -- one file per record-type prefix (the
//!   part of `pk` before `#`), holding every item for that type. Guarded by
//!   an exclusive advisory lock (`fs2`) around each read-modify-write.
//! - `blobs/{key}` -- one file per blob object, with a `{key}.meta` JSON
//!   companion carrying [`ObjectMetadata`], mirroring the same interface
//!   with on-disk files instead of RPCs.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use singletable_core::{FieldValue, LastEvaluatedKey};

use crate::backend::{
    ConditionalCheckFailed, Item, KeyCondition, ObjectMetadata, ObjectStoreBackend, QueryPage, TableBackend,
    TransactWrite, WriteCondition,
};
use crate::{Error, Result};

/// Configuration for [`LocalFsTableBackend`] / [`LocalFsObjectStoreBackend`].
#[derive(Debug, Clone)]
pub struct LocalFsConfig {
    pub base_dir: PathBuf,
}

impl LocalFsConfig {
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TableFile {
    items: BTreeMap<String, Item>,
}

fn composite_key(pk: &str, sk: &str) -> String {
    format!("{pk}\u{1f}{sk}")
}

fn type_prefix(pk: &str) -> &str {
    pk.split('#').next().unwrap_or(pk)
}

fn sanitize_filename(prefix: &str) -> String {
    prefix
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

/// A filesystem-backed table: one JSON file per record-type prefix.
pub struct LocalFsTableBackend {
    tables_dir: PathBuf,
}

impl LocalFsTableBackend {
    pub fn new(config: &LocalFsConfig) -> Result<Self> {
        let tables_dir = config.base_dir.join("tables");
        fs::create_dir_all(&tables_dir)?;
        Ok(Self { tables_dir })
    }

    fn table_path(&self, prefix: &str) -> PathBuf {
        self.tables_dir.join(format!("{}.json", sanitize_filename(prefix)))
    }

    /// Opens (creating if absent) and exclusively locks the type file for
    /// `prefix`, runs `f` against its decoded contents, persists any
    /// mutation `f` made, then releases the lock.
    fn with_locked_table<R>(&self, prefix: &str, f: impl FnOnce(&mut TableFile) -> Result<R>) -> Result<R> {
        let path = self.table_path(prefix);
        let file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        file.lock_exclusive()?;
        let result = (|| {
            let mut contents = String::new();
            let mut reader = &file;
            reader.read_to_string(&mut contents)?;
            let mut table: TableFile = if contents.trim().is_empty() {
                TableFile::default()
            } else {
                serde_json::from_str(&contents)?
            };
            let result = f(&mut table)?;
            let serialized = serde_json::to_string_pretty(&table)?;
            fs::write(&path, serialized)?;
            Ok(result)
        })();
        file.unlock()?;
        result
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
            Err(Error::backend(ConditionalCheckFailed { item_index, reason: "condition check failed".to_string() }))
        }
    }

    fn string_attr(item: &Item, attr: &str) -> Option<String> {
        match item.get(attr) {
            Some(FieldValue::String(s)) => Some(s.clone()),
            _ => None,
        }
    }
}

#[async_trait]
impl TableBackend for LocalFsTableBackend {
    async fn get_item(&self, pk: &str, sk: &str, _consistent: bool) -> Result<Option<Item>> {
        let prefix = type_prefix(pk).to_string();
        let key = composite_key(pk, sk);
        self.with_locked_table(&prefix, |table| Ok(table.items.get(&key).cloned()))
    }

    async fn put_item(&self, item: Item, condition: Option<WriteCondition>) -> Result<()> {
        let pk = Self::string_attr(&item, "pk").ok_or_else(|| Error::Validation("item missing pk".to_string()))?;
        let sk = Self::string_attr(&item, "sk").ok_or_else(|| Error::Validation("item missing sk".to_string()))?;
        let prefix = type_prefix(&pk).to_string();
        let key = composite_key(&pk, &sk);
        self.with_locked_table(&prefix, |table| {
            Self::check_condition(table.items.get(&key), &condition, None)?;
            table.items.insert(key.clone(), item);
            Ok(())
        })
    }

    async fn delete_item(&self, pk: &str, sk: &str, condition: Option<WriteCondition>) -> Result<()> {
        let prefix = type_prefix(pk).to_string();
        let key = composite_key(pk, sk);
        self.with_locked_table(&prefix, |table| {
            Self::check_condition(table.items.get(&key), &condition, None)?;
            table.items.remove(&key);
            Ok(())
        })
    }

    async fn add_numeric(&self, pk: &str, sk: &str, field: &str, delta: f64) -> Result<f64> {
        let prefix = type_prefix(pk).to_string();
        let key = composite_key(pk, sk);
        let field = field.to_string();
        let pk_owned = pk.to_string();
        let sk_owned = sk.to_string();
        self.with_locked_table(&prefix, |table| {
            let item = table.items.entry(key).or_insert_with(|| {
                let mut base = Item::new();
                base.insert("pk".to_string(), FieldValue::String(pk_owned.clone()));
                base.insert("sk".to_string(), FieldValue::String(sk_owned.clone()));
                base
            });
            let current = match item.get(&field) {
                Some(FieldValue::Number(d)) => d.to_f64().unwrap_or(0.0),
                _ => 0.0,
            };
            let new_value = current + delta;
            item.insert(field.clone(), FieldValue::Number(new_value.into()));
            Ok(new_value)
        })
    }

    async fn update_string_set(&self, pk: &str, sk: &str, field: &str, value: &str, add: bool) -> Result<()> {
        let prefix = type_prefix(pk).to_string();
        let key = composite_key(pk, sk);
        let field = field.to_string();
        let value = value.to_string();
        let pk_owned = pk.to_string();
        let sk_owned = sk.to_string();
        self.with_locked_table(&prefix, |table| {
            let item = table.items.entry(key).or_insert_with(|| {
                let mut base = Item::new();
                base.insert("pk".to_string(), FieldValue::String(pk_owned.clone()));
                base.insert("sk".to_string(), FieldValue::String(sk_owned.clone()));
                base
            });
            let mut set = match item.remove(&field) {
                Some(FieldValue::StringSet(s)) => s,
                _ => Default::default(),
            };
            if add {
                set.insert(value.clone());
            } else {
                set.remove(&value);
            }
            if !set.is_empty() {
                item.insert(field.clone(), FieldValue::StringSet(set));
            }
            Ok(())
        })
    }

    async fn transact_write(&self, writes: Vec<TransactWrite>) -> Result<()> {
        // All writes in a transaction share one record's PK in every path
        // this engine generates (create_new / update_existing), so they
        // share one type-file lock; grouping by prefix keeps the contract
        // general without requiring a cross-file lock ordering protocol.
        let mut by_prefix: BTreeMap<String, Vec<TransactWrite>> = BTreeMap::new();
        for write in writes {
            let prefix = match &write {
                TransactWrite::Put { item, .. } => type_prefix(&Self::string_attr(item, "pk").unwrap_or_default()).to_string(),
                TransactWrite::Delete { pk, .. } => type_prefix(pk).to_string(),
            };
            by_prefix.entry(prefix).or_default().push(write);
        }
        for (prefix, group) in by_prefix {
            self.with_locked_table(&prefix, |table| {
                for (i, write) in group.iter().enumerate() {
                    match write {
                        TransactWrite::Put { item, condition } => {
                            let pk = Self::string_attr(item, "pk").ok_or_else(|| Error::Validation("item missing pk".to_string()))?;
                            let sk = Self::string_attr(item, "sk").ok_or_else(|| Error::Validation("item missing sk".to_string()))?;
                            let key = composite_key(&pk, &sk);
                            Self::check_condition(table.items.get(&key), condition, Some(i))?;
                        }
                        TransactWrite::Delete { pk, sk, condition } => {
                            let key = composite_key(pk, sk);
                            Self::check_condition(table.items.get(&key), condition, Some(i))?;
                        }
                    }
                }
                for write in group {
                    match write {
                        TransactWrite::Put { item, .. } => {
                            let pk = Self::string_attr(&item, "pk").expect("validated above");
                            let sk = Self::string_attr(&item, "sk").expect("validated above");
                            table.items.insert(composite_key(&pk, &sk), item);
                        }
                        TransactWrite::Delete { pk, sk, .. } => {
                            table.items.remove(&composite_key(&pk, &sk));
                        }
                    }
                }
                Ok(())
            })?;
        }
        Ok(())
    }

    async fn batch_delete(&self, keys: Vec<(String, String)>) -> Result<()> {
        let mut by_prefix: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
        for (pk, sk) in keys {
            by_prefix.entry(type_prefix(&pk).to_string()).or_default().push((pk, sk));
        }
        for (prefix, group) in by_prefix {
            self.with_locked_table(&prefix, |table| {
                for (pk, sk) in group {
                    table.items.remove(&composite_key(&pk, &sk));
                }
                Ok(())
            })?;
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
        let partition_attr = match condition.index {
            None => "pk",
            Some("gsitype") => "gsitype",
            Some("gsi1") => "gsi1pk",
            Some("gsi2") => "gsi2pk",
            Some("gsi3") => "gsi3pk",
            Some(other) => return Err(Error::Configuration(format!("unrecognized index: {other}"))),
        };
        let sort_attr = match condition.index {
            None => "sk",
            Some("gsitype") => "gsitypesk",
            Some("gsi1" | "gsi2") => "pk",
            Some("gsi3") => "gsi3sk",
            Some(other) => return Err(Error::Configuration(format!("unrecognized index: {other}"))),
        };

        // The local backend has no global index: every record type's file
        // must be scanned when querying a GSI that spans types (gsitype,
        // gsi1, gsi2 can be shared across types). The main-table case is
        // scoped to one file by the partition key's own type prefix.
        let type_files: Vec<PathBuf> = if condition.index.is_none() {
            vec![self.table_path(type_prefix(&condition.partition_key))]
        } else {
            fs::read_dir(&self.tables_dir)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
                .collect()
        };

        let mut matching = Vec::new();
        for path in type_files {
            if !path.exists() {
                continue;
            }
            let mut file = File::open(&path)?;
            let mut contents = String::new();
            file.read_to_string(&mut contents)?;
            if contents.trim().is_empty() {
                continue;
            }
            let table: TableFile = serde_json::from_str(&contents)?;
            for item in table.items.into_values() {
                if Self::string_attr(&item, partition_attr).as_deref() != Some(condition.partition_key.as_str()) {
                    continue;
                }
                let Some(sort_value) = Self::string_attr(&item, sort_attr) else { continue };
                if let Some(prefix) = &condition.sort_key_prefix {
                    if !sort_value.starts_with(prefix.as_str()) {
                        continue;
                    }
                }
                if let Some((lo, hi)) = &condition.sort_key_between {
                    if sort_value < *lo || sort_value > *hi {
                        continue;
                    }
                }
                matching.push(item);
            }
        }

        matching.sort_by(|a, b| {
            let a_sort = Self::string_attr(a, sort_attr).unwrap_or_default();
            let b_sort = Self::string_attr(b, sort_attr).unwrap_or_default();
            if ascending { a_sort.cmp(&b_sort) } else { b_sort.cmp(&a_sort) }
        });

        if let Some(lek) = &exclusive_start_key {
            if let Some(FieldValue::String(last_sort)) = lek.get(sort_attr) {
                matching.retain(|item| {
                    let sort_value = Self::string_attr(item, sort_attr).unwrap_or_default();
                    if ascending { sort_value > *last_sort } else { sort_value < *last_sort }
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

        Ok(QueryPage { items: matching, last_evaluated_key, consumed_read_units: 0.0 })
    }
}

fn blob_path(base_dir: &Path, key: &str) -> PathBuf {
    base_dir.join("blobs").join(key)
}

fn meta_path(base_dir: &Path, key: &str) -> PathBuf {
    base_dir.join("blobs").join(format!("{key}.meta"))
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredMetadata {
    resource_type: String,
    resource_id: String,
    field_name: String,
    compressed: bool,
    version: Option<u32>,
    content_type: Option<String>,
}

impl From<ObjectMetadata> for StoredMetadata {
    fn from(m: ObjectMetadata) -> Self {
        Self {
            resource_type: m.resource_type,
            resource_id: m.resource_id,
            field_name: m.field_name,
            compressed: m.compressed,
            version: m.version,
            content_type: m.content_type,
        }
    }
}

impl From<StoredMetadata> for ObjectMetadata {
    fn from(m: StoredMetadata) -> Self {
        Self {
            resource_type: m.resource_type,
            resource_id: m.resource_id,
            field_name: m.field_name,
            compressed: m.compressed,
            version: m.version,
            content_type: m.content_type,
        }
    }
}

/// A filesystem-backed object store for the blob layer.
pub struct LocalFsObjectStoreBackend {
    base_dir: PathBuf,
}

impl LocalFsObjectStoreBackend {
    pub fn new(config: &LocalFsConfig) -> Result<Self> {
        fs::create_dir_all(config.base_dir.join("blobs"))?;
        Ok(Self { base_dir: config.base_dir.clone() })
    }
}

#[async_trait]
impl ObjectStoreBackend for LocalFsObjectStoreBackend {
    async fn put(&self, key: &str, body: Vec<u8>, metadata: ObjectMetadata) -> Result<()> {
        let path = blob_path(&self.base_dir, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, &body)?;
        let stored: StoredMetadata = metadata.into();
        fs::write(meta_path(&self.base_dir, key), serde_json::to_vec(&stored)?)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, ObjectMetadata)>> {
        let path = blob_path(&self.base_dir, key);
        if !path.exists() {
            return Ok(None);
        }
        let body = fs::read(&path)?;
        let meta_raw = fs::read(meta_path(&self.base_dir, key))?;
        let stored: StoredMetadata = serde_json::from_slice(&meta_raw)?;
        Ok(Some((body, stored.into())))
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMetadata>> {
        let meta_file = meta_path(&self.base_dir, key);
        if !meta_file.exists() {
            return Ok(None);
        }
        let stored: StoredMetadata = serde_json::from_slice(&fs::read(meta_file)?)?;
        Ok(Some(stored.into()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _ = fs::remove_file(blob_path(&self.base_dir, key));
        let _ = fs::remove_file(meta_path(&self.base_dir, key));
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let blobs_dir = self.base_dir.join("blobs");
        if !blobs_dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        collect_keys(&blobs_dir, &blobs_dir, prefix, &mut out)?;
        Ok(out)
    }

    async fn copy(&self, source_key: &str, dest_key: &str) -> Result<()> {
        let source = blob_path(&self.base_dir, source_key);
        if !source.exists() {
            return Err(Error::BlobNotFound(source_key.to_string()));
        }
        let dest = blob_path(&self.base_dir, dest_key);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&source, &dest)?;
        fs::copy(meta_path(&self.base_dir, source_key), meta_path(&self.base_dir, dest_key))?;
        Ok(())
    }
}

fn collect_keys(root: &Path, dir: &Path, prefix: &str, out: &mut Vec<String>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_keys(root, &path, prefix, out)?;
        } else if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if name.ends_with(".meta") {
                continue;
            }
            if let Ok(relative) = path.strip_prefix(root) {
                if let Some(key) = relative.to_str() {
                    let key = key.replace(std::path::MAIN_SEPARATOR, "/");
                    if key.starts_with(prefix) {
                        out.push(key);
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn put_then_get_round_trips_through_locked_type_file() {
        let dir = tempdir().unwrap();
        let config = LocalFsConfig::new(dir.path());
        let backend = LocalFsTableBackend::new(&config).unwrap();
        let mut item = Item::new();
        item.insert("pk".to_string(), FieldValue::String("DOC#1".to_string()));
        item.insert("sk".to_string(), FieldValue::String("DOC#1".to_string()));
        backend.put_item(item.clone(), Some(WriteCondition::Absent)).await.unwrap();
        let fetched = backend.get_item("DOC#1", "DOC#1", false).await.unwrap();
        assert_eq!(fetched, Some(item));
    }

    #[tokio::test]
    async fn blob_round_trips_with_meta_companion() {
        let dir = tempdir().unwrap();
        let config = LocalFsConfig::new(dir.path());
        let store = LocalFsObjectStoreBackend::new(&config).unwrap();
        store
            .put("DOC/abc/content", b"hello".to_vec(), ObjectMetadata { field_name: "content".to_string(), ..Default::default() })
            .await
            .unwrap();
        let (body, meta) = store.get("DOC/abc/content").await.unwrap().unwrap();
        assert_eq!(body, b"hello");
        assert_eq!(meta.field_name, "content");
    }

    #[tokio::test]
    async fn absent_condition_rejects_duplicate_create() {
        let dir = tempdir().unwrap();
        let config = LocalFsConfig::new(dir.path());
        let backend = LocalFsTableBackend::new(&config).unwrap();
        let mut item = Item::new();
        item.insert("pk".to_string(), FieldValue::String("DOC#1".to_string()));
        item.insert("sk".to_string(), FieldValue::String("DOC#1".to_string()));
        backend.put_item(item.clone(), Some(WriteCondition::Absent)).await.unwrap();
        assert!(backend.put_item(item, Some(WriteCondition::Absent)).await.is_err());
    }
}
