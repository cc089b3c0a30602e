//! The blob side-storage layer: per-field offload to an object store,
//! a concurrent LRU+TTL cache, and the copy/register-external primitives.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use singletable_core::schema::BlobFieldSpec;
use tracing::{debug, warn};

use crate::backend::{ObjectMetadata, ObjectStoreBackend};
use crate::{Error, Result};

/// `{prefix/}{type_name}/{resource_id}/[v{n}/]{field_name}`.
#[must_use]
pub fn blob_key(prefix: Option<&str>, type_name: &str, resource_id: &str, version: Option<u32>, field_name: &str) -> String {
    let mut parts = Vec::new();
    if let Some(p) = prefix {
        parts.push(p.to_string());
    }
    parts.push(type_name.to_string());
    parts.push(resource_id.to_string());
    if let Some(v) = version {
        parts.push(format!("v{v}"));
    }
    parts.push(field_name.to_string());
    parts.join("/")
}

/// An in-memory marker attached to a loaded record indicating a blob field
/// has not yet been hydrated from the object store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobPlaceholder {
    pub field_name: String,
    pub key: String,
    pub size_bytes: u64,
    pub content_type: Option<String>,
    pub compressed: bool,
}

/// Configuration for the blob cache.
#[derive(Debug, Clone)]
pub struct BlobCacheConfig {
    pub max_size_bytes: u64,
    pub max_items: usize,
    pub max_item_size_bytes: u64,
    pub ttl: Option<Duration>,
}

impl Default for BlobCacheConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 64 * 1024 * 1024,
            max_items: 10_000,
            max_item_size_bytes: 4 * 1024 * 1024,
            ttl: Some(Duration::from_secs(300)),
        }
    }
}

/// Read-only snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlobCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub current_size_bytes: u64,
    pub current_items: usize,
}

struct CacheEntry {
    value: Vec<u8>,
    inserted_at: Instant,
}

struct CacheInner {
    entries: LruCache<String, CacheEntry>,
    current_size_bytes: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// A concurrent LRU-with-TTL cache over blob values, keyed by
/// `{type}#{id}#{field}#(v{n}|latest)`. All mutation and read
/// access to the cache body is serialized behind one mutex; stats are
/// returned by copy so callers never observe a half-updated snapshot.
pub struct BlobCache {
    config: BlobCacheConfig,
    inner: Mutex<CacheInner>,
}

impl BlobCache {
    #[must_use]
    pub fn new(config: BlobCacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_items.max(1)).unwrap();
        Self {
            config,
            inner: Mutex::new(CacheInner {
                entries: LruCache::new(capacity),
                current_size_bytes: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
        }
    }

    #[must_use]
    pub fn stats(&self) -> BlobCacheStats {
        let inner = self.inner.lock();
        BlobCacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            current_size_bytes: inner.current_size_bytes,
            current_items: inner.entries.len(),
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.peek(key) {
            if let Some(ttl) = self.config.ttl {
                if entry.inserted_at.elapsed() > ttl {
                    let evicted = inner.entries.pop(key);
                    if let Some(evicted) = evicted {
                        inner.current_size_bytes = inner.current_size_bytes.saturating_sub(evicted.value.len() as u64);
                    }
                    inner.misses += 1;
                    return None;
                }
            }
        } else {
            inner.misses += 1;
            return None;
        }
        inner.hits += 1;
        inner.entries.get(key).map(|entry| entry.value.clone())
    }

    pub fn put(&self, key: String, value: Vec<u8>) {
        let size = value.len() as u64;
        if size > self.config.max_item_size_bytes {
            return;
        }
        let mut inner = self.inner.lock();
        if let Some(old) = inner.entries.pop(&key) {
            inner.current_size_bytes = inner.current_size_bytes.saturating_sub(old.value.len() as u64);
        }
        inner.entries.put(key, CacheEntry { value, inserted_at: Instant::now() });
        inner.current_size_bytes += size;
        while inner.entries.len() > self.config.max_items || inner.current_size_bytes > self.config.max_size_bytes {
            let Some((_, evicted)) = inner.entries.pop_lru() else { break };
            inner.current_size_bytes = inner.current_size_bytes.saturating_sub(evicted.value.len() as u64);
            inner.evictions += 1;
        }
    }

    pub fn invalidate(&self, key: &str) {
        let mut inner = self.inner.lock();
        if let Some(evicted) = inner.entries.pop(key) {
            inner.current_size_bytes = inner.current_size_bytes.saturating_sub(evicted.value.len() as u64);
        }
    }
}

/// The blob side-storage layer: puts/gets serialized field values to/from
/// an [`ObjectStoreBackend`], through a [`BlobCache`].
pub struct BlobStore {
    object_store: Arc<dyn ObjectStoreBackend>,
    cache: BlobCache,
}

impl BlobStore {
    #[must_use]
    pub fn new(object_store: Arc<dyn ObjectStoreBackend>, cache_config: BlobCacheConfig) -> Self {
        Self { object_store, cache: BlobCache::new(cache_config) }
    }

    #[must_use]
    pub fn cache_stats(&self) -> BlobCacheStats {
        self.cache.stats()
    }

    /// Puts a JSON-serializable value under `key`, honoring `spec.compress`
    /// and `spec.max_size_bytes`.
    pub async fn put_value(
        &self,
        key: &str,
        value: &serde_json::Value,
        spec: &BlobFieldSpec,
        metadata: ObjectMetadata,
    ) -> Result<BlobPlaceholder> {
        let json = serde_json::to_vec(value)?;
        self.put_bytes(key, json, spec, metadata).await
    }

    /// Puts raw bytes under `key`, honoring `spec.compress`/`max_size_bytes`.
    pub async fn put_bytes(&self, key: &str, raw: Vec<u8>, spec: &BlobFieldSpec, mut metadata: ObjectMetadata) -> Result<BlobPlaceholder> {
        let body = if spec.compress {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&raw)?;
            encoder.finish()?
        } else {
            raw.clone()
        };
        if let Some(max) = spec.max_size_bytes {
            if body.len() as u64 > max {
                return Err(Error::Validation(format!(
                    "blob for field {} exceeds maximum size of {max} bytes",
                    metadata.field_name
                )));
            }
        }
        metadata.compressed = spec.compress;
        metadata.content_type = spec.content_type.clone().or(metadata.content_type);
        let size_bytes = body.len() as u64;
        let content_type = metadata.content_type.clone();
        debug!(key, size_bytes, compressed = spec.compress, "writing blob");
        self.object_store.put(key, body, metadata.clone()).await?;
        self.cache.put(key.to_string(), raw);
        Ok(BlobPlaceholder {
            field_name: metadata.field_name,
            key: key.to_string(),
            size_bytes,
            content_type,
            compressed: spec.compress,
        })
    }

    /// Loads and decodes the value stored at `key`: cache, then
    /// object store + gunzip-if-needed + best-effort JSON decode, falling
    /// back to raw bytes when the payload is not JSON.
    pub async fn get_value(&self, key: &str) -> Result<serde_json::Value> {
        let raw = self.get_raw(key).await?;
        Ok(serde_json::from_slice(&raw).unwrap_or_else(|_| serde_json::Value::String(base64_lossy(&raw))))
    }

    /// Loads the decompressed raw bytes stored at `key`, consulting the
    /// cache first.
    pub async fn get_raw(&self, key: &str) -> Result<Vec<u8>> {
        if let Some(cached) = self.cache.get(key) {
            return Ok(cached);
        }
        let Some((body, metadata)) = self.object_store.get(key).await? else {
            return Err(Error::BlobNotFound(key.to_string()));
        };
        let raw = if metadata.compressed {
            let mut decoder = GzDecoder::new(body.as_slice());
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)?;
            out
        } else {
            body
        };
        self.cache.put(key.to_string(), raw.clone());
        Ok(raw)
    }

    /// Lists every blob key stored for a resource, for `list_blob_versions`
    /// / `delete_all_blobs`.
    pub async fn list_blob_versions(&self, prefix: Option<&str>, type_name: &str, resource_id: &str) -> Result<Vec<String>> {
        let scan_prefix = blob_key(prefix, type_name, resource_id, None, "");
        let scan_prefix = scan_prefix.trim_end_matches('/').to_string();
        self.object_store.list_prefix(&format!("{scan_prefix}/")).await
    }

    /// Deletes every blob object under a resource's prefix, invalidating
    /// their cache entries.
    pub async fn delete_all_blobs(&self, prefix: Option<&str>, type_name: &str, resource_id: &str) -> Result<()> {
        for key in self.list_blob_versions(prefix, type_name, resource_id).await? {
            self.object_store.delete(&key).await?;
            self.cache.invalidate(&key);
        }
        Ok(())
    }

    /// `copy_blob`'s backend-level half: server-side copy plus
    /// cache invalidation for the destination key. Field-config validation
    /// and item bookkeeping live in `persistence::PersistenceEngine`.
    pub async fn copy_blob(&self, source_key: &str, dest_key: &str, source_compress: bool, dest_compress: bool) -> Result<()> {
        if self.object_store.head(source_key).await?.is_none() {
            return Err(Error::BlobNotFound(source_key.to_string()));
        }
        if source_key == dest_key {
            return Err(Error::Validation("cannot copy a blob onto itself".to_string()));
        }
        if source_compress != dest_compress {
            warn!(source_key, dest_key, "copying blob between mismatched compression configs");
        }
        self.object_store.copy(source_key, dest_key).await?;
        self.cache.invalidate(dest_key);
        Ok(())
    }

    /// `register_external_blob`'s backend-level half: verify the
    /// external object exists, then copy it into the managed location.
    pub async fn register_external(&self, source_key: &str, managed_key: &str) -> Result<()> {
        if self.object_store.head(source_key).await?.is_none() {
            return Err(Error::Validation(format!("source object not found: {source_key}")));
        }
        self.object_store.copy(source_key, managed_key).await?;
        self.cache.invalidate(managed_key);
        Ok(())
    }

    /// Deletes a single object and invalidates its cache entry. Used by
    /// `copy_blob`/`register_external_blob`'s `delete_source` option.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.object_store.delete(key).await?;
        self.cache.invalidate(key);
        Ok(())
    }
}

fn base64_lossy(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Named cache-key builder: `{type}#{id}#{field}#(v{n}|latest)`.
#[must_use]
pub fn cache_key(type_name: &str, resource_id: &str, field_name: &str, version: Option<u32>) -> String {
    match version {
        Some(v) => format!("{type_name}#{resource_id}#{field_name}#v{v}"),
        None => format!("{type_name}#{resource_id}#{field_name}#latest"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryObjectStoreBackend;

    fn store() -> BlobStore {
        BlobStore::new(Arc::new(MemoryObjectStoreBackend::new()), BlobCacheConfig::default())
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = store();
        let spec = BlobFieldSpec::default();
        let value = serde_json::json!({"content": "hello"});
        store
            .put_value("DOC/1/content", &value, &spec, ObjectMetadata { field_name: "content".to_string(), ..Default::default() })
            .await
            .unwrap();
        let fetched = store.get_value("DOC/1/content").await.unwrap();
        assert_eq!(fetched, value);
    }

    #[tokio::test]
    async fn compression_round_trips() {
        let store = store();
        let spec = BlobFieldSpec { compress: true, ..Default::default() };
        let value = serde_json::json!("x".repeat(2000));
        store
            .put_value("DOC/1/content", &value, &spec, ObjectMetadata { field_name: "content".to_string(), ..Default::default() })
            .await
            .unwrap();
        let fetched = store.get_value("DOC/1/content").await.unwrap();
        assert_eq!(fetched, value);
    }

    #[tokio::test]
    async fn max_size_rejects_oversized_blob() {
        let store = store();
        let spec = BlobFieldSpec { max_size_bytes: Some(4), ..Default::default() };
        let value = serde_json::json!("this is definitely too long");
        let err = store
            .put_value("DOC/1/content", &value, &spec, ObjectMetadata { field_name: "content".to_string(), ..Default::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let store = store();
        let err = store.get_value("missing/key").await.unwrap_err();
        assert!(matches!(err, Error::BlobNotFound(_)));
    }

    #[test]
    fn cache_evicts_by_item_count() {
        let cache = BlobCache::new(BlobCacheConfig { max_items: 2, max_size_bytes: 1_000_000, max_item_size_bytes: 1_000_000, ttl: None });
        cache.put("a".to_string(), vec![1]);
        cache.put("b".to_string(), vec![2]);
        cache.put("c".to_string(), vec![3]);
        assert_eq!(cache.stats().current_items, 2);
        assert_eq!(cache.stats().evictions, 1);
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn cache_skips_oversized_entries() {
        let cache = BlobCache::new(BlobCacheConfig { max_items: 10, max_size_bytes: 1_000_000, max_item_size_bytes: 2, ttl: None });
        cache.put("big".to_string(), vec![1, 2, 3, 4]);
        assert!(cache.get("big").is_none());
        assert_eq!(cache.stats().current_items, 0);
    }

    #[test]
    fn cache_expires_by_ttl() {
        let cache = BlobCache::new(BlobCacheConfig {
            max_items: 10,
            max_size_bytes: 1_000_000,
            max_item_size_bytes: 1_000_000,
            ttl: Some(Duration::from_millis(1)),
        });
        cache.put("a".to_string(), vec![1]);
        std::thread::sleep(Duration::from_millis(10));
        assert!(cache.get("a").is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn blob_key_includes_version_only_for_versioned_records() {
        assert_eq!(blob_key(None, "Doc", "abc", Some(2), "content"), "Doc/abc/v2/content");
        assert_eq!(blob_key(None, "Doc", "abc", None, "content"), "Doc/abc/content");
    }
}
