//! External contracts the engine depends on: a DynamoDB-shaped table
//! backend and an object-store backend for the blob layer.
//!
//! Every RPC-shaped method suspends and is `async`; implementations are
//! expected to be cheap to clone and safe for concurrent use.

pub mod local_fs;
pub mod memory;

#[cfg(feature = "dynamodb")]
pub mod dynamodb;
#[cfg(feature = "s3")]
pub mod s3;

use std::collections::BTreeMap;

use async_trait::async_trait;
use singletable_core::{FieldValue, LastEvaluatedKey};

use crate::Result;

/// One backend row, keyed by `(pk, sk)`, carrying every attribute
/// (including control attributes) the wire codec and key codec need.
pub type Item = BTreeMap<String, FieldValue>;

/// A single item to write inside a [`TableBackend::transact_write`] call.
#[derive(Debug, Clone)]
pub enum TransactWrite {
    /// Put `item`, optionally failing unless `condition` holds.
    Put { item: Item, condition: Option<WriteCondition> },
    /// Delete the item at `(pk, sk)`, optionally conditioned.
    Delete { pk: String, sk: String, condition: Option<WriteCondition> },
}

/// A precondition evaluated against the *current* item at the target key,
/// before a conditional or transactional write is allowed to proceed.
#[derive(Debug, Clone)]
pub enum WriteCondition {
    /// No item currently exists at this key.
    Absent,
    /// An item exists (regardless of contents).
    Exists,
    /// An item exists and its `version` attribute equals `version`.
    ExistsWithVersion(u32),
}

/// Result of a single [`TableBackend::query`] call: the page of items plus
/// whatever bookkeeping the paginated-query algorithm needs.
#[derive(Debug, Clone, Default)]
pub struct QueryPage {
    pub items: Vec<Item>,
    /// Backend's own pagination token; `None` means no more data on this index.
    pub last_evaluated_key: Option<LastEvaluatedKey>,
    /// Read capacity the backend reports as consumed by this call, if it tracks one.
    pub consumed_read_units: f64,
}

/// A key-condition + optional filter expression evaluated by the backend
/// during a `query` call. The engine never builds these directly
/// against a specific backend's expression syntax; each [`TableBackend`]
/// implementation interprets the condition in its own terms.
#[derive(Debug, Clone)]
pub struct KeyCondition {
    pub index: Option<&'static str>,
    pub partition_key: String,
    /// Sort-key constraint, if the query is scoped further than the partition.
    pub sort_key_prefix: Option<String>,
    pub sort_key_between: Option<(String, String)>,
}

/// Thrown by a conditional or transactional write whose precondition failed.
#[derive(Debug, thiserror::Error)]
#[error("conditional check failed{}", item_index.map(|i| format!(" at item {i}")).unwrap_or_default())]
pub struct ConditionalCheckFailed {
    pub item_index: Option<usize>,
    pub reason: String,
}

/// The DynamoDB-shaped table contract.
#[async_trait]
pub trait TableBackend: Send + Sync {
    async fn get_item(&self, pk: &str, sk: &str, consistent: bool) -> Result<Option<Item>>;

    async fn put_item(&self, item: Item, condition: Option<WriteCondition>) -> Result<()>;

    async fn delete_item(&self, pk: &str, sk: &str, condition: Option<WriteCondition>) -> Result<()>;

    /// Applies an atomic numeric `ADD` update, returning the new value.
    async fn add_numeric(&self, pk: &str, sk: &str, field: &str, delta: f64) -> Result<f64>;

    /// Applies an atomic string-set `ADD`/`DELETE`, per `add` (true = add).
    async fn update_string_set(&self, pk: &str, sk: &str, field: &str, value: &str, add: bool) -> Result<()>;

    async fn transact_write(&self, writes: Vec<TransactWrite>) -> Result<()>;

    /// Deletes many items in bulk; unlike `transact_write`, there is no
    /// atomicity across the batch.
    async fn batch_delete(&self, keys: Vec<(String, String)>) -> Result<()>;

    async fn query(
        &self,
        condition: KeyCondition,
        exclusive_start_key: Option<LastEvaluatedKey>,
        limit: u32,
        ascending: bool,
    ) -> Result<QueryPage>;
}

/// Object metadata attached to a stored blob.
#[derive(Debug, Clone, Default)]
pub struct ObjectMetadata {
    pub resource_type: String,
    pub resource_id: String,
    pub field_name: String,
    pub compressed: bool,
    pub version: Option<u32>,
    pub content_type: Option<String>,
}

/// The object-store contract backing the blob side-storage layer.
#[async_trait]
pub trait ObjectStoreBackend: Send + Sync {
    async fn put(&self, key: &str, body: Vec<u8>, metadata: ObjectMetadata) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, ObjectMetadata)>>;

    async fn head(&self, key: &str) -> Result<Option<ObjectMetadata>>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Server-side copy, avoiding a round trip through the caller for the
    /// object body.
    async fn copy(&self, source_key: &str, dest_key: &str) -> Result<()>;
}
