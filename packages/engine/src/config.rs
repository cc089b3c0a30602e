//! Ambient configuration structs. One struct per external dependency the
//! engine can be wired to: plain `Debug + Clone` structs with a
//! field-documented `Default` impl, not a builder.

use std::time::Duration;

use crate::blob::BlobCacheConfig;

/// Top-level engine configuration: which backends to use and how the blob
/// cache and query engine should be tuned. The engine itself stays
/// backend-agnostic -- callers construct the concrete
/// `TableBackend`/`ObjectStoreBackend` from one of
/// `DynamoDbConfig`/`LocalFsConfig`/`S3Config` and hand it to
/// [`crate::persistence::PersistenceEngine::new`] directly.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Prefix prepended to every blob object key. `None` means blobs are
    /// keyed directly as `{type}/{resource_id}/[v{n}/]{field}`.
    pub blob_key_prefix: Option<String>,
    /// Tuning for the in-process blob cache.
    pub blob_cache: BlobCacheConfig,
    /// Default `results_limit` applied when a caller's `QueryParams` uses
    /// `Default::default()` (kept here too so it can be overridden process-wide).
    pub default_query_limit: u32,
    /// Default `max_api_calls` budget per paginated query.
    pub default_max_api_calls: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            blob_key_prefix: None,
            blob_cache: BlobCacheConfig::default(),
            default_query_limit: 250,
            default_max_api_calls: 10,
        }
    }
}

/// Connection settings for the real DynamoDB-shaped backend (`feature = "dynamodb"`).
#[derive(Debug, Clone)]
#[cfg(feature = "dynamodb")]
pub struct DynamoDbConfig {
    /// Table name (single-table design: one table for every record type).
    pub table_name: String,
    /// Optional separate table for audit log entries. `None` routes audit
    /// entries into `table_name` alongside everything else.
    pub audit_table_name: Option<String>,
    /// AWS region override; `None` defers to the SDK's default resolution chain.
    pub region: Option<String>,
    /// Custom endpoint, for local DynamoDB-compatible test servers.
    pub endpoint_url: Option<String>,
    /// Per-RPC timeout.
    pub request_timeout: Duration,
}

#[cfg(feature = "dynamodb")]
impl DynamoDbConfig {
    #[must_use]
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            audit_table_name: None,
            region: None,
            endpoint_url: None,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Connection settings for the real S3 object-store backend (`feature = "s3"`).
#[derive(Debug, Clone)]
#[cfg(feature = "s3")]
pub struct S3Config {
    pub bucket: String,
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    /// Forces path-style addressing, needed by most S3-compatible local servers.
    pub force_path_style: bool,
}

#[cfg(feature = "s3")]
impl S3Config {
    #[must_use]
    pub fn new(bucket: impl Into<String>) -> Self {
        Self { bucket: bucket.into(), region: None, endpoint_url: None, force_path_style: false }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_defaults_match_query_engine_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.default_query_limit, 250);
        assert_eq!(config.default_max_api_calls, 10);
        assert!(config.blob_key_prefix.is_none());
    }
}
