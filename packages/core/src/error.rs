//! Error taxonomy shared by the key codec, schema registry, wire codec, and
//! the engine crate built on top of them.
//!
//! Mirrors the conceptual taxonomy the engine exposes to callers: lookups
//! that legitimately return nothing are not errors ([`get_existing`]-style
//! calls return `Option`), everything else raises one of these variants.
//!
//! [`get_existing`]: https://docs.rs/singletable-engine

use thiserror::Error;

/// Errors raised by the storage engine and its supporting layers.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A `read_existing`-style lookup found nothing at the given key.
    #[error("not found: {0}")]
    NotFound(String),

    /// A versioned update was attempted from a version that is no longer
    /// the latest, or a transactional write lost a conditional-check race.
    #[error("version conflict: {0}")]
    VersionConflict(String),

    /// Field-type mismatch, missing required field, blob size exceeded,
    /// unknown field, or an attempted cross-resource self-copy.
    #[error("validation error: {0}")]
    Validation(String),

    /// An unsupported GSI name, or another malformed schema declaration.
    /// Always a programming error; never recoverable at runtime.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// `audit_config.changed_by_required` is set but no `changed_by` value
    /// was available from either the call site or `changed_by_field`.
    #[error("audit logging enabled for this resource type but 'changed_by' not provided")]
    AuditRequirement,

    /// A paginated query exhausted `max_api_calls` before either the
    /// caller's limit or the backend's data was exhausted.
    #[error("query budget exhausted after {api_calls} backend calls")]
    BudgetExhausted {
        /// Number of backend calls actually issued.
        api_calls: u32,
    },

    /// The object store has no object at the computed blob key.
    #[error("blob not found: {0}")]
    BlobNotFound(String),

    /// Error surfaced by the underlying table or object-store backend.
    #[error("backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// I/O error, primarily from the local filesystem backend.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error in the wire codec or blob codec.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl StorageError {
    /// Wraps an arbitrary backend error, erasing its concrete type.
    pub fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend(Box::new(err))
    }

    /// Returns `true` for the subset of errors the engine treats as
    /// locally recoverable according to the documented propagation policy.
    #[must_use]
    pub fn is_locally_recoverable(&self) -> bool {
        matches!(self, Self::BudgetExhausted { .. })
    }
}

/// Convenience alias used throughout the core, engine, and backend layers.
pub type Result<T> = std::result::Result<T, StorageError>;
