//! Per-record-type configuration: the registry that replaces ad hoc runtime
//! field introspection with declared, typed metadata.
//!
//! Every fact the wire codec, GSI derivation, blob layer, and audit
//! subsystem need about a record type is declared once here rather than
//! inferred from a model's field annotations at call time.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::record::RecordState;
use crate::value::FieldKind;

/// A GSI partition/sort key pair, as derived for one record instance.
/// `None` for either half means that attribute is omitted from the item
/// (a sparse GSI).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GsiKey {
    pub pk: Option<String>,
    pub sk: Option<String>,
}

impl GsiKey {
    #[must_use]
    pub fn pk_only(pk: impl Into<String>) -> Self {
        Self { pk: Some(pk.into()), sk: None }
    }

    #[must_use]
    pub fn pair(pk: impl Into<String>, sk: impl Into<String>) -> Self {
        Self { pk: Some(pk.into()), sk: Some(sk.into()) }
    }
}

type KeyFn = Arc<dyn Fn(&RecordState) -> Option<String> + Send + Sync>;
type TupleFn = Arc<dyn Fn(&RecordState) -> Option<(String, String)> + Send + Sync>;

/// How a GSI's key is derived from a record instance: a constant, a single
/// field reference, or an arbitrary function of the record -- all three
/// accepted shapes expressed as one Rust enum.
#[derive(Clone)]
pub enum GsiSpec {
    /// Separate partition-key and (optional) sort-key functions.
    Split { pk: KeyFn, sk: Option<KeyFn> },
    /// A single function returning both halves together.
    Tuple(TupleFn),
    /// A constant partition key with no derivation, and no sort key.
    Static(String),
}

impl GsiSpec {
    #[must_use]
    pub fn split(pk: impl Fn(&RecordState) -> Option<String> + Send + Sync + 'static) -> Self {
        GsiSpec::Split { pk: Arc::new(pk), sk: None }
    }

    #[must_use]
    pub fn split_with_sort(
        pk: impl Fn(&RecordState) -> Option<String> + Send + Sync + 'static,
        sk: impl Fn(&RecordState) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        GsiSpec::Split { pk: Arc::new(pk), sk: Some(Arc::new(sk)) }
    }

    #[must_use]
    pub fn tuple(f: impl Fn(&RecordState) -> Option<(String, String)> + Send + Sync + 'static) -> Self {
        GsiSpec::Tuple(Arc::new(f))
    }

    #[must_use]
    pub fn constant(pk: impl Into<String>) -> Self {
        GsiSpec::Static(pk.into())
    }

    /// Derives this GSI's key for `state`, uniformly across all three shapes.
    #[must_use]
    pub fn derive(&self, state: &RecordState) -> GsiKey {
        match self {
            GsiSpec::Split { pk, sk } => {
                let pk_value = pk(state);
                if pk_value.is_none() {
                    return GsiKey::default();
                }
                GsiKey { pk: pk_value, sk: sk.as_ref().and_then(|f| f(state)) }
            }
            GsiSpec::Tuple(f) => match f(state) {
                Some((pk, sk)) => GsiKey::pair(pk, sk),
                None => GsiKey::default(),
            },
            GsiSpec::Static(pk) => GsiKey::pk_only(pk.clone()),
        }
    }
}

impl std::fmt::Debug for GsiSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GsiSpec::Split { sk, .. } => f
                .debug_struct("GsiSpec::Split")
                .field("has_sk", &sk.is_some())
                .finish(),
            GsiSpec::Tuple(_) => f.write_str("GsiSpec::Tuple(..)"),
            GsiSpec::Static(pk) => f.debug_tuple("GsiSpec::Static").field(pk).finish(),
        }
    }
}

/// Per-field blob configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobFieldSpec {
    pub compress: bool,
    pub content_type: Option<String>,
    pub max_size_bytes: Option<u64>,
}

impl Default for BlobFieldSpec {
    fn default() -> Self {
        Self { compress: false, content_type: None, max_size_bytes: None }
    }
}

/// TTL derivation config. Both halves are required to activate together,
/// so the pair is represented as a single struct rather than
/// two independent optionals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlSpec {
    /// Name of the record field holding the source expiry value.
    pub ttl_field: String,
    /// Name of the backend attribute the resolved epoch is written to.
    pub ttl_attribute_name: String,
}

/// Audit-logging configuration for a record type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditConfig {
    pub enabled: bool,
    pub track_field_changes: bool,
    pub include_snapshot: bool,
    pub exclude_fields: BTreeSet<String>,
    pub changed_by_field: Option<String>,
    pub changed_by_required: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            track_field_changes: true,
            include_snapshot: false,
            exclude_fields: BTreeSet::new(),
            changed_by_field: None,
            changed_by_required: false,
        }
    }
}

/// The declared GSIs for a record type. `gsitype` is deliberately absent
/// here: every type gets it automatically, keyed off `discriminator`
/// (see [`RecordSchema::discriminator`]), so it cannot be misconfigured
/// per-type the way `gsi1..gsi3` can.
#[derive(Clone, Default)]
pub struct GsiConfig {
    pub gsi1: Option<GsiSpec>,
    pub gsi2: Option<GsiSpec>,
    pub gsi3: Option<GsiSpec>,
}

impl std::fmt::Debug for GsiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GsiConfig")
            .field("gsi1", &self.gsi1.is_some())
            .field("gsi2", &self.gsi2.is_some())
            .field("gsi3", &self.gsi3.is_some())
            .finish()
    }
}

/// Per-record-type configuration.
#[derive(Debug, Clone)]
pub struct RecordSchema {
    /// Stable type name, used as the `gsitype` discriminator's base and
    /// the default PK prefix.
    pub type_name: String,
    /// PK prefix / `gsitype` discriminator. Defaults to the uppercased
    /// `type_name`; audit logs and singletons override it explicitly.
    ///
    /// Using one field for both settles how audit-log discriminators get
    /// their `gsitype` prefix: the PK prefix and the
    /// `gsitype` value are definitionally the same string, so they cannot
    /// drift apart.
    pub discriminator: String,
    pub versioned: bool,
    pub compress: bool,
    pub max_versions: Option<u32>,
    pub blob_fields: BTreeMap<String, BlobFieldSpec>,
    pub gsi_config: GsiConfig,
    pub ttl: Option<TtlSpec>,
    pub audit_config: AuditConfig,
    /// Fields whose decoded `Decimal` must be coerced to `f64`.
    pub float_fields: BTreeSet<String>,
    pub float_list_fields: BTreeSet<String>,
    /// Fields declared as a DynamoDB string-set or number-set.
    pub set_fields: BTreeMap<String, FieldKind>,
}

impl RecordSchema {
    #[must_use]
    pub fn new(type_name: impl Into<String>) -> Self {
        let type_name = type_name.into();
        let discriminator = type_name.clone();
        Self {
            type_name,
            discriminator,
            versioned: false,
            compress: false,
            max_versions: None,
            blob_fields: BTreeMap::new(),
            gsi_config: GsiConfig::default(),
            ttl: None,
            audit_config: AuditConfig::default(),
            float_fields: BTreeSet::new(),
            float_list_fields: BTreeSet::new(),
            set_fields: BTreeMap::new(),
        }
    }

    /// Overrides the default discriminator (e.g. `_INTERNAL#AuditLog` or
    /// `SINGLETON`).
    #[must_use]
    pub fn with_discriminator(mut self, discriminator: impl Into<String>) -> Self {
        self.discriminator = discriminator.into();
        self
    }

    #[must_use]
    pub fn versioned(mut self) -> Self {
        self.versioned = true;
        self
    }

    #[must_use]
    pub fn compressed(mut self) -> Self {
        self.compress = true;
        self
    }

    #[must_use]
    pub fn with_max_versions(mut self, max_versions: u32) -> Self {
        self.max_versions = Some(max_versions);
        self
    }

    #[must_use]
    pub fn with_blob_field(mut self, field: impl Into<String>, spec: BlobFieldSpec) -> Self {
        self.blob_fields.insert(field.into(), spec);
        self
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl_field: impl Into<String>, ttl_attribute_name: impl Into<String>) -> Self {
        self.ttl = Some(TtlSpec {
            ttl_field: ttl_field.into(),
            ttl_attribute_name: ttl_attribute_name.into(),
        });
        self
    }

    #[must_use]
    pub fn with_audit_config(mut self, audit_config: AuditConfig) -> Self {
        self.audit_config = audit_config;
        self
    }

    #[must_use]
    pub fn with_gsi1(mut self, spec: GsiSpec) -> Self {
        self.gsi_config.gsi1 = Some(spec);
        self
    }

    #[must_use]
    pub fn with_gsi2(mut self, spec: GsiSpec) -> Self {
        self.gsi_config.gsi2 = Some(spec);
        self
    }

    #[must_use]
    pub fn with_gsi3(mut self, spec: GsiSpec) -> Self {
        self.gsi_config.gsi3 = Some(spec);
        self
    }

    #[must_use]
    pub fn with_float_field(mut self, field: impl Into<String>) -> Self {
        self.float_fields.insert(field.into());
        self
    }

    #[must_use]
    pub fn with_float_list_field(mut self, field: impl Into<String>) -> Self {
        self.float_list_fields.insert(field.into());
        self
    }

    #[must_use]
    pub fn with_set_field(mut self, field: impl Into<String>, kind: FieldKind) -> Self {
        self.set_fields.insert(field.into(), kind);
        self
    }

    /// The [`FieldKind`] declared for `field`, defaulting to `Untyped`.
    #[must_use]
    pub fn field_kind(&self, field: &str) -> FieldKind {
        if self.float_fields.contains(field) {
            FieldKind::Float
        } else if self.float_list_fields.contains(field) {
            FieldKind::FloatList
        } else {
            self.set_fields.get(field).copied().unwrap_or_default()
        }
    }

    /// TTL activates only when both halves are present and the resolved
    /// value is non-null; this reports configuration,
    /// the persistence engine checks the value at write time.
    #[must_use]
    pub fn ttl_configured(&self) -> bool {
        self.ttl.is_some()
    }
}

/// Maps type names to their [`RecordSchema`], the single source of truth
/// the persistence engine, query engine, and wire codec all consult.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, Arc<RecordSchema>>,
}

impl SchemaRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, schema: RecordSchema) -> Arc<RecordSchema> {
        let arc = Arc::new(schema);
        self.schemas.insert(arc.type_name.clone(), arc.clone());
        arc
    }

    #[must_use]
    pub fn get(&self, type_name: &str) -> Option<Arc<RecordSchema>> {
        self.schemas.get(type_name).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordIdentity;
    use chrono::Utc;

    fn state_with(fields: &[(&str, &str)]) -> RecordState {
        let mut state = RecordState::new(RecordIdentity {
            resource_id: "abc".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            version: Some(1),
        });
        for (k, v) in fields {
            state.fields.insert((*k).to_string(), crate::value::FieldValue::String((*v).to_string()));
        }
        state
    }

    #[test]
    fn static_gsi_has_no_sort_key() {
        let spec = GsiSpec::constant("ALL_DOCS");
        let key = spec.derive(&state_with(&[]));
        assert_eq!(key.pk.as_deref(), Some("ALL_DOCS"));
        assert_eq!(key.sk, None);
    }

    #[test]
    fn split_gsi_is_sparse_when_pk_fn_returns_none() {
        let spec = GsiSpec::split(|_| None);
        let key = spec.derive(&state_with(&[]));
        assert_eq!(key, GsiKey::default());
    }

    #[test]
    fn tuple_gsi_derives_both_halves() {
        let spec = GsiSpec::tuple(|s: &RecordState| {
            s.fields.get("owner").map(|_| ("OWNER#x".to_string(), s.resource_id().to_string()))
        });
        let key = spec.derive(&state_with(&[("owner", "alice")]));
        assert_eq!(key.pk.as_deref(), Some("OWNER#x"));
        assert_eq!(key.sk.as_deref(), Some("abc"));
    }

    #[test]
    fn discriminator_defaults_to_unmodified_type_name() {
        let schema = RecordSchema::new("Doc");
        assert_eq!(schema.discriminator, "Doc");
    }

    #[test]
    fn audit_log_discriminator_drives_both_pk_prefix_and_gsitype() {
        let schema = RecordSchema::new("AuditLog").with_discriminator("_INTERNAL#AuditLog");
        assert_eq!(schema.discriminator, "_INTERNAL#AuditLog");
    }

    #[test]
    fn registry_round_trips() {
        let mut registry = SchemaRegistry::new();
        registry.register(RecordSchema::new("Doc").versioned());
        let schema = registry.get("Doc").unwrap();
        assert!(schema.versioned);
        assert!(registry.get("Missing").is_none());
    }

    #[test]
    fn field_kind_defaults_to_untyped() {
        let schema = RecordSchema::new("Doc")
            .with_float_field("price")
            .with_set_field("tags", FieldKind::StringSet);
        assert_eq!(schema.field_kind("price"), FieldKind::Float);
        assert_eq!(schema.field_kind("tags"), FieldKind::StringSet);
        assert_eq!(schema.field_kind("unknown"), FieldKind::Untyped);
    }
}
