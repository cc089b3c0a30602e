//! The paginated query engine. Composes backend `query` calls, decodes
//! items via the wire codec, and loops until the caller's limit or the
//! API-call budget is exhausted.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use singletable_core::keys::{self, IndexName};
use singletable_core::{FieldValue, LastEvaluatedKey, RecordSchema};
use tracing::debug;

/// Per-item schema classifier for a query whose matching GSI rows span more
/// than one record type (e.g. `gsitype` queries over a shared partition, or
/// any index where heterogeneous rows coexist). Invoked with the raw,
/// still-encoded backend item -- `gsitype` and other control attributes are
/// still present at that point -- and must resolve which schema governs
/// decoding for that one item.
pub type ClassFn<'a> = dyn Fn(&BTreeMap<String, FieldValue>) -> Option<Arc<RecordSchema>> + Send + Sync + 'a;

use crate::backend::{KeyCondition, TableBackend};
use crate::codec;
use crate::{Error, Result};

const DEFAULT_RESULTS_LIMIT: u32 = 250;
const DEFAULT_MAX_API_CALLS: u32 = 10;
const DEFAULT_FILTER_MULTIPLIER: u32 = 3;
const FILTER_PAGE_CAP: u32 = 1000;

/// Inputs to [`QueryEngine::paginated_query`].
pub struct QueryParams<'a> {
    pub index: Option<&'static str>,
    pub partition_key: String,
    pub sort_key_prefix: Option<String>,
    pub sort_key_between: Option<(String, String)>,
    /// Backend-side filter is not modeled as a separate expression type here
    /// (the memory/local-fs backends have no expression language of their
    /// own); callers push filtering entirely through `client_filter`, which
    /// is evaluated after decoding exactly as server-side filters would be
    /// evaluated before counting toward `results_limit`.
    pub client_filter: Option<&'a (dyn Fn(&BTreeMap<String, FieldValue>) -> bool + Send + Sync)>,
    /// Polymorphic projection (spec §4.3.4): when set, each raw item is
    /// classified individually and decoded with the schema that classifier
    /// resolves, instead of the single `schema` passed to
    /// [`QueryEngine::paginated_query`]. A classifier that returns `None`
    /// for an item is a `ConfigurationError` -- an unclassifiable row means
    /// the index is being queried polymorphically without covering every
    /// type actually stored under it.
    pub class_fn: Option<&'a ClassFn<'a>>,
    pub results_limit: u32,
    pub max_api_calls: u32,
    pub pagination_key: Option<String>,
    pub ascending: bool,
    pub filter_limit_multiplier: u32,
}

impl Default for QueryParams<'_> {
    fn default() -> Self {
        Self {
            index: None,
            partition_key: String::new(),
            sort_key_prefix: None,
            sort_key_between: None,
            client_filter: None,
            class_fn: None,
            results_limit: DEFAULT_RESULTS_LIMIT,
            max_api_calls: DEFAULT_MAX_API_CALLS,
            pagination_key: None,
            ascending: true,
            filter_limit_multiplier: DEFAULT_FILTER_MULTIPLIER,
        }
    }
}

/// A page of decoded, filtered results plus observability fields
/// (API calls made, read capacity consumed, wall-clock query time).
#[derive(Debug, Clone)]
pub struct PagedResults {
    pub results: Vec<BTreeMap<String, FieldValue>>,
    pub limit: u32,
    pub next_cursor: Option<String>,
    pub api_calls_made: u32,
    pub consumed_read_units: f64,
    pub query_time: Duration,
}

pub struct QueryEngine {
    backend: Arc<dyn TableBackend>,
}

impl QueryEngine {
    #[must_use]
    pub fn new(backend: Arc<dyn TableBackend>) -> Self {
        Self { backend }
    }

    /// Runs the fill-then-refill pagination loop to completion, returning
    /// one [`PagedResults`].
    pub async fn paginated_query(&self, schema: &RecordSchema, mut params: QueryParams<'_>) -> Result<PagedResults> {
        let started = Instant::now();
        let index = IndexName::parse(params.index)?;

        if params.filter_limit_multiplier < 1 {
            tracing::warn!("filter_limit_multiplier < 1, clamping to 1");
            params.filter_limit_multiplier = 1;
        }

        let mut cursor = match params.pagination_key.as_deref() {
            Some(c) => keys::decode_cursor(c),
            None => None,
        };
        let mut remaining = params.results_limit;
        let mut api_calls = 0u32;
        let mut consumed_read_units = 0.0;
        let mut accumulated = Vec::new();
        let mut next_cursor = None;

        loop {
            let page_size = if params.client_filter.is_some() {
                (remaining.saturating_mul(params.filter_limit_multiplier)).min(FILTER_PAGE_CAP)
            } else {
                remaining
            };

            let condition = KeyCondition {
                index: index.as_backend_name(),
                partition_key: params.partition_key.clone(),
                sort_key_prefix: params.sort_key_prefix.clone(),
                sort_key_between: params.sort_key_between.clone(),
            };
            let page = self.backend.query(condition, cursor.clone(), page_size, params.ascending).await?;
            api_calls += 1;
            consumed_read_units += page.consumed_read_units;
            debug!(api_calls, page_items = page.items.len(), "paginated_query backend call");

            for item in page.items {
                let resolved;
                let item_schema: &RecordSchema = if let Some(classify) = params.class_fn {
                    resolved = classify(&item)
                        .ok_or_else(|| Error::Configuration("class_fn produced no schema for a queried item".to_string()))?;
                    resolved.as_ref()
                } else {
                    schema
                };
                let decoded = codec::decode_fields(item_schema, &item, None)?;
                let matches = params.client_filter.map_or(true, |f| f(&decoded));
                if matches {
                    let mut merged = decoded;
                    merged.insert("pk".to_string(), item.get("pk").cloned().unwrap_or(FieldValue::Null));
                    merged.insert("sk".to_string(), item.get("sk").cloned().unwrap_or(FieldValue::Null));
                    accumulated.push((merged, item));
                }
                if accumulated.len() as u32 >= remaining {
                    break;
                }
            }

            if accumulated.len() as u32 >= remaining {
                accumulated.truncate(remaining as usize);
                if let Some((_, raw_item)) = accumulated.last() {
                    let projected = keys::project_for_index(raw_item, index);
                    next_cursor = Some(keys::encode_cursor(&projected));
                }
                break;
            }

            remaining = params.results_limit - accumulated.len() as u32;

            if let Some(lek) = page.last_evaluated_key {
                if api_calls < params.max_api_calls {
                    cursor = Some(lek);
                    continue;
                }
                next_cursor = Some(keys::encode_cursor(&lek));
                break;
            }
            break;
        }

        Ok(PagedResults {
            results: accumulated.into_iter().map(|(decoded, _)| decoded).collect(),
            limit: params.results_limit,
            next_cursor,
            api_calls_made: api_calls,
            consumed_read_units,
            query_time: started.elapsed(),
        })
    }
}

/// Raised instead of returning a result when the caller has explicitly
/// opted into strict budget enforcement. `paginated_query` itself returns
/// partial results when the budget runs out; this is offered for callers
/// that want a hard `BudgetExhausted` error instead.
pub fn budget_exhausted(api_calls: u32) -> Error {
    Error::BudgetExhausted { api_calls }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryTableBackend;
    use singletable_core::Decimal;

    fn doc_item(id: &str, bool_field: bool, sk: &str) -> BTreeMap<String, FieldValue> {
        let mut item = BTreeMap::new();
        item.insert("pk".to_string(), FieldValue::String(format!("DOC#{id}")));
        item.insert("sk".to_string(), FieldValue::String(sk.to_string()));
        item.insert("gsitype".to_string(), FieldValue::String("DOC".to_string()));
        item.insert("gsitypesk".to_string(), FieldValue::String(sk.to_string()));
        item.insert("bool_field".to_string(), FieldValue::Bool(bool_field));
        item.insert("n".to_string(), FieldValue::Number(Decimal::from_i64(1)));
        item
    }

    #[tokio::test]
    async fn under_fill_with_tight_budget_returns_partial_with_cursor() {
        let backend = Arc::new(MemoryTableBackend::new());
        for i in 0..11 {
            let is_true = i < 10;
            let sk = format!("{i:02}");
            backend.put_item(doc_item(&sk, is_true, &sk), None).await.unwrap();
        }
        let schema = RecordSchema::new("Doc");
        let engine = QueryEngine::new(backend);
        let filter = |f: &BTreeMap<String, FieldValue>| matches!(f.get("bool_field"), Some(FieldValue::Bool(false)));
        let params = QueryParams {
            index: Some("gsitype"),
            partition_key: "DOC".to_string(),
            client_filter: Some(&filter),
            results_limit: 1,
            max_api_calls: 1,
            ascending: true,
            filter_limit_multiplier: 1,
            ..Default::default()
        };
        let result = engine.paginated_query(&schema, params).await.unwrap();
        assert!(result.results.is_empty());
        assert!(result.next_cursor.is_some());
    }

    #[tokio::test]
    async fn wider_budget_finds_the_single_false_record() {
        let backend = Arc::new(MemoryTableBackend::new());
        for i in 0..11 {
            let is_true = i < 10;
            let sk = format!("{i:02}");
            backend.put_item(doc_item(&sk, is_true, &sk), None).await.unwrap();
        }
        let schema = RecordSchema::new("Doc");
        let engine = QueryEngine::new(backend);
        let filter = |f: &BTreeMap<String, FieldValue>| matches!(f.get("bool_field"), Some(FieldValue::Bool(false)));
        let params = QueryParams {
            index: Some("gsitype"),
            partition_key: "DOC".to_string(),
            client_filter: Some(&filter),
            results_limit: 1,
            max_api_calls: 11,
            ascending: true,
            filter_limit_multiplier: 1,
            ..Default::default()
        };
        let result = engine.paginated_query(&schema, params).await.unwrap();
        assert_eq!(result.results.len(), 1);
    }

    #[tokio::test]
    async fn cursor_reconstructs_gsi3_shape_under_trimming() {
        let backend = Arc::new(MemoryTableBackend::new());
        for i in 0..5 {
            let mut item = BTreeMap::new();
            item.insert("pk".to_string(), FieldValue::String(format!("DOC#{i}")));
            item.insert("sk".to_string(), FieldValue::String(format!("DOC#{i}")));
            item.insert("gsi3pk".to_string(), FieldValue::String("BUCKET".to_string()));
            item.insert("gsi3sk".to_string(), FieldValue::String(format!("{i:02}")));
            backend.put_item(item, None).await.unwrap();
        }
        let schema = RecordSchema::new("Doc");
        let engine = QueryEngine::new(backend);
        let params = QueryParams {
            index: Some("gsi3"),
            partition_key: "BUCKET".to_string(),
            results_limit: 2,
            max_api_calls: 10,
            ascending: true,
            ..Default::default()
        };
        let result = engine.paginated_query(&schema, params).await.unwrap();
        assert_eq!(result.results.len(), 2);
        let cursor = result.next_cursor.unwrap();
        let lek = keys::decode_cursor(&cursor).unwrap();
        assert_eq!(lek.len(), 4);
        assert!(lek.contains_key("gsi3pk"));
        assert!(lek.contains_key("gsi3sk"));

        let params2 = QueryParams {
            index: Some("gsi3"),
            partition_key: "BUCKET".to_string(),
            pagination_key: Some(cursor),
            results_limit: 10,
            max_api_calls: 10,
            ascending: true,
            ..Default::default()
        };
        let result2 = engine.paginated_query(&schema, params2).await.unwrap();
        assert_eq!(result2.results.len(), 3);
    }

    #[tokio::test]
    async fn class_fn_decodes_heterogeneous_items_by_their_own_schema() {
        let backend = Arc::new(MemoryTableBackend::new());
        let mut doc_item = BTreeMap::new();
        doc_item.insert("pk".to_string(), FieldValue::String("DOC#1".to_string()));
        doc_item.insert("sk".to_string(), FieldValue::String("DOC#1".to_string()));
        doc_item.insert("gsitype".to_string(), FieldValue::String("SHARED".to_string()));
        doc_item.insert("gsitypesk".to_string(), FieldValue::String("1".to_string()));
        doc_item.insert("kind".to_string(), FieldValue::String("Doc".to_string()));
        doc_item.insert("title".to_string(), FieldValue::String("hello".to_string()));
        backend.put_item(doc_item, None).await.unwrap();

        let mut note_item = BTreeMap::new();
        note_item.insert("pk".to_string(), FieldValue::String("NOTE#1".to_string()));
        note_item.insert("sk".to_string(), FieldValue::String("NOTE#1".to_string()));
        note_item.insert("gsitype".to_string(), FieldValue::String("SHARED".to_string()));
        note_item.insert("gsitypesk".to_string(), FieldValue::String("2".to_string()));
        note_item.insert("kind".to_string(), FieldValue::String("Note".to_string()));
        note_item.insert("body".to_string(), FieldValue::String("scratch".to_string()));
        backend.put_item(note_item, None).await.unwrap();

        let doc_schema = Arc::new(RecordSchema::new("Doc"));
        let note_schema = Arc::new(RecordSchema::new("Note"));
        let classify = move |item: &BTreeMap<String, FieldValue>| match item.get("kind") {
            Some(FieldValue::String(k)) if k == "Doc" => Some(doc_schema.clone()),
            Some(FieldValue::String(k)) if k == "Note" => Some(note_schema.clone()),
            _ => None,
        };

        let fallback_schema = RecordSchema::new("Doc");
        let engine = QueryEngine::new(backend);
        let params = QueryParams {
            index: Some("gsitype"),
            partition_key: "SHARED".to_string(),
            class_fn: Some(&classify),
            results_limit: 10,
            max_api_calls: 10,
            ascending: true,
            ..Default::default()
        };
        let result = engine.paginated_query(&fallback_schema, params).await.unwrap();
        assert_eq!(result.results.len(), 2);
        assert!(result.results.iter().any(|r| r.get("title").is_some()));
        assert!(result.results.iter().any(|r| r.get("body").is_some()));
    }
}
