//! Engine-instance-owned operation counters -- modeled as a record owned by
//! the engine instance, not a process-global, updated via the backend's
//! atomic `ADD`.

use std::sync::Arc;

use crate::backend::TableBackend;
use crate::Result;

const STATS_PK: &str = "_INTERNAL#Stats";
const STATS_SK: &str = "_INTERNAL#Stats";

/// Operation counters for one engine instance, persisted through the same
/// backend as ordinary records so counts survive process restarts.
pub struct MemoryStats {
    backend: Arc<dyn TableBackend>,
}

impl MemoryStats {
    #[must_use]
    pub fn new(backend: Arc<dyn TableBackend>) -> Self {
        Self { backend }
    }

    async fn bump(&self, field: &str, delta: f64) -> Result<f64> {
        self.backend.add_numeric(STATS_PK, STATS_SK, field, delta).await
    }

    pub async fn record_create(&self) -> Result<()> {
        self.bump("creates", 1.0).await.map(|_| ())
    }

    pub async fn record_update(&self) -> Result<()> {
        self.bump("updates", 1.0).await.map(|_| ())
    }

    pub async fn record_delete(&self) -> Result<()> {
        self.bump("deletes", 1.0).await.map(|_| ())
    }

    pub async fn record_query(&self, api_calls: u32) -> Result<()> {
        self.bump("queries", 1.0).await?;
        self.bump("query_api_calls", f64::from(api_calls)).await.map(|_| ())
    }

    pub async fn snapshot(&self) -> Result<StatsSnapshot> {
        let item = self.backend.get_item(STATS_PK, STATS_SK, false).await?.unwrap_or_default();
        let read = |field: &str| -> u64 {
            match item.get(field) {
                Some(singletable_core::FieldValue::Number(d)) => d.to_i64().unwrap_or(0).max(0) as u64,
                _ => 0,
            }
        };
        Ok(StatsSnapshot {
            creates: read("creates"),
            updates: read("updates"),
            deletes: read("deletes"),
            queries: read("queries"),
            query_api_calls: read("query_api_calls"),
        })
    }
}

/// A point-in-time read of [`MemoryStats`]'s counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub creates: u64,
    pub updates: u64,
    pub deletes: u64,
    pub queries: u64,
    pub query_api_calls: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryTableBackend;

    #[tokio::test]
    async fn counters_accumulate_across_calls() {
        let backend = Arc::new(MemoryTableBackend::new());
        let stats = MemoryStats::new(backend);
        stats.record_create().await.unwrap();
        stats.record_create().await.unwrap();
        stats.record_update().await.unwrap();
        let snapshot = stats.snapshot().await.unwrap();
        assert_eq!(snapshot.creates, 2);
        assert_eq!(snapshot.updates, 1);
    }
}
