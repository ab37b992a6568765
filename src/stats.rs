//! Dataset statistics: lazy async aggregation plus an idle-TTL registry.
//!
//! [`DatasetStats`] pairs a dataset's descriptor with its record count and
//! bounding envelope. File-backed datasets declare both up front; streamed
//! or unclustered datasets trigger one asynchronous aggregation job on
//! first access, and every reader of [`record_count`](DatasetStats::record_count)
//! / [`bounds`](DatasetStats::bounds) awaits the same shared result via a
//! watch channel. Aggregation failure resolves the channel with the error:
//! all current and future readers observe [`Error::StatsUnavailable`], and
//! no retry is attempted (callers may re-trigger aggregation by evicting
//! the entry).
//!
//! [`DatasetStatsRegistry`] owns one entry per dataset with idle-TTL
//! eviction. Evicting an entry (explicitly or by TTL) fires the eviction
//! hook, which cascades into the partition cache's `on_dataset_evicted` so
//! long-unused datasets do not leak cached partitions.

use crate::dataset::DatasetDescriptor;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::remote::RemoteDatasetService;
use moka::notification::RemovalCause;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Resolved statistics for one dataset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSnapshot {
    pub record_count: u64,
    /// `None` for datasets without a geometry column.
    pub bounds: Option<Envelope>,
}

type StatsOutcome = std::result::Result<StatsSnapshot, Arc<str>>;

/// A dataset's descriptor plus its (possibly still computing) statistics.
#[derive(Debug)]
pub struct DatasetStats {
    descriptor: DatasetDescriptor,
    rx: watch::Receiver<Option<StatsOutcome>>,
}

impl DatasetStats {
    /// Entry born resolved from declared descriptor statistics.
    fn resolved(descriptor: DatasetDescriptor, snapshot: StatsSnapshot) -> Self {
        let (_tx, rx) = watch::channel(Some(Ok(snapshot)));
        Self { descriptor, rx }
    }

    /// Entry that spawns one aggregation job and shares its outcome.
    fn computing(descriptor: DatasetDescriptor, remote: Arc<dyn RemoteDatasetService>) -> Self {
        let (tx, rx) = watch::channel(None::<StatsOutcome>);
        let dataset_id = descriptor.id.clone();

        tokio::spawn(async move {
            let outcome = match remote.aggregate(&dataset_id).await {
                Ok((record_count, bounds)) => Ok(StatsSnapshot {
                    record_count,
                    bounds,
                }),
                Err(e) => {
                    warn!(dataset = %dataset_id, error = %e, "statistics aggregation failed");
                    Err(Arc::<str>::from(e.to_string()))
                }
            };
            let _ = tx.send(Some(outcome));
        });

        Self { descriptor, rx }
    }

    /// The dataset's static descriptor.
    pub fn descriptor(&self) -> &DatasetDescriptor {
        &self.descriptor
    }

    /// Whether the aggregation has completed (or was never needed).
    pub fn is_resolved(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// The resolved statistics, awaiting aggregation if still running.
    pub async fn snapshot(&self) -> Result<StatsSnapshot> {
        let mut rx = self.rx.clone();
        loop {
            let current = rx.borrow().clone();
            if let Some(outcome) = current {
                return outcome
                    .map_err(|msg| Error::stats_unavailable(msg.to_string()));
            }
            if rx.changed().await.is_err() {
                return Err(Error::stats_unavailable(
                    "aggregation task dropped before completing",
                ));
            }
        }
    }

    /// Record count, awaiting aggregation if needed.
    pub async fn record_count(&self) -> Result<u64> {
        Ok(self.snapshot().await?.record_count)
    }

    /// Bounding envelope, awaiting aggregation if needed.
    pub async fn bounds(&self) -> Result<Option<Envelope>> {
        Ok(self.snapshot().await?.bounds)
    }
}

/// Hook invoked with a dataset id when its statistics entry is evicted.
pub type DatasetEvictionHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Registry of per-dataset statistics entries with idle-TTL eviction.
pub struct DatasetStatsRegistry {
    remote: Arc<dyn RemoteDatasetService>,
    entries: moka::sync::Cache<String, Arc<DatasetStats>>,
    create_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for DatasetStatsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetStatsRegistry")
            .field("entries", &self.entries.entry_count())
            .finish()
    }
}

impl DatasetStatsRegistry {
    /// Create a registry. `on_evict` fires for idle-TTL and explicit
    /// evictions (not for replacements) with the evicted dataset's id.
    pub fn new(
        remote: Arc<dyn RemoteDatasetService>,
        idle_ttl: Duration,
        on_evict: Option<DatasetEvictionHook>,
    ) -> Self {
        let entries = moka::sync::Cache::builder()
            .time_to_idle(idle_ttl)
            .eviction_listener(move |key: Arc<String>, _value, cause| {
                if cause == RemovalCause::Replaced {
                    return;
                }
                debug!(dataset = %key, ?cause, "dataset stats entry evicted");
                if let Some(hook) = &on_evict {
                    hook(key.as_str());
                }
            })
            .build();

        Self {
            remote,
            entries,
            create_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Get (or create) the statistics entry for a dataset.
    ///
    /// Creation is serialized so concurrent first accesses share one
    /// descriptor fetch and at most one aggregation job.
    pub async fn get(&self, dataset_id: &str) -> Result<Arc<DatasetStats>> {
        if let Some(entry) = self.entries.get(dataset_id) {
            return Ok(entry);
        }

        let _guard = self.create_lock.lock().await;
        if let Some(entry) = self.entries.get(dataset_id) {
            return Ok(entry);
        }

        let descriptor = self.remote.dataset_descriptor(dataset_id).await?;
        let stats = if descriptor.stats_known() {
            let snapshot = StatsSnapshot {
                record_count: descriptor.record_count.unwrap_or(0),
                bounds: descriptor.bounds,
            };
            Arc::new(DatasetStats::resolved(descriptor, snapshot))
        } else {
            Arc::new(DatasetStats::computing(descriptor, self.remote.clone()))
        };

        self.entries.insert(dataset_id.to_string(), stats.clone());
        Ok(stats)
    }

    /// Whether a dataset currently has a registry entry.
    pub fn contains(&self, dataset_id: &str) -> bool {
        self.entries.contains_key(dataset_id)
    }

    /// Explicitly evict a dataset's entry, firing the eviction hook.
    pub fn evict(&self, dataset_id: &str) {
        self.entries.invalidate(dataset_id);
        self.entries.run_pending_tasks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ColumnDef, FieldKind, FieldValue, Row, Schema};
    use crate::remote::{MemoryDataset, MemoryDatasetService};
    use geo_types::Point;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn point_schema() -> Schema {
        Schema::new(vec![
            ColumnDef::new("id", FieldKind::Int),
            ColumnDef::new("geom", FieldKind::Geometry),
        ])
    }

    fn point_row(id: i64, x: f64, y: f64) -> Row {
        Row::new(vec![
            FieldValue::Int(id),
            FieldValue::Geometry(Point::new(x, y).into()),
        ])
    }

    fn service() -> Arc<MemoryDatasetService> {
        let svc = MemoryDatasetService::new();
        // Declared stats: no aggregation needed.
        svc.insert_dataset(MemoryDataset::new(
            DatasetDescriptor::new("declared", point_schema())
                .with_bounds(Envelope::new(0.0, 0.0, 10.0, 10.0))
                .with_record_count(2),
            vec![point_row(1, 1.0, 1.0), point_row(2, 9.0, 9.0)],
        ));
        // Unknown stats: aggregation computes count + bounds.
        svc.insert_dataset(MemoryDataset::new(
            DatasetDescriptor::new("streamed", point_schema()),
            vec![
                point_row(1, 2.0, 2.0),
                point_row(2, 4.0, 4.0),
                point_row(3, 8.0, 6.0),
            ],
        ));
        Arc::new(svc)
    }

    fn registry(svc: Arc<MemoryDatasetService>) -> DatasetStatsRegistry {
        DatasetStatsRegistry::new(svc, Duration::from_secs(3600), None)
    }

    #[tokio::test]
    async fn test_declared_stats_resolve_immediately() {
        let svc = service();
        let registry = registry(svc.clone());

        let stats = registry.get("declared").await.unwrap();
        assert!(stats.is_resolved());
        assert_eq!(stats.record_count().await.unwrap(), 2);
        assert_eq!(svc.counts().aggregate, 0);
    }

    #[tokio::test]
    async fn test_aggregation_computes_count_and_bounds() {
        let svc = service();
        let registry = registry(svc.clone());

        let stats = registry.get("streamed").await.unwrap();
        let snapshot = stats.snapshot().await.unwrap();
        assert_eq!(snapshot.record_count, 3);
        assert_eq!(snapshot.bounds.unwrap(), Envelope::new(2.0, 2.0, 8.0, 6.0));
        assert_eq!(svc.counts().aggregate, 1);

        // A second reader shares the same resolved entry.
        let again = registry.get("streamed").await.unwrap();
        again.snapshot().await.unwrap();
        assert_eq!(svc.counts().aggregate, 1);
    }

    #[tokio::test]
    async fn test_failure_surfaces_to_all_waiters() {
        let svc = service();
        svc.set_fail_aggregate(true);
        let registry = registry(svc.clone());

        let stats = registry.get("streamed").await.unwrap();
        let (a, b) = tokio::join!(stats.record_count(), stats.bounds());
        assert!(matches!(a.unwrap_err(), Error::StatsUnavailable(_)));
        assert!(matches!(b.unwrap_err(), Error::StatsUnavailable(_)));

        // No automatic retry: the failed outcome is sticky.
        assert!(stats.record_count().await.is_err());
        assert_eq!(svc.counts().aggregate, 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_access_shares_one_entry() {
        let svc = service();
        let registry = Arc::new(registry(svc.clone()));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.get("streamed").await.unwrap().record_count().await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 3);
        }
        assert_eq!(svc.counts().descriptor, 1);
        assert_eq!(svc.counts().aggregate, 1);
    }

    #[tokio::test]
    async fn test_evict_fires_hook() {
        let svc = service();
        let fired = Arc::new(AtomicUsize::new(0));
        let hook_fired = fired.clone();
        let hook: DatasetEvictionHook = Arc::new(move |dataset_id| {
            assert_eq!(dataset_id, "declared");
            hook_fired.fetch_add(1, Ordering::SeqCst);
        });
        let registry = DatasetStatsRegistry::new(svc, Duration::from_secs(3600), Some(hook));

        registry.get("declared").await.unwrap();
        assert!(registry.contains("declared"));

        registry.evict("declared");
        assert!(!registry.contains("declared"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
