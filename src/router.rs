//! Range-query router.
//!
//! [`RangeQueryRouter`] is the single entry point: given `(dataset_id,
//! envelope, sample_count?)` it resolves the dataset's statistics, selects
//! exactly one scan strategy with the fixed decision tree in
//! [`choose_strategy`], runs it, and returns the resulting row stream.
//!
//! The router owns its collaborators (statistics registry, tiered partition
//! cache, prefetch service); they are constructed once here and passed by
//! reference into strategy execution, not reached through globals. Evicting
//! a dataset's statistics entry cascades into the partition cache so idle
//! datasets release their cached storage.

use crate::cache::{CacheStats, TieredPartitionCache};
use crate::config::RouterConfig;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::partition::PartitionKey;
use crate::prefetch::PrefetchService;
use crate::remote::RemoteDatasetService;
use crate::stats::{DatasetEvictionHook, DatasetStatsRegistry};
use crate::strategy::{choose_strategy, ScanContext, Strategy};
use crate::stream::RowStream;
use std::sync::Arc;
use tracing::debug;

/// Adaptive router over the three scan strategies.
pub struct RangeQueryRouter {
    ctx: ScanContext,
    stats: DatasetStatsRegistry,
}

impl std::fmt::Debug for RangeQueryRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeQueryRouter")
            .field("cache", &self.ctx.cache)
            .field("stats", &self.stats)
            .finish()
    }
}

impl RangeQueryRouter {
    /// Construct a router and its owned caches.
    ///
    /// Call from within a tokio runtime: the prefetch dispatcher and
    /// statistics aggregation jobs are spawned onto it.
    pub fn new(remote: Arc<dyn RemoteDatasetService>, config: RouterConfig) -> Self {
        let cache = Arc::new(TieredPartitionCache::new(
            remote.clone(),
            config.disk_cache_root.clone(),
            config.max_memory_cache_bytes,
            config.memory_cache_idle,
        ));
        let prefetch = PrefetchService::start(config.prefetch.clone(), cache.clone(), remote.clone());

        // Idle-TTL eviction of a stats entry drops the dataset's cached
        // partitions from both tiers.
        let hook: DatasetEvictionHook = {
            let cache = cache.clone();
            Arc::new(move |dataset_id: &str| {
                let cache = cache.clone();
                let dataset_id = dataset_id.to_string();
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move { cache.on_dataset_evicted(&dataset_id).await });
                }
            })
        };
        let stats = DatasetStatsRegistry::new(remote.clone(), config.stats_idle_ttl, Some(hook));

        Self {
            ctx: ScanContext {
                remote,
                cache,
                prefetch,
                config,
            },
            stats,
        }
    }

    /// Route a range query to exactly one strategy and run it.
    pub async fn route(
        &self,
        dataset_id: &str,
        envelope: &Envelope,
        sample_count: Option<u64>,
    ) -> Result<RowStream> {
        if sample_count == Some(0) {
            return Ok(RowStream::empty());
        }

        let stats = self.stats.get(dataset_id).await?;
        let descriptor = stats.descriptor().clone();
        let snapshot = stats.snapshot().await?;

        let covers = snapshot
            .bounds
            .map(|b| envelope.contains_envelope(&b))
            .unwrap_or(false);
        let strategy = choose_strategy(
            descriptor.spatially_clustered,
            descriptor.has_thumbnail,
            covers,
            sample_count.is_some(),
        );
        debug!(dataset = dataset_id, ?strategy, covers, "selected scan strategy");

        match (strategy, sample_count) {
            (Strategy::ThumbnailScan, Some(n)) => {
                match self.ctx.thumbnail_scan(&descriptor, envelope, n).await {
                    Ok(stream) => Ok(stream),
                    Err(e) if e.is_thumbnail_insufficient() => {
                        debug!(dataset = dataset_id, "thumbnail insufficient; falling back");
                        if covers {
                            self.ctx
                                .full_scan(&descriptor, None, sample_count, Some(snapshot.record_count))
                                .await
                        } else if !descriptor.spatially_clustered {
                            self.ctx
                                .full_scan(&descriptor, Some(envelope), sample_count, None)
                                .await
                        } else {
                            self.ctx
                                .index_scan(&descriptor, envelope, sample_count, snapshot.record_count)
                                .await
                        }
                    }
                    Err(e) => Err(e),
                }
            }
            // Selection only picks the thumbnail when a sample count is
            // present; a missing one degrades to the full scan arm.
            (Strategy::ThumbnailScan, None) | (Strategy::FullScan, _) => {
                if covers {
                    self.ctx
                        .full_scan(&descriptor, None, sample_count, Some(snapshot.record_count))
                        .await
                } else {
                    self.ctx
                        .full_scan(&descriptor, Some(envelope), sample_count, None)
                        .await
                }
            }
            (Strategy::IndexScan, _) => {
                self.ctx
                    .index_scan(&descriptor, envelope, sample_count, snapshot.record_count)
                    .await
            }
        }
    }

    /// The dataset's bounding envelope, awaiting aggregation if needed.
    ///
    /// Errors with `NotFound` for datasets without spatial bounds.
    pub async fn dataset_bounds(&self, dataset_id: &str) -> Result<Envelope> {
        let stats = self.stats.get(dataset_id).await?;
        stats.bounds().await?.ok_or_else(|| {
            Error::not_found(format!("dataset '{dataset_id}' has no spatial bounds"))
        })
    }

    /// The dataset's record count, awaiting aggregation if needed.
    pub async fn dataset_count(&self, dataset_id: &str) -> Result<u64> {
        self.stats.get(dataset_id).await?.record_count().await
    }

    /// Whether a partition is cached in either tier. Diagnostic query.
    pub async fn is_cached(&self, dataset_id: &str, quad_key: &str) -> bool {
        let key = PartitionKey::new(dataset_id, quad_key);
        self.ctx.cache.exists_in_memory(&key) || self.ctx.cache.exists_on_disk(&key).await
    }

    /// Evict a dataset's statistics entry and every partition it has in
    /// either cache tier.
    pub async fn evict_dataset(&self, dataset_id: &str) {
        self.stats.evict(dataset_id);
        // The eviction hook purges asynchronously for TTL expiry; do it
        // inline here so explicit eviction is deterministic.
        self.ctx.cache.on_dataset_evicted(dataset_id).await;
    }

    /// The partition cache (diagnostics and tests).
    pub fn cache(&self) -> &Arc<TieredPartitionCache> {
        &self.ctx.cache
    }

    /// Snapshot of partition-cache counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.ctx.cache.stats()
    }

    /// The statistics registry (diagnostics and tests).
    pub fn stats_registry(&self) -> &DatasetStatsRegistry {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::DatasetDescriptor;
    use crate::prefetch::PrefetchConfig;
    use crate::record::{ColumnDef, FieldKind, FieldValue, Row, Schema};
    use crate::remote::{MemoryDataset, MemoryDatasetService};
    use geo_types::Point;

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

    fn router_over(svc: Arc<MemoryDatasetService>) -> RangeQueryRouter {
        let dir = tempfile::tempdir().unwrap();
        let config = RouterConfig::default()
            .with_disk_cache_root(dir.into_path())
            .with_prefetch(PrefetchConfig::disabled());
        RangeQueryRouter::new(svc, config)
    }

    #[tokio::test]
    async fn test_dataset_bounds_and_count() {
        let svc = Arc::new(MemoryDatasetService::new());
        svc.insert_dataset(MemoryDataset::new(
            DatasetDescriptor::new("pts", point_schema()),
            vec![point_row(1, 1.0, 2.0), point_row(2, 3.0, 4.0)],
        ));

        let router = router_over(svc);
        assert_eq!(router.dataset_count("pts").await.unwrap(), 2);
        assert_eq!(
            router.dataset_bounds("pts").await.unwrap(),
            Envelope::new(1.0, 2.0, 3.0, 4.0)
        );
    }

    #[tokio::test]
    async fn test_bounds_missing_for_non_spatial_dataset() {
        let svc = Arc::new(MemoryDatasetService::new());
        let schema = Schema::new(vec![ColumnDef::new("id", FieldKind::Int)]);
        svc.insert_dataset(MemoryDataset::new(
            DatasetDescriptor::new("flat", schema).with_record_count(1),
            vec![Row::new(vec![FieldValue::Int(1)])],
        ));

        let router = router_over(svc);
        assert!(matches!(
            router.dataset_bounds("flat").await.unwrap_err(),
            Error::NotFound(_)
        ));
        assert_eq!(router.dataset_count("flat").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_zero_sample_short_circuits() {
        let svc = Arc::new(MemoryDatasetService::new());
        svc.insert_dataset(MemoryDataset::new(
            DatasetDescriptor::new("pts", point_schema())
                .with_bounds(Envelope::new(0.0, 0.0, 1.0, 1.0))
                .with_record_count(1),
            vec![point_row(1, 0.5, 0.5)],
        ));

        let router = router_over(svc.clone());
        let rows = router
            .route("pts", &Envelope::new(0.0, 0.0, 1.0, 1.0), Some(0))
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert!(rows.is_empty());
        assert_eq!(svc.counts().full_scan, 0);
        assert_eq!(svc.counts().range_scan, 0);
    }

    #[tokio::test]
    async fn test_unknown_dataset_errors() {
        let svc = Arc::new(MemoryDatasetService::new());
        let router = router_over(svc);
        assert!(router
            .route("nope", &Envelope::new(0.0, 0.0, 1.0, 1.0), None)
            .await
            .is_err());
    }
}
