//! Scan strategies and strategy selection.
//!
//! Exactly three strategies exist; the router picks one per query with
//! [`choose_strategy`], a pure function over the dataset's flags and the
//! query shape, so the decision tree is unit-testable in isolation:
//!
//! - **FullScan** — server-side scan of the whole dataset or a range of it,
//!   optionally sampled. Ranged sampling materializes a scoped temporary
//!   dataset remotely and deletes it when the stream closes.
//! - **ThumbnailScan** — reads the dataset's pre-built lossy thumbnail.
//!   May signal [`Error::ThumbnailInsufficient`]; callers fall back.
//! - **IndexScan** — the core strategy for spatially clustered datasets:
//!   estimate the overlapping clusters, then either serve the query from
//!   the tiered partition cache with per-cluster proportional sampling, or
//!   delegate to the remote service when the cache cannot cover it cheaply
//!   (warming the cache in the background for next time).

use crate::cache::TieredPartitionCache;
use crate::catalog;
use crate::config::RouterConfig;
use crate::dataset::DatasetDescriptor;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::partition::{Partition, PartitionKey};
use crate::prefetch::{PrefetchRequest, PrefetchService};
use crate::record::Row;
use crate::remote::{RemoteDatasetService, ScopedDatasetPlan};
use crate::stream::RowStream;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::debug;

/// The closed set of scan strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    FullScan,
    ThumbnailScan,
    IndexScan,
}

/// Pure strategy selection.
///
/// Fixed, non-reorderable decision tree:
/// 1. envelope covers the dataset's bounds → thumbnail when sampled and
///    available, else full scan (never an index scan);
/// 2. dataset not spatially clustered → thumbnail when sampled and
///    available, else full scan scoped to the range;
/// 3. otherwise → index scan.
///
/// Ties prefer the cheaper strategy (thumbnail > full > index): thumbnail
/// and full scans carry no cache-consistency concerns.
pub fn choose_strategy(
    spatially_clustered: bool,
    has_thumbnail: bool,
    covers_dataset: bool,
    sampled: bool,
) -> Strategy {
    if covers_dataset || !spatially_clustered {
        if sampled && has_thumbnail {
            Strategy::ThumbnailScan
        } else {
            Strategy::FullScan
        }
    } else {
        Strategy::IndexScan
    }
}

/// Collaborators shared by all strategy executions.
#[derive(Debug, Clone)]
pub struct ScanContext {
    pub remote: Arc<dyn RemoteDatasetService>,
    pub cache: Arc<TieredPartitionCache>,
    pub prefetch: Arc<PrefetchService>,
    pub config: RouterConfig,
}

impl ScanContext {
    /// Full scan: whole dataset (`envelope == None`) or a range of it.
    ///
    /// `total_hint` sizes the sample ratio when the caller already has an
    /// estimate (dataset count for whole-dataset scans, the cluster
    /// estimate when an index scan degrades to a full scan). A ranged scan
    /// that must sample without a usable ratio materializes a scoped
    /// temporary dataset and aggregates it first.
    pub async fn full_scan(
        &self,
        descriptor: &DatasetDescriptor,
        envelope: Option<&Envelope>,
        sample_count: Option<u64>,
        total_hint: Option<u64>,
    ) -> Result<RowStream> {
        let id = &descriptor.id;
        match (envelope, sample_count) {
            (None, None) => self.remote.scan_full(id).await,
            (None, Some(n)) => {
                let ratio = sample_ratio(n, total_hint.unwrap_or(0));
                if ratio >= 1.0 {
                    self.remote.scan_full(id).await
                } else {
                    self.remote.sample(id, ratio).await
                }
            }
            (Some(env), None) => self.remote.scan_range(id, env).await,
            (Some(env), Some(n)) => {
                if let Some(total) = total_hint {
                    if sample_ratio(n, total) >= 1.0 {
                        return self.remote.scan_range(id, env).await;
                    }
                }
                self.scoped_ranged_sample(descriptor, env, n, total_hint).await
            }
        }
    }

    /// Sample a ranged subset via a scoped temporary dataset.
    ///
    /// The temporary dataset is deleted when the returned stream closes,
    /// including early close and error paths.
    async fn scoped_ranged_sample(
        &self,
        descriptor: &DatasetDescriptor,
        envelope: &Envelope,
        sample_count: u64,
        total_hint: Option<u64>,
    ) -> Result<RowStream> {
        let plan = ScopedDatasetPlan {
            source_dataset: descriptor.id.clone(),
            envelope: *envelope,
        };
        let scoped_id = self.remote.create_scoped_dataset(&plan).await?;
        debug!(source = %descriptor.id, scoped = %scoped_id, "materialized scoped dataset");

        match self.scoped_stream(&scoped_id, sample_count, total_hint).await {
            Ok(stream) => {
                let remote = self.remote.clone();
                let cleanup_id = scoped_id;
                Ok(stream.on_close(move || async move {
                    if let Err(e) = remote.delete_dataset(&cleanup_id).await {
                        debug!(dataset = %cleanup_id, error = %e, "scoped dataset delete failed");
                    }
                }))
            }
            Err(e) => {
                if let Err(del) = self.remote.delete_dataset(&scoped_id).await {
                    debug!(dataset = %scoped_id, error = %del, "scoped dataset delete failed");
                }
                Err(e)
            }
        }
    }

    async fn scoped_stream(
        &self,
        scoped_id: &str,
        sample_count: u64,
        total_hint: Option<u64>,
    ) -> Result<RowStream> {
        let total = match total_hint {
            Some(total) => total,
            None => self.remote.aggregate(scoped_id).await?.0,
        };
        let ratio = sample_ratio(sample_count, total);
        if ratio >= 1.0 {
            self.remote.scan_full(scoped_id).await
        } else {
            self.remote.sample(scoped_id, ratio).await
        }
    }

    /// Thumbnail scan. Signals `ThumbnailInsufficient` when the dataset has
    /// no thumbnail or the thumbnail cannot satisfy the request.
    pub async fn thumbnail_scan(
        &self,
        descriptor: &DatasetDescriptor,
        envelope: &Envelope,
        sample_count: u64,
    ) -> Result<RowStream> {
        if !descriptor.has_thumbnail {
            return Err(Error::thumbnail_insufficient(format!(
                "dataset '{}' has no thumbnail",
                descriptor.id
            )));
        }
        self.remote
            .read_thumbnail(&descriptor.id, envelope, sample_count)
            .await
    }

    /// Index scan over a spatially clustered dataset.
    pub async fn index_scan(
        &self,
        descriptor: &DatasetDescriptor,
        envelope: &Envelope,
        sample_count: Option<u64>,
        dataset_count: u64,
    ) -> Result<RowStream> {
        let id = &descriptor.id;
        let clusters = catalog::overlapping(self.remote.as_ref(), id, envelope).await?;
        let est = catalog::estimate(envelope, clusters);
        if est.total == 0 {
            return Ok(RowStream::empty());
        }

        // A near-total scan is not worth the index overhead.
        if (est.total as f64) > self.config.full_scan_fraction * (dataset_count as f64) {
            if let Some(n) = sample_count {
                if descriptor.has_thumbnail {
                    match self.thumbnail_scan(descriptor, envelope, n).await {
                        Ok(stream) => return Ok(stream),
                        Err(e) if e.is_thumbnail_insufficient() => {
                            debug!(dataset = %id, "thumbnail insufficient for near-total scan");
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            return self
                .full_scan(descriptor, Some(envelope), sample_count, Some(est.total))
                .await;
        }

        let ratio = sample_count
            .map(|n| sample_ratio(n, est.total))
            .unwrap_or(1.0);

        // Classify the relevant clusters by cache residency.
        let mut disk_only = 0usize;
        let mut uncached = Vec::new();
        for cluster in &est.clusters {
            let key = PartitionKey::new(id.clone(), cluster.info.quad_key.clone());
            if self.cache.exists_in_memory(&key) {
                continue;
            }
            if self.cache.exists_on_disk(&key).await {
                disk_only += 1;
            } else {
                uncached.push(key);
            }
        }

        let relevant = est.clusters.len();
        if relevant > self.config.max_relevant_clusters
            || disk_only > self.config.max_disk_only_clusters
            || uncached.len() > self.config.max_uncached_clusters
        {
            debug!(
                dataset = %id,
                relevant,
                disk_only,
                uncached = uncached.len(),
                "cluster thresholds exceeded; delegating to remote scan"
            );
            let stream = self.remote.scan_range(id, envelope).await?;
            // Warm the cache for the uncached clusters while the caller
            // consumes the foreground stream. Closing the query early
            // cancels whatever has not started.
            let cancel = stream.cancel_token();
            for key in uncached {
                self.prefetch.try_enqueue(PrefetchRequest {
                    key,
                    cancel: cancel.clone(),
                });
            }
            return Ok(stream);
        }

        // Serve entirely from the local cache.
        let mut rows = Vec::new();
        for cluster in &est.clusters {
            let key = PartitionKey::new(id.clone(), cluster.info.quad_key.clone());
            let partition = self.cache.get(&key).await?;
            sample_partition_rows(
                &partition,
                descriptor.geometry_column,
                envelope,
                ratio,
                &mut rows,
            );
        }
        debug!(dataset = %id, clusters = relevant, rows = rows.len(), "index scan served locally");
        Ok(RowStream::from_rows(rows))
    }
}

/// Ratio of requested samples to estimated matches, in (0, 1].
fn sample_ratio(sample_count: u64, total_estimate: u64) -> f64 {
    if total_estimate == 0 {
        return 1.0;
    }
    (sample_count as f64 / total_estimate as f64).min(1.0)
}

/// Filter one partition's rows by the query envelope and apply a Bernoulli
/// trial per row at the global ratio.
///
/// Sampling per cluster at the *global* ratio keeps contributions
/// proportional: each cluster is expected to contribute `ratio ×` its own
/// matching-row count, so small clusters are not starved by large ones.
/// The RNG is seeded from the partition key, making a given query's sample
/// reproducible.
fn sample_partition_rows(
    partition: &Partition,
    geometry_column: Option<usize>,
    envelope: &Envelope,
    ratio: f64,
    out: &mut Vec<Row>,
) {
    let mut rng = SmallRng::seed_from_u64(sampling_seed(&partition.key));
    for row in partition.rows.iter() {
        let Some(geom) = row.geometry(geometry_column) else {
            continue;
        };
        if !envelope.intersects_geometry(geom) {
            continue;
        }
        if ratio >= 1.0 || rng.gen::<f64>() < ratio {
            out.push(row.clone());
        }
    }
}

fn sampling_seed(key: &PartitionKey) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::FieldValue;
    use geo_types::Point;

    #[test]
    fn test_choose_strategy_full_coverage_never_indexes() {
        // Clustering is irrelevant once the envelope covers the dataset.
        for clustered in [false, true] {
            assert_eq!(
                choose_strategy(clustered, false, true, false),
                Strategy::FullScan
            );
            assert_eq!(
                choose_strategy(clustered, true, true, true),
                Strategy::ThumbnailScan
            );
            // Thumbnail requires a sample count.
            assert_eq!(
                choose_strategy(clustered, true, true, false),
                Strategy::FullScan
            );
        }
    }

    #[test]
    fn test_choose_strategy_unclustered() {
        assert_eq!(
            choose_strategy(false, false, false, true),
            Strategy::FullScan
        );
        assert_eq!(
            choose_strategy(false, true, false, true),
            Strategy::ThumbnailScan
        );
    }

    #[test]
    fn test_choose_strategy_clustered_range() {
        assert_eq!(
            choose_strategy(true, true, false, true),
            Strategy::IndexScan
        );
        assert_eq!(
            choose_strategy(true, false, false, false),
            Strategy::IndexScan
        );
    }

    #[test]
    fn test_sample_ratio_bounds() {
        assert_eq!(sample_ratio(50, 100), 0.5);
        assert_eq!(sample_ratio(200, 100), 1.0);
        assert_eq!(sample_ratio(10, 0), 1.0);
    }

    fn partition_of_points(quad_key: &str, n: usize) -> Partition {
        let rows: Vec<Row> = (0..n)
            .map(|i| {
                Row::new(vec![
                    FieldValue::Int(i as i64),
                    FieldValue::Geometry(Point::new(i as f64 * 0.01, 0.5).into()),
                ])
            })
            .collect();
        let byte_len = rows.len() * 32;
        Partition::new(PartitionKey::new("ds", quad_key), rows, byte_len)
    }

    #[test]
    fn test_proportional_sampling_no_starvation() {
        // Clusters of 100 and 10 matching rows at a global ratio of 0.5:
        // expected contributions ~[50, 5], not [55, 0] or [0, 55].
        let big = partition_of_points("0", 100);
        let small = partition_of_points("1", 10);
        let env = Envelope::new(-1.0, -1.0, 2.0, 2.0);

        let mut from_big = Vec::new();
        sample_partition_rows(&big, Some(1), &env, 0.5, &mut from_big);
        let mut from_small = Vec::new();
        sample_partition_rows(&small, Some(1), &env, 0.5, &mut from_small);

        assert!(
            (30..=70).contains(&from_big.len()),
            "big cluster contributed {} rows",
            from_big.len()
        );
        assert!(
            (1..=10).contains(&from_small.len()),
            "small cluster contributed {} rows",
            from_small.len()
        );
    }

    #[test]
    fn test_ratio_one_keeps_every_matching_row() {
        let partition = partition_of_points("0", 25);
        let env = Envelope::new(-1.0, -1.0, 2.0, 2.0);
        let mut rows = Vec::new();
        sample_partition_rows(&partition, Some(1), &env, 1.0, &mut rows);
        assert_eq!(rows.len(), 25);
    }

    #[test]
    fn test_envelope_filter_applies_before_sampling() {
        let partition = partition_of_points("0", 100);
        // Points are at x = 0.00..0.99; keep only x <= 0.25.
        let env = Envelope::new(0.0, 0.0, 0.25, 1.0);
        let mut rows = Vec::new();
        sample_partition_rows(&partition, Some(1), &env, 1.0, &mut rows);
        assert_eq!(rows.len(), 26);
    }

    #[test]
    fn test_rows_without_geometry_are_skipped() {
        let rows = vec![Row::new(vec![FieldValue::Int(1), FieldValue::Null])];
        let partition = Partition::new(PartitionKey::new("ds", "2"), rows, 16);
        let env = Envelope::new(-10.0, -10.0, 10.0, 10.0);
        let mut out = Vec::new();
        sample_partition_rows(&partition, Some(1), &env, 1.0, &mut out);
        assert!(out.is_empty());
    }
}
