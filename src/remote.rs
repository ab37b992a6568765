//! Remote dataset-service interface.
//!
//! The remote service is the authoritative store: it owns the data, the
//! spatial clustering, the thumbnails, and the opaque partition encoding.
//! This module defines the `async_trait` seam the core consumes, plus
//! [`MemoryDatasetService`], a complete in-process implementation used by
//! unit and integration tests.
//!
//! The memory implementation counts every remote operation so tests can
//! assert properties like "served entirely from cache, zero remote calls"
//! or "exactly one fetch across N concurrent getters".

use crate::catalog::ClusterInfo;
use crate::dataset::DatasetDescriptor;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::record::Row;
use crate::stream::RowStream;
use async_trait::async_trait;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

/// Server-side plan for materializing a scoped temporary dataset.
///
/// Used by ranged full scans that must sample: the ranged subset is
/// materialized remotely, sampled, and deleted when the stream closes.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopedDatasetPlan {
    pub source_dataset: String,
    pub envelope: Envelope,
}

/// The remote dataset service collaborator.
///
/// All operations that can fail loudly do; the core never retries on the
/// caller's behalf. Partition payloads returned by [`read_raw_cluster`]
/// are opaque; only [`decode_cluster`] (also owned by the service) can
/// interpret them, and the core observes only their byte length.
///
/// [`read_raw_cluster`]: RemoteDatasetService::read_raw_cluster
/// [`decode_cluster`]: RemoteDatasetService::decode_cluster
#[async_trait]
pub trait RemoteDatasetService: Debug + Send + Sync {
    /// Static dataset description (schema, flags, declared stats).
    async fn dataset_descriptor(&self, dataset_id: &str) -> Result<DatasetDescriptor>;

    /// Clusters whose tile bounds overlap the envelope.
    async fn cluster_info(&self, dataset_id: &str, envelope: &Envelope)
        -> Result<Vec<ClusterInfo>>;

    /// Opaque encoded partition bytes for one cluster.
    async fn read_raw_cluster(&self, dataset_id: &str, quad_key: &str) -> Result<Vec<u8>>;

    /// Decode an opaque partition payload into rows.
    fn decode_cluster(&self, dataset_id: &str, bytes: &[u8]) -> Result<Vec<Row>>;

    /// Read from the dataset's pre-built thumbnail.
    ///
    /// Fails with [`Error::ThumbnailInsufficient`] when the thumbnail
    /// cannot satisfy the request; callers fall back to another strategy.
    async fn read_thumbnail(
        &self,
        dataset_id: &str,
        envelope: &Envelope,
        sample_count: u64,
    ) -> Result<RowStream>;

    /// Server-side range-filtered scan.
    async fn scan_range(&self, dataset_id: &str, envelope: &Envelope) -> Result<RowStream>;

    /// Server-side full scan.
    async fn scan_full(&self, dataset_id: &str) -> Result<RowStream>;

    /// Server-side Bernoulli sample at the given ratio in (0, 1].
    async fn sample(&self, dataset_id: &str, ratio: f64) -> Result<RowStream>;

    /// Materialize a scoped temporary dataset; returns its id.
    async fn create_scoped_dataset(&self, plan: &ScopedDatasetPlan) -> Result<String>;

    /// Delete a dataset (scoped temporaries only, from this core's side).
    async fn delete_dataset(&self, dataset_id: &str) -> Result<()>;

    /// Aggregate record count and bounding envelope.
    async fn aggregate(&self, dataset_id: &str) -> Result<(u64, Option<Envelope>)>;
}

// ============================================================================
// MemoryDatasetService
// ============================================================================

/// One cluster held by the memory service.
#[derive(Debug, Clone)]
pub struct MemoryCluster {
    pub info: ClusterInfo,
    pub rows: Vec<Row>,
}

/// One dataset held by the memory service.
#[derive(Debug, Clone)]
pub struct MemoryDataset {
    pub descriptor: DatasetDescriptor,
    pub rows: Vec<Row>,
    pub clusters: Vec<MemoryCluster>,
    pub thumbnail: Option<Vec<Row>>,
}

impl MemoryDataset {
    pub fn new(descriptor: DatasetDescriptor, rows: Vec<Row>) -> Self {
        Self {
            descriptor,
            rows,
            clusters: Vec::new(),
            thumbnail: None,
        }
    }

    /// Attach a cluster. The descriptor should be marked clustered.
    pub fn with_cluster(mut self, info: ClusterInfo, rows: Vec<Row>) -> Self {
        self.clusters.push(MemoryCluster { info, rows });
        self
    }

    /// Attach a pre-sampled thumbnail.
    pub fn with_thumbnail_rows(mut self, rows: Vec<Row>) -> Self {
        self.thumbnail = Some(rows);
        self
    }
}

/// Per-operation call counts, snapshotted for test assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteCallCounts {
    pub descriptor: u64,
    pub cluster_info: u64,
    pub raw_cluster: u64,
    pub thumbnail: u64,
    pub range_scan: u64,
    pub full_scan: u64,
    pub sample: u64,
    pub scoped_create: u64,
    pub dataset_delete: u64,
    pub aggregate: u64,
}

#[derive(Debug, Default)]
struct CallCounters {
    descriptor: AtomicU64,
    cluster_info: AtomicU64,
    raw_cluster: AtomicU64,
    thumbnail: AtomicU64,
    range_scan: AtomicU64,
    full_scan: AtomicU64,
    sample: AtomicU64,
    scoped_create: AtomicU64,
    dataset_delete: AtomicU64,
    aggregate: AtomicU64,
}

impl CallCounters {
    fn snapshot(&self) -> RemoteCallCounts {
        RemoteCallCounts {
            descriptor: self.descriptor.load(Ordering::Relaxed),
            cluster_info: self.cluster_info.load(Ordering::Relaxed),
            raw_cluster: self.raw_cluster.load(Ordering::Relaxed),
            thumbnail: self.thumbnail.load(Ordering::Relaxed),
            range_scan: self.range_scan.load(Ordering::Relaxed),
            full_scan: self.full_scan.load(Ordering::Relaxed),
            sample: self.sample.load(Ordering::Relaxed),
            scoped_create: self.scoped_create.load(Ordering::Relaxed),
            dataset_delete: self.dataset_delete.load(Ordering::Relaxed),
            aggregate: self.aggregate.load(Ordering::Relaxed),
        }
    }
}

/// A complete in-process dataset service for tests.
///
/// Partition payloads are JSON-encoded row vectors; the core never looks
/// inside them, it only measures their length for cache weighting.
#[derive(Debug, Default)]
pub struct MemoryDatasetService {
    datasets: RwLock<HashMap<String, MemoryDataset>>,
    scoped_seq: AtomicU64,
    fail_aggregate: AtomicBool,
    calls: CallCounters,
}

impl MemoryDatasetService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dataset. Replaces any existing dataset with the same id.
    pub fn insert_dataset(&self, dataset: MemoryDataset) {
        self.datasets
            .write()
            .expect("RwLock poisoned")
            .insert(dataset.descriptor.id.clone(), dataset);
    }

    /// Make subsequent `aggregate` calls fail (stats-failure tests).
    pub fn set_fail_aggregate(&self, fail: bool) {
        self.fail_aggregate.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of per-operation call counts.
    pub fn counts(&self) -> RemoteCallCounts {
        self.calls.snapshot()
    }

    /// Whether a dataset id is currently registered (scoped-cleanup tests).
    pub fn contains_dataset(&self, dataset_id: &str) -> bool {
        self.datasets
            .read()
            .expect("RwLock poisoned")
            .contains_key(dataset_id)
    }

    fn with_dataset<T>(
        &self,
        dataset_id: &str,
        f: impl FnOnce(&MemoryDataset) -> T,
    ) -> Result<T> {
        let datasets = self.datasets.read().expect("RwLock poisoned");
        let ds = datasets
            .get(dataset_id)
            .ok_or_else(|| Error::not_found(format!("dataset '{dataset_id}'")))?;
        Ok(f(ds))
    }

    fn rows_in_envelope(ds: &MemoryDataset, rows: &[Row], envelope: &Envelope) -> Vec<Row> {
        match ds.descriptor.geometry_column {
            Some(col) => rows
                .iter()
                .filter(|r| {
                    r.geometry(Some(col))
                        .is_some_and(|g| envelope.intersects_geometry(g))
                })
                .cloned()
                .collect(),
            // No geometry column: the server cannot filter by range.
            None => rows.to_vec(),
        }
    }

    fn sample_seed(dataset_id: &str) -> u64 {
        let mut h = DefaultHasher::new();
        dataset_id.hash(&mut h);
        h.finish()
    }
}

#[async_trait]
impl RemoteDatasetService for MemoryDatasetService {
    async fn dataset_descriptor(&self, dataset_id: &str) -> Result<DatasetDescriptor> {
        self.calls.descriptor.fetch_add(1, Ordering::Relaxed);
        self.with_dataset(dataset_id, |ds| ds.descriptor.clone())
    }

    async fn cluster_info(
        &self,
        dataset_id: &str,
        envelope: &Envelope,
    ) -> Result<Vec<ClusterInfo>> {
        self.calls.cluster_info.fetch_add(1, Ordering::Relaxed);
        self.with_dataset(dataset_id, |ds| {
            ds.clusters
                .iter()
                .filter(|c| c.info.tile_bounds.intersects(envelope))
                .map(|c| c.info.clone())
                .collect()
        })
    }

    async fn read_raw_cluster(&self, dataset_id: &str, quad_key: &str) -> Result<Vec<u8>> {
        self.calls.raw_cluster.fetch_add(1, Ordering::Relaxed);
        let rows = self.with_dataset(dataset_id, |ds| {
            ds.clusters
                .iter()
                .find(|c| c.info.quad_key == quad_key)
                .map(|c| c.rows.clone())
        })?;
        let rows = rows.ok_or_else(|| {
            Error::not_found(format!("cluster '{quad_key}' of dataset '{dataset_id}'"))
        })?;
        Ok(serde_json::to_vec(&rows)?)
    }

    fn decode_cluster(&self, _dataset_id: &str, bytes: &[u8]) -> Result<Vec<Row>> {
        Ok(serde_json::from_slice(bytes)?)
    }

    async fn read_thumbnail(
        &self,
        dataset_id: &str,
        envelope: &Envelope,
        sample_count: u64,
    ) -> Result<RowStream> {
        self.calls.thumbnail.fetch_add(1, Ordering::Relaxed);
        let rows = self.with_dataset(dataset_id, |ds| {
            ds.thumbnail
                .as_ref()
                .map(|rows| Self::rows_in_envelope(ds, rows, envelope))
        })?;
        let Some(mut rows) = rows else {
            return Err(Error::thumbnail_insufficient(format!(
                "dataset '{dataset_id}' has no thumbnail"
            )));
        };
        if (rows.len() as u64) < sample_count {
            return Err(Error::thumbnail_insufficient(format!(
                "{} thumbnail rows in range, {} requested",
                rows.len(),
                sample_count
            )));
        }
        rows.truncate(sample_count as usize);
        Ok(RowStream::from_rows(rows))
    }

    async fn scan_range(&self, dataset_id: &str, envelope: &Envelope) -> Result<RowStream> {
        self.calls.range_scan.fetch_add(1, Ordering::Relaxed);
        let rows =
            self.with_dataset(dataset_id, |ds| Self::rows_in_envelope(ds, &ds.rows, envelope))?;
        Ok(RowStream::from_rows(rows))
    }

    async fn scan_full(&self, dataset_id: &str) -> Result<RowStream> {
        self.calls.full_scan.fetch_add(1, Ordering::Relaxed);
        let rows = self.with_dataset(dataset_id, |ds| ds.rows.clone())?;
        Ok(RowStream::from_rows(rows))
    }

    async fn sample(&self, dataset_id: &str, ratio: f64) -> Result<RowStream> {
        self.calls.sample.fetch_add(1, Ordering::Relaxed);
        if !(0.0..=1.0).contains(&ratio) || ratio == 0.0 {
            return Err(Error::invalid_query(format!(
                "sample ratio {ratio} outside (0, 1]"
            )));
        }
        let rows = self.with_dataset(dataset_id, |ds| ds.rows.clone())?;
        let mut rng = SmallRng::seed_from_u64(Self::sample_seed(dataset_id));
        let sampled: Vec<Row> = rows
            .into_iter()
            .filter(|_| rng.gen::<f64>() < ratio)
            .collect();
        Ok(RowStream::from_rows(sampled))
    }

    async fn create_scoped_dataset(&self, plan: &ScopedDatasetPlan) -> Result<String> {
        self.calls.scoped_create.fetch_add(1, Ordering::Relaxed);
        let (schema, geometry_column, rows) = self.with_dataset(&plan.source_dataset, |ds| {
            (
                ds.descriptor.schema.clone(),
                ds.descriptor.geometry_column,
                Self::rows_in_envelope(ds, &ds.rows, &plan.envelope),
            )
        })?;

        let seq = self.scoped_seq.fetch_add(1, Ordering::Relaxed);
        let id = format!("scoped-{}-{}", plan.source_dataset, seq);

        let mut descriptor = DatasetDescriptor::new(id.clone(), schema);
        descriptor.geometry_column = geometry_column;
        descriptor.record_count = Some(rows.len() as u64);
        self.insert_dataset(MemoryDataset::new(descriptor, rows));
        Ok(id)
    }

    async fn delete_dataset(&self, dataset_id: &str) -> Result<()> {
        self.calls.dataset_delete.fetch_add(1, Ordering::Relaxed);
        // Idempotent: deleting a missing dataset succeeds.
        self.datasets
            .write()
            .expect("RwLock poisoned")
            .remove(dataset_id);
        Ok(())
    }

    async fn aggregate(&self, dataset_id: &str) -> Result<(u64, Option<Envelope>)> {
        self.calls.aggregate.fetch_add(1, Ordering::Relaxed);
        if self.fail_aggregate.load(Ordering::SeqCst) {
            return Err(Error::remote_fetch(format!(
                "aggregation failed for dataset '{dataset_id}'"
            )));
        }
        self.with_dataset(dataset_id, |ds| {
            let count = ds.rows.len() as u64;
            let bounds = ds
                .rows
                .iter()
                .filter_map(|r| r.bounds(ds.descriptor.geometry_column))
                .reduce(|a, b| a.union(&b));
            (count, bounds)
        })
    }
}
