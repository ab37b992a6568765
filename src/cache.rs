//! Tiered partition cache.
//!
//! Two tiers behind one abstraction:
//!
//! - **Memory tier**: `moka` cache of decoded [`Partition`]s, weighted by
//!   encoded byte size, capped, expire-after-access. A derived, droppable
//!   accelerator: an evicted entry can always be rebuilt from disk or from
//!   the remote service.
//! - **Disk tier**: one file per partition under
//!   `{root}/{sha256(dataset_id)}/{quad_key}.part`, holding the opaque
//!   encoded payload exactly as fetched. The durable source of truth for a
//!   cached partition; unbounded here, removed only by
//!   [`on_dataset_evicted`](TieredPartitionCache::on_dataset_evicted).
//!
//! A single loader drives both tiers with single-flight de-duplication:
//! concurrent `get`s for one key share a fetch via a `dashmap`-tracked
//! watch channel, and an RAII guard removes orphaned in-flight entries if
//! the fetching task is dropped mid-fetch so waiters retry instead of
//! hanging.
//!
//! The cache is strictly an optimization: disk failures are logged and
//! swallowed, and only remote-fetch failures propagate to callers.

use crate::error::{Error, Result};
use crate::partition::{Partition, PartitionKey};
use crate::remote::RemoteDatasetService;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Snapshot of cache counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    /// Decoded partition already in the memory tier.
    pub memory_hits: u64,
    /// Payload found on disk and decoded.
    pub disk_hits: u64,
    /// Payload fetched from the remote service.
    pub remote_fetches: u64,
    /// `get` calls that waited on another caller's in-flight fetch.
    pub inflight_hits: u64,
    /// Disk spills that failed and were swallowed.
    pub disk_write_failures: u64,
    /// Memory-tier evictions.
    pub evictions: u64,
    /// Disk-tier writes via `put`.
    pub puts: u64,
}

/// Atomic cache statistics for lock-free hot path tracking.
#[derive(Debug, Default)]
struct AtomicCacheStats {
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    remote_fetches: AtomicU64,
    inflight_hits: AtomicU64,
    disk_write_failures: AtomicU64,
    evictions: AtomicU64,
    puts: AtomicU64,
}

impl AtomicCacheStats {
    fn snapshot(&self) -> CacheStats {
        use Ordering::Relaxed;
        CacheStats {
            memory_hits: self.memory_hits.load(Relaxed),
            disk_hits: self.disk_hits.load(Relaxed),
            remote_fetches: self.remote_fetches.load(Relaxed),
            inflight_hits: self.inflight_hits.load(Relaxed),
            disk_write_failures: self.disk_write_failures.load(Relaxed),
            evictions: self.evictions.load(Relaxed),
            puts: self.puts.load(Relaxed),
        }
    }
}

/// In-flight fetch state for single-flight deduplication.
type InFlightResult = std::result::Result<Partition, Arc<str>>;
type InFlightSender = Arc<tokio::sync::watch::Sender<Option<InFlightResult>>>;
type InFlightMap = DashMap<PartitionKey, InFlightSender>;

/// RAII guard to prevent orphaned in-flight entries.
///
/// If the fetcher task is dropped/cancelled mid-fetch, the guard removes
/// the in-flight entry, dropping the last sender. Waiters observe channel
/// closure and retry rather than hanging forever.
struct InFlightFetchGuard<'a> {
    key: PartitionKey,
    map: &'a InFlightMap,
    tx: InFlightSender,
    finished: bool,
}

impl<'a> InFlightFetchGuard<'a> {
    fn new(key: PartitionKey, map: &'a InFlightMap, tx: InFlightSender) -> Self {
        Self {
            key,
            map,
            tx,
            finished: false,
        }
    }

    fn finish(mut self, msg: InFlightResult) {
        // Send before removing so late subscribers still observe the result.
        let _ = self.tx.send(Some(msg));
        self.map.remove(&self.key);
        self.finished = true;
    }
}

impl Drop for InFlightFetchGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.map.remove(&self.key);
        }
    }
}

/// Disk-backed + memory-backed store of decoded partitions.
pub struct TieredPartitionCache {
    memory: moka::sync::Cache<PartitionKey, Partition>,
    in_flight: InFlightMap,
    remote: Arc<dyn RemoteDatasetService>,
    disk_root: PathBuf,
    stats: Arc<AtomicCacheStats>,
}

impl std::fmt::Debug for TieredPartitionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredPartitionCache")
            .field("entry_count", &self.memory.entry_count())
            .field("weighted_size", &self.memory.weighted_size())
            .field("in_flight", &self.in_flight.len())
            .field("disk_root", &self.disk_root)
            .finish()
    }
}

impl TieredPartitionCache {
    /// Create a cache with the given remote loader, disk root, memory
    /// capacity (encoded bytes) and memory expire-after-access window.
    pub fn new(
        remote: Arc<dyn RemoteDatasetService>,
        disk_root: impl Into<PathBuf>,
        max_memory_bytes: u64,
        memory_idle: Duration,
    ) -> Self {
        let stats = Arc::new(AtomicCacheStats::default());
        let eviction_stats = stats.clone();

        let memory = moka::sync::Cache::builder()
            .weigher(|_key: &PartitionKey, value: &Partition| -> u32 {
                // moka weights are u32; partitions are far below 4GiB
                value.byte_len.min(u32::MAX as usize) as u32
            })
            .max_capacity(max_memory_bytes)
            .time_to_idle(memory_idle)
            .eviction_listener(move |key: Arc<PartitionKey>, _value, cause| {
                eviction_stats.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, ?cause, "memory tier dropped partition");
            })
            .build();

        Self {
            memory,
            in_flight: DashMap::new(),
            remote,
            disk_root: disk_root.into(),
            stats,
        }
    }

    /// Snapshot of cache counters.
    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    /// Number of partitions currently decoded in memory.
    pub fn memory_entry_count(&self) -> u64 {
        self.memory.entry_count()
    }

    /// Current memory-tier weight in encoded bytes.
    pub fn memory_weighted_size(&self) -> u64 {
        self.memory.weighted_size()
    }

    /// Run the memory tier's pending maintenance (eviction bookkeeping).
    pub fn run_pending_tasks(&self) {
        self.memory.run_pending_tasks();
    }

    fn dataset_dir(&self, dataset_id: &str) -> PathBuf {
        self.disk_root.join(hex::encode(Sha256::digest(dataset_id)))
    }

    fn partition_path(&self, key: &PartitionKey) -> PathBuf {
        self.dataset_dir(&key.dataset_id)
            .join(format!("{}.part", key.quad_key))
    }

    /// Whether a decoded partition is resident in the memory tier.
    /// Diagnostic/planning query; no side effects.
    pub fn exists_in_memory(&self, key: &PartitionKey) -> bool {
        self.memory.contains_key(key)
    }

    /// Whether the partition's payload is spilled to the disk tier.
    /// Diagnostic/planning query; no side effects.
    pub async fn exists_on_disk(&self, key: &PartitionKey) -> bool {
        tokio::fs::metadata(self.partition_path(key)).await.is_ok()
    }

    /// Persist an encoded payload to the disk tier only.
    ///
    /// Used by the prefetcher. Does not populate the memory tier; a later
    /// `get` decodes lazily.
    pub async fn put(&self, key: &PartitionKey, bytes: &[u8]) -> Result<()> {
        let path = self.partition_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(format!("create {}: {e}", parent.display())))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| Error::io(format!("write {}: {e}", path.display())))?;
        self.stats.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Get the decoded partition for a key.
    ///
    /// Memory hit → return; disk hit → decode, promote to memory, return;
    /// otherwise fetch from the remote service, spill to disk (best
    /// effort), decode, promote, return. Exactly one fetch is in flight per
    /// key under concurrent access.
    pub async fn get(&self, key: &PartitionKey) -> Result<Partition> {
        enum Role {
            Waiter(tokio::sync::watch::Receiver<Option<InFlightResult>>),
            Fetcher(InFlightSender),
        }

        loop {
            if let Some(partition) = self.memory.get(key) {
                self.stats.memory_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(partition);
            }

            // Atomically join an in-flight fetch or become the fetcher.
            let role = {
                use dashmap::mapref::entry::Entry;
                match self.in_flight.entry(key.clone()) {
                    Entry::Occupied(entry) => Role::Waiter(entry.get().subscribe()),
                    Entry::Vacant(entry) => {
                        let (tx, _rx) = tokio::sync::watch::channel(None::<InFlightResult>);
                        let tx = Arc::new(tx);
                        entry.insert(tx.clone());
                        Role::Fetcher(tx)
                    }
                }
            };

            let mut rx = match role {
                Role::Fetcher(tx) => return self.fetch_as_leader(key, tx).await,
                Role::Waiter(rx) => rx,
            };

            loop {
                let current = rx.borrow().clone();
                if let Some(outcome) = current {
                    self.stats.inflight_hits.fetch_add(1, Ordering::Relaxed);
                    return match outcome {
                        Ok(partition) => Ok(partition),
                        Err(msg) => Err(Error::remote_fetch(msg.to_string())),
                    };
                }
                if rx.changed().await.is_err() {
                    // Orphaned in-flight: the fetcher was dropped before
                    // completing. Retry the whole lookup.
                    break;
                }
            }
        }
    }

    /// Run the load as the single in-flight fetcher for `key`.
    async fn fetch_as_leader(&self, key: &PartitionKey, tx: InFlightSender) -> Result<Partition> {
        let guard = InFlightFetchGuard::new(key.clone(), &self.in_flight, tx);

        let result = self.load(key).await;
        if let Ok(partition) = &result {
            self.memory.insert(key.clone(), partition.clone());
        }

        match result {
            Ok(partition) => {
                guard.finish(Ok(partition.clone()));
                Ok(partition)
            }
            Err(e) => {
                guard.finish(Err(Arc::<str>::from(e.to_string())));
                Err(e)
            }
        }
    }

    /// Load a partition from disk, falling back to the remote service.
    async fn load(&self, key: &PartitionKey) -> Result<Partition> {
        let path = self.partition_path(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => match self.remote.decode_cluster(&key.dataset_id, &bytes) {
                Ok(rows) => {
                    self.stats.disk_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Partition::new(key.clone(), rows, bytes.len()));
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "cached partition file is corrupt; refetching");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(key = %key, error = %e, "disk tier read failed; refetching");
            }
        }

        self.stats.remote_fetches.fetch_add(1, Ordering::Relaxed);
        let bytes = self
            .remote
            .read_raw_cluster(&key.dataset_id, &key.quad_key)
            .await?;

        // The disk spill is an optimization; the freshly fetched bytes are
        // authoritative for this call either way.
        if let Err(e) = self.put(key, &bytes).await {
            self.stats.disk_write_failures.fetch_add(1, Ordering::Relaxed);
            warn!(key = %key, error = %e, "disk tier write failed; partition served unspilled");
        }

        let rows = self.remote.decode_cluster(&key.dataset_id, &bytes)?;
        Ok(Partition::new(key.clone(), rows, bytes.len()))
    }

    /// Drop every memory and disk entry belonging to a dataset.
    ///
    /// Triggered when the dataset's statistics entry is evicted for
    /// idleness, so long-unused datasets do not leak cached storage.
    pub async fn on_dataset_evicted(&self, dataset_id: &str) {
        let keys: Vec<PartitionKey> = self
            .memory
            .iter()
            .filter(|(k, _)| k.dataset_id == dataset_id)
            .map(|(k, _)| (*k).clone())
            .collect();
        for key in &keys {
            self.memory.invalidate(key);
        }
        self.memory.run_pending_tasks();

        let dir = self.dataset_dir(dataset_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(dataset = dataset_id, partitions = keys.len(), "dropped cached partitions");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(dataset = dataset_id, error = %e, "failed to remove disk cache directory");
            }
        }
    }
}
