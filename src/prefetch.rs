//! Background partition prefetch service.
//!
//! When an index scan delegates a query to the remote service, the clusters
//! it could not serve locally are handed to this service so the next nearby
//! query finds them on disk. Prefetch is strictly best-effort: requests are
//! dropped when the queue is full, failures are logged and forgotten, and
//! the cache's single-flight loader guarantees prefetch and mainline work
//! never duplicate a fetch.
//!
//! # Architecture
//!
//! One dispatcher task owns the bounded request channel. For each request it
//! acquires a semaphore permit and spawns a worker; the permit bounds
//! concurrent remote reads, in-flight bytes, and disk writes. Workers write
//! to the disk tier only (`TieredPartitionCache::put`); decoding happens
//! lazily on the first `get`.
//!
//! Each request carries the enclosing query's [`CancelToken`]; a cancelled
//! query's prefetch work stops at the next suspension point instead of
//! outliving the query.

use crate::cache::TieredPartitionCache;
use crate::partition::PartitionKey;
use crate::remote::RemoteDatasetService;
use crate::stream::CancelToken;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tracing::debug;

// Global counters for prefetch diagnostics
static PREFETCH_ENQUEUED: AtomicU64 = AtomicU64::new(0);
static PREFETCH_COMPLETED: AtomicU64 = AtomicU64::new(0);

/// Get and reset prefetch statistics (enqueued, completed)
pub fn prefetch_stats_reset() -> (u64, u64) {
    let enqueued = PREFETCH_ENQUEUED.swap(0, Ordering::Relaxed);
    let completed = PREFETCH_COMPLETED.swap(0, Ordering::Relaxed);
    (enqueued, completed)
}

/// Default number of prefetch workers (bounds concurrent I/O + memory).
pub const DEFAULT_PREFETCH_WORKERS: usize = 8;

/// Default prefetch queue depth (requests buffer before dropping).
pub const DEFAULT_PREFETCH_QUEUE_DEPTH: usize = 32;

/// Configuration for the prefetch service.
#[derive(Debug, Clone)]
pub struct PrefetchConfig {
    /// Maximum number of concurrent prefetch operations.
    pub num_workers: usize,

    /// Maximum number of queued prefetch requests.
    ///
    /// When the queue is full, new requests are dropped (best-effort
    /// prefetch). This prevents unbounded memory growth under load.
    pub queue_depth: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(4);

        let num_workers = (parallelism.saturating_sub(1))
            .max(1)
            .min(DEFAULT_PREFETCH_WORKERS);
        let queue_depth = num_workers * 8;

        Self {
            num_workers,
            queue_depth,
        }
    }
}

impl PrefetchConfig {
    /// Disable prefetch entirely.
    ///
    /// Useful for tests that assert exact remote call counts.
    pub fn disabled() -> Self {
        Self {
            num_workers: 0,
            queue_depth: 1, // must be >= 1 for mpsc::channel
        }
    }

    /// Create a new configuration with custom worker count.
    pub fn with_workers(num_workers: usize) -> Self {
        let workers = num_workers.max(1);
        Self {
            num_workers: workers,
            queue_depth: workers * 8,
        }
    }

    /// Set the queue depth.
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }
}

/// A request to warm one partition.
#[derive(Debug)]
pub struct PrefetchRequest {
    /// Partition to warm.
    pub key: PartitionKey,
    /// The enclosing query's cancel token.
    pub cancel: CancelToken,
}

/// Background prefetch service for warming the disk tier.
#[derive(Debug)]
pub struct PrefetchService {
    sender: mpsc::Sender<PrefetchRequest>,
}

impl PrefetchService {
    /// Start the prefetch service.
    ///
    /// Spawns the dispatcher task, which runs until the service is dropped
    /// (all senders dropped closes the channel). Outside a tokio runtime
    /// prefetch is silently disabled rather than panicking; it is an
    /// optimization, not a dependency.
    pub fn start(
        config: PrefetchConfig,
        cache: Arc<TieredPartitionCache>,
        remote: Arc<dyn RemoteDatasetService>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.queue_depth);

        if config.num_workers > 0 && tokio::runtime::Handle::try_current().is_ok() {
            Self::spawn_dispatcher(rx, config.num_workers, cache, remote);
        }
        // else: rx drops, try_enqueue fails, prefetch is a no-op

        Arc::new(Self { sender: tx })
    }

    fn spawn_dispatcher(
        mut rx: mpsc::Receiver<PrefetchRequest>,
        num_workers: usize,
        cache: Arc<TieredPartitionCache>,
        remote: Arc<dyn RemoteDatasetService>,
    ) {
        let semaphore = Arc::new(Semaphore::new(num_workers));

        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => break,
                };

                let cache = cache.clone();
                let remote = remote.clone();
                tokio::spawn(async move {
                    // Permit is held until this task completes
                    let _permit = permit;
                    Self::warm_partition(&cache, remote.as_ref(), req).await;
                    PREFETCH_COMPLETED.fetch_add(1, Ordering::Relaxed);
                });
            }
        });
    }

    async fn warm_partition(
        cache: &TieredPartitionCache,
        remote: &dyn RemoteDatasetService,
        req: PrefetchRequest,
    ) {
        if req.cancel.is_cancelled() {
            return;
        }
        if cache.exists_on_disk(&req.key).await {
            return;
        }

        tokio::select! {
            _ = req.cancel.cancelled() => {
                debug!(key = %req.key, "prefetch cancelled by query close");
            }
            fetched = remote.read_raw_cluster(&req.key.dataset_id, &req.key.quad_key) => {
                match fetched {
                    Ok(bytes) => {
                        if let Err(e) = cache.put(&req.key, &bytes).await {
                            debug!(key = %req.key, error = %e, "prefetch disk write failed");
                        }
                    }
                    Err(e) => {
                        debug!(key = %req.key, error = %e, "prefetch fetch failed");
                    }
                }
            }
        }
    }

    /// Try to enqueue a prefetch request.
    ///
    /// Non-blocking: if the queue is full (or the service is disabled), the
    /// request is dropped. Returns `true` if the request was enqueued.
    pub fn try_enqueue(&self, request: PrefetchRequest) -> bool {
        let ok = self.sender.try_send(request).is_ok();
        if ok {
            PREFETCH_ENQUEUED.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    /// Check if the prefetch queue has capacity.
    pub fn has_capacity(&self) -> bool {
        self.sender.capacity() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PrefetchConfig::default();
        assert!(config.num_workers >= 1);
        assert!(config.num_workers <= DEFAULT_PREFETCH_WORKERS);
        assert_eq!(config.queue_depth, config.num_workers * 8);
    }

    #[test]
    fn test_config_with_workers() {
        let config = PrefetchConfig::with_workers(2);
        assert_eq!(config.num_workers, 2);
        assert_eq!(config.queue_depth, 16);

        // Minimum of 1 worker
        let config = PrefetchConfig::with_workers(0);
        assert_eq!(config.num_workers, 1);
    }
}
