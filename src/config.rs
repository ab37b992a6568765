//! Router and cache configuration.
//!
//! The strategy thresholds are tunable policy, not derived invariants: the
//! defaults here reproduce the behavior the system shipped with, and
//! deployments adjust them per workload. They are named constants so tests
//! and operators can reason about them.

use crate::prefetch::PrefetchConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Most relevant clusters an index scan will serve locally.
pub const DEFAULT_MAX_RELEVANT_CLUSTERS: usize = 10;

/// Most disk-only (not yet decoded) clusters an index scan will promote.
pub const DEFAULT_MAX_DISK_ONLY_CLUSTERS: usize = 7;

/// Most uncached clusters an index scan will fetch from the remote service.
pub const DEFAULT_MAX_UNCACHED_CLUSTERS: usize = 4;

/// Fraction of the dataset's rows above which an index scan is not worth
/// its overhead and the query degrades to a thumbnail or full scan.
pub const DEFAULT_FULL_SCAN_FRACTION: f64 = 0.7;

/// Memory-tier capacity, weighted by encoded partition size.
pub const DEFAULT_MAX_MEMORY_CACHE_BYTES: u64 = 256 * 1024 * 1024;

/// Memory-tier expire-after-access window.
pub const DEFAULT_MEMORY_CACHE_IDLE: Duration = Duration::from_secs(10 * 60);

/// Idle lifetime of a dataset's statistics entry. Expiry cascades into the
/// partition cache via `on_dataset_evicted`.
pub const DEFAULT_STATS_IDLE_TTL: Duration = Duration::from_secs(30 * 60);

/// Configuration for the router and its owned caches.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Threshold on the number of clusters an index scan serves locally.
    pub max_relevant_clusters: usize,
    /// Threshold on clusters cached on disk but not in memory.
    pub max_disk_only_clusters: usize,
    /// Threshold on clusters not cached at all.
    pub max_uncached_clusters: usize,
    /// Near-total fraction at which index scans degrade.
    pub full_scan_fraction: f64,
    /// Memory-tier capacity in encoded bytes.
    pub max_memory_cache_bytes: u64,
    /// Memory-tier expire-after-access.
    pub memory_cache_idle: Duration,
    /// Idle TTL for dataset statistics entries.
    pub stats_idle_ttl: Duration,
    /// Root directory of the disk tier.
    pub disk_cache_root: PathBuf,
    /// Background prefetch sizing.
    pub prefetch: PrefetchConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_relevant_clusters: DEFAULT_MAX_RELEVANT_CLUSTERS,
            max_disk_only_clusters: DEFAULT_MAX_DISK_ONLY_CLUSTERS,
            max_uncached_clusters: DEFAULT_MAX_UNCACHED_CLUSTERS,
            full_scan_fraction: DEFAULT_FULL_SCAN_FRACTION,
            max_memory_cache_bytes: DEFAULT_MAX_MEMORY_CACHE_BYTES,
            memory_cache_idle: DEFAULT_MEMORY_CACHE_IDLE,
            stats_idle_ttl: DEFAULT_STATS_IDLE_TTL,
            disk_cache_root: std::env::temp_dir().join("geodex-cache"),
            prefetch: PrefetchConfig::default(),
        }
    }
}

impl RouterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the disk-tier root directory.
    pub fn with_disk_cache_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.disk_cache_root = root.into();
        self
    }

    /// Set the memory-tier capacity in bytes.
    pub fn with_max_memory_cache_bytes(mut self, bytes: u64) -> Self {
        self.max_memory_cache_bytes = bytes;
        self
    }

    /// Set the index-scan cluster thresholds.
    pub fn with_cluster_thresholds(
        mut self,
        max_relevant: usize,
        max_disk_only: usize,
        max_uncached: usize,
    ) -> Self {
        self.max_relevant_clusters = max_relevant;
        self.max_disk_only_clusters = max_disk_only;
        self.max_uncached_clusters = max_uncached;
        self
    }

    /// Set the near-total fraction. Clamped to (0, 1].
    pub fn with_full_scan_fraction(mut self, fraction: f64) -> Self {
        self.full_scan_fraction = fraction.clamp(f64::MIN_POSITIVE, 1.0);
        self
    }

    /// Set the statistics idle TTL.
    pub fn with_stats_idle_ttl(mut self, ttl: Duration) -> Self {
        self.stats_idle_ttl = ttl;
        self
    }

    /// Set the prefetch configuration.
    pub fn with_prefetch(mut self, prefetch: PrefetchConfig) -> Self {
        self.prefetch = prefetch;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_thresholds() {
        let config = RouterConfig::default();
        assert_eq!(config.max_relevant_clusters, 10);
        assert_eq!(config.max_disk_only_clusters, 7);
        assert_eq!(config.max_uncached_clusters, 4);
        assert_eq!(config.full_scan_fraction, 0.7);
    }

    #[test]
    fn test_fraction_clamped() {
        let config = RouterConfig::default().with_full_scan_fraction(7.0);
        assert_eq!(config.full_scan_fraction, 1.0);
    }
}
