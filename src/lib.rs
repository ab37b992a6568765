//! # Geodex Core
//!
//! Adaptive bounding-box range queries over very large, spatially clustered
//! datasets stored on a remote service, with a two-tier partition cache to
//! keep network and disk cost down.
//!
//! This crate provides:
//! - [`RangeQueryRouter`]: the single query entry point, selecting exactly
//!   one of three scan strategies per query (full, thumbnail, index)
//! - [`TieredPartitionCache`]: memory + disk cache of decoded partitions
//!   keyed by `(dataset, quad-key)`, with a single-flight remote loader
//! - [`DatasetStatsRegistry`]: lazily aggregated per-dataset statistics
//!   with idle-TTL eviction cascading into the partition cache
//! - [`PrefetchService`]: bounded background cache warming
//!
//! ## Design Principles
//!
//! 1. **Caches are owned, not global**: the router constructs its caches
//!    once and passes them by reference; lifecycle hooks are explicit.
//! 2. **The cache is an optimization, never a correctness dependency**:
//!    disk failures are swallowed and logged, remote failures propagate.
//! 3. **Estimates size decisions, geometry decides rows**: cluster
//!    statistics drive strategy selection and sampling ratios only; the
//!    per-row filter is a precise geometry intersection test.
//!
//! ## Example
//!
//! ```ignore
//! use geodex_core::{Envelope, RangeQueryRouter, RouterConfig};
//!
//! // Apps provide their own RemoteDatasetService implementation
//! let router = RangeQueryRouter::new(remote, RouterConfig::default());
//! let mut stream = router.route("roads", &Envelope::new(0.0, 0.0, 10.0, 10.0), Some(1000)).await?;
//! while let Some(row) = stream.next().await {
//!     // ...
//! }
//! ```

pub mod cache;
pub mod catalog;
pub mod config;
pub mod dataset;
pub mod envelope;
pub mod error;
pub mod partition;
pub mod prefetch;
pub mod record;
pub mod remote;
pub mod router;
pub mod stats;
pub mod strategy;
pub mod stream;

// Re-export main types
pub use cache::{CacheStats, TieredPartitionCache};
pub use catalog::{estimate, overlapping, ClusterEstimate, ClusterInfo, CostEstimate};
pub use config::{
    RouterConfig, DEFAULT_FULL_SCAN_FRACTION, DEFAULT_MAX_DISK_ONLY_CLUSTERS,
    DEFAULT_MAX_MEMORY_CACHE_BYTES, DEFAULT_MAX_RELEVANT_CLUSTERS, DEFAULT_MAX_UNCACHED_CLUSTERS,
};
pub use dataset::DatasetDescriptor;
pub use envelope::Envelope;
pub use error::{Error, Result};
pub use partition::{is_valid_quad_key, tile_bounds, Partition, PartitionKey, OUTLIERS_QUAD_KEY};
pub use prefetch::{prefetch_stats_reset, PrefetchConfig, PrefetchRequest, PrefetchService};
pub use record::{ColumnDef, FieldKind, FieldValue, Row, Schema};
pub use remote::{
    MemoryCluster, MemoryDataset, MemoryDatasetService, RemoteCallCounts, RemoteDatasetService,
    ScopedDatasetPlan,
};
pub use router::RangeQueryRouter;
pub use stats::{DatasetEvictionHook, DatasetStats, DatasetStatsRegistry, StatsSnapshot};
pub use strategy::{choose_strategy, ScanContext, Strategy};
pub use stream::{CancelToken, RowStream};

/// Prelude module for convenient imports of the query surface.
///
/// # Example
///
/// ```ignore
/// use geodex_core::prelude::*;
///
/// async fn example(router: &RangeQueryRouter) -> Result<Vec<Row>> {
///     router.route("roads", &Envelope::new(0.0, 0.0, 1.0, 1.0), None).await?.collect().await
/// }
/// ```
pub mod prelude {
    pub use crate::envelope::Envelope;
    pub use crate::error::{Error, Result};
    pub use crate::record::{FieldValue, Row, Schema};
    pub use crate::remote::RemoteDatasetService;
    pub use crate::router::RangeQueryRouter;
    pub use crate::stream::RowStream;
}
