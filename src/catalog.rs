//! Cluster catalog and cost estimation.
//!
//! The catalog enumerates the spatial clusters overlapping a query envelope
//! (delegating to the remote service) and the estimator turns their declared
//! statistics into an expected matching-row count. Estimates size sampling
//! ratios and drive strategy selection; they are never a correctness input,
//! and they are not assumed to sum to the dataset's true record count.

use crate::envelope::Envelope;
use crate::error::Result;
use crate::remote::RemoteDatasetService;
use serde::{Deserialize, Serialize};

/// Per-cluster metadata declared by the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterInfo {
    /// Quad-key naming this cluster.
    pub quad_key: String,
    /// Minimal envelope of the cluster's actual rows.
    pub data_bounds: Envelope,
    /// Nominal envelope of the cluster's quad-cell.
    pub tile_bounds: Envelope,
    /// Declared row count (an estimate).
    pub row_count: u64,
}

/// One cluster with its estimated contribution to a query.
#[derive(Debug, Clone)]
pub struct ClusterEstimate {
    pub info: ClusterInfo,
    pub estimate: u64,
}

/// Result of cost estimation over the overlapping clusters.
#[derive(Debug, Clone, Default)]
pub struct CostEstimate {
    /// Clusters with a non-zero estimated contribution.
    pub clusters: Vec<ClusterEstimate>,
    /// Sum of the per-cluster estimates.
    pub total: u64,
}

/// All clusters whose **tile bounds** intersect the query envelope.
///
/// Enumeration is delegated to the remote service; the result is
/// re-filtered defensively so a loose server response cannot widen a query.
pub async fn overlapping(
    remote: &dyn RemoteDatasetService,
    dataset_id: &str,
    envelope: &Envelope,
) -> Result<Vec<ClusterInfo>> {
    let clusters = remote.cluster_info(dataset_id, envelope).await?;
    Ok(clusters
        .into_iter()
        .filter(|c| c.tile_bounds.intersects(envelope))
        .collect())
}

/// Estimate the matching-row count for a query envelope over a set of
/// overlapping clusters.
///
/// Per cluster: `effective = data_bounds ∩ tile_bounds`, `overlap =
/// envelope ∩ effective`, contribution = `round(row_count × area(overlap) /
/// area(effective))`. Clusters with a zero contribution are dropped.
///
/// This assumes uniform spatial density within a cluster, a deliberate
/// approximation. Clusters whose effective bounds are degenerate (a point
/// or a line, zero area) contribute their full declared count whenever the
/// envelope touches them at all: the area ratio is undefined there, and
/// dropping such clusters would starve them.
pub fn estimate(envelope: &Envelope, clusters: Vec<ClusterInfo>) -> CostEstimate {
    let mut relevant = Vec::new();
    let mut total: u64 = 0;

    for info in clusters {
        let Some(effective) = info.data_bounds.intersection(&info.tile_bounds) else {
            continue;
        };
        let Some(overlap) = envelope.intersection(&effective) else {
            continue;
        };

        let estimate = if effective.area() == 0.0 {
            info.row_count
        } else {
            ((info.row_count as f64) * (overlap.area() / effective.area())).round() as u64
        };
        if estimate == 0 {
            continue;
        }

        total += estimate;
        relevant.push(ClusterEstimate { info, estimate });
    }

    CostEstimate {
        clusters: relevant,
        total,
    }
}
