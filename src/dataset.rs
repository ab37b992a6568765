//! Dataset descriptor.

use crate::envelope::Envelope;
use crate::record::Schema;
use serde::{Deserialize, Serialize};

/// Static description of a dataset as declared by the remote service.
///
/// `bounds` and `record_count` may be unknown at creation (unclustered /
/// streamed datasets); the stats registry computes them asynchronously and
/// readers await the result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    /// Dataset identifier.
    pub id: String,
    /// Row schema.
    pub schema: Schema,
    /// Index of the geometry column, if the dataset has one.
    pub geometry_column: Option<usize>,
    /// Declared bounding envelope, when already known.
    pub bounds: Option<Envelope>,
    /// Declared record count, when already known.
    pub record_count: Option<u64>,
    /// Whether the dataset is partitioned into spatial clusters.
    pub spatially_clustered: bool,
    /// Whether a pre-built lossy thumbnail exists.
    pub has_thumbnail: bool,
}

impl DatasetDescriptor {
    /// Create a descriptor with unknown bounds/count and no spatial features.
    pub fn new(id: impl Into<String>, schema: Schema) -> Self {
        let geometry_column = schema.geometry_column();
        Self {
            id: id.into(),
            schema,
            geometry_column,
            bounds: None,
            record_count: None,
            spatially_clustered: false,
            has_thumbnail: false,
        }
    }

    /// Set declared bounds.
    pub fn with_bounds(mut self, bounds: Envelope) -> Self {
        self.bounds = Some(bounds);
        self
    }

    /// Set declared record count.
    pub fn with_record_count(mut self, count: u64) -> Self {
        self.record_count = Some(count);
        self
    }

    /// Mark the dataset as spatially clustered.
    pub fn clustered(mut self) -> Self {
        self.spatially_clustered = true;
        self
    }

    /// Mark the dataset as having a thumbnail.
    pub fn with_thumbnail(mut self) -> Self {
        self.has_thumbnail = true;
        self
    }

    /// True when statistics aggregation is unnecessary: the count is
    /// declared, and bounds are declared or the dataset has no geometry
    /// column to derive them from.
    pub fn stats_known(&self) -> bool {
        self.record_count.is_some() && (self.bounds.is_some() || self.geometry_column.is_none())
    }
}
