//! Partition identity and decoded partition data.
//!
//! A spatially clustered dataset is partitioned by quad-key: each key names a
//! node of a quad-tree over the dataset's extent, and sibling keys partition
//! their parent cell disjointly. Records that fall outside every leaf go to
//! the reserved `"outliers"` key.
//!
//! [`PartitionKey`] is the cache key for the tiered partition cache: value
//! equality and hashing over `(dataset_id, quad_key)`.

use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::record::Row;
use std::sync::Arc;

/// Reserved quad-key for records outside every leaf cell.
pub const OUTLIERS_QUAD_KEY: &str = "outliers";

/// Cache key for one spatial partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    /// Owning dataset identifier.
    pub dataset_id: String,
    /// Quad-tree path (`[0-3]*`) or [`OUTLIERS_QUAD_KEY`].
    pub quad_key: String,
}

impl PartitionKey {
    pub fn new(dataset_id: impl Into<String>, quad_key: impl Into<String>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            quad_key: quad_key.into(),
        }
    }
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.dataset_id, self.quad_key)
    }
}

/// Validate a quad-key: digits `0`-`3` at arbitrary depth, or the reserved
/// outliers key. The empty string (the root) is not addressable as a
/// partition.
pub fn is_valid_quad_key(key: &str) -> bool {
    if key == OUTLIERS_QUAD_KEY {
        return true;
    }
    !key.is_empty() && key.bytes().all(|b| (b'0'..=b'3').contains(&b))
}

/// Nominal envelope of a quad-cell, derived by subdividing the dataset's
/// root extent one digit at a time.
///
/// Digit layout per level: `0` = SW, `1` = SE, `2` = NW, `3` = NE.
/// The outliers key has no tile bounds.
pub fn tile_bounds(root: &Envelope, quad_key: &str) -> Result<Envelope> {
    if quad_key == OUTLIERS_QUAD_KEY {
        return Err(Error::invalid_query("outliers partition has no tile bounds"));
    }
    if !is_valid_quad_key(quad_key) {
        return Err(Error::invalid_query(format!(
            "invalid quad-key '{quad_key}'"
        )));
    }
    let mut cell = *root;
    for digit in quad_key.bytes() {
        let mid_x = (cell.min_x + cell.max_x) / 2.0;
        let mid_y = (cell.min_y + cell.max_y) / 2.0;
        cell = match digit {
            b'0' => Envelope::new(cell.min_x, cell.min_y, mid_x, mid_y),
            b'1' => Envelope::new(mid_x, cell.min_y, cell.max_x, mid_y),
            b'2' => Envelope::new(cell.min_x, mid_y, mid_x, cell.max_y),
            _ => Envelope::new(mid_x, mid_y, cell.max_x, cell.max_y),
        };
    }
    Ok(cell)
}

/// Decoded rows for one partition key plus the encoded byte length.
///
/// Owned by the cache; never mutated after creation. `byte_len` (the size of
/// the opaque encoded payload) is the memory-tier cache weight.
#[derive(Debug, Clone)]
pub struct Partition {
    pub key: PartitionKey,
    pub rows: Arc<[Row]>,
    pub byte_len: usize,
}

impl Partition {
    pub fn new(key: PartitionKey, rows: Vec<Row>, byte_len: usize) -> Self {
        Self {
            key,
            rows: rows.into(),
            byte_len,
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}
