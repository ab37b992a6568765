//! Row and schema types.
//!
//! A [`Row`] is a tuple of [`FieldValue`]s over a dataset's [`Schema`]. The
//! schema names each column and marks at most one column as the geometry
//! column; spatial filtering and statistics aggregation read that column.
//!
//! Rows are serde-serializable. The core treats partition payloads as opaque
//! bytes, but the in-memory test service uses JSON-encoded rows as its
//! partition encoding, which is why these types derive `Serialize` /
//! `Deserialize`.

use crate::envelope::Envelope;
use geo_types::Geometry;
use serde::{Deserialize, Serialize};

/// Column value kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Bool,
    Int,
    Float,
    Text,
    Geometry,
}

/// A single column definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub kind: FieldKind,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// A dataset's row schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub columns: Vec<ColumnDef>,
}

impl Schema {
    pub fn new(columns: Vec<ColumnDef>) -> Self {
        Self { columns }
    }

    /// Index of the first geometry-typed column, if any.
    pub fn geometry_column(&self) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.kind == FieldKind::Geometry)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// A single field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Geometry(Geometry<f64>),
}

impl FieldValue {
    /// The contained geometry, if this value is one.
    pub fn as_geometry(&self) -> Option<&Geometry<f64>> {
        match self {
            FieldValue::Geometry(g) => Some(g),
            _ => None,
        }
    }
}

/// A row: one value per schema column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row(pub Vec<FieldValue>);

impl Row {
    pub fn new(values: Vec<FieldValue>) -> Self {
        Self(values)
    }

    /// The row's geometry, read from the given column index.
    ///
    /// Returns `None` when the column is absent, out of range, or null.
    pub fn geometry(&self, geometry_column: Option<usize>) -> Option<&Geometry<f64>> {
        let idx = geometry_column?;
        self.0.get(idx)?.as_geometry()
    }

    /// Bounding envelope of the row's geometry, if any.
    pub fn bounds(&self, geometry_column: Option<usize>) -> Option<Envelope> {
        Envelope::from_geometry(self.geometry(geometry_column)?)
    }
}
