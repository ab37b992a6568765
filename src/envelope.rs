//! Axis-aligned envelope math.
//!
//! An [`Envelope`] is the 2D bounding box used everywhere in this crate:
//! query windows, dataset bounds, cluster tile bounds, and cluster data
//! bounds. Interop with the `geo` ecosystem is provided for computing
//! envelopes of arbitrary geometries and for precise geometry-vs-envelope
//! intersection tests.
//!
//! Envelope row counts and areas are only ever used for *estimation*; the
//! precise per-row filter goes through [`Envelope::intersects_geometry`].

use geo::{BoundingRect, Intersects};
use geo_types::{Coord, Geometry, Rect};
use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box in dataset coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Envelope {
    /// Create a new envelope. Callers are expected to pass ordered bounds;
    /// unordered input is normalized.
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x: min_x.min(max_x),
            min_y: min_y.min(max_y),
            max_x: min_x.max(max_x),
            max_y: min_y.max(max_y),
        }
    }

    /// Check if this envelope intersects another (shared boundary counts).
    pub fn intersects(&self, other: &Envelope) -> bool {
        self.min_x <= other.max_x
            && self.max_x >= other.min_x
            && self.min_y <= other.max_y
            && self.max_y >= other.min_y
    }

    /// Check if this envelope fully contains another.
    pub fn contains_envelope(&self, other: &Envelope) -> bool {
        self.min_x <= other.min_x
            && self.max_x >= other.max_x
            && self.min_y <= other.min_y
            && self.max_y >= other.max_y
    }

    /// Check if this envelope contains a point.
    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    /// Intersection of two envelopes, or `None` when disjoint.
    ///
    /// Degenerate (zero-area) results are still `Some`: a point or line
    /// overlap is an overlap.
    pub fn intersection(&self, other: &Envelope) -> Option<Envelope> {
        if !self.intersects(other) {
            return None;
        }
        Some(Envelope {
            min_x: self.min_x.max(other.min_x),
            min_y: self.min_y.max(other.min_y),
            max_x: self.max_x.min(other.max_x),
            max_y: self.max_y.min(other.max_y),
        })
    }

    /// Smallest envelope covering both inputs.
    pub fn union(&self, other: &Envelope) -> Envelope {
        Envelope {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    /// Area of the envelope. Zero for point/line envelopes.
    pub fn area(&self) -> f64 {
        (self.max_x - self.min_x) * (self.max_y - self.min_y)
    }

    /// Compute the bounding envelope of a geometry.
    ///
    /// Returns `None` for empty geometries (e.g. an empty collection).
    pub fn from_geometry(geom: &Geometry<f64>) -> Option<Self> {
        let rect = geom.bounding_rect()?;
        Some(Self {
            min_x: rect.min().x,
            min_y: rect.min().y,
            max_x: rect.max().x,
            max_y: rect.max().y,
        })
    }

    /// Precise geometry-vs-envelope intersection test.
    ///
    /// Delegates to `geo`'s intersection predicates rather than comparing
    /// bounding boxes, so a polygon whose bbox overlaps the envelope but
    /// whose shape does not is correctly rejected.
    pub fn intersects_geometry(&self, geom: &Geometry<f64>) -> bool {
        self.to_rect().intersects(geom)
    }

    /// Convert to a `geo` rectangle.
    pub fn to_rect(&self) -> Rect<f64> {
        Rect::new(
            Coord {
                x: self.min_x,
                y: self.min_y,
            },
            Coord {
                x: self.max_x,
                y: self.max_y,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo_types::{polygon, Point};

    #[test]
    fn test_intersection_and_area() {
        let a = Envelope::new(0.0, 0.0, 10.0, 10.0);
        let b = Envelope::new(5.0, 5.0, 20.0, 20.0);
        let i = a.intersection(&b).unwrap();
        assert_eq!(i, Envelope::new(5.0, 5.0, 10.0, 10.0));
        assert_eq!(i.area(), 25.0);

        let c = Envelope::new(11.0, 11.0, 12.0, 12.0);
        assert!(a.intersection(&c).is_none());
    }

    #[test]
    fn test_degenerate_intersection_is_some() {
        // Shared edge: zero area but still an overlap.
        let a = Envelope::new(0.0, 0.0, 10.0, 10.0);
        let b = Envelope::new(10.0, 0.0, 20.0, 10.0);
        let i = a.intersection(&b).unwrap();
        assert_eq!(i.area(), 0.0);
    }

    #[test]
    fn test_containment() {
        let outer = Envelope::new(-10.0, -10.0, 110.0, 110.0);
        let inner = Envelope::new(0.0, 0.0, 100.0, 100.0);
        assert!(outer.contains_envelope(&inner));
        assert!(!inner.contains_envelope(&outer));
        assert!(inner.contains_point(0.0, 100.0));
        assert!(!inner.contains_point(-0.1, 50.0));
    }

    #[test]
    fn test_union() {
        let a = Envelope::new(0.0, 0.0, 1.0, 1.0);
        let b = Envelope::new(5.0, -2.0, 6.0, 3.0);
        assert_eq!(a.union(&b), Envelope::new(0.0, -2.0, 6.0, 3.0));
    }

    #[test]
    fn test_from_geometry() {
        let p: Geometry<f64> = Point::new(3.0, 4.0).into();
        let env = Envelope::from_geometry(&p).unwrap();
        assert_eq!(env, Envelope::new(3.0, 4.0, 3.0, 4.0));
    }

    #[test]
    fn test_intersects_geometry_precise() {
        // A triangle whose bbox overlaps the envelope but whose shape does not.
        let tri: Geometry<f64> = polygon![
            (x: 0.0, y: 10.0),
            (x: 10.0, y: 10.0),
            (x: 10.0, y: 0.0),
        ]
        .into();
        let env = Envelope::new(0.0, 0.0, 2.0, 2.0);
        assert!(env
            .to_rect()
            .intersects(&tri.bounding_rect().unwrap()));
        assert!(!env.intersects_geometry(&tri));

        let covering = Envelope::new(0.0, 0.0, 10.0, 10.0);
        assert!(covering.intersects_geometry(&tri));
    }
}
