//! Geometry primitives shared by deduplication and candidate resolution.
//!
//! - [`iou_2d`] – intersection-over-union of two normalised image boxes.
//! - [`RelationPredicate`] – the spatial relation tests ("on", "above",
//!   "left", …) evaluated on the displacement between two 3-D centres.
//!
//! Boxes come from untrusted detectors, so every function here is total:
//! malformed input yields `0.0` or `false`, never a panic.
//!
//! # Example
//!
//! ```rust
//! use scenefuse_perception::geometry::{iou_2d, RelationPredicate};
//! use scenefuse_types::{BBox2D, Point3, SpatialRelation};
//!
//! let a = BBox2D::new(0.0, 0.0, 0.5, 0.5);
//! assert!((iou_2d(&a, &a) - 1.0).abs() < 1e-6);
//!
//! let table = Point3::new(0.0, 0.0, 0.0);
//! let lamp = Point3::new(0.0, 0.0, 0.2);
//! let rel = RelationPredicate::default();
//! assert!(rel.holds(SpatialRelation::On, lamp, table));
//! assert!(rel.holds(SpatialRelation::Above, lamp, table));
//! assert!(!rel.holds(SpatialRelation::Below, lamp, table));
//! ```

use scenefuse_types::{BBox2D, Point3, SpatialRelation};

// ────────────────────────────────────────────────────────────────────────────
// IoU
// ────────────────────────────────────────────────────────────────────────────

/// Intersection-over-union of two axis-aligned boxes, in `[0, 1]`.
///
/// Returns `0.0` when the boxes are disjoint, when either box has
/// non-positive area, or when any coordinate is non-finite.
pub fn iou_2d(a: &BBox2D, b: &BBox2D) -> f32 {
    let area_a = a.area();
    let area_b = b.area();
    if area_a <= 0.0 || area_b <= 0.0 || !area_a.is_finite() || !area_b.is_finite() {
        return 0.0;
    }

    let ix1 = a.x1.max(b.x1);
    let iy1 = a.y1.max(b.y1);
    let ix2 = a.x2.min(b.x2);
    let iy2 = a.y2.min(b.y2);
    if ix2 <= ix1 || iy2 <= iy1 {
        return 0.0;
    }

    let inter = (ix2 - ix1) * (iy2 - iy1);
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        return 0.0;
    }
    (inter / union).clamp(0.0, 1.0)
}

// ────────────────────────────────────────────────────────────────────────────
// Relation predicates
// ────────────────────────────────────────────────────────────────────────────

/// Thresholds for the spatial relation tests, in metres.
///
/// `above`/`below` and `left`/`right` leave a dead-zone of
/// `[−threshold, threshold]` in which neither of the pair holds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RelationPredicate {
    /// `near` holds when the full distance is below this.
    pub near: f32,
    /// Minimum |Δz| for `above` / `below`.
    pub vertical: f32,
    /// Minimum |Δx| for `left` / `right`.
    pub horizontal: f32,
    /// Exclusive Δz band for `on`.
    pub on_band: (f32, f32),
    /// Maximum horizontal offset for `on`.
    pub on_footprint: f32,
}

impl Default for RelationPredicate {
    fn default() -> Self {
        Self {
            near: 1.5,
            vertical: 0.2,
            horizontal: 0.3,
            on_band: (0.05, 0.5),
            on_footprint: 0.5,
        }
    }
}

impl RelationPredicate {
    /// True when `candidate` stands in `relation` to `anchor`.
    pub fn holds(&self, relation: SpatialRelation, candidate: Point3, anchor: Point3) -> bool {
        let diff = candidate.sub(anchor);
        match relation {
            SpatialRelation::Near => diff.norm() < self.near,
            SpatialRelation::Above => diff.z > self.vertical,
            SpatialRelation::Below => diff.z < -self.vertical,
            SpatialRelation::Left => diff.x < -self.horizontal,
            SpatialRelation::Right => diff.x > self.horizontal,
            SpatialRelation::On => {
                diff.z > self.on_band.0 && diff.z < self.on_band.1 && diff.norm_xy() < self.on_footprint
            }
        }
    }

    /// Like [`holds`][Self::holds] but takes the relation by name.
    ///
    /// Unknown relation names never hold.
    pub fn holds_named(&self, relation: &str, candidate: Point3, anchor: Point3) -> bool {
        SpatialRelation::parse(relation)
            .map(|r| self.holds(r, candidate, anchor))
            .unwrap_or(false)
    }
}
