//! Deduplication Engine.
//!
//! Independent per-frame detections of the same physical object arrive as
//! separate entities.  [`DedupEngine::merge`] clusters them and reduces each
//! cluster to one canonical entity.
//!
//! ## Clustering
//!
//! A single left-to-right pass with a boolean-per-index `used` arena:
//!
//! 1. Each not-yet-used entity `A` starts a cluster.
//! 2. Every later not-yet-used `B` with `is_duplicate(A, B)` joins it.
//!
//! `is_duplicate` requires an exact (case-sensitive) class match and then
//! `iou > iou_threshold || distance < distance_threshold`; the distance term
//! only applies when both entities have a 3-D centre.
//!
//! ## Canonicalisation
//!
//! * id, `bbox_2d`, embedding and attributes come from the highest-confidence
//!   member (first one wins on ties).
//! * `frame_ids` is the union over members.
//! * `bbox_3d` / `center_3d` are the element-wise mean when *every* member
//!   has one, otherwise the base member's value is kept.
//! * `confidence` is the mean over members.
//!
//! The pass is O(n²); a spatial index would replace the inner scan at scale.
//!
//! Membership is only tested against the cluster's first entity, so overlap
//! chains (A~B, B~C, A≁C) can leave a canonical entity that still duplicates
//! a survivor.  `EntityStore::merge_with` repeats passes until none merges.
//!
//! # Example
//!
//! ```rust
//! use scenefuse_memory::dedup::DedupEngine;
//! use scenefuse_types::{BBox2D, Object3D};
//!
//! let mut a = Object3D::new("chair", 0.9, BBox2D::new(0.0, 0.0, 0.4, 0.4), 0);
//! let mut b = Object3D::new("chair", 0.5, BBox2D::new(0.0, 0.0, 0.4, 0.4), 3);
//! a.id = Some(0);
//! b.id = Some(1);
//!
//! let out = DedupEngine::default().merge(vec![a, b]);
//! assert_eq!(out.objects.len(), 1);
//! assert_eq!(out.objects[0].id, Some(0));
//! assert_eq!(out.summary.ids_retired, vec![1]);
//! ```

use scenefuse_perception::geometry::iou_2d;
use scenefuse_types::{BBox3D, Object3D, Point3, mean_point};

// ─────────────────────────────────────────────────────────────────────────────
// MergeOutcome
// ─────────────────────────────────────────────────────────────────────────────

/// Counts describing a merge, either one pass or a run of passes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeSummary {
    /// Entity count before the merge.
    pub before: usize,
    /// Entity count after the merge.
    pub after: usize,
    /// Number of clusters with two or more members, summed over passes.
    pub clusters_merged: usize,
    /// Passes that merged at least one cluster.
    pub passes: usize,
    /// Ids absorbed into another entity, in the order they were retired.
    pub ids_retired: Vec<u64>,
}

/// Canonical entities produced by a merge pass plus its summary.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub objects: Vec<Object3D>,
    pub summary: MergeSummary,
}

// ─────────────────────────────────────────────────────────────────────────────
// DedupEngine
// ─────────────────────────────────────────────────────────────────────────────

/// Clusters near-duplicate entities and reduces each cluster to one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DedupEngine {
    /// 2-D IoU strictly above this marks a duplicate.
    pub iou_threshold: f32,
    /// 3-D centre distance strictly below this marks a duplicate (metres).
    pub distance_threshold: f32,
}

impl Default for DedupEngine {
    fn default() -> Self {
        Self::new(0.5, 0.3)
    }
}

impl DedupEngine {
    /// Create an engine.  `iou_threshold` is clamped to `[0, 1]` and
    /// `distance_threshold` to `≥ 0`.
    pub fn new(iou_threshold: f32, distance_threshold: f32) -> Self {
        Self {
            iou_threshold: iou_threshold.clamp(0.0, 1.0),
            distance_threshold: distance_threshold.max(0.0),
        }
    }

    /// True when `a` and `b` are observations of the same physical object.
    pub fn is_duplicate(&self, a: &Object3D, b: &Object3D) -> bool {
        if a.class_label != b.class_label {
            return false;
        }
        let iou = iou_2d(&a.bbox_2d, &b.bbox_2d);
        match (a.center_3d, b.center_3d) {
            (Some(ca), Some(cb)) => iou > self.iou_threshold || ca.distance(cb) < self.distance_threshold,
            _ => iou > self.iou_threshold,
        }
    }

    /// Cluster `objects` in order and return one canonical entity per
    /// cluster, in the order each cluster's first member appeared.
    pub fn merge(&self, objects: Vec<Object3D>) -> MergeOutcome {
        let before = objects.len();
        let mut used = vec![false; before];
        let mut clusters: Vec<Vec<usize>> = Vec::new();

        for i in 0..before {
            if used[i] {
                continue;
            }
            used[i] = true;
            let mut cluster = vec![i];
            for j in (i + 1)..before {
                if !used[j] && self.is_duplicate(&objects[i], &objects[j]) {
                    used[j] = true;
                    cluster.push(j);
                }
            }
            clusters.push(cluster);
        }

        let mut summary = MergeSummary {
            before,
            ..MergeSummary::default()
        };
        let mut slots: Vec<Option<Object3D>> = objects.into_iter().map(Some).collect();
        let mut merged = Vec::with_capacity(clusters.len());

        for cluster in clusters {
            let members: Vec<Object3D> = cluster.iter().filter_map(|&i| slots[i].take()).collect();
            if members.len() > 1 {
                summary.clusters_merged += 1;
            }
            if let Some((canonical, retired)) = canonicalise(members) {
                summary.ids_retired.extend(retired);
                merged.push(canonical);
            }
        }

        summary.after = merged.len();
        summary.passes = usize::from(summary.clusters_merged > 0);
        MergeOutcome {
            objects: merged,
            summary,
        }
    }
}

/// Reduce a cluster to its canonical entity.  Returns the ids of the
/// non-base members alongside it.  `None` only for an empty cluster.
fn canonicalise(mut members: Vec<Object3D>) -> Option<(Object3D, Vec<u64>)> {
    if members.len() <= 1 {
        return members.pop().map(|m| (m, Vec::new()));
    }

    let mut base_idx = 0;
    for (i, m) in members.iter().enumerate().skip(1) {
        if m.confidence > members[base_idx].confidence {
            base_idx = i;
        }
    }

    let n = members.len() as f32;
    let confidence = members.iter().map(|m| m.confidence).sum::<f32>() / n;

    let boxes: Option<Vec<BBox3D>> = members.iter().map(|m| m.bbox_3d).collect();
    let centres: Option<Vec<Point3>> = members.iter().map(|m| m.center_3d).collect();

    let retired: Vec<u64> = members
        .iter()
        .enumerate()
        .filter(|&(i, _)| i != base_idx)
        .filter_map(|(_, m)| m.id)
        .collect();

    let mut frames = std::collections::BTreeSet::new();
    for m in &members {
        frames.extend(m.frame_ids.iter().copied());
    }

    let mut canonical = members.swap_remove(base_idx);
    canonical.frame_ids = frames;
    canonical.confidence = confidence.clamp(0.0, 1.0);
    if let Some(mean) = boxes.as_deref().and_then(BBox3D::mean) {
        canonical.bbox_3d = Some(mean);
    }
    if let Some(mean) = centres.as_deref().and_then(mean_point) {
        canonical.center_3d = Some(mean);
    }
    Some((canonical, retired))
}
