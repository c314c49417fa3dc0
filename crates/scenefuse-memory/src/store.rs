//! Entity Store.
//!
//! An ordered, process-local collection of [`Object3D`] entities keyed by a
//! unique, monotonic integer id.  The store owns creation, lookup, spatial
//! queries, duplicate merging and JSON persistence.
//!
//! All spatial queries are linear scans over the entity list and skip
//! entities without a resolved 3-D centre.
//!
//! # Persisted layout
//!
//! ```text
//! {
//!   "objects": [ { "object_id": 0, "class_name": "chair", ... }, ... ],
//!   "next_id": 3
//! }
//! ```
//!
//! # Example
//!
//! ```rust
//! use scenefuse_memory::store::EntityStore;
//! use scenefuse_types::{BBox2D, Object3D, Point3};
//!
//! let mut store = EntityStore::new();
//! let id = store.add(
//!     Object3D::new("chair", 0.9, BBox2D::new(0.1, 0.1, 0.4, 0.6), 0)
//!         .with_center(Point3::new(1.0, 0.0, 2.0)),
//! );
//! assert_eq!(id, 0);
//!
//! let hit = store.nearest(Point3::new(1.0, 0.0, 2.5), None, 2.0).unwrap();
//! assert_eq!(hit.id, Some(0));
//! assert_eq!(store.get_by_class("CHAIR").len(), 1);
//! ```

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use scenefuse_perception::geometry::RelationPredicate;
use scenefuse_types::{EntitySink, FuseError, Object3D, Point3, clamp_confidence};

use crate::dedup::{DedupEngine, MergeSummary};

// ─────────────────────────────────────────────────────────────────────────────
// Persisted document
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct StoreDocumentRef<'a> {
    objects: &'a [Object3D],
    next_id: u64,
}

#[derive(Deserialize)]
struct StoreDocument {
    objects: Vec<Object3D>,
    next_id: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// SummaryRow
// ─────────────────────────────────────────────────────────────────────────────

/// Flat, display-oriented view of one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryRow {
    pub id: Option<u64>,
    pub class_label: String,
    pub confidence: f32,
    pub center: Option<Point3>,
    pub frame_ids: Vec<u32>,
}

// ─────────────────────────────────────────────────────────────────────────────
// EntityStore
// ─────────────────────────────────────────────────────────────────────────────

/// Largest id the store hands out or accepts: `object_id` is persisted as a
/// signed integer.
pub const MAX_ID: u64 = i64::MAX as u64;

/// Ordered collection of entities with store-assigned ids.
#[derive(Debug, Clone, Default)]
pub struct EntityStore {
    objects: Vec<Object3D>,
    next_id: u64,
    relations: RelationPredicate,
}

impl EntityStore {
    /// Create an empty store using the default relation thresholds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store evaluating relations with `relations`.
    pub fn with_relations(relations: RelationPredicate) -> Self {
        Self {
            relations,
            ..Self::default()
        }
    }

    /// The relation thresholds used by [`by_relation`][Self::by_relation].
    pub fn relations(&self) -> &RelationPredicate {
        &self.relations
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// The id the next unassigned entity will receive.
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// All entities in store order.
    pub fn objects(&self) -> &[Object3D] {
        &self.objects
    }

    pub fn iter(&self) -> impl Iterator<Item = &Object3D> {
        self.objects.iter()
    }

    // ── Creation ─────────────────────────────────────────────────────────────

    /// Append an entity and return its id.
    ///
    /// An unassigned id receives the next sequential id.  An explicit id is
    /// kept only if the store has never issued it (`id >= next_id`) and it
    /// fits the persisted `object_id` field; `next_id` then moves past it.
    /// Any other explicit id, including one retired by a merge, is replaced
    /// by a fresh one, so ids are never reused.  Confidence is clamped into
    /// `[0, 1]`.
    pub fn add(&mut self, mut object: Object3D) -> u64 {
        object.confidence = clamp_confidence(object.confidence);
        let id = match object.id {
            Some(id) if id >= self.next_id && id <= MAX_ID => {
                self.next_id = id + 1;
                id
            }
            Some(stale) => {
                warn!(id = stale, next_id = self.next_id, "explicit id already issued or out of range, assigning a fresh one");
                self.allocate_id()
            }
            None => self.allocate_id(),
        };
        object.id = Some(id);
        debug!(id, class = %object.class_label, confidence = object.confidence, "entity added");
        self.objects.push(object);
        id
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        // Explicit and loaded ids stop at MAX_ID, leaving 2^63 allocations
        // before this could saturate.
        self.next_id = id.checked_add(1).unwrap_or(u64::MAX);
        id
    }

    // ── Lookup ───────────────────────────────────────────────────────────────

    pub fn get(&self, id: u64) -> Option<&Object3D> {
        self.objects.iter().find(|o| o.id == Some(id))
    }

    /// Entities whose class matches `label` case-insensitively.
    pub fn get_by_class(&self, label: &str) -> Vec<&Object3D> {
        let label = label.to_lowercase();
        self.objects
            .iter()
            .filter(|o| o.class_label.to_lowercase() == label)
            .collect()
    }

    /// Entities observed in keyframe `frame_id`.
    pub fn get_in_frame(&self, frame_id: u32) -> Vec<&Object3D> {
        self.objects
            .iter()
            .filter(|o| o.frame_ids.contains(&frame_id))
            .collect()
    }

    // ── Spatial queries ──────────────────────────────────────────────────────

    /// The spatially-resolved entity closest to `point`, if its distance is
    /// strictly below `max_distance`.  Ties go to the earlier entity.
    pub fn nearest(&self, point: Point3, class_filter: Option<&str>, max_distance: f32) -> Option<&Object3D> {
        let mut best: Option<(&Object3D, f32)> = None;
        for o in self.objects.iter().filter(|o| matches_class(o, class_filter)) {
            let Some(centre) = o.center_3d else { continue };
            let d = centre.distance(point);
            if best.is_none_or(|(_, bd)| d < bd) {
                best = Some((o, d));
            }
        }
        best.filter(|&(_, d)| d < max_distance).map(|(o, _)| o)
    }

    /// Spatially-resolved entities within `radius` of `centre`, inclusive.
    pub fn in_region(&self, centre: Point3, radius: f32) -> Vec<&Object3D> {
        self.objects
            .iter()
            .filter(|o| o.center_3d.is_some_and(|c| c.distance(centre) <= radius))
            .collect()
    }

    /// Entities other than `anchor` standing in `relation` to it.
    ///
    /// Empty when the anchor has no 3-D centre or the relation is unknown.
    pub fn by_relation(&self, anchor: &Object3D, relation: &str, class_filter: Option<&str>) -> Vec<&Object3D> {
        let Some(anchor_centre) = anchor.center_3d else {
            return Vec::new();
        };
        self.objects
            .iter()
            .filter(|o| !is_same_entity(o, anchor))
            .filter(|o| matches_class(o, class_filter))
            .filter(|o| {
                o.center_3d
                    .is_some_and(|c| self.relations.holds_named(relation, c, anchor_centre))
            })
            .collect()
    }

    // ── Merging ──────────────────────────────────────────────────────────────

    /// Collapse near-duplicate entities in place.  See [`DedupEngine`].
    pub fn merge_duplicates(&mut self, iou_threshold: f32, distance_threshold: f32) -> MergeSummary {
        self.merge_with(&DedupEngine::new(iou_threshold, distance_threshold))
    }

    /// Collapse near-duplicate entities in place using a configured engine.
    ///
    /// A single [`DedupEngine::merge`] pass only compares against each
    /// cluster's base entity, so a canonical entity can still duplicate a
    /// survivor.  Passes repeat until one merges nothing; the store is then
    /// duplicate-free and a further call is a no-op.  Each pass removes at
    /// least one entity, which bounds the loop by the entity count.
    pub fn merge_with(&mut self, engine: &DedupEngine) -> MergeSummary {
        let mut total = MergeSummary {
            before: self.objects.len(),
            after: self.objects.len(),
            ..MergeSummary::default()
        };
        loop {
            let outcome = engine.merge(std::mem::take(&mut self.objects));
            self.objects = outcome.objects;
            let pass = outcome.summary;
            total.after = pass.after;
            if pass.clusters_merged == 0 {
                break;
            }
            total.passes += pass.passes;
            total.clusters_merged += pass.clusters_merged;
            total.ids_retired.extend(pass.ids_retired);
            debug!(pass = total.passes, after = pass.after, clusters = pass.clusters_merged, "merge pass");
        }
        info!(
            before = total.before,
            after = total.after,
            clusters = total.clusters_merged,
            passes = total.passes,
            "duplicates merged"
        );
        total
    }

    // ── Reporting ────────────────────────────────────────────────────────────

    /// One [`SummaryRow`] per entity, in store order.
    pub fn summary_rows(&self) -> Vec<SummaryRow> {
        self.objects
            .iter()
            .map(|o| SummaryRow {
                id: o.id,
                class_label: o.class_label.clone(),
                confidence: o.confidence,
                center: o.center_3d,
                frame_ids: o.frame_ids.iter().copied().collect(),
            })
            .collect()
    }

    // ── Persistence ──────────────────────────────────────────────────────────

    /// Write the store to `path` as pretty-printed JSON, creating parent
    /// directories as needed.
    pub fn save(&self, path: &Path) -> Result<(), FuseError> {
        let io_err = |source| FuseError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let doc = StoreDocumentRef {
            objects: &self.objects,
            next_id: self.next_id,
        };
        let mut writer = BufWriter::new(File::create(path).map_err(io_err)?);
        serde_json::to_writer_pretty(&mut writer, &doc).map_err(|e| io_err(e.into()))?;
        writer.flush().map_err(io_err)?;
        info!(path = %path.display(), objects = self.objects.len(), "store saved");
        Ok(())
    }

    /// Replace the store's contents with the document at `path`.
    ///
    /// The document is parsed and validated in full first; on any error the
    /// store is left untouched.
    pub fn load(&mut self, path: &Path) -> Result<(), FuseError> {
        let text = fs::read_to_string(path).map_err(|source| FuseError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let doc: StoreDocument =
            serde_json::from_str(&text).map_err(|e| FuseError::MalformedPersistedData(e.to_string()))?;
        validate(&doc)?;

        self.objects = doc.objects;
        self.next_id = doc.next_id;
        info!(path = %path.display(), objects = self.objects.len(), next_id = self.next_id, "store loaded");
        Ok(())
    }

    /// Load a fresh store from `path`.
    pub fn open(path: &Path) -> Result<Self, FuseError> {
        let mut store = Self::new();
        store.load(path)?;
        Ok(store)
    }
}

impl EntitySink for EntityStore {
    fn absorb(&mut self, object: Object3D) -> u64 {
        self.add(object)
    }
}

fn matches_class(o: &Object3D, class_filter: Option<&str>) -> bool {
    class_filter.is_none_or(|c| o.has_class(c))
}

fn is_same_entity(o: &Object3D, anchor: &Object3D) -> bool {
    std::ptr::eq(o, anchor) || (o.id.is_some() && o.id == anchor.id)
}

fn validate(doc: &StoreDocument) -> Result<(), FuseError> {
    if doc.next_id > MAX_ID + 1 {
        return Err(FuseError::MalformedPersistedData(format!(
            "next_id {} exceeds the id range",
            doc.next_id
        )));
    }
    let mut seen = HashSet::with_capacity(doc.objects.len());
    for (i, o) in doc.objects.iter().enumerate() {
        let Some(id) = o.id else {
            return Err(FuseError::MalformedPersistedData(format!("object {i} has no id")));
        };
        if !seen.insert(id) {
            return Err(FuseError::MalformedPersistedData(format!("duplicate object_id {id}")));
        }
        if id >= doc.next_id {
            return Err(FuseError::MalformedPersistedData(format!(
                "object_id {id} is not below next_id {}",
                doc.next_id
            )));
        }
        if !(0.0..=1.0).contains(&o.confidence) {
            return Err(FuseError::MalformedPersistedData(format!(
                "object_id {id} has confidence {} outside [0, 1]",
                o.confidence
            )));
        }
    }
    Ok(())
}
