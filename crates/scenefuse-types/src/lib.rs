//! `scenefuse-types` – shared data model for the SceneFuse engine.
//!
//! Every other crate in the workspace speaks in these types: the
//! [`Object3D`] entity tracked by the store, the raw [`Detection`] records
//! produced by an upstream detector, the reconstructed [`PointCloud`], the
//! parsed [`QueryComponents`] of a grounding query, and the global
//! [`FuseError`].
//!
//! Geometry is stored in `f32`.  Boxes and points serialise as flat JSON
//! arrays (`[x1, y1, x2, y2]`, `[cx, cy, cz, w, h, d]`, `[x, y, z]`) so the
//! persisted store document stays readable by other tooling.

use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

// ────────────────────────────────────────────────────────────────────────────
// Point3
// ────────────────────────────────────────────────────────────────────────────

/// A point (or displacement) in scene space, in metres.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "[f32; 3]", into = "[f32; 3]")]
pub struct Point3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Point3 {
    /// Create a new point.
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Component-wise difference `self − rhs`.
    pub fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }

    /// Euclidean length of the vector.
    pub fn norm(self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Length of the vector projected onto the horizontal (x, y) plane.
    pub fn norm_xy(self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    /// Euclidean distance between two points.
    pub fn distance(self, other: Self) -> f32 {
        self.sub(other).norm()
    }
}

impl From<[f32; 3]> for Point3 {
    fn from(v: [f32; 3]) -> Self {
        Self::new(v[0], v[1], v[2])
    }
}

impl From<Point3> for [f32; 3] {
    fn from(p: Point3) -> Self {
        [p.x, p.y, p.z]
    }
}

// ────────────────────────────────────────────────────────────────────────────
// BBox2D
// ────────────────────────────────────────────────────────────────────────────

/// A normalised image-space box `(x1, y1, x2, y2)`.
///
/// Well-formed boxes satisfy `x1 ≤ x2`, `y1 ≤ y2` with every coordinate in
/// `[0, 1]`.  Boxes coming from a detector are untrusted, so nothing here
/// enforces that; consumers treat malformed boxes as having zero area.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BBox2D {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox2D {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Box width; negative for a malformed box.
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    /// Box height; negative for a malformed box.
    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    /// Area of the box, or `0.0` when either side is non-positive.
    pub fn area(&self) -> f32 {
        let (w, h) = (self.width(), self.height());
        if w <= 0.0 || h <= 0.0 { 0.0 } else { w * h }
    }

    /// Centre of the box in normalised image coordinates.
    pub fn centre(&self) -> (f32, f32) {
        ((self.x1 + self.x2) * 0.5, (self.y1 + self.y2) * 0.5)
    }
}

impl From<[f32; 4]> for BBox2D {
    fn from(v: [f32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BBox2D> for [f32; 4] {
    fn from(b: BBox2D) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

// ────────────────────────────────────────────────────────────────────────────
// BBox3D
// ────────────────────────────────────────────────────────────────────────────

/// A 3-D box given by its centre and full extents: `(cx, cy, cz, w, h, d)`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "[f32; 6]", into = "[f32; 6]")]
pub struct BBox3D {
    pub centre: Point3,
    pub width: f32,
    pub height: f32,
    pub depth: f32,
}

impl BBox3D {
    pub fn new(centre: Point3, width: f32, height: f32, depth: f32) -> Self {
        Self {
            centre,
            width,
            height,
            depth,
        }
    }

    /// Element-wise arithmetic mean of a non-empty set of boxes.
    ///
    /// Returns `None` for an empty slice.
    pub fn mean(boxes: &[BBox3D]) -> Option<BBox3D> {
        if boxes.is_empty() {
            return None;
        }
        let n = boxes.len() as f32;
        let mut acc = [0.0f32; 6];
        for b in boxes {
            let v: [f32; 6] = (*b).into();
            for (a, x) in acc.iter_mut().zip(v) {
                *a += x;
            }
        }
        Some(BBox3D::from(acc.map(|a| a / n)))
    }
}

impl From<[f32; 6]> for BBox3D {
    fn from(v: [f32; 6]) -> Self {
        Self::new(Point3::new(v[0], v[1], v[2]), v[3], v[4], v[5])
    }
}

impl From<BBox3D> for [f32; 6] {
    fn from(b: BBox3D) -> Self {
        [
            b.centre.x, b.centre.y, b.centre.z, b.width, b.height, b.depth,
        ]
    }
}

/// Element-wise arithmetic mean of a non-empty set of points.
pub fn mean_point(points: &[Point3]) -> Option<Point3> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f32;
    let (sx, sy, sz) = points
        .iter()
        .fold((0.0f32, 0.0f32, 0.0f32), |(x, y, z), p| (x + p.x, y + p.y, z + p.z));
    Some(Point3::new(sx / n, sy / n, sz / n))
}

// ────────────────────────────────────────────────────────────────────────────
// Object3D
// ────────────────────────────────────────────────────────────────────────────

/// One physical-object hypothesis tracked by the entity store.
///
/// `id` is `None` until the store assigns one.  An entity without
/// `center_3d` is spatially unresolved: it is still a valid entity, but it
/// never takes part in distance, region or relation queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object3D {
    #[serde(rename = "object_id", with = "object_id")]
    pub id: Option<u64>,
    #[serde(rename = "class_name")]
    pub class_label: String,
    pub confidence: f32,
    pub bbox_2d: BBox2D,
    #[serde(default)]
    pub bbox_3d: Option<BBox3D>,
    #[serde(default)]
    pub center_3d: Option<Point3>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub frame_ids: BTreeSet<u32>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl Object3D {
    /// Construct an unassigned entity observed in a single frame.
    ///
    /// `confidence` is clamped into `[0, 1]`.
    pub fn new(class_label: impl Into<String>, confidence: f32, bbox_2d: BBox2D, frame_id: u32) -> Self {
        Self {
            id: None,
            class_label: class_label.into(),
            confidence: clamp_confidence(confidence),
            bbox_2d,
            bbox_3d: None,
            center_3d: None,
            frame_ids: BTreeSet::from([frame_id]),
            embedding: None,
            attributes: BTreeMap::new(),
        }
    }

    /// Attach a 3-D box, keeping `center_3d` consistent with its centre.
    pub fn with_box_3d(mut self, bbox: BBox3D) -> Self {
        self.center_3d = Some(bbox.centre);
        self.bbox_3d = Some(bbox);
        self
    }

    /// Attach only a 3-D centre (no extent estimate).
    pub fn with_center(mut self, centre: Point3) -> Self {
        self.center_3d = Some(centre);
        self
    }

    /// True when the entity has a resolved 3-D centre.
    pub fn is_spatially_resolved(&self) -> bool {
        self.center_3d.is_some()
    }

    /// Case-insensitive comparison of the class label.
    pub fn has_class(&self, label: &str) -> bool {
        self.class_label.to_lowercase() == label.to_lowercase()
    }
}

/// Clamp a confidence into `[0, 1]`, mapping NaN to `0`.
pub fn clamp_confidence(c: f32) -> f32 {
    if c.is_nan() { 0.0 } else { c.clamp(0.0, 1.0) }
}

/// `object_id` is written as a signed integer; `-1` marks an unassigned id
/// and any other negative value is rejected on read.
mod object_id {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &Option<u64>, s: S) -> Result<S::Ok, S::Error> {
        match id {
            Some(v) => s.serialize_u64(*v),
            None => s.serialize_i64(-1),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        match Option::<i64>::deserialize(d)? {
            None | Some(-1) => Ok(None),
            Some(v) => u64::try_from(v)
                .map(Some)
                .map_err(|_| D::Error::custom(format!("invalid object_id {v}: expected a non-negative id or -1"))),
        }
    }
}

fn null_as_default<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

// ────────────────────────────────────────────────────────────────────────────
// Collaborator payloads
// ────────────────────────────────────────────────────────────────────────────

/// A raw 2-D detection as returned by the upstream detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(rename = "class_name")]
    pub class_label: String,
    pub confidence: f32,
    #[serde(rename = "bbox_norm")]
    pub bbox_2d: BBox2D,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_id: Option<u32>,
}

impl Detection {
    pub fn new(class_label: impl Into<String>, confidence: f32, bbox_2d: BBox2D) -> Self {
        Self {
            class_label: class_label.into(),
            confidence,
            bbox_2d,
            class_id: None,
        }
    }
}

/// One sampled frame supplied by upstream frame selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keyframe {
    pub frame_id: u32,
    /// Where the frame came from (file path, video timestamp, …), if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Keyframe {
    pub fn new(frame_id: u32) -> Self {
        Self {
            frame_id,
            source: None,
        }
    }
}

/// A reconstructed scene point cloud.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PointCloud {
    pub points: Vec<Point3>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub colors: Option<Vec<[f32; 3]>>,
}

impl PointCloud {
    pub fn new(points: Vec<Point3>) -> Self {
        Self {
            points,
            colors: None,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Mean z coordinate over all points, or `None` for an empty cloud.
    pub fn mean_depth(&self) -> Option<f32> {
        if self.points.is_empty() {
            return None;
        }
        let sum: f64 = self.points.iter().map(|p| p.z as f64).sum();
        Some((sum / self.points.len() as f64) as f32)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Query
// ────────────────────────────────────────────────────────────────────────────

/// A parsed grounding query: what to find, relative to what, and how.
///
/// Produced by a query parser (language model or rule-based).  Every field
/// tolerates being empty, missing or `null`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct QueryComponents {
    /// The object the query asks to locate (e.g. `"lamp"`).
    #[serde(default, deserialize_with = "null_as_default")]
    pub target: String,
    /// The reference object, if any (e.g. `"table"`).
    #[serde(default)]
    pub anchor: Option<String>,
    /// Spatial relation name, if any (`on`, `above`, `below`, `left`, `right`, `near`).
    #[serde(default)]
    pub relation: Option<String>,
    /// Descriptive attributes of the target such as colour.
    #[serde(default, deserialize_with = "null_as_default")]
    pub target_attributes: Vec<String>,
}

impl QueryComponents {
    /// Query with only a target.
    pub fn target(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Self::default()
        }
    }

    /// Query with a target, an anchor and a relation.
    pub fn relative(target: impl Into<String>, relation: impl Into<String>, anchor: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            anchor: Some(anchor.into()),
            relation: Some(relation.into()),
            target_attributes: Vec::new(),
        }
    }

    /// The trimmed target label, or `None` when blank.
    pub fn target_label(&self) -> Option<&str> {
        non_blank(Some(&self.target))
    }

    /// The trimmed anchor label, or `None` when absent or blank.
    pub fn anchor_label(&self) -> Option<&str> {
        non_blank(self.anchor.as_ref())
    }

    /// The trimmed relation name, or `None` when absent or blank.
    pub fn relation_name(&self) -> Option<&str> {
        non_blank(self.relation.as_ref())
    }
}

fn non_blank(s: Option<&String>) -> Option<&str> {
    s.map(|s| s.trim()).filter(|s| !s.is_empty())
}

/// The spatial relations the resolver knows how to evaluate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpatialRelation {
    Near,
    Above,
    Below,
    Left,
    Right,
    On,
}

impl SpatialRelation {
    /// Parse a relation name case-insensitively.  Unknown names yield `None`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "near" => Some(Self::Near),
            "above" => Some(Self::Above),
            "below" => Some(Self::Below),
            "left" => Some(Self::Left),
            "right" => Some(Self::Right),
            "on" => Some(Self::On),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Near => "near",
            Self::Above => "above",
            Self::Below => "below",
            Self::Left => "left",
            Self::Right => "right",
            Self::On => "on",
        }
    }
}

impl fmt::Display for SpatialRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// EntitySink
// ────────────────────────────────────────────────────────────────────────────

/// The single-writer append path into an entity collection.
///
/// Ingestion funnels every creation request through one sink so that id
/// assignment follows keyframe/detection order exactly.
pub trait EntitySink {
    /// Absorb an entity and return the id it was stored under.
    fn absorb(&mut self, object: Object3D) -> u64;
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Where candidate resolution ran dry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundStage {
    /// The query carried no usable target label.
    EmptyTarget,
    /// Exact, substring and synonym matching all came back empty.
    NoCandidates,
    /// Candidates existed but none satisfied the anchor relation.
    RelationFilter,
}

impl fmt::Display for NotFoundStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyTarget => f.write_str("query has no target"),
            Self::NoCandidates => f.write_str("no matching objects"),
            Self::RelationFilter => f.write_str("no candidate satisfies the spatial relation"),
        }
    }
}

/// Global error type for the fusion and lookup engine.
#[derive(Error, Debug)]
pub enum FuseError {
    #[error("Grounding failed for '{target}': {stage}")]
    NotFound { target: String, stage: NotFoundStage },

    #[error("Malformed persisted data: {0}")]
    MalformedPersistedData(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Collaborator {component} failed: {details}")]
    Collaborator { component: String, details: String },
}

impl FuseError {
    pub fn not_found(target: impl Into<String>, stage: NotFoundStage) -> Self {
        Self::NotFound {
            target: target.into(),
            stage,
        }
    }

    /// True for the recoverable "grounding failed" outcome.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lamp() -> Object3D {
        Object3D::new("lamp", 0.8, BBox2D::new(0.1, 0.1, 0.3, 0.4), 3)
            .with_box_3d(BBox3D::new(Point3::new(0.0, 0.0, 0.2), 0.2, 0.4, 0.3))
    }

    #[test]
    fn object_serializes_with_original_field_names() {
        let json = serde_json::to_value(lamp()).unwrap();
        assert_eq!(json["object_id"], -1);
        assert_eq!(json["class_name"], "lamp");
        assert_eq!(json["bbox_2d"].as_array().unwrap().len(), 4);
        assert_eq!(json["bbox_3d"].as_array().unwrap().len(), 6);
        assert_eq!(json["center_3d"].as_array().unwrap().len(), 3);
        assert_eq!(json["frame_ids"], serde_json::json!([3]));
        assert!(json["embedding"].is_null());
    }

    #[test]
    fn minus_one_object_id_reads_back_as_unassigned() {
        let json = r#"{"object_id": -1, "class_name": "cup", "confidence": 0.5,
                       "bbox_2d": [0, 0, 1, 1]}"#;
        let obj: Object3D = serde_json::from_str(json).unwrap();
        assert_eq!(obj.id, None);
        assert!(obj.bbox_3d.is_none());
        assert!(obj.frame_ids.is_empty());
    }

    #[test]
    fn other_negative_object_id_is_rejected() {
        let json = r#"{"object_id": -7, "class_name": "cup", "confidence": 0.5,
                       "bbox_2d": [0, 0, 1, 1]}"#;
        let err = serde_json::from_str::<Object3D>(json).unwrap_err();
        assert!(err.to_string().contains("invalid object_id -7"), "{err}");
    }

    #[test]
    fn null_frame_ids_and_attributes_become_empty() {
        let json = r#"{"object_id": 4, "class_name": "cup", "confidence": 0.5,
                       "bbox_2d": [0, 0, 1, 1], "frame_ids": null, "attributes": null}"#;
        let obj: Object3D = serde_json::from_str(json).unwrap();
        assert_eq!(obj.id, Some(4));
        assert!(obj.frame_ids.is_empty());
        assert!(obj.attributes.is_empty());
    }

    #[test]
    fn missing_required_field_is_an_error() {
        let json = r#"{"object_id": 1, "confidence": 0.5, "bbox_2d": [0, 0, 1, 1]}"#;
        assert!(serde_json::from_str::<Object3D>(json).is_err());
    }

    #[test]
    fn new_clamps_confidence() {
        let bbox = BBox2D::new(0.0, 0.0, 0.5, 0.5);
        assert_eq!(Object3D::new("a", 1.7, bbox, 0).confidence, 1.0);
        assert_eq!(Object3D::new("a", -0.2, bbox, 0).confidence, 0.0);
        assert_eq!(Object3D::new("a", f32::NAN, bbox, 0).confidence, 0.0);
    }

    #[test]
    fn with_box_3d_keeps_center_consistent() {
        let obj = lamp();
        assert_eq!(obj.center_3d, Some(obj.bbox_3d.unwrap().centre));
    }

    #[test]
    fn malformed_box_has_zero_area() {
        assert_eq!(BBox2D::new(0.6, 0.1, 0.2, 0.5).area(), 0.0);
        assert!((BBox2D::new(0.0, 0.0, 0.5, 0.4).area() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn bbox_mean_is_element_wise() {
        let a = BBox3D::from([0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        let b = BBox3D::from([2.0, 4.0, 6.0, 3.0, 1.0, 2.0]);
        let m: [f32; 6] = BBox3D::mean(&[a, b]).unwrap().into();
        assert_eq!(m, [1.0, 2.0, 3.0, 2.0, 1.0, 1.5]);
        assert!(BBox3D::mean(&[]).is_none());
    }

    #[test]
    fn point_cloud_mean_depth() {
        let cloud = PointCloud::new(vec![Point3::new(0.0, 0.0, 1.0), Point3::new(5.0, 5.0, 3.0)]);
        assert!((cloud.mean_depth().unwrap() - 2.0).abs() < 1e-6);
        assert!(PointCloud::default().mean_depth().is_none());
    }

    #[test]
    fn detection_reads_detector_field_names() {
        let json = r#"{"class_name": "chair", "confidence": 0.9, "bbox_norm": [0.1, 0.2, 0.3, 0.4], "class_id": 56}"#;
        let det: Detection = serde_json::from_str(json).unwrap();
        assert_eq!(det.class_label, "chair");
        assert_eq!(det.class_id, Some(56));
        assert_eq!(det.bbox_2d, BBox2D::new(0.1, 0.2, 0.3, 0.4));
    }

    #[test]
    fn query_components_tolerate_nulls_and_blanks() {
        let json = r#"{"target": null, "anchor": "  ", "relation": null}"#;
        let q: QueryComponents = serde_json::from_str(json).unwrap();
        assert!(q.target_label().is_none());
        assert!(q.anchor_label().is_none());
        assert!(q.relation_name().is_none());
        assert!(q.target_attributes.is_empty());
    }

    #[test]
    fn spatial_relation_parse_is_case_insensitive() {
        assert_eq!(SpatialRelation::parse("On"), Some(SpatialRelation::On));
        assert_eq!(SpatialRelation::parse(" LEFT "), Some(SpatialRelation::Left));
        assert_eq!(SpatialRelation::parse("inside"), None);
    }

    #[test]
    fn fuse_error_display() {
        let err = FuseError::not_found("xylophone", NotFoundStage::NoCandidates);
        assert!(err.to_string().contains("xylophone"));
        assert!(err.is_not_found());

        let err = FuseError::MalformedPersistedData("missing next_id".into());
        assert!(err.to_string().contains("next_id"));
        assert!(!err.is_not_found());
    }
}
