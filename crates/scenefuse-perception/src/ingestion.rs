//! Ingestion Adapter.
//!
//! Turns per-keyframe 2-D detections plus the reconstructed scene point cloud
//! into [`Object3D`] creation requests, one per detection, and funnels them
//! through a single [`EntitySink`].
//!
//! The 3-D estimate is deliberately approximate.  It is **not** camera
//! back-projection: the normalised box centre is spread over a fixed metric
//! scene range and the depth is the cloud's mean z.
//!
//! ```text
//! x = (cx − 0.5) · 2R      w = (x2 − x1) · R · 0.5
//! y = (cy − 0.5) · 2R      h = (y2 − y1) · R · 0.5
//! z = mean depth           d = (w + h) / 2
//! ```
//!
//! # Example
//!
//! ```rust
//! use scenefuse_perception::ingestion::ExtentEstimator;
//! use scenefuse_types::BBox2D;
//!
//! let est = ExtentEstimator::default();
//! let b = est.estimate(&BBox2D::new(0.4, 0.4, 0.6, 0.6), Some(2.0));
//! assert!(b.centre.x.abs() < 1e-5);
//! assert!((b.centre.z - 2.0).abs() < 1e-5);
//! assert!((b.width - 0.5).abs() < 1e-5);
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use scenefuse_types::{
    BBox2D, BBox3D, Detection, EntitySink, FuseError, Keyframe, Object3D, Point3, PointCloud,
};

// ────────────────────────────────────────────────────────────────────────────
// Collaborator seams
// ────────────────────────────────────────────────────────────────────────────

/// Upstream 2-D object detector.  Stateless per call.
pub trait Detector {
    /// Detections for one keyframe, boxes normalised to `[0, 1]`.
    fn detect(&self, keyframe: &Keyframe) -> Result<Vec<Detection>, FuseError>;
}

/// Upstream scene reconstruction.
pub trait ReconstructionProvider {
    /// Reconstruct a point cloud from the selected keyframes.
    fn reconstruct(&self, keyframes: &[Keyframe]) -> Result<PointCloud, FuseError>;
}

// ────────────────────────────────────────────────────────────────────────────
// ExtentEstimator
// ────────────────────────────────────────────────────────────────────────────

/// Fixed-scale heuristic mapping a normalised 2-D box to a 3-D box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtentEstimator {
    /// Half-width of the assumed metric scene, in metres.
    pub scene_range: f32,
    /// 3-D box used when the point cloud is empty.
    pub fallback: BBox3D,
}

impl Default for ExtentEstimator {
    fn default() -> Self {
        Self {
            scene_range: 5.0,
            fallback: BBox3D::new(Point3::new(0.0, 0.0, 1.0), 0.3, 0.3, 0.3),
        }
    }
}

impl ExtentEstimator {
    pub fn new(scene_range: f32) -> Self {
        Self {
            scene_range,
            ..Self::default()
        }
    }

    /// Estimate a 3-D box for `bbox`.  `mean_depth` is `None` when the cloud
    /// is empty, in which case the fallback box is returned.
    pub fn estimate(&self, bbox: &BBox2D, mean_depth: Option<f32>) -> BBox3D {
        let Some(depth) = mean_depth else {
            return self.fallback;
        };
        let r = self.scene_range;
        let (cx, cy) = bbox.centre();
        let w = bbox.width() * r * 0.5;
        let h = bbox.height() * r * 0.5;
        BBox3D::new(
            Point3::new((cx - 0.5) * 2.0 * r, (cy - 0.5) * 2.0 * r, depth),
            w,
            h,
            (w + h) * 0.5,
        )
    }
}

// ────────────────────────────────────────────────────────────────────────────
// IngestionAdapter
// ────────────────────────────────────────────────────────────────────────────

/// Feeds detections into an [`EntitySink`] in keyframe/detection order.
#[derive(Debug, Clone, Default)]
pub struct IngestionAdapter {
    estimator: ExtentEstimator,
}

impl IngestionAdapter {
    pub fn new(estimator: ExtentEstimator) -> Self {
        Self { estimator }
    }

    pub fn estimator(&self) -> &ExtentEstimator {
        &self.estimator
    }

    /// Ingest every detection of every keyframe.  Returns the number of
    /// entities created.
    ///
    /// A detector failure aborts the whole call; entities already absorbed
    /// stay in the sink.
    pub fn ingest(
        &self,
        keyframes: &[Keyframe],
        detector: &dyn Detector,
        cloud: &PointCloud,
        sink: &mut dyn EntitySink,
    ) -> Result<usize, FuseError> {
        let mean_depth = cloud.mean_depth();
        if mean_depth.is_none() {
            warn!(
                frames = keyframes.len(),
                "point cloud is empty, using fallback 3D estimate for every detection"
            );
        }

        let mut created = 0usize;
        for keyframe in keyframes {
            let detections = detector.detect(keyframe)?;
            debug!(frame = keyframe.frame_id, detections = detections.len(), "detected");
            for det in detections {
                let bbox_3d = self.estimator.estimate(&det.bbox_2d, mean_depth);
                let mut object =
                    Object3D::new(det.class_label.clone(), det.confidence, det.bbox_2d, keyframe.frame_id)
                        .with_box_3d(bbox_3d);
                if let Ok(raw) = serde_json::to_value(&det) {
                    object.attributes.insert("detection".to_string(), raw);
                }
                sink.absorb(object);
                created += 1;
            }
        }

        info!(frames = keyframes.len(), created, "ingestion complete");
        Ok(created)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SceneFile
// ────────────────────────────────────────────────────────────────────────────

/// One keyframe of a scene dump together with its recorded detections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneKeyframe {
    pub frame_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default)]
    pub detections: Vec<Detection>,
}

/// A recorded scene: detector output per keyframe plus the reconstructed
/// point cloud.  Stands in for both collaborators.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneFile {
    #[serde(default)]
    pub keyframes: Vec<SceneKeyframe>,
    #[serde(default)]
    pub pointcloud: PointCloud,
}

impl SceneFile {
    /// Read a scene dump from a JSON file.
    pub fn load(path: &Path) -> Result<Self, FuseError> {
        let text = std::fs::read_to_string(path).map_err(|source| FuseError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Parse a scene dump.  Each `frame_id` may appear once.
    pub fn from_json(text: &str) -> Result<Self, FuseError> {
        let scene: Self = serde_json::from_str(text).map_err(|e| FuseError::Collaborator {
            component: "scene file".to_string(),
            details: e.to_string(),
        })?;
        let mut seen = HashSet::with_capacity(scene.keyframes.len());
        if let Some(dup) = scene.keyframes.iter().find(|k| !seen.insert(k.frame_id)) {
            return Err(FuseError::Collaborator {
                component: "scene file".to_string(),
                details: format!("duplicate frame_id {}", dup.frame_id),
            });
        }
        Ok(scene)
    }

    /// The keyframes in recorded order.
    pub fn keyframes(&self) -> Vec<Keyframe> {
        self.keyframes
            .iter()
            .map(|k| Keyframe {
                frame_id: k.frame_id,
                source: k.source.clone(),
            })
            .collect()
    }
}

impl Detector for SceneFile {
    fn detect(&self, keyframe: &Keyframe) -> Result<Vec<Detection>, FuseError> {
        self.keyframes
            .iter()
            .find(|k| k.frame_id == keyframe.frame_id)
            .map(|k| k.detections.clone())
            .ok_or_else(|| FuseError::Collaborator {
                component: "scene file".to_string(),
                details: format!("no recorded detections for frame {}", keyframe.frame_id),
            })
    }
}

impl ReconstructionProvider for SceneFile {
    fn reconstruct(&self, _keyframes: &[Keyframe]) -> Result<PointCloud, FuseError> {
        Ok(self.pointcloud.clone())
    }
}
