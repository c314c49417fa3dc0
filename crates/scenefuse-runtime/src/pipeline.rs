//! Grounding pipeline.
//!
//! Wires the phases of a run together:
//!
//! ```text
//! reconstruct ─► ingest ─► merge duplicates ─► parse query ─► resolve
//!   (cloud)      (store)      (store)          (components)   (entity)
//! ```
//!
//! and packages the answer as a [`GroundingResult`] document.
//!
//! # Example
//!
//! ```rust
//! use scenefuse_perception::ingestion::SceneFile;
//! use scenefuse_runtime::pipeline::{GroundingPipeline, PipelineConfig};
//! use scenefuse_runtime::query::RuleBasedParser;
//!
//! let scene = SceneFile::from_json(r#"{
//!     "keyframes": [{"frame_id": 0, "detections": [
//!         {"class_name": "chair", "confidence": 0.9, "bbox_norm": [0.1, 0.1, 0.3, 0.5]}
//!     ]}],
//!     "pointcloud": {"points": [[0, 0, 2.0]]}
//! }"#).unwrap();
//!
//! let pipeline = GroundingPipeline::new(PipelineConfig::default());
//! let store = pipeline.build_store(&scene.keyframes(), &scene, &scene).unwrap();
//! let result = pipeline.ground("the chair", &RuleBasedParser, &store);
//! assert!(result.success);
//! assert_eq!(result.target_object.as_deref(), Some("chair"));
//! ```

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn};
use uuid::Uuid;

use scenefuse_memory::dedup::DedupEngine;
use scenefuse_memory::store::EntityStore;
use scenefuse_perception::ingestion::{Detector, ExtentEstimator, IngestionAdapter, ReconstructionProvider};
use scenefuse_types::{BBox3D, FuseError, Keyframe, Point3, QueryComponents};

use crate::query::QueryParser;
use crate::resolver::{CandidateResolver, Resolution};
use crate::synonyms::SynonymTable;

// ─────────────────────────────────────────────────────────────────────────────
// PipelineConfig
// ─────────────────────────────────────────────────────────────────────────────

/// Tunables for one pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub iou_threshold: f32,
    pub distance_threshold: f32,
    /// Half-width of the assumed metric scene used by ingestion.
    pub scene_range: f32,
    pub synonyms: SynonymTable,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.5,
            distance_threshold: 0.3,
            scene_range: ExtentEstimator::default().scene_range,
            synonyms: SynonymTable::default(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// GroundingResult
// ─────────────────────────────────────────────────────────────────────────────

/// Run statistics attached to a [`GroundingResult`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroundingMetadata {
    /// Distinct keyframes contributing to the store.
    pub num_frames: usize,
    pub num_objects: usize,
    pub candidate_count: usize,
    /// Wall time spent parsing and resolving, in seconds.
    pub processing_time: f64,
    /// Which query parser produced the components.
    pub parser: String,
    /// Why part of the query was ignored, if it was.
    pub degraded: Option<String>,
}

/// The answer document handed to callers and written as `result.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundingResult {
    pub success: bool,
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub query: String,
    pub query_components: QueryComponents,
    /// Class label of the resolved entity.
    pub target_object: Option<String>,
    pub object_id: Option<u64>,
    pub anchor_object: Option<String>,
    pub anchor_id: Option<u64>,
    pub spatial_relation: Option<String>,
    #[serde(rename = "3d_bbox")]
    pub bbox_3d: Option<BBox3D>,
    pub bbox_format: String,
    pub center_3d: Option<Point3>,
    pub confidence: f32,
    pub metadata: GroundingMetadata,
    pub error: Option<String>,
}

impl GroundingResult {
    fn base(query: &str, components: QueryComponents, metadata: GroundingMetadata) -> Self {
        Self {
            success: false,
            run_id: Uuid::new_v4(),
            created_at: Utc::now(),
            query: query.to_string(),
            anchor_object: components.anchor_label().map(str::to_string),
            spatial_relation: components.relation_name().map(str::to_string),
            query_components: components,
            target_object: None,
            object_id: None,
            anchor_id: None,
            bbox_3d: None,
            bbox_format: "xyzwhd".to_string(),
            center_3d: None,
            confidence: 0.0,
            metadata,
            error: None,
        }
    }

    fn resolved(query: &str, components: QueryComponents, res: Resolution, mut metadata: GroundingMetadata) -> Self {
        metadata.candidate_count = res.candidate_count;
        metadata.degraded = res.degraded.as_ref().map(ToString::to_string);
        let anchor_id = res.anchor_id();
        let entity = res.entity;
        Self {
            success: true,
            target_object: Some(entity.class_label),
            object_id: entity.id,
            anchor_id,
            bbox_3d: entity.bbox_3d,
            center_3d: entity.center_3d,
            confidence: entity.confidence,
            ..Self::base(query, components, metadata)
        }
    }

    fn failed(query: &str, components: QueryComponents, error: &FuseError, metadata: GroundingMetadata) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::base(query, components, metadata)
        }
    }

    /// Write the document as `result.json` inside `dir`, creating it if
    /// needed.  Returns the file path.
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf, FuseError> {
        let path = dir.join("result.json");
        let io_err = |source| FuseError::Io {
            path: path.clone(),
            source,
        };
        fs::create_dir_all(dir).map_err(io_err)?;
        let text = serde_json::to_string_pretty(self).map_err(|e| io_err(e.into()))?;
        fs::write(&path, text).map_err(io_err)?;
        Ok(path)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// GroundingPipeline
// ─────────────────────────────────────────────────────────────────────────────

/// Ingestion → merge → resolution, configured once and reused per query.
#[derive(Debug, Clone)]
pub struct GroundingPipeline {
    ingestion: IngestionAdapter,
    dedup: DedupEngine,
    resolver: CandidateResolver,
}

impl Default for GroundingPipeline {
    fn default() -> Self {
        Self::new(PipelineConfig::default())
    }
}

impl GroundingPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            ingestion: IngestionAdapter::new(ExtentEstimator::new(config.scene_range)),
            dedup: DedupEngine::new(config.iou_threshold, config.distance_threshold),
            resolver: CandidateResolver::new(config.synonyms),
        }
    }

    pub fn dedup(&self) -> &DedupEngine {
        &self.dedup
    }

    pub fn resolver(&self) -> &CandidateResolver {
        &self.resolver
    }

    /// Reconstruct, ingest every keyframe and merge duplicates into a fresh
    /// store.
    pub fn build_store(
        &self,
        keyframes: &[Keyframe],
        detector: &dyn Detector,
        reconstruction: &dyn ReconstructionProvider,
    ) -> Result<EntityStore, FuseError> {
        let mut store = EntityStore::new();
        self.ingest_into(&mut store, keyframes, detector, reconstruction)?;
        Ok(store)
    }

    /// Ingest into an existing store, then merge duplicates across the whole
    /// store.
    pub fn ingest_into(
        &self,
        store: &mut EntityStore,
        keyframes: &[Keyframe],
        detector: &dyn Detector,
        reconstruction: &dyn ReconstructionProvider,
    ) -> Result<(), FuseError> {
        let _span = info_span!("build_store", keyframes = keyframes.len()).entered();

        let cloud = reconstruction.reconstruct(keyframes)?;
        info!(points = cloud.len(), "scene reconstructed");

        let created = self.ingestion.ingest(keyframes, detector, &cloud, store)?;
        let summary = store.merge_with(&self.dedup);
        info!(
            created,
            objects = summary.after,
            retired = summary.ids_retired.len(),
            "store ready"
        );
        Ok(())
    }

    /// Parse `query` and resolve it against `store`.  Never fails: a failed
    /// resolution is reported inside the result.
    pub fn ground(&self, query: &str, parser: &dyn QueryParser, store: &EntityStore) -> GroundingResult {
        let _span = info_span!("ground", query).entered();
        let started = Instant::now();

        let components = parser.parse(query);
        let outcome = self.resolver.resolve(&components, store);

        let metadata = GroundingMetadata {
            num_frames: distinct_frames(store),
            num_objects: store.len(),
            processing_time: round2(started.elapsed().as_secs_f64()),
            parser: parser.name().to_string(),
            ..GroundingMetadata::default()
        };

        match outcome {
            Ok(res) => {
                info!(
                    object_id = ?res.entity.id,
                    class = %res.entity.class_label,
                    candidates = res.candidate_count,
                    "query grounded"
                );
                GroundingResult::resolved(query, components, res, metadata)
            }
            Err(e) => {
                warn!(error = %e, "grounding failed");
                GroundingResult::failed(query, components, &e, metadata)
            }
        }
    }
}

fn distinct_frames(store: &EntityStore) -> usize {
    store
        .iter()
        .flat_map(|o| o.frame_ids.iter().copied())
        .collect::<BTreeSet<u32>>()
        .len()
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::RuleBasedParser;
    use scenefuse_perception::ingestion::SceneFile;
    use scenefuse_types::PointCloud;

    struct EmptyReconstruction;

    impl ReconstructionProvider for EmptyReconstruction {
        fn reconstruct(&self, _keyframes: &[Keyframe]) -> Result<PointCloud, FuseError> {
            Ok(PointCloud::default())
        }
    }

    fn scene() -> SceneFile {
        SceneFile::from_json(
            r#"{
                "keyframes": [
                    {"frame_id": 0, "detections": [
                        {"class_name": "table", "confidence": 0.9, "bbox_norm": [0.3, 0.5, 0.7, 0.9]},
                        {"class_name": "lamp", "confidence": 0.6, "bbox_norm": [0.45, 0.3, 0.55, 0.5]}
                    ]},
                    {"frame_id": 1, "detections": [
                        {"class_name": "table", "confidence": 0.7, "bbox_norm": [0.31, 0.5, 0.71, 0.9]}
                    ]}
                ],
                "pointcloud": {"points": [[0, 0, 2.0], [0, 0, 4.0]]}
            }"#,
        )
        .unwrap()
    }

    // ── build_store ──────────────────────────────────────────────────────────

    #[test]
    fn build_store_ingests_and_merges() {
        let scene = scene();
        let store = GroundingPipeline::default()
            .build_store(&scene.keyframes(), &scene, &scene)
            .unwrap();
        assert_eq!(store.len(), 2);
        let table = &store.get_by_class("table")[0];
        assert_eq!(table.id, Some(0));
        assert_eq!(table.frame_ids.len(), 2);
        assert!((table.confidence - 0.8).abs() < 1e-6);
        assert_eq!(store.next_id(), 3);
    }

    #[test]
    fn build_store_with_empty_cloud_still_succeeds() {
        let scene = scene();
        let store = GroundingPipeline::default()
            .build_store(&scene.keyframes(), &scene, &EmptyReconstruction)
            .unwrap();
        assert!(store.iter().all(|o| o.center_3d == Some(Point3::new(0.0, 0.0, 1.0))));
    }

    // ── ground ───────────────────────────────────────────────────────────────

    #[test]
    fn ground_success_fills_result() {
        let scene = scene();
        let pipeline = GroundingPipeline::default();
        let store = pipeline.build_store(&scene.keyframes(), &scene, &scene).unwrap();
        let result = pipeline.ground("the lamp", &RuleBasedParser, &store);

        assert!(result.success);
        assert_eq!(result.target_object.as_deref(), Some("lamp"));
        assert_eq!(result.object_id, Some(1));
        assert_eq!(result.bbox_format, "xyzwhd");
        assert!(result.bbox_3d.is_some());
        assert_eq!(result.metadata.num_objects, 2);
        assert_eq!(result.metadata.num_frames, 2);
        assert_eq!(result.metadata.parser, "rule-based");
        assert!(result.error.is_none());
    }

    #[test]
    fn ground_failure_reports_error_and_null_geometry() {
        let scene = scene();
        let pipeline = GroundingPipeline::default();
        let store = pipeline.build_store(&scene.keyframes(), &scene, &scene).unwrap();
        let result = pipeline.ground("xylophone", &RuleBasedParser, &store);

        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("xylophone"));
        assert!(result.bbox_3d.is_none());
        assert!(result.center_3d.is_none());
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn degraded_reason_is_reported() {
        let scene = scene();
        let pipeline = GroundingPipeline::default();
        let store = pipeline.build_store(&scene.keyframes(), &scene, &scene).unwrap();
        let result = pipeline.ground("lamp near the piano", &RuleBasedParser, &store);
        assert!(result.success);
        assert!(result.metadata.degraded.unwrap().contains("piano"));
        assert_eq!(result.anchor_object.as_deref(), Some("piano"));
        assert_eq!(result.spatial_relation.as_deref(), Some("near"));
    }

    #[test]
    fn result_json_uses_document_field_names() {
        let pipeline = GroundingPipeline::default();
        let result = pipeline.ground("chair", &RuleBasedParser, &EntityStore::new());
        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("3d_bbox").is_some());
        assert_eq!(json["success"], false);
        assert_eq!(json["bbox_format"], "xyzwhd");
    }

    #[test]
    fn write_to_creates_result_file() {
        let _env = crate::telemetry::env_guard();
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("outputs");
        let result = GroundingPipeline::default().ground("chair", &RuleBasedParser, &EntityStore::new());
        let path = result.write_to(&out).unwrap();
        let back: GroundingResult = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(back.run_id, result.run_id);
        assert_eq!(back.query, "chair");
    }
}
