use proptest::prelude::*;
use scenefuse_memory::store::EntityStore;
use scenefuse_perception::ingestion::SceneFile;
use scenefuse_runtime::{CandidateResolver, GroundingPipeline, GroundingResult, QueryParser, RuleBasedParser};
use scenefuse_types::{BBox2D, FuseError, NotFoundStage, Object3D, Point3, QueryComponents};

fn furnished_store() -> EntityStore {
    let bbox = BBox2D::new(0.1, 0.1, 0.2, 0.2);
    let mut store = EntityStore::new();
    store.add(Object3D::new("table", 0.9, bbox, 0).with_center(Point3::new(0.0, 0.0, 0.0)));
    store.add(Object3D::new("lamp", 0.5, bbox, 0).with_center(Point3::new(0.0, 0.0, 0.2)));
    store.add(Object3D::new("lamp", 0.95, bbox, 1).with_center(Point3::new(3.0, 3.0, 3.0)));
    store
}

// ── Resolver scenarios ──────────────────────────────────────────────────────

#[test]
fn lamp_on_table_keeps_only_the_supported_lamp() {
    let store = furnished_store();
    let query = QueryComponents::relative("lamp", "on", "table");

    let res = CandidateResolver::default().resolve(&query, &store).unwrap();

    // The far lamp is more confident but fails the relation.
    assert_eq!(res.entity.id, Some(1));
    assert_eq!(res.candidate_count, 1);
    assert_eq!(res.anchor_id(), Some(0));
    assert!(res.degraded.is_none());
}

#[test]
fn unknown_label_is_not_found() {
    let store = furnished_store();
    let err = CandidateResolver::default()
        .resolve(&QueryComponents::target("xylophone"), &store)
        .unwrap_err();

    assert!(err.is_not_found());
    assert!(matches!(
        err,
        FuseError::NotFound {
            stage: NotFoundStage::NoCandidates,
            ..
        }
    ));
}

// ── Scene file → result document ────────────────────────────────────────────

const KITCHEN: &str = r#"{
    "keyframes": [
        {"frame_id": 0, "source": "frame_0000.jpg", "detections": [
            {"class_name": "table", "confidence": 0.92, "bbox_norm": [0.30, 0.55, 0.70, 0.95]},
            {"class_name": "cup",   "confidence": 0.71, "bbox_norm": [0.62, 0.40, 0.68, 0.50]},
            {"class_name": "notebook", "confidence": 0.88, "bbox_norm": [0.10, 0.30, 0.35, 0.55]}
        ]},
        {"frame_id": 4, "source": "frame_0004.jpg", "detections": [
            {"class_name": "table", "confidence": 0.85, "bbox_norm": [0.31, 0.55, 0.71, 0.95]},
            {"class_name": "cup",   "confidence": 0.65, "bbox_norm": [0.62, 0.41, 0.68, 0.51]}
        ]}
    ],
    "pointcloud": {"points": [[0.0, 0.0, 2.5], [0.3, 0.1, 3.5]]}
}"#;

#[test]
fn scene_file_grounds_query_and_writes_result() {
    let scene = SceneFile::from_json(KITCHEN).unwrap();
    let pipeline = GroundingPipeline::default();
    let store = pipeline.build_store(&scene.keyframes(), &scene, &scene).unwrap();
    assert_eq!(store.len(), 3);

    let result = pipeline.ground("the white cup", &RuleBasedParser, &store);
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.target_object.as_deref(), Some("cup"));
    assert_eq!(result.metadata.num_frames, 2);
    assert!(result.center_3d.is_some());

    let dir = tempfile::tempdir().unwrap();
    let path = result.write_to(dir.path()).unwrap();
    let back: GroundingResult = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    assert_eq!(back, result);
}

#[test]
fn laptop_resolves_through_synonyms() {
    let scene = SceneFile::from_json(KITCHEN).unwrap();
    let pipeline = GroundingPipeline::default();
    let store = pipeline.build_store(&scene.keyframes(), &scene, &scene).unwrap();

    let result = pipeline.ground("the laptop", &RuleBasedParser, &store);
    assert!(result.success);
    assert_eq!(result.target_object.as_deref(), Some("notebook"));
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        failure_persistence: None,
        ..ProptestConfig::default()
    })]

    #[test]
    fn grounding_never_panics_on_free_text(query in "[a-zA-Z ]{0,40}") {
        let store = furnished_store();
        let components = RuleBasedParser.parse(&query);
        let result = GroundingPipeline::default().ground(&query, &RuleBasedParser, &store);
        prop_assert_eq!(result.success, result.error.is_none());
        prop_assert_eq!(result.query_components, components);
    }
}
