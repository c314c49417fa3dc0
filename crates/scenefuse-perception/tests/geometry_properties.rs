use proptest::prelude::*;
use scenefuse_perception::geometry::{RelationPredicate, iou_2d};
use scenefuse_types::{BBox2D, Point3, SpatialRelation};

fn bbox_strategy() -> impl Strategy<Value = BBox2D> {
    // Arbitrary corners, including inverted and degenerate boxes.
    (0.0f32..1.0, 0.0f32..1.0, 0.0f32..1.0, 0.0f32..1.0).prop_map(|(x1, y1, x2, y2)| BBox2D::new(x1, y1, x2, y2))
}

fn proper_bbox_strategy() -> impl Strategy<Value = BBox2D> {
    (0.0f32..0.9, 0.0f32..0.9, 0.01f32..0.1, 0.01f32..0.1)
        .prop_map(|(x1, y1, w, h)| BBox2D::new(x1, y1, x1 + w, y1 + h))
}

fn point_strategy() -> impl Strategy<Value = Point3> {
    (-5.0f32..5.0, -5.0f32..5.0, -5.0f32..5.0).prop_map(|(x, y, z)| Point3::new(x, y, z))
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        failure_persistence: None,
        ..ProptestConfig::default()
    })]

    #[test]
    fn iou_is_symmetric_and_bounded(a in bbox_strategy(), b in bbox_strategy()) {
        let ab = iou_2d(&a, &b);
        let ba = iou_2d(&b, &a);
        prop_assert!((0.0..=1.0).contains(&ab));
        prop_assert!((ab - ba).abs() < 1e-6);
    }

    #[test]
    fn iou_with_itself_is_one(a in proper_bbox_strategy()) {
        prop_assert!((iou_2d(&a, &a) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn above_and_below_flip_when_swapped(c in point_strategy(), a in point_strategy()) {
        let rel = RelationPredicate::default();
        prop_assume!((c.z - a.z).abs() > rel.vertical);

        let above = rel.holds(SpatialRelation::Above, c, a);
        let below = rel.holds(SpatialRelation::Below, c, a);
        prop_assert!(above != below);
        prop_assert_eq!(rel.holds(SpatialRelation::Above, a, c), below);
        prop_assert_eq!(rel.holds(SpatialRelation::Below, a, c), above);
    }
}
