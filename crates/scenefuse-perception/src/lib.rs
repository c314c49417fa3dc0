//! `scenefuse-perception` – from 2-D detections to 3-D entity estimates.
//!
//! # Modules
//!
//! - [`geometry`] – [`iou_2d`][geometry::iou_2d] and
//!   [`RelationPredicate`][geometry::RelationPredicate]: the 2-D overlap and
//!   3-D spatial-relation tests used by deduplication and query resolution.
//! - [`ingestion`] – [`IngestionAdapter`][ingestion::IngestionAdapter]: turns
//!   per-keyframe detections plus a reconstructed point cloud into entity
//!   creation requests, and the [`Detector`][ingestion::Detector] /
//!   [`ReconstructionProvider`][ingestion::ReconstructionProvider] seams it
//!   consumes.

pub mod geometry;
pub mod ingestion;
