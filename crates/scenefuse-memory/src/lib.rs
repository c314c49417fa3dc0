//! `scenefuse-memory` – the scene's object memory.
//!
//! Holds every 3-D object hypothesis produced by ingestion for the duration
//! of a run and answers the lookups the resolver needs.
//!
//! # Modules
//!
//! - [`store`] – [`EntityStore`][store::EntityStore]: ordered, id-keyed entity
//!   collection with class/frame lookups, linear-scan spatial queries
//!   (`nearest`, `in_region`, `by_relation`) and JSON save/load.
//! - [`dedup`] – [`DedupEngine`][dedup::DedupEngine]: clusters repeated
//!   per-frame detections of the same object (class match plus 2-D IoU or
//!   3-D proximity) and reduces each cluster to one canonical entity.

pub mod dedup;
pub mod store;
