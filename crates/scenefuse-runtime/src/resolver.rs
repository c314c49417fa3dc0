//! Candidate Resolver.
//!
//! Resolves a parsed query (target, optional anchor, optional relation) to a
//! single entity in a populated [`EntityStore`].
//!
//! ## Stages
//!
//! 1. Exact, case-insensitive class match on the target.
//! 2. Substring match in either direction, if (1) found nothing.
//! 3. Synonym lookup, if (2) found nothing; results are unioned in synonym
//!    order.
//! 4. With both an anchor and a relation: the anchor label is resolved with
//!    stages 1–3, the highest-confidence anchor is chosen and candidates not
//!    satisfying the relation are dropped.  An unresolvable anchor skips the
//!    filter (degraded match); an unknown relation drops every candidate.
//! 5. One survivor is returned as is; several are disambiguated by highest
//!    confidence, first in store order on ties.
//!
//! # Example
//!
//! ```rust
//! use scenefuse_memory::store::EntityStore;
//! use scenefuse_runtime::resolver::CandidateResolver;
//! use scenefuse_types::{BBox2D, Object3D, Point3, QueryComponents};
//!
//! let bbox = BBox2D::new(0.1, 0.1, 0.2, 0.2);
//! let mut store = EntityStore::new();
//! store.add(Object3D::new("table", 0.9, bbox, 0).with_center(Point3::new(0.0, 0.0, 0.0)));
//! store.add(Object3D::new("lamp", 0.6, bbox, 0).with_center(Point3::new(0.0, 0.0, 0.2)));
//! store.add(Object3D::new("lamp", 0.9, bbox, 0).with_center(Point3::new(3.0, 3.0, 3.0)));
//!
//! let query = QueryComponents::relative("lamp", "on", "table");
//! let hit = CandidateResolver::default().resolve(&query, &store).unwrap();
//! assert_eq!(hit.entity.id, Some(1));
//! assert_eq!(hit.candidate_count, 1);
//! ```

use std::fmt;

use serde::Serialize;
use tracing::{debug, warn};

use scenefuse_memory::store::EntityStore;
use scenefuse_types::{FuseError, NotFoundStage, Object3D, QueryComponents, SpatialRelation};

use crate::synonyms::SynonymTable;

// ─────────────────────────────────────────────────────────────────────────────
// Resolution
// ─────────────────────────────────────────────────────────────────────────────

/// Why a successful resolution ignored part of the query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DegradedReason {
    /// The anchor label matched no entity, so relation filtering was skipped.
    AnchorUnresolved { anchor: String },
    /// Only one of anchor and relation was given, so filtering was skipped.
    IncompleteRelation,
}

impl fmt::Display for DegradedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AnchorUnresolved { anchor } => {
                write!(f, "anchor '{anchor}' not found, relation ignored")
            }
            Self::IncompleteRelation => f.write_str("anchor and relation must both be given, relation ignored"),
        }
    }
}

/// The outcome of a successful resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// The chosen entity.
    pub entity: Object3D,
    /// Candidates left after relation filtering.
    pub candidate_count: usize,
    /// The anchor used for relation filtering, if any.
    pub anchor: Option<Object3D>,
    pub degraded: Option<DegradedReason>,
}

impl Resolution {
    pub fn anchor_id(&self) -> Option<u64> {
        self.anchor.as_ref().and_then(|a| a.id)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CandidateResolver
// ─────────────────────────────────────────────────────────────────────────────

/// Resolves [`QueryComponents`] against an [`EntityStore`].
#[derive(Debug, Clone, Default)]
pub struct CandidateResolver {
    synonyms: SynonymTable,
}

impl CandidateResolver {
    pub fn new(synonyms: SynonymTable) -> Self {
        Self { synonyms }
    }

    pub fn synonyms(&self) -> &SynonymTable {
        &self.synonyms
    }

    /// Entities matching `label` via exact, substring, then synonym matching.
    /// The first stage with any hit wins.
    pub fn find_candidates<'s>(&self, label: &str, store: &'s EntityStore) -> Vec<&'s Object3D> {
        let exact = store.get_by_class(label);
        if !exact.is_empty() {
            return exact;
        }

        let needle = label.trim().to_lowercase();
        if !needle.is_empty() {
            let partial: Vec<&Object3D> = store
                .iter()
                .filter(|o| {
                    let class = o.class_label.to_lowercase();
                    !class.is_empty() && (class.contains(&needle) || needle.contains(&class))
                })
                .collect();
            if !partial.is_empty() {
                debug!(label, hits = partial.len(), "substring match");
                return partial;
            }
        }

        let mut found: Vec<&Object3D> = Vec::new();
        for synonym in self.synonyms.lookup(label) {
            for o in store.get_by_class(synonym) {
                if !found.iter().any(|f| std::ptr::eq(*f, o)) {
                    found.push(o);
                }
            }
        }
        if !found.is_empty() {
            debug!(label, hits = found.len(), "synonym match");
        }
        found
    }

    /// Resolve `query` to one entity.
    ///
    /// # Errors
    ///
    /// [`FuseError::NotFound`] when the target is blank, nothing matches it,
    /// or relation filtering removes every candidate.
    pub fn resolve(&self, query: &QueryComponents, store: &EntityStore) -> Result<Resolution, FuseError> {
        let Some(target) = query.target_label() else {
            return Err(FuseError::not_found(&query.target, NotFoundStage::EmptyTarget));
        };

        let mut candidates = self.find_candidates(target, store);
        if candidates.is_empty() {
            return Err(FuseError::not_found(target, NotFoundStage::NoCandidates));
        }
        debug!(target, candidates = candidates.len(), "target candidates");

        let mut anchor: Option<&Object3D> = None;
        let mut degraded = None;

        match (query.anchor_label(), query.relation_name()) {
            (Some(anchor_label), Some(relation)) => {
                let anchors = self.find_candidates(anchor_label, store);
                match pick_most_confident(&anchors) {
                    None => {
                        warn!(anchor = anchor_label, "anchor not found, skipping relation filter");
                        degraded = Some(DegradedReason::AnchorUnresolved {
                            anchor: anchor_label.to_string(),
                        });
                    }
                    Some(chosen) => {
                        if SpatialRelation::parse(relation).is_none() {
                            warn!(relation, "unknown spatial relation, no candidate can satisfy it");
                        }
                        let related = store.by_relation(chosen, relation, None);
                        candidates.retain(|c| related.iter().any(|r| std::ptr::eq(*r, *c)));
                        debug!(
                            anchor_id = ?chosen.id,
                            relation,
                            survivors = candidates.len(),
                            "relation filter applied"
                        );
                        if candidates.is_empty() {
                            return Err(FuseError::not_found(target, NotFoundStage::RelationFilter));
                        }
                        anchor = Some(chosen);
                    }
                }
            }
            (None, None) => {}
            (anchor_label, relation) => {
                warn!(?anchor_label, ?relation, "incomplete relation in query, skipping filter");
                degraded = Some(DegradedReason::IncompleteRelation);
            }
        }

        let candidate_count = candidates.len();
        let entity = match candidates.as_slice() {
            [only] => *only,
            many => pick_most_confident(many).ok_or_else(|| FuseError::not_found(target, NotFoundStage::NoCandidates))?,
        };

        Ok(Resolution {
            entity: entity.clone(),
            candidate_count,
            anchor: anchor.cloned(),
            degraded,
        })
    }
}

/// Highest confidence wins; the earliest entity wins ties.
fn pick_most_confident<'s>(objects: &[&'s Object3D]) -> Option<&'s Object3D> {
    let mut best: Option<&'s Object3D> = None;
    for &o in objects {
        if best.is_none_or(|b| o.confidence > b.confidence) {
            best = Some(o);
        }
    }
    best
}
