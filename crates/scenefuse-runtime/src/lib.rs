//! `scenefuse-runtime` – query grounding on top of the entity store.
//!
//! # Modules
//!
//! - [`resolver`] – [`CandidateResolver`][resolver::CandidateResolver]:
//!   exact → substring → synonym candidate search, anchor/relation filtering
//!   and confidence-based disambiguation.
//! - [`synonyms`] – [`SynonymTable`][synonyms::SynonymTable]: the injectable
//!   label → synonyms table behind the resolver's last fallback.
//! - [`query`] – [`QueryParser`][query::QueryParser] with a keyword
//!   [`RuleBasedParser`][query::RuleBasedParser] and an OpenAI-compatible
//!   [`LlmQueryParser`][query::LlmQueryParser] (e.g. a local
//!   [Ollama](https://ollama.com) server) that falls back to the rules.
//! - [`pipeline`] – [`GroundingPipeline`][pipeline::GroundingPipeline]:
//!   reconstruct → ingest → merge → parse → resolve, producing a
//!   [`GroundingResult`][pipeline::GroundingResult] document.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: initialises
//!   the global `tracing` subscriber with an optional OTLP span exporter.

pub mod pipeline;
pub mod query;
pub mod resolver;
pub mod synonyms;
pub mod telemetry;

pub use pipeline::{GroundingPipeline, GroundingResult, PipelineConfig};
pub use query::{LlmError, LlmQueryParser, QueryParser, RuleBasedParser};
pub use resolver::{CandidateResolver, DegradedReason, Resolution};
pub use synonyms::SynonymTable;
pub use telemetry::{TracerProviderGuard, init_tracing};
