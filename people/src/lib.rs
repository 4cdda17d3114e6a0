//! Identity resolution for a personal photo library.
//!
//! Consumes face records with pre-extracted embeddings and maintains the set
//! of people they belong to:
//!
//! - [`Engine::match_unlabeled_faces`] assigns unlabeled faces to existing
//!   people by nearest representative vector.
//! - [`Engine::discover_clusters`] runs DBSCAN over what is left and creates
//!   placeholder-named people for every cluster and every noise face.
//! - [`Engine::suggest_merges`] ranks near-duplicate people.
//! - [`Engine::merge`] folds one person into another in a single
//!   conditional transaction.
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use photoid_kv::MemoryStore;
//! use photoid_people::{CancelToken, Engine, EngineConfig, NoProgress};
//!
//! let engine = Engine::new(
//!     Arc::new(MemoryStore::new()),
//!     EngineConfig { dim: 4, ..Default::default() },
//! ).unwrap();
//!
//! let assigned = engine
//!     .match_unlabeled_faces(0.2, &NoProgress, &CancelToken::new())
//!     .unwrap();
//! assert_eq!(assigned, 0);
//! ```
//!
//! # Design
//!
//! A person's representative embedding is always derived from its current
//! faces, never stored. Every write touching a person is conditioned on that
//! person's stored bytes and bumps its revision, so concurrent passes never
//! leave a face pointing at a deleted person.

mod config;
mod dbscan;
mod discover;
mod engine;
mod error;
mod ignore;
mod keys;
mod kmeans;
mod matcher;
mod merge;
mod pipeline;
mod progress;
mod registry;
mod retry;
mod store;
mod suggest;
mod types;
mod vector;

pub use config::EngineConfig;
pub use dbscan::{NOISE, dbscan};
pub use engine::Engine;
pub use error::PeopleError;
pub use ignore::PersonPair;
pub use pipeline::{PassReport, PipelineError, PipelineOptions};
pub use progress::{CancelToken, NoProgress, Progress};
pub use retry::RetryPolicy;
pub use types::{
    Diagnosis, Face, FaceInput, MergeOutcome, MergeSuggestion, Person, PersonSummary,
    SimilarPerson,
};
pub use vector::{centroid, cosine_distance, l2_normalize, multi_centroid};

#[cfg(test)]
mod tests;
