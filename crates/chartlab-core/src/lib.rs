//! Chartlab Core Library
//!
//! Strategy-versioned feature extraction from clinical notes, episode label derivation,
//! and evaluation against human gold labels.
//!
//! # Architecture
//!
//! ```text
//! Notes ──► Segmentation ──► note_sections
//!   │                             │
//!   └──────► Extraction ◄─────────┘
//!                │
//!          note_features   (one row per note, feature name, strategy)
//!                │
//!           Derivation     (aggregation policy per label task)
//!                │
//!          episode_labels ◄── human import
//!                │
//!            Evaluation    (automated vs. gold, per task/strategy/label)
//! ```
//!
//! # Core Principle
//!
//! **Every output row names the strategy version that produced it.** Nothing is
//! overwritten unless asked, and every write is safe to repeat from any worker.
//!
//! # Modules
//!
//! - [`db`]: SQLite store with table prefixes and constraint classification
//! - [`models`]: Domain types (Episode, Note, NoteFeature, EpisodeLabel, etc.)
//! - [`registry`]: Version-aware strategy lookup
//! - [`engine`]: Idempotent extraction and segmentation
//! - [`derive`]: Episode label derivation and human label import
//! - [`evaluate`]: Metrics and reports
//! - [`worker`]: Partitioning runs across worker processes

pub mod cache;
pub mod config;
pub mod db;
pub mod derive;
pub mod engine;
pub mod evaluate;
pub mod models;
pub mod pipeline;
pub mod registry;
pub mod strategies;
pub mod strategy;
pub mod worker;

// Re-export commonly used types
pub use config::Config;
pub use db::Database;
pub use derive::Deriver;
pub use engine::{EngineOptions, ExtractOutcome, ExtractionEngine, IdempotencyPolicy};
pub use evaluate::{EvalOptions, EvaluationReport};
pub use models::{
    Episode, EpisodeLabel, InputUnit, Note, NoteFeature, OutputType, Provenance, Section, TaskDef, ValueKind,
};
pub use pipeline::{Chartlab, RunRequest};
pub use registry::{StrategyHandle, StrategyRegistry};
pub use worker::{RunSummary, WorkerPlan};

// =========================================================================
// Crate Error Type
// =========================================================================

#[derive(Debug, thiserror::Error)]
pub enum ChartlabError {
    #[error(transparent)]
    Database(#[from] db::DbError),

    #[error(transparent)]
    Registry(#[from] registry::RegistryError),

    #[error(transparent)]
    Engine(#[from] engine::EngineError),

    #[error(transparent)]
    Derive(#[from] derive::DeriveError),

    #[error(transparent)]
    Eval(#[from] evaluate::EvalError),

    #[error(transparent)]
    Worker(#[from] worker::WorkerError),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Cache(#[from] cache::CacheError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid input: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ChartlabError>;
