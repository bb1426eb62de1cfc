//! Episode label derivation.
//!
//! Projects a feature strategy's note-level output onto episode labels through the
//! task's aggregation policy, and imports human gold labels.

mod human;
mod policies;
mod vocab;

pub use human::*;
pub use policies::*;
pub use vocab::*;

use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::db::{Database, DbError};
use crate::engine::IdempotencyPolicy;
use crate::models::{EpisodeId, EpisodeLabel, FeatureId, NewEpisodeLabel, NoteFeature, OutputType, Provenance, TaskDef};
use crate::registry::{RegistryError, StrategyHandle, StrategyRegistry};

/// Derivation and label import errors.
#[derive(Error, Debug)]
pub enum DeriveError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Task {task} produces {found} output, not episode labels")]
    NotLabelTask { task: String, found: OutputType },

    #[error("Episode {0} not found")]
    MissingEpisode(EpisodeId),

    #[error("Labels not in the vocabulary of {task}: {labels:?}")]
    UnknownLabels { task: String, labels: Vec<String> },

    #[error("Vocabulary error: {0}")]
    Vocabulary(String),

    #[error("Import error on line {line}: {message}")]
    Import { line: usize, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DeriveResult<T> = Result<T, DeriveError>;

/// One label proposed by an aggregation policy.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedLabel {
    pub label_name: String,
    pub label_value: f64,
    /// Feature that evidences the label
    pub note_feature_id: Option<FeatureId>,
    pub line_number: Option<i64>,
}

/// How a task turns an episode's features into labels.
pub trait AggregationPolicy: Send + Sync {
    fn name(&self) -> &str;

    /// Features arrive earliest note first, then by feature name.
    fn aggregate(&self, features: &[NoteFeature]) -> Vec<DerivedLabel>;

    /// Closed label vocabulary, if the task has one. Human imports are checked against it.
    fn label_names(&self) -> Option<BTreeSet<String>> {
        None
    }
}

/// Result of deriving one episode.
#[derive(Debug, Clone, PartialEq)]
pub enum DeriveOutcome {
    Derived(Vec<EpisodeLabel>),
    SkippedExisting { conflict: bool },
    /// The strategy has no features for the episode.
    NoFeatures,
}

/// Counts from deriving many episodes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeriveSummary {
    pub derived: usize,
    pub labels_written: usize,
    pub skipped_existing: usize,
    pub conflicts_absorbed: usize,
    /// Episodes whose features matched no label
    pub empty: usize,
    pub no_features: usize,
}

/// Derives a label task's episode labels from a feature strategy.
pub struct Deriver<'r> {
    registry: &'r StrategyRegistry,
    policy: IdempotencyPolicy,
}

impl<'r> Deriver<'r> {
    pub fn new(registry: &'r StrategyRegistry) -> Self {
        Self {
            registry,
            policy: IdempotencyPolicy::Skip,
        }
    }

    pub fn with_policy(mut self, policy: IdempotencyPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Derive labels of `task` for one episode from `strategy`'s features.
    pub fn derive(
        &self,
        db: &mut Database,
        episode_id: EpisodeId,
        task: &str,
        strategy: &StrategyHandle,
    ) -> DeriveResult<DeriveOutcome> {
        let task_def = label_task(self.registry, task)?;
        let aggregation = self.registry.aggregation(task)?;
        let task_row = db.get_or_register_task(task_def)?;
        let strategy_row = db.get_or_register_strategy(&strategy.task, &strategy.strategy_def())?;

        if db.get_episode(episode_id)?.is_none() {
            return Err(DeriveError::MissingEpisode(episode_id));
        }
        if self.policy == IdempotencyPolicy::Skip
            && db.strategy_labels_exist(episode_id, task_row.id, strategy_row.id)?
        {
            debug!(episode = %episode_id, task, strategy = %strategy.qualified_name(), "labels exist");
            return Ok(DeriveOutcome::SkippedExisting { conflict: false });
        }

        let features = db.list_features_for_episode(episode_id, strategy_row.id)?;
        if features.is_empty() {
            return Ok(DeriveOutcome::NoFeatures);
        }

        let labels: Vec<NewEpisodeLabel> = aggregation
            .aggregate(&features)
            .into_iter()
            .map(|derived| NewEpisodeLabel {
                episode_id,
                task_id: task_row.id,
                note_feature_id: derived.note_feature_id,
                provenance: Provenance::Strategy(strategy_row.id),
                label_name: derived.label_name,
                label_value: derived.label_value,
                line_number: derived.line_number,
            })
            .collect();
        if labels.is_empty() {
            warn!(episode = %episode_id, task, policy = aggregation.name(), "no labels derived");
        }

        let written = match self.policy {
            IdempotencyPolicy::Skip => {
                db.insert_strategy_labels(episode_id, task_row.id, strategy_row.id, &labels)
            }
            IdempotencyPolicy::Overwrite => {
                db.replace_strategy_labels(episode_id, task_row.id, strategy_row.id, &labels)
            }
        };
        match written {
            Ok(labels) => Ok(DeriveOutcome::Derived(labels)),
            Err(e) if e.is_duplicate() => {
                info!(episode = %episode_id, task, "concurrent derivation won; conflict absorbed");
                Ok(DeriveOutcome::SkippedExisting { conflict: true })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Derive every episode the strategy has features for.
    pub fn derive_all(
        &self,
        db: &mut Database,
        task: &str,
        strategy: &StrategyHandle,
    ) -> DeriveResult<DeriveSummary> {
        let strategy_row = db.get_or_register_strategy(&strategy.task, &strategy.strategy_def())?;
        let episodes = db.list_episodes_with_features(strategy_row.id)?;
        self.derive_episodes(db, task, strategy, &episodes)
    }

    /// Derive the given episodes, tallying outcomes.
    pub fn derive_episodes(
        &self,
        db: &mut Database,
        task: &str,
        strategy: &StrategyHandle,
        episodes: &[EpisodeId],
    ) -> DeriveResult<DeriveSummary> {
        info!(episodes = episodes.len(), task, strategy = %strategy.qualified_name(), "deriving episode labels");

        let mut summary = DeriveSummary::default();
        for &episode_id in episodes {
            match self.derive(db, episode_id, task, strategy)? {
                DeriveOutcome::Derived(labels) if labels.is_empty() => summary.empty += 1,
                DeriveOutcome::Derived(labels) => {
                    summary.derived += 1;
                    summary.labels_written += labels.len();
                }
                DeriveOutcome::SkippedExisting { conflict } => {
                    summary.skipped_existing += 1;
                    if conflict {
                        summary.conflicts_absorbed += 1;
                    }
                }
                DeriveOutcome::NoFeatures => summary.no_features += 1,
            }
        }
        info!(?summary, "derivation finished");
        Ok(summary)
    }
}

/// Look up a task and check it produces episode labels.
pub(crate) fn label_task<'a>(registry: &'a StrategyRegistry, task: &str) -> DeriveResult<&'a TaskDef> {
    let task_def = registry.task(task)?;
    if task_def.output_type != OutputType::EpisodeLabel {
        return Err(DeriveError::NotLabelTask {
            task: task.to_string(),
            found: task_def.output_type,
        });
    }
    Ok(task_def)
}
