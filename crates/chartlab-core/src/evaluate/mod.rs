//! Evaluation of automated episode labels against human gold labels.
//!
//! Labels are joined on (episode, label name) within a task. A label present on only
//! one side is counted as unmatched, never as a false positive or negative, unless
//! `absent_as_negative` is set and the other side covered the episode. With a label
//! universe, names neither side gave on an episode both covered count as true negatives.

mod metrics;
mod report;

pub use metrics::*;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::debug;

use crate::db::{Database, DbError};
use crate::models::{EpisodeId, OutputType, Provenance, StrategyId, ValueKind};

/// Evaluation errors.
#[derive(Error, Debug)]
pub enum EvalError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Task {task} produces {found} output, not episode labels")]
    NotLabelTask { task: String, found: OutputType },

    #[error("Report serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type EvalResult<T> = Result<T, EvalError>;

/// How gold labels are formed when several annotators labeled an episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HumanAggregation {
    /// Labels of the lexicographically smallest annotator username
    #[default]
    FirstAnnotator,
    /// Mean value across the episode's annotators
    Mean,
}

/// Evaluation settings. Recorded in the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalOptions {
    /// Values at or above this are positive
    pub threshold: f64,
    /// Read a missing label as 0.0 when the other side covered the episode
    pub absent_as_negative: bool,
    pub human_aggregation: HumanAggregation,
    /// Ignore automated labels first found after this line
    pub max_line_number: Option<i64>,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            absent_as_negative: false,
            human_aggregation: HumanAggregation::FirstAnnotator,
            max_line_number: None,
        }
    }
}

/// Comparison of one label name between a strategy and gold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelReport {
    pub matched: u64,
    pub automated_only: u64,
    pub human_only: u64,
    pub metrics: Metrics,
}

impl LabelReport {
    /// Unmatched pairs on either side.
    pub fn unmatched(&self) -> u64 {
        self.automated_only + self.human_only
    }
}

/// One strategy's results for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyReport {
    pub strategy_id: StrategyId,
    pub name: String,
    pub version: String,
    pub labels: BTreeMap<String, LabelReport>,
    /// Micro totals over every label
    pub total: LabelReport,
}

/// Agreement between two annotators on one label, over episodes both labeled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgreementReport {
    pub matched: u64,
    pub first_only: u64,
    pub second_only: u64,
    pub metrics: Metrics,
}

/// Everything `evaluate` computed for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub task: String,
    pub value_kind: ValueKind,
    pub options: EvalOptions,
    /// Episodes with at least one human label
    pub gold_episodes: u64,
    /// Keyed by `task.name vversion` of the producing strategy
    pub strategies: BTreeMap<String, StrategyReport>,
    /// Keyed by `first vs second` annotator, then label name
    pub inter_annotator: BTreeMap<String, BTreeMap<String, AgreementReport>>,
}

impl EvaluationReport {
    pub fn to_json(&self) -> EvalResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// A strategy's report for one label.
    pub fn label(&self, strategy: &str, label_name: &str) -> Option<&LabelReport> {
        self.strategies.get(strategy)?.labels.get(label_name)
    }
}

/// Episode -> label name -> value.
type LabelGrid = BTreeMap<EpisodeId, BTreeMap<String, f64>>;

#[derive(Default)]
struct Comparison {
    pairs: Vec<(f64, f64)>,
    left_only: u64,
    right_only: u64,
}

/// Evaluate every strategy with labels for `task`, or only `strategy`.
pub fn evaluate(
    db: &Database,
    task: &str,
    strategy: Option<StrategyId>,
    options: &EvalOptions,
) -> EvalResult<EvaluationReport> {
    evaluate_with_universe(db, task, strategy, options, None)
}

/// `evaluate`, with the task's full set of label names for `absent_as_negative`.
pub fn evaluate_with_universe(
    db: &Database,
    task: &str,
    strategy: Option<StrategyId>,
    options: &EvalOptions,
    universe: Option<&BTreeSet<String>>,
) -> EvalResult<EvaluationReport> {
    let task_row = db
        .get_task_by_name(task)?
        .ok_or_else(|| EvalError::UnknownTask(task.to_string()))?;
    if task_row.output_type != OutputType::EpisodeLabel {
        return Err(EvalError::NotLabelTask {
            task: task.to_string(),
            found: task_row.output_type,
        });
    }

    let mut automated: BTreeMap<StrategyId, LabelGrid> = BTreeMap::new();
    let mut human: BTreeMap<String, LabelGrid> = BTreeMap::new();
    if let Some(id) = strategy {
        automated.entry(id).or_default();
    }

    for label in db.list_labels_for_task(task_row.id)? {
        match label.provenance {
            Provenance::Strategy(id) => {
                if strategy.map_or(false, |s| s != id) {
                    continue;
                }
                let episode = automated.entry(id).or_default().entry(label.episode_id).or_default();
                let too_late = options
                    .max_line_number
                    .zip(label.line_number)
                    .map_or(false, |(max, line)| line > max);
                if !too_late {
                    episode.insert(label.label_name, label.label_value);
                }
            }
            Provenance::Human(username) => {
                human
                    .entry(username)
                    .or_default()
                    .entry(label.episode_id)
                    .or_default()
                    .insert(label.label_name, label.label_value);
            }
        }
    }

    let gold = gold_labels(&human, options);
    let task_names: BTreeMap<_, _> = db.list_tasks()?.into_iter().map(|t| (t.id, t.name)).collect();

    let mut strategies = BTreeMap::new();
    for (strategy_id, grid) in &automated {
        let Some(record) = db.get_strategy(*strategy_id)? else {
            continue;
        };
        let comparisons = compare(grid, &gold, options.absent_as_negative, universe);

        let mut all_pairs = Vec::new();
        let mut total = Comparison::default();
        let mut labels = BTreeMap::new();
        for (label_name, comparison) in comparisons {
            all_pairs.extend_from_slice(&comparison.pairs);
            total.left_only += comparison.left_only;
            total.right_only += comparison.right_only;
            labels.insert(label_name, label_report(&comparison, task_row.value_kind, options.threshold));
        }
        total.pairs = all_pairs;

        let feature_task = task_names
            .get(&record.task_id)
            .map(String::as_str)
            .unwrap_or("?");
        let key = format!("{}.{} v{}", feature_task, record.name, record.version);
        debug!(strategy = %key, labels = labels.len(), "evaluated");
        strategies.insert(
            key,
            StrategyReport {
                strategy_id: *strategy_id,
                name: record.name,
                version: record.version,
                labels,
                total: label_report(&total, task_row.value_kind, options.threshold),
            },
        );
    }

    Ok(EvaluationReport {
        task: task.to_string(),
        value_kind: task_row.value_kind,
        options: options.clone(),
        gold_episodes: gold.len() as u64,
        strategies,
        inter_annotator: inter_annotator(&human, task_row.value_kind, options, universe),
    })
}

/// Evaluate every episode label task in the store.
pub fn evaluate_all(db: &Database, options: &EvalOptions) -> EvalResult<Vec<EvaluationReport>> {
    db.list_tasks()?
        .into_iter()
        .filter(|t| t.output_type == OutputType::EpisodeLabel)
        .map(|t| evaluate(db, &t.name, None, options))
        .collect()
}

fn gold_labels(human: &BTreeMap<String, LabelGrid>, options: &EvalOptions) -> LabelGrid {
    // Annotators iterate in username order
    let mut per_episode: BTreeMap<EpisodeId, Vec<&BTreeMap<String, f64>>> = BTreeMap::new();
    for grid in human.values() {
        for (episode_id, labels) in grid {
            per_episode.entry(*episode_id).or_default().push(labels);
        }
    }

    per_episode
        .into_iter()
        .map(|(episode_id, annotations)| {
            let labels = match options.human_aggregation {
                HumanAggregation::FirstAnnotator => annotations[0].clone(),
                HumanAggregation::Mean => {
                    let names: BTreeSet<&String> = annotations.iter().flat_map(|a| a.keys()).collect();
                    names
                        .into_iter()
                        .map(|name| {
                            let values: Vec<f64> = if options.absent_as_negative {
                                annotations.iter().map(|a| a.get(name).copied().unwrap_or(0.0)).collect()
                            } else {
                                annotations.iter().filter_map(|a| a.get(name).copied()).collect()
                            };
                            let mean = values.iter().sum::<f64>() / values.len() as f64;
                            (name.clone(), mean)
                        })
                        .collect()
                }
            };
            (episode_id, labels)
        })
        .collect()
}

/// Pair up `left` (predicted) and `right` (truth) values per label name.
fn compare(
    left: &LabelGrid,
    right: &LabelGrid,
    absent_as_negative: bool,
    universe: Option<&BTreeSet<String>>,
) -> BTreeMap<String, Comparison> {
    let episodes: BTreeSet<&EpisodeId> = left.keys().chain(right.keys()).collect();
    let mut comparisons: BTreeMap<String, Comparison> = BTreeMap::new();
    let universe = universe.filter(|_| absent_as_negative);

    for episode_id in episodes {
        let l = left.get(episode_id);
        let r = right.get(episode_id);
        let mut names: BTreeSet<&String> = l.into_iter().chain(r).flat_map(|m| m.keys()).collect();
        if l.is_some() && r.is_some() {
            names.extend(universe.into_iter().flatten());
        }

        for name in names {
            let comparison = comparisons.entry(name.clone()).or_default();
            match (l.and_then(|m| m.get(name)), r.and_then(|m| m.get(name))) {
                (Some(&p), Some(&t)) => comparison.pairs.push((p, t)),
                (Some(&p), None) if absent_as_negative && r.is_some() => comparison.pairs.push((p, 0.0)),
                (Some(_), None) => comparison.left_only += 1,
                (None, Some(&t)) if absent_as_negative && l.is_some() => comparison.pairs.push((0.0, t)),
                (None, Some(_)) => comparison.right_only += 1,
                (None, None) if absent_as_negative && l.is_some() && r.is_some() => {
                    comparison.pairs.push((0.0, 0.0))
                }
                (None, None) => {}
            }
        }
    }
    comparisons
}

fn metrics_for(pairs: &[(f64, f64)], value_kind: ValueKind, threshold: f64) -> Metrics {
    match value_kind {
        ValueKind::Binary => Metrics::Binary(binary_metrics(pairs, threshold)),
        ValueKind::Ordinal => Metrics::Binary(ordinal_metrics(pairs, threshold)),
        ValueKind::Continuous => Metrics::Continuous(continuous_metrics(pairs)),
    }
}

fn label_report(comparison: &Comparison, value_kind: ValueKind, threshold: f64) -> LabelReport {
    LabelReport {
        matched: comparison.pairs.len() as u64,
        automated_only: comparison.left_only,
        human_only: comparison.right_only,
        metrics: metrics_for(&comparison.pairs, value_kind, threshold),
    }
}

fn inter_annotator(
    human: &BTreeMap<String, LabelGrid>,
    value_kind: ValueKind,
    options: &EvalOptions,
    universe: Option<&BTreeSet<String>>,
) -> BTreeMap<String, BTreeMap<String, AgreementReport>> {
    let annotators: Vec<(&String, &LabelGrid)> = human.iter().collect();
    let mut reports = BTreeMap::new();

    for (i, (first, first_grid)) in annotators.iter().enumerate() {
        for (second, second_grid) in &annotators[i + 1..] {
            let shared = |grid: &LabelGrid, other: &LabelGrid| -> LabelGrid {
                grid.iter()
                    .filter(|(episode_id, _)| other.contains_key(episode_id))
                    .map(|(episode_id, labels)| (*episode_id, labels.clone()))
                    .collect()
            };
            let left = shared(first_grid, second_grid);
            if left.is_empty() {
                continue;
            }
            let right = shared(second_grid, first_grid);

            let labels = compare(&left, &right, options.absent_as_negative, universe)
                .into_iter()
                .map(|(name, c)| {
                    let report = AgreementReport {
                        matched: c.pairs.len() as u64,
                        first_only: c.left_only,
                        second_only: c.right_only,
                        metrics: metrics_for(&c.pairs, value_kind, options.threshold),
                    };
                    (name, report)
                })
                .collect();
            reports.insert(format!("{} vs {}", first, second), labels);
        }
    }
    reports
}
