//! Episode labels, their provenance, and annotators.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{EpisodeId, FeatureId, LabelId, StrategyId, TaskId};

/// Who produced a label. Exactly one source, never both, never neither.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(tag = "kind", content = "source", rename_all = "snake_case")]
pub enum Provenance {
    /// Derived from features of this strategy
    Strategy(StrategyId),
    /// Entered by this annotator
    Human(String),
}

impl Provenance {
    pub fn strategy_id(&self) -> Option<StrategyId> {
        match self {
            Provenance::Strategy(id) => Some(*id),
            Provenance::Human(_) => None,
        }
    }

    pub fn annotator(&self) -> Option<&str> {
        match self {
            Provenance::Strategy(_) => None,
            Provenance::Human(username) => Some(username),
        }
    }

    pub fn is_human(&self) -> bool {
        matches!(self, Provenance::Human(_))
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::Strategy(id) => write!(f, "strategy:{}", id),
            Provenance::Human(username) => write!(f, "human:{}", username),
        }
    }
}

/// An episode-level label.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EpisodeLabel {
    pub id: LabelId,
    pub episode_id: EpisodeId,
    pub task_id: TaskId,
    /// Feature the label was derived from, for automated labels
    pub note_feature_id: Option<FeatureId>,
    pub provenance: Provenance,
    /// Label name (e.g., "fever")
    pub label_name: String,
    /// Label value, rounded to five decimal places
    pub label_value: f64,
    /// Earliest line of the source feature that produced this label. Informational only.
    pub line_number: Option<i64>,
    pub created_at: String,
}

/// A label ready to insert.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewEpisodeLabel {
    pub episode_id: EpisodeId,
    pub task_id: TaskId,
    pub note_feature_id: Option<FeatureId>,
    pub provenance: Provenance,
    pub label_name: String,
    pub label_value: f64,
    pub line_number: Option<i64>,
}

/// A human annotator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Annotator {
    pub username: String,
    pub credential: Option<String>,
    pub admin: bool,
}

impl Annotator {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            credential: None,
            admin: false,
        }
    }
}

/// Bounded precision for stored label values.
pub fn round_label_value(value: f64) -> f64 {
    (value * 1e5).round() / 1e5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_label_value() {
        assert_eq!(round_label_value(0.123456789), 0.12346);
        assert_eq!(round_label_value(1.0), 1.0);
        assert_eq!(round_label_value(2.0 / 3.0), 0.66667);
    }

    #[test]
    fn test_provenance_accessors() {
        let auto = Provenance::Strategy(StrategyId(3));
        let human = Provenance::Human("alice".into());
        assert_eq!(auto.strategy_id(), Some(StrategyId(3)));
        assert_eq!(auto.annotator(), None);
        assert_eq!(human.annotator(), Some("alice"));
        assert!(human.is_human());
        assert_eq!(human.to_string(), "human:alice");
    }
}
