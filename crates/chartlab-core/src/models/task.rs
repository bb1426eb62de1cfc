//! Tasks and the strategy versions that perform them.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ids::{StrategyId, TaskId};

/// What a task's strategies produce.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    Section,
    Feature,
    EpisodeLabel,
}

/// Kind of value an episode label carries. Selects the evaluator's metric family.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Binary,
    Ordinal,
    Continuous,
}

impl OutputType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputType::Section => "section",
            OutputType::Feature => "feature",
            OutputType::EpisodeLabel => "episode_label",
        }
    }
}

impl FromStr for OutputType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "section" => Ok(OutputType::Section),
            "feature" => Ok(OutputType::Feature),
            "episode_label" => Ok(OutputType::EpisodeLabel),
            _ => Err(format!("Unknown output type: {}", s)),
        }
    }
}

impl fmt::Display for OutputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Binary => "binary",
            ValueKind::Ordinal => "ordinal",
            ValueKind::Continuous => "continuous",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValueKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "binary" => Ok(ValueKind::Binary),
            "ordinal" => Ok(ValueKind::Ordinal),
            "continuous" => Ok(ValueKind::Continuous),
            _ => Err(format!("Unknown value kind: {}", s)),
        }
    }
}

/// Static definition of a task, registered lazily.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskDef {
    /// Unique task name (e.g., "presenting_sx")
    pub name: String,
    pub output_type: OutputType,
    pub value_kind: ValueKind,
    pub description: String,
}

impl TaskDef {
    pub fn new(name: impl Into<String>, output_type: OutputType, value_kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            output_type,
            value_kind,
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// A stored task row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub output_type: OutputType,
    pub value_kind: ValueKind,
    pub description: String,
}

/// Identity and metadata of one strategy version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StrategyDef {
    pub name: String,
    pub version: String,
    pub description: String,
    /// Date the implementation last changed
    pub last_updated: NaiveDate,
}

/// A stored strategy row. Immutable: a new version is a new row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StrategyRecord {
    pub id: StrategyId,
    pub task_id: TaskId,
    pub name: String,
    pub description: String,
    pub version: String,
    pub last_updated: NaiveDate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_type_strings() {
        for t in [OutputType::Section, OutputType::Feature, OutputType::EpisodeLabel] {
            assert_eq!(t.as_str().parse::<OutputType>().unwrap(), t);
        }
        assert!("label".parse::<OutputType>().is_err());
    }

    #[test]
    fn test_value_kind_serde() {
        assert_eq!(serde_json::to_string(&ValueKind::Continuous).unwrap(), "\"continuous\"");
        assert_eq!("ordinal".parse::<ValueKind>().unwrap(), ValueKind::Ordinal);
    }

    #[test]
    fn test_value_kind_display() {
        for kind in [ValueKind::Binary, ValueKind::Ordinal, ValueKind::Continuous] {
            assert_eq!(kind.to_string().parse::<ValueKind>().unwrap(), kind);
        }
        assert_eq!(format!("{}", ValueKind::Ordinal), "ordinal");
    }
}
