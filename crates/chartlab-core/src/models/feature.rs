//! Note-level features extracted by strategies.

use serde::{Deserialize, Serialize};

use super::ids::{FeatureId, NoteId, SectionId, StrategyId};

/// One extracted feature value, with the raw strategy output kept for audit.
///
/// At most one row exists per (note, feature name, strategy).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NoteFeature {
    pub id: FeatureId,
    pub note_id: NoteId,
    /// Section the strategy ran over, if not the whole note
    pub section_id: Option<SectionId>,
    pub strategy_id: StrategyId,
    /// Feature name (e.g., "symptom_fever")
    pub feature_name: String,
    /// Unparsed strategy output
    pub raw_output: String,
    /// Parsed value; `None` records a strategy failure
    pub feature_value: Option<String>,
    /// Extraction timestamp (RFC 3339), shared by rows from one invocation
    pub extracted_at: String,
    /// Wall-clock time of the strategy invocation
    pub runtime_secs: f64,
}

/// A feature row ready to insert.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewNoteFeature {
    pub note_id: NoteId,
    pub section_id: Option<SectionId>,
    pub strategy_id: StrategyId,
    pub feature_name: String,
    pub raw_output: String,
    pub feature_value: Option<String>,
    pub runtime_secs: f64,
}

impl NoteFeature {
    /// Whether this row records a failed invocation.
    pub fn is_failure(&self) -> bool {
        self.feature_value.is_none()
    }

    /// Whether the value reads as a positive finding.
    pub fn is_truthy(&self) -> bool {
        self.feature_value.as_deref().map_or(false, is_truthy_value)
    }
}

/// Non-zero numbers and yes/true/present read as positive.
pub fn is_truthy_value(value: &str) -> bool {
    let value = value.trim();
    if let Ok(n) = value.parse::<f64>() {
        return n != 0.0 && !n.is_nan();
    }
    matches!(
        value.to_ascii_lowercase().as_str(),
        "true" | "yes" | "y" | "present" | "positive"
    )
}
