//! Interfaces implemented by extraction strategies.
//!
//! A strategy is any routine that maps text to raw output plus parsed values. How it
//! computes them (regexes, a prompted LLM, a fine-tuned model) is its own business.

use chrono::NaiveDate;
use std::sync::Arc;
use thiserror::Error;

/// Why a strategy produced nothing usable.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractorError {
    /// The strategy ran, but its output could not be parsed. Persisted for audit.
    #[error("unusable output: {reason}")]
    Unusable { raw_output: String, reason: String },

    /// The strategy's runtime failed (crashed, out of memory, unreachable).
    #[error("infrastructure failure: {0}")]
    Infrastructure(String),
}

/// Feature names a strategy writes per note.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureSchema {
    /// Always the same names, e.g. one `symptom_<x>` per symptom.
    Fixed(Vec<String>),
    /// Names depend on the text. A failed run is recorded under `fallback`.
    Derived { fallback: String },
}

impl FeatureSchema {
    /// Names to record a failed invocation under.
    pub fn failure_names(&self) -> Vec<String> {
        match self {
            FeatureSchema::Fixed(names) => names.clone(),
            FeatureSchema::Derived { fallback } => vec![fallback.clone()],
        }
    }
}

/// Raw output plus the (feature name, parsed value) pairs read from it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExtractorOutput {
    pub raw_output: String,
    pub values: Vec<(String, Option<String>)>,
}

/// Note-level feature extraction.
pub trait FeatureExtractor: Send + Sync {
    fn schema(&self) -> FeatureSchema;

    fn extract(&self, text: &str) -> Result<ExtractorOutput, ExtractorError>;

    fn description(&self) -> &str {
        ""
    }

    fn last_updated(&self) -> NaiveDate {
        NaiveDate::default()
    }

    /// Section to run over instead of the whole note.
    fn input_section(&self) -> Option<&str> {
        None
    }
}

/// Splits a note into named sections.
pub trait SectionSegmenter: Send + Sync {
    /// (section name, section text) pairs found in `text`.
    fn segment(&self, text: &str) -> Result<Vec<(String, String)>, ExtractorError>;

    fn description(&self) -> &str {
        ""
    }

    fn last_updated(&self) -> NaiveDate {
        NaiveDate::default()
    }
}

/// Executable routine behind a registered strategy.
#[derive(Clone)]
pub enum Implementation {
    Extractor(Arc<dyn FeatureExtractor>),
    Segmenter(Arc<dyn SectionSegmenter>),
}

impl Implementation {
    pub fn description(&self) -> &str {
        match self {
            Implementation::Extractor(e) => e.description(),
            Implementation::Segmenter(s) => s.description(),
        }
    }

    pub fn last_updated(&self) -> NaiveDate {
        match self {
            Implementation::Extractor(e) => e.last_updated(),
            Implementation::Segmenter(s) => s.last_updated(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Implementation::Extractor(_) => "extractor",
            Implementation::Segmenter(_) => "segmenter",
        }
    }
}

impl std::fmt::Debug for Implementation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Implementation::{}", self.kind())
    }
}
