//! Built-in strategies.
//!
//! - [`HpiRegexSegmenter`]: cuts the short History of Present Illness out of a note
//! - [`RegexSymptomExtractor`]: one binary `symptom_<x>` flag per known symptom
//! - [`LlmSymptomExtractor`]: prompts a completion backend for a symptom list

mod hpi_regex;
mod llm_symptoms;
mod regex_symptoms;

pub use hpi_regex::*;
pub use llm_symptoms::*;
pub use regex_symptoms::*;
