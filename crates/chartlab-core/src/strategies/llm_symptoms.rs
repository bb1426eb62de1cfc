//! Presenting symptoms by prompting a completion backend.

use chartlab_llm::{build_full_prompt, join_terms, parse_symptom_list, CompletionBackend, ExtractionError};
use chrono::NaiveDate;
use std::sync::Arc;

use super::hpi_regex::HPI_SHORT;
use crate::strategy::{ExtractorError, ExtractorOutput, FeatureExtractor, FeatureSchema};

/// Feature name holding the newline-joined symptom list.
pub const PRESENTING_SX: &str = "presenting_sx";

/// Asks a model for the presenting symptoms of a short HPI.
///
/// Runtime failures are infrastructure faults; anything the model says that cannot
/// be read as a symptom list is recorded as unusable output.
pub struct LlmSymptomExtractor {
    backend: Arc<dyn CompletionBackend>,
    include_examples: bool,
    input_section: Option<String>,
    description: String,
    last_updated: NaiveDate,
}

impl LlmSymptomExtractor {
    pub fn new(backend: Arc<dyn CompletionBackend>) -> Self {
        let description = format!("Presenting symptoms as a JSON array from {}", backend.model_id());
        Self {
            backend,
            include_examples: true,
            input_section: Some(HPI_SHORT.to_string()),
            description,
            last_updated: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap_or_default(),
        }
    }

    /// Zero-shot prompting.
    pub fn without_examples(mut self) -> Self {
        self.include_examples = false;
        self
    }

    /// Run over another section, or the whole note with `None`.
    pub fn with_input_section(mut self, section: Option<&str>) -> Self {
        self.input_section = section.map(String::from);
        self
    }

    pub fn with_last_updated(mut self, date: NaiveDate) -> Self {
        self.last_updated = date;
        self
    }
}

impl FeatureExtractor for LlmSymptomExtractor {
    fn schema(&self) -> FeatureSchema {
        FeatureSchema::Derived {
            fallback: PRESENTING_SX.to_string(),
        }
    }

    fn extract(&self, text: &str) -> Result<ExtractorOutput, ExtractorError> {
        let prompt = build_full_prompt(text, self.include_examples);
        let raw_output = self.backend.complete(&prompt).map_err(|e| match e {
            ExtractionError::Inference(msg) => ExtractorError::Infrastructure(msg),
            other => ExtractorError::Unusable {
                raw_output: String::new(),
                reason: other.to_string(),
            },
        })?;

        match parse_symptom_list(&raw_output) {
            Ok(terms) => Ok(ExtractorOutput {
                values: vec![(PRESENTING_SX.to_string(), Some(join_terms(&terms)))],
                raw_output,
            }),
            Err(e) => Err(ExtractorError::Unusable {
                raw_output,
                reason: e.to_string(),
            }),
        }
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn last_updated(&self) -> NaiveDate {
        self.last_updated
    }

    fn input_section(&self) -> Option<&str> {
        self.input_section.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chartlab_llm::MockBackend;

    #[test]
    fn test_keyword_backend_values() {
        let extractor = LlmSymptomExtractor::new(Arc::new(MockBackend::new()));
        let output = extractor
            .extract("Three days of fever and rigors, no vomiting.")
            .unwrap();

        assert_eq!(
            output.values,
            vec![(PRESENTING_SX.to_string(), Some("fever\nchills".to_string()))]
        );
        assert_eq!(output.raw_output, r#"["fever","chills"]"#);
        assert_eq!(extractor.input_section(), Some(HPI_SHORT));
    }

    #[test]
    fn test_prose_answer_is_unusable() {
        let extractor = LlmSymptomExtractor::new(Arc::new(MockBackend::with_response(
            "I cannot determine the symptoms from this text",
        )));
        match extractor.extract("HPI text") {
            Err(ExtractorError::Unusable { raw_output, .. }) => {
                assert_eq!(raw_output, "I cannot determine the symptoms from this text");
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_runtime_failure_is_infrastructure() {
        let extractor = LlmSymptomExtractor::new(Arc::new(MockBackend::failing("CUDA OOM")))
            .without_examples()
            .with_input_section(None);
        assert_eq!(
            extractor.extract("HPI text").unwrap_err(),
            ExtractorError::Infrastructure("CUDA OOM".into())
        );
        assert_eq!(extractor.input_section(), None);
    }
}
