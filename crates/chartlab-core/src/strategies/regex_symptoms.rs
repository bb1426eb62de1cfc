//! Keyword regex symptom flags.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

use crate::strategy::{ExtractorError, ExtractorOutput, FeatureExtractor, FeatureSchema};

/// Feature name prefix; `symptom_fever` becomes label `fever`.
pub const SYMPTOM_PREFIX: &str = "symptom_";

const DEFAULT_SYMPTOMS: &[(&str, &str)] = &[
    ("fever", r"fevers?|febrile|temperature of|tmax"),
    ("chills", r"chills|rigors"),
    ("cough", r"cough(ing)?"),
    ("dyspnea", r"dyspnea|shortness of breath|sob|short of breath"),
    ("chest_pain", r"chest (pain|pressure|tightness)"),
    ("abdominal_pain", r"(abdominal|abd|belly) pain"),
    ("nausea", r"nausea|nauseous"),
    ("vomiting", r"vomit(ing|ed)?|emesis"),
    ("diarrhea", r"diarrh?ea|loose stools?"),
    ("headache", r"headaches?"),
    ("confusion", r"confus(ed|ion)|altered mental status|ams"),
    ("dysuria", r"dysuria|burning (with|on) urination"),
];

/// A negation cue earlier in the same clause.
static NEGATION_CUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(no|not|denies|denied|denying|without|negative for)\b").expect("negation pattern")
});

struct SymptomPattern {
    name: String,
    pattern: Regex,
}

/// Flags each known symptom `1` when mentioned without a preceding negation, else `0`.
pub struct RegexSymptomExtractor {
    symptoms: Vec<SymptomPattern>,
}

impl Default for RegexSymptomExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl RegexSymptomExtractor {
    /// Create an extractor with the default symptom list.
    pub fn new() -> Self {
        // Default patterns are compile-time constants covered by tests
        Self::with_symptoms(DEFAULT_SYMPTOMS).unwrap_or_else(|_| Self { symptoms: Vec::new() })
    }

    /// Create an extractor from (symptom name, pattern) pairs.
    pub fn with_symptoms(symptoms: &[(&str, &str)]) -> Result<Self, regex::Error> {
        let symptoms = symptoms
            .iter()
            .map(|(name, pattern)| -> Result<SymptomPattern, regex::Error> {
                Ok(SymptomPattern {
                    name: name.to_string(),
                    pattern: Regex::new(&format!(r"(?i)\b({})\b", pattern))?,
                })
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self { symptoms })
    }

    fn feature_name(symptom: &str) -> String {
        format!("{}{}", SYMPTOM_PREFIX, symptom)
    }

    /// First un-negated mention of a pattern.
    fn affirmed_mention<'t>(pattern: &Regex, text: &'t str) -> Option<&'t str> {
        pattern
            .find_iter(text)
            .find(|m| {
                let clause_start = text[..m.start()]
                    .rfind(|c| matches!(c, '.' | ';' | '\n'))
                    .map_or(0, |i| i + 1);
                !NEGATION_CUE.is_match(&text[clause_start..m.start()])
            })
            .map(|m| m.as_str())
    }
}

impl FeatureExtractor for RegexSymptomExtractor {
    fn schema(&self) -> FeatureSchema {
        FeatureSchema::Fixed(self.symptoms.iter().map(|s| Self::feature_name(&s.name)).collect())
    }

    fn extract(&self, text: &str) -> Result<ExtractorOutput, ExtractorError> {
        let mut mentions = BTreeMap::new();
        let mut values = Vec::with_capacity(self.symptoms.len());

        for symptom in &self.symptoms {
            let mention = Self::affirmed_mention(&symptom.pattern, text);
            if let Some(mention) = mention {
                mentions.insert(symptom.name.as_str(), mention);
            }
            let flag = if mention.is_some() { "1" } else { "0" };
            values.push((Self::feature_name(&symptom.name), Some(flag.to_string())));
        }

        let raw_output = serde_json::to_string(&mentions).map_err(|e| ExtractorError::Unusable {
            raw_output: String::new(),
            reason: e.to_string(),
        })?;
        Ok(ExtractorOutput { raw_output, values })
    }

    fn description(&self) -> &str {
        "Keyword regexes with clause-level negation"
    }

    fn last_updated(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap_or_default()
    }
}
