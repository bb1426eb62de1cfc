//! Symptom list extraction from LLM output.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::prompts::EXTRACTION_INSTRUCTIONS;

/// Extraction errors.
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid response format: {0}")]
    InvalidFormat(String),

    #[error("LLM inference error: {0}")]
    Inference(String),
}

pub type ExtractionResult<T> = Result<T, ExtractionError>;

/// A text-completion runtime.
///
/// `Inference` errors mean the runtime itself failed (crashed, timed out, ran out of
/// memory) and the caller should retry later. Anything the model actually produced is
/// returned as `Ok`, however malformed.
///
/// Backends that load local weights read them from the model directory they were
/// built with; a missing directory is an `Inference` error at completion time.
pub trait CompletionBackend: Send + Sync {
    /// Identifier of the loaded model, recorded in strategy descriptions.
    fn model_id(&self) -> &str;

    /// Where model weights are read from, if the backend uses local files.
    fn model_dir(&self) -> Option<&Path> {
        None
    }

    fn complete(&self, prompt: &str) -> ExtractionResult<String>;
}

static NUMBERED_START: Lazy<Regex> = Lazy::new(|| Regex::new(r"^1([.)])\s+\S").unwrap());
static BULLET_START: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([·•*-])\s?\S").unwrap());
static LEADING_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?:1[.)]|[·•*-])\s+").unwrap());
static SENTENCE_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.\s+|\.?\n\n").unwrap());
static INLINE_SEPARATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[;,] (?:and )?|[;,]? and ").unwrap());
static PARENTHETICAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*\([^)]+\)").unwrap());
static NEGATED: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^no\s+").unwrap());
static SLASH: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*/\s*").unwrap());

/// Parse a completion into a cleaned list of symptom terms.
///
/// JSON arrays are preferred; numbered, bulleted, LaTeX and inline lists are accepted
/// as a fallback since unconstrained models drift into prose.
pub fn parse_symptom_list(raw: &str) -> ExtractionResult<Vec<String>> {
    let values = match parse_json_array(raw) {
        Ok(values) => values,
        Err(_) => split_listlike_text(raw).ok_or_else(|| {
            ExtractionError::InvalidFormat("Output is neither a JSON array nor a list".into())
        })?,
    };

    let terms = cleanup_terms(values);
    if terms.is_empty() {
        return Err(ExtractionError::InvalidFormat(
            "No acceptable symptom terms in output".into(),
        ));
    }
    Ok(terms)
}

/// Find the outermost JSON array in the response and keep its string members.
pub fn parse_json_array(raw: &str) -> ExtractionResult<Vec<String>> {
    let start = raw
        .find('[')
        .ok_or_else(|| ExtractionError::InvalidFormat("No JSON array found in response".into()))?;
    let end = raw
        .rfind(']')
        .filter(|end| *end > start)
        .ok_or_else(|| ExtractionError::InvalidFormat("No closing bracket found in response".into()))?;

    let values: Vec<serde_json::Value> = serde_json::from_str(&raw[start..=end])?;
    Ok(values
        .into_iter()
        .filter_map(|v| match v {
            serde_json::Value::String(s) => Some(s),
            _ => None,
        })
        .collect())
}

/// Split list-like prose into raw values. Returns `None` if it doesn't look like a list.
pub fn split_listlike_text(raw: &str) -> Option<Vec<String>> {
    let text = raw.trim();

    if let Some(rest) = text.strip_prefix(r"\begin{itemize}") {
        let body = rest.split(r"\end{itemize}").next().unwrap_or(rest);
        return Some(non_empty(body.split(r"\item")));
    }

    if let Some(caps) = NUMBERED_START.captures(text) {
        let delim = &caps[1];
        if text.contains(&format!("2{}", delim)) {
            return split_numbered(text, delim);
        }
    }

    if let Some(caps) = BULLET_START.captures(text) {
        let bullet = caps[1].chars().next()?;
        let mut items = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line.strip_prefix(bullet) {
                Some(item) => items.push(item.trim().to_string()),
                None => break,
            }
        }
        if items.len() >= 2 {
            return Some(items);
        }
    }

    // Inline list within the first sentence, e.g. "fever, chills and cough."
    let stripped = LEADING_MARKER.replace(text, "");
    let first = SENTENCE_END.split(&stripped).next().unwrap_or("");
    if INLINE_SEPARATOR.find_iter(first).count() < 2 {
        return None;
    }
    Some(non_empty(INLINE_SEPARATOR.split(first)))
}

fn split_numbered(text: &str, delim: &str) -> Option<Vec<String>> {
    // ")" lists usually run inline and end with the sentence; "." lists end with the paragraph
    let end = if delim == ")" {
        SENTENCE_END.find(text).map(|m| m.start())
    } else {
        text.find("\n\n")
    };
    let body = &text[..end.unwrap_or(text.len())];

    let item_marker = Regex::new(&format!(
        r"(?:^|[;,]?\s+(?:and\s+)?)\d+{}\s+",
        regex::escape(delim)
    ))
    .ok()?;
    Some(non_empty(item_marker.split(body)))
}

fn non_empty<'a>(values: impl Iterator<Item = &'a str>) -> Vec<String> {
    values
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .collect()
}

/// Drop parentheticals and negations, split compound values, trim punctuation.
pub fn cleanup_terms(values: Vec<String>) -> Vec<String> {
    values
        .iter()
        .map(|v| PARENTHETICAL.replace_all(v, "").into_owned())
        .filter(|v| !NEGATED.is_match(v.trim_start()))
        .flat_map(|v| resplit(&v))
        .map(|v| v.trim_matches(|c| c == ' ' || c == '-' || c == '.').to_string())
        .filter(|v| is_acceptable_term(v))
        .collect()
}

fn resplit(value: &str) -> Vec<String> {
    let mut parts = Vec::new();
    for line in value.split('\n') {
        for piece in INLINE_SEPARATOR.split(line) {
            parts.extend(split_on_slashes(piece));
        }
    }
    parts
}

/// "nausea/vomiting" splits, "h/o" does not.
fn split_on_slashes(value: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut start = 0;
    for m in SLASH.find_iter(value) {
        let next = &value[m.end()..];
        if next.chars().take(2).filter(|c| c.is_ascii_alphabetic()).count() == 2 {
            parts.push(value[start..m.start()].to_string());
            start = m.end();
        }
    }
    parts.push(value[start..].to_string());
    parts
}

fn is_acceptable_term(value: &str) -> bool {
    !value.is_empty()
        && !NEGATED.is_match(value)
        && value.chars().any(|c| c.is_ascii_alphabetic())
}

/// Newline-joined storage form of a term list.
pub fn join_terms(terms: &[String]) -> String {
    terms.join("\n")
}

enum MockResponse {
    KeywordScan,
    Fixed(String),
    Fail(String),
}

/// Mock backend for testing without actual LLM inference.
pub struct MockBackend {
    model_id: String,
    response: MockResponse,
    model_dir: Option<PathBuf>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// Answers with a JSON array of symptoms found by keyword matching.
    pub fn new() -> Self {
        Self {
            model_id: "mock-keyword".into(),
            response: MockResponse::KeywordScan,
            model_dir: None,
        }
    }

    /// Always answers with `response`, verbatim.
    pub fn with_response(response: impl Into<String>) -> Self {
        Self {
            model_id: "mock-fixed".into(),
            response: MockResponse::Fixed(response.into()),
            model_dir: None,
        }
    }

    /// Always fails as if the runtime crashed.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            model_id: "mock-failing".into(),
            response: MockResponse::Fail(message.into()),
            model_dir: None,
        }
    }

    /// Require a model directory, as a backend with local weights would.
    pub fn with_model_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.model_dir = Some(dir.into());
        self
    }

    /// Extract symptoms using simple pattern matching (for testing).
    pub fn extract(history: &str) -> Vec<String> {
        let lower = history.to_lowercase();

        // Longer phrases first so "productive cough" claims its span before "cough"
        let patterns = [
            ("productive cough", "productive cough"),
            ("shortness of breath", "dyspnea"),
            ("abdominal pain", "abdominal pain"),
            ("chest pain", "chest pain"),
            ("dyspnea", "dyspnea"),
            ("fever", "fever"),
            ("febrile", "fever"),
            ("chills", "chills"),
            ("rigors", "chills"),
            ("cough", "cough"),
            ("nausea", "nausea"),
            ("vomiting", "vomiting"),
            ("diarrhea", "diarrhea"),
            ("headache", "headache"),
            ("dysuria", "dysuria"),
            ("confusion", "confusion"),
        ];

        let mut claimed: Vec<(usize, usize)> = Vec::new();
        let mut found: Vec<(usize, String)> = Vec::new();

        for (pattern, canonical) in patterns {
            for (pos, _) in lower.match_indices(pattern) {
                let end = pos + pattern.len();
                let starts_word = lower[..pos]
                    .chars()
                    .next_back()
                    .map_or(true, |c| !c.is_alphabetic());
                let overlaps = claimed.iter().any(|(s, e)| pos < *e && end > *s);
                if !starts_word || overlaps || is_negated(&lower[..pos]) {
                    continue;
                }
                claimed.push((pos, end));
                if !found.iter().any(|(_, c)| c == canonical) {
                    found.push((pos, canonical.to_string()));
                }
                break;
            }
        }

        found.sort_by_key(|(pos, _)| *pos);
        found.into_iter().map(|(_, term)| term).collect()
    }
}

/// Whether the clause leading up to a mention negates it.
fn is_negated(before: &str) -> bool {
    let clause = before.rsplit(['.', ';']).next().unwrap_or(before);
    clause
        .split(|c: char| !c.is_alphabetic())
        .any(|w| matches!(w, "no" | "denies" | "denied" | "without"))
}

impl CompletionBackend for MockBackend {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn model_dir(&self) -> Option<&Path> {
        self.model_dir.as_deref()
    }

    fn complete(&self, prompt: &str) -> ExtractionResult<String> {
        if let Some(dir) = &self.model_dir {
            if !dir.is_dir() {
                return Err(ExtractionError::Inference(format!(
                    "model directory {} not found",
                    dir.display()
                )));
            }
        }
        match &self.response {
            MockResponse::Fixed(response) => Ok(response.clone()),
            MockResponse::Fail(message) => Err(ExtractionError::Inference(message.clone())),
            MockResponse::KeywordScan => {
                let history = prompt
                    .rsplit_once(EXTRACTION_INSTRUCTIONS)
                    .map(|(_, h)| h)
                    .unwrap_or(prompt);
                let history = history.split("<|eot_id|>").next().unwrap_or("");
                Ok(serde_json::to_string(&Self::extract(history))?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompts::build_full_prompt;
    use proptest::prelude::*;

    #[test]
    fn test_parse_json_array() {
        let terms = parse_symptom_list(r#"["fever", "chills", "productive cough"]"#).unwrap();
        assert_eq!(terms, vec!["fever", "chills", "productive cough"]);
    }

    #[test]
    fn test_parse_json_array_with_prefix() {
        let raw = "Here are the symptoms:\n[\"fever\", \"cough (3 days)\"]\nLet me know.";
        let terms = parse_symptom_list(raw).unwrap();
        assert_eq!(terms, vec!["fever", "cough"]);
    }

    #[test]
    fn test_parse_numbered_list() {
        let raw = "1. Fever\n2. Chills\n3. Nausea/vomiting\n\nThese began two days ago.";
        let terms = parse_symptom_list(raw).unwrap();
        assert_eq!(terms, vec!["Fever", "Chills", "Nausea", "vomiting"]);
    }

    #[test]
    fn test_parse_inline_numbered_list() {
        let raw = "1) fever, 2) cough and 3) dyspnea. The patient also reports fatigue.";
        let terms = parse_symptom_list(raw).unwrap();
        assert_eq!(terms, vec!["fever", "cough", "dyspnea"]);
    }

    #[test]
    fn test_parse_bulleted_list() {
        let raw = "* fever\n* no chest pain\n* headache\nOther notes follow.";
        let terms = parse_symptom_list(raw).unwrap();
        assert_eq!(terms, vec!["fever", "headache"]);
    }

    #[test]
    fn test_parse_latex_list() {
        let raw = "\\begin{itemize}\n\\item fever\n\\item chills\n\\end{itemize}";
        let terms = parse_symptom_list(raw).unwrap();
        assert_eq!(terms, vec!["fever", "chills"]);
    }

    #[test]
    fn test_parse_inline_sentence() {
        let raw = "The patient presents with fever, rigors and confusion. No other complaints.";
        let terms = parse_symptom_list(raw).unwrap();
        assert_eq!(
            terms,
            vec!["The patient presents with fever", "rigors", "confusion"]
        );
    }

    #[test]
    fn test_parse_rejects_prose() {
        assert!(matches!(
            parse_symptom_list("I cannot answer that question."),
            Err(ExtractionError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_parse_rejects_empty_array() {
        assert!(parse_symptom_list("[]").is_err());
        assert!(parse_symptom_list(r#"["No symptoms", "123"]"#).is_err());
    }

    #[test]
    fn test_slash_split() {
        assert_eq!(split_on_slashes("nausea/vomiting"), vec!["nausea", "vomiting"]);
        assert_eq!(split_on_slashes("h/o stroke"), vec!["h/o stroke"]);
    }

    #[test]
    fn test_mock_backend_keyword_scan() {
        let backend = MockBackend::new();
        let prompt = build_full_prompt(
            "Presents with fever and productive cough. Denies chest pain. Had chills overnight.",
            true,
        );
        let raw = backend.complete(&prompt).unwrap();
        let terms = parse_symptom_list(&raw).unwrap();
        assert_eq!(terms, vec!["fever", "productive cough", "chills"]);
    }

    #[test]
    fn test_mock_extract_word_boundary() {
        assert!(MockBackend::extract("Afebrile on arrival").is_empty());
        assert_eq!(MockBackend::extract("Febrile to 39C"), vec!["fever"]);
    }

    #[test]
    fn test_mock_backend_fixed_and_failing() {
        assert_eq!(
            MockBackend::with_response("garbage").complete("x").unwrap(),
            "garbage"
        );
        assert!(matches!(
            MockBackend::failing("CUDA out of memory").complete("x"),
            Err(ExtractionError::Inference(_))
        ));
    }

    #[test]
    fn test_mock_backend_model_dir() {
        assert!(MockBackend::new().model_dir().is_none());

        let dir = std::env::temp_dir();
        let backend = MockBackend::with_response("[\"fever\"]").with_model_dir(&dir);
        assert_eq!(backend.model_dir(), Some(dir.as_path()));
        assert!(backend.complete("x").is_ok());

        let missing = MockBackend::new().with_model_dir(dir.join("chartlab-missing-model-dir"));
        assert!(matches!(missing.complete("x"), Err(ExtractionError::Inference(_))));
    }

    proptest! {
        #[test]
        fn parse_never_panics(raw in ".{0,200}") {
            let _ = parse_symptom_list(&raw);
        }

        #[test]
        fn cleaned_terms_are_acceptable(values in proptest::collection::vec(".{0,40}", 0..8)) {
            for term in cleanup_terms(values) {
                prop_assert!(term.chars().any(|c| c.is_ascii_alphabetic()));
                prop_assert!(!term.to_lowercase().starts_with("no "));
            }
        }
    }
}
