//! N-gram vocabularies and the label policy built on them.
//!
//! Each line of a feature value is searched for vocabulary n-grams, longest first, in
//! the manner of NLP backoff: a match consumes its tokens, otherwise the leading token
//! is dropped and the search resumes.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use super::{AggregationPolicy, DeriveError, DeriveResult, DerivedLabel};
use crate::models::NoteFeature;

/// Bundled presenting symptom vocabulary.
pub const PRESENTING_SX_VOCABULARY: &str = include_str!("../../vocabs/presenting_sx.toml");

/// Tokens shorter than this are never fuzzy matched.
const FUZZY_MIN_LEN: usize = 4;

static NON_ALNUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").expect("token pattern"));

#[derive(Debug, Deserialize)]
struct VocabularyFile {
    #[serde(default)]
    term: Vec<TermEntry>,
}

#[derive(Debug, Deserialize)]
struct TermEntry {
    canonical: String,
    ngrams: Vec<String>,
    #[serde(default)]
    combo: Option<String>,
}

/// Lowercase alphanumeric tokens of a line.
pub fn tokenize(line: &str) -> Vec<String> {
    NON_ALNUM
        .replace_all(&line.to_lowercase(), " ")
        .split_whitespace()
        .map(String::from)
        .collect()
}

/// Canonical terms and the n-grams that name them.
#[derive(Debug, Clone, Default)]
pub struct Vocabulary {
    /// Canonical term -> synonyms
    terms: BTreeMap<String, BTreeSet<String>>,
    /// N-gram tables, indexed by n - 1
    ngrams: Vec<BTreeMap<Vec<String>, Vec<String>>>,
}

impl Vocabulary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map an n-gram to a canonical term, and to `combo` as well when given.
    pub fn add_ngram(&mut self, ngram: &str, canonical: &str, combo: Option<&str>) -> DeriveResult<()> {
        let tokens = tokenize(ngram);
        if tokens.is_empty() || canonical.trim().is_empty() {
            return Err(DeriveError::Vocabulary(format!(
                "empty n-gram {:?} for term {:?}",
                ngram, canonical
            )));
        }

        let labels: Vec<&str> = std::iter::once(canonical).chain(combo).collect();
        for label in &labels {
            let synonyms = self.terms.entry(label.to_string()).or_default();
            synonyms.insert(label.to_string());
            synonyms.insert(tokens.join(" "));
        }

        let n = tokens.len();
        if self.ngrams.len() < n {
            self.ngrams.resize_with(n, BTreeMap::new);
        }
        let mapped = self.ngrams[n - 1].entry(tokens).or_default();
        for label in labels {
            if !mapped.iter().any(|m| m == label) {
                mapped.push(label.to_string());
            }
        }
        Ok(())
    }

    /// Parse a TOML vocabulary of `[[term]]` tables.
    pub fn from_toml_str(source: &str) -> DeriveResult<Self> {
        let file: VocabularyFile =
            toml::from_str(source).map_err(|e| DeriveError::Vocabulary(e.to_string()))?;

        let mut vocabulary = Self::new();
        for entry in &file.term {
            for ngram in &entry.ngrams {
                vocabulary.add_ngram(ngram, &entry.canonical, entry.combo.as_deref())?;
            }
        }
        Ok(vocabulary)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> DeriveResult<Self> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    /// The bundled presenting symptom vocabulary.
    pub fn presenting_sx() -> DeriveResult<Self> {
        Self::from_toml_str(PRESENTING_SX_VOCABULARY)
    }

    /// Canonical terms, sorted. Synonyms are omitted.
    pub fn terms(&self) -> impl Iterator<Item = &str> {
        self.terms.keys().map(String::as_str)
    }

    pub fn synonyms(&self, term: &str) -> Option<&BTreeSet<String>> {
        self.terms.get(term)
    }

    pub fn contains(&self, term: &str) -> bool {
        self.terms.contains_key(term)
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Longest n-gram length.
    pub fn max_n(&self) -> usize {
        self.ngrams.len()
    }

    /// Terms found in a newline-separated feature value, each with the earliest
    /// (1-based) line it was found on.
    pub fn find_terms(&self, feature_value: &str) -> BTreeMap<String, i64> {
        self.find_terms_with(feature_value, None)
    }

    /// As [`find_terms`](Self::find_terms), fuzzy matching otherwise unmatched tokens
    /// against unigrams with Jaro-Winkler similarity of at least `fuzzy_threshold`.
    pub fn find_terms_with(&self, feature_value: &str, fuzzy_threshold: Option<f64>) -> BTreeMap<String, i64> {
        let mut found = BTreeMap::new();
        let lines: Vec<&str> = feature_value.split('\n').collect();

        // Bottom-up, so earlier lines overwrite later ones
        for (line_idx, line) in lines.iter().enumerate().rev() {
            let line_number = line_idx as i64 + 1;
            let tokens = tokenize(line);
            let mut i = 0;
            while i < tokens.len() {
                match self.longest_match(&tokens[i..]) {
                    Some((n, terms)) => {
                        for term in terms {
                            found.insert(term.clone(), line_number);
                        }
                        i += n;
                    }
                    None => {
                        if let Some(terms) = fuzzy_threshold.and_then(|t| self.fuzzy_unigram(&tokens[i], t)) {
                            for term in terms {
                                found.insert(term.clone(), line_number);
                            }
                        }
                        i += 1;
                    }
                }
            }
        }
        found
    }

    fn longest_match(&self, tokens: &[String]) -> Option<(usize, &Vec<String>)> {
        (1..=self.ngrams.len().min(tokens.len()))
            .rev()
            .find_map(|n| self.ngrams[n - 1].get(&tokens[..n]).map(|terms| (n, terms)))
    }

    fn fuzzy_unigram(&self, token: &str, threshold: f64) -> Option<&Vec<String>> {
        if token.len() < FUZZY_MIN_LEN {
            return None;
        }
        let mut best: Option<(f64, &Vec<String>)> = None;
        for (key, terms) in self.ngrams.first()? {
            let score = strsim::jaro_winkler(token, &key[0]);
            if score >= threshold && best.map_or(true, |(b, _)| score > b) {
                best = Some((score, terms));
            }
        }
        best.map(|(_, terms)| terms)
    }
}

/// Labels an episode with the vocabulary terms in its earliest non-empty feature value.
///
/// Each found term becomes a label of value 1.0 whose line number is the earliest line
/// it appeared on.
#[derive(Debug, Clone)]
pub struct VocabPolicy {
    vocabulary: Arc<Vocabulary>,
    feature_name: String,
    whitelist: Option<BTreeSet<String>>,
    fuzzy_threshold: Option<f64>,
}

impl VocabPolicy {
    pub fn new(vocabulary: Arc<Vocabulary>, feature_name: impl Into<String>) -> Self {
        Self {
            vocabulary,
            feature_name: feature_name.into(),
            whitelist: None,
            fuzzy_threshold: None,
        }
    }

    /// Keep only these terms; everything else found is dropped.
    pub fn with_whitelist<I, S>(mut self, terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.whitelist = Some(terms.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_fuzzy_threshold(mut self, threshold: f64) -> Self {
        self.fuzzy_threshold = Some(threshold);
        self
    }
}

impl AggregationPolicy for VocabPolicy {
    fn name(&self) -> &str {
        "vocab"
    }

    fn aggregate(&self, features: &[NoteFeature]) -> Vec<DerivedLabel> {
        let Some((feature, value)) = features.iter().find_map(|f| {
            let value = f.feature_value.as_deref()?;
            (f.feature_name == self.feature_name && !value.trim().is_empty()).then_some((f, value))
        }) else {
            return Vec::new();
        };

        self.vocabulary
            .find_terms_with(value, self.fuzzy_threshold)
            .into_iter()
            .filter(|(term, _)| self.whitelist.as_ref().map_or(true, |w| w.contains(term)))
            .map(|(label_name, line_number)| DerivedLabel {
                label_name,
                label_value: 1.0,
                note_feature_id: Some(feature.id),
                line_number: Some(line_number),
            })
            .collect()
    }

    fn label_names(&self) -> Option<BTreeSet<String>> {
        match &self.whitelist {
            Some(whitelist) => Some(whitelist.clone()),
            None => Some(self.vocabulary.terms().map(String::from).collect()),
        }
    }
}
