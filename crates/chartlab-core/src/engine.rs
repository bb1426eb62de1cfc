//! Extraction engine: runs strategies over notes and persists their output idempotently.
//!
//! At most one feature row exists per (note, feature name, strategy). The engine checks
//! before invoking a strategy, and a lost race against another worker surfaces as a
//! UNIQUE conflict that is absorbed and reported as `SkippedExisting`.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, CachedInvocation, NoCache, ResultCache};
use crate::db::{Database, DbError};
use crate::models::{InputUnit, NewNoteFeature, Note, NoteFeature, NoteId, Section, StrategyId};
use crate::registry::StrategyHandle;
use crate::strategy::{ExtractorError, FeatureExtractor, FeatureSchema, Implementation, SectionSegmenter};

/// Engine errors. Strategy failures are not errors; they are persisted.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Store error: {0}")]
    Store(#[from] DbError),

    #[error("Infrastructure failure: {0}")]
    Infrastructure(String),

    #[error("Strategy {strategy} is a {found}, expected a {expected}")]
    WrongKind {
        strategy: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Note {0} not found")]
    MissingNote(NoteId),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// What to do when a strategy already has output for a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdempotencyPolicy {
    /// Leave existing rows alone and don't invoke the strategy.
    #[default]
    Skip,
    /// Invoke again and replace existing rows.
    Overwrite,
}

/// Engine configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub policy: IdempotencyPolicy,
    /// Under `Skip`, rows extracted before this instant are redone anyway.
    pub stale_before: Option<DateTime<Utc>>,
    /// Ceiling on a single strategy invocation.
    pub timeout: Option<Duration>,
}

/// Result of one feature extraction.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractOutcome {
    Extracted(Vec<NoteFeature>),
    /// The strategy's output was unusable; rows hold the raw output and null values.
    Failed(Vec<NoteFeature>),
    /// Nothing written. `conflict` is set when a concurrent writer got there first.
    SkippedExisting { conflict: bool },
}

/// Result of one segmentation.
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentOutcome {
    Segmented(Vec<Section>),
    /// The segmenter found no sections.
    Empty,
    Failed(String),
    SkippedExisting { conflict: bool },
}

enum Decision {
    Skip,
    /// Insert only these names, or everything when `None`.
    Insert(Option<BTreeSet<String>>),
    Replace,
}

/// Runs strategies and writes their output.
pub struct ExtractionEngine {
    options: EngineOptions,
    cache: Box<dyn ResultCache>,
}

impl Default for ExtractionEngine {
    fn default() -> Self {
        Self::new(EngineOptions::default())
    }
}

impl ExtractionEngine {
    pub fn new(options: EngineOptions) -> Self {
        Self {
            options,
            cache: Box::new(NoCache),
        }
    }

    /// Use a read-through cache for strategy invocations.
    pub fn with_cache(mut self, cache: Box<dyn ResultCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Run a feature strategy over a unit and persist the result.
    pub fn extract(
        &self,
        db: &mut Database,
        unit: &InputUnit,
        handle: &StrategyHandle,
    ) -> EngineResult<ExtractOutcome> {
        let extractor = extractor_of(handle)?;
        let record = db.get_or_register_strategy(&handle.task, &handle.strategy_def())?;
        let note_id = unit.note_id();
        let schema = extractor.schema();

        let existing = db.existing_features(note_id, record.id)?;
        let decision = self.decide(&schema, &existing);
        let only = match &decision {
            Decision::Skip => {
                debug!(note = %note_id, strategy = %handle.qualified_name(), "already extracted");
                return Ok(ExtractOutcome::SkippedExisting { conflict: false });
            }
            Decision::Insert(only) => only.clone(),
            Decision::Replace => None,
        };
        let replace = matches!(decision, Decision::Replace);

        let invocation = self.invoke_cached(extractor, unit, record.id, !replace)?;
        let failed = invocation.failure_reason.is_some();
        if let Some(reason) = &invocation.failure_reason {
            warn!(note = %note_id, strategy = %handle.qualified_name(), %reason, "unusable strategy output");
        }

        let mut rows = build_rows(&schema, &invocation, unit, record.id);
        if let Some(only) = only {
            rows.retain(|row| only.contains(&row.feature_name));
        }

        let written = if replace {
            db.upsert_features(&rows)
        } else {
            db.insert_features(&rows)
        };

        match written {
            Ok(features) if failed => Ok(ExtractOutcome::Failed(features)),
            Ok(features) => {
                debug!(note = %note_id, strategy = %handle.qualified_name(), rows = features.len(), "extracted");
                Ok(ExtractOutcome::Extracted(features))
            }
            Err(e) if e.is_duplicate() => {
                info!(note = %note_id, strategy = %handle.qualified_name(), "concurrent extraction won; conflict absorbed");
                Ok(ExtractOutcome::SkippedExisting { conflict: true })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Build the input unit a strategy runs over for a note.
    ///
    /// `None` when the strategy reads a section the note doesn't have yet.
    pub fn unit_for_note(
        &self,
        db: &Database,
        note_id: NoteId,
        handle: &StrategyHandle,
    ) -> EngineResult<Option<InputUnit>> {
        let extractor = extractor_of(handle)?;
        let note = db.get_note(note_id)?.ok_or(EngineError::MissingNote(note_id))?;
        match extractor.input_section() {
            None => Ok(Some(InputUnit::from_note(&note))),
            Some(section_name) => Ok(db
                .list_sections_for_note(note_id, section_name)?
                .first()
                .map(InputUnit::from_section)),
        }
    }

    /// Run a segmentation strategy over a note and persist its sections.
    ///
    /// Sections are referenced by features, so existing sections are never replaced.
    pub fn segment(
        &self,
        db: &mut Database,
        note: &Note,
        handle: &StrategyHandle,
    ) -> EngineResult<SegmentOutcome> {
        let segmenter = segmenter_of(handle)?;
        let record = db.get_or_register_strategy(&handle.task, &handle.strategy_def())?;

        if db.sections_exist(note.id, record.id)? {
            debug!(note = %note.id, strategy = %handle.qualified_name(), "already segmented");
            return Ok(SegmentOutcome::SkippedExisting { conflict: false });
        }

        let text = note.note_text.clone();
        let sections = match self.run_with_timeout(move || segmenter.segment(&text))? {
            Ok(sections) => sections,
            Err(ExtractorError::Unusable { reason, .. }) => {
                warn!(note = %note.id, strategy = %handle.qualified_name(), %reason, "segmentation failed");
                return Ok(SegmentOutcome::Failed(reason));
            }
            Err(ExtractorError::Infrastructure(msg)) => return Err(EngineError::Infrastructure(msg)),
        };
        if sections.is_empty() {
            return Ok(SegmentOutcome::Empty);
        }

        match db.insert_sections(note.id, record.id, &sections) {
            Ok(written) => Ok(SegmentOutcome::Segmented(written)),
            Err(e) if e.is_duplicate() => {
                info!(note = %note.id, strategy = %handle.qualified_name(), "concurrent segmentation won; conflict absorbed");
                Ok(SegmentOutcome::SkippedExisting { conflict: true })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn decide(&self, schema: &FeatureSchema, existing: &[(String, String)]) -> Decision {
        if self.options.policy == IdempotencyPolicy::Overwrite {
            return Decision::Replace;
        }
        if existing.is_empty() {
            return Decision::Insert(None);
        }
        if let Some(cutoff) = self.options.stale_before {
            let stale = existing.iter().any(|(_, extracted_at)| {
                DateTime::parse_from_rfc3339(extracted_at)
                    .map_or(true, |t| t.with_timezone(&Utc) < cutoff)
            });
            if stale {
                return Decision::Replace;
            }
        }
        match schema {
            FeatureSchema::Fixed(names) => {
                let have: BTreeSet<&str> = existing.iter().map(|(n, _)| n.as_str()).collect();
                let missing: BTreeSet<String> = names
                    .iter()
                    .filter(|n| !have.contains(n.as_str()))
                    .cloned()
                    .collect();
                if missing.is_empty() {
                    Decision::Skip
                } else {
                    Decision::Insert(Some(missing))
                }
            }
            FeatureSchema::Derived { .. } => Decision::Skip,
        }
    }

    fn invoke_cached(
        &self,
        extractor: Arc<dyn FeatureExtractor>,
        unit: &InputUnit,
        strategy_id: StrategyId,
        read_cache: bool,
    ) -> EngineResult<CachedInvocation> {
        let key = CacheKey::new(unit, strategy_id);
        if read_cache {
            match self.cache.get(&key) {
                Ok(Some(hit)) => {
                    debug!(unit = unit.unit_id(), kind = unit.kind(), "cache hit");
                    return Ok(hit);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "cache read failed; invoking strategy"),
            }
        }

        let invocation = self.invoke(extractor, unit.text())?;
        if let Err(e) = self.cache.put(&key, &invocation) {
            warn!(error = %e, "cache write failed");
        }
        Ok(invocation)
    }

    fn invoke(&self, extractor: Arc<dyn FeatureExtractor>, text: &str) -> EngineResult<CachedInvocation> {
        let started = Instant::now();
        let text = text.to_string();
        let result = self.run_with_timeout(move || extractor.extract(&text))?;
        let runtime_secs = started.elapsed().as_secs_f64();

        match result {
            Ok(output) => Ok(CachedInvocation {
                raw_output: output.raw_output,
                values: output.values,
                failure_reason: None,
                runtime_secs,
            }),
            Err(ExtractorError::Unusable { raw_output, reason }) => Ok(CachedInvocation {
                raw_output,
                values: Vec::new(),
                failure_reason: Some(reason),
                runtime_secs,
            }),
            Err(ExtractorError::Infrastructure(msg)) => Err(EngineError::Infrastructure(msg)),
        }
    }

    /// Run `f`, on a helper thread when a timeout is configured.
    ///
    /// A timed-out thread is abandoned; it cannot write to the store.
    fn run_with_timeout<T, F>(&self, f: F) -> EngineResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let Some(limit) = self.options.timeout else {
            return Ok(f());
        };

        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("strategy-invocation".into())
            .spawn(move || {
                let _ = tx.send(f());
            })
            .map_err(|e| EngineError::Infrastructure(format!("could not start strategy thread: {}", e)))?;

        match rx.recv_timeout(limit) {
            Ok(value) => Ok(value),
            Err(RecvTimeoutError::Timeout) => Err(EngineError::Infrastructure(format!(
                "strategy did not answer within {:?}",
                limit
            ))),
            Err(RecvTimeoutError::Disconnected) => {
                Err(EngineError::Infrastructure("strategy thread panicked".into()))
            }
        }
    }
}

fn extractor_of(handle: &StrategyHandle) -> EngineResult<Arc<dyn FeatureExtractor>> {
    match &handle.implementation {
        Implementation::Extractor(e) => Ok(Arc::clone(e)),
        other => Err(EngineError::WrongKind {
            strategy: handle.qualified_name(),
            expected: "extractor",
            found: other.kind(),
        }),
    }
}

fn segmenter_of(handle: &StrategyHandle) -> EngineResult<Arc<dyn SectionSegmenter>> {
    match &handle.implementation {
        Implementation::Segmenter(s) => Ok(Arc::clone(s)),
        other => Err(EngineError::WrongKind {
            strategy: handle.qualified_name(),
            expected: "segmenter",
            found: other.kind(),
        }),
    }
}

fn build_rows(
    schema: &FeatureSchema,
    invocation: &CachedInvocation,
    unit: &InputUnit,
    strategy_id: StrategyId,
) -> Vec<NewNoteFeature> {
    let row = |feature_name: String, feature_value: Option<String>| NewNoteFeature {
        note_id: unit.note_id(),
        section_id: unit.section_id(),
        strategy_id,
        feature_name,
        raw_output: invocation.raw_output.clone(),
        feature_value,
        runtime_secs: invocation.runtime_secs,
    };

    if invocation.failure_reason.is_some() {
        return schema.failure_names().into_iter().map(|name| row(name, None)).collect();
    }

    let mut rows: Vec<NewNoteFeature> = Vec::new();
    let mut seen = BTreeSet::new();
    for (name, value) in &invocation.values {
        if seen.insert(name.clone()) {
            rows.push(row(name.clone(), value.clone()));
        }
    }

    match schema {
        FeatureSchema::Fixed(names) => {
            for name in names {
                if !seen.contains(name) {
                    rows.push(row(name.clone(), None));
                }
            }
        }
        FeatureSchema::Derived { fallback } => {
            if rows.is_empty() {
                rows.push(row(fallback.clone(), None));
            }
        }
    }
    rows
}
