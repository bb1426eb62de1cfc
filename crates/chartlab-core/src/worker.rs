//! Splitting extraction runs across independent worker processes.
//!
//! Workers share nothing but the store. Each gets a contiguous slice of note ids, an id
//! file to read them from, and optionally a private result cache.

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::CacheError;
use crate::db::{Database, DbError};
use crate::engine::{EngineError, ExtractOutcome, ExtractionEngine, SegmentOutcome};
use crate::models::NoteId;
use crate::registry::StrategyHandle;

/// Note ids handed to one worker when splitting by size.
pub const DEFAULT_IDS_PER_WORKER: usize = 100;

/// Worker command used when none is configured.
pub const DEFAULT_COMMAND_TEMPLATE: &str =
    "chartlab extract-features --strategy {strategy} --ids-file {ids_file} --cache {cache}";

/// Worker errors.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid id {token:?} in {path}")]
    InvalidId { path: String, token: String },

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Invalid worker plan: {0}")]
    InvalidPlan(String),
}

pub type WorkerResult<T> = Result<T, WorkerError>;

/// Split ids into at most `worker_count` contiguous chunks whose sizes differ by at
/// most one. Ids are sorted and deduplicated first; empty chunks are dropped.
pub fn partition<T: Ord + Copy>(ids: &[T], worker_count: usize) -> Vec<Vec<T>> {
    let ids = sorted_unique(ids);
    if ids.is_empty() || worker_count == 0 {
        return Vec::new();
    }

    let chunks = worker_count.min(ids.len());
    let base = ids.len() / chunks;
    let extra = ids.len() % chunks;

    let mut out = Vec::with_capacity(chunks);
    let mut start = 0;
    for i in 0..chunks {
        let len = base + usize::from(i < extra);
        out.push(ids[start..start + len].to_vec());
        start += len;
    }
    out
}

/// Split ids into chunks of `ids_per_worker`, the last one possibly shorter.
pub fn chunk_by_size<T: Ord + Copy>(ids: &[T], ids_per_worker: usize) -> Vec<Vec<T>> {
    sorted_unique(ids)
        .chunks(ids_per_worker.max(1))
        .map(<[T]>::to_vec)
        .collect()
}

fn sorted_unique<T: Ord + Copy>(ids: &[T]) -> Vec<T> {
    let mut ids = ids.to_vec();
    ids.sort_unstable();
    ids.dedup();
    ids
}

/// Where a worker keeps its result cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CacheLocation {
    Private(PathBuf),
    NoCache,
}

impl CacheLocation {
    /// Parse a command-line value; `none` disables caching.
    pub fn from_arg(value: &str) -> Self {
        if value.eq_ignore_ascii_case("none") {
            CacheLocation::NoCache
        } else {
            CacheLocation::Private(PathBuf::from(value))
        }
    }
}

impl fmt::Display for CacheLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheLocation::Private(path) => write!(f, "{}", path.display()),
            CacheLocation::NoCache => write!(f, "none"),
        }
    }
}

/// One worker's share of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerAssignment {
    pub worker: usize,
    pub ids: Vec<i64>,
    pub ids_file: PathBuf,
    pub cache: CacheLocation,
    pub command: String,
}

/// A run split into worker assignments.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerPlan {
    pub run_id: String,
    pub dir: PathBuf,
    pub workers: Vec<WorkerAssignment>,
}

impl WorkerPlan {
    /// Plan a run over `ids` for `worker_count` workers.
    ///
    /// Id files go under `out_dir/run.<run_id>`. With a `cache_root`, each worker gets
    /// its own cache file under `cache_root/<run_id>`.
    pub fn new(
        ids: &[i64],
        worker_count: usize,
        out_dir: &Path,
        cache_root: Option<&Path>,
        command_template: &str,
    ) -> WorkerResult<Self> {
        if worker_count == 0 {
            return Err(WorkerError::InvalidPlan("worker count must be at least 1".into()));
        }
        Ok(Self::from_chunks(partition(ids, worker_count), out_dir, cache_root, command_template))
    }

    /// Plan a run with `ids_per_worker` ids per worker.
    pub fn by_size(
        ids: &[i64],
        ids_per_worker: usize,
        out_dir: &Path,
        cache_root: Option<&Path>,
        command_template: &str,
    ) -> Self {
        Self::from_chunks(chunk_by_size(ids, ids_per_worker), out_dir, cache_root, command_template)
    }

    fn from_chunks(chunks: Vec<Vec<i64>>, out_dir: &Path, cache_root: Option<&Path>, template: &str) -> Self {
        let run_id = Uuid::new_v4().simple().to_string();
        let dir = out_dir.join(format!("run.{}", run_id));

        let workers = chunks
            .into_iter()
            .enumerate()
            .map(|(worker, ids)| {
                let ids_file = dir.join(format!("job.{}.{}.ids", run_id, worker));
                let cache = match cache_root {
                    Some(root) => CacheLocation::Private(root.join(&run_id).join(format!("worker.{}.sqlite", worker))),
                    None => CacheLocation::NoCache,
                };
                let command = render_command(template, &ids_file, &cache, worker);
                WorkerAssignment {
                    worker,
                    ids,
                    ids_file,
                    cache,
                    command,
                }
            })
            .collect();

        Self { run_id, dir, workers }
    }

    /// Write every worker's id file.
    pub fn write_id_files(&self) -> WorkerResult<()> {
        std::fs::create_dir_all(&self.dir)?;
        for assignment in &self.workers {
            write_ids_file(&assignment.ids_file, &assignment.ids)?;
        }
        info!(run = %self.run_id, workers = self.workers.len(), dir = %self.dir.display(), "worker id files written");
        Ok(())
    }
}

/// Fill `{ids_file}`, `{cache}` and `{worker}` in a command template.
pub fn render_command(template: &str, ids_file: &Path, cache: &CacheLocation, worker: usize) -> String {
    template
        .replace("{ids_file}", &ids_file.display().to_string())
        .replace("{cache}", &cache.to_string())
        .replace("{worker}", &worker.to_string())
}

/// Write ids separated by whitespace, ten to a line.
pub fn write_ids_file<P: AsRef<Path>>(path: P, ids: &[i64]) -> WorkerResult<()> {
    let mut contents = String::new();
    for line in ids.chunks(10) {
        let line: Vec<String> = line.iter().map(i64::to_string).collect();
        contents.push_str(&line.join(" "));
        contents.push('\n');
    }
    std::fs::write(path, contents)?;
    Ok(())
}

/// Read whitespace-separated ids.
pub fn read_ids_file<P: AsRef<Path>>(path: P) -> WorkerResult<Vec<i64>> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)?;
    contents
        .split_whitespace()
        .map(|token| {
            token.parse().map_err(|_| WorkerError::InvalidId {
                path: path.display().to_string(),
                token: token.to_string(),
            })
        })
        .collect()
}

/// Totals from one worker run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub extracted: usize,
    /// Units whose strategy output was unusable; recorded as null-value rows
    pub strategy_failures: usize,
    pub skipped_existing: usize,
    /// Units with nothing to run over, e.g. no input section
    pub missing_input: usize,
    /// Segmentations that found no sections
    pub empty: usize,
    pub conflicts_absorbed: usize,
    /// (note id, message) for units aborted by infrastructure faults
    pub infrastructure_failures: Vec<(NoteId, String)>,
}

impl RunSummary {
    pub fn units(&self) -> usize {
        self.extracted
            + self.strategy_failures
            + self.skipped_existing
            + self.missing_input
            + self.empty
            + self.infrastructure_failures.len()
    }

    /// No unit hit an infrastructure fault.
    pub fn is_clean(&self) -> bool {
        self.infrastructure_failures.is_empty()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} extracted, {} strategy failures, {} skipped ({} conflicts), {} missing input, {} empty, {} infrastructure failures",
            self.extracted,
            self.strategy_failures,
            self.skipped_existing,
            self.conflicts_absorbed,
            self.missing_input,
            self.empty,
            self.infrastructure_failures.len()
        )
    }
}

/// Faults that stop the whole run rather than one unit.
fn is_fatal(e: &EngineError) -> bool {
    matches!(
        e,
        EngineError::WrongKind { .. } | EngineError::Store(DbError::ForeignKey(_))
    )
}

/// Run a feature strategy over each note, one unit at a time.
///
/// Infrastructure faults abort only the unit they hit and are collected in the summary.
pub fn run_worker(
    db: &mut Database,
    engine: &ExtractionEngine,
    handle: &StrategyHandle,
    note_ids: &[NoteId],
) -> WorkerResult<RunSummary> {
    let mut summary = RunSummary::default();

    for &note_id in note_ids {
        let outcome = engine
            .unit_for_note(db, note_id, handle)
            .and_then(|unit| match unit {
                Some(unit) => engine.extract(db, &unit, handle).map(Some),
                None => Ok(None),
            });

        match outcome {
            Ok(Some(ExtractOutcome::Extracted(_))) => summary.extracted += 1,
            Ok(Some(ExtractOutcome::Failed(_))) => summary.strategy_failures += 1,
            Ok(Some(ExtractOutcome::SkippedExisting { conflict })) => {
                summary.skipped_existing += 1;
                summary.conflicts_absorbed += usize::from(conflict);
            }
            Ok(None) => {
                debug!(note = %note_id, strategy = %handle.qualified_name(), "no input section");
                summary.missing_input += 1;
            }
            Err(e) if is_fatal(&e) => return Err(e.into()),
            Err(e) => {
                warn!(note = %note_id, strategy = %handle.qualified_name(), error = %e, "unit aborted");
                summary.infrastructure_failures.push((note_id, e.to_string()));
            }
        }
    }

    info!(strategy = %handle.qualified_name(), %summary, "worker finished");
    Ok(summary)
}

/// Run a segmentation strategy over each note.
pub fn run_segmentation(
    db: &mut Database,
    engine: &ExtractionEngine,
    handle: &StrategyHandle,
    note_ids: &[NoteId],
) -> WorkerResult<RunSummary> {
    let mut summary = RunSummary::default();

    for &note_id in note_ids {
        let Some(note) = db.get_note(note_id)? else {
            summary.missing_input += 1;
            continue;
        };
        match engine.segment(db, &note, handle) {
            Ok(SegmentOutcome::Segmented(_)) => summary.extracted += 1,
            Ok(SegmentOutcome::Empty) => summary.empty += 1,
            Ok(SegmentOutcome::Failed(_)) => summary.strategy_failures += 1,
            Ok(SegmentOutcome::SkippedExisting { conflict }) => {
                summary.skipped_existing += 1;
                summary.conflicts_absorbed += usize::from(conflict);
            }
            Err(e) if is_fatal(&e) => return Err(e.into()),
            Err(e) => {
                warn!(note = %note_id, strategy = %handle.qualified_name(), error = %e, "unit aborted");
                summary.infrastructure_failures.push((note_id, e.to_string()));
            }
        }
    }

    info!(strategy = %handle.qualified_name(), %summary, "segmentation finished");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewEpisode, NewNote, OutputType, TaskDef, ValueKind};
    use crate::registry::StrategyRegistry;
    use crate::strategies::{HpiRegexSegmenter, RegexSymptomExtractor};
    use crate::strategy::Implementation;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn test_partition_balanced() {
        let chunks = partition(&[5, 3, 1, 2, 4, 3, 7], 4);
        assert_eq!(chunks, vec![vec![1, 2], vec![3, 4], vec![5], vec![7]]);
    }

    #[test]
    fn test_partition_drops_empty_chunks() {
        assert_eq!(partition(&[9, 8], 5), vec![vec![8], vec![9]]);
        assert!(partition::<i64>(&[], 3).is_empty());
        assert!(partition(&[1, 2], 0).is_empty());
    }

    #[test]
    fn test_chunk_by_size() {
        let ids: Vec<i64> = (1..=250).collect();
        let chunks = chunk_by_size(&ids, DEFAULT_IDS_PER_WORKER);
        assert_eq!(chunks.iter().map(Vec::len).collect::<Vec<_>>(), vec![100, 100, 50]);
    }

    #[test]
    fn test_plan_writes_readable_id_files() {
        let dir = tempfile::tempdir().unwrap();
        let ids: Vec<i64> = (1..=25).collect();
        let plan = WorkerPlan::new(&ids, 2, dir.path(), Some(&dir.path().join("cache")), "run {ids_file} {cache} {worker}")
            .unwrap();
        plan.write_id_files().unwrap();

        assert_eq!(plan.workers.len(), 2);
        let first = &plan.workers[0];
        assert_eq!(read_ids_file(&first.ids_file).unwrap(), (1..=13).collect::<Vec<_>>());
        assert!(first
            .ids_file
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(&format!("job.{}.", plan.run_id)));
        assert!(first.command.ends_with(" 0"));
        assert!(first.command.contains("worker.0.sqlite"));
        assert_ne!(plan.workers[0].cache, plan.workers[1].cache);
    }

    #[test]
    fn test_plan_without_cache() {
        let dir = tempfile::tempdir().unwrap();
        let plan = WorkerPlan::by_size(&[1, 2, 3], 2, dir.path(), None, "--cache {cache}");
        assert_eq!(plan.workers.len(), 2);
        assert!(plan.workers.iter().all(|w| w.command == "--cache none"));
        assert!(WorkerPlan::new(&[1], 0, dir.path(), None, "").is_err());
    }

    #[test]
    fn test_read_ids_file_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.ids");
        std::fs::write(&path, "1 2\n3 x4\n").unwrap();
        assert!(matches!(read_ids_file(&path), Err(WorkerError::InvalidId { token, .. }) if token == "x4"));
    }

    #[test]
    fn test_cache_location_arg() {
        assert_eq!(CacheLocation::from_arg("NONE"), CacheLocation::NoCache);
        assert_eq!(CacheLocation::from_arg("/tmp/c.sqlite").to_string(), "/tmp/c.sqlite");
    }

    fn registry() -> (StrategyRegistry, StrategyHandle, StrategyHandle) {
        let mut registry = StrategyRegistry::new();
        registry.register_task(TaskDef::new("hpi_short", OutputType::Section, ValueKind::Binary));
        registry.register_task(TaskDef::new("symptom_flags", OutputType::Feature, ValueKind::Binary));
        let segmenter = registry
            .register("hpi_short", "regex", "1", Implementation::Segmenter(Arc::new(HpiRegexSegmenter)))
            .unwrap();
        let extractor = registry
            .register(
                "symptom_flags",
                "regex",
                "1",
                Implementation::Extractor(Arc::new(RegexSymptomExtractor::new())),
            )
            .unwrap();
        (registry, segmenter, extractor)
    }

    #[test]
    fn test_run_worker_summary() {
        let mut db = Database::open_in_memory().unwrap();
        let episode = db.insert_episode(&NewEpisode::new("MRN001")).unwrap();
        let first = db.insert_note(&NewNote::new(episode, "n1", "Fever and cough.")).unwrap();
        let second = db.insert_note(&NewNote::new(episode, "n2", "Headache.")).unwrap();
        let (_registry, segmenter, extractor) = registry();
        let engine = ExtractionEngine::default();

        let summary = run_worker(&mut db, &engine, &extractor, &[first, second, NoteId(99)]).unwrap();
        assert_eq!(summary.extracted, 2);
        assert_eq!(summary.infrastructure_failures.len(), 1);
        assert_eq!(summary.infrastructure_failures[0].0, NoteId(99));

        let again = run_worker(&mut db, &engine, &extractor, &[first, second]).unwrap();
        assert_eq!(again.skipped_existing, 2);
        assert_eq!(again.units(), 2);
        assert!(again.is_clean());

        // A segmenter is not an extractor
        assert!(matches!(
            run_worker(&mut db, &engine, &segmenter, &[first]),
            Err(WorkerError::Engine(EngineError::WrongKind { .. }))
        ));
    }

    #[test]
    fn test_run_segmentation_summary() {
        let mut db = Database::open_in_memory().unwrap();
        let episode = db.insert_episode(&NewEpisode::new("MRN001")).unwrap();
        let with_hpi = db
            .insert_note(&NewNote::new(episode, "n1", "HPI: Three days of fever.\nPhysical Exam: normal"))
            .unwrap();
        let without = db.insert_note(&NewNote::new(episode, "n2", "Discharge summary")).unwrap();
        let (_registry, segmenter, _) = registry();
        let engine = ExtractionEngine::default();

        let summary = run_segmentation(&mut db, &engine, &segmenter, &[with_hpi, without]).unwrap();
        assert_eq!(summary.extracted, 1);
        assert_eq!(summary.empty, 1);
    }

    proptest! {
        #[test]
        fn prop_partition_covers_disjoint_balanced(ids in proptest::collection::vec(0i64..500, 0..200), workers in 1usize..20) {
            let chunks = partition(&ids, workers);
            let expected = sorted_unique(&ids);

            let flat: Vec<i64> = chunks.iter().flatten().copied().collect();
            prop_assert_eq!(&flat, &expected);
            prop_assert!(chunks.len() <= workers);
            prop_assert!(chunks.iter().all(|c| !c.is_empty()));

            let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
            if let (Some(min), Some(max)) = (sizes.iter().min(), sizes.iter().max()) {
                prop_assert!(max - min <= 1);
            }
            prop_assert_eq!(partition(&ids, workers), chunks);
        }
    }
}
