//! The standard task and strategy set, and the `Chartlab` object the command line drives.

use chartlab_llm::{CompletionBackend, MockBackend};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::{ResultCache, SqliteCache};
use crate::config::Config;
use crate::db::Database;
use crate::derive::{
    import_human_labels_file, DeriveSummary, Deriver, ImportSummary, MentionCountPolicy, PresencePolicy, VocabPolicy,
    Vocabulary,
};
use crate::engine::{EngineOptions, ExtractionEngine, IdempotencyPolicy};
use crate::evaluate::{evaluate_with_universe, EvalOptions, EvaluationReport};
use crate::models::{EpisodeId, NoteId, OutputType, StrategyId, TaskDef, TaskId, ValueKind};
use crate::registry::{StrategyHandle, StrategyRegistry};
use crate::strategies::{
    HpiRegexSegmenter, LlmSymptomExtractor, RegexSymptomExtractor, HPI_SHORT, PRESENTING_SX, SYMPTOM_PREFIX,
};
use crate::strategy::Implementation;
use crate::worker::{run_segmentation, run_worker, CacheLocation, RunSummary, WorkerPlan};
use crate::{ChartlabError, Result};

pub const TASK_HPI_SHORT: &str = HPI_SHORT;
pub const TASK_PRESENTING_SX: &str = PRESENTING_SX;
pub const TASK_SYMPTOM_FLAGS: &str = "symptom_flags";
pub const TASK_PRES_SX_EPLAB: &str = "pres_sx_eplab";
pub const TASK_PRES_SX_EPLAB_TOP: &str = "pres_sx_eplab_top";
pub const TASK_SYMPTOM_PRESENCE: &str = "symptom_presence";
pub const TASK_SYMPTOM_MENTIONS: &str = "symptom_mentions";

/// (episode label task, feature task it is derived from)
pub const LABEL_SOURCES: &[(&str, &str)] = &[
    (TASK_PRES_SX_EPLAB, TASK_PRESENTING_SX),
    (TASK_PRES_SX_EPLAB_TOP, TASK_PRESENTING_SX),
    (TASK_SYMPTOM_PRESENCE, TASK_SYMPTOM_FLAGS),
    (TASK_SYMPTOM_MENTIONS, TASK_SYMPTOM_FLAGS),
];

/// Most frequent presenting symptoms, the vocabulary of `pres_sx_eplab_top`.
pub const TOP_SYMPTOMS: &[&str] = &[
    "fever",
    "chills",
    "cough",
    "dyspnea",
    "chest pain",
    "abdominal pain",
    "nausea",
    "vomiting",
    "diarrhea",
    "headache",
    "confusion",
    "fatigue",
];

static NOTE_SEPARATOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^#{10,}[ \t\r]*$").expect("note separator pattern"));

/// Registry with every standard task, strategy and aggregation.
pub fn default_registry(backend: Arc<dyn CompletionBackend>) -> Result<StrategyRegistry> {
    let mut registry = StrategyRegistry::new();

    registry.register_task(
        TaskDef::new(TASK_HPI_SHORT, OutputType::Section, ValueKind::Binary)
            .with_description("Short history of present illness"),
    );
    registry.register_task(
        TaskDef::new(TASK_PRESENTING_SX, OutputType::Feature, ValueKind::Binary)
            .with_description("Presenting symptoms as free text, one per line"),
    );
    registry.register_task(
        TaskDef::new(TASK_SYMPTOM_FLAGS, OutputType::Feature, ValueKind::Binary)
            .with_description("One present/absent flag per tracked symptom"),
    );
    registry.register_task(
        TaskDef::new(TASK_PRES_SX_EPLAB, OutputType::EpisodeLabel, ValueKind::Binary)
            .with_description("Presenting symptoms mapped onto the symptom vocabulary"),
    );
    registry.register_task(
        TaskDef::new(TASK_PRES_SX_EPLAB_TOP, OutputType::EpisodeLabel, ValueKind::Binary)
            .with_description("Presenting symptoms, most frequent terms only"),
    );
    registry.register_task(
        TaskDef::new(TASK_SYMPTOM_PRESENCE, OutputType::EpisodeLabel, ValueKind::Binary)
            .with_description("Symptom mentioned in any note of the episode"),
    );
    registry.register_task(
        TaskDef::new(TASK_SYMPTOM_MENTIONS, OutputType::EpisodeLabel, ValueKind::Ordinal)
            .with_description("Number of notes mentioning each symptom"),
    );

    registry.register(
        TASK_HPI_SHORT,
        "regex",
        "1",
        Implementation::Segmenter(Arc::new(HpiRegexSegmenter)),
    )?;
    registry.register(
        TASK_PRESENTING_SX,
        "llm",
        "1",
        Implementation::Extractor(Arc::new(LlmSymptomExtractor::new(backend.clone()))),
    )?;
    registry.register(
        TASK_PRESENTING_SX,
        "llm_zero_shot",
        "1",
        Implementation::Extractor(Arc::new(LlmSymptomExtractor::new(backend).without_examples())),
    )?;
    registry.register(
        TASK_SYMPTOM_FLAGS,
        "regex",
        "1",
        Implementation::Extractor(Arc::new(RegexSymptomExtractor::new())),
    )?;

    let vocabulary = Arc::new(Vocabulary::presenting_sx()?);
    registry.register_aggregation(
        TASK_PRES_SX_EPLAB,
        Arc::new(VocabPolicy::new(vocabulary.clone(), PRESENTING_SX)),
    )?;
    registry.register_aggregation(
        TASK_PRES_SX_EPLAB_TOP,
        Arc::new(VocabPolicy::new(vocabulary, PRESENTING_SX).with_whitelist(TOP_SYMPTOMS.iter().copied())),
    )?;
    registry.register_aggregation(TASK_SYMPTOM_PRESENCE, Arc::new(PresencePolicy::new(SYMPTOM_PREFIX)))?;
    registry.register_aggregation(TASK_SYMPTOM_MENTIONS, Arc::new(MentionCountPolicy::new(SYMPTOM_PREFIX)))?;

    Ok(registry)
}

/// Episode label tasks derived from a feature task.
pub fn label_tasks_for(feature_task: &str) -> Vec<&'static str> {
    LABEL_SOURCES
        .iter()
        .filter(|(_, source)| *source == feature_task)
        .map(|(label_task, _)| *label_task)
        .collect()
}

/// Split a text export into notes at lines of ten or more `#`.
pub fn split_note_texts(content: &str) -> Vec<String> {
    NOTE_SEPARATOR
        .split(content)
        .map(str::trim)
        .filter(|note| !note.is_empty())
        .map(String::from)
        .collect()
}

/// The keyword-scanning mock backend, reading from the configured model cache.
pub fn mock_backend(config: &Config) -> Arc<dyn CompletionBackend> {
    let backend = MockBackend::new();
    match &config.model_cache_dir {
        Some(dir) => Arc::new(backend.with_model_dir(dir)),
        None => Arc::new(backend),
    }
}

/// Parse a staleness cutoff: RFC 3339, `YYYY-MM-DDTHH:MM:SS` or `YYYY-MM-DD`, naive times in UTC.
pub fn parse_cutoff(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(value) {
        return Ok(t.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(t.and_utc());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|t| t.and_utc())
        .ok_or_else(|| ChartlabError::Invalid(format!("not a date or time: {}", value)))
}

/// Which units a run covers and what it does with existing output.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Exactly these notes (worker mode) instead of a selection
    pub note_ids: Option<Vec<NoteId>>,
    /// Only notes and episodes a human has labelled for this task
    pub annotated_for_task: Option<String>,
    pub policy: IdempotencyPolicy,
    /// Redo output written before this instant
    pub stale_before: Option<DateTime<Utc>>,
}

impl RunRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(mut self, policy: IdempotencyPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_note_ids(mut self, note_ids: Vec<NoteId>) -> Self {
        self.note_ids = Some(note_ids);
        self
    }

    pub fn with_annotated_for(mut self, task: impl Into<String>) -> Self {
        self.annotated_for_task = Some(task.into());
        self
    }

    pub fn with_stale_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.stale_before = Some(cutoff);
        self
    }

    /// Whether units that already have output are candidates.
    pub fn reruns_existing(&self) -> bool {
        self.policy == IdempotencyPolicy::Overwrite || self.stale_before.is_some()
    }

    fn engine_options(&self, config: &Config) -> EngineOptions {
        EngineOptions {
            policy: self.policy,
            stale_before: self.stale_before,
            ..config.engine_options()
        }
    }
}

/// How `plan-workers` splits the pending notes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSplit {
    Workers(usize),
    IdsPerWorker(usize),
}

/// One row of `list-strategies`.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyListing {
    pub task: String,
    pub output_type: OutputType,
    pub name: String,
    pub version: String,
    pub kind: &'static str,
    pub last_updated: String,
    pub description: String,
    /// Set once the strategy has been used against this store
    pub strategy_id: Option<StrategyId>,
}

/// A store plus the strategies that run against it.
pub struct Chartlab {
    db: Database,
    registry: StrategyRegistry,
    config: Config,
}

impl Chartlab {
    /// Open the configured store with the standard strategies over the given backend.
    pub fn open(config: Config, backend: Arc<dyn CompletionBackend>) -> Result<Self> {
        let db = config.open_database()?;
        if let Some(dir) = &config.model_cache_dir {
            if backend.model_dir() != Some(dir.as_path()) {
                warn!(dir = %dir.display(), model = backend.model_id(), "backend does not read the configured model cache");
            }
        }
        let registry = default_registry(backend)?;
        Ok(Self { db, registry, config })
    }

    /// In-memory store with the keyword-scanning mock backend.
    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            db: Database::open_in_memory()?,
            registry: default_registry(Arc::new(MockBackend::new()))?,
            config: Config::default(),
        })
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn db_mut(&mut self) -> &mut Database {
        &mut self.db
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Import notes from a `#`-separated text file, one new episode per note.
    pub fn import_notes_text<P: AsRef<Path>>(&mut self, path: P) -> Result<Vec<(EpisodeId, NoteId)>> {
        let path = path.as_ref();
        let notes = split_note_texts(&std::fs::read_to_string(path)?);
        if notes.is_empty() {
            warn!(path = %path.display(), "no notes found");
            return Ok(Vec::new());
        }
        let imported = self.db.import_note_texts(&notes)?;
        info!(notes = imported.len(), path = %path.display(), "notes imported");
        Ok(imported)
    }

    /// Resolve `task.name`, newest version unless one is given.
    pub fn strategy(&self, reference: &str, version: Option<&str>) -> Result<StrategyHandle> {
        Ok(self.registry.resolve_qualified(reference, version)?)
    }

    /// Notes the strategy has not processed yet.
    pub fn pending_notes(&self, handle: &StrategyHandle) -> Result<Vec<NoteId>> {
        let record = self.db.get_or_register_strategy(&handle.task, &handle.strategy_def())?;
        Ok(match handle.implementation {
            Implementation::Segmenter(_) => self.db.list_notes_without_sections(record.id)?,
            Implementation::Extractor(_) => self.db.list_notes_without_features(record.id, None)?,
        })
    }

    /// Store id of a registered task, or `None` if nothing has been written for it.
    fn stored_task(&self, name: &str) -> Result<Option<TaskId>> {
        self.registry.task(name)?;
        Ok(self.db.get_task_by_name(name)?.map(|task| task.id))
    }

    /// Notes a run will process: the explicit ids, else every note when existing output
    /// may be redone, else the notes the strategy hasn't seen. Narrowed to annotated
    /// episodes when asked.
    pub fn select_notes(&self, handle: &StrategyHandle, request: &RunRequest) -> Result<Vec<NoteId>> {
        let mut notes = match &request.note_ids {
            Some(ids) => ids.clone(),
            None if request.reruns_existing() => self.db.list_note_ids(None)?,
            None => self.pending_notes(handle)?,
        };
        if let Some(task) = &request.annotated_for_task {
            let annotated: HashSet<NoteId> = match self.stored_task(task)? {
                Some(task_id) => self.db.list_notes_annotated_for_task(task_id)?.into_iter().collect(),
                None => HashSet::new(),
            };
            notes.retain(|id| annotated.contains(id));
        }
        Ok(notes)
    }

    /// Episodes the strategy has features for, narrowed to annotated ones when asked.
    fn candidate_episodes(&self, handle: &StrategyHandle, request: &RunRequest) -> Result<Vec<EpisodeId>> {
        let strategy = self.db.get_or_register_strategy(&handle.task, &handle.strategy_def())?;
        let mut episodes = self.db.list_episodes_with_features(strategy.id)?;
        if let Some(task) = &request.annotated_for_task {
            let annotated: HashSet<EpisodeId> = match self.stored_task(task)? {
                Some(task_id) => self.db.list_annotated_episodes(task_id)?.into_iter().collect(),
                None => HashSet::new(),
            };
            episodes.retain(|id| annotated.contains(id));
        }
        Ok(episodes)
    }

    /// Episodes a derivation of `label_task` would write labels for.
    pub fn select_episodes(
        &self,
        handle: &StrategyHandle,
        label_task: &str,
        request: &RunRequest,
    ) -> Result<Vec<EpisodeId>> {
        let episodes = self.candidate_episodes(handle, request)?;
        let task_id = match self.stored_task(label_task)? {
            Some(task_id) if !request.reruns_existing() => task_id,
            _ => return Ok(episodes),
        };
        let strategy = self.db.get_or_register_strategy(&handle.task, &handle.strategy_def())?;
        let mut pending = Vec::with_capacity(episodes.len());
        for episode in episodes {
            if !self.db.strategy_labels_exist(episode, task_id, strategy.id)? {
                pending.push(episode);
            }
        }
        Ok(pending)
    }

    /// Run a segmentation strategy over every note it hasn't seen.
    pub fn extract_sections(&mut self, reference: &str) -> Result<RunSummary> {
        let handle = self.strategy(reference, None)?;
        let pending = self.pending_notes(&handle)?;
        let engine = ExtractionEngine::new(self.config.engine_options());
        Ok(run_segmentation(&mut self.db, &engine, &handle, &pending)?)
    }

    /// Run a feature strategy over the notes `request` selects.
    pub fn extract_features(&mut self, reference: &str, request: &RunRequest, cache: &CacheLocation) -> Result<RunSummary> {
        let handle = self.strategy(reference, None)?;
        let note_ids = self.select_notes(&handle, request)?;
        info!(notes = note_ids.len(), strategy = %handle.qualified_name(), "notes selected for extraction");

        let cache: Box<dyn ResultCache> = match cache {
            CacheLocation::Private(path) => Box::new(SqliteCache::open(path)?),
            CacheLocation::NoCache => Box::new(crate::cache::NoCache),
        };
        let engine = ExtractionEngine::new(request.engine_options(&self.config)).with_cache(cache);
        Ok(run_worker(&mut self.db, &engine, &handle, &note_ids)?)
    }

    /// Label tasks a feature strategy feeds: the one asked for, or all of them.
    pub fn label_tasks(&self, reference: &str, label_task: Option<&str>) -> Result<(StrategyHandle, Vec<String>)> {
        let handle = self.strategy(reference, None)?;
        let tasks: Vec<String> = match label_task {
            Some(task) => vec![task.to_string()],
            None => label_tasks_for(&handle.task.name).into_iter().map(String::from).collect(),
        };
        if tasks.is_empty() {
            return Err(ChartlabError::Invalid(format!(
                "no episode label task is derived from {}",
                handle.task.name
            )));
        }
        Ok((handle, tasks))
    }

    /// Derive episode labels from a feature strategy, for one label task or every task
    /// fed by the strategy's feature task.
    pub fn extract_episode_labels(
        &mut self,
        reference: &str,
        label_task: Option<&str>,
        request: &RunRequest,
    ) -> Result<Vec<(String, DeriveSummary)>> {
        let (handle, tasks) = self.label_tasks(reference, label_task)?;

        let episodes = self.candidate_episodes(&handle, request)?;

        let deriver = Deriver::new(&self.registry).with_policy(request.policy);
        let mut summaries = Vec::new();
        for task in tasks {
            let summary = deriver.derive_episodes(&mut self.db, &task, &handle, &episodes)?;
            summaries.push((task, summary));
        }
        Ok(summaries)
    }

    pub fn import_human_labels<P: AsRef<Path>>(&mut self, task: &str, path: P, annotator: &str) -> Result<ImportSummary> {
        Ok(import_human_labels_file(&mut self.db, &self.registry, task, annotator, path)?)
    }

    /// Evaluate one task, or every episode label task in the store.
    pub fn evaluate(
        &self,
        task: Option<&str>,
        strategy: Option<&str>,
        options: &EvalOptions,
    ) -> Result<Vec<EvaluationReport>> {
        let strategy_id = match strategy {
            Some(reference) => {
                let handle = self.strategy(reference, None)?;
                let record = self
                    .db
                    .find_strategy_for(&handle.task.name, &handle.name, &handle.version)?
                    .ok_or_else(|| ChartlabError::Invalid(format!("{} has not been run", reference)))?;
                Some(record)
            }
            None => None,
        };
        let tasks: Vec<String> = match task {
            Some(task) => vec![task.to_string()],
            None => self
                .db
                .list_tasks()?
                .into_iter()
                .filter(|t| t.output_type == OutputType::EpisodeLabel)
                .map(|t| t.name)
                .collect(),
        };
        tasks
            .iter()
            .map(|task| -> Result<EvaluationReport> {
                // Tasks with a fixed vocabulary know every label a rater could have given
                let universe = self.registry.aggregation(task).ok().and_then(|a| a.label_names());
                Ok(evaluate_with_universe(&self.db, task, strategy_id, options, universe.as_ref())?)
            })
            .collect()
    }

    /// Split the notes `request` selects into worker id files.
    pub fn plan_workers(
        &self,
        reference: &str,
        split: WorkerSplit,
        request: &RunRequest,
        out_dir: &Path,
        command_template: &str,
    ) -> Result<WorkerPlan> {
        let handle = self.strategy(reference, None)?;
        let ids: Vec<i64> = self.select_notes(&handle, request)?.into_iter().map(|id| id.0).collect();
        let template = command_template.replace("{strategy}", &handle.qualified_name());
        let cache_root = self.config.worker_cache.as_deref();
        let plan = match split {
            WorkerSplit::Workers(workers) => WorkerPlan::new(&ids, workers, out_dir, cache_root, &template)?,
            WorkerSplit::IdsPerWorker(size) => WorkerPlan::by_size(&ids, size, out_dir, cache_root, &template),
        };
        plan.write_id_files()?;
        Ok(plan)
    }

    /// Every registered strategy, with its store id once it has been used.
    pub fn list_strategies(&self) -> Result<Vec<StrategyListing>> {
        let mut listings = Vec::new();
        for handle in self.registry.find(None, None)? {
            let strategy_id = self.db.find_strategy_for(&handle.task.name, &handle.name, &handle.version)?;
            listings.push(StrategyListing {
                output_type: handle.task.output_type,
                task: handle.task.name.clone(),
                kind: handle.implementation.kind(),
                last_updated: handle.last_updated().to_string(),
                description: handle.implementation.description().to_string(),
                name: handle.name,
                version: handle.version,
                strategy_id,
            });
        }
        Ok(listings)
    }
}
