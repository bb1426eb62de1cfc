//! Chartlab command line
//!
//! Imports notes, runs strategies, derives episode labels and evaluates them.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use chartlab_core::config::{Config, ConfigOverrides};
use chartlab_core::evaluate::{EvalOptions, HumanAggregation};
use chartlab_core::models::NoteId;
use chartlab_core::pipeline::{mock_backend, parse_cutoff, WorkerSplit};
use chartlab_core::worker::{read_ids_file, CacheLocation, DEFAULT_COMMAND_TEMPLATE};
use chartlab_core::{Chartlab, IdempotencyPolicy, RunRequest};

#[derive(Parser)]
#[command(name = "chartlab")]
#[command(about = "Strategy-versioned feature extraction and evaluation for clinical notes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ./chartlab.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite store (or set CHARTLAB_DATABASE)
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Table name prefix (or set CHARTLAB_TABLE_PREFIX)
    #[arg(long, global = true)]
    table_prefix: Option<String>,

    /// Worker cache root, or `none` (or set CHARTLAB_WORKER_CACHE)
    #[arg(long, global = true)]
    worker_cache: Option<String>,

    /// Model cache directory (or set CHARTLAB_MODEL_CACHE_DIR)
    #[arg(long, global = true)]
    model_cache_dir: Option<PathBuf>,

    /// Ceiling on one strategy invocation, in seconds
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the store's tables (safe to repeat)
    InitStore,

    /// Import notes from a text file, separated by lines of ten or more `#`
    ImportNotes {
        /// Text file of notes
        source: PathBuf,
    },

    /// Segment notes that have no sections from the strategy yet
    ExtractSections {
        /// Segmentation strategy as task.name
        #[arg(short, long, default_value = "hpi_short.regex")]
        strategy: String,

        /// Print how many notes would be segmented and exit
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Extract note features
    ExtractFeatures {
        /// Feature strategy as task.name
        #[arg(short, long)]
        strategy: String,

        /// Only process the note ids in this file (worker mode)
        #[arg(long)]
        ids_file: Option<PathBuf>,

        /// Private result cache file, or `none`
        #[arg(long)]
        cache: Option<String>,

        /// Re-run notes that already have features and replace them
        #[arg(long)]
        overwrite: bool,

        /// Redo features extracted before this time (RFC 3339 or YYYY-MM-DD)
        #[arg(short = 'R', long, value_parser = cutoff)]
        redo_older_than: Option<DateTime<Utc>>,

        /// Only notes of episodes with human labels for this task
        #[arg(short = 'A', long)]
        annotated_for_task: Option<String>,

        /// Print how many notes would be processed and exit
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Derive episode labels from a feature strategy
    ExtractEpisodeLabels {
        /// Feature strategy as task.name
        #[arg(short, long)]
        strategy: String,

        /// Episode label task (defaults to every task derived from the strategy's task)
        #[arg(short, long)]
        task: Option<String>,

        /// Replace existing labels from the strategy
        #[arg(long)]
        overwrite: bool,

        /// Only episodes with human labels for this task
        #[arg(short = 'A', long)]
        annotated_for_task: Option<String>,

        /// Print how many episodes would be labelled and exit
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Import human labels from a CSV with header `episode_id,human_labels`
    ImportHumanLabels {
        /// Episode label task
        task: String,

        /// Label file; labels within a row are separated by `|`
        file: PathBuf,

        /// Annotator username
        #[arg(short, long, env = "USER")]
        annotator: String,
    },

    /// Compare automated labels with human labels
    Evaluate {
        /// Episode label task (defaults to all)
        #[arg(short, long)]
        task: Option<String>,

        /// Only labels derived from this feature strategy (task.name)
        #[arg(short, long)]
        strategy: Option<String>,

        /// Print the report as JSON
        #[arg(long, conflicts_with = "csv")]
        json: bool,

        /// Print one CSV row per strategy and label
        #[arg(long)]
        csv: bool,

        /// Values at or above this are positive
        #[arg(long, default_value = "0.5")]
        threshold: f64,

        /// Read a missing label as negative when the other side covered the episode
        #[arg(long)]
        absent_as_negative: bool,

        /// Gold label is the mean over annotators instead of the first annotator
        #[arg(long)]
        mean_of_annotators: bool,

        /// Ignore automated labels first found after this line
        #[arg(long)]
        max_line_number: Option<i64>,
    },

    /// Split a strategy's pending notes into worker id files and print worker commands
    PlanWorkers {
        /// Feature strategy as task.name
        #[arg(short, long)]
        strategy: String,

        /// Number of workers
        #[arg(short, long, conflicts_with = "ids_per_worker")]
        workers: Option<usize>,

        /// Note ids per worker (defaults to the configured ids_per_worker)
        #[arg(long)]
        ids_per_worker: Option<usize>,

        /// Only notes of episodes with human labels for this task
        #[arg(short = 'A', long)]
        annotated_for_task: Option<String>,

        /// Directory for id files
        #[arg(short, long)]
        out: PathBuf,

        /// Command template with {ids_file}, {cache}, {worker} and {strategy} placeholders
        #[arg(long, default_value = DEFAULT_COMMAND_TEMPLATE)]
        command: String,
    },

    /// List registered strategies
    ListStrategies {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let overrides = ConfigOverrides {
        database: cli.database,
        table_prefix: cli.table_prefix,
        worker_cache: cli.worker_cache,
        model_cache_dir: cli.model_cache_dir,
        ids_per_worker: None,
        timeout_secs: cli.timeout_secs,
    };
    let config = Config::load(cli.config.as_deref(), &overrides).context("Failed to load configuration")?;
    let database = config.database.clone();
    let backend = mock_backend(&config);
    let mut chartlab = Chartlab::open(config, backend)
        .with_context(|| format!("Failed to open store {}", database.display()))?;

    match cli.command {
        Commands::InitStore => {
            println!("Store ready at {}", database.display());
        }
        Commands::ImportNotes { source } => {
            let imported = chartlab
                .import_notes_text(&source)
                .with_context(|| format!("Failed to import notes from {}", source.display()))?;
            println!("Imported {} notes", imported.len());
        }
        Commands::ExtractSections { strategy, dry_run } => {
            if dry_run {
                let handle = chartlab.strategy(&strategy, None)?;
                println!("{}: {} notes would be segmented", strategy, chartlab.pending_notes(&handle)?.len());
                return Ok(());
            }
            let summary = chartlab.extract_sections(&strategy)?;
            println!("{}: {}", strategy, summary);
        }
        Commands::ExtractFeatures {
            strategy,
            ids_file,
            cache,
            overwrite,
            redo_older_than,
            annotated_for_task,
            dry_run,
        } => {
            let mut request = RunRequest::new().with_policy(policy(overwrite));
            request.stale_before = redo_older_than;
            request.annotated_for_task = annotated_for_task;
            let cache = match &ids_file {
                Some(ids_file) => {
                    let ids: Vec<NoteId> = read_ids_file(ids_file)
                        .with_context(|| format!("Failed to read {}", ids_file.display()))?
                        .into_iter()
                        .map(NoteId)
                        .collect();
                    request = request.with_note_ids(ids);
                    match cache {
                        Some(value) => CacheLocation::from_arg(&value),
                        None => worker_cache(&chartlab.config().cache_location(), ids_file),
                    }
                }
                None => cache
                    .map(|value| CacheLocation::from_arg(&value))
                    .unwrap_or(CacheLocation::NoCache),
            };

            if dry_run {
                let handle = chartlab.strategy(&strategy, None)?;
                let notes = chartlab.select_notes(&handle, &request)?;
                println!("{}: {} notes would undergo feature extraction", strategy, notes.len());
                return Ok(());
            }
            let summary = chartlab.extract_features(&strategy, &request, &cache)?;
            println!("{}: {}", strategy, summary);
            for (note_id, message) in &summary.infrastructure_failures {
                eprintln!("  note {}: {}", note_id, message);
            }
            if !summary.is_clean() {
                std::process::exit(1);
            }
        }
        Commands::ExtractEpisodeLabels {
            strategy,
            task,
            overwrite,
            annotated_for_task,
            dry_run,
        } => {
            let mut request = RunRequest::new().with_policy(policy(overwrite));
            request.annotated_for_task = annotated_for_task;
            if dry_run {
                let (handle, tasks) = chartlab.label_tasks(&strategy, task.as_deref())?;
                for task in tasks {
                    let episodes = chartlab.select_episodes(&handle, &task, &request)?;
                    println!("{}: {} episodes would be labelled", task, episodes.len());
                }
                return Ok(());
            }
            for (task, summary) in chartlab.extract_episode_labels(&strategy, task.as_deref(), &request)? {
                println!(
                    "{}: {} episodes labelled ({} labels), {} skipped, {} without labels",
                    task, summary.derived, summary.labels_written, summary.skipped_existing, summary.empty
                );
            }
        }
        Commands::ImportHumanLabels { task, file, annotator } => {
            let summary = chartlab
                .import_human_labels(&task, &file, &annotator)
                .with_context(|| format!("Failed to import labels from {}", file.display()))?;
            println!(
                "Imported {} labels for {} episodes as {} ({} empty rows)",
                summary.labels, summary.episodes, annotator, summary.empty_rows
            );
        }
        Commands::Evaluate {
            task,
            strategy,
            json,
            csv,
            threshold,
            absent_as_negative,
            mean_of_annotators,
            max_line_number,
        } => {
            let options = EvalOptions {
                threshold,
                absent_as_negative,
                human_aggregation: if mean_of_annotators {
                    HumanAggregation::Mean
                } else {
                    HumanAggregation::FirstAnnotator
                },
                max_line_number,
            };
            let reports = chartlab.evaluate(task.as_deref(), strategy.as_deref(), &options)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                for report in &reports {
                    if csv {
                        print!("{}", report.to_csv());
                    } else {
                        println!("{}", report.to_text());
                    }
                }
            }
        }
        Commands::PlanWorkers {
            strategy,
            workers,
            ids_per_worker,
            annotated_for_task,
            out,
            command,
        } => {
            let split = match workers {
                Some(workers) => WorkerSplit::Workers(workers),
                None => WorkerSplit::IdsPerWorker(ids_per_worker.unwrap_or(chartlab.config().ids_per_worker)),
            };
            if matches!(split, WorkerSplit::Workers(0) | WorkerSplit::IdsPerWorker(0)) {
                bail!("--workers and --ids-per-worker must be at least 1");
            }
            let request = RunRequest {
                annotated_for_task,
                ..RunRequest::default()
            };
            let plan = chartlab.plan_workers(&strategy, split, &request, &out, &command)?;
            eprintln!("Run {}: {} workers, id files in {}", plan.run_id, plan.workers.len(), plan.dir.display());
            for assignment in &plan.workers {
                println!("{}", assignment.command);
            }
        }
        Commands::ListStrategies { json } => {
            let listings = chartlab.list_strategies()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&listings)?);
            } else {
                for s in &listings {
                    println!(
                        "{}.{} v{} [{}] {} {}",
                        s.task,
                        s.name,
                        s.version,
                        s.kind,
                        s.last_updated,
                        s.strategy_id.map(|id| format!("(id {})", id)).unwrap_or_default()
                    );
                }
            }
        }
    }

    Ok(())
}

fn cutoff(value: &str) -> Result<DateTime<Utc>, String> {
    parse_cutoff(value).map_err(|e| e.to_string())
}

fn policy(overwrite: bool) -> IdempotencyPolicy {
    if overwrite {
        IdempotencyPolicy::Overwrite
    } else {
        IdempotencyPolicy::Skip
    }
}

/// A worker's cache file under the configured root, named after its id file.
fn worker_cache(root: &CacheLocation, ids_file: &Path) -> CacheLocation {
    match root {
        CacheLocation::Private(dir) => {
            let stem = ids_file.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
            CacheLocation::Private(dir.join(format!("{}.sqlite", stem)))
        }
        CacheLocation::NoCache => CacheLocation::NoCache,
    }
}
