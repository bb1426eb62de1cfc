//! Configuration loading.
//!
//! Each setting is resolved in priority order:
//! 1. Command-line flag
//! 2. Environment variable
//! 3. `chartlab.toml`
//! 4. Compiled default

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::db::{Database, DbResult};
use crate::engine::EngineOptions;
use crate::worker::{CacheLocation, DEFAULT_IDS_PER_WORKER};

/// Config file looked up in the working directory.
pub const CONFIG_FILE: &str = "chartlab.toml";

pub const ENV_DATABASE: &str = "CHARTLAB_DATABASE";
pub const ENV_TABLE_PREFIX: &str = "CHARTLAB_TABLE_PREFIX";
/// Per-worker cache path, or `none`
pub const ENV_WORKER_CACHE: &str = "CHARTLAB_WORKER_CACHE";
pub const ENV_MODEL_CACHE_DIR: &str = "CHARTLAB_MODEL_CACHE_DIR";

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Resolved settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// SQLite store path
    pub database: PathBuf,
    /// Prepended to every table name
    pub table_prefix: String,
    /// Root of per-worker result caches; `None` disables caching
    pub worker_cache: Option<PathBuf>,
    /// Where model backends keep downloaded weights
    pub model_cache_dir: Option<PathBuf>,
    pub ids_per_worker: usize,
    /// Ceiling on one strategy invocation
    pub timeout_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: PathBuf::from("chartlab.sqlite"),
            table_prefix: String::new(),
            worker_cache: Some(PathBuf::from(".chartlab/cache")),
            model_cache_dir: None,
            ids_per_worker: DEFAULT_IDS_PER_WORKER,
            timeout_secs: None,
        }
    }
}

/// Values given on the command line.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub database: Option<PathBuf>,
    pub table_prefix: Option<String>,
    /// Path or `none`
    pub worker_cache: Option<String>,
    pub model_cache_dir: Option<PathBuf>,
    pub ids_per_worker: Option<usize>,
    pub timeout_secs: Option<u64>,
}

impl Config {
    /// Resolve from the process environment.
    ///
    /// An explicit `config_file` must exist; otherwise `chartlab.toml` is read when present.
    pub fn load(config_file: Option<&Path>, overrides: &ConfigOverrides) -> ConfigResult<Self> {
        Self::resolve(config_file, overrides, |key| std::env::var(key).ok())
    }

    /// Resolve with a custom environment lookup.
    pub fn resolve<F>(config_file: Option<&Path>, overrides: &ConfigOverrides, env: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Priority 3 and 4: config file over defaults
        let mut config = match config_file {
            Some(path) => Self::from_file(path)?,
            None if Path::new(CONFIG_FILE).exists() => Self::from_file(Path::new(CONFIG_FILE))?,
            None => Self::default(),
        };

        // Priority 2: environment
        if let Some(database) = env(ENV_DATABASE) {
            config.database = PathBuf::from(database);
        }
        if let Some(prefix) = env(ENV_TABLE_PREFIX) {
            config.table_prefix = prefix;
        }
        if let Some(cache) = env(ENV_WORKER_CACHE) {
            config.worker_cache = parse_cache(&cache);
        }
        if let Some(dir) = env(ENV_MODEL_CACHE_DIR) {
            config.model_cache_dir = Some(PathBuf::from(dir));
        }

        // Priority 1: command line
        if let Some(database) = &overrides.database {
            config.database = database.clone();
        }
        if let Some(prefix) = &overrides.table_prefix {
            config.table_prefix = prefix.clone();
        }
        if let Some(cache) = &overrides.worker_cache {
            config.worker_cache = parse_cache(cache);
        }
        if let Some(dir) = &overrides.model_cache_dir {
            config.model_cache_dir = Some(dir.clone());
        }
        if let Some(n) = overrides.ids_per_worker {
            config.ids_per_worker = n;
        }
        if overrides.timeout_secs.is_some() {
            config.timeout_secs = overrides.timeout_secs;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(source: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(source)?)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.ids_per_worker == 0 {
            return Err(ConfigError::Invalid("ids_per_worker must be at least 1".into()));
        }
        if self.timeout_secs == Some(0) {
            return Err(ConfigError::Invalid("timeout_secs must be at least 1".into()));
        }
        Ok(())
    }

    pub fn open_database(&self) -> DbResult<Database> {
        Database::open_with_prefix(&self.database, &self.table_prefix)
    }

    /// Engine options carrying the configured timeout.
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            timeout: self.timeout_secs.map(Duration::from_secs),
            ..Default::default()
        }
    }

    /// Cache root for planned workers, if caching is on.
    pub fn cache_location(&self) -> CacheLocation {
        match &self.worker_cache {
            Some(path) => CacheLocation::Private(path.clone()),
            None => CacheLocation::NoCache,
        }
    }
}

fn parse_cache(value: &str) -> Option<PathBuf> {
    match CacheLocation::from_arg(value) {
        CacheLocation::Private(path) => Some(path),
        CacheLocation::NoCache => None,
    }
}
