//! Version-aware lookup of strategies and aggregation policies.
//!
//! Pure bookkeeping: nothing here touches the store. Strategy rows are written on
//! first use by the engine and derivation paths.

use chrono::NaiveDate;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::derive::AggregationPolicy;
use crate::models::{StrategyDef, TaskDef};
use crate::strategy::Implementation;

/// Registry errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Unknown strategy: {task}.{name}{}", version_suffix(.version))]
    UnknownStrategy {
        task: String,
        name: String,
        version: Option<String>,
    },

    #[error("No aggregation policy registered for task {0}")]
    NoAggregation(String),

    #[error("Invalid strategy reference: {0}")]
    InvalidReference(String),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// A registered strategy version and the routine that runs it.
#[derive(Debug, Clone)]
pub struct StrategyHandle {
    pub task: TaskDef,
    pub name: String,
    pub version: String,
    pub implementation: Implementation,
    seq: usize,
}

impl StrategyHandle {
    /// `task.name`, as used on the command line.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.task.name, self.name)
    }

    pub fn last_updated(&self) -> NaiveDate {
        self.implementation.last_updated()
    }

    /// Identity written to the strategies table.
    pub fn strategy_def(&self) -> StrategyDef {
        StrategyDef {
            name: self.name.clone(),
            version: self.version.clone(),
            description: self.implementation.description().to_string(),
            last_updated: self.last_updated(),
        }
    }
}

/// Maps (task, name, version) to implementations.
#[derive(Default)]
pub struct StrategyRegistry {
    tasks: BTreeMap<String, TaskDef>,
    handles: Vec<StrategyHandle>,
    aggregations: BTreeMap<String, Arc<dyn AggregationPolicy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task. The first definition of a name wins.
    pub fn register_task(&mut self, def: TaskDef) -> &TaskDef {
        self.tasks.entry(def.name.clone()).or_insert(def)
    }

    pub fn task(&self, name: &str) -> RegistryResult<&TaskDef> {
        self.tasks
            .get(name)
            .ok_or_else(|| RegistryError::UnknownTask(name.to_string()))
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskDef> {
        self.tasks.values()
    }

    /// Register a strategy version.
    ///
    /// Re-registering an existing (task, name, version) returns the existing handle and
    /// leaves the registry unchanged.
    pub fn register(
        &mut self,
        task: &str,
        name: &str,
        version: &str,
        implementation: Implementation,
    ) -> RegistryResult<StrategyHandle> {
        let task_def = self.task(task)?.clone();

        if let Some(existing) = self
            .handles
            .iter()
            .find(|h| h.task.name == task && h.name == name && h.version == version)
        {
            return Ok(existing.clone());
        }

        let handle = StrategyHandle {
            task: task_def,
            name: name.to_string(),
            version: version.to_string(),
            implementation,
            seq: self.handles.len(),
        };
        self.handles.push(handle.clone());
        Ok(handle)
    }

    /// Resolve a strategy. Without a version, the newest `last_updated` wins, ties
    /// broken by version string and then registration order.
    pub fn resolve(
        &self,
        task: &str,
        name: &str,
        version: Option<&str>,
    ) -> RegistryResult<StrategyHandle> {
        self.task(task)?;

        self.handles
            .iter()
            .filter(|h| h.task.name == task && h.name == name)
            .filter(|h| version.map_or(true, |v| h.version == v))
            .max_by(|a, b| {
                a.last_updated()
                    .cmp(&b.last_updated())
                    .then_with(|| a.version.cmp(&b.version))
                    .then_with(|| a.seq.cmp(&b.seq))
            })
            .cloned()
            .ok_or_else(|| RegistryError::UnknownStrategy {
                task: task.to_string(),
                name: name.to_string(),
                version: version.map(String::from),
            })
    }

    /// Resolve a `task.name` reference.
    pub fn resolve_qualified(
        &self,
        reference: &str,
        version: Option<&str>,
    ) -> RegistryResult<StrategyHandle> {
        let (task, name) = reference
            .split_once('.')
            .ok_or_else(|| RegistryError::InvalidReference(reference.to_string()))?;
        self.resolve(task, name, version)
    }

    /// Handles matching an optional task and shell-style name glob, sorted by
    /// (task, name, version).
    pub fn find(&self, task: Option<&str>, name_glob: Option<&str>) -> RegistryResult<Vec<StrategyHandle>> {
        let pattern = name_glob.map(glob_to_regex).transpose()?;

        let mut found: Vec<StrategyHandle> = self
            .handles
            .iter()
            .filter(|h| task.map_or(true, |t| h.task.name == t))
            .filter(|h| pattern.as_ref().map_or(true, |re| re.is_match(&h.name)))
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            (&a.task.name, &a.name, &a.version).cmp(&(&b.task.name, &b.name, &b.version))
        });
        Ok(found)
    }

    /// Set the aggregation policy used to derive a task's episode labels.
    pub fn register_aggregation(
        &mut self,
        task: &str,
        policy: Arc<dyn AggregationPolicy>,
    ) -> RegistryResult<()> {
        self.task(task)?;
        self.aggregations.insert(task.to_string(), policy);
        Ok(())
    }

    pub fn aggregation(&self, task: &str) -> RegistryResult<Arc<dyn AggregationPolicy>> {
        self.task(task)?;
        self.aggregations
            .get(task)
            .cloned()
            .ok_or_else(|| RegistryError::NoAggregation(task.to_string()))
    }
}

fn version_suffix(version: &Option<String>) -> String {
    version.as_ref().map(|v| format!(" v{}", v)).unwrap_or_default()
}

fn glob_to_regex(glob: &str) -> RegistryResult<Regex> {
    let pattern = regex::escape(glob).replace(r"\*", ".*").replace(r"\?", ".");
    Regex::new(&format!("^{}$", pattern)).map_err(|_| RegistryError::InvalidReference(glob.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OutputType, ValueKind};
    use crate::strategy::{ExtractorError, ExtractorOutput, FeatureExtractor, FeatureSchema};

    struct Dated(NaiveDate);

    impl FeatureExtractor for Dated {
        fn schema(&self) -> FeatureSchema {
            FeatureSchema::Fixed(vec!["x".into()])
        }

        fn extract(&self, _text: &str) -> Result<ExtractorOutput, ExtractorError> {
            Ok(ExtractorOutput::default())
        }

        fn last_updated(&self) -> NaiveDate {
            self.0
        }
    }

    fn dated(y: i32, m: u32, d: u32) -> Implementation {
        Implementation::Extractor(Arc::new(Dated(NaiveDate::from_ymd_opt(y, m, d).unwrap())))
    }

    fn registry() -> StrategyRegistry {
        let mut registry = StrategyRegistry::new();
        registry.register_task(TaskDef::new("presenting_sx", OutputType::Feature, ValueKind::Binary));
        registry
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut registry = registry();
        let first = registry.register("presenting_sx", "regex", "1", dated(2024, 1, 1)).unwrap();
        let again = registry.register("presenting_sx", "regex", "1", dated(2025, 1, 1)).unwrap();

        assert_eq!(first.last_updated(), again.last_updated());
        assert_eq!(registry.find(None, None).unwrap().len(), 1);
    }

    #[test]
    fn test_resolve_latest_by_last_updated() {
        let mut registry = registry();
        registry.register("presenting_sx", "regex", "2", dated(2024, 1, 1)).unwrap();
        registry.register("presenting_sx", "regex", "1", dated(2024, 6, 1)).unwrap();

        let latest = registry.resolve("presenting_sx", "regex", None).unwrap();
        assert_eq!(latest.version, "1");

        let exact = registry.resolve("presenting_sx", "regex", Some("2")).unwrap();
        assert_eq!(exact.version, "2");
    }

    #[test]
    fn test_resolve_tie_broken_by_version() {
        let mut registry = registry();
        registry.register("presenting_sx", "regex", "1.1", dated(2024, 1, 1)).unwrap();
        registry.register("presenting_sx", "regex", "1.0", dated(2024, 1, 1)).unwrap();
        assert_eq!(registry.resolve("presenting_sx", "regex", None).unwrap().version, "1.1");
    }

    #[test]
    fn test_resolve_errors() {
        let mut registry = registry();
        registry.register("presenting_sx", "regex", "1", dated(2024, 1, 1)).unwrap();

        assert_eq!(
            registry.resolve("nope", "regex", None).unwrap_err(),
            RegistryError::UnknownTask("nope".into())
        );
        assert!(matches!(
            registry.resolve("presenting_sx", "llm", None),
            Err(RegistryError::UnknownStrategy { .. })
        ));
        assert!(matches!(
            registry.resolve("presenting_sx", "regex", Some("9")),
            Err(RegistryError::UnknownStrategy { .. })
        ));
        assert!(matches!(
            registry.register("nope", "regex", "1", dated(2024, 1, 1)),
            Err(RegistryError::UnknownTask(_))
        ));
    }

    #[test]
    fn test_resolve_qualified() {
        let mut registry = registry();
        registry.register("presenting_sx", "regex", "1", dated(2024, 1, 1)).unwrap();
        let handle = registry.resolve_qualified("presenting_sx.regex", None).unwrap();
        assert_eq!(handle.qualified_name(), "presenting_sx.regex");
        assert!(matches!(
            registry.resolve_qualified("regex", None),
            Err(RegistryError::InvalidReference(_))
        ));
    }

    #[test]
    fn test_find_with_glob() {
        let mut registry = registry();
        registry.register_task(TaskDef::new("hpi", OutputType::Section, ValueKind::Binary));
        registry.register("presenting_sx", "llm_llama3", "1", dated(2024, 1, 1)).unwrap();
        registry.register("presenting_sx", "regex", "1", dated(2024, 1, 1)).unwrap();
        registry.register("presenting_sx", "llm_mistral", "1", dated(2024, 1, 1)).unwrap();
        registry.register("hpi", "regex", "1", dated(2024, 1, 1)).unwrap();

        let names: Vec<String> = registry
            .find(Some("presenting_sx"), Some("llm_*"))
            .unwrap()
            .iter()
            .map(|h| h.name.clone())
            .collect();
        assert_eq!(names, vec!["llm_llama3", "llm_mistral"]);

        let all: Vec<String> = registry
            .find(None, Some("re?ex"))
            .unwrap()
            .iter()
            .map(|h| h.qualified_name())
            .collect();
        assert_eq!(all, vec!["hpi.regex", "presenting_sx.regex"]);
    }
}
