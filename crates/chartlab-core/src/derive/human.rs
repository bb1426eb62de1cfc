//! Human gold label import.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{info, warn};

use super::{label_task, DeriveError, DeriveResult};
use crate::db::Database;
use crate::models::{Annotator, EpisodeId, EpisodeLabel, NewEpisodeLabel, Provenance};
use crate::registry::StrategyRegistry;

/// Header expected on bulk label files.
pub const LABEL_FILE_HEADER: &str = "episode_id,human_labels";

static LABEL_SEPARATOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*\|\s*").expect("label separator pattern"));

/// Counts from a bulk import.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub episodes: usize,
    pub labels: usize,
    /// Rows that listed no labels
    pub empty_rows: usize,
}

/// Write or update one human label, creating the annotator if missing.
#[allow(clippy::too_many_arguments)]
pub fn import_human_label(
    db: &Database,
    registry: &StrategyRegistry,
    episode_id: EpisodeId,
    task: &str,
    annotator: &str,
    label_name: &str,
    label_value: f64,
    line_number: Option<i64>,
) -> DeriveResult<EpisodeLabel> {
    let task_def = label_task(registry, task)?;
    check_vocabulary(registry, task, [label_name])?;

    let task_row = db.get_or_register_task(task_def)?;
    db.ensure_annotator(&Annotator::new(annotator))?;
    Ok(db.upsert_human_label(&NewEpisodeLabel {
        episode_id,
        task_id: task_row.id,
        note_feature_id: None,
        provenance: Provenance::Human(annotator.to_string()),
        label_name: label_name.to_string(),
        label_value,
        line_number,
    })?)
}

/// Parse a label file: a header line, then `episode_id,label | label | ...` rows.
///
/// Rows naming the same episode are merged.
pub fn parse_label_file(source: &str) -> DeriveResult<(BTreeMap<EpisodeId, BTreeSet<String>>, usize)> {
    let mut lines = source.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());

    match lines.next() {
        Some((_, header)) if header.trim().trim_start_matches('\u{feff}') == LABEL_FILE_HEADER => {}
        Some((idx, header)) => {
            return Err(DeriveError::Import {
                line: idx + 1,
                message: format!("expected header {:?}, found {:?}", LABEL_FILE_HEADER, header.trim()),
            })
        }
        None => {
            return Err(DeriveError::Import {
                line: 1,
                message: "file is empty".into(),
            })
        }
    }

    let mut episodes: BTreeMap<EpisodeId, BTreeSet<String>> = BTreeMap::new();
    let mut empty_rows = 0;
    for (idx, line) in lines {
        let (id, labels) = line.split_once(',').unwrap_or((line, ""));
        let episode_id: i64 = id.trim().parse().map_err(|_| DeriveError::Import {
            line: idx + 1,
            message: format!("invalid episode id {:?}", id.trim()),
        })?;

        let labels: Vec<String> = LABEL_SEPARATOR
            .split(labels.trim().trim_matches('"'))
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();
        if labels.is_empty() {
            empty_rows += 1;
        }
        episodes.entry(EpisodeId(episode_id)).or_default().extend(labels);
    }
    Ok((episodes, empty_rows))
}

/// Import a label file for one annotator.
///
/// Every label must be in the task's vocabulary; nothing is written otherwise. Each
/// listed episode's labels from this annotator are replaced in one transaction, with
/// value 1.0 per listed label. Episodes listed without labels are left alone.
pub fn import_human_labels_file<P: AsRef<Path>>(
    db: &mut Database,
    registry: &StrategyRegistry,
    task: &str,
    annotator: &str,
    path: P,
) -> DeriveResult<ImportSummary> {
    let task_def = label_task(registry, task)?;
    let (episodes, empty_rows) = parse_label_file(&std::fs::read_to_string(path)?)?;
    if empty_rows > 0 {
        warn!(empty_rows, "rows with zero labels");
    }
    check_vocabulary(registry, task, episodes.values().flatten().map(String::as_str))?;

    let task_row = db.get_or_register_task(task_def)?;
    db.ensure_annotator(&Annotator::new(annotator))?;

    let mut summary = ImportSummary {
        empty_rows,
        ..Default::default()
    };
    for (episode_id, names) in episodes.iter().filter(|(_, names)| !names.is_empty()) {
        let labels: Vec<NewEpisodeLabel> = names
            .iter()
            .map(|name| NewEpisodeLabel {
                episode_id: *episode_id,
                task_id: task_row.id,
                note_feature_id: None,
                provenance: Provenance::Human(annotator.to_string()),
                label_name: name.clone(),
                label_value: 1.0,
                line_number: None,
            })
            .collect();
        summary.labels += db
            .replace_annotator_labels(*episode_id, task_row.id, annotator, &labels)?
            .len();
        summary.episodes += 1;
    }

    info!(labels = summary.labels, episodes = summary.episodes, task, annotator, "human labels imported");
    Ok(summary)
}

fn check_vocabulary<'a>(
    registry: &StrategyRegistry,
    task: &str,
    labels: impl IntoIterator<Item = &'a str>,
) -> DeriveResult<()> {
    let Some(known) = registry.aggregation(task).ok().and_then(|a| a.label_names()) else {
        return Ok(());
    };
    let unknown: BTreeSet<String> = labels
        .into_iter()
        .filter(|l| !known.contains(*l))
        .map(String::from)
        .collect();
    if unknown.is_empty() {
        Ok(())
    } else {
        Err(DeriveError::UnknownLabels {
            task: task.to_string(),
            labels: unknown.into_iter().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derive::{Vocabulary, VocabPolicy};
    use crate::models::{NewEpisode, OutputType, TaskDef, ValueKind};
    use std::io::Write;
    use std::sync::Arc;

    fn setup() -> (Database, StrategyRegistry) {
        let db = Database::open_in_memory().unwrap();
        db.insert_episode(&NewEpisode::new("MRN001")).unwrap();
        db.insert_episode(&NewEpisode::new("MRN002")).unwrap();

        let mut registry = StrategyRegistry::new();
        registry.register_task(TaskDef::new("pres_sx_eplab", OutputType::EpisodeLabel, ValueKind::Binary));
        registry
            .register_aggregation(
                "pres_sx_eplab",
                Arc::new(VocabPolicy::new(
                    Arc::new(Vocabulary::presenting_sx().unwrap()),
                    "presenting_sx",
                )),
            )
            .unwrap();
        (db, registry)
    }

    fn label_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_import_single_label_upserts() {
        let (db, registry) = setup();
        let first = import_human_label(&db, &registry, EpisodeId(1), "pres_sx_eplab", "alice", "fever", 1.0, None).unwrap();
        let again = import_human_label(&db, &registry, EpisodeId(1), "pres_sx_eplab", "alice", "fever", 0.0, Some(2)).unwrap();

        assert_eq!(first.id, again.id);
        assert_eq!(again.label_value, 0.0);
        assert_eq!(again.provenance, Provenance::Human("alice".into()));
        assert!(db.get_annotator("alice").unwrap().is_some());
    }

    #[test]
    fn test_import_rejects_unknown_label() {
        let (db, registry) = setup();
        let err = import_human_label(&db, &registry, EpisodeId(1), "pres_sx_eplab", "alice", "feverish", 1.0, None)
            .unwrap_err();
        assert!(matches!(err, DeriveError::UnknownLabels { .. }));
    }

    #[test]
    fn test_parse_label_file() {
        let (episodes, empty) =
            parse_label_file("episode_id,human_labels\n1,fever | cough\n2,\"chills|fever\"\n3,\n1,rash\n").unwrap();

        assert_eq!(empty, 1);
        assert_eq!(episodes.len(), 3);
        let first: Vec<&str> = episodes[&EpisodeId(1)].iter().map(String::as_str).collect();
        assert_eq!(first, vec!["cough", "fever", "rash"]);
        assert!(episodes[&EpisodeId(3)].is_empty());
    }

    #[test]
    fn test_parse_label_file_errors() {
        assert!(matches!(
            parse_label_file("id,labels\n1,fever"),
            Err(DeriveError::Import { line: 1, .. })
        ));
        assert!(matches!(
            parse_label_file("episode_id,human_labels\nabc,fever"),
            Err(DeriveError::Import { line: 2, .. })
        ));
    }

    #[test]
    fn test_bulk_import_replaces_annotator_labels() {
        let (mut db, registry) = setup();
        let file = label_file("episode_id,human_labels\n1,fever|cough\n2,chills\n");
        let summary = import_human_labels_file(&mut db, &registry, "pres_sx_eplab", "alice", file.path()).unwrap();
        assert_eq!(summary.episodes, 2);
        assert_eq!(summary.labels, 3);

        let file = label_file("episode_id,human_labels\n1,rash\n");
        import_human_labels_file(&mut db, &registry, "pres_sx_eplab", "alice", file.path()).unwrap();

        let task = db.get_task_by_name("pres_sx_eplab").unwrap().unwrap();
        let names: Vec<String> = db
            .list_labels_for_episode(EpisodeId(1), task.id)
            .unwrap()
            .into_iter()
            .map(|l| l.label_name)
            .collect();
        assert_eq!(names, vec!["rash"]);
        assert_eq!(db.list_labels_for_episode(EpisodeId(2), task.id).unwrap().len(), 1);
    }

    #[test]
    fn test_bulk_import_writes_nothing_on_unknown_label() {
        let (mut db, registry) = setup();
        let file = label_file("episode_id,human_labels\n1,fever\n2,not a symptom\n");
        let err = import_human_labels_file(&mut db, &registry, "pres_sx_eplab", "alice", file.path()).unwrap_err();

        match err {
            DeriveError::UnknownLabels { labels, .. } => assert_eq!(labels, vec!["not a symptom"]),
            other => panic!("unexpected error {:?}", other),
        }
        assert!(db.get_task_by_name("pres_sx_eplab").unwrap().is_none());
    }
}
