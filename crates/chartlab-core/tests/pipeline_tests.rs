//! End-to-end extraction, derivation and evaluation tests.

use std::sync::Arc;

use chartlab_core::db::Database;
use chartlab_core::derive::{import_human_label, DeriveOutcome, Deriver};
use chartlab_core::evaluate::{evaluate, EvalOptions};
use chartlab_core::models::{NewEpisode, NewNote, Provenance};
use chartlab_core::pipeline::{
    default_registry, RunRequest, TASK_PRES_SX_EPLAB, TASK_SYMPTOM_FLAGS, TASK_SYMPTOM_MENTIONS, TASK_SYMPTOM_PRESENCE,
};
use chartlab_core::worker::{run_worker, CacheLocation};
use chartlab_core::{Chartlab, ExtractionEngine};
use chartlab_llm::MockBackend;

#[test]
fn test_fever_scenario() {
    let mut db = Database::open_in_memory().unwrap();
    let registry = default_registry(Arc::new(MockBackend::new())).unwrap();
    let episode = db.insert_episode(&NewEpisode::new("E1")).unwrap();
    let note = db.insert_note(&NewNote::new(episode, "N1", "fever and chills.")).unwrap();

    let handle = registry.resolve_qualified("symptom_flags.regex", None).unwrap();
    let summary = run_worker(&mut db, &ExtractionEngine::default(), &handle, &[note]).unwrap();
    assert_eq!(summary.extracted, 1);

    let strategy = db.find_strategy_for(TASK_SYMPTOM_FLAGS, "regex", "1").unwrap().unwrap();
    let fever = db
        .list_features_for_note(note, strategy)
        .unwrap()
        .into_iter()
        .find(|f| f.feature_name == "symptom_fever")
        .unwrap();
    assert_eq!(fever.feature_value.as_deref(), Some("1"));

    let labels = match Deriver::new(&registry)
        .derive(&mut db, episode, TASK_SYMPTOM_PRESENCE, &handle)
        .unwrap()
    {
        DeriveOutcome::Derived(labels) => labels,
        other => panic!("expected labels, got {:?}", other),
    };
    let fever_label = labels.iter().find(|l| l.label_name == "fever").unwrap();
    assert_eq!(fever_label.label_value, 1.0);
    assert_eq!(fever_label.provenance, Provenance::Strategy(strategy));

    import_human_label(&db, &registry, episode, TASK_SYMPTOM_PRESENCE, "alice", "fever", 1.0, None).unwrap();

    let report = evaluate(&db, TASK_SYMPTOM_PRESENCE, None, &EvalOptions::default()).unwrap();
    let fever = report.label("symptom_flags.regex v1", "fever").unwrap();
    let confusion = fever.metrics.confusion().unwrap();
    assert_eq!((confusion.tp, confusion.fp, confusion.fn_), (1, 0, 0));
    assert_eq!(fever.unmatched(), 0);
    assert_eq!(report.gold_episodes, 1);

    // Labels alice never gave are one-sided, not false positives
    let chills = report.label("symptom_flags.regex v1", "chills").unwrap();
    assert_eq!((chills.matched, chills.automated_only), (0, 1));
}

#[test]
fn test_rerunning_the_pipeline_changes_nothing() {
    let mut chartlab = Chartlab::in_memory().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("notes.txt");
    std::fs::write(
        &source,
        "Cough for a week, no fever.\n##########\nFevers and vomiting since Monday.\n##########\nFollow-up, denies cough.\n",
    )
    .unwrap();
    chartlab.import_notes_text(&source).unwrap();

    let first = chartlab
        .extract_features("symptom_flags.regex", &RunRequest::new(), &CacheLocation::NoCache)
        .unwrap();
    assert_eq!(first.extracted, 3);
    let derived = chartlab
        .extract_episode_labels("symptom_flags.regex", None, &RunRequest::new())
        .unwrap();
    let tasks: Vec<&str> = derived.iter().map(|(task, _)| task.as_str()).collect();
    assert_eq!(tasks, vec![TASK_SYMPTOM_PRESENCE, TASK_SYMPTOM_MENTIONS]);
    assert!(derived.iter().all(|(_, s)| s.derived == 3));

    let count_rows = |chartlab: &Chartlab, table: &str| -> i64 {
        chartlab
            .db()
            .conn()
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
            .unwrap()
    };
    let features = count_rows(&chartlab, "note_features");
    let labels = count_rows(&chartlab, "episode_labels");

    // Every note already has its features, so nothing is pending
    let again = chartlab
        .extract_features("symptom_flags.regex", &RunRequest::new(), &CacheLocation::NoCache)
        .unwrap();
    assert_eq!(again.units(), 0);
    let rederived = chartlab
        .extract_episode_labels("symptom_flags.regex", Some(TASK_SYMPTOM_PRESENCE), &RunRequest::new())
        .unwrap();
    assert_eq!(rederived[0].1.skipped_existing, 3);

    assert_eq!(count_rows(&chartlab, "note_features"), features);
    assert_eq!(count_rows(&chartlab, "episode_labels"), labels);
}

#[test]
fn test_hpi_to_presenting_symptoms() {
    let mut chartlab = Chartlab::in_memory().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("notes.txt");
    std::fs::write(
        &source,
        concat!(
            "Chief Complaint: feeling unwell\n",
            "HPI: Fever and chills for two days.\n",
            "Physical Exam:\n",
            "Cough on auscultation.\n",
            "##########\n",
            "Brief note without a history heading.\n",
        ),
    )
    .unwrap();
    let imported = chartlab.import_notes_text(&source).unwrap();
    assert_eq!(imported.len(), 2);

    let sections = chartlab.extract_sections("hpi_short.regex").unwrap();
    assert_eq!((sections.extracted, sections.empty), (1, 1));

    // The second note has no HPI section for the LLM strategy to read
    let features = chartlab
        .extract_features("presenting_sx.llm", &RunRequest::new(), &CacheLocation::NoCache)
        .unwrap();
    assert_eq!((features.extracted, features.missing_input), (1, 1));

    chartlab
        .extract_episode_labels("presenting_sx.llm", Some(TASK_PRES_SX_EPLAB), &RunRequest::new())
        .unwrap();

    let (episode, _) = imported[0];
    let labels_file = dir.path().join("labels.csv");
    std::fs::write(&labels_file, format!("episode_id,human_labels\n{},fever | cough\n", episode)).unwrap();
    let import = chartlab.import_human_labels(TASK_PRES_SX_EPLAB, &labels_file, "alice").unwrap();
    assert_eq!((import.episodes, import.labels), (1, 2));

    let reports = chartlab
        .evaluate(Some(TASK_PRES_SX_EPLAB), Some("presenting_sx.llm"), &EvalOptions::default())
        .unwrap();
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    let key = "presenting_sx.llm v1";

    assert_eq!(report.label(key, "fever").unwrap().metrics.confusion().unwrap().tp, 1);
    // Cough is only in the exam, which the short HPI leaves out
    assert_eq!(report.label(key, "cough").unwrap().human_only, 1);
    assert!(report.to_text().contains(TASK_PRES_SX_EPLAB));
}

#[test]
fn test_evaluate_unrun_strategy_is_an_error() {
    let chartlab = Chartlab::in_memory().unwrap();
    assert!(chartlab
        .evaluate(Some(TASK_PRES_SX_EPLAB), Some("presenting_sx.llm"), &EvalOptions::default())
        .is_err());
}

#[test]
fn test_vocabulary_task_counts_true_negatives() {
    let mut chartlab = Chartlab::in_memory().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("notes.txt");
    std::fs::write(&source, "Chief Complaint: feeling unwell\nHPI: Fever since yesterday.\nPhysical Exam:\nClear lungs.\n").unwrap();
    let (episode, _) = chartlab.import_notes_text(&source).unwrap()[0];

    chartlab.extract_sections("hpi_short.regex").unwrap();
    chartlab
        .extract_features("presenting_sx.llm", &RunRequest::new(), &CacheLocation::NoCache)
        .unwrap();
    chartlab
        .extract_episode_labels("presenting_sx.llm", Some(TASK_PRES_SX_EPLAB), &RunRequest::new())
        .unwrap();
    let labels_file = dir.path().join("labels.csv");
    std::fs::write(&labels_file, format!("episode_id,human_labels\n{},fever\n", episode)).unwrap();
    chartlab.import_human_labels(TASK_PRES_SX_EPLAB, &labels_file, "alice").unwrap();

    let options = EvalOptions {
        absent_as_negative: true,
        ..Default::default()
    };
    let report = chartlab
        .evaluate(Some(TASK_PRES_SX_EPLAB), Some("presenting_sx.llm"), &options)
        .unwrap()
        .remove(0);
    let key = "presenting_sx.llm v1";

    assert_eq!(report.label(key, "fever").unwrap().metrics.confusion().unwrap().tp, 1);
    // Neither side mentioned cough, so it is a true negative for the covered episode
    let cough = report.label(key, "cough").unwrap();
    assert_eq!(cough.metrics.confusion().unwrap().tn, 1);
    match &cough.metrics {
        chartlab_core::evaluate::Metrics::Binary(m) => assert_eq!(m.specificity, Some(1.0)),
        other => panic!("unexpected metrics {:?}", other),
    }
}
