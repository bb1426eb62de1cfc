//! SQLite schema definition.

/// Complete database schema for chartlab. `{p}` is replaced by the table prefix.
pub const SCHEMA: &str = r#"
-- Enable foreign keys
PRAGMA foreign_keys = ON;

-- ============================================================================
-- Episodes and Notes (imported, immutable)
-- ============================================================================

CREATE TABLE IF NOT EXISTS {p}episodes (
    id INTEGER PRIMARY KEY,
    patient_id TEXT NOT NULL,
    start_at TEXT NOT NULL,
    admit_encounter_id TEXT,
    discharge_encounter_id TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS {p}idx_episodes_patient ON {p}episodes(patient_id);

CREATE TABLE IF NOT EXISTS {p}notes (
    id INTEGER PRIMARY KEY,
    episode_id INTEGER NOT NULL
        REFERENCES {p}episodes(id) ON DELETE RESTRICT ON UPDATE RESTRICT,
    note_ref TEXT NOT NULL UNIQUE,
    encounter_id TEXT,
    author TEXT,
    service TEXT,
    note_type TEXT,
    created_at TEXT,
    filed_at TEXT,
    last_modified_at TEXT,
    note_text TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS {p}idx_notes_episode ON {p}notes(episode_id);

CREATE TRIGGER IF NOT EXISTS {p}episodes_immutable BEFORE UPDATE ON {p}episodes BEGIN
    SELECT RAISE(ABORT, 'episodes are immutable');
END;

CREATE TRIGGER IF NOT EXISTS {p}notes_immutable BEFORE UPDATE ON {p}notes BEGIN
    SELECT RAISE(ABORT, 'notes are immutable');
END;

-- ============================================================================
-- Tasks and Strategies (reference data, registered lazily)
-- ============================================================================

CREATE TABLE IF NOT EXISTS {p}tasks (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    output_type TEXT NOT NULL
        CHECK (output_type IN ('section', 'feature', 'episode_label')),
    value_kind TEXT NOT NULL DEFAULT 'binary'
        CHECK (value_kind IN ('binary', 'ordinal', 'continuous')),
    description TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS {p}strategies (
    id INTEGER PRIMARY KEY,
    task_id INTEGER NOT NULL
        REFERENCES {p}tasks(id) ON DELETE RESTRICT ON UPDATE RESTRICT,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    version TEXT NOT NULL,
    last_updated TEXT NOT NULL,           -- YYYY-MM-DD
    UNIQUE (task_id, name, version)
);

CREATE TRIGGER IF NOT EXISTS {p}strategies_immutable BEFORE UPDATE ON {p}strategies BEGIN
    SELECT RAISE(ABORT, 'strategies are immutable; register a new version');
END;

-- ============================================================================
-- Sections and Features (strategy output)
-- ============================================================================

CREATE TABLE IF NOT EXISTS {p}note_sections (
    id INTEGER PRIMARY KEY,
    note_id INTEGER NOT NULL
        REFERENCES {p}notes(id) ON DELETE RESTRICT ON UPDATE RESTRICT,
    section_name TEXT NOT NULL,
    section_text TEXT NOT NULL,
    strategy_id INTEGER NOT NULL
        REFERENCES {p}strategies(id) ON DELETE RESTRICT ON UPDATE RESTRICT,
    updated_at TEXT NOT NULL,
    UNIQUE (note_id, section_name, strategy_id)
);

CREATE INDEX IF NOT EXISTS {p}idx_sections_name ON {p}note_sections(section_name);

CREATE TABLE IF NOT EXISTS {p}note_features (
    id INTEGER PRIMARY KEY,
    note_id INTEGER NOT NULL
        REFERENCES {p}notes(id) ON DELETE RESTRICT ON UPDATE RESTRICT,
    section_id INTEGER
        REFERENCES {p}note_sections(id) ON DELETE RESTRICT ON UPDATE RESTRICT,
    strategy_id INTEGER NOT NULL
        REFERENCES {p}strategies(id) ON DELETE RESTRICT ON UPDATE RESTRICT,
    feature_name TEXT NOT NULL,
    raw_output TEXT NOT NULL,
    feature_value TEXT,                   -- NULL records a strategy failure
    extracted_at TEXT NOT NULL,
    runtime_secs REAL NOT NULL DEFAULT 0,
    UNIQUE (note_id, feature_name, strategy_id)
);

CREATE INDEX IF NOT EXISTS {p}idx_features_strategy ON {p}note_features(strategy_id, note_id);

-- ============================================================================
-- Annotators and Episode Labels
-- ============================================================================

CREATE TABLE IF NOT EXISTS {p}annotators (
    username TEXT PRIMARY KEY,
    credential TEXT,
    admin INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS {p}episode_labels (
    id INTEGER PRIMARY KEY,
    episode_id INTEGER NOT NULL
        REFERENCES {p}episodes(id) ON DELETE RESTRICT ON UPDATE RESTRICT,
    task_id INTEGER NOT NULL
        REFERENCES {p}tasks(id) ON DELETE RESTRICT ON UPDATE RESTRICT,
    note_feature_id INTEGER
        REFERENCES {p}note_features(id) ON DELETE RESTRICT ON UPDATE RESTRICT,
    strategy_id INTEGER
        REFERENCES {p}strategies(id) ON DELETE RESTRICT ON UPDATE RESTRICT,
    annotator TEXT
        REFERENCES {p}annotators(username) ON DELETE RESTRICT ON UPDATE RESTRICT,
    label_name TEXT NOT NULL,
    label_value REAL NOT NULL,
    line_number INTEGER,
    created_at TEXT NOT NULL,
    -- exactly one provenance
    CHECK ((strategy_id IS NULL) <> (annotator IS NULL))
);

-- One unique index per provenance arm; plain UNIQUE treats NULLs as distinct
CREATE UNIQUE INDEX IF NOT EXISTS {p}uq_labels_strategy
    ON {p}episode_labels(episode_id, task_id, strategy_id, label_name)
    WHERE strategy_id IS NOT NULL;

CREATE UNIQUE INDEX IF NOT EXISTS {p}uq_labels_annotator
    ON {p}episode_labels(episode_id, task_id, annotator, label_name)
    WHERE annotator IS NOT NULL;

CREATE INDEX IF NOT EXISTS {p}idx_labels_task ON {p}episode_labels(task_id, label_name);
"#;

#[cfg(test)]
mod tests {
    use crate::db::{Database, DbError};

    fn seed(db: &Database) {
        db.conn()
            .execute_batch(
                r#"
                INSERT INTO episodes (id, patient_id, start_at, created_at)
                    VALUES (1, 'MRN1', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z');
                INSERT INTO tasks (id, name, output_type) VALUES (1, 'presenting_sx', 'feature');
                INSERT INTO strategies (id, task_id, name, version, last_updated)
                    VALUES (1, 1, 'regex', '1', '2024-01-01');
                INSERT INTO annotators (username) VALUES ('alice');
                "#,
            )
            .unwrap();
    }

    fn insert_label(db: &Database, strategy: Option<i64>, annotator: Option<&str>) -> Result<usize, DbError> {
        db.conn()
            .execute(
                r#"
                INSERT INTO episode_labels
                    (episode_id, task_id, strategy_id, annotator, label_name, label_value, created_at)
                VALUES (1, 1, ?1, ?2, 'fever', 1.0, '2024-01-01T00:00:00Z')
                "#,
                rusqlite::params![strategy, annotator],
            )
            .map_err(DbError::from)
    }

    #[test]
    fn test_label_requires_exactly_one_provenance() {
        let db = Database::open_in_memory().unwrap();
        seed(&db);

        assert!(matches!(insert_label(&db, None, None), Err(DbError::Constraint(_))));
        assert!(matches!(
            insert_label(&db, Some(1), Some("alice")),
            Err(DbError::Constraint(_))
        ));
        assert!(insert_label(&db, Some(1), None).is_ok());
        assert!(insert_label(&db, None, Some("alice")).is_ok());
    }

    #[test]
    fn test_label_uniqueness_per_provenance_arm() {
        let db = Database::open_in_memory().unwrap();
        seed(&db);

        insert_label(&db, Some(1), None).unwrap();
        insert_label(&db, None, Some("alice")).unwrap();

        assert!(insert_label(&db, Some(1), None).unwrap_err().is_duplicate());
        assert!(insert_label(&db, None, Some("alice")).unwrap_err().is_duplicate());
    }

    #[test]
    fn test_strategies_are_immutable() {
        let db = Database::open_in_memory().unwrap();
        seed(&db);

        let err: DbError = db
            .conn()
            .execute("UPDATE strategies SET version = '2' WHERE id = 1", [])
            .unwrap_err()
            .into();
        assert!(matches!(err, DbError::Constraint(_)));
    }
}
