//! Database layer for chartlab.

mod episodes;
mod features;
mod labels;
mod schema;
mod strategies;

pub use schema::*;

use rusqlite::{ffi, Connection, ErrorCode};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// How long a writer waits on a locked file store before giving up.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Database errors.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    /// A UNIQUE or PRIMARY KEY constraint rejected the write.
    #[error("Duplicate row: {0}")]
    Duplicate(String),

    /// A foreign key was missing or still referenced.
    #[error("Foreign key violation: {0}")]
    ForeignKey(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Invalid table prefix: {0:?}")]
    InvalidPrefix(String),
}

impl From<rusqlite::Error> for DbError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(failure, message)
                if failure.code == ErrorCode::ConstraintViolation =>
            {
                let message = message.clone().unwrap_or_else(|| failure.to_string());
                match failure.extended_code {
                    ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                        DbError::Duplicate(message)
                    }
                    ffi::SQLITE_CONSTRAINT_FOREIGNKEY => DbError::ForeignKey(message),
                    // ON DELETE/UPDATE RESTRICT actions report as trigger constraints
                    _ if message.contains("FOREIGN KEY constraint failed") => DbError::ForeignKey(message),
                    _ => DbError::Constraint(message),
                }
            }
            _ => DbError::Sqlite(e),
        }
    }
}

impl DbError {
    /// Whether this is a benign uniqueness conflict.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, DbError::Duplicate(_))
    }
}

pub type DbResult<T> = Result<T, DbError>;

/// Database connection wrapper.
///
/// All table and index names carry `prefix`, so several pipelines can share one file.
pub struct Database {
    conn: Connection,
    prefix: String,
}

impl Database {
    /// Open database at path, creating if needed.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        Self::open_with_prefix(path, "")
    }

    /// Open a file store whose tables are named `<prefix><table>`.
    pub fn open_with_prefix<P: AsRef<Path>>(path: P, prefix: &str) -> DbResult<Self> {
        validate_prefix(prefix)?;
        let conn = Connection::open(path)?;
        // Concurrent workers serialise on the write lock instead of failing fast
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            tracing::warn!(mode = %mode, "store did not switch to WAL journaling");
        }
        let db = Self {
            conn,
            prefix: prefix.to_string(),
        };
        db.initialize()?;
        Ok(db)
    }

    /// Create in-memory database (for testing).
    pub fn open_in_memory() -> DbResult<Self> {
        Self::open_in_memory_with_prefix("")
    }

    pub fn open_in_memory_with_prefix(prefix: &str) -> DbResult<Self> {
        validate_prefix(prefix)?;
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn,
            prefix: prefix.to_string(),
        };
        db.initialize()?;
        Ok(db)
    }

    /// Initialize schema. Safe to run against an existing store.
    fn initialize(&self) -> DbResult<()> {
        self.conn.execute_batch(&self.sql(SCHEMA))?;
        Ok(())
    }

    /// Table name prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Substitute the table prefix into a query written with `{p}` placeholders.
    pub fn sql(&self, query: &str) -> String {
        query.replace("{p}", &self.prefix)
    }

    /// Get raw connection (for advanced queries).
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Begin a transaction.
    pub fn transaction(&mut self) -> DbResult<rusqlite::Transaction<'_>> {
        Ok(self.conn.transaction()?)
    }
}

fn validate_prefix(prefix: &str) -> DbResult<()> {
    if prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(DbError::InvalidPrefix(prefix.to_string()))
    }
}

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewEpisode, NewNote};

    fn table_names(db: &Database) -> Vec<String> {
        db.conn()
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory();
        assert!(db.is_ok());
    }

    #[test]
    fn test_schema_initialized() {
        let db = Database::open_in_memory().unwrap();
        let tables = table_names(&db);

        for table in [
            "episodes",
            "notes",
            "note_sections",
            "tasks",
            "strategies",
            "note_features",
            "episode_labels",
            "annotators",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {}", table);
        }
    }

    #[test]
    fn test_prefixed_tables() {
        let db = Database::open_in_memory_with_prefix("llm_").unwrap();
        let tables = table_names(&db);
        assert!(tables.contains(&"llm_notes".to_string()));
        assert!(!tables.contains(&"notes".to_string()));
        assert_eq!(db.sql("SELECT * FROM {p}notes"), "SELECT * FROM llm_notes");
    }

    #[test]
    fn test_rejects_unsafe_prefix() {
        assert!(matches!(
            Database::open_in_memory_with_prefix("x; DROP TABLE notes; --"),
            Err(DbError::InvalidPrefix(_))
        ));
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        drop(Database::open(&path).unwrap());
        let db = Database::open(&path).unwrap();
        assert_eq!(table_names(&db).len(), 8);

        let mode: String = db
            .conn()
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn test_classifies_constraint_errors() {
        let db = Database::open_in_memory().unwrap();
        db.conn()
            .execute("INSERT INTO annotators (username) VALUES ('alice')", [])
            .unwrap();

        let dup: DbError = db
            .conn()
            .execute("INSERT INTO annotators (username) VALUES ('alice')", [])
            .unwrap_err()
            .into();
        assert!(dup.is_duplicate());

        let fk: DbError = db
            .conn()
            .execute(
                "INSERT INTO notes (episode_id, note_ref, note_text) VALUES (999, 'n1', 'x')",
                [],
            )
            .unwrap_err()
            .into();
        assert!(matches!(fk, DbError::ForeignKey(_)));
    }

    #[test]
    fn test_restricted_delete_is_foreign_key() {
        let db = Database::open_in_memory().unwrap();
        let episode = db.insert_episode(&NewEpisode::new("MRN001")).unwrap();
        db.insert_note(&NewNote::new(episode, "N1", "fever")).unwrap();

        let err = db.delete_episode(episode).unwrap_err();
        assert!(matches!(err, DbError::ForeignKey(_)), "{:?}", err);
        assert!(!err.is_duplicate());
    }
}
