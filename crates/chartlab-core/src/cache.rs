//! Private per-worker result cache.
//!
//! Advisory only: a hit saves re-invoking an expensive strategy on retry, a miss or a
//! deleted file just costs the invocation. Correctness rests on the store's uniqueness
//! constraints, never on this cache.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;

use crate::models::{InputUnit, StrategyId};

/// Cache errors.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Cache payload error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Identifies one strategy invocation over one exact input text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub unit_kind: &'static str,
    pub unit_id: i64,
    pub strategy_id: StrategyId,
    /// SHA-256 of the input text, hex encoded
    pub text_sha256: String,
}

impl CacheKey {
    pub fn new(unit: &InputUnit, strategy_id: StrategyId) -> Self {
        Self {
            unit_kind: unit.kind(),
            unit_id: unit.unit_id(),
            strategy_id,
            text_sha256: hex::encode(Sha256::digest(unit.text().as_bytes())),
        }
    }
}

/// What a strategy answered, as cached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedInvocation {
    pub raw_output: String,
    pub values: Vec<(String, Option<String>)>,
    /// Set when the output was unusable
    pub failure_reason: Option<String>,
    pub runtime_secs: f64,
}

/// Read-through store for strategy invocations.
pub trait ResultCache: Send {
    fn get(&self, key: &CacheKey) -> CacheResult<Option<CachedInvocation>>;

    fn put(&self, key: &CacheKey, value: &CachedInvocation) -> CacheResult<()>;
}

/// Sentinel cache: every lookup misses, nothing is kept.
pub struct NoCache;

impl ResultCache for NoCache {
    fn get(&self, _key: &CacheKey) -> CacheResult<Option<CachedInvocation>> {
        Ok(None)
    }

    fn put(&self, _key: &CacheKey, _value: &CachedInvocation) -> CacheResult<()> {
        Ok(())
    }
}

const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS invocations (
    unit_kind TEXT NOT NULL,
    unit_id INTEGER NOT NULL,
    strategy_id INTEGER NOT NULL,
    text_sha256 TEXT NOT NULL,
    payload TEXT NOT NULL,                -- JSON CachedInvocation
    cached_at TEXT NOT NULL,
    PRIMARY KEY (unit_kind, unit_id, strategy_id, text_sha256)
);
"#;

/// Cache kept in a worker-private SQLite file.
pub struct SqliteCache {
    conn: Connection,
}

impl SqliteCache {
    /// Open the cache file, creating it and its directory if needed.
    pub fn open<P: AsRef<Path>>(path: P) -> CacheResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(CACHE_SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> CacheResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CACHE_SCHEMA)?;
        Ok(Self { conn })
    }

    /// Number of cached invocations.
    pub fn len(&self) -> CacheResult<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM invocations", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> CacheResult<bool> {
        Ok(self.len()? == 0)
    }
}

impl ResultCache for SqliteCache {
    fn get(&self, key: &CacheKey) -> CacheResult<Option<CachedInvocation>> {
        let payload: Option<String> = self
            .conn
            .query_row(
                r#"
                SELECT payload FROM invocations
                WHERE unit_kind = ?1 AND unit_id = ?2 AND strategy_id = ?3 AND text_sha256 = ?4
                "#,
                params![key.unit_kind, key.unit_id, key.strategy_id, key.text_sha256],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|p| serde_json::from_str(&p))
            .transpose()
            .map_err(CacheError::from)
    }

    fn put(&self, key: &CacheKey, value: &CachedInvocation) -> CacheResult<()> {
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO invocations
                (unit_kind, unit_id, strategy_id, text_sha256, payload, cached_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                key.unit_kind,
                key.unit_id,
                key.strategy_id,
                key.text_sha256,
                serde_json::to_string(value)?,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NoteId;

    fn unit(text: &str) -> InputUnit {
        InputUnit::Note {
            note_id: NoteId(1),
            text: text.into(),
        }
    }

    fn invocation() -> CachedInvocation {
        CachedInvocation {
            raw_output: r#"["fever"]"#.into(),
            values: vec![("presenting_sx".into(), Some("fever".into()))],
            failure_reason: None,
            runtime_secs: 1.5,
        }
    }

    #[test]
    fn test_key_depends_on_text() {
        let a = CacheKey::new(&unit("fever"), StrategyId(1));
        let b = CacheKey::new(&unit("fever "), StrategyId(1));
        assert_ne!(a, b);
        assert_eq!(a.text_sha256.len(), 64);
        assert_eq!(a, CacheKey::new(&unit("fever"), StrategyId(1)));
    }

    #[test]
    fn test_sqlite_cache_round_trip() {
        let cache = SqliteCache::open_in_memory().unwrap();
        let key = CacheKey::new(&unit("fever"), StrategyId(1));
        assert!(cache.get(&key).unwrap().is_none());

        cache.put(&key, &invocation()).unwrap();
        assert_eq!(cache.get(&key).unwrap(), Some(invocation()));
        assert_eq!(cache.len().unwrap(), 1);

        // Edited note text misses
        let edited = CacheKey::new(&unit("no fever"), StrategyId(1));
        assert!(cache.get(&edited).unwrap().is_none());
    }

    #[test]
    fn test_cache_file_created_with_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker-0").join("cache.db");
        let cache = SqliteCache::open(&path).unwrap();
        cache.put(&CacheKey::new(&unit("x"), StrategyId(2)), &invocation()).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_no_cache_never_hits() {
        let key = CacheKey::new(&unit("fever"), StrategyId(1));
        NoCache.put(&key, &invocation()).unwrap();
        assert!(NoCache.get(&key).unwrap().is_none());
    }
}
