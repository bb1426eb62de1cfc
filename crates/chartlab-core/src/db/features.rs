//! Note feature database operations.

use rusqlite::{params, OptionalExtension, Row};

use super::{now_rfc3339, Database, DbResult};
use crate::models::{EpisodeId, FeatureId, NewNoteFeature, NoteFeature, NoteId, StrategyId};

const FEATURE_COLUMNS: &str = "f.id, f.note_id, f.section_id, f.strategy_id, f.feature_name, \
     f.raw_output, f.feature_value, f.extracted_at, f.runtime_secs";

impl Database {
    /// Insert the rows of one invocation in a single transaction with a shared timestamp.
    ///
    /// Any existing (note, feature name, strategy) row aborts the whole batch with
    /// `DbError::Duplicate`, leaving nothing written.
    pub fn insert_features(&mut self, rows: &[NewNoteFeature]) -> DbResult<Vec<NoteFeature>> {
        self.write_features(rows, false)
    }

    /// Insert or replace the rows of one invocation in a single transaction.
    pub fn upsert_features(&mut self, rows: &[NewNoteFeature]) -> DbResult<Vec<NoteFeature>> {
        self.write_features(rows, true)
    }

    fn write_features(&mut self, rows: &[NewNoteFeature], replace: bool) -> DbResult<Vec<NoteFeature>> {
        let extracted_at = now_rfc3339();
        let conflict_clause = if replace {
            r#"
            ON CONFLICT (note_id, feature_name, strategy_id) DO UPDATE SET
                section_id = excluded.section_id,
                raw_output = excluded.raw_output,
                feature_value = excluded.feature_value,
                extracted_at = excluded.extracted_at,
                runtime_secs = excluded.runtime_secs
            "#
        } else {
            ""
        };
        let insert = self.sql(&format!(
            r#"
            INSERT INTO {{p}}note_features (
                note_id, section_id, strategy_id, feature_name,
                raw_output, feature_value, extracted_at, runtime_secs
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            {}
            RETURNING id
            "#,
            conflict_clause
        ));

        let tx = self.conn.transaction()?;
        let mut written = Vec::with_capacity(rows.len());
        {
            let mut stmt = tx.prepare(&insert)?;
            for row in rows {
                let id: FeatureId = stmt.query_row(
                    params![
                        row.note_id,
                        row.section_id,
                        row.strategy_id,
                        row.feature_name,
                        row.raw_output,
                        row.feature_value,
                        extracted_at,
                        row.runtime_secs,
                    ],
                    |r| r.get(0),
                )?;
                written.push(NoteFeature {
                    id,
                    note_id: row.note_id,
                    section_id: row.section_id,
                    strategy_id: row.strategy_id,
                    feature_name: row.feature_name.clone(),
                    raw_output: row.raw_output.clone(),
                    feature_value: row.feature_value.clone(),
                    extracted_at: extracted_at.clone(),
                    runtime_secs: row.runtime_secs,
                });
            }
        }
        tx.commit()?;
        Ok(written)
    }

    /// Feature names a strategy has already written for a note, with their timestamps.
    pub fn existing_features(
        &self,
        note_id: NoteId,
        strategy_id: StrategyId,
    ) -> DbResult<Vec<(String, String)>> {
        let mut stmt = self.conn.prepare(&self.sql(
            r#"
            SELECT feature_name, extracted_at FROM {p}note_features
            WHERE note_id = ?1 AND strategy_id = ?2
            ORDER BY feature_name
            "#,
        ))?;
        let names = stmt
            .query_map(params![note_id, strategy_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    /// Get a feature by ID.
    pub fn get_feature(&self, id: FeatureId) -> DbResult<Option<NoteFeature>> {
        Ok(self
            .conn
            .query_row(
                &self.sql(&format!(
                    "SELECT {} FROM {{p}}note_features f WHERE f.id = ?",
                    FEATURE_COLUMNS
                )),
                [id],
                feature_from_row,
            )
            .optional()?)
    }

    /// Features a strategy wrote for one note, by feature name.
    pub fn list_features_for_note(
        &self,
        note_id: NoteId,
        strategy_id: StrategyId,
    ) -> DbResult<Vec<NoteFeature>> {
        let mut stmt = self.conn.prepare(&self.sql(&format!(
            r#"
            SELECT {} FROM {{p}}note_features f
            WHERE f.note_id = ?1 AND f.strategy_id = ?2
            ORDER BY f.feature_name
            "#,
            FEATURE_COLUMNS
        )))?;
        let features = stmt
            .query_map(params![note_id, strategy_id], feature_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(features)
    }

    /// Features a strategy wrote across an episode's notes, earliest note first.
    pub fn list_features_for_episode(
        &self,
        episode_id: EpisodeId,
        strategy_id: StrategyId,
    ) -> DbResult<Vec<NoteFeature>> {
        let mut stmt = self.conn.prepare(&self.sql(&format!(
            r#"
            SELECT {} FROM {{p}}note_features f
            JOIN {{p}}notes n ON n.id = f.note_id
            WHERE n.episode_id = ?1 AND f.strategy_id = ?2
            ORDER BY COALESCE(n.created_at, n.filed_at, ''), n.id, f.feature_name
            "#,
            FEATURE_COLUMNS
        )))?;
        let features = stmt
            .query_map(params![episode_id, strategy_id], feature_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(features)
    }

    /// Episodes with at least one feature from a strategy.
    pub fn list_episodes_with_features(&self, strategy_id: StrategyId) -> DbResult<Vec<EpisodeId>> {
        let mut stmt = self.conn.prepare(&self.sql(
            r#"
            SELECT DISTINCT n.episode_id FROM {p}note_features f
            JOIN {p}notes n ON n.id = f.note_id
            WHERE f.strategy_id = ?
            ORDER BY n.episode_id
            "#,
        ))?;
        let ids = stmt
            .query_map([strategy_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Notes a strategy has not produced any feature for yet.
    pub fn list_notes_without_features(
        &self,
        strategy_id: StrategyId,
        note_type: Option<&str>,
    ) -> DbResult<Vec<NoteId>> {
        let mut stmt = self.conn.prepare(&self.sql(
            r#"
            SELECT n.id FROM {p}notes n
            WHERE (?2 IS NULL OR n.note_type = ?2)
              AND NOT EXISTS (
                SELECT 1 FROM {p}note_features f
                WHERE f.note_id = n.id AND f.strategy_id = ?1
              )
            ORDER BY n.id
            "#,
        ))?;
        let ids = stmt
            .query_map(params![strategy_id, note_type], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Count feature rows for a (note, strategy), optionally for one feature name.
    pub fn count_features(
        &self,
        note_id: NoteId,
        strategy_id: StrategyId,
        feature_name: Option<&str>,
    ) -> DbResult<i64> {
        let count = self.conn.query_row(
            &self.sql(
                r#"
                SELECT COUNT(*) FROM {p}note_features
                WHERE note_id = ?1 AND strategy_id = ?2
                  AND (?3 IS NULL OR feature_name = ?3)
                "#,
            ),
            params![note_id, strategy_id, feature_name],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn feature_from_row(row: &Row<'_>) -> rusqlite::Result<NoteFeature> {
    Ok(NoteFeature {
        id: row.get(0)?,
        note_id: row.get(1)?,
        section_id: row.get(2)?,
        strategy_id: row.get(3)?,
        feature_name: row.get(4)?,
        raw_output: row.get(5)?,
        feature_value: row.get(6)?,
        extracted_at: row.get(7)?,
        runtime_secs: row.get(8)?,
    })
}
