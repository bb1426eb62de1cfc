//! Episode, note and section database operations.

use rusqlite::{params, OptionalExtension, Row};

use super::{now_rfc3339, Database, DbResult};
use crate::models::{
    Episode, EpisodeId, NewEpisode, NewNote, Note, NoteId, Section, SectionId, StrategyId,
};

const NOTE_COLUMNS: &str = "id, episode_id, note_ref, encounter_id, author, service, note_type, \
     created_at, filed_at, last_modified_at, note_text";

impl Database {
    /// Insert a new episode.
    pub fn insert_episode(&self, episode: &NewEpisode) -> DbResult<EpisodeId> {
        self.conn.execute(
            &self.sql(
                r#"
                INSERT INTO {p}episodes (
                    patient_id, start_at, admit_encounter_id, discharge_encounter_id, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
            ),
            params![
                episode.patient_id,
                episode.start_at,
                episode.admit_encounter_id,
                episode.discharge_encounter_id,
                now_rfc3339(),
            ],
        )?;
        Ok(EpisodeId(self.conn.last_insert_rowid()))
    }

    /// Get an episode by ID.
    pub fn get_episode(&self, id: EpisodeId) -> DbResult<Option<Episode>> {
        Ok(self
            .conn
            .query_row(
                &self.sql(
                    r#"
                    SELECT id, patient_id, start_at, admit_encounter_id,
                           discharge_encounter_id, created_at
                    FROM {p}episodes
                    WHERE id = ?
                    "#,
                ),
                [id],
                episode_from_row,
            )
            .optional()?)
    }

    /// List all episode IDs in ascending order.
    pub fn list_episode_ids(&self) -> DbResult<Vec<EpisodeId>> {
        let mut stmt = self
            .conn
            .prepare(&self.sql("SELECT id FROM {p}episodes ORDER BY id"))?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Delete an episode. Fails while notes or labels reference it.
    pub fn delete_episode(&self, id: EpisodeId) -> DbResult<bool> {
        let rows_affected = self
            .conn
            .execute(&self.sql("DELETE FROM {p}episodes WHERE id = ?"), [id])?;
        Ok(rows_affected > 0)
    }

    /// Insert a new note.
    pub fn insert_note(&self, note: &NewNote) -> DbResult<NoteId> {
        self.conn.execute(
            &self.sql(
                r#"
                INSERT INTO {p}notes (
                    episode_id, note_ref, encounter_id, author, service, note_type,
                    created_at, filed_at, last_modified_at, note_text
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
            ),
            params![
                note.episode_id,
                note.note_ref,
                note.encounter_id,
                note.author,
                note.service,
                note.note_type,
                note.created_at,
                note.filed_at,
                note.last_modified_at,
                note.note_text,
            ],
        )?;
        Ok(NoteId(self.conn.last_insert_rowid()))
    }

    /// Import bare note texts in one transaction, each under a new episode of its own.
    ///
    /// Patient, encounter and note references are generated.
    pub fn import_note_texts(&mut self, texts: &[String]) -> DbResult<Vec<(EpisodeId, NoteId)>> {
        let now = now_rfc3339();
        let insert_episode = self.sql(
            r#"
            INSERT INTO {p}episodes (
                patient_id, start_at, admit_encounter_id, discharge_encounter_id, created_at
            ) VALUES (?1, ?2, ?3, ?3, ?2)
            "#,
        );
        let insert_note = self.sql(
            r#"
            INSERT INTO {p}notes (episode_id, note_ref, encounter_id, created_at, note_text)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        );

        let tx = self.conn.transaction()?;
        let mut imported = Vec::with_capacity(texts.len());
        for text in texts {
            let encounter_id = uuid::Uuid::new_v4().simple().to_string();
            tx.execute(&insert_episode, params![format!("T{}", encounter_id), now, encounter_id])?;
            let episode_id = EpisodeId(tx.last_insert_rowid());
            tx.execute(&insert_note, params![episode_id, encounter_id, encounter_id, now, text])?;
            imported.push((episode_id, NoteId(tx.last_insert_rowid())));
        }
        tx.commit()?;
        Ok(imported)
    }

    /// Get a note by ID.
    pub fn get_note(&self, id: NoteId) -> DbResult<Option<Note>> {
        Ok(self
            .conn
            .query_row(
                &self.sql(&format!("SELECT {} FROM {{p}}notes WHERE id = ?", NOTE_COLUMNS)),
                [id],
                note_from_row,
            )
            .optional()?)
    }

    /// Get a note by its external reference.
    pub fn get_note_by_ref(&self, note_ref: &str) -> DbResult<Option<Note>> {
        Ok(self
            .conn
            .query_row(
                &self.sql(&format!(
                    "SELECT {} FROM {{p}}notes WHERE note_ref = ?",
                    NOTE_COLUMNS
                )),
                [note_ref],
                note_from_row,
            )
            .optional()?)
    }

    /// List an episode's notes, earliest first.
    pub fn list_notes_for_episode(&self, episode_id: EpisodeId) -> DbResult<Vec<Note>> {
        let mut stmt = self.conn.prepare(&self.sql(&format!(
            r#"
            SELECT {} FROM {{p}}notes
            WHERE episode_id = ?
            ORDER BY COALESCE(created_at, filed_at, ''), id
            "#,
            NOTE_COLUMNS
        )))?;
        let notes = stmt
            .query_map([episode_id], note_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(notes)
    }

    /// List all note IDs in ascending order, optionally restricted to one note type.
    pub fn list_note_ids(&self, note_type: Option<&str>) -> DbResult<Vec<NoteId>> {
        let mut stmt = self.conn.prepare(&self.sql(
            r#"
            SELECT id FROM {p}notes
            WHERE ?1 IS NULL OR note_type = ?1
            ORDER BY id
            "#,
        ))?;
        let ids = stmt
            .query_map([note_type], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Notes with no sections yet from a segmentation strategy.
    pub fn list_notes_without_sections(&self, strategy_id: StrategyId) -> DbResult<Vec<NoteId>> {
        let mut stmt = self.conn.prepare(&self.sql(
            r#"
            SELECT n.id FROM {p}notes n
            WHERE NOT EXISTS (
                SELECT 1 FROM {p}note_sections s
                WHERE s.note_id = n.id AND s.strategy_id = ?
            )
            ORDER BY n.id
            "#,
        ))?;
        let ids = stmt
            .query_map([strategy_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Whether a segmentation strategy has written any section for a note.
    pub fn sections_exist(&self, note_id: NoteId, strategy_id: StrategyId) -> DbResult<bool> {
        let exists: bool = self.conn.query_row(
            &self.sql(
                "SELECT EXISTS (SELECT 1 FROM {p}note_sections WHERE note_id = ?1 AND strategy_id = ?2)",
            ),
            params![note_id, strategy_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Insert all sections from one segmentation run in a single transaction.
    ///
    /// A duplicate (note, section name, strategy) aborts the whole batch.
    pub fn insert_sections(
        &mut self,
        note_id: NoteId,
        strategy_id: StrategyId,
        sections: &[(String, String)],
    ) -> DbResult<Vec<Section>> {
        let updated_at = now_rfc3339();
        let insert = self.sql(
            r#"
            INSERT INTO {p}note_sections (note_id, section_name, section_text, strategy_id, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        );

        let tx = self.conn.transaction()?;
        let mut inserted = Vec::with_capacity(sections.len());
        {
            let mut stmt = tx.prepare(&insert)?;
            for (section_name, section_text) in sections {
                stmt.execute(params![note_id, section_name, section_text, strategy_id, updated_at])?;
                inserted.push(Section {
                    id: SectionId(tx.last_insert_rowid()),
                    note_id,
                    section_name: section_name.clone(),
                    section_text: section_text.clone(),
                    strategy_id,
                    updated_at: updated_at.clone(),
                });
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Get a section by ID.
    pub fn get_section(&self, id: SectionId) -> DbResult<Option<Section>> {
        Ok(self
            .conn
            .query_row(
                &self.sql(
                    r#"
                    SELECT id, note_id, section_name, section_text, strategy_id, updated_at
                    FROM {p}note_sections WHERE id = ?
                    "#,
                ),
                [id],
                section_from_row,
            )
            .optional()?)
    }

    /// Sections with a given name for a note, from any segmentation strategy.
    pub fn list_sections_for_note(&self, note_id: NoteId, section_name: &str) -> DbResult<Vec<Section>> {
        let mut stmt = self.conn.prepare(&self.sql(
            r#"
            SELECT id, note_id, section_name, section_text, strategy_id, updated_at
            FROM {p}note_sections
            WHERE note_id = ?1 AND section_name = ?2
            ORDER BY id
            "#,
        ))?;
        let sections = stmt
            .query_map(params![note_id, section_name], section_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sections)
    }
}

fn episode_from_row(row: &Row<'_>) -> rusqlite::Result<Episode> {
    Ok(Episode {
        id: row.get(0)?,
        patient_id: row.get(1)?,
        start_at: row.get(2)?,
        admit_encounter_id: row.get(3)?,
        discharge_encounter_id: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn note_from_row(row: &Row<'_>) -> rusqlite::Result<Note> {
    Ok(Note {
        id: row.get(0)?,
        episode_id: row.get(1)?,
        note_ref: row.get(2)?,
        encounter_id: row.get(3)?,
        author: row.get(4)?,
        service: row.get(5)?,
        note_type: row.get(6)?,
        created_at: row.get(7)?,
        filed_at: row.get(8)?,
        last_modified_at: row.get(9)?,
        note_text: row.get(10)?,
    })
}

fn section_from_row(row: &Row<'_>) -> rusqlite::Result<Section> {
    Ok(Section {
        id: row.get(0)?,
        note_id: row.get(1)?,
        section_name: row.get(2)?,
        section_text: row.get(3)?,
        strategy_id: row.get(4)?,
        updated_at: row.get(5)?,
    })
}
