//! Episode label and annotator database operations.

use rusqlite::{params, OptionalExtension, Transaction};

use super::{now_rfc3339, Database, DbError, DbResult};
use crate::models::{
    round_label_value, Annotator, EpisodeId, EpisodeLabel, FeatureId, LabelId, NewEpisodeLabel,
    NoteId, Provenance, StrategyId, TaskId,
};

const LABEL_COLUMNS: &str = "id, episode_id, task_id, note_feature_id, strategy_id, annotator, \
     label_name, label_value, line_number, created_at";

impl Database {
    /// Create an annotator if missing.
    pub fn ensure_annotator(&self, annotator: &Annotator) -> DbResult<()> {
        self.conn.execute(
            &self.sql(
                r#"
                INSERT INTO {p}annotators (username, credential, admin) VALUES (?1, ?2, ?3)
                ON CONFLICT (username) DO NOTHING
                "#,
            ),
            params![annotator.username, annotator.credential, annotator.admin],
        )?;
        Ok(())
    }

    /// Get an annotator by username.
    pub fn get_annotator(&self, username: &str) -> DbResult<Option<Annotator>> {
        Ok(self
            .conn
            .query_row(
                &self.sql("SELECT username, credential, admin FROM {p}annotators WHERE username = ?"),
                [username],
                |row| {
                    Ok(Annotator {
                        username: row.get(0)?,
                        credential: row.get(1)?,
                        admin: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    /// Delete an annotator. Fails while labels reference them.
    pub fn delete_annotator(&self, username: &str) -> DbResult<bool> {
        let rows_affected = self
            .conn
            .execute(&self.sql("DELETE FROM {p}annotators WHERE username = ?"), [username])?;
        Ok(rows_affected > 0)
    }

    /// Insert a single label. A second label with the same key is rejected as a duplicate.
    pub fn insert_label(&self, label: &NewEpisodeLabel) -> DbResult<EpisodeLabel> {
        insert_label_with(&self.conn, &self.prefix, label, &now_rfc3339())
    }

    /// Insert or update a human label on (episode, task, annotator, label name).
    pub fn upsert_human_label(&self, label: &NewEpisodeLabel) -> DbResult<EpisodeLabel> {
        let annotator = label.provenance.annotator().ok_or_else(|| {
            DbError::Constraint("upsert_human_label needs human provenance".into())
        })?;
        let id: LabelId = self.conn.query_row(
            &self.sql(
                r#"
                INSERT INTO {p}episode_labels (
                    episode_id, task_id, note_feature_id, strategy_id, annotator,
                    label_name, label_value, line_number, created_at
                ) VALUES (?1, ?2, NULL, NULL, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT (episode_id, task_id, annotator, label_name)
                    WHERE annotator IS NOT NULL
                DO UPDATE SET
                    label_value = excluded.label_value,
                    line_number = excluded.line_number,
                    created_at = excluded.created_at
                RETURNING id
                "#,
            ),
            params![
                label.episode_id,
                label.task_id,
                annotator,
                label.label_name,
                round_label_value(label.label_value),
                label.line_number,
                now_rfc3339(),
            ],
            |row| row.get(0),
        )?;
        self.get_label(id)?
            .ok_or_else(|| DbError::NotFound(format!("label {}", id)))
    }

    /// Get a label by ID.
    pub fn get_label(&self, id: LabelId) -> DbResult<Option<EpisodeLabel>> {
        self.conn
            .query_row(
                &self.sql(&format!(
                    "SELECT {} FROM {{p}}episode_labels WHERE id = ?",
                    LABEL_COLUMNS
                )),
                [id],
                label_row,
            )
            .optional()?
            .map(|row| row.try_into())
            .transpose()
    }

    /// Whether a strategy already has labels for (episode, task).
    pub fn strategy_labels_exist(
        &self,
        episode_id: EpisodeId,
        task_id: TaskId,
        strategy_id: StrategyId,
    ) -> DbResult<bool> {
        let exists: bool = self.conn.query_row(
            &self.sql(
                r#"
                SELECT EXISTS (
                    SELECT 1 FROM {p}episode_labels
                    WHERE episode_id = ?1 AND task_id = ?2 AND strategy_id = ?3
                )
                "#,
            ),
            params![episode_id, task_id, strategy_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Insert a strategy's labels for (episode, task) in one transaction.
    ///
    /// Fails with `DbError::Duplicate`, writing nothing, if any label already exists.
    pub fn insert_strategy_labels(
        &mut self,
        episode_id: EpisodeId,
        task_id: TaskId,
        strategy_id: StrategyId,
        labels: &[NewEpisodeLabel],
    ) -> DbResult<Vec<EpisodeLabel>> {
        check_batch(labels, episode_id, task_id, &Provenance::Strategy(strategy_id))?;
        let prefix = self.prefix.clone();

        let tx = self.conn.transaction()?;
        let written = insert_batch(&tx, &prefix, labels)?;
        tx.commit()?;
        Ok(written)
    }

    /// Atomically replace a strategy's labels for (episode, task).
    ///
    /// Every label must carry `Provenance::Strategy(strategy_id)`.
    pub fn replace_strategy_labels(
        &mut self,
        episode_id: EpisodeId,
        task_id: TaskId,
        strategy_id: StrategyId,
        labels: &[NewEpisodeLabel],
    ) -> DbResult<Vec<EpisodeLabel>> {
        check_batch(labels, episode_id, task_id, &Provenance::Strategy(strategy_id))?;
        let delete = self.sql(
            "DELETE FROM {p}episode_labels WHERE episode_id = ?1 AND task_id = ?2 AND strategy_id = ?3",
        );
        let prefix = self.prefix.clone();

        let tx = self.conn.transaction()?;
        tx.execute(&delete, params![episode_id, task_id, strategy_id])?;
        let written = insert_batch(&tx, &prefix, labels)?;
        tx.commit()?;
        Ok(written)
    }

    /// Atomically replace an annotator's labels for (episode, task).
    pub fn replace_annotator_labels(
        &mut self,
        episode_id: EpisodeId,
        task_id: TaskId,
        annotator: &str,
        labels: &[NewEpisodeLabel],
    ) -> DbResult<Vec<EpisodeLabel>> {
        check_batch(labels, episode_id, task_id, &Provenance::Human(annotator.to_string()))?;
        let delete = self.sql(
            "DELETE FROM {p}episode_labels WHERE episode_id = ?1 AND task_id = ?2 AND annotator = ?3",
        );
        let prefix = self.prefix.clone();

        let tx = self.conn.transaction()?;
        tx.execute(&delete, params![episode_id, task_id, annotator])?;
        let written = insert_batch(&tx, &prefix, labels)?;
        tx.commit()?;
        Ok(written)
    }

    /// All labels for a task, ordered by (episode, label name, id).
    pub fn list_labels_for_task(&self, task_id: TaskId) -> DbResult<Vec<EpisodeLabel>> {
        let mut stmt = self.conn.prepare(&self.sql(&format!(
            r#"
            SELECT {} FROM {{p}}episode_labels
            WHERE task_id = ?
            ORDER BY episode_id, label_name, id
            "#,
            LABEL_COLUMNS
        )))?;
        let rows = stmt.query_map([task_id], label_row)?;

        let mut labels = Vec::new();
        for row in rows {
            labels.push(row?.try_into()?);
        }
        Ok(labels)
    }

    /// Labels for one episode and task.
    pub fn list_labels_for_episode(
        &self,
        episode_id: EpisodeId,
        task_id: TaskId,
    ) -> DbResult<Vec<EpisodeLabel>> {
        let mut stmt = self.conn.prepare(&self.sql(&format!(
            r#"
            SELECT {} FROM {{p}}episode_labels
            WHERE episode_id = ?1 AND task_id = ?2
            ORDER BY label_name, id
            "#,
            LABEL_COLUMNS
        )))?;
        let rows = stmt.query_map(params![episode_id, task_id], label_row)?;

        let mut labels = Vec::new();
        for row in rows {
            labels.push(row?.try_into()?);
        }
        Ok(labels)
    }

    /// Episodes with at least one human label for a task.
    pub fn list_annotated_episodes(&self, task_id: TaskId) -> DbResult<Vec<EpisodeId>> {
        let mut stmt = self.conn.prepare(&self.sql(
            r#"
            SELECT DISTINCT episode_id FROM {p}episode_labels
            WHERE task_id = ? AND annotator IS NOT NULL
            ORDER BY episode_id
            "#,
        ))?;
        let ids = stmt
            .query_map([task_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Notes belonging to episodes with human labels for a task.
    pub fn list_notes_annotated_for_task(&self, task_id: TaskId) -> DbResult<Vec<NoteId>> {
        let mut stmt = self.conn.prepare(&self.sql(
            r#"
            SELECT n.id FROM {p}notes n
            WHERE EXISTS (
                SELECT 1 FROM {p}episode_labels l
                WHERE l.episode_id = n.episode_id AND l.task_id = ? AND l.annotator IS NOT NULL
            )
            ORDER BY n.id
            "#,
        ))?;
        let ids = stmt
            .query_map([task_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}

fn check_batch(
    labels: &[NewEpisodeLabel],
    episode_id: EpisodeId,
    task_id: TaskId,
    provenance: &Provenance,
) -> DbResult<()> {
    for label in labels {
        if label.episode_id != episode_id || label.task_id != task_id || &label.provenance != provenance {
            return Err(DbError::Constraint(format!(
                "label {:?} does not belong to episode {} task {} {}",
                label.label_name, episode_id, task_id, provenance
            )));
        }
    }
    Ok(())
}

fn insert_batch(tx: &Transaction<'_>, prefix: &str, labels: &[NewEpisodeLabel]) -> DbResult<Vec<EpisodeLabel>> {
    let created_at = now_rfc3339();
    labels
        .iter()
        .map(|label| insert_label_with(tx, prefix, label, &created_at))
        .collect()
}

fn insert_label_with(
    conn: &rusqlite::Connection,
    prefix: &str,
    label: &NewEpisodeLabel,
    created_at: &str,
) -> DbResult<EpisodeLabel> {
    let label_value = round_label_value(label.label_value);
    let id: LabelId = conn.query_row(
        &format!(
            r#"
            INSERT INTO {}episode_labels (
                episode_id, task_id, note_feature_id, strategy_id, annotator,
                label_name, label_value, line_number, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            RETURNING id
            "#,
            prefix
        ),
        params![
            label.episode_id,
            label.task_id,
            label.note_feature_id,
            label.provenance.strategy_id(),
            label.provenance.annotator(),
            label.label_name,
            label_value,
            label.line_number,
            created_at,
        ],
        |row| row.get(0),
    )?;
    Ok(EpisodeLabel {
        id,
        episode_id: label.episode_id,
        task_id: label.task_id,
        note_feature_id: label.note_feature_id,
        provenance: label.provenance.clone(),
        label_name: label.label_name.clone(),
        label_value,
        line_number: label.line_number,
        created_at: created_at.to_string(),
    })
}

/// Intermediate row struct for database mapping.
struct LabelRow {
    id: LabelId,
    episode_id: EpisodeId,
    task_id: TaskId,
    note_feature_id: Option<FeatureId>,
    strategy_id: Option<StrategyId>,
    annotator: Option<String>,
    label_name: String,
    label_value: f64,
    line_number: Option<i64>,
    created_at: String,
}

fn label_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LabelRow> {
    Ok(LabelRow {
        id: row.get(0)?,
        episode_id: row.get(1)?,
        task_id: row.get(2)?,
        note_feature_id: row.get(3)?,
        strategy_id: row.get(4)?,
        annotator: row.get(5)?,
        label_name: row.get(6)?,
        label_value: row.get(7)?,
        line_number: row.get(8)?,
        created_at: row.get(9)?,
    })
}

impl TryFrom<LabelRow> for EpisodeLabel {
    type Error = DbError;

    fn try_from(row: LabelRow) -> Result<Self, Self::Error> {
        let provenance = match (row.strategy_id, row.annotator) {
            (Some(strategy_id), None) => Provenance::Strategy(strategy_id),
            (None, Some(username)) => Provenance::Human(username),
            _ => {
                return Err(DbError::Constraint(format!(
                    "label {} has invalid provenance",
                    row.id
                )))
            }
        };

        Ok(EpisodeLabel {
            id: row.id,
            episode_id: row.episode_id,
            task_id: row.task_id,
            note_feature_id: row.note_feature_id,
            provenance,
            label_name: row.label_name,
            label_value: row.label_value,
            line_number: row.line_number,
            created_at: row.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewEpisode, NewNote, OutputType, StrategyDef, TaskDef, ValueKind};

    struct Fixture {
        db: Database,
        episode_id: EpisodeId,
        task_id: TaskId,
        strategy_id: StrategyId,
    }

    fn setup_db() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let episode_id = db.insert_episode(&NewEpisode::new("MRN001")).unwrap();
        let task = TaskDef::new("presenting_sx", OutputType::EpisodeLabel, ValueKind::Binary);
        let task_id = db.get_or_register_task(&task).unwrap().id;
        let strategy_id = db
            .get_or_register_strategy(
                &task,
                &StrategyDef {
                    name: "regex".into(),
                    version: "1".into(),
                    description: String::new(),
                    last_updated: chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                },
            )
            .unwrap()
            .id;
        db.ensure_annotator(&Annotator::new("alice")).unwrap();
        Fixture {
            db,
            episode_id,
            task_id,
            strategy_id,
        }
    }

    fn label(f: &Fixture, provenance: Provenance, name: &str, value: f64) -> NewEpisodeLabel {
        NewEpisodeLabel {
            episode_id: f.episode_id,
            task_id: f.task_id,
            note_feature_id: None,
            provenance,
            label_name: name.into(),
            label_value: value,
            line_number: None,
        }
    }

    #[test]
    fn test_insert_label_rejects_duplicates() {
        let f = setup_db();
        let auto = label(&f, Provenance::Strategy(f.strategy_id), "fever", 1.0);
        f.db.insert_label(&auto).unwrap();
        assert!(f.db.insert_label(&auto).unwrap_err().is_duplicate());

        // Same key under the other provenance arm is a different label
        let human = label(&f, Provenance::Human("alice".into()), "fever", 1.0);
        f.db.insert_label(&human).unwrap();
        assert_eq!(f.db.list_labels_for_task(f.task_id).unwrap().len(), 2);
    }

    #[test]
    fn test_upsert_human_label() {
        let f = setup_db();
        let first = f
            .db
            .upsert_human_label(&label(&f, Provenance::Human("alice".into()), "fever", 1.0))
            .unwrap();
        let second = f
            .db
            .upsert_human_label(&label(&f, Provenance::Human("alice".into()), "fever", 0.333333333))
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.label_value, 0.33333);
        assert_eq!(f.db.list_labels_for_task(f.task_id).unwrap().len(), 1);
    }

    #[test]
    fn test_upsert_rejects_strategy_provenance() {
        let f = setup_db();
        let auto = label(&f, Provenance::Strategy(f.strategy_id), "fever", 1.0);
        assert!(matches!(f.db.upsert_human_label(&auto), Err(DbError::Constraint(_))));
    }

    #[test]
    fn test_unknown_annotator_is_foreign_key_error() {
        let f = setup_db();
        let err = f
            .db
            .insert_label(&label(&f, Provenance::Human("mallory".into()), "fever", 1.0))
            .unwrap_err();
        assert!(matches!(err, DbError::ForeignKey(_)));
    }

    #[test]
    fn test_replace_strategy_labels() {
        let mut f = setup_db();
        let provenance = Provenance::Strategy(f.strategy_id);
        let batch = vec![
            label(&f, provenance.clone(), "fever", 1.0),
            label(&f, provenance.clone(), "cough", 0.0),
        ];
        let (episode_id, task_id, strategy_id) = (f.episode_id, f.task_id, f.strategy_id);
        f.db.replace_strategy_labels(episode_id, task_id, strategy_id, &batch)
            .unwrap();
        assert!(f.db.strategy_labels_exist(episode_id, task_id, strategy_id).unwrap());

        let replacement = vec![label(&f, provenance, "fever", 0.0)];
        let written = f
            .db
            .replace_strategy_labels(episode_id, task_id, strategy_id, &replacement)
            .unwrap();
        assert_eq!(written.len(), 1);

        let stored = f.db.list_labels_for_episode(episode_id, task_id).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].label_value, 0.0);
    }

    #[test]
    fn test_replace_rejects_foreign_labels() {
        let mut f = setup_db();
        let human = vec![label(&f, Provenance::Human("alice".into()), "fever", 1.0)];
        let (episode_id, task_id, strategy_id) = (f.episode_id, f.task_id, f.strategy_id);
        assert!(matches!(
            f.db.replace_strategy_labels(episode_id, task_id, strategy_id, &human),
            Err(DbError::Constraint(_))
        ));
    }

    #[test]
    fn test_annotated_for_task() {
        let f = setup_db();
        let other = f.db.insert_episode(&NewEpisode::new("MRN002")).unwrap();
        let annotated_note = f.db.insert_note(&NewNote::new(f.episode_id, "N1", "fever")).unwrap();
        let automated_note = f.db.insert_note(&NewNote::new(other, "N2", "cough")).unwrap();

        f.db.insert_label(&label(&f, Provenance::Human("alice".into()), "fever", 1.0))
            .unwrap();
        let mut automated = label(&f, Provenance::Strategy(f.strategy_id), "cough", 1.0);
        automated.episode_id = other;
        f.db.insert_label(&automated).unwrap();

        assert_eq!(f.db.list_annotated_episodes(f.task_id).unwrap(), vec![f.episode_id]);
        let notes = f.db.list_notes_annotated_for_task(f.task_id).unwrap();
        assert_eq!(notes, vec![annotated_note]);
        assert!(!notes.contains(&automated_note));
    }

    #[test]
    fn test_delete_annotator_with_labels_fails() {
        let f = setup_db();
        f.db.insert_label(&label(&f, Provenance::Human("alice".into()), "fever", 1.0))
            .unwrap();
        assert!(matches!(f.db.delete_annotator("alice"), Err(DbError::ForeignKey(_))));
        assert!(f.db.get_annotator("alice").unwrap().is_some());
    }
}
