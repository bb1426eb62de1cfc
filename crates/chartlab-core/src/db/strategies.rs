//! Task and strategy registration.

use chrono::NaiveDate;
use rusqlite::{params, OptionalExtension};

use super::{Database, DbError, DbResult};
use crate::models::{StrategyDef, StrategyId, StrategyRecord, Task, TaskDef, TaskId};

impl Database {
    /// Get a task row, inserting it on first use.
    pub fn get_or_register_task(&self, def: &TaskDef) -> DbResult<Task> {
        self.conn.execute(
            &self.sql(
                r#"
                INSERT INTO {p}tasks (name, output_type, value_kind, description)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT (name) DO NOTHING
                "#,
            ),
            params![
                def.name,
                def.output_type.as_str(),
                def.value_kind.as_str(),
                def.description,
            ],
        )?;
        self.get_task_by_name(&def.name)?
            .ok_or_else(|| DbError::NotFound(format!("task {}", def.name)))
    }

    /// Get a task by name.
    pub fn get_task_by_name(&self, name: &str) -> DbResult<Option<Task>> {
        self.conn
            .query_row(
                &self.sql(
                    "SELECT id, name, output_type, value_kind, description FROM {p}tasks WHERE name = ?",
                ),
                [name],
                |row| {
                    Ok(TaskRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        output_type: row.get(2)?,
                        value_kind: row.get(3)?,
                        description: row.get(4)?,
                    })
                },
            )
            .optional()?
            .map(|row| row.try_into())
            .transpose()
    }

    /// Get a strategy row, inserting it on first use. Existing rows are never edited.
    pub fn get_or_register_strategy(
        &self,
        task: &TaskDef,
        strategy: &StrategyDef,
    ) -> DbResult<StrategyRecord> {
        let task = self.get_or_register_task(task)?;
        self.conn.execute(
            &self.sql(
                r#"
                INSERT INTO {p}strategies (task_id, name, description, version, last_updated)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT (task_id, name, version) DO NOTHING
                "#,
            ),
            params![
                task.id,
                strategy.name,
                strategy.description,
                strategy.version,
                strategy.last_updated.to_string(),
            ],
        )?;
        self.find_strategy(task.id, &strategy.name, &strategy.version)?
            .ok_or_else(|| {
                DbError::NotFound(format!("strategy {}.{}", task.name, strategy.name))
            })
    }

    /// Find a strategy row by its identity.
    pub fn find_strategy(
        &self,
        task_id: TaskId,
        name: &str,
        version: &str,
    ) -> DbResult<Option<StrategyRecord>> {
        self.conn
            .query_row(
                &self.sql(
                    r#"
                    SELECT id, task_id, name, description, version, last_updated
                    FROM {p}strategies
                    WHERE task_id = ?1 AND name = ?2 AND version = ?3
                    "#,
                ),
                params![task_id, name, version],
                strategy_row,
            )
            .optional()?
            .map(|row| row.try_into())
            .transpose()
    }

    /// Id of a strategy identified by task name, if it has been registered.
    pub fn find_strategy_for(&self, task: &str, name: &str, version: &str) -> DbResult<Option<StrategyId>> {
        Ok(self
            .conn
            .query_row(
                &self.sql(
                    r#"
                    SELECT s.id FROM {p}strategies s
                    JOIN {p}tasks t ON t.id = s.task_id
                    WHERE t.name = ?1 AND s.name = ?2 AND s.version = ?3
                    "#,
                ),
                params![task, name, version],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Get a strategy by ID.
    pub fn get_strategy(&self, id: StrategyId) -> DbResult<Option<StrategyRecord>> {
        self.conn
            .query_row(
                &self.sql(
                    r#"
                    SELECT id, task_id, name, description, version, last_updated
                    FROM {p}strategies WHERE id = ?
                    "#,
                ),
                [id],
                strategy_row,
            )
            .optional()?
            .map(|row| row.try_into())
            .transpose()
    }

    /// All tasks, by name.
    pub fn list_tasks(&self) -> DbResult<Vec<Task>> {
        let mut stmt = self.conn.prepare(&self.sql(
            "SELECT id, name, output_type, value_kind, description FROM {p}tasks ORDER BY name",
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok(TaskRow {
                id: row.get(0)?,
                name: row.get(1)?,
                output_type: row.get(2)?,
                value_kind: row.get(3)?,
                description: row.get(4)?,
            })
        })?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?.try_into()?);
        }
        Ok(tasks)
    }

    /// Strategies registered under a task, by (name, version).
    pub fn list_strategies_for_task(&self, task_id: TaskId) -> DbResult<Vec<StrategyRecord>> {
        let mut stmt = self.conn.prepare(&self.sql(
            r#"
            SELECT id, task_id, name, description, version, last_updated
            FROM {p}strategies WHERE task_id = ?
            ORDER BY name, version
            "#,
        ))?;
        let rows = stmt.query_map([task_id], strategy_row)?;

        let mut strategies = Vec::new();
        for row in rows {
            strategies.push(row?.try_into()?);
        }
        Ok(strategies)
    }

    /// Delete a strategy. Fails while any output references it.
    pub fn delete_strategy(&self, id: StrategyId) -> DbResult<bool> {
        let rows_affected = self
            .conn
            .execute(&self.sql("DELETE FROM {p}strategies WHERE id = ?"), [id])?;
        Ok(rows_affected > 0)
    }
}

/// Intermediate row struct for database mapping.
struct TaskRow {
    id: TaskId,
    name: String,
    output_type: String,
    value_kind: String,
    description: String,
}

impl TryFrom<TaskRow> for Task {
    type Error = DbError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(Task {
            id: row.id,
            name: row.name,
            output_type: row.output_type.parse().map_err(DbError::Constraint)?,
            value_kind: row.value_kind.parse().map_err(DbError::Constraint)?,
            description: row.description,
        })
    }
}

struct StrategyRow {
    id: StrategyId,
    task_id: TaskId,
    name: String,
    description: String,
    version: String,
    last_updated: String,
}

fn strategy_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StrategyRow> {
    Ok(StrategyRow {
        id: row.get(0)?,
        task_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        version: row.get(4)?,
        last_updated: row.get(5)?,
    })
}

impl TryFrom<StrategyRow> for StrategyRecord {
    type Error = DbError;

    fn try_from(row: StrategyRow) -> Result<Self, Self::Error> {
        let last_updated = NaiveDate::parse_from_str(&row.last_updated, "%Y-%m-%d").map_err(|e| {
            DbError::Constraint(format!("Bad last_updated {:?}: {}", row.last_updated, e))
        })?;
        Ok(StrategyRecord {
            id: row.id,
            task_id: row.task_id,
            name: row.name,
            description: row.description,
            version: row.version,
            last_updated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OutputType, ValueKind};

    fn task() -> TaskDef {
        TaskDef::new("presenting_sx", OutputType::Feature, ValueKind::Binary)
    }

    fn strategy(version: &str) -> StrategyDef {
        StrategyDef {
            name: "regex".into(),
            version: version.into(),
            description: "Keyword regexes".into(),
            last_updated: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
        }
    }

    #[test]
    fn test_get_or_register_strategy_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let first = db.get_or_register_strategy(&task(), &strategy("1")).unwrap();
        let again = db.get_or_register_strategy(&task(), &strategy("1")).unwrap();
        assert_eq!(first, again);

        let v2 = db.get_or_register_strategy(&task(), &strategy("2")).unwrap();
        assert_ne!(first.id, v2.id);
        assert_eq!(first.task_id, v2.task_id);

        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM strategies", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_task_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let created = db.get_or_register_task(&task().with_description("Presenting symptoms")).unwrap();
        let fetched = db.get_task_by_name("presenting_sx").unwrap().unwrap();
        assert_eq!(created, fetched);
        assert_eq!(fetched.output_type, OutputType::Feature);
        assert!(db.get_task_by_name("nope").unwrap().is_none());
    }

    #[test]
    fn test_get_strategy() {
        let db = Database::open_in_memory().unwrap();
        let record = db.get_or_register_strategy(&task(), &strategy("1")).unwrap();
        assert_eq!(db.find_strategy_for("presenting_sx", "regex", "1").unwrap(), Some(record.id));
        assert_eq!(db.find_strategy_for("presenting_sx", "regex", "2").unwrap(), None);
        assert_eq!(db.get_strategy(record.id).unwrap(), Some(record));
        assert_eq!(db.get_strategy(StrategyId(99)).unwrap(), None);
    }

    #[test]
    fn test_delete_unused_strategy() {
        let db = Database::open_in_memory().unwrap();
        let record = db.get_or_register_strategy(&task(), &strategy("1")).unwrap();
        assert!(db.delete_strategy(record.id).unwrap());
    }
}
