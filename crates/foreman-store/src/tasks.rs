//! Task rows and their repository. Every mutation takes `&Connection` so the
//! pipeline runtime can only touch tasks inside a store transaction, which is
//! what makes each `completed_steps` append land in a version snapshot.

use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::error::StoreError;
use crate::row_helpers::{get, get_opt, parse_enum, parse_string_list};
use crate::util::now_rfc3339;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

/// One pipeline invocation: which record, which handler, how far it got.
#[derive(Clone, Debug)]
pub struct TaskRow {
    pub id: i64,
    pub status: TaskStatus,
    pub completed_steps: Vec<String>,
    pub record_type: Option<String>,
    pub record_id: Option<i64>,
    pub workspace_id: Option<i64>,
    pub handler: String,
    pub error_message: Option<String>,
    pub chat_ids: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl TaskRow {
    pub fn pending(&self) -> bool {
        self.status == TaskStatus::Pending
    }

    pub fn done(&self) -> bool {
        self.status == TaskStatus::Done
    }

    pub fn failed(&self) -> bool {
        self.status == TaskStatus::Failed
    }
}

const SELECT: &str = "SELECT id, status, completed_steps, record_type, record_id, workspace_id, \
                      handler, error_message, chat_ids, created_at, updated_at FROM tasks";

fn decode(row: &rusqlite::Row<'_>) -> Result<TaskRow, StoreError> {
    let status_raw: String = get(row, "tasks", "status")?;
    let steps_raw: String = get(row, "tasks", "completed_steps")?;
    let chat_ids_raw: String = get(row, "tasks", "chat_ids")?;
    Ok(TaskRow {
        id: get(row, "tasks", "id")?,
        status: parse_enum(&status_raw, "tasks", "status")?,
        completed_steps: parse_string_list(&steps_raw, "tasks", "completed_steps")?,
        record_type: get_opt(row, "tasks", "record_type")?,
        record_id: get_opt(row, "tasks", "record_id")?,
        workspace_id: get_opt(row, "tasks", "workspace_id")?,
        handler: get(row, "tasks", "handler")?,
        error_message: get_opt(row, "tasks", "error_message")?,
        chat_ids: parse_string_list(&chat_ids_raw, "tasks", "chat_ids")?,
        created_at: get(row, "tasks", "created_at")?,
        updated_at: get(row, "tasks", "updated_at")?,
    })
}

fn touch(conn: &Connection, id: i64) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE tasks SET updated_at = ?1 WHERE id = ?2",
        rusqlite::params![now_rfc3339(), id],
    )?;
    Ok(())
}

pub struct TaskRepo;

impl TaskRepo {
    pub fn create(
        conn: &Connection,
        record_type: Option<&str>,
        record_id: Option<i64>,
        handler: &str,
    ) -> Result<TaskRow, StoreError> {
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO tasks (record_type, record_id, handler, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?4)",
            rusqlite::params![record_type, record_id, handler, now],
        )?;
        Self::find(conn, conn.last_insert_rowid())
    }

    pub fn find(conn: &Connection, id: i64) -> Result<TaskRow, StoreError> {
        conn.query_row(&format!("{SELECT} WHERE id = ?1"), [id], |row| {
            Ok(decode(row))
        })
        .map_err(|_| StoreError::NotFound(format!("task {id}")))?
    }

    pub fn find_by_record_and_handler(
        conn: &Connection,
        record_type: &str,
        record_id: i64,
        handler: &str,
    ) -> Result<Option<TaskRow>, StoreError> {
        conn.query_row(
            &format!(
                "{SELECT} WHERE record_type = ?1 AND record_id = ?2 AND handler = ?3 LIMIT 1"
            ),
            rusqlite::params![record_type, record_id, handler],
            |row| Ok(decode(row)),
        )
        .optional()?
        .transpose()
    }

    /// Oldest pending task runnable on the given workspace: bound to it, or
    /// not yet bound to any. An unbound task is claimed by writing the
    /// workspace id in the same transaction, so two slots cannot both take
    /// it.
    #[instrument(skip(conn))]
    pub fn claim_next_pending(
        conn: &Connection,
        workspace_id: i64,
    ) -> Result<Option<TaskRow>, StoreError> {
        let task = conn
            .query_row(
                &format!(
                    "{SELECT} WHERE (workspace_id = ?1 OR workspace_id IS NULL) \
                     AND status = 'pending' ORDER BY created_at ASC, id ASC LIMIT 1"
                ),
                [workspace_id],
                |row| Ok(decode(row)),
            )
            .optional()?
            .transpose()?;

        let Some(mut task) = task else {
            return Ok(None);
        };

        if task.workspace_id.is_none() {
            conn.execute(
                "UPDATE tasks SET workspace_id = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![workspace_id, now_rfc3339(), task.id],
            )?;
            task.workspace_id = Some(workspace_id);
        }
        Ok(Some(task))
    }

    pub fn mark_done(conn: &Connection, id: i64) -> Result<(), StoreError> {
        conn.execute(
            "UPDATE tasks SET status = 'done', updated_at = ?1 WHERE id = ?2",
            rusqlite::params![now_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn fail(conn: &Connection, id: i64, message: &str) -> Result<(), StoreError> {
        conn.execute(
            "UPDATE tasks SET status = 'failed', error_message = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![message, now_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn append_completed_step(
        conn: &Connection,
        id: i64,
        step: &str,
    ) -> Result<Vec<String>, StoreError> {
        let task = Self::find(conn, id)?;
        let mut steps = task.completed_steps;
        steps.push(step.to_owned());
        Self::set_completed_steps(conn, id, &steps)?;
        Ok(steps)
    }

    pub fn set_completed_steps(
        conn: &Connection,
        id: i64,
        steps: &[String],
    ) -> Result<(), StoreError> {
        conn.execute(
            "UPDATE tasks SET completed_steps = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![serde_json::to_string(steps)?, now_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn append_chat_id(conn: &Connection, id: i64, chat_id: &str) -> Result<(), StoreError> {
        let task = Self::find(conn, id)?;
        let mut chat_ids = task.chat_ids;
        chat_ids.push(chat_id.to_owned());
        conn.execute(
            "UPDATE tasks SET chat_ids = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![serde_json::to_string(&chat_ids)?, now_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn set_workspace(conn: &Connection, id: i64, workspace_id: i64) -> Result<(), StoreError> {
        conn.execute(
            "UPDATE tasks SET workspace_id = ?1 WHERE id = ?2",
            rusqlite::params![workspace_id, id],
        )?;
        touch(conn, id)
    }

    pub fn all(conn: &Connection) -> Result<Vec<TaskRow>, StoreError> {
        let mut stmt = conn.prepare(&format!("{SELECT} ORDER BY created_at ASC, id ASC"))?;
        let rows = stmt
            .query_map([], |row| Ok(decode(row)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().collect()
    }

    pub fn count_by_status(conn: &Connection, status: TaskStatus) -> Result<i64, StoreError> {
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE status = ?1",
            [status.as_sql()],
            |row| row.get(0),
        )?)
    }

    pub fn count(conn: &Connection) -> Result<i64, StoreError> {
        Ok(conn.query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?)
    }

    /// Error messages of the oldest failed tasks, up to `limit`.
    pub fn failed_messages(conn: &Connection, limit: usize) -> Result<Vec<String>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT COALESCE(error_message, '') FROM tasks WHERE status = 'failed' \
             ORDER BY created_at ASC, id ASC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(rows)
    }

    /// `(min created_at, max updated_at)` across all tasks, when any exist.
    pub fn time_span(conn: &Connection) -> Result<Option<(String, String)>, StoreError> {
        let span: Option<(Option<String>, Option<String>)> = conn
            .query_row(
                "SELECT MIN(created_at), MAX(updated_at) FROM tasks",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(match span {
            Some((Some(min), Some(max))) => Some((min, max)),
            _ => None,
        })
    }
}
