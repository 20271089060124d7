//! Workspace rows: isolated working directories (plain dirs or git
//! worktrees), each owned by at most one drain slot at a time.

use std::collections::HashMap;

use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use tracing::instrument;

use crate::error::StoreError;
use crate::row_helpers::{get, parse_json};
use crate::util::now_rfc3339;

#[derive(Clone, Debug)]
pub struct WorkspaceRow {
    pub id: i64,
    pub dir: String,
    pub env: HashMap<String, String>,
    pub created_at: String,
}

const SELECT: &str = "SELECT id, dir, env, created_at FROM workspaces";

fn decode(row: &rusqlite::Row<'_>) -> Result<WorkspaceRow, StoreError> {
    let env_raw: String = get(row, "workspaces", "env")?;
    let env_value = parse_json(&env_raw, "workspaces", "env")?;
    // The column default is '[]'; an empty array and an object both decode.
    let env = match env_value {
        Value::Object(map) => map
            .into_iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_owned())))
            .collect(),
        _ => HashMap::new(),
    };
    Ok(WorkspaceRow {
        id: get(row, "workspaces", "id")?,
        dir: get(row, "workspaces", "dir")?,
        env,
        created_at: get(row, "workspaces", "created_at")?,
    })
}

pub struct WorkspaceRepo;

impl WorkspaceRepo {
    /// Get or create the workspace for a directory. The directory is unique;
    /// re-provisioning the same dir returns the existing row.
    #[instrument(skip(conn, env))]
    pub fn find_or_create(
        conn: &Connection,
        dir: &str,
        env: &HashMap<String, String>,
    ) -> Result<WorkspaceRow, StoreError> {
        let existing = conn
            .query_row(&format!("{SELECT} WHERE dir = ?1"), [dir], |row| {
                Ok(decode(row))
            })
            .optional()?
            .transpose()?;
        if let Some(workspace) = existing {
            return Ok(workspace);
        }

        let env_json = serde_json::to_string(env)?;
        conn.execute(
            "INSERT INTO workspaces (dir, env, created_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![dir, env_json, now_rfc3339()],
        )?;
        Self::find(conn, conn.last_insert_rowid())
    }

    pub fn find_by_dir(conn: &Connection, dir: &str) -> Result<Option<WorkspaceRow>, StoreError> {
        conn.query_row(&format!("{SELECT} WHERE dir = ?1"), [dir], |row| {
            Ok(decode(row))
        })
        .optional()?
        .transpose()
    }

    pub fn find(conn: &Connection, id: i64) -> Result<WorkspaceRow, StoreError> {
        conn.query_row(&format!("{SELECT} WHERE id = ?1"), [id], |row| {
            Ok(decode(row))
        })
        .map_err(|_| StoreError::NotFound(format!("workspace {id}")))?
    }

    pub fn list(conn: &Connection) -> Result<Vec<WorkspaceRow>, StoreError> {
        let mut stmt = conn.prepare(&format!("{SELECT} ORDER BY id ASC"))?;
        let rows = stmt
            .query_map([], |row| Ok(decode(row)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().collect()
    }

    pub fn count(conn: &Connection) -> Result<i64, StoreError> {
        Ok(conn.query_row("SELECT COUNT(*) FROM workspaces", [], |row| row.get(0))?)
    }
}
