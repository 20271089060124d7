//! Version-tracked migrations. Schema-derived migrations (`table_<name>`)
//! are prepended so tables exist before user migrations run; each version is
//! applied at most once and recorded in `schema_migrations`.

use std::fmt;
use std::sync::Arc;

use rusqlite::Connection;
use tracing::info;

use crate::error::StoreError;
use crate::schema::SchemaSet;

pub type MigrationFn = Arc<dyn Fn(&Connection) -> Result<(), StoreError> + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MigrationVersion {
    /// Auto-generated versions, `table_<name>`.
    Named(String),
    /// Explicit user-assigned versions.
    Numbered(i64),
}

impl fmt::Display for MigrationVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(name) => f.write_str(name),
            Self::Numbered(n) => write!(f, "{n}"),
        }
    }
}

#[derive(Clone)]
pub struct Migration {
    pub version: MigrationVersion,
    up: MigrationFn,
}

impl Migration {
    pub fn named(version: impl Into<String>, up: MigrationFn) -> Self {
        Self {
            version: MigrationVersion::Named(version.into()),
            up,
        }
    }

    pub fn numbered(version: i64, up: MigrationFn) -> Self {
        Self {
            version: MigrationVersion::Numbered(version),
            up,
        }
    }

    /// Convenience: a numbered migration running a fixed SQL batch.
    pub fn sql(version: i64, sql: &'static str) -> Self {
        Self::numbered(
            version,
            Arc::new(move |conn| {
                conn.execute_batch(sql)?;
                Ok(())
            }),
        )
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .finish()
    }
}

/// Derive one `table_<name>` migration per declared record.
pub fn schema_migrations(schema: &SchemaSet) -> Vec<Migration> {
    schema
        .iter()
        .map(|decl| {
            let ddl = decl.ddl();
            Migration::named(
                format!("table_{}", decl.name),
                Arc::new(move |conn: &Connection| {
                    conn.execute_batch(&ddl)?;
                    Ok(())
                }),
            )
        })
        .collect()
}

/// Apply every pending migration in order. Errors abort store open.
pub fn run(conn: &Connection, migrations: &[Migration]) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (version TEXT NOT NULL UNIQUE);",
    )?;

    for migration in migrations {
        let version = migration.version.to_string();
        let applied: bool = conn
            .query_row(
                "SELECT 1 FROM schema_migrations WHERE version = ?1",
                [&version],
                |_| Ok(true),
            )
            .unwrap_or(false);
        if applied {
            continue;
        }

        (migration.up)(conn).map_err(|e| StoreError::Migration {
            version: version.clone(),
            detail: e.to_string(),
        })?;
        conn.execute(
            "INSERT INTO schema_migrations (version) VALUES (?1)",
            [&version],
        )?;
        info!(version = %version, "migration applied");
    }

    Ok(())
}
