//! The store facade: open/migrate, record accessors, transactions with
//! automatic version snapshots, time travel, named snapshots, restore.

use std::path::PathBuf;
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::OwnedMutexGuard;
use tracing::{info, instrument};

use crate::database::Database;
use crate::error::StoreError;
use crate::migrations::{self, Migration};
use crate::records::RecordHandle;
use crate::schema::{builtin_decls, RecordDecl, SchemaSet};
use crate::versions::{self, StorePaths};

/// Immutable definitions shared between a root store and the stores pinned to
/// its versions, so a restore can reopen the root with the same schema.
#[derive(Debug)]
pub struct StoreDefs {
    pub schema: SchemaSet,
    pub user_migrations: Vec<Migration>,
    pub versioned: bool,
}

#[derive(Clone, Debug)]
pub enum StoreMode {
    Live,
    Pinned(PathBuf),
}

#[derive(Clone, Debug, Default)]
pub struct StoreConfig {
    dir: Option<PathBuf>,
    path: Option<PathBuf>,
    db_name: String,
    versioned: bool,
    records: Vec<RecordDecl>,
    migrations: Vec<Migration>,
}

impl StoreConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            db_name: "foreman".into(),
            ..Self::default()
        }
    }

    /// Configure from a full database file path instead of a directory.
    /// Exactly one of the two must be given.
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn db_name(mut self, name: impl Into<String>) -> Self {
        self.db_name = name.into();
        self
    }

    pub fn versioned(mut self, versioned: bool) -> Self {
        self.versioned = versioned;
        self
    }

    pub fn record(mut self, decl: RecordDecl) -> Self {
        self.records.push(decl);
        self
    }

    pub fn migration(mut self, migration: Migration) -> Self {
        self.migrations.push(migration);
        self
    }

    fn resolve_paths(&self) -> Result<StorePaths, StoreError> {
        match (&self.dir, &self.path) {
            (Some(_), Some(_)) | (None, None) => Err(StoreError::Config(
                "exactly one of dir or path must be given".into(),
            )),
            (Some(dir), None) => {
                if self.db_name.is_empty() {
                    return Err(StoreError::Config("db_name must not be empty".into()));
                }
                Ok(StorePaths {
                    dir: dir.clone(),
                    name: self.db_name.clone(),
                })
            }
            (None, Some(path)) => {
                let dir = path
                    .parent()
                    .ok_or_else(|| StoreError::Config(format!("path has no parent: {}", path.display())))?
                    .to_owned();
                let name = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .ok_or_else(|| StoreError::Config(format!("unusable path: {}", path.display())))?
                    .to_owned();
                Ok(StorePaths { dir, name })
            }
        }
    }
}

/// A versioned relational record store bound to a directory. Cloning shares
/// the underlying connection.
#[derive(Clone)]
#[derive(Debug)]
pub struct Store {
    db: Database,
    paths: StorePaths,
    mode: StoreMode,
    defs: Arc<StoreDefs>,
}

impl Store {
    /// Open (creating if absent) the live database, apply pending migrations,
    /// and return the root store.
    #[instrument(skip(config))]
    pub async fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let paths = config.resolve_paths()?;

        let mut schema = SchemaSet::new();
        for decl in builtin_decls() {
            schema.declare(decl);
        }
        for decl in config.records.clone() {
            schema.declare(decl);
        }

        let defs = Arc::new(StoreDefs {
            schema,
            user_migrations: config.migrations.clone(),
            versioned: config.versioned,
        });

        Self::open_root(paths, defs).await
    }

    async fn open_root(paths: StorePaths, defs: Arc<StoreDefs>) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&paths.dir)?;
        let db = Database::open(&paths.live())?;

        // Schema-derived migrations run first so tables exist before user
        // migrations touch them.
        let mut all = migrations::schema_migrations(&defs.schema);
        all.extend(defs.user_migrations.iter().cloned());
        db.with_conn(|conn| migrations::run(conn, &all)).await?;

        info!(dir = %paths.dir.display(), name = %paths.name, versioned = defs.versioned, "store opened");

        Ok(Self {
            db,
            paths,
            mode: StoreMode::Live,
            defs,
        })
    }

    fn open_pinned(paths: StorePaths, defs: Arc<StoreDefs>, file: PathBuf) -> Result<Self, StoreError> {
        let db = Database::open_read_only(&file)?;
        Ok(Self {
            db,
            paths,
            mode: StoreMode::Pinned(file),
            defs,
        })
    }

    pub fn versioned(&self) -> bool {
        matches!(self.mode, StoreMode::Live) && self.defs.versioned
    }

    pub fn readonly(&self) -> bool {
        matches!(self.mode, StoreMode::Pinned(_))
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.paths.dir
    }

    fn ensure_root(&self, op: &str) -> Result<(), StoreError> {
        if self.readonly() {
            return Err(StoreError::ReadOnly(format!("{op} on a version store")));
        }
        Ok(())
    }

    /// Query handle for a declared record type.
    pub fn records(&self, name: &str) -> Result<RecordHandle, StoreError> {
        let decl = self
            .defs
            .schema
            .get(name)
            .ok_or_else(|| StoreError::UnknownRecord(name.to_owned()))?;
        Ok(RecordHandle::new(Arc::new(decl.clone()), self.readonly()))
    }

    /// Run a closure against the connection, outside any transaction.
    pub async fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        self.db.with_conn(f).await
    }

    /// Begin a transaction, taking ownership of the connection until commit
    /// or rollback. If the connection is already inside a transaction the
    /// returned handle joins it: no second BEGIN, and no snapshot on commit.
    pub async fn begin(&self) -> Result<StoreTx, StoreError> {
        self.ensure_root("transaction")?;
        let guard = self.db.lock_owned().await;
        let joined = !guard.is_autocommit();
        if !joined {
            guard.execute_batch("BEGIN IMMEDIATE")?;
        }
        Ok(StoreTx {
            guard,
            paths: self.paths.clone(),
            versioned: self.defs.versioned,
            joined,
            finished: false,
        })
    }

    /// Execute `f` atomically. On commit of a versioned store, a new version
    /// snapshot is written. On error the transaction rolls back and no
    /// snapshot is written.
    pub async fn transaction<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let tx = self.begin().await?;
        match f(tx.conn()) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                tx.rollback();
                Err(e)
            }
        }
    }

    /// Version snapshots in chronological order.
    pub fn versions(&self) -> Result<Vec<Version>, StoreError> {
        self.ensure_root("versions")?;
        let stamps = versions::list_stamps(&self.paths)?;
        Ok(stamps
            .into_iter()
            .map(|stamp| Version {
                file: self.paths.version_file(&stamp),
                stamp,
                paths: self.paths.clone(),
                defs: Arc::clone(&self.defs),
            })
            .collect())
    }

    /// Copy the live database to a named snapshot file.
    pub async fn snapshot(&self, label: &str) -> Result<PathBuf, StoreError> {
        self.ensure_root("snapshot")?;
        let _guard = self.db.lock_owned().await;
        let dest = self.paths.snapshot_file(label);
        versions::copy_live_to(&self.paths, &dest)?;
        info!(label, "snapshot written");
        Ok(dest)
    }

    /// Overwrite the live database with a named snapshot and append a new
    /// version reflecting the restore.
    pub async fn restore(&self, label: &str) -> Result<(), StoreError> {
        self.ensure_root("restore")?;
        let mut guard = self.db.lock_owned().await;
        let src = self.paths.snapshot_file(label);
        versions::restore_into(&mut guard, &src)?;
        if self.defs.versioned {
            versions::write_version(&self.paths)?;
        }
        info!(label, "snapshot restored");
        Ok(())
    }
}

/// An open transaction holding the store's connection. Dropping without
/// committing rolls back.
pub struct StoreTx {
    guard: OwnedMutexGuard<Connection>,
    paths: StorePaths,
    versioned: bool,
    joined: bool,
    finished: bool,
}

impl std::fmt::Debug for StoreTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreTx")
            .field("paths", &self.paths)
            .field("versioned", &self.versioned)
            .field("joined", &self.joined)
            .field("finished", &self.finished)
            .finish()
    }
}

impl StoreTx {
    pub fn conn(&self) -> &Connection {
        &self.guard
    }

    pub fn commit(mut self) -> Result<(), StoreError> {
        self.finished = true;
        if self.joined {
            return Ok(());
        }
        self.guard.execute_batch("COMMIT")?;
        if self.versioned {
            // A copy failure here leaves the commit standing and the version
            // trail one entry short; the caller sees the error.
            versions::write_version(&self.paths)?;
        }
        Ok(())
    }

    pub fn rollback(mut self) {
        self.finished = true;
        if !self.joined {
            let _ = self.guard.execute_batch("ROLLBACK");
        }
    }
}

impl Drop for StoreTx {
    fn drop(&mut self) {
        if !self.finished && !self.joined {
            let _ = self.guard.execute_batch("ROLLBACK");
        }
    }
}

/// One automatic snapshot in the version trail.
#[derive(Debug)]
pub struct Version {
    stamp: String,
    file: PathBuf,
    paths: StorePaths,
    defs: Arc<StoreDefs>,
}

impl Version {
    pub fn stamp(&self) -> &str {
        &self.stamp
    }

    pub fn file(&self) -> &std::path::Path {
        &self.file
    }

    /// Open this version as a read-only store. Record accessors answer
    /// `readonly() == true` and every write is rejected.
    pub fn open(&self) -> Result<Store, StoreError> {
        Store::open_pinned(self.paths.clone(), Arc::clone(&self.defs), self.file.clone())
    }

    /// Overwrite the live database with this version, delete all newer
    /// versions, append a new version reflecting the restore, and return a
    /// fresh root store.
    pub async fn restore(&self) -> Result<Store, StoreError> {
        let store = Store::open_root(self.paths.clone(), Arc::clone(&self.defs)).await?;
        {
            let mut guard = store.db.lock_owned().await;
            versions::restore_into(&mut guard, &self.file)?;
            versions::delete_after(&self.paths, &self.stamp)?;
            versions::write_version(&self.paths)?;
        }
        info!(stamp = %self.stamp, "version restored");
        Ok(store)
    }
}
