//! Version trail and named snapshots. Every committed top-level transaction
//! on a versioned store copies the live file into the versions directory;
//! file names are zero-padded nanosecond timestamps so lexicographic order is
//! chronological order.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::info;

use crate::error::StoreError;
use crate::util::now_nanos;

/// Serializes `{commit → copy-file}` process-wide so every snapshot reflects
/// an actually committed state.
static COPY_LOCK: Mutex<()> = Mutex::new(());

/// Resolved file locations for one store.
#[derive(Clone, Debug)]
pub struct StorePaths {
    pub dir: PathBuf,
    pub name: String,
}

impl StorePaths {
    pub fn live(&self) -> PathBuf {
        self.dir.join(format!("{}.sqlite3", self.name))
    }

    pub fn versions_dir(&self) -> PathBuf {
        self.dir.join(format!("{}_versions", self.name))
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.dir.join(format!("{}_snapshots", self.name))
    }

    pub fn version_file(&self, stamp: &str) -> PathBuf {
        self.versions_dir().join(format!("{stamp}.sqlite3"))
    }

    pub fn snapshot_file(&self, label: &str) -> PathBuf {
        self.snapshots_dir().join(format!("{label}.sqlite3"))
    }
}

/// Copy the live file into the versions directory. Called with the store's
/// connection guard held, immediately after COMMIT.
pub fn write_version(paths: &StorePaths) -> Result<PathBuf, StoreError> {
    let _serialize = COPY_LOCK.lock();
    std::fs::create_dir_all(paths.versions_dir())?;

    let mut stamp = now_nanos();
    let mut file = paths.version_file(&format_stamp(stamp));
    while file.exists() {
        stamp += 1;
        file = paths.version_file(&format_stamp(stamp));
    }

    std::fs::copy(paths.live(), &file)?;
    Ok(file)
}

/// Copy the live file to an arbitrary destination (named snapshots).
pub fn copy_live_to(paths: &StorePaths, dest: &Path) -> Result<(), StoreError> {
    let _serialize = COPY_LOCK.lock();
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(paths.live(), dest)?;
    Ok(())
}

/// Version stamps in chronological order.
pub fn list_stamps(paths: &StorePaths) -> Result<Vec<String>, StoreError> {
    let dir = paths.versions_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut stamps = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();
        if let Some(stamp) = name.strip_suffix(".sqlite3") {
            stamps.push(stamp.to_owned());
        }
    }
    stamps.sort();
    Ok(stamps)
}

/// Delete every version strictly newer than `stamp`. Used by restore.
pub fn delete_after(paths: &StorePaths, stamp: &str) -> Result<(), StoreError> {
    for candidate in list_stamps(paths)? {
        if candidate.as_str() > stamp {
            std::fs::remove_file(paths.version_file(&candidate))?;
            info!(stamp = %candidate, "version deleted by restore");
        }
    }
    Ok(())
}

/// Replace the contents of an open live connection with the database at
/// `src`. Goes through the SQLite backup API so concurrently open connections
/// observe an ordinary write instead of a file swap.
pub fn restore_into(live: &mut Connection, src: &Path) -> Result<(), StoreError> {
    if !src.exists() {
        return Err(StoreError::NotFound(format!(
            "snapshot {}",
            src.display()
        )));
    }
    let source = Connection::open_with_flags(
        src,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    let backup = rusqlite::backup::Backup::new(&source, live)?;
    backup.run_to_completion(64, std::time::Duration::from_millis(5), None)?;
    Ok(())
}

fn format_stamp(nanos: i64) -> String {
    format!("{nanos:019}")
}
