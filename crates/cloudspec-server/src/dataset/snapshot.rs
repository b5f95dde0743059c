// SPDX-License-Identifier: Apache-2.0

use rusqlite::{Connection, OpenFlags};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotError(pub String);

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for SnapshotError {}

/// One published dataset generation. Clones share the same on-disk directory;
/// the directory is removed when the last clone drops, so sessions opened
/// against an older generation keep reading the files they started with.
#[derive(Clone)]
pub struct Snapshot {
    inner: Arc<SnapshotInner>,
}

struct SnapshotInner {
    dir: PathBuf,
    db_path: PathBuf,
    version: String,
    created_at: SystemTime,
    cache_size_kib: i64,
    mmap_size_bytes: i64,
}

impl Snapshot {
    pub(crate) fn new(
        dir: PathBuf,
        db_path: PathBuf,
        version: String,
        cache_size_kib: i64,
        mmap_size_bytes: i64,
    ) -> Self {
        Self {
            inner: Arc::new(SnapshotInner {
                dir,
                db_path,
                version,
                created_at: SystemTime::now(),
                cache_size_kib,
                mmap_size_bytes,
            }),
        }
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.inner.version
    }

    #[must_use]
    pub fn created_at(&self) -> SystemTime {
        self.inner.created_at
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.inner.db_path
    }

    /// Opens a read-only connection tuned for point queries. Pragma failures
    /// are ignored; the connection still answers, just less efficiently.
    pub fn open_read_only(&self) -> Result<Connection, SnapshotError> {
        let conn = Connection::open_with_flags(
            &self.inner.db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| SnapshotError(format!("open {}: {e}", self.inner.db_path.display())))?;
        let pragma_sql = format!(
            "PRAGMA query_only=ON; PRAGMA journal_mode=OFF; PRAGMA synchronous=OFF; PRAGMA temp_store=MEMORY; PRAGMA cache_size=-{}; PRAGMA mmap_size={};",
            self.inner.cache_size_kib, self.inner.mmap_size_bytes
        );
        let _ = conn.set_prepared_statement_cache_capacity(128);
        let _ = conn.execute_batch(&pragma_sql);
        Ok(conn)
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("version", &self.inner.version)
            .field("dir", &self.inner.dir)
            .finish()
    }
}

impl Drop for SnapshotInner {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            debug!(dir = %self.dir.display(), "generation cleanup failed: {e}");
        }
    }
}
