// SPDX-License-Identifier: Apache-2.0

//! Dataset lifecycle: download, augment, publish, retire.

mod augment;
mod snapshot;
mod source;

pub use snapshot::{Snapshot, SnapshotError};
pub use source::{
    ArtifactSource, FakeArtifactSource, FetchedArtifact, HttpArtifactSource, LocalFileSource,
};

use crate::config::DatasetOptions;
use crate::refresh::{Produce, Produced, RefreshError, RefreshableResource};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, instrument};

const DB_FILE: &str = "dataset.sqlite3";

/// Health payload for readiness endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetHealth {
    pub ready: bool,
    pub version_hash: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// A read view over one generation. Holding the session pins that generation's
/// directory on disk until the session drops, even across newer publishes.
pub struct SnapshotSession {
    connection: rusqlite::Connection,
    snapshot: Snapshot,
}

impl SnapshotSession {
    #[must_use]
    pub fn connection(&self) -> &rusqlite::Connection {
        &self.connection
    }

    #[must_use]
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }
}

struct SnapshotProducer {
    source: Arc<dyn ArtifactSource>,
    options: DatasetOptions,
    generation: AtomicU64,
    retained: Mutex<VecDeque<Snapshot>>,
}

impl SnapshotProducer {
    #[instrument(name = "dataset_materialize", skip_all, fields(version = %artifact.version))]
    async fn materialize(&self, artifact: FetchedArtifact) -> Result<Snapshot, SnapshotError> {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let dir = self.options.data_dir.join(format!("gen-{generation:06}"));
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| SnapshotError(format!("create {}: {e}", dir.display())))?;
        let db_path = dir.join(DB_FILE);
        if let Err(e) = self.write_and_augment(&dir, &db_path, artifact.bytes).await {
            let _ = tokio::fs::remove_dir_all(&dir).await;
            return Err(e);
        }
        info!(generation, version = %artifact.version, "dataset generation ready");
        Ok(Snapshot::new(
            dir,
            db_path,
            artifact.version,
            self.options.sqlite_pragma_cache_kib,
            self.options.sqlite_pragma_mmap_bytes,
        ))
    }

    async fn write_and_augment(
        &self,
        dir: &Path,
        db_path: &Path,
        bytes: Vec<u8>,
    ) -> Result<(), SnapshotError> {
        let tmp_path = dir.join(format!("{DB_FILE}.tmp"));
        tokio::fs::write(&tmp_path, &bytes)
            .await
            .map_err(|e| SnapshotError(format!("write {}: {e}", tmp_path.display())))?;
        tokio::fs::rename(&tmp_path, db_path)
            .await
            .map_err(|e| SnapshotError(format!("rename {}: {e}", db_path.display())))?;
        let augment_path = db_path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&augment_path)
                .map_err(|e| SnapshotError(format!("open {}: {e}", augment_path.display())))?;
            augment::augment_dataset(&conn)
        })
        .await
        .map_err(|e| SnapshotError(format!("augmentation task failed: {e}")))?
    }
}

#[async_trait]
impl Produce<Snapshot> for SnapshotProducer {
    async fn produce(
        &self,
        current: Option<Arc<Snapshot>>,
    ) -> Result<Produced<Snapshot>, RefreshError> {
        let current_version = current.as_ref().map(|s| s.version().to_string());
        if let Some(probe) = self
            .source
            .fingerprint()
            .await
            .map_err(|e| RefreshError(e.0))?
        {
            if current_version.as_deref() == Some(probe.as_str()) {
                return Ok(Produced::Unchanged);
            }
        }
        let artifact = self.source.fetch().await.map_err(|e| RefreshError(e.0))?;
        if current_version.as_deref() == Some(artifact.version.as_str()) {
            return Ok(Produced::Unchanged);
        }
        let snapshot = self
            .materialize(artifact)
            .await
            .map_err(|e| RefreshError(e.0))?;
        let mut retained = self.retained.lock().await;
        retained.push_back(snapshot.clone());
        // Retired generations leave the keep list here; each directory goes
        // away once the last session holding its snapshot drops.
        while retained.len() > self.options.retention.max(1) {
            retained.pop_front();
        }
        Ok(Produced::Fresh(snapshot))
    }
}

/// Owns the snapshot lifecycle. Readers take point-in-time sessions while a
/// background updater swaps in new generations as the upstream artifact
/// changes.
pub struct DatasetManager {
    resource: Arc<RefreshableResource<Snapshot>>,
    open_timeout: Duration,
    poll_interval: Duration,
}

impl DatasetManager {
    pub fn new(
        source: Arc<dyn ArtifactSource>,
        options: DatasetOptions,
    ) -> Result<Arc<Self>, SnapshotError> {
        fs::create_dir_all(&options.data_dir)
            .map_err(|e| SnapshotError(format!("create {}: {e}", options.data_dir.display())))?;
        sweep_stale_generations(&options.data_dir);
        info!(
            source = %source.describe(),
            dir = %options.data_dir.display(),
            "dataset manager starting"
        );
        let open_timeout = options.open_timeout;
        let poll_interval = options.poll_interval;
        let producer = Arc::new(SnapshotProducer {
            source,
            options,
            generation: AtomicU64::new(0),
            retained: Mutex::new(VecDeque::new()),
        });
        let resource = RefreshableResource::new("dataset", producer);
        Ok(Arc::new(Self {
            resource,
            open_timeout,
            poll_interval,
        }))
    }

    /// Blocks until the first generation is live. Startup calls this once so
    /// the process never serves before data exists.
    pub async fn load_initial(&self) -> Result<(), SnapshotError> {
        self.resource
            .force_refresh()
            .await
            .map(|_| ())
            .map_err(|e| SnapshotError(e.0))
    }

    pub async fn spawn_updater(&self) {
        self.resource.spawn_updater(self.poll_interval).await;
    }

    pub async fn refresh_now(&self) -> Result<(), SnapshotError> {
        self.resource
            .force_refresh()
            .await
            .map(|_| ())
            .map_err(|e| SnapshotError(e.0))
    }

    /// Opens a tuned read-only connection against the current generation. The
    /// open runs on the blocking pool under a deadline so a cold page cache
    /// cannot stall the request path.
    pub async fn session(&self) -> Result<SnapshotSession, SnapshotError> {
        let snapshot = (*self.resource.get().await).clone();
        let to_open = snapshot.clone();
        let open = timeout(
            self.open_timeout,
            tokio::task::spawn_blocking(move || to_open.open_read_only()),
        )
        .await;
        match open {
            Ok(Ok(Ok(connection))) => Ok(SnapshotSession {
                connection,
                snapshot,
            }),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(e)) => Err(SnapshotError(format!("open task failed: {e}"))),
            Err(_) => Err(SnapshotError("dataset open timed out".to_string())),
        }
    }

    pub async fn snapshot(&self) -> Snapshot {
        (*self.resource.get().await).clone()
    }

    #[must_use]
    pub fn try_snapshot(&self) -> Option<Snapshot> {
        self.resource.try_get().map(|s| (*s).clone())
    }

    pub async fn health(&self) -> DatasetHealth {
        let status = self.resource.status().await;
        DatasetHealth {
            ready: status.ready,
            version_hash: self.resource.try_get().map(|s| s.version().to_string()),
            last_updated: status.last_updated.map(DateTime::<Utc>::from),
        }
    }

    pub async fn shutdown(&self) {
        self.resource.shutdown().await;
    }
}

fn sweep_stale_generations(dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() && entry.file_name().to_string_lossy().starts_with("gen-") {
            if let Err(e) = fs::remove_dir_all(&path) {
                debug!(dir = %path.display(), "stale generation sweep failed: {e}");
            }
        }
    }
}
