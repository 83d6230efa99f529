//! Pool Snapshots
//!
//! Durable JSON image of every pool row and every sequence counter.
//! Files are written to a sibling temp file and renamed into place so a
//! crash never leaves a half-written snapshot behind. Processes sharing a
//! snapshot serialize on an advisory lock held on a sibling `.lock` file.

use crate::domain::ports::PoolEntry;
use crate::error::{Error, Result};
use crate::store::{MemoryPoolStore, MemorySequenceCounter};
use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Snapshot format version
pub const SNAPSHOT_VERSION: u32 = 1;

// =============================================================================
// Pool Snapshot
// =============================================================================

/// Serializable image of the store and counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub version: u32,
    pub taken_at: DateTime<Utc>,
    pub next_entry_id: u64,
    pub entries: Vec<PoolEntry>,
    /// Counter name -> next value
    pub sequences: BTreeMap<String, u64>,
}

impl PoolSnapshot {
    /// Capture the current state
    pub fn capture(store: &MemoryPoolStore, counters: &MemorySequenceCounter) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            taken_at: Utc::now(),
            next_entry_id: store.next_entry_id(),
            entries: store.entries(),
            sequences: counters.values(),
        }
    }

    /// Rebuild a store and counter table
    pub fn restore(self) -> Result<(Arc<MemoryPoolStore>, Arc<MemorySequenceCounter>)> {
        if self.version != SNAPSHOT_VERSION {
            return Err(Error::Snapshot(format!(
                "Unsupported snapshot version {} (expected {})",
                self.version, SNAPSHOT_VERSION
            )));
        }
        let store = MemoryPoolStore::from_entries(self.entries, self.next_entry_id)?;
        let counters = MemorySequenceCounter::from_values(self.sequences);
        Ok((store, counters))
    }
}

// =============================================================================
// Snapshot File
// =============================================================================

/// Snapshot file on local disk
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
    sync_writes: bool,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sync_writes: true,
        }
    }

    pub fn with_sync(mut self, sync_writes: bool) -> Self {
        self.sync_writes = sync_writes;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling file carrying the advisory lock
    pub fn lock_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Block until this process holds the state exclusively
    ///
    /// The lock lives as long as the returned guard.
    pub async fn lock(&self) -> Result<StateLock> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let lock_path = self.lock_path();
        let acquired = tokio::task::spawn_blocking(move || -> Result<StateLock> {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&lock_path)?;
            file.lock_exclusive()?;
            Ok(StateLock {
                path: lock_path,
                _file: file,
            })
        })
        .await
        .map_err(|e| Error::Internal(format!("State lock task failed: {}", e)))??;

        debug!("Locked state at {}", acquired.path.display());
        Ok(acquired)
    }

    /// Load the snapshot, `None` if the file does not exist yet
    pub async fn load(&self) -> Result<Option<PoolSnapshot>> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No snapshot at {}", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let snapshot: PoolSnapshot = serde_json::from_slice(&raw)?;
        info!(
            "Loaded snapshot from {} ({} entries)",
            self.path.display(),
            snapshot.entries.len()
        );
        Ok(Some(snapshot))
    }

    /// Write the snapshot atomically
    pub async fn save(&self, snapshot: &PoolSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let data = serde_json::to_vec_pretty(snapshot)?;
        let tmp_path = self.path.with_extension("tmp");

        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(&data).await?;
        if self.sync_writes {
            file.sync_all().await?;
        }
        drop(file);

        fs::rename(&tmp_path, &self.path).await?;
        debug!(
            "Saved snapshot to {} ({} entries)",
            self.path.display(),
            snapshot.entries.len()
        );
        Ok(())
    }
}

/// Exclusive hold on a snapshot, released when dropped
#[derive(Debug)]
pub struct StateLock {
    path: PathBuf,
    /// Closing the descriptor drops the lock
    _file: std::fs::File,
}

impl StateLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}
