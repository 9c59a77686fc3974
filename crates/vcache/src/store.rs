// Sidecar persistence for cache records. Writes run off the calling path so
// persistence never blocks the fetch sequence, and the completion write is
// guarded by the record's tri-state write machine.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::DownloadError;
use crate::record::{CacheRecord, WriteState};

pub const RECORD_FILE_NAME: &str = "record.json";
const RECORD_TEMP_FILE_NAME: &str = "record.json.tmp";

/// Serializes and restores a [`CacheRecord`] in a per-video cache directory.
#[derive(Debug, Clone)]
pub struct RecordStore {
    dir: PathBuf,
}

impl RecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Restores the persisted record, if any. A corrupt sidecar is treated
    /// as absent so a restart can rebuild it from the filesystem.
    pub async fn load(&self) -> Option<CacheRecord> {
        let path = self.dir.join(RECORD_FILE_NAME);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read record sidecar");
                return None;
            }
        };
        match serde_json::from_slice::<CacheRecord>(&data) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Discarding corrupt record sidecar");
                None
            }
        }
    }

    /// Writes the record through a temp file and atomic rename, so a reader
    /// never observes a half-written sidecar.
    pub async fn write(&self, record: &CacheRecord) -> Result<(), DownloadError> {
        let data = serde_json::to_vec_pretty(record)
            .map_err(|e| DownloadError::record(e.to_string()))?;
        let temp = self.dir.join(RECORD_TEMP_FILE_NAME);
        tokio::fs::write(&temp, data).await?;
        tokio::fs::rename(&temp, self.dir.join(RECORD_FILE_NAME)).await?;
        Ok(())
    }

    /// Schedules a background write of a progress snapshot. Snapshot writes
    /// are allowed at any point before completion and do not consume the
    /// write-once guard.
    pub fn persist_snapshot(&self, record: CacheRecord) {
        let store = self.clone();
        tokio::spawn(async move {
            if let Err(e) = store.write(&record).await {
                warn!(url = %record.source_url, error = %e, "Snapshot persist failed");
            }
        });
    }

    /// Persists a completed record at most once: only the first call after
    /// `record.complete` becomes true schedules a write, transitioning
    /// `NotWritten -> PendingWrite -> Written`. Later completeness
    /// re-evaluations are no-ops. Returns whether a write was scheduled.
    pub fn persist_completed(&self, record: &Arc<Mutex<CacheRecord>>) -> bool {
        let snapshot = {
            let mut guard = record.lock();
            if !guard.complete || guard.write_state != WriteState::NotWritten {
                return false;
            }
            guard.write_state = WriteState::PendingWrite;
            let mut snapshot = guard.clone();
            // The sidecar records the final state; the in-memory transition
            // completes only after the write lands.
            snapshot.write_state = WriteState::Written;
            snapshot
        };

        let store = self.clone();
        let record = Arc::clone(record);
        tokio::spawn(async move {
            match store.write(&snapshot).await {
                Ok(()) => {
                    record.lock().write_state = WriteState::Written;
                    debug!(url = %snapshot.source_url, "Persisted completed record");
                }
                Err(e) => {
                    // Roll back so a later completeness check can retry.
                    record.lock().write_state = WriteState::NotWritten;
                    warn!(url = %snapshot.source_url, error = %e, "Completion persist failed");
                }
            }
        });
        true
    }
}
