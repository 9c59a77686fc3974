// Per-video progress and completion metadata. The completion flag mirrors
// the filesystem, never the counter: a record is complete iff every unit's
// local file exists on disk.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Persistence guard for a record that has reached completion. The record is
/// written at most once after first becoming complete; pre-completion
/// snapshots do not walk this machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteState {
    #[default]
    NotWritten,
    PendingWrite,
    Written,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRecord {
    pub source_url: String,
    pub cache_dir: PathBuf,
    pub total_segments: usize,
    /// Contiguously cached segments starting at index 0.
    pub cached_segments: usize,
    pub complete: bool,
    /// Total duration in seconds; 0 for progressive files.
    pub duration_secs: f64,
    #[serde(default)]
    pub write_state: WriteState,
}

impl CacheRecord {
    pub fn new(
        source_url: impl Into<String>,
        cache_dir: impl Into<PathBuf>,
        total_segments: usize,
        duration_secs: f64,
    ) -> Self {
        Self {
            source_url: source_url.into(),
            cache_dir: cache_dir.into(),
            total_segments,
            cached_segments: 0,
            complete: false,
            duration_secs,
            write_state: WriteState::default(),
        }
    }

    /// Updates the cached counter, clamped so it never exceeds the total.
    pub fn set_cached_segments(&mut self, cached: usize) {
        self.cached_segments = cached.min(self.total_segments);
    }

    /// Progress percentage: floor(cached / total * 100).
    pub fn percent(&self) -> u32 {
        if self.total_segments == 0 {
            return 0;
        }
        (self.cached_segments * 100 / self.total_segments) as u32
    }

    /// Records the outcome of a filesystem completeness scan. A complete
    /// record reports all segments cached regardless of the counter.
    pub fn set_complete(&mut self, complete: bool) {
        self.complete = complete;
        if complete {
            self.cached_segments = self.total_segments;
        }
    }
}

/// Scans `dir` for `local_names` and returns whether every file exists.
/// The filesystem is the source of truth for completeness.
pub async fn all_files_present<I>(dir: &Path, local_names: I) -> bool
where
    I: IntoIterator<Item = String>,
{
    for name in local_names {
        match tokio::fs::try_exists(dir.join(&name)).await {
            Ok(true) => {}
            _ => return false,
        }
    }
    true
}
