// Format-specific strategy behind the shared orchestration skeleton: HLS
// enumerates playlist segments and publishes a rewritten manifest, while a
// progressive file is a single unit served directly from its cached file.

use std::path::Path;
use std::sync::Arc;

use hls::Playlist;

use crate::hls::writer::PROXY_PLAYLIST_NAME;

/// What a unit of work fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Media,
    Key,
}

/// One fetch: a remote URL bound to a local file name.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub index: usize,
    pub url: String,
    pub local_name: String,
    pub kind: UnitKind,
}

pub enum MediaVariant {
    Hls(Arc<Playlist>),
    Progressive { url: String, local_name: String },
}

impl MediaVariant {
    pub fn progressive(url: &str) -> Self {
        let extension = url
            .rsplit('/')
            .next()
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext.split(['?', '#']).next().unwrap_or("mp4"))
            .filter(|ext| !ext.is_empty() && ext.len() <= 4)
            .unwrap_or("mp4");
        Self::Progressive {
            url: url.to_string(),
            local_name: format!("video.{extension}"),
        }
    }

    pub fn playlist(&self) -> Option<&Arc<Playlist>> {
        match self {
            Self::Hls(playlist) => Some(playlist),
            Self::Progressive { .. } => None,
        }
    }

    pub fn total_units(&self) -> usize {
        match self {
            Self::Hls(playlist) => playlist.len(),
            Self::Progressive { .. } => 1,
        }
    }

    /// Total duration in seconds; unknown (0) for progressive files.
    pub fn duration(&self) -> f64 {
        match self {
            Self::Hls(playlist) => playlist.duration(),
            Self::Progressive { .. } => 0.0,
        }
    }

    pub fn unit(&self, index: usize) -> Option<WorkUnit> {
        match self {
            Self::Hls(playlist) => playlist.segment(index).map(|segment| WorkUnit {
                index,
                url: segment.url.clone(),
                local_name: segment.local_name.clone(),
                kind: UnitKind::Media,
            }),
            Self::Progressive { url, local_name } => (index == 0).then(|| WorkUnit {
                index: 0,
                url: url.clone(),
                local_name: local_name.clone(),
                kind: UnitKind::Media,
            }),
        }
    }

    /// Side unit fetching the playlist-wide encryption key, when one exists
    /// and does not vary per segment.
    pub fn key_unit(&self) -> Option<WorkUnit> {
        let playlist = self.playlist()?;
        playlist.shared_key().map(|key| WorkUnit {
            index: 0,
            url: key.uri.clone(),
            local_name: key.local_name.clone(),
            kind: UnitKind::Key,
        })
    }

    /// File the proxy URL points at once the cache is ready.
    pub fn ready_file_name(&self) -> &str {
        match self {
            Self::Hls(_) => PROXY_PLAYLIST_NAME,
            Self::Progressive { local_name, .. } => local_name,
        }
    }

    /// Local file names that must all exist for the cache to be complete.
    pub fn local_names(&self) -> Vec<String> {
        match self {
            Self::Hls(playlist) => playlist
                .segments()
                .iter()
                .map(|s| s.local_name.clone())
                .collect(),
            Self::Progressive { local_name, .. } => vec![local_name.clone()],
        }
    }

    pub fn index_for_percent(&self, percent: f32) -> usize {
        match self {
            Self::Hls(playlist) => playlist.index_for_percent(percent),
            Self::Progressive { .. } => 0,
        }
    }

    pub fn index_for_position(&self, position_secs: f64) -> usize {
        match self {
            Self::Hls(playlist) => playlist.index_for_position(position_secs),
            Self::Progressive { .. } => 0,
        }
    }

    /// Index the fetch sequence restarts from after a pause or transient
    /// failure: the first unit past the contiguous cached prefix.
    pub fn resume_index(&self) -> usize {
        match self {
            Self::Hls(playlist) => playlist.contiguous_cached(),
            Self::Progressive { .. } => 0,
        }
    }

    /// Records a completed unit and returns the new contiguous cached count.
    pub fn record_unit_success(&self, index: usize, size: u64) -> usize {
        match self {
            Self::Hls(playlist) => {
                if let Some(segment) = playlist.segment(index) {
                    segment.mark_fetched(size);
                }
                playlist.advance_cursor()
            }
            Self::Progressive { .. } => 1,
        }
    }

    /// Sum of known unit sizes; 0 means unknown and callers fall back to a
    /// directory scan.
    pub fn cached_bytes(&self) -> u64 {
        match self {
            Self::Hls(playlist) => playlist.cached_bytes(),
            Self::Progressive { .. } => 0,
        }
    }

    /// Replays on-disk state into the in-memory model after a restart and
    /// returns the contiguous cached count.
    pub async fn restore_from(&self, dir: &Path) -> usize {
        match self {
            Self::Hls(playlist) => {
                for segment in playlist.segments() {
                    if let Ok(meta) = tokio::fs::metadata(dir.join(&segment.local_name)).await
                        && meta.is_file()
                    {
                        segment.mark_fetched(meta.len());
                    }
                }
                playlist.advance_cursor()
            }
            Self::Progressive { local_name, .. } => {
                match tokio::fs::metadata(dir.join(local_name)).await {
                    Ok(meta) if meta.is_file() => 1,
                    _ => 0,
                }
            }
        }
    }
}
