// Parse-once playlist model. The segment sequence never grows or shrinks
// after parsing; workers mutate per-segment state through disjoint indices.

use std::sync::atomic::{AtomicUsize, Ordering};

use m3u8_rs::KeyMethod;
use tracing::debug;
use url::Url;

use crate::error::PlaylistError;
use crate::segment::{Segment, SegmentKey};
use crate::LOCAL_KEY_FILE_NAME;

#[derive(Debug)]
pub struct Playlist {
    /// Source manifest URL.
    pub source_url: String,
    pub version: u64,
    pub media_sequence: u64,
    pub target_duration: u64,
    segments: Vec<Segment>,
    /// Total duration in seconds, clamped to at least 1 so percent mapping
    /// stays defined for degenerate manifests.
    duration: f64,
    /// Count of contiguously cached segments starting at index 0.
    contiguous: AtomicUsize,
}

impl Playlist {
    /// Parses manifest text into the model, resolving segment and key URIs
    /// against `source_url`.
    pub fn parse(text: &str, source_url: &str) -> Result<Playlist, PlaylistError> {
        let base = Url::parse(source_url)
            .map_err(|e| PlaylistError::invalid_url(source_url, e.to_string()))?;

        let media = match m3u8_rs::parse_playlist_res(text.as_bytes()) {
            Ok(m3u8_rs::Playlist::MediaPlaylist(pl)) => pl,
            Ok(m3u8_rs::Playlist::MasterPlaylist(_)) => {
                return Err(PlaylistError::MasterPlaylist);
            }
            Err(e) => return Err(PlaylistError::parse(e.to_string())),
        };

        if media.segments.is_empty() {
            return Err(PlaylistError::Empty);
        }

        // EXT-X-KEY applies to every following segment until replaced;
        // m3u8-rs only attaches the tag where it appears, so propagate here.
        let mut current_key: Option<SegmentKey> = None;
        let mut segments = Vec::with_capacity(media.segments.len());
        let mut distinct_key_uris: Vec<String> = Vec::new();

        for (index, seg) in media.segments.iter().enumerate() {
            if let Some(key) = &seg.key {
                current_key = convert_key(key, &base)?;
                if let Some(k) = &current_key
                    && !distinct_key_uris.contains(&k.uri)
                {
                    distinct_key_uris.push(k.uri.clone());
                }
            }

            let url = resolve(&base, &seg.uri)?;
            segments.push(Segment::new(
                index,
                url,
                seg.duration,
                seg.discontinuity,
                current_key.clone(),
            ));
        }

        // More than one distinct key URI means the shared local key file can
        // hold the wrong key for a given segment; flag every descriptor so
        // the rewriter keeps remote key URIs.
        if distinct_key_uris.len() > 1 {
            for segment in &mut segments {
                if let Some(key) = &mut segment.key {
                    key.varies = true;
                }
            }
        }

        let duration: f64 = segments.iter().map(|s| f64::from(s.duration)).sum();
        debug!(
            url = %source_url,
            segments = segments.len(),
            duration_secs = duration,
            keys = distinct_key_uris.len(),
            "Parsed media playlist"
        );

        Ok(Playlist {
            source_url: source_url.to_string(),
            version: media.version.unwrap_or(3) as u64,
            media_sequence: media.media_sequence,
            target_duration: media.target_duration,
            segments,
            duration: duration.max(1.0),
            contiguous: AtomicUsize::new(0),
        })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn segment(&self, index: usize) -> Option<&Segment> {
        self.segments.get(index)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Total duration in seconds.
    pub fn duration(&self) -> f64 {
        self.duration
    }

    /// Whether the playlist carries a single, non-varying key descriptor.
    pub fn shared_key(&self) -> Option<&SegmentKey> {
        self.segments
            .iter()
            .find_map(|s| s.key.as_ref())
            .filter(|k| !k.varies)
    }

    /// Maps a playback position (seconds) to the segment covering it via the
    /// cumulative duration table. Positions at or past the total duration map
    /// to the last index.
    pub fn index_for_position(&self, position: f64) -> usize {
        let mut start = 0.0;
        for segment in &self.segments {
            let end = start + f64::from(segment.duration);
            if position < end {
                return segment.index;
            }
            start = end;
        }
        self.segments.len() - 1
    }

    /// Maps a seek percentage in [0, 100] to a segment index. Out-of-range
    /// input is clamped; 0 maps to the first index, 100 to the last.
    pub fn index_for_percent(&self, percent: f32) -> usize {
        let percent = f64::from(percent).clamp(0.0, 100.0);
        self.index_for_position(percent / 100.0 * self.duration)
    }

    /// Count of contiguously cached segments starting at index 0. The next
    /// segment to fetch on resume is exactly this index.
    pub fn contiguous_cached(&self) -> usize {
        self.contiguous.load(Ordering::Acquire)
    }

    /// Recomputes the contiguous prefix of fetched segments and returns it.
    pub fn advance_cursor(&self) -> usize {
        let count = self
            .segments
            .iter()
            .take_while(|s| s.is_fetched())
            .count();
        self.contiguous.store(count, Ordering::Release);
        count
    }

    /// Sum of known segment sizes; 0 when no sizes have been recorded yet.
    pub fn cached_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.size()).sum()
    }
}

fn resolve(base: &Url, uri: &str) -> Result<String, PlaylistError> {
    base.join(uri)
        .map(|u| u.to_string())
        .map_err(|e| PlaylistError::invalid_url(uri, e.to_string()))
}

fn convert_key(key: &m3u8_rs::Key, base: &Url) -> Result<Option<SegmentKey>, PlaylistError> {
    let method = match &key.method {
        KeyMethod::None => return Ok(None),
        KeyMethod::AES128 => "AES-128".to_string(),
        KeyMethod::SampleAES => "SAMPLE-AES".to_string(),
        KeyMethod::Other(other) => other.clone(),
    };
    let Some(uri) = &key.uri else {
        return Ok(None);
    };
    Ok(Some(SegmentKey {
        method,
        uri: resolve(base, uri)?,
        local_name: LOCAL_KEY_FILE_NAME.to_string(),
        iv: key.iv.clone(),
        varies: false,
    }))
}
