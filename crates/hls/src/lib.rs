// HLS playlist model: parse-once manifest representation and segment bookkeeping.

pub mod error;
pub mod playlist;
pub mod segment;

pub use error::PlaylistError;
pub use playlist::Playlist;
pub use segment::{Segment, SegmentKey};

/// File name prefix for locally cached segments (`seg_<index>.ts`).
pub const SEGMENT_FILE_PREFIX: &str = "seg_";

/// Local file name for a playlist-wide encryption key.
pub const LOCAL_KEY_FILE_NAME: &str = "local.key";

/// Deterministic local file name for the segment at `index`.
pub fn segment_local_name(index: usize) -> String {
    format!("{SEGMENT_FILE_PREFIX}{index}.ts")
}
