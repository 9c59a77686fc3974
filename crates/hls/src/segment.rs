// Per-segment state. Mutable fields are written only by the worker that owns
// the index, so they are plain atomics rather than lock-guarded data.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Encryption descriptor for a segment, fixed at parse time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentKey {
    /// Key method as it appears in the manifest (`AES-128`, `SAMPLE-AES`, ...).
    pub method: String,
    /// Remote key URI, resolved against the playlist URL.
    pub uri: String,
    /// Local file name the key is cached under.
    pub local_name: String,
    /// Initialization vector, verbatim from the manifest.
    pub iv: Option<String>,
    /// True when the manifest carries more than one distinct key URI. A
    /// varying key is never substituted with the shared local key file,
    /// since that file may hold the key of a different segment.
    pub varies: bool,
}

#[derive(Debug)]
pub struct Segment {
    /// Position in the playlist; unique and stable after parsing.
    pub index: usize,
    /// Remote URL, resolved against the playlist URL.
    pub url: String,
    /// Assigned local file name (`seg_<index>.ts`).
    pub local_name: String,
    /// Duration in seconds.
    pub duration: f32,
    pub discontinuity: bool,
    pub key: Option<SegmentKey>,

    size: AtomicU64,
    fetched: AtomicBool,
}

impl Segment {
    pub fn new(
        index: usize,
        url: String,
        duration: f32,
        discontinuity: bool,
        key: Option<SegmentKey>,
    ) -> Self {
        Self {
            index,
            url,
            local_name: crate::segment_local_name(index),
            duration,
            discontinuity,
            key,
            size: AtomicU64::new(0),
            fetched: AtomicBool::new(false),
        }
    }

    /// Byte size of the cached file; 0 until the segment has been fetched.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn is_fetched(&self) -> bool {
        self.fetched.load(Ordering::Acquire)
    }

    /// Records a completed fetch. Called by the single worker owning this
    /// index, or by restore logic before any worker group exists.
    pub fn mark_fetched(&self, size: u64) {
        self.size.store(size, Ordering::Release);
        self.fetched.store(true, Ordering::Release);
    }
}
