use std::sync::Arc;

use hls::Playlist;

use crate::error::DownloadError;

/// Consumer interface through which a download task reports readiness,
/// progress, completion, and failure.
///
/// Callbacks are invoked from worker tasks; implementations must not block.
pub trait CacheEventHandler: Send + Sync {
    /// The local proxy URL can be handed to a player. Fired once per task,
    /// after the (possibly partial) local manifest has been published.
    fn on_cache_ready(&self, source_url: &str, local_proxy_url: &str);

    /// Progress update. `percent` is floor(cached / total * 100);
    /// `playlist` is the current snapshot for HLS content, `None` for
    /// progressive files.
    fn on_cache_progress(
        &self,
        source_url: &str,
        percent: u32,
        cached_bytes: u64,
        playlist: Option<Arc<Playlist>>,
    );

    /// Every unit of the task is filesystem-verified present. Fired once.
    fn on_cache_finished(&self, source_url: &str);

    /// A non-recoverable fetch error. Sibling units keep running; the last
    /// reported progress stays valid.
    fn on_cache_failed(&self, source_url: &str, error: &DownloadError);
}
