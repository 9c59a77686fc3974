// Proxy manifest writer: serializes the playlist model back to manifest
// text with segment URLs rewritten to the local listener, publishing through
// a temp file and atomic rename so a concurrent reader never observes a
// half-written manifest.

use std::path::{Path, PathBuf};

use hls::{Playlist, SegmentKey};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::config::CacheProxyConfig;
use crate::error::DownloadError;

pub const PROXY_PLAYLIST_NAME: &str = "proxy.m3u8";
pub const TEMP_PLAYLIST_NAME: &str = "temp.m3u8";

/// Rewrites `playlist` into `dir`, substituting each segment URL with
/// `http://<host>:<port>/<namespace>/<localFileName>`. Returns the path of
/// the published manifest.
pub async fn write_proxy_playlist(
    playlist: &Playlist,
    dir: &Path,
    config: &CacheProxyConfig,
    namespace: &str,
) -> Result<PathBuf, DownloadError> {
    let text = render(playlist, dir, config, namespace);

    let temp = dir.join(TEMP_PLAYLIST_NAME);
    let published = dir.join(PROXY_PLAYLIST_NAME);

    let mut file = tokio::fs::File::create(&temp).await?;
    file.write_all(text.as_bytes()).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&temp, &published).await?;
    debug!(path = %published.display(), segments = playlist.len(), "Published proxy manifest");
    Ok(published)
}

fn render(playlist: &Playlist, dir: &Path, config: &CacheProxyConfig, namespace: &str) -> String {
    let mut out = String::new();
    out.push_str("#EXTM3U\n");
    out.push_str(&format!("#EXT-X-VERSION:{}\n", playlist.version));
    out.push_str(&format!(
        "#EXT-X-MEDIA-SEQUENCE:{}\n",
        playlist.media_sequence
    ));
    out.push_str(&format!(
        "#EXT-X-TARGETDURATION:{}\n",
        playlist.target_duration
    ));

    // EXT-X-KEY applies until replaced, so the tag is emitted only when the
    // active descriptor changes.
    let mut active_key: Option<&SegmentKey> = None;
    for segment in playlist.segments() {
        if segment.key.as_ref() != active_key {
            if let Some(key) = &segment.key {
                out.push_str(&render_key(key, dir));
            }
            active_key = segment.key.as_ref();
        }
        if segment.discontinuity {
            out.push_str("#EXT-X-DISCONTINUITY\n");
        }
        out.push_str(&format!("#EXTINF:{},\n", segment.duration));
        out.push_str(&config.proxy_url(namespace, &segment.local_name));
        out.push('\n');
    }
    out.push_str("#EXT-X-ENDLIST\n");
    out
}

fn render_key(key: &SegmentKey, dir: &Path) -> String {
    // A varying key may differ per segment; the shared local key file would
    // serve a stale key, so only a non-varying, already-fetched key is
    // relocated.
    let local = dir.join(&key.local_name);
    let uri = if !key.varies && local.is_file() {
        key.local_name.as_str()
    } else {
        key.uri.as_str()
    };

    let mut tag = format!("#EXT-X-KEY:METHOD={},URI=\"{}\"", key.method, uri);
    if let Some(iv) = &key.iv {
        tag.push_str(&format!(",IV={iv}"));
    }
    tag.push('\n');
    tag
}
