use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};
use sha2::{Digest, Sha256};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// Redirect hops followed before a fetch fails with `RedirectLimit`.
pub const DEFAULT_MAX_REDIRECTS: u32 = 3;

/// Fixed size of the transfer buffer used when streaming a response body to
/// disk.
pub const TRANSFER_BUFFER_SIZE: usize = 64 * 1024;

/// Configurable options for the cache proxy engine.
///
/// `host`/`port` describe the collaborating HTTP listener that serves the
/// cache root; this crate only lays files out underneath `cache_root` and
/// builds proxy URLs pointing at that listener.
#[derive(Debug, Clone)]
pub struct CacheProxyConfig {
    /// Host the local listener is bound to.
    pub host: String,

    /// Port the local listener is bound to.
    pub port: u16,

    /// Directory the listener serves; one subdirectory per video.
    pub cache_root: PathBuf,

    /// Connection timeout (time to establish the initial connection).
    pub connect_timeout: Duration,

    /// Read timeout (maximum time between receiving data chunks). A read
    /// timeout during a segment fetch is recoverable and triggers an
    /// auto-resume of the fetch sequence.
    pub read_timeout: Duration,

    /// User agent string.
    pub user_agent: String,

    /// Custom HTTP headers merged over the defaults for every request.
    pub headers: HeaderMap,

    /// Skip certificate validation for secure endpoints. Explicit escape
    /// hatch for endpoints with broken chains; off unless the host opts in.
    pub danger_accept_invalid_certs: bool,

    /// Redirect hops followed manually before failing with `RedirectLimit`.
    pub max_redirects: u32,

    /// Concurrent fetch units per download task.
    pub download_concurrency: usize,

    /// Interval of the periodic progress ticker.
    pub progress_interval: Duration,
}

impl Default for CacheProxyConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8090,
            cache_root: PathBuf::from(".video-cache"),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: CacheProxyConfig::get_default_headers(),
            danger_accept_invalid_certs: false,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            download_concurrency: 5,
            progress_interval: Duration::from_secs(1),
        }
    }
}

impl CacheProxyConfig {
    pub fn new(host: impl Into<String>, port: u16, cache_root: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            port,
            cache_root: cache_root.into(),
            ..Default::default()
        }
    }

    pub fn with_timeouts(mut self, connect: Duration, read: Duration) -> Self {
        self.connect_timeout = connect;
        self.read_timeout = read;
        self
    }

    /// Merges caller-supplied headers over the defaults; caller headers take
    /// precedence for the same field.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        for (name, value) in headers.iter() {
            self.headers.insert(name.clone(), value.clone());
        }
        self
    }

    pub fn with_max_redirects(mut self, max_redirects: u32) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    pub fn with_download_concurrency(mut self, concurrency: usize) -> Self {
        self.download_concurrency = concurrency.max(1);
        self
    }

    pub fn with_danger_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.danger_accept_invalid_certs = accept;
        self
    }

    /// Stable cache namespace for a source URL; doubles as the per-video
    /// directory name and the path component of proxy URLs.
    pub fn cache_namespace(source_url: &str) -> String {
        let digest = Sha256::digest(source_url.as_bytes());
        let mut namespace = String::with_capacity(16);
        for byte in digest.iter().take(8) {
            namespace.push_str(&format!("{byte:02x}"));
        }
        namespace
    }

    /// Per-video cache directory for a source URL.
    pub fn cache_dir(&self, source_url: &str) -> PathBuf {
        self.cache_root.join(Self::cache_namespace(source_url))
    }

    /// Locally served URL for a file in a video's cache directory:
    /// `http://<host>:<port>/<cacheNamespace>/<fileName>`.
    pub fn proxy_url(&self, namespace: &str, file_name: &str) -> String {
        format!(
            "http://{}:{}/{}/{}",
            self.host, self.port, namespace, file_name
        )
    }

    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, deflate"),
        );

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );

        default_headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));

        default_headers
    }
}

/// Sums the sizes of regular files directly inside `dir`. Fallback source of
/// the cached-byte total when no in-memory segment sizes are known, e.g.
/// right after restoring a persisted record.
pub async fn directory_size(dir: &Path) -> u64 {
    let mut total = 0u64;
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return 0;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Ok(meta) = entry.metadata().await
            && meta.is_file()
        {
            total += meta.len();
        }
    }
    total
}
