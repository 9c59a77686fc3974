use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("redirect limit exceeded after {hops} hops for {url}")]
    RedirectLimit { hops: u32, url: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("playlist error: {source}")]
    Playlist {
        #[from]
        source: hls::PlaylistError,
    },

    #[error("cache record error: {reason}")]
    Record { reason: String },

    #[error("operation timed out: {reason}")]
    Timeout { reason: String },

    #[error("`{operation}` is not valid in state {state}")]
    InvalidState {
        state: &'static str,
        operation: &'static str,
    },
}

impl DownloadError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn http_status(
        status: StatusCode,
        url: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn record(reason: impl Into<String>) -> Self {
        Self::Record {
            reason: reason.into(),
        }
    }

    pub fn timeout(reason: impl Into<String>) -> Self {
        Self::Timeout {
            reason: reason.into(),
        }
    }

    /// Transient conditions that trigger an auto-resume of the fetch
    /// sequence instead of surfacing a failure.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Network { source } => source.is_timeout(),
            _ => false,
        }
    }

    /// Per-segment conditions that leave the segment unfetched without
    /// failing the task. Kept distinct from `RedirectLimit`, which aborts
    /// the segment and is surfaced to the consumer.
    pub fn is_skippable(&self) -> bool {
        matches!(self, Self::InvalidUrl { .. })
    }
}
