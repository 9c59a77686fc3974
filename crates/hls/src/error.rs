#[derive(Debug, thiserror::Error)]
pub enum PlaylistError {
    #[error("failed to parse manifest: {reason}")]
    Parse { reason: String },

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("manifest contains no segments")]
    Empty,

    #[error("master playlists carry no media segments; select a variant first")]
    MasterPlaylist,
}

impl PlaylistError {
    pub fn parse(reason: impl Into<String>) -> Self {
        Self::Parse {
            reason: reason.into(),
        }
    }

    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }
}
