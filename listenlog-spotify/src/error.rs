use listenlog_core::{CoreError, MusicSource};
use thiserror::Error;

/// Errors raised while talking to Spotify.
#[derive(Debug, Error)]
pub enum SpotifyError {
    /// Authentication failed during OAuth flow or token exchange.
    #[error("Spotify authentication failed: {reason}")]
    AuthFailed { reason: String },

    /// No token is loaded; `listenlog auth` has not been run.
    #[error("Not signed in to Spotify")]
    NotAuthenticated,

    /// An ID stored locally is not a valid Spotify ID.
    #[error("Invalid Spotify ID {id}: {reason}")]
    InvalidId { id: String, reason: String },

    /// Error from the Spotify API client.
    #[error("Spotify API error: {0}")]
    Api(#[from] rspotify::ClientError),

    /// Failed to read the token cache file or perform I/O.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse or serialize JSON data.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<SpotifyError> for CoreError {
    fn from(err: SpotifyError) -> Self {
        match err {
            SpotifyError::NotAuthenticated => Self::NotAuthenticated,
            other => Self::Upstream {
                source_name: MusicSource::Spotify.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

/// Convenience type alias for Results with `SpotifyError`.
pub type Result<T> = std::result::Result<T, SpotifyError>;
