//! Listening source identification and provider trait.

use crate::error::Result;
use crate::model::{Album, Artist, PlaybackContext};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies a listening source.
///
/// The identifier is stable and used in logs and upstream error reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MusicSource {
    /// Spotify streaming service
    Spotify,
}

impl MusicSource {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Spotify => "spotify",
        }
    }
}

impl std::fmt::Display for MusicSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Artist reference as it appears on a track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtistRef {
    /// Local files and some podcasts carry artists without an ID
    pub id: Option<String>,
    pub name: String,
}

/// Album reference as it appears on a track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlbumRef {
    pub id: Option<String>,
    pub name: String,
    pub art_url: Option<String>,
}

/// A track as reported by the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTrack {
    pub id: String,
    pub name: String,
    pub artists: Vec<ArtistRef>,
    pub album: AlbumRef,
    pub duration_ms: u64,
    /// Link to the track on the source's web player
    pub url: Option<String>,
}

impl SourceTrack {
    /// Artist names joined for display.
    #[must_use]
    pub fn artist_line(&self) -> String {
        self.artists
            .iter()
            .map(|a| a.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Result of a "current playback" query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentPlayback {
    pub is_playing: bool,
    pub progress_ms: Option<u64>,
    /// None for episodes, ads, or an idle device
    pub track: Option<SourceTrack>,
    pub context: PlaybackContext,
}

impl CurrentPlayback {
    /// The track, only when something is actively playing.
    #[must_use]
    pub fn playing_track(&self) -> Option<&SourceTrack> {
        if self.is_playing {
            self.track.as_ref()
        } else {
            None
        }
    }
}

/// One entry of the "recently played" history window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryItem {
    pub track: SourceTrack,
    /// Authoritative timestamp recorded by the source
    pub played_at: DateTime<Utc>,
    pub context: PlaybackContext,
}

/// Trait for sources that report what a user is listening to.
///
/// Implementations wrap a remote API. Every method is one external request, which
/// the live poller counts to decide its next delay.
#[async_trait]
pub trait ListeningSource: Send + Sync {
    /// Returns the source this provider talks to.
    fn source(&self) -> MusicSource;

    /// Whether a valid session/credential is available.
    ///
    /// Jobs skip (rather than fail) when this is false.
    async fn has_session(&self) -> bool;

    /// Query the active playback state. `None` when no device is active.
    ///
    /// # Errors
    ///
    /// Returns an error if the upstream request fails.
    async fn current_playback(&self) -> Result<Option<CurrentPlayback>>;

    /// Query up to `limit` recently played items, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the upstream request fails.
    async fn recently_played(&self, limit: u32) -> Result<Vec<HistoryItem>>;

    /// Fetch metadata for a batch of artists in one request.
    ///
    /// Unknown IDs are omitted from the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the upstream request fails.
    async fn artists(&self, ids: &[String]) -> Result<Vec<Artist>>;

    /// Fetch metadata for one album.
    ///
    /// # Errors
    ///
    /// Returns an error if the upstream request fails.
    async fn album(&self, id: &str) -> Result<Option<Album>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track() -> SourceTrack {
        SourceTrack {
            id: "t1".into(),
            name: "Song".into(),
            artists: vec![
                ArtistRef {
                    id: Some("a1".into()),
                    name: "First".into(),
                },
                ArtistRef {
                    id: None,
                    name: "Second".into(),
                },
            ],
            album: AlbumRef {
                id: None,
                name: "Album".into(),
                art_url: None,
            },
            duration_ms: 1000,
            url: None,
        }
    }

    #[test]
    fn test_artist_line_joins_names() {
        assert_eq!(track().artist_line(), "First, Second");
    }

    #[test]
    fn test_paused_playback_has_no_playing_track() {
        let playback = CurrentPlayback {
            is_playing: false,
            progress_ms: Some(10),
            track: Some(track()),
            context: PlaybackContext::default(),
        };
        assert!(playback.playing_track().is_none());
    }

    #[test]
    fn test_music_source_display() {
        assert_eq!(MusicSource::Spotify.to_string(), "spotify");
    }
}
