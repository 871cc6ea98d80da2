use crate::source::{CurrentPlayback, HistoryItem, SourceTrack};
use crate::time::minute_bucket;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Optional playback context attached to a listen.
///
/// Every field is optional; an absent field never overwrites a stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackContext {
    pub device_name: Option<String>,
    pub device_type: Option<String>,
    pub shuffle_state: Option<bool>,
    /// e.g. "playlist", "album", "artist"
    pub context_type: Option<String>,
    pub context_uri: Option<String>,
}

/// One listen event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Play {
    pub track_id: String,
    pub name: String,
    /// Artist names, in credit order
    pub artists: Vec<String>,
    /// Artist IDs, in credit order
    pub artist_ids: Vec<String>,
    pub album: String,
    pub album_id: Option<String>,
    pub album_art: Option<String>,
    pub duration_ms: u64,
    pub played_at: DateTime<Utc>,
    /// Dedup bucket; derived from `played_at` when not supplied
    pub played_at_rounded: Option<DateTime<Utc>>,
    pub context: PlaybackContext,
}

impl Play {
    fn from_track(
        track: &SourceTrack,
        played_at: DateTime<Utc>,
        context: PlaybackContext,
    ) -> Self {
        Self {
            track_id: track.id.clone(),
            name: track.name.clone(),
            artists: track.artists.iter().map(|a| a.name.clone()).collect(),
            artist_ids: track.artists.iter().filter_map(|a| a.id.clone()).collect(),
            album: track.album.name.clone(),
            album_id: track.album.id.clone(),
            album_art: track.album.art_url.clone(),
            duration_ms: track.duration_ms,
            played_at,
            played_at_rounded: None,
            context,
        }
    }

    /// Build a play from a live poll observed at `observed_at`.
    #[must_use]
    pub fn from_playback(
        track: &SourceTrack,
        playback: &CurrentPlayback,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self::from_track(track, observed_at, playback.context.clone())
    }

    /// Build a play from a history entry, keeping the source's exact timestamp.
    #[must_use]
    pub fn from_history(item: &HistoryItem) -> Self {
        Self::from_track(&item.track, item.played_at, item.context.clone())
    }

    /// The dedup bucket for this play.
    #[must_use]
    pub fn bucket(&self) -> DateTime<Utc> {
        self.played_at_rounded
            .unwrap_or_else(|| minute_bucket(self.played_at))
    }
}

/// A play as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPlay {
    pub id: i64,
    pub play: Play,
    pub created_at: DateTime<Utc>,
}

/// Aggregate statistics for one track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackStats {
    pub track_id: String,
    pub name: String,
    pub artists: Vec<String>,
    pub album: String,
    pub album_art: Option<String>,
    pub duration_ms: u64,
    pub listen_count: u64,
    pub first_listened_at: DateTime<Utc>,
    pub last_listened_at: DateTime<Utc>,
}

/// Artist metadata, written once and never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artist {
    pub artist_id: String,
    pub name: String,
    pub genres: Vec<String>,
    pub popularity: Option<u32>,
    pub image: Option<String>,
}

/// Album metadata, written once and never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Album {
    pub album_id: String,
    pub name: String,
    pub release_date: Option<String>,
    pub label: Option<String>,
    pub genres: Vec<String>,
    pub popularity: Option<u32>,
    pub image: Option<String>,
}

/// Current playback as cached for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NowPlayingSnapshot {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub album_art: Option<String>,
    pub url: Option<String>,
    pub is_playing: bool,
    pub progress_ms: Option<u64>,
    pub duration_ms: u64,
}

impl NowPlayingSnapshot {
    #[must_use]
    pub fn new(track: &SourceTrack, playback: &CurrentPlayback) -> Self {
        Self {
            title: track.name.clone(),
            artist: track.artist_line(),
            album: track.album.name.clone(),
            album_art: track.album.art_url.clone(),
            url: track.url.clone(),
            is_playing: playback.is_playing,
            progress_ms: playback.progress_ms,
            duration_ms: track.duration_ms,
        }
    }
}
