//! Fixtures shared by unit tests: a scripted listening source, a settable clock and
//! play builders.
#![allow(clippy::panic)]

use crate::error::{CoreError, Result};
use crate::model::{Album, Artist, PlaybackContext, Play};
use crate::source::{
    AlbumRef, ArtistRef, CurrentPlayback, HistoryItem, ListeningSource, MusicSource, SourceTrack,
};
use crate::time::Clock;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// A play of `track_id` at the given time on 2024-05-01, with one artist and an album.
pub fn play_at(track_id: &str, hour: u32, minute: u32, second: u32) -> Play {
    Play {
        track_id: track_id.to_string(),
        name: format!("Song {track_id}"),
        artists: vec![format!("Artist {track_id}")],
        artist_ids: vec![format!("artist-{track_id}")],
        album: format!("Album {track_id}"),
        album_id: Some(format!("album-{track_id}")),
        album_art: Some(format!("https://img/{track_id}")),
        duration_ms: 200_000,
        played_at: Utc
            .with_ymd_and_hms(2024, 5, 1, hour, minute, second)
            .unwrap(),
        played_at_rounded: None,
        context: PlaybackContext::default(),
    }
}

pub fn artist(id: &str, name: &str) -> Artist {
    Artist {
        artist_id: id.to_string(),
        name: name.to_string(),
        genres: vec!["shoegaze".to_string()],
        popularity: Some(42),
        image: None,
    }
}

pub fn album(id: &str) -> Album {
    Album {
        album_id: id.to_string(),
        name: format!("Album {id}"),
        release_date: Some("1991-11-04".to_string()),
        label: Some("Creation".to_string()),
        genres: vec!["indie".to_string()],
        popularity: Some(60),
        image: None,
    }
}

pub fn source_track(id: &str) -> SourceTrack {
    SourceTrack {
        id: id.to_string(),
        name: format!("Song {id}"),
        artists: vec![ArtistRef {
            id: Some(format!("artist-{id}")),
            name: format!("Artist {id}"),
        }],
        album: AlbumRef {
            id: Some(format!("album-{id}")),
            name: format!("Album {id}"),
            art_url: Some(format!("https://img/{id}")),
        },
        duration_ms: 200_000,
        url: Some(format!("https://open.spotify.com/track/{id}")),
    }
}

pub fn playing(id: &str, progress_ms: u64) -> CurrentPlayback {
    CurrentPlayback {
        is_playing: true,
        progress_ms: Some(progress_ms),
        track: Some(source_track(id)),
        context: PlaybackContext {
            device_name: Some("Desk".to_string()),
            ..Default::default()
        },
    }
}

/// One scripted answer to `current_playback`.
#[derive(Debug, Clone)]
pub enum Scripted {
    Playback(Option<CurrentPlayback>),
    Fail,
    Stall(Duration),
    Panic,
}

/// Scripted source. Unscripted playback calls report nothing playing.
#[derive(Default)]
pub struct FakeSource {
    session: AtomicBool,
    script: Mutex<VecDeque<Scripted>>,
    history: Mutex<Vec<HistoryItem>>,
    pub playback_calls: AtomicUsize,
    pub history_calls: AtomicUsize,
    pub artist_calls: AtomicUsize,
    pub album_calls: AtomicUsize,
}

impl FakeSource {
    pub fn new() -> Self {
        let source = Self::default();
        source.session.store(true, Ordering::SeqCst);
        source
    }

    pub fn signed_out() -> Self {
        Self::default()
    }

    pub fn push(&self, step: Scripted) {
        self.script.lock().unwrap().push_back(step);
    }

    pub fn set_history(&self, items: Vec<HistoryItem>) {
        *self.history.lock().unwrap() = items;
    }

    pub fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ListeningSource for FakeSource {
    fn source(&self) -> MusicSource {
        MusicSource::Spotify
    }

    async fn has_session(&self) -> bool {
        self.session.load(Ordering::SeqCst)
    }

    #[allow(clippy::panic)]
    async fn current_playback(&self) -> Result<Option<CurrentPlayback>> {
        self.playback_calls.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().unwrap().pop_front();
        match step {
            None => Ok(None),
            Some(Scripted::Playback(playback)) => Ok(playback),
            Some(Scripted::Fail) => Err(CoreError::Upstream {
                source_name: "spotify".to_string(),
                reason: "scripted failure".to_string(),
            }),
            Some(Scripted::Stall(duration)) => {
                tokio::time::sleep(duration).await;
                Ok(None)
            }
            Some(Scripted::Panic) => panic!("scripted panic"),
        }
    }

    async fn recently_played(&self, limit: u32) -> Result<Vec<HistoryItem>> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        Ok(self.history.lock().unwrap().iter().take(limit).cloned().collect())
    }

    async fn artists(&self, ids: &[String]) -> Result<Vec<Artist>> {
        self.artist_calls.fetch_add(1, Ordering::SeqCst);
        Ok(ids
            .iter()
            .map(|id| artist(id, &format!("Name of {id}")))
            .collect())
    }

    async fn album(&self, id: &str) -> Result<Option<Album>> {
        self.album_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some(album(id)))
    }
}

/// Clock pinned to a settable instant.
pub struct FixedClock(Mutex<DateTime<Utc>>);

impl FixedClock {
    pub fn at(hour: u32, minute: u32, second: u32) -> Self {
        Self(Mutex::new(
            Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, second)
                .unwrap(),
        ))
    }

    pub fn set(&self, hour: u32, minute: u32, second: u32) {
        *self.0.lock().unwrap() = Utc
            .with_ymd_and_hms(2024, 5, 1, hour, minute, second)
            .unwrap();
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}
