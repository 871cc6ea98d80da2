//! `ListeningSource` backed by the Spotify Web API.

use crate::error::SpotifyError;
use crate::session::{SpotifySession, TokenFileStamp};
use async_trait::async_trait;
use chrono::TimeDelta;
use listenlog_core::{
    Album, AlbumRef, Artist, ArtistRef, CurrentPlayback, HistoryItem, ListeningSource,
    MusicSource, PlaybackContext, SourceTrack,
};
use rspotify::model::{
    AdditionalType, AlbumId, ArtistId, Context, CurrentPlaybackContext, FullAlbum, FullArtist,
    FullTrack, Image, PlayHistory, PlayableItem,
};
use rspotify::prelude::*;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Largest page the recently-played endpoint accepts
const MAX_HISTORY_LIMIT: u32 = 50;

/// Largest batch the several-artists endpoint accepts
const MAX_ARTIST_BATCH: usize = 50;

pub struct SpotifySource {
    session: Arc<SpotifySession>,
    /// Token file version that last failed to give a session
    rejected: Mutex<Option<Option<TokenFileStamp>>>,
}

impl SpotifySource {
    #[must_use]
    pub const fn new(session: Arc<SpotifySession>) -> Self {
        Self {
            session,
            rejected: Mutex::new(None),
        }
    }

    fn rejected_stamp(&self) -> Option<Option<TokenFileStamp>> {
        self.rejected.lock().ok().and_then(|guard| *guard)
    }

    fn set_rejected_stamp(&self, stamp: Option<Option<TokenFileStamp>>) {
        if let Ok(mut guard) = self.rejected.lock() {
            *guard = stamp;
        }
    }

    async fn fresh_session(&self) -> crate::error::Result<&SpotifySession> {
        self.session.ensure_token_fresh().await?;
        Ok(&self.session)
    }
}

#[async_trait]
impl ListeningSource for SpotifySource {
    fn source(&self) -> MusicSource {
        MusicSource::Spotify
    }

    async fn has_session(&self) -> bool {
        if self.session.has_token().await {
            return true;
        }
        // Picks up a token written by `listenlog auth` while running.
        // A file that already failed is only re-read once it changes.
        let stamp = self.session.token_file_stamp();
        if self.rejected_stamp() == Some(stamp) {
            return false;
        }

        match self.session.load_cached_token().await {
            Ok(true) => {
                self.set_rejected_stamp(None);
                true
            }
            Ok(false) => {
                self.set_rejected_stamp(Some(stamp));
                false
            }
            Err(e) => {
                warn!("Could not load cached Spotify token: {}", e);
                self.set_rejected_stamp(Some(stamp));
                false
            }
        }
    }

    async fn current_playback(&self) -> listenlog_core::Result<Option<CurrentPlayback>> {
        let session = self.fresh_session().await?;
        let playback = session
            .client()
            .current_playback(None, Some(&[AdditionalType::Track]))
            .await
            .map_err(SpotifyError::from)?;

        Ok(playback.map(|ctx| current_playback(&ctx)))
    }

    async fn recently_played(&self, limit: u32) -> listenlog_core::Result<Vec<HistoryItem>> {
        let session = self.fresh_session().await?;
        let page = session
            .client()
            .current_user_recently_played(Some(limit.clamp(1, MAX_HISTORY_LIMIT)), None)
            .await
            .map_err(SpotifyError::from)?;

        let items: Vec<HistoryItem> = page.items.iter().filter_map(history_item).collect();
        debug!(
            "Spotify returned {} history items ({} usable)",
            page.items.len(),
            items.len()
        );
        Ok(items)
    }

    async fn artists(&self, ids: &[String]) -> listenlog_core::Result<Vec<Artist>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let session = self.fresh_session().await?;

        let ids = ids
            .iter()
            .take(MAX_ARTIST_BATCH)
            .map(|id| {
                ArtistId::from_id(id.as_str()).map_err(|e| SpotifyError::InvalidId {
                    id: id.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let artists = session
            .client()
            .artists(ids)
            .await
            .map_err(SpotifyError::from)?;
        Ok(artists.iter().map(artist).collect())
    }

    async fn album(&self, id: &str) -> listenlog_core::Result<Option<Album>> {
        let album_id = AlbumId::from_id(id).map_err(|e| SpotifyError::InvalidId {
            id: id.to_string(),
            reason: e.to_string(),
        })?;
        let session = self.fresh_session().await?;

        let full = session
            .client()
            .album(album_id, None)
            .await
            .map_err(SpotifyError::from)?;
        Ok(Some(album(&full)))
    }
}

// rspotify exposes `type` fields as `_type`
#[allow(clippy::used_underscore_binding)]
fn current_playback(ctx: &CurrentPlaybackContext) -> CurrentPlayback {
    let track = match &ctx.item {
        Some(PlayableItem::Track(track)) => source_track(track),
        // Episodes are not listens
        _ => None,
    };

    CurrentPlayback {
        is_playing: ctx.is_playing,
        progress_ms: ctx.progress.map(millis),
        track,
        context: PlaybackContext {
            device_name: Some(ctx.device.name.clone()),
            device_type: Some(type_label(&ctx.device._type)),
            shuffle_state: Some(ctx.shuffle_state),
            context_type: ctx.context.as_ref().map(|c| type_label(&c._type)),
            context_uri: ctx.context.as_ref().map(|c| c.uri.clone()),
        },
    }
}

fn history_item(item: &PlayHistory) -> Option<HistoryItem> {
    Some(HistoryItem {
        track: source_track(&item.track)?,
        played_at: item.played_at,
        context: history_context(item.context.as_ref()),
    })
}

#[allow(clippy::used_underscore_binding)]
fn history_context(context: Option<&Context>) -> PlaybackContext {
    PlaybackContext {
        context_type: context.map(|c| type_label(&c._type)),
        context_uri: context.map(|c| c.uri.clone()),
        ..PlaybackContext::default()
    }
}

/// Local files have no track ID and cannot be logged.
fn source_track(track: &FullTrack) -> Option<SourceTrack> {
    let id = track.id.as_ref()?.id().to_string();

    Some(SourceTrack {
        id,
        name: track.name.clone(),
        artists: track
            .artists
            .iter()
            .map(|a| ArtistRef {
                id: a.id.as_ref().map(|id| id.id().to_string()),
                name: a.name.clone(),
            })
            .collect(),
        album: AlbumRef {
            id: track.album.id.as_ref().map(|id| id.id().to_string()),
            name: track.album.name.clone(),
            art_url: first_image(&track.album.images),
        },
        duration_ms: millis(track.duration),
        url: track.external_urls.get("spotify").cloned(),
    })
}

fn artist(full: &FullArtist) -> Artist {
    Artist {
        artist_id: full.id.id().to_string(),
        name: full.name.clone(),
        genres: full.genres.clone(),
        popularity: Some(full.popularity),
        image: first_image(&full.images),
    }
}

fn album(full: &FullAlbum) -> Album {
    Album {
        album_id: full.id.id().to_string(),
        name: full.name.clone(),
        release_date: Some(full.release_date.clone()),
        label: None,
        genres: full.genres.clone(),
        popularity: Some(full.popularity),
        image: first_image(&full.images),
    }
}

/// Spotify lists images largest first.
fn first_image(images: &[Image]) -> Option<String> {
    images.first().map(|image| image.url.clone())
}

fn millis(duration: TimeDelta) -> u64 {
    u64::try_from(duration.num_milliseconds()).unwrap_or(0)
}

/// Lowercase name of an rspotify enum, e.g. `Type::Playlist` -> "playlist".
fn type_label(kind: &impl Debug) -> String {
    format!("{kind:?}").to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SpotifyProviderConfig;
    use rspotify::model::{DeviceType, Type};
    use std::fs;

    fn source_at(path: std::path::PathBuf) -> SpotifySource {
        let config = SpotifyProviderConfig {
            client_id: "id".into(),
            client_secret: "secret".into(),
            oauth_redirect_uri: "http://localhost:9999/cb".into(),
        };
        SpotifySource::new(Arc::new(SpotifySession::with_token_path(&config, path)))
    }

    fn token_json(expires_at: i64, refresh_token: &str) -> String {
        format!(
            r#"{{"access_token":"access","refresh_token":{refresh_token},"expires_at":{expires_at},"scopes":[]}}"#
        )
    }

    #[tokio::test]
    async fn test_rejected_token_file_not_reloaded_until_it_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        let expired = chrono::Utc::now().timestamp() - 3600;
        fs::write(&path, token_json(expired, "null")).unwrap();

        let source = source_at(path.clone());
        assert!(!source.has_session().await);
        let stamp = source.session.token_file_stamp();
        assert!(stamp.is_some());
        assert_eq!(source.rejected_stamp(), Some(stamp));
        assert!(!source.has_session().await);

        // A fresh sign-in rewrites the file
        let valid = chrono::Utc::now().timestamp() + 3600;
        fs::write(&path, token_json(valid, r#""refresh-token""#)).unwrap();
        assert!(source.has_session().await);
        assert_eq!(source.rejected_stamp(), None);
    }

    #[tokio::test]
    async fn test_missing_token_file_remembered() {
        let dir = tempfile::tempdir().unwrap();
        let source = source_at(dir.path().join("token.json"));
        assert!(!source.has_session().await);
        assert_eq!(source.rejected_stamp(), Some(None));
    }

    #[test]
    fn test_millis_clamps_negative() {
        assert_eq!(millis(TimeDelta::milliseconds(215_000)), 215_000);
        assert_eq!(millis(TimeDelta::milliseconds(-5)), 0);
    }

    #[test]
    fn test_type_labels_are_lowercase() {
        assert_eq!(type_label(&Type::Playlist), "playlist");
        assert_eq!(type_label(&DeviceType::Computer), "computer");
    }

    #[test]
    fn test_first_image_takes_largest() {
        let images = vec![
            Image {
                height: Some(640),
                url: "https://i.scdn.co/large".into(),
                width: Some(640),
            },
            Image {
                height: Some(64),
                url: "https://i.scdn.co/small".into(),
                width: Some(64),
            },
        ];
        assert_eq!(first_image(&images).as_deref(), Some("https://i.scdn.co/large"));
        assert_eq!(first_image(&[]), None);
    }

    #[test]
    fn test_history_without_context_is_blank() {
        assert_eq!(history_context(None), PlaybackContext::default());
    }
}
