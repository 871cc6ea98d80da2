//! Now-playing snapshot, display payload and last-track marker, all in the ephemeral cache.

use crate::cache::EphemeralCache;
use crate::error::Result;
use crate::model::NowPlayingSnapshot;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const LAST_TRACK_KEY: &str = "listenlog:last_track_id";
pub const NOW_PLAYING_KEY: &str = "listenlog:now_playing";
pub const NOW_PLAYING_CARD_KEY: &str = "listenlog:now_playing_card";

/// Seconds kept past the expected end of the track
const TTL_GRACE_SECS: u64 = 30;

/// Lower bound on any snapshot lifetime
const TTL_FLOOR_SECS: u64 = 60;

/// Snapshot lifetime: the remaining play time plus a grace period, never under a minute.
#[must_use]
pub fn snapshot_ttl(duration_ms: u64, progress_ms: u64) -> Duration {
    let remaining_secs = duration_ms.saturating_sub(progress_ms) / 1000;
    Duration::from_secs((remaining_secs + TTL_GRACE_SECS).max(TTL_FLOOR_SECS))
}

/// Fields handed to the display renderer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisplayCard {
    pub title: String,
    pub artist: String,
    pub album_art: Option<String>,
    pub is_playing: bool,
}

impl From<&NowPlayingSnapshot> for DisplayCard {
    fn from(snapshot: &NowPlayingSnapshot) -> Self {
        Self {
            title: snapshot.title.clone(),
            artist: snapshot.artist.clone(),
            album_art: snapshot.album_art.clone(),
            is_playing: snapshot.is_playing,
        }
    }
}

/// Produces the pre-rendered display payload. The output is cached verbatim.
pub trait SnapshotRenderer: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the card cannot be rendered.
    fn render(&self, card: &DisplayCard) -> Result<String>;
}

/// Renders the card as JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCardRenderer;

impl SnapshotRenderer for JsonCardRenderer {
    fn render(&self, card: &DisplayCard) -> Result<String> {
        Ok(serde_json::to_string(card)?)
    }
}

/// Keeps the now-playing keys consistent.
///
/// Snapshot and payload always share one TTL; "nothing playing" removes all three keys.
pub struct NowPlayingCache {
    cache: Arc<dyn EphemeralCache>,
    renderer: Arc<dyn SnapshotRenderer>,
}

impl NowPlayingCache {
    #[must_use]
    pub fn new(cache: Arc<dyn EphemeralCache>, renderer: Arc<dyn SnapshotRenderer>) -> Self {
        Self { cache, renderer }
    }

    /// Store a playing snapshot and its rendered payload.
    ///
    /// Returns the TTL applied to both keys.
    ///
    /// # Errors
    ///
    /// Returns an error if rendering or either cache write fails.
    pub async fn store(&self, snapshot: &NowPlayingSnapshot) -> Result<Duration> {
        let ttl = snapshot_ttl(snapshot.duration_ms, snapshot.progress_ms.unwrap_or(0));
        let payload = self.renderer.render(&DisplayCard::from(snapshot))?;
        let json = serde_json::to_string(snapshot)?;

        self.cache.set_with_ttl(NOW_PLAYING_KEY, json, ttl).await?;
        self.cache
            .set_with_ttl(NOW_PLAYING_CARD_KEY, payload, ttl)
            .await?;

        debug!("Cached now playing '{}' for {:?}", snapshot.title, ttl);
        Ok(ttl)
    }

    /// Drop the snapshot, payload and marker.
    ///
    /// # Errors
    ///
    /// Returns an error if a cache delete fails.
    pub async fn clear(&self) -> Result<()> {
        self.cache.delete(NOW_PLAYING_KEY).await?;
        self.cache.delete(NOW_PLAYING_CARD_KEY).await?;
        self.cache.delete(LAST_TRACK_KEY).await?;
        Ok(())
    }

    /// The last observed track id.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache read fails.
    pub async fn last_track(&self) -> Result<Option<String>> {
        self.cache.get(LAST_TRACK_KEY).await
    }

    /// Record the last observed track id. Has no TTL.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache write fails.
    pub async fn set_last_track(&self, track_id: &str) -> Result<()> {
        self.cache.set(LAST_TRACK_KEY, track_id.to_string()).await
    }

    /// The cached snapshot; `None` means nothing is playing.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or the cached value is malformed.
    pub async fn now_playing(&self) -> Result<Option<NowPlayingSnapshot>> {
        self.cache
            .get(NOW_PLAYING_KEY)
            .await?
            .map(|raw| serde_json::from_str(&raw).map_err(Into::into))
            .transpose()
    }

    /// The cached display payload, as rendered.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache read fails.
    pub async fn display_payload(&self) -> Result<Option<String>> {
        self.cache.get(NOW_PLAYING_CARD_KEY).await
    }
}
