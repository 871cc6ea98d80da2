//! Wiring of store, cache, Spotify source and jobs.

use crate::cli::TriggerJob;
use listenlog_core::{
    run_guarded, ArtistSyncJob, BackfillJob, Clock, EphemeralCache, IngestionEngine, JobStatus,
    JsonCardRenderer, ListenStore, ListeningSource, ListenlogConfig, LivePollJob, MemoryCache,
    NowPlayingCache, PeriodicJob, PollEngine, Result, SchedulingPort, SystemClock,
    TokioScheduler, WatchdogJob,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct Service {
    config: ListenlogConfig,
    store: Arc<ListenStore>,
    ingest: Arc<IngestionEngine>,
    now_playing: Arc<NowPlayingCache>,
    source: Arc<dyn ListeningSource>,
}

impl Service {
    /// Open the listen database and build the shared components.
    pub async fn open(config: ListenlogConfig, source: Arc<dyn ListeningSource>) -> Result<Self> {
        let store = Arc::new(ListenStore::open(&config.storage.database_path()).await?);
        let ingest = Arc::new(IngestionEngine::new(Arc::clone(&store)));
        let cache: Arc<dyn EphemeralCache> = Arc::new(MemoryCache::new());
        let now_playing = Arc::new(NowPlayingCache::new(cache, Arc::new(JsonCardRenderer)));

        let service = Self {
            config,
            store,
            ingest,
            now_playing,
            source,
        };
        service.warm_last_track().await?;
        Ok(service)
    }

    /// Seed the last-track marker from the newest stored play, if that play
    /// could still be running.
    ///
    /// The cache is in-process, so without this a restart would count the
    /// track that is still playing a second time. An older play must not
    /// seed it, or a later re-listen of the same track would be missed.
    async fn warm_last_track(&self) -> Result<()> {
        let Some(latest) = self.store.recent_plays(1).await?.into_iter().next() else {
            return Ok(());
        };

        let window = Duration::from_millis(latest.play.duration_ms) + self.config.polling.unit();
        // A play stamped in the future counts as running
        let running = (SystemClock.now() - latest.play.played_at)
            .to_std()
            .map_or(true, |elapsed| elapsed <= window);

        if running {
            debug!("Last stored listen still playing: {}", latest.play.track_id);
            self.now_playing.set_last_track(&latest.play.track_id).await?;
        } else {
            debug!(
                "Last stored listen {} has ended; marker left empty",
                latest.play.track_id
            );
        }
        Ok(())
    }

    fn poll_engine(&self) -> Arc<PollEngine> {
        Arc::new(PollEngine::new(
            Arc::clone(&self.source),
            Arc::clone(&self.ingest),
            Arc::clone(&self.now_playing),
            Arc::new(SystemClock),
            &self.config.polling,
        ))
    }

    fn backfill_job(&self) -> BackfillJob {
        BackfillJob::new(
            Arc::clone(&self.source),
            Arc::clone(&self.ingest),
            self.config.backfill.limit,
        )
    }

    fn artist_sync_job(&self) -> ArtistSyncJob {
        ArtistSyncJob::new(
            Arc::clone(&self.source),
            Arc::clone(&self.store),
            self.config.enrichment.batch_size,
        )
    }

    /// Run one job now, outside the scheduler.
    pub async fn trigger(&self, job: TriggerJob) -> JobStatus {
        match job {
            TriggerJob::Poll => self.poll_engine().run_cycle().await.status,
            TriggerJob::Backfill => run_guarded(&self.backfill_job()).await,
            TriggerJob::SyncArtists => run_guarded(&self.artist_sync_job()).await,
        }
    }

    /// Arm every job and keep them running until `shutdown` is cancelled.
    pub async fn run_until(&self, shutdown: CancellationToken) -> Result<()> {
        let scheduler = Arc::new(TokioScheduler::new(shutdown.clone())?);
        let port: Arc<dyn SchedulingPort> = scheduler.clone();

        let live = LivePollJob::new(self.poll_engine(), Arc::clone(&port), &self.config.polling);
        live.start()?;

        let watchdog = PeriodicJob::new(
            Arc::new(WatchdogJob::new(Arc::clone(&port), live)),
            self.config.polling.watchdog_interval(),
            Arc::clone(&port),
        );
        watchdog.start()?;

        // Backfill once at startup to cover the time we were not running
        let backfill = PeriodicJob::new(
            Arc::new(self.backfill_job()),
            Duration::from_secs(self.config.backfill.interval_secs),
            Arc::clone(&port),
        );
        port.schedule_in(backfill, Duration::ZERO)?;

        let artist_sync = PeriodicJob::new(
            Arc::new(self.artist_sync_job()),
            Duration::from_secs(self.config.enrichment.interval_secs),
            Arc::clone(&port),
        );
        artist_sync.start()?;

        info!("listenlog running with {} jobs", scheduler.active_jobs());
        shutdown.cancelled().await;

        port.shutdown();
        self.store.checkpoint().await?;
        info!(
            "Listen log closed with {} plays",
            self.store.play_count().await?
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use listenlog_core::{
        Album, Artist, CurrentPlayback, HistoryItem, MusicSource, Play, PlaybackContext,
        StatusKind,
    };

    /// Source without a session; every job should skip.
    struct SignedOut;

    #[async_trait]
    impl ListeningSource for SignedOut {
        fn source(&self) -> MusicSource {
            MusicSource::Spotify
        }

        async fn has_session(&self) -> bool {
            false
        }

        async fn current_playback(&self) -> Result<Option<CurrentPlayback>> {
            Ok(None)
        }

        async fn recently_played(&self, _limit: u32) -> Result<Vec<HistoryItem>> {
            Ok(Vec::new())
        }

        async fn artists(&self, _ids: &[String]) -> Result<Vec<Artist>> {
            Ok(Vec::new())
        }

        async fn album(&self, _id: &str) -> Result<Option<Album>> {
            Ok(None)
        }
    }

    fn temp_config(dir: &tempfile::TempDir) -> ListenlogConfig {
        let mut config = ListenlogConfig::default();
        config.storage.database_path = Some(dir.path().join("listens.db"));
        config
    }

    async fn store_plays(config: &ListenlogConfig, plays: &[Play]) {
        let store = ListenStore::open(&config.storage.database_path()).await.unwrap();
        let ingest = IngestionEngine::new(Arc::new(store));
        for play in plays {
            ingest.record_live_listen(play).await.unwrap();
        }
    }

    fn play(track_id: &str) -> Play {
        Play {
            track_id: track_id.into(),
            name: "Song".into(),
            artists: vec!["Band".into()],
            artist_ids: vec![],
            album: "Album".into(),
            album_id: None,
            album_art: None,
            duration_ms: 200_000,
            played_at: SystemClock.now(),
            played_at_rounded: None,
            context: PlaybackContext::default(),
        }
    }

    #[tokio::test]
    async fn test_triggers_skip_without_session() {
        let dir = tempfile::tempdir().unwrap();
        let service = Service::open(temp_config(&dir), Arc::new(SignedOut))
            .await
            .unwrap();

        for job in [TriggerJob::Poll, TriggerJob::Backfill, TriggerJob::SyncArtists] {
            assert_eq!(service.trigger(job).await.status, StatusKind::Skipped);
        }
    }

    #[tokio::test]
    async fn test_marker_warmed_from_latest_play() {
        let dir = tempfile::tempdir().unwrap();
        let config = temp_config(&dir);
        store_plays(&config, &[play("t-latest")]).await;

        let service = Service::open(config, Arc::new(SignedOut)).await.unwrap();
        assert_eq!(
            service.now_playing.last_track().await.unwrap().as_deref(),
            Some("t-latest")
        );
    }

    #[tokio::test]
    async fn test_marker_not_warmed_from_finished_play() {
        let dir = tempfile::tempdir().unwrap();
        let config = temp_config(&dir);
        let mut old = play("t-old");
        old.played_at = SystemClock.now() - chrono::TimeDelta::days(2);
        store_plays(&config, &[old]).await;

        let service = Service::open(config, Arc::new(SignedOut)).await.unwrap();
        assert_eq!(service.now_playing.last_track().await.unwrap(), None);
    }
}
