use super::{Job, JobStatus};
use crate::config::PollingConfig;
use crate::deadline::{with_deadline, Deadline};
use crate::detector::{detect, Transition};
use crate::error::{CoreError, Result};
use crate::ingest::IngestionEngine;
use crate::model::{NowPlayingSnapshot, Play};
use crate::now_playing::NowPlayingCache;
use crate::scheduler::{rearm, SchedulingPort};
use crate::source::ListeningSource;
use crate::time::{Clock, DurationExt};
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const POLL_JOB_ID: &str = "live_poll";

/// Result of one poll cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub status: JobStatus,
    /// External calls made during the cycle
    pub requests_made: u32,
}

/// Delay before the next cycle: one unit, or two after a cycle that did enrichment work.
#[must_use]
pub fn next_delay(requests_made: u32, unit: Duration) -> Duration {
    if requests_made > 1 {
        unit * 2
    } else {
        unit
    }
}

/// One live poll: query playback, classify, persist, then refresh the cache.
pub struct PollEngine {
    source: Arc<dyn ListeningSource>,
    ingest: Arc<IngestionEngine>,
    now_playing: Arc<NowPlayingCache>,
    clock: Arc<dyn Clock>,
    playback_timeout: Duration,
}

impl PollEngine {
    #[must_use]
    pub fn new(
        source: Arc<dyn ListeningSource>,
        ingest: Arc<IngestionEngine>,
        now_playing: Arc<NowPlayingCache>,
        clock: Arc<dyn Clock>,
        polling: &PollingConfig,
    ) -> Self {
        Self {
            source,
            ingest,
            now_playing,
            clock,
            playback_timeout: polling.playback_timeout(),
        }
    }

    /// Run one cycle. Errors are folded into the report's status.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut requests_made = 0;
        let status = match self.poll(&mut requests_made).await {
            Ok(status) => status,
            Err(e) if e.is_soft() => {
                warn!("Live poll skipped: {}", e);
                if matches!(e, CoreError::NotAuthenticated) {
                    JobStatus::skipped(e.to_string())
                } else {
                    JobStatus::error(e.to_string())
                }
            }
            Err(e) => {
                error!("Live poll failed: {}", e);
                JobStatus::error(e.to_string())
            }
        };

        CycleReport {
            status,
            requests_made,
        }
    }

    async fn poll(&self, requests_made: &mut u32) -> Result<JobStatus> {
        if !self.source.has_session().await {
            debug!("No {} session; skipping live poll", self.source.source());
            return Ok(JobStatus::skipped("not authenticated"));
        }

        *requests_made += 1;
        let playback = match with_deadline(self.playback_timeout, self.source.current_playback())
            .await
        {
            Deadline::Completed(result) => result?,
            Deadline::TimedOut => {
                return Err(CoreError::UpstreamTimeout {
                    operation: "current_playback".to_string(),
                    timeout_ms: self.playback_timeout.as_millis_u64(),
                })
            }
        };

        let Some((track, playback)) = playback
            .as_ref()
            .and_then(|p| p.playing_track().map(|track| (track, p)))
        else {
            self.now_playing.clear().await?;
            debug!("Polled {}: playing=false", self.source.source());
            return Ok(JobStatus::ok().with_playing(false));
        };

        let play = Play::from_playback(track, playback, self.clock.now());
        let marker = self.now_playing.last_track().await?;
        let transition = detect(&track.id, marker.as_deref());

        match transition {
            Transition::NewListen => {
                let write = self.ingest.record_live_listen(&play).await?;
                if write.track_created {
                    *requests_made += self.enrich_new_track(&play).await;
                }
                info!(
                    "New listen: {} - {} ({})",
                    track.artist_line(),
                    track.name,
                    track.id
                );
            }
            Transition::SameTrack => {
                if self.ingest.refresh_live_listen(&play).await? {
                    debug!("Still playing {} into a new minute", track.id);
                }
            }
        }

        self.now_playing
            .store(&NowPlayingSnapshot::new(track, playback))
            .await?;
        self.now_playing.set_last_track(&track.id).await?;

        debug!(
            "Polled {}: playing=true, track={}, transition={:?}",
            self.source.source(),
            track.id,
            transition
        );
        Ok(JobStatus::ok()
            .with_playing(true)
            .with_new_listen(transition == Transition::NewListen))
    }

    /// Fetch artist and album metadata for a track seen for the first time.
    ///
    /// Returns the number of external calls made. Failures are logged and ignored.
    async fn enrich_new_track(&self, play: &Play) -> u32 {
        let store = self.ingest.store();
        let mut calls = 0;

        match store.unknown_artists(&play.artist_ids).await {
            Ok(missing) if !missing.is_empty() => {
                calls += 1;
                match self.source.artists(&missing).await {
                    Ok(artists) => {
                        if let Err(e) = store.insert_artists(&artists).await {
                            warn!("Failed to store artists for {}: {}", play.track_id, e);
                        }
                    }
                    Err(e) => warn!("Failed to fetch artists for {}: {}", play.track_id, e),
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to check artists for {}: {}", play.track_id, e),
        }

        if let Some(album_id) = &play.album_id {
            match store.has_album(album_id).await {
                Ok(false) => {
                    calls += 1;
                    match self.source.album(album_id).await {
                        Ok(Some(album)) => {
                            if let Err(e) = store.insert_album(&album).await {
                                warn!("Failed to store album {}: {}", album_id, e);
                            }
                        }
                        Ok(None) => debug!("Album {} not found upstream", album_id),
                        Err(e) => warn!("Failed to fetch album {}: {}", album_id, e),
                    }
                }
                Ok(true) => {}
                Err(e) => warn!("Failed to check album {}: {}", album_id, e),
            }
        }

        calls
    }
}

/// The self-rescheduling live poll job.
///
/// Every run ends by arming the next one, whatever the cycle's outcome.
pub struct LivePollJob {
    engine: Arc<PollEngine>,
    scheduler: Arc<dyn SchedulingPort>,
    unit: Duration,
    this: Weak<LivePollJob>,
}

impl LivePollJob {
    #[must_use]
    pub fn new(
        engine: Arc<PollEngine>,
        scheduler: Arc<dyn SchedulingPort>,
        polling: &PollingConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            engine,
            scheduler,
            unit: polling.unit(),
            this: this.clone(),
        })
    }

    /// Arm the first cycle immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheduler has shut down.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        info!("Starting live poll every {:?}", self.unit);
        self.scheduler
            .schedule_in(Arc::clone(self) as Arc<dyn Job>, Duration::ZERO)
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<PollEngine> {
        &self.engine
    }
}

#[async_trait]
impl Job for LivePollJob {
    fn id(&self) -> &'static str {
        POLL_JOB_ID
    }

    fn name(&self) -> &'static str {
        "Live poll"
    }

    async fn run(&self) -> JobStatus {
        let report = match AssertUnwindSafe(self.engine.run_cycle())
            .catch_unwind()
            .await
        {
            Ok(report) => report,
            Err(_) => {
                error!("Live poll cycle panicked");
                CycleReport {
                    status: JobStatus::error("cycle panicked"),
                    requests_made: 0,
                }
            }
        };

        let delay = next_delay(report.requests_made, self.unit);
        if let Some(this) = self.this.upgrade() {
            rearm(self.scheduler.as_ref(), this, delay);
        }
        report.status
    }
}
