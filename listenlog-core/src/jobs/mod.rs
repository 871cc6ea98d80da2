//! Jobs run on the scheduling port and their shared status contract.

mod artist_sync;
mod backfill;
mod live_poll;
mod watchdog;

pub use artist_sync::{ArtistSyncJob, ARTIST_SYNC_JOB_ID};
pub use backfill::{BackfillJob, BACKFILL_JOB_ID};
pub use live_poll::{next_delay, CycleReport, LivePollJob, PollEngine, POLL_JOB_ID};
pub use watchdog::{WatchdogJob, WATCHDOG_JOB_ID};

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use tracing::error;

/// Unit of scheduled work.
///
/// `run` never fails: every error is caught at the job boundary and reported in the status.
#[async_trait]
pub trait Job: Send + Sync {
    /// Stable identifier; the scheduler keeps one slot per id.
    fn id(&self) -> &'static str;

    /// Human-readable name for logs.
    fn name(&self) -> &'static str;

    async fn run(&self) -> JobStatus;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Ok,
    Skipped,
    Error,
}

/// Outcome of one job run, serialized as `{"status": "ok", ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub status: StatusKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playing: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_listen: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inserted: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl JobStatus {
    const fn with_kind(status: StatusKind) -> Self {
        Self {
            status,
            playing: None,
            new_listen: None,
            inserted: None,
            updated: None,
            synced: None,
            reason: None,
        }
    }

    #[must_use]
    pub const fn ok() -> Self {
        Self::with_kind(StatusKind::Ok)
    }

    #[must_use]
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::with_kind(StatusKind::Skipped).with_reason(reason)
    }

    #[must_use]
    pub fn error(reason: impl Into<String>) -> Self {
        Self::with_kind(StatusKind::Error).with_reason(reason)
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    #[must_use]
    pub fn with_playing(mut self, playing: bool) -> Self {
        self.playing = Some(playing);
        self
    }

    #[must_use]
    pub fn with_new_listen(mut self, new_listen: bool) -> Self {
        self.new_listen = Some(new_listen);
        self
    }

    #[must_use]
    pub fn with_backfill(mut self, inserted: usize, updated: usize) -> Self {
        self.inserted = Some(inserted);
        self.updated = Some(updated);
        self
    }

    #[must_use]
    pub fn with_synced(mut self, synced: usize) -> Self {
        self.synced = Some(synced);
        self
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == StatusKind::Ok
    }
}

/// Run a job, turning a panic into an error status.
pub async fn run_guarded(job: &dyn Job) -> JobStatus {
    match AssertUnwindSafe(job.run()).catch_unwind().await {
        Ok(status) => status,
        Err(_) => {
            error!("Job {} panicked", job.id());
            JobStatus::error("job panicked")
        }
    }
}
