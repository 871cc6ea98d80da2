pub mod cache;
pub mod config;
pub mod deadline;
pub mod detector;
pub mod error;
pub mod ingest;
pub mod jobs;
pub mod model;
pub mod now_playing;
pub mod paths;
pub mod scheduler;
pub mod source;
pub mod store;
pub mod time;

#[cfg(test)]
mod testing;

pub use cache::{EphemeralCache, MemoryCache};
pub use config::{
    build_config_template, BackfillConfig, EnrichmentConfig, ListenlogConfig, LoggingConfig,
    PollingConfig, ProvidersConfig, StorageConfig,
};

pub use deadline::{with_deadline, Deadline};
pub use detector::{detect, Transition};
pub use error::{CoreError, Result};
pub use ingest::{BackfillSummary, IngestionEngine};
pub use jobs::{
    run_guarded, ArtistSyncJob, BackfillJob, CycleReport, Job, JobStatus, LivePollJob, PollEngine,
    StatusKind, WatchdogJob, ARTIST_SYNC_JOB_ID, BACKFILL_JOB_ID, POLL_JOB_ID, WATCHDOG_JOB_ID,
};
pub use model::{Album, Artist, NowPlayingSnapshot, Play, PlaybackContext, StoredPlay, TrackStats};
pub use now_playing::{DisplayCard, JsonCardRenderer, NowPlayingCache, SnapshotRenderer};
pub use paths::{
    config_dir, config_path, listens_db_path, log_file_path, CONFIG_DIR_NAME, CONFIG_FILE_NAME,
    LISTENS_DB_FILE_NAME, LOG_FILE_NAME,
};
pub use scheduler::{PeriodicJob, SchedulingPort, SlotState, TokioScheduler};
pub use source::{
    AlbumRef, ArtistRef, CurrentPlayback, HistoryItem, ListeningSource, MusicSource, SourceTrack,
};
pub use store::{CountPolicy, ListenStore, ListenWrite};
pub use time::{Clock, DurationExt, SystemClock};
