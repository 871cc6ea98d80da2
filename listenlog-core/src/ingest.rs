use crate::error::{CoreError, Result};
use crate::model::Play;
use crate::store::{CountPolicy, ListenStore, ListenWrite};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error};

/// Counts from one backfill batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackfillSummary {
    /// Plays that were not stored before
    pub inserted: usize,
    /// Plays already stored, refreshed in place
    pub updated: usize,
}

/// Idempotent writes of listens into the durable store.
///
/// Every write is keyed by (track id, minute bucket), so replays converge on the same rows.
pub struct IngestionEngine {
    store: Arc<ListenStore>,
}

impl IngestionEngine {
    #[must_use]
    pub fn new(store: Arc<ListenStore>) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<ListenStore> {
        &self.store
    }

    /// Record a listen at a track transition.
    ///
    /// The track's listen count is incremented once per call, so callers must only
    /// invoke this on a new-listen transition.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub async fn record_live_listen(&self, play: &Play) -> Result<ListenWrite> {
        let write = self
            .store
            .upsert_listen(play, CountPolicy::Always)
            .await
            .map_err(|e| report_conflict(e, &play.track_id))?;

        debug!(
            "Recorded live listen {} (play_inserted={}, track_created={})",
            play.track_id, write.play_inserted, write.track_created
        );
        Ok(write)
    }

    /// Refresh the play for a track that is still playing.
    ///
    /// Returns whether a new play row was created (a new minute bucket).
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub async fn refresh_live_listen(&self, play: &Play) -> Result<bool> {
        let write = self
            .store
            .upsert_listen(play, CountPolicy::PlayOnly)
            .await
            .map_err(|e| report_conflict(e, &play.track_id))?;
        Ok(write.play_inserted)
    }

    /// Reconcile one history entry. Returns whether the play was newly inserted.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub async fn backfill_listen(&self, play: &Play) -> Result<bool> {
        let write = self
            .store
            .upsert_listen(play, CountPolicy::IfNewPlay)
            .await
            .map_err(|e| report_conflict(e, &play.track_id))?;
        Ok(write.play_inserted)
    }

    /// Reconcile a batch of history entries in one transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails; nothing from the batch is kept.
    pub async fn bulk_backfill(&self, plays: &[Play]) -> Result<BackfillSummary> {
        if plays.is_empty() {
            return Ok(BackfillSummary::default());
        }

        let writes = self
            .store
            .upsert_listens(plays, CountPolicy::IfNewPlay)
            .await
            .map_err(|e| report_conflict(e, "backfill batch"))?;

        let inserted = writes.iter().filter(|w| w.play_inserted).count();
        Ok(BackfillSummary {
            inserted,
            updated: writes.len() - inserted,
        })
    }
}

fn report_conflict(err: CoreError, subject: &str) -> CoreError {
    if let CoreError::StorageConflict { table } = &err {
        error!("Upsert of {} hit a unique conflict on {}; this is a bug", subject, table);
    }
    err
}
