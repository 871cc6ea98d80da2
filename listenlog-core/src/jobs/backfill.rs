//! Backfill reconciler.
//!
//! Replays the source's "recently played" window through the ingestion engine. Plays
//! the live poller already recorded are refreshed in place; plays it missed (downtime,
//! rate limiting, tracks shorter than the poll interval) are inserted with the source's
//! exact timestamp.

use super::{Job, JobStatus};
use crate::error::Result;
use crate::ingest::{BackfillSummary, IngestionEngine};
use crate::model::Play;
use crate::source::ListeningSource;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info};

pub const BACKFILL_JOB_ID: &str = "backfill";

pub struct BackfillJob {
    source: Arc<dyn ListeningSource>,
    ingest: Arc<IngestionEngine>,
    limit: u32,
}

impl BackfillJob {
    #[must_use]
    pub fn new(source: Arc<dyn ListeningSource>, ingest: Arc<IngestionEngine>, limit: u32) -> Self {
        Self {
            source,
            ingest,
            limit,
        }
    }

    async fn reconcile(&self) -> Result<BackfillSummary> {
        let items = self.source.recently_played(self.limit).await?;
        debug!("Fetched {} recently played items", items.len());

        let plays: Vec<Play> = items.iter().map(Play::from_history).collect();
        self.ingest.bulk_backfill(&plays).await
    }
}

#[async_trait]
impl Job for BackfillJob {
    fn id(&self) -> &'static str {
        BACKFILL_JOB_ID
    }

    fn name(&self) -> &'static str {
        "Backfill"
    }

    async fn run(&self) -> JobStatus {
        if !self.source.has_session().await {
            debug!("No {} session; skipping backfill", self.source.source());
            return JobStatus::skipped("not authenticated");
        }

        match self.reconcile().await {
            Ok(summary) => {
                info!(
                    "Backfill complete: {} inserted, {} already recorded",
                    summary.inserted, summary.updated
                );
                JobStatus::ok().with_backfill(summary.inserted, summary.updated)
            }
            Err(e) => {
                error!("Backfill failed: {}", e);
                JobStatus::error(e.to_string())
            }
        }
    }
}
