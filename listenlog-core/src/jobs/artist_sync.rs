//! Enrichment sync: fills in artists referenced by plays but never fetched.

use super::{Job, JobStatus};
use crate::error::Result;
use crate::source::ListeningSource;
use crate::store::ListenStore;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info};

pub const ARTIST_SYNC_JOB_ID: &str = "sync_artists";

pub struct ArtistSyncJob {
    source: Arc<dyn ListeningSource>,
    store: Arc<ListenStore>,
    batch_size: u32,
}

impl ArtistSyncJob {
    #[must_use]
    pub fn new(source: Arc<dyn ListeningSource>, store: Arc<ListenStore>, batch_size: u32) -> Self {
        Self {
            source,
            store,
            batch_size,
        }
    }

    async fn sync(&self) -> Result<usize> {
        let missing = self.store.missing_artist_ids(self.batch_size).await?;
        if missing.is_empty() {
            debug!("No artists missing metadata");
            return Ok(0);
        }

        info!("Fetching metadata for {} artists", missing.len());
        let artists = self.source.artists(&missing).await?;
        self.store.insert_artists(&artists).await
    }
}

#[async_trait]
impl Job for ArtistSyncJob {
    fn id(&self) -> &'static str {
        ARTIST_SYNC_JOB_ID
    }

    fn name(&self) -> &'static str {
        "Artist sync"
    }

    async fn run(&self) -> JobStatus {
        if !self.source.has_session().await {
            debug!("No {} session; skipping artist sync", self.source.source());
            return JobStatus::skipped("not authenticated");
        }

        match self.sync().await {
            Ok(synced) => {
                info!("Artist sync complete: {} artists stored", synced);
                JobStatus::ok().with_synced(synced)
            }
            Err(e) => {
                error!("Artist sync failed: {}", e);
                JobStatus::error(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CountPolicy;
    use crate::testing::{play_at, FakeSource};

    async fn setup(source: FakeSource) -> (Arc<FakeSource>, Arc<ListenStore>, ArtistSyncJob) {
        let source = Arc::new(source);
        let store = Arc::new(ListenStore::open_in_memory().await.unwrap());
        let job = ArtistSyncJob::new(source.clone(), store.clone(), 50);
        (source, store, job)
    }

    #[tokio::test]
    async fn test_sync_fills_missing_artists_once() {
        let (source, store, job) = setup(FakeSource::new()).await;
        for id in ["t1", "t2"] {
            store
                .upsert_listen(&play_at(id, 12, 0, 0), CountPolicy::Always)
                .await
                .unwrap();
        }

        let status = job.run().await;
        assert_eq!(status.synced, Some(2));
        assert!(store.missing_artist_ids(50).await.unwrap().is_empty());

        let status = job.run().await;
        assert_eq!(status.synced, Some(0));
        assert_eq!(FakeSource::calls(&source.artist_calls), 1);
    }

    #[tokio::test]
    async fn test_sync_never_touches_plays() {
        let (_, store, job) = setup(FakeSource::new()).await;
        store
            .upsert_listen(&play_at("t1", 12, 0, 0), CountPolicy::Always)
            .await
            .unwrap();

        job.run().await;
        assert_eq!(store.play_count().await.unwrap(), 1);
        assert_eq!(store.track("t1").await.unwrap().unwrap().listen_count, 1);
    }

    #[tokio::test]
    async fn test_sync_skipped_without_session() {
        let (_, _, job) = setup(FakeSource::signed_out()).await;
        assert_eq!(
            job.run().await,
            JobStatus::skipped("not authenticated")
        );
    }
}
