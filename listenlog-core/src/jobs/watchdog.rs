use super::{Job, JobStatus};
use crate::scheduler::SchedulingPort;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

pub const WATCHDOG_JOB_ID: &str = "watchdog";

/// Revives a supervised self-rescheduling job whose slot has gone empty.
///
/// A present slot (scheduled or running) is left alone, so revival never creates a
/// second instance.
pub struct WatchdogJob {
    scheduler: Arc<dyn SchedulingPort>,
    supervised: Arc<dyn Job>,
}

impl WatchdogJob {
    #[must_use]
    pub fn new(scheduler: Arc<dyn SchedulingPort>, supervised: Arc<dyn Job>) -> Self {
        Self {
            scheduler,
            supervised,
        }
    }
}

#[async_trait]
impl Job for WatchdogJob {
    fn id(&self) -> &'static str {
        WATCHDOG_JOB_ID
    }

    fn name(&self) -> &'static str {
        "Watchdog"
    }

    async fn run(&self) -> JobStatus {
        let job_id = self.supervised.id();
        if let Some(state) = self.scheduler.slot(job_id) {
            debug!("Watchdog: {} is {:?}", job_id, state);
            return JobStatus::ok();
        }

        warn!("Watchdog: {} has no pending run; re-arming", job_id);
        match self
            .scheduler
            .schedule_in(Arc::clone(&self.supervised), Duration::ZERO)
        {
            Ok(()) => JobStatus::ok().with_reason(format!("revived {job_id}")),
            Err(e) => {
                error!("Watchdog could not revive {}: {}", job_id, e);
                JobStatus::error(e.to_string())
            }
        }
    }
}
