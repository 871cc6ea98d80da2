//! Scheduling port and its tokio implementation.
//!
//! Each job id owns a single slot. A slot is absent (idle), scheduled for a future
//! instant, or running. Scheduling a job whose slot is already scheduled replaces the
//! pending run; scheduling while it runs queues the next run without touching the
//! running one.

use crate::error::{CoreError, Result};
use crate::jobs::{run_guarded, Job, JobStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// State of a job's slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Scheduled { at: Instant },
    Running,
}

/// Where jobs are armed and observed.
pub trait SchedulingPort: Send + Sync {
    /// Run `job` once after `delay`, replacing any pending run of the same id.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheduler has shut down.
    fn schedule_in(&self, job: Arc<dyn Job>, delay: Duration) -> Result<()>;

    /// Drop the pending or running instance of a job. Returns whether a slot existed.
    fn cancel(&self, job_id: &str) -> bool;

    /// Current slot state. `None` means idle.
    fn slot(&self, job_id: &str) -> Option<SlotState>;

    /// When the job will next fire, if it is scheduled.
    fn next_run(&self, job_id: &str) -> Option<Instant> {
        match self.slot(job_id)? {
            SlotState::Scheduled { at } => Some(at),
            SlotState::Running => None,
        }
    }

    /// Stop every job and refuse new ones.
    fn shutdown(&self);
}

/// Re-arm a job, logging a failure as fatal. Returns whether the job was armed.
pub fn rearm(port: &dyn SchedulingPort, job: Arc<dyn Job>, delay: Duration) -> bool {
    let job_id = job.id();
    match port.schedule_in(job, delay) {
        Ok(()) => {
            debug!("Re-armed {} in {:?}", job_id, delay);
            true
        }
        Err(e) => {
            error!(
                "FATAL: could not re-arm {}: {}. Only the watchdog can revive it now",
                job_id, e
            );
            false
        }
    }
}

struct Slot {
    generation: u64,
    state: SlotState,
    task: AbortHandle,
}

struct Shared {
    slots: Mutex<HashMap<&'static str, Slot>>,
    next_generation: AtomicU64,
    shutdown: CancellationToken,
}

impl Shared {
    fn slots(&self) -> MutexGuard<'_, HashMap<&'static str, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Flip a scheduled slot to running, unless it was replaced meanwhile.
    fn begin_run(&self, job_id: &str, generation: u64) -> bool {
        match self.slots().get_mut(job_id) {
            Some(slot) if slot.generation == generation => {
                slot.state = SlotState::Running;
                true
            }
            _ => false,
        }
    }

    fn finish_run(&self, job_id: &str, generation: u64) {
        let mut slots = self.slots();
        if slots
            .get(job_id)
            .is_some_and(|slot| slot.generation == generation)
        {
            slots.remove(job_id);
        }
    }
}

/// Frees the slot when a run ends, including by panic or abort.
struct RunGuard {
    shared: Weak<Shared>,
    job_id: &'static str,
    generation: u64,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.finish_run(self.job_id, self.generation);
        }
    }
}

/// Scheduler backed by tokio tasks, one per armed job.
#[derive(Clone)]
pub struct TokioScheduler {
    shared: Arc<Shared>,
    runtime: Handle,
}

impl TokioScheduler {
    /// Create a scheduler on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error when called outside a tokio runtime.
    pub fn new(shutdown: CancellationToken) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| CoreError::Scheduler {
            job_id: "*".to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            shared: Arc::new(Shared {
                slots: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                shutdown,
            }),
            runtime,
        })
    }

    /// Number of jobs currently holding a slot.
    #[must_use]
    pub fn active_jobs(&self) -> usize {
        self.shared.slots().len()
    }
}

impl SchedulingPort for TokioScheduler {
    fn schedule_in(&self, job: Arc<dyn Job>, delay: Duration) -> Result<()> {
        let job_id = job.id();
        if self.shared.shutdown.is_cancelled() {
            return Err(CoreError::Scheduler {
                job_id: job_id.to_string(),
                reason: "scheduler is shut down".to_string(),
            });
        }

        let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
        let at = Instant::now() + delay;

        // Hold the lock across spawn so the task cannot start before its slot exists
        let mut slots = self.shared.slots();

        let shared = Arc::downgrade(&self.shared);
        let shutdown = self.shared.shutdown.clone();
        let task = self.runtime.spawn(async move {
            tokio::select! {
                () = shutdown.cancelled() => return,
                () = tokio::time::sleep_until(at) => {}
            }

            let Some(strong) = shared.upgrade() else {
                return;
            };
            if !strong.begin_run(job_id, generation) {
                return;
            }
            drop(strong);

            let _guard = RunGuard {
                shared,
                job_id,
                generation,
            };
            let status = run_guarded(job.as_ref()).await;
            debug!("Job {} finished: {:?}", job_id, status.status);
        });

        let previous = slots.insert(
            job_id,
            Slot {
                generation,
                state: SlotState::Scheduled { at },
                task: task.abort_handle(),
            },
        );
        drop(slots);

        if let Some(previous) = previous {
            // A running instance is left to finish; only a pending one is superseded
            if matches!(previous.state, SlotState::Scheduled { .. }) {
                previous.task.abort();
            }
        }

        debug!("Scheduled {} in {:?}", job_id, delay);
        Ok(())
    }

    fn cancel(&self, job_id: &str) -> bool {
        let removed = self.shared.slots().remove(job_id);
        match removed {
            Some(slot) => {
                slot.task.abort();
                true
            }
            None => false,
        }
    }

    fn slot(&self, job_id: &str) -> Option<SlotState> {
        self.shared.slots().get(job_id).map(|slot| slot.state)
    }

    fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let drained: Vec<_> = self.shared.slots().drain().collect();
        for (job_id, slot) in drained {
            debug!("Stopping {}", job_id);
            slot.task.abort();
        }
        info!("Scheduler stopped");
    }
}

/// Runs a job on a fixed interval by re-arming it after every run.
pub struct PeriodicJob {
    job: Arc<dyn Job>,
    interval: Duration,
    scheduler: Arc<dyn SchedulingPort>,
    this: Weak<PeriodicJob>,
}

impl PeriodicJob {
    #[must_use]
    pub fn new(
        job: Arc<dyn Job>,
        interval: Duration,
        scheduler: Arc<dyn SchedulingPort>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            job,
            interval,
            scheduler,
            this: this.clone(),
        })
    }

    /// Arm the first run after one full interval.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheduler has shut down.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        info!("Starting {} every {:?}", self.job.name(), self.interval);
        self.scheduler
            .schedule_in(Arc::clone(self) as Arc<dyn Job>, self.interval)
    }
}

#[async_trait]
impl Job for PeriodicJob {
    fn id(&self) -> &'static str {
        self.job.id()
    }

    fn name(&self) -> &'static str {
        self.job.name()
    }

    async fn run(&self) -> JobStatus {
        let status = run_guarded(self.job.as_ref()).await;
        if let Some(this) = self.this.upgrade() {
            rearm(self.scheduler.as_ref(), this, self.interval);
        }
        status
    }
}
