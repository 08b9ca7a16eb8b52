//! Cron-driven job scheduling.
//!
//! The scheduler owns one trigger task per registered job. Scheduling
//! runs the job once immediately, then on every cron firing until the
//! job is unscheduled. Firings spawn independent execution tasks so a
//! slow run never delays the trigger.

use chrono::Utc;
use cron::Schedule;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{MeteoError, Result};
use crate::jobs::{JobExecutor, JobId, NewJob, ScheduledJob};
use crate::registry::JobRegistry;

/// Parse a cron expression, accepting both the 6/7-field form (with
/// seconds) and the classic 5-field form.
///
/// A 5-field expression is pinned to second zero of each matching
/// minute rather than rejected.
pub fn parse_cron(expression: &str) -> Result<Schedule> {
    let trimmed = expression.trim();
    let fields = trimmed.split_whitespace().count();

    let normalized = if fields == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    };

    Schedule::from_str(&normalized)
        .map_err(|e| MeteoError::invalid_cron(expression, e.to_string()))
}

/// State of a running trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleState {
    Scheduled,
    Cancelled,
}

/// Handle to a job's live trigger task.
///
/// Moves one way, from `Scheduled` to `Cancelled`; cancelling twice is
/// a no-op.
pub struct RunningJobHandle {
    job_id: JobId,
    state: HandleState,
    cancellation: CancellationToken,
    #[allow(dead_code)]
    join: JoinHandle<()>,
}

impl RunningJobHandle {
    fn new(job_id: JobId, cancellation: CancellationToken, join: JoinHandle<()>) -> Self {
        Self {
            job_id,
            state: HandleState::Scheduled,
            cancellation,
            join,
        }
    }

    /// Cancel the trigger. The loop stops before its next firing;
    /// an execution already in flight is left to finish (its result is
    /// discarded downstream if the job was removed).
    pub fn cancel(&mut self) {
        if self.state == HandleState::Scheduled {
            self.cancellation.cancel();
            self.state = HandleState::Cancelled;
            debug!(job_id = %self.job_id, "Job trigger cancelled");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == HandleState::Cancelled
    }
}

/// Owns the trigger tasks for all scheduled jobs.
pub struct Scheduler {
    registry: Arc<JobRegistry>,
    executor: Arc<JobExecutor>,
    handles: Mutex<HashMap<JobId, RunningJobHandle>>,
}

impl Scheduler {
    pub fn new(registry: Arc<JobRegistry>, executor: Arc<JobExecutor>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            executor,
            handles: Mutex::new(HashMap::new()),
        })
    }

    /// Load every persisted job and schedule it.
    ///
    /// # Errors
    ///
    /// A store failure is fatal; a persisted job with an invalid
    /// definition is logged and skipped so one bad row cannot take the
    /// service down.
    pub async fn start(&self) -> Result<()> {
        let jobs = self.registry.load_all().await?;
        info!(count = jobs.len(), "Scheduling persisted jobs");

        for job in jobs {
            if let Err(e) = self.schedule(&job) {
                warn!(job_id = %job.id, error = %e, "Skipping job with invalid definition");
            }
        }

        Ok(())
    }

    /// Create a trigger for a job: run it once now, then on its cron
    /// schedule.
    ///
    /// # Errors
    ///
    /// Rejects malformed cron expressions and jobs that already have a
    /// live trigger; no trigger is created in either case.
    pub fn schedule(&self, job: &ScheduledJob) -> Result<()> {
        let schedule = parse_cron(&job.schedule)?;

        let mut handles = self.handles.lock();
        if handles
            .get(&job.id)
            .map_or(false, |h| !h.is_cancelled())
        {
            return Err(MeteoError::already_scheduled(job.id));
        }

        let token = CancellationToken::new();
        let join = tokio::spawn(run_loop(
            self.executor.clone(),
            job.clone(),
            schedule,
            token.clone(),
        ));

        handles.insert(job.id, RunningJobHandle::new(job.id, token, join));
        info!(job_id = %job.id, schedule = %job.schedule, "Job scheduled");
        Ok(())
    }

    /// Cancel a job's trigger. No-op when no trigger exists.
    pub fn unschedule(&self, id: JobId) {
        if let Some(mut handle) = self.handles.lock().remove(&id) {
            handle.cancel();
        }
    }

    /// Whether a job currently has a live trigger.
    pub fn is_scheduled(&self, id: JobId) -> bool {
        self.handles
            .lock()
            .get(&id)
            .map_or(false, |h| !h.is_cancelled())
    }

    /// Validate, persist, and schedule a new job.
    ///
    /// Validation happens before any mutation: a malformed definition
    /// is rejected without touching the store or the cache.
    pub async fn add_job(&self, new: NewJob) -> Result<ScheduledJob> {
        parse_cron(&new.schedule)?;

        let job = self.registry.add(new).await?;
        self.schedule(&job)?;
        Ok(job)
    }

    /// Remove a job everywhere: store, cache, trigger, history, and
    /// the executor's in-flight bookkeeping.
    ///
    /// The store commits first; if it fails the trigger keeps running
    /// and the cache keeps the job, so no half-removed state exists.
    pub async fn remove_job(&self, id: JobId) -> Result<()> {
        self.registry.remove(id).await?;
        self.unschedule(id);
        self.executor.forget(id);
        info!(job_id = %id, "Job removed");
        Ok(())
    }

    /// Cancel every trigger. Used during shutdown.
    pub fn shutdown(&self) {
        let mut handles = self.handles.lock();
        for handle in handles.values_mut() {
            handle.cancel();
        }
        info!(count = handles.len(), "All job triggers cancelled");
    }
}

/// Trigger loop for one job: immediate run, then cron firings until
/// cancellation (or schedule exhaustion).
async fn run_loop(
    executor: Arc<JobExecutor>,
    job: ScheduledJob,
    schedule: Schedule,
    token: CancellationToken,
) {
    spawn_execution(&executor, &job);

    loop {
        let now = Utc::now();
        let Some(next) = schedule.after(&now).next() else {
            debug!(job_id = %job.id, "Cron schedule exhausted");
            break;
        };
        let delay = (next - now).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => spawn_execution(&executor, &job),
        }
    }
}

/// Spawn one execution as its own task so the trigger loop keeps time.
fn spawn_execution(executor: &Arc<JobExecutor>, job: &ScheduledJob) {
    let executor = executor.clone();
    let job = job.clone();
    tokio::spawn(async move {
        executor.execute(&job).await;
    });
}
