//! In-memory job registry.
//!
//! Cache-first view over the persistent store, plus the volatile
//! per-job run histories. Mutations are fail-closed: the store commits
//! first, and the cache only changes after the store succeeds, so the
//! cache can lag the store but never diverge from it.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::db::JobStore;
use crate::error::Result;
use crate::jobs::{JobHistory, JobId, JobRun, NewJob, ScheduledJob};

/// A job definition joined with its recent runs, as served by the
/// admin listing.
#[derive(Debug, Clone, Serialize)]
pub struct JobDetails {
    #[serde(flatten)]
    pub job: ScheduledJob,
    pub runs: Vec<JobRun>,
}

/// Registry of known jobs and their run histories.
pub struct JobRegistry {
    store: JobStore,
    /// Cached active jobs; `None` until the first load.
    jobs: RwLock<Option<Vec<ScheduledJob>>>,
    histories: DashMap<JobId, JobHistory>,
    max_history: usize,
    /// Serializes mutations so cache and store move in lockstep.
    write_lock: Mutex<()>,
}

impl JobRegistry {
    pub fn new(store: JobStore, max_history: usize) -> Arc<Self> {
        Arc::new(Self {
            store,
            jobs: RwLock::new(None),
            histories: DashMap::new(),
            max_history,
            write_lock: Mutex::new(()),
        })
    }

    /// All active jobs, from cache when populated, otherwise from the
    /// store (populating the cache as a side effect).
    pub async fn load_all(&self) -> Result<Vec<ScheduledJob>> {
        if let Some(jobs) = self.jobs.read().await.as_ref() {
            return Ok(jobs.clone());
        }

        let mut cache = self.jobs.write().await;
        // Another caller may have populated the cache while we waited.
        if let Some(jobs) = cache.as_ref() {
            return Ok(jobs.clone());
        }

        let jobs = self.store.load_active_jobs().await?;
        info!(count = jobs.len(), "Loaded active jobs from store");
        *cache = Some(jobs.clone());
        Ok(jobs)
    }

    /// Whether a job is currently registered.
    pub async fn contains(&self, id: JobId) -> bool {
        match self.jobs.read().await.as_ref() {
            Some(jobs) => jobs.iter().any(|j| j.id == id),
            None => false,
        }
    }

    /// Persist a new job and add it to the cache.
    ///
    /// The insert happens against the store first; on failure the cache
    /// is untouched and no job id is consumed from the caller's view.
    pub async fn add(&self, new: NewJob) -> Result<ScheduledJob> {
        let _guard = self.write_lock.lock().await;
        self.load_all().await?;

        let id = self.store.insert_job(&new).await?;
        let job = ScheduledJob {
            id,
            job_type: new.job_type,
            schedule: new.schedule,
            details: new.details,
            active: true,
        };

        if let Some(jobs) = self.jobs.write().await.as_mut() {
            jobs.push(job.clone());
        }

        debug!(job_id = %job.id, "Job added to registry");
        Ok(job)
    }

    /// Deactivate a job in the store, then drop it from the cache along
    /// with its history.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for unknown ids; a store failure
    /// leaves the cache (and the job) untouched.
    pub async fn remove(&self, id: JobId) -> Result<ScheduledJob> {
        let _guard = self.write_lock.lock().await;
        self.load_all().await?;

        let mut cache = self.jobs.write().await;
        let jobs = cache
            .as_mut()
            .ok_or_else(|| crate::error::MeteoError::job_not_found(id))?;

        let position = jobs
            .iter()
            .position(|j| j.id == id)
            .ok_or_else(|| crate::error::MeteoError::job_not_found(id))?;

        self.store.deactivate_job(id).await?;

        let job = jobs.remove(position);
        drop(cache);
        self.histories.remove(&id);

        debug!(job_id = %id, "Job removed from registry");
        Ok(job)
    }

    /// Append a run to a job's history and return the updated snapshot.
    ///
    /// Returns `None` when the job is no longer registered: a run that
    /// completes after its job was removed is discarded rather than
    /// resurrecting the history.
    pub async fn append_run(&self, id: JobId, run: JobRun) -> Option<Vec<JobRun>> {
        // Serialized against remove() so a removed job's history cannot
        // reappear between the membership check and the append.
        let _guard = self.write_lock.lock().await;
        if !self.contains(id).await {
            return None;
        }

        let mut history = self
            .histories
            .entry(id)
            .or_insert_with(|| JobHistory::new(self.max_history));
        history.push(run);
        Some(history.snapshot())
    }

    /// Snapshot of a job's run history, oldest first. Unknown jobs and
    /// jobs that have not run yet yield an empty list.
    pub fn history(&self, id: JobId) -> Vec<JobRun> {
        self.histories
            .get(&id)
            .map(|h| h.snapshot())
            .unwrap_or_default()
    }

    /// All active jobs joined with their run histories.
    pub async fn job_details(&self) -> Result<Vec<JobDetails>> {
        let jobs = self.load_all().await?;
        Ok(jobs
            .into_iter()
            .map(|job| {
                let runs = self.history(job.id);
                JobDetails { job, runs }
            })
            .collect())
    }

    /// Configured per-job history bound.
    pub fn max_history(&self) -> usize {
        self.max_history
    }
}
