//! Job model and execution.
//!
//! This module provides the core abstractions for recurring jobs:
//!
//! - **Job model**: `JobId`, `JobType`, `ScheduledJob`, `JobRun`, `JobHistory`
//! - **JobHandler trait**: the interface a job-type implementation registers
//! - **JobExecutor**: tagged-variant dispatch over registered handlers
//!
//! Adding a new job type means implementing `JobHandler` and registering
//! it on the executor; the scheduler and registry require no changes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::registry::JobRegistry;
use crate::websocket::{Broadcaster, PushMessage};

pub mod weather;

pub use weather::{WeatherJobDetails, WeatherJobHandler};

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a scheduled job.
///
/// Assigned by the persistent store on insert and stable for the
/// lifetime of the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Type
// ═══════════════════════════════════════════════════════════════════════════════

/// Integer-tagged job type variant.
///
/// The tag is what the store persists and what the admin API accepts;
/// unknown tags are rejected at validation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum JobType {
    /// Placeholder type with no work attached
    None,
    /// Fetch current weather for a location
    Weather,
}

impl JobType {
    /// Get the persisted integer tag.
    pub const fn tag(&self) -> i64 {
        match self {
            Self::None => 0,
            Self::Weather => 1,
        }
    }

    /// Resolve an integer tag to a known variant.
    pub const fn from_tag(tag: i64) -> Option<Self> {
        match tag {
            0 => Some(Self::None),
            1 => Some(Self::Weather),
            _ => None,
        }
    }
}

impl From<JobType> for i64 {
    fn from(job_type: JobType) -> Self {
        job_type.tag()
    }
}

impl TryFrom<i64> for JobType {
    type Error = crate::error::MeteoError;

    fn try_from(tag: i64) -> Result<Self> {
        Self::from_tag(tag).ok_or_else(|| crate::error::MeteoError::unknown_job_type(tag))
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Weather => write!(f, "weather"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Definitions
// ═══════════════════════════════════════════════════════════════════════════════

/// A persisted definition of recurring work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    /// Unique identifier
    pub id: JobId,
    /// Job type variant
    #[serde(rename = "type")]
    pub job_type: JobType,
    /// Cron expression
    pub schedule: String,
    /// Type-specific payload (for weather: `{"location": "..."}`)
    pub details: serde_json::Value,
    /// Whether the job is active (soft-deleted jobs are inactive)
    pub active: bool,
}

/// A job definition that has not yet been assigned an id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    /// Job type variant
    #[serde(rename = "type")]
    pub job_type: JobType,
    /// Cron expression
    pub schedule: String,
    /// Type-specific payload
    pub details: serde_json::Value,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Runs and History
// ═══════════════════════════════════════════════════════════════════════════════

/// One completed execution of a job, immutable once created.
///
/// The payload is flattened into the serialized run so a weather run
/// reads `{updated, location, current}` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    /// When the run completed
    pub updated: DateTime<Utc>,
    /// Type-specific result payload
    #[serde(flatten)]
    pub payload: serde_json::Value,
}

impl JobRun {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            updated: Utc::now(),
            payload,
        }
    }
}

/// Bounded, volatile sequence of a job's most recent runs.
///
/// FIFO eviction: appending at capacity drops the oldest entry.
#[derive(Debug, Clone)]
pub struct JobHistory {
    runs: VecDeque<JobRun>,
    capacity: usize,
}

impl JobHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            runs: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a run, evicting the oldest entry when at capacity.
    ///
    /// A zero-capacity history retains nothing.
    pub fn push(&mut self, run: JobRun) {
        if self.capacity == 0 {
            return;
        }
        if self.runs.len() >= self.capacity {
            self.runs.pop_front();
        }
        self.runs.push_back(run);
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Snapshot of the runs in completion order, oldest first.
    pub fn snapshot(&self) -> Vec<JobRun> {
        self.runs.iter().cloned().collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Handler Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// The interface every job-type implementation must provide.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The variant this handler executes.
    fn job_type(&self) -> JobType;

    /// The `type` tag stamped on push envelopes for this job type.
    fn update_kind(&self) -> &'static str;

    /// Perform the work for one firing of `job`.
    ///
    /// # Errors
    ///
    /// A returned error means the run is skipped: the executor logs it,
    /// leaves the history unchanged, and the schedule is unaffected.
    async fn run(&self, job: &ScheduledJob) -> Result<JobRun>;

    /// Build the push envelope for an updated history.
    fn envelope(&self, job_id: JobId, history: Vec<JobRun>) -> PushMessage {
        PushMessage::new(
            self.update_kind(),
            serde_json::json!({ "jobId": job_id, "runs": history }),
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Executor
// ═══════════════════════════════════════════════════════════════════════════════

/// Dispatches job firings to the handler registered for their type and
/// records the outcome.
///
/// Each job carries an in-flight flag: a firing that finds its job
/// already executing is skipped entirely (no queueing).
pub struct JobExecutor {
    registry: Arc<JobRegistry>,
    broadcaster: Arc<Broadcaster>,
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
    in_flight: DashMap<JobId, Arc<AtomicBool>>,
}

impl JobExecutor {
    /// Create an executor with no handlers registered.
    pub fn new(registry: Arc<JobRegistry>, broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            registry,
            broadcaster,
            handlers: HashMap::new(),
            in_flight: DashMap::new(),
        }
    }

    /// Register a handler for its job type, replacing any previous one.
    pub fn register_handler(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(handler.job_type(), handler);
    }

    /// Check whether a handler is registered for a job type.
    pub fn has_handler(&self, job_type: JobType) -> bool {
        self.handlers.contains_key(&job_type)
    }

    /// Execute one firing of `job`.
    ///
    /// Never propagates a run failure: provider errors are logged and
    /// the run is skipped, leaving the history and the schedule intact.
    pub async fn execute(&self, job: &ScheduledJob) {
        // A firing that lost the race with removal must not recreate
        // the job's in-flight entry.
        if !self.registry.contains(job.id).await {
            debug!(job_id = %job.id, "Job no longer registered; skipping firing");
            return;
        }

        let flag = self
            .in_flight
            .entry(job.id)
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone();

        if flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(job_id = %job.id, "Previous run still in flight; skipping firing");
            return;
        }

        self.run_once(job).await;

        flag.store(false, Ordering::Release);
    }

    async fn run_once(&self, job: &ScheduledJob) {
        let Some(handler) = self.handlers.get(&job.job_type) else {
            info!(job_id = %job.id, job_type = %job.job_type, "No handler registered for job type");
            return;
        };

        debug!(job_id = %job.id, job_type = %job.job_type, "Running job");

        let run = match handler.run(job).await {
            Ok(run) => run,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Job run failed; skipping");
                return;
            }
        };

        // A run completing after its job was removed is discarded.
        let Some(history) = self.registry.append_run(job.id, run).await else {
            debug!(job_id = %job.id, "Job no longer registered; discarding run result");
            return;
        };

        let message = handler.envelope(job.id, history);
        self.broadcaster.send(&message).await;

        debug!(job_id = %job.id, "Job run completed");
    }

    /// Drop the in-flight flag for a removed job.
    pub fn forget(&self, job_id: JobId) {
        self.in_flight.remove(&job_id);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_type_tags() {
        assert_eq!(JobType::None.tag(), 0);
        assert_eq!(JobType::Weather.tag(), 1);
        assert_eq!(JobType::from_tag(1), Some(JobType::Weather));
        assert_eq!(JobType::from_tag(7), None);
    }

    #[test]
    fn test_job_type_serde_as_tag() {
        let json = serde_json::to_string(&JobType::Weather).unwrap();
        assert_eq!(json, "1");

        let parsed: JobType = serde_json::from_str("0").unwrap();
        assert_eq!(parsed, JobType::None);

        assert!(serde_json::from_str::<JobType>("9").is_err());
    }

    #[test]
    fn test_history_bound_and_fifo_eviction() {
        let mut history = JobHistory::new(3);
        for i in 1..=4 {
            history.push(JobRun::new(serde_json::json!({ "run": i })));
        }

        assert_eq!(history.len(), 3);
        let runs = history.snapshot();
        assert_eq!(runs[0].payload["run"], 2);
        assert_eq!(runs[2].payload["run"], 4);
    }

    #[test]
    fn test_zero_capacity_history_retains_nothing() {
        let mut history = JobHistory::new(0);
        history.push(JobRun::new(serde_json::json!({ "run": 1 })));
        history.push(JobRun::new(serde_json::json!({ "run": 2 })));

        assert!(history.is_empty());
        assert!(history.snapshot().is_empty());
    }

    #[test]
    fn test_history_never_exceeds_capacity() {
        let mut history = JobHistory::new(10);
        for i in 0..25 {
            history.push(JobRun::new(serde_json::json!({ "run": i })));
        }
        assert_eq!(history.len(), 10);
        assert_eq!(history.snapshot()[0].payload["run"], 15);
    }

    #[test]
    fn test_job_run_wire_shape() {
        let run = JobRun::new(serde_json::json!({ "location": { "name": "Dublin" } }));
        let value = serde_json::to_value(&run).unwrap();

        // Payload fields are flattened alongside the timestamp.
        assert!(value.get("updated").is_some());
        assert_eq!(value["location"]["name"], "Dublin");
        assert!(value.get("payload").is_none());
    }

    #[tokio::test]
    async fn test_firing_for_removed_job_leaves_no_tracking_state() {
        let path = tempfile::tempdir().unwrap().into_path().join("executor.sqlite");
        let store = crate::db::JobStore::connect(&crate::config::DatabaseConfig {
            url: format!("sqlite://{}", path.display()),
            max_connections: 2,
        })
        .await
        .unwrap();
        let registry = crate::registry::JobRegistry::new(store, 10);
        let broadcaster = Arc::new(crate::websocket::Broadcaster::new());
        let executor = JobExecutor::new(registry.clone(), broadcaster);

        let job = registry
            .add(NewJob {
                job_type: JobType::None,
                schedule: "*/5 * * * *".to_string(),
                details: serde_json::json!({}),
            })
            .await
            .unwrap();

        // A normal firing tracks the job's in-flight flag.
        executor.execute(&job).await;
        assert!(executor.in_flight.contains_key(&job.id));

        registry.remove(job.id).await.unwrap();
        executor.forget(job.id);

        // A straggling firing after removal must not resurrect it.
        executor.execute(&job).await;
        assert!(!executor.in_flight.contains_key(&job.id));
    }

    #[test]
    fn test_scheduled_job_serializes_type_tag() {
        let job = ScheduledJob {
            id: JobId(3),
            job_type: JobType::Weather,
            schedule: "*/5 * * * *".to_string(),
            details: serde_json::json!({ "location": "dublin-dublin-ireland" }),
            active: true,
        };

        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["id"], 3);
        assert_eq!(value["type"], 1);
        assert_eq!(value["schedule"], "*/5 * * * *");
    }
}
