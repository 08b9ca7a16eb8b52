//! Weather job handler.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{MeteoError, Result};
use crate::provider::WeatherProvider;
use crate::websocket::PushMessage;

use super::{JobHandler, JobId, JobRun, JobType, ScheduledJob};

/// Envelope type tag for weather history pushes.
pub const WEATHER_JOB_UPDATE: &str = "WEATHER_JOB_UPDATE";

/// Details payload of a weather job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherJobDetails {
    /// Location query understood by the provider (e.g. a slug from the
    /// location search endpoint)
    pub location: String,
}

/// Fetches current weather for the job's configured location.
pub struct WeatherJobHandler {
    provider: Arc<WeatherProvider>,
}

impl WeatherJobHandler {
    pub fn new(provider: Arc<WeatherProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl JobHandler for WeatherJobHandler {
    fn job_type(&self) -> JobType {
        JobType::Weather
    }

    fn update_kind(&self) -> &'static str {
        WEATHER_JOB_UPDATE
    }

    async fn run(&self, job: &ScheduledJob) -> Result<JobRun> {
        let details: WeatherJobDetails = serde_json::from_value(job.details.clone())
            .map_err(|e| MeteoError::validation(format!("Invalid weather job details: {}", e)))?;

        let lookup = self.provider.fetch_current(&details.location).await?;

        Ok(JobRun::new(serde_json::json!({
            "location": {
                "name": lookup.location.name,
                "region": lookup.location.region,
                "country": lookup.location.country,
            },
            "current": lookup.current,
        })))
    }

    fn envelope(&self, job_id: JobId, history: Vec<JobRun>) -> PushMessage {
        PushMessage::new(
            WEATHER_JOB_UPDATE,
            serde_json::json!({ "jobId": job_id, "weathers": history }),
        )
    }
}
