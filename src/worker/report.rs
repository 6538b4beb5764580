use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use super::delivery::Settlement;
use crate::error::ErrorClass;

/// How a single delivery ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed { predictions: usize },
    Failed { class: ErrorClass, error: String },
    /// Shutdown interrupted the job; the delivery was left unsettled.
    Interrupted,
}

/// Structured record produced for every delivery the dispatcher handles.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    /// `None` when the payload could not be decoded.
    pub job_id: Option<String>,
    pub image_url: Option<String>,
    #[serde(flatten)]
    pub outcome: JobOutcome,
    /// `None` only for [`JobOutcome::Interrupted`].
    pub settlement: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl JobReport {
    pub fn new(
        job_id: Option<&str>,
        image_url: Option<&str>,
        outcome: JobOutcome,
        settlement: Option<Settlement>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.map(str::to_owned),
            image_url: image_url.map(str::to_owned),
            outcome,
            settlement: settlement.map(|s| s.to_string()),
            started_at,
            completed_at: now,
            duration_ms: (now - started_at).num_milliseconds(),
        }
    }

    /// Emits the single terminal log line for this job.
    pub fn log(&self) {
        let job_id = self.job_id.as_deref().unwrap_or("-");
        let settlement = self.settlement.as_deref().unwrap_or("none");
        match &self.outcome {
            JobOutcome::Completed { predictions } => info!(
                job_id,
                predictions,
                settlement,
                duration_ms = self.duration_ms,
                "job completed"
            ),
            JobOutcome::Failed {
                class: ErrorClass::Decode,
                error,
            } => warn!(job_id, error = %error, settlement, "discarding undecodable message"),
            JobOutcome::Failed { class, error } => error!(
                job_id,
                class = %class,
                error = %error,
                settlement,
                duration_ms = self.duration_ms,
                "job failed"
            ),
            JobOutcome::Interrupted => warn!(
                job_id,
                "job interrupted by shutdown, delivery left unacknowledged"
            ),
        }
    }
}
