//! Background jobs: drawing set rendering and per-sheet extraction.
//!
//! Jobs live in the `jobs` table (see [`crate::repository::JobRepository`]).
//! Each kind carries its own retry policy.

mod worker;

pub use worker::{spawn_progress_logger, JobOutcome, WorkSummary, Worker};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::Job;
use crate::repository::{is_busy, DbContext, DieselError, JobSpec};

pub const PROCESS_DRAWING_SET: &str = "process_drawing_set";
pub const EXTRACT_SHEET_METADATA: &str = "extract_sheet_metadata";

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Database error: {0}")]
    Database(#[from] DieselError),
    #[error("Unknown job kind: {0}")]
    UnknownKind(String),
    #[error("Invalid payload for {kind}: {message}")]
    InvalidPayload { kind: String, message: String },
}

impl JobError {
    /// Lock contention that clears once another worker commits.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Database(e) if is_busy(e))
    }
}

/// Body of a queued job. The variant name is stored as the job kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum JobPayload {
    ProcessDrawingSet {
        drawing_set_id: i32,
    },
    ExtractSheetMetadata {
        sheet_id: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        preferred_template_id: Option<i32>,
    },
}

impl JobPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ProcessDrawingSet { .. } => PROCESS_DRAWING_SET,
            Self::ExtractSheetMetadata { .. } => EXTRACT_SHEET_METADATA,
        }
    }

    /// Queue parameters: tries, backoff, and timeout per kind.
    pub fn spec(&self) -> JobSpec {
        let payload = serde_json::to_value(self)
            .ok()
            .and_then(|mut v| v.get_mut("payload").map(serde_json::Value::take))
            .unwrap_or(serde_json::Value::Null);

        let (max_tries, backoff_secs, timeout_secs) = match self {
            Self::ProcessDrawingSet { .. } => (3, 60, 600),
            Self::ExtractSheetMetadata { .. } => (3, 60, 300),
        };

        JobSpec {
            kind: self.kind().to_string(),
            payload,
            max_tries,
            backoff_secs,
            timeout_secs,
        }
    }

    /// Decode a stored job.
    pub fn from_job(job: &Job) -> Result<Self, JobError> {
        if job.kind != PROCESS_DRAWING_SET && job.kind != EXTRACT_SHEET_METADATA {
            return Err(JobError::UnknownKind(job.kind.clone()));
        }
        let tagged = serde_json::json!({ "kind": job.kind, "payload": job.payload });
        serde_json::from_value(tagged).map_err(|e| JobError::InvalidPayload {
            kind: job.kind.clone(),
            message: e.to_string(),
        })
    }
}

/// Queue a job. Returns the job id.
pub async fn dispatch(db: &DbContext, payload: JobPayload) -> Result<String, DieselError> {
    let id = db.jobs().enqueue(&payload.spec()).await?;
    tracing::debug!(job_id = %id, kind = payload.kind(), "Dispatched job");
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::setup_test_db;

    #[test]
    fn test_spec_per_kind() {
        let spec = JobPayload::ProcessDrawingSet { drawing_set_id: 5 }.spec();
        assert_eq!(spec.kind, "process_drawing_set");
        assert_eq!(spec.payload, serde_json::json!({ "drawing_set_id": 5 }));
        assert_eq!((spec.max_tries, spec.backoff_secs, spec.timeout_secs), (3, 60, 600));

        let spec = JobPayload::ExtractSheetMetadata {
            sheet_id: 9,
            preferred_template_id: None,
        }
        .spec();
        assert_eq!(spec.kind, "extract_sheet_metadata");
        assert_eq!(spec.payload, serde_json::json!({ "sheet_id": 9 }));
        assert_eq!(spec.timeout_secs, 300);
    }

    #[tokio::test]
    async fn test_dispatch_and_decode() {
        let (pool, _dir) = setup_test_db().await;
        let db = DbContext::from_url(pool.database_url());

        let payload = JobPayload::ExtractSheetMetadata {
            sheet_id: 3,
            preferred_template_id: Some(8),
        };
        let id = dispatch(&db, payload.clone()).await.unwrap();

        let job = db.jobs().get(&id).await.unwrap().unwrap();
        assert_eq!(job.kind, EXTRACT_SHEET_METADATA);
        assert_eq!(JobPayload::from_job(&job).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_decode_rejects_bad_jobs() {
        let (pool, _dir) = setup_test_db().await;
        let db = DbContext::from_url(pool.database_url());

        let id = db
            .jobs()
            .enqueue(&JobSpec {
                kind: "send_email".into(),
                payload: serde_json::json!({}),
                max_tries: 1,
                backoff_secs: 0,
                timeout_secs: 10,
            })
            .await
            .unwrap();
        let job = db.jobs().get(&id).await.unwrap().unwrap();
        assert!(matches!(JobPayload::from_job(&job), Err(JobError::UnknownKind(_))));

        let id = db
            .jobs()
            .enqueue(&JobSpec {
                kind: PROCESS_DRAWING_SET.into(),
                payload: serde_json::json!({ "sheet_id": 1 }),
                max_tries: 1,
                backoff_secs: 0,
                timeout_secs: 10,
            })
            .await
            .unwrap();
        let job = db.jobs().get(&id).await.unwrap().unwrap();
        assert!(matches!(
            JobPayload::from_job(&job),
            Err(JobError::InvalidPayload { .. })
        ));
    }
}
