//! Job worker: claims queued jobs and runs them with retries.

use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use super::{JobError, JobPayload};
use crate::events::ProgressBroadcaster;
use crate::extraction::SheetExtractor;
use crate::models::Job;
use crate::render::DrawingSetProcessor;
use crate::repository::{DbContext, STALE_ERROR};

/// Claim attempts allowed to hit a locked database in a row.
const MAX_BUSY_ROUNDS: u32 = 20;
const BUSY_BACKOFF: Duration = Duration::from_millis(50);

/// What happened to a claimed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Failed this attempt and went back to the queue.
    Retrying,
    /// Failed with no tries left; the failure hook ran.
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkSummary {
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
}

impl WorkSummary {
    fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Completed => self.completed += 1,
            JobOutcome::Retrying => self.retried += 1,
            JobOutcome::Failed => self.failed += 1,
        }
    }

    fn merge(&mut self, other: WorkSummary) {
        self.completed += other.completed;
        self.retried += other.retried;
        self.failed += other.failed;
    }

    pub fn total(&self) -> usize {
        self.completed + self.retried + self.failed
    }
}

#[derive(Clone)]
pub struct Worker {
    db: DbContext,
    processor: DrawingSetProcessor,
    extractor: SheetExtractor,
}

impl Worker {
    pub fn new(db: DbContext, processor: DrawingSetProcessor, extractor: SheetExtractor) -> Self {
        Self {
            db,
            processor,
            extractor,
        }
    }

    /// Claim and run one job. `None` when nothing is available.
    pub async fn run_next(&self) -> Result<Option<JobOutcome>, JobError> {
        let Some(job) = self.db.jobs().claim_next().await? else {
            return Ok(None);
        };
        self.run_job(job).await.map(Some)
    }

    async fn run_job(&self, job: Job) -> Result<JobOutcome, JobError> {
        let payload = match JobPayload::from_job(&job) {
            Ok(payload) => payload,
            Err(e) => {
                // Retrying cannot fix a payload that does not decode
                error!(job_id = %job.id, kind = %job.kind, "{}", e);
                self.db.jobs().fail(&job.id, &e.to_string()).await?;
                return Ok(JobOutcome::Failed);
            }
        };

        info!(job_id = %job.id, kind = %job.kind, attempt = job.attempts, "Running job");
        let limit = Duration::from_secs(job.timeout_secs.max(1) as u64);

        let error = match tokio::time::timeout(limit, self.execute(&payload)).await {
            Ok(Ok(())) => {
                self.db.jobs().complete(&job.id).await?;
                debug!(job_id = %job.id, "Job completed");
                return Ok(JobOutcome::Completed);
            }
            Ok(Err(e)) => format!("{:#}", e),
            Err(_) => format!("Job timed out after {} seconds", job.timeout_secs),
        };

        if self.db.jobs().release(&job.id, &error).await? {
            warn!(
                job_id = %job.id,
                kind = %job.kind,
                attempt = job.attempts,
                max_tries = job.max_tries,
                "Job failed, will retry: {}",
                error
            );
            return Ok(JobOutcome::Retrying);
        }

        error!(job_id = %job.id, kind = %job.kind, "Job failed permanently: {}", error);
        if let Err(e) = self.on_permanent_failure(&payload, &error).await {
            error!(job_id = %job.id, "Failure hook failed: {:#}", e);
        }
        Ok(JobOutcome::Failed)
    }

    async fn execute(&self, payload: &JobPayload) -> anyhow::Result<()> {
        match *payload {
            JobPayload::ProcessDrawingSet { drawing_set_id } => {
                self.processor.process_set(drawing_set_id).await
            }
            JobPayload::ExtractSheetMetadata {
                sheet_id,
                preferred_template_id,
            } => self
                .extractor
                .extract_sheet(sheet_id, preferred_template_id)
                .await
                .map(|_| ()),
        }
    }

    async fn on_permanent_failure(&self, payload: &JobPayload, error: &str) -> anyhow::Result<()> {
        match *payload {
            JobPayload::ProcessDrawingSet { drawing_set_id } => {
                self.processor
                    .mark_permanently_failed(drawing_set_id, error)
                    .await
            }
            JobPayload::ExtractSheetMetadata { sheet_id, .. } => {
                self.extractor.mark_permanently_failed(sheet_id, error).await
            }
        }
    }

    /// Fail or requeue jobs abandoned by a stopped worker, running the
    /// permanent-failure hook for the ones out of tries. Returns how many
    /// were recovered.
    pub async fn recover_stale(&self) -> Result<usize, JobError> {
        let recovery = self.db.jobs().recover_stale().await?;

        for job in &recovery.exhausted {
            error!(job_id = %job.id, kind = %job.kind, "Job failed permanently: {}", STALE_ERROR);
            let payload = match JobPayload::from_job(job) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(job_id = %job.id, "{}", e);
                    continue;
                }
            };
            if let Err(e) = self.on_permanent_failure(&payload, STALE_ERROR).await {
                error!(job_id = %job.id, "Failure hook failed: {:#}", e);
            }
        }
        Ok(recovery.total())
    }

    /// Claim and run jobs until none is available, backing off while
    /// another worker holds the database lock.
    async fn drain(&self) -> Result<WorkSummary, JobError> {
        let mut summary = WorkSummary::default();
        let mut busy_rounds = 0;

        loop {
            match self.run_next().await {
                Ok(Some(outcome)) => {
                    summary.record(outcome);
                    busy_rounds = 0;
                }
                Ok(None) => return Ok(summary),
                Err(e) if e.is_busy() && busy_rounds < MAX_BUSY_ROUNDS => {
                    busy_rounds += 1;
                    debug!(busy_rounds, "Database busy, retrying claim");
                    tokio::time::sleep(BUSY_BACKOFF * busy_rounds).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Drain everything claimable now with `workers` concurrent loops.
    ///
    /// Jobs waiting out a retry backoff are left for a later run. Every loop
    /// is awaited before the first error is returned.
    pub async fn run_until_idle(&self, workers: usize) -> Result<WorkSummary, JobError> {
        let mut handles = Vec::new();

        for _ in 0..workers.max(1) {
            let worker = self.clone();
            handles.push(tokio::spawn(async move { worker.drain().await }));
        }

        let mut summary = WorkSummary::default();
        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(part)) => summary.merge(part),
                Ok(Err(e)) => {
                    error!("Worker stopped: {}", e);
                    first_error.get_or_insert(e);
                }
                Err(e) => error!("Worker task panicked: {}", e),
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    /// Poll the queue until `shutdown` resolves.
    ///
    /// Each round recovers jobs abandoned by a dead worker, drains the
    /// queue, and sleeps for `interval`. Database errors are logged and the
    /// next round tries again.
    pub async fn run_daemon(
        &self,
        workers: usize,
        interval: Duration,
        shutdown: impl Future<Output = ()>,
    ) -> Result<WorkSummary, JobError> {
        tokio::pin!(shutdown);
        let mut total = WorkSummary::default();

        loop {
            match self.recover_stale().await {
                Ok(0) => {}
                Ok(recovered) => warn!(recovered, "Recovered jobs from a stopped worker"),
                Err(e) => error!("Stale job recovery failed: {}", e),
            }

            tokio::select! {
                result = self.run_until_idle(workers) => match result {
                    Ok(summary) => {
                        if summary.total() > 0 {
                            info!(
                                completed = summary.completed,
                                retried = summary.retried,
                                failed = summary.failed,
                                "Queue drained"
                            );
                        }
                        total.merge(summary);
                    }
                    Err(e) => error!("Queue round failed, retrying after the interval: {}", e),
                },
                _ = &mut shutdown => break,
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = &mut shutdown => break,
            }
        }

        info!("Worker stopped");
        Ok(total)
    }
}

/// Log progress updates until the broadcaster is dropped.
pub fn spawn_progress_logger(events: &ProgressBroadcaster) -> tokio::task::JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(update) => info!(
                    drawing_set_id = update.drawing_set_id,
                    status = update.status.as_str(),
                    sheet_id = ?update.sheet_id,
                    extraction_status = ?update.extraction_status.map(|s| s.as_str()),
                    drawing_number = ?update.drawing_number,
                    processed = ?update.stats.map(|s| s.processed()),
                    total = ?update.stats.map(|s| s.total),
                    message = ?update.message,
                    "Progress"
                ),
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Progress logger fell behind")
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;

    use crate::models::{DrawingSetStatus, ExtractionStatus};
    use crate::ocr::{Block, Document, OcrError, Query, TextractApi, TextractService};
    use crate::render::PageRenderer;
    use crate::repository::test_support::setup_test_db;
    use crate::repository::JobSpec;
    use crate::storage::{LocalStorage, ObjectStorage};
    use crate::validation::MetadataValidator;

    struct Unavailable;

    #[async_trait]
    impl TextractApi for Unavailable {
        async fn analyze_queries(
            &self,
            _document: Document<'_>,
            _queries: &[Query],
        ) -> Result<Vec<Block>, OcrError> {
            Err(OcrError::Service("unavailable".into()))
        }

        async fn detect_text(&self, _image: &[u8]) -> Result<Vec<Block>, OcrError> {
            Err(OcrError::Service("unavailable".into()))
        }
    }

    async fn worker() -> (Worker, DbContext, tempfile::TempDir, tempfile::TempDir) {
        let (pool, db_dir) = setup_test_db().await;
        let db = DbContext::from_url(pool.database_url());
        let storage_dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn ObjectStorage> =
            Arc::new(LocalStorage::new(storage_dir.path().to_path_buf()));
        let events = ProgressBroadcaster::new();

        let processor = DrawingSetProcessor::new(
            db.clone(),
            storage.clone(),
            PageRenderer::default(),
            events.clone(),
        );
        let extractor = SheetExtractor::new(
            db.clone(),
            storage,
            TextractService::new(Arc::new(Unavailable)),
            MetadataValidator::default(),
            events,
        );
        (Worker::new(db.clone(), processor, extractor), db, db_dir, storage_dir)
    }

    #[tokio::test]
    async fn test_empty_queue() {
        let (worker, _db, _a, _b) = worker().await;
        assert_eq!(worker.run_next().await.unwrap(), None);
        assert_eq!(worker.run_until_idle(2).await.unwrap(), WorkSummary::default());
    }

    #[tokio::test]
    async fn test_undecodable_job_fails_without_retry() {
        let (worker, db, _a, _b) = worker().await;
        let id = db
            .jobs()
            .enqueue(&JobSpec {
                kind: "unknown".into(),
                payload: serde_json::json!({}),
                max_tries: 3,
                backoff_secs: 0,
                timeout_secs: 10,
            })
            .await
            .unwrap();

        assert_eq!(worker.run_next().await.unwrap(), Some(JobOutcome::Failed));
        let job = db.jobs().get(&id).await.unwrap().unwrap();
        assert_eq!(job.status, crate::models::JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_missing_sheet_completes() {
        let (worker, db, _a, _b) = worker().await;
        super::super::dispatch(
            &db,
            JobPayload::ExtractSheetMetadata {
                sheet_id: 404,
                preferred_template_id: None,
            },
        )
        .await
        .unwrap();

        let summary = worker.run_until_idle(1).await.unwrap();
        assert_eq!(summary.completed, 1);
    }

    #[tokio::test]
    async fn test_set_failure_retries_then_runs_hook() {
        let (worker, db, _a, _b) = worker().await;
        // The PDF was never stored, so every attempt fails
        let set_id = db.drawing_sets().create(1, "Set", "pdf/missing.pdf", 1).await.unwrap();
        let id = db
            .jobs()
            .enqueue(&JobSpec {
                backoff_secs: 0,
                max_tries: 2,
                ..JobPayload::ProcessDrawingSet { drawing_set_id: set_id }.spec()
            })
            .await
            .unwrap();

        assert_eq!(worker.run_next().await.unwrap(), Some(JobOutcome::Retrying));
        assert_eq!(worker.run_next().await.unwrap(), Some(JobOutcome::Failed));

        let job = db.jobs().get(&id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 2);
        assert!(job.last_error.unwrap().contains("pdf/missing.pdf"));

        let set = db.drawing_sets().get(set_id).await.unwrap().unwrap();
        assert_eq!(set.status, DrawingSetStatus::Failed);
        let errors = set.processing_errors.unwrap();
        assert!(errors["failed_at"].is_string());
    }

    #[tokio::test]
    async fn test_extraction_hook_marks_sheet_failed() {
        let (worker, db, _a, _b) = worker().await;
        let set_id = db.drawing_sets().create(1, "Set", "pdf/set.pdf", 1).await.unwrap();
        let set = db.drawing_sets().get(set_id).await.unwrap().unwrap();
        let sheet_id = db.sheets().create_for_set(&set).await.unwrap()[0];

        let payload = JobPayload::ExtractSheetMetadata {
            sheet_id,
            preferred_template_id: None,
        };
        worker
            .on_permanent_failure(&payload, "Job timed out after 300 seconds")
            .await
            .unwrap();

        let sheet = db.sheets().get(sheet_id).await.unwrap().unwrap();
        assert_eq!(sheet.extraction_status, ExtractionStatus::Failed);
        assert_eq!(
            sheet.extraction_errors.unwrap()["error"],
            "Job timed out after 300 seconds"
        );
        let set = db.drawing_sets().get(set_id).await.unwrap().unwrap();
        assert_eq!(set.status, DrawingSetStatus::Failed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_workers_drain_queue() {
        let (worker, db, _a, _b) = worker().await;
        for sheet_id in 0..200 {
            super::super::dispatch(
                &db,
                JobPayload::ExtractSheetMetadata {
                    sheet_id: 10_000 + sheet_id,
                    preferred_template_id: None,
                },
            )
            .await
            .unwrap();
        }

        let summary = worker.run_until_idle(8).await.unwrap();
        assert_eq!(summary.completed, 200);
        assert_eq!(summary.total(), 200);
        assert_eq!(db.jobs().counts().await.unwrap(), vec![("done".to_string(), 200)]);
    }

    #[tokio::test]
    async fn test_stale_exhausted_job_runs_failure_hook() {
        use crate::repository::util::format_datetime;
        use crate::schema::jobs;
        use diesel::prelude::*;
        use diesel_async::RunQueryDsl;

        let (worker, db, _a, _b) = worker().await;
        let set_id = db.drawing_sets().create(1, "Set", "pdf/set.pdf", 1).await.unwrap();
        let set = db.drawing_sets().get(set_id).await.unwrap().unwrap();
        let sheet_id = db.sheets().create_for_set(&set).await.unwrap()[0];
        db.sheets()
            .set_extraction_status(sheet_id, ExtractionStatus::Processing)
            .await
            .unwrap();

        let payload = JobPayload::ExtractSheetMetadata {
            sheet_id,
            preferred_template_id: None,
        };
        let id = db
            .jobs()
            .enqueue(&JobSpec {
                max_tries: 1,
                ..payload.spec()
            })
            .await
            .unwrap();
        db.jobs().claim_next().await.unwrap().unwrap();

        // The worker that claimed it died an hour ago
        let mut conn = db.pool().get().await.unwrap();
        diesel::update(jobs::table.find(&id))
            .set(jobs::reserved_at.eq(Some(format_datetime(
                chrono::Utc::now() - chrono::Duration::hours(1),
            ))))
            .execute(&mut conn)
            .await
            .unwrap();

        assert_eq!(worker.recover_stale().await.unwrap(), 1);

        let job = db.jobs().get(&id).await.unwrap().unwrap();
        assert_eq!(job.status, crate::models::JobStatus::Failed);

        let sheet = db.sheets().get(sheet_id).await.unwrap().unwrap();
        assert_eq!(sheet.extraction_status, ExtractionStatus::Failed);
        let errors = sheet.extraction_errors.unwrap();
        assert_eq!(errors["error"], STALE_ERROR);
        assert!(errors["failed_at"].is_string());

        let set = db.drawing_sets().get(set_id).await.unwrap().unwrap();
        assert_eq!(set.status, DrawingSetStatus::Failed);
    }

    #[tokio::test]
    async fn test_daemon_stops_on_shutdown() {
        let (worker, _db, _a, _b) = worker().await;
        let summary = worker
            .run_daemon(1, Duration::from_secs(60), async {})
            .await
            .unwrap();
        assert_eq!(summary, WorkSummary::default());
    }
}
