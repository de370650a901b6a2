//! Persistent job queue.
//!
//! Jobs move pending -> running -> done, or back to pending after a failed
//! attempt while tries remain, and finally to failed.

use chrono::{Duration, Utc};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;

use super::diesel_models::{JobRecord, NewJob};
use super::pool::{AsyncSqlitePool, DieselError};
use super::util::{
    format_datetime, now_rfc3339, parse_datetime, parse_datetime_opt, parse_status,
};
use crate::models::{Job, JobStatus};
use crate::schema::jobs;

/// Grace period before a running job with no live worker is reclaimed.
const STALE_GRACE_SECS: i64 = 60;

pub const STALE_ERROR: &str = "Worker stopped before the job finished";

impl From<JobRecord> for Job {
    fn from(r: JobRecord) -> Self {
        let status = parse_status(
            "jobs",
            &r.id,
            &r.status,
            JobStatus::from_str,
            JobStatus::Pending,
        );
        Job {
            id: r.id,
            kind: r.kind,
            payload: serde_json::from_str(&r.payload).unwrap_or(serde_json::Value::Null),
            status,
            attempts: r.attempts,
            max_tries: r.max_tries,
            backoff_secs: r.backoff_secs,
            timeout_secs: r.timeout_secs,
            available_at: parse_datetime(&r.available_at),
            reserved_at: parse_datetime_opt(r.reserved_at),
            last_error: r.last_error,
            created_at: parse_datetime(&r.created_at),
            updated_at: parse_datetime(&r.updated_at),
        }
    }
}

/// Queue parameters for a new job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub kind: String,
    pub payload: serde_json::Value,
    pub max_tries: i32,
    pub backoff_secs: i32,
    pub timeout_secs: i32,
}

/// Result of [`JobRepository::recover_stale`].
#[derive(Debug, Default)]
pub struct StaleRecovery {
    pub requeued: usize,
    /// Failed for good; their failure hooks have not run yet.
    pub exhausted: Vec<Job>,
}

impl StaleRecovery {
    pub fn total(&self) -> usize {
        self.requeued + self.exhausted.len()
    }
}

#[derive(Clone)]
pub struct JobRepository {
    pool: AsyncSqlitePool,
}

impl JobRepository {
    pub fn new(pool: AsyncSqlitePool) -> Self {
        Self { pool }
    }

    /// Add a pending job, available immediately. Returns its id.
    pub async fn enqueue(&self, spec: &JobSpec) -> Result<String, DieselError> {
        let mut conn = self.pool.get().await?;
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let payload = spec.payload.to_string();

        diesel::insert_into(jobs::table)
            .values(NewJob {
                id: &id,
                kind: &spec.kind,
                payload: &payload,
                status: JobStatus::Pending.as_str(),
                attempts: 0,
                max_tries: spec.max_tries,
                backoff_secs: spec.backoff_secs,
                timeout_secs: spec.timeout_secs,
                available_at: &now,
                created_at: &now,
                updated_at: &now,
            })
            .execute(&mut conn)
            .await?;

        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Job>, DieselError> {
        let mut conn = self.pool.get().await?;

        jobs::table
            .find(id)
            .first::<JobRecord>(&mut conn)
            .await
            .optional()
            .map(|opt| opt.map(Job::from))
    }

    /// Reserve the oldest available pending job and count the attempt.
    ///
    /// A single UPDATE takes the write lock up front, so concurrent workers
    /// wait on the busy timeout instead of deadlocking on a lock upgrade, and
    /// two workers never run the same job.
    pub async fn claim_next(&self) -> Result<Option<Job>, DieselError> {
        use diesel::sql_types::Text;
        let mut conn = self.pool.get().await?;
        let now = now_rfc3339();

        let claimed: Vec<JobRecord> = diesel::sql_query(
            "UPDATE jobs SET status = ?, attempts = attempts + 1, reserved_at = ?, updated_at = ? \
             WHERE id = (SELECT id FROM jobs WHERE status = ? AND available_at <= ? \
                         ORDER BY available_at ASC, created_at ASC LIMIT 1) \
               AND status = ? \
             RETURNING *",
        )
        .bind::<Text, _>(JobStatus::Running.as_str())
        .bind::<Text, _>(&now)
        .bind::<Text, _>(&now)
        .bind::<Text, _>(JobStatus::Pending.as_str())
        .bind::<Text, _>(&now)
        .bind::<Text, _>(JobStatus::Pending.as_str())
        .load(&mut conn)
        .await?;

        Ok(claimed.into_iter().next().map(Job::from))
    }

    pub async fn complete(&self, id: &str) -> Result<(), DieselError> {
        let mut conn = self.pool.get().await?;
        let now = now_rfc3339();

        diesel::update(jobs::table.find(id))
            .set((
                jobs::status.eq(JobStatus::Done.as_str()),
                jobs::reserved_at.eq(None::<String>),
                jobs::updated_at.eq(&now),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    /// Return a failed attempt to the queue after its backoff, or fail the
    /// job when no tries remain. Returns whether it was requeued.
    pub async fn release(&self, id: &str, error: &str) -> Result<bool, DieselError> {
        let Some(job) = self.get(id).await? else {
            return Ok(false);
        };

        if !job.has_tries_left() {
            self.fail(id, error).await?;
            return Ok(false);
        }

        let mut conn = self.pool.get().await?;
        let now = Utc::now();
        let available_at = format_datetime(now + Duration::seconds(job.backoff_secs as i64));

        diesel::update(jobs::table.find(id))
            .set((
                jobs::status.eq(JobStatus::Pending.as_str()),
                jobs::available_at.eq(&available_at),
                jobs::reserved_at.eq(None::<String>),
                jobs::last_error.eq(Some(error)),
                jobs::updated_at.eq(format_datetime(now)),
            ))
            .execute(&mut conn)
            .await?;
        Ok(true)
    }

    pub async fn fail(&self, id: &str, error: &str) -> Result<(), DieselError> {
        let mut conn = self.pool.get().await?;

        diesel::update(jobs::table.find(id))
            .set((
                jobs::status.eq(JobStatus::Failed.as_str()),
                jobs::reserved_at.eq(None::<String>),
                jobs::last_error.eq(Some(error)),
                jobs::updated_at.eq(now_rfc3339()),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    /// Release running jobs whose worker disappeared (reserved longer than
    /// their timeout plus a grace period).
    ///
    /// Jobs with tries left go back to the queue. The rest are failed and
    /// returned in `exhausted` so the caller can run their failure hooks.
    pub async fn recover_stale(&self) -> Result<StaleRecovery, DieselError> {
        let running: Vec<Job> = {
            let mut conn = self.pool.get().await?;
            jobs::table
                .filter(jobs::status.eq(JobStatus::Running.as_str()))
                .load::<JobRecord>(&mut conn)
                .await?
                .into_iter()
                .map(Job::from)
                .collect()
        };

        let now = Utc::now();
        let mut recovery = StaleRecovery::default();
        for job in running {
            let deadline = job.reserved_at.unwrap_or(job.updated_at)
                + Duration::seconds(job.timeout_secs as i64 + STALE_GRACE_SECS);
            if deadline >= now {
                continue;
            }
            if self.release(&job.id, STALE_ERROR).await? {
                recovery.requeued += 1;
            } else {
                recovery.exhausted.push(job);
            }
        }
        Ok(recovery)
    }

    /// Job counts by status.
    pub async fn counts(&self) -> Result<Vec<(String, i64)>, DieselError> {
        use diesel::dsl::count_star;
        let mut conn = self.pool.get().await?;

        jobs::table
            .group_by(jobs::status)
            .select((jobs::status, count_star()))
            .order(jobs::status.asc())
            .load(&mut conn)
            .await
    }

    /// Pending jobs, including ones still waiting out a backoff.
    pub async fn pending_count(&self) -> Result<i64, DieselError> {
        let mut conn = self.pool.get().await?;

        jobs::table
            .filter(jobs::status.eq(JobStatus::Pending.as_str()))
            .count()
            .get_result(&mut conn)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::setup_test_db;

    fn spec(max_tries: i32, backoff_secs: i32) -> JobSpec {
        JobSpec {
            kind: "extract_sheet_metadata".into(),
            payload: serde_json::json!({"sheet_id": 1}),
            max_tries,
            backoff_secs,
            timeout_secs: 300,
        }
    }

    #[tokio::test]
    async fn test_claim_complete() {
        let (pool, _dir) = setup_test_db().await;
        let repo = JobRepository::new(pool);

        let id = repo.enqueue(&spec(3, 60)).await.unwrap();
        let job = repo.claim_next().await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.payload["sheet_id"], 1);

        // nothing else to claim
        assert!(repo.claim_next().await.unwrap().is_none());

        repo.complete(&id).await.unwrap();
        let job = repo.get(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(repo.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_release_applies_backoff_then_fails() {
        let (pool, _dir) = setup_test_db().await;
        let repo = JobRepository::new(pool);

        let id = repo.enqueue(&spec(2, 60)).await.unwrap();
        repo.claim_next().await.unwrap().unwrap();
        assert!(repo.release(&id, "first").await.unwrap());

        let job = repo.get(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.last_error.as_deref(), Some("first"));
        assert!(job.available_at > Utc::now() + Duration::seconds(30));
        // backing off
        assert!(repo.claim_next().await.unwrap().is_none());
        assert_eq!(repo.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_release_without_tries_fails() {
        let (pool, _dir) = setup_test_db().await;
        let repo = JobRepository::new(pool);

        let id = repo.enqueue(&spec(2, 0)).await.unwrap();
        repo.claim_next().await.unwrap().unwrap();
        assert!(repo.release(&id, "first").await.unwrap());

        let job = repo.claim_next().await.unwrap().unwrap();
        assert_eq!(job.attempts, 2);
        assert!(!repo.release(&id, "second").await.unwrap());

        let job = repo.get(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error.as_deref(), Some("second"));

        let counts = repo.counts().await.unwrap();
        assert_eq!(counts, vec![("failed".to_string(), 1)]);
    }

    /// Pretend the job was reserved an hour ago.
    async fn backdate_reservation(pool: &AsyncSqlitePool, id: &str) {
        let mut conn = pool.get().await.unwrap();
        let then = format_datetime(Utc::now() - Duration::hours(1));
        diesel::update(jobs::table.find(id))
            .set(jobs::reserved_at.eq(Some(then)))
            .execute(&mut conn)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_recover_stale_ignores_fresh_jobs() {
        let (pool, _dir) = setup_test_db().await;
        let repo = JobRepository::new(pool);

        repo.enqueue(&spec(3, 0)).await.unwrap();
        repo.claim_next().await.unwrap().unwrap();
        let recovery = repo.recover_stale().await.unwrap();
        assert_eq!(recovery.total(), 0);
    }

    #[tokio::test]
    async fn test_recover_stale_requeues_timed_out_job() {
        let (pool, _dir) = setup_test_db().await;
        let repo = JobRepository::new(pool.clone());

        let id = repo.enqueue(&spec(3, 0)).await.unwrap();
        repo.claim_next().await.unwrap().unwrap();
        backdate_reservation(&pool, &id).await;

        let recovery = repo.recover_stale().await.unwrap();
        assert_eq!(recovery.requeued, 1);
        assert!(recovery.exhausted.is_empty());

        let job = repo.get(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.reserved_at.is_none());
        assert_eq!(job.last_error.as_deref(), Some(STALE_ERROR));

        let job = repo.claim_next().await.unwrap().unwrap();
        assert_eq!(job.attempts, 2);
    }

    #[tokio::test]
    async fn test_recover_stale_returns_exhausted_job() {
        let (pool, _dir) = setup_test_db().await;
        let repo = JobRepository::new(pool.clone());

        let id = repo.enqueue(&spec(1, 0)).await.unwrap();
        repo.claim_next().await.unwrap().unwrap();
        backdate_reservation(&pool, &id).await;

        let recovery = repo.recover_stale().await.unwrap();
        assert_eq!(recovery.requeued, 0);
        assert_eq!(recovery.exhausted.len(), 1);
        assert_eq!(recovery.exhausted[0].id, id);

        let job = repo.get(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(repo.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_skips_running_jobs() {
        let (pool, _dir) = setup_test_db().await;
        let repo = JobRepository::new(pool);

        let first = repo.enqueue(&spec(3, 0)).await.unwrap();
        let second = repo.enqueue(&spec(3, 0)).await.unwrap();

        let a = repo.claim_next().await.unwrap().unwrap();
        let b = repo.claim_next().await.unwrap().unwrap();
        assert_ne!(a.id, b.id);
        assert!([&first, &second].contains(&&a.id));
        assert!([&first, &second].contains(&&b.id));
        assert!(repo.claim_next().await.unwrap().is_none());
    }
}
