//! Durable job queue
//!
//! At-least-once delivery on top of the `jobs` table:
//! - enqueue inserts `waiting` rows and wakes idle workers
//! - claim flips one runnable row to `active`
//! - a handler error moves the job to `delayed` with exponential backoff, or
//!   to `failed` once `max_attempts` deliveries have been used
//! - rows still `active` at startup belong to a dead process and are requeued

use sqlx::SqlitePool;
use std::time::Duration;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use uuid::Uuid;
use xplat_common::config::QueueConfig;
use xplat_common::time::now_millis;
use xplat_common::Result;

use crate::db::jobs;
use crate::db::JobCounts;
use crate::models::{ClaimedJob, PredictionJob};

/// What happened to a job whose handler failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Scheduled for another attempt at `run_at` (epoch ms)
    Retrying { run_at: i64 },
    /// Out of attempts
    Failed,
    /// The job was removed (canceled) while running
    Gone,
}

pub struct JobQueue {
    pool: SqlitePool,
    notify: Notify,
    max_attempts: u32,
    retry_backoff: Duration,
    poll_interval: Duration,
}

impl JobQueue {
    pub fn new(pool: SqlitePool, config: &QueueConfig) -> Self {
        Self {
            pool,
            notify: Notify::new(),
            max_attempts: config.max_attempts,
            retry_backoff: config.retry_backoff,
            poll_interval: config.poll_interval,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Enqueue jobs in one transaction and wake workers
    pub async fn enqueue_many(&self, batch: &[PredictionJob]) -> Result<Vec<Uuid>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let now_ms = now_millis();
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(batch.len());
        for job in batch {
            ids.push(jobs::insert_job(&mut tx, job, self.max_attempts, now_ms).await?);
        }
        tx.commit().await?;

        tracing::debug!(count = ids.len(), "Enqueued jobs");
        self.notify_enqueued();
        Ok(ids)
    }

    /// Wake idle workers after jobs were inserted outside [`JobQueue::enqueue_many`]
    pub fn notify_enqueued(&self) {
        self.notify.notify_waiters();
    }

    /// Future resolved by the next enqueue
    ///
    /// Create (and `enable`) it before calling [`JobQueue::claim`] so a wakeup
    /// between an empty claim and the wait is not lost.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    pub async fn claim(&self) -> Result<Option<ClaimedJob>> {
        jobs::claim_next(&self.pool, now_millis()).await
    }

    /// Delete a successfully handled job
    pub async fn complete(&self, job: &ClaimedJob) -> Result<()> {
        if !jobs::complete(&self.pool, job.id).await? {
            tracing::debug!(job_id = %job.id, "Completed job was already removed");
        }
        Ok(())
    }

    /// Record a handler failure: retry with backoff or give up
    pub async fn fail(&self, job: &ClaimedJob, error: &str) -> Result<FailureOutcome> {
        if job.attempts >= job.max_attempts {
            return Ok(if jobs::mark_failed(&self.pool, job.id, error).await? {
                FailureOutcome::Failed
            } else {
                FailureOutcome::Gone
            });
        }

        let run_at = now_millis() + self.backoff_for(job.attempts).as_millis() as i64;
        Ok(if jobs::schedule_retry(&self.pool, job.id, run_at, error).await? {
            FailureOutcome::Retrying { run_at }
        } else {
            FailureOutcome::Gone
        })
    }

    /// Fail a job immediately without retries (undecodable payload)
    pub async fn reject(&self, job: &ClaimedJob, error: &str) -> Result<()> {
        jobs::mark_failed(&self.pool, job.id, error).await?;
        Ok(())
    }

    /// Remove waiting, active and delayed jobs of one batch
    pub async fn remove_prediction_jobs(&self, prediction_id: Uuid) -> Result<u64> {
        jobs::remove_for_prediction(&self.pool, prediction_id).await
    }

    /// Requeue jobs left `active` by a previous process
    pub async fn recover_stale(&self) -> Result<u64> {
        let requeued = jobs::requeue_stale(&self.pool, now_millis()).await?;
        if requeued > 0 {
            tracing::info!(requeued, "Requeued jobs interrupted by a previous shutdown");
        }
        Ok(requeued)
    }

    pub async fn counts(&self) -> Result<JobCounts> {
        jobs::count_by_state(&self.pool).await
    }

    /// How long an idle worker sleeps before polling again
    ///
    /// Never longer than the poll interval; shorter when a delayed job comes
    /// due sooner.
    pub async fn idle_wait(&self) -> Duration {
        match jobs::next_run_at(&self.pool).await {
            Ok(Some(run_at)) => {
                let until_due = (run_at - now_millis()).max(0) as u64;
                Duration::from_millis(until_due).min(self.poll_interval)
            }
            Ok(None) => self.poll_interval,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read next job due time");
                self.poll_interval
            }
        }
    }

    /// Exponential backoff after the given attempt number
    fn backoff_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        self.retry_backoff.saturating_mul(1u32 << exponent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobState;
    use tempfile::TempDir;

    async fn setup(max_attempts: u32) -> (TempDir, SqlitePool, JobQueue) {
        let temp_dir = TempDir::new().unwrap();
        let pool = xplat_common::db::init_database(&temp_dir.path().join("queue.db"))
            .await
            .unwrap();
        let queue = JobQueue::new(
            pool.clone(),
            &QueueConfig {
                worker_count: 1,
                max_attempts,
                retry_backoff: Duration::from_millis(100),
                poll_interval: Duration::from_millis(50),
            },
        );
        (temp_dir, pool, queue)
    }

    #[tokio::test]
    async fn test_failed_job_is_retried_then_failed() {
        let (_dir, pool, queue) = setup(2).await;
        let ids = queue
            .enqueue_many(&[PredictionJob::ProcessPrediction { prediction_id: Uuid::new_v4() }])
            .await
            .unwrap();

        let job = queue.claim().await.unwrap().unwrap();
        assert!(matches!(queue.fail(&job, "boom").await.unwrap(), FailureOutcome::Retrying { .. }));
        assert_eq!(jobs::get_job_state(&pool, ids[0]).await.unwrap(), Some(JobState::Delayed));

        // Not runnable until the backoff expires
        assert!(queue.claim().await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(150)).await;

        let job = queue.claim().await.unwrap().unwrap();
        assert_eq!(job.attempts, 2);
        assert_eq!(queue.fail(&job, "boom again").await.unwrap(), FailureOutcome::Failed);
        assert_eq!(jobs::get_job_state(&pool, ids[0]).await.unwrap(), Some(JobState::Failed));
    }

    #[tokio::test]
    async fn test_fail_after_removal_reports_gone() {
        let (_dir, _pool, queue) = setup(3).await;
        let prediction_id = Uuid::new_v4();
        queue
            .enqueue_many(&[PredictionJob::ProcessPrediction { prediction_id }])
            .await
            .unwrap();

        let job = queue.claim().await.unwrap().unwrap();
        assert_eq!(queue.remove_prediction_jobs(prediction_id).await.unwrap(), 1);
        assert_eq!(queue.fail(&job, "late").await.unwrap(), FailureOutcome::Gone);
    }

    #[tokio::test]
    async fn test_enqueue_wakes_waiting_worker() {
        let (_dir, _pool, queue) = setup(3).await;
        let queue = std::sync::Arc::new(queue);

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let notified = queue.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                tokio::time::timeout(Duration::from_secs(5), notified).await.is_ok()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue
            .enqueue_many(&[PredictionJob::ProcessPrediction { prediction_id: Uuid::new_v4() }])
            .await
            .unwrap();

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_backoff_is_exponential() {
        let (_dir, _pool, queue) = setup(3).await;
        assert_eq!(queue.backoff_for(1), Duration::from_millis(100));
        assert_eq!(queue.backoff_for(2), Duration::from_millis(200));
        assert_eq!(queue.backoff_for(3), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_idle_wait_bounded_by_poll_interval() {
        let (_dir, _pool, queue) = setup(3).await;
        assert_eq!(queue.idle_wait().await, Duration::from_millis(50));

        queue
            .enqueue_many(&[PredictionJob::ProcessPrediction { prediction_id: Uuid::new_v4() }])
            .await
            .unwrap();
        assert_eq!(queue.idle_wait().await, Duration::ZERO);
    }
}
