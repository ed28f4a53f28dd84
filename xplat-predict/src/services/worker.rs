//! Queue worker pool
//!
//! `worker_count` tokio tasks claim jobs from the [`JobQueue`] and hand them to
//! the [`PredictionProcessor`]. Idle workers wait for an enqueue notification
//! or the poll interval, whichever comes first. Cancelling the shutdown token
//! stops each worker after its current job.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use xplat_common::Result;

use crate::models::{ClaimedJob, PredictionJob};
use crate::services::orchestrator::PredictionProcessor;
use crate::services::queue::{FailureOutcome, JobQueue};

/// Lower bound on idle sleeps so a due-but-contended job cannot cause a spin
const MIN_IDLE_WAIT: Duration = Duration::from_millis(10);

#[derive(Clone)]
pub struct WorkerPool {
    queue: Arc<JobQueue>,
    processor: Arc<PredictionProcessor>,
    worker_count: usize,
}

/// Running workers
pub struct WorkerPoolHandle {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPoolHandle {
    /// Wait for every worker to exit
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }
    }
}

impl WorkerPool {
    pub fn new(queue: Arc<JobQueue>, processor: Arc<PredictionProcessor>, worker_count: usize) -> Self {
        Self {
            queue,
            processor,
            worker_count: worker_count.max(1),
        }
    }

    /// Start the workers
    pub fn spawn(&self, shutdown: CancellationToken) -> WorkerPoolHandle {
        tracing::info!(workers = self.worker_count, "Starting queue workers");

        let handles = (0..self.worker_count)
            .map(|worker_id| {
                let pool = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pool.run_worker(worker_id, shutdown).await })
            })
            .collect();

        WorkerPoolHandle { handles }
    }

    async fn run_worker(&self, worker_id: usize, shutdown: CancellationToken) {
        tracing::debug!(worker_id, "Worker started");

        while !shutdown.is_cancelled() {
            let notified = self.queue.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.process_next().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => tracing::error!(worker_id, error = %e, "Queue operation failed"),
            }

            let wait = self.queue.idle_wait().await.max(MIN_IDLE_WAIT);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }

        tracing::debug!(worker_id, "Worker stopped");
    }

    /// Claim and run one job. Returns false when nothing was runnable.
    pub async fn process_next(&self) -> Result<bool> {
        let Some(job) = self.queue.claim().await? else {
            return Ok(false);
        };
        self.run_job(job).await?;
        Ok(true)
    }

    /// Run jobs until none are runnable; returns how many ran
    pub async fn drain(&self) -> Result<usize> {
        let mut processed = 0;
        while self.process_next().await? {
            processed += 1;
        }
        Ok(processed)
    }

    async fn run_job(&self, job: ClaimedJob) -> Result<()> {
        let decoded = match PredictionJob::from_payload(&job.payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Rejecting malformed job");
                return self.queue.reject(&job, &e.to_string()).await;
            }
        };

        tracing::debug!(
            job_id = %job.id,
            kind = decoded.kind(),
            attempt = job.attempts,
            "Running job"
        );

        match self.processor.handle(&decoded).await {
            Ok(()) => self.queue.complete(&job).await,
            Err(e) => {
                let error = e.to_string();
                match self.queue.fail(&job, &error).await? {
                    FailureOutcome::Retrying { run_at } => tracing::warn!(
                        job_id = %job.id,
                        attempt = job.attempts,
                        run_at,
                        error = %error,
                        "Job failed; will retry"
                    ),
                    FailureOutcome::Failed => {
                        tracing::error!(
                            job_id = %job.id,
                            attempts = job.attempts,
                            error = %error,
                            "Job failed permanently"
                        );
                        self.processor.abandon(&decoded, &error).await;
                    }
                    FailureOutcome::Gone => tracing::debug!(
                        job_id = %job.id,
                        "Failed job was already removed"
                    ),
                }
                Ok(())
            }
        }
    }
}
