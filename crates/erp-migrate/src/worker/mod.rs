//! Job worker.
//!
//! Pulls jobs from a [`JobQueue`] and runs each through the
//! [`Orchestrator`] on its own task. A semaphore bounds how many jobs run
//! at once; transient failures are retried with exponential backoff. Page
//! fetches are throttled by the [`TokenBucket`] installed on the engine.

mod rate_limit;

pub use rate_limit::TokenBucket;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RetryConfig;
use crate::error::MigrateError;
use crate::orchestrator::{JobReport, Orchestrator};
use crate::pipeline::MigrationJob;

/// Exponential backoff for transient job failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Runs per job, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// Whether a failure on attempt `attempt` should be retried.
    pub fn should_retry(&self, error: &MigrateError, attempt: u32) -> bool {
        error.is_transient() && attempt < self.max_attempts
    }
}

/// FIFO of pending jobs.
#[derive(Debug, Default)]
pub struct JobQueue {
    pending: Mutex<VecDeque<MigrationJob>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, job: MigrationJob) {
        self.pending.lock().await.push_back(job);
    }

    pub async fn pop(&self) -> Option<MigrationJob> {
        self.pending.lock().await.pop_front()
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }
}

pub struct Worker {
    orchestrator: Arc<Orchestrator>,
    queue: Arc<JobQueue>,
    semaphore: Arc<Semaphore>,
    retry: RetryPolicy,
}

impl Worker {
    pub fn new(orchestrator: Arc<Orchestrator>, max_concurrent_jobs: usize) -> Self {
        Self {
            orchestrator,
            queue: Arc::new(JobQueue::new()),
            semaphore: Arc::new(Semaphore::new(max_concurrent_jobs.max(1))),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub async fn submit(&self, job: MigrationJob) {
        debug!("Queued job {}", job.job_id);
        self.queue.push(job).await;
    }

    /// Drain the queue, running up to `max_concurrent_jobs` jobs at once.
    /// Returns one report per job in submission order.
    ///
    /// After cancellation no new jobs start; running jobs stop at their next
    /// batch boundary and report `cancelled`.
    pub async fn run_until_idle(&self, cancel: &CancellationToken) -> Vec<JobReport> {
        let mut handles = Vec::new();
        let mut skipped = Vec::new();

        while let Some(job) = self.queue.pop().await {
            if cancel.is_cancelled() {
                skipped.push((handles.len() + skipped.len(), job));
                continue;
            }
            let permit = match self.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    error!("Worker semaphore closed; stopping");
                    skipped.push((handles.len() + skipped.len(), job));
                    break;
                }
            };
            let orchestrator = self.orchestrator.clone();
            let retry = self.retry;
            let cancel = cancel.clone();
            let index = handles.len() + skipped.len();
            let handle = tokio::spawn(async move {
                let report = run_with_retry(&orchestrator, &job, retry, &cancel).await;
                drop(permit);
                report
            });
            handles.push((index, handle));
        }
        // Jobs still queued when the semaphore closed.
        while let Some(job) = self.queue.pop().await {
            skipped.push((handles.len() + skipped.len(), job));
        }

        let indices: Vec<usize> = handles.iter().map(|(i, _)| *i).collect();
        let results = futures::future::join_all(handles.into_iter().map(|(_, h)| h)).await;

        let mut reports: Vec<(usize, JobReport)> = Vec::new();
        for (index, joined) in indices.into_iter().zip(results) {
            match joined {
                Ok(report) => reports.push((index, report)),
                Err(e) => {
                    error!("Worker task panicked: {}", e);
                    reports.push((
                        index,
                        JobReport {
                            job_id: String::new(),
                            entity_type: String::new(),
                            status: crate::state::JobStatus::Failed,
                            result: None,
                            preflight: None,
                            postflight: None,
                            error: Some(format!("worker task panicked: {}", e)),
                        },
                    ))
                }
            }
        }
        for (index, job) in skipped {
            warn!("Job {} not started: worker cancelled", job.job_id);
            let mut report = JobReport::failed(&job, &MigrateError::Cancelled);
            report.status = crate::state::JobStatus::Cancelled;
            reports.push((index, report));
        }
        reports.sort_by_key(|(index, _)| *index);

        info!("Worker idle: {} jobs processed", reports.len());
        reports.into_iter().map(|(_, report)| report).collect()
    }
}

async fn run_with_retry(
    orchestrator: &Orchestrator,
    job: &MigrationJob,
    retry: RetryPolicy,
    cancel: &CancellationToken,
) -> JobReport {
    let mut attempt = 1;
    loop {
        match orchestrator.execute(job, cancel).await {
            Ok(report) => return report,
            Err(e) if retry.should_retry(&e, attempt) && !cancel.is_cancelled() => {
                let delay = retry.delay_for(attempt);
                warn!(
                    "Job {} attempt {}/{} failed: {}. Retrying in {:?}",
                    job.job_id, attempt, retry.max_attempts, e, delay
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {}
                }
                attempt += 1;
            }
            Err(e) => return final_report(orchestrator, job, &e).await,
        }
    }
}

/// Report for a job whose last attempt failed, from its persisted record
/// when there is one.
async fn final_report(orchestrator: &Orchestrator, job: &MigrationJob, error: &MigrateError) -> JobReport {
    match orchestrator.engine().job_store().get_job(&job.job_id).await {
        Ok(Some(record)) => {
            let mut report = JobReport::from_record(&record, None);
            report.error = Some(error.to_string());
            report
        }
        Ok(None) => JobReport::failed(job, error),
        Err(e) => {
            error!("Failed to load job {} after error: {}", job.job_id, e);
            JobReport::failed(job, error)
        }
    }
}
