use async_trait::async_trait;
use quarry_queue::Job;

use crate::context::WorkerContext;

/// Declaration that a worker type wants one recurring job of its own kept in
/// the queue at all times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsureJob {
    pub remote_id: String,
    /// Seconds between runs.
    pub interval: u64,
}

/// How a job run ended, as far as the queue is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    /// Done: delete the job, or reschedule it when it is recurring.
    Finished,
    /// Not ready yet: put the job back and try again after a delay.
    Release { delay_secs: u64 },
}

/// A unit of work the pool can run for one job type.
///
/// A fresh instance is created for every claimed job, so implementations may
/// keep per-run state in `self`.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Job type this worker handles.
    fn job_type(&self) -> &'static str;

    /// Maximum number of jobs of this type running at once. At least 1.
    fn max_workers(&self) -> u32 {
        1
    }

    fn ensure_job(&self) -> Option<EnsureJob> {
        None
    }

    async fn work(&mut self, ctx: &WorkerContext, job: &Job) -> anyhow::Result<WorkOutcome>;
}
