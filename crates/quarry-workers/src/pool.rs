use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use quarry_core::config::SchedulerConfig;
use quarry_queue::Job;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::context::WorkerContext;
use crate::registry::{RegistryEntry, WorkerRegistry};
use crate::worker::WorkOutcome;

/// Delay before retrying a job whose type has no registered worker.
const UNKNOWN_TYPE_RETRY_SECS: u64 = 300;

/// Claims jobs from the queue and runs them on registered workers.
///
/// Holds no scheduling state of its own beyond the set of in-flight tasks:
/// every cap is enforced by the claim statement, so several pools (or
/// processes) can share one queue.
pub struct WorkerPool {
    ctx: WorkerContext,
    registry: Arc<WorkerRegistry>,
    settings: SchedulerConfig,
    shutdown_when_queue_empty: bool,
}

impl WorkerPool {
    pub fn new(ctx: WorkerContext, registry: WorkerRegistry) -> Self {
        let settings = ctx.config.scheduler.clone();
        Self {
            ctx,
            registry: Arc::new(registry),
            settings,
            shutdown_when_queue_empty: false,
        }
    }

    /// Stop as soon as no job is claimable and none is running.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Enqueue every declared ensure-job that is not queued yet. Returns how
    /// many were inserted.
    pub fn seed(&self) -> usize {
        let mut inserted = 0;
        for (job_type, ensure) in self.registry.ensure_jobs() {
            match self
                .ctx
                .queue
                .enqueue_if_absent(&job_type, &ensure.remote_id, ensure.interval)
            {
                Ok(job) if job.inserted => inserted += 1,
                Ok(_) => {}
                Err(e) => warn!(job.type = %job_type, error = %e, "could not seed recurring job"),
            }
        }
        if inserted > 0 {
            info!(count = inserted, "recurring jobs seeded");
        }
        inserted
    }

    /// Main loop. Runs until `shutdown` broadcasts `true` (or, with
    /// [`Self::shutdown_when_queue_empty`], until the queue is drained), then
    /// waits for in-flight jobs to finish.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(types = ?self.registry.types(), "worker pool started");
        if self.settings.seed_on_start {
            self.seed();
        }

        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut last_stale_check: Option<Instant> = None;
        let mut failures: u32 = 0;

        loop {
            while let Some(res) = tasks.try_join_next() {
                log_task_result(res);
            }
            if *shutdown.borrow() {
                break;
            }

            let stale_every = Duration::from_secs(self.settings.stale_check_secs);
            if last_stale_check.map_or(true, |at| at.elapsed() >= stale_every) {
                last_stale_check = Some(Instant::now());
                if let Err(e) = self.ctx.queue.release_stale(self.settings.stale_timeout_secs) {
                    error!(error = %e, "stale job recovery failed");
                }
            }

            let (claimed, store_ok) = self.claim_and_spawn(&mut tasks);
            let pause = if store_ok {
                failures = 0;
                self.sleep_duration_with_jitter()
            } else {
                failures = failures.saturating_add(1);
                self.backoff(failures)
            };

            if self.shutdown_when_queue_empty && store_ok && claimed == 0 && tasks.is_empty() {
                debug!("no claimable jobs left, shutting down the pool");
                break;
            }

            trace!(?pause, in_flight = tasks.len(), "polling again");
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                Some(res) = tasks.join_next(), if !tasks.is_empty() => log_task_result(res),
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        debug!("shutdown sender dropped");
                        break;
                    }
                }
            }
        }

        info!(in_flight = tasks.len(), "worker pool stopping, waiting for running jobs");
        while let Some(res) = tasks.join_next().await {
            log_task_result(res);
        }
        info!("worker pool stopped");
    }

    // --- private helpers ---------------------------------------------------

    /// Claim until nothing is eligible. Returns the number of claims and
    /// whether the store answered without error.
    fn claim_and_spawn(&self, tasks: &mut JoinSet<()>) -> (usize, bool) {
        let caps = self.registry.caps();
        let mut claimed = 0;
        loop {
            match self.ctx.queue.claim_next(&caps) {
                Ok(Some(job)) => {
                    claimed += 1;
                    let span = info_span!(
                        "job",
                        job.id = job.id,
                        job.type = %job.job_type,
                        job.remote_id = %job.remote_id,
                        attempt = job.attempts,
                    );
                    let run = run_job(
                        self.ctx.clone(),
                        Arc::clone(&self.registry),
                        job,
                        Duration::from_secs(self.settings.heartbeat_secs.max(1)),
                        self.settings.seed_on_completion,
                    );
                    tasks.spawn(run.instrument(span));
                }
                Ok(None) => return (claimed, true),
                Err(e) => {
                    error!(error = %e, "failed to claim job");
                    return (claimed, false);
                }
            }
        }
    }

    fn sleep_duration_with_jitter(&self) -> Duration {
        let poll = Duration::from_millis(self.settings.poll_interval_ms);
        if self.settings.jitter_ms == 0 {
            return poll;
        }
        let jitter = rand::thread_rng().gen_range(0..=self.settings.jitter_ms);
        poll + Duration::from_millis(jitter)
    }

    fn backoff(&self, failures: u32) -> Duration {
        let base = Duration::from_millis(self.settings.poll_interval_ms.max(1));
        let factor = 2u32.saturating_pow(failures.min(16));
        base.saturating_mul(factor)
            .min(Duration::from_secs(self.settings.max_backoff_secs.max(1)))
    }
}

/// Run one claimed job to the end and report the outcome to the queue.
async fn run_job(
    ctx: WorkerContext,
    registry: Arc<WorkerRegistry>,
    job: Job,
    heartbeat: Duration,
    seed_on_completion: bool,
) {
    let Some(entry) = registry.get(&job.job_type) else {
        warn!("no worker registered for this job type, putting it back");
        if let Err(e) = ctx.queue.release(&job, UNKNOWN_TYPE_RETRY_SECS) {
            error!(error = %e, "failed to release job");
        }
        return;
    };

    debug!("running job");
    let mut worker = (entry.factory)(&ctx);
    let result = {
        let work = AssertUnwindSafe(worker.work(&ctx, &job)).catch_unwind();
        tokio::pin!(work);
        let mut ticker = tokio::time::interval(heartbeat);
        ticker.tick().await;
        loop {
            tokio::select! {
                res = &mut work => break res,
                _ = ticker.tick() => match ctx.queue.heartbeat(&job) {
                    Ok(true) => {}
                    Ok(false) => warn!("job claim lost while running"),
                    Err(e) => warn!(error = %e, "heartbeat failed"),
                },
            }
        }
    };

    let interval = recurring_interval(&entry, &job);
    let queued = match result {
        Ok(Ok(WorkOutcome::Finished)) => {
            debug!("job finished");
            ctx.queue.complete(&job, Some(interval))
        }
        Ok(Ok(WorkOutcome::Release { delay_secs })) => {
            debug!(delay_secs, "job released");
            ctx.queue.release(&job, delay_secs)
        }
        Ok(Err(e)) => {
            error!(error = %format!("{e:#}"), "job failed");
            ctx.queue.complete(&job, Some(interval))
        }
        Err(panic) => {
            error!(panic = %panic_message(panic.as_ref()), "worker panicked");
            ctx.queue.complete(&job, Some(interval))
        }
    };
    if let Err(e) = queued {
        error!(error = %e, "failed to record job outcome");
    }

    if seed_on_completion {
        if let Some(ensure) = entry.ensure {
            if let Err(e) = ctx
                .queue
                .enqueue_if_absent(&job.job_type, &ensure.remote_id, ensure.interval)
            {
                warn!(error = %e, "could not re-seed recurring job");
            }
        }
    }
}

/// Interval to reschedule a finished job with; 0 for one-shot jobs. The
/// worker's current ensure declaration wins over the interval stored on the
/// job row.
fn recurring_interval(entry: &RegistryEntry, job: &Job) -> u64 {
    match entry.ensure {
        Some(ref ensure) if ensure.remote_id == job.remote_id => ensure.interval,
        _ => job.interval,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn log_task_result(res: Result<(), JoinError>) {
    if let Err(e) = res {
        error!(error = %e, "job task aborted");
    }
}
