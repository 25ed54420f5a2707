use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use quarry_core::Clock;
use rusqlite::{types::Type, Connection, OptionalExtension, TransactionBehavior};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::{
    db::init_db,
    error::Result,
    types::{Job, JobRef, JobStatus, NewJob},
};

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_MAX_BACKOFF_SECS: u64 = 60;

const JOB_COLUMNS: &str = "id, job_type, remote_id, details, interval_secs, status, not_before,
                           claimed_at, heartbeat_at, attempts, created_at";

/// Persisted job queue shared by every execution slot.
///
/// All coordination between slots happens through the `jobs` table: a claim
/// is a single conditional `UPDATE … RETURNING`, and later transitions of a
/// claimed row only apply while `(id, attempts)` still matches the claim
/// that was handed out.
pub struct JobQueue {
    conn: Mutex<Connection>,
    clock: Clock,
    max_attempts: u32,
    max_backoff_secs: u64,
}

impl JobQueue {
    /// Wrap a connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            clock: Clock::System,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_backoff_secs: DEFAULT_MAX_BACKOFF_SECS,
        })
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Limits applied when stale claims are recovered.
    pub fn with_limits(mut self, max_attempts: u32, max_backoff_secs: u64) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.max_backoff_secs = max_backoff_secs;
        self
    }

    /// Insert a job unless a queued job with the same `(type, remote_id)`
    /// exists. Either way the queued row is returned.
    pub fn enqueue_if_absent(&self, job_type: &str, remote_id: &str, interval: u64) -> Result<JobRef> {
        self.enqueue(NewJob::new(job_type, remote_id).interval(interval))
    }

    /// General form of [`Self::enqueue_if_absent`] with payload and delay.
    #[instrument(skip(self, job), fields(job.type = %job.job_type, job.remote_id = %job.remote_id))]
    pub fn enqueue(&self, job: NewJob) -> Result<JobRef> {
        let now = self.clock.now();
        let details = Value::Object(job.details).to_string();
        let not_before = now + job.delay as i64;

        let mut conn = self.conn();
        // IMMEDIATE so no other connection can claim the existing row between
        // the ignored insert and the lookup below.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO jobs
             (job_type, remote_id, details, interval_secs, status, not_before, attempts, created_at)
             VALUES (?1, ?2, ?3, ?4, 'queued', ?5, 0, ?6)",
            rusqlite::params![job.job_type, job.remote_id, details, job.interval as i64, not_before, now],
        )? == 1;

        let id = if inserted {
            tx.last_insert_rowid()
        } else {
            tx.query_row(
                "SELECT id FROM jobs WHERE job_type = ?1 AND remote_id = ?2 AND status = 'queued'",
                rusqlite::params![job.job_type, job.remote_id],
                |row| row.get(0),
            )?
        };
        tx.commit()?;

        if inserted {
            info!(job.id = id, "job queued");
        } else {
            debug!(job.id = id, "identical job already queued");
        }
        Ok(JobRef { id, inserted })
    }

    /// Atomically claim one eligible job whose type is listed in `caps` and
    /// whose type currently has fewer active (claimed or running) jobs than
    /// its cap. Returns `None` when nothing is eligible.
    pub fn claim_next(&self, caps: &BTreeMap<String, u32>) -> Result<Option<Job>> {
        if caps.is_empty() {
            return Ok(None);
        }
        let caps_json = serde_json::to_string(caps).unwrap_or_else(|_| "{}".to_string());
        let now = self.clock.now();

        let conn = self.conn();
        let job = conn
            .query_row(
                &format!(
                    "UPDATE jobs
                     SET status = 'claimed', claimed_at = ?2, heartbeat_at = ?2,
                         attempts = attempts + 1
                     WHERE id = (
                         SELECT j.id FROM jobs j
                         JOIN json_each(?1) AS caps ON caps.key = j.job_type
                         WHERE j.status = 'queued' AND j.not_before <= ?2
                           AND (SELECT COUNT(*) FROM jobs a
                                WHERE a.job_type = j.job_type AND a.status != 'queued')
                               < caps.value
                         ORDER BY j.not_before, j.id
                         LIMIT 1
                     )
                     AND status = 'queued'
                     RETURNING {JOB_COLUMNS}"
                ),
                rusqlite::params![caps_json, now],
                row_to_job,
            )
            .optional()?;

        if let Some(ref job) = job {
            debug!(job.id = job.id, job.type = %job.job_type, attempt = job.attempts, "job claimed");
        }
        Ok(job)
    }

    /// Refresh the heartbeat of a claimed job and mark it running.
    ///
    /// Returns false when the claim is no longer ours (job finished, deleted
    /// or reclaimed after going stale).
    pub fn heartbeat(&self, job: &Job) -> Result<bool> {
        let now = self.clock.now();
        let n = self.conn().execute(
            "UPDATE jobs SET heartbeat_at = ?1, status = 'running'
             WHERE id = ?2 AND attempts = ?3 AND status != 'queued'",
            rusqlite::params![now, job.id, job.attempts],
        )?;
        Ok(n == 1)
    }

    /// Finish a claimed job.
    ///
    /// With no reschedule (or 0) the row is deleted. Otherwise it becomes
    /// queued again, claimable from `now + reschedule_after`. If a queued
    /// job with the same identity was enqueued meanwhile, this row is
    /// deleted instead so that only one queued row exists.
    #[instrument(skip(self, job), fields(job.id = job.id, job.type = %job.job_type))]
    pub fn complete(&self, job: &Job, reschedule_after: Option<u64>) -> Result<()> {
        match reschedule_after.filter(|s| *s > 0) {
            None => {
                let n = self.conn().execute(
                    "DELETE FROM jobs WHERE id = ?1 AND attempts = ?2 AND status != 'queued'",
                    rusqlite::params![job.id, job.attempts],
                )?;
                if n == 0 {
                    debug!("completed job was no longer claimed by us");
                }
                Ok(())
            }
            Some(secs) => self.requeue(job, secs, true),
        }
    }

    /// Put a claimed job back in the queue, claimable again after `delay`
    /// seconds. The attempt count is kept.
    #[instrument(skip(self, job), fields(job.id = job.id, job.type = %job.job_type))]
    pub fn release(&self, job: &Job, delay: u64) -> Result<()> {
        self.requeue(job, delay, false)
    }

    /// Return claims whose heartbeat is older than `timeout` seconds to the
    /// queue (with backoff) or drop them once they used up their attempts.
    /// Returns the number of rows recovered or dropped.
    #[instrument(skip(self))]
    pub fn release_stale(&self, timeout: u64) -> Result<usize> {
        let now = self.clock.now();
        let cutoff = now - timeout as i64;

        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let stale: Vec<(i64, String, String, u32)> = {
            let mut stmt = tx.prepare(
                "SELECT id, job_type, remote_id, attempts FROM jobs
                 WHERE status != 'queued' AND heartbeat_at < ?1",
            )?;
            let rows = stmt.query_map([cutoff], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        for (id, job_type, remote_id, attempts) in &stale {
            if *attempts >= self.max_attempts {
                warn!(job.id = id, job.type = %job_type, attempts, "stale job exhausted its attempts, dropping it");
                tx.execute("DELETE FROM jobs WHERE id = ?1", [id])?;
                continue;
            }
            if queued_sibling_exists(&tx, *id, job_type, remote_id)? {
                debug!(job.id = id, "stale job already has a queued twin, dropping it");
                tx.execute("DELETE FROM jobs WHERE id = ?1", [id])?;
                continue;
            }
            let backoff = 2u64.saturating_pow(*attempts).min(self.max_backoff_secs.max(1));
            tx.execute(
                "UPDATE jobs SET status = 'queued', claimed_at = NULL, heartbeat_at = NULL,
                 not_before = ?1 WHERE id = ?2",
                rusqlite::params![now + backoff as i64, id],
            )?;
            info!(job.id = id, job.type = %job_type, backoff_secs = backoff, "stale job returned to queue");
        }
        tx.commit()?;
        Ok(stale.len())
    }

    pub fn get(&self, id: i64) -> Result<Option<Job>> {
        let job = self
            .conn()
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                [id],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// All jobs, optionally restricted to one type, oldest first.
    pub fn list(&self, job_type: Option<&str>) -> Result<Vec<Job>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE ?1 IS NULL OR job_type = ?1
             ORDER BY id"
        ))?;
        let jobs = stmt
            .query_map([job_type], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    pub fn count(&self, job_type: Option<&str>) -> Result<usize> {
        let n: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM jobs WHERE ?1 IS NULL OR job_type = ?1",
            [job_type],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// Number of claimed or running jobs of a type.
    pub fn count_active(&self, job_type: &str) -> Result<usize> {
        let n: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM jobs WHERE job_type = ?1 AND status != 'queued'",
            [job_type],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// Drop queued jobs scoped to `remote_id`, e.g. after its dataset was
    /// deleted. Claimed jobs are left to their workers.
    pub fn delete_queued_for(&self, remote_id: &str) -> Result<usize> {
        let n = self.conn().execute(
            "DELETE FROM jobs WHERE remote_id = ?1 AND status = 'queued'",
            [remote_id],
        )?;
        Ok(n)
    }

    // --- private helpers ---------------------------------------------------

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn requeue(&self, job: &Job, delay: u64, reset_attempts: bool) -> Result<()> {
        let not_before = self.clock.now() + delay as i64;

        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if queued_sibling_exists(&tx, job.id, &job.job_type, &job.remote_id)? {
            tx.execute(
                "DELETE FROM jobs WHERE id = ?1 AND attempts = ?2 AND status != 'queued'",
                rusqlite::params![job.id, job.attempts],
            )?;
            debug!("identical job already queued, dropping this one");
        } else {
            let n = tx.execute(
                "UPDATE jobs SET status = 'queued', claimed_at = NULL, heartbeat_at = NULL,
                 not_before = ?1,
                 attempts = CASE WHEN ?2 THEN 0 ELSE attempts END
                 WHERE id = ?3 AND attempts = ?4 AND status != 'queued'",
                rusqlite::params![not_before, reset_attempts, job.id, job.attempts],
            )?;
            if n == 0 {
                debug!("requeued job was no longer claimed by us");
            } else {
                debug!(not_before, "job requeued");
            }
        }
        tx.commit()?;
        Ok(())
    }
}

fn queued_sibling_exists(conn: &Connection, id: i64, job_type: &str, remote_id: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM jobs
             WHERE job_type = ?1 AND remote_id = ?2 AND status = 'queued' AND id != ?3",
            rusqlite::params![job_type, remote_id, id],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    Ok(exists)
}

/// Map a row (column order from `JOB_COLUMNS`) to a `Job`.
fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let details_json: String = row.get(3)?;
    let details: Map<String, Value> = serde_json::from_str(&details_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
    let status_str: String = row.get(5)?;
    let status: JobStatus = status_str
        .parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, e.into()))?;

    Ok(Job {
        id: row.get(0)?,
        job_type: row.get(1)?,
        remote_id: row.get(2)?,
        details,
        interval: row.get::<_, i64>(4)?.max(0) as u64,
        status,
        not_before: row.get(6)?,
        claimed_at: row.get(7)?,
        heartbeat_at: row.get(8)?,
        attempts: row.get(9)?,
        created_at: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GLOBAL_REMOTE_ID;

    const T0: i64 = 1_700_000_000;

    fn queue() -> (JobQueue, Clock) {
        let clock = Clock::manual(T0);
        let conn = Connection::open_in_memory().unwrap();
        let queue = JobQueue::new(conn).unwrap().with_clock(clock.clone()).with_limits(3, 60);
        (queue, clock)
    }

    fn caps(entries: &[(&str, u32)]) -> BTreeMap<String, u32> {
        entries.iter().map(|(t, n)| (t.to_string(), *n)).collect()
    }

    #[test]
    fn enqueue_twice_yields_one_row() {
        let (queue, _) = queue();
        let first = queue.enqueue_if_absent("expire-datasets", GLOBAL_REMOTE_ID, 300).unwrap();
        let second = queue.enqueue_if_absent("expire-datasets", GLOBAL_REMOTE_ID, 300).unwrap();

        assert!(first.inserted);
        assert!(!second.inserted);
        assert_eq!(first.id, second.id);
        assert_eq!(queue.count(Some("expire-datasets")).unwrap(), 1);
    }

    #[test]
    fn claimed_job_does_not_block_new_enqueue() {
        let (queue, _) = queue();
        queue.enqueue_if_absent("perspective", "abc", 0).unwrap();
        let claimed = queue.claim_next(&caps(&[("perspective", 1)])).unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Claimed);

        let again = queue.enqueue_if_absent("perspective", "abc", 0).unwrap();
        assert!(again.inserted);
        assert_eq!(queue.count(None).unwrap(), 2);
    }

    #[test]
    fn claims_respect_type_cap() {
        let (queue, _) = queue();
        for key in ["a", "b", "c", "d", "e"] {
            queue.enqueue_if_absent("perspective", key, 0).unwrap();
        }
        let caps = caps(&[("perspective", 2)]);

        let first = queue.claim_next(&caps).unwrap().unwrap();
        let _second = queue.claim_next(&caps).unwrap().unwrap();
        assert!(queue.claim_next(&caps).unwrap().is_none());
        assert_eq!(queue.count_active("perspective").unwrap(), 2);

        queue.complete(&first, None).unwrap();
        assert!(queue.claim_next(&caps).unwrap().is_some());
        assert!(queue.claim_next(&caps).unwrap().is_none());
        assert_eq!(queue.count(Some("perspective")).unwrap(), 4);
    }

    #[test]
    fn caps_are_per_type_and_unlisted_types_are_ignored() {
        let (queue, _) = queue();
        queue.enqueue_if_absent("a", "1", 0).unwrap();
        queue.enqueue_if_absent("a", "2", 0).unwrap();
        queue.enqueue_if_absent("b", "1", 0).unwrap();
        queue.enqueue_if_absent("unregistered", "1", 0).unwrap();
        let caps = caps(&[("a", 1), ("b", 1)]);

        let mut claimed: Vec<String> = Vec::new();
        while let Some(job) = queue.claim_next(&caps).unwrap() {
            claimed.push(job.job_type);
        }
        claimed.sort();
        assert_eq!(claimed, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn delayed_job_is_not_claimable_early() {
        let (queue, clock) = queue();
        queue.enqueue(NewJob::new("t", "x").delay(10)).unwrap();
        let caps = caps(&[("t", 1)]);

        assert!(queue.claim_next(&caps).unwrap().is_none());
        clock.advance(9);
        assert!(queue.claim_next(&caps).unwrap().is_none());
        clock.advance(1);
        assert!(queue.claim_next(&caps).unwrap().is_some());
    }

    #[test]
    fn recurring_job_is_next_eligible_after_interval() {
        let (queue, clock) = queue();
        queue.enqueue_if_absent("check-for-updates", "repo", 3600).unwrap();
        let caps = caps(&[("check-for-updates", 1)]);

        let job = queue.claim_next(&caps).unwrap().unwrap();
        queue.complete(&job, Some(job.interval)).unwrap();

        let row = queue.get(job.id).unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Queued);
        assert_eq!(row.not_before, T0 + 3600);
        assert_eq!(row.attempts, 0);

        clock.advance(3599);
        assert!(queue.claim_next(&caps).unwrap().is_none());
        clock.advance(1);
        assert_eq!(queue.claim_next(&caps).unwrap().unwrap().id, job.id);
    }

    #[test]
    fn completing_one_shot_deletes_row() {
        let (queue, _) = queue();
        queue.enqueue_if_absent("convert-json", "k", 0).unwrap();
        let job = queue.claim_next(&caps(&[("convert-json", 1)])).unwrap().unwrap();
        queue.complete(&job, None).unwrap();
        assert!(queue.get(job.id).unwrap().is_none());
    }

    #[test]
    fn reschedule_merges_into_newer_queued_twin() {
        let (queue, _) = queue();
        queue.enqueue_if_absent("expire-datasets", GLOBAL_REMOTE_ID, 300).unwrap();
        let job = queue.claim_next(&caps(&[("expire-datasets", 1)])).unwrap().unwrap();
        let twin = queue.enqueue_if_absent("expire-datasets", GLOBAL_REMOTE_ID, 300).unwrap();
        assert!(twin.inserted);

        queue.complete(&job, Some(300)).unwrap();
        let rows = queue.list(Some("expire-datasets")).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, twin.id);
    }

    #[test]
    fn release_keeps_attempts_and_delays() {
        let (queue, clock) = queue();
        queue.enqueue_if_absent("perspective", "child", 0).unwrap();
        let caps = caps(&[("perspective", 1)]);
        let job = queue.claim_next(&caps).unwrap().unwrap();
        queue.release(&job, 30).unwrap();

        let row = queue.get(job.id).unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Queued);
        assert_eq!(row.attempts, 1);
        clock.advance(29);
        assert!(queue.claim_next(&caps).unwrap().is_none());
        clock.advance(1);
        assert_eq!(queue.claim_next(&caps).unwrap().unwrap().attempts, 2);
    }

    #[test]
    fn stale_claims_return_to_queue_with_backoff() {
        let (queue, clock) = queue();
        queue.enqueue_if_absent("t", "x", 0).unwrap();
        let caps = caps(&[("t", 1)]);
        let job = queue.claim_next(&caps).unwrap().unwrap();

        clock.advance(100);
        assert_eq!(queue.release_stale(600).unwrap(), 0);
        assert!(queue.heartbeat(&job).unwrap());
        assert_eq!(queue.get(job.id).unwrap().unwrap().status, JobStatus::Running);

        clock.advance(601);
        assert_eq!(queue.release_stale(600).unwrap(), 1);
        let row = queue.get(job.id).unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Queued);
        assert_eq!(row.not_before, clock.now() + 2);
    }

    #[test]
    fn stale_claim_cannot_complete_after_reclaim() {
        let (queue, clock) = queue();
        queue.enqueue_if_absent("t", "x", 0).unwrap();
        let caps = caps(&[("t", 1)]);
        let first = queue.claim_next(&caps).unwrap().unwrap();

        clock.advance(700);
        queue.release_stale(600).unwrap();
        clock.advance(10);
        let second = queue.claim_next(&caps).unwrap().unwrap();
        assert_eq!(second.id, first.id);

        queue.complete(&first, None).unwrap();
        assert!(!queue.heartbeat(&first).unwrap());
        assert!(queue.get(first.id).unwrap().is_some());

        queue.complete(&second, None).unwrap();
        assert!(queue.get(first.id).unwrap().is_none());
    }

    #[test]
    fn stale_job_is_dropped_after_max_attempts() {
        let (queue, clock) = queue();
        queue.enqueue_if_absent("t", "x", 0).unwrap();
        let caps = caps(&[("t", 1)]);

        for _ in 0..3 {
            let job = queue.claim_next(&caps).unwrap().unwrap();
            assert!(job.attempts <= 3);
            clock.advance(1_000);
            assert_eq!(queue.release_stale(600).unwrap(), 1);
            clock.advance(100);
        }
        assert_eq!(queue.count(None).unwrap(), 0);
    }

    #[test]
    fn delete_queued_for_leaves_claimed_jobs() {
        let (queue, _) = queue();
        queue.enqueue_if_absent("a", "key", 0).unwrap();
        queue.enqueue_if_absent("b", "key", 0).unwrap();
        queue.claim_next(&caps(&[("a", 1)])).unwrap().unwrap();

        assert_eq!(queue.delete_queued_for("key").unwrap(), 1);
        assert_eq!(queue.count(None).unwrap(), 1);
    }

    #[test]
    fn details_roundtrip_through_claim() {
        let (queue, _) = queue();
        queue
            .enqueue(NewJob::new("t", "x").detail("label", "weekly scrape"))
            .unwrap();
        let job = queue.claim_next(&caps(&[("t", 1)])).unwrap().unwrap();
        assert_eq!(job.details["label"], "weekly scrape");
    }
}
