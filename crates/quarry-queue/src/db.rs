use rusqlite::Connection;

use crate::error::Result;

/// Initialise the queue schema in `conn`.
///
/// Creates the `jobs` table (idempotent), the partial unique index that
/// allows at most one *queued* row per `(job_type, remote_id)`, and an index
/// on `(status, not_before)` for the claim query.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            job_type      TEXT    NOT NULL,
            remote_id     TEXT    NOT NULL,
            details       TEXT    NOT NULL DEFAULT '{}',  -- JSON object
            interval_secs INTEGER NOT NULL DEFAULT 0,     -- 0 = one-shot
            status        TEXT    NOT NULL DEFAULT 'queued',
            not_before    INTEGER NOT NULL,               -- unix seconds
            claimed_at    INTEGER,
            heartbeat_at  INTEGER,
            attempts      INTEGER NOT NULL DEFAULT 0,
            created_at    INTEGER NOT NULL
        ) STRICT;

        CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_queued_identity
            ON jobs (job_type, remote_id) WHERE status = 'queued';

        CREATE INDEX IF NOT EXISTS idx_jobs_claimable
            ON jobs (status, not_before);
        ",
    )?;
    Ok(())
}
