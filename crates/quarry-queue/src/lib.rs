//! `quarry-queue`: persisted job queue with capped, atomic claims.
//!
//! # Overview
//!
//! Jobs live in a SQLite `jobs` table and are identified by
//! `(job_type, remote_id)`. At most one *queued* row exists per identity;
//! enqueueing an identity that is already queued returns the existing row.
//!
//! Execution slots call [`JobQueue::claim_next`] with a map of
//! `job_type -> max concurrent`. The claim is a single `UPDATE … RETURNING`,
//! so two slots never receive the same job and a type never exceeds its cap.
//!
//! # Lifecycle
//!
//! | From      | Operation        | To                                   |
//! |-----------|------------------|--------------------------------------|
//! | queued    | `claim_next`     | claimed                              |
//! | claimed   | `heartbeat`      | running                              |
//! | claimed/running | `complete` | deleted, or queued at `now + interval` |
//! | claimed/running | `release`  | queued at `now + delay`              |
//! | stale claim | `release_stale` | queued with backoff, or dropped    |

pub mod db;
pub mod error;
pub mod queue;
pub mod types;

pub use error::{QueueError, Result};
pub use queue::JobQueue;
pub use types::{Job, JobRef, JobStatus, NewJob, GLOBAL_REMOTE_ID};
