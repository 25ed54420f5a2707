//! Expiration engine: deletes datasets, users and notifications whose time
//! is up.

use anyhow::Result;
use async_trait::async_trait;
use chrono::DateTime;
use quarry_notifications::Recipient;
use quarry_queue::Job;
use tracing::{error, info, warn};

use crate::context::WorkerContext;
use crate::worker::{EnsureJob, WorkOutcome, Worker};

pub const EXPIRE_TYPE: &str = "expire-datasets";

/// Every account expiry warning starts with this.
pub const EXPIRY_WARNING_PREFIX: &str = "WARNING: This account will be deleted at";

const DAY_SECS: i64 = 86_400;

/// What one expiration run removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Datasets deleted for exceeding their datasource's timeout, subtrees
    /// included.
    pub datasource_ttl: usize,
    /// Datasets deleted because their own `expires_after` passed.
    pub explicit: usize,
    pub users_deleted: usize,
    /// Expiry warnings newly added.
    pub users_warned: usize,
    pub notifications: usize,
}

pub struct ExpireDatasets {
    interval: u64,
}

impl ExpireDatasets {
    pub fn from_context(ctx: &WorkerContext) -> Self {
        Self {
            interval: ctx.config.expiration.interval_secs,
        }
    }

    /// Run every sweep once. A failing sweep is logged and the others still
    /// run.
    pub fn sweep(ctx: &WorkerContext) -> SweepReport {
        let now = ctx.clock.now();
        let datasource_ttl = logged("datasource timeout", expire_by_datasource(ctx, now));
        let explicit = logged("explicit expiry", expire_explicit(ctx, now));
        let (users_deleted, users_warned) = logged("user expiry", expire_users(ctx, now));
        let notifications = logged("notification expiry", expire_notifications(ctx));
        SweepReport {
            datasource_ttl,
            explicit,
            users_deleted,
            users_warned,
            notifications,
        }
    }
}

#[async_trait]
impl Worker for ExpireDatasets {
    fn job_type(&self) -> &'static str {
        EXPIRE_TYPE
    }

    fn ensure_job(&self) -> Option<EnsureJob> {
        Some(EnsureJob {
            remote_id: "localhost".to_string(),
            interval: self.interval,
        })
    }

    async fn work(&mut self, ctx: &WorkerContext, _job: &Job) -> Result<WorkOutcome> {
        let report = Self::sweep(ctx);
        info!(?report, "expiration sweep done");
        Ok(WorkOutcome::Finished)
    }
}

fn logged<T: Default>(sweep: &str, result: Result<T>) -> T {
    result.unwrap_or_else(|e| {
        error!(sweep, error = %format!("{e:#}"), "expiration sweep failed");
        T::default()
    })
}

/// Top-level datasets older than their datasource's timeout, unless kept.
fn expire_by_datasource(ctx: &WorkerContext, now: i64) -> Result<usize> {
    let mut deleted = 0;
    for datasource in ctx.config.datasources.keys() {
        let Some(timeout) = ctx.config.datasource_timeout(datasource) else {
            continue;
        };
        let cutoff = now.saturating_sub(i64::try_from(timeout).unwrap_or(i64::MAX));
        for dataset in ctx.datasets.expired_for_datasource(datasource, cutoff)? {
            info!(%datasource, dataset.key = %dataset.key, "deleting dataset (expired per datasource timeout)");
            deleted += ctx.delete_dataset(&dataset.key)?;
        }
    }
    Ok(deleted)
}

fn expire_explicit(ctx: &WorkerContext, now: i64) -> Result<usize> {
    let mut deleted = 0;
    for dataset in ctx.datasets.explicitly_expired(now)? {
        info!(
            datasource = dataset.datasource().unwrap_or("unknown"),
            dataset.key = %dataset.key,
            "deleting dataset (expiration date passed)"
        );
        deleted += ctx.delete_dataset(&dataset.key)?;
    }
    Ok(deleted)
}

/// Deletes expired accounts and warns those expiring soon. Returns
/// `(deleted, warned)`.
fn expire_users(ctx: &WorkerContext, now: i64) -> Result<(usize, usize)> {
    let warn_within = ctx.config.expiration.warning_days.saturating_mul(DAY_SECS);
    let (mut deleted, mut warned) = (0, 0);
    for user in ctx.users.with_delete_after()? {
        let expires_at = match user.delete_after() {
            None => continue,
            Some(Ok(at)) => at.timestamp(),
            Some(Err(e)) => {
                warn!(user = %user.name, error = %e, "user has invalid expiration date, skipping");
                continue;
            }
        };

        let recipient = Recipient::user(&user.name);
        if expires_at < now {
            info!(user = %user.name, "user expired, deleting user and datasets");
            match ctx.delete_user(&user.name) {
                Ok(_) => deleted += 1,
                Err(e) => error!(user = %user.name, error = %format!("{e:#}"), "could not delete expired user"),
            }
        } else if expires_at - now < warn_within {
            let added = ctx.notifications.replace_matching(
                &recipient,
                EXPIRY_WARNING_PREFIX,
                &expiry_warning(expires_at),
                false,
                Some(expires_at),
            )?;
            if added {
                warned += 1;
            }
        } else {
            // Expiry was pushed back out of the warning window.
            ctx.notifications.delete_matching(&recipient, EXPIRY_WARNING_PREFIX)?;
        }
    }
    Ok((deleted, warned))
}

fn expire_notifications(ctx: &WorkerContext) -> Result<usize> {
    Ok(ctx.notifications.expire()?)
}

fn expiry_warning(expires_at: i64) -> String {
    let when = DateTime::from_timestamp(expires_at, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| expires_at.to_string());
    format!("{EXPIRY_WARNING_PREFIX} {when}. Make sure to back up your data before then.")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warning_names_the_deadline() {
        assert_eq!(
            expiry_warning(1_709_251_200),
            "WARNING: This account will be deleted at 2024-03-01 00:00 UTC. Make sure to back up your data before then."
        );
    }

    #[test]
    fn failed_sweeps_count_as_zero() {
        assert_eq!(logged::<usize>("test", Err(anyhow::anyhow!("boom"))), 0);
        assert_eq!(logged("test", Ok(3usize)), 3);
    }
}
