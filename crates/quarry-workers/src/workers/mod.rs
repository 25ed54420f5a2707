//! Recurring maintenance workers.

pub mod check_updates;
pub mod expire;

pub use check_updates::{GithubReleases, Release, ReleaseSource, UpdateChecker, CHECK_UPDATES_TYPE, UPDATE_NOTICE_PREFIX};
pub use expire::{ExpireDatasets, SweepReport, EXPIRE_TYPE, EXPIRY_WARNING_PREFIX};
