//! `quarry-users`: user accounts and their `delete-after` expiry.

pub mod db;
pub mod error;
pub mod store;
pub mod types;

pub use error::{Result, UserError};
pub use store::UserStore;
pub use types::{DeleteAfter, User, DELETE_AFTER};
