//! `quarry-notifications`: notices shown to users and admins.

pub mod db;
pub mod error;
pub mod store;
pub mod types;

pub use error::{NotificationError, Result};
pub use store::NotificationStore;
pub use types::{Notification, Recipient};
