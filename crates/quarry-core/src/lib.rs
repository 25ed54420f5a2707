//! `quarry-core`: configuration, time source and version helpers shared by
//! every quarry subsystem.

pub mod clock;
pub mod config;
pub mod error;
pub mod update;

pub use clock::Clock;
pub use config::QuarryConfig;
pub use error::{QuarryError, Result};
