use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::Utc;

/// Source of "now" for every store and sweep, in unix seconds (UTC).
///
/// `System` reads the wall clock. `Manual` holds a shared instant that tests
/// move forward explicitly; clones share the same instant.
#[derive(Debug, Clone, Default)]
pub enum Clock {
    #[default]
    System,
    Manual(Arc<AtomicI64>),
}

impl Clock {
    pub fn manual(start: i64) -> Self {
        Clock::Manual(Arc::new(AtomicI64::new(start)))
    }

    pub fn now(&self) -> i64 {
        match self {
            Clock::System => Utc::now().timestamp(),
            Clock::Manual(at) => at.load(Ordering::SeqCst),
        }
    }

    /// Move a manual clock forward. No-op on the system clock.
    pub fn advance(&self, secs: i64) {
        if let Clock::Manual(at) = self {
            at.fetch_add(secs, Ordering::SeqCst);
        }
    }

    /// Set a manual clock. No-op on the system clock.
    pub fn set(&self, at_secs: i64) {
        if let Clock::Manual(at) = self {
            at.store(at_secs, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clones_share_time() {
        let clock = Clock::manual(1_000);
        let other = clock.clone();
        clock.advance(60);
        assert_eq!(other.now(), 1_060);
        other.set(5);
        assert_eq!(clock.now(), 5);
    }

    #[test]
    fn system_clock_ignores_advance() {
        let clock = Clock::System;
        let before = clock.now();
        clock.advance(1_000_000);
        assert!(clock.now() - before < 10);
    }
}
