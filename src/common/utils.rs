//! Utility functions for shardkv

use std::time::Duration;

/// Generate a process-unique client identity.
///
/// Identities only need to be unique, not secret; 62 random bits keep the
/// chance of two clients colliding negligible.
pub fn random_client_id() -> u64 {
    rand::random::<u64>() >> 2
}

/// Capped exponential back-off
#[derive(Debug, Clone)]
pub struct Backoff {
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            max,
            current: initial,
        }
    }

    /// Delay to wait before the next attempt; doubles up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }
}
