//! Millisecond wall clock anchored to the tokio timer

use chrono::Utc;
use tokio::time::Instant;

/// Wall-clock milliseconds that advance with the tokio timer, so timestamps
/// stay consistent with `tokio::time::sleep` (including paused test time).
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    base_ms: i64,
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now().timestamp_millis())
    }

    pub fn starting_at(base_ms: i64) -> Self {
        Self {
            base_ms,
            origin: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> i64 {
        self.base_ms + self.origin.elapsed().as_millis() as i64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_follows_tokio_time() {
        let clock = Clock::starting_at(1_000);
        assert_eq!(clock.now_ms(), 1_000);

        tokio::time::advance(Duration::from_millis(2_500)).await;
        assert_eq!(clock.now_ms(), 3_500);
    }
}
