use std::time::{Duration, Instant};

/// A one-shot deadline on the monotonic clock.
///
/// The event loops check it once per iteration after dispatch; it never drives the poller wait itself.
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    deadline: Instant,
}

impl Timer {
    pub fn new(after: Duration) -> Self {
        Self {
            deadline: Instant::now() + after,
        }
    }
    pub fn new_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }
    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
    /// Zero once expired.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}
