use std::time::Duration;
use tokio::time::{sleep_until, Instant};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Single-shot keepalive deadline owned by one session.
///
/// The timer never repeats on its own: whoever observes a firing writes a
/// frame, and writing any frame rearms the deadline through `reset`.
#[derive(Debug)]
pub struct HeartbeatTimer {
    interval: Duration,
    deadline: Option<Instant>,
}

impl HeartbeatTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            deadline: None,
        }
    }

    pub fn start(&mut self) {
        self.deadline = Some(Instant::now() + self.interval);
    }

    pub fn reset(&mut self) {
        self.cancel();
        self.start();
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Resolves when the pending deadline passes; pends forever when cancelled.
    pub async fn fired(&self) {
        match self.deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    }
}
