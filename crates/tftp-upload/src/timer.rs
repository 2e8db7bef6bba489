use std::time::Duration;
use tokio::time::Instant;

/// Outcome of a retransmission timer firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Resend and keep going; carries the cumulative retry count.
    Retry(u32),
    /// The retry budget is spent.
    Exhausted(u32),
}

/// Single re-armable countdown of a transfer.
///
/// The retry counter is cumulative over the data phase and is never
/// reset by progress. Only the hold-open phase starts a fresh count.
#[derive(Debug, Clone)]
pub struct RetransmitTimer {
    interval: Duration,
    deadline: Option<Instant>,
    retries: u32,
    max_retries: u32,
}

impl RetransmitTimer {
    pub fn new(interval: Duration, max_retries: u32) -> Self {
        Self {
            interval,
            deadline: None,
            retries: 0,
            max_retries,
        }
    }

    pub fn arm(&mut self) {
        self.deadline = Some(Instant::now() + self.interval);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Start a fresh retry count without touching the deadline.
    pub fn reset_retries(&mut self) {
        self.retries = 0;
    }

    /// Count one retransmission against the budget.
    pub fn record_retry(&mut self) -> Expiry {
        self.deadline = None;
        self.retries = self.retries.saturating_add(1);
        if self.retries > self.max_retries {
            Expiry::Exhausted(self.retries)
        } else {
            Expiry::Retry(self.retries)
        }
    }
}
