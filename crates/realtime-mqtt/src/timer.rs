//! Deadlines owned by the connection task.

use std::time::Duration;

use tokio::time::Instant;

/// A single cancellable deadline. Arming replaces any previous deadline, so
/// at most one expiry is ever pending.
#[derive(Debug, Default)]
pub(crate) struct Timer {
    deadline: Option<Instant>,
}

impl Timer {
    pub(crate) fn arm(&mut self, after: Duration) {
        self.deadline = Some(Instant::now() + after);
    }

    pub(crate) fn cancel(&mut self) {
        self.deadline = None;
    }

    #[cfg(test)]
    pub(crate) fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Completes when the deadline passes; never completes while disarmed.
    /// The caller disarms or re-arms after it fires.
    pub(crate) async fn fired(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}

/// Capped exponential backoff with wall-clock jitter: `initial`, `2*initial`,
/// ... up to `max`, each plus up to `max_jitter`.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    max_jitter: Duration,
    attempt: u32,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, max: Duration, max_jitter: Duration) -> Self {
        Self {
            initial,
            max,
            max_jitter,
            attempt: 0,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }

    pub(crate) fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(30);
        self.attempt = self.attempt.saturating_add(1);
        let base = self.initial.saturating_mul(1u32 << exp).min(self.max);
        base + self.jitter()
    }

    fn jitter(&self) -> Duration {
        let bound = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        if bound == 0 {
            return Duration::ZERO;
        }
        // Subsecond nanos of the wall clock are random enough for spreading
        // reconnects.
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos();
        Duration::from_millis(u64::from(nanos) % bound)
    }
}
