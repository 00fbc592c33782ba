//! Retry pacing for calls against the agent API.
use std::time::Duration;

/// A doubling delay sequence with a ceiling: yields `first`, then twice the
/// previous value on each retry, never exceeding `cap`.
pub(crate) struct RetryBackoff {
    delay: Duration,
    cap: Duration,
}

impl RetryBackoff {
    pub(crate) fn new(first: Duration, cap: Duration) -> Self {
        Self { delay: first, cap }
    }

    /// The delay to apply before the upcoming retry. Doubles the delay the
    /// following call will return, up to the cap.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let current = self.delay;
        self.delay = self.delay.saturating_mul(2).min(self.cap);
        current
    }

    /// Sleep out the current delay.
    pub(crate) async fn wait(&mut self) {
        tokio::time::sleep(self.next_delay()).await
    }
}
