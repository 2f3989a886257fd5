use core::time::Duration;

/// Bounded retry for storage calls.
///
/// The participant is waiting synchronously for an answer, so a flaky disk
/// gets a few quick attempts and then the failure is surfaced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Values below 1 behave as 1.
    pub attempts: u32,
    /// Sleep between attempts; doubled after each failure.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(25),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub const fn once() -> Self {
        Self {
            attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    /// Runs `op` until it succeeds or the attempts are used up, returning the
    /// last error.
    pub fn run<T, E>(&self, mut op: impl FnMut() -> Result<T, E>) -> Result<T, E>
    where
        E: core::fmt::Display,
    {
        let attempts = self.attempts.max(1);
        let mut backoff = self.backoff;
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= attempts => return Err(e),
                Err(_e) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(attempt, "storage operation failed, retrying: {_e}");
                    if !backoff.is_zero() {
                        std::thread::sleep(backoff);
                        backoff = backoff.saturating_mul(2);
                    }
                    attempt += 1;
                }
            }
        }
    }
}
