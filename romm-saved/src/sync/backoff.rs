use std::future::Future;
use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    factor: u64,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self {
            base,
            max,
            factor: 2,
            jitter,
        }
    }

    pub fn with_factor(mut self, factor: u64) -> Self {
        self.factor = factor.max(1);
        self
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let ceiling = self.ceiling(attempt);
        if self.jitter {
            let ceiling_ms = ceiling.as_millis().min(u128::from(u64::MAX)) as u64;
            Duration::from_millis(rng.gen_range(0..=ceiling_ms))
        } else {
            ceiling
        }
    }

    /// Un-jittered delay for `attempt`: `base * factor^attempt`, capped at `max`.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let multiplier = self.factor.saturating_pow(attempt.min(32));
        Duration::from_millis(base_ms.saturating_mul(multiplier).min(max_ms))
    }
}

/// Bounded retry for remote calls that may fail transiently.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    attempts: u32,
    backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Backoff) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Three attempts with `base * 3^attempt` waits between them.
    pub fn listing(base: Duration) -> Self {
        Self::new(
            3,
            Backoff::new(base, base.saturating_mul(9), false).with_factor(3),
        )
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub async fn run<T, E, F, Fut>(
        &self,
        mut operation: F,
        retryable: impl Fn(&E) -> bool,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0u32;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt + 1 < self.attempts && retryable(&err) => {
                    let delay = self.backoff.delay(attempt);
                    tracing::debug!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::listing(Duration::from_secs(1))
    }
}
