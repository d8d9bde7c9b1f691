use std::{future::Future, time::Duration};

use rand::Rng;

use super::KmsProvider;
use crate::{error::Result, runtime, trace::KMS_TRACING_EVENT_TARGET};

/// Label attached to KMS errors that may succeed if the request is sent again.
pub(crate) const TRANSIENT_KMS_ERROR: &str = "TransientKmsError";

/// How failed KMS requests are retried. Only network failures and HTTP statuses that indicate a
/// temporary condition (408, 429 and 5xx) are retried; authentication failures never are.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one. Zero is treated as one.
    pub max_attempts: u32,

    /// Delay before the first retry. Each later retry doubles it, up to `max_backoff`.
    pub initial_backoff: Duration,

    /// Upper bound on the delay between attempts.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Sets the total number of attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the backoff bounds.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// The delay before retry number `retry` (starting at 1), with up to 50% jitter removed.
    fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        let full = self
            .initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff);
        full.mul_f64(rand::rng().random_range(0.5..=1.0))
    }

    pub(crate) async fn run<T, F, Fut>(&self, provider: &KmsProvider, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut tried = 1;
        loop {
            match attempt().await {
                Err(error) if error.contains_label(TRANSIENT_KMS_ERROR) && tried < max_attempts => {
                    let delay = self.backoff(tried);
                    tracing::debug!(
                        target: KMS_TRACING_EVENT_TARGET,
                        %provider,
                        attempt = tried,
                        ?delay,
                        %error,
                        "Retrying KMS request",
                    );
                    runtime::delay_for(delay).await;
                    tried += 1;
                }
                result => return result,
            }
        }
    }
}
