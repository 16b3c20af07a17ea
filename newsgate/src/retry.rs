use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use common::EngineConfig;

use crate::error::{EngineError, ProviderError};

/// Lowercase fragments that mark an untyped error as a rate limit / quota failure.
const TRANSIENT_SIGNATURES: &[&str] = &[
    "429",
    "quota",
    "exhausted",
    "rate limit",
    "too many requests",
];

/// Bounded exponential backoff around a single external call.
///
/// Only rate-limit class failures are retried: the wait before retry `n` (0-based) is
/// `base_delay * 2^n` plus a random jitter below `max_jitter`. Every other failure is
/// returned on the spot.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_jitter: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_jitter: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_jitter,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_jitter_ms),
        )
    }

    /// Retries without waiting. Used by tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Wait after failed attempt `attempt` (0-based), jitter excluded.
    pub fn backoff(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(Duration::MAX)
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
    }

    /// Run `call` until it succeeds, fails with a non-transient error, or runs out of attempts.
    pub async fn execute<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let err = match call().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !is_transient(&err) {
                return Err(EngineError::PermanentProvider {
                    operation: operation.to_string(),
                    source: err,
                });
            }

            attempt += 1;
            if attempt >= self.max_attempts {
                warn!(operation, attempts = attempt, error = %err, "rate limit persisted, giving up");
                return Err(EngineError::TransientProvider {
                    operation: operation.to_string(),
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = self.backoff(attempt - 1).saturating_add(self.jitter());
            warn!(
                operation,
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "rate limited, retrying after backoff"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Whether `err` belongs to the rate-limit / quota class.
///
/// A typed `ProviderError` decides when present; otherwise the rendered error chain is
/// matched against the known signatures.
pub fn is_transient(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        match cause.downcast_ref::<ProviderError>() {
            Some(ProviderError::RateLimited { .. }) => return true,
            Some(ProviderError::Malformed(_)) => return false,
            // Some providers report quota exhaustion with a 403; let the body decide.
            Some(ProviderError::Rejected { .. }) | None => {}
        }
    }
    let message = format!("{:#}", err).to_lowercase();
    TRANSIENT_SIGNATURES.iter().any(|sig| message.contains(sig))
}
