//! Timeout and retry-once wrappers for LLM calls.

use std::future::Future;
use std::time::Duration;

use rust_decimal::Decimal;
use tracing::warn;

use crate::error::LlmError;

/// Total attempts per call: the original plus one retry.
pub const MAX_ATTEMPTS: u32 = 2;

/// Outcome of one attempt, with whatever it cost even if it failed.
#[derive(Debug)]
pub struct Attempt<T> {
    pub cost: Decimal,
    pub result: Result<T, LlmError>,
}

impl<T> Attempt<T> {
    pub fn free(result: Result<T, LlmError>) -> Self {
        Self {
            cost: Decimal::ZERO,
            result,
        }
    }
}

/// Final outcome after retries.
#[derive(Debug)]
pub struct Retried<T> {
    pub result: Result<T, LlmError>,
    pub attempts: u32,
    /// Cost summed over every attempt.
    pub cost: Decimal,
}

/// Run `fut`, converting an elapsed deadline into `LlmError::Timeout`.
pub async fn with_timeout<T, Fut>(provider: &str, timeout: Duration, fut: Fut) -> Result<T, LlmError>
where
    Fut: Future<Output = Result<T, LlmError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(LlmError::Timeout {
            provider: provider.to_string(),
            timeout,
        }),
    }
}

/// Run `op`, retrying once after `backoff` when the first failure is transient.
pub async fn retry_once<T, F, Fut>(backoff: Duration, mut op: F) -> Retried<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let mut cost = Decimal::ZERO;
    let mut attempts = 0;

    loop {
        attempts += 1;
        let attempt = op().await;
        cost += attempt.cost;

        match attempt.result {
            Err(e) if attempts < MAX_ATTEMPTS && e.is_transient() => {
                warn!(attempt = attempts, error = %e, "LLM call failed, retrying once");
                if !backoff.is_zero() {
                    tokio::time::sleep(backoff).await;
                }
            }
            result => {
                return Retried {
                    result,
                    attempts,
                    cost,
                };
            }
        }
    }
}
