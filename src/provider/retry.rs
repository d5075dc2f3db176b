//! # Retry Combinator
//!
//! One place that wraps SDK calls against transient failures: capped
//! exponential backoff, at most ten attempts, delays doubling up to 16 s.
//! Every adapter call site goes through [`retry`]; nothing open-codes its
//! own loop.

use crate::constants;
use crate::errors::AgentResult;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: constants::MAX_RETRY_ATTEMPTS,
            base_delay: constants::RETRY_BASE_DELAY,
            max_delay: constants::RETRY_MAX_DELAY,
        }
    }
}

/// Run `op`, retrying `Transient` errors under `policy`. Any other error
/// kind propagates immediately.
pub async fn retry<T, F, Fut>(policy: RetryPolicy, mut op: F) -> AgentResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AgentResult<T>>,
{
    let mut delay = policy.base_delay;
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "transient failure, retrying: {err}"
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(policy.max_delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// [`retry`] with the agent-wide default policy.
pub async fn retry_default<T, F, Fut>(op: F) -> AgentResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AgentResult<T>>,
{
    retry(RetryPolicy::default(), op).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AgentError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry(fast_policy(5), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(AgentError::Transient("throttled".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn attempts_are_capped() {
        let calls = AtomicU32::new(0);
        let result: AgentResult<()> = retry(fast_policy(3), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AgentError::Transient("still down".into())) }
        })
        .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: AgentResult<()> = retry(fast_policy(5), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AgentError::Execution("plan failed".into())) }
        })
        .await;
        assert!(matches!(result, Err(AgentError::Execution(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
