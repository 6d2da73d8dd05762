// Copyright © Verilayer Foundation
// SPDX-License-Identifier: Apache-2.0

//! Exponential-backoff retry engine used by every external call in the
//! aggregator.
//!
//! Callers return [`RetryError::Permanent`] to stop retrying immediately;
//! every other failure is assumed transient and retried on the schedule of
//! the supplied [`RetryParams`]. The sleep schedule comes from the `backoff`
//! crate with jitter disabled, so retry timing is deterministic.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

/// Outcome classification for a retried operation.
///
/// There is no explicit transient type: everything that is not `Permanent`
/// is treated as transient, mirroring the "retry unless told otherwise"
/// posture of the chain-facing code.
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error(transparent)]
    Transient(anyhow::Error),
    #[error(transparent)]
    Permanent(anyhow::Error),
}

impl RetryError {
    pub fn transient(error: impl Into<anyhow::Error>) -> Self {
        Self::Transient(error.into())
    }

    pub fn permanent(error: impl Into<anyhow::Error>) -> Self {
        Self::Permanent(error.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    pub fn into_inner(self) -> anyhow::Error {
        match self {
            Self::Transient(e) | Self::Permanent(e) => e,
        }
    }
}

/// Backoff schedule for one family of calls.
///
/// A `num_retries` of zero means unbounded attempts; a `max_elapsed_time`
/// of `None` means no wall-clock bound. Sleep `k` lasts
/// `min(initial_interval * multiplier^k, max_interval)`.
#[derive(Clone, Debug)]
pub struct RetryParams {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_elapsed_time: Option<Duration>,
    pub multiplier: f64,
    pub num_retries: u64,
}

impl RetryParams {
    /// View calls, WS subscribe and log filters: 1 s, 2 s, 4 s.
    pub fn eth_call() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            max_elapsed_time: None,
            multiplier: 2.0,
            num_retries: 3,
        }
    }

    /// On-chain state reads whose freshness is bound to block cadence:
    /// 12 s (one block), 24 s, 48 s.
    pub fn chain() -> Self {
        Self {
            initial_interval: Duration::from_secs(12),
            max_interval: Duration::from_secs(120),
            max_elapsed_time: None,
            multiplier: 2.0,
            num_retries: 3,
        }
    }

    /// Operator-facing RPC work: a constant 10 s interval, 10 attempts.
    pub fn network() -> Self {
        Self {
            initial_interval: Duration::from_secs(10),
            max_interval: Duration::from_secs(10),
            max_elapsed_time: None,
            multiplier: 1.0,
            num_retries: 10,
        }
    }

    /// Receipt polling, bounded only by the caller's wall clock.
    pub fn wait_for_receipt(timeout: Duration) -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(2),
            max_elapsed_time: Some(timeout),
            multiplier: 2.0,
            num_retries: 0,
        }
    }

    /// Aggregated-response submission. Unbounded: the receipt wait inside
    /// each attempt is the real clock.
    pub fn respond_to_task() -> Self {
        Self {
            initial_interval: Duration::from_secs(12),
            max_interval: Duration::from_millis(500),
            max_elapsed_time: None,
            multiplier: 2.0,
            num_retries: 0,
        }
    }

    fn backoff_policy(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_interval,
            initial_interval: self.initial_interval,
            randomization_factor: 0.0,
            multiplier: self.multiplier,
            max_interval: self.max_interval,
            max_elapsed_time: self.max_elapsed_time,
            ..ExponentialBackoff::default()
        }
    }
}

impl Default for RetryParams {
    fn default() -> Self {
        Self::eth_call()
    }
}

/// Runs `op` until it succeeds, fails permanently, or the retry budget of
/// `params` is exhausted.
///
/// A panic inside an attempt is captured and treated as a transient failure
/// of that attempt, so a misbehaving callee cannot take the caller down.
pub async fn retry_with_data<T, F, Fut>(mut op: F, params: &RetryParams) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RetryError>>,
{
    let mut policy = params.backoff_policy();
    let mut attempts: u64 = 0;
    loop {
        attempts += 1;
        let error = match AssertUnwindSafe(op()).catch_unwind().await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(RetryError::Permanent(e))) => return Err(RetryError::Permanent(e)),
            Ok(Err(RetryError::Transient(e))) => RetryError::Transient(e),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(message, "Retried operation panicked");
                RetryError::Transient(anyhow::anyhow!("operation panicked: {message}"))
            }
        };
        if params.num_retries > 0 && attempts >= params.num_retries {
            return Err(error);
        }
        match policy.next_backoff() {
            Some(delay) => tokio::time::sleep(delay).await,
            // The policy only stops when max_elapsed_time has passed.
            None => return Err(error),
        }
    }
}

/// [`retry_with_data`] for operations without a return value.
pub async fn retry<F, Fut>(op: F, params: &RetryParams) -> Result<(), RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), RetryError>>,
{
    retry_with_data(op, params).await
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_ok};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn fast_params(num_retries: u64) -> RetryParams {
        RetryParams {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(4),
            max_elapsed_time: None,
            multiplier: 2.0,
            num_retries,
        }
    }

    /// Fails with a transient error `failures` times, then succeeds.
    fn flaky(failures: u64) -> (Arc<AtomicU64>, impl FnMut() -> futures::future::BoxFuture<'static, Result<u64, RetryError>>) {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let op = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < failures {
                    Err(RetryError::transient(anyhow::anyhow!("transient error!")))
                } else {
                    Ok(n)
                }
            }
            .boxed()
        };
        (calls, op)
    }

    #[tokio::test]
    async fn succeeds_first_try() {
        let (calls, op) = flaky(0);
        let result = retry_with_data(op, &fast_params(3)).await;
        assert_ok!(&result);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_within_retry_budget() {
        let (calls, op) = flaky(2);
        let result = retry_with_data(op, &fast_params(3)).await;
        assert_ok!(&result);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fails_when_budget_exhausted() {
        let (calls, op) = flaky(3);
        let result = retry_with_data(op, &fast_params(3)).await;
        assert_err!(&result);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unbounded_retries_eventually_succeed() {
        let (calls, op) = flaky(17);
        let result = retry_with_data(op, &fast_params(0)).await;
        assert_ok!(&result);
        assert_eq!(calls.load(Ordering::SeqCst), 18);
    }

    #[tokio::test]
    async fn permanent_error_short_circuits() {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let result = retry_with_data(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(RetryError::permanent(anyhow::anyhow!("permanent error!"))) }
            },
            &fast_params(10),
        )
        .await;
        let error = assert_err!(result);
        assert!(error.is_permanent());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panic_is_captured_as_transient() {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let result = retry_with_data(
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        panic!("callee exploded");
                    }
                    Ok(n)
                }
            },
            &fast_params(3),
        )
        .await;
        assert_eq!(assert_ok!(result), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    #[allow(unreachable_code)]
    async fn panic_surfaces_after_budget() {
        let result = retry_with_data(
            || async {
                panic!("always");
                Ok::<u64, RetryError>(0)
            },
            &fast_params(2),
        )
        .await;
        let error = assert_err!(result);
        assert!(!error.is_permanent());
        assert!(error.to_string().contains("panicked"));
    }

    #[tokio::test]
    async fn max_elapsed_time_bounds_unbounded_retries() {
        let params = RetryParams {
            initial_interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(5),
            max_elapsed_time: Some(Duration::from_millis(40)),
            multiplier: 1.0,
            num_retries: 0,
        };
        let (calls, op) = flaky(u64::MAX);
        let result = retry_with_data(op, &params).await;
        assert_err!(&result);
        // At 5 ms per sleep, the 40 ms budget allows only a handful of
        // attempts before the policy stops.
        assert!(calls.load(Ordering::SeqCst) < 20);
    }

    #[tokio::test]
    async fn preset_schedules_are_finite_where_specified() {
        let params = RetryParams::eth_call();
        assert_eq!(params.num_retries, 3);
        let params = RetryParams::network();
        assert_eq!(params.num_retries, 10);
        assert_eq!(params.initial_interval, params.max_interval);
        let params = RetryParams::wait_for_receipt(Duration::from_secs(36));
        assert_eq!(params.num_retries, 0);
        assert_eq!(params.max_elapsed_time, Some(Duration::from_secs(36)));
    }
}
