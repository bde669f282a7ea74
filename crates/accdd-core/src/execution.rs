//! Call controls for external collaborators: per-attempt timeout, bounded
//! retry with exponential backoff, and cooperative cancellation.
//!
//! Every call that leaves the process (sandbox, agent, auditors, QA,
//! integrator) goes through [`call_with_controls`]. Only errors that report
//! themselves as transient are retried; timeouts and fatal errors surface
//! immediately.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::warn;

/// Error returned by an external call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    /// Network blip, rate limit, busy backend. Safe to retry.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("{0}")]
    Fatal(String),

    #[error("timed out after {limit_ms}ms")]
    Timeout { limit_ms: u64 },

    #[error("cancelled")]
    Cancelled,
}

/// Errors that can tell the retry loop whether another attempt may succeed.
pub trait Retryable: From<CallError> {
    fn is_transient(&self) -> bool;
}

impl Retryable for CallError {
    fn is_transient(&self) -> bool {
        matches!(self, CallError::Transient(_))
    }
}

/// Timeout and retry budget of one kind of call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallPolicy {
    /// Maximum wall-clock time for a single attempt (milliseconds).
    pub timeout_ms: u64,
    /// Maximum number of retries (0 = run once).
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries (milliseconds).
    pub backoff_base_ms: u64,
}

impl CallPolicy {
    pub fn once(timeout: Duration) -> Self {
        Self {
            timeout_ms: timeout.as_millis() as u64,
            max_retries: 0,
            backoff_base_ms: 0,
        }
    }

    pub fn with_retries(mut self, max_retries: u32, backoff_base_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.backoff_base_ms = backoff_base_ms;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << (attempt.saturating_sub(1)).min(16);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_retries: 2,
            backoff_base_ms: 500,
        }
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Receiving side of a cancellation flag. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: Option<watch::Receiver<bool>>,
}

/// Sending side of a cancellation flag.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn channel() -> (CancelHandle, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (
            CancelHandle { tx: Arc::new(tx) },
            CancelSignal { rx: Some(rx) },
        )
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Resolves once cancellation is requested. Pending forever otherwise.
    pub async fn cancelled(&self) {
        let Some(rx) = &self.rx else {
            return std::future::pending().await;
        };
        let mut rx = rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            // Sender dropped without cancelling.
            std::future::pending::<()>().await;
        }
    }
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

// ---------------------------------------------------------------------------
// call_with_controls
// ---------------------------------------------------------------------------

/// Run `call` under `policy`, retrying transient failures with exponential
/// backoff. Cancellation interrupts both an in-flight attempt and a backoff
/// sleep.
pub async fn call_with_controls<T, E, F, Fut>(
    op: &str,
    policy: &CallPolicy,
    cancel: &CancelSignal,
    call: F,
) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_retries + 1;
    let mut attempt = 1;

    loop {
        if cancel.is_cancelled() {
            return Err(CallError::Cancelled.into());
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CallError::Cancelled.into()),
            r = tokio::time::timeout(policy.timeout(), call()) => r,
        };

        match result {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) if err.is_transient() && attempt < max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(
                    op,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(CallError::Cancelled.into()),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Ok(Err(err)) => return Err(err),
            Err(_elapsed) => {
                return Err(CallError::Timeout {
                    limit_ms: policy.timeout_ms,
                }
                .into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(timeout_ms: u64, max_retries: u32) -> CallPolicy {
        CallPolicy {
            timeout_ms,
            max_retries,
            backoff_base_ms: 10,
        }
    }

    #[test]
    fn test_backoff_doubles() {
        let p = CallPolicy {
            timeout_ms: 1,
            max_retries: 5,
            backoff_base_ms: 100,
        };
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let calls = &AtomicU32::new(0);
        let out: Result<u32, CallError> =
            call_with_controls("op", &policy(1000, 2), &CancelSignal::never(), move || async move {
                calls.fetch_add(1, Ordering::Relaxed);
                Ok(7)
            })
            .await;
        assert_eq!(out.unwrap(), 7);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_transient_retried_then_succeeds() {
        let calls = &AtomicU32::new(0);
        let out: Result<&str, CallError> =
            call_with_controls("op", &policy(1000, 2), &CancelSignal::never(), move || async move {
                if calls.fetch_add(1, Ordering::Relaxed) < 2 {
                    Err(CallError::Transient("busy".into()))
                } else {
                    Ok("ok")
                }
            })
            .await;
        assert_eq!(out.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let calls = &AtomicU32::new(0);
        let out: Result<(), CallError> =
            call_with_controls("op", &policy(1000, 1), &CancelSignal::never(), move || async move {
                calls.fetch_add(1, Ordering::Relaxed);
                Err(CallError::Transient("busy".into()))
            })
            .await;
        assert_eq!(out.unwrap_err(), CallError::Transient("busy".into()));
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_fatal_not_retried() {
        let calls = &AtomicU32::new(0);
        let out: Result<(), CallError> =
            call_with_controls("op", &policy(1000, 3), &CancelSignal::never(), move || async move {
                calls.fetch_add(1, Ordering::Relaxed);
                Err(CallError::Fatal("bad request".into()))
            })
            .await;
        assert!(matches!(out, Err(CallError::Fatal(_))));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_not_retried() {
        let calls = &AtomicU32::new(0);
        let out: Result<(), CallError> =
            call_with_controls("op", &policy(50, 3), &CancelSignal::never(), move || async move {
                calls.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;
        assert_eq!(out.unwrap_err(), CallError::Timeout { limit_ms: 50 });
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_inflight_call() {
        let (handle, signal) = CancelSignal::channel();
        let task = tokio::spawn(async move {
            call_with_controls::<(), CallError, _, _>("op", &policy(60_000, 0), &signal, move || async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
        assert_eq!(task.await.unwrap().unwrap_err(), CallError::Cancelled);
    }

    #[tokio::test]
    async fn test_already_cancelled_skips_call() {
        let (handle, signal) = CancelSignal::channel();
        handle.cancel();
        let calls = &AtomicU32::new(0);
        let out: Result<(), CallError> =
            call_with_controls("op", &policy(1000, 0), &signal, move || async move {
                calls.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
            .await;
        assert_eq!(out.unwrap_err(), CallError::Cancelled);
        assert_eq!(calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_never_signal_is_not_cancelled() {
        assert!(!CancelSignal::never().is_cancelled());
    }
}
