//! Circuit breaker for flaky external dependencies
//!
//! One breaker guards one dependency instance. Consecutive non-client
//! failures open the circuit; an open circuit fails fast without
//! invoking the dependency until the recovery timeout elapses, after
//! which exactly one probe call is let through.

use crate::error::{Result, ThreadlineError};
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Breaker state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
}

/// Lock-guarded three-state circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                last_failure: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Current state, with the open-to-half-open transition applied
    pub async fn state(&self) -> BreakerState {
        let inner = self.inner.lock().await;
        if inner.state == BreakerState::Open && self.recovery_elapsed(&inner) {
            BreakerState::HalfOpen
        } else {
            inner.state
        }
    }

    fn recovery_elapsed(&self, inner: &BreakerInner) -> bool {
        inner
            .last_failure
            .map(|t| t.elapsed() >= self.recovery_timeout)
            .unwrap_or(true)
    }

    /// Run one guarded call. An open circuit fails fast without
    /// invoking `op`; in half-open state only a single probe runs.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        {
            let mut inner = self.inner.lock().await;
            match inner.state {
                BreakerState::Closed => {}
                BreakerState::Open => {
                    if self.recovery_elapsed(&inner) {
                        tracing::info!(breaker = %self.name, "recovery timeout elapsed, probing");
                        inner.state = BreakerState::HalfOpen;
                        inner.probe_in_flight = true;
                    } else {
                        return Err(ThreadlineError::CircuitOpen(self.name.clone()));
                    }
                }
                BreakerState::HalfOpen => {
                    if inner.probe_in_flight {
                        return Err(ThreadlineError::CircuitOpen(self.name.clone()));
                    }
                    inner.probe_in_flight = true;
                }
            }
        }

        let result = op().await;

        let mut inner = self.inner.lock().await;
        inner.probe_in_flight = false;
        match &result {
            Ok(_) => {
                if inner.state == BreakerState::HalfOpen {
                    tracing::info!(breaker = %self.name, "probe succeeded, closing circuit");
                }
                inner.state = BreakerState::Closed;
                inner.failure_count = 0;
            }
            Err(err) if err.is_client_error() => {
                // Caller's fault, not the dependency's
            }
            Err(err) => {
                inner.failure_count += 1;
                inner.last_failure = Some(Instant::now());
                if inner.state == BreakerState::HalfOpen {
                    tracing::warn!(breaker = %self.name, "probe failed, reopening circuit: {}", err);
                    inner.state = BreakerState::Open;
                } else if inner.failure_count >= self.failure_threshold {
                    tracing::warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        "failure threshold reached, opening circuit: {}",
                        err
                    );
                    inner.state = BreakerState::Open;
                }
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(threshold: u32, recovery_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new("test", threshold, Duration::from_secs(recovery_secs))
    }

    async fn failing_call(breaker: &CircuitBreaker, calls: &AtomicU32) -> Result<()> {
        breaker
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ThreadlineError::Corpus("backend down".into()))
            })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let b = breaker(3, 30);
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let _ = failing_call(&b, &calls).await;
        }
        assert_eq!(b.state().await, BreakerState::Open);

        // Fails fast without invoking the dependency
        let err = failing_call(&b, &calls).await.unwrap_err();
        assert!(matches!(err, ThreadlineError::CircuitOpen(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_closes_on_success() {
        let b = breaker(2, 30);
        let calls = AtomicU32::new(0);
        for _ in 0..2 {
            let _ = failing_call(&b, &calls).await;
        }
        assert_eq!(b.state().await, BreakerState::Open);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(b.state().await, BreakerState::HalfOpen);

        let result = b.call(|| async { Ok(42) }).await.unwrap();
        assert_eq!(result, 42);
        assert_eq!(b.state().await, BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_reopens_on_failure() {
        let b = breaker(2, 30);
        let calls = AtomicU32::new(0);
        for _ in 0..2 {
            let _ = failing_call(&b, &calls).await;
        }

        tokio::time::advance(Duration::from_secs(31)).await;
        let _ = failing_call(&b, &calls).await;
        assert_eq!(b.state().await, BreakerState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_probe_in_half_open() {
        use std::sync::Arc;

        let b = Arc::new(breaker(1, 30));
        let _ = b
            .call(|| async { Err::<(), _>(ThreadlineError::Corpus("down".into())) })
            .await;
        tokio::time::advance(Duration::from_secs(31)).await;

        // First probe parks on a oneshot; second call must fail fast
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let probe = {
            let b = b.clone();
            tokio::spawn(async move {
                b.call(|| async {
                    rx.await.ok();
                    Ok(1)
                })
                .await
            })
        };
        tokio::task::yield_now().await;

        let err = b.call(|| async { Ok(2) }).await.unwrap_err();
        assert!(matches!(err, ThreadlineError::CircuitOpen(_)));

        tx.send(()).unwrap();
        assert_eq!(probe.await.unwrap().unwrap(), 1);
        assert_eq!(b.state().await, BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_errors_do_not_count() {
        let b = breaker(2, 30);

        for _ in 0..5 {
            let _ = b
                .call(|| async {
                    Err::<(), _>(ThreadlineError::InvalidInput("bad filter".into()))
                })
                .await;
        }
        assert_eq!(b.state().await, BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let b = breaker(3, 30);
        let calls = AtomicU32::new(0);

        let _ = failing_call(&b, &calls).await;
        let _ = failing_call(&b, &calls).await;
        b.call(|| async { Ok(()) }).await.unwrap();
        let _ = failing_call(&b, &calls).await;
        let _ = failing_call(&b, &calls).await;

        // Never hit three consecutive failures
        assert_eq!(b.state().await, BreakerState::Closed);
    }
}
