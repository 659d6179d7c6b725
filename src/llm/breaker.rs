//! Circuit breaker around an unreliable upstream.
//!
//! Opens after a run of consecutive failures and fails fast while open;
//! after a cooldown a single probe is let through (half-open) and its
//! outcome decides whether the circuit closes again. State transitions are
//! logged. The breaker is owned by whichever component wraps the upstream;
//! there is no global.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            State::Closed => "closed",
            State::Open => "open",
            State::HalfOpen => "half-open",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct Inner {
    state: State,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Error returned by [`CircuitBreaker::execute`].
#[derive(Debug)]
pub enum BreakerError<E> {
    /// The circuit is open; the operation was not attempted.
    Open,
    /// The operation ran and failed.
    Inner(E),
}

pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, threshold: u32, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            threshold: threshold.max(1),
            cooldown,
            inner: Mutex::new(Inner {
                state: State::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Run `op` if the circuit allows it, recording the outcome.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.try_acquire() {
            return Err(BreakerError::Open);
        }

        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            State::Closed | State::HalfOpen => true,
            State::Open => {
                let cooled = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.cooldown)
                    .unwrap_or(true);
                if cooled {
                    self.transition(&mut inner, State::HalfOpen);
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.consecutive_failures = 0;
        if inner.state != State::Closed {
            self.transition(&mut inner, State::Closed);
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.consecutive_failures += 1;
        let should_open = match inner.state {
            State::HalfOpen => true,
            State::Closed => inner.consecutive_failures >= self.threshold,
            State::Open => false,
        };
        if should_open {
            inner.opened_at = Some(Instant::now());
            self.transition(&mut inner, State::Open);
        }
    }

    fn transition(&self, inner: &mut Inner, to: State) {
        let from = inner.state;
        inner.state = to;
        if to == State::Open {
            warn!(name = %self.name, %from, %to, "circuit breaker state change");
        } else {
            info!(name = %self.name, %from, %to, "circuit breaker state change");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new("test", threshold, Duration::from_millis(cooldown_ms))
    }

    async fn fail(b: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        b.execute(|| async { Err::<(), _>("boom") }).await.map(|_| ())
    }

    async fn succeed(b: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        b.execute(|| async { Ok::<_, &'static str>(()) }).await
    }

    #[tokio::test]
    async fn opens_after_consecutive_failures() {
        let b = breaker(3, 60_000);
        for _ in 0..3 {
            assert!(matches!(fail(&b).await, Err(BreakerError::Inner(_))));
        }
        // Now open: fails fast without running the operation.
        assert!(matches!(succeed(&b).await, Err(BreakerError::Open)));
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let b = breaker(3, 60_000);
        assert!(fail(&b).await.is_err());
        assert!(fail(&b).await.is_err());
        assert!(succeed(&b).await.is_ok());
        assert!(fail(&b).await.is_err());
        assert!(fail(&b).await.is_err());
        // Still closed: the run of failures was broken.
        assert!(succeed(&b).await.is_ok());
    }

    #[tokio::test]
    async fn half_open_probe_closes_on_success() {
        let b = breaker(1, 10);
        assert!(fail(&b).await.is_err());
        assert!(matches!(succeed(&b).await, Err(BreakerError::Open)));

        tokio::time::sleep(Duration::from_millis(20)).await;
        // Probe allowed and succeeds -> closed again.
        assert!(succeed(&b).await.is_ok());
        assert!(succeed(&b).await.is_ok());
    }

    #[tokio::test]
    async fn half_open_probe_reopens_on_failure() {
        let b = breaker(1, 10);
        assert!(fail(&b).await.is_err());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(fail(&b).await, Err(BreakerError::Inner(_))));
        assert!(matches!(succeed(&b).await, Err(BreakerError::Open)));
    }
}
