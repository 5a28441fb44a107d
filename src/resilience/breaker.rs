//! Per-dependency circuit breaker.
//!
//! ```text
//! Closed    -> Open:      window holds `window_size` outcomes and the failure
//!                         share reaches `error_threshold_percentage`
//! Open      -> Half-Open: first call after `cooldown` becomes the trial
//! Half-Open -> Closed:    trial succeeds
//! Half-Open -> Open:      trial fails (cooldown restarts)
//! ```
//!
//! While open, or while a half-open trial is in flight, calls are rejected
//! without running the operation.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::upstream::UpstreamError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerPolicy {
    pub timeout: Duration,
    pub window_size: usize,
    pub error_threshold_percentage: u32,
    pub cooldown: Duration,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1000),
            window_size: 20,
            error_threshold_percentage: 50,
            cooldown: Duration::from_millis(5000),
        }
    }
}

impl BreakerPolicy {
    /// Policy for the ratings lookup: shorter window, longer timeout.
    pub fn ratings() -> Self {
        Self {
            timeout: Duration::from_millis(2000),
            window_size: 6,
            error_threshold_percentage: 50,
            cooldown: Duration::from_millis(5000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerStats {
    pub state: CircuitState,
    pub window_len: usize,
    pub window_failures: usize,
    pub successes: u64,
    pub failures: u64,
    pub short_circuited: u64,
}

struct BreakerInner {
    state: CircuitState,
    // Bumped on every state change; outcomes from an older generation are
    // kept out of the window.
    generation: u64,
    // true = failure
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

pub struct CircuitBreaker {
    name: String,
    policy: BreakerPolicy,
    inner: Mutex<BreakerInner>,
    successes: AtomicU64,
    failures: AtomicU64,
    short_circuited: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, policy: BreakerPolicy) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                generation: 0,
                window: VecDeque::with_capacity(policy.window_size),
                opened_at: None,
                trial_in_flight: false,
            }),
            policy,
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            short_circuited: AtomicU64::new(0),
        }
    }

    /// Runs `operation` under the call timeout if the circuit admits it.
    ///
    /// The outcome is recorded exactly once: on completion, on timeout, or
    /// as a failure if the returned future is dropped before either.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T, UpstreamError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let permit = match self.try_acquire() {
            Some(permit) => permit,
            None => {
                self.short_circuited.fetch_add(1, Ordering::Relaxed);
                return Err(UpstreamError::CircuitOpen(self.name.clone()));
            }
        };

        let result = match tokio::time::timeout(self.policy.timeout, operation()).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::Timeout(self.policy.timeout)),
        };

        permit.settle(result.is_ok());
        result
    }

    /// Like [`call`](Self::call), but every error is replaced with the value
    /// built by `fallback`.
    pub async fn call_with_fallback<T, F, Fut, FB>(&self, operation: F, fallback: FB) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
        FB: FnOnce(&UpstreamError) -> T,
    {
        match self.call(operation).await {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    dependency = %self.name,
                    state = self.state().as_str(),
                    error = %e,
                    "upstream call failed, using fallback"
                );
                fallback(&e)
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.lock();
        BreakerStats {
            state: inner.state,
            window_len: inner.window.len(),
            window_failures: inner.window.iter().filter(|failed| **failed).count(),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            short_circuited: self.short_circuited.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_acquire(&self) -> Option<Permit<'_>> {
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => Some(Permit::new(self, false, inner.generation)),
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.policy.cooldown)
                    .unwrap_or(true);
                if !cooled_down {
                    return None;
                }
                self.transition(&mut inner, CircuitState::HalfOpen);
                inner.trial_in_flight = true;
                Some(Permit::new(self, true, inner.generation))
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return None;
                }
                inner.trial_in_flight = true;
                Some(Permit::new(self, true, inner.generation))
            }
        }
    }

    fn record(&self, success: bool, trial: bool, generation: u64) {
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }

        let mut inner = self.lock();

        if trial {
            inner.trial_in_flight = false;
            if success {
                self.transition(&mut inner, CircuitState::Closed);
                inner.opened_at = None;
            } else {
                self.open(&mut inner);
            }
            return;
        }

        // Admitted in an earlier closed period: the window it belonged to is gone.
        if inner.state != CircuitState::Closed || inner.generation != generation {
            return;
        }

        inner.window.push_back(!success);
        while inner.window.len() > self.policy.window_size {
            inner.window.pop_front();
        }

        if inner.window.len() < self.policy.window_size {
            return;
        }

        let failed = inner.window.iter().filter(|failed| **failed).count();
        if failed * 100 >= self.policy.error_threshold_percentage as usize * inner.window.len() {
            self.open(&mut inner);
        }
    }

    fn open(&self, inner: &mut BreakerInner) {
        let failed = inner.window.iter().filter(|failed| **failed).count();
        self.transition(inner, CircuitState::Open);
        inner.opened_at = Some(Instant::now());
        warn!(
            dependency = %self.name,
            window_failures = failed,
            cooldown_ms = self.policy.cooldown.as_millis() as u64,
            "circuit opened"
        );
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        info!(
            dependency = %self.name,
            from = inner.state.as_str(),
            to = to.as_str(),
            "circuit state change"
        );
        inner.state = to;
        inner.generation += 1;
        inner.window.clear();
    }
}

/// An admitted call. Dropping it unsettled counts as a failure.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    generation: u64,
    settled: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool, generation: u64) -> Self {
        Self {
            breaker,
            trial,
            generation,
            settled: false,
        }
    }

    fn settle(mut self, success: bool) {
        self.settled = true;
        self.breaker.record(success, self.trial, self.generation);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            debug!(dependency = %self.breaker.name, "call cancelled, recording failure");
            self.breaker.record(false, self.trial, self.generation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn policy() -> BreakerPolicy {
        BreakerPolicy {
            timeout: Duration::from_millis(100),
            window_size: 6,
            error_threshold_percentage: 50,
            cooldown: Duration::from_millis(500),
        }
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<(), UpstreamError> {
        cb.call(|| async { Ok(()) }).await
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), UpstreamError> {
        cb.call(|| async { Err(UpstreamError::Connection("refused".to_string())) }).await
    }

    async fn trip(cb: &CircuitBreaker) {
        for _ in 0..3 {
            succeed(cb).await.unwrap();
        }
        for _ in 0..3 {
            assert!(fail(cb).await.is_err());
        }
    }

    #[tokio::test]
    async fn test_stays_closed_below_threshold() {
        let cb = CircuitBreaker::new("ratings", policy());

        for _ in 0..4 {
            succeed(&cb).await.unwrap();
        }
        for _ in 0..2 {
            assert!(fail(&cb).await.is_err());
        }

        assert_eq!(cb.state(), CircuitState::Closed);
        let stats = cb.stats();
        assert_eq!(stats.window_len, 6);
        assert_eq!(stats.window_failures, 2);
    }

    #[tokio::test]
    async fn test_needs_full_window_before_opening() {
        let cb = CircuitBreaker::new("ratings", policy());

        for _ in 0..5 {
            assert!(fail(&cb).await.is_err());
        }
        assert_eq!(cb.state(), CircuitState::Closed);

        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_open_circuit_skips_operation() {
        let cb = CircuitBreaker::new("ratings", policy());
        trip(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        let attempts = AtomicUsize::new(0);
        for _ in 0..5 {
            let result: Result<(), _> = cb
                .call(|| async {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await;
            assert!(matches!(result, Err(UpstreamError::CircuitOpen(_))));
        }

        assert_eq!(attempts.load(Ordering::SeqCst), 0);
        assert_eq!(cb.stats().short_circuited, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_success_closes() {
        let cb = CircuitBreaker::new("ratings", policy());
        trip(&cb).await;

        tokio::time::advance(Duration::from_millis(501)).await;
        succeed(&cb).await.unwrap();

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().window_len, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_failure_reopens() {
        let cb = CircuitBreaker::new("ratings", policy());
        trip(&cb).await;

        tokio::time::advance(Duration::from_millis(501)).await;
        assert!(matches!(fail(&cb).await, Err(UpstreamError::Connection(_))));
        assert_eq!(cb.state(), CircuitState::Open);

        // Cooldown restarted with the failed trial.
        tokio::time::advance(Duration::from_millis(300)).await;
        assert!(matches!(succeed(&cb).await, Err(UpstreamError::CircuitOpen(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_trial() {
        let cb = Arc::new(CircuitBreaker::new(
            "ratings",
            BreakerPolicy {
                timeout: Duration::from_secs(60),
                ..policy()
            },
        ));
        trip(&cb).await;
        tokio::time::advance(Duration::from_millis(501)).await;

        let (release, wait) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let cb = cb.clone();
            tokio::spawn(async move {
                cb.call(|| async move {
                    let _ = wait.await;
                    Ok(())
                })
                .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        assert!(matches!(succeed(&cb).await, Err(UpstreamError::CircuitOpen(_))));

        release.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let cb = CircuitBreaker::new("movie-info", policy());

        let result: Result<(), _> = cb
            .call(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(UpstreamError::Timeout(d)) if d == Duration::from_millis(100)));
        assert_eq!(cb.stats().failures, 1);
        assert_eq!(cb.stats().window_failures, 1);
    }

    #[tokio::test]
    async fn test_cancelled_call_records_failure() {
        let cb = CircuitBreaker::new("movie-info", policy());

        {
            let call = cb.call(|| async {
                std::future::pending::<()>().await;
                Ok::<(), UpstreamError>(())
            });
            // Poll once so the permit is taken, then drop the future.
            let mut call = Box::pin(call);
            assert!(futures::poll!(call.as_mut()).is_pending());
        }

        let stats = cb.stats();
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.window_failures, 1);
    }

    #[tokio::test]
    async fn test_fallback_receives_error() {
        let cb = CircuitBreaker::new("movie-info", policy());

        let value = cb
            .call_with_fallback(
                || async { Err::<String, _>(UpstreamError::Status { status: 503, url: "http://x/movies/1".to_string() }) },
                |e| format!("fallback: {}", matches!(e, UpstreamError::Status { status: 503, .. })),
            )
            .await;
        assert_eq!(value, "fallback: true");

        let value = cb
            .call_with_fallback(|| async { Ok("live".to_string()) }, |_| "fallback".to_string())
            .await;
        assert_eq!(value, "live");
    }

    #[tokio::test(start_paused = true)]
    async fn test_outcome_from_earlier_closed_period_is_ignored() {
        let cb = Arc::new(CircuitBreaker::new(
            "movie-info",
            BreakerPolicy {
                timeout: Duration::from_secs(10),
                window_size: 2,
                error_threshold_percentage: 50,
                cooldown: Duration::from_millis(100),
            },
        ));

        let (release, wait) = tokio::sync::oneshot::channel::<()>();
        let slow = {
            let cb = cb.clone();
            tokio::spawn(async move {
                cb.call(|| async move {
                    let _ = wait.await;
                    Err::<(), _>(UpstreamError::Connection("reset".to_string()))
                })
                .await
            })
        };
        tokio::task::yield_now().await;

        assert!(fail(&cb).await.is_err());
        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(150)).await;
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);

        release.send(()).unwrap();
        assert!(slow.await.unwrap().is_err());

        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.window_len, 0);
        assert_eq!(stats.window_failures, 0);
        assert_eq!(stats.failures, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_calls_keep_consistent_counts() {
        const CALLS: u64 = 200;
        let cb = Arc::new(CircuitBreaker::new(
            "ratings",
            BreakerPolicy {
                timeout: Duration::from_secs(5),
                window_size: 10,
                error_threshold_percentage: 50,
                cooldown: Duration::from_secs(60),
            },
        ));

        let tasks: Vec<_> = (0..CALLS)
            .map(|i| {
                let cb = cb.clone();
                tokio::spawn(async move {
                    let _ = cb
                        .call(|| async move {
                            tokio::task::yield_now().await;
                            if i % 3 == 0 {
                                Err(UpstreamError::Connection("refused".to_string()))
                            } else {
                                Ok(())
                            }
                        })
                        .await;
                    assert!(cb.stats().window_len <= 10);
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }

        let stats = cb.stats();
        assert_eq!(stats.successes + stats.failures + stats.short_circuited, CALLS);
        assert!(stats.window_len <= 10);
        assert!(stats.window_failures <= stats.window_len);
    }
}
