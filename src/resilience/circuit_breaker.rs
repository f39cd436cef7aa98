//! # Circuit breaker
//!
//! Per-dependency breaker protecting the gateway and orchestrator APIs.
//!
//! ## State transitions
//!
//! ```text
//! CLOSED ──threshold consecutive failures──▶ OPEN
//! OPEN ──recovery_timeout elapsed (lazily, on next read)──▶ HALF_OPEN
//! HALF_OPEN ──probe success──▶ CLOSED
//! HALF_OPEN ──probe failure──▶ OPEN
//! ```
//!
//! While OPEN, calls short-circuit with a circuit-open error carrying the
//! remaining wait. In HALF_OPEN exactly one probe is in flight at a time.
//! The guarded future always executes outside the state mutex so slow
//! dependencies never serialize behind each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{BrokerError, Result};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests pass through.
    Closed,
    /// Requests fail immediately.
    Open,
    /// Recovery probe in progress.
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: usize,
    /// Wait before a recovery probe is allowed.
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: usize,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Point-in-time call counters, for diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct BreakerStats {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    rejected_calls: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
            total_calls: AtomicU64::new(0),
            successful_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state. Reading performs the lazy OPEN → HALF_OPEN transition
    /// once the recovery timeout has elapsed.
    pub fn state(&self) -> CircuitState {
        let mut state = self.state.lock();
        self.maybe_half_open(&mut state);
        state.state
    }

    /// Execute a call through the breaker. The future runs outside the
    /// state mutex.
    pub async fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.try_acquire()?;

        match f.await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                Err(e)
            }
        }
    }

    fn maybe_half_open(&self, state: &mut BreakerState) {
        if state.state == CircuitState::Open {
            let elapsed = state.opened_at.map(|t| t.elapsed()).unwrap_or_default();
            if elapsed >= self.config.recovery_timeout {
                info!("circuit breaker '{}' transitioning to HALF_OPEN", self.name);
                state.state = CircuitState::HalfOpen;
                state.probe_in_flight = false;
            }
        }
    }

    fn try_acquire(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.maybe_half_open(&mut state);

        match state.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen if !state.probe_in_flight => {
                debug!("circuit breaker '{}' admitting recovery probe", self.name);
                state.probe_in_flight = true;
                Ok(())
            }
            _ => {
                self.rejected_calls.fetch_add(1, Ordering::Relaxed);
                let elapsed = state.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                Err(BrokerError::CircuitOpen {
                    dependency: self.name.clone(),
                    retry_after: self.config.recovery_timeout.saturating_sub(elapsed),
                })
            }
        }
    }

    fn on_success(&self) {
        self.successful_calls.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        match state.state {
            CircuitState::HalfOpen => {
                info!("circuit breaker '{}' recovered, closing", self.name);
                state.state = CircuitState::Closed;
                state.opened_at = None;
                state.probe_in_flight = false;
            }
            CircuitState::Closed => {}
            CircuitState::Open => {
                // A call admitted before the trip finished late.
                debug!("late success on open circuit breaker '{}'", self.name);
            }
        }
    }

    fn on_failure(&self) {
        self.failed_calls.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        state.consecutive_failures += 1;
        match state.state {
            CircuitState::Closed => {
                if state.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        "circuit breaker '{}' tripping OPEN after {} consecutive failures",
                        self.name, state.consecutive_failures
                    );
                    state.state = CircuitState::Open;
                    state.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                warn!(
                    "circuit breaker '{}' probe failed, reopening",
                    self.name
                );
                state.state = CircuitState::Open;
                state.opened_at = Some(Instant::now());
                state.probe_in_flight = false;
            }
            CircuitState::Open => {}
        }
    }

    pub fn stats(&self) -> BreakerStats {
        BreakerStats {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
        }
    }
}

/// Registry handing out one breaker per named dependency.
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    default_config: CircuitBreakerConfig,
}

impl BreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            default_config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read();
            if let Some(breaker) = breakers.get(name) {
                return Arc::clone(breaker);
            }
        }

        let mut breakers = self.breakers.write();
        // Double-check after acquiring the write lock
        if let Some(breaker) = breakers.get(name) {
            return Arc::clone(breaker);
        }
        let breaker = Arc::new(CircuitBreaker::new(name, self.default_config.clone()));
        breakers.insert(name.to_string(), Arc::clone(&breaker));
        breaker
    }

    pub fn list(&self) -> Vec<String> {
        self.breakers.read().keys().cloned().collect()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn fast_config(threshold: usize, recovery_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: Duration::from_millis(recovery_ms),
        }
    }

    #[tokio::test]
    async fn closed_passes_through() {
        let breaker = CircuitBreaker::with_defaults("test");
        let result = breaker.call(async { Ok::<_, BrokerError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn success_resets_the_failure_counter() {
        let breaker = CircuitBreaker::new("test", fast_config(3, 5000));
        for _ in 0..2 {
            let _ = breaker
                .call(async { Err::<(), _>(BrokerError::Http("boom".into())) })
                .await;
        }
        let _ = breaker.call(async { Ok::<_, BrokerError>(()) }).await;
        for _ in 0..2 {
            let _ = breaker
                .call(async { Err::<(), _>(BrokerError::Http("boom".into())) })
                .await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn opens_after_threshold_and_short_circuits() {
        let breaker = CircuitBreaker::new("test", fast_config(5, 5000));
        for _ in 0..5 {
            let _ = breaker
                .call(async { Err::<(), _>(BrokerError::Http("boom".into())) })
                .await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        // The guarded future must not run while open.
        let invoked = Arc::new(AtomicUsize::new(0));
        let marker = Arc::clone(&invoked);
        let err = breaker
            .call(async move {
                marker.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BrokerError>(())
            })
            .await
            .unwrap_err();
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        match err {
            BrokerError::CircuitOpen {
                dependency,
                retry_after,
            } => {
                assert_eq!(dependency, "test");
                assert!(retry_after > Duration::ZERO);
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn probe_success_closes_the_circuit() {
        let breaker = CircuitBreaker::new("test", fast_config(1, 50));
        let _ = breaker
            .call(async { Err::<(), _>(BrokerError::Http("boom".into())) })
            .await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker
            .call(async { Ok::<_, BrokerError>(()) })
            .await
            .unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);

        // Closed again: calls flow normally.
        breaker
            .call(async { Ok::<_, BrokerError>(()) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn probe_failure_reopens() {
        let breaker = CircuitBreaker::new("test", fast_config(1, 50));
        let _ = breaker
            .call(async { Err::<(), _>(BrokerError::Http("boom".into())) })
            .await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        let _ = breaker
            .call(async { Err::<(), _>(BrokerError::Http("still down".into())) })
            .await;
        assert_eq!(breaker.state(), CircuitState::Open);

        let err = breaker
            .call(async { Ok::<_, BrokerError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn half_open_admits_exactly_one_probe() {
        let breaker = Arc::new(CircuitBreaker::new("test", fast_config(1, 10)));
        let _ = breaker
            .call(async { Err::<(), _>(BrokerError::Http("boom".into())) })
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let probe_breaker = Arc::clone(&breaker);
        let probe = tokio::spawn(async move {
            probe_breaker
                .call(async {
                    let _ = release_rx.await;
                    Ok::<_, BrokerError>(())
                })
                .await
        });
        // Give the probe time to be admitted.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = breaker
            .call(async { Ok::<_, BrokerError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::CircuitOpen { .. }));

        release_tx.send(()).unwrap();
        probe.await.unwrap().unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn registry_returns_one_breaker_per_name() {
        let registry = BreakerRegistry::with_defaults();
        let a = registry.get_or_create("gateway");
        let b = registry.get_or_create("orchestrator");
        let a_again = registry.get_or_create("gateway");
        assert!(Arc::ptr_eq(&a, &a_again));
        assert_eq!(a.name(), "gateway");
        assert_eq!(b.name(), "orchestrator");
        assert_eq!(registry.list().len(), 2);
    }

    #[tokio::test]
    async fn stats_track_outcomes() {
        let breaker = CircuitBreaker::new("test", fast_config(1, 5000));
        let _ = breaker.call(async { Ok::<_, BrokerError>(()) }).await;
        let _ = breaker
            .call(async { Err::<(), _>(BrokerError::Http("boom".into())) })
            .await;
        let _ = breaker.call(async { Ok::<_, BrokerError>(()) }).await;

        let stats = breaker.stats();
        assert_eq!(stats.total_calls, 3);
        assert_eq!(stats.successful_calls, 1);
        assert_eq!(stats.failed_calls, 1);
        assert_eq!(stats.rejected_calls, 1);
    }
}
