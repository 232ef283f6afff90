//! Stop talking to a peripheral that keeps failing.
//!
//! A breaker starts `Closed` and lets every call through. After `failure_threshold`
//! consecutive failures it opens and rejects calls without running them. Once
//! `reset_timeout` has passed, the next call is let through as a single `HalfOpen` probe:
//! success closes the breaker, failure opens it for another `reset_timeout`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// How long the breaker stays open before allowing a probe
    pub reset_timeout: Duration,
}

impl CircuitBreakerConfig {
    pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
    pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(30);
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: Self::DEFAULT_FAILURE_THRESHOLD,
            reset_timeout: Self::DEFAULT_RESET_TIMEOUT,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CircuitError<E> {
    /// Rejected without running the operation
    #[error("circuit '{0}' is open")]
    Open(String),
    /// The operation ran and failed
    #[error(transparent)]
    Inner(E),
}

/// How a finished operation counts towards the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    /// Refused before it reached the peripheral; says nothing about its health
    Neutral,
}

/// Call counters. `total` includes rejected calls.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CircuitStats {
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejected: u64,
    pub neutral: u64,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerRecord {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<Instant>,
    pub reopen_at: Option<Instant>,
    pub stats: CircuitStats,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    reopen_at: Option<Instant>,
    probe_in_flight: bool,
    stats: CircuitStats,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                reopen_at: None,
                probe_in_flight: false,
                stats: CircuitStats::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn stats(&self) -> CircuitStats {
        self.lock().stats
    }

    pub fn record(&self) -> CircuitBreakerRecord {
        let inner = self.lock();
        CircuitBreakerRecord {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure_at: inner.last_failure_at,
            reopen_at: inner.reopen_at,
            stats: inner.stats,
        }
    }

    /// Close the breaker and forget past failures. Counters are kept.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.reopen_at = None;
        inner.probe_in_flight = false;
    }

    /// Run `operation` unless the breaker is open. Every error counts as a failure.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_filtered(operation, |_| true).await
    }

    /// Run `operation` unless the breaker is open, counting only errors for which
    /// `is_failure` is true. Other errors are passed through and count as the peripheral
    /// having answered.
    pub async fn execute_filtered<F, Fut, T, E, P>(
        &self,
        operation: F,
        is_failure: P,
    ) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        self.execute_classified(operation, |err| {
            if is_failure(err) {
                Outcome::Failure
            } else {
                Outcome::Success
            }
        })
        .await
    }

    /// Run `operation` unless the breaker is open, letting `classify` decide how each error
    /// counts. A `Neutral` error leaves the failure count and the state untouched.
    pub async fn execute_classified<F, Fut, T, E, C>(
        &self,
        operation: F,
        classify: C,
    ) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnOnce(&E) -> Outcome,
    {
        let Some(mut permit) = self.acquire() else {
            return Err(CircuitError::Open(self.name.clone()));
        };
        let result = operation().await;
        let outcome = match &result {
            Ok(_) => Outcome::Success,
            Err(err) => classify(err),
        };
        permit.settle(outcome);
        result.map_err(CircuitError::Inner)
    }

    fn acquire(&self) -> Option<Permit<'_>> {
        let mut inner = self.lock();
        inner.stats.total += 1;

        let now = Instant::now();
        if inner.state == CircuitState::Open {
            let reopen_at = inner.reopen_at;
            match reopen_at {
                Some(at) if now < at => {
                    inner.stats.rejected += 1;
                    return None;
                }
                _ => {
                    log::info!("Circuit '{}': half-open, probing", self.name);
                    inner.state = CircuitState::HalfOpen;
                }
            }
        }

        let probe = inner.state == CircuitState::HalfOpen;
        if probe {
            if inner.probe_in_flight {
                inner.stats.rejected += 1;
                return None;
            }
            inner.probe_in_flight = true;
        }

        Some(Permit { breaker: self, probe, settled: false })
    }

    fn on_success(&self, probe: bool) {
        let mut inner = self.lock();
        inner.stats.successes += 1;
        inner.consecutive_failures = 0;
        if probe {
            inner.probe_in_flight = false;
        }
        if inner.state == CircuitState::HalfOpen {
            log::info!("Circuit '{}': closed", self.name);
            inner.state = CircuitState::Closed;
            inner.reopen_at = None;
        }
    }

    fn on_neutral(&self, probe: bool) {
        let mut inner = self.lock();
        inner.stats.neutral += 1;
        if probe {
            inner.probe_in_flight = false;
        }
    }

    fn on_failure(&self, probe: bool) {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.stats.failures += 1;
        inner.consecutive_failures += 1;
        inner.last_failure_at = Some(now);
        if probe {
            inner.probe_in_flight = false;
        }

        let trip = inner.state == CircuitState::HalfOpen
            || inner.consecutive_failures >= self.config.failure_threshold;
        if trip && inner.state != CircuitState::Open {
            log::warn!(
                "Circuit '{}': open after {} consecutive failures",
                self.name,
                inner.consecutive_failures
            );
            inner.state = CircuitState::Open;
            inner.reopen_at = Some(now + self.config.reset_timeout);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Admission to run one operation. Dropping it unsettled (the operation's future was
/// cancelled) frees the half-open probe slot without recording an outcome.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl Permit<'_> {
    fn settle(&mut self, outcome: Outcome) {
        self.settled = true;
        match outcome {
            Outcome::Success => self.breaker.on_success(self.probe),
            Outcome::Failure => self.breaker.on_failure(self.probe),
            Outcome::Neutral => self.breaker.on_neutral(self.probe),
        }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.lock().probe_in_flight = false;
        }
    }
}

/// Breakers looked up or created by operation name.
#[derive(Default)]
pub struct BreakerRegistry {
    default_config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// The breaker called `name`, created with the registry's default config if missing.
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create(name, self.default_config.clone())
    }

    /// The breaker called `name`, created with `config` if missing. An existing breaker
    /// keeps its original config.
    pub fn get_or_create(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        self.lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.lock().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn records(&self) -> Vec<CircuitBreakerRecord> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.lock().values().cloned().collect();
        let mut records: Vec<_> = breakers.iter().map(|b| b.record()).collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    pub fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> = self.lock().values().cloned().collect();
        for breaker in breakers {
            breaker.reset();
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
