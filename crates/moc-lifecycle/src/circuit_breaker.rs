//! Per-operation circuit breakers.
//!
//! Grounded on `mofa-foundation`'s `circuit_breaker::state` module: the
//! same `Closed → Open → HalfOpen` machine, atomic failure counters and a
//! `RwLock`-guarded state, trimmed to the two knobs §4.3 specifies
//! (`failure_threshold`, `reset_timeout_sec`) and the single-trial
//! half-open behavior the spec calls for, rather than the teacher's richer
//! failure-rate/window/half-open-max-requests configuration surface.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

impl State {
    /// 0=closed, 1=open, 2=half-open — the gauge encoding of §4.1.
    pub fn as_gauge(self) -> u8 {
        match self {
            State::Closed => 0,
            State::Open => 1,
            State::HalfOpen => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: RwLock<State>,
    consecutive_failures: AtomicU32,
    opened_at: RwLock<Option<Instant>>,
    last_failure_at: RwLock<Option<Instant>>,
    trial_in_flight: AtomicBool,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct BreakerStatus {
    pub state: State,
    pub failure_count: u32,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: RwLock::new(State::Closed),
            consecutive_failures: AtomicU32::new(0),
            opened_at: RwLock::new(None),
            last_failure_at: RwLock::new(None),
            trial_in_flight: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The configured reset timeout, surfaced so callers can tell clients
    /// how long to back off (`Retry-After`) instead of hardcoding it.
    pub fn reset_timeout(&self) -> Duration {
        self.config.reset_timeout
    }

    pub async fn status(&self) -> BreakerStatus {
        BreakerStatus {
            state: *self.state.read().await,
            failure_count: self.consecutive_failures.load(Ordering::Relaxed),
        }
    }

    /// Returns `true` when the caller may proceed. When the breaker has
    /// been open for at least `reset_timeout`, transitions to half-open and
    /// admits exactly one trial call; further callers are rejected until
    /// that trial resolves.
    pub async fn allow(&self) -> bool {
        let current = *self.state.read().await;
        match current {
            State::Closed => true,
            State::HalfOpen => {
                // Only one trial call admitted at a time.
                !self.trial_in_flight.swap(true, Ordering::AcqRel)
            }
            State::Open => {
                let opened_at = *self.opened_at.read().await;
                let elapsed_enough = opened_at.map(|t| t.elapsed() >= self.config.reset_timeout).unwrap_or(false);
                if !elapsed_enough {
                    return false;
                }
                let mut state = self.state.write().await;
                if *state == State::Open {
                    *state = State::HalfOpen;
                    self.trial_in_flight.store(true, Ordering::Release);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut state = self.state.write().await;
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.trial_in_flight.store(false, Ordering::Release);
        *state = State::Closed;
    }

    /// Returns `true` when this failure is the one that trips the breaker
    /// open (a half-open trial failing, or the closed-state failure count
    /// reaching `failure_threshold`) — the signal callers use to bump the
    /// "circuit-breaker trips by operation" counter exactly once per trip,
    /// not once per failure.
    pub async fn record_failure(&self) -> bool {
        self.trial_in_flight.store(false, Ordering::Release);
        *self.last_failure_at.write().await = Some(Instant::now());
        let mut state = self.state.write().await;
        match *state {
            State::HalfOpen => {
                *state = State::Open;
                *self.opened_at.write().await = Some(Instant::now());
                true
            }
            State::Closed => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= self.config.failure_threshold {
                    *state = State::Open;
                    *self.opened_at.write().await = Some(Instant::now());
                    true
                } else {
                    false
                }
            }
            State::Open => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_threshold_consecutive_failures() {
        let cb = CircuitBreaker::new(
            "load",
            CircuitBreakerConfig {
                failure_threshold: 3,
                reset_timeout: Duration::from_millis(20),
            },
        );
        for _ in 0..2 {
            assert!(cb.allow().await);
            cb.record_failure().await;
        }
        assert_eq!(cb.status().await.state, State::Closed);
        assert!(cb.allow().await);
        cb.record_failure().await;
        assert_eq!(cb.status().await.state, State::Open);
        assert!(!cb.allow().await);
    }

    #[tokio::test]
    async fn half_open_after_timeout_then_closes_on_success() {
        let cb = CircuitBreaker::new(
            "unload",
            CircuitBreakerConfig {
                failure_threshold: 1,
                reset_timeout: Duration::from_millis(10),
            },
        );
        assert!(cb.allow().await);
        cb.record_failure().await;
        assert_eq!(cb.status().await.state, State::Open);
        assert!(!cb.allow().await);
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(cb.allow().await);
        assert_eq!(cb.status().await.state, State::HalfOpen);
        cb.record_success().await;
        assert_eq!(cb.status().await.state, State::Closed);
    }

    #[tokio::test]
    async fn failed_trial_reopens() {
        let cb = CircuitBreaker::new(
            "load",
            CircuitBreakerConfig {
                failure_threshold: 1,
                reset_timeout: Duration::from_millis(5),
            },
        );
        cb.record_failure().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(cb.allow().await);
        cb.record_failure().await;
        assert_eq!(cb.status().await.state, State::Open);
    }
}
