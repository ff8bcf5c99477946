//! Circuit breaker per provider
//!
//! When a provider keeps failing (outage, revoked key) the remaining cities
//! in a run would each burn a request timeout against it. After
//! `failure_threshold` consecutive fatal failures the breaker opens and every
//! city skips that provider until `open_duration` has passed; then a limited
//! number of trial requests decide whether it closes again.
//!
//! Rate-limit responses are not failures and never move the breaker.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// How long to stay open before probing
    pub open_duration: Duration,
    /// Trial successes needed to close from half-open
    pub success_threshold: u32,
    /// Concurrent trial requests allowed while half-open
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
            success_threshold: 2,
            half_open_max_requests: 2,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    half_open_in_flight: u32,
    opened_at: Option<Instant>,
}

pub struct CircuitBreaker {
    provider: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(provider: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            provider: provider.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                half_open_in_flight: 0,
                opened_at: None,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Returns false while the provider is considered down
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();

        if inner.state == CircuitState::Open {
            let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
            if elapsed < self.config.open_duration {
                debug!(provider = %self.provider, "Circuit open, request blocked");
                return false;
            }
            info!(provider = %self.provider, "Circuit half-open, probing provider");
            inner.state = CircuitState::HalfOpen;
            inner.half_open_successes = 0;
            inner.half_open_in_flight = 0;
        }

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_max_requests {
                    inner.half_open_in_flight += 1;
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;

        if inner.state == CircuitState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            inner.half_open_successes += 1;
            if inner.half_open_successes >= self.config.success_threshold {
                info!(provider = %self.provider, "Circuit closed, provider recovered");
                inner.state = CircuitState::Closed;
                inner.opened_at = None;
            }
        }
    }

    /// A response that says nothing about provider health (429, other 4xx).
    /// Only frees a half-open trial slot.
    pub fn record_neutral(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        provider = %self.provider,
                        failures = inner.consecutive_failures,
                        open_duration_secs = self.config.open_duration.as_secs(),
                        "Circuit tripped, skipping provider"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                warn!(provider = %self.provider, "Trial request failed, circuit re-opened");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.half_open_in_flight = 0;
            }
            CircuitState::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(open_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 2,
            open_duration: Duration::from_millis(open_ms),
            success_threshold: 2,
            half_open_max_requests: 3,
        }
    }

    #[test]
    fn test_opens_after_threshold() {
        let cb = CircuitBreaker::new("ticketmaster", config(10_000));
        assert!(cb.allow_request());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let cb = CircuitBreaker::new("eventbrite", config(10_000));
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_recovers_through_half_open() {
        let cb = CircuitBreaker::new("meetup", config(10));
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.allow_request());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new("meetup", config(10));
        cb.record_failure();
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.allow_request());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_neutral_responses_do_not_trip() {
        let cb = CircuitBreaker::new("ticketmaster", config(10_000));
        for _ in 0..10 {
            cb.record_neutral();
        }
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure();
        cb.record_neutral();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_neutral_response_frees_half_open_slot() {
        let single_trial = CircuitBreakerConfig {
            half_open_max_requests: 1,
            ..config(10)
        };
        let cb = CircuitBreaker::new("eventbrite", single_trial);
        cb.record_failure();
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));

        assert!(cb.allow_request());
        assert!(!cb.allow_request());
        cb.record_neutral();
        assert!(cb.allow_request());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }
}
