//! Circuit breaker.
//!
//! Closed → Open after `failure_threshold` consecutive failures; Open →
//! HalfOpen once `trip_for` elapses, admitting a single probe; the probe's
//! outcome closes or re-opens the circuit.

use std::sync::Mutex;
use std::time::Instant;

use crate::handler::CircuitRule;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum State {
    Closed { consecutive_failures: u32 },
    Open { since: Instant },
    HalfOpen { probe_in_flight: bool },
}

/// One breaker, owned by one registered method.
pub struct CircuitBreaker {
    rule: CircuitRule,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(rule: CircuitRule) -> Self {
        Self {
            rule,
            state: Mutex::new(State::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    /// Whether a request may proceed. Transitions Open → HalfOpen when the
    /// trip interval has elapsed and admits exactly one probe.
    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&self, now: Instant) -> bool {
        let mut state = self.lock();
        match &mut *state {
            State::Closed { .. } => true,
            State::Open { since } => {
                if now.duration_since(*since) >= self.rule.trip_for {
                    *state = State::HalfOpen {
                        probe_in_flight: true,
                    };
                    true
                } else {
                    false
                }
            }
            State::HalfOpen { probe_in_flight } => {
                if *probe_in_flight {
                    false
                } else {
                    *probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a successful call: closes the circuit.
    pub fn record_success(&self) {
        let mut state = self.lock();
        *state = State::Closed {
            consecutive_failures: 0,
        };
    }

    /// Record a failed call: counts toward the threshold, or re-opens from
    /// half-open.
    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    fn record_failure_at(&self, now: Instant) {
        let mut state = self.lock();
        match &mut *state {
            State::Closed {
                consecutive_failures,
            } => {
                *consecutive_failures += 1;
                if *consecutive_failures >= self.rule.failure_threshold {
                    tracing::warn!(
                        failures = *consecutive_failures,
                        "circuit breaker tripped"
                    );
                    *state = State::Open { since: now };
                }
            }
            State::HalfOpen { .. } => {
                tracing::warn!("half-open probe failed, circuit re-opened");
                *state = State::Open { since: now };
            }
            State::Open { .. } => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        match &*self.lock() {
            State::Closed { .. } => CircuitState::Closed,
            State::Open { .. } => CircuitState::Open,
            State::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn breaker(threshold: u32, trip_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitRule {
            failure_threshold: threshold,
            trip_for: Duration::from_millis(trip_ms),
        })
    }

    #[test]
    fn trips_after_threshold() {
        let cb = breaker(3, 1_000);
        assert!(cb.allow());

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow());
    }

    #[test]
    fn success_resets_failure_count() {
        let cb = breaker(2, 1_000);
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        // Only one consecutive failure — still closed.
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_admits_single_probe() {
        let cb = breaker(1, 10);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        let after_trip = Instant::now() + Duration::from_millis(20);
        assert!(cb.allow_at(after_trip)); // the probe
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(!cb.allow_at(after_trip)); // concurrent requests rejected

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow());
    }

    #[test]
    fn failed_probe_reopens() {
        let cb = breaker(1, 10);
        cb.record_failure();
        let after_trip = Instant::now() + Duration::from_millis(20);
        assert!(cb.allow_at(after_trip));

        cb.record_failure_at(after_trip);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_at(after_trip));
    }
}
