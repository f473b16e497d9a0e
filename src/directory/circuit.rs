//! Failure circuit around the profile-sync collaborator.
//!
//! After `threshold` consecutive failures the circuit opens and calls are
//! skipped. Once `reopen_after` has elapsed a single trial call is let
//! through (half-open); its outcome closes or re-opens the circuit. A
//! trial that never reports back (its caller was cancelled) is replaced
//! by a fresh one after another `reopen_after`.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open { since: Instant },
    HalfOpen { since: Instant },
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    pub state: CircuitState,
    pub failures: u32,
    pub threshold: u32,
    pub reopen_after: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reopen_after: Duration) -> Self {
        Self { state: CircuitState::Closed, failures: 0, threshold: threshold.max(1), reopen_after }
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.state = CircuitState::Closed;
    }

    pub fn record_failure_at(&mut self, now: Instant) {
        self.failures = self.failures.saturating_add(1);
        if matches!(self.state, CircuitState::HalfOpen { .. }) || self.failures >= self.threshold {
            self.state = CircuitState::Open { since: now };
        }
    }

    /// Whether a call may proceed at `now`. Moves an expired open circuit
    /// to half-open; one trial is admitted per `reopen_after` until a
    /// trial reports back.
    pub fn allow_at(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open { since } | CircuitState::HalfOpen { since } => {
                if now.saturating_duration_since(since) >= self.reopen_after {
                    self.state = CircuitState::HalfOpen { since: now };
                    true
                } else {
                    false
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_opens_on_threshold() {
        let t0 = Instant::now();
        let mut cb = CircuitBreaker::new(3, Duration::from_secs(30));
        assert!(cb.allow_at(t0));
        cb.record_failure_at(t0);
        cb.record_failure_at(t0);
        assert!(cb.allow_at(t0));
        cb.record_failure_at(t0);
        assert!(!cb.allow_at(t0));
        assert!(matches!(cb.state, CircuitState::Open { .. }));
    }

    #[test]
    fn test_half_open_admits_one_trial() {
        let t0 = Instant::now();
        let mut cb = CircuitBreaker::new(1, Duration::from_secs(30));
        cb.record_failure_at(t0);
        assert!(!cb.allow_at(t0 + Duration::from_secs(29)));
        assert!(cb.allow_at(t0 + Duration::from_secs(30)));
        assert_eq!(cb.state, CircuitState::HalfOpen { since: t0 + Duration::from_secs(30) });
        assert!(!cb.allow_at(t0 + Duration::from_secs(45)));

        cb.record_failure_at(t0 + Duration::from_secs(31));
        assert!(!cb.allow_at(t0 + Duration::from_secs(40)));
        assert!(cb.allow_at(t0 + Duration::from_secs(61)));
        cb.record_success();
        assert_eq!(cb.state, CircuitState::Closed);
        assert_eq!(cb.failures, 0);
    }

    #[test]
    fn test_abandoned_trial_is_replaced() {
        let t0 = Instant::now();
        let mut cb = CircuitBreaker::new(1, Duration::from_secs(30));
        cb.record_failure_at(t0);
        // Trial admitted, then its caller disappears without reporting.
        assert!(cb.allow_at(t0 + Duration::from_secs(30)));
        assert!(!cb.allow_at(t0 + Duration::from_secs(59)));
        assert!(cb.allow_at(t0 + Duration::from_secs(60)));
        cb.record_success();
        assert!(cb.allow_at(t0 + Duration::from_secs(61)));
        assert_eq!(cb.state, CircuitState::Closed);
    }
}
