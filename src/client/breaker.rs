//! Circuit breaker guarding one provider.
//!
//! Standard closed/open/half-open state machine. Time comes in as a
//! monotonic `Instant` from the caller; every state transition emits a
//! tracing event tagged with the provider.

use std::time::{Duration, Instant};

use tracing::info;

use crate::types::ProviderKind;

/// State of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, calls allowed.
    Closed,
    /// Blocking all calls after too many failures.
    Open,
    /// Probing recovery with a single trial call.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    provider: ProviderKind,
    state: CircuitState,
    consecutive_failures: u32,
    failure_threshold: u32,
    recovery_timeout: Duration,
    last_failure: Option<Instant>,
}

impl CircuitBreaker {
    pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
    pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_millis(30_000);

    pub fn new(provider: ProviderKind, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            provider,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            last_failure: None,
        }
    }

    pub fn with_defaults(provider: ProviderKind) -> Self {
        Self::new(
            provider,
            Self::DEFAULT_FAILURE_THRESHOLD,
            Self::DEFAULT_RECOVERY_TIMEOUT,
        )
    }

    /// Whether a call may proceed. An open breaker flips to half-open
    /// once the recovery timeout has elapsed since the last failure.
    pub fn allow(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let recovered = self
                    .last_failure
                    .map(|t| now.saturating_duration_since(t) >= self.recovery_timeout)
                    .unwrap_or(true);
                if recovered {
                    self.transition_to(CircuitState::HalfOpen);
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => true,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        if self.state != CircuitState::Closed {
            self.transition_to(CircuitState::Closed);
        }
    }

    pub fn record_failure(&mut self, now: Instant) {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.failure_threshold {
                    self.last_failure = Some(now);
                    self.transition_to(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                // Probe failed, back off again.
                self.consecutive_failures += 1;
                self.last_failure = Some(now);
                self.transition_to(CircuitState::Open);
            }
            CircuitState::Open => {
                self.last_failure = Some(now);
            }
        }
    }

    fn transition_to(&mut self, new_state: CircuitState) {
        info!(
            provider = %self.provider,
            from = %self.state,
            to = %new_state,
            consecutive_failures = self.consecutive_failures,
            "Circuit breaker state transition"
        );
        self.state = new_state;
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const RECOVERY: Duration = Duration::from_millis(30_000);

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(ProviderKind::OpenAi, 3, RECOVERY)
    }

    #[test]
    fn test_initial_state_closed() {
        let mut cb = breaker();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow(Instant::now()));
    }

    #[test]
    fn test_closed_success_resets_count() {
        let now = Instant::now();
        let mut cb = breaker();
        cb.record_failure(now);
        cb.record_failure(now);
        assert_eq!(cb.consecutive_failures(), 2);

        cb.record_success();
        assert_eq!(cb.consecutive_failures(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_opens_at_threshold() {
        let now = Instant::now();
        let mut cb = breaker();
        cb.record_failure(now);
        cb.record_failure(now);
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure(now);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow(now));
    }

    #[test]
    fn test_open_rejects_before_recovery() {
        let now = Instant::now();
        let mut cb = breaker();
        for _ in 0..3 {
            cb.record_failure(now);
        }

        let almost = now + RECOVERY - Duration::from_millis(1);
        assert!(!cb.allow(almost));
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_open_half_opens_at_recovery() {
        let now = Instant::now();
        let mut cb = breaker();
        for _ in 0..3 {
            cb.record_failure(now);
        }

        // First allow check at exactly last_failure + recovery_timeout
        // flips to half-open and admits the probe.
        let recovered = now + RECOVERY;
        assert!(cb.allow(recovered));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_success_closes() {
        let now = Instant::now();
        let mut cb = breaker();
        for _ in 0..3 {
            cb.record_failure(now);
        }
        assert!(cb.allow(now + RECOVERY));

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let now = Instant::now();
        let mut cb = breaker();
        for _ in 0..3 {
            cb.record_failure(now);
        }
        let probe_time = now + RECOVERY;
        assert!(cb.allow(probe_time));

        cb.record_failure(probe_time);
        assert_eq!(cb.state(), CircuitState::Open);

        // The reopened window counts from the probe failure.
        assert!(!cb.allow(probe_time + RECOVERY - Duration::from_millis(1)));
        assert!(cb.allow(probe_time + RECOVERY));
    }

    #[test]
    fn test_threshold_one_opens_immediately() {
        let now = Instant::now();
        let mut cb = CircuitBreaker::new(ProviderKind::Gemini, 1, RECOVERY);
        cb.record_failure(now);
        assert_eq!(cb.state(), CircuitState::Open);
    }
}
