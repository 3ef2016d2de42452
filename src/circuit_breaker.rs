use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "open" => CircuitState::Open,
            "half_open" => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: chrono::Duration,
    pub halfopen_success_threshold: u32,
}

/// Per-connection failure gate. A snapshot is loaded from and written back
/// to the connection's row around each poll cycle (see the persistence
/// layer's `ConnectionRepo`); this type holds only the in-process logic.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    open_until: Option<DateTime<Utc>>,
    halfopen_successes: u32,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(
        state: CircuitState,
        consecutive_failures: u32,
        open_until: Option<DateTime<Utc>>,
        halfopen_successes: u32,
        config: CircuitBreakerConfig,
    ) -> Self {
        Self {
            state,
            consecutive_failures,
            open_until,
            halfopen_successes,
            config,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn open_until(&self) -> Option<DateTime<Utc>> {
        self.open_until
    }

    pub fn halfopen_successes(&self) -> u32 {
        self.halfopen_successes
    }

    /// Whether a cycle is allowed to run right now. OPEN blocks until
    /// `open_until` has elapsed, at which point the caller should treat the
    /// breaker as HALF_OPEN for this one probe (call `transition_to_half_open`
    /// before running the cycle).
    pub fn allows_request(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => self.open_until.is_none_or(|until| now >= until),
        }
    }

    /// Move an OPEN breaker whose recovery timeout has elapsed into
    /// HALF_OPEN. No-op otherwise.
    pub fn transition_to_half_open_if_due(&mut self, now: DateTime<Utc>) {
        if self.state == CircuitState::Open && self.open_until.is_none_or(|until| now >= until) {
            self.state = CircuitState::HalfOpen;
            self.halfopen_successes = 0;
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        match self.state {
            CircuitState::HalfOpen => {
                self.halfopen_successes += 1;
                if self.halfopen_successes >= self.config.halfopen_success_threshold {
                    self.state = CircuitState::Closed;
                    self.halfopen_successes = 0;
                    self.open_until = None;
                }
            }
            CircuitState::Closed => {}
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        match self.state {
            CircuitState::HalfOpen => {
                self.open(now);
            }
            CircuitState::Closed => {
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.open(now);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn open(&mut self, now: DateTime<Utc>) {
        self.state = CircuitState::Open;
        self.halfopen_successes = 0;
        self.open_until = Some(now + self.config.recovery_timeout);
    }

    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.open_until = None;
        self.halfopen_successes = 0;
    }
}
