/// Circuit breaker pattern - prevents hammering a known-failing dependency
///
/// One circuit per resource key, created lazily on first use.
///
/// States:
/// - Closed: Normal operation, requests pass through
/// - Open: Too many failures, fail fast without trying
/// - HalfOpen: Admitting a limited number of probes to test recovery
use super::record::ErrorRecord;
use crate::config::CircuitBreakerConfig;
use crate::events::{EventBus, ResilienceEvent};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CircuitState {
    /// Normal operation
    Closed,

    /// Too many failures, fail fast
    Open,

    /// Testing if service recovered
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Snapshot of one circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitStatus {
    pub state: CircuitState,

    /// Consecutive failure count
    pub failure_count: u32,

    /// When the last failure was recorded
    pub last_failure: Option<Instant>,

    /// When the circuit last opened
    pub opened_at: Option<Instant>,

    /// Successful probes since entering HalfOpen
    pub half_open_successes: u32,

    /// Probes admitted since entering HalfOpen
    pub half_open_attempts: u32,
}

impl CircuitStatus {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            opened_at: None,
            half_open_successes: 0,
            half_open_attempts: 0,
        }
    }
}

impl Default for CircuitStatus {
    fn default() -> Self {
        Self::closed()
    }
}

/// Per-resource-key circuit breaker
///
/// All reads and writes for a key happen under one lock, so concurrent
/// callers sharing a key never lose counter updates.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    circuits: Mutex<HashMap<String, CircuitStatus>>,
    events: EventBus,
}

impl CircuitBreaker {
    /// Create new circuit breaker
    pub fn new(config: CircuitBreakerConfig, events: EventBus) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Decide whether a call against `key` may proceed
    ///
    /// Moves an Open circuit to HalfOpen once the reset timeout has elapsed,
    /// and counts the admitted probe. Rejections carry a `ServiceUnavailable`
    /// record. The returned admission reports the call's outcome; dropping
    /// it unreported gives its HalfOpen slot back.
    pub fn admit(&self, key: &str) -> Result<Admission<'_>, ErrorRecord> {
        let mut circuits = self.circuits.lock();
        let circuit = circuits
            .entry(key.to_string())
            .or_insert_with(CircuitStatus::closed);

        if circuit.state == CircuitState::Open {
            let opened_at = circuit.opened_at.unwrap_or_else(Instant::now);
            let elapsed = opened_at.elapsed();
            if elapsed < self.config.reset_timeout {
                tracing::debug!(
                    resource_key = key,
                    failures = circuit.failure_count,
                    "Circuit breaker is OPEN, failing fast"
                );
                return Err(ErrorRecord::service_unavailable(
                    key,
                    format!(
                        "Circuit breaker is OPEN for '{}' - failing fast (opened {} ago)",
                        key,
                        humantime::format_duration(elapsed)
                    ),
                ));
            }

            circuit.state = CircuitState::HalfOpen;
            circuit.half_open_successes = 0;
            circuit.half_open_attempts = 0;
            tracing::info!(resource_key = key, "Circuit breaker transitioning to HalfOpen");
            self.events.emit(ResilienceEvent::CircuitHalfOpen {
                key: key.to_string(),
            });
        }

        if circuit.state == CircuitState::HalfOpen {
            if circuit.half_open_attempts >= self.config.half_open_requests {
                return Err(ErrorRecord::service_unavailable(
                    key,
                    format!(
                        "Circuit breaker for '{}' is HALF-OPEN and not yet ready ({} probes in flight)",
                        key, circuit.half_open_attempts
                    ),
                ));
            }
            circuit.half_open_attempts += 1;
            return Ok(Admission {
                breaker: self,
                key: key.to_string(),
                half_open_epoch: Some(circuit.opened_at),
                settled: false,
            });
        }

        Ok(Admission {
            breaker: self,
            key: key.to_string(),
            half_open_epoch: None,
            settled: false,
        })
    }

    /// Give back the slot of a HalfOpen admission that never reported, unless
    /// the circuit has moved on since it was admitted
    fn release_half_open_slot(&self, key: &str, epoch: Option<Instant>) {
        let mut circuits = self.circuits.lock();
        if let Some(circuit) = circuits.get_mut(key) {
            if circuit.state == CircuitState::HalfOpen && circuit.opened_at == epoch {
                circuit.half_open_attempts = circuit.half_open_attempts.saturating_sub(1);
                tracing::debug!(
                    resource_key = key,
                    in_flight = circuit.half_open_attempts,
                    "Abandoned HalfOpen admission released"
                );
            }
        }
    }

    /// Record successful operation
    pub fn record_success(&self, key: &str) {
        let mut circuits = self.circuits.lock();
        let circuit = circuits
            .entry(key.to_string())
            .or_insert_with(CircuitStatus::closed);

        match circuit.state {
            CircuitState::Closed => {
                // Reset failure count on success
                circuit.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                circuit.half_open_successes += 1;
                if circuit.half_open_successes >= self.config.half_open_requests {
                    *circuit = CircuitStatus {
                        last_failure: circuit.last_failure,
                        ..CircuitStatus::closed()
                    };
                    tracing::info!(
                        resource_key = key,
                        successes = self.config.half_open_requests,
                        "Circuit breaker CLOSED"
                    );
                    self.events.emit(ResilienceEvent::CircuitClosed {
                        key: key.to_string(),
                    });
                }
            }
            CircuitState::Open => {
                // Late completion of a call admitted before the circuit opened
                tracing::debug!(resource_key = key, "Success recorded while circuit was OPEN");
            }
        }
    }

    /// Record failed operation
    pub fn record_failure(&self, key: &str) {
        let mut circuits = self.circuits.lock();
        let circuit = circuits
            .entry(key.to_string())
            .or_insert_with(CircuitStatus::closed);

        let now = Instant::now();
        circuit.failure_count = circuit.failure_count.saturating_add(1);
        circuit.last_failure = Some(now);

        match circuit.state {
            CircuitState::Closed => {
                if circuit.failure_count >= self.config.failure_threshold {
                    circuit.state = CircuitState::Open;
                    circuit.opened_at = Some(now);
                    tracing::warn!(
                        resource_key = key,
                        failures = circuit.failure_count,
                        "Circuit breaker OPENED"
                    );
                    self.events.emit(ResilienceEvent::CircuitOpen {
                        key: key.to_string(),
                        failures: circuit.failure_count,
                    });
                }
            }
            CircuitState::HalfOpen => {
                // Failed in half-open, reopen immediately
                circuit.state = CircuitState::Open;
                circuit.opened_at = Some(now);
                circuit.half_open_successes = 0;
                circuit.half_open_attempts = 0;
                tracing::warn!(
                    resource_key = key,
                    "Circuit breaker REOPENED after failure in HalfOpen state"
                );
                self.events.emit(ResilienceEvent::CircuitOpen {
                    key: key.to_string(),
                    failures: circuit.failure_count,
                });
            }
            CircuitState::Open => {
                // Already open, nothing to do
            }
        }
    }

    /// Current status of a circuit. Unknown keys report a fresh Closed
    /// circuit and are not created.
    pub fn status(&self, key: &str) -> CircuitStatus {
        self.circuits.lock().get(key).copied().unwrap_or_default()
    }

    /// Snapshot of every known circuit
    pub fn circuits(&self) -> Vec<(String, CircuitStatus)> {
        let mut all: Vec<_> = self
            .circuits
            .lock()
            .iter()
            .map(|(key, status)| (key.clone(), *status))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Force a circuit back to Closed with no failures
    pub fn reset(&self, key: &str) {
        self.circuits
            .lock()
            .insert(key.to_string(), CircuitStatus::closed());
        tracing::info!(resource_key = key, "Circuit breaker manually reset to CLOSED");
    }
}

/// One admitted call against a circuit
#[must_use = "report the outcome with `succeeded` or `failed`"]
#[derive(Debug)]
pub struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    key: String,

    /// `opened_at` of the HalfOpen circuit this call was admitted into
    half_open_epoch: Option<Option<Instant>>,
    settled: bool,
}

impl Admission<'_> {
    /// Whether this call counts against the HalfOpen budget
    pub fn is_half_open(&self) -> bool {
        self.half_open_epoch.is_some()
    }

    pub fn succeeded(mut self) {
        self.settled = true;
        self.breaker.record_success(&self.key);
    }

    pub fn failed(mut self) {
        self.settled = true;
        self.breaker.record_failure(&self.key);
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(epoch) = self.half_open_epoch {
            self.breaker.release_half_open_slot(&self.key, epoch);
        }
    }
}
