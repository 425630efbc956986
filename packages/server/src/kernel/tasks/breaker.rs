//! Per-URL circuit breaker shared across workers.
//!
//! Closed → Open after `max_failures` consecutive failures; Open → HalfOpen
//! once `reset_timeout` has elapsed, letting exactly one probe through;
//! HalfOpen → Closed on probe success, back to Open on probe failure.
//!
//! State is process-local and intentionally lost across restarts.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::error::TaskError;

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub max_failures: u32,
    /// How long an open circuit rejects before allowing a probe.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct UrlCircuit {
    state: CircuitState,
    failure_count: u32,
    last_transition: Instant,
}

impl UrlCircuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_transition: Instant::now(),
        }
    }
}

/// Failure tracker keyed by callback URL.
///
/// Reads take the read lock; any state transition takes the write lock.
pub struct CircuitBreaker {
    circuits: RwLock<HashMap<String, UrlCircuit>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            circuits: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Whether requests to `url` are currently rejected.
    ///
    /// Lazily promotes an expired open circuit to half-open; the caller that
    /// observes the promotion owns the single trial request.
    pub async fn is_open(&self, url: &str) -> bool {
        {
            let circuits = self.circuits.read().await;
            match circuits.get(url) {
                None => return false,
                Some(circuit) => match circuit.state {
                    CircuitState::Closed => return false,
                    // A probe is already in flight.
                    CircuitState::HalfOpen => return true,
                    CircuitState::Open => {
                        if circuit.last_transition.elapsed() < self.config.reset_timeout {
                            return true;
                        }
                    }
                },
            }
        }

        let mut circuits = self.circuits.write().await;
        match circuits.get_mut(url) {
            None => false,
            Some(circuit) => match circuit.state {
                CircuitState::Closed => false,
                CircuitState::HalfOpen => true,
                CircuitState::Open => {
                    if circuit.last_transition.elapsed() >= self.config.reset_timeout {
                        circuit.state = CircuitState::HalfOpen;
                        circuit.last_transition = Instant::now();
                        debug!(url, "circuit half-open, allowing probe");
                        false
                    } else {
                        true
                    }
                }
            },
        }
    }

    pub async fn record_success(&self, url: &str) {
        let mut circuits = self.circuits.write().await;
        if let Some(circuit) = circuits.get_mut(url) {
            if circuit.state != CircuitState::Closed {
                debug!(url, "circuit closed");
            }
            circuit.state = CircuitState::Closed;
            circuit.failure_count = 0;
            circuit.last_transition = Instant::now();
        }
    }

    pub async fn record_failure(&self, url: &str) {
        let mut circuits = self.circuits.write().await;
        let circuit = circuits
            .entry(url.to_string())
            .or_insert_with(UrlCircuit::new);
        match circuit.state {
            CircuitState::Closed => {
                circuit.failure_count += 1;
                if circuit.failure_count >= self.config.max_failures {
                    circuit.state = CircuitState::Open;
                    circuit.last_transition = Instant::now();
                    warn!(
                        url,
                        failures = circuit.failure_count,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                // Probe failed.
                circuit.state = CircuitState::Open;
                circuit.last_transition = Instant::now();
                warn!(url, "probe failed, circuit re-opened");
            }
            CircuitState::Open => {}
        }
    }

    /// Run `f` against `url` under breaker control.
    ///
    /// Fails fast with [`TaskError::CircuitOpen`] without invoking `f` when
    /// the circuit rejects, and records the outcome otherwise.
    pub async fn execute<T, F, Fut>(&self, url: &str, f: F) -> Result<T, TaskError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, TaskError>>,
    {
        if self.is_open(url).await {
            return Err(TaskError::CircuitOpen {
                url: url.to_string(),
            });
        }
        match f().await {
            Ok(value) => {
                self.record_success(url).await;
                Ok(value)
            }
            Err(err) => {
                self.record_failure(url).await;
                Err(err)
            }
        }
    }

    /// Current state for a URL (Closed for unseen URLs).
    pub async fn state(&self, url: &str) -> CircuitState {
        let circuits = self.circuits.read().await;
        circuits
            .get(url)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }
}
