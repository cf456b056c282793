//! Per-agent circuit breaker
//!
//! Prevents cascade failures by tracking agent health and fast-failing
//! while a circuit is open. Implements the Closed → Open → Half-Open state
//! machine with a single admitted probe during recovery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::events::EventBus;
use crate::types::{AgentType, EventEnvelope, EventType, ProviderError};

/// Circuit breaker state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation. Calls flow through.
    Closed,
    /// Failures reached the threshold. Calls are rejected immediately.
    Open { opened_at: Instant },
    /// Recovery testing. Exactly one probe call is admitted at a time.
    HalfOpen {
        probe_started: Instant,
        probe_in_flight: bool,
    },
}

/// Wire-friendly state name for snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitStateKind {
    Closed,
    Open,
    HalfOpen,
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// How long to stay open before admitting a probe.
    pub open_duration: Duration,
    /// How long a half-open probe may stay unresolved before its slot
    /// reopens for another probe.
    pub probe_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            open_duration: Duration::from_secs(5 * 60),
            probe_timeout: Duration::from_secs(45),
        }
    }
}

/// A circuit breaker for a single agent.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    trips_total: u64,
}

/// What a state mutation asks the registry to announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    None,
    Opened,
    HalfOpened,
    Closed,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            trips_total: 0,
        }
    }

    /// Whether a call may proceed right now. Rejections while open are not
    /// counted as fresh failures.
    fn check(&mut self, agent: AgentType) -> (Result<(), ProviderError>, Transition) {
        match &self.state {
            CircuitState::Closed => (Ok(()), Transition::None),
            CircuitState::Open { opened_at } => {
                if opened_at.elapsed() >= self.config.open_duration {
                    self.state = CircuitState::HalfOpen {
                        probe_started: Instant::now(),
                        probe_in_flight: true,
                    };
                    tracing::info!(agent = %agent, "circuit half-open, admitting probe");
                    (Ok(()), Transition::HalfOpened)
                } else {
                    let retry_in = self.config.open_duration - opened_at.elapsed();
                    (
                        Err(ProviderError::CircuitOpen { agent, retry_in }),
                        Transition::None,
                    )
                }
            }
            CircuitState::HalfOpen {
                probe_started,
                probe_in_flight,
            } => {
                if *probe_in_flight && probe_started.elapsed() < self.config.probe_timeout {
                    let retry_in = self.config.probe_timeout - probe_started.elapsed();
                    (
                        Err(ProviderError::CircuitOpen { agent, retry_in }),
                        Transition::None,
                    )
                } else {
                    // Either no probe in flight or the previous probe is
                    // considered lost; admit a fresh one.
                    self.state = CircuitState::HalfOpen {
                        probe_started: Instant::now(),
                        probe_in_flight: true,
                    };
                    (Ok(()), Transition::None)
                }
            }
        }
    }

    fn record_success(&mut self, agent: AgentType) -> Transition {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
                Transition::None
            }
            CircuitState::HalfOpen { .. } => {
                self.state = CircuitState::Closed;
                self.consecutive_failures = 0;
                tracing::info!(agent = %agent, "circuit recovered, now closed");
                Transition::Closed
            }
            CircuitState::Open { .. } => {
                // A success can only come from a call admitted before the
                // trip. Treat it as recovery.
                self.state = CircuitState::Closed;
                self.consecutive_failures = 0;
                Transition::Closed
            }
        }
    }

    fn record_failure(&mut self, agent: AgentType) -> Transition {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.state = CircuitState::Open {
                        opened_at: Instant::now(),
                    };
                    self.trips_total += 1;
                    tracing::warn!(
                        agent = %agent,
                        failures = self.consecutive_failures,
                        "circuit tripped open"
                    );
                    Transition::Opened
                } else {
                    Transition::None
                }
            }
            CircuitState::HalfOpen { .. } => {
                self.state = CircuitState::Open {
                    opened_at: Instant::now(),
                };
                self.trips_total += 1;
                tracing::warn!(agent = %agent, "probe failed, circuit back open");
                Transition::Opened
            }
            CircuitState::Open { .. } => {
                self.consecutive_failures += 1;
                Transition::None
            }
        }
    }

    pub fn state(&self) -> &CircuitState {
        &self.state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let state = match self.state {
            CircuitState::Closed => CircuitStateKind::Closed,
            CircuitState::Open { .. } => CircuitStateKind::Open,
            CircuitState::HalfOpen { .. } => CircuitStateKind::HalfOpen,
        };
        CircuitSnapshot {
            state,
            consecutive_failures: self.consecutive_failures,
            trips_total: self.trips_total,
        }
    }
}

/// Point-in-time view of one agent's circuit.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitStateKind,
    pub consecutive_failures: u32,
    pub trips_total: u64,
}

/// Registry of circuit breakers, one per agent, process-wide.
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<AgentType, Arc<Mutex<CircuitBreaker>>>>,
    default_config: CircuitBreakerConfig,
    event_bus: Arc<EventBus>,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig, event_bus: Arc<EventBus>) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            default_config,
            event_bus,
        }
    }

    fn breaker(&self, agent: AgentType) -> Arc<Mutex<CircuitBreaker>> {
        if let Some(breaker) = self.breakers.read().get(&agent) {
            return breaker.clone();
        }
        self.breakers
            .write()
            .entry(agent)
            .or_insert_with(|| Arc::new(Mutex::new(CircuitBreaker::new(self.default_config.clone()))))
            .clone()
    }

    fn announce(&self, agent: AgentType, transition: Transition, snapshot: &CircuitSnapshot) {
        let event_type = match transition {
            Transition::None => return,
            Transition::Opened => EventType::CircuitOpened,
            Transition::HalfOpened => EventType::CircuitHalfOpen,
            Transition::Closed => EventType::CircuitClosed,
        };
        self.event_bus.publish(
            EventEnvelope::new(event_type)
                .with_agent(agent)
                .with_detail("consecutive_failures", snapshot.consecutive_failures)
                .with_detail("trips_total", snapshot.trips_total),
        );
    }

    /// Check whether a call for `agent` may proceed.
    pub fn check(&self, agent: AgentType) -> Result<(), ProviderError> {
        let breaker = self.breaker(agent);
        let (result, transition, snapshot) = {
            let mut guard = breaker.lock();
            let (result, transition) = guard.check(agent);
            (result, transition, guard.snapshot())
        };
        self.announce(agent, transition, &snapshot);
        result
    }

    pub fn record_success(&self, agent: AgentType) {
        let breaker = self.breaker(agent);
        let (transition, snapshot) = {
            let mut guard = breaker.lock();
            let transition = guard.record_success(agent);
            (transition, guard.snapshot())
        };
        self.announce(agent, transition, &snapshot);
    }

    pub fn record_failure(&self, agent: AgentType) {
        let breaker = self.breaker(agent);
        let (transition, snapshot) = {
            let mut guard = breaker.lock();
            let transition = guard.record_failure(agent);
            (transition, guard.snapshot())
        };
        self.announce(agent, transition, &snapshot);
    }

    /// Whether the circuit for `agent` currently rejects calls. Does not
    /// mutate breaker state.
    pub fn is_open(&self, agent: AgentType) -> bool {
        let breaker = self.breaker(agent);
        let guard = breaker.lock();
        match guard.state() {
            CircuitState::Closed => false,
            CircuitState::HalfOpen { .. } => false,
            CircuitState::Open { opened_at } => {
                opened_at.elapsed() < guard.config.open_duration
            }
        }
    }

    pub fn snapshot_all(&self) -> HashMap<AgentType, CircuitSnapshot> {
        self.breakers
            .read()
            .iter()
            .map(|(agent, breaker)| (*agent, breaker.lock().snapshot()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry(config: CircuitBreakerConfig) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(config, Arc::new(EventBus::default()))
    }

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            open_duration: Duration::from_millis(20),
            probe_timeout: Duration::from_millis(10),
        }
    }

    #[test]
    fn starts_closed_and_allows() {
        let registry = test_registry(CircuitBreakerConfig::default());
        assert!(registry.check(AgentType::PaperProcessor).is_ok());
        assert!(!registry.is_open(AgentType::PaperProcessor));
    }

    #[test]
    fn trips_exactly_at_threshold() {
        let registry = test_registry(CircuitBreakerConfig::default());
        let agent = AgentType::PerplexityResearcher;

        registry.record_failure(agent);
        registry.record_failure(agent);
        // Two failures must not trip.
        assert!(registry.check(agent).is_ok());

        registry.record_failure(agent);
        assert!(matches!(
            registry.check(agent),
            Err(ProviderError::CircuitOpen { .. })
        ));
        assert_eq!(registry.snapshot_all()[&agent].trips_total, 1);
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let registry = test_registry(CircuitBreakerConfig::default());
        let agent = AgentType::QualityChecker;

        registry.record_failure(agent);
        registry.record_failure(agent);
        registry.record_success(agent);
        registry.record_failure(agent);
        registry.record_failure(agent);
        // Still below threshold because the success reset the streak.
        assert!(registry.check(agent).is_ok());
    }

    #[test]
    fn open_then_half_open_admits_single_probe() {
        let registry = test_registry(fast_config());
        let agent = AgentType::CitationVerifier;

        for _ in 0..3 {
            registry.record_failure(agent);
        }
        assert!(registry.check(agent).is_err());

        std::thread::sleep(Duration::from_millis(25));

        // First check after the open window admits the probe.
        assert!(registry.check(agent).is_ok());
        // A second concurrent probe fails fast.
        assert!(matches!(
            registry.check(agent),
            Err(ProviderError::CircuitOpen { .. })
        ));

        registry.record_success(agent);
        assert!(registry.check(agent).is_ok());
        assert_eq!(
            registry.snapshot_all()[&agent].state,
            CircuitStateKind::Closed
        );
    }

    #[test]
    fn probe_failure_reopens() {
        let registry = test_registry(fast_config());
        let agent = AgentType::MetadataEnhancer;

        for _ in 0..3 {
            registry.record_failure(agent);
        }
        std::thread::sleep(Duration::from_millis(25));
        assert!(registry.check(agent).is_ok());

        registry.record_failure(agent);
        assert!(matches!(
            registry.check(agent),
            Err(ProviderError::CircuitOpen { .. })
        ));
        assert_eq!(registry.snapshot_all()[&agent].trips_total, 2);
    }

    #[test]
    fn lost_probe_slot_reopens_after_probe_timeout() {
        let registry = test_registry(fast_config());
        let agent = AgentType::RelatedPaperDiscovery;

        for _ in 0..3 {
            registry.record_failure(agent);
        }
        std::thread::sleep(Duration::from_millis(25));
        assert!(registry.check(agent).is_ok());
        // Probe never reports; after the probe timeout another is admitted.
        std::thread::sleep(Duration::from_millis(15));
        assert!(registry.check(agent).is_ok());
    }

    #[tokio::test]
    async fn transitions_publish_circuit_events() {
        let bus = Arc::new(EventBus::default());
        let registry =
            CircuitBreakerRegistry::new(fast_config(), bus.clone());
        let mut rx = bus.subscribe();
        let agent = AgentType::ContentSummarizer;

        for _ in 0..3 {
            registry.record_failure(agent);
        }
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::CircuitOpened);
        assert_eq!(event.agent, Some(agent));
    }
}
