//! Circuit breaker pattern implementation for resilient error recovery
//!
//! Each endpoint owns one breaker tracking consecutive transient failures.
//! After `failure_threshold` of them the breaker opens and rejects calls
//! without touching the backend. Once the cool-down has elapsed a single trial
//! call is admitted; its outcome closes the breaker or reopens it with a fresh
//! cool-down.
//!
//! State transition and counter update happen under one async lock per
//! breaker. The half-open trial slot is an atomic so that an [`AdmissionGuard`]
//! can release it synchronously when the trial call is dropped unfinished.
//! Timing uses [`tokio::time::Instant`] so paused-clock tests can
//! drive the cool-down deterministically.

use crate::error::{ErrorKind, QueryError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed - normal operation
    Closed,
    /// Circuit is open - operations blocked
    Open,
    /// Circuit is half-open - one trial call decides the next state
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive transient failures before opening the circuit
    pub failure_threshold: u32,
    /// Time the circuit stays open before a trial call is allowed
    #[serde(with = "humantime_serde")]
    pub cool_down: Duration,
    /// Enable detailed logging
    pub detailed_logging: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down: Duration::from_secs(5 * 60),
            detailed_logging: false,
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    /// Current state
    pub state: CircuitState,
    /// Consecutive transient failures counted towards the threshold
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    #[serde(with = "humantime_serde")]
    pub cool_down: Duration,
    /// Total admission checks
    pub total_requests: u64,
    /// Failed requests counted by the breaker
    pub failed_requests: u64,
    /// Failed requests with a non-transient error
    pub ignored_failures: u64,
    /// Successful requests
    pub successful_requests: u64,
    /// Blocked requests
    pub blocked_requests: u64,
    /// Circuit open count
    pub circuit_open_count: u64,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    /// Time until a trial call becomes eligible
    #[serde(default, with = "humantime_serde")]
    pub time_until_retry: Option<Duration>,
}

/// Circuit breaker event
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerEvent {
    pub endpoint: String,
    pub event_type: CircuitBreakerEventType,
    pub timestamp: DateTime<Utc>,
    pub previous_state: CircuitState,
    pub new_state: CircuitState,
    /// Additional context
    pub context: String,
}

/// Circuit breaker event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitBreakerEventType {
    StateChanged,
    RequestBlocked,
    FailureRecorded,
    SuccessRecorded,
    Reset,
}

/// Circuit breaker listener trait
#[async_trait::async_trait]
pub trait CircuitBreakerListener: Send + Sync {
    /// Called when circuit breaker event occurs
    async fn on_event(&self, event: &CircuitBreakerEvent);
}

type Listeners = Arc<RwLock<Vec<Arc<dyn CircuitBreakerListener>>>>;

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Normal call in the closed state
    Allowed,
    /// The single trial call of the half-open state, tagged with its slot id
    Trial { id: u64 },
    /// Rejected without touching the backend
    Rejected { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Admission::Rejected { .. })
    }

    pub fn is_trial(&self) -> bool {
        matches!(self, Admission::Trial { .. })
    }
}

/// Releases the half-open trial slot if the admitted call never reports back
///
/// Recording an outcome already frees the slot, so dropping the guard after
/// `record_success`/`record_failure` is a no-op.
pub struct AdmissionGuard<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
}

impl AdmissionGuard<'_> {
    pub fn admission(&self) -> Admission {
        self.admission
    }
}

impl Drop for AdmissionGuard<'_> {
    fn drop(&mut self) {
        if let Admission::Trial { id } = self.admission {
            if self.breaker.release_trial(id) {
                warn!(endpoint = %self.breaker.name, "Trial call abandoned, releasing half-open slot");
            }
        }
    }
}

/// Internal circuit breaker state
struct CircuitBreakerState {
    current_state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    stats: CircuitBreakerStats,
}

/// Circuit breaker implementation
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: RwLock<CircuitBreakerState>,
    /// Id of the trial holding the half-open slot; 0 when free
    trial_slot: AtomicU64,
    trial_ids: AtomicU64,
    event_listeners: Listeners,
}

impl CircuitBreaker {
    /// Create new circuit breaker
    pub fn new<S: Into<String>>(name: S, config: CircuitBreakerConfig) -> Self {
        Self::with_listeners(name, config, Arc::new(RwLock::new(Vec::new())))
    }

    fn with_listeners<S: Into<String>>(
        name: S,
        config: CircuitBreakerConfig,
        event_listeners: Listeners,
    ) -> Self {
        let initial_state = CircuitBreakerState {
            current_state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            stats: CircuitBreakerStats {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                failure_threshold: config.failure_threshold,
                cool_down: config.cool_down,
                total_requests: 0,
                failed_requests: 0,
                ignored_failures: 0,
                successful_requests: 0,
                blocked_requests: 0,
                circuit_open_count: 0,
                last_failure: None,
                last_success: None,
                time_until_retry: None,
            },
        };

        Self {
            name: name.into(),
            config,
            state: RwLock::new(initial_state),
            trial_slot: AtomicU64::new(0),
            trial_ids: AtomicU64::new(0),
            event_listeners,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Decide whether a call may reach the backend
    pub async fn should_allow_request(&self) -> Admission {
        let mut events = Vec::new();
        let admission = {
            let mut state = self.state.write().await;
            state.stats.total_requests += 1;

            match state.current_state {
                CircuitState::Closed => {
                    if self.config.detailed_logging {
                        debug!(endpoint = %self.name, "Circuit breaker closed, allowing request");
                    }
                    Admission::Allowed
                }
                CircuitState::Open => {
                    let remaining = self.remaining_cool_down(&state);
                    if remaining.is_zero() {
                        self.transition(&mut state, CircuitState::HalfOpen, &mut events);
                        info!(endpoint = %self.name, "Circuit breaker half-open, admitting trial request");
                        self.claim_trial()
                    } else {
                        self.block(&mut state, remaining, &mut events)
                    }
                }
                CircuitState::HalfOpen => {
                    if self.trial_slot.load(Ordering::SeqCst) != 0 {
                        self.block(&mut state, Duration::ZERO, &mut events)
                    } else {
                        self.claim_trial()
                    }
                }
            }
        };
        self.emit_events(events).await;
        admission
    }

    /// Admission check returning a guard that frees an unfinished trial on drop
    pub async fn admit(&self) -> AdmissionGuard<'_> {
        AdmissionGuard {
            admission: self.should_allow_request().await,
            breaker: self,
        }
    }

    fn claim_trial(&self) -> Admission {
        let id = self.trial_ids.fetch_add(1, Ordering::SeqCst) + 1;
        self.trial_slot.store(id, Ordering::SeqCst);
        Admission::Trial { id }
    }

    /// Free the trial slot if trial `id` still holds it
    pub fn release_trial(&self, id: u64) -> bool {
        self.trial_slot
            .compare_exchange(id, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Whether the trial owns the half-open slot; frees it either way
    fn finish_trial(&self, state: &CircuitBreakerState, admission: Admission) -> bool {
        match admission {
            Admission::Trial { id } => {
                self.release_trial(id) && state.current_state == CircuitState::HalfOpen
            }
            _ => false,
        }
    }

    /// Record successful operation
    pub async fn record_success(&self, admission: Admission) {
        let mut events = Vec::new();
        {
            let mut state = self.state.write().await;
            state.stats.successful_requests += 1;
            state.stats.last_success = Some(Utc::now());

            let owns_trial = self.finish_trial(&state, admission);
            match state.current_state {
                CircuitState::Closed => {
                    state.consecutive_failures = 0;
                }
                CircuitState::HalfOpen if owns_trial => {
                    state.consecutive_failures = 0;
                    state.opened_at = None;
                    self.transition(&mut state, CircuitState::Closed, &mut events);
                    info!(endpoint = %self.name, "Circuit breaker closed after successful trial");
                }
                _ => {
                    // A call admitted before the circuit opened
                    debug!(endpoint = %self.name, "Late success ignored while circuit not closed");
                }
            }
            state.stats.consecutive_failures = state.consecutive_failures;

            if self.config.detailed_logging {
                events.push(self.event(
                    CircuitBreakerEventType::SuccessRecorded,
                    state.current_state,
                    state.current_state,
                    "Operation succeeded".to_string(),
                ));
            }
        }
        self.emit_events(events).await;
    }

    /// Record failed operation
    ///
    /// Only transient errors count towards the threshold. Any other error
    /// proves the backend reachable and merely releases a half-open trial.
    pub async fn record_failure(&self, admission: Admission, err: &QueryError) {
        let mut events = Vec::new();
        {
            let mut state = self.state.write().await;

            if err.kind() != ErrorKind::Transient {
                state.stats.ignored_failures += 1;
                self.finish_trial(&state, admission);
                debug!(endpoint = %self.name, error = %err, "Non-transient error not tracked by circuit breaker");
                return;
            }

            state.stats.failed_requests += 1;
            state.stats.last_failure = Some(Utc::now());

            let owns_trial = self.finish_trial(&state, admission);
            match state.current_state {
                CircuitState::Closed => {
                    state.consecutive_failures += 1;
                    if state.consecutive_failures >= self.config.failure_threshold {
                        self.open(&mut state, &mut events);
                        error!(
                            endpoint = %self.name,
                            failures = state.consecutive_failures,
                            "Circuit breaker opened after {} consecutive failures",
                            state.consecutive_failures
                        );
                    }
                }
                CircuitState::HalfOpen if owns_trial => {
                    self.open(&mut state, &mut events);
                    warn!(endpoint = %self.name, cool_down = ?self.config.cool_down, "Circuit breaker reopened after failed trial");
                }
                _ => {
                    debug!(endpoint = %self.name, "Failure recorded while circuit is open");
                }
            }
            state.stats.consecutive_failures = state.consecutive_failures;

            events.push(self.event(
                CircuitBreakerEventType::FailureRecorded,
                state.current_state,
                state.current_state,
                format!("Operation failed: {err}"),
            ));
        }
        self.emit_events(events).await;
    }

    /// Current state
    pub async fn state(&self) -> CircuitState {
        self.state.read().await.current_state
    }

    /// Get current statistics
    pub async fn get_stats(&self) -> CircuitBreakerStats {
        let state = self.state.read().await;
        let mut stats = state.stats.clone();
        stats.time_until_retry = match state.current_state {
            CircuitState::Open => Some(self.remaining_cool_down(&state)),
            _ => None,
        };
        stats
    }

    /// Force the circuit closed regardless of counters
    pub async fn reset(&self) {
        let mut events = Vec::new();
        {
            let mut state = self.state.write().await;
            let previous = state.current_state;
            state.current_state = CircuitState::Closed;
            state.consecutive_failures = 0;
            state.opened_at = None;
            self.trial_slot.store(0, Ordering::SeqCst);
            state.stats.state = CircuitState::Closed;
            state.stats.consecutive_failures = 0;

            info!(endpoint = %self.name, "Circuit breaker reset to closed state");
            events.push(self.event(
                CircuitBreakerEventType::Reset,
                previous,
                CircuitState::Closed,
                "Circuit breaker manually reset".to_string(),
            ));
        }
        self.emit_events(events).await;
    }

    /// Add event listener
    pub async fn add_listener(&self, listener: Arc<dyn CircuitBreakerListener>) {
        self.event_listeners.write().await.push(listener);
    }

    fn remaining_cool_down(&self, state: &CircuitBreakerState) -> Duration {
        match state.opened_at {
            Some(opened_at) => self.config.cool_down.saturating_sub(opened_at.elapsed()),
            None => Duration::ZERO,
        }
    }

    fn block(
        &self,
        state: &mut CircuitBreakerState,
        retry_after: Duration,
        events: &mut Vec<CircuitBreakerEvent>,
    ) -> Admission {
        state.stats.blocked_requests += 1;
        if self.config.detailed_logging {
            debug!(endpoint = %self.name, ?retry_after, "Circuit breaker blocking request");
        }
        events.push(self.event(
            CircuitBreakerEventType::RequestBlocked,
            state.current_state,
            state.current_state,
            format!("Request blocked, retry in {retry_after:?}"),
        ));
        Admission::Rejected { retry_after }
    }

    fn open(&self, state: &mut CircuitBreakerState, events: &mut Vec<CircuitBreakerEvent>) {
        state.opened_at = Some(Instant::now());
        state.stats.circuit_open_count += 1;
        self.transition(state, CircuitState::Open, events);
    }

    /// Transition to new state
    fn transition(
        &self,
        state: &mut CircuitBreakerState,
        new_state: CircuitState,
        events: &mut Vec<CircuitBreakerEvent>,
    ) {
        let old_state = state.current_state;
        state.current_state = new_state;
        state.stats.state = new_state;

        events.push(self.event(
            CircuitBreakerEventType::StateChanged,
            old_state,
            new_state,
            format!("State transition: {old_state:?} -> {new_state:?}"),
        ));
    }

    fn event(
        &self,
        event_type: CircuitBreakerEventType,
        previous_state: CircuitState,
        new_state: CircuitState,
        context: String,
    ) -> CircuitBreakerEvent {
        CircuitBreakerEvent {
            endpoint: self.name.clone(),
            event_type,
            timestamp: Utc::now(),
            previous_state,
            new_state,
            context,
        }
    }

    /// Deliver events after the state lock is released
    async fn emit_events(&self, events: Vec<CircuitBreakerEvent>) {
        if events.is_empty() {
            return;
        }
        let listeners = self.event_listeners.read().await;
        for event in &events {
            for listener in listeners.iter() {
                listener.on_event(event).await;
            }
        }
    }
}

/// Registry of circuit breakers keyed by endpoint name
pub struct CircuitBreakerManager {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    default_config: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
    listeners: Listeners,
}

impl CircuitBreakerManager {
    /// Create new circuit breaker manager
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            default_config,
            overrides: HashMap::new(),
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Per-endpoint configuration overriding the default
    pub fn with_overrides(mut self, overrides: HashMap<String, CircuitBreakerConfig>) -> Self {
        self.overrides = overrides;
        self
    }

    /// Configuration an endpoint's breaker is (or will be) created with
    pub fn config_for(&self, endpoint: &str) -> &CircuitBreakerConfig {
        self.overrides.get(endpoint).unwrap_or(&self.default_config)
    }

    /// Get or create circuit breaker for an endpoint
    pub async fn get_breaker(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().await.get(endpoint) {
            return breaker.clone();
        }

        let mut breakers = self.breakers.write().await;
        breakers
            .entry(endpoint.to_string())
            .or_insert_with(|| {
                info!(endpoint, "Created new circuit breaker");
                Arc::new(CircuitBreaker::with_listeners(
                    endpoint,
                    self.config_for(endpoint).clone(),
                    self.listeners.clone(),
                ))
            })
            .clone()
    }

    /// Statistics of one endpoint, if its breaker exists
    pub async fn get_stats(&self, endpoint: &str) -> Option<CircuitBreakerStats> {
        let breaker = self.breakers.read().await.get(endpoint).cloned()?;
        Some(breaker.get_stats().await)
    }

    /// Get all circuit breaker statistics
    pub async fn get_all_stats(&self) -> BTreeMap<String, CircuitBreakerStats> {
        let breakers: Vec<_> = self
            .breakers
            .read()
            .await
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.clone()))
            .collect();

        let mut stats = BTreeMap::new();
        for (name, breaker) in breakers {
            stats.insert(name, breaker.get_stats().await);
        }
        stats
    }

    /// Reset one endpoint's breaker; false if it was never created
    pub async fn reset(&self, endpoint: &str) -> bool {
        let breaker = self.breakers.read().await.get(endpoint).cloned();
        match breaker {
            Some(breaker) => {
                breaker.reset().await;
                true
            }
            None => false,
        }
    }

    /// Reset all circuit breakers
    pub async fn reset_all(&self) {
        let breakers: Vec<_> = self.breakers.read().await.values().cloned().collect();
        for breaker in breakers {
            breaker.reset().await;
        }
    }

    /// Listener receiving events from every breaker in the registry
    pub async fn add_listener(&self, listener: Arc<dyn CircuitBreakerListener>) {
        self.listeners.write().await.push(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BackendCode;
    use std::sync::Mutex;

    fn transient() -> QueryError {
        QueryError::transient(BackendCode::Unavailable, "test error")
    }

    fn breaker(threshold: u32, cool_down: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "jobs.query",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                cool_down,
                detailed_logging: true,
            },
        )
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<CircuitBreakerEventType>>);

    #[async_trait::async_trait]
    impl CircuitBreakerListener for Recorder {
        async fn on_event(&self, event: &CircuitBreakerEvent) {
            self.0.lock().unwrap().push(event.event_type);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_once_at_threshold_and_blocks_until_cool_down() {
        let breaker = breaker(3, Duration::from_secs(60));

        for _ in 0..3 {
            let admission = breaker.should_allow_request().await;
            assert_eq!(admission, Admission::Allowed);
            breaker.record_failure(admission, &transient()).await;
        }

        let stats = breaker.get_stats().await;
        assert_eq!(stats.state, CircuitState::Open);
        assert_eq!(stats.circuit_open_count, 1);

        match breaker.should_allow_request().await {
            Admission::Rejected { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(60))
            }
            other => panic!("expected rejection, got {other:?}"),
        }

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!breaker.should_allow_request().await.is_allowed());

        tokio::time::advance(Duration::from_secs(1)).await;
        let trial = breaker.should_allow_request().await;
        assert!(trial.is_trial());

        breaker.record_success(trial).await;
        let stats = breaker.get_stats().await;
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_trial() {
        let breaker = breaker(1, Duration::from_secs(10));
        let admission = breaker.should_allow_request().await;
        breaker.record_failure(admission, &transient()).await;

        tokio::time::advance(Duration::from_secs(10)).await;
        let trial = breaker.should_allow_request().await;
        assert!(trial.is_trial());
        assert!(!breaker.should_allow_request().await.is_allowed());

        breaker.record_failure(trial, &transient()).await;
        let stats = breaker.get_stats().await;
        assert_eq!(stats.state, CircuitState::Open);
        assert_eq!(stats.time_until_retry, Some(Duration::from_secs(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_frees_half_open_slot() {
        let breaker = breaker(1, Duration::from_secs(10));
        let admission = breaker.should_allow_request().await;
        breaker.record_failure(admission, &transient()).await;
        tokio::time::advance(Duration::from_secs(10)).await;

        let abandoned = breaker.admit().await;
        let Admission::Trial { id: stale } = abandoned.admission() else {
            panic!("expected a trial admission");
        };
        assert!(!breaker.should_allow_request().await.is_allowed());
        drop(abandoned);

        let trial = breaker.should_allow_request().await;
        assert!(trial.is_trial());
        // The abandoned trial no longer owns the slot
        assert!(!breaker.release_trial(stale));
        assert!(!breaker.should_allow_request().await.is_allowed());

        breaker.record_success(trial).await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_fatal_errors_do_not_trip() {
        let breaker = breaker(2, Duration::from_secs(10));
        for _ in 0..5 {
            let admission = breaker.should_allow_request().await;
            breaker
                .record_failure(admission, &QueryError::permission_denied("nope"))
                .await;
        }
        let stats = breaker.get_stats().await;
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.ignored_failures, 5);
        assert_eq!(stats.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_success_resets_counter() {
        let breaker = breaker(3, Duration::from_secs(10));
        for _ in 0..2 {
            let admission = breaker.should_allow_request().await;
            breaker.record_failure(admission, &transient()).await;
        }
        let admission = breaker.should_allow_request().await;
        breaker.record_success(admission).await;
        assert_eq!(breaker.get_stats().await.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_manager_overrides_reset_and_listeners() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "jobs.migration.write".to_string(),
            CircuitBreakerConfig {
                failure_threshold: 1,
                ..Default::default()
            },
        );
        let manager = CircuitBreakerManager::new(CircuitBreakerConfig::default())
            .with_overrides(overrides);
        let recorder = Arc::new(Recorder::default());
        manager.add_listener(recorder.clone()).await;

        let breaker = manager.get_breaker("jobs.migration.write").await;
        assert_eq!(breaker.config().failure_threshold, 1);
        assert_eq!(
            manager.get_breaker("jobs.query").await.config().failure_threshold,
            5
        );

        let admission = breaker.should_allow_request().await;
        breaker.record_failure(admission, &transient()).await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        assert!(manager.reset("jobs.migration.write").await);
        assert!(!manager.reset("unknown.endpoint").await);
        assert_eq!(breaker.state().await, CircuitState::Closed);

        let events = recorder.0.lock().unwrap().clone();
        assert!(events.contains(&CircuitBreakerEventType::StateChanged));
        assert!(events.contains(&CircuitBreakerEventType::Reset));
        assert_eq!(manager.get_all_stats().await.len(), 2);
    }
}
