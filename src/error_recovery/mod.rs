//! Error recovery patterns wrapping every remote call
//!
//! This module provides the circuit breaker registry, the bounded retry
//! executor and the resilience manager composing both.

pub mod circuit_breaker;
pub mod resilience_manager;
pub mod retry_policy;

// Re-export commonly used types
pub use circuit_breaker::{
    Admission, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerEvent,
    CircuitBreakerEventType, CircuitBreakerListener, CircuitBreakerManager, CircuitBreakerStats,
    CircuitState,
};
pub use resilience_manager::{
    EndpointOverride, ResilienceConfig, ResilienceManager, ResilienceStats,
};
pub use retry_policy::{
    JitterConfig, RetryAttempt, RetryBuilder, RetryExecutor, RetryPolicy, RetryStats,
};
