// Resilience primitives shared by every external dependency.

pub mod circuit_breaker;

pub use circuit_breaker::{BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, CircuitState};
