mod breaker;
mod http;

pub use breaker::{
    BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, Counts,
    CIRCUIT_BREAKER_REJECTED, CIRCUIT_BREAKER_STATE, CIRCUIT_BREAKER_TRANSITIONS,
};
pub use http::{with_fallback, GuardedClient};
