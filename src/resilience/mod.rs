pub mod breaker;

pub use breaker::{BreakerPolicy, BreakerStats, CircuitBreaker, CircuitState};
