pub mod circuit_breaker;
pub mod monitor;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use monitor::{HealthMonitor, SubsystemHealth};
