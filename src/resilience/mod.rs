//! Resilience Layer (C2/C3): circuit breaker registry and token-bucket
//! rate limiter, per spec §4.5.

pub mod breaker;
pub mod rate_limiter;

pub use breaker::{BreakerConfig, BreakerRegistry, BreakerState};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
