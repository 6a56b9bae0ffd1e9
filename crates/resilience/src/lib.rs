//! Process-local protection for outbound provider calls.
//!
//! ## Design
//!
//! - `ProviderSemaphore`: bounds in-flight calls per provider scope, FIFO,
//!   bounded wait, idempotent release
//! - `CircuitBreaker`: per-key failure tracker with Closed/Open/Half-Open
//!   phases and exponential cool-down extension on repeated trips
//! - `BreakerRegistry`: keyed breaker instances with admin reset hooks
//!
//! State here is process-local by design; the durable system of record
//! (jobs, credits) lives behind its own conditional-write guards.

pub mod breaker;
pub mod semaphore;

pub use breaker::{
    BreakerConfig, BreakerPhase, BreakerRegistry, BreakerSnapshot, CircuitBreaker, CircuitOpenError,
};
pub use semaphore::{AcquireTimeoutError, ProviderSemaphore, SlotGuard};
