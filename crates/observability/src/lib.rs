//! Observability wiring for the Lumagen services.

pub mod tracing;

pub use tracing::init;
