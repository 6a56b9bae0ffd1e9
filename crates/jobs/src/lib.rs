//! Generation job aggregate and its system of record.
//!
//! ## Design
//!
//! - `GenerationJob` state is monotonic: once `Success` or `Failed`, no
//!   further writes to state, assets, or credit fields
//! - Terminal transitions go through a compare-and-swap guard
//!   (`finalize_*`): the write succeeds only from a non-terminal state, so
//!   racing observers (poll loop, webhook, admin replay) produce exactly one
//!   winner
//! - The store is the durable, cross-process source of truth; nothing here
//!   relies on process memory for idempotency

pub mod postgres;
pub mod store;
pub mod types;

pub use postgres::PostgresJobStore;
pub use store::{FinalizeOutcome, InMemoryJobStore, JobStore};
pub use types::GenerationJob;
