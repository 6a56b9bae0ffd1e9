//! Credit ledger: authoritative balance plus an append-only transaction log.
//!
//! ## Design
//!
//! - The ledger is the source of truth; the balance column is a projection
//!   that must always equal the ledger sum
//! - One debit and at most one refund per generation job, enforced by
//!   idempotency guards (unique constraint in Postgres, same check under one
//!   lock in memory)
//! - Debit happens-before job submission so the refund path is always
//!   available when a provider fails

pub mod entry;
pub mod ledger;
pub mod postgres;

pub use entry::{EntryType, LedgerEntry};
pub use ledger::{CreditLedger, InMemoryCreditLedger, RefundOutcome};
pub use postgres::PostgresCreditLedger;
