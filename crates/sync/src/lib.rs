//! Task synchronization: provider observations → exactly one terminal
//! transition per job.
//!
//! ## Components
//!
//! - `TaskSynchronizer`: applies observations idempotently; the CAS guard in
//!   the job store picks exactly one winner per terminal transition, and the
//!   refund + notification side effects are coupled to that win
//! - `Orchestrator`: the submission path (validate → debit → create job →
//!   guarded provider submit)
//! - `poll_until_terminal`: bounded polling with per-kind budgets
//! - `ReconcileWorker`: background sweep re-syncing stale non-terminal jobs
//! - `Notifier`: downstream terminal-transition consumer (broadcast for SSE)

pub mod notifier;
pub mod orchestrator;
pub mod poller;
pub mod synchronizer;
pub mod worker;

pub use notifier::{BroadcastNotifier, JobNotification, Notifier, RecordingNotifier};
pub use orchestrator::{Orchestrator, PricingTable};
pub use poller::{poll_until_terminal, sync_once, PollBudget};
pub use synchronizer::{SyncOutcome, TaskSynchronizer};
pub use worker::{ReconcileConfig, ReconcileWorker, ReconcileWorkerHandle};
