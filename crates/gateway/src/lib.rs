//! Provider gateway: one uniform interface over heterogeneous vendor APIs.
//!
//! ## Design
//!
//! - `ProviderGateway`: submit a job, map vendor task state into the
//!   canonical `{queued, processing, success, failed}`, extract result
//!   assets. Polling is side-effect-free and never writes to the job store.
//! - `ProtectedGateway`: decorator stacking semaphore → circuit breaker →
//!   hard call timeout around any gateway.
//! - `KieGateway`: reference adapter for the KIE market API.
//! - `ProviderRouter`: kind → gateway routing; the synchronizer and the
//!   orchestrator only ever see the trait.

pub mod assets;
pub mod kie;
pub mod mock;
pub mod protected;
pub mod provider;
pub mod router;

pub use assets::{AcceptAllProbe, HttpMediaProbe, MediaProbe};
pub use kie::{KieConfig, KieGateway};
pub use mock::MockProvider;
pub use protected::ProtectedGateway;
pub use provider::{ProviderGateway, SubmitRequest, TaskObservation};
pub use router::ProviderRouter;
