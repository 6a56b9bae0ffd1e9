//! The submission path: validate → debit → create job → guarded submit.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use lumagen_core::{GenerationError, GenerationResult, JobId, JobKind, UserId};
use lumagen_credits::CreditLedger;
use lumagen_gateway::{ProviderGateway, ProviderRouter, SubmitRequest, TaskObservation};
use lumagen_jobs::{GenerationJob, JobStore};

use crate::notifier::Notifier;
use crate::poller::{poll_until_terminal, PollBudget};
use crate::synchronizer::TaskSynchronizer;

/// Credits charged per generation, by kind with per-model overrides.
#[derive(Debug, Clone)]
pub struct PricingTable {
    base: HashMap<JobKind, i64>,
    models: HashMap<String, i64>,
}

impl Default for PricingTable {
    fn default() -> Self {
        let mut base = HashMap::new();
        base.insert(JobKind::Photo, 5);
        base.insert(JobKind::Video, 60);
        base.insert(JobKind::Audio, 15);
        Self {
            base,
            models: HashMap::new(),
        }
    }
}

impl PricingTable {
    pub fn with_model_price(mut self, model: impl Into<String>, credits: i64) -> Self {
        self.models.insert(model.into(), credits);
        self
    }

    pub fn with_base_price(mut self, kind: JobKind, credits: i64) -> Self {
        self.base.insert(kind, credits);
        self
    }

    pub fn price_for(&self, kind: JobKind, model: &str) -> i64 {
        self.models
            .get(model)
            .copied()
            .unwrap_or_else(|| self.base.get(&kind).copied().unwrap_or(5))
    }
}

/// Front door for new generation jobs.
///
/// The debit happens before any network call, so a provider outage never
/// leaves a user charged without recourse: every post-debit failure unwinds
/// through the synchronizer, whose refund guard runs exactly once.
pub struct Orchestrator<S, L, N> {
    store: S,
    ledger: L,
    router: ProviderRouter,
    synchronizer: Arc<TaskSynchronizer<S, L, N>>,
    pricing: PricingTable,
    callback_url: Option<String>,
    /// Spawn a bounded poll task per submitted job. Off in tests, where the
    /// status route and scripted observations drive the lifecycle instead.
    background_poll: bool,
}

impl<S, L, N> Orchestrator<S, L, N>
where
    S: JobStore + Clone + 'static,
    L: CreditLedger + Clone + 'static,
    N: Notifier + 'static,
{
    pub fn new(
        store: S,
        ledger: L,
        router: ProviderRouter,
        synchronizer: Arc<TaskSynchronizer<S, L, N>>,
        pricing: PricingTable,
        callback_url: Option<String>,
    ) -> Self {
        Self {
            store,
            ledger,
            router,
            synchronizer,
            pricing,
            callback_url,
            background_poll: false,
        }
    }

    pub fn with_background_poll(mut self, enabled: bool) -> Self {
        self.background_poll = enabled;
        self
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    /// Submit a new generation job.
    #[instrument(skip(self, input), fields(user_id = %user_id, kind = %kind, model = %model))]
    pub async fn submit(
        &self,
        user_id: UserId,
        kind: JobKind,
        model: &str,
        input: serde_json::Value,
    ) -> GenerationResult<GenerationJob> {
        if model.trim().is_empty() {
            return Err(GenerationError::validation("model must not be empty"));
        }
        if !input.is_object() {
            return Err(GenerationError::validation("input must be a JSON object"));
        }
        // Routing failures are validation too, and they must surface before
        // any credits move.
        let gateway = self.router.for_kind(kind)?;

        let price = self.pricing.price_for(kind, model);
        let job_id = JobId::new();

        self.ledger
            .debit(
                user_id,
                price,
                job_id,
                &format!("{kind} generation ({model})"),
            )
            .await?;

        let job = GenerationJob::new(job_id, user_id, kind, model, input.clone(), price);
        if let Err(e) = self.store.insert(job.clone()).await {
            // The job row never existed, so the synchronizer cannot unwind
            // this one; put the credits back directly.
            error!(%job_id, error = %e, "job insert failed after debit, refunding");
            let _ = self
                .ledger
                .refund(user_id, price, job_id, "refund: job creation failed")
                .await;
            return Err(e);
        }

        let request = SubmitRequest {
            kind,
            model: model.to_string(),
            input,
            callback_url: self.callback_url.clone(),
        };

        match gateway.submit(&request).await {
            Ok(task_id) => {
                self.store.set_provider_task(job_id, &task_id).await?;
                info!(%job_id, %task_id, "job submitted");
                let job = self
                    .store
                    .get(job_id)
                    .await?
                    .ok_or(GenerationError::NotFound)?;

                if self.background_poll {
                    let gateway = gateway.clone();
                    let synchronizer = self.synchronizer.clone();
                    let polled = job.clone();
                    tokio::spawn(async move {
                        let budget = PollBudget::for_kind(polled.kind);
                        if let Err(e) =
                            poll_until_terminal(&gateway, synchronizer.as_ref(), &polled, budget)
                                .await
                        {
                            warn!(job_id = %polled.id, error = %e, "background poll ended with error");
                        }
                    });
                }

                Ok(job)
            }
            Err(e) => {
                warn!(%job_id, error = %e, "provider submit failed, unwinding");
                // Finalize through the synchronizer so refund and
                // notification run under the usual exactly-once guards.
                self.synchronizer
                    .apply(job_id, &TaskObservation::failed(e.to_string()))
                    .await?;
                Err(e)
            }
        }
    }
}
