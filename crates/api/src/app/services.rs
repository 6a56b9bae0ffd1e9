//! Service wiring: stores, ledger, gateways, synchronizer, orchestrator.

use std::sync::Arc;

use sqlx::PgPool;
use tracing::{info, warn};

use lumagen_core::JobKind;
use lumagen_credits::{CreditLedger, InMemoryCreditLedger, PostgresCreditLedger};
use lumagen_gateway::{
    HttpMediaProbe, KieConfig, KieGateway, ProtectedGateway, ProviderRouter,
};
use lumagen_jobs::{InMemoryJobStore, JobStore, PostgresJobStore};
use lumagen_resilience::{BreakerConfig, BreakerRegistry, ProviderSemaphore};
use lumagen_sync::{
    BroadcastNotifier, Orchestrator, PricingTable, ReconcileConfig, ReconcileWorker,
    ReconcileWorkerHandle, TaskSynchronizer,
};

use crate::config::Config;

pub type DynJobStore = Arc<dyn JobStore>;
pub type DynCreditLedger = Arc<dyn CreditLedger>;
pub type AppSynchronizer = TaskSynchronizer<DynJobStore, DynCreditLedger, Arc<BroadcastNotifier>>;
pub type AppOrchestrator = Orchestrator<DynJobStore, DynCreditLedger, Arc<BroadcastNotifier>>;

pub struct AppServices {
    pub config: Config,
    pub store: DynJobStore,
    pub ledger: DynCreditLedger,
    pub router: ProviderRouter,
    pub breakers: Arc<BreakerRegistry>,
    pub notifier: Arc<BroadcastNotifier>,
    pub synchronizer: Arc<AppSynchronizer>,
    pub orchestrator: AppOrchestrator,
    /// Keeps the background sweep alive for the life of the process.
    _reconcile: Option<ReconcileWorkerHandle>,
}

/// Build services from configuration (env-driven wiring).
pub async fn build_services(config: Config) -> AppServices {
    let (store, ledger): (DynJobStore, DynCreditLedger) = if config.use_persistent_stores {
        let database_url = config
            .database_url
            .clone()
            .expect("DATABASE_URL must be set when USE_PERSISTENT_STORES=true");
        let pool = PgPool::connect(&database_url)
            .await
            .expect("failed to connect to Postgres");

        let jobs = PostgresJobStore::new(pool.clone());
        jobs.ensure_schema().await.expect("job schema");
        let credits = PostgresCreditLedger::new(pool);
        credits.ensure_schema().await.expect("ledger schema");

        info!("using persistent stores");
        (Arc::new(jobs), Arc::new(credits))
    } else {
        (InMemoryJobStore::arc(), InMemoryCreditLedger::arc())
    };

    let (router, breakers) = match &config.kie_api_key {
        Some(api_key) => {
            let mut kie_config = KieConfig::new(api_key.clone());
            if let Some(base) = &config.kie_base_url {
                kie_config = kie_config.with_base_url(base.clone());
            }
            let kie = Arc::new(KieGateway::new(
                kie_config,
                Arc::new(HttpMediaProbe::default()),
            ));
            build_router_for_gateway(&config, kie, "kie")
        }
        None => {
            warn!("KIE_API_KEY not set; no provider routes configured");
            (ProviderRouter::new(), Arc::new(BreakerRegistry::default()))
        }
    };

    build_with_router_and_breakers(config, store, ledger, router, breakers)
}

/// Wire one vendor gateway into a protected route per job kind.
///
/// Returns the router and the breaker registry backing it.
pub fn build_router_for_gateway<G>(
    config: &Config,
    gateway: Arc<G>,
    vendor: &str,
) -> (ProviderRouter, Arc<BreakerRegistry>)
where
    G: lumagen_gateway::ProviderGateway + 'static,
{
    let breakers = Arc::new(BreakerRegistry::new(BreakerConfig {
        failure_threshold: config.breaker_failure_threshold,
        cooldown: config.breaker_cooldown,
        max_cooldown: config.breaker_cooldown * 20,
    }));

    let mut router = ProviderRouter::new();
    for kind in [JobKind::Photo, JobKind::Video, JobKind::Audio] {
        let key = format!("{vendor}:{kind}");
        let protected = ProtectedGateway::new(
            gateway.clone(),
            key.clone(),
            ProviderSemaphore::new(config.provider_concurrency, key.clone()),
            breakers.breaker(&key),
            config.acquire_timeout,
            config.call_timeout,
        );
        router = router.with_gateway(kind, Arc::new(protected));
    }
    (router, breakers)
}

/// Assemble services around an already-built provider router.
///
/// Tests inject a scripted router here; production goes through
/// `build_services`.
pub fn build_with_router(
    config: Config,
    store: DynJobStore,
    ledger: DynCreditLedger,
    router: ProviderRouter,
) -> AppServices {
    build_with_router_and_breakers(config, store, ledger, router, Arc::new(BreakerRegistry::default()))
}

pub fn build_with_router_and_breakers(
    config: Config,
    store: DynJobStore,
    ledger: DynCreditLedger,
    router: ProviderRouter,
    breakers: Arc<BreakerRegistry>,
) -> AppServices {
    let notifier = Arc::new(BroadcastNotifier::default());

    let synchronizer = Arc::new(TaskSynchronizer::new(
        store.clone(),
        ledger.clone(),
        notifier.clone(),
    ));

    let orchestrator = Orchestrator::new(
        store.clone(),
        ledger.clone(),
        router.clone(),
        synchronizer.clone(),
        PricingTable::default(),
        config.callback_url.clone(),
    )
    .with_background_poll(config.background_poll_enabled);

    let reconcile = config.reconcile_enabled.then(|| {
        ReconcileWorker::spawn(
            store.clone(),
            router.clone(),
            synchronizer.clone(),
            ReconcileConfig::default(),
        )
    });

    AppServices {
        config,
        store,
        ledger,
        router,
        breakers,
        notifier,
        synchronizer,
        orchestrator,
        _reconcile: reconcile,
    }
}
