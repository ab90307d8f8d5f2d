//! Dispatch API service.
//!
//! Wires the dispatch core together and exposes it over HTTP:
//!
//! ```text
//! POST /jobs                  enqueue a mail job (idempotent)
//! DELETE /jobs/{id}           cancel a pending job
//! POST /scheduler/process     drain due jobs once (cron-triggered)
//! POST /disaster-bank/process run one recovery sweep (cron-triggered)
//! POST /health-check          run one self-repair sweep (cron-triggered)
//! POST /flags/suspend         flip the operator kill switch
//! GET  /health                liveness probe
//! GET  /metrics               Prometheus metrics
//! ```
//!
//! The cron-triggered and operator endpoints require the shared secret
//! from `CRON_SECRET` in the `x-cron-secret` header.

mod routes;

pub use routes::{router, AppState};

use core_config::dispatch::DispatchTuning;
use core_config::{env_or_default, env_required, Environment, FromEnv};
use docstore::{DocumentStore, MemoryStore};
use domain_dispatch::{
    metrics, BreakerConfig, CircuitBreaker, DisasterBank, DisasterConfig, HealthCheck,
    HealthConfig, HttpTransport, HttpTransportConfig, LockManager, MailScheduler, ProviderCache,
    ProviderRegistry, ProviderSeed, QuotaTracker, SchedulerConfig, SmartSender, TemplateEngine,
};
use eyre::{Result, WrapErr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;

/// Build the full dispatch stack over the given store.
pub fn build_state(
    store: Arc<dyn DocumentStore>,
    tuning: &DispatchTuning,
    cron_secret: String,
) -> Result<AppState> {
    let quota = QuotaTracker::new(store.clone());
    let breaker = CircuitBreaker::new(store.clone(), BreakerConfig::from(tuning));
    let cache = Arc::new(ProviderCache::new(Duration::from_secs(
        tuning.provider_cache_ttl_secs,
    )));
    let registry = ProviderRegistry::new(store.clone(), quota.clone(), breaker.clone(), cache);
    let transport = Arc::new(
        HttpTransport::new(HttpTransportConfig::from_env())
            .wrap_err("Failed to build mail transport")?,
    );
    let sender = SmartSender::new(
        registry.clone(),
        breaker.clone(),
        quota,
        transport,
        tuning,
    );
    let templates = Arc::new(TemplateEngine::new());
    let disaster = DisasterBank::new(store.clone(), DisasterConfig::from(tuning));
    let scheduler = MailScheduler::new(
        store.clone(),
        registry.clone(),
        sender.clone(),
        templates.clone(),
        disaster.clone(),
        SchedulerConfig::from(tuning),
    );
    let health = HealthCheck::new(store.clone(), HealthConfig::from(tuning));
    let locks = LockManager::new(store.clone());

    Ok(AppState {
        store,
        scheduler,
        disaster,
        sender,
        templates,
        health,
        locks,
        registry,
        tuning: tuning.clone(),
        cron_secret: Arc::new(cron_secret),
    })
}

/// Run the dispatch API service.
pub async fn run() -> Result<()> {
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);
    metrics::init_metrics();

    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "Starting dispatch API"
    );
    info!("Environment: {:?}", environment);

    let tuning = DispatchTuning::from_env().wrap_err("Failed to load dispatch tuning")?;
    let cron_secret = env_required("CRON_SECRET").wrap_err("CRON_SECRET must be set")?;

    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let state = build_state(store.clone(), &tuning, cron_secret)?;

    let seeds = ProviderSeed::from_env().wrap_err("Failed to parse MAIL_PROVIDERS")?;
    if !seeds.is_empty() {
        let created = state
            .registry
            .seed(seeds, chrono::Utc::now())
            .await
            .map_err(|e| eyre::eyre!("{e}"))?;
        info!(created, "Provider seeding complete");
    }

    let port: u16 = env_or_default("PORT", "8080").parse().unwrap_or(8080);
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind {addr}"))?;
    info!(port, "Dispatch API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .wrap_err("Server failed")?;

    info!("Dispatch API stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }
}
