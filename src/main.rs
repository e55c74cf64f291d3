//! Agent Arena: resolution service
//!
//! Entry point. Loads configuration, initialises structured logging,
//! opens the store, and runs the resolve→settle→refresh loop on a fixed
//! interval alongside the HTTP trigger, with graceful shutdown.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use arena::api::{self, ApiState};
use arena::config::{self, StorageBackend};
use arena::engine::resolver::{CycleReport, Resolver};
use arena::feed::polymarket::PolymarketFeed;
use arena::feed::MarketFeed;
use arena::storage::memory::MemoryStore;
use arena::storage::sqlite::SqliteStore;
use arena::storage::ResolutionStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = config::AppConfig::load("config.toml")?;

    init_logging();

    info!(
        policy = ?cfg.resolution.policy,
        settlement = ?cfg.resolution.settlement,
        stake = cfg.resolution.stake,
        interval_secs = cfg.resolution.interval_secs,
        "Agent Arena resolver starting up"
    );

    // -- Initialise components -------------------------------------------

    let store: Arc<dyn ResolutionStore> = match cfg.storage.backend {
        StorageBackend::Sqlite => {
            let store = SqliteStore::connect(&cfg.storage.database_url)
                .await
                .with_context(|| format!("Failed to open {}", cfg.storage.database_url))?;
            Arc::new(store)
        }
        StorageBackend::Memory => {
            warn!("Using in-memory store, nothing survives a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let feed = PolymarketFeed::new(
        cfg.feed.base_url.as_deref(),
        Duration::from_secs(cfg.feed.timeout_secs),
    )?;
    info!(feed = feed.name(), "Market feed ready");

    let resolver = Arc::new(Resolver::new(
        store.clone(),
        Arc::new(feed),
        cfg.settlement_calculator()?,
        cfg.resolver_config(),
    ));

    let cron_secret = cfg.cron_secret();
    if cron_secret.is_none() {
        warn!(
            env = %cfg.server.cron_secret_env,
            "No cron secret set, HTTP trigger will reject every request"
        );
    }
    let state = Arc::new(ApiState::new(resolver.clone(), store, cron_secret));

    if cfg.server.enabled {
        api::spawn_server(state.clone(), cfg.server.port).await?;
    }

    // -- Main loop -------------------------------------------------------

    let mut interval = tokio::time::interval(Duration::from_secs(cfg.resolution.interval_secs));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        interval_secs = cfg.resolution.interval_secs,
        "Entering main loop. Press Ctrl+C to stop."
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match resolver.run_cycle().await {
                    Ok(report) => {
                        log_cycle_report(&report);
                        state.record_report(report).await;
                    }
                    Err(e) => {
                        error!(error = %e, "Cycle failed, continuing to next");
                    }
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    info!("Agent Arena resolver shut down cleanly.");
    Ok(())
}

/// Log a human-readable cycle summary.
fn log_cycle_report(report: &CycleReport) {
    info!(
        cycle_id = %report.cycle_id,
        checked = report.markets_checked,
        resolved = report.markets_resolved,
        recovered = report.markets_recovered,
        settled = report.predictions_settled,
        agents = report.agents_updated,
        errors = report.error_count(),
        budget_exhausted = report.budget_exhausted,
        elapsed_ms = (report.finished_at - report.started_at).num_milliseconds(),
        "Cycle complete"
    );
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("arena=info"));

    let json_logging = std::env::var("ARENA_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
