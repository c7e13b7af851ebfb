//! Omnigate - venue-agnostic execution gateway.
//!
//! Bootstraps the orchestrator context (OMS, positions, risk, router,
//! adapter registry), connects venue adapters, wires the event pipeline,
//! and serves the API.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::middleware as axum_mw;
use clap::Parser;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use omnigate_backend::adapters::deribit::DeribitAdapter;
use omnigate_backend::adapters::integrated::IntegratedDriver;
use omnigate_backend::adapters::{
    AdapterRegistry, AdapterSupervisor, SubmitThrottle, SupervisorConfig, VenueAdapter,
};
use omnigate_backend::api::{self, ApiState};
use omnigate_backend::engine::{EventPipeline, Orchestrator};
use omnigate_backend::instrument::StaticInstrumentRegistry;
use omnigate_backend::marketdata::{BinanceMarkFeed, MarkPriceService};
use omnigate_backend::oms::{OmsStore, OrderManager};
use omnigate_backend::orders::VenueKind;
use omnigate_backend::positions::PositionTracker;
use omnigate_backend::risk::RiskEngine;
use omnigate_backend::router::SmartRouter;
use omnigate_backend::GatewayConfig;

#[derive(Parser)]
#[command(name = "omnigate", about = "Venue-agnostic execution gateway")]
struct Cli {
    #[arg(long, env = "PORT", default_value_t = 3000)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();
    let config = GatewayConfig::from_env();

    info!("🚀 Omnigate execution gateway starting");

    // Durable store shared by the OMS and the position tracker.
    let store = Arc::new(OmsStore::new(&config.database_path)?);
    info!("📊 Order store initialized at: {}", config.database_path);

    let registry = Arc::new(StaticInstrumentRegistry::new());
    let oms = Arc::new(OrderManager::new(store.clone(), registry.clone()));
    let positions = Arc::new(PositionTracker::new(store, config.drift_tolerance)?);

    // Live mark feed; risk and routing degrade gracefully without it.
    let mark_feed = if config.binance_marks_enabled {
        match BinanceMarkFeed::spawn(config.binance_mark_pairs.clone()).await {
            Ok(feed) => {
                info!("📈 Binance mark feed started");
                feed
            }
            Err(e) => {
                warn!("Failed to start Binance mark feed: {e}");
                BinanceMarkFeed::disabled()
            }
        }
    } else {
        BinanceMarkFeed::disabled()
    };
    let marks = Arc::new(MarkPriceService::new(
        registry.clone(),
        mark_feed,
        oms.clone(),
        config.marks_stale_after_secs,
    ));

    // Venue adapters.
    let adapters = Arc::new(AdapterRegistry::new());

    if let Some(integrated_config) = config.integrated.clone() {
        let driver = Arc::new(
            IntegratedDriver::new(integrated_config)
                .context("failed to build integrated driver")?,
        );
        for venue in driver.venues() {
            if let Some(throttle) = SubmitThrottle::new(
                config.integrated_rate_limit_per_minute,
                config.throttle_queue_len,
            ) {
                adapters.set_throttle(&venue, Arc::new(throttle));
            }
        }
        adapters.register(driver);
        info!("🔌 Integrated runtime driver registered");
    } else {
        info!("Integrated runtime not configured (set INTEGRATED_REST_URL)");
    }

    if let Some(deribit_config) = config.deribit.clone() {
        let adapter =
            Arc::new(DeribitAdapter::new(deribit_config).context("failed to build deribit adapter")?);
        if let Some(throttle) = SubmitThrottle::new(
            config.deribit_rate_limit_per_minute,
            config.throttle_queue_len,
        ) {
            adapters.set_throttle(adapter.venue(), Arc::new(throttle));
        }
        adapters.register(adapter);
        info!("🔌 Deribit adapter registered");
    } else {
        info!("Deribit adapter not configured (set DERIBIT_CLIENT_ID)");
    }

    // Startup connect pass: parallel, bounded, failure-tolerant.
    adapters
        .connect_all(Duration::from_millis(config.connect_timeout_ms))
        .await;

    // Supervisors own reconnects, circuit breaking, and reconciliation.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    for adapter in adapters.all() {
        let supervisor_config = SupervisorConfig {
            connect_timeout_ms: config.connect_timeout_ms,
            snapshot_timeout_ms: config.snapshot_timeout_ms,
            poll_interval_ms: (adapter.kind() == VenueKind::ExternalSdk)
                .then_some(config.oms_poll_interval_ms),
            ..Default::default()
        };
        AdapterSupervisor::spawn(
            adapter,
            oms.clone(),
            positions.clone(),
            supervisor_config,
            shutdown_rx.clone(),
        );
    }

    // Partitioned event workers keep per-venue-order ordering.
    let pipeline = EventPipeline::spawn(
        config.event_workers,
        &adapters,
        oms.clone(),
        positions.clone(),
        shutdown_rx.clone(),
    );

    let risk = Arc::new(RiskEngine::new(
        config.risk.clone(),
        oms.clone(),
        positions.clone(),
        marks.clone(),
        registry.clone(),
    ));
    let router = Arc::new(SmartRouter::new(
        config.router.clone(),
        adapters.clone(),
        marks.clone(),
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        config.orchestrator.clone(),
        oms,
        positions,
        risk,
        router,
        registry,
        adapters,
    ));

    let app = api::router(ApiState { orchestrator })
        .layer(CorsLayer::permissive())
        .layer(axum_mw::from_fn(
            omnigate_backend::middleware::request_logging,
        ));

    let addr = format!("0.0.0.0:{}", cli.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("🎯 API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Drain: stop supervisors and event pumps, give in-flight work a moment.
    info!("🛑 Shutdown requested; draining adapters");
    let _ = shutdown_tx.send(true);
    tokio::time::sleep(Duration::from_secs(2)).await;
    pipeline.abort();
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to install ctrl-c handler: {e}");
    }
}

/// Initialize tracing with enhanced observability
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "omnigate_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // 1) Standard dotenv search (cwd + parents)
    let _ = dotenv();

    // 2) Also try the crate directory .env (common when running with
    //    --manifest-path from elsewhere)
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidate = manifest_dir.join(".env");
    if candidate.exists() {
        let _ = dotenv::from_path(&candidate);
    }
}
