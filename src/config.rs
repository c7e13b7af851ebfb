//! Gateway configuration.
//!
//! Everything is env-driven with sane defaults; `.env` files are loaded by
//! `main` before this runs. Component configs (`risk`, `router`, adapters)
//! each own their `from_env` and are composed here.

use rust_decimal::Decimal;

use crate::adapters::deribit::DeribitConfig;
use crate::adapters::integrated::IntegratedDriverConfig;
use crate::engine::OrchestratorConfig;
use crate::risk::RiskConfig;
use crate::router::RouterConfig;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub database_path: String,
    pub event_workers: usize,
    /// Feed marks older than this demote to the next source in the chain.
    pub marks_stale_after_secs: i64,
    /// Divergence between derived and snapshot positions that triggers a
    /// drift event.
    pub drift_tolerance: Decimal,
    pub binance_marks_enabled: bool,
    pub binance_mark_pairs: Vec<(String, String)>,
    /// External-adapter reconciliation cadence.
    pub oms_poll_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub snapshot_timeout_ms: u64,
    pub throttle_queue_len: usize,
    pub integrated_rate_limit_per_minute: u32,
    pub deribit_rate_limit_per_minute: u32,

    pub risk: RiskConfig,
    pub router: RouterConfig,
    pub orchestrator: OrchestratorConfig,
    pub integrated: Option<IntegratedDriverConfig>,
    pub deribit: Option<DeribitConfig>,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./omnigate.db".to_string());

        let event_workers = std::env::var("EVENT_WORKERS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&v: &usize| v > 0)
            .unwrap_or(4);

        let marks_stale_after_secs = std::env::var("MARKS_STALE_AFTER_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);

        let drift_tolerance = std::env::var("POSITION_DRIFT_TOLERANCE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| Decimal::new(1, 8));

        let binance_marks_enabled = std::env::var("BINANCE_MARKS_ENABLED")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
            .unwrap_or(true);

        let binance_mark_pairs = std::env::var("BINANCE_MARK_PAIRS")
            .unwrap_or_else(|_| "BTC-USDT,ETH-USDT,SOL-USDT".to_string())
            .split(',')
            .filter_map(|pair| {
                let (base, quote) = pair.trim().split_once('-')?;
                Some((base.to_lowercase(), quote.to_lowercase()))
            })
            .collect();

        let oms_poll_interval_ms = std::env::var("OMS_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1_500);

        let connect_timeout_ms = std::env::var("ADAPTER_CONNECT_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10_000);

        let snapshot_timeout_ms = std::env::var("ADAPTER_SNAPSHOT_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30_000);

        let throttle_queue_len = std::env::var("ADAPTER_THROTTLE_QUEUE_LEN")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(64);

        let integrated_rate_limit_per_minute = std::env::var("INTEGRATED_RATE_LIMIT_PER_MIN")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(600);

        let deribit_rate_limit_per_minute = std::env::var("DERIBIT_RATE_LIMIT_PER_MIN")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(300);

        Self {
            database_path,
            event_workers,
            marks_stale_after_secs,
            drift_tolerance,
            binance_marks_enabled,
            binance_mark_pairs,
            oms_poll_interval_ms,
            connect_timeout_ms,
            snapshot_timeout_ms,
            throttle_queue_len,
            integrated_rate_limit_per_minute,
            deribit_rate_limit_per_minute,
            risk: RiskConfig::from_env(),
            router: RouterConfig::from_env(),
            orchestrator: OrchestratorConfig::from_env(),
            integrated: IntegratedDriverConfig::from_env(),
            deribit: DeribitConfig::from_env(),
        }
    }
}
