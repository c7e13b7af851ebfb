//! Pre-trade risk engine.
//!
//! Runs synchronously in the request path against the OMS (velocity), the
//! position tracker (exposure), and the mark chain. Every check is driven
//! by config; a check with no configured limit is a no-op. The whole pass
//! runs under a hard deadline; overrunning it is itself a denial.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, warn};

use crate::instrument::{CanonicalId, InstrumentKind, InstrumentRegistry};
use crate::marketdata::MarkPriceService;
use crate::oms::OrderManager;
use crate::orders::{Operation, Order, OrderType};
use crate::positions::PositionTracker;

const BPS_DIVISOR: Decimal = Decimal::from_parts(10_000, 0, 0, false, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskReason {
    Velocity,
    PositionCap,
    ExposureCap,
    PriceTolerance,
    OrderShape,
    NotPermitted,
    RiskTimeout,
}

impl RiskReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Velocity => "VELOCITY",
            Self::PositionCap => "POSITION_CAP",
            Self::ExposureCap => "EXPOSURE_CAP",
            Self::PriceTolerance => "PRICE_TOLERANCE",
            Self::OrderShape => "ORDER_SHAPE",
            Self::NotPermitted => "NOT_PERMITTED",
            Self::RiskTimeout => "RISK_TIMEOUT",
        }
    }
}

impl std::fmt::Display for RiskReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum RiskDecision {
    Allow,
    Deny { reason: RiskReason, detail: String },
}

impl RiskDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    fn deny(reason: RiskReason, detail: impl Into<String>) -> Self {
        Self::Deny {
            reason,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// Master switch. Disabled means every order passes untouched.
    pub enabled: bool,
    pub max_orders_per_second: Option<u32>,
    pub max_orders_per_minute: Option<u32>,
    /// Notional cap per canonical id.
    pub max_position_per_instrument: Option<Decimal>,
    /// Cap on total notional across all positions.
    pub max_total_notional: Option<Decimal>,
    /// LIMIT price must sit within this many bps of mark.
    pub price_tolerance_bps: Option<Decimal>,
    /// Per-strategy operation whitelist. Absent strategy means all allowed.
    pub allowed_operations: HashMap<String, HashSet<Operation>>,
    pub timeout_ms: u64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_orders_per_second: None,
            max_orders_per_minute: None,
            max_position_per_instrument: None,
            max_total_notional: None,
            price_tolerance_bps: None,
            allowed_operations: HashMap::new(),
            timeout_ms: 50,
        }
    }
}

impl RiskConfig {
    /// Load from environment with defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("RISK_ENABLED") {
            config.enabled = matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON");
        }
        if let Ok(v) = std::env::var("RISK_MAX_ORDERS_PER_SECOND") {
            config.max_orders_per_second = v.parse().ok();
        }
        if let Ok(v) = std::env::var("RISK_MAX_ORDERS_PER_MINUTE") {
            config.max_orders_per_minute = v.parse().ok();
        }
        if let Ok(v) = std::env::var("RISK_MAX_POSITION_PER_INSTRUMENT") {
            config.max_position_per_instrument = v.parse().ok();
        }
        if let Ok(v) = std::env::var("RISK_MAX_TOTAL_NOTIONAL") {
            config.max_total_notional = v.parse().ok();
        }
        if let Ok(v) = std::env::var("RISK_PRICE_TOLERANCE_BPS") {
            config.price_tolerance_bps = v.parse().ok();
        }
        if let Ok(v) = std::env::var("RISK_TIMEOUT_MS") {
            config.timeout_ms = v.parse().unwrap_or(config.timeout_ms);
        }
        // Format: "s1:trade|bet,s2:supply|borrow". A literal "*" allows all.
        if let Ok(raw) = std::env::var("RISK_ALLOWED_OPERATIONS") {
            for entry in raw.split(',').filter(|e| !e.trim().is_empty()) {
                let Some((strategy, ops)) = entry.split_once(':') else {
                    warn!(entry, "malformed RISK_ALLOWED_OPERATIONS entry; skipped");
                    continue;
                };
                if ops.trim() == "*" {
                    continue;
                }
                let parsed: HashSet<Operation> = ops
                    .split('|')
                    .filter_map(|op| Operation::parse(op.trim()))
                    .collect();
                config
                    .allowed_operations
                    .insert(strategy.trim().to_string(), parsed);
            }
        }

        config
    }
}

pub struct RiskEngine {
    config: RiskConfig,
    oms: Arc<OrderManager>,
    positions: Arc<PositionTracker>,
    marks: Arc<MarkPriceService>,
    registry: Arc<dyn InstrumentRegistry>,
}

impl RiskEngine {
    pub fn new(
        config: RiskConfig,
        oms: Arc<OrderManager>,
        positions: Arc<PositionTracker>,
        marks: Arc<MarkPriceService>,
        registry: Arc<dyn InstrumentRegistry>,
    ) -> Self {
        Self {
            config,
            oms,
            positions,
            marks,
            registry,
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Run the full pass under the configured deadline. The checks do
    /// blocking DB work, so they run on the blocking pool and the deadline
    /// is enforced on the join handle.
    pub async fn check(self: Arc<Self>, order: &Order) -> RiskDecision {
        if !self.config.enabled {
            return RiskDecision::Allow;
        }

        let started = std::time::Instant::now();
        let engine = Arc::clone(&self);
        let order = order.clone();
        let handle = tokio::task::spawn_blocking(move || engine.run_checks(&order));

        let decision = match tokio::time::timeout(
            StdDuration::from_millis(self.config.timeout_ms),
            handle,
        )
        .await
        {
            Ok(Ok(decision)) => decision,
            Ok(Err(join_err)) => {
                warn!(error = %join_err, "risk check task failed");
                RiskDecision::deny(RiskReason::RiskTimeout, "risk check task failed")
            }
            Err(_) => RiskDecision::deny(
                RiskReason::RiskTimeout,
                format!("risk budget of {}ms exhausted", self.config.timeout_ms),
            ),
        };

        metrics::histogram!("risk_check_seconds", started.elapsed().as_secs_f64());
        if let RiskDecision::Deny { reason, detail } = &decision {
            warn!(reason = reason.as_str(), detail = %detail, "risk denied order");
            metrics::increment_counter!("risk_denials_total", "reason" => reason.as_str());
        }
        decision
    }

    fn run_checks(&self, order: &Order) -> RiskDecision {
        if let Some(denied) = self.check_shape(order) {
            return denied;
        }
        if let Some(denied) = self.check_velocity(order) {
            return denied;
        }
        if let Some(denied) = self.check_instrument_cap(order) {
            return denied;
        }
        if let Some(denied) = self.check_total_notional(order) {
            return denied;
        }
        if let Some(denied) = self.check_price_tolerance(order) {
            return denied;
        }
        if let Some(denied) = self.check_operation_whitelist(order) {
            return denied;
        }
        RiskDecision::Allow
    }

    fn check_shape(&self, order: &Order) -> Option<RiskDecision> {
        if order.quantity <= Decimal::ZERO {
            return Some(RiskDecision::deny(
                RiskReason::OrderShape,
                format!("quantity {} must be positive", order.quantity),
            ));
        }
        if order.order_type == OrderType::Limit {
            match order.price {
                Some(price) if price > Decimal::ZERO => {}
                _ => {
                    return Some(RiskDecision::deny(
                        RiskReason::OrderShape,
                        "LIMIT order requires a positive price",
                    ));
                }
            }
        }
        if order.operation == Operation::Bet && order.selection.is_none() {
            return Some(RiskDecision::deny(
                RiskReason::OrderShape,
                "bet requires a selection",
            ));
        }

        if let Some(meta) = self.registry.lookup(&order.canonical_id) {
            if meta.min_size > Decimal::ZERO && order.quantity < meta.min_size {
                return Some(RiskDecision::deny(
                    RiskReason::OrderShape,
                    format!("quantity {} below min size {}", order.quantity, meta.min_size),
                ));
            }
            if order.quantity.normalize().scale() > meta.size_precision {
                return Some(RiskDecision::deny(
                    RiskReason::OrderShape,
                    format!(
                        "quantity {} not representable at {} decimals",
                        order.quantity, meta.size_precision
                    ),
                ));
            }
            if let Some(price) = order.price {
                if price.normalize().scale() > meta.price_precision {
                    return Some(RiskDecision::deny(
                        RiskReason::OrderShape,
                        format!(
                            "price {} not representable at {} decimals",
                            price, meta.price_precision
                        ),
                    ));
                }
            }
        }
        None
    }

    fn check_velocity(&self, order: &Order) -> Option<RiskDecision> {
        let windows = [
            (self.config.max_orders_per_second, Duration::seconds(1), "1s"),
            (self.config.max_orders_per_minute, Duration::seconds(60), "1m"),
        ];
        for (cap, window, label) in windows {
            let Some(cap) = cap else { continue };
            match self.oms.count_created_within(&order.strategy_id, window) {
                Ok(count) if count >= cap => {
                    return Some(RiskDecision::deny(
                        RiskReason::Velocity,
                        format!(
                            "{} orders in the last {} (cap {}) for strategy {}",
                            count, label, cap, order.strategy_id
                        ),
                    ));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "velocity query failed; denying conservatively");
                    return Some(RiskDecision::deny(
                        RiskReason::Velocity,
                        "velocity query failed",
                    ));
                }
            }
        }
        None
    }

    fn check_instrument_cap(&self, order: &Order) -> Option<RiskDecision> {
        let cap = self.config.max_position_per_instrument?;
        let Some(mark) = self.order_reference_price(order) else {
            debug!(canonical_id = %order.canonical_id, "no mark for instrument cap; skipped");
            return None;
        };

        let held = self.instrument_exposure(&order.canonical_id);
        let projected = (held + order.quantity * order.side.sign()).abs() * mark;
        if projected > cap {
            return Some(RiskDecision::deny(
                RiskReason::PositionCap,
                format!(
                    "projected notional {} for {} exceeds per-instrument cap {}",
                    projected, order.canonical_id, cap
                ),
            ));
        }
        None
    }

    fn check_total_notional(&self, order: &Order) -> Option<RiskDecision> {
        let cap = self.config.max_total_notional?;

        let mut total = Decimal::ZERO;
        for record in self.positions.snapshot() {
            if record.aggregated_quantity.is_zero() {
                continue;
            }
            let mark = record.last_mark_price.or_else(|| {
                CanonicalId::parse(&record.position_key)
                    .ok()
                    .and_then(|id| self.marks.mark(&id))
            });
            match mark {
                Some(mark) => total += record.aggregated_quantity.abs() * mark,
                None => {
                    warn!(
                        position_key = %record.position_key,
                        "no mark for position; excluded from exposure total"
                    );
                }
            }
        }
        if let Some(mark) = self.order_reference_price(order) {
            total += order.quantity.abs() * mark;
        }

        if total > cap {
            return Some(RiskDecision::deny(
                RiskReason::ExposureCap,
                format!("total notional {} exceeds cap {}", total, cap),
            ));
        }
        None
    }

    fn check_price_tolerance(&self, order: &Order) -> Option<RiskDecision> {
        let tolerance_bps = self.config.price_tolerance_bps?;
        if order.order_type != OrderType::Limit {
            return None;
        }
        let price = order.price?;
        let Some(mark) = self.marks.mark(&order.canonical_id) else {
            debug!(canonical_id = %order.canonical_id, "no mark for price tolerance; skipped");
            return None;
        };
        if mark.is_zero() {
            return None;
        }

        let deviation_bps = ((price - mark).abs() / mark) * BPS_DIVISOR;
        if deviation_bps > tolerance_bps {
            return Some(RiskDecision::deny(
                RiskReason::PriceTolerance,
                format!(
                    "limit price {} deviates {:.0} bps from mark {} (tolerance {} bps)",
                    price, deviation_bps, mark, tolerance_bps
                ),
            ));
        }
        None
    }

    fn check_operation_whitelist(&self, order: &Order) -> Option<RiskDecision> {
        let allowed = self.config.allowed_operations.get(&order.strategy_id)?;
        if allowed.contains(&order.operation) {
            return None;
        }
        Some(RiskDecision::deny(
            RiskReason::NotPermitted,
            format!(
                "operation '{}' not permitted for strategy {}",
                order.operation.as_str(),
                order.strategy_id
            ),
        ))
    }

    /// Price used to convert the order quantity into notional: limit price
    /// first, then the mark chain.
    fn order_reference_price(&self, order: &Order) -> Option<Decimal> {
        order.price.or_else(|| self.marks.mark(&order.canonical_id))
    }

    /// Current signed exposure attributable to one canonical id.
    fn instrument_exposure(&self, id: &CanonicalId) -> Decimal {
        if id.kind() == InstrumentKind::SpotPair {
            return self.positions.aggregate(id.base());
        }
        self.positions
            .snapshot()
            .into_iter()
            .filter(|record| record.position_key.starts_with(&id.render()))
            .map(|record| record.aggregated_quantity)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{InstrumentMetadata, StaticInstrumentRegistry};
    use crate::marketdata::BinanceMarkFeed;
    use crate::oms::OmsStore;
    use crate::orders::{OrderStatus, Side, TimeInForce, VenueKind};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    struct Harness {
        engine: Arc<RiskEngine>,
        oms: Arc<OrderManager>,
        registry: Arc<StaticInstrumentRegistry>,
    }

    fn harness(config: RiskConfig) -> Harness {
        let store = Arc::new(OmsStore::in_memory().unwrap());
        let registry = Arc::new(StaticInstrumentRegistry::new());
        let oms = Arc::new(OrderManager::new(store.clone(), registry.clone()));
        let positions = Arc::new(PositionTracker::new(store, dec!(0.00000001)).unwrap());
        let marks = Arc::new(MarkPriceService::new(
            registry.clone(),
            BinanceMarkFeed::disabled(),
            oms.clone(),
            5,
        ));
        let engine = Arc::new(RiskEngine::new(
            config,
            oms.clone(),
            positions,
            marks,
            registry.clone(),
        ));
        Harness {
            engine,
            oms,
            registry,
        }
    }

    fn sample_order(operation_id: &str) -> Order {
        Order {
            operation_id: operation_id.to_string(),
            operation: Operation::Trade,
            canonical_id: CanonicalId::parse("BINANCE-SPOT:SPOT_PAIR:BTC-USDT").unwrap(),
            venue: None,
            venue_kind: Some(VenueKind::Integrated),
            venue_order_id: None,
            side: Side::Buy,
            quantity: dec!(0.5),
            price: None,
            order_type: OrderType::Market,
            time_in_force: Some(TimeInForce::Gtc),
            exec_algorithm: None,
            exec_algorithm_params: None,
            status: OrderStatus::Pending,
            fills: Vec::new(),
            expected_deltas: None,
            atomic_group_id: None,
            sequence_in_group: None,
            parent_operation_id: None,
            odds: None,
            selection: None,
            potential_payout: None,
            rejection_reason: None,
            error_message: None,
            strategy_id: "s1".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_disabled_engine_allows_everything() {
        let h = harness(RiskConfig {
            enabled: false,
            ..Default::default()
        });
        let mut order = sample_order("op-1");
        order.quantity = dec!(-5); // would fail shape
        assert!(h.engine.clone().check(&order).await.is_allowed());
    }

    #[tokio::test]
    async fn test_shape_rejects_nonpositive_quantity() {
        let h = harness(RiskConfig::default());
        let mut order = sample_order("op-1");
        order.quantity = Decimal::ZERO;
        let decision = h.engine.clone().check(&order).await;
        assert!(matches!(
            decision,
            RiskDecision::Deny {
                reason: RiskReason::OrderShape,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_shape_rejects_limit_without_price() {
        let h = harness(RiskConfig::default());
        let mut order = sample_order("op-1");
        order.order_type = OrderType::Limit;
        let decision = h.engine.clone().check(&order).await;
        assert!(matches!(
            decision,
            RiskDecision::Deny {
                reason: RiskReason::OrderShape,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_shape_enforces_min_size() {
        let h = harness(RiskConfig::default());
        let order = sample_order("op-1");
        h.registry.insert(
            &order.canonical_id,
            InstrumentMetadata {
                min_size: dec!(1.0),
                ..Default::default()
            },
        );
        let decision = h.engine.clone().check(&order).await;
        assert!(matches!(
            decision,
            RiskDecision::Deny {
                reason: RiskReason::OrderShape,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_velocity_denies_third_order_in_window() {
        let h = harness(RiskConfig {
            max_orders_per_second: Some(2),
            ..Default::default()
        });
        h.oms.create(&sample_order("op-1")).unwrap();
        h.oms.create(&sample_order("op-2")).unwrap();

        let decision = h.engine.clone().check(&sample_order("op-3")).await;
        assert!(matches!(
            decision,
            RiskDecision::Deny {
                reason: RiskReason::Velocity,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_price_tolerance_uses_mark() {
        let h = harness(RiskConfig {
            price_tolerance_bps: Some(dec!(100)),
            ..Default::default()
        });
        let mut order = sample_order("op-1");
        order.order_type = OrderType::Limit;
        order.price = Some(dec!(40000));
        h.registry.set_mark(&order.canonical_id, dec!(30000));

        let decision = h.engine.clone().check(&order).await;
        assert!(matches!(
            decision,
            RiskDecision::Deny {
                reason: RiskReason::PriceTolerance,
                ..
            }
        ));

        let mut near = sample_order("op-2");
        near.order_type = OrderType::Limit;
        near.price = Some(dec!(30010));
        assert!(h.engine.clone().check(&near).await.is_allowed());
    }

    #[tokio::test]
    async fn test_operation_whitelist() {
        let mut allowed = HashMap::new();
        allowed.insert(
            "s1".to_string(),
            [Operation::Trade].into_iter().collect::<HashSet<_>>(),
        );
        let h = harness(RiskConfig {
            allowed_operations: allowed,
            ..Default::default()
        });

        assert!(h.engine.clone().check(&sample_order("op-1")).await.is_allowed());

        let mut bet = sample_order("op-2");
        bet.operation = Operation::Bet;
        bet.side = Side::Back;
        bet.selection = Some("HOME".to_string());
        bet.odds = Some(dec!(2.0));
        let decision = h.engine.clone().check(&bet).await;
        assert!(matches!(
            decision,
            RiskDecision::Deny {
                reason: RiskReason::NotPermitted,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_exposure_cap_counts_order_notional() {
        let h = harness(RiskConfig {
            max_total_notional: Some(dec!(10000)),
            ..Default::default()
        });
        let mut order = sample_order("op-1");
        order.order_type = OrderType::Limit;
        order.price = Some(dec!(30000));
        order.quantity = dec!(1.0);

        let decision = h.engine.clone().check(&order).await;
        assert!(matches!(
            decision,
            RiskDecision::Deny {
                reason: RiskReason::ExposureCap,
                ..
            }
        ));
    }
}
