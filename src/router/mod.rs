//! Smart order router.
//!
//! Venue-bound instruments pass straight through: the venue in the canonical
//! id is authoritative. Routing instruments are scored across every eligible
//! venue on estimated all-in cost, with a deterministic tie-break so the
//! same book state always routes the same way.

pub mod algos;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::adapters::{AdapterRegistry, DepthProbe};
use crate::error::GatewayError;
use crate::instrument::InstrumentMetadata;
use crate::marketdata::MarkPriceService;
use crate::orders::{Order, Side, VenueKind};

pub use algos::{slice_algorithm_for, ChildSlice, SliceAlgorithm};

const BPS_DIVISOR: Decimal = Decimal::from_parts(10_000, 0, 0, false, 0);

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Cross-venue routing for routable instruments. When off, the advisory
    /// venue in the canonical id is used as-is.
    pub smart_execution_enabled: bool,
    /// Venue codes eligible for routing. Empty means every registered venue.
    pub venues_enabled: Vec<String>,
    /// Allow split plans across venues when the best book is too thin.
    pub allow_split: bool,
    pub depth_cache_ttl_ms: u64,
    /// Multiplier applied to sigma in the fallback slippage model.
    pub slippage_vol_factor: Decimal,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            smart_execution_enabled: true,
            venues_enabled: Vec::new(),
            allow_split: false,
            depth_cache_ttl_ms: 1_000,
            slippage_vol_factor: Decimal::new(5, 0),
        }
    }
}

impl RouterConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("ROUTER_SMART_EXECUTION_ENABLED") {
            config.smart_execution_enabled =
                matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON");
        }
        if let Ok(v) = std::env::var("ROUTER_VENUES_ENABLED") {
            config.venues_enabled = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(v) = std::env::var("ROUTER_ALLOW_SPLIT") {
            config.allow_split = matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON");
        }
        if let Ok(v) = std::env::var("ROUTER_DEPTH_CACHE_TTL_MS") {
            config.depth_cache_ttl_ms = v.parse().unwrap_or(config.depth_cache_ttl_ms);
        }
        if let Ok(v) = std::env::var("ROUTER_SLIPPAGE_VOL_FACTOR") {
            config.slippage_vol_factor = v.parse().unwrap_or(config.slippage_vol_factor);
        }

        config
    }
}

/// One leg of a route. Single-venue plans have exactly one leg.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteLeg {
    pub venue: String,
    pub venue_kind: VenueKind,
    pub quantity: Decimal,
}

#[derive(Debug, Clone)]
pub struct RoutePlan {
    pub legs: Vec<RouteLeg>,
}

impl RoutePlan {
    pub fn is_split(&self) -> bool {
        self.legs.len() > 1
    }

    pub fn primary(&self) -> &RouteLeg {
        &self.legs[0]
    }
}

#[derive(Debug, Clone)]
struct VenueScore {
    venue: String,
    venue_kind: VenueKind,
    cost: Decimal,
    latency_penalty: Decimal,
    available_depth: Option<Decimal>,
}

pub struct SmartRouter {
    config: RouterConfig,
    adapters: Arc<AdapterRegistry>,
    marks: Arc<MarkPriceService>,
    depth_cache: Mutex<HashMap<(String, String), (Instant, Option<DepthProbe>)>>,
}

impl SmartRouter {
    pub fn new(
        config: RouterConfig,
        adapters: Arc<AdapterRegistry>,
        marks: Arc<MarkPriceService>,
    ) -> Self {
        Self {
            config,
            adapters,
            marks,
            depth_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the venue (or venues) an order executes on.
    pub async fn route(
        &self,
        order: &Order,
        metadata: &InstrumentMetadata,
    ) -> Result<RoutePlan, GatewayError> {
        // Venue-bound instruments: the id decides, we only resolve the kind.
        if !order.canonical_id.is_routable() {
            let venue = order
                .canonical_id
                .venue()
                .expect("venue-bound id always carries a venue")
                .to_string();
            let adapter = self.adapters.adapter_for_venue(&venue).ok_or_else(|| {
                GatewayError::RouteUnavailable(format!("no adapter registered for venue {venue}"))
            })?;
            return Ok(RoutePlan {
                legs: vec![RouteLeg {
                    venue,
                    venue_kind: adapter.kind(),
                    quantity: order.quantity,
                }],
            });
        }

        if !self.config.smart_execution_enabled {
            let Some(venue) = order.canonical_id.venue().map(str::to_string) else {
                return Err(GatewayError::RouteUnavailable(
                    "smart routing disabled and no advisory venue in canonical id".to_string(),
                ));
            };
            let adapter = self.adapters.adapter_for_venue(&venue).ok_or_else(|| {
                GatewayError::RouteUnavailable(format!("no adapter registered for venue {venue}"))
            })?;
            return Ok(RoutePlan {
                legs: vec![RouteLeg {
                    venue,
                    venue_kind: adapter.kind(),
                    quantity: order.quantity,
                }],
            });
        }

        let mut scores = Vec::new();
        for venue in self.eligible_venues(order) {
            match self.score_venue(&venue, order).await {
                Some(score) => scores.push(score),
                None => debug!(venue = %venue, "venue not scoreable for this order; skipped"),
            }
        }
        if scores.is_empty() {
            return Err(GatewayError::RouteUnavailable(format!(
                "no eligible venue offers {}",
                order.canonical_id
            )));
        }

        // Lowest cost wins; ties break on latency, then venue code.
        scores.sort_by(|a, b| {
            a.cost
                .cmp(&b.cost)
                .then(a.latency_penalty.cmp(&b.latency_penalty))
                .then(a.venue.cmp(&b.venue))
        });

        let best = &scores[0];
        info!(
            operation_id = %order.operation_id,
            venue = %best.venue,
            cost = %best.cost,
            candidates = scores.len(),
            "routed order"
        );

        let thin_book = best
            .available_depth
            .map(|depth| depth < order.quantity)
            .unwrap_or(false);
        if self.config.allow_split && thin_book && scores.len() > 1 {
            if let Some(plan) = self.split_plan(order, &scores, metadata) {
                return Ok(plan);
            }
        }

        Ok(RoutePlan {
            legs: vec![RouteLeg {
                venue: best.venue.clone(),
                venue_kind: best.venue_kind,
                quantity: order.quantity,
            }],
        })
    }

    fn eligible_venues(&self, order: &Order) -> Vec<String> {
        self.adapters
            .venues()
            .into_iter()
            .filter(|venue| {
                self.config.venues_enabled.is_empty()
                    || self.config.venues_enabled.iter().any(|v| v == venue)
            })
            .filter(|venue| {
                self.adapters
                    .adapter_for_venue(venue)
                    .map(|adapter| adapter.supports(&order.canonical_id))
                    .unwrap_or(false)
            })
            .collect()
    }

    async fn score_venue(&self, venue: &str, order: &Order) -> Option<VenueScore> {
        let adapter = self.adapters.adapter_for_venue(venue)?;
        let mark = self.marks.mark(&order.canonical_id)?;
        let notional = order.quantity.abs() * mark;

        let fee = notional * adapter.taker_fee_bps() / BPS_DIVISOR;
        let probe = self.probe_depth(venue, order).await;
        let available_depth = probe.as_ref().map(|p| p.available(order.side));
        let slippage = match probe.as_ref() {
            Some(probe) => walk_book_slippage(probe, order.side, order.quantity, mark),
            None => self.fallback_slippage(order, mark),
        };

        Some(VenueScore {
            venue: venue.to_string(),
            venue_kind: adapter.kind(),
            cost: fee + slippage + adapter.latency_penalty() + adapter.gas_cost(),
            latency_penalty: adapter.latency_penalty(),
            available_depth,
        })
    }

    /// Book probe with a short TTL cache so repeated routing decisions in a
    /// burst reuse one snapshot.
    async fn probe_depth(&self, venue: &str, order: &Order) -> Option<DepthProbe> {
        let key = (venue.to_string(), order.canonical_id.render());
        let ttl = Duration::from_millis(self.config.depth_cache_ttl_ms);

        if let Some((at, probe)) = self.depth_cache.lock().get(&key) {
            if at.elapsed() <= ttl {
                return probe.clone();
            }
        }

        let adapter = self.adapters.adapter_for_venue(venue)?;
        let probe = match adapter.book_depth(&order.canonical_id).await {
            Ok(probe) => probe,
            Err(e) => {
                warn!(venue = %venue, error = %e, "depth probe failed");
                None
            }
        };
        self.depth_cache
            .lock()
            .insert(key, (Instant::now(), probe.clone()));
        probe
    }

    /// Linear model keyed on recent volatility, used when no book is
    /// available: slippage ~ notional * sigma * factor.
    fn fallback_slippage(&self, order: &Order, mark: Decimal) -> Decimal {
        let sigma = self
            .marks
            .sigma(&order.canonical_id)
            .unwrap_or(Decimal::new(1, 4));
        order.quantity.abs() * mark * sigma * self.config.slippage_vol_factor
    }

    /// Allocate the parent quantity across venues by probed depth, best
    /// venue first. Legs floor to size precision; any residual lands on the
    /// best venue so the legs always sum to the parent quantity.
    fn split_plan(
        &self,
        order: &Order,
        scores: &[VenueScore],
        metadata: &InstrumentMetadata,
    ) -> Option<RoutePlan> {
        let mut remaining = order.quantity;
        let mut legs: Vec<RouteLeg> = Vec::new();

        for score in scores {
            if remaining <= Decimal::ZERO {
                break;
            }
            let available = score.available_depth.unwrap_or(remaining);
            let take = remaining
                .min(available)
                .round_dp_with_strategy(
                    metadata.size_precision,
                    rust_decimal::RoundingStrategy::ToZero,
                );
            if take <= Decimal::ZERO {
                continue;
            }
            legs.push(RouteLeg {
                venue: score.venue.clone(),
                venue_kind: score.venue_kind,
                quantity: take,
            });
            remaining -= take;
        }

        if legs.is_empty() {
            return None;
        }
        if remaining > Decimal::ZERO {
            legs[0].quantity += remaining;
        }

        debug!(
            operation_id = %order.operation_id,
            legs = legs.len(),
            "split plan created"
        );
        Some(RoutePlan { legs })
    }
}

/// Average execution premium over mark when taking `quantity` from the book.
fn walk_book_slippage(
    probe: &DepthProbe,
    side: Side,
    quantity: Decimal,
    mark: Decimal,
) -> Decimal {
    let levels = match side {
        Side::Buy | Side::Back => &probe.asks,
        _ => &probe.bids,
    };
    if levels.is_empty() {
        return Decimal::ZERO;
    }

    let mut remaining = quantity.abs();
    let mut cost = Decimal::ZERO;
    for (price, size) in levels {
        if remaining <= Decimal::ZERO {
            break;
        }
        let take = remaining.min(*size);
        cost += take * *price;
        remaining -= take;
    }
    // Unfillable tail priced at the worst visible level.
    if remaining > Decimal::ZERO {
        if let Some((price, _)) = levels.last() {
            cost += remaining * *price;
        }
    }

    let reference = quantity.abs() * mark;
    (cost - reference).abs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    #[test]
    fn test_walk_book_slippage() {
        let probe = DepthProbe {
            bids: vec![(dec!(99), dec!(1))],
            asks: vec![(dec!(101), dec!(1)), (dec!(102), dec!(2))],
            captured_at: Utc::now(),
        };
        // Buying 2 at 101/102 against a mark of 100 costs 203 vs 200.
        let slip = walk_book_slippage(&probe, Side::Buy, dec!(2), dec!(100));
        assert_eq!(slip, dec!(3));
    }

    #[test]
    fn test_depth_available() {
        let probe = DepthProbe {
            bids: vec![(dec!(99), dec!(5))],
            asks: vec![(dec!(101), dec!(1)), (dec!(102), dec!(2))],
            captured_at: Utc::now(),
        };
        assert_eq!(probe.available(Side::Buy), dec!(3));
        assert_eq!(probe.available(Side::Sell), dec!(5));
    }
}
