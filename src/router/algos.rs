//! Execution algorithms.
//!
//! These plug in after venue selection: the router picks where, the
//! algorithm picks the slice schedule. Each algorithm turns one parent
//! order into a sequence of child submissions with target times; the
//! orchestrator owns the actual scheduling.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::Value;
use tracing::warn;

use crate::orders::{ExecAlgorithm, Order};

/// One child submission in a slice schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildSlice {
    pub quantity: Decimal,
    pub at: DateTime<Utc>,
    /// Override for the child's limit price, where the algorithm sets one.
    pub limit_price: Option<Decimal>,
}

pub trait SliceAlgorithm: Send + Sync {
    /// Produce the slice schedule for `order` on `venue`, anchored at `now`.
    /// Slices always sum to the parent quantity.
    fn slices(&self, order: &Order, venue: &str, now: DateTime<Utc>) -> Vec<ChildSlice>;

    fn name(&self) -> &'static str;
}

/// Resolve the configured algorithm, if any. `NORMAL` (and absence) mean no
/// slicing.
pub fn slice_algorithm_for(
    algo: Option<ExecAlgorithm>,
    params: Option<&Value>,
    size_precision: u32,
) -> Option<Box<dyn SliceAlgorithm>> {
    match algo? {
        ExecAlgorithm::Normal => None,
        ExecAlgorithm::Twap => Some(Box::new(TwapSlicer::from_params(params, size_precision))),
        ExecAlgorithm::Vwap => Some(Box::new(VwapSlicer::from_params(params, size_precision))),
        ExecAlgorithm::Iceberg => {
            Some(Box::new(IcebergSlicer::from_params(params, size_precision)))
        }
    }
}

fn param_u64(params: Option<&Value>, key: &str, default: u64) -> u64 {
    params
        .and_then(|p| p.get(key))
        .and_then(Value::as_u64)
        .unwrap_or(default)
}

fn param_decimal(params: Option<&Value>, key: &str) -> Option<Decimal> {
    let value = params?.get(key)?;
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_f64().and_then(Decimal::from_f64_retain),
        _ => None,
    }
}

fn floor_to_precision(value: Decimal, precision: u32) -> Decimal {
    value.round_dp_with_strategy(precision, RoundingStrategy::ToZero)
}

/// Even slices over a fixed horizon.
pub struct TwapSlicer {
    duration_secs: u64,
    slice_count: u64,
    size_precision: u32,
}

impl TwapSlicer {
    fn from_params(params: Option<&Value>, size_precision: u32) -> Self {
        Self {
            duration_secs: param_u64(params, "duration_secs", 300),
            slice_count: param_u64(params, "slices", 10).max(1),
            size_precision,
        }
    }
}

impl SliceAlgorithm for TwapSlicer {
    fn slices(&self, order: &Order, _venue: &str, now: DateTime<Utc>) -> Vec<ChildSlice> {
        let count = self.slice_count;
        let interval = Duration::milliseconds((self.duration_secs * 1000 / count) as i64);
        let even = floor_to_precision(
            order.quantity / Decimal::from(count),
            self.size_precision,
        );

        let mut slices = Vec::with_capacity(count as usize);
        let mut allocated = Decimal::ZERO;
        for i in 0..count {
            let quantity = if i == count - 1 {
                order.quantity - allocated
            } else {
                even
            };
            if quantity <= Decimal::ZERO {
                continue;
            }
            allocated += quantity;
            slices.push(ChildSlice {
                quantity,
                at: now + interval * i as i32,
                limit_price: order.price,
            });
        }
        slices
    }

    fn name(&self) -> &'static str {
        "TWAP"
    }
}

/// Volume-curve weighted slices. The default curve is the usual U shape:
/// heavy at the open and close of the horizon.
pub struct VwapSlicer {
    duration_secs: u64,
    curve: Vec<Decimal>,
    size_precision: u32,
}

impl VwapSlicer {
    fn from_params(params: Option<&Value>, size_precision: u32) -> Self {
        let curve = params
            .and_then(|p| p.get("curve"))
            .and_then(Value::as_array)
            .map(|weights| {
                weights
                    .iter()
                    .filter_map(|w| w.as_f64().and_then(Decimal::from_f64_retain))
                    .filter(|w| *w > Decimal::ZERO)
                    .collect::<Vec<_>>()
            })
            .filter(|c: &Vec<Decimal>| !c.is_empty())
            .unwrap_or_else(|| {
                ["0.25", "0.15", "0.10", "0.10", "0.15", "0.25"]
                    .iter()
                    .map(|w| w.parse().expect("static curve weights"))
                    .collect()
            });

        Self {
            duration_secs: param_u64(params, "duration_secs", 300),
            curve,
            size_precision,
        }
    }
}

impl SliceAlgorithm for VwapSlicer {
    fn slices(&self, order: &Order, _venue: &str, now: DateTime<Utc>) -> Vec<ChildSlice> {
        let total_weight: Decimal = self.curve.iter().copied().sum();
        if total_weight.is_zero() {
            warn!("vwap curve weights sum to zero; falling back to one slice");
            return vec![ChildSlice {
                quantity: order.quantity,
                at: now,
                limit_price: order.price,
            }];
        }

        let count = self.curve.len();
        let interval = Duration::milliseconds((self.duration_secs * 1000 / count as u64) as i64);
        let mut slices = Vec::with_capacity(count);
        let mut allocated = Decimal::ZERO;
        for (i, weight) in self.curve.iter().enumerate() {
            let quantity = if i == count - 1 {
                order.quantity - allocated
            } else {
                floor_to_precision(
                    order.quantity * *weight / total_weight,
                    self.size_precision,
                )
            };
            if quantity <= Decimal::ZERO {
                continue;
            }
            allocated += quantity;
            slices.push(ChildSlice {
                quantity,
                at: now + interval * i as i32,
                limit_price: order.price,
            });
        }
        slices
    }

    fn name(&self) -> &'static str {
        "VWAP"
    }
}

/// Show only `display_quantity` at a time; the next clip follows once the
/// previous one is scheduled.
pub struct IcebergSlicer {
    display_quantity: Option<Decimal>,
    refresh_secs: u64,
    size_precision: u32,
}

impl IcebergSlicer {
    fn from_params(params: Option<&Value>, size_precision: u32) -> Self {
        Self {
            display_quantity: param_decimal(params, "display_quantity"),
            refresh_secs: param_u64(params, "refresh_secs", 2),
            size_precision,
        }
    }
}

impl SliceAlgorithm for IcebergSlicer {
    fn slices(&self, order: &Order, _venue: &str, now: DateTime<Utc>) -> Vec<ChildSlice> {
        let display = self
            .display_quantity
            .filter(|d| *d > Decimal::ZERO)
            .unwrap_or_else(|| {
                floor_to_precision(order.quantity / Decimal::TEN, self.size_precision)
            })
            .max(Decimal::new(1, self.size_precision));

        let mut slices = Vec::new();
        let mut remaining = order.quantity;
        let mut i = 0i32;
        while remaining > Decimal::ZERO {
            let quantity = remaining.min(display);
            slices.push(ChildSlice {
                quantity,
                at: now + Duration::seconds(self.refresh_secs as i64) * i,
                limit_price: order.price,
            });
            remaining -= quantity;
            i += 1;
        }
        slices
    }

    fn name(&self) -> &'static str {
        "ICEBERG"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::CanonicalId;
    use crate::orders::{Operation, OrderStatus, OrderType, Side};
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn order(quantity: Decimal) -> Order {
        Order {
            operation_id: "op-1".to_string(),
            operation: Operation::Trade,
            canonical_id: CanonicalId::parse("BINANCE-SPOT:SPOT_PAIR:BTC-USDT").unwrap(),
            venue: Some("BINANCE-SPOT".to_string()),
            venue_kind: None,
            venue_order_id: None,
            side: Side::Buy,
            quantity,
            price: Some(dec!(30000)),
            order_type: OrderType::Limit,
            time_in_force: None,
            exec_algorithm: Some(ExecAlgorithm::Twap),
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

    #[test]
    fn test_twap_slices_sum_to_parent() {
        let params = json!({"duration_secs": 60, "slices": 4});
        let algo = slice_algorithm_for(Some(ExecAlgorithm::Twap), Some(&params), 8).unwrap();
        let slices = algo.slices(&order(dec!(1.0)), "BINANCE-SPOT", Utc::now());

        assert_eq!(slices.len(), 4);
        let total: Decimal = slices.iter().map(|s| s.quantity).sum();
        assert_eq!(total, dec!(1.0));
        assert!(slices.windows(2).all(|w| w[0].at < w[1].at));
    }

    #[test]
    fn test_vwap_slices_sum_to_parent() {
        let algo = slice_algorithm_for(Some(ExecAlgorithm::Vwap), None, 8).unwrap();
        let slices = algo.slices(&order(dec!(2.0)), "BINANCE-SPOT", Utc::now());

        let total: Decimal = slices.iter().map(|s| s.quantity).sum();
        assert_eq!(total, dec!(2.0));
        // U-shaped default: first slice heavier than the middle ones.
        assert!(slices.first().unwrap().quantity > slices[2].quantity);
    }

    #[test]
    fn test_iceberg_respects_display_quantity() {
        let params = json!({"display_quantity": "0.4"});
        let algo = slice_algorithm_for(Some(ExecAlgorithm::Iceberg), Some(&params), 8).unwrap();
        let slices = algo.slices(&order(dec!(1.0)), "BINANCE-SPOT", Utc::now());

        assert_eq!(slices.len(), 3);
        assert_eq!(slices[0].quantity, dec!(0.4));
        assert_eq!(slices[2].quantity, dec!(0.2));
    }

    #[test]
    fn test_normal_means_no_slicing() {
        assert!(slice_algorithm_for(Some(ExecAlgorithm::Normal), None, 8).is_none());
        assert!(slice_algorithm_for(None, None, 8).is_none());
    }
}
