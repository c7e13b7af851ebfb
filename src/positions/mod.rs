//! Unified position tracker.
//!
//! Aggregates holdings per canonical position key across venues. Fills flow
//! in from the event workers; external adapters additionally push periodic
//! snapshots that overwrite their own venue's column authoritatively and
//! never another venue's.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::adapters::PositionSnapshot;
use crate::oms::{OmsStore, PositionRecord};
use crate::orders::{Fill, Order, VenueKind};

pub struct PositionTracker {
    store: Arc<OmsStore>,
    book: RwLock<HashMap<String, PositionRecord>>,
    /// Divergence beyond this between derived state and a venue snapshot is
    /// logged as a drift event before the snapshot is accepted.
    drift_tolerance: Decimal,
}

impl PositionTracker {
    pub fn new(store: Arc<OmsStore>, drift_tolerance: Decimal) -> Result<Self> {
        let book = store
            .load_positions()?
            .into_iter()
            .map(|record| (record.position_key.clone(), record))
            .collect::<HashMap<_, _>>();
        if !book.is_empty() {
            info!(positions = book.len(), "position book restored from store");
        }
        Ok(Self {
            store,
            book: RwLock::new(book),
            drift_tolerance,
        })
    }

    /// Apply the signed delta of one fill. The position is created lazily on
    /// the first non-zero delta and never deleted, even at zero.
    pub fn on_fill(&self, order: &Order, fill: &Fill) -> Result<()> {
        let Some(venue) = order.venue.as_deref() else {
            warn!(operation_id = %order.operation_id, "fill on order without resolved venue");
            return Ok(());
        };
        let key = order
            .canonical_id
            .position_key(venue, order.selection.as_deref())?;
        let delta = fill.quantity * order.side.sign();
        if delta.is_zero() {
            return Ok(());
        }

        let record = {
            let mut book = self.book.write();
            let record = book.entry(key.clone()).or_insert_with(|| PositionRecord {
                position_key: key.clone(),
                base_asset: order.canonical_id.base_asset(),
                aggregated_quantity: Decimal::ZERO,
                per_venue_quantity: HashMap::new(),
                per_venue_kind: HashMap::new(),
                avg_entry_price: None,
                last_mark_price: None,
                realized_pnl: None,
                unrealized_pnl: None,
                updated_at: Utc::now(),
            });

            apply_entry_price(record, delta, fill);

            *record
                .per_venue_quantity
                .entry(venue.to_string())
                .or_insert(Decimal::ZERO) += delta;
            if let Some(kind) = order.venue_kind {
                match record.per_venue_kind.get(venue) {
                    Some(existing) if *existing != kind => {
                        warn!(
                            position_key = %key,
                            venue = %venue,
                            "venue kind changed for an existing position; keeping the original"
                        );
                    }
                    Some(_) => {}
                    None => {
                        record.per_venue_kind.insert(venue.to_string(), kind);
                    }
                }
            }

            record.aggregated_quantity = record.per_venue_quantity.values().copied().sum();
            record.updated_at = Utc::now();
            record.clone()
        };

        self.store.upsert_position(&record)?;
        Ok(())
    }

    /// Overwrite one venue's holdings with an authoritative snapshot.
    /// Returns the number of drift events observed.
    pub fn on_position_snapshot(
        &self,
        venue: &str,
        snapshots: &[PositionSnapshot],
        kind: VenueKind,
    ) -> Result<u32> {
        let mut drift_events = 0u32;
        let mut dirty: Vec<PositionRecord> = Vec::new();
        let snapshot_keys: HashSet<&str> =
            snapshots.iter().map(|s| s.position_key.as_str()).collect();

        {
            let mut book = self.book.write();

            for snapshot in snapshots {
                let record = book
                    .entry(snapshot.position_key.clone())
                    .or_insert_with(|| PositionRecord {
                        position_key: snapshot.position_key.clone(),
                        base_asset: snapshot.base_asset.clone(),
                        aggregated_quantity: Decimal::ZERO,
                        per_venue_quantity: HashMap::new(),
                        per_venue_kind: HashMap::new(),
                        avg_entry_price: None,
                        last_mark_price: None,
                        realized_pnl: None,
                        unrealized_pnl: None,
                        updated_at: Utc::now(),
                    });

                let derived = record
                    .per_venue_quantity
                    .get(venue)
                    .copied()
                    .unwrap_or(Decimal::ZERO);
                if (derived - snapshot.quantity).abs() > self.drift_tolerance {
                    warn!(
                        event = "DRIFT_EVENT",
                        position_key = %snapshot.position_key,
                        venue = %venue,
                        derived = %derived,
                        reported = %snapshot.quantity,
                        "derived position disagrees with venue snapshot; accepting snapshot"
                    );
                    metrics::increment_counter!("position_drift_events_total");
                    drift_events += 1;
                }

                record
                    .per_venue_quantity
                    .insert(venue.to_string(), snapshot.quantity);
                record.per_venue_kind.entry(venue.to_string()).or_insert(kind);
                if let Some(mark) = snapshot.mark_price {
                    record.last_mark_price = Some(mark);
                    record.unrealized_pnl = record
                        .avg_entry_price
                        .map(|avg| (mark - avg) * record.aggregated_quantity);
                }
                record.aggregated_quantity = record.per_venue_quantity.values().copied().sum();
                record.updated_at = Utc::now();
                dirty.push(record.clone());
            }

            // The snapshot is exhaustive for this venue: anything we still
            // attribute to it but the venue no longer reports is gone.
            for record in book.values_mut() {
                if snapshot_keys.contains(record.position_key.as_str()) {
                    continue;
                }
                let Some(held) = record.per_venue_quantity.get_mut(venue) else {
                    continue;
                };
                if held.is_zero() {
                    continue;
                }
                warn!(
                    event = "DRIFT_EVENT",
                    position_key = %record.position_key,
                    venue = %venue,
                    derived = %held,
                    reported = %Decimal::ZERO,
                    "venue snapshot no longer reports this position; zeroing"
                );
                metrics::increment_counter!("position_drift_events_total");
                drift_events += 1;
                *held = Decimal::ZERO;
                record.aggregated_quantity = record.per_venue_quantity.values().copied().sum();
                record.updated_at = Utc::now();
                dirty.push(record.clone());
            }
        }

        for record in dirty {
            self.store.upsert_position(&record)?;
        }
        Ok(drift_events)
    }

    /// Apply a single push update for one key. Unlike a reconnect snapshot
    /// this never zeroes the venue's other keys.
    pub fn on_position_update(
        &self,
        venue: &str,
        snapshot: &PositionSnapshot,
        kind: VenueKind,
    ) -> Result<()> {
        let record = {
            let mut book = self.book.write();
            let record = book
                .entry(snapshot.position_key.clone())
                .or_insert_with(|| PositionRecord {
                    position_key: snapshot.position_key.clone(),
                    base_asset: snapshot.base_asset.clone(),
                    aggregated_quantity: Decimal::ZERO,
                    per_venue_quantity: HashMap::new(),
                    per_venue_kind: HashMap::new(),
                    avg_entry_price: None,
                    last_mark_price: None,
                    realized_pnl: None,
                    unrealized_pnl: None,
                    updated_at: Utc::now(),
                });
            record
                .per_venue_quantity
                .insert(venue.to_string(), snapshot.quantity);
            record.per_venue_kind.entry(venue.to_string()).or_insert(kind);
            if let Some(mark) = snapshot.mark_price {
                record.last_mark_price = Some(mark);
            }
            record.aggregated_quantity = record.per_venue_quantity.values().copied().sum();
            record.updated_at = Utc::now();
            record.clone()
        };
        self.store.upsert_position(&record)?;
        Ok(())
    }

    pub fn get(&self, position_key: &str) -> Option<PositionRecord> {
        self.book.read().get(position_key).cloned()
    }

    /// Net quantity across all venues and keys for one base asset.
    pub fn aggregate(&self, base_asset: &str) -> Decimal {
        self.book
            .read()
            .values()
            .filter(|record| record.base_asset == base_asset)
            .map(|record| record.aggregated_quantity)
            .sum()
    }

    /// Every non-empty record, for exposure computation and the API.
    pub fn snapshot(&self) -> Vec<PositionRecord> {
        self.book.read().values().cloned().collect()
    }

    /// Record a fresh mark for a position and refresh unrealized PnL.
    pub fn set_mark(&self, position_key: &str, mark: Decimal) -> Result<()> {
        let record = {
            let mut book = self.book.write();
            let Some(record) = book.get_mut(position_key) else {
                return Ok(());
            };
            record.last_mark_price = Some(mark);
            record.unrealized_pnl = record
                .avg_entry_price
                .map(|avg| (mark - avg) * record.aggregated_quantity);
            record.updated_at = Utc::now();
            record.clone()
        };
        self.store.upsert_position(&record)?;
        Ok(())
    }
}

/// Volume-weighted, fee-inclusive entry price. Fills that extend the
/// position re-weight the average; fills that reduce it realize PnL against
/// the running average and leave it unchanged.
fn apply_entry_price(record: &mut PositionRecord, delta: Decimal, fill: &Fill) {
    let prev_quantity = record.aggregated_quantity;

    let extending = prev_quantity.is_zero() || (prev_quantity.is_sign_positive() == delta.is_sign_positive());
    if extending {
        let prev_abs = prev_quantity.abs();
        let fill_abs = delta.abs();
        let prev_avg = record.avg_entry_price.unwrap_or(fill.price);
        let total = prev_abs + fill_abs;
        if !total.is_zero() {
            record.avg_entry_price =
                Some((prev_abs * prev_avg + fill_abs * fill.price + fill.fee) / total);
        }
    } else if let Some(avg) = record.avg_entry_price {
        let reduced = delta.abs().min(prev_quantity.abs());
        let direction = if prev_quantity.is_sign_positive() {
            Decimal::ONE
        } else {
            Decimal::NEGATIVE_ONE
        };
        let pnl = (fill.price - avg) * reduced * direction - fill.fee;
        record.realized_pnl = Some(record.realized_pnl.unwrap_or(Decimal::ZERO) + pnl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::CanonicalId;
    use crate::orders::{Operation, OrderStatus, OrderType, Side};
    use rust_decimal_macros::dec;

    fn tracker() -> PositionTracker {
        PositionTracker::new(Arc::new(OmsStore::in_memory().unwrap()), dec!(0.00000001)).unwrap()
    }

    fn order(venue: &str, canonical: &str, side: Side) -> Order {
        Order {
            operation_id: "op-1".to_string(),
            operation: Operation::Trade,
            canonical_id: CanonicalId::parse(canonical).unwrap(),
            venue: Some(venue.to_string()),
            venue_kind: Some(VenueKind::Integrated),
            venue_order_id: Some("v-1".to_string()),
            side,
            quantity: dec!(1.0),
            price: None,
            order_type: OrderType::Market,
            time_in_force: None,
            exec_algorithm: None,
            exec_algorithm_params: None,
            status: OrderStatus::Submitted,
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

    fn fill(quantity: Decimal, price: Decimal) -> Fill {
        Fill {
            fill_id: uuid::Uuid::new_v4().to_string(),
            quantity,
            price,
            fee: dec!(0.5),
            venue_fill_id: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_buy_accrues_into_base_asset() {
        let tracker = tracker();
        let order = order("BINANCE-SPOT", "BINANCE-SPOT:SPOT_PAIR:BTC-USDT", Side::Buy);
        tracker.on_fill(&order, &fill(dec!(0.5), dec!(30000))).unwrap();

        let record = tracker.get("BINANCE-SPOT:SPOT_ASSET:BTC").unwrap();
        assert_eq!(record.aggregated_quantity, dec!(0.5));
        assert_eq!(
            record.per_venue_quantity.get("BINANCE-SPOT"),
            Some(&dec!(0.5))
        );
        assert_eq!(tracker.aggregate("BTC"), dec!(0.5));
    }

    #[test]
    fn test_aggregation_invariant_across_venues() {
        let tracker = tracker();
        tracker
            .on_fill(
                &order("BINANCE-SPOT", "BINANCE-SPOT:SPOT_PAIR:BTC-USDT", Side::Buy),
                &fill(dec!(0.5), dec!(30000)),
            )
            .unwrap();
        tracker
            .on_fill(
                &order("DERIBIT", "DERIBIT:SPOT_PAIR:BTC-USDT", Side::Buy),
                &fill(dec!(0.25), dec!(30010)),
            )
            .unwrap();

        for record in tracker.snapshot() {
            let sum: Decimal = record.per_venue_quantity.values().copied().sum();
            assert_eq!(record.aggregated_quantity, sum);
        }
        assert_eq!(tracker.aggregate("BTC"), dec!(0.75));
    }

    #[test]
    fn test_snapshot_overwrites_single_venue_only() {
        let tracker = tracker();
        tracker
            .on_fill(
                &order("BINANCE-SPOT", "BINANCE-SPOT:SPOT_PAIR:BTC-USDT", Side::Buy),
                &fill(dec!(0.5), dec!(30000)),
            )
            .unwrap();

        let drift = tracker
            .on_position_snapshot(
                "BINANCE-SPOT",
                &[PositionSnapshot {
                    venue: "BINANCE-SPOT".to_string(),
                    position_key: "BINANCE-SPOT:SPOT_ASSET:BTC".to_string(),
                    base_asset: "BTC".to_string(),
                    quantity: dec!(0.7),
                    mark_price: None,
                }],
                VenueKind::Integrated,
            )
            .unwrap();
        assert_eq!(drift, 1);

        let record = tracker.get("BINANCE-SPOT:SPOT_ASSET:BTC").unwrap();
        assert_eq!(record.aggregated_quantity, dec!(0.7));
    }

    #[test]
    fn test_missing_key_in_snapshot_zeroes_that_venue() {
        let tracker = tracker();
        tracker
            .on_fill(
                &order("DERIBIT", "DERIBIT:PERPETUAL:BTC-USD@INV", Side::Buy),
                &fill(dec!(2.0), dec!(30000)),
            )
            .unwrap();

        tracker
            .on_position_snapshot("DERIBIT", &[], VenueKind::ExternalSdk)
            .unwrap();
        let record = tracker.get("DERIBIT:PERPETUAL:BTC-USD@INV").unwrap();
        assert_eq!(record.aggregated_quantity, Decimal::ZERO);
    }

    #[test]
    fn test_entry_price_is_volume_weighted_and_fee_inclusive() {
        let tracker = tracker();
        let o = order("BINANCE-SPOT", "BINANCE-SPOT:SPOT_PAIR:BTC-USDT", Side::Buy);
        tracker.on_fill(&o, &fill(dec!(1.0), dec!(100))).unwrap();
        tracker.on_fill(&o, &fill(dec!(1.0), dec!(200))).unwrap();

        let record = tracker.get("BINANCE-SPOT:SPOT_ASSET:BTC").unwrap();
        // (1*100.5 + 1*200 + 0.5) / 2, first fill folded its own fee in.
        let avg = record.avg_entry_price.unwrap();
        assert!(avg > dec!(150) && avg < dec!(151), "avg = {avg}");
    }

    #[test]
    fn test_reducing_fill_realizes_pnl() {
        let tracker = tracker();
        tracker
            .on_fill(
                &order("BINANCE-SPOT", "BINANCE-SPOT:SPOT_PAIR:BTC-USDT", Side::Buy),
                &fill(dec!(1.0), dec!(100)),
            )
            .unwrap();
        tracker
            .on_fill(
                &order("BINANCE-SPOT", "BINANCE-SPOT:SPOT_PAIR:BTC-USDT", Side::Sell),
                &fill(dec!(1.0), dec!(150)),
            )
            .unwrap();

        let record = tracker.get("BINANCE-SPOT:SPOT_ASSET:BTC").unwrap();
        assert_eq!(record.aggregated_quantity, Decimal::ZERO);
        assert!(record.realized_pnl.unwrap() > dec!(48));
    }

    #[test]
    fn test_bet_positions_keyed_by_selection() {
        let tracker = tracker();
        let mut o = order("BETFAIR", "BETFAIR:MATCH_WINNER:epl-2026-ars-che", Side::Back);
        o.selection = Some("HOME".to_string());
        tracker.on_fill(&o, &fill(dec!(10), dec!(2.2))).unwrap();

        assert!(tracker
            .get("BETFAIR:MATCH_WINNER:epl-2026-ars-che:HOME")
            .is_some());
    }
}
