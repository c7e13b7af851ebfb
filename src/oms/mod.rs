//! Unified Order Manager.
//!
//! Authoritative owner of the order table. Every adapter event maps to
//! exactly one mutation here; mutations validate the lifecycle edges and
//! are idempotent under event re-delivery.

pub mod store;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapters::{AdapterEvent, CancelReason, OrderSnapshot, VenueFill};
use crate::instrument::{CanonicalId, InstrumentRegistry};
use crate::orders::{Fill, Order, OrderStatus};

pub use store::{FillAppend, OmsStore, PositionRecord, StatusContext};

#[derive(Debug, thiserror::Error)]
pub enum OmsError {
    #[error("unknown operation_id {0}")]
    NotFound(String),

    #[error("illegal transition {from:?} -> {to:?} for {operation_id}")]
    IllegalTransition {
        operation_id: String,
        from: OrderStatus,
        to: OrderStatus,
    },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Result of `create`.
#[derive(Debug)]
pub enum CreateOutcome {
    Created,
    /// Idempotency hit: the existing record, untouched.
    Duplicate(Order),
}

pub struct OrderManager {
    store: Arc<OmsStore>,
    registry: Arc<dyn InstrumentRegistry>,
}

impl OrderManager {
    pub fn new(store: Arc<OmsStore>, registry: Arc<dyn InstrumentRegistry>) -> Self {
        Self { store, registry }
    }

    fn size_precision(&self, canonical_id: &CanonicalId) -> u32 {
        self.registry
            .lookup(canonical_id)
            .map(|m| m.size_precision)
            .unwrap_or(8)
    }

    pub fn create(&self, order: &Order) -> Result<CreateOutcome, OmsError> {
        if self.store.insert_order(order)? {
            info!(
                operation_id = %order.operation_id,
                canonical_id = %order.canonical_id,
                operation = order.operation.as_str(),
                status = order.status.as_str(),
                strategy_id = %order.strategy_id,
                "order created"
            );
            metrics::increment_counter!("oms_orders_created_total");
            return Ok(CreateOutcome::Created);
        }
        let existing = self
            .store
            .get_order(&order.operation_id)?
            .ok_or_else(|| OmsError::NotFound(order.operation_id.clone()))?;
        Ok(CreateOutcome::Duplicate(existing))
    }

    /// Point read. Transient store errors are retried exactly once; writes
    /// never are.
    pub fn get(&self, operation_id: &str) -> Result<Option<Order>, OmsError> {
        match self.store.get_order(operation_id) {
            Ok(order) => Ok(order),
            Err(first) => {
                warn!(operation_id = %operation_id, error = %first, "order read failed; retrying once");
                Ok(self.store.get_order(operation_id)?)
            }
        }
    }

    pub fn find_by_venue_order_id(
        &self,
        venue: &str,
        venue_order_id: &str,
    ) -> Result<Option<Order>, OmsError> {
        Ok(self.store.find_by_venue_order_id(venue, venue_order_id)?)
    }

    pub fn orders_by_group(&self, atomic_group_id: &str) -> Result<Vec<Order>, OmsError> {
        Ok(self.store.orders_by_group(atomic_group_id)?)
    }

    pub fn orders_by_parent(&self, parent_operation_id: &str) -> Result<Vec<Order>, OmsError> {
        Ok(self.store.orders_by_parent(parent_operation_id)?)
    }

    pub fn open_orders_for_venue(&self, venue: &str) -> Result<Vec<Order>, OmsError> {
        Ok(self.store.open_orders_for_venue(venue)?)
    }

    pub fn last_fill_price(&self, canonical_id: &CanonicalId) -> Result<Option<Decimal>, OmsError> {
        Ok(self.store.last_fill_price(canonical_id)?)
    }

    /// Orders created by `strategy_id` in the trailing `window`. Hot path for
    /// the risk velocity check.
    pub fn count_created_within(
        &self,
        strategy_id: &str,
        window: Duration,
    ) -> Result<u32, OmsError> {
        let since: DateTime<Utc> = Utc::now() - window;
        Ok(self.store.count_since(strategy_id, since)?)
    }

    /// Validated status transition. A transition to the current status is a
    /// no-op; an edge outside the state machine is an error the caller
    /// decides how to treat.
    pub fn update_status(
        &self,
        operation_id: &str,
        new_status: OrderStatus,
        ctx: StatusContext,
    ) -> Result<Order, OmsError> {
        let order = self
            .store
            .get_order(operation_id)?
            .ok_or_else(|| OmsError::NotFound(operation_id.to_string()))?;

        if order.status == new_status && new_status != OrderStatus::PartiallyFilled {
            return Ok(order);
        }
        if !order.status.can_transition_to(new_status) {
            return Err(OmsError::IllegalTransition {
                operation_id: operation_id.to_string(),
                from: order.status,
                to: new_status,
            });
        }

        self.store.update_status(operation_id, new_status, &ctx)?;
        let updated = self
            .store
            .get_order(operation_id)?
            .ok_or_else(|| OmsError::NotFound(operation_id.to_string()))?;

        info!(
            operation_id = %operation_id,
            from = order.status.as_str(),
            to = new_status.as_str(),
            venue = updated.venue.as_deref().unwrap_or("-"),
            "order status changed"
        );
        if new_status.is_terminal() {
            metrics::increment_counter!(
                "oms_orders_terminal_total",
                "status" => new_status.as_str()
            );
        }
        Ok(updated)
    }

    /// Append a fill and advance the lifecycle. Duplicate venue fill ids are
    /// no-ops. Late fills against terminal orders are appended only while
    /// they keep the fill-sum invariant; otherwise they are dropped with an
    /// `error_message` annotation; terminal orders are never re-opened.
    pub fn append_fill(&self, operation_id: &str, fill: Fill) -> Result<Order, OmsError> {
        let order = self
            .store
            .get_order(operation_id)?
            .ok_or_else(|| OmsError::NotFound(operation_id.to_string()))?;
        let size_precision = self.size_precision(&order.canonical_id);

        if !order.fill_fits(&fill, size_precision) {
            warn!(
                operation_id = %operation_id,
                fill_quantity = %fill.quantity,
                filled = %order.filled_quantity(),
                quantity = %order.quantity,
                "fill would overflow order quantity; dropped"
            );
            self.store.set_error_message(
                operation_id,
                &format!(
                    "dropped oversized fill {} (filled {} of {})",
                    fill.quantity,
                    order.filled_quantity(),
                    order.quantity
                ),
            )?;
            metrics::increment_counter!("oms_fills_dropped_total");
            return self
                .store
                .get_order(operation_id)?
                .ok_or_else(|| OmsError::NotFound(operation_id.to_string()));
        }

        match self.store.append_fill(operation_id, &fill)? {
            FillAppend::Duplicate => {
                debug!(
                    operation_id = %operation_id,
                    venue_fill_id = fill.venue_fill_id.as_deref().unwrap_or("-"),
                    "duplicate fill re-delivered; ignored"
                );
                return self
                    .store
                    .get_order(operation_id)?
                    .ok_or_else(|| OmsError::NotFound(operation_id.to_string()));
            }
            FillAppend::Inserted => {}
        }
        metrics::increment_counter!("oms_fills_appended_total");

        let mut updated = self
            .store
            .get_order(operation_id)?
            .ok_or_else(|| OmsError::NotFound(operation_id.to_string()))?;

        if updated.status.is_terminal() {
            // Late reconciliation append: keep the terminal status, note it.
            self.store.set_error_message(
                operation_id,
                "late fill appended after terminal state",
            )?;
            return Ok(updated);
        }

        if updated.status == OrderStatus::Pending {
            updated = self.update_status(
                operation_id,
                OrderStatus::Submitted,
                StatusContext::default(),
            )?;
        }

        let next = if updated.is_fully_filled(size_precision) {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        self.update_status(operation_id, next, StatusContext::default())
    }

    /// Map one adapter event to exactly one OMS mutation. Returns the order
    /// mutated, if the event addressed one.
    pub fn apply_event(&self, event: &AdapterEvent) -> Result<Option<Order>, OmsError> {
        let started = std::time::Instant::now();
        let result = self.apply_event_inner(event);
        metrics::histogram!(
            "oms_event_apply_seconds",
            started.elapsed().as_secs_f64()
        );
        result
    }

    fn apply_event_inner(&self, event: &AdapterEvent) -> Result<Option<Order>, OmsError> {
        match event {
            AdapterEvent::OrderSubmitted {
                venue,
                venue_order_id,
                operation_id,
            } => {
                let Some(order) =
                    self.resolve(venue, Some(venue_order_id), operation_id.as_deref())?
                else {
                    warn!(venue = %venue, venue_order_id = %venue_order_id, "submitted event for unknown order");
                    return Ok(None);
                };
                if order.status != OrderStatus::Pending {
                    // Re-delivered acceptance; the id may still be news.
                    if order.venue_order_id.is_none() {
                        self.store.update_status(
                            &order.operation_id,
                            order.status,
                            &StatusContext {
                                venue_order_id: Some(venue_order_id.clone()),
                                ..Default::default()
                            },
                        )?;
                    }
                    return Ok(Some(order));
                }
                self.update_status(
                    &order.operation_id,
                    OrderStatus::Submitted,
                    StatusContext {
                        venue_order_id: Some(venue_order_id.clone()),
                        ..Default::default()
                    },
                )
                .map(Some)
            }

            AdapterEvent::OrderFilled {
                venue,
                venue_order_id,
                fill,
            } => {
                let Some(order) = self.resolve(venue, Some(venue_order_id), None)? else {
                    warn!(venue = %venue, venue_order_id = %venue_order_id, "fill event for unknown order");
                    return Ok(None);
                };
                self.append_fill(&order.operation_id, venue_fill_to_fill(fill))
                    .map(Some)
            }

            AdapterEvent::OrderCancelled {
                venue,
                venue_order_id,
                reason,
            } => {
                let Some(order) = self.resolve(venue, Some(venue_order_id), None)? else {
                    warn!(venue = %venue, venue_order_id = %venue_order_id, "cancel event for unknown order");
                    return Ok(None);
                };
                let status = match reason {
                    CancelReason::Requested => OrderStatus::Cancelled,
                    CancelReason::Expired => OrderStatus::Expired,
                };
                match self.update_status(&order.operation_id, status, StatusContext::default()) {
                    Ok(updated) => Ok(Some(updated)),
                    Err(OmsError::IllegalTransition { .. }) => {
                        debug!(
                            operation_id = %order.operation_id,
                            status = order.status.as_str(),
                            "late cancel event ignored"
                        );
                        Ok(Some(order))
                    }
                    Err(e) => Err(e),
                }
            }

            AdapterEvent::OrderRejected {
                venue,
                venue_order_id,
                operation_id,
                reason,
            } => {
                let Some(order) =
                    self.resolve(venue, venue_order_id.as_deref(), operation_id.as_deref())?
                else {
                    warn!(venue = %venue, reason = %reason, "reject event for unknown order");
                    return Ok(None);
                };
                match self.update_status(
                    &order.operation_id,
                    OrderStatus::Rejected,
                    StatusContext {
                        rejection_reason: Some(reason.clone()),
                        ..Default::default()
                    },
                ) {
                    Ok(updated) => Ok(Some(updated)),
                    Err(OmsError::IllegalTransition { .. }) => {
                        self.store.set_error_message(
                            &order.operation_id,
                            &format!("late venue rejection: {}", reason),
                        )?;
                        Ok(Some(order))
                    }
                    Err(e) => Err(e),
                }
            }

            // Consumed by the position tracker, not the OMS.
            AdapterEvent::PositionUpdated { .. } | AdapterEvent::AccountUpdated { .. } => Ok(None),
        }
    }

    /// Bring the OMS in line with a venue's open-order snapshot after a
    /// reconnect. Appends missing fills (idempotent by venue fill id) and
    /// advances statuses along legal edges only. Returns the number of
    /// corrected orders.
    pub fn reconcile(&self, venue: &str, snapshots: &[OrderSnapshot]) -> Result<u32, OmsError> {
        let mut corrected = 0u32;
        for snapshot in snapshots {
            let Some(order) = self.resolve(
                venue,
                Some(&snapshot.venue_order_id),
                snapshot.operation_id.as_deref(),
            )?
            else {
                debug!(
                    venue = %venue,
                    venue_order_id = %snapshot.venue_order_id,
                    "venue reports an order we never placed"
                );
                continue;
            };

            let mut touched = false;
            for venue_fill in &snapshot.fills {
                if venue_fill.venue_fill_id.is_none() {
                    warn!(
                        operation_id = %order.operation_id,
                        "snapshot fill without venue fill id cannot be reconciled idempotently; skipped"
                    );
                    continue;
                }
                let before = self
                    .store
                    .get_order(&order.operation_id)?
                    .map(|o| o.fills.len())
                    .unwrap_or(0);
                self.append_fill(&order.operation_id, venue_fill_to_fill(venue_fill))?;
                let after = self
                    .store
                    .get_order(&order.operation_id)?
                    .map(|o| o.fills.len())
                    .unwrap_or(0);
                touched |= after > before;
            }

            let current = self
                .store
                .get_order(&order.operation_id)?
                .ok_or_else(|| OmsError::NotFound(order.operation_id.clone()))?;
            if current.status != snapshot.status
                && current.status.can_transition_to(snapshot.status)
            {
                self.update_status(
                    &current.operation_id,
                    snapshot.status,
                    StatusContext {
                        venue_order_id: Some(snapshot.venue_order_id.clone()),
                        error_message: Some("status corrected by reconnect reconciliation".into()),
                        ..Default::default()
                    },
                )?;
                touched = true;
            }
            if touched {
                corrected += 1;
            }
        }
        if corrected > 0 {
            info!(venue = %venue, corrected, "reconciliation corrected orders");
        }
        Ok(corrected)
    }

    fn resolve(
        &self,
        venue: &str,
        venue_order_id: Option<&str>,
        operation_id: Option<&str>,
    ) -> Result<Option<Order>, OmsError> {
        if let Some(operation_id) = operation_id {
            if let Some(order) = self.store.get_order(operation_id)? {
                return Ok(Some(order));
            }
        }
        if let Some(venue_order_id) = venue_order_id {
            return Ok(self.store.find_by_venue_order_id(venue, venue_order_id)?);
        }
        Ok(None)
    }
}

fn venue_fill_to_fill(venue_fill: &VenueFill) -> Fill {
    Fill {
        fill_id: Uuid::new_v4().to_string(),
        quantity: venue_fill.quantity,
        price: venue_fill.price,
        fee: venue_fill.fee,
        venue_fill_id: venue_fill.venue_fill_id.clone(),
        timestamp: venue_fill.timestamp,
    }
}
