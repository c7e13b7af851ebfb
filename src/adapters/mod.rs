//! Venue adapter contract.
//!
//! Every venue, whether fronted by the hosted multi-venue runtime or by a
//! bespoke per-venue client, presents this one interface. Adapters own
//! their connection state and never touch the OMS or position tables; they
//! emit [`AdapterEvent`]s that the partitioned event workers consume.

pub mod deribit;
pub mod integrated;
pub mod registry;
pub mod supervisor;
pub mod throttle;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::instrument::CanonicalId;
use crate::orders::{
    Operation, Order, OrderStatus, OrderType, Side, TimeInForce, VenueKind,
};

pub use registry::AdapterRegistry;
pub use supervisor::{AdapterSupervisor, SupervisorConfig};
pub use throttle::SubmitThrottle;

/// Transport and domain failures an adapter can surface. Transport variants
/// are retryable by the orchestrator; domain rejections never are.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdapterError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("deadline expired")]
    Timeout,

    #[error("adapter is not connected")]
    NotConnected,

    #[error("venue rejected: {reason}")]
    Rejected { reason: String },

    #[error("submission queue full")]
    Backpressure,

    #[error("circuit breaker open")]
    CircuitOpen,

    #[error("adapter shutting down")]
    Shutdown,

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
}

impl AdapterError {
    /// Whether the orchestrator may retry the call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::NotConnected)
    }
}

/// What the orchestrator hands to `submit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Forwarded as the client order id where the venue supports one.
    pub operation_id: String,
    pub canonical_id: CanonicalId,
    pub operation: Operation,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub order_type: OrderType,
    pub time_in_force: Option<TimeInForce>,
    pub odds: Option<Decimal>,
    pub selection: Option<String>,
}

impl From<&Order> for SubmitRequest {
    fn from(order: &Order) -> Self {
        Self {
            operation_id: order.operation_id.clone(),
            canonical_id: order.canonical_id.clone(),
            operation: order.operation,
            side: order.side,
            quantity: order.quantity,
            price: order.price,
            order_type: order.order_type,
            time_in_force: order.time_in_force,
            odds: order.odds,
            selection: order.selection.clone(),
        }
    }
}

/// Synchronous submit result. Acceptance may also arrive later as an
/// `OrderSubmitted` event; fills always arrive as events.
#[derive(Debug, Clone)]
pub struct SubmitAck {
    pub accepted: bool,
    pub venue_order_id: Option<String>,
    pub reject_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CancelAck {
    pub cancelled: bool,
    pub reason: Option<String>,
}

/// Result of an atomic bundle submission. Partial success is impossible.
#[derive(Debug, Clone)]
pub struct BundleAck {
    pub accepted: bool,
    /// Venue transaction id covering the whole bundle.
    pub bundle_id: Option<String>,
    /// One fill per member operation on success, keyed by operation_id.
    pub fills: Vec<(String, VenueFill)>,
    pub reject_reason: Option<String>,
}

/// One execution as reported by a venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueFill {
    pub venue_fill_id: Option<String>,
    pub quantity: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Why a venue reported an order as done without a full fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelReason {
    Requested,
    /// Time-in-force ran out; maps to `EXPIRED`.
    Expired,
}

/// Open-order snapshot returned by `open_orders()` and used in
/// reconciliation after reconnects.
#[derive(Debug, Clone)]
pub struct OrderSnapshot {
    pub venue_order_id: String,
    /// Client order id, where the venue echoes it.
    pub operation_id: Option<String>,
    pub status: OrderStatus,
    pub fills: Vec<VenueFill>,
}

/// Per-venue position snapshot. Authoritative for `venue` only; adapters
/// fronting several venues tag each snapshot with its owner.
#[derive(Debug, Clone)]
pub struct PositionSnapshot {
    pub venue: String,
    pub position_key: String,
    pub base_asset: String,
    pub quantity: Decimal,
    pub mark_price: Option<Decimal>,
}

/// Push events emitted by adapters. Ordering per `venue_order_id` is
/// monotonic in emission order.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    OrderSubmitted {
        venue: String,
        venue_order_id: String,
        operation_id: Option<String>,
    },
    OrderFilled {
        venue: String,
        venue_order_id: String,
        fill: VenueFill,
    },
    OrderCancelled {
        venue: String,
        venue_order_id: String,
        reason: CancelReason,
    },
    OrderRejected {
        venue: String,
        venue_order_id: Option<String>,
        operation_id: Option<String>,
        reason: String,
    },
    PositionUpdated {
        venue: String,
        snapshot: PositionSnapshot,
    },
    AccountUpdated {
        venue: String,
        balances: HashMap<String, Decimal>,
    },
}

impl AdapterEvent {
    pub fn venue(&self) -> &str {
        match self {
            Self::OrderSubmitted { venue, .. }
            | Self::OrderFilled { venue, .. }
            | Self::OrderCancelled { venue, .. }
            | Self::OrderRejected { venue, .. }
            | Self::PositionUpdated { venue, .. }
            | Self::AccountUpdated { venue, .. } => venue,
        }
    }

    /// Partition key for ordered delivery. Events without a venue order id
    /// (account/position pushes) share the venue-level partition.
    pub fn partition_key(&self) -> &str {
        match self {
            Self::OrderSubmitted { venue_order_id, .. }
            | Self::OrderFilled { venue_order_id, .. }
            | Self::OrderCancelled { venue_order_id, .. } => venue_order_id,
            Self::OrderRejected { venue_order_id, .. } => {
                venue_order_id.as_deref().unwrap_or_else(|| self.venue())
            }
            Self::PositionUpdated { venue, .. } | Self::AccountUpdated { venue, .. } => venue,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdapterHealth {
    pub connected: bool,
    pub last_io: Option<DateTime<Utc>>,
}

/// Top-of-book depth probe for the router's slippage model.
#[derive(Debug, Clone)]
pub struct DepthProbe {
    /// (price, size) levels, best first.
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
    pub captured_at: DateTime<Utc>,
}

impl DepthProbe {
    /// Total size available on the side a taker of `side` consumes.
    pub fn available(&self, side: Side) -> Decimal {
        let levels = match side {
            Side::Buy | Side::Back => &self.asks,
            _ => &self.bids,
        };
        levels.iter().map(|(_, size)| *size).sum()
    }
}

/// The uniform venue contract.
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    /// Venue code this adapter serves (the integrated driver serves several;
    /// this is its primary code used for registry keying).
    fn venue(&self) -> &str;

    /// All venue codes reachable through this adapter.
    fn venues(&self) -> Vec<String> {
        vec![self.venue().to_string()]
    }

    fn kind(&self) -> VenueKind;

    /// Whether the adapter can trade this instrument.
    fn supports(&self, id: &CanonicalId) -> bool;

    /// Idempotent. May block on handshake.
    async fn connect(&self) -> Result<(), AdapterError>;

    /// Idempotent.
    async fn disconnect(&self) -> Result<(), AdapterError>;

    async fn submit(&self, request: &SubmitRequest) -> Result<SubmitAck, AdapterError>;

    async fn cancel(&self, venue_order_id: &str) -> Result<CancelAck, AdapterError>;

    async fn open_orders(&self) -> Result<Vec<OrderSnapshot>, AdapterError>;

    async fn positions(&self) -> Result<Vec<PositionSnapshot>, AdapterError>;

    /// Event stream. Each subscriber sees every event from subscription time.
    fn subscribe_events(&self) -> broadcast::Receiver<AdapterEvent>;

    fn health(&self) -> AdapterHealth;

    /// Order-book probe for routing. Venues without book access return None.
    async fn book_depth(
        &self,
        _id: &CanonicalId,
    ) -> Result<Option<DepthProbe>, AdapterError> {
        Ok(None)
    }

    /// Submit an atomic group as one unit. Only DeFi-capable adapters
    /// override this.
    async fn submit_bundle(
        &self,
        _requests: &[SubmitRequest],
    ) -> Result<BundleAck, AdapterError> {
        Err(AdapterError::Unsupported("atomic bundles"))
    }

    /// Per-adapter estimate used by the router when scoring venues.
    fn taker_fee_bps(&self) -> Decimal {
        Decimal::new(10, 0) // 10 bps default
    }

    /// Static latency penalty in cost units, from venue documentation.
    fn latency_penalty(&self) -> Decimal {
        Decimal::ZERO
    }

    /// Fixed per-order gas cost, for on-chain venues.
    fn gas_cost(&self) -> Decimal {
        Decimal::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_key_prefers_venue_order_id() {
        let event = AdapterEvent::OrderFilled {
            venue: "DERIBIT".to_string(),
            venue_order_id: "v-9".to_string(),
            fill: VenueFill {
                venue_fill_id: Some("vf-1".to_string()),
                quantity: Decimal::ONE,
                price: Decimal::ONE,
                fee: Decimal::ZERO,
                timestamp: Utc::now(),
            },
        };
        assert_eq!(event.partition_key(), "v-9");

        let event = AdapterEvent::AccountUpdated {
            venue: "DERIBIT".to_string(),
            balances: HashMap::new(),
        };
        assert_eq!(event.partition_key(), "DERIBIT");
    }

    #[test]
    fn test_retryable_split() {
        assert!(AdapterError::Transport("reset".to_string()).is_retryable());
        assert!(!AdapterError::Rejected {
            reason: "bad size".to_string()
        }
        .is_retryable());
        assert!(!AdapterError::Timeout.is_retryable());
    }
}
