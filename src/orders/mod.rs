//! Unified order records.
//!
//! One record shape covers every venue family: exchange trades, DeFi
//! operations, and betting-exchange bets. The record is keyed by the
//! caller-supplied `operation_id`, which doubles as the idempotency key.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::instrument::CanonicalId;

/// What the caller is asking the venue to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Trade,
    Supply,
    Borrow,
    Stake,
    Withdraw,
    Swap,
    Transfer,
    Bet,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trade => "trade",
            Self::Supply => "supply",
            Self::Borrow => "borrow",
            Self::Stake => "stake",
            Self::Withdraw => "withdraw",
            Self::Swap => "swap",
            Self::Transfer => "transfer",
            Self::Bet => "bet",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "trade" => Some(Self::Trade),
            "supply" => Some(Self::Supply),
            "borrow" => Some(Self::Borrow),
            "stake" => Some(Self::Stake),
            "withdraw" => Some(Self::Withdraw),
            "swap" => Some(Self::Swap),
            "transfer" => Some(Self::Transfer),
            "bet" => Some(Self::Bet),
            _ => None,
        }
    }

    /// Operations eligible for atomic-group bundling.
    pub fn is_groupable(&self) -> bool {
        matches!(
            self,
            Self::Supply | Self::Borrow | Self::Stake | Self::Withdraw | Self::Swap | Self::Transfer
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
    Supply,
    Borrow,
    Stake,
    Withdraw,
    Back,
    Lay,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
            Self::Supply => "SUPPLY",
            Self::Borrow => "BORROW",
            Self::Stake => "STAKE",
            Self::Withdraw => "WITHDRAW",
            Self::Back => "BACK",
            Self::Lay => "LAY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            "SUPPLY" => Some(Self::Supply),
            "BORROW" => Some(Self::Borrow),
            "STAKE" => Some(Self::Stake),
            "WITHDRAW" => Some(Self::Withdraw),
            "BACK" => Some(Self::Back),
            "LAY" => Some(Self::Lay),
            _ => None,
        }
    }

    /// Sign of the position delta a fill on this side produces.
    pub fn sign(&self) -> Decimal {
        match self {
            Self::Buy | Self::Supply | Self::Borrow | Self::Stake | Self::Back => Decimal::ONE,
            Self::Sell | Self::Withdraw | Self::Lay => Decimal::NEGATIVE_ONE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Market => "MARKET",
            Self::Limit => "LIMIT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MARKET" => Some(Self::Market),
            "LIMIT" => Some(Self::Limit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gtc => "GTC",
            Self::Ioc => "IOC",
            Self::Fok => "FOK",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "GTC" => Some(Self::Gtc),
            "IOC" => Some(Self::Ioc),
            "FOK" => Some(Self::Fok),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecAlgorithm {
    Normal,
    Twap,
    Vwap,
    Iceberg,
}

impl ExecAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Twap => "TWAP",
            Self::Vwap => "VWAP",
            Self::Iceberg => "ICEBERG",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NORMAL" => Some(Self::Normal),
            "TWAP" => Some(Self::Twap),
            "VWAP" => Some(Self::Vwap),
            "ICEBERG" => Some(Self::Iceberg),
            _ => None,
        }
    }
}

/// Which dispatch path owns the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VenueKind {
    Integrated,
    ExternalSdk,
}

impl VenueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Integrated => "INTEGRATED",
            Self::ExternalSdk => "EXTERNAL_SDK",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INTEGRATED" => Some(Self::Integrated),
            "EXTERNAL_SDK" => Some(Self::ExternalSdk),
            _ => None,
        }
    }
}

/// Order lifecycle states. Transitions are monotone; the terminal set is
/// frozen apart from late-reconciliation fill appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Submitted,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Submitted => "SUBMITTED",
            Self::PartiallyFilled => "PARTIALLY_FILLED",
            Self::Filled => "FILLED",
            Self::Cancelled => "CANCELLED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "SUBMITTED" => Some(Self::Submitted),
            "PARTIALLY_FILLED" => Some(Self::PartiallyFilled),
            "FILLED" => Some(Self::Filled),
            "CANCELLED" => Some(Self::Cancelled),
            "REJECTED" => Some(Self::Rejected),
            "EXPIRED" => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Cancelled | Self::Rejected | Self::Expired
        )
    }

    /// The only legal edges. `PENDING -> REJECTED` is the one venue-bypassing
    /// transition; everything else is driven by an adapter event or an
    /// explicit orchestrator cancel.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match self {
            Pending => matches!(next, Submitted | Rejected | Cancelled),
            Submitted => matches!(next, PartiallyFilled | Filled | Cancelled | Rejected | Expired),
            PartiallyFilled => matches!(next, PartiallyFilled | Filled | Cancelled | Expired),
            Filled | Cancelled | Rejected | Expired => false,
        }
    }
}

/// One execution against an order. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub fill_id: String,
    pub quantity: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub venue_fill_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// The unified order record as stored by the OMS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub operation_id: String,
    pub operation: Operation,
    pub canonical_id: CanonicalId,
    pub venue: Option<String>,
    pub venue_kind: Option<VenueKind>,
    pub venue_order_id: Option<String>,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub order_type: OrderType,
    pub time_in_force: Option<TimeInForce>,
    pub exec_algorithm: Option<ExecAlgorithm>,
    pub exec_algorithm_params: Option<serde_json::Value>,
    pub status: OrderStatus,
    pub fills: Vec<Fill>,
    /// Caller-predicted position deltas, stored for attribution only.
    pub expected_deltas: Option<HashMap<String, Decimal>>,
    pub atomic_group_id: Option<String>,
    pub sequence_in_group: Option<u32>,
    /// Routing-split children link back to their parent here.
    pub parent_operation_id: Option<String>,
    pub odds: Option<Decimal>,
    pub selection: Option<String>,
    pub potential_payout: Option<Decimal>,
    pub rejection_reason: Option<String>,
    pub error_message: Option<String>,
    pub strategy_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn filled_quantity(&self) -> Decimal {
        self.fills.iter().map(|f| f.quantity).sum()
    }

    pub fn remaining_quantity(&self) -> Decimal {
        self.quantity - self.filled_quantity()
    }

    /// Whether appending `fill` would keep the fill-sum invariant, allowing
    /// for one unit of dust at the instrument's size precision.
    pub fn fill_fits(&self, fill: &Fill, size_precision: u32) -> bool {
        let epsilon = Decimal::new(1, size_precision);
        self.filled_quantity() + fill.quantity <= self.quantity + epsilon
    }

    /// Whether the order is fully filled at the instrument's size precision.
    pub fn is_fully_filled(&self, size_precision: u32) -> bool {
        let epsilon = Decimal::new(1, size_precision);
        (self.quantity - self.filled_quantity()).abs() <= epsilon
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn order(quantity: Decimal) -> Order {
        Order {
            operation_id: "op-1".to_string(),
            operation: Operation::Trade,
            canonical_id: CanonicalId::parse("BINANCE-SPOT:SPOT_PAIR:BTC-USDT").unwrap(),
            venue: Some("BINANCE-SPOT".to_string()),
            venue_kind: Some(VenueKind::Integrated),
            venue_order_id: None,
            side: Side::Buy,
            quantity,
            price: None,
            order_type: OrderType::Market,
            time_in_force: None,
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

    fn fill(quantity: Decimal) -> Fill {
        Fill {
            fill_id: "f-1".to_string(),
            quantity,
            price: dec!(30000),
            fee: dec!(0.5),
            venue_fill_id: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_terminal_states_have_no_edges() {
        use OrderStatus::*;
        for terminal in [Filled, Cancelled, Rejected, Expired] {
            for next in [
                Pending,
                Submitted,
                PartiallyFilled,
                Filled,
                Cancelled,
                Rejected,
                Expired,
            ] {
                assert!(!terminal.can_transition_to(next), "{terminal:?} -> {next:?}");
            }
        }
    }

    #[test]
    fn test_pending_rejected_is_legal() {
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Rejected));
        assert!(!OrderStatus::Pending.can_transition_to(OrderStatus::Filled));
    }

    #[test]
    fn test_partial_fill_self_loop() {
        assert!(OrderStatus::PartiallyFilled.can_transition_to(OrderStatus::PartiallyFilled));
    }

    #[test]
    fn test_fill_sum_invariant() {
        let mut o = order(dec!(1.0));
        o.fills.push(fill(dec!(0.3)));
        o.fills.push(fill(dec!(0.2)));
        assert_eq!(o.filled_quantity(), dec!(0.5));
        assert!(o.fill_fits(&fill(dec!(0.5)), 8));
        assert!(!o.fill_fits(&fill(dec!(0.6)), 8));
        assert!(!o.is_fully_filled(8));

        o.fills.push(fill(dec!(0.5)));
        assert!(o.is_fully_filled(8));
    }

    #[test]
    fn test_side_signs() {
        assert_eq!(Side::Buy.sign(), Decimal::ONE);
        assert_eq!(Side::Lay.sign(), Decimal::NEGATIVE_ONE);
        assert_eq!(Side::Withdraw.sign(), Decimal::NEGATIVE_ONE);
    }

    #[test]
    fn test_status_round_trip() {
        for s in [
            OrderStatus::Pending,
            OrderStatus::Submitted,
            OrderStatus::PartiallyFilled,
            OrderStatus::Filled,
            OrderStatus::Cancelled,
            OrderStatus::Rejected,
            OrderStatus::Expired,
        ] {
            assert_eq!(OrderStatus::parse(s.as_str()), Some(s));
        }
    }
}
