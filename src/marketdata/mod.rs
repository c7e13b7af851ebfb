//! Mark price sourcing.
//!
//! The chain is registry -> live feed -> last fill, in that order. A stale
//! feed point demotes to the next source; when every source is dry the
//! caller skips the dependent check and warns.

pub mod binance_feed;

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::warn;

use crate::instrument::{CanonicalId, InstrumentKind, InstrumentRegistry};
use crate::oms::OrderManager;

pub use binance_feed::{BinanceMarkFeed, PricePoint};

pub struct MarkPriceService {
    registry: Arc<dyn InstrumentRegistry>,
    feed: Arc<BinanceMarkFeed>,
    oms: Arc<OrderManager>,
    stale_after_secs: i64,
}

impl MarkPriceService {
    pub fn new(
        registry: Arc<dyn InstrumentRegistry>,
        feed: Arc<BinanceMarkFeed>,
        oms: Arc<OrderManager>,
        stale_after_secs: i64,
    ) -> Self {
        Self {
            registry,
            feed,
            oms,
            stale_after_secs,
        }
    }

    /// Best available mark for an instrument, or `None` when every source in
    /// the chain is dry.
    pub fn mark(&self, id: &CanonicalId) -> Option<Decimal> {
        if let Some(mark) = self.registry.mark_price(id) {
            return Some(mark);
        }

        if let Some(symbol) = feed_symbol(id) {
            if let Some(point) = self.feed.latest_mid(&symbol) {
                let age = Utc::now().timestamp() - point.ts;
                if age <= self.stale_after_secs {
                    if let Some(mark) = Decimal::from_f64_retain(point.mid) {
                        return Some(mark);
                    }
                } else {
                    warn!(symbol = %symbol, age_secs = age, "mark feed stale; demoting to last fill");
                }
            }
        }

        match self.oms.last_fill_price(id) {
            Ok(price) => price,
            Err(e) => {
                warn!(canonical_id = %id, error = %e, "last-fill mark lookup failed");
                None
            }
        }
    }

    /// Recent per-sqrt-second volatility for the router's fallback slippage
    /// model.
    pub fn sigma(&self, id: &CanonicalId) -> Option<Decimal> {
        let symbol = feed_symbol(id)?;
        self.feed
            .sigma_per_sqrt_s(&symbol)
            .and_then(Decimal::from_f64_retain)
    }
}

/// Binance stream symbol for instruments the feed can serve.
fn feed_symbol(id: &CanonicalId) -> Option<String> {
    match id.kind() {
        InstrumentKind::SpotPair
        | InstrumentKind::SpotAsset
        | InstrumentKind::Perpetual
        | InstrumentKind::Future => {
            let quote = id.quote().unwrap_or("USDT");
            let quote = if quote == "USD" { "USDT" } else { quote };
            Some(format!("{}{}", id.base(), quote))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::StaticInstrumentRegistry;
    use crate::oms::OmsStore;
    use rust_decimal_macros::dec;

    fn service(registry: Arc<StaticInstrumentRegistry>) -> MarkPriceService {
        let store = Arc::new(OmsStore::in_memory().unwrap());
        MarkPriceService::new(
            registry.clone(),
            BinanceMarkFeed::disabled(),
            Arc::new(OrderManager::new(store, registry)),
            5,
        )
    }

    #[test]
    fn test_registry_mark_wins() {
        let registry = Arc::new(StaticInstrumentRegistry::new());
        let id = CanonicalId::parse("BINANCE-SPOT:SPOT_PAIR:BTC-USDT").unwrap();
        registry.set_mark(&id, dec!(30500));

        let marks = service(registry);
        assert_eq!(marks.mark(&id), Some(dec!(30500)));
    }

    #[test]
    fn test_dry_chain_returns_none() {
        let registry = Arc::new(StaticInstrumentRegistry::new());
        let id = CanonicalId::parse("BETFAIR:MATCH_WINNER:epl-2026-ars-che").unwrap();
        let marks = service(registry);
        assert_eq!(marks.mark(&id), None);
    }

    #[test]
    fn test_feed_symbol_mapping() {
        let perp = CanonicalId::parse("DERIBIT:PERPETUAL:BTC-USD@INV").unwrap();
        assert_eq!(feed_symbol(&perp).as_deref(), Some("BTCUSDT"));

        let bet = CanonicalId::parse("BETFAIR:BTTS:epl-2026-liv-mun").unwrap();
        assert_eq!(feed_symbol(&bet), None);
    }
}
