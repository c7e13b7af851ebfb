//! Instrument metadata registry.
//!
//! The registry is an external collaborator; the core only needs a read
//! interface. The in-memory implementation here is seedable from config and
//! from adapter discovery, and doubles as the test registry.

use std::collections::HashMap;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::CanonicalId;

/// Precision and sizing rules for one instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentMetadata {
    /// Decimal places accepted in prices.
    pub price_precision: u32,
    /// Decimal places accepted in quantities.
    pub size_precision: u32,
    pub min_size: Decimal,
    pub tick_size: Decimal,
    pub contract_size: Decimal,
    /// Inverse contracts are sized in quote currency.
    pub inverse: bool,
}

impl Default for InstrumentMetadata {
    fn default() -> Self {
        Self {
            price_precision: 8,
            size_precision: 8,
            min_size: Decimal::ZERO,
            tick_size: Decimal::ZERO,
            contract_size: Decimal::ONE,
            inverse: false,
        }
    }
}

pub trait InstrumentRegistry: Send + Sync {
    /// `None` means the registry has never heard of this instrument.
    fn lookup(&self, id: &CanonicalId) -> Option<InstrumentMetadata>;

    /// Reference mark price, where the registry carries one. This is the
    /// first source in the mark chain; most registries return `None` and the
    /// live feed takes over.
    fn mark_price(&self, _id: &CanonicalId) -> Option<Decimal> {
        None
    }
}

/// In-memory registry seeded at startup.
#[derive(Default)]
pub struct StaticInstrumentRegistry {
    entries: RwLock<HashMap<String, InstrumentMetadata>>,
    marks: RwLock<HashMap<String, Decimal>>,
}

impl StaticInstrumentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: &CanonicalId, metadata: InstrumentMetadata) {
        self.entries.write().insert(id.render(), metadata);
    }

    pub fn set_mark(&self, id: &CanonicalId, mark: Decimal) {
        self.marks.write().insert(id.render(), mark);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl InstrumentRegistry for StaticInstrumentRegistry {
    fn lookup(&self, id: &CanonicalId) -> Option<InstrumentMetadata> {
        self.entries.read().get(&id.render()).cloned()
    }

    fn mark_price(&self, id: &CanonicalId) -> Option<Decimal> {
        self.marks.read().get(&id.render()).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_and_mark() {
        let registry = StaticInstrumentRegistry::new();
        let id = CanonicalId::parse("BINANCE-SPOT:SPOT_PAIR:BTC-USDT").unwrap();
        assert!(registry.lookup(&id).is_none());

        registry.insert(
            &id,
            InstrumentMetadata {
                price_precision: 2,
                size_precision: 5,
                min_size: Decimal::new(1, 4),
                tick_size: Decimal::new(1, 2),
                contract_size: Decimal::ONE,
                inverse: false,
            },
        );
        registry.set_mark(&id, Decimal::new(30_000, 0));

        let meta = registry.lookup(&id).unwrap();
        assert_eq!(meta.size_precision, 5);
        assert_eq!(registry.mark_price(&id), Some(Decimal::new(30_000, 0)));
    }
}
