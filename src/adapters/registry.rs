//! Adapter registry.
//!
//! Keyed by venue code. One adapter may serve several venue codes (the
//! integrated driver fronts a whole runtime); the registry flattens that
//! into a per-venue lookup. Startup connects all adapters in parallel with
//! bounded concurrency and tolerates individual failures; one bad venue
//! must never take the gateway down.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use parking_lot::RwLock;
use tokio::time::{timeout, Duration};
use tracing::{info, warn};

use super::{SubmitThrottle, VenueAdapter};

const CONNECT_CONCURRENCY: usize = 4;

#[derive(Default)]
pub struct AdapterRegistry {
    by_venue: RwLock<HashMap<String, Arc<dyn VenueAdapter>>>,
    throttles: RwLock<HashMap<String, Arc<SubmitThrottle>>>,
    adapters: RwLock<Vec<Arc<dyn VenueAdapter>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, adapter: Arc<dyn VenueAdapter>) {
        for venue in adapter.venues() {
            let previous = self
                .by_venue
                .write()
                .insert(venue.clone(), adapter.clone());
            if previous.is_some() {
                warn!(venue = %venue, "venue re-registered; later adapter wins");
            }
        }
        self.adapters.write().push(adapter);
    }

    pub fn set_throttle(&self, venue: &str, throttle: Arc<SubmitThrottle>) {
        self.throttles.write().insert(venue.to_string(), throttle);
    }

    pub fn adapter_for_venue(&self, venue: &str) -> Option<Arc<dyn VenueAdapter>> {
        self.by_venue.read().get(venue).cloned()
    }

    pub fn throttle_for_venue(&self, venue: &str) -> Option<Arc<SubmitThrottle>> {
        self.throttles.read().get(venue).cloned()
    }

    /// All venue codes with a registered adapter, sorted for deterministic
    /// iteration.
    pub fn venues(&self) -> Vec<String> {
        let mut venues: Vec<String> = self.by_venue.read().keys().cloned().collect();
        venues.sort();
        venues
    }

    /// Distinct adapters (the integrated driver appears once here even
    /// though it backs several venue codes).
    pub fn all(&self) -> Vec<Arc<dyn VenueAdapter>> {
        self.adapters.read().clone()
    }

    /// Connect every adapter with bounded concurrency. Failures are logged
    /// and skipped; the supervisors will keep retrying them.
    pub async fn connect_all(&self, connect_timeout: Duration) {
        let adapters = self.all();
        let total = adapters.len();

        let results = stream::iter(adapters)
            .map(|adapter| async move {
                let venue = adapter.venue().to_string();
                match timeout(connect_timeout, adapter.connect()).await {
                    Ok(Ok(())) => {
                        info!(venue = %venue, "adapter connected");
                        true
                    }
                    Ok(Err(e)) => {
                        warn!(venue = %venue, error = %e, "adapter failed to connect at startup");
                        false
                    }
                    Err(_) => {
                        warn!(venue = %venue, "adapter connect timed out at startup");
                        false
                    }
                }
            })
            .buffer_unordered(CONNECT_CONCURRENCY)
            .collect::<Vec<bool>>()
            .await;

        let connected = results.iter().filter(|ok| **ok).count();
        info!(connected, total, "adapter startup connect pass finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{
        AdapterError, AdapterEvent, AdapterHealth, CancelAck, OrderSnapshot, PositionSnapshot,
        SubmitAck, SubmitRequest,
    };
    use crate::instrument::CanonicalId;
    use crate::orders::VenueKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::broadcast;

    struct FakeAdapter {
        venue: String,
        connected: AtomicBool,
        events: broadcast::Sender<AdapterEvent>,
    }

    impl FakeAdapter {
        fn new(venue: &str) -> Self {
            let (events, _) = broadcast::channel(16);
            Self {
                venue: venue.to_string(),
                connected: AtomicBool::new(false),
                events,
            }
        }
    }

    #[async_trait]
    impl VenueAdapter for FakeAdapter {
        fn venue(&self) -> &str {
            &self.venue
        }

        fn kind(&self) -> VenueKind {
            VenueKind::ExternalSdk
        }

        fn supports(&self, _id: &CanonicalId) -> bool {
            true
        }

        async fn connect(&self) -> Result<(), AdapterError> {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), AdapterError> {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn submit(&self, _request: &SubmitRequest) -> Result<SubmitAck, AdapterError> {
            Err(AdapterError::NotConnected)
        }

        async fn cancel(&self, _venue_order_id: &str) -> Result<CancelAck, AdapterError> {
            Err(AdapterError::NotConnected)
        }

        async fn open_orders(&self) -> Result<Vec<OrderSnapshot>, AdapterError> {
            Ok(Vec::new())
        }

        async fn positions(&self) -> Result<Vec<PositionSnapshot>, AdapterError> {
            Ok(Vec::new())
        }

        fn subscribe_events(&self) -> broadcast::Receiver<AdapterEvent> {
            self.events.subscribe()
        }

        fn health(&self) -> AdapterHealth {
            AdapterHealth {
                connected: self.connected.load(Ordering::SeqCst),
                last_io: None,
            }
        }
    }

    #[tokio::test]
    async fn test_connect_all_tolerates_individual_failures() {
        struct FailingAdapter(FakeAdapter);

        #[async_trait]
        impl VenueAdapter for FailingAdapter {
            fn venue(&self) -> &str {
                self.0.venue()
            }
            fn kind(&self) -> VenueKind {
                VenueKind::ExternalSdk
            }
            fn supports(&self, id: &CanonicalId) -> bool {
                self.0.supports(id)
            }
            async fn connect(&self) -> Result<(), AdapterError> {
                Err(AdapterError::Transport("refused".to_string()))
            }
            async fn disconnect(&self) -> Result<(), AdapterError> {
                Ok(())
            }
            async fn submit(&self, r: &SubmitRequest) -> Result<SubmitAck, AdapterError> {
                self.0.submit(r).await
            }
            async fn cancel(&self, id: &str) -> Result<CancelAck, AdapterError> {
                self.0.cancel(id).await
            }
            async fn open_orders(&self) -> Result<Vec<OrderSnapshot>, AdapterError> {
                self.0.open_orders().await
            }
            async fn positions(&self) -> Result<Vec<PositionSnapshot>, AdapterError> {
                self.0.positions().await
            }
            fn subscribe_events(&self) -> broadcast::Receiver<AdapterEvent> {
                self.0.subscribe_events()
            }
            fn health(&self) -> AdapterHealth {
                self.0.health()
            }
        }

        let registry = AdapterRegistry::new();
        let good = Arc::new(FakeAdapter::new("GOOD"));
        registry.register(good.clone());
        registry.register(Arc::new(FailingAdapter(FakeAdapter::new("BAD"))));

        registry.connect_all(Duration::from_secs(1)).await;

        assert!(good.health().connected);
        assert_eq!(registry.venues(), vec!["BAD", "GOOD"]);
    }

    #[tokio::test]
    async fn test_lookup_by_venue() {
        let registry = AdapterRegistry::new();
        registry.register(Arc::new(FakeAdapter::new("DERIBIT")));

        assert!(registry.adapter_for_venue("DERIBIT").is_some());
        assert!(registry.adapter_for_venue("UNKNOWN").is_none());
    }
}
