//! Shared test fixtures: scriptable mock adapters and a fully wired
//! orchestrator context backed by an in-memory store.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::{broadcast, watch};

use omnigate_backend::adapters::{
    AdapterError, AdapterEvent, AdapterHealth, AdapterRegistry, BundleAck, CancelAck,
    OrderSnapshot, PositionSnapshot, SubmitAck, SubmitRequest, VenueAdapter,
};
use omnigate_backend::engine::{EventPipeline, Orchestrator, OrchestratorConfig, OrderRequest};
use omnigate_backend::instrument::{CanonicalId, StaticInstrumentRegistry};
use omnigate_backend::marketdata::{BinanceMarkFeed, MarkPriceService};
use omnigate_backend::oms::{OmsStore, OrderManager};
use omnigate_backend::orders::{
    Operation, Order, OrderStatus, OrderType, Side, TimeInForce, VenueKind,
};
use omnigate_backend::positions::PositionTracker;
use omnigate_backend::risk::{RiskConfig, RiskEngine};
use omnigate_backend::router::{RouterConfig, SmartRouter};

/// Scriptable spy adapter. Submissions and cancels are recorded; results
/// can be queued per call, with sensible accept-everything defaults.
pub struct MockAdapter {
    venue: String,
    kind: VenueKind,
    /// Accept routable (SPOT_PAIR) instruments, not just venue-bound ones.
    routable: bool,
    pub submissions: Mutex<Vec<SubmitRequest>>,
    pub cancels: Mutex<Vec<String>>,
    pub bundles: Mutex<Vec<Vec<SubmitRequest>>>,
    submit_script: Mutex<VecDeque<Result<SubmitAck, AdapterError>>>,
    cancel_script: Mutex<VecDeque<Result<CancelAck, AdapterError>>>,
    bundle_script: Mutex<VecDeque<Result<BundleAck, AdapterError>>>,
    open_orders: Mutex<Vec<OrderSnapshot>>,
    position_snapshots: Mutex<Vec<PositionSnapshot>>,
    events: broadcast::Sender<AdapterEvent>,
    connected: AtomicBool,
    next_order_id: AtomicU64,
}

impl MockAdapter {
    pub fn new(venue: &str, kind: VenueKind, routable: bool) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            venue: venue.to_string(),
            kind,
            routable,
            submissions: Mutex::new(Vec::new()),
            cancels: Mutex::new(Vec::new()),
            bundles: Mutex::new(Vec::new()),
            submit_script: Mutex::new(VecDeque::new()),
            cancel_script: Mutex::new(VecDeque::new()),
            bundle_script: Mutex::new(VecDeque::new()),
            open_orders: Mutex::new(Vec::new()),
            position_snapshots: Mutex::new(Vec::new()),
            events,
            connected: AtomicBool::new(false),
            next_order_id: AtomicU64::new(1),
        })
    }

    pub fn script_submit(&self, result: Result<SubmitAck, AdapterError>) {
        self.submit_script.lock().push_back(result);
    }

    pub fn script_cancel(&self, result: Result<CancelAck, AdapterError>) {
        self.cancel_script.lock().push_back(result);
    }

    pub fn script_bundle(&self, result: Result<BundleAck, AdapterError>) {
        self.bundle_script.lock().push_back(result);
    }

    pub fn set_open_orders(&self, snapshots: Vec<OrderSnapshot>) {
        *self.open_orders.lock() = snapshots;
    }

    pub fn set_positions(&self, snapshots: Vec<PositionSnapshot>) {
        *self.position_snapshots.lock() = snapshots;
    }

    /// Push an event onto the adapter's stream, as the venue would.
    pub fn emit(&self, event: AdapterEvent) {
        let _ = self.events.send(event);
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().len()
    }
}

#[async_trait]
impl VenueAdapter for MockAdapter {
    fn venue(&self) -> &str {
        &self.venue
    }

    fn kind(&self) -> VenueKind {
        self.kind
    }

    fn supports(&self, id: &CanonicalId) -> bool {
        if id.is_routable() {
            return self.routable;
        }
        id.venue() == Some(self.venue.as_str())
    }

    async fn connect(&self) -> Result<(), AdapterError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), AdapterError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<SubmitAck, AdapterError> {
        self.submissions.lock().push(request.clone());
        if let Some(result) = self.submit_script.lock().pop_front() {
            return result;
        }
        let id = self.next_order_id.fetch_add(1, Ordering::SeqCst);
        Ok(SubmitAck {
            accepted: true,
            venue_order_id: Some(format!("v-{id}")),
            reject_reason: None,
        })
    }

    async fn cancel(&self, venue_order_id: &str) -> Result<CancelAck, AdapterError> {
        self.cancels.lock().push(venue_order_id.to_string());
        if let Some(result) = self.cancel_script.lock().pop_front() {
            return result;
        }
        Ok(CancelAck {
            cancelled: true,
            reason: None,
        })
    }

    async fn open_orders(&self) -> Result<Vec<OrderSnapshot>, AdapterError> {
        Ok(self.open_orders.lock().clone())
    }

    async fn positions(&self) -> Result<Vec<PositionSnapshot>, AdapterError> {
        Ok(self.position_snapshots.lock().clone())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }

    fn health(&self) -> AdapterHealth {
        AdapterHealth {
            connected: self.connected.load(Ordering::SeqCst),
            last_io: Some(Utc::now()),
        }
    }

    async fn submit_bundle(&self, requests: &[SubmitRequest]) -> Result<BundleAck, AdapterError> {
        self.bundles.lock().push(requests.to_vec());
        if let Some(result) = self.bundle_script.lock().pop_front() {
            return result;
        }
        Ok(BundleAck {
            accepted: true,
            bundle_id: Some("bundle-1".to_string()),
            fills: Vec::new(),
            reject_reason: None,
        })
    }
}

/// Fully wired context over an in-memory store and mock adapters.
pub struct TestContext {
    pub orchestrator: Arc<Orchestrator>,
    pub oms: Arc<OrderManager>,
    pub positions: Arc<PositionTracker>,
    pub registry: Arc<StaticInstrumentRegistry>,
    pub integrated: Arc<MockAdapter>,
    pub external: Arc<MockAdapter>,
    pub defi: Arc<MockAdapter>,
    pub pipeline: EventPipeline,
    shutdown_tx: watch::Sender<bool>,
}

impl TestContext {
    pub async fn new(risk_config: RiskConfig) -> Self {
        let store = Arc::new(OmsStore::in_memory().unwrap());
        let registry = Arc::new(StaticInstrumentRegistry::new());
        let oms = Arc::new(OrderManager::new(store.clone(), registry.clone()));
        let positions =
            Arc::new(PositionTracker::new(store, Decimal::new(1, 8)).unwrap());
        let marks = Arc::new(MarkPriceService::new(
            registry.clone(),
            BinanceMarkFeed::disabled(),
            oms.clone(),
            5,
        ));

        let integrated = MockAdapter::new("BINANCE-SPOT", VenueKind::Integrated, true);
        let external = MockAdapter::new("DERIBIT", VenueKind::ExternalSdk, false);
        let defi = MockAdapter::new("AAVE-V3", VenueKind::ExternalSdk, false);

        let adapters = Arc::new(AdapterRegistry::new());
        adapters.register(integrated.clone());
        adapters.register(external.clone());
        adapters.register(defi.clone());
        adapters
            .connect_all(tokio::time::Duration::from_secs(1))
            .await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pipeline = EventPipeline::spawn(
            2,
            &adapters,
            oms.clone(),
            positions.clone(),
            shutdown_rx,
        );

        let risk = Arc::new(RiskEngine::new(
            risk_config,
            oms.clone(),
            positions.clone(),
            marks.clone(),
            registry.clone(),
        ));
        let router = Arc::new(SmartRouter::new(
            RouterConfig::default(),
            adapters.clone(),
            marks,
        ));

        // Routable scoring needs a mark for the pair.
        let pair = CanonicalId::parse("BINANCE-SPOT:SPOT_PAIR:BTC-USDT").unwrap();
        registry.set_mark(&pair, Decimal::new(30_000, 0));
        let bare_pair = CanonicalId::parse("SPOT_PAIR:BTC-USDT").unwrap();
        registry.set_mark(&bare_pair, Decimal::new(30_000, 0));

        let orchestrator = Arc::new(Orchestrator::new(
            OrchestratorConfig::default(),
            oms.clone(),
            positions.clone(),
            risk,
            router,
            registry.clone(),
            adapters,
        ));

        Self {
            orchestrator,
            oms,
            positions,
            registry,
            integrated,
            external,
            defi,
            pipeline,
            shutdown_tx,
        }
    }

    /// Poll until the order reaches `status` or the deadline passes.
    pub async fn wait_for_status(&self, operation_id: &str, status: OrderStatus) -> Order {
        for _ in 0..100 {
            if let Ok(Some(order)) = self.oms.get(operation_id) {
                if order.status == status {
                    return order;
                }
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
        }
        panic!("order {operation_id} never reached {status:?}");
    }

    /// Poll until the order has `count` fills.
    pub async fn wait_for_fills(&self, operation_id: &str, count: usize) -> Order {
        for _ in 0..100 {
            if let Ok(Some(order)) = self.oms.get(operation_id) {
                if order.fills.len() >= count {
                    return order;
                }
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
        }
        panic!("order {operation_id} never got {count} fills");
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        self.pipeline.abort();
    }
}

pub fn trade_request(operation_id: &str, canonical_id: &str) -> OrderRequest {
    OrderRequest {
        operation_id: operation_id.to_string(),
        operation: Operation::Trade,
        canonical_id: canonical_id.to_string(),
        side: Side::Buy,
        quantity: Decimal::new(5, 1), // 0.5
        price: None,
        order_type: OrderType::Market,
        time_in_force: None,
        exec_algorithm: None,
        exec_algorithm_params: None,
        expected_deltas: None,
        atomic_group_id: None,
        atomic_group_size: None,
        sequence_in_group: None,
        odds: None,
        selection: None,
        strategy_id: "s1".to_string(),
    }
}

pub fn limit_request(
    operation_id: &str,
    canonical_id: &str,
    quantity: Decimal,
    price: Decimal,
) -> OrderRequest {
    let mut request = trade_request(operation_id, canonical_id);
    request.quantity = quantity;
    request.price = Some(price);
    request.order_type = OrderType::Limit;
    request.time_in_force = Some(TimeInForce::Gtc);
    request
}
