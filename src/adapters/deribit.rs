//! Deribit external-SDK adapter.
//!
//! Reference implementation of the adapter contract against a venue's own
//! REST + WebSocket API (JSON-RPC v2). Authentication uses the
//! client_signature grant: HMAC-SHA256 over `timestamp\nnonce\ndata`.
//! Push events come from the `user.orders` / `user.trades` channels; when
//! the WebSocket is disabled by config a polling loop synthesizes the same
//! event types from open-order diffs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use tokio::sync::broadcast;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::instrument::{CanonicalId, InstrumentKind};
use crate::orders::{OrderStatus, VenueKind};

use super::{
    AdapterError, AdapterEvent, AdapterHealth, CancelAck, CancelReason, OrderSnapshot,
    PositionSnapshot, SubmitAck, SubmitRequest, VenueAdapter, VenueFill,
};

const EVENT_CHANNEL_CAPACITY: usize = 2048;
const VENUE: &str = "DERIBIT";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct DeribitConfig {
    pub rest_url: String,
    pub ws_url: String,
    pub client_id: String,
    pub client_secret: String,
    /// Canonical ids this adapter serves; each maps to a Deribit
    /// instrument name.
    pub instruments: Vec<String>,
    /// Currencies queried for open orders and positions.
    pub currencies: Vec<String>,
    /// Use the WebSocket push stream. Off means the polling loop runs.
    pub ws_enabled: bool,
    pub poll_interval_ms: u64,
    pub request_timeout_secs: u64,
}

impl DeribitConfig {
    pub fn from_env() -> Option<Self> {
        let client_id = std::env::var("DERIBIT_CLIENT_ID").ok()?;
        let client_secret = std::env::var("DERIBIT_CLIENT_SECRET").unwrap_or_default();
        let rest_url = std::env::var("DERIBIT_REST_URL")
            .unwrap_or_else(|_| "https://www.deribit.com/api/v2".to_string());
        let ws_url = std::env::var("DERIBIT_WS_URL")
            .unwrap_or_else(|_| "wss://www.deribit.com/ws/api/v2".to_string());
        let instruments = std::env::var("DERIBIT_INSTRUMENTS")
            .unwrap_or_else(|_| "DERIBIT:PERPETUAL:BTC-USD@INV,DERIBIT:PERPETUAL:ETH-USD@INV".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let currencies = std::env::var("DERIBIT_CURRENCIES")
            .unwrap_or_else(|_| "BTC,ETH".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let ws_enabled = std::env::var("DERIBIT_WS_ENABLED")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
            .unwrap_or(true);
        let poll_interval_ms = std::env::var("DERIBIT_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1_500);
        let request_timeout_secs = std::env::var("DERIBIT_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        Some(Self {
            rest_url,
            ws_url,
            client_id,
            client_secret,
            instruments,
            currencies,
            ws_enabled,
            poll_interval_ms,
            request_timeout_secs,
        })
    }
}

// ---------------------------------------------------------------------------
// Wire types (JSON-RPC v2)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: serde::de::DeserializeOwned"))]
struct RpcResponse<T> {
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct AuthResult {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct OrderResult {
    order: DeribitOrder,
    #[serde(default)]
    trades: Vec<DeribitTrade>,
}

#[derive(Debug, Clone, Deserialize)]
struct DeribitOrder {
    order_id: String,
    #[serde(default)]
    label: Option<String>,
    order_state: String,
    instrument_name: String,
    amount: Decimal,
    #[serde(default)]
    filled_amount: Option<Decimal>,
    #[serde(default)]
    average_price: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
struct DeribitTrade {
    trade_id: String,
    order_id: String,
    amount: Decimal,
    price: Decimal,
    #[serde(default)]
    fee: Decimal,
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct DeribitPosition {
    instrument_name: String,
    size: Decimal,
    #[serde(default)]
    mark_price: Option<Decimal>,
}

fn order_state_to_status(state: &str) -> Option<OrderStatus> {
    match state {
        "open" | "untriggered" => Some(OrderStatus::Submitted),
        "filled" => Some(OrderStatus::Filled),
        "cancelled" => Some(OrderStatus::Cancelled),
        "rejected" => Some(OrderStatus::Rejected),
        "expired" => Some(OrderStatus::Expired),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Instrument name mapping
// ---------------------------------------------------------------------------

const MONTHS: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];

/// `YYMMDD` -> Deribit's `DMMMYY` (no leading zero on the day).
fn expiry_code(yymmdd: &str) -> Option<String> {
    if yymmdd.len() != 6 {
        return None;
    }
    let yy = &yymmdd[0..2];
    let mm: usize = yymmdd[2..4].parse().ok()?;
    let dd: u32 = yymmdd[4..6].parse().ok()?;
    let month = MONTHS.get(mm.checked_sub(1)?)?;
    Some(format!("{}{}{}", dd, month, yy))
}

/// Canonical id -> Deribit instrument name.
fn deribit_instrument_name(id: &CanonicalId) -> Option<String> {
    let mut parts = id.payload().split('-');
    let base = parts.next()?;
    match id.kind() {
        InstrumentKind::Perpetual => Some(format!("{}-PERPETUAL", base)),
        InstrumentKind::Future => {
            let _quote = parts.next()?;
            let expiry = expiry_code(parts.next()?)?;
            Some(format!("{}-{}", base, expiry))
        }
        InstrumentKind::Option => {
            let _quote = parts.next()?;
            let expiry = expiry_code(parts.next()?)?;
            let strike = parts.next()?;
            let style = match parts.next()? {
                "CALL" => "C",
                "PUT" => "P",
                _ => return None,
            };
            Some(format!("{}-{}-{}-{}", base, expiry, strike, style))
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

struct TokenState {
    access_token: String,
    expires_at: DateTime<Utc>,
}

pub struct DeribitAdapter {
    config: DeribitConfig,
    http: Client,
    events: broadcast::Sender<AdapterEvent>,
    connected: Arc<AtomicBool>,
    last_io_ms: Arc<AtomicI64>,
    nonce: AtomicU64,
    token: RwLock<Option<TokenState>>,
    /// canonical render -> deribit name, plus the reverse.
    name_by_canonical: HashMap<String, String>,
    canonical_by_name: HashMap<String, CanonicalId>,
    background: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    /// Last seen (filled_amount, state) per order, for the polling loop.
    poll_state: Arc<Mutex<HashMap<String, (Decimal, String)>>>,
}

impl DeribitAdapter {
    pub fn new(config: DeribitConfig) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()?;

        let mut name_by_canonical = HashMap::new();
        let mut canonical_by_name = HashMap::new();
        for raw in &config.instruments {
            match CanonicalId::parse(raw) {
                Ok(id) => match deribit_instrument_name(&id) {
                    Some(name) => {
                        name_by_canonical.insert(id.render(), name.clone());
                        canonical_by_name.insert(name, id);
                    }
                    None => warn!(instrument = %raw, "canonical id has no deribit mapping; skipped"),
                },
                Err(e) => warn!(instrument = %raw, error = %e, "bad DERIBIT_INSTRUMENTS entry"),
            }
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            config,
            http,
            events,
            connected: Arc::new(AtomicBool::new(false)),
            last_io_ms: Arc::new(AtomicI64::new(0)),
            nonce: AtomicU64::new(1),
            token: RwLock::new(None),
            name_by_canonical,
            canonical_by_name,
            background: Mutex::new(Vec::new()),
            poll_state: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn touch(&self) {
        self.last_io_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn transport_err(e: reqwest::Error) -> AdapterError {
        if e.is_timeout() {
            AdapterError::Timeout
        } else {
            AdapterError::Transport(e.to_string())
        }
    }

    /// client_signature grant: HMAC-SHA256(secret, "ts\nnonce\n").
    fn signature(&self, timestamp: i64, nonce: &str) -> Result<String, AdapterError> {
        let payload = format!("{}\n{}\n", timestamp, nonce);
        let mut mac = HmacSha256::new_from_slice(self.config.client_secret.as_bytes())
            .map_err(|_| AdapterError::Transport("bad client secret".to_string()))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn access_token(&self) -> Result<String, AdapterError> {
        if let Some(state) = self.token.read().as_ref() {
            if state.expires_at > Utc::now() + chrono::Duration::seconds(30) {
                return Ok(state.access_token.clone());
            }
        }

        let timestamp = Utc::now().timestamp_millis();
        let nonce = format!("og{}", self.nonce.fetch_add(1, Ordering::Relaxed));
        let signature = self.signature(timestamp, &nonce)?;

        let url = format!("{}/public/auth", self.config.rest_url);
        let response = self
            .http
            .get(&url)
            .query(&[
                ("grant_type", "client_signature"),
                ("client_id", self.config.client_id.as_str()),
                ("timestamp", &timestamp.to_string()),
                ("nonce", &nonce),
                ("data", ""),
                ("signature", &signature),
            ])
            .send()
            .await
            .map_err(Self::transport_err)?;
        self.touch();

        let rpc: RpcResponse<AuthResult> = response.json().await.map_err(Self::transport_err)?;
        if let Some(error) = rpc.error {
            return Err(AdapterError::Transport(format!(
                "auth failed ({}): {}",
                error.code, error.message
            )));
        }
        let auth = rpc
            .result
            .ok_or_else(|| AdapterError::Transport("auth result missing".to_string()))?;

        let token = auth.access_token.clone();
        *self.token.write() = Some(TokenState {
            access_token: auth.access_token,
            expires_at: Utc::now() + chrono::Duration::seconds(auth.expires_in.max(60)),
        });
        Ok(token)
    }

    async fn private_get<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: &[(&str, String)],
    ) -> Result<T, AdapterError> {
        let token = self.access_token().await?;
        let url = format!("{}/{}", self.config.rest_url, method);
        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .query(params)
            .send()
            .await
            .map_err(Self::transport_err)?;
        self.touch();

        let rpc: RpcResponse<T> = response.json().await.map_err(Self::transport_err)?;
        if let Some(error) = rpc.error {
            // JSON-RPC domain errors are venue rejections, not transport.
            return Err(AdapterError::Rejected {
                reason: format!("{} ({})", error.message, error.code),
            });
        }
        rpc.result
            .ok_or_else(|| AdapterError::Transport(format!("{} returned no result", method)))
    }

    fn canonical_for(&self, instrument_name: &str) -> Option<&CanonicalId> {
        self.canonical_by_name.get(instrument_name)
    }

    fn order_snapshot(&self, order: &DeribitOrder) -> Option<OrderSnapshot> {
        let status = order_state_to_status(&order.order_state)?;
        let filled = order.filled_amount.unwrap_or(Decimal::ZERO);
        let fills = if filled > Decimal::ZERO {
            vec![VenueFill {
                // Cumulative-fill synthetic id: re-deliveries of the same
                // progress dedupe, new progress appends.
                venue_fill_id: Some(format!("{}:{}", order.order_id, filled)),
                quantity: filled,
                price: order.average_price.unwrap_or(Decimal::ZERO),
                fee: Decimal::ZERO,
                timestamp: Utc::now(),
            }]
        } else {
            Vec::new()
        };
        Some(OrderSnapshot {
            venue_order_id: order.order_id.clone(),
            operation_id: order.label.clone(),
            status,
            fills,
        })
    }

    /// WebSocket loop: authenticate, subscribe to user channels, map
    /// notifications to adapter events.
    async fn ws_loop(
        config: DeribitConfig,
        signature: (i64, String, String), // (timestamp, nonce, signature)
        events: broadcast::Sender<AdapterEvent>,
        connected: Arc<AtomicBool>,
        last_io_ms: Arc<AtomicI64>,
    ) {
        let (ws_stream, _) = match connect_async(&config.ws_url).await {
            Ok(ok) => ok,
            Err(e) => {
                warn!(error = %e, "deribit websocket connect failed");
                connected.store(false, Ordering::SeqCst);
                return;
            }
        };
        let (mut write, mut read) = ws_stream.split();

        let (timestamp, nonce, sig) = signature;
        let auth = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "public/auth",
            "params": {
                "grant_type": "client_signature",
                "client_id": config.client_id,
                "timestamp": timestamp,
                "nonce": nonce,
                "data": "",
                "signature": sig,
            }
        });
        let subscribe = json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "private/subscribe",
            "params": {
                "channels": ["user.orders.any.any.raw", "user.trades.any.any.raw"],
            }
        });
        for message in [auth, subscribe] {
            if let Err(e) = write.send(Message::Text(message.to_string())).await {
                warn!(error = %e, "deribit websocket send failed");
                connected.store(false, Ordering::SeqCst);
                return;
            }
        }

        connected.store(true, Ordering::SeqCst);
        last_io_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        info!("deribit websocket subscribed to user channels");

        while let Some(message) = read.next().await {
            last_io_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
            match message {
                Ok(Message::Text(text)) => {
                    Self::handle_ws_text(&text, &events);
                }
                Ok(Message::Ping(ping)) => {
                    if write.send(Message::Pong(ping)).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(frame)) => {
                    info!(?frame, "deribit websocket closed by server");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "deribit websocket read error");
                    break;
                }
            }
        }

        connected.store(false, Ordering::SeqCst);
    }

    fn handle_ws_text(text: &str, events: &broadcast::Sender<AdapterEvent>) {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
            warn!("unparseable deribit message");
            return;
        };
        if value.get("method").and_then(|m| m.as_str()) != Some("subscription") {
            debug!("deribit control message");
            return;
        }
        let Some(params) = value.get("params") else { return };
        let channel = params
            .get("channel")
            .and_then(|c| c.as_str())
            .unwrap_or_default();
        let Some(data) = params.get("data") else { return };

        if channel.starts_with("user.orders") {
            match serde_json::from_value::<DeribitOrder>(data.clone()) {
                Ok(order) => {
                    let event = match order.order_state.as_str() {
                        "open" | "untriggered" => Some(AdapterEvent::OrderSubmitted {
                            venue: VENUE.to_string(),
                            venue_order_id: order.order_id.clone(),
                            operation_id: order.label.clone(),
                        }),
                        "cancelled" => Some(AdapterEvent::OrderCancelled {
                            venue: VENUE.to_string(),
                            venue_order_id: order.order_id.clone(),
                            reason: CancelReason::Requested,
                        }),
                        "expired" => Some(AdapterEvent::OrderCancelled {
                            venue: VENUE.to_string(),
                            venue_order_id: order.order_id.clone(),
                            reason: CancelReason::Expired,
                        }),
                        "rejected" => Some(AdapterEvent::OrderRejected {
                            venue: VENUE.to_string(),
                            venue_order_id: Some(order.order_id.clone()),
                            operation_id: order.label.clone(),
                            reason: "rejected by venue".to_string(),
                        }),
                        // Fills arrive on the trades channel.
                        _ => None,
                    };
                    if let Some(event) = event {
                        metrics::increment_counter!(
                            "adapter_events_received_total",
                            "adapter" => "deribit"
                        );
                        let _ = events.send(event);
                    }
                }
                Err(e) => warn!(error = %e, "bad deribit order notification"),
            }
        } else if channel.starts_with("user.trades") {
            // Trades arrive as an array per notification.
            match serde_json::from_value::<Vec<DeribitTrade>>(data.clone()) {
                Ok(trades) => {
                    for trade in trades {
                        metrics::increment_counter!(
                            "adapter_events_received_total",
                            "adapter" => "deribit"
                        );
                        let _ = events.send(AdapterEvent::OrderFilled {
                            venue: VENUE.to_string(),
                            venue_order_id: trade.order_id.clone(),
                            fill: VenueFill {
                                venue_fill_id: Some(trade.trade_id.clone()),
                                quantity: trade.amount,
                                price: trade.price,
                                fee: trade.fee,
                                timestamp: millis_to_utc(trade.timestamp),
                            },
                        });
                    }
                }
                Err(e) => warn!(error = %e, "bad deribit trade notification"),
            }
        }
    }

    /// Polling fallback: diff open-order snapshots into the same event
    /// types the WebSocket would have pushed.
    async fn poll_once(&self) -> Result<(), AdapterError> {
        let mut current: HashMap<String, DeribitOrder> = HashMap::new();
        for currency in &self.config.currencies {
            let orders: Vec<DeribitOrder> = self
                .private_get(
                    "private/get_open_orders_by_currency",
                    &[("currency", currency.clone())],
                )
                .await?;
            for order in orders {
                current.insert(order.order_id.clone(), order);
            }
        }

        let mut previous = self.poll_state.lock();
        for (order_id, order) in &current {
            let filled = order.filled_amount.unwrap_or(Decimal::ZERO);
            match previous.get(order_id) {
                None => {
                    let _ = self.events.send(AdapterEvent::OrderSubmitted {
                        venue: VENUE.to_string(),
                        venue_order_id: order_id.clone(),
                        operation_id: order.label.clone(),
                    });
                    if filled > Decimal::ZERO {
                        self.emit_fill_delta(order, Decimal::ZERO, filled);
                    }
                }
                Some((prev_filled, _)) if filled > *prev_filled => {
                    self.emit_fill_delta(order, *prev_filled, filled);
                }
                Some(_) => {}
            }
            previous.insert(order_id.clone(), (filled, order.order_state.clone()));
        }

        // Orders that left the open set finished one way or another; a
        // subsequent reconcile snapshot settles which way.
        previous.retain(|order_id, _| current.contains_key(order_id));
        Ok(())
    }

    fn emit_fill_delta(&self, order: &DeribitOrder, from: Decimal, to: Decimal) {
        let _ = self.events.send(AdapterEvent::OrderFilled {
            venue: VENUE.to_string(),
            venue_order_id: order.order_id.clone(),
            fill: VenueFill {
                venue_fill_id: Some(format!("{}:{}", order.order_id, to)),
                quantity: to - from,
                price: order.average_price.unwrap_or(Decimal::ZERO),
                fee: Decimal::ZERO,
                timestamp: Utc::now(),
            },
        });
    }
}

fn millis_to_utc(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
}

#[async_trait]
impl VenueAdapter for DeribitAdapter {
    fn venue(&self) -> &str {
        VENUE
    }

    fn kind(&self) -> VenueKind {
        VenueKind::ExternalSdk
    }

    fn supports(&self, id: &CanonicalId) -> bool {
        self.name_by_canonical.contains_key(&id.render())
    }

    async fn connect(&self) -> Result<(), AdapterError> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        // Prove REST auth before declaring the adapter usable.
        self.access_token().await?;

        for task in self.background.lock().drain(..) {
            task.abort();
        }

        if self.config.ws_enabled {
            let timestamp = Utc::now().timestamp_millis();
            let nonce = format!("og{}", self.nonce.fetch_add(1, Ordering::Relaxed));
            let signature = self.signature(timestamp, &nonce)?;

            let task = tokio::spawn(Self::ws_loop(
                self.config.clone(),
                (timestamp, nonce, signature),
                self.events.clone(),
                self.connected.clone(),
                self.last_io_ms.clone(),
            ));
            self.background.lock().push(task);

            for _ in 0..50 {
                if self.connected.load(Ordering::SeqCst) {
                    return Ok(());
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
            return Err(AdapterError::Transport(
                "deribit websocket handshake did not complete".to_string(),
            ));
        }

        // Polling mode: REST is up, run the diff loop.
        self.connected.store(true, Ordering::SeqCst);
        let adapter = self.clone_for_poll();
        let connected = self.connected.clone();
        let interval = std::time::Duration::from_millis(self.config.poll_interval_ms);
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !connected.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = adapter.poll_once().await {
                    warn!(error = %e, "deribit poll failed");
                    if matches!(e, AdapterError::Transport(_) | AdapterError::Timeout) {
                        connected.store(false, Ordering::SeqCst);
                        break;
                    }
                }
            }
        });
        self.background.lock().push(task);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), AdapterError> {
        for task in self.background.lock().drain(..) {
            task.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<SubmitAck, AdapterError> {
        let instrument = self
            .name_by_canonical
            .get(&request.canonical_id.render())
            .ok_or(AdapterError::Unsupported("instrument not configured"))?;

        let method = match request.side.as_str() {
            "BUY" => "private/buy",
            "SELL" => "private/sell",
            _ => return Err(AdapterError::Unsupported("deribit trades are buy/sell")),
        };

        let mut params: Vec<(&str, String)> = vec![
            ("instrument_name", instrument.clone()),
            ("amount", request.quantity.to_string()),
            ("label", request.operation_id.clone()),
            (
                "type",
                match request.order_type.as_str() {
                    "LIMIT" => "limit".to_string(),
                    _ => "market".to_string(),
                },
            ),
        ];
        if let Some(price) = request.price {
            params.push(("price", price.to_string()));
        }
        if let Some(tif) = request.time_in_force {
            let tif = match tif.as_str() {
                "IOC" => "immediate_or_cancel",
                "FOK" => "fill_or_kill",
                _ => "good_til_cancelled",
            };
            params.push(("time_in_force", tif.to_string()));
        }

        metrics::increment_counter!("adapter_submits_total", "adapter" => "deribit");
        match self.private_get::<OrderResult>(method, &params).await {
            Ok(result) => {
                // Immediate executions ride back on the submit response.
                for trade in &result.trades {
                    let _ = self.events.send(AdapterEvent::OrderFilled {
                        venue: VENUE.to_string(),
                        venue_order_id: trade.order_id.clone(),
                        fill: VenueFill {
                            venue_fill_id: Some(trade.trade_id.clone()),
                            quantity: trade.amount,
                            price: trade.price,
                            fee: trade.fee,
                            timestamp: millis_to_utc(trade.timestamp),
                        },
                    });
                }
                Ok(SubmitAck {
                    accepted: true,
                    venue_order_id: Some(result.order.order_id),
                    reject_reason: None,
                })
            }
            Err(AdapterError::Rejected { reason }) => Ok(SubmitAck {
                accepted: false,
                venue_order_id: None,
                reject_reason: Some(reason),
            }),
            Err(e) => Err(e),
        }
    }

    async fn cancel(&self, venue_order_id: &str) -> Result<CancelAck, AdapterError> {
        match self
            .private_get::<DeribitOrder>(
                "private/cancel",
                &[("order_id", venue_order_id.to_string())],
            )
            .await
        {
            Ok(order) => Ok(CancelAck {
                cancelled: order.order_state == "cancelled",
                reason: None,
            }),
            Err(AdapterError::Rejected { reason }) => Ok(CancelAck {
                cancelled: false,
                reason: Some(reason),
            }),
            Err(e) => Err(e),
        }
    }

    async fn open_orders(&self) -> Result<Vec<OrderSnapshot>, AdapterError> {
        let mut snapshots = Vec::new();
        for currency in &self.config.currencies {
            let orders: Vec<DeribitOrder> = self
                .private_get(
                    "private/get_open_orders_by_currency",
                    &[("currency", currency.clone())],
                )
                .await?;
            snapshots.extend(orders.iter().filter_map(|o| self.order_snapshot(o)));
        }
        Ok(snapshots)
    }

    async fn positions(&self) -> Result<Vec<PositionSnapshot>, AdapterError> {
        let mut snapshots = Vec::new();
        for currency in &self.config.currencies {
            let positions: Vec<DeribitPosition> = self
                .private_get("private/get_positions", &[("currency", currency.clone())])
                .await?;
            for position in positions {
                let Some(canonical) = self.canonical_for(&position.instrument_name) else {
                    debug!(
                        instrument = %position.instrument_name,
                        "position on unmapped instrument; skipped"
                    );
                    continue;
                };
                snapshots.push(PositionSnapshot {
                    venue: VENUE.to_string(),
                    position_key: canonical.render(),
                    base_asset: canonical.base_asset(),
                    quantity: position.size,
                    mark_price: position.mark_price,
                });
            }
        }
        Ok(snapshots)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }

    fn health(&self) -> AdapterHealth {
        let last_io_ms = self.last_io_ms.load(Ordering::Relaxed);
        AdapterHealth {
            connected: self.connected.load(Ordering::SeqCst),
            last_io: (last_io_ms > 0).then(|| millis_to_utc(last_io_ms)),
        }
    }
}

impl DeribitAdapter {
    /// Cheap handle for the polling task. Shares connection state, token
    /// cache is re-fetched on demand.
    fn clone_for_poll(&self) -> Arc<Self> {
        Arc::new(Self {
            config: self.config.clone(),
            http: self.http.clone(),
            events: self.events.clone(),
            connected: self.connected.clone(),
            last_io_ms: self.last_io_ms.clone(),
            nonce: AtomicU64::new(self.nonce.load(Ordering::Relaxed) + 1_000),
            token: RwLock::new(None),
            name_by_canonical: self.name_by_canonical.clone(),
            canonical_by_name: self.canonical_by_name.clone(),
            background: Mutex::new(Vec::new()),
            poll_state: self.poll_state.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn config() -> DeribitConfig {
        DeribitConfig {
            rest_url: "http://localhost:9420/api/v2".to_string(),
            ws_url: "ws://localhost:9420/ws/api/v2".to_string(),
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            instruments: vec![
                "DERIBIT:PERPETUAL:BTC-USD@INV".to_string(),
                "DERIBIT:OPTION:BTC-USD-251226-90000-CALL".to_string(),
                "DERIBIT:FUTURE:BTC-USD-250926".to_string(),
            ],
            currencies: vec!["BTC".to_string()],
            ws_enabled: false,
            poll_interval_ms: 1_000,
            request_timeout_secs: 5,
        }
    }

    #[test]
    fn test_instrument_name_mapping() {
        let perp = CanonicalId::parse("DERIBIT:PERPETUAL:BTC-USD@INV").unwrap();
        assert_eq!(
            deribit_instrument_name(&perp).as_deref(),
            Some("BTC-PERPETUAL")
        );

        let future = CanonicalId::parse("DERIBIT:FUTURE:BTC-USD-250926").unwrap();
        assert_eq!(
            deribit_instrument_name(&future).as_deref(),
            Some("BTC-26SEP25")
        );

        let option = CanonicalId::parse("DERIBIT:OPTION:BTC-USD-251226-90000-CALL").unwrap();
        assert_eq!(
            deribit_instrument_name(&option).as_deref(),
            Some("BTC-26DEC25-90000-C")
        );
    }

    #[test]
    fn test_supports_only_configured_instruments() {
        let adapter = DeribitAdapter::new(config()).unwrap();
        let perp = CanonicalId::parse("DERIBIT:PERPETUAL:BTC-USD@INV").unwrap();
        assert!(adapter.supports(&perp));

        let other = CanonicalId::parse("DERIBIT:PERPETUAL:SOL-USD@INV").unwrap();
        assert!(!adapter.supports(&other));
    }

    #[test]
    fn test_signature_is_deterministic() {
        let adapter = DeribitAdapter::new(config()).unwrap();
        let a = adapter.signature(1_700_000_000_000, "og1").unwrap();
        let b = adapter.signature(1_700_000_000_000, "og1").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_trade_notification_maps_to_fill() {
        let (events, mut rx) = broadcast::channel(8);
        let text = r#"{
            "jsonrpc": "2.0",
            "method": "subscription",
            "params": {
                "channel": "user.trades.any.any.raw",
                "data": [{
                    "trade_id": "t-1",
                    "order_id": "v-7",
                    "amount": "10",
                    "price": "30000.5",
                    "fee": "0.01",
                    "timestamp": 1764400000000
                }]
            }
        }"#;
        DeribitAdapter::handle_ws_text(text, &events);

        match rx.try_recv().unwrap() {
            AdapterEvent::OrderFilled {
                venue_order_id,
                fill,
                ..
            } => {
                assert_eq!(venue_order_id, "v-7");
                assert_eq!(fill.quantity, dec!(10));
                assert_eq!(fill.venue_fill_id.as_deref(), Some("t-1"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_order_state_mapping() {
        assert_eq!(order_state_to_status("open"), Some(OrderStatus::Submitted));
        assert_eq!(order_state_to_status("filled"), Some(OrderStatus::Filled));
        assert_eq!(
            order_state_to_status("expired"),
            Some(OrderStatus::Expired)
        );
        assert_eq!(order_state_to_status("???"), None);
    }
}
