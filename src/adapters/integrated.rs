//! Integrated trading runtime driver.
//!
//! One adapter instance fronting every venue configured in the hosted
//! multi-venue runtime (Binance / Bybit / OKX class venues). Submission is
//! REST; acceptance, fills, and position updates arrive over the runtime's
//! WebSocket push stream, so event latency is not bound to any poll cycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::instrument::{CanonicalId, InstrumentKind};
use crate::orders::{OrderStatus, VenueKind};

use super::{
    AdapterError, AdapterEvent, AdapterHealth, BundleAck, CancelAck, CancelReason, DepthProbe,
    OrderSnapshot, PositionSnapshot, SubmitAck, SubmitRequest, VenueAdapter, VenueFill,
};

const EVENT_CHANNEL_CAPACITY: usize = 4096;

#[derive(Debug, Clone)]
pub struct IntegratedDriverConfig {
    pub rest_url: String,
    pub ws_url: String,
    pub api_key: String,
    /// Venue codes the runtime is configured to trade on.
    pub venues: Vec<String>,
    /// Spot pairs (payload form, e.g. "BTC-USDT") tradable via the runtime.
    pub pairs: Vec<String>,
    pub request_timeout_secs: u64,
}

impl IntegratedDriverConfig {
    /// Load from environment. `None` when the runtime is not configured.
    pub fn from_env() -> Option<Self> {
        let rest_url = std::env::var("INTEGRATED_REST_URL").ok()?;
        let ws_url = std::env::var("INTEGRATED_WS_URL")
            .unwrap_or_else(|_| rest_url.replace("http", "ws"));
        let api_key = std::env::var("INTEGRATED_API_KEY").unwrap_or_default();
        let venues = csv_env("INTEGRATED_VENUES", "BINANCE-SPOT,BYBIT,OKX");
        let pairs = csv_env("INTEGRATED_PAIRS", "BTC-USDT,ETH-USDT,SOL-USDT");
        let request_timeout_secs = std::env::var("INTEGRATED_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        Some(Self {
            rest_url,
            ws_url,
            api_key,
            venues,
            pairs,
            request_timeout_secs,
        })
    }
}

fn csv_env(key: &str, default: &str) -> Vec<String> {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct SubmitBody<'a> {
    client_order_id: &'a str,
    venue: &'a str,
    instrument: String,
    operation: &'a str,
    side: &'a str,
    order_type: &'a str,
    quantity: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    time_in_force: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    accepted: bool,
    #[serde(default)]
    order_id: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CancelResponse {
    cancelled: bool,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BundleResponse {
    accepted: bool,
    #[serde(default)]
    bundle_id: Option<String>,
    #[serde(default)]
    fills: Vec<BundleFill>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BundleFill {
    client_order_id: String,
    #[serde(default)]
    fill_id: Option<String>,
    quantity: Decimal,
    price: Decimal,
    #[serde(default)]
    fee: Decimal,
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct OpenOrderRow {
    venue: String,
    order_id: String,
    #[serde(default)]
    client_order_id: Option<String>,
    status: String,
    #[serde(default)]
    fills: Vec<WireFill>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireFill {
    #[serde(default)]
    fill_id: Option<String>,
    quantity: Decimal,
    price: Decimal,
    #[serde(default)]
    fee: Decimal,
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct PositionRow {
    venue: String,
    instrument: String,
    base_asset: String,
    quantity: Decimal,
    #[serde(default)]
    mark_price: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct BookResponse {
    bids: Vec<(Decimal, Decimal)>,
    asks: Vec<(Decimal, Decimal)>,
}

/// Push events from the runtime's WebSocket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RuntimeWsEvent {
    OrderSubmitted {
        venue: String,
        order_id: String,
        #[serde(default)]
        client_order_id: Option<String>,
    },
    OrderFilled {
        venue: String,
        order_id: String,
        fill: WireFill,
    },
    OrderCancelled {
        venue: String,
        order_id: String,
        #[serde(default)]
        reason: Option<String>,
    },
    OrderRejected {
        venue: String,
        #[serde(default)]
        order_id: Option<String>,
        #[serde(default)]
        client_order_id: Option<String>,
        reason: String,
    },
    Position {
        venue: String,
        instrument: String,
        base_asset: String,
        quantity: Decimal,
        #[serde(default)]
        mark_price: Option<Decimal>,
    },
    Account {
        venue: String,
        balances: HashMap<String, Decimal>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Serialize)]
struct WsSubscribe<'a> {
    action: &'a str,
    channels: Vec<&'a str>,
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

pub struct IntegratedDriver {
    config: IntegratedDriverConfig,
    http: Client,
    events: broadcast::Sender<AdapterEvent>,
    connected: Arc<AtomicBool>,
    last_io_ms: Arc<AtomicI64>,
    ws_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl IntegratedDriver {
    pub fn new(config: IntegratedDriverConfig) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .pool_max_idle_per_host(10)
            .default_headers({
                let mut headers = reqwest::header::HeaderMap::new();
                if !config.api_key.is_empty() {
                    headers.insert(
                        reqwest::header::AUTHORIZATION,
                        format!("Bearer {}", config.api_key)
                            .parse()
                            .map_err(|_| anyhow::anyhow!("invalid integrated api key"))?,
                    );
                }
                headers
            })
            .build()?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            config,
            http,
            events,
            connected: Arc::new(AtomicBool::new(false)),
            last_io_ms: Arc::new(AtomicI64::new(0)),
            ws_task: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.rest_url, path)
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

    /// Read loop over the runtime WebSocket. Exits (and flips `connected`)
    /// on any stream failure; the supervisor drives the reconnect.
    async fn ws_read_loop(
        ws_url: String,
        api_key: String,
        events: broadcast::Sender<AdapterEvent>,
        connected: Arc<AtomicBool>,
        last_io_ms: Arc<AtomicI64>,
    ) {
        let url = if api_key.is_empty() {
            ws_url
        } else {
            format!("{}/{}", ws_url, api_key)
        };

        let (ws_stream, response) = match connect_async(&url).await {
            Ok(ok) => ok,
            Err(e) => {
                warn!(error = %e, "integrated runtime websocket connect failed");
                connected.store(false, Ordering::SeqCst);
                return;
            }
        };
        info!(status = %response.status(), "integrated runtime websocket connected");

        let (mut write, mut read) = ws_stream.split();

        let subscribe = WsSubscribe {
            action: "subscribe",
            channels: vec!["orders", "positions", "account"],
        };
        let payload = match serde_json::to_string(&subscribe) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to serialize runtime subscription");
                connected.store(false, Ordering::SeqCst);
                return;
            }
        };
        if let Err(e) = write.send(Message::Text(payload)).await {
            warn!(error = %e, "failed to send runtime subscription");
            connected.store(false, Ordering::SeqCst);
            return;
        }

        connected.store(true, Ordering::SeqCst);
        last_io_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);

        while let Some(message) = read.next().await {
            last_io_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
            match message {
                Ok(Message::Text(text)) => match serde_json::from_str::<RuntimeWsEvent>(&text) {
                    Ok(event) => {
                        if let Some(event) = runtime_event_to_adapter_event(event) {
                            metrics::increment_counter!(
                                "adapter_events_received_total",
                                "adapter" => "integrated"
                            );
                            if events.send(event).is_err() {
                                debug!("no active event subscribers");
                            }
                        }
                    }
                    Err(e) => {
                        // Control frames (subscription acks) land here.
                        if serde_json::from_str::<serde_json::Value>(&text).is_ok() {
                            debug!("runtime control message: {}", &text[..text.len().min(200)]);
                        } else {
                            warn!(error = %e, "unparseable runtime message");
                        }
                    }
                },
                Ok(Message::Ping(ping)) => {
                    if write.send(Message::Pong(ping)).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(frame)) => {
                    info!(?frame, "runtime websocket closed by server");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "runtime websocket read error");
                    break;
                }
            }
        }

        connected.store(false, Ordering::SeqCst);
    }
}

fn runtime_event_to_adapter_event(event: RuntimeWsEvent) -> Option<AdapterEvent> {
    match event {
        RuntimeWsEvent::OrderSubmitted {
            venue,
            order_id,
            client_order_id,
        } => Some(AdapterEvent::OrderSubmitted {
            venue,
            venue_order_id: order_id,
            operation_id: client_order_id,
        }),
        RuntimeWsEvent::OrderFilled {
            venue,
            order_id,
            fill,
        } => Some(AdapterEvent::OrderFilled {
            venue,
            venue_order_id: order_id,
            fill: wire_fill_to_venue_fill(&fill),
        }),
        RuntimeWsEvent::OrderCancelled {
            venue,
            order_id,
            reason,
        } => Some(AdapterEvent::OrderCancelled {
            venue,
            venue_order_id: order_id,
            reason: match reason.as_deref() {
                Some("expired") => CancelReason::Expired,
                _ => CancelReason::Requested,
            },
        }),
        RuntimeWsEvent::OrderRejected {
            venue,
            order_id,
            client_order_id,
            reason,
        } => Some(AdapterEvent::OrderRejected {
            venue,
            venue_order_id: order_id,
            operation_id: client_order_id,
            reason,
        }),
        RuntimeWsEvent::Position {
            venue,
            instrument,
            base_asset,
            quantity,
            mark_price,
        } => Some(AdapterEvent::PositionUpdated {
            venue: venue.clone(),
            snapshot: PositionSnapshot {
                venue,
                position_key: instrument,
                base_asset,
                quantity,
                mark_price,
            },
        }),
        RuntimeWsEvent::Account { venue, balances } => {
            Some(AdapterEvent::AccountUpdated { venue, balances })
        }
        RuntimeWsEvent::Unknown => None,
    }
}

fn wire_fill_to_venue_fill(fill: &WireFill) -> VenueFill {
    VenueFill {
        venue_fill_id: fill.fill_id.clone(),
        quantity: fill.quantity,
        price: fill.price,
        fee: fill.fee,
        timestamp: millis_to_utc(fill.timestamp),
    }
}

fn millis_to_utc(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
}

fn wire_status(status: &str) -> Option<OrderStatus> {
    match status {
        "open" | "submitted" | "new" => Some(OrderStatus::Submitted),
        "partially_filled" => Some(OrderStatus::PartiallyFilled),
        "filled" => Some(OrderStatus::Filled),
        "cancelled" | "canceled" => Some(OrderStatus::Cancelled),
        "rejected" => Some(OrderStatus::Rejected),
        "expired" => Some(OrderStatus::Expired),
        _ => None,
    }
}

#[async_trait]
impl VenueAdapter for IntegratedDriver {
    fn venue(&self) -> &str {
        self.config
            .venues
            .first()
            .map(String::as_str)
            .unwrap_or("INTEGRATED")
    }

    fn venues(&self) -> Vec<String> {
        self.config.venues.clone()
    }

    fn kind(&self) -> VenueKind {
        VenueKind::Integrated
    }

    fn supports(&self, id: &CanonicalId) -> bool {
        match id.kind() {
            InstrumentKind::SpotPair => self.config.pairs.iter().any(|p| p == id.payload()),
            _ => id
                .venue()
                .map(|venue| self.config.venues.iter().any(|v| v == venue))
                .unwrap_or(false),
        }
    }

    async fn connect(&self) -> Result<(), AdapterError> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        // Reap a finished read loop before spawning a fresh one.
        if let Some(task) = self.ws_task.lock().take() {
            task.abort();
        }

        let task = tokio::spawn(Self::ws_read_loop(
            self.config.ws_url.clone(),
            self.config.api_key.clone(),
            self.events.clone(),
            self.connected.clone(),
            self.last_io_ms.clone(),
        ));
        *self.ws_task.lock() = Some(task);

        // The read loop flips `connected` once the subscription is on the
        // wire; give the handshake a moment before reporting failure.
        for _ in 0..50 {
            if self.connected.load(Ordering::SeqCst) {
                return Ok(());
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        Err(AdapterError::Transport(
            "runtime websocket handshake did not complete".to_string(),
        ))
    }

    async fn disconnect(&self) -> Result<(), AdapterError> {
        if let Some(task) = self.ws_task.lock().take() {
            task.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<SubmitAck, AdapterError> {
        let venue = request
            .canonical_id
            .venue()
            .unwrap_or_else(|| self.venue())
            .to_string();
        let body = SubmitBody {
            client_order_id: &request.operation_id,
            venue: &venue,
            instrument: request.canonical_id.payload().to_string(),
            operation: request.operation.as_str(),
            side: request.side.as_str(),
            order_type: request.order_type.as_str(),
            quantity: request.quantity,
            price: request.price,
            time_in_force: request.time_in_force.map(|t| t.as_str()),
        };

        let response = self
            .http
            .post(self.url("/v1/orders"))
            .json(&body)
            .send()
            .await
            .map_err(Self::transport_err)?;
        self.touch();
        metrics::increment_counter!("adapter_submits_total", "adapter" => "integrated");

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(AdapterError::Transport(format!(
                "POST /v1/orders {}: {}",
                status, text
            )));
        }

        let ack: SubmitResponse = response.json().await.map_err(Self::transport_err)?;
        Ok(SubmitAck {
            accepted: ack.accepted,
            venue_order_id: ack.order_id,
            reject_reason: ack.reason,
        })
    }

    async fn cancel(&self, venue_order_id: &str) -> Result<CancelAck, AdapterError> {
        let response = self
            .http
            .delete(self.url(&format!("/v1/orders/{}", venue_order_id)))
            .send()
            .await
            .map_err(Self::transport_err)?;
        self.touch();

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(AdapterError::Transport(format!(
                "DELETE /v1/orders {}: {}",
                status, text
            )));
        }

        let ack: CancelResponse = response.json().await.map_err(Self::transport_err)?;
        Ok(CancelAck {
            cancelled: ack.cancelled,
            reason: ack.reason,
        })
    }

    async fn open_orders(&self) -> Result<Vec<OrderSnapshot>, AdapterError> {
        let response = self
            .http
            .get(self.url("/v1/orders/open"))
            .send()
            .await
            .map_err(Self::transport_err)?;
        self.touch();

        let rows: Vec<OpenOrderRow> = response.json().await.map_err(Self::transport_err)?;
        let snapshots = rows
            .into_iter()
            .filter_map(|row| {
                let status = wire_status(&row.status)?;
                Some(OrderSnapshot {
                    venue_order_id: row.order_id,
                    operation_id: row.client_order_id,
                    status,
                    fills: row.fills.iter().map(wire_fill_to_venue_fill).collect(),
                })
            })
            .collect();
        Ok(snapshots)
    }

    async fn positions(&self) -> Result<Vec<PositionSnapshot>, AdapterError> {
        let response = self
            .http
            .get(self.url("/v1/positions"))
            .send()
            .await
            .map_err(Self::transport_err)?;
        self.touch();

        let rows: Vec<PositionRow> = response.json().await.map_err(Self::transport_err)?;
        Ok(rows
            .into_iter()
            .map(|row| PositionSnapshot {
                venue: row.venue,
                position_key: row.instrument,
                base_asset: row.base_asset,
                quantity: row.quantity,
                mark_price: row.mark_price,
            })
            .collect())
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

    async fn book_depth(&self, id: &CanonicalId) -> Result<Option<DepthProbe>, AdapterError> {
        let venue = id.venue().unwrap_or_else(|| self.venue());
        let response = self
            .http
            .get(self.url(&format!("/v1/books/{}/{}", venue, id.payload())))
            .send()
            .await
            .map_err(Self::transport_err)?;
        self.touch();

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let book: BookResponse = response.json().await.map_err(Self::transport_err)?;
        Ok(Some(DepthProbe {
            bids: book.bids,
            asks: book.asks,
            captured_at: Utc::now(),
        }))
    }

    async fn submit_bundle(
        &self,
        requests: &[SubmitRequest],
    ) -> Result<BundleAck, AdapterError> {
        #[derive(Serialize)]
        struct BundleBody<'a> {
            orders: Vec<SubmitBody<'a>>,
        }

        let orders = requests
            .iter()
            .map(|request| SubmitBody {
                client_order_id: &request.operation_id,
                venue: request.canonical_id.venue().unwrap_or_else(|| self.venue()),
                instrument: request.canonical_id.payload().to_string(),
                operation: request.operation.as_str(),
                side: request.side.as_str(),
                order_type: request.order_type.as_str(),
                quantity: request.quantity,
                price: request.price,
                time_in_force: request.time_in_force.map(|t| t.as_str()),
            })
            .collect();

        let response = self
            .http
            .post(self.url("/v1/bundles"))
            .json(&BundleBody { orders })
            .send()
            .await
            .map_err(Self::transport_err)?;
        self.touch();

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(AdapterError::Transport(format!(
                "POST /v1/bundles {}: {}",
                status, text
            )));
        }

        let ack: BundleResponse = response.json().await.map_err(Self::transport_err)?;
        Ok(BundleAck {
            accepted: ack.accepted,
            bundle_id: ack.bundle_id,
            fills: ack
                .fills
                .into_iter()
                .map(|fill| {
                    (
                        fill.client_order_id.clone(),
                        VenueFill {
                            venue_fill_id: fill.fill_id,
                            quantity: fill.quantity,
                            price: fill.price,
                            fee: fill.fee,
                            timestamp: millis_to_utc(fill.timestamp),
                        },
                    )
                })
                .collect(),
            reject_reason: ack.reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn config() -> IntegratedDriverConfig {
        IntegratedDriverConfig {
            rest_url: "http://localhost:9410".to_string(),
            ws_url: "ws://localhost:9410/stream".to_string(),
            api_key: String::new(),
            venues: vec!["BINANCE-SPOT".to_string(), "BYBIT".to_string()],
            pairs: vec!["BTC-USDT".to_string()],
            request_timeout_secs: 5,
        }
    }

    #[test]
    fn test_supports_pairs_and_bound_instruments() {
        let driver = IntegratedDriver::new(config()).unwrap();

        let pair = CanonicalId::parse("SPOT_PAIR:BTC-USDT").unwrap();
        assert!(driver.supports(&pair));

        let unknown_pair = CanonicalId::parse("SPOT_PAIR:DOGE-USDT").unwrap();
        assert!(!driver.supports(&unknown_pair));

        let bound = CanonicalId::parse("BYBIT:PERPETUAL:BTC-USDT").unwrap();
        assert!(driver.supports(&bound));

        let foreign = CanonicalId::parse("DERIBIT:PERPETUAL:BTC-USD@INV").unwrap();
        assert!(!driver.supports(&foreign));
    }

    #[test]
    fn test_ws_event_deserialization() {
        let json = r#"{
            "type": "order_filled",
            "venue": "BINANCE-SPOT",
            "order_id": "v-1",
            "fill": {
                "fill_id": "vf-9",
                "quantity": "0.5",
                "price": "30000",
                "fee": "0.5",
                "timestamp": 1764400000000
            }
        }"#;

        let event: RuntimeWsEvent = serde_json::from_str(json).unwrap();
        let adapter_event = runtime_event_to_adapter_event(event).unwrap();
        match adapter_event {
            AdapterEvent::OrderFilled {
                venue,
                venue_order_id,
                fill,
            } => {
                assert_eq!(venue, "BINANCE-SPOT");
                assert_eq!(venue_order_id, "v-1");
                assert_eq!(fill.quantity, dec!(0.5));
                assert_eq!(fill.venue_fill_id.as_deref(), Some("vf-9"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_unknown_ws_event_is_dropped() {
        let json = r#"{"type": "heartbeat", "ts": 1}"#;
        let event: RuntimeWsEvent = serde_json::from_str(json).unwrap();
        assert!(runtime_event_to_adapter_event(event).is_none());
    }

    #[test]
    fn test_wire_status_mapping() {
        assert_eq!(wire_status("open"), Some(OrderStatus::Submitted));
        assert_eq!(
            wire_status("partially_filled"),
            Some(OrderStatus::PartiallyFilled)
        );
        assert_eq!(wire_status("weird"), None);
    }
}
