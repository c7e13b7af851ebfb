//! Partitioned adapter-event pipeline.
//!
//! Every adapter's push stream fans into a fixed pool of workers. Events
//! are partitioned by `venue_order_id`, so all events for one venue order
//! land on one worker and apply in emission order, with no global lock.
//! Across different orders nothing is promised.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::adapters::{AdapterEvent, AdapterRegistry, VenueAdapter};
use crate::oms::OrderManager;
use crate::orders::VenueKind;
use crate::positions::PositionTracker;

const WORKER_QUEUE_DEPTH: usize = 1024;

pub struct EventPipeline {
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl EventPipeline {
    /// Wire every registered adapter into `worker_count` ordered consumers.
    pub fn spawn(
        worker_count: usize,
        adapters: &AdapterRegistry,
        oms: Arc<OrderManager>,
        positions: Arc<PositionTracker>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let worker_count = worker_count.max(1);
        let mut senders = Vec::with_capacity(worker_count);
        let mut handles = Vec::new();

        for worker_id in 0..worker_count {
            let (tx, rx) = mpsc::channel::<(VenueKind, AdapterEvent)>(WORKER_QUEUE_DEPTH);
            senders.push(tx);
            handles.push(tokio::spawn(worker_loop(
                worker_id,
                rx,
                oms.clone(),
                positions.clone(),
            )));
        }

        for adapter in adapters.all() {
            // Subscribe before the task is scheduled so nothing emitted
            // during startup slips past the pump.
            let events = adapter.subscribe_events();
            handles.push(tokio::spawn(pump_loop(
                adapter,
                events,
                senders.clone(),
                shutdown.clone(),
            )));
        }

        Self { handles }
    }

    pub fn abort(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

fn partition_for(key: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

/// Forward one adapter's broadcast stream into the partitioned queues.
async fn pump_loop(
    adapter: Arc<dyn VenueAdapter>,
    mut events: tokio::sync::broadcast::Receiver<AdapterEvent>,
    senders: Vec<mpsc::Sender<(VenueKind, AdapterEvent)>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let venue = adapter.venue().to_string();
    let kind = adapter.kind();

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            event = events.recv() => match event {
                Ok(event) => {
                    let partition = partition_for(event.partition_key(), senders.len());
                    if senders[partition].send((kind, event)).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    // Dropped events are recovered by the next reconciliation.
                    warn!(venue = %venue, missed, "event consumer lagged; reconciliation will catch up");
                    metrics::increment_counter!("adapter_events_lagged_total", "venue" => venue.clone());
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    debug!(venue = %venue, "event pump stopped");
}

/// Apply events in arrival order. Errors are logged and never kill the
/// worker; the periodic reconciliation pass repairs whatever was missed.
async fn worker_loop(
    worker_id: usize,
    mut rx: mpsc::Receiver<(VenueKind, AdapterEvent)>,
    oms: Arc<OrderManager>,
    positions: Arc<PositionTracker>,
) {
    while let Some((kind, event)) = rx.recv().await {
        apply_one(&oms, &positions, kind, &event);
    }
    debug!(worker_id, "event worker stopped");
}

fn apply_one(
    oms: &OrderManager,
    positions: &PositionTracker,
    kind: VenueKind,
    event: &AdapterEvent,
) {
    match event {
        AdapterEvent::PositionUpdated { venue, snapshot } => {
            if let Err(e) = positions.on_position_update(venue, snapshot, kind) {
                warn!(venue = %venue, error = %e, "position update failed");
            }
        }
        AdapterEvent::AccountUpdated { venue, balances } => {
            debug!(venue = %venue, assets = balances.len(), "account update");
        }
        AdapterEvent::OrderFilled {
            venue,
            venue_order_id,
            fill,
        } => {
            // Count fills before and after so duplicate re-deliveries do not
            // double-apply to positions.
            let before = match oms.find_by_venue_order_id(venue, venue_order_id) {
                Ok(Some(order)) => order.fills.len(),
                Ok(None) => 0,
                Err(e) => {
                    warn!(venue = %venue, error = %e, "fill lookup failed");
                    return;
                }
            };

            match oms.apply_event(event) {
                Ok(Some(order)) => {
                    if order.fills.len() > before {
                        let applied = crate::orders::Fill {
                            fill_id: String::new(),
                            quantity: fill.quantity,
                            price: fill.price,
                            fee: fill.fee,
                            venue_fill_id: fill.venue_fill_id.clone(),
                            timestamp: fill.timestamp,
                        };
                        if let Err(e) = positions.on_fill(&order, &applied) {
                            warn!(
                                operation_id = %order.operation_id,
                                error = %e,
                                "position fill application failed"
                            );
                        }
                    }
                    let lag_ms = (Utc::now() - fill.timestamp).num_milliseconds().max(0);
                    metrics::histogram!("event_to_db_lag_ms", lag_ms as f64);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(venue = %venue, error = %e, "event application failed; reconciliation will repair");
                    metrics::increment_counter!("event_apply_errors_total");
                }
            }
        }
        other => {
            if let Err(e) = oms.apply_event(other) {
                warn!(venue = other.venue(), error = %e, "event application failed; reconciliation will repair");
                metrics::increment_counter!("event_apply_errors_total");
            }
        }
    }
}
