//! Execution orchestrator.
//!
//! Owns the `POST /api/orders` request lifecycle end to end: validate,
//! idempotency, risk, atomic-group buffering, routing, persistence, venue
//! dispatch with bounded retries, and cancellation. All collaborators are
//! owned explicitly by [`Orchestrator`]; there are no module-level
//! singletons anywhere in the pipeline.

pub mod events;
pub mod groups;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

use crate::adapters::{AdapterError, AdapterRegistry, SubmitRequest};
use crate::error::GatewayError;
use crate::instrument::{CanonicalId, InstrumentMetadata, InstrumentRegistry};
use crate::oms::{CreateOutcome, OmsError, OrderManager, PositionRecord, StatusContext};
use crate::orders::{
    ExecAlgorithm, Fill, Operation, Order, OrderStatus, OrderType, Side, TimeInForce,
};
use crate::positions::PositionTracker;
use crate::risk::{RiskDecision, RiskEngine};
use crate::router::{slice_algorithm_for, RouteLeg, SmartRouter};

pub use events::EventPipeline;
pub use groups::AtomicGroupBuffer;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub submit_retry_max: u32,
    pub submit_backoff_base_ms: u64,
    pub submit_timeout_ms: u64,
    pub cancel_timeout_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            submit_retry_max: 3,
            submit_backoff_base_ms: 200,
            submit_timeout_ms: 5_000,
            cancel_timeout_ms: 5_000,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("SUBMIT_RETRY_MAX") {
            config.submit_retry_max = v.parse().unwrap_or(config.submit_retry_max);
        }
        if let Ok(v) = std::env::var("SUBMIT_BACKOFF_BASE_MS") {
            config.submit_backoff_base_ms = v.parse().unwrap_or(config.submit_backoff_base_ms);
        }
        if let Ok(v) = std::env::var("SUBMIT_TIMEOUT_MS") {
            config.submit_timeout_ms = v.parse().unwrap_or(config.submit_timeout_ms);
        }
        if let Ok(v) = std::env::var("CANCEL_TIMEOUT_MS") {
            config.cancel_timeout_ms = v.parse().unwrap_or(config.cancel_timeout_ms);
        }
        config
    }
}

/// Caller-facing submission body. Server-assigned fields (venue, status,
/// fills, timestamps) are not accepted here.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderRequest {
    pub operation_id: String,
    pub operation: Operation,
    pub canonical_id: String,
    pub side: Side,
    pub quantity: Decimal,
    #[serde(default)]
    pub price: Option<Decimal>,
    pub order_type: OrderType,
    #[serde(default)]
    pub time_in_force: Option<TimeInForce>,
    #[serde(default)]
    pub exec_algorithm: Option<ExecAlgorithm>,
    #[serde(default)]
    pub exec_algorithm_params: Option<serde_json::Value>,
    #[serde(default)]
    pub expected_deltas: Option<HashMap<String, Decimal>>,
    #[serde(default)]
    pub atomic_group_id: Option<String>,
    #[serde(default)]
    pub atomic_group_size: Option<usize>,
    #[serde(default)]
    pub sequence_in_group: Option<u32>,
    #[serde(default)]
    pub odds: Option<Decimal>,
    #[serde(default)]
    pub selection: Option<String>,
    pub strategy_id: String,
}

/// What `POST /api/orders` returns.
#[derive(Debug, Serialize)]
pub struct SubmitOutcome {
    #[serde(flatten)]
    pub order: Order,
    /// Idempotency hit: this is an existing record, nothing was submitted.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub duplicate: bool,
    /// Held until the rest of its atomic group arrives.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub pending_group: bool,
}

#[derive(Debug, Serialize)]
pub struct AdapterHealthView {
    pub connected: bool,
    pub last_io: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub adapters: HashMap<String, AdapterHealthView>,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    oms: Arc<OrderManager>,
    positions: Arc<PositionTracker>,
    risk: Arc<RiskEngine>,
    router: Arc<SmartRouter>,
    registry: Arc<dyn InstrumentRegistry>,
    adapters: Arc<AdapterRegistry>,
    groups: AtomicGroupBuffer,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OrchestratorConfig,
        oms: Arc<OrderManager>,
        positions: Arc<PositionTracker>,
        risk: Arc<RiskEngine>,
        router: Arc<SmartRouter>,
        registry: Arc<dyn InstrumentRegistry>,
        adapters: Arc<AdapterRegistry>,
    ) -> Self {
        Self {
            config,
            oms,
            positions,
            risk,
            router,
            registry,
            adapters,
            groups: AtomicGroupBuffer::new(),
        }
    }

    pub fn oms(&self) -> &Arc<OrderManager> {
        &self.oms
    }

    pub fn position_tracker(&self) -> &Arc<PositionTracker> {
        &self.positions
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    pub async fn submit_order(&self, request: OrderRequest) -> Result<SubmitOutcome, GatewayError> {
        let started = std::time::Instant::now();
        let result = self.submit_order_inner(request).await;
        metrics::histogram!(
            "order_request_seconds",
            started.elapsed().as_secs_f64()
        );
        result
    }

    async fn submit_order_inner(
        &self,
        request: OrderRequest,
    ) -> Result<SubmitOutcome, GatewayError> {
        // 1-2. Validate the request shape and resolve the instrument.
        let canonical_id = self.validate(&request)?;
        let metadata = self.registry.lookup(&canonical_id).unwrap_or_else(|| {
            debug!(canonical_id = %canonical_id, "instrument not in registry; using defaults");
            InstrumentMetadata::default()
        });

        // 3. Idempotency: an existing record wins, nothing is re-submitted.
        if let Some(existing) = self.oms.get(&request.operation_id).map_err(internal)? {
            info!(operation_id = %existing.operation_id, "duplicate operation_id; returning existing record");
            metrics::increment_counter!("orders_duplicate_total");
            return Ok(SubmitOutcome {
                pending_group: !existing.status.is_terminal()
                    && existing.atomic_group_id.is_some()
                    && existing.venue_order_id.is_none(),
                duplicate: true,
                order: existing,
            });
        }

        let mut order = build_order(&request, canonical_id.clone());

        // 4. Risk. A denial is persisted as REJECTED and never reaches a venue.
        match self.risk.clone().check(&order).await {
            RiskDecision::Allow => {}
            RiskDecision::Deny { reason, detail } => {
                order.status = OrderStatus::Rejected;
                order.rejection_reason = Some(format!("{}: {}", reason.as_str(), detail));
                self.oms.create(&order).map_err(internal)?;
                return Err(GatewayError::RiskDenied { reason });
            }
        }

        // 5. Atomic groups are buffered until complete.
        if let Some(group_id) = request.atomic_group_id.clone() {
            return self.handle_group_member(request, order, &group_id).await;
        }

        // 6. Route.
        let plan = self.router.route(&order, &metadata).await?;
        let primary = plan.primary();
        order.venue = Some(primary.venue.clone());
        order.venue_kind = Some(primary.venue_kind);

        // 7. Persist PENDING before the venue hears anything.
        match self.oms.create(&order).map_err(internal)? {
            CreateOutcome::Created => {}
            CreateOutcome::Duplicate(existing) => {
                // Lost a concurrent race on the same operation_id.
                return Ok(SubmitOutcome {
                    order: existing,
                    duplicate: true,
                    pending_group: false,
                });
            }
        }

        // Execution algorithms and split plans fan out into child orders.
        if plan.is_split() {
            let updated = self.dispatch_split(&order, &plan.legs).await?;
            return Ok(SubmitOutcome {
                order: updated,
                duplicate: false,
                pending_group: false,
            });
        }
        if let Some(algorithm) = slice_algorithm_for(
            order.exec_algorithm,
            order.exec_algorithm_params.as_ref(),
            metadata.size_precision,
        ) {
            let slices = algorithm.slices(&order, &primary.venue, Utc::now());
            let updated = self.dispatch_sliced(&order, slices).await?;
            return Ok(SubmitOutcome {
                order: updated,
                duplicate: false,
                pending_group: false,
            });
        }

        // 8-9. Submit and answer with the current snapshot.
        let updated = self.dispatch_single(&order).await?;
        Ok(SubmitOutcome {
            order: updated,
            duplicate: false,
            pending_group: false,
        })
    }

    fn validate(&self, request: &OrderRequest) -> Result<CanonicalId, GatewayError> {
        if request.operation_id.trim().is_empty() {
            return Err(GatewayError::Malformed("operation_id is required".into()));
        }
        if request.strategy_id.trim().is_empty() {
            return Err(GatewayError::Malformed("strategy_id is required".into()));
        }

        let canonical_id = CanonicalId::parse(&request.canonical_id)
            .map_err(|e| GatewayError::Malformed(e.to_string()))?;

        if request.operation == Operation::Bet && !canonical_id.kind().is_betting() {
            return Err(GatewayError::Malformed(format!(
                "operation 'bet' requires a betting market, got {}",
                canonical_id.kind().as_str()
            )));
        }

        if let Some(group_id) = &request.atomic_group_id {
            if !request.operation.is_groupable() {
                return Err(GatewayError::Malformed(format!(
                    "operation '{}' cannot join atomic group {}",
                    request.operation.as_str(),
                    group_id
                )));
            }
            if canonical_id.is_routable() {
                return Err(GatewayError::Malformed(
                    "atomic groups require venue-bound instruments".into(),
                ));
            }
            if request.sequence_in_group.is_none() {
                return Err(GatewayError::Malformed(
                    "sequence_in_group is required for atomic groups".into(),
                ));
            }
            match request.atomic_group_size {
                Some(size) if size >= 2 => {}
                _ => {
                    return Err(GatewayError::Malformed(
                        "atomic_group_size >= 2 is required for atomic groups".into(),
                    ));
                }
            }
            if request
                .exec_algorithm
                .map(|a| a != ExecAlgorithm::Normal)
                .unwrap_or(false)
            {
                return Err(GatewayError::Malformed(
                    "execution algorithms cannot be combined with atomic groups".into(),
                ));
            }
        }

        Ok(canonical_id)
    }

    // ------------------------------------------------------------------
    // Atomic groups
    // ------------------------------------------------------------------

    async fn handle_group_member(
        &self,
        request: OrderRequest,
        mut order: Order,
        group_id: &str,
    ) -> Result<SubmitOutcome, GatewayError> {
        // Venue-bound by validation; resolve the owning adapter up front.
        let venue = order
            .canonical_id
            .venue()
            .expect("group members are venue-bound")
            .to_string();
        let venue_kind = self
            .adapters
            .adapter_for_venue(&venue)
            .map(|adapter| adapter.kind());
        order.venue = Some(venue);
        order.venue_kind = venue_kind;

        match self.oms.create(&order).map_err(internal)? {
            CreateOutcome::Created => {}
            CreateOutcome::Duplicate(existing) => {
                return Ok(SubmitOutcome {
                    order: existing,
                    duplicate: true,
                    pending_group: false,
                });
            }
        }

        let complete = self.groups.add(
            group_id,
            &order.operation_id,
            request.sequence_in_group.unwrap_or(0),
            request.atomic_group_size.unwrap_or(2),
        );

        match complete {
            None => {
                info!(
                    group_id = %group_id,
                    operation_id = %order.operation_id,
                    "atomic group member held"
                );
                Ok(SubmitOutcome {
                    order,
                    duplicate: false,
                    pending_group: true,
                })
            }
            Some(members) => {
                info!(group_id = %group_id, members = members.len(), "atomic group complete; submitting bundle");
                self.submit_group(group_id, &members).await?;
                let updated = self
                    .oms
                    .get(&order.operation_id)
                    .map_err(internal)?
                    .ok_or_else(|| GatewayError::NotFound(order.operation_id.clone()))?;
                Ok(SubmitOutcome {
                    order: updated,
                    duplicate: false,
                    pending_group: false,
                })
            }
        }
    }

    /// Submit a completed group as one bundle. Every member ends FILLED or
    /// every member ends REJECTED with the same error message.
    async fn submit_group(&self, group_id: &str, members: &[String]) -> Result<(), GatewayError> {
        let mut orders = Vec::with_capacity(members.len());
        for operation_id in members {
            let order = self
                .oms
                .get(operation_id)
                .map_err(internal)?
                .ok_or_else(|| GatewayError::NotFound(operation_id.clone()))?;
            orders.push(order);
        }

        let venue = orders[0].venue.clone().unwrap_or_default();
        if orders.iter().any(|o| o.venue.as_deref() != Some(venue.as_str())) {
            self.reject_group(&orders, "atomic group spans multiple venues")?;
            return Ok(());
        }
        let Some(adapter) = self.adapters.adapter_for_venue(&venue) else {
            self.reject_group(&orders, &format!("no adapter for venue {venue}"))?;
            return Ok(());
        };

        let requests: Vec<SubmitRequest> = orders.iter().map(SubmitRequest::from).collect();
        let mut attempt = 0u32;
        let ack = loop {
            match timeout(
                Duration::from_millis(self.config.submit_timeout_ms),
                adapter.submit_bundle(&requests),
            )
            .await
            {
                Ok(Ok(ack)) => break ack,
                Ok(Err(e)) if e.is_retryable() && attempt < self.config.submit_retry_max => {
                    attempt += 1;
                    warn!(group_id = %group_id, attempt, error = %e, "bundle submit retrying");
                    sleep(self.retry_backoff(attempt)).await;
                }
                Ok(Err(e)) => {
                    self.reject_group(&orders, &format!("bundle submission failed: {e}"))?;
                    return Ok(());
                }
                Err(_) => {
                    self.reject_group(&orders, "bundle submission timed out")?;
                    return Ok(());
                }
            }
        };

        if !ack.accepted {
            let reason = ack
                .reject_reason
                .unwrap_or_else(|| "bundle rejected by venue".to_string());
            self.reject_group(&orders, &reason)?;
            return Ok(());
        }

        let bundle_id = ack.bundle_id.unwrap_or_else(|| group_id.to_string());
        let fills_by_operation: HashMap<&str, &crate::adapters::VenueFill> = ack
            .fills
            .iter()
            .map(|(operation_id, fill)| (operation_id.as_str(), fill))
            .collect();

        for order in &orders {
            self.oms
                .update_status(
                    &order.operation_id,
                    OrderStatus::Submitted,
                    StatusContext {
                        venue_order_id: Some(bundle_id.clone()),
                        ..Default::default()
                    },
                )
                .map_err(internal)?;

            let fill = match fills_by_operation.get(order.operation_id.as_str()) {
                Some(venue_fill) => Fill {
                    fill_id: uuid::Uuid::new_v4().to_string(),
                    quantity: venue_fill.quantity,
                    price: venue_fill.price,
                    fee: venue_fill.fee,
                    venue_fill_id: venue_fill.venue_fill_id.clone(),
                    timestamp: venue_fill.timestamp,
                },
                // Bundles are all-or-nothing; a member without an explicit
                // fill executed at its requested size.
                None => Fill {
                    fill_id: uuid::Uuid::new_v4().to_string(),
                    quantity: order.quantity,
                    price: order.price.unwrap_or(Decimal::ZERO),
                    fee: Decimal::ZERO,
                    venue_fill_id: Some(format!("{}:{}", bundle_id, order.operation_id)),
                    timestamp: Utc::now(),
                },
            };

            let updated = self
                .oms
                .append_fill(&order.operation_id, fill.clone())
                .map_err(internal)?;
            self.positions.on_fill(&updated, &fill).map_err(internal)?;
        }

        info!(group_id = %group_id, members = orders.len(), "atomic group filled");
        Ok(())
    }

    fn reject_group(&self, orders: &[Order], message: &str) -> Result<(), GatewayError> {
        warn!(message, members = orders.len(), "atomic group rejected");
        for order in orders {
            self.oms
                .update_status(
                    &order.operation_id,
                    OrderStatus::Rejected,
                    StatusContext {
                        rejection_reason: Some("GROUP_FAILED".to_string()),
                        error_message: Some(message.to_string()),
                        ..Default::default()
                    },
                )
                .map_err(internal)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Submit one order to its resolved venue with bounded retries. On any
    /// terminal failure the record is moved to REJECTED before the error is
    /// returned, so the caller can always `GET` the outcome.
    async fn dispatch_single(&self, order: &Order) -> Result<Order, GatewayError> {
        let venue = order
            .venue
            .clone()
            .ok_or_else(|| GatewayError::Internal("dispatch without resolved venue".into()))?;
        let adapter = self.adapters.adapter_for_venue(&venue).ok_or_else(|| {
            GatewayError::RouteUnavailable(format!("no adapter registered for venue {venue}"))
        })?;

        if let Some(throttle) = self.adapters.throttle_for_venue(&venue) {
            if throttle.acquire().await.is_err() {
                self.reject(
                    &order.operation_id,
                    "VENUE_BACKPRESSURE",
                    "submission queue full",
                )?;
                return Err(GatewayError::VenueBackpressure { venue });
            }
        }

        let request = SubmitRequest::from(order);
        let mut attempt = 0u32;
        loop {
            let result = timeout(
                Duration::from_millis(self.config.submit_timeout_ms),
                adapter.submit(&request),
            )
            .await;

            match result {
                Err(_) => {
                    self.reject(&order.operation_id, "TIMEOUT", "submit deadline expired")?;
                    return Err(GatewayError::Timeout { stage: "submit" });
                }
                Ok(Ok(ack)) if ack.accepted => {
                    let updated = match self.oms.update_status(
                        &order.operation_id,
                        OrderStatus::Submitted,
                        StatusContext {
                            venue_order_id: ack.venue_order_id.clone(),
                            ..Default::default()
                        },
                    ) {
                        Ok(updated) => updated,
                        // The event stream may have outrun the ack (a fast
                        // fill can land first); the record is already ahead.
                        Err(OmsError::IllegalTransition { .. }) => self
                            .oms
                            .get(&order.operation_id)
                            .map_err(internal)?
                            .ok_or_else(|| {
                                GatewayError::NotFound(order.operation_id.clone())
                            })?,
                        Err(e) => return Err(internal(e)),
                    };
                    return Ok(updated);
                }
                Ok(Ok(ack)) => {
                    let reason = ack
                        .reject_reason
                        .unwrap_or_else(|| "rejected by venue".to_string());
                    self.reject(&order.operation_id, "VENUE_REJECTED", &reason)?;
                    return Err(GatewayError::VenueRejected { venue, reason });
                }
                Ok(Err(e)) if e.is_retryable() && attempt < self.config.submit_retry_max => {
                    attempt += 1;
                    let backoff = self.retry_backoff(attempt);
                    warn!(
                        operation_id = %order.operation_id,
                        venue = %venue,
                        attempt,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "submit retrying after transport failure"
                    );
                    sleep(backoff).await;
                }
                Ok(Err(AdapterError::Rejected { reason })) => {
                    self.reject(&order.operation_id, "VENUE_REJECTED", &reason)?;
                    return Err(GatewayError::VenueRejected { venue, reason });
                }
                Ok(Err(AdapterError::Backpressure)) => {
                    self.reject(
                        &order.operation_id,
                        "VENUE_BACKPRESSURE",
                        "submission queue full",
                    )?;
                    return Err(GatewayError::VenueBackpressure { venue });
                }
                Ok(Err(AdapterError::Timeout)) => {
                    self.reject(&order.operation_id, "TIMEOUT", "venue call deadline expired")?;
                    return Err(GatewayError::Timeout { stage: "submit" });
                }
                Ok(Err(e)) => {
                    self.reject(&order.operation_id, "VENUE_UNREACHABLE", &e.to_string())?;
                    return Err(GatewayError::VenueUnreachable {
                        venue,
                        detail: e.to_string(),
                    });
                }
            }
        }
    }

    /// Create and dispatch one child per route leg, linked to the parent.
    async fn dispatch_split(
        &self,
        parent: &Order,
        legs: &[RouteLeg],
    ) -> Result<Order, GatewayError> {
        for (index, leg) in legs.iter().enumerate() {
            let mut child = parent.clone();
            child.operation_id = format!("{}.{}", parent.operation_id, index + 1);
            child.parent_operation_id = Some(parent.operation_id.clone());
            child.quantity = leg.quantity;
            child.venue = Some(leg.venue.clone());
            child.venue_kind = Some(leg.venue_kind);
            child.created_at = Utc::now();
            child.updated_at = Utc::now();

            self.oms.create(&child).map_err(internal)?;
            if let Err(e) = self.dispatch_single(&child).await {
                warn!(
                    operation_id = %child.operation_id,
                    error = %e,
                    "split child failed; remaining legs continue"
                );
            }
        }

        self.oms
            .update_status(
                &parent.operation_id,
                OrderStatus::Submitted,
                StatusContext::default(),
            )
            .map_err(internal)
    }

    /// Create one child per slice and schedule each at its target time.
    async fn dispatch_sliced(
        &self,
        parent: &Order,
        slices: Vec<crate::router::ChildSlice>,
    ) -> Result<Order, GatewayError> {
        for (index, slice) in slices.into_iter().enumerate() {
            let mut child = parent.clone();
            child.operation_id = format!("{}.{}", parent.operation_id, index + 1);
            child.parent_operation_id = Some(parent.operation_id.clone());
            child.quantity = slice.quantity;
            child.price = slice.limit_price.or(parent.price);
            child.exec_algorithm = None;
            child.exec_algorithm_params = None;
            child.created_at = Utc::now();
            child.updated_at = Utc::now();

            self.oms.create(&child).map_err(internal)?;

            let delay = (slice.at - Utc::now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);
            let this = self.clone_for_task();
            tokio::spawn(async move {
                sleep(delay).await;
                if let Err(e) = this.dispatch_single(&child).await {
                    warn!(
                        operation_id = %child.operation_id,
                        error = %e,
                        "scheduled slice failed"
                    );
                }
            });
        }

        self.oms
            .update_status(
                &parent.operation_id,
                OrderStatus::Submitted,
                StatusContext::default(),
            )
            .map_err(internal)
    }

    fn retry_backoff(&self, attempt: u32) -> Duration {
        let base = self.config.submit_backoff_base_ms;
        let exp = base.saturating_mul(1u64 << attempt.min(8));
        let jitter = rand::thread_rng().gen_range(0..=base / 2 + 1);
        Duration::from_millis(exp + jitter)
    }

    fn reject(
        &self,
        operation_id: &str,
        reason: &str,
        message: &str,
    ) -> Result<(), GatewayError> {
        self.oms
            .update_status(
                operation_id,
                OrderStatus::Rejected,
                StatusContext {
                    rejection_reason: Some(reason.to_string()),
                    error_message: Some(message.to_string()),
                    ..Default::default()
                },
            )
            .map(|_| ())
            .map_err(internal)
    }

    /// Cheap handle for spawned slice tasks.
    fn clone_for_task(&self) -> Arc<OrchestratorTask> {
        Arc::new(OrchestratorTask {
            config: self.config.clone(),
            oms: self.oms.clone(),
            adapters: self.adapters.clone(),
        })
    }

    // ------------------------------------------------------------------
    // Cancellation and queries
    // ------------------------------------------------------------------

    pub async fn cancel_order(&self, operation_id: &str) -> Result<Order, GatewayError> {
        let order = self
            .oms
            .get(operation_id)
            .map_err(internal)?
            .ok_or_else(|| GatewayError::NotFound(operation_id.to_string()))?;

        if order.status.is_terminal() {
            return Ok(order);
        }

        // Never reached a venue: cancel locally.
        if order.status == OrderStatus::Pending || order.venue_order_id.is_none() {
            return self
                .oms
                .update_status(operation_id, OrderStatus::Cancelled, StatusContext::default())
                .map_err(internal);
        }

        let venue = order
            .venue
            .clone()
            .ok_or_else(|| GatewayError::Internal("submitted order without venue".into()))?;
        let adapter = self.adapters.adapter_for_venue(&venue).ok_or_else(|| {
            GatewayError::RouteUnavailable(format!("no adapter registered for venue {venue}"))
        })?;
        let venue_order_id = order.venue_order_id.clone().expect("checked above");

        let ack = match timeout(
            Duration::from_millis(self.config.cancel_timeout_ms),
            adapter.cancel(&venue_order_id),
        )
        .await
        {
            Ok(Ok(ack)) => ack,
            Ok(Err(e)) => {
                return Err(GatewayError::VenueUnreachable {
                    venue,
                    detail: e.to_string(),
                });
            }
            Err(_) => return Err(GatewayError::Timeout { stage: "cancel" }),
        };

        if ack.cancelled {
            match self.oms.update_status(
                operation_id,
                OrderStatus::Cancelled,
                StatusContext::default(),
            ) {
                Ok(updated) => Ok(updated),
                // A racing fill event finished the order first.
                Err(OmsError::IllegalTransition { .. }) => self
                    .oms
                    .get(operation_id)
                    .map_err(internal)?
                    .ok_or_else(|| GatewayError::NotFound(operation_id.to_string())),
                Err(e) => Err(internal(e)),
            }
        } else {
            let reason = ack.reason.unwrap_or_else(|| "cancel refused".to_string());
            Err(GatewayError::VenueRejected { venue, reason })
        }
    }

    pub fn get_order(&self, operation_id: &str) -> Result<Order, GatewayError> {
        self.oms
            .get(operation_id)
            .map_err(internal)?
            .ok_or_else(|| GatewayError::NotFound(operation_id.to_string()))
    }

    pub fn positions(
        &self,
        canonical_key: Option<&str>,
        base_asset: Option<&str>,
        venue: Option<&str>,
    ) -> Vec<PositionRecord> {
        self.positions
            .snapshot()
            .into_iter()
            .filter(|record| {
                canonical_key.map_or(true, |key| record.position_key == key)
                    && base_asset.map_or(true, |asset| record.base_asset == asset)
                    && venue.map_or(true, |venue| {
                        record.per_venue_quantity.contains_key(venue)
                    })
            })
            .collect()
    }

    pub fn health(&self) -> HealthReport {
        let mut adapters = HashMap::new();
        let mut all_connected = true;
        for venue in self.adapters.venues() {
            if let Some(adapter) = self.adapters.adapter_for_venue(&venue) {
                let health = adapter.health();
                all_connected &= health.connected;
                adapters.insert(
                    venue,
                    AdapterHealthView {
                        connected: health.connected,
                        last_io: health.last_io,
                    },
                );
            }
        }
        HealthReport {
            status: if all_connected { "ok" } else { "degraded" },
            adapters,
        }
    }
}

/// Slimmed-down handle used by scheduled slice tasks.
struct OrchestratorTask {
    config: OrchestratorConfig,
    oms: Arc<OrderManager>,
    adapters: Arc<AdapterRegistry>,
}

impl OrchestratorTask {
    async fn dispatch_single(&self, order: &Order) -> Result<Order, GatewayError> {
        let venue = order
            .venue
            .clone()
            .ok_or_else(|| GatewayError::Internal("dispatch without resolved venue".into()))?;
        let adapter = self.adapters.adapter_for_venue(&venue).ok_or_else(|| {
            GatewayError::RouteUnavailable(format!("no adapter registered for venue {venue}"))
        })?;

        if let Some(throttle) = self.adapters.throttle_for_venue(&venue) {
            if throttle.acquire().await.is_err() {
                return Err(GatewayError::VenueBackpressure { venue });
            }
        }

        let request = SubmitRequest::from(order);
        match timeout(
            Duration::from_millis(self.config.submit_timeout_ms),
            adapter.submit(&request),
        )
        .await
        {
            Ok(Ok(ack)) if ack.accepted => self
                .oms
                .update_status(
                    &order.operation_id,
                    OrderStatus::Submitted,
                    StatusContext {
                        venue_order_id: ack.venue_order_id,
                        ..Default::default()
                    },
                )
                .map_err(internal),
            Ok(Ok(ack)) => {
                let reason = ack
                    .reject_reason
                    .unwrap_or_else(|| "rejected by venue".to_string());
                Err(GatewayError::VenueRejected { venue, reason })
            }
            Ok(Err(e)) => Err(GatewayError::VenueUnreachable {
                venue,
                detail: e.to_string(),
            }),
            Err(_) => Err(GatewayError::Timeout { stage: "submit" }),
        }
    }
}

fn internal(e: impl std::fmt::Display) -> GatewayError {
    GatewayError::Internal(e.to_string())
}

/// Materialize a caller request into a fresh PENDING record with
/// server-assigned timestamps.
pub fn build_order(request: &OrderRequest, canonical_id: CanonicalId) -> Order {
    let now = Utc::now();
    let potential_payout = match (request.odds, request.side) {
        (Some(odds), Side::Back) => Some(request.quantity * odds),
        (Some(odds), Side::Lay) => Some(request.quantity * (odds - Decimal::ONE)),
        _ => None,
    };

    Order {
        operation_id: request.operation_id.clone(),
        operation: request.operation,
        canonical_id,
        venue: None,
        venue_kind: None,
        venue_order_id: None,
        side: request.side,
        quantity: request.quantity,
        price: request.price,
        order_type: request.order_type,
        time_in_force: request.time_in_force,
        exec_algorithm: request.exec_algorithm,
        exec_algorithm_params: request.exec_algorithm_params.clone(),
        status: OrderStatus::Pending,
        fills: Vec::new(),
        expected_deltas: request.expected_deltas.clone(),
        atomic_group_id: request.atomic_group_id.clone(),
        sequence_in_group: request.sequence_in_group,
        parent_operation_id: None,
        odds: request.odds,
        selection: request.selection.clone(),
        potential_payout,
        rejection_reason: None,
        error_message: None,
        strategy_id: request.strategy_id.clone(),
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::StaticInstrumentRegistry;
    use crate::marketdata::{BinanceMarkFeed, MarkPriceService};
    use crate::oms::OmsStore;
    use crate::risk::RiskConfig;
    use crate::router::RouterConfig;
    use rust_decimal_macros::dec;

    fn orchestrator() -> Orchestrator {
        let store = Arc::new(OmsStore::in_memory().unwrap());
        let registry: Arc<StaticInstrumentRegistry> = Arc::new(StaticInstrumentRegistry::new());
        let oms = Arc::new(OrderManager::new(store.clone(), registry.clone()));
        let positions = Arc::new(PositionTracker::new(store, dec!(0.00000001)).unwrap());
        let marks = Arc::new(MarkPriceService::new(
            registry.clone(),
            BinanceMarkFeed::disabled(),
            oms.clone(),
            5,
        ));
        let adapters = Arc::new(AdapterRegistry::new());
        let risk = Arc::new(RiskEngine::new(
            RiskConfig::default(),
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
        Orchestrator::new(
            OrchestratorConfig::default(),
            oms,
            positions,
            risk,
            router,
            registry,
            adapters,
        )
    }

    fn request(operation_id: &str) -> OrderRequest {
        OrderRequest {
            operation_id: operation_id.to_string(),
            operation: Operation::Trade,
            canonical_id: "BINANCE-SPOT:SPOT_PAIR:BTC-USDT".to_string(),
            side: Side::Buy,
            quantity: dec!(0.5),
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

    #[tokio::test]
    async fn test_malformed_canonical_id() {
        let orchestrator = orchestrator();
        let mut bad = request("op-1");
        bad.canonical_id = "BTC-USDT".to_string();
        let err = orchestrator.submit_order(bad).await.unwrap_err();
        assert_eq!(err.kind(), "MALFORMED");
    }

    #[tokio::test]
    async fn test_group_requires_groupable_operation() {
        let orchestrator = orchestrator();
        let mut bad = request("op-1");
        bad.atomic_group_id = Some("g-1".to_string());
        bad.atomic_group_size = Some(2);
        bad.sequence_in_group = Some(1);
        let err = orchestrator.submit_order(bad).await.unwrap_err();
        assert_eq!(err.kind(), "MALFORMED");
    }

    #[tokio::test]
    async fn test_group_cannot_mix_with_algorithms() {
        let orchestrator = orchestrator();
        let mut bad = request("op-1");
        bad.operation = Operation::Supply;
        bad.side = Side::Supply;
        bad.canonical_id = "AAVE-V3:A_TOKEN:AUSDC@ARBITRUM".to_string();
        bad.atomic_group_id = Some("g-1".to_string());
        bad.atomic_group_size = Some(2);
        bad.sequence_in_group = Some(1);
        bad.exec_algorithm = Some(ExecAlgorithm::Twap);
        let err = orchestrator.submit_order(bad).await.unwrap_err();
        assert_eq!(err.kind(), "MALFORMED");
    }

    #[tokio::test]
    async fn test_no_adapter_means_route_unavailable() {
        let orchestrator = orchestrator();
        let err = orchestrator.submit_order(request("op-1")).await.unwrap_err();
        assert_eq!(err.kind(), "ROUTE_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_bet_on_non_betting_market_is_malformed() {
        let orchestrator = orchestrator();
        let mut bad = request("op-1");
        bad.operation = Operation::Bet;
        bad.side = Side::Back;
        let err = orchestrator.submit_order(bad).await.unwrap_err();
        assert_eq!(err.kind(), "MALFORMED");
    }

    #[test]
    fn test_potential_payout() {
        let mut req = request("op-1");
        req.odds = Some(dec!(2.5));
        req.side = Side::Back;
        req.quantity = dec!(10);
        let order = build_order(&req, CanonicalId::parse("BETFAIR:MATCH_WINNER:x").unwrap());
        assert_eq!(order.potential_payout, Some(dec!(25.0)));

        req.side = Side::Lay;
        let order = build_order(&req, CanonicalId::parse("BETFAIR:MATCH_WINNER:x").unwrap());
        assert_eq!(order.potential_payout, Some(dec!(15.0)));
    }
}
