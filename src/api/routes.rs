//! API routes.
//!
//! The only caller-facing contract the core mandates: order submission,
//! cancellation, order and position queries, and adapter health.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};

use crate::engine::{HealthReport, Orchestrator, OrderRequest, SubmitOutcome};
use crate::error::GatewayError;
use crate::oms::PositionRecord;
use crate::orders::Order;

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/orders", post(post_order))
        .route(
            "/api/orders/:operation_id",
            get(get_order).delete(delete_order),
        )
        .route("/api/positions", get(get_positions))
        .route("/api/health", get(get_health))
        .with_state(state)
}

async fn post_order(
    State(state): State<ApiState>,
    Json(request): Json<OrderRequest>,
) -> Result<Json<SubmitOutcome>, GatewayError> {
    let outcome = state.orchestrator.submit_order(request).await?;
    Ok(Json(outcome))
}

async fn get_order(
    State(state): State<ApiState>,
    Path(operation_id): Path<String>,
) -> Result<Json<Order>, GatewayError> {
    Ok(Json(state.orchestrator.get_order(&operation_id)?))
}

async fn delete_order(
    State(state): State<ApiState>,
    Path(operation_id): Path<String>,
) -> Result<Json<Order>, GatewayError> {
    Ok(Json(state.orchestrator.cancel_order(&operation_id).await?))
}

#[derive(Debug, Deserialize)]
struct PositionQuery {
    canonical_key: Option<String>,
    base_asset: Option<String>,
    venue: Option<String>,
}

#[derive(Debug, Serialize)]
struct PositionListResponse {
    positions: Vec<PositionRecord>,
    count: usize,
}

async fn get_positions(
    State(state): State<ApiState>,
    Query(params): Query<PositionQuery>,
) -> Json<PositionListResponse> {
    let positions = state.orchestrator.positions(
        params.canonical_key.as_deref(),
        params.base_asset.as_deref(),
        params.venue.as_deref(),
    );
    Json(PositionListResponse {
        count: positions.len(),
        positions,
    })
}

async fn get_health(State(state): State<ApiState>) -> Json<HealthReport> {
    Json(state.orchestrator.health())
}
