use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::api::health::HealthSnapshot;
use crate::clock::Clock;
use crate::collector::Collector;
use crate::config::{DEFAULT_MOVEMENTS_LIMIT, MAX_MOVEMENTS_LIMIT};
use crate::db::Store;
use crate::error::AppError;
use crate::types::{MarketDetails, MovementWithMarket, Significance, StoreSummary};

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn Store>,
    pub collector: Arc<Collector>,
    pub clock: Arc<dyn Clock>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/movements", get(get_movements))
        .route("/markets/:id", get(get_market))
        .route("/stats/summary", get(get_stats_summary))
        .route("/health", get(get_health))
        .route("/collector", post(start_collector).delete(stop_collector))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// `{ success, data?, total? }`; failures go through `AppError`'s response.
#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self { success: true, data: Some(data), total: None })
    }
}

// ---------------------------------------------------------------------------
// Query params / bodies
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct MovementsQuery {
    pub limit: Option<i64>,
    pub significance: Option<String>,
}

#[derive(Serialize)]
pub struct CollectorAck {
    /// False when the collector was already in the requested state.
    pub changed: bool,
    pub running: bool,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_movements(
    State(state): State<ApiState>,
    Query(params): Query<MovementsQuery>,
) -> Result<Json<ApiResponse<Vec<MovementWithMarket>>>, AppError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_MOVEMENTS_LIMIT)
        .clamp(1, MAX_MOVEMENTS_LIMIT);
    let significance = params
        .significance
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(str::parse::<Significance>)
        .transpose()?;

    let movements = state.store.recent_movements(limit, significance).await?;
    let total = movements.len();

    Ok(Json(ApiResponse {
        success: true,
        data: Some(movements),
        total: Some(total),
    }))
}

async fn get_market(
    State(state): State<ApiState>,
    Path(market_id): Path<String>,
) -> Result<Json<ApiResponse<MarketDetails>>, AppError> {
    let details = state
        .store
        .market_details(&market_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("market {market_id}")))?;
    Ok(ApiResponse::ok(details))
}

async fn get_stats_summary(
    State(state): State<ApiState>,
) -> Result<Json<ApiResponse<StoreSummary>>, AppError> {
    let summary = state.store.summary(state.clock.now()).await?;
    Ok(ApiResponse::ok(summary))
}

async fn get_health(State(state): State<ApiState>) -> Json<ApiResponse<HealthSnapshot>> {
    ApiResponse::ok(state.collector.stats().snapshot())
}

async fn start_collector(State(state): State<ApiState>) -> Json<ApiResponse<CollectorAck>> {
    let changed = state.collector.start().await;
    let running = state.collector.is_running().await;
    ApiResponse::ok(CollectorAck { changed, running })
}

async fn stop_collector(State(state): State<ApiState>) -> Json<ApiResponse<CollectorAck>> {
    let changed = state.collector.stop().await;
    let running = state.collector.is_running().await;
    ApiResponse::ok(CollectorAck { changed, running })
}
