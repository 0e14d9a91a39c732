// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. The health endpoint is public; every
// query endpoint requires a valid Bearer token via the `AuthBearer`
// extractor. CORS is configured permissively for development.
//
// Range timestamps are epoch seconds (UTC). Timeframes use their wire labels
// ("1m", "5m", ...).
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::errors::CoreError;
use crate::query::QueryFacade;
use crate::types::{SubscriptionKey, Timeframe};

/// Shared context handed to every handler.
pub struct ApiContext {
    pub state: Arc<AppState>,
    pub facade: Arc<QueryFacade>,
}

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(ctx: Arc<ApiContext>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/timeframes", get(timeframes))
        .route(
            "/api/v1/subscriptions",
            get(subscriptions).post(subscribe).delete(unsubscribe),
        )
        .route("/api/v1/ticks/latest", get(latest_tick))
        .route("/api/v1/ticks/range", get(tick_range))
        .route("/api/v1/ticks/aggregate", get(tick_aggregate))
        .route("/api/v1/candles/latest", get(latest_candle))
        .route("/api/v1/candles/recent", get(recent_candles))
        .route("/api/v1/candles/range", get(candle_range))
        .route("/api/v1/candles/aggregate", get(candle_aggregate))
        .route("/api/v1/indicators/latest", get(latest_indicators))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(ctx)
}

// =============================================================================
// Error mapping
// =============================================================================

enum ApiError {
    BadRequest(String),
    NotFound,
    Internal(String),
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        let body = serde_json::json!({ "error": message });
        (status, Json(body)).into_response()
    }
}

fn parse_timeframe(label: &str) -> Result<Timeframe, ApiError> {
    Timeframe::parse(label)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown timeframe '{label}'")))
}

fn parse_epoch(name: &str, secs: i64) -> Result<DateTime<Utc>, ApiError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| ApiError::BadRequest(format!("'{name}' is out of range")))
}

// =============================================================================
// Health (public)
// =============================================================================

async fn health(State(ctx): State<Arc<ApiContext>>) -> impl IntoResponse {
    Json(ctx.state.health_snapshot())
}

// =============================================================================
// Timeframes & subscriptions (authenticated)
// =============================================================================

async fn timeframes(_auth: AuthBearer, State(ctx): State<Arc<ApiContext>>) -> impl IntoResponse {
    let labels: Vec<String> = ctx
        .state
        .config
        .candles
        .timeframes
        .iter()
        .map(Timeframe::to_string)
        .collect();
    Json(labels)
}

async fn subscriptions(_auth: AuthBearer, State(ctx): State<Arc<ApiContext>>) -> impl IntoResponse {
    Json(ctx.state.feed.subscriptions())
}

#[derive(Deserialize)]
struct SubscriptionBody {
    symbol: String,
    exchange: String,
}

async fn subscribe(
    _auth: AuthBearer,
    State(ctx): State<Arc<ApiContext>>,
    Json(body): Json<SubscriptionBody>,
) -> Result<impl IntoResponse, ApiError> {
    if body.symbol.trim().is_empty() || body.exchange.trim().is_empty() {
        return Err(ApiError::BadRequest("symbol and exchange are required".into()));
    }
    let key = SubscriptionKey::new(
        body.symbol.trim().to_uppercase(),
        body.exchange.trim().to_uppercase(),
    );
    info!(key = %key, "subscription requested via API");
    ctx.state.feed.subscribe(key.clone());
    Ok(Json(key))
}

async fn unsubscribe(
    _auth: AuthBearer,
    State(ctx): State<Arc<ApiContext>>,
    Json(body): Json<SubscriptionBody>,
) -> Result<impl IntoResponse, ApiError> {
    let key = SubscriptionKey::new(
        body.symbol.trim().to_uppercase(),
        body.exchange.trim().to_uppercase(),
    );
    info!(key = %key, "unsubscribe requested via API");
    ctx.state.feed.unsubscribe(&key);
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Ticks (authenticated)
// =============================================================================

#[derive(Deserialize)]
struct LatestTickParams {
    symbol: String,
    exchange: Option<String>,
}

async fn latest_tick(
    _auth: AuthBearer,
    State(ctx): State<Arc<ApiContext>>,
    Query(params): Query<LatestTickParams>,
) -> Result<Response, ApiError> {
    let tick = ctx
        .facade
        .latest_tick(&params.symbol.to_uppercase(), params.exchange.as_deref())
        .await?;
    match tick {
        Some(tick) => Ok(Json(tick).into_response()),
        None => Err(ApiError::NotFound),
    }
}

#[derive(Deserialize)]
struct TickRangeParams {
    symbol: String,
    from: i64,
    to: i64,
    limit: Option<usize>,
}

async fn tick_range(
    _auth: AuthBearer,
    State(ctx): State<Arc<ApiContext>>,
    Query(params): Query<TickRangeParams>,
) -> Result<Response, ApiError> {
    let from = parse_epoch("from", params.from)?;
    let to = parse_epoch("to", params.to)?;
    let ticks = ctx
        .facade
        .tick_range(&params.symbol.to_uppercase(), from, to, params.limit)
        .await?;
    Ok(Json(ticks).into_response())
}

#[derive(Deserialize)]
struct TickAggregateParams {
    symbol: String,
    from: i64,
    to: i64,
}

async fn tick_aggregate(
    _auth: AuthBearer,
    State(ctx): State<Arc<ApiContext>>,
    Query(params): Query<TickAggregateParams>,
) -> Result<Response, ApiError> {
    let from = parse_epoch("from", params.from)?;
    let to = parse_epoch("to", params.to)?;
    let aggregate = ctx
        .facade
        .tick_aggregate(&params.symbol.to_uppercase(), from, to)
        .await?;
    match aggregate {
        Some(aggregate) => Ok(Json(aggregate).into_response()),
        None => Err(ApiError::NotFound),
    }
}

// =============================================================================
// Candles (authenticated)
// =============================================================================

#[derive(Deserialize)]
struct SeriesParams {
    symbol: String,
    timeframe: String,
}

async fn latest_candle(
    _auth: AuthBearer,
    State(ctx): State<Arc<ApiContext>>,
    Query(params): Query<SeriesParams>,
) -> Result<Response, ApiError> {
    let timeframe = parse_timeframe(&params.timeframe)?;
    let candle = ctx
        .facade
        .latest_candle(&params.symbol.to_uppercase(), timeframe)
        .await?;
    match candle {
        Some(candle) => Ok(Json(candle).into_response()),
        None => Err(ApiError::NotFound),
    }
}

#[derive(Deserialize)]
struct RecentCandlesParams {
    symbol: String,
    timeframe: String,
    count: usize,
}

async fn recent_candles(
    _auth: AuthBearer,
    State(ctx): State<Arc<ApiContext>>,
    Query(params): Query<RecentCandlesParams>,
) -> Result<Response, ApiError> {
    let timeframe = parse_timeframe(&params.timeframe)?;
    let candles = ctx
        .facade
        .latest_candles(&params.symbol.to_uppercase(), timeframe, params.count)
        .await?;
    Ok(Json(candles).into_response())
}

#[derive(Deserialize)]
struct CandleRangeParams {
    symbol: String,
    timeframe: String,
    from: i64,
    to: i64,
}

async fn candle_range(
    _auth: AuthBearer,
    State(ctx): State<Arc<ApiContext>>,
    Query(params): Query<CandleRangeParams>,
) -> Result<Response, ApiError> {
    let timeframe = parse_timeframe(&params.timeframe)?;
    let from = parse_epoch("from", params.from)?;
    let to = parse_epoch("to", params.to)?;
    let candles = ctx
        .facade
        .candle_range(&params.symbol.to_uppercase(), timeframe, from, to)
        .await?;
    Ok(Json(candles).into_response())
}

async fn candle_aggregate(
    _auth: AuthBearer,
    State(ctx): State<Arc<ApiContext>>,
    Query(params): Query<CandleRangeParams>,
) -> Result<Response, ApiError> {
    let timeframe = parse_timeframe(&params.timeframe)?;
    let from = parse_epoch("from", params.from)?;
    let to = parse_epoch("to", params.to)?;
    let aggregate = ctx
        .facade
        .candle_aggregate(&params.symbol.to_uppercase(), timeframe, from, to)
        .await?;
    match aggregate {
        Some(aggregate) => Ok(Json(aggregate).into_response()),
        None => Err(ApiError::NotFound),
    }
}

// =============================================================================
// Indicators (authenticated)
// =============================================================================

async fn latest_indicators(
    _auth: AuthBearer,
    State(ctx): State<Arc<ApiContext>>,
    Query(params): Query<SeriesParams>,
) -> Result<Response, ApiError> {
    let timeframe = parse_timeframe(&params.timeframe)?;
    let snapshot = ctx
        .facade
        .latest_indicators(&params.symbol.to_uppercase(), timeframe)
        .await?;
    match snapshot {
        Some(snapshot) => Ok(Json(snapshot).into_response()),
        None => Err(ApiError::NotFound),
    }
}
