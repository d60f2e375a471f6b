// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All data endpoints live under `/api/`. Everything is public read-only;
// CORS is configured permissively so any dashboard origin can poll.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::app_state::AppState;
use crate::market_data::Candle;
use crate::types::Timeframe;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/stats/:symbol/:timeframe", get(stats))
        .route("/api/batch-stats/:timeframe", get(batch_stats))
        .route("/api/live/:symbol", get(live))
        .route("/api/history/:symbol/:timeframe", get(history))
        .route("/health", get(health))
        .layer(cors)
        .with_state(state)
}

fn parse_timeframe(raw: &str) -> Result<Timeframe, (StatusCode, Json<serde_json::Value>)> {
    raw.parse().map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "detail": format!("unknown timeframe '{raw}'") })),
        )
    })
}

// =============================================================================
// Stats
// =============================================================================

async fn stats(
    State(state): State<Arc<AppState>>,
    Path((symbol, timeframe)): Path<(String, String)>,
) -> impl IntoResponse {
    let timeframe = match parse_timeframe(&timeframe) {
        Ok(tf) => tf,
        Err(e) => return e.into_response(),
    };

    match state.get_stats(&symbol, timeframe).await {
        Ok(Some(snapshot)) => Json(snapshot).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "detail": "Data not found" })),
        )
            .into_response(),
        Err(e) => {
            warn!(%symbol, %timeframe, error = %format!("{e:#}"), "stats request failed");
            state.push_error(format!("stats {symbol} {timeframe}: {e:#}"));
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "detail": format!("{e:#}") })),
            )
                .into_response()
        }
    }
}

// =============================================================================
// Batch stats
// =============================================================================

#[derive(Deserialize)]
struct BatchQuery {
    symbols: Option<String>,
}

async fn batch_stats(
    State(state): State<Arc<AppState>>,
    Path(timeframe): Path<String>,
    Query(query): Query<BatchQuery>,
) -> impl IntoResponse {
    let timeframe = match parse_timeframe(&timeframe) {
        Ok(tf) => tf,
        Err(e) => return e.into_response(),
    };

    let symbols: Vec<String> = match query.symbols {
        Some(raw) => raw
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect(),
        None => state.config.read().symbols.clone(),
    };

    let futures = symbols
        .iter()
        .map(|symbol| state.get_stats(symbol, timeframe));
    let outcomes = join_all(futures).await;

    let mut results = HashMap::new();
    for (symbol, outcome) in symbols.into_iter().zip(outcomes) {
        let value = match outcome {
            Ok(Some(snapshot)) => serde_json::to_value(snapshot)
                .unwrap_or_else(|_| json!({ "error": "serialization failed" })),
            Ok(None) => json!({ "error": "No data" }),
            Err(e) => {
                state.push_error(format!("batch-stats {symbol} {timeframe}: {e:#}"));
                json!({ "error": format!("{e:#}") })
            }
        };
        results.insert(symbol, value);
    }
    Json(results).into_response()
}

// =============================================================================
// Live price
// =============================================================================

async fn live(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> impl IntoResponse {
    let symbol = symbol.to_uppercase();
    let price = state.get_current_price(&symbol).await;
    Json(json!({ "symbol": symbol, "price": price }))
}

// =============================================================================
// History
// =============================================================================

#[derive(Debug, Serialize)]
struct HistoryPoint {
    /// UTC seconds, the resolution charting libraries expect.
    time: i64,
    price: f64,
}

fn format_history(candles: &[Candle], limit: usize) -> Vec<HistoryPoint> {
    let start = candles.len().saturating_sub(limit);
    candles[start..]
        .iter()
        .map(|c| HistoryPoint {
            time: c.open_time / 1000,
            price: c.close,
        })
        .collect()
}

async fn history(
    State(state): State<Arc<AppState>>,
    Path((symbol, timeframe)): Path<(String, String)>,
) -> impl IntoResponse {
    let timeframe = match parse_timeframe(&timeframe) {
        Ok(tf) => tf,
        Err(e) => return e.into_response(),
    };

    let series = state.get_candles(&symbol, timeframe).await;
    Json(format_history(&series, 100)).into_response()
}

// =============================================================================
// Health
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "server_time": chrono::Utc::now().timestamp_millis(),
        "uptime_secs": state.uptime_secs(),
        "sources": state.pool.len(),
        "recent_errors": state.recent_errors().len(),
    }))
}
