//! Health, config, symbol, and market-data read endpoints (spec.md §6).

use crate::api::state::AppState;
use crate::error::{ok, AppError, AppResult};
use crate::market::adapter::MarketDataAdapter;
use crate::market::replay::ReplayAction;
use crate::market::Interval;
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Response;
use futures_util::stream::Stream;
use serde::Deserialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;

pub async fn health() -> Response {
    ok(serde_json::json!({"status": "ok"}))
}

pub async fn get_config(State(state): State<AppState>) -> Response {
    ok(serde_json::json!({
        "data_mode": format!("{:?}", state.config.data_mode),
        "strict_live_mode": state.config.strict_live_mode,
        "agent_runtime_cycle_ms": state.config.agent_runtime_cycle_ms,
        "chat_max_text_len": state.config.chat_max_text_len,
        "bets_house_edge": state.config.bets_house_edge,
    }))
}

pub async fn get_symbols(State(state): State<AppState>) -> Response {
    let symbols: Vec<String> = state
        .registry
        .registered_traders()
        .into_iter()
        .flat_map(|t| t.stock_pool)
        .collect::<std::collections::HashSet<_>>()
        .into_iter()
        .collect();
    ok(serde_json::json!({"symbols": symbols}))
}

#[derive(Debug, Deserialize)]
pub struct FramesQuery {
    pub symbol: String,
    #[serde(default = "default_interval")]
    pub interval: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_interval() -> String {
    "1d".to_string()
}

fn default_limit() -> usize {
    180
}

fn parse_interval(s: &str) -> Interval {
    match s {
        "1m" => Interval::OneMinute,
        _ => Interval::OneDay,
    }
}

pub async fn get_market_frames(
    State(state): State<AppState>,
    Query(query): Query<FramesQuery>,
) -> AppResult<Response> {
    let interval = parse_interval(&query.interval);
    let batch = state
        .market
        .get_frames(&query.symbol, interval, query.limit)
        .await
        .map_err(|_| AppError::unavailable("live_frames_unavailable", "live frames unavailable"))?;
    Ok(ok(batch))
}

pub async fn get_klines(
    State(state): State<AppState>,
    Query(query): Query<FramesQuery>,
) -> AppResult<Response> {
    let interval = parse_interval(&query.interval);
    let klines = state
        .market
        .get_klines(&query.symbol, interval, query.limit)
        .await
        .map_err(|_| AppError::unavailable("live_frames_unavailable", "live frames unavailable"))?;
    Ok(ok(klines))
}

pub async fn agent_market_context(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> AppResult<Response> {
    let symbol = query
        .get("symbol")
        .ok_or_else(|| AppError::bad_request("invalid_action", "symbol is required"))?;
    let daily = state
        .market
        .get_frames(symbol, Interval::OneDay, 180)
        .await
        .map_err(|_| AppError::unavailable("live_frames_unavailable", "live frames unavailable"))?;
    let intraday = state
        .market
        .get_frames(symbol, Interval::OneMinute, 180)
        .await
        .unwrap_or(crate::market::FrameBatch {
            frames: vec![],
            mode: daily.mode,
            provider: daily.provider.clone(),
        });
    let features = crate::agent::context::compute_features(
        symbol,
        &intraday.frames,
        &daily.frames,
        0,
        state.clock.now_ms(),
    );
    Ok(ok(features_json(&features)))
}

fn features_json(f: &crate::agent::context::SymbolFeatures) -> serde_json::Value {
    serde_json::json!({
        "symbol": f.symbol,
        "ret_5": f.ret_5,
        "ret_20": f.ret_20,
        "atr_14": f.atr_14,
        "vol_ratio_20": f.vol_ratio_20,
        "rsi_14": f.rsi_14,
        "sma_20": f.sma_20,
        "sma_60": f.sma_60,
        "range_20d_pct": f.range_20d_pct,
        "trend": format!("{:?}", f.trend),
        "intraday_count": f.intraday_count,
        "daily_count": f.daily_count,
    })
}

pub async fn replay_runtime_status(State(state): State<AppState>) -> AppResult<Response> {
    let engine = state
        .replay
        .as_ref()
        .ok_or_else(|| AppError::not_found("memory_not_found", "replay engine not active"))?;
    Ok(ok(engine.status()))
}

#[derive(Debug, Deserialize)]
pub struct ReplayControlBody {
    pub action: String,
    pub arg: Option<f64>,
}

pub async fn replay_runtime_control(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<ReplayControlBody>,
) -> AppResult<Response> {
    let engine = state
        .replay
        .as_ref()
        .ok_or_else(|| AppError::not_found("memory_not_found", "replay engine not active"))?;
    let action = match body.action.as_str() {
        "pause" => ReplayAction::Pause,
        "resume" => ReplayAction::Resume,
        "step" => ReplayAction::Step,
        "set_speed" => ReplayAction::SetSpeed,
        "set_cursor" => ReplayAction::SetCursor,
        "set_loop" => ReplayAction::SetLoop,
        _ => return Err(AppError::bad_request("invalid_action", "unknown replay action")),
    };
    engine.control(action, body.arg);
    Ok(ok(engine.status()))
}

#[derive(Debug, Deserialize)]
pub struct MarketStreamQuery {
    pub symbol: String,
    #[serde(default = "default_interval")]
    pub interval: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
}

fn default_poll_ms() -> u64 {
    5_000
}

/// SSE live-frames feed (spec.md §6): emits `ready` once, then `frames` on
/// every poll tick for as long as the client stays connected.
pub async fn market_stream(
    State(state): State<AppState>,
    Query(query): Query<MarketStreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let interval = parse_interval(&query.interval);
    let stream = async_stream::stream! {
        yield Ok(Event::default().event("ready").data(serde_json::json!({"symbol": query.symbol}).to_string()));
        let mut ticker = tokio::time::interval(Duration::from_millis(query.poll_ms));
        loop {
            ticker.tick().await;
            match state.market.get_frames(&query.symbol, interval, query.limit).await {
                Ok(batch) => yield Ok(Event::default().event("frames").data(serde_json::to_string(&batch).unwrap_or_default())),
                Err(_) => continue,
            }
        }
    };
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_millis(state.config.room_events_keepalive_ms))
            .text("keepalive"),
    )
}

pub async fn ops_live_preflight(State(state): State<AppState>) -> Response {
    match MarketDataAdapter::boot_check(&state.config) {
        Ok(()) => ok(serde_json::json!({"ready": true})),
        Err(reason) => ok(serde_json::json!({"ready": false, "reason": reason})),
    }
}
