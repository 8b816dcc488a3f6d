//! Trader roster, account/position/decision reads, and agent/runtime control
//! (spec.md §6).

use crate::agent::memory::ResetScopes;
use crate::agent::types::TraderStatus;
use crate::api::state::AppState;
use crate::error::{ok, AppError, AppResult};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use serde::Deserialize;
use std::collections::HashMap;

pub async fn available_agents(State(state): State<AppState>) -> Response {
    ok(state.registry.available_agents())
}

pub async fn registered_agents(State(state): State<AppState>) -> Response {
    ok(state.registry.registered_traders())
}

pub async fn traders(State(state): State<AppState>) -> Response {
    ok(state.registry.registered_traders())
}

pub async fn competition(State(state): State<AppState>) -> Response {
    let mut rows: Vec<_> = state
        .registry
        .registered_traders()
        .into_iter()
        .map(|t| {
            let snapshot = state.memory.snapshot(&t.trader_id);
            let account = snapshot.account.clone().unwrap_or_else(crate::agent::types::Account::new_default);
            let holdings_value = snapshot.holdings_value();
            (t, account.total_pnl_pct(holdings_value), account.total_equity(holdings_value))
        })
        .collect();
    rows.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let payload: Vec<_> = rows
        .into_iter()
        .map(|(trader, pnl_pct, equity)| {
            serde_json::json!({
                "trader": trader,
                "total_pnl_pct": pnl_pct,
                "total_equity": equity.as_f64(),
            })
        })
        .collect();
    ok(payload)
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    #[serde(default = "default_top_limit")]
    pub limit: usize,
}

fn default_top_limit() -> usize {
    10
}

pub async fn top_traders(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Response {
    let mut rows: Vec<_> = state
        .registry
        .registered_traders()
        .into_iter()
        .map(|t| {
            let snapshot = state.memory.snapshot(&t.trader_id);
            let account = snapshot.account.clone().unwrap_or_else(crate::agent::types::Account::new_default);
            let holdings_value = snapshot.holdings_value();
            (t, account.total_pnl_pct(holdings_value))
        })
        .collect();
    rows.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    rows.truncate(query.limit);
    let payload: Vec<_> = rows
        .into_iter()
        .map(|(trader, pnl_pct)| serde_json::json!({"trader": trader, "total_pnl_pct": pnl_pct}))
        .collect();
    ok(payload)
}

pub async fn agent_runtime_status(State(state): State<AppState>) -> Response {
    ok(serde_json::json!({
        "running": state.runtime.is_running(),
        "cycle_ms": state.runtime.cycle_ms(),
        "metrics": state.runtime.metrics(),
        "kill_switch": state.kill_switch.snapshot(),
    }))
}

fn trader_id_param(query: &HashMap<String, String>) -> AppResult<&str> {
    query
        .get("trader_id")
        .map(|s| s.as_str())
        .ok_or_else(|| AppError::bad_request("invalid_action", "trader_id is required"))
}

pub async fn agent_status(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> AppResult<Response> {
    let trader_id = trader_id_param(&query)?;
    let trader = state
        .registry
        .registered_traders()
        .into_iter()
        .find(|t| t.trader_id == trader_id)
        .ok_or_else(|| AppError::not_found("invalid_trader_id", "trader not found"))?;
    let session = state.session_gate.snapshot(trader.exchange_id);
    let decision_latest = state.decision_log.list_latest(trader_id, 1).into_iter().next();
    Ok(ok(serde_json::json!({
        "trader_id": trader_id,
        "status": trader.status,
        "is_running": state.runtime.is_running() && trader.status == crate::agent::types::TraderStatus::Running,
        "session": {
            "session_is_open": session.session_is_open,
            "phase": format!("{:?}", session.phase),
            "live_fresh_ok": session.live_fresh_ok,
        },
        "decision_latest": decision_latest,
    })))
}

pub async fn account(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> AppResult<Response> {
    let trader_id = trader_id_param(&query)?;
    let (account, holdings) = state.memory.account_and_holdings(trader_id);
    let holdings_value: crate::money::Money = holdings.values().map(|h| h.value()).sum();
    Ok(ok(serde_json::json!({
        "account": account,
        "holdings_value": holdings_value.as_f64(),
        "total_equity": account.total_equity(holdings_value).as_f64(),
    })))
}

pub async fn positions(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> AppResult<Response> {
    let trader_id = trader_id_param(&query)?;
    let (_, holdings) = state.memory.account_and_holdings(trader_id);
    Ok(ok(holdings))
}

pub async fn positions_history(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> AppResult<Response> {
    let trader_id = trader_id_param(&query)?;
    let snapshot = state.memory.snapshot(trader_id);
    Ok(ok(snapshot.equity_curve))
}

#[derive(Debug, Deserialize)]
pub struct DecisionsQuery {
    pub trader_id: String,
    #[serde(default = "default_decisions_limit")]
    pub limit: usize,
}

fn default_decisions_limit() -> usize {
    20
}

pub async fn decisions_latest(
    State(state): State<AppState>,
    Query(query): Query<DecisionsQuery>,
) -> Response {
    ok(state.decision_log.list_latest(&query.trader_id, query.limit))
}

pub async fn decision_audit_latest(
    State(state): State<AppState>,
    Path(trader_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Response {
    ok(state.audit_store.list_latest(&trader_id, query.limit))
}

pub async fn statistics(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> AppResult<Response> {
    let trader_id = trader_id_param(&query)?;
    let snapshot = state.memory.snapshot(trader_id);
    let account = snapshot.account.clone().unwrap_or_else(crate::agent::types::Account::new_default);
    let holdings_value = snapshot.holdings_value();
    Ok(ok(serde_json::json!({
        "total_equity": account.total_equity(holdings_value).as_f64(),
        "total_pnl": account.total_pnl(holdings_value).as_f64(),
        "total_pnl_pct": account.total_pnl_pct(holdings_value),
        "daily_pnl": state.memory.daily_pnl(trader_id),
        "closed_trades": snapshot.closed_trades.len(),
        "daily_journal": snapshot.daily_journal,
    })))
}

pub async fn equity_history(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> AppResult<Response> {
    let trader_id = trader_id_param(&query)?;
    Ok(ok(state.memory.snapshot(trader_id).equity_curve))
}

#[derive(Debug, Deserialize)]
pub struct EquityBatchBody {
    pub trader_ids: Vec<String>,
}

pub async fn equity_history_batch(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<EquityBatchBody>,
) -> Response {
    let mut out = HashMap::new();
    for trader_id in body.trader_ids {
        let curve = state.memory.snapshot(&trader_id).equity_curve;
        out.insert(trader_id, curve);
    }
    ok(out)
}

pub async fn register_agent(
    State(state): State<AppState>,
    Path(trader_id): Path<String>,
) -> AppResult<Response> {
    state
        .registry
        .register(&trader_id)
        .await
        .map_err(|e| AppError::bad_request("invalid_action", e.to_string()))?;
    Ok(ok(serde_json::json!({"trader_id": trader_id, "registered": true})))
}

pub async fn unregister_agent(
    State(state): State<AppState>,
    Path(trader_id): Path<String>,
) -> AppResult<Response> {
    state
        .registry
        .unregister(&trader_id)
        .await
        .map_err(|e| AppError::bad_request("invalid_action", e.to_string()))?;
    Ok(ok(serde_json::json!({"trader_id": trader_id, "registered": false})))
}

pub async fn start_agent(
    State(state): State<AppState>,
    Path(trader_id): Path<String>,
) -> AppResult<Response> {
    state
        .registry
        .set_status(&trader_id, TraderStatus::Running)
        .await
        .map_err(|e| AppError::bad_request("invalid_action", e.to_string()))?;
    Ok(ok(serde_json::json!({"trader_id": trader_id, "status": "running"})))
}

pub async fn stop_agent(
    State(state): State<AppState>,
    Path(trader_id): Path<String>,
) -> AppResult<Response> {
    state
        .registry
        .set_status(&trader_id, TraderStatus::Stopped)
        .await
        .map_err(|e| AppError::bad_request("invalid_action", e.to_string()))?;
    Ok(ok(serde_json::json!({"trader_id": trader_id, "status": "stopped"})))
}

#[derive(Debug, Deserialize)]
pub struct RuntimeControlBody {
    pub action: String,
    pub cycle_ms: Option<u64>,
}

pub async fn runtime_control(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<RuntimeControlBody>,
) -> AppResult<Response> {
    match body.action.as_str() {
        "pause" => state.runtime.pause(),
        "resume" => state
            .runtime
            .resume()
            .map_err(|e| AppError::conflict("invalid_action", e))?,
        "set_cycle_ms" => {
            let ms = body
                .cycle_ms
                .ok_or_else(|| AppError::bad_request("invalid_action", "cycle_ms is required"))?;
            state.runtime.set_cycle_ms(ms);
        }
        _ => return Err(AppError::bad_request("invalid_action", "unknown runtime action")),
    }
    Ok(ok(state.runtime.metrics()))
}

#[derive(Debug, Deserialize)]
pub struct KillSwitchBody {
    pub action: String,
    pub reason: Option<String>,
    pub actor: String,
}

pub async fn kill_switch(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<KillSwitchBody>,
) -> AppResult<Response> {
    let now = state.clock.now();
    match body.action.as_str() {
        "activate" => state
            .kill_switch
            .activate(body.reason.unwrap_or_default(), body.actor, now)
            .await
            .map_err(|e| AppError::internal("internal_error", e.to_string()))?,
        "deactivate" => state
            .kill_switch
            .deactivate(body.actor, now)
            .await
            .map_err(|e| AppError::internal("internal_error", e.to_string()))?,
        _ => return Err(AppError::bad_request("invalid_action", "unknown kill-switch action")),
    }
    Ok(ok(state.kill_switch.snapshot()))
}

#[derive(Debug, Deserialize)]
pub struct FactoryResetBody {
    pub confirm: String,
}

pub async fn dev_factory_reset(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<FactoryResetBody>,
) -> AppResult<Response> {
    if body.confirm != "RESET" {
        return Err(AppError::bad_request(
            "reset_confirmation_required",
            "confirm must equal \"RESET\"",
        ));
    }
    for trader in state.registry.registered_traders() {
        state.memory.reset(
            &trader.trader_id,
            ResetScopes {
                reset_memory: true,
                reset_positions: true,
                reset_stats: true,
            },
        );
    }
    Ok(ok(serde_json::json!({"reset": true})))
}

#[derive(Debug, Deserialize)]
pub struct ResetAgentBody {
    pub trader_id: String,
    pub confirm: String,
    #[serde(default)]
    pub reset_memory: bool,
    #[serde(default)]
    pub reset_positions: bool,
    #[serde(default)]
    pub reset_stats: bool,
}

pub async fn dev_reset_agent(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<ResetAgentBody>,
) -> AppResult<Response> {
    if body.confirm != body.trader_id {
        return Err(AppError::bad_request(
            "reset_confirmation_required",
            "confirm must equal the trader_id",
        ));
    }
    if !(body.reset_memory || body.reset_positions || body.reset_stats) {
        return Err(AppError::bad_request(
            "no_reset_scope_selected",
            "at least one reset scope must be selected",
        ));
    }
    state.memory.reset(
        &body.trader_id,
        ResetScopes {
            reset_memory: body.reset_memory,
            reset_positions: body.reset_positions,
            reset_stats: body.reset_stats,
        },
    );
    Ok(ok(serde_json::json!({"trader_id": body.trader_id, "reset": true})))
}

pub async fn agent_asset(
    State(state): State<AppState>,
    Path((trader_id, file)): Path<(String, String)>,
) -> AppResult<Response> {
    if file.contains("..") || file.contains('/') {
        return Err(AppError::bad_request("invalid_action", "invalid asset name"));
    }
    let path = std::path::Path::new(&state.config.data_dir)
        .join("agents")
        .join("assets")
        .join(&trader_id)
        .join(&file);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| AppError::not_found("memory_not_found", "asset not found"))?;
    let content_type = match path.extension().and_then(|e| e.to_str()) {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    };
    Ok((
        [(axum::http::header::CONTENT_TYPE, content_type)],
        bytes,
    )
        .into_response())
}

use axum::response::IntoResponse;
