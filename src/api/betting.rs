//! Viewer prediction-betting endpoints (spec.md §4.10, §6).

use crate::api::state::AppState;
use crate::betting::BetError;
use crate::error::{ok, AppError, AppResult};
use axum::extract::{Query, State};
use axum::response::Response;
use serde::Deserialize;
use std::collections::HashMap;

fn parse_day(query: &HashMap<String, String>, state: &AppState) -> chrono::NaiveDate {
    query
        .get("day")
        .and_then(|s| chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
        .unwrap_or_else(|| state.clock.now().date_naive())
}

fn live_returns_for_market(state: &AppState, market: &str) -> (HashMap<String, f64>, Vec<String>) {
    let mut returns = HashMap::new();
    let mut available = Vec::new();
    for trader in state.registry.registered_traders() {
        if trader.exchange_id.market_key() != market {
            continue;
        }
        returns.insert(trader.trader_id.clone(), state.memory.daily_pnl(&trader.trader_id));
        available.push(trader.trader_id.clone());
    }
    (returns, available)
}

pub async fn bets_market(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> AppResult<Response> {
    let market = query
        .get("market")
        .ok_or_else(|| AppError::bad_request("invalid_action", "market is required"))?;
    let day = parse_day(&query, &state);
    let (returns, _) = live_returns_for_market(&state, market);
    let (odds, odds_active, freeze_ts_ms) = state.betting.odds(market, day, &returns);
    Ok(ok(serde_json::json!({
        "market": market,
        "day": day,
        "odds": odds,
        "odds_update_active": odds_active,
        "freeze_ts_ms": freeze_ts_ms,
    })))
}

pub async fn bets_credits(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> AppResult<Response> {
    let session_id = query
        .get("session_id")
        .ok_or_else(|| AppError::bad_request("invalid_action", "session_id is required"))?;
    Ok(ok(state.betting.credit_record(session_id)))
}

#[derive(Debug, Deserialize)]
pub struct PlaceBetBody {
    pub market: String,
    pub day: Option<String>,
    pub session_id: String,
    pub trader_id: String,
    pub stake_amount: i64,
}

pub async fn bets_place(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<PlaceBetBody>,
) -> AppResult<Response> {
    let day = body
        .day
        .as_deref()
        .and_then(|s| chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
        .unwrap_or_else(|| state.clock.now().date_naive());
    let (returns, available) = live_returns_for_market(&state, &body.market);
    let (_, odds_active, _) = state.betting.odds(&body.market, day, &returns);
    let now_ms = state.clock.now_ms();

    state
        .betting
        .place_bet(
            &body.market,
            day,
            &body.session_id,
            &body.trader_id,
            body.stake_amount,
            &available,
            now_ms,
            !odds_active,
        )
        .await
        .map_err(|e| match e {
            BetError::InvalidStake => AppError::bad_request("invalid_stake", "stake out of range"),
            BetError::BettingClosed => AppError::conflict(
                "betting_closed_before_market_close_30m",
                "betting is closed for this session",
            ),
            BetError::TraderUnavailable => AppError::bad_request(
                "trader_not_available_for_bet",
                "trader not available for betting",
            ),
        })?;

    Ok(ok(state.betting.user_bet(&body.market, day, &body.session_id)))
}
