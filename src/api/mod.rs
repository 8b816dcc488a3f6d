//! HTTP surface (spec.md §6): read endpoints are unauthenticated, mutating
//! endpoints sit behind `middleware::control_token_gate`.

pub mod agents;
pub mod betting;
pub mod chat;
pub mod decision_hook;
pub mod market;
pub mod packet_builder;
pub mod rooms;
pub mod state;

use crate::middleware::{control_token_gate, request_logging_simple, ControlTokenState};
use axum::routing::{get, post};
use axum::Router;
use state::AppState;
use tower_http::cors::CorsLayer;

pub fn router(app_state: AppState) -> Router {
    let control_state = ControlTokenState {
        token: app_state.config.control_api_token.clone().map(std::sync::Arc::new),
    };

    let reads = Router::new()
        .route("/health", get(market::health))
        .route("/api/config", get(market::get_config))
        .route("/api/symbols", get(market::get_symbols))
        .route("/api/market/frames", get(market::get_market_frames))
        .route("/api/klines", get(market::get_klines))
        .route("/api/market/stream", get(market::market_stream))
        .route("/api/agent/market-context", get(market::agent_market_context))
        .route("/api/replay/runtime/status", get(market::replay_runtime_status))
        .route("/api/ops/live-preflight", get(market::ops_live_preflight))
        .route("/api/traders", get(agents::traders))
        .route("/api/competition", get(agents::competition))
        .route("/api/top-traders", get(agents::top_traders))
        .route("/api/agent/runtime/status", get(agents::agent_runtime_status))
        .route("/api/status", get(agents::agent_status))
        .route("/api/account", get(agents::account))
        .route("/api/positions", get(agents::positions))
        .route("/api/positions/history", get(agents::positions_history))
        .route("/api/decisions/latest", get(agents::decisions_latest))
        .route(
            "/api/agents/:id/decision-audit/latest",
            get(agents::decision_audit_latest),
        )
        .route("/api/statistics", get(agents::statistics))
        .route("/api/equity-history", get(agents::equity_history))
        .route("/api/equity-history-batch", post(agents::equity_history_batch))
        .route("/api/agents/available", get(agents::available_agents))
        .route("/api/agents/registered", get(agents::registered_agents))
        .route("/api/agents/:id/assets/:file", get(agents::agent_asset))
        .route("/api/rooms/:room_id/stream-packet", get(rooms::stream_packet))
        .route("/api/rooms/:room_id/events", get(rooms::room_events))
        .route("/api/chat/rooms/:room_id/public", get(chat::public_preview))
        .route("/api/chat/rooms/:room_id/private", get(chat::private_preview))
        .route("/api/chat/tts/config", get(chat::tts_config))
        .route(
            "/api/chat/tts/profile",
            get(chat::tts_profile_get).delete(chat::tts_profile_delete),
        )
        .route("/api/bets/market", get(betting::bets_market))
        .route("/api/bets/credits", get(betting::bets_credits));

    let mutations = Router::new()
        .route("/api/chat/session/bootstrap", post(chat::session_bootstrap))
        .route("/api/chat/rooms/:room_id/messages", post(chat::post_message))
        .route("/api/chat/tts", post(chat::tts_speak))
        .route("/api/chat/tts/profile", post(chat::tts_profile_set))
        .route("/api/bets/place", post(betting::bets_place))
        .route("/api/agents/:id/register", post(agents::register_agent))
        .route("/api/agents/:id/unregister", post(agents::unregister_agent))
        .route("/api/agents/:id/start", post(agents::start_agent))
        .route("/api/agents/:id/stop", post(agents::stop_agent))
        .route("/api/agent/runtime/control", post(agents::runtime_control))
        .route("/api/agent/runtime/kill-switch", post(agents::kill_switch))
        .route("/api/replay/runtime/control", post(market::replay_runtime_control))
        .route("/api/dev/factory-reset", post(agents::dev_factory_reset))
        .route("/api/dev/reset-agent", post(agents::dev_reset_agent))
        .route_layer(axum::middleware::from_fn_with_state(
            control_state,
            control_token_gate,
        ));

    Router::new()
        .merge(reads)
        .merge(mutations)
        .layer(axum::middleware::from_fn(request_logging_simple))
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}
