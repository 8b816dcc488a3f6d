//! Trading Room Server entry point: wires the explicit `AppState`
//! dependency container, mounts the HTTP/SSE surface, and spawns the
//! background tickers that drive agent decisions, replay playback, session
//! gating and room fan-out.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use trading_room_server::agent::kill_switch::KillSwitch;
use trading_room_server::agent::llm::LlmDecider;
use trading_room_server::agent::memory::AgentMemoryStore;
use trading_room_server::agent::registry::TraderRegistry;
use trading_room_server::agent::runtime::{AgentRuntime, NoopHook};
use trading_room_server::agent::session_gate::SessionGate;
use trading_room_server::api::decision_hook::RuntimeDecisionHook;
use trading_room_server::api::packet_builder::RoomPacketBuilder;
use trading_room_server::api::state::AppState;
use trading_room_server::audit::{DecisionAuditStore, DecisionLog};
use trading_room_server::betting::BettingLedger;
use trading_room_server::chat::{ChatResponder, ChatStore, NarrationGate, ProactiveConfig, ProactiveScheduler};
use trading_room_server::clock::{Clock, SystemClock};
use trading_room_server::config::{Config, DataMode};
use trading_room_server::market::adapter::{Backing, MarketDataAdapter};
use trading_room_server::market::live_file::LiveFileProvider;
use trading_room_server::market::replay::ReplayEngine;
use trading_room_server::market::upstream::UpstreamClient;
use trading_room_server::market::{Frame, Interval};
use trading_room_server::rooms::{RoomBusConfig, RoomEventBus};
use trading_room_server::tts::TtsDispatcher;

#[derive(serde::Deserialize)]
struct SnapshotFile {
    frames: Vec<Frame>,
}

fn load_replay_store(paths: &[Option<&String>]) -> HashMap<(String, Interval), Vec<Frame>> {
    let mut store: HashMap<(String, Interval), Vec<Frame>> = HashMap::new();
    for path in paths.iter().flatten() {
        let Ok(bytes) = std::fs::read(path.as_str()) else {
            continue;
        };
        let Ok(snapshot) = serde_json::from_slice::<SnapshotFile>(&bytes) else {
            continue;
        };
        for frame in snapshot.frames {
            store
                .entry((frame.symbol.clone(), frame.interval))
                .or_default()
                .push(frame);
        }
    }
    for frames in store.values_mut() {
        frames.sort_by_key(|f| f.window.start_ts_ms);
    }
    store
}

fn build_backing(config: &Config, clock: Arc<dyn Clock>) -> Backing {
    match config.data_mode {
        DataMode::LiveFile => {
            let mut providers = HashMap::new();
            if let Some(path) = &config.live_frames_path_cn {
                providers.insert(
                    trading_room_server::agent::types::Exchange::CnA,
                    Arc::new(LiveFileProvider::new(
                        path.clone(),
                        Duration::from_millis(config.session_guard_check_ms),
                        Duration::from_millis(config.data_readiness_fresh_error_ms as u64),
                        clock.clone(),
                    )),
                );
            }
            if let Some(path) = &config.live_frames_path_us {
                providers.insert(
                    trading_room_server::agent::types::Exchange::Us,
                    Arc::new(LiveFileProvider::new(
                        path.clone(),
                        Duration::from_millis(config.session_guard_check_ms),
                        Duration::from_millis(config.data_readiness_fresh_error_ms as u64),
                        clock.clone(),
                    )),
                );
            }
            Backing::LiveFile { providers }
        }
        DataMode::Replay => {
            let store = load_replay_store(&[
                config.live_frames_path_cn.as_ref(),
                config.live_frames_path_us.as_ref(),
            ]);
            let decision_every_bars =
                trading_room_server::market::replay::derive_decision_every_bars(
                    config.agent_runtime_cycle_ms,
                    config.replay_speed,
                    1,
                );
            let (step_tx, _step_rx) = tokio::sync::mpsc::channel(16);
            Backing::Replay {
                engine: Arc::new(ReplayEngine::new(store, decision_every_bars, step_tx)),
            }
        }
        DataMode::Mock => {
            let base_url = config
                .upstream_base_url
                .clone()
                .unwrap_or_else(|| "http://localhost:9900".to_string());
            Backing::Upstream {
                client: Arc::new(UpstreamClient::new(reqwest::Client::new(), base_url)),
            }
        }
    }
}

async fn build_state(config: Arc<Config>) -> Result<AppState> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let backing = build_backing(&config, clock.clone());
    let replay = match &backing {
        Backing::Replay { engine } => Some(engine.clone()),
        _ => None,
    };
    let market = Arc::new(MarketDataAdapter::new(backing, &config));

    let registry = Arc::new(TraderRegistry::new(config.data_dir.clone()));
    registry.load().await;

    let memory = Arc::new(AgentMemoryStore::new(config.data_dir.clone()));
    let kill_switch = Arc::new(KillSwitch::new(config.data_dir.clone()));
    kill_switch.load().await;

    let session_gate = Arc::new(SessionGate::new());
    let llm = Arc::new(LlmDecider::new(reqwest::Client::new(), &config));

    let decision_log = Arc::new(DecisionLog::new(
        std::path::Path::new(&config.data_dir).join("decisions"),
    ));
    let audit_store = Arc::new(DecisionAuditStore::new(
        std::path::Path::new(&config.data_dir).join("decision-audit"),
    ));

    let chat = Arc::new(ChatStore::new(
        config.data_dir.clone(),
        config.chat_max_text_len,
        config.chat_rate_limit_per_min,
    ));
    let chat_responder = Arc::new(ChatResponder::new(
        reqwest::Client::new(),
        config.openai_api_key.clone(),
        config.chat_openai_model.clone(),
        config.agent_llm_timeout_ms,
        config.chat_llm_max_concurrency,
    ));
    let proactive = Arc::new(ProactiveScheduler::new(ProactiveConfig {
        rooms_per_interval: config.chat_rooms_per_interval,
        min_room_interval_ms: config.chat_min_room_interval_ms as i64,
        activity_window_ms: config.chat_activity_window_ms as i64,
        interval_ms: config.chat_proactive_interval_ms as i64,
        burst_interval_ms: config.chat_burst_interval_ms as i64,
        burst_duration_ms: config.chat_burst_duration_ms as i64,
        burst_cooldown_ms: config.chat_burst_cooldown_ms as i64,
        burst_fresh_ms: config.chat_burst_fresh_ms as i64,
        burst_min_priority: config.chat_burst_min_priority,
    }));
    let narration = Arc::new(NarrationGate::default());

    let betting = Arc::new(BettingLedger::new(config.data_dir.clone(), config.bets_house_edge));
    betting.load().await;

    let tts = Arc::new(TtsDispatcher::new(
        reqwest::Client::new(),
        config.data_dir.clone(),
        config.openai_api_key.clone(),
        "http://localhost:9901".to_string(),
        &config.chat_tts_provider,
        config.chat_tts_max_chars,
        std::time::Duration::from_millis(config.chat_tts_timeout_ms),
    ));
    tts.load().await;

    let packet_builder: Arc<dyn trading_room_server::rooms::PacketBuilder> = Arc::new(RoomPacketBuilder {
        registry: registry.clone(),
        memory: memory.clone(),
        decision_log: decision_log.clone(),
        audit_store: audit_store.clone(),
        chat: chat.clone(),
        betting: betting.clone(),
        session_gate: session_gate.clone(),
        market: market.clone(),
        clock: clock.clone(),
    });
    let rooms = Arc::new(RoomEventBus::new(
        RoomBusConfig {
            keepalive_ms: config.room_events_keepalive_ms,
            packet_min_interval_ms: config.room_events_packet_min_interval_ms,
            packet_max_interval_ms: config.room_events_packet_max_interval_ms,
            buffer_size: config.room_events_buffer_size,
            buffer_ttl_ms: config.room_events_buffer_ttl_ms,
        },
        packet_builder,
    ));

    let hook: Arc<dyn trading_room_server::agent::runtime::DecisionHook> = if config.dev_token_saver {
        Arc::new(NoopHook)
    } else {
        Arc::new(RuntimeDecisionHook {
            rooms: rooms.clone(),
            chat: chat.clone(),
            narration: narration.clone(),
            registry: registry.clone(),
            clock: clock.clone(),
        })
    };

    let runtime = Arc::new(AgentRuntime::new(
        config.clone(),
        clock.clone(),
        market.clone(),
        memory.clone(),
        registry.clone(),
        llm.clone(),
        session_gate.clone(),
        kill_switch.clone(),
        hook,
    ));

    Ok(AppState {
        config,
        clock,
        market,
        replay,
        memory,
        registry,
        llm,
        session_gate,
        kill_switch,
        runtime,
        decision_log,
        audit_store,
        rooms,
        chat,
        chat_responder,
        proactive,
        narration,
        betting,
        tts,
    })
}

fn spawn_tickers(state: AppState) {
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(state.runtime.cycle_ms().max(250)));
            loop {
                interval.tick().await;
                if state.runtime.cycle_ms() != interval.period().as_millis() as u64 {
                    interval = tokio::time::interval(Duration::from_millis(state.runtime.cycle_ms().max(250)));
                    interval.tick().await;
                }
                state.runtime.step_once().await;
            }
        });
    }

    if let Some(engine) = state.replay.clone() {
        let tick_ms = state.config.replay_tick_ms.max(50);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(tick_ms));
            loop {
                interval.tick().await;
                if engine.is_running() {
                    engine.advance_one();
                }
            }
        });
    }

    if state.config.session_guard_enabled {
        let state = state.clone();
        let check_ms = state.config.session_guard_check_ms.max(250);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(check_ms));
            loop {
                interval.tick().await;
                state.session_gate.recompute(&state.market, state.clock.now());
                state.runtime.reconcile_session_gate();
            }
        });
    }

    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(1_000));
            loop {
                interval.tick().await;
                state.rooms.tick(state.clock.now_ms()).await;
            }
        });
    }

    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(state.config.chat_proactive_viewer_tick_ms.max(250)));
            loop {
                interval.tick().await;
                let rooms: Vec<(String, bool, bool)> = state
                    .registry
                    .registered_traders()
                    .into_iter()
                    .map(|t| {
                        let running = t.status == trading_room_server::agent::types::TraderStatus::Running;
                        (t.trader_id, running, running)
                    })
                    .collect();
                let selected = state.proactive.select(&rooms, None, state.clock.now_ms());
                for room_id in selected {
                    if !trading_room_server::chat::time_of_day_ok(state.clock.now(), "") {
                        continue;
                    }
                    let text = trading_room_server::chat::template_for(
                        trading_room_server::agent::types::Action::Hold,
                        trading_room_server::agent::types::RiskProfile::Balanced,
                        state.clock.now_ms() as u64,
                    );
                    let now_ms = state.clock.now_ms();
                    if let Ok(message) = state
                        .chat
                        .post(
                            &room_id,
                            "system",
                            None,
                            trading_room_server::chat::Visibility::Public,
                            trading_room_server::chat::SenderKind::System,
                            text,
                            now_ms,
                        )
                        .await
                    {
                        state.rooms.emit_chat(
                            &room_id,
                            serde_json::to_value(&message).unwrap_or(serde_json::Value::Null),
                            now_ms,
                        );
                    }
                }
            }
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Arc::new(Config::from_env());

    if let Err(reason) = MarketDataAdapter::boot_check(&config) {
        error!(reason = %reason, "boot preflight failed");
        std::process::exit(1);
    }

    let state = build_state(config.clone())
        .await
        .context("failed to build application state")?;

    spawn_tickers(state.clone());

    let app = trading_room_server::api::router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(%addr, "trading room server listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutting down");
}
