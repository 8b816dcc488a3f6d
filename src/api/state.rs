//! Explicit dependency container (spec.md §9 "Dynamic reconfiguration
//! without globals"): one `AppState` constructed at boot and threaded
//! through every handler via axum's `State` extractor, replacing the
//! source's module-level singletons.

use crate::agent::kill_switch::KillSwitch;
use crate::agent::llm::LlmDecider;
use crate::agent::memory::AgentMemoryStore;
use crate::agent::registry::TraderRegistry;
use crate::agent::runtime::AgentRuntime;
use crate::agent::session_gate::SessionGate;
use crate::audit::{DecisionAuditStore, DecisionLog};
use crate::betting::BettingLedger;
use crate::chat::{ChatResponder, ChatStore, NarrationGate, ProactiveScheduler};
use crate::clock::Clock;
use crate::config::Config;
use crate::market::adapter::MarketDataAdapter;
use crate::market::replay::ReplayEngine;
use crate::rooms::RoomEventBus;
use crate::tts::TtsDispatcher;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub clock: Arc<dyn Clock>,
    pub market: Arc<MarketDataAdapter>,
    pub replay: Option<Arc<ReplayEngine>>,
    pub memory: Arc<AgentMemoryStore>,
    pub registry: Arc<TraderRegistry>,
    pub llm: Arc<LlmDecider>,
    pub session_gate: Arc<SessionGate>,
    pub kill_switch: Arc<KillSwitch>,
    pub runtime: Arc<AgentRuntime>,
    pub decision_log: Arc<DecisionLog>,
    pub audit_store: Arc<DecisionAuditStore>,
    pub rooms: Arc<RoomEventBus>,
    pub chat: Arc<ChatStore>,
    pub chat_responder: Arc<ChatResponder>,
    pub proactive: Arc<ProactiveScheduler>,
    pub narration: Arc<NarrationGate>,
    pub betting: Arc<BettingLedger>,
    pub tts: Arc<TtsDispatcher>,
}
