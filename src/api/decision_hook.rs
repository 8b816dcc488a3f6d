//! Bridges `AgentRuntime` decisions into the room event bus and narration
//! chat feed (spec.md §4.9 "post-decision narration", §5).

use crate::agent::registry::TraderRegistry;
use crate::agent::runtime::DecisionHook;
use crate::agent::types::{Decision, DecisionAudit, RiskProfile};
use crate::chat::{NarrationGate, SenderKind, Visibility};
use crate::chat::ChatStore;
use crate::clock::Clock;
use crate::rooms::RoomEventBus;
use async_trait::async_trait;
use std::sync::Arc;

pub struct RuntimeDecisionHook {
    pub rooms: Arc<RoomEventBus>,
    pub chat: Arc<ChatStore>,
    pub narration: Arc<NarrationGate>,
    pub registry: Arc<TraderRegistry>,
    pub clock: Arc<dyn Clock>,
}

#[async_trait]
impl DecisionHook for RuntimeDecisionHook {
    async fn on_decision(&self, trader_id: &str, decision: &Decision, _audit: &DecisionAudit) {
        let now_ms = self.clock.now_ms();
        self.rooms.emit_decision(
            trader_id,
            serde_json::to_value(decision).unwrap_or(serde_json::Value::Null),
            now_ms,
        );

        let risk_profile = self
            .registry
            .registered_traders()
            .into_iter()
            .find(|t| t.trader_id == trader_id)
            .map(|t| t.risk_profile)
            .unwrap_or(RiskProfile::Balanced);

        let Some(text) = self.narration.narrate(trader_id, decision, risk_profile, now_ms) else {
            return;
        };

        if let Ok(message) = self
            .chat
            .post(
                trader_id,
                "system",
                None,
                Visibility::Public,
                SenderKind::System,
                text,
                now_ms,
            )
            .await
        {
            self.rooms.emit_chat(
                trader_id,
                serde_json::to_value(&message).unwrap_or(serde_json::Value::Null),
                now_ms,
            );
        }
    }
}
