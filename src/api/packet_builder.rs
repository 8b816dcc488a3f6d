//! Composes the `stream_packet` payload (spec.md §4.8 "the build itself
//! composes"): trader identity, room context, account, positions, recent
//! decisions, chat preview, decision-audit preview, and provider status.

use crate::agent::memory::AgentMemoryStore;
use crate::agent::registry::TraderRegistry;
use crate::agent::session_gate::SessionGate;
use crate::agent::types::Exchange;
use crate::audit::{DecisionAuditStore, DecisionLog};
use crate::betting::BettingLedger;
use crate::chat::ChatStore;
use crate::clock::Clock;
use crate::market::adapter::MarketDataAdapter;
use crate::rooms::PacketBuilder;
use async_trait::async_trait;
use std::sync::Arc;

pub struct RoomPacketBuilder {
    pub registry: Arc<TraderRegistry>,
    pub memory: Arc<AgentMemoryStore>,
    pub decision_log: Arc<DecisionLog>,
    pub audit_store: Arc<DecisionAuditStore>,
    pub chat: Arc<ChatStore>,
    pub betting: Arc<BettingLedger>,
    pub session_gate: Arc<SessionGate>,
    pub market: Arc<MarketDataAdapter>,
    pub clock: Arc<dyn Clock>,
}

const CASUAL_TOPICS: &[&str] = &["仓位管理", "盘面节奏", "今日波动", "风控纪律"];

#[async_trait]
impl PacketBuilder for RoomPacketBuilder {
    async fn build(&self, room_id: &str, decision_limit: u64) -> serde_json::Value {
        let now_ms = self.clock.now_ms();
        let trader = self
            .registry
            .registered_traders()
            .into_iter()
            .find(|t| t.trader_id == room_id);

        let Some(trader) = trader else {
            return serde_json::json!({
                "room_id": room_id,
                "error": "trader_not_found",
                "generated_ts_ms": now_ms,
            });
        };

        let snapshot = self.memory.snapshot(&trader.trader_id);
        let holdings_value = snapshot.holdings_value();
        let account = snapshot.account.clone().unwrap_or_else(crate::agent::types::Account::new_default);

        let decisions_latest: Vec<_> = self
            .decision_log
            .list_latest(&trader.trader_id, decision_limit as usize);
        let decision_latest = decisions_latest.first().cloned();

        let audit_preview = self.audit_store.list_latest(&trader.trader_id, 5);
        let decision_audit_preview = match (&decision_latest, audit_preview.first()) {
            (Some(decision), Some(audit))
                if audit.cycle_number == decision.cycle_number
                    || audit.timestamp == decision.timestamp =>
            {
                Some(audit.clone())
            }
            _ => None,
        };

        let public_chat_preview = self.chat.public_preview(room_id, 30);
        let session = self.session_gate.snapshot(trader.exchange_id);
        let live_fresh = self
            .market
            .live_file_provider(trader.exchange_id)
            .map(|p| !p.is_erroring_or_stale());

        let today = self.clock.now().date_naive();
        let market_key = trader.exchange_id.market_key();
        let returns: std::collections::HashMap<String, f64> = self
            .registry
            .registered_traders()
            .into_iter()
            .filter(|t| t.exchange_id.market_key() == market_key)
            .map(|t| {
                let pnl = self.memory.daily_pnl(&t.trader_id);
                (t.trader_id, pnl)
            })
            .collect();
        let (odds, odds_active, freeze_ts_ms) = self.betting.odds(market_key, today, &returns);

        let breadth = if matches!(trader.exchange_id, Exchange::CnA) {
            "cn_a_breadth_unavailable"
        } else {
            "us_breadth_unavailable"
        };

        serde_json::json!({
            "room_id": room_id,
            "generated_ts_ms": now_ms,
            "trader": trader,
            "account": account,
            "positions": snapshot.holdings,
            "holdings_value": holdings_value.as_f64(),
            "total_equity": account.total_equity(holdings_value).as_f64(),
            "decisions_latest": decisions_latest,
            "decision_latest": decision_latest,
            "decision_audit_preview": decision_audit_preview,
            "public_chat_preview": public_chat_preview,
            "room_context": {
                "market_overview_brief": format!("{market_key} session {:?}", session.phase),
                "news_digest_titles": Vec::<String>::new(),
                "news_categories": Vec::<String>::new(),
                "casual_topics": CASUAL_TOPICS,
                "news_burst_signal": serde_json::Value::Null,
                "breadth": breadth,
                "symbol_brief": trader.stock_pool.first().cloned(),
                "data_readiness": session.live_fresh_ok,
                "time_context": {
                    "session_is_open": session.session_is_open,
                    "phase": format!("{:?}", session.phase),
                },
            },
            "provider_status": {
                "live_fresh_ok": live_fresh,
                "llm_enabled": serde_json::Value::Null,
            },
            "betting": {
                "odds": odds,
                "odds_update_active": odds_active,
                "freeze_ts_ms": freeze_ts_ms,
            },
        })
    }
}
