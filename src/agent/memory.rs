//! Agent Memory Store (spec.md §4.3): per-trader account, holdings, trade
//! history, equity curve, with atomic tmp+rename persistence.

use crate::agent::types::*;
use crate::money::Money;
use crate::persist;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

const RECENT_ACTIONS_CAP: usize = 64;
const DECISION_RING_CAP: usize = 120;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquityPoint {
    pub ts: chrono::DateTime<chrono::Utc>,
    pub total_equity: Money,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyJournalEntry {
    pub day: chrono::NaiveDate,
    pub closing_equity: Money,
    pub realized_pnl: Money,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TraderSnapshot {
    pub account: Option<Account>,
    pub holdings: HashMap<String, Holding>,
    #[serde(default)]
    pub recent_actions: VecDeque<Decision>,
    #[serde(default)]
    pub decision_ring: VecDeque<Decision>,
    #[serde(default)]
    pub trade_events: Vec<TradeEvent>,
    #[serde(default)]
    pub closed_trades: Vec<ClosedTrade>,
    #[serde(default)]
    pub equity_curve: Vec<EquityPoint>,
    #[serde(default)]
    pub daily_journal: Vec<DailyJournalEntry>,
    pub current_day: Option<chrono::NaiveDate>,
}

impl TraderSnapshot {
    fn ensure_account(&mut self) -> &mut Account {
        self.account.get_or_insert_with(Account::new_default)
    }

    pub fn holdings_value(&self) -> Money {
        self.holdings.values().map(|h| h.value()).sum()
    }
}

pub struct ResetScopes {
    pub reset_memory: bool,
    pub reset_positions: bool,
    pub reset_stats: bool,
}

/// Per-trader snapshot store. Every `record_snapshot` call for the same
/// trader is serialized by that trader's lock (spec.md §5 "Memory
/// snapshots are per trader").
pub struct AgentMemoryStore {
    base_dir: PathBuf,
    snapshots: RwLock<HashMap<String, Arc<RwLock<TraderSnapshot>>>>,
}

impl AgentMemoryStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    fn path_for(&self, trader_id: &str) -> PathBuf {
        self.base_dir.join(format!("{trader_id}.json"))
    }

    fn slot(&self, trader_id: &str) -> Arc<RwLock<TraderSnapshot>> {
        if let Some(existing) = self.snapshots.read().get(trader_id) {
            return existing.clone();
        }
        self.snapshots
            .write()
            .entry(trader_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(TraderSnapshot::default())))
            .clone()
    }

    pub async fn load(&self, trader_id: &str) {
        let path = self.path_for(trader_id);
        let loaded: Option<TraderSnapshot> = persist::load_json(&path).await;
        let slot = self.slot(trader_id);
        if let Some(snapshot) = loaded {
            *slot.write() = snapshot;
        }
    }

    pub fn snapshot(&self, trader_id: &str) -> TraderSnapshot {
        self.slot(trader_id).read().clone()
    }

    pub fn account_and_holdings(&self, trader_id: &str) -> (Account, HashMap<String, Holding>) {
        let slot = self.slot(trader_id);
        let mut guard = slot.write();
        let account = guard.ensure_account().clone();
        (account, guard.holdings.clone())
    }

    pub async fn persist(&self, trader_id: &str) -> anyhow::Result<()> {
        let snapshot = self.slot(trader_id).read().clone();
        persist::save_json(&self.path_for(trader_id), &snapshot).await
    }

    /// Apply a decision outcome: append to recent-actions ring, update
    /// holdings, append trade/closed-trade events and an equity-curve
    /// point, finalize the daily journal on a day roll.
    pub fn record_snapshot(
        &self,
        trader_id: &str,
        decision: &Decision,
        holdings: HashMap<String, Holding>,
        account: Account,
        trade_event: Option<TradeEvent>,
        closed_trades: Vec<ClosedTrade>,
        now: chrono::DateTime<chrono::Utc>,
    ) {
        let slot = self.slot(trader_id);
        let mut snapshot = slot.write();

        snapshot.recent_actions.push_back(decision.clone());
        while snapshot.recent_actions.len() > RECENT_ACTIONS_CAP {
            snapshot.recent_actions.pop_front();
        }
        snapshot.decision_ring.push_back(decision.clone());
        while snapshot.decision_ring.len() > DECISION_RING_CAP {
            snapshot.decision_ring.pop_front();
        }

        snapshot.holdings = holdings;
        snapshot.account = Some(account.clone());

        if let Some(event) = trade_event {
            snapshot.trade_events.push(event);
        }
        snapshot.closed_trades.extend(closed_trades);

        let holdings_value = snapshot.holdings_value();
        snapshot.equity_curve.push(EquityPoint {
            ts: now,
            total_equity: account.total_equity(holdings_value),
        });

        let today = now.date_naive();
        let rolled = snapshot.current_day.map(|d| d != today).unwrap_or(true);
        if rolled {
            if let Some(prev_day) = snapshot.current_day {
                let realized: Money = snapshot
                    .closed_trades
                    .iter()
                    .filter(|t| t.exit_time.date_naive() == prev_day)
                    .map(|t| t.realized_pnl)
                    .sum();
                snapshot.daily_journal.push(DailyJournalEntry {
                    day: prev_day,
                    closing_equity: account.total_equity(holdings_value),
                    realized_pnl: realized,
                });
            }
            snapshot.current_day = Some(today);
        }
    }

    pub fn reset(&self, trader_id: &str, scopes: ResetScopes) {
        let slot = self.slot(trader_id);
        let mut snapshot = slot.write();
        if scopes.reset_positions {
            snapshot.holdings.clear();
        }
        if scopes.reset_stats {
            if let Some(account) = snapshot.account.as_mut() {
                *account = Account::new_default();
            }
        }
        if scopes.reset_memory {
            *snapshot = TraderSnapshot {
                account: Some(Account::new_default()),
                ..TraderSnapshot::default()
            };
        }
    }

    pub fn daily_pnl(&self, trader_id: &str) -> f64 {
        let slot = self.slot(trader_id);
        let snapshot = slot.read();
        let Some(account) = &snapshot.account else {
            return 0.0;
        };
        let holdings_value = snapshot.holdings_value();
        account.total_pnl_pct(holdings_value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_decision() -> Decision {
        Decision {
            timestamp: chrono::Utc::now(),
            cycle_number: 1,
            trader_id: "t1".into(),
            symbol: "AAPL".into(),
            action: Action::Hold,
            quantity: 0,
            confidence: 0.5,
            reasoning: "test".into(),
            decision_source: "test".into(),
            executed: false,
            llm_meta: None,
            decisions: vec![],
            execution_log: vec![],
        }
    }

    #[tokio::test]
    async fn persist_then_load_roundtrips_equity_curve() {
        let dir = tempfile::tempdir().unwrap();
        let store = AgentMemoryStore::new(dir.path());
        store.load("t1").await;

        let (account, holdings) = store.account_and_holdings("t1");
        store.record_snapshot(
            "t1",
            &sample_decision(),
            holdings,
            account,
            None,
            vec![],
            chrono::Utc::now(),
        );
        store.persist("t1").await.unwrap();

        let store2 = AgentMemoryStore::new(dir.path());
        store2.load("t1").await;
        let snap = store2.snapshot("t1");
        assert_eq!(snap.equity_curve.len(), 1);
        assert_eq!(snap.recent_actions.len(), 1);
    }

    #[test]
    fn recent_actions_ring_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let store = AgentMemoryStore::new(dir.path());
        for i in 0..100 {
            let (account, holdings) = store.account_and_holdings("t1");
            let mut d = sample_decision();
            d.cycle_number = i;
            store.record_snapshot("t1", &d, holdings, account, None, vec![], chrono::Utc::now());
        }
        let snap = store.snapshot("t1");
        assert_eq!(snap.recent_actions.len(), RECENT_ACTIONS_CAP);
        assert_eq!(snap.decision_ring.len(), DECISION_RING_CAP.min(100));
    }

    #[test]
    fn reset_positions_keeps_account() {
        let dir = tempfile::tempdir().unwrap();
        let store = AgentMemoryStore::new(dir.path());
        let (account, mut holdings) = store.account_and_holdings("t1");
        holdings.insert("AAPL".into(), Holding::default());
        let d = sample_decision();
        store.record_snapshot("t1", &d, holdings, account, None, vec![], chrono::Utc::now());

        store.reset(
            "t1",
            ResetScopes {
                reset_memory: false,
                reset_positions: true,
                reset_stats: false,
            },
        );
        let snap = store.snapshot("t1");
        assert!(snap.holdings.is_empty());
        assert!(snap.account.is_some());
    }
}
