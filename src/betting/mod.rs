//! Viewer Betting Ledger (spec.md §4.10): daily pools, odds, freeze,
//! settlement, credits, atomic persistence.

use crate::persist;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BetError {
    #[error("invalid_cursor_index")]
    InvalidStake,
    #[error("betting_closed_before_market_close_30m")]
    BettingClosed,
    #[error("trader_not_available_for_bet")]
    TraderUnavailable,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Pool {
    pub amount: i64,
    pub tickets: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserBet {
    pub trader_id: String,
    pub stake_amount: i64,
    pub placed_ts_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    Pending,
    Settled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionPayout {
    pub trader_id: String,
    pub stake_amount: i64,
    pub credit_points: i64,
    pub won: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settlement {
    pub winning_trader_ids: Vec<String>,
    pub payouts: HashMap<String, SessionPayout>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DayState {
    pub pools: HashMap<String, Pool>,
    pub user_bets: HashMap<String, UserBet>,
    pub freeze_returns_by_trader: Option<HashMap<String, f64>>,
    pub freeze_ts_ms: Option<i64>,
    pub settlement_status: Option<SettlementStatus>,
    pub settlement: Option<Settlement>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CreditRecord {
    pub user_nickname: Option<String>,
    pub credit_points: i64,
    pub settled_bets: u32,
    pub win_count: u32,
    pub last_award_ts_ms: Option<i64>,
    pub updated_ts_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Ledger {
    pub schema_version: String,
    pub days: HashMap<String, DayState>,
    pub credits_by_session: HashMap<String, CreditRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OddsEntry {
    pub trader_id: String,
    pub daily_return_pct: f64,
    pub odds: f64,
    pub pool_amount: i64,
    pub pool_tickets: u32,
}

const MIN_STAKE: i64 = 1;
const MAX_STAKE: i64 = 100_000;

pub fn state_id(market: &str, day: chrono::NaiveDate) -> String {
    format!("{market}::{day}")
}

/// `perf_score = exp(clamp(ret_pct, -20, 20)/8)`, crowd-weighted, normalized,
/// clamped to `[1.05, 30]` (spec.md §4.10).
pub fn compute_odds(
    returns_by_trader: &HashMap<String, f64>,
    pools: &HashMap<String, Pool>,
    house_edge: f64,
) -> Vec<OddsEntry> {
    let total_stake: i64 = pools.values().map(|p| p.amount).sum();
    let mut weighted: HashMap<String, f64> = HashMap::new();
    for (trader_id, ret_pct) in returns_by_trader {
        let perf_score = (ret_pct.clamp(-20.0, 20.0) / 8.0).exp();
        let pool_amount = pools.get(trader_id).map(|p| p.amount).unwrap_or(0);
        let crowd_share = if total_stake > 0 {
            pool_amount as f64 / total_stake as f64
        } else {
            0.0
        };
        weighted.insert(trader_id.clone(), perf_score * (1.0 + 0.75 * crowd_share));
    }
    let weighted_total: f64 = weighted.values().sum();

    let mut entries: Vec<OddsEntry> = returns_by_trader
        .iter()
        .map(|(trader_id, ret_pct)| {
            let w = weighted.get(trader_id).copied().unwrap_or(0.0);
            let implied_prob = if weighted_total > 0.0 {
                w / weighted_total
            } else {
                0.0
            };
            let odds = ((1.0 - house_edge) / implied_prob.max(0.02)).clamp(1.05, 30.0);
            let pool = pools.get(trader_id).cloned().unwrap_or_default();
            OddsEntry {
                trader_id: trader_id.clone(),
                daily_return_pct: *ret_pct,
                odds,
                pool_amount: pool.amount,
                pool_tickets: pool.tickets,
            }
        })
        .collect();

    entries.sort_by(|a, b| {
        b.daily_return_pct
            .partial_cmp(&a.daily_return_pct)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.odds.partial_cmp(&a.odds).unwrap_or(std::cmp::Ordering::Equal))
    });
    entries
}

pub struct BettingLedger {
    path: PathBuf,
    house_edge: f64,
    ledger: Mutex<Ledger>,
}

impl BettingLedger {
    pub fn new(data_dir: impl Into<PathBuf>, house_edge: f64) -> Self {
        Self {
            path: data_dir.into().join("bets").join("ledger.json"),
            house_edge,
            ledger: Mutex::new(Ledger {
                schema_version: "bets.ledger.v2".to_string(),
                ..Default::default()
            }),
        }
    }

    pub async fn load(&self) {
        if let Some(loaded) = persist::load_json::<Ledger>(&self.path).await {
            *self.ledger.lock() = loaded;
        }
    }

    async fn persist(&self) -> anyhow::Result<()> {
        let snapshot = self.ledger.lock().clone();
        persist::save_json(&self.path, &snapshot).await
    }

    /// Place (or switch) a bet. All mutation happens under the ledger lock
    /// before a single persist call, so concurrent placements stay
    /// consistent (spec.md §5 "Ledger mutations ... are serialized").
    pub async fn place_bet(
        &self,
        market: &str,
        day: chrono::NaiveDate,
        session_id: &str,
        trader_id: &str,
        stake_amount: i64,
        available_traders: &[String],
        now_ms: i64,
        cutoff_reached: bool,
    ) -> Result<(), BetError> {
        if !(MIN_STAKE..=MAX_STAKE).contains(&stake_amount) {
            return Err(BetError::InvalidStake);
        }
        if cutoff_reached {
            return Err(BetError::BettingClosed);
        }
        if !available_traders.iter().any(|t| t == trader_id) {
            return Err(BetError::TraderUnavailable);
        }

        {
            let mut ledger = self.ledger.lock();
            let state = ledger.days.entry(state_id(market, day)).or_default();

            if let Some(prior) = state.user_bets.get(session_id).cloned() {
                if let Some(pool) = state.pools.get_mut(&prior.trader_id) {
                    pool.amount -= prior.stake_amount;
                    pool.tickets = pool.tickets.saturating_sub(1);
                }
            }
            let pool = state.pools.entry(trader_id.to_string()).or_default();
            pool.amount += stake_amount;
            pool.tickets += 1;

            state.user_bets.insert(
                session_id.to_string(),
                UserBet {
                    trader_id: trader_id.to_string(),
                    stake_amount,
                    placed_ts_ms: now_ms,
                },
            );
        }
        self.persist().await.map_err(|_| BetError::TraderUnavailable)
    }

    /// Snapshot current returns into `freeze_returns_by_trader` once wall
    /// clock crosses `close_minute - 30` (spec.md §4.10 cutoff).
    pub async fn freeze(
        &self,
        market: &str,
        day: chrono::NaiveDate,
        returns_by_trader: &HashMap<String, f64>,
        now_ms: i64,
    ) {
        {
            let mut ledger = self.ledger.lock();
            let state = ledger.days.entry(state_id(market, day)).or_default();
            if state.freeze_ts_ms.is_none() {
                state.freeze_returns_by_trader = Some(returns_by_trader.clone());
                state.freeze_ts_ms = Some(now_ms);
            }
        }
        let _ = self.persist().await;
    }

    pub fn odds(
        &self,
        market: &str,
        day: chrono::NaiveDate,
        live_returns: &HashMap<String, f64>,
    ) -> (Vec<OddsEntry>, bool, Option<i64>) {
        let ledger = self.ledger.lock();
        let state_id = state_id(market, day);
        let state = ledger.days.get(&state_id);
        let frozen = state.and_then(|s| s.freeze_returns_by_trader.clone());
        let odds_update_active = frozen.is_none();
        let returns = frozen.as_ref().unwrap_or(live_returns);
        let pools = state.map(|s| s.pools.clone()).unwrap_or_default();
        (
            compute_odds(returns, &pools, self.house_edge),
            odds_update_active,
            state.and_then(|s| s.freeze_ts_ms),
        )
    }

    /// Settle on close: winners are max `daily_return_pct` in the live
    /// (not frozen) entries; idempotent once `settled` (spec.md §4.10).
    pub async fn settle(
        &self,
        market: &str,
        day: chrono::NaiveDate,
        live_returns: &HashMap<String, f64>,
        now_ms: i64,
    ) -> Option<Settlement> {
        let already_settled;
        let settlement;
        {
            let mut ledger = self.ledger.lock();
            let state = ledger.days.entry(state_id(market, day)).or_default();
            already_settled = state.settlement_status == Some(SettlementStatus::Settled);
            if already_settled {
                settlement = state.settlement.clone();
            } else {
                let (_, odds_entries) = {
                    let odds_entries = compute_odds(live_returns, &state.pools, self.house_edge);
                    ((), odds_entries)
                };
                let odds_by_trader: HashMap<String, f64> = odds_entries
                    .iter()
                    .map(|e| (e.trader_id.clone(), e.odds))
                    .collect();

                let max_return = live_returns
                    .values()
                    .cloned()
                    .fold(f64::MIN, f64::max);
                let winners: Vec<String> = live_returns
                    .iter()
                    .filter(|(_, r)| (**r - max_return).abs() < 1e-9)
                    .map(|(t, _)| t.clone())
                    .collect();

                let mut payouts = HashMap::new();
                for (session_id, bet) in &state.user_bets {
                    let won = winners.contains(&bet.trader_id);
                    let credit_points = if won {
                        let odds = odds_by_trader.get(&bet.trader_id).copied().unwrap_or(1.05);
                        (bet.stake_amount as f64 * odds).round().max(1.0) as i64
                    } else {
                        0
                    };
                    payouts.insert(
                        session_id.clone(),
                        SessionPayout {
                            trader_id: bet.trader_id.clone(),
                            stake_amount: bet.stake_amount,
                            credit_points,
                            won,
                        },
                    );
                }

                let built = Settlement {
                    winning_trader_ids: winners,
                    payouts: payouts.clone(),
                };
                state.settlement = Some(built.clone());
                state.settlement_status = Some(SettlementStatus::Settled);

                for (session_id, payout) in &payouts {
                    let credit = ledger.credits_by_session.entry(session_id.clone()).or_default();
                    credit.settled_bets += 1;
                    if payout.won {
                        credit.win_count += 1;
                        credit.credit_points += payout.credit_points;
                        credit.last_award_ts_ms = Some(now_ms);
                    }
                    credit.updated_ts_ms = now_ms;
                }
                settlement = Some(built);
            }
        }
        if !already_settled {
            let _ = self.persist().await;
        }
        settlement
    }

    pub fn credit_record(&self, session_id: &str) -> CreditRecord {
        self.ledger
            .lock()
            .credits_by_session
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn user_bet(
        &self,
        market: &str,
        day: chrono::NaiveDate,
        session_id: &str,
    ) -> Option<UserBet> {
        self.ledger
            .lock()
            .days
            .get(&state_id(market, day))
            .and_then(|s| s.user_bets.get(session_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> chrono::NaiveDate {
        chrono::NaiveDate::from_ymd_opt(2026, 7, 31).unwrap()
    }

    #[tokio::test]
    async fn place_then_switch_transfers_pool_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = BettingLedger::new(dir.path(), 0.08);
        let traders = vec!["t_001".to_string(), "t_002".to_string()];

        ledger
            .place_bet("US", today(), "s1", "t_001", 100, &traders, 1_000, false)
            .await
            .unwrap();
        ledger
            .place_bet("US", today(), "s1", "t_002", 50, &traders, 2_000, false)
            .await
            .unwrap();

        let state = ledger.ledger.lock().days.get(&state_id("US", today())).cloned().unwrap();
        assert_eq!(state.pools["t_001"].amount, 0);
        assert_eq!(state.pools["t_002"].amount, 50);
        assert_eq!(state.pools["t_002"].tickets, 1);
    }

    #[test]
    fn odds_rank_by_descending_return() {
        let mut returns = HashMap::new();
        returns.insert("a".to_string(), 5.0);
        returns.insert("b".to_string(), 10.0);
        let pools = HashMap::new();
        let entries = compute_odds(&returns, &pools, 0.08);
        assert_eq!(entries[0].trader_id, "b");
    }

    #[tokio::test]
    async fn settlement_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = BettingLedger::new(dir.path(), 0.08);
        let traders = vec!["t_001".to_string()];
        ledger
            .place_bet("US", today(), "s1", "t_001", 100, &traders, 0, false)
            .await
            .unwrap();
        let mut returns = HashMap::new();
        returns.insert("t_001".to_string(), 3.0);

        let first = ledger.settle("US", today(), &returns, 1).await.unwrap();
        let second = ledger.settle("US", today(), &returns, 2).await.unwrap();
        assert_eq!(
            first.payouts["s1"].credit_points,
            second.payouts["s1"].credit_points
        );
        assert_eq!(ledger.credit_record("s1").win_count, 1);
    }

    #[tokio::test]
    async fn rejects_stake_out_of_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = BettingLedger::new(dir.path(), 0.08);
        let traders = vec!["t_001".to_string()];
        let err = ledger
            .place_bet("US", today(), "s1", "t_001", 0, &traders, 0, false)
            .await
            .unwrap_err();
        assert!(matches!(err, BetError::InvalidStake));
    }
}
