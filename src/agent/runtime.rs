//! Agent Runtime (spec.md §4.6): the decision-cycle scheduler core.

use crate::agent::book::{apply_decision, BookInputs};
use crate::agent::context::{
    compute_features, readiness_level, select_symbol, synthetic_readiness_hold, PortfolioLimits,
    SymbolFeatures,
};
use crate::agent::kill_switch::KillSwitch;
use crate::agent::llm::{deterministic_fallback, LlmDecider};
use crate::agent::memory::AgentMemoryStore;
use crate::agent::registry::TraderRegistry;
use crate::agent::session_gate::SessionGate;
use crate::agent::types::*;
use crate::clock::Clock;
use crate::config::Config;
use crate::market::adapter::MarketDataAdapter;
use crate::market::Interval;
use crate::money::Money;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RuntimeMetrics {
    pub total_cycles: u64,
    pub successful_cycles: u64,
    pub failed_cycles: u64,
}

#[async_trait]
pub trait DecisionHook: Send + Sync {
    async fn on_decision(&self, trader_id: &str, decision: &Decision, audit: &DecisionAudit);
}

pub struct NoopHook;

#[async_trait]
impl DecisionHook for NoopHook {
    async fn on_decision(&self, _trader_id: &str, _decision: &Decision, _audit: &DecisionAudit) {}
}

struct RuntimeState {
    running: bool,
    manual_pause: bool,
    cycle_ms: u64,
    auto_paused_at_ms: Option<i64>,
    call_count: HashMap<String, u64>,
    metrics: RuntimeMetrics,
}

pub struct AgentRuntime {
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
    market: Arc<MarketDataAdapter>,
    memory: Arc<AgentMemoryStore>,
    registry: Arc<TraderRegistry>,
    llm: Arc<LlmDecider>,
    session_gate: Arc<SessionGate>,
    kill_switch: Arc<KillSwitch>,
    hook: Arc<dyn DecisionHook>,
    state: RwLock<RuntimeState>,
    in_flight: AtomicBool,
    cycle_counter: AtomicU64,
}

impl AgentRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        clock: Arc<dyn Clock>,
        market: Arc<MarketDataAdapter>,
        memory: Arc<AgentMemoryStore>,
        registry: Arc<TraderRegistry>,
        llm: Arc<LlmDecider>,
        session_gate: Arc<SessionGate>,
        kill_switch: Arc<KillSwitch>,
        hook: Arc<dyn DecisionHook>,
    ) -> Self {
        let cycle_ms = config.agent_runtime_cycle_ms;
        Self {
            config,
            clock,
            market,
            memory,
            registry,
            llm,
            session_gate,
            kill_switch,
            hook,
            state: RwLock::new(RuntimeState {
                running: false,
                manual_pause: false,
                cycle_ms,
                auto_paused_at_ms: None,
                call_count: HashMap::new(),
                metrics: RuntimeMetrics::default(),
            }),
            in_flight: AtomicBool::new(false),
            cycle_counter: AtomicU64::new(0),
        }
    }

    pub fn metrics(&self) -> RuntimeMetrics {
        self.state.read().metrics.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state.read().running
    }

    pub fn set_cycle_ms(&self, ms: u64) {
        self.state.write().cycle_ms = ms;
    }

    pub fn cycle_ms(&self) -> u64 {
        self.state.read().cycle_ms
    }

    /// Manual pause stops the loop; resume only succeeds if the session
    /// gate currently permits at least one eligible trader (spec.md §4.6).
    pub fn pause(&self) {
        let mut state = self.state.write();
        state.manual_pause = true;
        state.running = false;
    }

    pub fn resume(&self) -> Result<(), &'static str> {
        if self.kill_switch.is_active() {
            return Err("kill_switch_active");
        }
        let eligible = self.eligible_traders();
        if eligible.is_empty() {
            return Err("no_eligible_traders");
        }
        let mut state = self.state.write();
        state.manual_pause = false;
        state.running = true;
        state.auto_paused_at_ms = None;
        Ok(())
    }

    fn eligible_traders(&self) -> Vec<Trader> {
        self.registry
            .registered_traders()
            .into_iter()
            .filter(|t| t.status == TraderStatus::Running)
            .filter(|t| {
                let gate = self.session_gate.snapshot(t.exchange_id);
                gate.allow_run(self.config.session_guard_require_fresh_live_data)
            })
            .collect()
    }

    /// Called by the Session Gate ticker: push the filtered trader list;
    /// pause when it empties, resume when it refills (spec.md §4.6a).
    pub fn reconcile_session_gate(&self) {
        if self.kill_switch.is_active() {
            return;
        }
        let eligible = self.eligible_traders();
        let mut state = self.state.write();
        if eligible.is_empty() {
            if state.running {
                state.running = false;
                state.auto_paused_at_ms = Some(self.clock.now_ms());
            }
        } else if !state.manual_pause && !state.running {
            state.running = true;
            state.auto_paused_at_ms = None;
        }
    }

    /// One `StepOnce` iteration over every eligible trader, sequentially.
    /// A second concurrent call is dropped, not queued (spec.md §5).
    pub async fn step_once(&self) {
        if self.kill_switch.is_active() {
            return;
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let traders = self.eligible_traders();
        for trader in traders {
            if self.kill_switch.is_active() {
                break;
            }
            let outcome = self.run_one_cycle(&trader).await;
            let mut state = self.state.write();
            state.metrics.total_cycles += 1;
            if outcome {
                state.metrics.successful_cycles += 1;
            } else {
                state.metrics.failed_cycles += 1;
            }
        }

        self.in_flight.store(false, Ordering::SeqCst);
    }

    async fn run_one_cycle(&self, trader: &Trader) -> bool {
        let cycle_number = {
            let mut state = self.state.write();
            let count = state.call_count.entry(trader.trader_id.clone()).or_insert(0);
            *count += 1;
            *count
        };

        let pool = if trader.stock_pool.is_empty() {
            vec!["AAPL".to_string()]
        } else {
            trader.stock_pool.clone()
        };
        let limited: Vec<String> = pool
            .into_iter()
            .take(self.config.candidate_symbol_limit)
            .collect();

        let now_ms = self.clock.now_ms();
        let (account, holdings) = self.memory.account_and_holdings(&trader.trader_id);

        let mut candidates = Vec::new();
        for symbol in &limited {
            if self.config.strict_live_mode && !self.market.is_symbol_available(symbol) {
                continue;
            }
            let intraday = self
                .market
                .get_frames(symbol, Interval::OneMinute, 180)
                .await
                .map(|b| b.frames)
                .unwrap_or_default();
            let daily = self
                .market
                .get_frames(symbol, Interval::OneDay, 180)
                .await
                .map(|b| b.frames)
                .unwrap_or_default();
            let position_shares = holdings.get(symbol).map(|h| h.shares).unwrap_or(0);
            candidates.push(compute_features(symbol, &intraday, &daily, position_shares, now_ms));
        }

        if candidates.is_empty() {
            return false;
        }

        let session = self.session_gate.snapshot(trader.exchange_id);
        let is_opening_phase = matches!(
            session.phase,
            crate::agent::session_gate::SessionPhase::PreOpen
        );

        let selected = select_symbol(
            &trader.trader_id,
            cycle_number,
            &limited,
            &candidates,
            trader.trading_style,
            self.config.strict_symbol_loop,
        );
        let Some(selected_symbol) = selected else {
            return false;
        };
        let features: &SymbolFeatures = candidates
            .iter()
            .find(|f| f.symbol == selected_symbol)
            .unwrap();

        let readiness = readiness_level(&self.config, features, is_opening_phase);

        let (action, symbol, quantity, confidence, reasoning, llm_meta, source) =
            if readiness == ReadinessLevel::Error {
                let (source, confidence, reasoning) =
                    synthetic_readiness_hold(&format!(
                        "insufficient frames for {selected_symbol}"
                    ));
                (
                    Action::Hold,
                    selected_symbol.to_string(),
                    0u64,
                    confidence,
                    reasoning,
                    None,
                    source.to_string(),
                )
            } else if self.llm.is_enabled() {
                match self.llm.decide(selected_symbol, features).await {
                    Ok(d) => (
                        d.action,
                        d.symbol,
                        d.quantity,
                        d.confidence,
                        d.reasoning,
                        Some(d.meta),
                        "llm".to_string(),
                    ),
                    Err(_) => {
                        let fb = deterministic_fallback(selected_symbol, features);
                        (
                            fb.action,
                            fb.symbol,
                            fb.quantity,
                            fb.confidence,
                            fb.reasoning,
                            None,
                            "fallback".to_string(),
                        )
                    }
                }
            } else {
                let fb = deterministic_fallback(selected_symbol, features);
                (
                    fb.action,
                    fb.symbol,
                    fb.quantity,
                    fb.confidence,
                    fb.reasoning,
                    None,
                    "fallback".to_string(),
                )
            };

        let mark_price = features.sma_20.max(0.01);

        // Portfolio guardrails (spec.md §4.4 limits): a BUY/SHORT that would
        // breach position count, concentration, cash reserve, or turnover
        // caps is downgraded to HOLD before it ever reaches the book.
        let mut guardrail_note = None;
        let (action, quantity) = if matches!(action, Action::Buy | Action::Short) {
            let limits = PortfolioLimits::from_config(&self.config);
            let holdings_value: Money = holdings.values().map(|h| h.value()).sum();
            let total_equity = account.total_equity(holdings_value).as_f64();
            let already_held = holdings.get(&symbol).map(|h| h.shares > 0).unwrap_or(false);
            let position_count = holdings.values().filter(|h| h.shares > 0).count();
            let projected_notional = Money::from_major(quantity as f64 * mark_price);
            let projected_symbol_value =
                holdings.get(&symbol).map(|h| h.value()).unwrap_or(Money::ZERO) + projected_notional;
            let projected_cash = (account.available_balance - projected_notional).as_f64();

            let breach = if total_equity <= 0.0 {
                None
            } else if !already_held && position_count >= limits.max_position_count {
                Some("portfolio_limit_max_positions")
            } else if projected_symbol_value.as_f64() / total_equity > limits.max_symbol_concentration_pct {
                Some("portfolio_limit_concentration")
            } else if projected_cash / total_equity < limits.min_cash_reserve_pct {
                Some("portfolio_limit_cash_reserve")
            } else if projected_notional.as_f64() / total_equity > limits.turnover_throttle_pct {
                Some("portfolio_limit_turnover")
            } else {
                None
            };

            if let Some(reason) = breach {
                guardrail_note = Some(reason);
                (Action::Hold, 0)
            } else {
                (action, quantity)
            }
        } else {
            (action, quantity)
        };

        let decision = Decision {
            timestamp: self.clock.now(),
            cycle_number,
            trader_id: trader.trader_id.clone(),
            symbol: symbol.clone(),
            action,
            quantity,
            confidence,
            reasoning,
            decision_source: source,
            executed: false,
            llm_meta,
            decisions: vec![DecisionLeg {
                symbol: symbol.clone(),
                action,
                quantity,
            }],
            execution_log: guardrail_note.map(|r| vec![r.to_string()]).unwrap_or_default(),
        };

        let result = apply_decision(BookInputs {
            account,
            holdings,
            decision: &decision,
            mark_price,
            commission_rate: self.config.commission_rate,
            exchange: trader.exchange_id,
            lot_size: if trader.exchange_id.is_t_plus_one() { 100 } else { 1 },
            now: self.clock.now(),
        });

        let mut final_decision = decision.clone();
        final_decision.executed = result.executed;
        if let Some(reason) = result.blocked_reason {
            final_decision.execution_log.push(reason.to_string());
        }

        self.memory.record_snapshot(
            &trader.trader_id,
            &final_decision,
            result.holdings.clone(),
            result.account.clone(),
            result.trade_event.clone(),
            result.closed_trades.clone(),
            self.clock.now(),
        );
        let _ = self.memory.persist(&trader.trader_id).await;

        let audit = DecisionAudit {
            trader_id: trader.trader_id.clone(),
            timestamp: final_decision.timestamp,
            cycle_number,
            readiness,
            session_open: session.session_is_open,
            live_fresh_ok: session.live_fresh_ok,
            forced_hold: readiness == ReadinessLevel::Error,
            order_executed: result.executed,
            position_shares_on_symbol: result
                .holdings
                .get(&symbol)
                .map(|h| h.shares)
                .unwrap_or(0),
            hold_semantics: if final_decision.action == Action::Hold {
                Some(if result.holdings.get(&symbol).map(|h| h.shares).unwrap_or(0) > 0 {
                    HoldSemantics::KeepExistingPosition
                } else {
                    HoldSemantics::NoPositionNoOrder
                })
            } else {
                None
            },
        };

        self.hook.on_decision(&trader.trader_id, &final_decision, &audit).await;
        self.cycle_counter.fetch_add(1, Ordering::Relaxed);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::market::adapter::Backing;

    fn make_runtime(dir: &std::path::Path) -> Arc<AgentRuntime> {
        let config = Arc::new(Config::from_env());
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(0));
        let adapter = Arc::new(MarketDataAdapter::new(
            Backing::Replay {
                engine: Arc::new(crate::market::replay::ReplayEngine::new(
                    Default::default(),
                    1,
                    tokio::sync::mpsc::channel(1).0,
                )),
            },
            &config,
        ));
        let memory = Arc::new(AgentMemoryStore::new(dir.join("memory")));
        let registry = Arc::new(TraderRegistry::new(dir));
        let llm = Arc::new(LlmDecider::new(reqwest::Client::new(), &config));
        let gate = Arc::new(SessionGate::new());
        let kill_switch = Arc::new(KillSwitch::new(dir));
        Arc::new(AgentRuntime::new(
            config,
            clock,
            adapter,
            memory,
            registry,
            llm,
            gate,
            kill_switch,
            Arc::new(NoopHook),
        ))
    }

    #[tokio::test]
    async fn step_once_is_noop_with_no_eligible_traders() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = make_runtime(dir.path());
        runtime.step_once().await;
        assert_eq!(runtime.metrics().total_cycles, 0);
    }

    #[tokio::test]
    async fn kill_switch_blocks_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = make_runtime(dir.path());
        runtime.kill_switch.activate("t".into(), "a".into(), chrono::Utc::now()).await.unwrap();
        runtime.step_once().await;
        assert_eq!(runtime.metrics().total_cycles, 0);
    }

    #[tokio::test]
    async fn resume_fails_while_kill_switch_active() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = make_runtime(dir.path());
        runtime.kill_switch.activate("t".into(), "a".into(), chrono::Utc::now()).await.unwrap();
        assert_eq!(runtime.resume(), Err("kill_switch_active"));
    }
}
