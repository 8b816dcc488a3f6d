//! Core data model for traders, accounts, holdings, and decisions
//! (spec.md §3).

use crate::money::Money;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingStyle {
    Momentum,
    MeanReversion,
    EventDriven,
    MacroSwing,
    Balanced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskProfile {
    Conservative,
    Balanced,
    Aggressive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraderStatus {
    Stopped,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Exchange {
    CnA,
    Us,
}

impl Exchange {
    pub fn is_t_plus_one(self) -> bool {
        matches!(self, Exchange::CnA)
    }

    pub fn tz(self) -> chrono_tz::Tz {
        match self {
            Exchange::CnA => chrono_tz::Asia::Shanghai,
            Exchange::Us => chrono_tz::America::New_York,
        }
    }

    pub fn market_key(self) -> &'static str {
        match self {
            Exchange::CnA => "CN-A",
            Exchange::Us => "US",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trader {
    pub trader_id: String,
    pub trader_name: String,
    pub ai_model: String,
    pub exchange_id: Exchange,
    pub strategy_name: String,
    pub trading_style: TradingStyle,
    pub risk_profile: RiskProfile,
    pub stock_pool: Vec<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    pub status: TraderStatus,
}

pub const INITIAL_BALANCE: f64 = 100_000.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub initial_balance: Money,
    pub available_balance: Money,
    pub unrealized_profit: Money,
    pub position_count: usize,
    pub daily_pnl: Money,
}

impl Account {
    pub fn new_default() -> Self {
        let initial = Money::from_major(INITIAL_BALANCE);
        Account {
            initial_balance: initial,
            available_balance: initial,
            unrealized_profit: Money::ZERO,
            position_count: 0,
            daily_pnl: Money::ZERO,
        }
    }

    pub fn total_equity(&self, holdings_value: Money) -> Money {
        self.available_balance + holdings_value
    }

    pub fn total_pnl(&self, holdings_value: Money) -> Money {
        self.total_equity(holdings_value) - self.initial_balance
    }

    pub fn total_pnl_pct(&self, holdings_value: Money) -> f64 {
        if self.initial_balance.minor() == 0 {
            return 0.0;
        }
        self.total_pnl(holdings_value).as_f64() / self.initial_balance.as_f64() * 100.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenLot {
    pub entry_order_id: String,
    pub entry_time: chrono::DateTime<chrono::Utc>,
    pub entry_price: f64,
    pub entry_qty: u64,
    pub entry_fee_remaining: Money,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Holding {
    pub symbol: String,
    pub shares: u64,
    pub avg_cost: f64,
    pub mark_price: f64,
    pub open_lots: Vec<OpenLot>,
}

impl Holding {
    pub fn value(&self) -> Money {
        Money::from_major(self.shares as f64 * self.mark_price)
    }

    pub fn invariant_holds(&self) -> bool {
        let lots_qty: u64 = self.open_lots.iter().map(|l| l.entry_qty).sum();
        lots_qty == self.shares
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub symbol: String,
    pub side: Side,
    pub entry_time: chrono::DateTime<chrono::Utc>,
    pub exit_time: chrono::DateTime<chrono::Utc>,
    pub quantity: u64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub realized_pnl: Money,
    pub fee: Money,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvent {
    pub symbol: String,
    pub side: Side,
    pub quantity: u64,
    pub price: f64,
    pub fee: Money,
    pub cash_after: Money,
    pub total_equity_after: Money,
    pub position_after_qty: u64,
    pub position_after_avg_cost: f64,
    pub position_after_mark: f64,
    pub ts: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Buy,
    Sell,
    Short,
    Hold,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmMeta {
    pub system_prompt: String,
    pub input_prompt: String,
    pub cot_trace: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionLeg {
    pub symbol: String,
    pub action: Action,
    pub quantity: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub cycle_number: u64,
    pub trader_id: String,
    pub symbol: String,
    pub action: Action,
    pub quantity: u64,
    pub confidence: f64,
    pub reasoning: String,
    pub decision_source: String,
    pub executed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_meta: Option<LlmMeta>,
    #[serde(default)]
    pub decisions: Vec<DecisionLeg>,
    #[serde(default)]
    pub execution_log: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessLevel {
    Ok,
    Warn,
    Error,
}

impl serde::Serialize for ReadinessLevel {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let s = match self {
            ReadinessLevel::Ok => "OK",
            ReadinessLevel::Warn => "WARN",
            ReadinessLevel::Error => "ERROR",
        };
        serializer.serialize_str(s)
    }
}

impl<'de> serde::Deserialize<'de> for ReadinessLevel {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        match s.as_str() {
            "OK" => Ok(ReadinessLevel::Ok),
            "WARN" => Ok(ReadinessLevel::Warn),
            "ERROR" => Ok(ReadinessLevel::Error),
            other => Err(serde::de::Error::custom(format!(
                "invalid readiness level: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldSemantics {
    NoPositionNoOrder,
    KeepExistingPosition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionAudit {
    pub trader_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub cycle_number: u64,
    pub readiness: ReadinessLevel,
    pub session_open: bool,
    pub live_fresh_ok: bool,
    pub forced_hold: bool,
    pub order_executed: bool,
    pub position_shares_on_symbol: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hold_semantics: Option<HoldSemantics>,
}
