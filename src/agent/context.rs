//! Decision Context Builder (spec.md §4.4).

use crate::agent::session_gate::GateSnapshot;
use crate::agent::types::{LlmMeta, ReadinessLevel, Trader, TradingStyle};
use crate::config::Config;
use crate::market::Frame;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, Copy)]
pub enum Trend {
    Up,
    Down,
    Flat,
}

#[derive(Debug, Clone)]
pub struct SymbolFeatures {
    pub symbol: String,
    pub ret_5: f64,
    pub ret_20: f64,
    pub atr_14: f64,
    pub vol_ratio_20: f64,
    pub rsi_14: f64,
    pub sma_20: f64,
    pub sma_60: f64,
    pub range_20d_pct: f64,
    pub trend: Trend,
    pub position_shares: u64,
    pub intraday_count: usize,
    pub daily_count: usize,
    pub latest_intraday_age_ms: i64,
}

pub fn compute_features(
    symbol: &str,
    intraday: &[Frame],
    daily: &[Frame],
    position_shares: u64,
    now_ms: i64,
) -> SymbolFeatures {
    let closes: Vec<f64> = daily.iter().map(|f| f.close).collect();
    let ret_5 = pct_change(&closes, 5);
    let ret_20 = pct_change(&closes, 20);
    let atr_14 = average_true_range(daily, 14);
    let vol_ratio_20 = volume_ratio(daily, 20);
    let rsi_14 = rsi(&closes, 14);
    let sma_20 = sma(&closes, 20);
    let sma_60 = sma(&closes, 60);
    let range_20d_pct = range_pct(daily, 20);
    let trend = classify_trend(sma_20, sma_60);
    let latest_intraday_age_ms = intraday
        .last()
        .map(|f| now_ms - f.window.end_ts_ms)
        .unwrap_or(i64::MAX);

    SymbolFeatures {
        symbol: symbol.to_string(),
        ret_5,
        ret_20,
        atr_14,
        vol_ratio_20,
        rsi_14,
        sma_20,
        sma_60,
        range_20d_pct,
        trend,
        position_shares,
        intraday_count: intraday.len(),
        daily_count: daily.len(),
        latest_intraday_age_ms,
    }
}

fn pct_change(closes: &[f64], lookback: usize) -> f64 {
    if closes.len() <= lookback {
        return 0.0;
    }
    let last = closes[closes.len() - 1];
    let prior = closes[closes.len() - 1 - lookback];
    if prior == 0.0 {
        return 0.0;
    }
    (last - prior) / prior
}

fn sma(closes: &[f64], window: usize) -> f64 {
    if closes.is_empty() {
        return 0.0;
    }
    let window = window.min(closes.len());
    let slice = &closes[closes.len() - window..];
    slice.iter().sum::<f64>() / slice.len() as f64
}

fn average_true_range(daily: &[Frame], window: usize) -> f64 {
    if daily.len() < 2 {
        return 0.0;
    }
    let window = window.min(daily.len() - 1);
    let mut trs = Vec::with_capacity(window);
    for i in daily.len() - window..daily.len() {
        let prev_close = daily[i - 1].close;
        let tr = (daily[i].high - daily[i].low)
            .max((daily[i].high - prev_close).abs())
            .max((daily[i].low - prev_close).abs());
        trs.push(tr);
    }
    trs.iter().sum::<f64>() / trs.len() as f64
}

fn volume_ratio(daily: &[Frame], window: usize) -> f64 {
    if daily.is_empty() {
        return 1.0;
    }
    let window = window.min(daily.len());
    let slice = &daily[daily.len() - window..];
    let avg = slice.iter().map(|f| f.volume).sum::<f64>() / slice.len() as f64;
    if avg <= 0.0 {
        return 1.0;
    }
    daily.last().map(|f| f.volume).unwrap_or(0.0) / avg
}

fn rsi(closes: &[f64], window: usize) -> f64 {
    if closes.len() < 2 {
        return 50.0;
    }
    let window = window.min(closes.len() - 1);
    let mut gains = 0.0;
    let mut losses = 0.0;
    for i in closes.len() - window..closes.len() {
        let delta = closes[i] - closes[i - 1];
        if delta >= 0.0 {
            gains += delta;
        } else {
            losses -= delta;
        }
    }
    if gains + losses == 0.0 {
        return 50.0;
    }
    if losses == 0.0 {
        return 100.0;
    }
    let rs = gains / losses;
    100.0 - 100.0 / (1.0 + rs)
}

fn range_pct(daily: &[Frame], window: usize) -> f64 {
    if daily.is_empty() {
        return 0.0;
    }
    let window = window.min(daily.len());
    let slice = &daily[daily.len() - window..];
    let high = slice.iter().map(|f| f.high).fold(f64::MIN, f64::max);
    let low = slice.iter().map(|f| f.low).fold(f64::MAX, f64::min);
    if high <= 0.0 {
        return 0.0;
    }
    (high - low) / high
}

fn classify_trend(sma_20: f64, sma_60: f64) -> Trend {
    if sma_60 == 0.0 {
        return Trend::Flat;
    }
    let spread = (sma_20 - sma_60) / sma_60;
    if spread > 0.01 {
        Trend::Up
    } else if spread < -0.01 {
        Trend::Down
    } else {
        Trend::Flat
    }
}

/// Score one candidate per the trader's trading style (spec.md §4.4
/// Ranking).
pub fn score_candidate(style: TradingStyle, f: &SymbolFeatures) -> f64 {
    let trend_up = matches!(f.trend, Trend::Up);
    let trend_down = matches!(f.trend, Trend::Down);
    let mut score = match style {
        TradingStyle::MeanReversion => {
            -f.ret_5
                - 0.35 * f.ret_20
                + if f.rsi_14 <= 45.0 { 0.35 } else { 0.0 }
                + if f.rsi_14 >= 70.0 { -0.25 } else { 0.0 }
                + if trend_down { -0.12 } else { 0.0 }
        }
        TradingStyle::EventDriven => {
            0.8 * f.ret_5
                + 0.6 * f.ret_20
                + 0.22 * (f.vol_ratio_20 - 1.0).max(0.0)
                + if trend_up { 0.12 } else { 0.0 }
                + if trend_down { -0.12 } else { 0.0 }
        }
        TradingStyle::MacroSwing => {
            1.3 * f.ret_20
                + 0.35 * f.ret_5
                + if trend_up { 0.24 } else { 0.0 }
                + if trend_down { -0.22 } else { 0.0 }
        }
        // spec.md §4.4 names a ranking formula per style but leaves `balanced`
        // unlisted; it calls momentum_trend "(default)", so `balanced` ranks
        // the same way.
        TradingStyle::Balanced | TradingStyle::Momentum => {
            1.0 * f.ret_20
                + 0.8 * f.ret_5
                + 0.12 * (f.vol_ratio_20 - 1.0).max(0.0)
                + if trend_up { 0.2 } else { 0.0 }
                + if trend_down { -0.18 } else { 0.0 }
        }
    };
    if f.position_shares > 0 {
        score += 0.05;
    }
    score
}

pub fn rank_candidates(style: TradingStyle, candidates: &[SymbolFeatures]) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..candidates.len()).collect();
    indices.sort_by(|&a, &b| {
        let sa = score_candidate(style, &candidates[a]);
        let sb = score_candidate(style, &candidates[b]);
        sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
    });
    indices
}

/// Symbol selection policy (spec.md §4.4): deterministic loop index when
/// `strict_symbol_loop` is set and the loop candidate survives filtering,
/// otherwise the rank-score leader.
pub fn select_symbol<'a>(
    trader_id: &str,
    cycle_number: u64,
    pool: &'a [String],
    filtered: &[SymbolFeatures],
    style: TradingStyle,
    strict_symbol_loop: bool,
) -> Option<&'a str> {
    if pool.is_empty() {
        return None;
    }
    if strict_symbol_loop {
        let mut hasher = DefaultHasher::new();
        trader_id.hash(&mut hasher);
        let idx = (hasher.finish().wrapping_add(cycle_number) as usize) % pool.len();
        let candidate = &pool[idx];
        if filtered.iter().any(|f| &f.symbol == candidate) {
            return Some(candidate.as_str());
        }
    }
    let ranked = rank_candidates(style, filtered);
    let leader = ranked.first().map(|&i| filtered[i].symbol.as_str())?;
    pool.iter().find(|s| s.as_str() == leader).map(|s| s.as_str())
}

#[derive(Debug, Clone, Copy)]
pub struct PortfolioLimits {
    pub max_position_count: usize,
    pub max_symbol_concentration_pct: f64,
    pub min_cash_reserve_pct: f64,
    pub turnover_throttle_pct: f64,
}

impl PortfolioLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_position_count: config.portfolio_max_position_count,
            max_symbol_concentration_pct: config.portfolio_max_symbol_concentration_pct,
            min_cash_reserve_pct: config.portfolio_min_cash_reserve_pct,
            turnover_throttle_pct: config.portfolio_turnover_throttle_pct,
        }
    }
}

/// Data readiness gate (spec.md §4.4): OK / WARN / ERROR from frame counts
/// and latest-frame age, with an opening-phase relaxation of the intraday
/// minimum.
pub fn readiness_level(
    config: &Config,
    f: &SymbolFeatures,
    is_opening_phase: bool,
) -> ReadinessLevel {
    let min_intraday = if is_opening_phase && config.opening_phase_enabled {
        (config.data_readiness_min_intraday_frames / 3).max(1)
    } else {
        config.data_readiness_min_intraday_frames
    };

    if f.daily_count < config.data_readiness_min_daily_frames / 2
        || f.latest_intraday_age_ms > config.data_readiness_fresh_error_ms
    {
        return ReadinessLevel::Error;
    }
    if f.intraday_count < min_intraday || f.daily_count < config.data_readiness_min_daily_frames {
        return ReadinessLevel::Warn;
    }
    if f.latest_intraday_age_ms > config.data_readiness_fresh_warn_ms {
        return ReadinessLevel::Warn;
    }
    ReadinessLevel::Ok
}

pub fn synthetic_readiness_hold(reason_tail: &str) -> (&'static str, f64, String) {
    (
        "readiness_gate",
        0.51,
        format!("data readiness ERROR: {reason_tail}"),
    )
}

pub fn fallback_llm_meta() -> Option<LlmMeta> {
    None
}

#[derive(Debug, Clone)]
pub struct DecisionContext {
    pub trader: Trader,
    pub cycle_number: u64,
    pub selected_symbol: Option<String>,
    pub candidates: Vec<SymbolFeatures>,
    pub limits: PortfolioLimits,
    pub readiness: ReadinessLevel,
    pub session: GateSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{Interval, Window};

    fn frame(i: i64, close: f64, volume: f64) -> Frame {
        Frame {
            symbol: "AAPL".into(),
            interval: Interval::OneDay,
            window: Window {
                start_ts_ms: i * 86_400_000,
                end_ts_ms: (i + 1) * 86_400_000,
            },
            open: close,
            high: close * 1.01,
            low: close * 0.99,
            close,
            volume,
            partial: false,
        }
    }

    #[test]
    fn momentum_score_rewards_positive_returns() {
        let daily: Vec<Frame> = (0..30).map(|i| frame(i, 100.0 + i as f64, 1000.0)).collect();
        let f = compute_features("AAPL", &[], &daily, 0, 0);
        let score = score_candidate(TradingStyle::Momentum, &f);
        assert!(score > 0.0);
    }

    #[test]
    fn readiness_error_when_frames_too_thin() {
        let config = Config::from_env();
        let f = SymbolFeatures {
            symbol: "AAPL".into(),
            ret_5: 0.0,
            ret_20: 0.0,
            atr_14: 0.0,
            vol_ratio_20: 1.0,
            rsi_14: 50.0,
            sma_20: 0.0,
            sma_60: 0.0,
            range_20d_pct: 0.0,
            trend: Trend::Flat,
            position_shares: 0,
            intraday_count: 0,
            daily_count: 0,
            latest_intraday_age_ms: 0,
        };
        assert_eq!(readiness_level(&config, &f, false), ReadinessLevel::Error);
    }

    #[test]
    fn strict_symbol_loop_falls_back_when_loop_candidate_filtered_out() {
        let pool = vec!["AAPL".to_string(), "MSFT".to_string()];
        let filtered = vec![SymbolFeatures {
            symbol: "MSFT".into(),
            ret_5: 0.05,
            ret_20: 0.1,
            atr_14: 0.0,
            vol_ratio_20: 1.0,
            rsi_14: 50.0,
            sma_20: 10.0,
            sma_60: 9.0,
            range_20d_pct: 0.0,
            trend: Trend::Up,
            position_shares: 0,
            intraday_count: 100,
            daily_count: 100,
            latest_intraday_age_ms: 0,
        }];
        let symbol = select_symbol("trader-a", 0, &pool, &filtered, TradingStyle::Momentum, true);
        assert_eq!(symbol, Some("MSFT"));
    }
}
