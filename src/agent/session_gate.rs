//! Session Gate (spec.md §4.6a): market-hours + data-freshness evaluation.

use crate::agent::types::Exchange;
use crate::market::adapter::MarketDataAdapter;
use chrono::{Datelike, Timelike};
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    PreOpen,
    ContinuousAm,
    Lunch,
    ContinuousPm,
    CloseAuction,
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct GateSnapshot {
    pub session_is_open: bool,
    pub live_fresh_ok: bool,
    pub phase: SessionPhase,
}

impl GateSnapshot {
    pub fn allow_run(&self, require_fresh: bool) -> bool {
        self.session_is_open && (!require_fresh || self.live_fresh_ok)
    }
}

/// China A-share session calendar: 09:15-09:30 pre-open, 09:30-11:30
/// continuous AM, 11:30-13:00 lunch, 13:00-14:57 continuous PM,
/// 14:57-15:00 close auction, closed otherwise (weekends closed too).
fn cn_a_phase(local_hm: (u32, u32), weekday_is_trading_day: bool) -> SessionPhase {
    if !weekday_is_trading_day {
        return SessionPhase::Closed;
    }
    let minutes = local_hm.0 * 60 + local_hm.1;
    match minutes {
        m if (9 * 60 + 15..9 * 60 + 30).contains(&m) => SessionPhase::PreOpen,
        m if (9 * 60 + 30..11 * 60 + 30).contains(&m) => SessionPhase::ContinuousAm,
        m if (11 * 60 + 30..13 * 60).contains(&m) => SessionPhase::Lunch,
        m if (13 * 60..14 * 60 + 57).contains(&m) => SessionPhase::ContinuousPm,
        m if (14 * 60 + 57..15 * 60).contains(&m) => SessionPhase::CloseAuction,
        _ => SessionPhase::Closed,
    }
}

/// US equity session: 09:30-16:00 continuous, closed otherwise.
fn us_phase(local_hm: (u32, u32), weekday_is_trading_day: bool) -> SessionPhase {
    if !weekday_is_trading_day {
        return SessionPhase::Closed;
    }
    let minutes = local_hm.0 * 60 + local_hm.1;
    if (9 * 60 + 30..16 * 60).contains(&minutes) {
        SessionPhase::ContinuousAm
    } else {
        SessionPhase::Closed
    }
}

pub fn phase_for(exchange: Exchange, now: chrono::DateTime<chrono::Utc>) -> SessionPhase {
    let local = now.with_timezone(&exchange.tz());
    let is_weekday = !matches!(
        local.weekday(),
        chrono::Weekday::Sat | chrono::Weekday::Sun
    );
    let hm = (local.hour(), local.minute());
    match exchange {
        Exchange::CnA => cn_a_phase(hm, is_weekday),
        Exchange::Us => us_phase(hm, is_weekday),
    }
}

pub struct SessionGate {
    snapshots: RwLock<HashMap<Exchange, GateSnapshot>>,
}

impl SessionGate {
    pub fn new() -> Self {
        Self {
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    pub fn snapshot(&self, exchange: Exchange) -> GateSnapshot {
        self.snapshots.read().get(&exchange).copied().unwrap_or(GateSnapshot {
            session_is_open: false,
            live_fresh_ok: false,
            phase: SessionPhase::Closed,
        })
    }

    /// Recompute the gate for every market the adapter knows about.
    pub fn recompute(
        &self,
        adapter: &MarketDataAdapter,
        now: chrono::DateTime<chrono::Utc>,
    ) {
        let mut snapshots = self.snapshots.write();
        for exchange in [Exchange::CnA, Exchange::Us] {
            let phase = phase_for(exchange, now);
            let session_is_open = !matches!(phase, SessionPhase::Closed);
            let live_fresh_ok = adapter
                .live_file_provider(exchange)
                .map(|p| !p.is_erroring_or_stale())
                .unwrap_or(true);
            snapshots.insert(
                exchange,
                GateSnapshot {
                    session_is_open,
                    live_fresh_ok,
                    phase,
                },
            );
        }
    }
}

impl Default for SessionGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn cn_a_continuous_am_window() {
        let ts = chrono_tz::Asia::Shanghai
            .with_ymd_and_hms(2026, 7, 31, 10, 0, 0)
            .unwrap()
            .with_timezone(&chrono::Utc);
        assert_eq!(phase_for(Exchange::CnA, ts), SessionPhase::ContinuousAm);
    }

    #[test]
    fn cn_a_lunch_is_not_open() {
        let ts = chrono_tz::Asia::Shanghai
            .with_ymd_and_hms(2026, 7, 31, 12, 0, 0)
            .unwrap()
            .with_timezone(&chrono::Utc);
        assert_eq!(phase_for(Exchange::CnA, ts), SessionPhase::Lunch);
    }

    #[test]
    fn weekend_is_closed() {
        let ts = chrono_tz::Asia::Shanghai
            .with_ymd_and_hms(2026, 8, 1, 10, 0, 0)
            .unwrap()
            .with_timezone(&chrono::Utc);
        assert_eq!(phase_for(Exchange::CnA, ts), SessionPhase::Closed);
    }
}
