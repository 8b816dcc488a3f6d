//! Replay Engine (spec.md §2, §4.6 scheduling model "replay").
//!
//! Deterministic time-cursor playback of recorded frames held in memory.
//! A background ticker advances the cursor; every `decision_every_bars`
//! advanced bars it notifies the Agent Runtime to enqueue one decision
//! step.

use crate::market::{Frame, Interval};
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayAction {
    Pause,
    Resume,
    Step,
    SetSpeed,
    SetCursor,
    SetLoop,
}

pub struct ReplayEngine {
    store: HashMap<(String, Interval), Vec<Frame>>,
    state: RwLock<ReplayState>,
    step_tx: mpsc::Sender<()>,
}

struct ReplayState {
    running: bool,
    cursor: usize,
    speed: f64,
    looping: bool,
    bars_since_decision: u64,
    decision_every_bars: u64,
    max_len: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ReplayStatus {
    pub running: bool,
    pub cursor: usize,
    pub speed: f64,
    pub looping: bool,
    pub total_frames: usize,
}

impl ReplayEngine {
    pub fn new(
        store: HashMap<(String, Interval), Vec<Frame>>,
        decision_every_bars: u64,
        step_tx: mpsc::Sender<()>,
    ) -> Self {
        let max_len = store.values().map(|v| v.len()).max().unwrap_or(0);
        Self {
            store,
            step_tx,
            state: RwLock::new(ReplayState {
                running: false,
                cursor: 0,
                speed: 1.0,
                looping: false,
                bars_since_decision: 0,
                decision_every_bars: decision_every_bars.max(1),
                max_len,
            }),
        }
    }

    pub fn get_frames(&self, symbol: &str, interval: Interval, limit: usize) -> Vec<Frame> {
        let cursor = self.state.read().cursor;
        self.store
            .get(&(symbol.to_string(), interval))
            .map(|frames| {
                let upto = frames.len().min(cursor + 1);
                let start = upto.saturating_sub(limit);
                frames[start..upto].to_vec()
            })
            .unwrap_or_default()
    }

    pub fn status(&self) -> ReplayStatus {
        let s = self.state.read();
        ReplayStatus {
            running: s.running,
            cursor: s.cursor,
            speed: s.speed,
            looping: s.looping,
            total_frames: s.max_len,
        }
    }

    pub fn control(&self, action: ReplayAction, arg: Option<f64>) {
        let mut s = self.state.write();
        match action {
            ReplayAction::Pause => s.running = false,
            ReplayAction::Resume => s.running = true,
            ReplayAction::SetSpeed => {
                if let Some(v) = arg {
                    s.speed = v.max(0.01);
                }
            }
            ReplayAction::SetCursor => {
                if let Some(v) = arg {
                    s.cursor = (v as usize).min(s.max_len.saturating_sub(1));
                }
            }
            ReplayAction::SetLoop => {
                s.looping = arg.map(|v| v != 0.0).unwrap_or(!s.looping);
            }
            ReplayAction::Step => {
                drop(s);
                self.advance_one();
            }
        }
    }

    /// Advance the cursor by one bar; returns `true` if it rolled over
    /// (looped or hit the end).
    pub fn advance_one(&self) -> bool {
        let notify = {
            let mut s = self.state.write();
            if s.max_len == 0 {
                return false;
            }
            if s.cursor + 1 >= s.max_len {
                if s.looping {
                    s.cursor = 0;
                } else {
                    return true;
                }
            } else {
                s.cursor += 1;
            }
            s.bars_since_decision += 1;
            if s.bars_since_decision >= s.decision_every_bars {
                s.bars_since_decision = 0;
                true
            } else {
                false
            }
        };
        if notify {
            let _ = self.step_tx.try_send(());
        }
        false
    }

    pub fn is_running(&self) -> bool {
        self.state.read().running
    }
}

/// `cycle_ms ≈ 60_000·N / speed` — derive the bar-count cadence from a
/// desired wall-clock cycle length (spec.md §4.6).
pub fn derive_decision_every_bars(cycle_ms: u64, speed: f64, bar_minutes: u64) -> u64 {
    let n = (cycle_ms as f64 * speed) / (60_000.0 * bar_minutes as f64);
    n.round().max(1.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_bar_cadence_from_cycle_and_speed() {
        assert_eq!(derive_decision_every_bars(60_000, 1.0, 1), 1);
        assert_eq!(derive_decision_every_bars(60_000, 2.0, 1), 2);
    }

    #[test]
    fn advance_notifies_every_n_bars() {
        let (tx, mut rx) = mpsc::channel(8);
        let engine = ReplayEngine::new(HashMap::new(), 3, tx);
        {
            let mut s = engine.state.write();
            s.max_len = 10;
        }
        for _ in 0..2 {
            engine.advance_one();
            assert!(rx.try_recv().is_err());
        }
        engine.advance_one();
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn loop_resets_cursor_at_end() {
        let (tx, _rx) = mpsc::channel(8);
        let engine = ReplayEngine::new(HashMap::new(), 1, tx);
        {
            let mut s = engine.state.write();
            s.max_len = 3;
            s.looping = true;
            s.cursor = 2;
        }
        engine.advance_one();
        assert_eq!(engine.state.read().cursor, 0);
    }
}
