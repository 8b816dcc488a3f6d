//! Chat Service (spec.md §4.9): message append, agent replies, proactive
//! cadence, and post-decision narration.

use crate::agent::types::{Action, Decision, RiskProfile};
use crate::persist;
use chrono::Timelike;
use chrono_tz::Asia::Shanghai;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderKind {
    User,
    Agent,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: u64,
    pub room_id: String,
    pub session_id: String,
    pub nickname: Option<String>,
    pub visibility: Visibility,
    pub kind: SenderKind,
    pub text: String,
    pub ts_ms: i64,
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("chat_text_too_long")]
    TooLong,
    #[error("chat_rate_limited")]
    RateLimited,
}

/// Per `(room, session)` sliding-window limiter, same shape as the
/// teacher's per-IP request limiter (`middleware::rate_limit`).
struct RateLimiter {
    max_per_min: u32,
    state: Mutex<HashMap<(String, String), (u32, Instant)>>,
}

impl RateLimiter {
    fn new(max_per_min: u32) -> Self {
        Self {
            max_per_min,
            state: Mutex::new(HashMap::new()),
        }
    }

    fn allow(&self, room_id: &str, session_id: &str) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        let entry = state
            .entry((room_id.to_string(), session_id.to_string()))
            .or_insert((0, now));
        if now.duration_since(entry.1) >= Duration::from_secs(60) {
            entry.0 = 0;
            entry.1 = now;
        }
        entry.0 += 1;
        entry.0 <= self.max_per_min
    }
}

pub struct ChatStore {
    base_dir: PathBuf,
    max_text_len: usize,
    rate_limiter: RateLimiter,
    seq: Mutex<HashMap<String, u64>>,
}

impl ChatStore {
    pub fn new(data_dir: impl Into<PathBuf>, max_text_len: usize, rate_limit_per_min: u32) -> Self {
        Self {
            base_dir: data_dir.into().join("chat"),
            max_text_len,
            rate_limiter: RateLimiter::new(rate_limit_per_min),
            seq: Mutex::new(HashMap::new()),
        }
    }

    fn public_path(&self, room_id: &str) -> PathBuf {
        self.base_dir.join(room_id).join("public.jsonl")
    }

    fn private_path(&self, room_id: &str, session_id: &str) -> PathBuf {
        self.base_dir
            .join(room_id)
            .join("private")
            .join(format!("{session_id}.jsonl"))
    }

    fn next_id(&self, room_id: &str) -> u64 {
        let mut seq = self.seq.lock();
        let counter = seq.entry(room_id.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// `PostMessage` (spec.md §4.9 "Append contract"): validate, rate
    /// limit, persist. Scheduling the agent reply and the room-bus
    /// broadcast is the caller's job (it owns the `RoomEventBus` and the
    /// `ChatResponder`).
    pub async fn post(
        &self,
        room_id: &str,
        session_id: &str,
        nickname: Option<String>,
        visibility: Visibility,
        kind: SenderKind,
        text: String,
        now_ms: i64,
    ) -> Result<ChatMessage, ChatError> {
        if text.chars().count() > self.max_text_len {
            return Err(ChatError::TooLong);
        }
        if kind == SenderKind::User && !self.rate_limiter.allow(room_id, session_id) {
            return Err(ChatError::RateLimited);
        }

        let message = ChatMessage {
            id: self.next_id(room_id),
            room_id: room_id.to_string(),
            session_id: session_id.to_string(),
            nickname,
            visibility,
            kind,
            text,
            ts_ms: now_ms,
        };

        let path = match visibility {
            Visibility::Public => self.public_path(room_id),
            Visibility::Private => self.private_path(room_id, session_id),
        };
        persist::append_jsonl(&path, &message)
            .await
            .map_err(|_| ChatError::RateLimited)?;
        Ok(message)
    }

    pub fn public_preview(&self, room_id: &str, limit: usize) -> Vec<ChatMessage> {
        let mut out = persist::tail_jsonl::<ChatMessage>(&self.public_path(room_id), limit);
        out.reverse();
        out
    }

    pub fn private_preview(&self, room_id: &str, session_id: &str, limit: usize) -> Vec<ChatMessage> {
        let mut out =
            persist::tail_jsonl::<ChatMessage>(&self.private_path(room_id, session_id), limit);
        out.reverse();
        out
    }
}

/// Generates agent replies and narration text: LLM-first with a bounded
/// timeout, deterministic template fallback otherwise (spec.md §4.9
/// "Generation"), mirroring `agent::llm::LlmDecider`.
pub struct ChatResponder {
    http: reqwest::Client,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
    semaphore: tokio::sync::Semaphore,
}

impl ChatResponder {
    pub fn new(
        http: reqwest::Client,
        api_key: Option<String>,
        model: String,
        timeout_ms: u64,
        max_concurrency: usize,
    ) -> Self {
        Self {
            http,
            api_key,
            model,
            timeout: Duration::from_millis(timeout_ms),
            semaphore: tokio::sync::Semaphore::new(max_concurrency),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    /// Reply to a public user message. Falls back on missing key, a
    /// saturated concurrency gate, timeout, or any transport error.
    pub async fn reply(&self, room_id: &str, user_text: &str) -> String {
        let Some(permit) = self.semaphore.try_acquire().ok() else {
            return deterministic_reply(room_id, user_text);
        };
        let Some(api_key) = &self.api_key else {
            drop(permit);
            return deterministic_reply(room_id, user_text);
        };

        let payload = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": "You are a trading-room host. Reply in one short, casual sentence."},
                {"role": "user", "content": user_text},
            ],
        });
        let call = self
            .http
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(api_key)
            .json(&payload)
            .send();

        let reply = tokio::time::timeout(self.timeout, call)
            .await
            .ok()
            .and_then(|r| r.ok())
            .map(|r| async move { r.json::<serde_json::Value>().await.ok() });

        let text = match reply {
            Some(fut) => fut
                .await
                .and_then(|body| {
                    body["choices"][0]["message"]["content"]
                        .as_str()
                        .map(|s| s.to_string())
                })
                .filter(|s| !s.trim().is_empty()),
            None => None,
        };
        drop(permit);
        text.unwrap_or_else(|| deterministic_reply(room_id, user_text))
    }
}

fn deterministic_reply(_room_id: &str, user_text: &str) -> String {
    if user_text.contains('?') || user_text.contains('?') {
        "先观察一下,别急着下结论。".to_string()
    } else {
        "收到,继续盯盘。".to_string()
    }
}

const CASUAL_FALLBACKS: &[&str] = &[
    "盘面有点闷,先歇会儿。",
    "继续看两眼再说。",
    "这波节奏不算快。",
];

/// Deterministic proactive/narration template keyed by
/// `(action, tone, risk_profile, salt)` (spec.md §4.9 "Generation").
pub fn template_for(action: Action, risk_profile: RiskProfile, salt: u64) -> String {
    let templates: &[&str] = match (action, risk_profile) {
        (Action::Buy, RiskProfile::Aggressive) => &["上车了,节奏对就加", "顺势加仓一把"],
        (Action::Buy, _) => &["小仓位试探性加一点", "分批慢慢加"],
        (Action::Sell, _) => &["先落袋为安", "减仓观望一下"],
        (Action::Short, _) => &["反手做空一点", "试着空一手"],
        (Action::Hold, RiskProfile::Conservative) => &["按兵不动,等信号", "先不动,保持观察"],
        (Action::Hold, _) => &["先观望,等更清晰的信号", "暂时按兵不动"],
    };
    templates[(salt as usize) % templates.len()].to_string()
}

/// Per-room history of recently emitted opener stems / dedup keys, used to
/// reject repeats (spec.md §4.9 "reject texts whose first clause stem
/// exactly matches one of the last 8 emitted stems").
#[derive(Default)]
pub struct DedupHistory {
    stems: VecDeque<String>,
    keys: VecDeque<String>,
}

const HISTORY_CAP: usize = 8;

fn opener_stem(text: &str) -> String {
    text.split(['。', ',', '!', '?', '.']).next().unwrap_or(text).to_string()
}

fn dedup_key(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect::<String>().to_lowercase()
}

impl DedupHistory {
    pub fn accept(&mut self, text: &str) -> bool {
        let stem = opener_stem(text);
        let key = dedup_key(text);
        if self.stems.contains(&stem) || self.keys.contains(&key) {
            return false;
        }
        self.stems.push_back(stem);
        if self.stems.len() > HISTORY_CAP {
            self.stems.pop_front();
        }
        self.keys.push_back(key);
        if self.keys.len() > HISTORY_CAP {
            self.keys.pop_front();
        }
        true
    }
}

/// Pick the first of `candidates` the history hasn't seen, rerolling the
/// opener up to 3 times then the dedupe key once more, as the last resort
/// taking the final candidate unconditionally (spec.md §4.9).
pub fn pick_unique(history: &mut DedupHistory, candidates: &[String]) -> String {
    for candidate in candidates.iter().take(4) {
        if history.accept(candidate) {
            return candidate.clone();
        }
    }
    candidates.last().cloned().unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DayPart {
    Morning,
    Afternoon,
    Evening,
    Night,
}

fn day_part(now: chrono::DateTime<chrono::Utc>) -> DayPart {
    let local = now.with_timezone(&Shanghai);
    match local.hour() {
        6..=10 => DayPart::Morning,
        11..=17 => DayPart::Afternoon,
        18..=22 => DayPart::Evening,
        _ => DayPart::Night,
    }
}

/// Reject texts inconsistent with the Asia/Shanghai day-part regardless of
/// which market the room trades (spec.md §4.9 time-of-day filter names
/// this cross-market quirk explicitly).
pub fn time_of_day_ok(now: chrono::DateTime<chrono::Utc>, text: &str) -> bool {
    let part = day_part(now);
    let night_only = ["晚安", "睡了", "明天见"];
    let morning_only = ["早安", "早上好"];
    if part != DayPart::Night && night_only.iter().any(|w| text.contains(w)) {
        return false;
    }
    if part != DayPart::Morning && morning_only.iter().any(|w| text.contains(w)) {
        return false;
    }
    true
}

pub fn time_appropriate_fallback(now: chrono::DateTime<chrono::Utc>, salt: u64) -> String {
    match day_part(now) {
        DayPart::Night => "夜盘安静,先歇一会儿。".to_string(),
        DayPart::Morning => "早盘刚开,先看两眼盘面。".to_string(),
        _ => CASUAL_FALLBACKS[(salt as usize) % CASUAL_FALLBACKS.len()].to_string(),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NewsBurstSignal {
    pub ts_ms: i64,
    pub priority: u8,
}

struct RoomCadence {
    last_proactive_emit_ms: i64,
    last_tick_ms: i64,
    burst_until_ms: Option<i64>,
    cooldown_until_ms: i64,
}

impl Default for RoomCadence {
    fn default() -> Self {
        Self {
            last_proactive_emit_ms: i64::MIN / 2,
            last_tick_ms: i64::MIN / 2,
            burst_until_ms: None,
            cooldown_until_ms: 0,
        }
    }
}

pub struct ProactiveConfig {
    pub rooms_per_interval: usize,
    pub min_room_interval_ms: i64,
    pub activity_window_ms: i64,
    pub interval_ms: i64,
    pub burst_interval_ms: i64,
    pub burst_duration_ms: i64,
    pub burst_cooldown_ms: i64,
    pub burst_fresh_ms: i64,
    pub burst_min_priority: u8,
}

/// Round-robin cadence state driving which rooms get a proactive message
/// this tick (spec.md §4.9 "Proactive cadence").
pub struct ProactiveScheduler {
    config: ProactiveConfig,
    cursor: AtomicU64,
    cadence: Mutex<HashMap<String, RoomCadence>>,
}

impl ProactiveScheduler {
    pub fn new(config: ProactiveConfig) -> Self {
        Self {
            config,
            cursor: AtomicU64::new(0),
            cadence: Mutex::new(HashMap::new()),
        }
    }

    /// `rooms` lists candidate room ids with `(agent_running, has_recent_activity)`.
    /// Returns the subset of rooms selected to proactively speak this tick.
    pub fn select(&self, rooms: &[(String, bool, bool)], burst: Option<NewsBurstSignal>, now_ms: i64) -> Vec<String> {
        if rooms.is_empty() {
            return Vec::new();
        }
        let start = (self.cursor.load(Ordering::SeqCst) as usize) % rooms.len();
        let mut selected = Vec::new();
        let mut cadence = self.cadence.lock();

        for offset in 0..rooms.len() {
            if selected.len() >= self.config.rooms_per_interval {
                break;
            }
            let idx = (start + offset) % rooms.len();
            let (room_id, agent_running, has_recent_activity) = &rooms[idx];
            if !agent_running {
                continue;
            }
            let state = cadence.entry(room_id.clone()).or_default();
            if now_ms - state.last_tick_ms < self.config.min_room_interval_ms {
                continue;
            }
            state.last_tick_ms = now_ms;
            if !has_recent_activity
                && now_ms - state.last_proactive_emit_ms > self.config.activity_window_ms
                && state.last_proactive_emit_ms > i64::MIN / 4
            {
                continue;
            }

            let interval = self.effective_interval(state, burst, now_ms);
            if now_ms - state.last_proactive_emit_ms >= interval {
                state.last_proactive_emit_ms = now_ms;
                selected.push(room_id.clone());
            }
        }
        self.cursor.store((start + rooms.len()) as u64, Ordering::SeqCst);
        selected
    }

    fn effective_interval(&self, state: &mut RoomCadence, burst: Option<NewsBurstSignal>, now_ms: i64) -> i64 {
        if let Some(until) = state.burst_until_ms {
            if now_ms <= until {
                return self.config.burst_interval_ms;
            }
            state.burst_until_ms = None;
            state.cooldown_until_ms = now_ms + self.config.burst_cooldown_ms;
        }
        if now_ms >= state.cooldown_until_ms {
            if let Some(signal) = burst {
                let fresh = now_ms - signal.ts_ms <= self.config.burst_fresh_ms;
                if fresh && signal.priority >= self.config.burst_min_priority {
                    state.burst_until_ms = Some(now_ms + self.config.burst_duration_ms);
                    return self.config.burst_interval_ms;
                }
            }
        }
        self.config.interval_ms
    }
}

/// Post-decision narration gate: at most one narration per room, subject
/// to a per-room minimum interval that differs for hold vs non-hold and
/// conservative vs non-conservative risk (spec.md §4.9 "Narration").
pub struct NarrationGate {
    last_emit_ms: Mutex<HashMap<String, i64>>,
}

impl Default for NarrationGate {
    fn default() -> Self {
        Self {
            last_emit_ms: Mutex::new(HashMap::new()),
        }
    }
}

impl NarrationGate {
    pub fn min_interval_ms(action: Action, risk_profile: RiskProfile) -> i64 {
        let base = if action == Action::Hold { 120_000 } else { 30_000 };
        if risk_profile == RiskProfile::Conservative {
            base * 2
        } else {
            base
        }
    }

    /// Returns narration text iff the gate allows one this cycle.
    pub fn narrate(
        &self,
        room_id: &str,
        decision: &Decision,
        risk_profile: RiskProfile,
        now_ms: i64,
    ) -> Option<String> {
        let min_interval = Self::min_interval_ms(decision.action, risk_profile);
        let mut last = self.last_emit_ms.lock();
        let due = last.get(room_id).map(|t| now_ms - t >= min_interval).unwrap_or(true);
        if !due {
            return None;
        }
        last.insert(room_id.to_string(), now_ms);

        let text = decision
            .reasoning
            .split(['\n'])
            .next()
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.to_string())
            .unwrap_or_else(|| {
                format!(
                    "{} {} 信心{:.0}% — {}",
                    action_label(decision.action),
                    decision.symbol,
                    decision.confidence * 100.0,
                    decision.reasoning,
                )
            });
        Some(text)
    }
}

fn action_label(action: Action) -> &'static str {
    match action {
        Action::Buy => "买入",
        Action::Sell => "卖出",
        Action::Short => "做空",
        Action::Hold => "观望",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn post_rejects_text_over_max_len() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChatStore::new(dir.path(), 5, 60);
        let err = store
            .post(
                "room1",
                "s1",
                None,
                Visibility::Public,
                SenderKind::User,
                "way too long".into(),
                0,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::TooLong));
    }

    #[tokio::test]
    async fn post_then_preview_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChatStore::new(dir.path(), 100, 60);
        store
            .post("room1", "s1", None, Visibility::Public, SenderKind::User, "hi".into(), 0)
            .await
            .unwrap();
        store
            .post("room1", "s1", None, Visibility::Public, SenderKind::Agent, "hello".into(), 1)
            .await
            .unwrap();
        let preview = store.public_preview("room1", 10);
        assert_eq!(preview.len(), 2);
        assert_eq!(preview[0].text, "hi");
        assert_eq!(preview[1].text, "hello");
    }

    #[tokio::test]
    async fn rate_limit_blocks_after_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChatStore::new(dir.path(), 100, 2);
        store
            .post("room1", "s1", None, Visibility::Public, SenderKind::User, "a".into(), 0)
            .await
            .unwrap();
        store
            .post("room1", "s1", None, Visibility::Public, SenderKind::User, "b".into(), 0)
            .await
            .unwrap();
        let err = store
            .post("room1", "s1", None, Visibility::Public, SenderKind::User, "c".into(), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::RateLimited));
    }

    #[test]
    fn dedup_history_rejects_repeated_stem() {
        let mut history = DedupHistory::default();
        assert!(history.accept("先观望一下,等信号"));
        assert!(!history.accept("先观望一下,别的内容"));
    }

    #[test]
    fn proactive_scheduler_respects_min_room_interval() {
        let scheduler = ProactiveScheduler::new(ProactiveConfig {
            rooms_per_interval: 3,
            min_room_interval_ms: 5_000,
            activity_window_ms: 300_000,
            interval_ms: 18_000,
            burst_interval_ms: 9_000,
            burst_duration_ms: 120_000,
            burst_cooldown_ms: 180_000,
            burst_fresh_ms: 60_000,
            burst_min_priority: 2,
        });
        let rooms = vec![("r1".to_string(), true, true)];
        let first = scheduler.select(&rooms, None, 0);
        assert_eq!(first, vec!["r1".to_string()]);
        let second = scheduler.select(&rooms, None, 1_000);
        assert!(second.is_empty());
    }

    #[test]
    fn narration_gate_applies_longer_hold_interval() {
        let gate = NarrationGate::default();
        let decision = Decision {
            timestamp: chrono::Utc::now(),
            cycle_number: 1,
            trader_id: "t1".into(),
            symbol: "AAPL".into(),
            action: Action::Hold,
            quantity: 0,
            confidence: 0.5,
            reasoning: "观望中".into(),
            decision_source: "test".into(),
            executed: false,
            llm_meta: None,
            decisions: vec![],
            execution_log: vec![],
        };
        assert!(gate
            .narrate("room1", &decision, RiskProfile::Balanced, 0)
            .is_some());
        assert!(gate
            .narrate("room1", &decision, RiskProfile::Balanced, 1_000)
            .is_none());
    }
}
