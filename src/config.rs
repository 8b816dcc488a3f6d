//! Environment-driven configuration.
//!
//! Follows the teacher's `models::Config::from_env` idiom: `dotenv().ok()`
//! then parse every variable with a documented default, never panicking on
//! a malformed value (fall back to default and let the operator fix it).

use std::env;
use std::time::Duration;

fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|s| !s.is_empty())
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    var(name).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn bool_or(name: &str, default: bool) -> bool {
    match var(name) {
        Some(v) => matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"),
        None => default,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataMode {
    LiveFile,
    Replay,
    Mock,
}

impl DataMode {
    fn from_env() -> Self {
        match var("RUNTIME_DATA_MODE").as_deref() {
            Some("replay") => DataMode::Replay,
            Some("mock") => DataMode::Mock,
            _ => DataMode::LiveFile,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub data_dir: String,
    pub data_mode: DataMode,
    pub strict_live_mode: bool,
    pub live_frames_path_cn: Option<String>,
    pub live_frames_path_us: Option<String>,
    pub upstream_base_url: Option<String>,

    pub agent_runtime_cycle_ms: u64,
    pub agent_decision_every_bars: u64,
    pub replay_speed: f64,
    pub replay_warmup_bars: u64,
    pub replay_tick_ms: u64,
    pub replay_loop: bool,

    pub session_guard_enabled: bool,
    pub session_guard_check_ms: u64,
    pub session_guard_require_fresh_live_data: bool,

    pub openai_api_key: Option<String>,
    pub agent_openai_model: String,
    pub chat_openai_model: String,
    pub agent_llm_timeout_ms: u64,
    pub agent_llm_max_output_tokens: u32,
    pub dev_token_saver: bool,

    pub commission_rate: f64,
    pub portfolio_max_position_count: usize,
    pub portfolio_max_symbol_concentration_pct: f64,
    pub portfolio_min_cash_reserve_pct: f64,
    pub portfolio_turnover_throttle_pct: f64,

    pub candidate_symbol_limit: usize,
    pub strict_symbol_loop: bool,

    pub data_readiness_fresh_warn_ms: i64,
    pub data_readiness_fresh_error_ms: i64,
    pub data_readiness_min_intraday_frames: usize,
    pub data_readiness_min_daily_frames: usize,
    pub opening_phase_enabled: bool,
    pub opening_phase_minutes: i64,
    pub opening_phase_max_lots: usize,
    pub opening_phase_max_confidence: f64,

    pub room_events_keepalive_ms: u64,
    pub room_events_packet_min_interval_ms: u64,
    pub room_events_packet_max_interval_ms: u64,
    pub room_events_buffer_size: usize,
    pub room_events_buffer_ttl_ms: u64,

    pub chat_max_text_len: usize,
    pub chat_rate_limit_per_min: u32,
    pub chat_proactive_viewer_tick_ms: u64,
    pub chat_rooms_per_interval: usize,
    pub chat_min_room_interval_ms: u64,
    pub chat_activity_window_ms: u64,
    pub chat_proactive_interval_ms: u64,
    pub chat_burst_interval_ms: u64,
    pub chat_burst_duration_ms: u64,
    pub chat_burst_cooldown_ms: u64,
    pub chat_burst_fresh_ms: u64,
    pub chat_burst_min_priority: u8,
    pub chat_llm_max_concurrency: usize,
    pub chat_public_plain_reply_rate: f64,

    pub chat_tts_provider: String,
    pub chat_tts_max_chars: usize,
    pub chat_tts_timeout_ms: u64,

    pub bets_house_edge: f64,

    pub control_api_token: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        Self {
            port: parse_or("PORT", 8080),
            data_dir: var("RUNTIME_DATA_DIR").unwrap_or_else(|| "data".to_string()),
            data_mode: DataMode::from_env(),
            strict_live_mode: bool_or("STRICT_LIVE_MODE", false),
            live_frames_path_cn: var("LIVE_FRAMES_PATH_CN"),
            live_frames_path_us: var("LIVE_FRAMES_PATH_US"),
            upstream_base_url: var("UPSTREAM_BASE_URL"),

            agent_runtime_cycle_ms: parse_or("AGENT_RUNTIME_CYCLE_MS", 15_000),
            agent_decision_every_bars: parse_or("AGENT_DECISION_EVERY_BARS", 1),
            replay_speed: parse_or("REPLAY_SPEED", 1.0),
            replay_warmup_bars: parse_or("REPLAY_WARMUP_BARS", 180),
            replay_tick_ms: parse_or("REPLAY_TICK_MS", 1_000),
            replay_loop: bool_or("REPLAY_LOOP", false),

            session_guard_enabled: bool_or("AGENT_SESSION_GUARD_ENABLED", true),
            session_guard_check_ms: parse_or("AGENT_SESSION_GUARD_CHECK_MS", 5_000),
            session_guard_require_fresh_live_data: bool_or(
                "AGENT_SESSION_GUARD_REQUIRE_FRESH_LIVE_DATA",
                true,
            ),

            openai_api_key: var("OPENAI_API_KEY"),
            agent_openai_model: var("AGENT_OPENAI_MODEL").unwrap_or_else(|| "gpt-4o-mini".into()),
            chat_openai_model: var("CHAT_OPENAI_MODEL").unwrap_or_else(|| "gpt-4o-mini".into()),
            agent_llm_timeout_ms: parse_or("AGENT_LLM_TIMEOUT_MS", 8_000),
            agent_llm_max_output_tokens: parse_or("AGENT_LLM_MAX_OUTPUT_TOKENS", 400),
            dev_token_saver: bool_or("DEV_TOKEN_SAVER", false),

            commission_rate: parse_or("AGENT_COMMISSION_RATE", 0.0005),
            portfolio_max_position_count: parse_or("AGENT_PORTFOLIO_MAX_POSITION_COUNT", 8),
            portfolio_max_symbol_concentration_pct: parse_or(
                "AGENT_PORTFOLIO_MAX_SYMBOL_CONCENTRATION_PCT",
                0.35,
            ),
            portfolio_min_cash_reserve_pct: parse_or("AGENT_PORTFOLIO_MIN_CASH_RESERVE_PCT", 0.05),
            portfolio_turnover_throttle_pct: parse_or(
                "AGENT_PORTFOLIO_TURNOVER_THROTTLE_PCT",
                0.5,
            ),

            candidate_symbol_limit: parse_or("AGENT_CANDIDATE_SYMBOL_LIMIT", 12),
            strict_symbol_loop: bool_or("AGENT_STRICT_SYMBOL_LOOP", false),

            data_readiness_fresh_warn_ms: parse_or("DATA_READINESS_FRESH_WARN_MS", 120_000),
            data_readiness_fresh_error_ms: parse_or("DATA_READINESS_FRESH_ERROR_MS", 600_000),
            data_readiness_min_intraday_frames: parse_or(
                "DATA_READINESS_MIN_INTRADAY_FRAMES",
                30,
            ),
            data_readiness_min_daily_frames: parse_or("DATA_READINESS_MIN_DAILY_FRAMES", 20),
            opening_phase_enabled: bool_or("DATA_READINESS_OPENING_PHASE_ENABLED", true),
            opening_phase_minutes: parse_or("DATA_READINESS_OPENING_PHASE_MINUTES", 15),
            opening_phase_max_lots: parse_or("OPENING_PHASE_MAX_LOTS", 1),
            opening_phase_max_confidence: parse_or("OPENING_PHASE_MAX_CONFIDENCE", 0.6),

            room_events_keepalive_ms: parse_or("ROOM_EVENTS_KEEPALIVE_MS", 15_000),
            room_events_packet_min_interval_ms: parse_or(
                "ROOM_EVENTS_PACKET_MIN_INTERVAL_MS",
                2_000,
            ),
            room_events_packet_max_interval_ms: parse_or(
                "ROOM_EVENTS_PACKET_MAX_INTERVAL_MS",
                60_000,
            ),
            room_events_buffer_size: parse_or("ROOM_EVENTS_BUFFER_SIZE", 200),
            room_events_buffer_ttl_ms: parse_or("ROOM_EVENTS_BUFFER_TTL_MS", 60_000),

            chat_max_text_len: parse_or("CHAT_MAX_TEXT_LEN", 600),
            chat_rate_limit_per_min: parse_or("CHAT_RATE_LIMIT_PER_MIN", 20),
            chat_proactive_viewer_tick_ms: parse_or("CHAT_PROACTIVE_VIEWER_TICK_MS", 2_000),
            chat_rooms_per_interval: parse_or("CHAT_ROOMS_PER_INTERVAL", 3),
            chat_min_room_interval_ms: parse_or("CHAT_MIN_ROOM_INTERVAL_MS", 5_000),
            chat_activity_window_ms: parse_or("CHAT_ACTIVITY_WINDOW_MS", 300_000),
            chat_proactive_interval_ms: parse_or("CHAT_PROACTIVE_INTERVAL_MS", 18_000),
            chat_burst_interval_ms: parse_or("CHAT_BURST_INTERVAL_MS", 9_000),
            chat_burst_duration_ms: parse_or("CHAT_BURST_DURATION_MS", 120_000),
            chat_burst_cooldown_ms: parse_or("CHAT_BURST_COOLDOWN_MS", 180_000),
            chat_burst_fresh_ms: parse_or("CHAT_BURST_FRESH_MS", 60_000),
            chat_burst_min_priority: parse_or("CHAT_BURST_MIN_PRIORITY", 2),
            chat_llm_max_concurrency: parse_or("CHAT_LLM_MAX_CONCURRENCY", 2),
            chat_public_plain_reply_rate: parse_or("CHAT_PUBLIC_PLAIN_REPLY_RATE", 0.15),

            chat_tts_provider: var("CHAT_TTS_PROVIDER").unwrap_or_else(|| "selfhosted".into()),
            chat_tts_max_chars: parse_or("CHAT_TTS_MAX_CHARS", 240),
            chat_tts_timeout_ms: parse_or("CHAT_TTS_TIMEOUT_MS", 8_000),

            bets_house_edge: parse_or("BETS_HOUSE_EDGE", 0.08),

            control_api_token: var("CONTROL_API_TOKEN"),
        }
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_llm_timeout_ms)
    }
}
