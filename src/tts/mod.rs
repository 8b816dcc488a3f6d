//! TTS Dispatcher (spec.md §4.12): routes `(room, text, tone)` through a
//! provider list with automatic fallback, persists per-room profile
//! overrides, sanitizes and compacts narration text.

use crate::persist;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    OpenAi,
    SelfHosted,
}

impl Provider {
    fn parse(s: &str) -> Provider {
        match s {
            "openai" => Provider::OpenAi,
            _ => Provider::SelfHosted,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomProfile {
    pub voice: String,
    pub speed: f64,
    pub provider: Provider,
    pub fallback: Option<Provider>,
}

impl Default for RoomProfile {
    fn default() -> Self {
        Self {
            voice: "alloy".to_string(),
            speed: 1.0,
            provider: Provider::SelfHosted,
            fallback: Some(Provider::OpenAi),
        }
    }
}

#[derive(Debug, Error)]
pub enum TtsError {
    #[error("chat_tts_disabled")]
    Disabled,
    #[error("text_required")]
    EmptyText,
    #[error("chat_tts_unavailable")]
    ProviderUnavailable,
    #[error("chat_tts_dispatch_failed")]
    DispatchFailed,
    #[error("openai_tts_http_{0}")]
    OpenAiHttp(u16),
    #[error("selfhosted_tts_http_{0}")]
    SelfHostedHttp(u16),
    #[error("selfhosted_tts_timeout_{0}")]
    SelfHostedTimeout(u64),
}

impl TtsError {
    /// The stable spec.md §7 taxonomy code, with dynamic status/timeout
    /// values rendered into the string (`openai_tts_http_404`, etc).
    pub fn code(&self) -> String {
        self.to_string()
    }
}

#[derive(Debug)]
pub struct AudioResponse {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

pub struct TtsDispatcher {
    http: reqwest::Client,
    openai_api_key: Option<String>,
    self_hosted_base_url: String,
    max_chars: usize,
    timeout: std::time::Duration,
    profiles_path: PathBuf,
    profiles: RwLock<HashMap<String, RoomProfile>>,
    default_profile: RoomProfile,
}

impl TtsDispatcher {
    pub fn new(
        http: reqwest::Client,
        data_dir: impl Into<PathBuf>,
        openai_api_key: Option<String>,
        self_hosted_base_url: String,
        default_provider: &str,
        max_chars: usize,
        timeout: std::time::Duration,
    ) -> Self {
        let default_profile = RoomProfile {
            provider: Provider::parse(default_provider),
            ..RoomProfile::default()
        };
        Self {
            http,
            openai_api_key,
            self_hosted_base_url,
            max_chars,
            timeout,
            profiles_path: data_dir.into().join("tts").join("profiles.json"),
            profiles: RwLock::new(HashMap::new()),
            default_profile,
        }
    }

    pub async fn load(&self) {
        if let Some(loaded) = persist::load_json::<HashMap<String, RoomProfile>>(&self.profiles_path).await {
            *self.profiles.write() = loaded;
        }
    }

    pub fn profile(&self, room_id: &str) -> RoomProfile {
        self.profiles
            .read()
            .get(room_id)
            .cloned()
            .unwrap_or_else(|| self.default_profile.clone())
    }

    pub async fn set_profile(&self, room_id: &str, profile: RoomProfile) -> anyhow::Result<()> {
        self.profiles.write().insert(room_id.to_string(), profile);
        let snapshot = self.profiles.read().clone();
        persist::save_json(&self.profiles_path, &snapshot).await
    }

    pub async fn clear_profile(&self, room_id: &str) -> anyhow::Result<()> {
        self.profiles.write().remove(room_id);
        let snapshot = self.profiles.read().clone();
        persist::save_json(&self.profiles_path, &snapshot).await
    }

    /// Route through `[requested, fallback?]`, retrying the fallback
    /// automatically if the primary fails (spec.md §4.12).
    pub async fn speak(&self, room_id: &str, text: &str, _tone: &str) -> Result<AudioResponse, TtsError> {
        let text = compact_text(&sanitize(text), self.max_chars);
        if text.is_empty() {
            return Err(TtsError::EmptyText);
        }
        let profile = self.profile(room_id);

        match self.call_provider(profile.provider, &profile, &text).await {
            Ok(audio) => Ok(audio),
            Err(primary_err) => match profile.fallback {
                Some(fallback) if fallback != profile.provider => {
                    match self.call_provider(fallback, &profile, &text).await {
                        Ok(audio) => Ok(audio),
                        Err(_fallback_err) => Err(TtsError::DispatchFailed),
                    }
                }
                _ => Err(primary_err),
            },
        }
    }

    async fn call_provider(
        &self,
        provider: Provider,
        profile: &RoomProfile,
        text: &str,
    ) -> Result<AudioResponse, TtsError> {
        match provider {
            Provider::OpenAi => {
                let Some(api_key) = &self.openai_api_key else {
                    return Err(TtsError::Disabled);
                };
                let payload = serde_json::json!({
                    "model": "tts-1",
                    "voice": profile.voice,
                    "input": text,
                    "response_format": "mp3",
                    "speed": profile.speed,
                });
                let response = tokio::time::timeout(
                    self.timeout,
                    self.http
                        .post("https://api.openai.com/v1/audio/speech")
                        .bearer_auth(api_key)
                        .json(&payload)
                        .send(),
                )
                .await
                .map_err(|_| TtsError::ProviderUnavailable)?
                .map_err(|_| TtsError::ProviderUnavailable)?;
                if !response.status().is_success() {
                    return Err(TtsError::OpenAiHttp(response.status().as_u16()));
                }
                let content_type = response
                    .headers()
                    .get("content-type")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("audio/mpeg")
                    .to_string();
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|_| TtsError::ProviderUnavailable)?
                    .to_vec();
                Ok(AudioResponse { bytes, content_type })
            }
            Provider::SelfHosted => {
                let payload = serde_json::json!({
                    "text": text,
                    "voice": profile.voice,
                    "speed": profile.speed,
                });
                let response = match tokio::time::timeout(
                    self.timeout,
                    self.http
                        .post(format!("{}/synthesize", self.self_hosted_base_url))
                        .json(&payload)
                        .send(),
                )
                .await
                {
                    Err(_) => return Err(TtsError::SelfHostedTimeout(self.timeout.as_millis() as u64)),
                    Ok(result) => result.map_err(|_| TtsError::ProviderUnavailable)?,
                };
                if !response.status().is_success() {
                    return Err(TtsError::SelfHostedHttp(response.status().as_u16()));
                }
                let content_type = response
                    .headers()
                    .get("content-type")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("audio/wav")
                    .to_string();
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|_| TtsError::ProviderUnavailable)?
                    .to_vec();
                Ok(AudioResponse { bytes, content_type })
            }
        }
    }
}

/// Strips ticker tokens (`AAPL`, `600000.SH`) and bare numeric tokens to
/// improve narration prosody (spec.md §4.12).
pub fn sanitize(text: &str) -> String {
    text.split_whitespace()
        .filter(|token| !is_ticker_token(token) && !is_bare_number(token))
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_ticker_token(token: &str) -> bool {
    let stripped = token.trim_matches(|c: char| c.is_ascii_punctuation());
    if stripped.len() < 2 {
        return false;
    }
    let upper_alpha_ratio = stripped.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '.');
    upper_alpha_ratio && stripped.chars().any(|c| c.is_ascii_uppercase())
}

fn is_bare_number(token: &str) -> bool {
    let stripped = token.trim_matches(|c: char| matches!(c, '.' | ',' | '%' | '+' | '-'));
    !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit())
}

/// Collapses to one line and truncates to `max_chars` (spec.md §4.12).
pub fn compact_text(text: &str, max_chars: usize) -> String {
    let collapsed: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_tickers_and_bare_numbers() {
        let out = sanitize("AAPL 600000.SH 涨了 3.5% 到 150");
        assert!(!out.contains("AAPL"));
        assert!(!out.contains("600000.SH"));
        assert!(out.contains("涨了"));
    }

    #[test]
    fn compact_collapses_newlines_and_truncates() {
        let out = compact_text("line one\nline two\nline three", 12);
        assert_eq!(out.chars().count(), 12);
        assert!(!out.contains('\n'));
    }

    #[tokio::test]
    async fn profile_roundtrips_through_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = TtsDispatcher::new(
            reqwest::Client::new(),
            dir.path(),
            None,
            "http://localhost:9000".to_string(),
            "selfhosted",
            240,
            std::time::Duration::from_millis(8_000),
        );
        dispatcher
            .set_profile(
                "room1",
                RoomProfile {
                    voice: "nova".into(),
                    speed: 1.2,
                    provider: Provider::OpenAi,
                    fallback: Some(Provider::SelfHosted),
                },
            )
            .await
            .unwrap();

        let dispatcher2 = TtsDispatcher::new(
            reqwest::Client::new(),
            dir.path(),
            None,
            "http://localhost:9000".to_string(),
            "selfhosted",
            240,
            std::time::Duration::from_millis(8_000),
        );
        dispatcher2.load().await;
        assert_eq!(dispatcher2.profile("room1").voice, "nova");
        assert_eq!(dispatcher2.profile("room2").voice, "alloy");
    }

    #[tokio::test]
    async fn speak_fails_without_any_reachable_provider() {
        let dispatcher = TtsDispatcher::new(
            reqwest::Client::new(),
            tempfile::tempdir().unwrap().path(),
            None,
            "http://127.0.0.1:0".to_string(),
            "openai",
            240,
            std::time::Duration::from_millis(500),
        );
        let err = dispatcher.speak("room1", "你好世界", "calm").await.unwrap_err();
        assert!(matches!(err, TtsError::Disabled));
    }
}
