//! LLM Decider (spec.md §4.5).

use crate::agent::context::SymbolFeatures;
use crate::agent::types::{Action, LlmMeta};
use crate::config::Config;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct LlmDecision {
    pub action: Action,
    pub symbol: String,
    pub quantity: u64,
    pub confidence: f64,
    pub reasoning: String,
    pub meta: LlmMeta,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm_timeout")]
    Timeout,
    #[error("llm_parse_error: {0}")]
    Parse(String),
    #[error("llm_disabled")]
    Disabled,
}

#[derive(Debug, Deserialize)]
struct RawDecision {
    action: String,
    symbol: String,
    quantity: u64,
    confidence: f64,
    reasoning: String,
}

pub struct LlmDecider {
    http: reqwest::Client,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
    dev_token_saver: bool,
}

impl LlmDecider {
    pub fn new(http: reqwest::Client, config: &Config) -> Self {
        Self {
            http,
            api_key: config.openai_api_key.clone(),
            model: config.agent_openai_model.clone(),
            timeout: config.llm_timeout(),
            dev_token_saver: config.dev_token_saver,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    fn build_prompt(&self, symbol: &str, features: &SymbolFeatures) -> (String, String) {
        let system = "You are a disciplined trading agent. Respond with strict JSON \
            {action, symbol, quantity, confidence, reasoning}.".to_string();
        let body = if self.dev_token_saver {
            format!(
                "{symbol} ret5={:.3} ret20={:.3} rsi={:.1}",
                features.ret_5, features.ret_20, features.rsi_14
            )
        } else {
            format!(
                "symbol={symbol}\nret_5={:.4}\nret_20={:.4}\natr_14={:.4}\nvol_ratio_20={:.3}\n\
                 rsi_14={:.2}\nsma_20={:.4}\nsma_60={:.4}\nposition_shares={}",
                features.ret_5,
                features.ret_20,
                features.atr_14,
                features.vol_ratio_20,
                features.rsi_14,
                features.sma_20,
                features.sma_60,
                features.position_shares,
            )
        };
        (system, body)
    }

    pub async fn decide(
        &self,
        symbol: &str,
        features: &SymbolFeatures,
    ) -> Result<LlmDecision, LlmError> {
        let Some(api_key) = &self.api_key else {
            return Err(LlmError::Disabled);
        };
        let (system, prompt) = self.build_prompt(symbol, features);

        let payload = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt},
            ],
            "response_format": {"type": "json_object"},
        });

        let call = self
            .http
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(api_key)
            .json(&payload)
            .send();

        let response = tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| LlmError::Timeout)?
            .map_err(|e| LlmError::Parse(e.to_string()))?;

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;

        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| LlmError::Parse("missing content".to_string()))?;

        let raw: RawDecision =
            serde_json::from_str(content).map_err(|e| LlmError::Parse(e.to_string()))?;

        let action = match raw.action.to_uppercase().as_str() {
            "BUY" => Action::Buy,
            "SELL" => Action::Sell,
            "SHORT" => Action::Short,
            _ => Action::Hold,
        };

        Ok(LlmDecision {
            action,
            symbol: raw.symbol,
            quantity: raw.quantity,
            confidence: raw.confidence.clamp(0.0, 1.0),
            reasoning: raw.reasoning.chars().take(200).collect(),
            meta: LlmMeta {
                system_prompt: system,
                input_prompt: prompt,
                cot_trace: String::new(),
                model: self.model.clone(),
            },
        })
    }
}

/// Deterministic fallback: HOLD with a rationale derived from features
/// (spec.md §4.5).
pub fn deterministic_fallback(symbol: &str, features: &SymbolFeatures) -> LlmDecision {
    let direction = if features.ret_5 >= 0.0 { "+" } else { "" };
    let reasoning = format!(
        "5m ret {direction}{:.1}%, RSI {:.0} → 观望",
        features.ret_5 * 100.0,
        features.rsi_14
    );
    LlmDecision {
        action: Action::Hold,
        symbol: symbol.to_string(),
        quantity: 0,
        confidence: 0.5,
        reasoning,
        meta: LlmMeta::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::context::Trend;

    fn features() -> SymbolFeatures {
        SymbolFeatures {
            symbol: "AAPL".into(),
            ret_5: 0.006,
            ret_20: 0.01,
            atr_14: 1.0,
            vol_ratio_20: 1.0,
            rsi_14: 58.0,
            sma_20: 100.0,
            sma_60: 99.0,
            range_20d_pct: 0.1,
            trend: Trend::Up,
            position_shares: 0,
            intraday_count: 100,
            daily_count: 100,
            latest_intraday_age_ms: 0,
        }
    }

    #[test]
    fn fallback_is_always_hold_with_feature_derived_text() {
        let decision = deterministic_fallback("AAPL", &features());
        assert_eq!(decision.action, Action::Hold);
        assert!(decision.reasoning.contains("RSI 58"));
    }

    #[test]
    fn disabled_without_api_key() {
        let config = Config::from_env();
        let decider = LlmDecider::new(reqwest::Client::new(), &config);
        assert!(!decider.is_enabled());
    }
}
