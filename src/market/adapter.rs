//! Market Data Adapter (spec.md §4.1): uniform access to frames across the
//! three backing modes, staleness-aware.

use crate::agent::types::Exchange;
use crate::config::{Config, DataMode};
use crate::market::live_file::LiveFileProvider;
use crate::market::replay::ReplayEngine;
use crate::market::upstream::UpstreamClient;
use crate::market::{FrameBatch, FrameMode, Interval, Kline};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MarketError {
    #[error("live_frames_unavailable")]
    LiveFramesUnavailable,
}

pub enum Backing {
    LiveFile {
        providers: HashMap<Exchange, Arc<LiveFileProvider>>,
    },
    Replay {
        engine: Arc<ReplayEngine>,
    },
    Upstream {
        client: Arc<UpstreamClient>,
    },
}

pub struct MarketDataAdapter {
    backing: Backing,
    strict_live: bool,
}

fn exchange_for_symbol(symbol: &str) -> Exchange {
    if symbol.ends_with(".SH") || symbol.ends_with(".SZ") {
        Exchange::CnA
    } else {
        Exchange::Us
    }
}

impl MarketDataAdapter {
    pub fn new(backing: Backing, config: &Config) -> Self {
        Self {
            backing,
            strict_live: config.strict_live_mode,
        }
    }

    pub fn mode(&self) -> FrameMode {
        match &self.backing {
            Backing::LiveFile { .. } => FrameMode::Live,
            Backing::Replay { .. } => FrameMode::Mock,
            Backing::Upstream { .. } => FrameMode::Real,
        }
    }

    pub async fn get_frames(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
    ) -> Result<FrameBatch, MarketError> {
        match &self.backing {
            Backing::LiveFile { providers } => {
                let exchange = exchange_for_symbol(symbol);
                let provider = providers
                    .get(&exchange)
                    .ok_or(MarketError::LiveFramesUnavailable)?;
                let frames = provider.get_frames(symbol, interval, limit);
                if frames.is_empty() && provider.is_erroring_or_stale() {
                    return Err(MarketError::LiveFramesUnavailable);
                }
                Ok(FrameBatch {
                    frames,
                    mode: FrameMode::Live,
                    provider: "live_file".to_string(),
                })
            }
            Backing::Replay { engine } => {
                if self.strict_live {
                    return Err(MarketError::LiveFramesUnavailable);
                }
                Ok(FrameBatch {
                    frames: engine.get_frames(symbol, interval, limit),
                    mode: FrameMode::Mock,
                    provider: "replay".to_string(),
                })
            }
            Backing::Upstream { client } => {
                if self.strict_live {
                    return Err(MarketError::LiveFramesUnavailable);
                }
                let frames = client
                    .get_frames(symbol, interval, limit)
                    .await
                    .map_err(|_| MarketError::LiveFramesUnavailable)?;
                Ok(FrameBatch {
                    frames,
                    mode: FrameMode::Real,
                    provider: "upstream".to_string(),
                })
            }
        }
    }

    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
    ) -> Result<Vec<Kline>, MarketError> {
        let batch = self.get_frames(symbol, interval, limit).await?;
        Ok(batch.frames.iter().map(Kline::from).collect())
    }

    pub fn is_symbol_available(&self, symbol: &str) -> bool {
        match &self.backing {
            Backing::LiveFile { providers } => {
                let exchange = exchange_for_symbol(symbol);
                providers
                    .get(&exchange)
                    .map(|p| !p.is_erroring_or_stale())
                    .unwrap_or(false)
            }
            _ => true,
        }
    }

    pub fn live_file_provider(&self, exchange: Exchange) -> Option<&Arc<LiveFileProvider>> {
        match &self.backing {
            Backing::LiveFile { providers } => providers.get(&exchange),
            _ => None,
        }
    }

    pub fn boot_check(config: &Config) -> Result<(), String> {
        if config.strict_live_mode && config.data_mode != DataMode::LiveFile {
            return Err("strict_live_mode_requires_runtime_data_mode_live_file".to_string());
        }
        if config.strict_live_mode {
            if let Some(path) = &config.live_frames_path_cn {
                if std::fs::metadata(path).is_err() {
                    return Err(format!("live_frames_path_cn_unreadable:{path}"));
                }
            }
            if let Some(path) = &config.live_frames_path_us {
                if std::fs::metadata(path).is_err() {
                    return Err(format!("live_frames_path_us_unreadable:{path}"));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_inferred_from_symbol_suffix() {
        assert_eq!(exchange_for_symbol("600000.SH"), Exchange::CnA);
        assert_eq!(exchange_for_symbol("AAPL"), Exchange::Us);
    }

    #[test]
    fn boot_check_rejects_strict_live_without_live_file_mode() {
        let mut config = Config::from_env();
        config.strict_live_mode = true;
        config.data_mode = DataMode::Replay;
        let err = MarketDataAdapter::boot_check(&config).unwrap_err();
        assert_eq!(err, "strict_live_mode_requires_runtime_data_mode_live_file");
    }
}
