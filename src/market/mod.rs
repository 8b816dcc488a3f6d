pub mod adapter;
pub mod live_file;
pub mod replay;
pub mod upstream;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "1d")]
    OneDay,
}

impl Interval {
    pub fn as_str(self) -> &'static str {
        match self {
            Interval::OneMinute => "1m",
            Interval::OneDay => "1d",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Window {
    pub start_ts_ms: i64,
    pub end_ts_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub symbol: String,
    pub interval: Interval,
    pub window: Window,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default)]
    pub partial: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
}

impl From<&Frame> for Kline {
    fn from(f: &Frame) -> Self {
        Kline {
            open_time: f.window.start_ts_ms,
            open: f.open,
            high: f.high,
            low: f.low,
            close: f.close,
            volume: f.volume,
            quote_volume: f.volume * f.close,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameMode {
    Mock,
    Real,
    Live,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameBatch {
    pub frames: Vec<Frame>,
    pub mode: FrameMode,
    pub provider: String,
}
