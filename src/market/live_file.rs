//! Live File Provider (spec.md §4.2).
//!
//! Holds a cached parse of one JSON snapshot file, refreshing on a
//! time-or-mtime trigger. Grounded in the teacher's `BinancePriceFeed`
//! shape (`Arc<parking_lot::RwLock<...>>` cache behind a small facade,
//! status exposed as a plain struct) but driven by file reads instead of a
//! websocket stream.

use crate::clock::Clock;
use crate::market::{Frame, Interval};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
struct SnapshotFile {
    frames: Vec<Frame>,
}

#[derive(Debug, Clone, Default)]
pub struct ProviderStatus {
    pub file_path: String,
    pub last_load_ts_ms: i64,
    pub last_mtime_ms: i64,
    pub frame_count: usize,
    pub symbols_per_interval: HashMap<String, usize>,
    pub last_error: Option<String>,
    pub stale: bool,
}

struct Cache {
    frames: HashMap<(String, Interval), Vec<Frame>>,
    status: ProviderStatus,
}

/// Caches the parsed contents of one JSON snapshot file, indexed by
/// `(symbol, interval)` for `GetFrames` (the "frame provider variant" of
/// spec.md §4.2).
pub struct LiveFileProvider {
    path: PathBuf,
    refresh_ms: i64,
    stale_after_ms: i64,
    clock: Arc<dyn Clock>,
    cache: RwLock<Cache>,
}

impl LiveFileProvider {
    pub fn new(
        path: impl Into<PathBuf>,
        refresh: Duration,
        stale_after: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let path = path.into();
        Self {
            cache: RwLock::new(Cache {
                frames: HashMap::new(),
                status: ProviderStatus {
                    file_path: path.display().to_string(),
                    ..Default::default()
                },
            }),
            path,
            refresh_ms: refresh.as_millis() as i64,
            stale_after_ms: stale_after.as_millis() as i64,
            clock,
        }
    }

    fn file_mtime_ms(&self) -> Option<i64> {
        let meta = std::fs::metadata(&self.path).ok()?;
        let modified = meta.modified().ok()?;
        let dur = modified.duration_since(std::time::UNIX_EPOCH).ok()?;
        Some(dur.as_millis() as i64)
    }

    /// Re-read and re-parse the file if the refresh interval elapsed or the
    /// mtime changed. Parse failures are zero-throw: `last_error` is set and
    /// the previous parse is kept intact.
    fn maybe_refresh(&self) {
        let now = self.clock.now_ms();
        let mtime = self.file_mtime_ms();

        let needs_refresh = {
            let cache = self.cache.read();
            now - cache.status.last_load_ts_ms >= self.refresh_ms
                || mtime != Some(cache.status.last_mtime_ms)
        };
        if !needs_refresh {
            return;
        }

        match std::fs::read_to_string(&self.path) {
            Ok(contents) => match serde_json::from_str::<SnapshotFile>(&contents) {
                Ok(parsed) => {
                    let mut by_key: HashMap<(String, Interval), Vec<Frame>> = HashMap::new();
                    for frame in parsed.frames {
                        by_key
                            .entry((frame.symbol.clone(), frame.interval))
                            .or_default()
                            .push(frame);
                    }
                    for frames in by_key.values_mut() {
                        frames.sort_by_key(|f| f.window.start_ts_ms);
                    }
                    let mut symbols_per_interval: HashMap<String, usize> = HashMap::new();
                    for (symbol, interval) in by_key.keys() {
                        *symbols_per_interval
                            .entry(format!("{symbol}:{}", interval.as_str()))
                            .or_default() += 1;
                    }
                    let frame_count = by_key.values().map(|v| v.len()).sum();

                    let mut cache = self.cache.write();
                    cache.frames = by_key;
                    cache.status.last_load_ts_ms = now;
                    cache.status.last_mtime_ms = mtime.unwrap_or(0);
                    cache.status.frame_count = frame_count;
                    cache.status.symbols_per_interval = symbols_per_interval;
                    cache.status.last_error = None;
                }
                Err(err) => {
                    warn!(path = %self.path.display(), error = %err, "live file parse failed");
                    let mut cache = self.cache.write();
                    cache.status.last_error = Some(err.to_string());
                }
            },
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "live file read failed");
                let mut cache = self.cache.write();
                cache.status.last_error = Some(err.to_string());
            }
        }
    }

    pub fn get_frames(&self, symbol: &str, interval: Interval, limit: usize) -> Vec<Frame> {
        self.maybe_refresh();
        let cache = self.cache.read();
        cache
            .frames
            .get(&(symbol.to_string(), interval))
            .map(|frames| {
                let start = frames.len().saturating_sub(limit);
                frames[start..].to_vec()
            })
            .unwrap_or_default()
    }

    pub fn status(&self) -> ProviderStatus {
        self.maybe_refresh();
        let now = self.clock.now_ms();
        let mut cache = self.cache.write();
        cache.status.stale = now - cache.status.last_load_ts_ms > self.stale_after_ms;
        cache.status.clone()
    }

    pub fn is_erroring_or_stale(&self) -> bool {
        let status = self.status();
        status.last_error.is_some() || status.stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::market::Window;

    fn write_snapshot(path: &std::path::Path, symbol: &str, closes: &[f64]) {
        let frames: Vec<Frame> = closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Frame {
                symbol: symbol.to_string(),
                interval: Interval::OneMinute,
                window: Window {
                    start_ts_ms: i as i64 * 60_000,
                    end_ts_ms: (i as i64 + 1) * 60_000,
                },
                open: close,
                high: close,
                low: close,
                close,
                volume: 100.0,
                partial: false,
            })
            .collect();
        let body = serde_json::json!({ "frames": frames });
        std::fs::write(path, serde_json::to_vec(&body).unwrap()).unwrap();
    }

    #[test]
    fn reads_and_sorts_frames_by_symbol() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cn.json");
        write_snapshot(&path, "600000.SH", &[1.0, 2.0, 3.0]);

        let clock = Arc::new(FakeClock::new(0));
        let provider = LiveFileProvider::new(
            &path,
            Duration::from_millis(0),
            Duration::from_secs(600),
            clock,
        );

        let frames = provider.get_frames("600000.SH", Interval::OneMinute, 10);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].window.start_ts_ms, 0);
        assert!(!provider.is_erroring_or_stale());
    }

    #[test]
    fn corrupt_file_keeps_previous_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cn.json");
        write_snapshot(&path, "AAA", &[1.0, 2.0]);

        let clock = Arc::new(FakeClock::new(0));
        let provider = LiveFileProvider::new(
            &path,
            Duration::from_millis(0),
            Duration::from_secs(600),
            clock.clone(),
        );
        assert_eq!(provider.get_frames("AAA", Interval::OneMinute, 10).len(), 2);

        std::fs::write(&path, b"not json").unwrap();
        clock.advance_ms(1);
        let frames = provider.get_frames("AAA", Interval::OneMinute, 10);
        assert_eq!(frames.len(), 2, "previous parse must survive a corrupt re-read");
        assert!(provider.status().last_error.is_some());
    }

    #[test]
    fn stale_after_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cn.json");
        write_snapshot(&path, "AAA", &[1.0]);
        let clock = Arc::new(FakeClock::new(0));
        let provider = LiveFileProvider::new(
            &path,
            Duration::from_secs(3600),
            Duration::from_millis(500),
            clock.clone(),
        );
        provider.get_frames("AAA", Interval::OneMinute, 1);
        assert!(!provider.status().stale);
        clock.advance_ms(1000);
        assert!(provider.status().stale);
    }
}
