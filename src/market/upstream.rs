//! Upstream HTTP JSON market-data fetcher (spec.md §4.1 mode "upstream").
//!
//! Uses the shared `reqwest::Client` built once in `AppState`, following
//! the teacher's convention of a single client reused across every
//! outbound call.

use crate::market::{Frame, Interval};
use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct UpstreamResponse {
    frames: Vec<Frame>,
}

pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
}

impl UpstreamClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub async fn get_frames(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
    ) -> Result<Vec<Frame>> {
        let url = format!(
            "{}/frames?symbol={}&interval={}&limit={}",
            self.base_url,
            symbol,
            interval.as_str(),
            limit
        );
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .context("upstream request failed")?
            .error_for_status()
            .context("upstream returned an error status")?;
        let parsed: UpstreamResponse = resp.json().await.context("upstream body not JSON")?;
        Ok(parsed.frames)
    }
}
