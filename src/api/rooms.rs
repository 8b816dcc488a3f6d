//! Room stream-packet and SSE event endpoints (spec.md §4.8, §6).

use crate::api::state::AppState;
use crate::error::{ok, AppResult};
use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Response;
use futures_util::stream::{self, Stream};
use futures_util::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct StreamPacketQuery {
    #[serde(default = "default_decision_limit")]
    pub decision_limit: u64,
}

fn default_decision_limit() -> u64 {
    20
}

pub async fn stream_packet(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(query): Query<StreamPacketQuery>,
) -> AppResult<Response> {
    let now_ms = state.clock.now_ms();
    let packet = state
        .rooms
        .request_packet(&room_id, query.decision_limit, false, now_ms)
        .await;
    Ok(ok(packet.map(|p| (*p).clone())))
}

#[derive(Debug, Deserialize)]
pub struct RoomEventsQuery {
    #[serde(default = "default_decision_limit")]
    pub decision_limit: u64,
    #[serde(default = "default_packet_interval_ms")]
    pub interval_ms: u64,
}

fn default_packet_interval_ms() -> u64 {
    5_000
}

pub async fn room_events(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(query): Query<RoomEventsQuery>,
    headers: axum::http::HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let last_event_id = headers
        .get("Last-Event-ID")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok());
    let now_ms = state.clock.now_ms();
    let (replay, rx, guard) = state.rooms.subscribe(&room_id, last_event_id, query.interval_ms, now_ms);

    let replayed = stream::iter(replay.into_iter().map(|e| Ok(to_sse_event(e))));
    let live = async_stream::stream! {
        let mut rx = rx;
        let _guard = guard;
        loop {
            match rx.recv().await {
                Ok(event) => yield Ok(to_sse_event(event)),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(replayed.chain(live)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_millis(state.config.room_events_keepalive_ms))
            .text("keepalive"),
    )
}

fn to_sse_event(event: crate::rooms::BufferedEvent) -> Event {
    Event::default()
        .id(event.id.to_string())
        .event(event.event)
        .data(event.data.to_string())
}
