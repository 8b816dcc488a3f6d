//! Chat session bootstrap, message post/preview, and TTS endpoints
//! (spec.md §4.9, §4.10, §6).

use crate::api::state::AppState;
use crate::chat::{ChatError, SenderKind, Visibility};
use crate::error::{ok, AppError, AppResult};
use crate::tts::{RoomProfile, TtsError};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Deserialize)]
pub struct BootstrapBody {
    pub nickname: Option<String>,
}

pub async fn session_bootstrap(axum::Json(body): axum::Json<BootstrapBody>) -> Response {
    let session_id = uuid::Uuid::new_v4().to_string();
    ok(serde_json::json!({
        "session_id": session_id,
        "nickname": body.nickname,
    }))
}

pub async fn public_preview(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let limit = query
        .get("limit")
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(30);
    ok(state.chat.public_preview(&room_id, limit))
}

pub async fn private_preview(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> AppResult<Response> {
    let session_id = query
        .get("session_id")
        .ok_or_else(|| AppError::bad_request("invalid_action", "session_id is required"))?;
    let limit = query
        .get("limit")
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(30);
    Ok(ok(state.chat.private_preview(&room_id, session_id, limit)))
}

#[derive(Debug, Deserialize)]
pub struct PostMessageBody {
    pub session_id: String,
    pub nickname: Option<String>,
    pub visibility: Visibility,
    pub text: String,
}

pub async fn post_message(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    axum::Json(body): axum::Json<PostMessageBody>,
) -> AppResult<Response> {
    let now_ms = state.clock.now_ms();
    let message = state
        .chat
        .post(
            &room_id,
            &body.session_id,
            body.nickname,
            body.visibility,
            SenderKind::User,
            body.text,
            now_ms,
        )
        .await
        .map_err(|e| match e {
            ChatError::TooLong => AppError::bad_request("chat_text_too_long", "message too long"),
            ChatError::RateLimited => AppError::conflict("rate_limited", "rate limited"),
        })?;

    if message.visibility == Visibility::Public {
        state
            .rooms
            .emit_chat(&room_id, serde_json::to_value(&message).unwrap(), now_ms);
    }

    if state.chat_responder.is_enabled() {
        let reply_text = state.chat_responder.reply(&room_id, &message.text).await;
        let reply = state
            .chat
            .post(
                &room_id,
                &body.session_id,
                None,
                message.visibility,
                SenderKind::Agent,
                reply_text,
                state.clock.now_ms(),
            )
            .await;
        if let Ok(reply) = reply {
            if reply.visibility == Visibility::Public {
                state.rooms.emit_chat(
                    &room_id,
                    serde_json::to_value(&reply).unwrap(),
                    state.clock.now_ms(),
                );
            }
        }
    }

    Ok(ok(message))
}

pub async fn tts_config(State(state): State<AppState>) -> Response {
    ok(serde_json::json!({
        "provider": state.config.chat_tts_provider,
        "max_chars": state.config.chat_tts_max_chars,
    }))
}

pub async fn tts_profile_get(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> AppResult<Response> {
    let room_id = query
        .get("room_id")
        .ok_or_else(|| AppError::bad_request("invalid_action", "room_id is required"))?;
    Ok(ok(state.tts.profile(room_id)))
}

#[derive(Debug, Deserialize)]
pub struct SpeakBody {
    pub room_id: String,
    pub text: String,
    #[serde(default)]
    pub tone: String,
}

pub async fn tts_speak(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<SpeakBody>,
) -> AppResult<Response> {
    let audio = state
        .tts
        .speak(&body.room_id, &body.text, &body.tone)
        .await
        .map_err(|e| match e {
            TtsError::Disabled => AppError::unavailable(e.code(), "text-to-speech disabled"),
            TtsError::EmptyText => AppError::bad_request(e.code(), "text required"),
            TtsError::ProviderUnavailable => {
                AppError::unavailable(e.code(), "text-to-speech provider unavailable")
            }
            TtsError::DispatchFailed => {
                AppError::unavailable(e.code(), "text-to-speech dispatch failed")
            }
            TtsError::OpenAiHttp(_) | TtsError::SelfHostedHttp(_) | TtsError::SelfHostedTimeout(_) => {
                AppError::unavailable(e.code(), "text-to-speech provider error")
            }
        })?;
    Ok((
        [(axum::http::header::CONTENT_TYPE, audio.content_type)],
        audio.bytes,
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct SetProfileBody {
    pub room_id: String,
    #[serde(flatten)]
    pub profile: RoomProfile,
}

pub async fn tts_profile_set(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<SetProfileBody>,
) -> AppResult<Response> {
    state
        .tts
        .set_profile(&body.room_id, body.profile.clone())
        .await
        .map_err(|e| AppError::internal("internal_error", e.to_string()))?;
    Ok(ok(body.profile))
}

pub async fn tts_profile_delete(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> AppResult<Response> {
    let room_id = query
        .get("room_id")
        .ok_or_else(|| AppError::bad_request("invalid_action", "room_id is required"))?;
    state
        .tts
        .clear_profile(room_id)
        .await
        .map_err(|e| AppError::internal("internal_error", e.to_string()))?;
    Ok(ok(serde_json::json!({"room_id": room_id, "cleared": true})))
}

use axum::response::IntoResponse;
