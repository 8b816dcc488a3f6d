//! Control-token gate for mutating endpoints (SPEC_FULL.md §4.14):
//! constant-time comparison against `X-Control-Token`, `Authorization:
//! Bearer`, or a body `control_token` field, plus an audit log line.

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Clone)]
pub struct ControlTokenState {
    pub token: Option<Arc<String>>,
}

impl ControlTokenState {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.map(Arc::new),
        }
    }
}

/// Byte-for-byte comparison that always walks both slices in full, so the
/// timing leaks no information about how many leading bytes matched.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn extract_header_token(request: &Request<Body>) -> Option<String> {
    if let Some(value) = request.headers().get("x-control-token") {
        return value.to_str().ok().map(str::to_string);
    }
    if let Some(value) = request.headers().get(axum::http::header::AUTHORIZATION) {
        if let Ok(s) = value.to_str() {
            if let Some(stripped) = s.strip_prefix("Bearer ") {
                return Some(stripped.to_string());
            }
        }
    }
    None
}

fn extract_body_token(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value.get("control_token")?.as_str().map(str::to_string)
}

/// Rejects the request with `401` unless the presented token matches
/// (constant-time). Logs `{ts, action, actor, ip, target, result, error?}`
/// either way (spec.md §6 "audit log line").
pub async fn control_token_gate(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<ControlTokenState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = &state.token else {
        // no token configured: control surface is open (local/dev mode).
        return next.run(request).await;
    };

    let target = request.uri().path().to_string();
    let method = request.method().clone();
    let header_token = extract_header_token(&request);

    let (parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, 1024 * 1024).await {
        Ok(bytes) => bytes,
        Err(_) => Bytes::new(),
    };

    let token = header_token.or_else(|| extract_body_token(&bytes));
    let authorized = token.as_deref().map(|t| constant_time_eq(t, expected)).unwrap_or(false);

    let result = if authorized { "allowed" } else { "denied" };
    tracing::info!(
        action = %method,
        actor = "control_token",
        ip = %addr.ip(),
        target = %target,
        result = %result,
        "control-token gate"
    );

    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({
                "success": false,
                "error": {"code": "unauthorized_control_token", "message": "invalid or missing control token"},
            })),
        )
            .into_response();
    }

    let request = Request::from_parts(parts, Body::from(bytes));
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches_equal_strings() {
        assert!(constant_time_eq("abc123", "abc123"));
        assert!(!constant_time_eq("abc123", "abc124"));
    }

    #[test]
    fn extract_body_token_reads_json_field() {
        let body = br#"{"control_token": "secret", "other": 1}"#;
        assert_eq!(extract_body_token(body).as_deref(), Some("secret"));
    }
}
