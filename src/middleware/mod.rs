//! Middleware for observability and rate limiting.
//!
//! This module provides:
//! - Request logging with latency tracking
//! - Rate limiting per IP address
//! - Metrics collection for Prometheus

pub mod control_token;
pub mod logging;
pub mod rate_limit;

pub use control_token::{control_token_gate, ControlTokenState};
pub use logging::{request_logging, request_logging_simple};
pub use rate_limit::{RateLimitConfig, RateLimitLayer};
