use axum::http::{HeaderMap, HeaderValue};
use serde::Serialize;

pub const LIMIT_HEADER: &str = "x-rate-limit-limit";
pub const REMAINING_HEADER: &str = "x-rate-limit-remaining";
pub const RESET_HEADER: &str = "x-rate-limit-reset";

/// Outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Unix timestamp (seconds) at which the current window ends.
    pub reset_time: u64,
    /// Seconds until a rejected caller may retry.
    pub retry_after: Option<u64>,
}

impl RateLimitDecision {
    pub fn allowed(limit: u32, remaining: u32, reset_time: u64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            reset_time,
            retry_after: None,
        }
    }

    pub fn denied(limit: u32, remaining: u32, reset_time: u64, retry_after: u64) -> Self {
        Self {
            allowed: false,
            limit,
            remaining,
            reset_time,
            retry_after: Some(retry_after),
        }
    }

    /// Writes the `X-Rate-Limit-*` headers.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert(LIMIT_HEADER, HeaderValue::from(self.limit));
        headers.insert(REMAINING_HEADER, HeaderValue::from(self.remaining));
        headers.insert(RESET_HEADER, HeaderValue::from(self.reset_time));
    }
}

/// Body of `/health`. The service stays up without its store, so a failed ping
/// reports `degraded` rather than an error status.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime: u64,
    pub store: StoreStatus,
}

#[derive(Debug, Serialize)]
pub struct StoreStatus {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
