use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::{Arc, LazyLock};
use std::time::Instant;
use tracing::{info, warn};

use crate::error::Fault;
use crate::rate_limiter::FixedWindowLimiter;
use crate::response::{HealthResponse, StoreStatus};
use crate::store::RateLimitStore;

static START_TIME: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Marks the process start for uptime reporting.
pub fn mark_started() {
    LazyLock::force(&START_TIME);
}

/// Health check endpoint, pinging the rate limit store.
pub async fn health_check(State(limiter): State<Arc<FixedWindowLimiter>>) -> Json<HealthResponse> {
    let (status, store) = match limiter.store().ping().await {
        Ok(()) => (
            "healthy",
            StoreStatus {
                status: "healthy",
                error: None,
            },
        ),
        Err(err) => {
            warn!(event = "store_unavailable", error = %err, "Rate limit store did not answer ping");
            (
                "degraded",
                StoreStatus {
                    status: "unavailable",
                    error: Some(err.to_string()),
                },
            )
        }
    };

    Json(HealthResponse {
        status,
        uptime: START_TIME.elapsed().as_secs(),
        store,
    })
}

/// Fallback for unknown routes.
pub async fn not_found(request: Request) -> Response {
    info!(
        event = "resource_not_found",
        method = %request.method(),
        uri = %request.uri(),
        "Resource not found"
    );
    Fault::not_found("resource not found").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiter::RateLimitRecord;
    use crate::store::{MemoryRateLimitStore, StoreError};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::StatusCode;
    use std::time::Duration;

    struct UnreachableStore;

    #[async_trait]
    impl RateLimitStore for UnreachableStore {
        async fn get_limit(&self, _identity: &str) -> Result<Option<RateLimitRecord>, StoreError> {
            Ok(None)
        }

        async fn upsert_limit(&self, _record: RateLimitRecord) -> Result<(), StoreError> {
            Ok(())
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Err(redis::RedisError::from((redis::ErrorKind::IoError, "connection refused")).into())
        }
    }

    fn limiter(store: Arc<dyn RateLimitStore>) -> State<Arc<FixedWindowLimiter>> {
        State(Arc::new(FixedWindowLimiter::new(store, 10, Duration::from_secs(60))))
    }

    #[tokio::test]
    async fn test_health_check() {
        mark_started();
        let Json(health) = health_check(limiter(Arc::new(MemoryRateLimitStore::new()))).await;
        assert!(health.uptime < 60);
        assert_eq!(health.status, "healthy");
        assert_eq!(health.store.status, "healthy");
        assert!(health.store.error.is_none());
    }

    #[tokio::test]
    async fn test_health_check_reports_unreachable_store() {
        let Json(health) = health_check(limiter(Arc::new(UnreachableStore))).await;
        assert_eq!(health.status, "degraded");
        assert_eq!(health.store.status, "unavailable");
        assert!(health.store.error.unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_not_found() {
        let request = axum::http::Request::builder()
            .uri("/missing")
            .body(Body::empty())
            .unwrap();
        let response = not_found(request).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
