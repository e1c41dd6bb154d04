use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, FromRequestParts, MatchedPath, Query, RawPathParams, Request, State};
use axum::http::request::Parts;
use axum::http::{header, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use tracing::{error, info, warn};

use crate::error::{cause_of, Fault, IntoFault};
use crate::key_generator::KeyGenerator;
use crate::rate_limiter::FixedWindowLimiter;
use crate::trace::{Trace, TraceConfig, TRACE_HEADER};

static NON_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9]+").expect("static regex"));

/// Builds `<method>_<route>` from a route template, e.g. `put_echo_id`.
pub fn event_name(method: &str, route: &str) -> String {
    let route = NON_WORD.replace_all(route, "_");
    let route = route.trim_matches('_');
    if route.is_empty() {
        format!("{}_root", method.to_lowercase())
    } else {
        format!("{}_{}", method.to_lowercase(), route.to_lowercase())
    }
}

fn peer_addr(request: &Request) -> Option<SocketAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

/// What the request-logging middleware attaches to its events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestLoggingConfig {
    pub log_path: bool,
    pub log_path_params: bool,
    pub log_query_params: bool,
    /// Buffers and logs `application/json` bodies of POST and PUT requests that
    /// declare a `Content-Length` within `max_body_bytes`.
    pub log_json_body: bool,
    pub max_body_bytes: usize,
}

impl RequestLoggingConfig {
    pub fn all(max_body_bytes: usize) -> Self {
        Self {
            log_path: true,
            log_path_params: true,
            log_query_params: true,
            log_json_body: true,
            max_body_bytes,
        }
    }
}

/// Logs `<event>_started` and then `<event>_succeeded` or `<event>_failed`.
///
/// Requests that matched no route are passed through unlogged.
pub async fn logging_middleware(
    State(config): State<RequestLoggingConfig>,
    request: Request,
    next: Next,
) -> Response {
    let Some(route) = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
    else {
        return next.run(request).await;
    };

    let method = request.method().clone();
    let uri = request.uri().clone();
    let event = event_name(method.as_str(), &route);
    let client_ip = KeyGenerator::extract_identity(request.headers(), peer_addr(&request))
        .unwrap_or_else(|_| "unknown".to_string());
    let trace_id = request
        .extensions()
        .get::<Trace>()
        .map(|trace| trace.request_id().to_string())
        .unwrap_or_default();

    let (request, data) = match request_data(&config, request).await {
        Ok(collected) => collected,
        Err(response) => return response,
    };

    info!(
        target: "bindgate::middleware",
        event = %format!("{}_started", event),
        method = %method,
        uri = %uri,
        client_ip = %client_ip,
        trace_id = %trace_id,
        data = %data,
        "Incoming request"
    );

    let response = next.run(request).await;

    let status = response.status();
    let sent = response.extensions().get::<Fault>();
    if sent.is_some() || status.is_client_error() || status.is_server_error() {
        error!(
            target: "bindgate::middleware",
            event = %format!("{}_failed", event),
            method = %method,
            uri = %uri,
            status = %status,
            trace_id = %trace_id,
            error = %sent.map(Fault::to_json).unwrap_or_default(),
            data = %data,
            "Request failed"
        );
    } else {
        info!(
            target: "bindgate::middleware",
            event = %format!("{}_succeeded", event),
            method = %method,
            uri = %uri,
            status = %status,
            trace_id = %trace_id,
            data = %data,
            "Request completed"
        );
    }

    response
}

/// Collects the fields enabled in `config`, handing back the request with its body
/// restored when it had to be read.
async fn request_data(
    config: &RequestLoggingConfig,
    request: Request,
) -> Result<(Request, Value), Response> {
    let (mut parts, body) = request.into_parts();
    let mut data = Map::new();

    if config.log_path {
        data.insert("path".into(), Value::from(parts.uri.path()));
    }

    if config.log_path_params {
        let params: Map<String, Value> = RawPathParams::from_request_parts(&mut parts, &())
            .await
            .map(|params| {
                params
                    .iter()
                    .map(|(key, value)| (key.to_string(), Value::from(value)))
                    .collect()
            })
            .unwrap_or_default();
        data.insert("pathParams".into(), Value::Object(params));
    }

    if config.log_query_params {
        let query = Query::<BTreeMap<String, String>>::try_from_uri(&parts.uri)
            .map(|Query(query)| query)
            .unwrap_or_default();
        data.insert("queryParams".into(), json!(query));
    }

    let body = if config.log_json_body && wants_body_logged(config, &parts) {
        let bytes = match to_bytes(body, config.max_body_bytes).await {
            Ok(bytes) => bytes,
            Err(err) => {
                return Err(Fault::bad_request("failed to read request body")
                    .with_cause(cause_of("body_read_error", &err))
                    .into_response())
            }
        };
        let logged = serde_json::from_slice::<Value>(&bytes).unwrap_or(Value::Null);
        data.insert("body".into(), logged);
        Body::from(bytes)
    } else {
        body
    };

    Ok((Request::from_parts(parts, body), Value::Object(data)))
}

fn wants_body_logged(config: &RequestLoggingConfig, parts: &Parts) -> bool {
    let writes = parts.method == Method::POST || parts.method == Method::PUT;
    let json = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));
    let sized = parts
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|len| len.parse::<usize>().ok())
        .is_some_and(|len| len <= config.max_body_bytes);
    writes && json && sized
}

/// Reads or starts the request trace, copies mapped headers into it and stamps it
/// on the response.
pub async fn trace_middleware(
    State(config): State<Arc<TraceConfig>>,
    mut request: Request,
    next: Next,
) -> Response {
    let trace = Trace::from_headers_mapped(request.headers(), &config);
    request.extensions_mut().insert(trace.clone());

    let mut response = next.run(request).await;
    if !response.headers().contains_key(TRACE_HEADER) {
        trace.set_headers(response.headers_mut());
    }
    response
}

/// Admits or rejects the request against the caller's fixed window.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<FixedWindowLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let identity = match KeyGenerator::extract_identity(request.headers(), peer_addr(&request)) {
        Ok(identity) => identity,
        Err(err) => {
            error!(
                event = "middleware_rate_limiting_failed",
                uri = %request.uri(),
                error = %err,
                "Unable to identify caller"
            );
            return Fault::internal("failed to get determine rate limit for incoming request")
                .with_cause(cause_of("identity_error", &err))
                .into_response();
        }
    };

    let decision = match limiter.check(&identity).await {
        Ok(decision) => decision,
        Err(err) => {
            error!(
                event = "middleware_rate_limiting_failed",
                identity = %identity,
                error = %err,
                "Rate limit check failed"
            );
            return err.into_fault().into_response();
        }
    };

    if !decision.allowed {
        warn!(
            event = "rate_limit_exceeded",
            identity = %identity,
            limit = decision.limit,
            reset = decision.reset_time,
            "Rate limit exceeded"
        );
        let mut response = Fault::too_many_requests("rate limit exceeded")
            .with_retry_after(decision.retry_after.unwrap_or(1))
            .into_response();
        decision.apply_headers(response.headers_mut());
        return response;
    }

    let mut response = next.run(request).await;
    decision.apply_headers(response.headers_mut());
    response
}

/// Rewrites the router's bare 405 into the fault format.
pub async fn method_not_allowed_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let response = next.run(request).await;

    if response.status() != StatusCode::METHOD_NOT_ALLOWED
        || response.headers().contains_key(header::CONTENT_TYPE)
    {
        return response;
    }

    info!(
        event = "method_not_allowed",
        method = %method,
        uri = %uri,
        "Method not allowed"
    );

    let (mut parts, _) = response.into_parts();
    let mut normalized = Fault::method_not_allowed("method not allowed").into_response();
    if let Some(allow) = parts.headers.remove(header::ALLOW) {
        normalized.headers_mut().insert(header::ALLOW, allow);
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRateLimitStore;
    use axum::http::header::HeaderName;
    use axum::http::{HeaderValue, Request as HttpRequest};
    use axum::middleware::from_fn;
    use axum::middleware::from_fn_with_state;
    use axum::routing::{get, put};
    use axum::{Extension, Router};
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    #[test]
    fn test_event_name() {
        assert_eq!(event_name("PUT", "/echo/:id"), "put_echo_id");
        assert_eq!(event_name("GET", "/orgs/:org/users/:id"), "get_orgs_org_users_id");
        assert_eq!(event_name("GET", "/"), "get_root");
    }

    #[tokio::test]
    async fn test_trace_header_is_echoed() {
        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(from_fn_with_state(Arc::new(TraceConfig::default()), trace_middleware));

        let request = HttpRequest::builder()
            .uri("/")
            .header(TRACE_HEADER, "abc")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.headers()[TRACE_HEADER], "abc");
    }

    #[tokio::test]
    async fn test_mapped_header_reaches_handler_trace() {
        let config = TraceConfig::new().map_header(HeaderName::from_static("x-tenant-id"), "tenant");
        let app = Router::new()
            .route(
                "/",
                get(|Extension(trace): Extension<Trace>| async move {
                    trace.attribute("tenant").unwrap_or_default().to_string()
                }),
            )
            .layer(from_fn_with_state(Arc::new(config), trace_middleware));

        let request = HttpRequest::builder()
            .uri("/")
            .header("x-tenant-id", "acme")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"acme");
    }

    fn json_put(uri: &str, body: &'static str) -> Request {
        HttpRequest::builder()
            .method("PUT")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::CONTENT_LENGTH, body.len())
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_request_data_collects_enabled_fields() {
        let body = r#"{"message":"hi"}"#;
        let request = json_put("/echo/7?verbose=1", body);

        let Ok((request, data)) = request_data(&RequestLoggingConfig::all(1024), request).await else {
            panic!("request data collection failed");
        };

        assert_eq!(data["path"], "/echo/7");
        assert_eq!(data["queryParams"]["verbose"], "1");
        assert_eq!(data["body"]["message"], "hi");
        // no router ran, so no params were captured
        assert_eq!(data["pathParams"], json!({}));

        let replayed = request.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&replayed[..], body.as_bytes());
    }

    #[tokio::test]
    async fn test_request_data_leaves_body_alone_when_disabled() {
        let config = RequestLoggingConfig::default();
        let Ok((_, data)) = request_data(&config, json_put("/echo/7", "{}")).await else {
            panic!("request data collection failed");
        };
        assert_eq!(data, json!({}));

        // oversized bodies are not buffered
        let config = RequestLoggingConfig::all(4);
        let Ok((_, data)) = request_data(&config, json_put("/echo/7", r#"{"a":1}"#)).await else {
            panic!("request data collection failed");
        };
        assert!(data.get("body").is_none());
    }

    #[tokio::test]
    async fn test_logged_body_still_reaches_handler() {
        let app = Router::new()
            .route("/echo/:id", put(|body: String| async move { body }))
            .layer(from_fn_with_state(RequestLoggingConfig::all(1024), logging_middleware));

        let response = app
            .oneshot(json_put("/echo/7?verbose=1", r#"{"message":"hi"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], br#"{"message":"hi"}"#);
    }

    #[tokio::test]
    async fn test_method_not_allowed_is_normalized() {
        let app = Router::new()
            .route("/only-get", get(|| async { "ok" }))
            .layer(from_fn(method_not_allowed_middleware));

        let request = HttpRequest::builder()
            .method("DELETE")
            .uri("/only-get")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_after_budget() {
        let limiter = Arc::new(FixedWindowLimiter::new(
            Arc::new(MemoryRateLimitStore::new()),
            1,
            Duration::from_secs(60),
        ));
        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(from_fn_with_state(limiter, rate_limit_middleware));

        let request = || {
            HttpRequest::builder()
                .uri("/")
                .header("x-real-ip", HeaderValue::from_static("203.0.113.9"))
                .body(Body::empty())
                .unwrap()
        };

        let first = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()["x-rate-limit-remaining"], "0");

        let second = app.oneshot(request()).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(second.headers().contains_key(header::RETRY_AFTER));
    }

    #[tokio::test]
    async fn test_rate_limit_without_identity_fails() {
        let limiter = Arc::new(FixedWindowLimiter::new(
            Arc::new(MemoryRateLimitStore::new()),
            1,
            Duration::from_secs(60),
        ));
        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(from_fn_with_state(limiter, rate_limit_middleware));

        let request = HttpRequest::builder().uri("/").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
