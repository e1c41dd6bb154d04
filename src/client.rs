//! Outbound requests built from schema instances.

use axum::body::Body;
use axum::http::{header, HeaderValue, Method, Request, Uri};

use crate::binder::{BindError, Binder};
use crate::schema::Schema;
use crate::trace::{Trace, TRACE_HEADER};

/// Encodes `value` into a request for `url_template`, carrying the current trace.
pub fn build_request<S: Schema>(
    binder: &Binder,
    method: Method,
    url_template: &str,
    value: &S,
    trace: &Trace,
) -> Result<Request<Body>, BindError> {
    let encoded = binder.encode(url_template, value)?;

    let mut request = Request::new(match encoded.body {
        Some(bytes) => Body::from(bytes),
        None => Body::empty(),
    });
    *request.method_mut() = method;
    *request.uri_mut() = encoded
        .url
        .parse::<Uri>()
        .map_err(|err| BindError::InvalidUrl {
            url: encoded.url.clone(),
            cause: err.to_string(),
        })?;

    let headers = request.headers_mut();
    if let Some(content_type) = encoded.content_type {
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    }
    if let Ok(value) = HeaderValue::from_str(trace.request_id()) {
        headers.insert(TRACE_HEADER, value);
    }

    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::tests::{PatchProfile, Profile};
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn test_build_request() {
        let value = PatchProfile {
            org: "acme".to_string(),
            id: "7".to_string(),
            body: Profile {
                name: "Grace".to_string(),
                age: 45,
                tags: vec![],
            },
        };

        let request = build_request(
            &Binder::default(),
            Method::PATCH,
            "http://users.internal/orgs/{org}/users/{id}",
            &value,
            &Trace::from_id("trace-9"),
        )
        .unwrap();

        assert_eq!(request.method(), Method::PATCH);
        assert_eq!(request.uri(), "http://users.internal/orgs/acme/users/7");
        assert_eq!(request.headers()[header::CONTENT_TYPE], "application/json");
        assert_eq!(request.headers()[TRACE_HEADER], "trace-9");

        let bytes = request.into_body().collect().await.unwrap().to_bytes();
        let body: Profile = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body, value.body);
    }

    #[test]
    fn test_unencoded_segment_is_rejected() {
        let value = PatchProfile {
            org: "a b".to_string(),
            ..Default::default()
        };

        let err = build_request(
            &Binder::default(),
            Method::GET,
            "/orgs/{org}",
            &value,
            &Trace::new(),
        )
        .unwrap_err();
        assert!(matches!(err, BindError::InvalidUrl { .. }));
    }
}
