use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

pub const NIL_ERROR_MESSAGE: &str = "nil error passed";
pub const GENERIC_ERROR_MESSAGE: &str = "Internal server error";
pub const SEND_JSON_VALIDATION_MESSAGE: &str =
    "failed to send response, response doesn't meet validation requirements";
pub const SEND_JSON_MARSHAL_MESSAGE: &str = "failed to send response, unable to marshal response";

/// Broad class of a failure, deciding how it is reported on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultClass {
    /// Malformed annotations or schema layout; a programming error.
    SchemaDefinition,
    /// The caller sent something we cannot accept (4xx).
    Client,
    /// Something failed on our side (5xx).
    #[default]
    Server,
    /// Admission was refused by the rate limiter (429).
    Throttling,
}

impl FaultClass {
    pub fn default_status(self) -> StatusCode {
        match self {
            FaultClass::SchemaDefinition | FaultClass::Server => StatusCode::INTERNAL_SERVER_ERROR,
            FaultClass::Client => StatusCode::BAD_REQUEST,
            FaultClass::Throttling => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    pub fn default_name(self) -> &'static str {
        match self {
            FaultClass::SchemaDefinition | FaultClass::Server => "internal_server_error",
            FaultClass::Client => "bad_request_error",
            FaultClass::Throttling => "too_many_requests_error",
        }
    }

    /// Whether faults of this class are our failure rather than the caller's.
    pub fn is_server_side(self) -> bool {
        matches!(self, FaultClass::SchemaDefinition | FaultClass::Server)
    }
}

/// Structured error record written to clients.
///
/// Serializes as `{statusCode, name, message, handled, error}`; `error` is left out
/// when there is no cause.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Fault {
    pub status_code: u16,
    pub name: String,
    pub message: String,
    pub handled: bool,
    #[serde(rename = "error", default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Value>,
    #[serde(skip)]
    pub class: FaultClass,
    #[serde(skip)]
    pub retry_after: Option<u64>,
}

impl Fault {
    pub fn new(status: StatusCode, name: &str, message: &str, class: FaultClass) -> Self {
        Self {
            status_code: status.as_u16(),
            name: name.to_string(),
            message: message.to_string(),
            handled: true,
            cause: None,
            class,
            retry_after: None,
        }
    }

    /// A fault carrying the default status and name of `class`.
    pub fn of_class(class: FaultClass, message: &str) -> Self {
        Self::new(class.default_status(), class.default_name(), message, class)
    }

    pub fn bad_request(message: &str) -> Self {
        Self::of_class(FaultClass::Client, message)
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found_error", message, FaultClass::Client)
    }

    pub fn method_not_allowed(message: &str) -> Self {
        Self::new(
            StatusCode::METHOD_NOT_ALLOWED,
            "method_not_allowed_error",
            message,
            FaultClass::Client,
        )
    }

    pub fn too_many_requests(message: &str) -> Self {
        Self::of_class(FaultClass::Throttling, message)
    }

    pub fn internal(message: &str) -> Self {
        Self::of_class(FaultClass::Server, message)
    }

    pub fn service_unavailable(message: &str) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "service_unavailable_error",
            message,
            FaultClass::Server,
        )
    }

    /// The fault reported when an error slot was empty.
    pub fn nil_error() -> Self {
        Self::internal(NIL_ERROR_MESSAGE)
    }

    /// Wraps any error as an internal fault carrying it as the cause.
    pub fn wrap_internal(err: &(dyn std::error::Error + 'static)) -> Self {
        Self::internal(GENERIC_ERROR_MESSAGE).with_cause(cause_of("error", err))
    }

    pub fn with_cause(mut self, cause: Value) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn is_server_fault(&self) -> bool {
        self.class.is_server_side()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"statusCode":{},"name":"{}","message":"","handled":true}}"#,
                self.status_code, self.name
            )
        })
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for Fault {}

/// Written faults ride along in the response extensions so outer layers can log them.
impl IntoResponse for Fault {
    fn into_response(self) -> Response {
        let mut response = (self.status(), self.to_json()).into_response();
        let headers = response.headers_mut();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(seconds) = self.retry_after {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(seconds));
        }
        response.extensions_mut().insert(self);
        response
    }
}

/// Renders an error as a `{name, message}` cause, following its source chain.
pub fn cause_of(name: &str, err: &(dyn std::error::Error + 'static)) -> Value {
    match err.source() {
        Some(source) => json!({
            "name": name,
            "message": err.to_string(),
            "original": cause_of("error", source),
        }),
        None => json!({ "name": name, "message": err.to_string() }),
    }
}

/// Conversion into the wire fault, implemented by every error this crate produces.
pub trait IntoFault {
    fn into_fault(self) -> Fault;
}

impl IntoFault for Fault {
    fn into_fault(self) -> Fault {
        self
    }
}

impl<E: IntoFault> IntoFault for Option<E> {
    fn into_fault(self) -> Fault {
        match self {
            Some(err) => err.into_fault(),
            None => Fault::nil_error(),
        }
    }
}

impl IntoFault for Box<dyn std::error::Error + Send + Sync> {
    fn into_fault(self) -> Fault {
        Fault::wrap_internal(&*self)
    }
}

impl IntoFault for anyhow::Error {
    fn into_fault(self) -> Fault {
        Fault::wrap_internal(&*self)
    }
}

impl IntoFault for std::io::Error {
    fn into_fault(self) -> Fault {
        Fault::wrap_internal(&self)
    }
}

impl IntoFault for serde_json::Error {
    fn into_fault(self) -> Fault {
        Fault::wrap_internal(&self)
    }
}
