//! Per-request wrapper handed to handlers.
//!
//! An [`Envelope`] owns one inbound request. Handlers call [`Envelope::parse_request`] to
//! bind the input schema and finish with either [`Envelope::send_json`] or
//! [`Envelope::send_json_error`]. Both consume the envelope, so a response can only be
//! written once.

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::{FromRef, FromRequest, FromRequestParts, RawPathParams, Request};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::marker::PhantomData;
use tracing::{error, info, warn};

use crate::binder::{BindError, Binder, InboundRequest};
use crate::error::{cause_of, Fault, IntoFault, SEND_JSON_MARSHAL_MESSAGE};
use crate::schema::Schema;
use crate::trace::Trace;
use crate::validation::Traverse;

pub const DEFAULT_MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// What an envelope needs from router state.
#[derive(Debug, Clone)]
pub struct EnvelopeConfig {
    pub binder: Binder,
    pub max_body_bytes: usize,
}

impl EnvelopeConfig {
    pub fn new(binder: Binder) -> Self {
        Self {
            binder,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self::new(Binder::default())
    }
}

/// The inbound half of an envelope.
pub struct EnvelopeRequest {
    method: Method,
    path: String,
    params: HashMap<String, String>,
    headers: HeaderMap,
    body: Option<Body>,
    max_body_bytes: usize,
}

impl EnvelopeRequest {
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

#[async_trait]
impl InboundRequest for EnvelopeRequest {
    fn path_param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    fn content_type(&self) -> Option<&str> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }

    async fn read_body(&mut self) -> Result<Bytes, BindError> {
        let body = self.body.take().ok_or(BindError::MissingBody)?;
        axum::body::to_bytes(body, self.max_body_bytes)
            .await
            .map_err(|err| BindError::BodyRead(err.to_string()))
    }
}

pub struct Envelope<In, Out> {
    binder: Binder,
    request: EnvelopeRequest,
    trace: Trace,
    _schemas: PhantomData<fn() -> (In, Out)>,
}

#[async_trait]
impl<S, In, Out> FromRequest<S> for Envelope<In, Out>
where
    S: Send + Sync,
    EnvelopeConfig: FromRef<S>,
    In: Schema,
    Out: Serialize + Traverse + 'static,
{
    type Rejection = Infallible;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let config = EnvelopeConfig::from_ref(state);
        let (mut parts, body) = req.into_parts();

        // routes without captures have no params to report
        let params = match RawPathParams::from_request_parts(&mut parts, state).await {
            Ok(raw) => raw
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
            Err(_) => HashMap::new(),
        };

        let trace = parts
            .extensions
            .get::<Trace>()
            .cloned()
            .unwrap_or_else(|| Trace::from_headers(&parts.headers));

        Ok(Self {
            binder: config.binder,
            request: EnvelopeRequest {
                method: parts.method,
                path: parts.uri.path().to_string(),
                params,
                headers: parts.headers,
                body: Some(body),
                max_body_bytes: config.max_body_bytes,
            },
            trace,
            _schemas: PhantomData,
        })
    }
}

impl<In, Out> Envelope<In, Out>
where
    In: Schema,
    Out: Serialize + Traverse,
{
    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn request(&self) -> &EnvelopeRequest {
        &self.request
    }

    /// Binds the input schema from the request. Errors are returned as-is.
    pub async fn parse_request(&mut self) -> Result<In, BindError> {
        self.binder.decode::<In, _>(&mut self.request).await
    }

    /// Validates and writes `value` as a 200 JSON response.
    pub fn send_json(self, value: Out) -> Response {
        if let Err(err) = self.binder.validator().validate(&value) {
            return self.send_json_error(err);
        }

        let bytes = match serde_json::to_vec(&value) {
            Ok(bytes) => bytes,
            Err(err) => {
                let fault = Fault::internal(SEND_JSON_MARSHAL_MESSAGE)
                    .with_cause(cause_of("error", &err));
                return self.send_json_error(fault);
            }
        };

        info!(
            event = "handler_success",
            trace_id = %self.trace.request_id(),
            attributes = ?self.trace.attributes(),
            method = %self.request.method,
            path = %self.request.path,
            "Handler succeeded"
        );

        let mut response = (
            StatusCode::OK,
            [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
            bytes,
        )
            .into_response();
        self.trace.set_headers(response.headers_mut());
        response
    }

    /// Writes `err` in the fault wire format.
    ///
    /// `None` becomes an internal fault with the nil-error message; anything that is not
    /// already a [`Fault`] is wrapped as an internal fault.
    pub fn send_json_error<E: IntoFault>(self, err: E) -> Response {
        let fault = err.into_fault();

        if fault.class.is_server_side() {
            error!(
                event = "handler_failed",
                trace_id = %self.trace.request_id(),
                attributes = ?self.trace.attributes(),
                method = %self.request.method,
                path = %self.request.path,
                status = fault.status_code,
                error = %fault,
                cause = ?fault.cause,
                "Handler failed"
            );
        } else {
            warn!(
                event = "handler_failed",
                trace_id = %self.trace.request_id(),
                attributes = ?self.trace.attributes(),
                method = %self.request.method,
                path = %self.request.path,
                status = fault.status_code,
                error = %fault,
                "Handler failed"
            );
        }

        let mut response = fault.into_response();
        self.trace.set_headers(response.headers_mut());
        response
    }
}
