//! Request-scoped trace identifier carried in `X-Trace-Request-ID`, plus any
//! attributes copied from configured request headers.

use axum::http::header::HeaderName;
use axum::http::{HeaderMap, HeaderValue};
use std::collections::BTreeMap;
use uuid::Uuid;

pub const TRACE_HEADER: &str = "x-trace-request-id";

/// Attribute key that replaces the request id when a header is mapped onto it.
pub const REQUEST_ID_KEY: &str = "request_id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trace {
    request_id: String,
    attributes: BTreeMap<String, String>,
}

/// Request headers to copy into trace attributes, as `header -> key`.
#[derive(Debug, Clone, Default)]
pub struct TraceConfig {
    header_to_key: Vec<(HeaderName, String)>,
}

impl TraceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map_header(mut self, header: HeaderName, key: &str) -> Self {
        self.header_to_key.push((header, key.to_string()));
        self
    }

    /// Parses `header=key` pairs, skipping entries without a valid header name.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = &'a str>) -> Self {
        pairs
            .into_iter()
            .filter_map(|pair| pair.split_once('='))
            .filter_map(|(header, key)| {
                let header = HeaderName::from_bytes(header.trim().as_bytes()).ok()?;
                let key = key.trim();
                (!key.is_empty()).then(|| (header, key.to_string()))
            })
            .fold(Self::new(), |config, (header, key)| config.map_header(header, &key))
    }

    pub fn len(&self) -> usize {
        self.header_to_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.header_to_key.is_empty()
    }
}

impl Trace {
    pub fn new() -> Self {
        Self::from_id(&Uuid::new_v4().to_string())
    }

    pub fn from_id(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            attributes: BTreeMap::new(),
        }
    }

    /// Like [`Trace::from_headers`], then copies each mapped header present on the
    /// request into the attributes.
    pub fn from_headers_mapped(headers: &HeaderMap, config: &TraceConfig) -> Self {
        let mut trace = Self::from_headers(headers);
        for (header, key) in &config.header_to_key {
            let value = headers
                .get(header)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty());
            if let Some(value) = value {
                trace.set_attribute(key, value);
            }
        }
        trace
    }

    /// Reads the inbound trace header, starting a new trace when it is missing or blank.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        headers
            .get(TRACE_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(Self::from_id)
            .unwrap_or_default()
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn set_attribute(&mut self, key: &str, value: &str) {
        if key == REQUEST_ID_KEY {
            self.request_id = value.to_string();
        } else {
            self.attributes.insert(key.to_string(), value.to_string());
        }
    }

    pub fn set_headers(&self, headers: &mut HeaderMap) {
        if let Ok(value) = HeaderValue::from_str(&self.request_id) {
            headers.insert(TRACE_HEADER, value);
        }
    }
}

impl Default for Trace {
    fn default() -> Self {
        Self::new()
    }
}
