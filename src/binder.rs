//! Conversion between wire requests and schema instances.

use async_trait::async_trait;
use axum::body::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::annotation::{BodyFormat, Instruction};
use crate::error::{cause_of, Fault, FaultClass, IntoFault, GENERIC_ERROR_MESSAGE};
use crate::schema::{Access, BoundField, Schema, SchemaDescriptor, SchemaError, SchemaRegistry};
use crate::validation::{RecursiveValidator, ValidationError};

pub const ENCODER_ERROR_NAME: &str = "app_request_encoder_error";
pub const DECODER_ERROR_NAME: &str = "app_request_decoder_error";
pub const PARSE_ERROR_NAME: &str = "parse_request_error";

#[derive(Debug, Error)]
pub enum BindError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("failed to encode body (name:{field}): {cause}")]
    Encode {
        field: &'static str,
        #[source]
        cause: serde_json::Error,
    },

    #[error("resolved url {url} is invalid: {cause}")]
    InvalidUrl { url: String, cause: String },

    #[error("invalid content type, expected {expected}")]
    UnsupportedContentType {
        expected: &'static str,
        actual: Option<String>,
    },

    #[error("failed to read request body: {0}")]
    BodyRead(String),

    #[error("request body is missing")]
    MissingBody,

    #[error("failed to parse request body (name:{field}): {cause}")]
    BodyDecode {
        field: &'static str,
        #[source]
        cause: serde_json::Error,
    },

    #[error("request body failed validation (name:{field}): {cause}")]
    BodyValidation {
        field: &'static str,
        #[source]
        cause: ValidationError,
    },
}

impl BindError {
    pub fn class(&self) -> FaultClass {
        match self {
            BindError::Schema(_) => FaultClass::SchemaDefinition,
            BindError::UnsupportedContentType { .. }
            | BindError::BodyDecode { .. }
            | BindError::BodyValidation { .. } => FaultClass::Client,
            BindError::Encode { .. }
            | BindError::InvalidUrl { .. }
            | BindError::BodyRead(_)
            | BindError::MissingBody => FaultClass::Server,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BindError::Schema(_) => SchemaError::NAME,
            BindError::Encode { .. } | BindError::InvalidUrl { .. } => ENCODER_ERROR_NAME,
            BindError::MissingBody => PARSE_ERROR_NAME,
            BindError::BodyValidation { .. } => ValidationError::NAME,
            _ => DECODER_ERROR_NAME,
        }
    }
}

impl IntoFault for BindError {
    fn into_fault(self) -> Fault {
        let message = match self {
            BindError::Schema(err) => return err.into_fault(),
            BindError::UnsupportedContentType { .. } => "invalid content type",
            BindError::BodyDecode { .. } => "failed to parse request body",
            BindError::BodyValidation { .. } => "request body failed validation",
            BindError::Encode { .. }
            | BindError::InvalidUrl { .. }
            | BindError::BodyRead(_)
            | BindError::MissingBody => GENERIC_ERROR_MESSAGE,
        };
        Fault::of_class(self.class(), message).with_cause(cause_of(self.name(), &self))
    }
}

/// What the binder needs from an inbound request.
#[async_trait]
pub trait InboundRequest: Send {
    /// Value of the named path parameter, as the router captured it.
    fn path_param(&self, name: &str) -> Option<&str>;

    fn content_type(&self) -> Option<&str>;

    /// Reads the whole body. Can only succeed once.
    async fn read_body(&mut self) -> Result<Bytes, BindError>;
}

/// Result of encoding a schema for an outbound call.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedRequest {
    pub url: String,
    pub body: Option<Bytes>,
    pub content_type: Option<&'static str>,
}

/// Binds schema instances to and from requests.
///
/// Cheap to clone; the descriptor cache is shared between clones.
#[derive(Debug, Clone, Default)]
pub struct Binder {
    validator: RecursiveValidator,
    registry: SchemaRegistry,
}

impl Binder {
    pub fn new(validator: RecursiveValidator) -> Self {
        Self {
            validator,
            registry: SchemaRegistry::new(),
        }
    }

    pub fn validator(&self) -> &RecursiveValidator {
        &self.validator
    }

    /// Builds and caches the descriptor for `S`, surfacing annotation mistakes early.
    pub fn register<S: Schema>(&self) -> Result<(), SchemaError> {
        let descriptor = self.registry.descriptor::<S>()?;
        debug!(
            event = "schema_registered",
            schema = descriptor.name(),
            fields = descriptor.fields().len(),
            "Registered schema"
        );
        Ok(())
    }

    pub fn descriptor<S: Schema>(&self) -> Result<Arc<SchemaDescriptor<S>>, SchemaError> {
        self.registry.descriptor::<S>()
    }

    /// Resolves `{name}` placeholders in `url` and serializes the body field of `value`.
    ///
    /// Path values are substituted verbatim; callers are responsible for escaping.
    pub fn encode<S: Schema>(&self, url: &str, value: &S) -> Result<EncodedRequest, BindError> {
        let descriptor = self.descriptor::<S>()?;
        let mut resolved = url.to_string();
        let mut body = None;
        let mut content_type = None;

        for field in descriptor.fields() {
            for instruction in &field.instructions {
                match instruction {
                    Instruction::Path(name) => {
                        if let Access::Text { get, .. } = &field.access {
                            resolved = resolved.replace(&format!("{{{}}}", name), get(value));
                        }
                    }
                    Instruction::Body(format) => {
                        let bytes = encode_field(field, value, *format)?;
                        body = Some(Bytes::from(bytes));
                        content_type = Some(format.content_type());
                    }
                }
            }
        }

        Ok(EncodedRequest {
            url: resolved,
            body,
            content_type,
        })
    }

    /// Builds a new `S` from `request`.
    ///
    /// Fields are filled in declaration order and the first failure is returned.
    pub async fn decode<S, R>(&self, request: &mut R) -> Result<S, BindError>
    where
        S: Schema,
        R: InboundRequest + ?Sized,
    {
        let descriptor = self.descriptor::<S>()?;
        let mut value = S::default();

        for field in descriptor.fields() {
            for instruction in &field.instructions {
                match instruction {
                    Instruction::Path(name) => {
                        if let Access::Text { get_mut, .. } = &field.access {
                            *get_mut(&mut value) =
                                request.path_param(name).unwrap_or_default().to_string();
                        }
                    }
                    Instruction::Body(format) => {
                        let expected = format.content_type();
                        let actual = request.content_type();
                        if !actual.is_some_and(|ct| ct.contains(expected)) {
                            return Err(BindError::UnsupportedContentType {
                                expected,
                                actual: actual.map(str::to_string),
                            });
                        }
                        let bytes = request.read_body().await?;
                        self.decode_field(field, &mut value, *format, &bytes)?;
                    }
                }
            }
        }

        Ok(value)
    }

    fn decode_field<S>(
        &self,
        field: &BoundField<S>,
        value: &mut S,
        format: BodyFormat,
        bytes: &[u8],
    ) -> Result<(), BindError> {
        match &field.access {
            Access::Text { get_mut, .. } => {
                let text: String = match format {
                    BodyFormat::Json => serde_json::from_slice(bytes),
                }
                .map_err(|cause| BindError::BodyDecode {
                    field: field.name,
                    cause,
                })?;
                *get_mut(value) = text;
                Ok(())
            }
            Access::Value {
                decode, validate, ..
            } => {
                decode(value, format, bytes).map_err(|cause| BindError::BodyDecode {
                    field: field.name,
                    cause,
                })?;
                validate(value, &self.validator).map_err(|cause| BindError::BodyValidation {
                    field: field.name,
                    cause,
                })
            }
        }
    }
}

fn encode_field<S>(field: &BoundField<S>, value: &S, format: BodyFormat) -> Result<Vec<u8>, BindError> {
    let encoded = match &field.access {
        Access::Text { get, .. } => match format {
            BodyFormat::Json => serde_json::to_vec(get(value)),
        },
        Access::Value { encode, .. } => encode(value, format),
    };
    encoded.map_err(|cause| BindError::Encode {
        field: field.name,
        cause,
    })
}
