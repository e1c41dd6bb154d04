//! Parser for field binding annotations.
//!
//! An annotation is a comma separated list of `key=value` directives, e.g. `"path=id"`
//! or `"body=json"`. Parsing is pure; the only context needed is the field name (for
//! error reporting) and whether the field holds a string.

use std::fmt;
use thiserror::Error;

/// Serialization format accepted by a `body=` directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFormat {
    Json,
}

impl BodyFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            BodyFormat::Json => "json",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            BodyFormat::Json => "application/json",
        }
    }
}

/// Which directive an instruction came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveKind {
    Path,
    Body,
}

impl fmt::Display for DirectiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirectiveKind::Path => write!(f, "path"),
            DirectiveKind::Body => write!(f, "body"),
        }
    }
}

/// One parsed directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Bind the field to the `{name}` URL path segment.
    Path(String),
    /// Bind the field to the request or response body.
    Body(BodyFormat),
}

impl Instruction {
    pub fn kind(&self) -> DirectiveKind {
        match self {
            Instruction::Path(_) => DirectiveKind::Path,
            Instruction::Body(_) => DirectiveKind::Body,
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Instruction::Path(name) => name,
            Instruction::Body(format) => format.as_str(),
        }
    }
}

/// Shape of the field an annotation is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Value(&'static str),
}

impl FieldKind {
    pub fn is_text(&self) -> bool {
        matches!(self, FieldKind::Text)
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKind::Text => write!(f, "String"),
            FieldKind::Value(type_name) => write!(f, "{}", type_name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnnotationError {
    #[error("{directive} tag expected a value (name:{field})")]
    DirectiveMissingValue { field: String, directive: String },

    #[error("tag {keyword} is not supported (name:{field})")]
    UnknownDirective { field: String, keyword: String },

    #[error("path tag can only be used with string (name:{field})")]
    PathRequiresString { field: String },

    #[error("body tag value {format} not supported (name:{field})")]
    UnsupportedBodyFormat { field: String, format: String },
}

impl AnnotationError {
    pub fn field(&self) -> &str {
        match self {
            AnnotationError::DirectiveMissingValue { field, .. }
            | AnnotationError::UnknownDirective { field, .. }
            | AnnotationError::PathRequiresString { field }
            | AnnotationError::UnsupportedBodyFormat { field, .. } => field,
        }
    }
}

/// Parses the annotation attached to `field`.
///
/// Directives are returned in the order they appear. Blank segments are skipped, so an
/// empty annotation yields no instructions. Parsing stops at the first bad directive.
pub fn parse_annotation(
    field: &str,
    kind: FieldKind,
    raw: &str,
) -> Result<Vec<Instruction>, AnnotationError> {
    let mut instructions = Vec::new();

    for segment in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (keyword, value) = match segment.split_once('=') {
            Some((keyword, value)) => (keyword.trim(), value.trim()),
            None => {
                return Err(AnnotationError::DirectiveMissingValue {
                    field: field.to_string(),
                    directive: segment.to_string(),
                })
            }
        };

        let instruction = match keyword {
            "path" => {
                if value.is_empty() {
                    return Err(AnnotationError::DirectiveMissingValue {
                        field: field.to_string(),
                        directive: keyword.to_string(),
                    });
                }
                if !kind.is_text() {
                    return Err(AnnotationError::PathRequiresString {
                        field: field.to_string(),
                    });
                }
                Instruction::Path(value.to_string())
            }
            "body" => match value {
                "" => {
                    return Err(AnnotationError::DirectiveMissingValue {
                        field: field.to_string(),
                        directive: keyword.to_string(),
                    })
                }
                "json" => Instruction::Body(BodyFormat::Json),
                other => {
                    return Err(AnnotationError::UnsupportedBodyFormat {
                        field: field.to_string(),
                        format: other.to_string(),
                    })
                }
            },
            other => {
                return Err(AnnotationError::UnknownDirective {
                    field: field.to_string(),
                    keyword: other.to_string(),
                })
            }
        };

        instructions.push(instruction);
    }

    Ok(instructions)
}
