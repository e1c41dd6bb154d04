//! Schema descriptors.
//!
//! A schema is a plain struct whose bound fields are listed once through [`Schema::fields`].
//! The listing is turned into a [`SchemaDescriptor`] when the schema is registered, which
//! is where malformed annotations are rejected.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

use crate::annotation::{parse_annotation, AnnotationError, BodyFormat, FieldKind, Instruction};
use crate::error::{cause_of, Fault, FaultClass, IntoFault, GENERIC_ERROR_MESSAGE};
use crate::validation::{RecursiveValidator, Traverse, ValidationError};

type EncodeFn<S> = Box<dyn Fn(&S, BodyFormat) -> Result<Vec<u8>, serde_json::Error> + Send + Sync>;
type DecodeFn<S> = Box<dyn Fn(&mut S, BodyFormat, &[u8]) -> Result<(), serde_json::Error> + Send + Sync>;
type ValidateFn<S> = Box<dyn Fn(&S, &RecursiveValidator) -> Result<(), ValidationError> + Send + Sync>;

/// A struct that can be bound from and to requests.
///
/// ```ignore
/// #[derive(Default)]
/// struct PatchUser {
///     name: String,
///     body: UserPatch,
/// }
///
/// impl Schema for PatchUser {
///     fn fields() -> Fields<Self> {
///         Fields::<Self>::new()
///             .text("name", "path=name", |s| &s.name, |s| &mut s.name)
///             .value("body", "body=json", |s| &s.body, |s| &mut s.body)
///     }
/// }
/// ```
pub trait Schema: Default + Send + Sync + 'static {
    fn fields() -> Fields<Self>;
}

pub(crate) enum Access<S> {
    Text {
        get: fn(&S) -> &String,
        get_mut: fn(&mut S) -> &mut String,
    },
    Value {
        encode: EncodeFn<S>,
        decode: DecodeFn<S>,
        validate: ValidateFn<S>,
    },
}

/// One declared field, before its annotation has been checked.
pub struct FieldDef<S> {
    pub(crate) name: &'static str,
    pub(crate) annotation: &'static str,
    pub(crate) kind: FieldKind,
    pub(crate) access: Access<S>,
}

/// Builder listing the bound fields of a schema in declaration order.
pub struct Fields<S> {
    defs: Vec<FieldDef<S>>,
}

impl<S> Default for Fields<S> {
    fn default() -> Self {
        Self { defs: Vec::new() }
    }
}

impl<S: 'static> Fields<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a `String` field.
    pub fn text(
        mut self,
        name: &'static str,
        annotation: &'static str,
        get: fn(&S) -> &String,
        get_mut: fn(&mut S) -> &mut String,
    ) -> Self {
        self.defs.push(FieldDef {
            name,
            annotation,
            kind: FieldKind::Text,
            access: Access::Text { get, get_mut },
        });
        self
    }

    /// Declares a field of any serializable type.
    pub fn value<T>(
        mut self,
        name: &'static str,
        annotation: &'static str,
        get: fn(&S) -> &T,
        get_mut: fn(&mut S) -> &mut T,
    ) -> Self
    where
        T: Serialize + DeserializeOwned + Traverse + 'static,
    {
        let encode: EncodeFn<S> = Box::new(move |schema: &S, format: BodyFormat| match format {
            BodyFormat::Json => serde_json::to_vec(get(schema)),
        });
        let decode: DecodeFn<S> = Box::new(move |schema: &mut S, format: BodyFormat, bytes: &[u8]| match format {
            BodyFormat::Json => {
                *get_mut(schema) = serde_json::from_slice(bytes)?;
                Ok(())
            }
        });
        let validate: ValidateFn<S> =
            Box::new(move |schema: &S, validator: &RecursiveValidator| validator.validate(get(schema)));

        self.defs.push(FieldDef {
            name,
            annotation,
            kind: FieldKind::Value(std::any::type_name::<T>()),
            access: Access::Value {
                encode,
                decode,
                validate,
            },
        });
        self
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("invalid annotation on {schema}: {source}")]
    Annotation {
        schema: &'static str,
        #[source]
        source: AnnotationError,
    },

    #[error("{schema} declares more than one body field ({first}, {second})")]
    MultipleBodyFields {
        schema: &'static str,
        first: &'static str,
        second: &'static str,
    },
}

impl SchemaError {
    pub const NAME: &'static str = "schema_definition_error";
}

impl IntoFault for SchemaError {
    fn into_fault(self) -> Fault {
        Fault::of_class(FaultClass::SchemaDefinition, GENERIC_ERROR_MESSAGE)
            .with_cause(cause_of(Self::NAME, &self))
    }
}

/// A field whose annotation has been parsed.
pub struct BoundField<S> {
    pub name: &'static str,
    pub kind: FieldKind,
    pub instructions: Vec<Instruction>,
    pub(crate) access: Access<S>,
}

impl<S> BoundField<S> {
    pub fn path_names(&self) -> impl Iterator<Item = &str> {
        self.instructions.iter().filter_map(|i| match i {
            Instruction::Path(name) => Some(name.as_str()),
            Instruction::Body(_) => None,
        })
    }

    pub fn body_format(&self) -> Option<BodyFormat> {
        self.instructions.iter().find_map(|i| match i {
            Instruction::Body(format) => Some(*format),
            Instruction::Path(_) => None,
        })
    }
}

/// Parsed, checked description of a schema, built once per type.
pub struct SchemaDescriptor<S> {
    name: &'static str,
    fields: Vec<BoundField<S>>,
    body_field: Option<usize>,
}

impl<S: Schema> SchemaDescriptor<S> {
    pub fn build() -> Result<Self, SchemaError> {
        let name = std::any::type_name::<S>();
        let mut fields = Vec::new();
        let mut body_field: Option<usize> = None;

        for def in S::fields().defs {
            let instructions = parse_annotation(def.name, def.kind, def.annotation)
                .map_err(|source| SchemaError::Annotation {
                    schema: name,
                    source,
                })?;

            let field = BoundField {
                name: def.name,
                kind: def.kind,
                instructions,
                access: def.access,
            };

            if field.body_format().is_some() {
                if let Some(first) = body_field {
                    let first: &BoundField<S> = &fields[first];
                    return Err(SchemaError::MultipleBodyFields {
                        schema: name,
                        first: first.name,
                        second: field.name,
                    });
                }
                body_field = Some(fields.len());
            }

            fields.push(field);
        }

        Ok(Self {
            name,
            fields,
            body_field,
        })
    }
}

impl<S> SchemaDescriptor<S> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn fields(&self) -> &[BoundField<S>] {
        &self.fields
    }

    pub fn body_field(&self) -> Option<&BoundField<S>> {
        self.body_field.map(|index| &self.fields[index])
    }
}

/// Descriptor cache keyed by schema type.
#[derive(Clone, Default)]
pub struct SchemaRegistry {
    descriptors: Arc<RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached descriptor for `S`, building it on first use.
    pub fn descriptor<S: Schema>(&self) -> Result<Arc<SchemaDescriptor<S>>, SchemaError> {
        if let Some(found) = self.lookup::<S>() {
            return Ok(found);
        }

        let built = Arc::new(SchemaDescriptor::<S>::build()?);
        if let Ok(mut descriptors) = self.descriptors.write() {
            let entry = descriptors
                .entry(TypeId::of::<S>())
                .or_insert_with(|| built.clone() as Arc<dyn Any + Send + Sync>);
            if let Ok(existing) = entry.clone().downcast::<SchemaDescriptor<S>>() {
                return Ok(existing);
            }
        }
        Ok(built)
    }

    pub fn contains<S: Schema>(&self) -> bool {
        self.lookup::<S>().is_some()
    }

    pub fn len(&self) -> usize {
        self.descriptors.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup<S: Schema>(&self) -> Option<Arc<SchemaDescriptor<S>>> {
        let descriptors = self.descriptors.read().ok()?;
        descriptors
            .get(&TypeId::of::<S>())
            .cloned()
            .and_then(|any| any.downcast::<SchemaDescriptor<S>>().ok())
    }
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("schemas", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct GetUser {
        id: String,
        body: Vec<u32>,
    }

    impl Schema for GetUser {
        fn fields() -> Fields<Self> {
            Fields::<Self>::new()
                .text("id", "path=id", |s| &s.id, |s| &mut s.id)
                .value("body", "body=json", |s| &s.body, |s| &mut s.body)
        }
    }

    #[derive(Debug, Default)]
    struct TwoBodies {
        a: String,
        b: String,
    }

    impl Schema for TwoBodies {
        fn fields() -> Fields<Self> {
            Fields::<Self>::new()
                .text("a", "body=json", |s| &s.a, |s| &mut s.a)
                .text("b", "body=json", |s| &s.b, |s| &mut s.b)
        }
    }

    #[derive(Debug, Default)]
    struct NumericPath {
        id: u64,
    }

    impl Schema for NumericPath {
        fn fields() -> Fields<Self> {
            Fields::<Self>::new().value("id", "path=id", |s| &s.id, |s| &mut s.id)
        }
    }

    #[test]
    fn test_build_descriptor() {
        let descriptor = SchemaDescriptor::<GetUser>::build().unwrap();
        assert_eq!(descriptor.fields().len(), 2);
        assert_eq!(descriptor.fields()[0].path_names().collect::<Vec<_>>(), vec!["id"]);
        assert_eq!(descriptor.body_field().unwrap().name, "body");
        assert_eq!(
            descriptor.body_field().unwrap().body_format(),
            Some(BodyFormat::Json)
        );
    }

    #[test]
    fn test_multiple_body_fields_rejected() {
        let err = SchemaDescriptor::<TwoBodies>::build().err().unwrap();
        assert!(matches!(
            err,
            SchemaError::MultipleBodyFields {
                first: "a",
                second: "b",
                ..
            }
        ));
    }

    #[test]
    fn test_path_on_non_string_rejected() {
        let err = SchemaDescriptor::<NumericPath>::build().err().unwrap();
        assert!(matches!(
            err,
            SchemaError::Annotation {
                source: AnnotationError::PathRequiresString { .. },
                ..
            }
        ));
        assert_eq!(err.into_fault().class, crate::error::FaultClass::SchemaDefinition);
    }

    #[test]
    fn test_registry_caches_descriptor() {
        let registry = SchemaRegistry::new();
        assert!(!registry.contains::<GetUser>());

        let first = registry.descriptor::<GetUser>().unwrap();
        let second = registry.descriptor::<GetUser>().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert!(registry.descriptor::<TwoBodies>().is_err());
        assert_eq!(registry.len(), 1);
    }
}
