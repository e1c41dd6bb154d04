use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::{self, Display};
use std::rc::Rc;
use std::sync::Arc;
use thiserror::Error;
use validator::{Validate, ValidationErrors};

use crate::error::{cause_of, Fault, IntoFault, SEND_JSON_VALIDATION_MESSAGE};

#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("failed to validate struct at {location}: {cause}")]
    Constraint {
        location: String,
        #[source]
        cause: ValidationErrors,
    },

    #[error("validation depth limit of {limit} exceeded at {location}")]
    DepthExceeded { location: String, limit: usize },
}

impl ValidationError {
    pub const NAME: &'static str = "validation_error";

    /// Where in the value the failure was found, e.g. `$[2]["key"]`.
    pub fn location(&self) -> &str {
        match self {
            ValidationError::Constraint { location, .. }
            | ValidationError::DepthExceeded { location, .. } => location,
        }
    }
}

/// Response-shape violations are our fault, never the client's.
impl IntoFault for ValidationError {
    fn into_fault(self) -> Fault {
        Fault::internal(SEND_JSON_VALIDATION_MESSAGE).with_cause(cause_of(Self::NAME, &self))
    }
}

/// Walks arbitrarily nested values and applies struct constraints wherever a record is
/// found, stopping at the first violation.
///
/// Constraints come from `validator::Validate`. The validator owns no cache, so one
/// instance is built at startup and handed to whatever needs it.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecursiveValidator {
    max_depth: Option<usize>,
}

impl RecursiveValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects values nested deeper than `max_depth` containers.
    pub fn with_max_depth(max_depth: usize) -> Self {
        Self {
            max_depth: Some(max_depth),
        }
    }

    pub fn max_depth(&self) -> Option<usize> {
        self.max_depth
    }

    pub fn validate<T: Traverse + ?Sized>(&self, value: &T) -> Result<(), ValidationError> {
        let mut walker = Walker {
            max_depth: self.max_depth,
            path: Vec::new(),
        };
        value.traverse(&mut walker)
    }
}

#[derive(Debug, Clone)]
enum Segment {
    Index(usize),
    Key(String),
}

/// Traversal cursor handed to [`Traverse`] implementations.
pub struct Walker {
    max_depth: Option<usize>,
    path: Vec<Segment>,
}

impl Walker {
    /// Applies the declared constraints of a struct.
    pub fn record<T: Validate + ?Sized>(&mut self, value: &T) -> Result<(), ValidationError> {
        value
            .validate()
            .map_err(|cause| ValidationError::Constraint {
                location: self.location(),
                cause,
            })
    }

    /// Visits the element at `index` of a sequence.
    pub fn index<T: Traverse + ?Sized>(
        &mut self,
        index: usize,
        item: &T,
    ) -> Result<(), ValidationError> {
        self.descend(Segment::Index(index), item)
    }

    /// Visits the value stored under `key` in a map.
    pub fn key<T: Traverse + ?Sized>(
        &mut self,
        key: &dyn Display,
        item: &T,
    ) -> Result<(), ValidationError> {
        self.descend(Segment::Key(key.to_string()), item)
    }

    fn descend<T: Traverse + ?Sized>(
        &mut self,
        segment: Segment,
        item: &T,
    ) -> Result<(), ValidationError> {
        self.path.push(segment);
        if let Some(limit) = self.max_depth {
            if self.path.len() > limit {
                let err = ValidationError::DepthExceeded {
                    location: self.location(),
                    limit,
                };
                self.path.pop();
                return Err(err);
            }
        }
        let result = item.traverse(self);
        self.path.pop();
        result
    }

    fn location(&self) -> String {
        let mut location = String::from("$");
        for segment in &self.path {
            match segment {
                Segment::Index(index) => location.push_str(&format!("[{}]", index)),
                Segment::Key(key) => location.push_str(&format!("[{:?}]", key)),
            }
        }
        location
    }
}

impl fmt::Debug for Walker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Walker")
            .field("location", &self.location())
            .finish()
    }
}

/// A value the recursive validator knows how to walk.
///
/// Containers recurse into their contents, scalars are always valid, and structs opt in
/// with [`traverse_record!`](crate::traverse_record) so their `Validate` constraints run.
pub trait Traverse {
    fn traverse(&self, walker: &mut Walker) -> Result<(), ValidationError>;
}

/// Implements [`Traverse`] for structs that derive `validator::Validate`.
#[macro_export]
macro_rules! traverse_record {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl $crate::validation::Traverse for $ty {
                fn traverse(
                    &self,
                    walker: &mut $crate::validation::Walker,
                ) -> ::std::result::Result<(), $crate::validation::ValidationError> {
                    walker.record(self)
                }
            }
        )+
    };
}

macro_rules! traverse_scalar {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl Traverse for $ty {
                fn traverse(&self, _walker: &mut Walker) -> Result<(), ValidationError> {
                    Ok(())
                }
            }
        )+
    };
}

traverse_scalar!(
    (),
    bool,
    char,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    f32,
    f64,
    str,
    String,
    serde_json::Value,
);

impl<T: Traverse + ?Sized> Traverse for &T {
    fn traverse(&self, walker: &mut Walker) -> Result<(), ValidationError> {
        (**self).traverse(walker)
    }
}

impl<T: Traverse + ?Sized> Traverse for Box<T> {
    fn traverse(&self, walker: &mut Walker) -> Result<(), ValidationError> {
        (**self).traverse(walker)
    }
}

impl<T: Traverse + ?Sized> Traverse for Rc<T> {
    fn traverse(&self, walker: &mut Walker) -> Result<(), ValidationError> {
        (**self).traverse(walker)
    }
}

impl<T: Traverse + ?Sized> Traverse for Arc<T> {
    fn traverse(&self, walker: &mut Walker) -> Result<(), ValidationError> {
        (**self).traverse(walker)
    }
}

/// An absent optional value is valid.
impl<T: Traverse> Traverse for Option<T> {
    fn traverse(&self, walker: &mut Walker) -> Result<(), ValidationError> {
        match self {
            Some(inner) => inner.traverse(walker),
            None => Ok(()),
        }
    }
}

impl<T: Traverse> Traverse for [T] {
    fn traverse(&self, walker: &mut Walker) -> Result<(), ValidationError> {
        for (index, item) in self.iter().enumerate() {
            walker.index(index, item)?;
        }
        Ok(())
    }
}

impl<T: Traverse, const N: usize> Traverse for [T; N] {
    fn traverse(&self, walker: &mut Walker) -> Result<(), ValidationError> {
        self.as_slice().traverse(walker)
    }
}

impl<T: Traverse> Traverse for Vec<T> {
    fn traverse(&self, walker: &mut Walker) -> Result<(), ValidationError> {
        self.as_slice().traverse(walker)
    }
}

impl<T: Traverse> Traverse for VecDeque<T> {
    fn traverse(&self, walker: &mut Walker) -> Result<(), ValidationError> {
        for (index, item) in self.iter().enumerate() {
            walker.index(index, item)?;
        }
        Ok(())
    }
}

impl<K: Display, V: Traverse> Traverse for BTreeMap<K, V> {
    fn traverse(&self, walker: &mut Walker) -> Result<(), ValidationError> {
        for (key, value) in self {
            walker.key(key, value)?;
        }
        Ok(())
    }
}

/// Values are visited in key order so the reported failure is stable across runs.
impl<K: Display + Ord, V: Traverse, H> Traverse for HashMap<K, V, H> {
    fn traverse(&self, walker: &mut Walker) -> Result<(), ValidationError> {
        let mut entries: Vec<(&K, &V)> = self.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        for (key, value) in entries {
            walker.key(key, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Debug, Clone, Serialize, Validate)]
    struct Item {
        #[validate(length(min = 1))]
        name: String,
    }

    #[derive(Debug, Clone, Serialize, Validate)]
    struct Wrapper {
        #[validate(nested)]
        inner: Item,
        #[validate(range(min = 1, max = 10))]
        count: u32,
    }

    traverse_record!(Item, Wrapper);

    fn item(name: &str) -> Item {
        Item {
            name: name.to_string(),
        }
    }

    #[test]
    fn test_struct() {
        let validator = RecursiveValidator::new();
        assert!(validator.validate(&item("test")).is_ok());
        assert!(validator.validate(&item("")).is_err());
    }

    #[test]
    fn test_pointer_like() {
        let validator = RecursiveValidator::new();
        assert!(validator.validate(&Box::new(item("test"))).is_ok());
        assert!(validator.validate(&Arc::new(item(""))).is_err());
        assert!(validator.validate(&None::<Item>).is_ok());
        assert!(validator.validate(&Some(item(""))).is_err());
    }

    #[test]
    fn test_empty_containers_are_valid() {
        let validator = RecursiveValidator::new();
        assert!(validator.validate(&Vec::<Item>::new()).is_ok());
        assert!(validator.validate(&HashMap::<String, Item>::new()).is_ok());
        assert!(validator.validate(&None::<Vec<Item>>).is_ok());
    }

    #[test]
    fn test_scalars_are_valid() {
        let validator = RecursiveValidator::new();
        assert!(validator.validate(&42u32).is_ok());
        assert!(validator.validate("").is_ok());
        assert!(validator.validate(&vec![String::new()]).is_ok());
    }

    #[test]
    fn test_first_invalid_element_is_reported() {
        let validator = RecursiveValidator::new();
        for n in [3usize, 5, 20] {
            for k in 0..n {
                let mut items: Vec<Item> = (0..n).map(|_| item("ok")).collect();
                for later in items.iter_mut().skip(k) {
                    later.name.clear();
                }
                let err = validator.validate(&items).unwrap_err();
                assert_eq!(err.location(), format!("$[{}]", k));
            }
        }
    }

    #[test]
    fn test_map_order_is_deterministic() {
        let validator = RecursiveValidator::new();
        let mut map = HashMap::new();
        map.insert("zeta".to_string(), item(""));
        map.insert("alpha".to_string(), item(""));
        map.insert("mid".to_string(), item("ok"));

        for _ in 0..10 {
            let err = validator.validate(&map).unwrap_err();
            assert_eq!(err.location(), "$[\"alpha\"]");
        }
    }

    #[test]
    fn test_nested_containers() {
        let validator = RecursiveValidator::new();
        let mut map = BTreeMap::new();
        map.insert(1u32, vec![Some(item("a")), None, Some(item(""))]);

        let err = validator.validate(&Some(Box::new(map))).unwrap_err();
        assert_eq!(err.location(), "$[\"1\"][2]");
    }

    #[test]
    fn test_nested_struct_constraints() {
        let validator = RecursiveValidator::new();
        let valid = Wrapper {
            inner: item("x"),
            count: 3,
        };
        let invalid_inner = Wrapper {
            inner: item(""),
            count: 3,
        };
        let invalid_count = Wrapper {
            inner: item("x"),
            count: 0,
        };

        assert!(validator.validate(&valid).is_ok());
        assert!(validator.validate(&invalid_inner).is_err());
        assert!(validator.validate(&[valid, invalid_count]).is_err());
    }

    #[test]
    fn test_depth_limit() {
        let validator = RecursiveValidator::with_max_depth(1);
        let nested = vec![vec![item("ok")]];

        let err = validator.validate(&nested).unwrap_err();
        assert!(matches!(err, ValidationError::DepthExceeded { limit: 1, .. }));
        assert!(validator.validate(&vec![item("ok")]).is_ok());
    }

    #[test]
    fn test_validation_error_becomes_internal_fault() {
        let err = RecursiveValidator::new().validate(&item("")).unwrap_err();
        let fault = err.into_fault();

        assert_eq!(fault.status_code, 500);
        assert_eq!(fault.message, SEND_JSON_VALIDATION_MESSAGE);
        assert_eq!(fault.cause.unwrap()["name"], "validation_error");
    }
}
