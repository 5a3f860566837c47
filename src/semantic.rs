//! Semantic column types and the converters they emit.
//!
//! A semantic type describes the database-side type a column holds, which is
//! separate from (but related to) the in-memory [`Value`] variant it decodes
//! to: the server has many text types, this crate has one `Text` value.
//! Non-primitive types (enums) additionally emit a [`Converter`] once their
//! runtime type OID is discovered.

use std::{fmt::Debug, sync::Arc};

use crate::interface::{DriverError, EnumValue, TypeOid, Value};

/// A single type in the remote database.
pub trait SemanticType: Debug + Send + Sync {
    /// The name the server has assigned this type, e.g. `int4`. Used both for
    /// catalog lookups and as the registration key of any emitted converter.
    fn type_name(&self) -> &str;

    /// Whether this type needs a [`Converter`] resolved against the live
    /// catalog before its values can be decoded.
    fn has_converter(&self) -> bool {
        false
    }

    /// Build the converter for this type once its runtime OID is known.
    ///
    /// Must return `Some` whenever [`SemanticType::has_converter`] is true.
    /// Converter production is deterministic for a given type name.
    fn converter(&self, oid: TypeOid) -> Option<Converter> {
        let _ = oid;
        None
    }
}

/// The `int4` type.
#[derive(Debug, Clone, Copy, Default)]
pub struct Int4Type;

impl SemanticType for Int4Type {
    fn type_name(&self) -> &str {
        "int4"
    }
}

/// The `int8` type.
#[derive(Debug, Clone, Copy, Default)]
pub struct Int8Type;

impl SemanticType for Int8Type {
    fn type_name(&self) -> &str {
        "int8"
    }
}

/// The `float8` type.
#[derive(Debug, Clone, Copy, Default)]
pub struct Float8Type;

impl SemanticType for Float8Type {
    fn type_name(&self) -> &str {
        "float8"
    }
}

/// The `bool` type.
#[derive(Debug, Clone, Copy, Default)]
pub struct BoolType;

impl SemanticType for BoolType {
    fn type_name(&self) -> &str {
        "bool"
    }
}

/// The `text` type.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextType;

impl SemanticType for TextType {
    fn type_name(&self) -> &str {
        "text"
    }
}

/// A user-defined enum type with a fixed label set.
///
/// Values of this type decode to [`Value::Enum`] through the emitted
/// converter; labels outside the declared set are a decode error.
#[derive(Debug, Clone)]
pub struct EnumType {
    type_name: Arc<str>,
    labels: Arc<[String]>,
}

impl EnumType {
    /// Declare an enum type by its server-side name and label set.
    pub fn new<I, S>(type_name: impl Into<Arc<str>>, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            type_name: type_name.into(),
            labels: labels.into_iter().map(Into::into).collect(),
        }
    }

    /// Build a [`Value`] holding the given label, for use as a query
    /// parameter.
    ///
    /// Returns `None` if the label is not part of the declared set.
    pub fn value(&self, label: &str) -> Option<Value> {
        self.labels
            .iter()
            .any(|l| l == label)
            .then(|| Value::Enum(EnumValue::new(&*self.type_name, label)))
    }
}

impl SemanticType for EnumType {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn has_converter(&self) -> bool {
        true
    }

    fn converter(&self, oid: TypeOid) -> Option<Converter> {
        let type_name = Arc::clone(&self.type_name);
        let labels = Arc::clone(&self.labels);
        Some(Converter::new(
            Arc::clone(&self.type_name),
            oid,
            move |raw| {
                if !labels.iter().any(|l| l == raw) {
                    return Err(DriverError::Decode {
                        type_name: type_name.to_string(),
                        message: format!("unknown enum label {raw:?}"),
                    });
                }
                Ok(Value::Enum(EnumValue::new(&*type_name, raw)))
            },
        ))
    }
}

type DecodeFn = Arc<dyn Fn(&str) -> Result<Value, DriverError> + Send + Sync>;

/// A value transformer decoding a raw wire-format value into its in-memory
/// representation, keyed by the runtime type OID it was built for.
#[derive(Clone)]
pub struct Converter {
    type_name: Arc<str>,
    oid: TypeOid,
    decode: DecodeFn,
}

impl Converter {
    /// Build a converter for the named type at the discovered OID.
    pub fn new(
        type_name: impl Into<Arc<str>>,
        oid: TypeOid,
        decode: impl Fn(&str) -> Result<Value, DriverError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            oid,
            decode: Arc::new(decode),
        }
    }

    /// The semantic-type name this converter is registered under.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The runtime type OID this converter applies to.
    pub fn oid(&self) -> TypeOid {
        self.oid
    }

    /// Decode one raw wire value.
    pub fn decode(&self, raw: &str) -> Result<Value, DriverError> {
        (self.decode)(raw)
    }
}

impl Debug for Converter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Converter")
            .field("type_name", &self.type_name)
            .field("oid", &self.oid)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn primitive_type_names() {
        assert_eq!(Int4Type.type_name(), "int4");
        assert_eq!(TextType.type_name(), "text");
        assert!(!Int4Type.has_converter());
        assert!(Int4Type.converter(TypeOid::new(23)).is_none());
    }

    #[test]
    fn enum_converter_decodes_known_labels() {
        let ty = EnumType::new("example_enum", ["ONE", "TWO"]);
        assert!(ty.has_converter());

        let converter = ty.converter(TypeOid::new(16384)).unwrap();
        assert_eq!(converter.type_name(), "example_enum");
        assert_eq!(converter.oid(), TypeOid::new(16384));

        assert_eq!(
            converter.decode("ONE").unwrap(),
            Value::Enum(EnumValue::new("example_enum", "ONE"))
        );
    }

    #[test]
    fn enum_converter_rejects_unknown_labels() {
        let ty = EnumType::new("example_enum", ["ONE", "TWO"]);
        let converter = ty.converter(TypeOid::new(16384)).unwrap();

        assert_matches!(
            converter.decode("THREE"),
            Err(DriverError::Decode { type_name, .. }) => {
                assert_eq!(type_name, "example_enum");
            }
        );
    }

    #[test]
    fn enum_parameter_values() {
        let ty = EnumType::new("example_enum", ["ONE", "TWO"]);
        assert_eq!(
            ty.value("ONE"),
            Some(Value::Enum(EnumValue::new("example_enum", "ONE")))
        );
        assert_eq!(ty.value("THREE"), None);
    }

    #[test]
    fn round_trips_written_label() {
        // A label written as a parameter and decoded back through the
        // converter compares equal.
        let ty = EnumType::new("example_enum", ["ONE", "TWO"]);
        let written = ty.value("TWO").unwrap();

        let converter = ty.converter(TypeOid::new(16385)).unwrap();
        let read = converter
            .decode(written.as_enum().unwrap().label())
            .unwrap();
        assert_eq!(read, written);
    }
}
