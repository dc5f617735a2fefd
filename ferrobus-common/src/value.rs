//! Dynamically typed argument values: the sum over the protocol's complete
//! types. Every inbound message body decodes into these; typed access goes
//! through [`crate::arg::BusType`].

use crate::errors::{Error, Result};
use crate::types::{ObjectPath, Signature, UnixFd};

/// One argument value. Containers carry the signatures they were declared
/// with so empty arrays keep their element type.
#[derive(Debug, PartialEq)]
pub enum Value {
    Byte(u8),
    Bool(bool),
    Int16(i16),
    Uint16(u16),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Double(f64),
    String(String),
    ObjectPath(ObjectPath),
    Signature(Signature),
    UnixFd(UnixFd),
    /// Element signature plus elements. Dict contents are arrays of
    /// [`Value::DictEntry`] with a `{..}` element signature.
    Array(Signature, Vec<Value>),
    Struct(Vec<Value>),
    DictEntry(Box<Value>, Box<Value>),
    Variant(Box<Value>),
}

impl Value {
    /// The type code answered by a reader peek.
    pub fn type_code(&self) -> char {
        match self {
            Value::Byte(_) => 'y',
            Value::Bool(_) => 'b',
            Value::Int16(_) => 'n',
            Value::Uint16(_) => 'q',
            Value::Int32(_) => 'i',
            Value::Uint32(_) => 'u',
            Value::Int64(_) => 'x',
            Value::Uint64(_) => 't',
            Value::Double(_) => 'd',
            Value::String(_) => 's',
            Value::ObjectPath(_) => 'o',
            Value::Signature(_) => 'g',
            Value::UnixFd(_) => 'h',
            Value::Array(..) => 'a',
            Value::Struct(_) => 'r',
            Value::DictEntry(..) => 'e',
            Value::Variant(_) => 'v',
        }
    }

    /// The full signature of this value as a single complete type.
    pub fn signature(&self) -> Signature {
        let mut out = String::new();
        self.write_signature(&mut out);
        Signature::from_validated(out)
    }

    fn write_signature(&self, out: &mut String) {
        match self {
            Value::Array(elem, _) => {
                out.push('a');
                out.push_str(elem.as_str());
            }
            Value::Struct(fields) => {
                out.push('(');
                for field in fields {
                    field.write_signature(out);
                }
                out.push(')');
            }
            Value::DictEntry(key, value) => {
                out.push('{');
                key.write_signature(out);
                value.write_signature(out);
                out.push('}');
            }
            Value::Variant(_) => out.push('v'),
            other => out.push(other.type_code()),
        }
    }

    /// Unwrap one level of variant; other values pass through unchanged.
    pub fn into_variant_inner(self) -> Value {
        match self {
            Value::Variant(inner) => *inner,
            other => other,
        }
    }

    /// Duplicate the value. Descriptors are duplicated with `dup`, so each
    /// copy owns its own descriptor; a drained descriptor slot fails.
    pub fn try_clone(&self) -> Result<Value> {
        Ok(match self {
            Value::Byte(v) => Value::Byte(*v),
            Value::Bool(v) => Value::Bool(*v),
            Value::Int16(v) => Value::Int16(*v),
            Value::Uint16(v) => Value::Uint16(*v),
            Value::Int32(v) => Value::Int32(*v),
            Value::Uint32(v) => Value::Uint32(*v),
            Value::Int64(v) => Value::Int64(*v),
            Value::Uint64(v) => Value::Uint64(*v),
            Value::Double(v) => Value::Double(*v),
            Value::String(v) => Value::String(v.clone()),
            Value::ObjectPath(v) => Value::ObjectPath(v.clone()),
            Value::Signature(v) => Value::Signature(v.clone()),
            Value::UnixFd(v) => Value::UnixFd(v.try_clone()?),
            Value::Array(elem, items) => Value::Array(
                elem.clone(),
                items
                    .iter()
                    .map(Value::try_clone)
                    .collect::<Result<Vec<_>>>()?,
            ),
            Value::Struct(fields) => Value::Struct(
                fields
                    .iter()
                    .map(Value::try_clone)
                    .collect::<Result<Vec<_>>>()?,
            ),
            Value::DictEntry(key, value) => {
                Value::DictEntry(Box::new(key.try_clone()?), Box::new(value.try_clone()?))
            }
            Value::Variant(inner) => Value::Variant(Box::new(inner.try_clone()?)),
        })
    }

    pub(crate) fn expect<T>(
        self,
        expected: char,
        extract: impl FnOnce(Value) -> std::result::Result<T, Value>,
    ) -> Result<T> {
        let actual = self.type_code();
        extract(self).map_err(|_| Error::TypeMismatch { expected, actual })
    }
}

/// A typed handle on a dynamically tagged value: what `v` in a signature
/// decodes into when accessed through the typed layer.
#[derive(Debug, PartialEq)]
pub struct Variant(pub Value);

impl Variant {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn into_inner(self) -> Value {
        self.0
    }
}
