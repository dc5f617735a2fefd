//! Static signature derivation and the typed encode/decode layer.
//!
//! A type with a statically known single complete type implements
//! [`BusType`]; argument lists are tuples implementing [`ArgList`], whose
//! signature is the concatenation of the per-type signatures.

use std::collections::HashMap;
use std::hash::Hash;

use crate::errors::{Error, Result};
use crate::types::{ObjectPath, Signature, UnixFd};
use crate::value::{Value, Variant};

/// A type with a statically derivable single complete type signature,
/// convertible to and from the dynamic value tree.
pub trait BusType: Sized {
    fn signature() -> Signature;
    fn into_value(self) -> Value;
    fn from_value(value: Value) -> Result<Self>;
}

/// Marker for types usable as dict-entry keys.
pub trait BasicType: BusType {}

macro_rules! impl_bus_type {
    ($(($t:ty, $variant:ident, $code:literal)),+ $(,)?) => {$(
        impl BusType for $t {
            fn signature() -> Signature {
                Signature::from_validated($code.into())
            }

            fn into_value(self) -> Value {
                Value::$variant(self)
            }

            fn from_value(value: Value) -> Result<Self> {
                value.expect($code.as_bytes()[0] as char, |value| match value {
                    Value::$variant(inner) => Ok(inner),
                    other => Err(other),
                })
            }
        }
    )+};
}

impl_bus_type!(
    (u8, Byte, "y"),
    (bool, Bool, "b"),
    (i16, Int16, "n"),
    (u16, Uint16, "q"),
    (i32, Int32, "i"),
    (u32, Uint32, "u"),
    (i64, Int64, "x"),
    (u64, Uint64, "t"),
    (f64, Double, "d"),
    (String, String, "s"),
    (ObjectPath, ObjectPath, "o"),
    (Signature, Signature, "g"),
    (UnixFd, UnixFd, "h"),
);

impl BasicType for u8 {}
impl BasicType for bool {}
impl BasicType for i16 {}
impl BasicType for u16 {}
impl BasicType for i32 {}
impl BasicType for u32 {}
impl BasicType for i64 {}
impl BasicType for u64 {}
impl BasicType for String {}
impl BasicType for ObjectPath {}
impl BasicType for Signature {}

impl BusType for Variant {
    fn signature() -> Signature {
        Signature::from_validated("v".into())
    }

    fn into_value(self) -> Value {
        Value::Variant(Box::new(self.0))
    }

    fn from_value(value: Value) -> Result<Self> {
        value.expect('v', |value| match value {
            Value::Variant(inner) => Ok(Variant(*inner)),
            other => Err(other),
        })
    }
}

impl<T: BusType> BusType for Vec<T> {
    fn signature() -> Signature {
        let mut sig = Signature::from_validated("a".into());
        sig.extend(&T::signature());
        sig
    }

    fn into_value(self) -> Value {
        Value::Array(
            T::signature(),
            self.into_iter().map(BusType::into_value).collect(),
        )
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Array(elem, items) if elem == T::signature() => {
                items.into_iter().map(T::from_value).collect()
            }
            other => Err(Error::TypeMismatch {
                expected: 'a',
                actual: other.type_code(),
            }),
        }
    }
}

impl<K, V> BusType for HashMap<K, V>
where
    K: BasicType + Eq + Hash,
    V: BusType,
{
    fn signature() -> Signature {
        Signature::from_validated(format!("a{{{}{}}}", K::signature(), V::signature()))
    }

    fn into_value(self) -> Value {
        let elem =
            Signature::from_validated(format!("{{{}{}}}", K::signature(), V::signature()));
        let entries = self
            .into_iter()
            .map(|(key, value)| {
                Value::DictEntry(
                    Box::new(key.into_value()),
                    Box::new(value.into_value()),
                )
            })
            .collect();

        Value::Array(elem, entries)
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Array(_, entries) => entries
                .into_iter()
                .map(|entry| match entry {
                    Value::DictEntry(key, value) => {
                        Ok((K::from_value(*key)?, V::from_value(*value)?))
                    }
                    other => Err(Error::TypeMismatch {
                        expected: 'e',
                        actual: other.type_code(),
                    }),
                })
                .collect(),
            other => Err(Error::TypeMismatch {
                expected: 'a',
                actual: other.type_code(),
            }),
        }
    }
}

/// An argument list with a statically derivable signature: the
/// concatenation of the member signatures, in order.
pub trait ArgList: Sized {
    fn signature() -> Signature;
    fn into_values(self) -> Vec<Value>;
    fn from_values(values: Vec<Value>) -> Result<Self>;
}

impl ArgList for () {
    fn signature() -> Signature {
        Signature::empty()
    }

    fn into_values(self) -> Vec<Value> {
        Vec::new()
    }

    fn from_values(values: Vec<Value>) -> Result<Self> {
        if values.is_empty() {
            Ok(())
        } else {
            Err(Error::MalformedMessage("expected an empty body".into()))
        }
    }
}

macro_rules! impl_arg_list {
    ($($($t:ident)+,)+) => {$(
        #[allow(non_snake_case)]
        impl<$($t: BusType),+> ArgList for ($($t,)+) {
            fn signature() -> Signature {
                let mut sig = Signature::empty();
                $(sig.extend(&$t::signature());)+
                sig
            }

            fn into_values(self) -> Vec<Value> {
                let ($($t,)+) = self;
                vec![$($t.into_value()),+]
            }

            fn from_values(values: Vec<Value>) -> Result<Self> {
                let mut iter = values.into_iter();
                let out = ($(
                    match iter.next() {
                        Some(value) => $t::from_value(value)?,
                        None => {
                            return Err(Error::MalformedMessage(
                                "not enough arguments in the body".into(),
                            ))
                        }
                    },
                )+);

                if iter.next().is_some() {
                    return Err(Error::MalformedMessage(
                        "unexpected extra arguments in the body".into(),
                    ));
                }

                Ok(out)
            }
        }
    )+};
}

impl_arg_list!(
    A,
    A B,
    A B C,
    A B C D,
    A B C D E,
    A B C D E F,
    A B C D E F G,
    A B C D E F G H,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuple_signatures_concatenate() {
        assert_eq!(<(u32, String)>::signature().as_str(), "us");
        assert_eq!(
            <(String, HashMap<String, Variant>, Vec<String>)>::signature().as_str(),
            "sa{sv}as"
        );
        assert_eq!(<()>::signature().as_str(), "");
    }

    #[test]
    fn nested_composite_signatures_recurse() {
        assert_eq!(
            <Vec<HashMap<u8, Vec<ObjectPath>>>>::signature().as_str(),
            "aa{yao}"
        );
        assert_eq!(<(Vec<Vec<u64>>,)>::signature().as_str(), "aat");
    }

    #[test]
    fn typed_round_trip_through_values() {
        let input = (42u32, "hello".to_string(), vec![1i32, 2, 3]);
        let values = input.clone().into_values();
        let output = <(u32, String, Vec<i32>)>::from_values(values).unwrap();
        assert_eq!(input, output);
    }

    #[test]
    fn arity_and_type_mismatches() {
        let values = (1u32, 2u32).into_values();
        assert!(matches!(
            <(u32,)>::from_values(values),
            Err(Error::MalformedMessage(_))
        ));

        let values = (1u32,).into_values();
        let err = <(String,)>::from_values(values).unwrap_err();
        assert_eq!(
            err,
            Error::TypeMismatch {
                expected: 's',
                actual: 'u'
            }
        );
    }
}
