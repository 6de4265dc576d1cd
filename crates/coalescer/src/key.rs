//! Derivation of invocation keys from call arguments.
//!
//! Arguments are passed to a [`Coalescer`](crate::Coalescer) as a tuple that implements
//! [`Serialize`]. The default key is the compact JSON text of that tuple, produced by a
//! dedicated serializer with two properties that plain `serde_json::to_string` lacks:
//!
//! - Map keys are sorted, so the iteration order of a `HashMap` argument never changes the key.
//! - Nesting is bounded. A value that refers to itself would otherwise recurse until the stack
//!   overflows; here it fails with [`KeyError::TooDeep`] instead.
//!
//! The tuple is treated as a list of positional arguments: `("a", 1)` becomes `["a",1]` and `()`
//! becomes `[]`. A value that does not serialize as a sequence is treated as a single argument.
//!
//! Whenever a key cannot be derived, a unique [fallback key](fallback_key) is used instead, so
//! the call runs on its own and is never mixed up with an unrelated one.

use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde::ser::{self, Impossible};
use serde_json::{Map, Number, Value};
use thiserror::Error;

use crate::error::panic_message;

/// The reason why arguments could not be turned into a structural key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    /// The arguments are nested deeper than the configured limit, which includes cycles.
    #[error("arguments are nested deeper than {0} levels")]
    TooDeep(usize),
    /// A map inside the arguments uses keys that have no string representation.
    #[error("unsupported map key: {0}")]
    UnsupportedMapKey(&'static str),
    /// An integer argument does not fit into 64 bits.
    #[error("integer out of range: {0}")]
    IntegerOutOfRange(String),
    /// A [`Serialize`] implementation reported an error.
    #[error("{0}")]
    Custom(String),
}

impl ser::Error for KeyError {
    fn custom<T: Display>(msg: T) -> Self {
        Self::Custom(msg.to_string())
    }
}

/// Serializes call arguments into a stable key.
///
/// With `key_fields`, only the arguments at those positions contribute to the key, in the order
/// given. Positions past the end of the argument list contribute `null`. Arguments that are not
/// selected are never serialized, so they cannot make key derivation fail.
pub fn structural_key<A>(
    args: &A,
    key_fields: Option<&[usize]>,
    max_depth: usize,
) -> Result<String, KeyError>
where
    A: Serialize + ?Sized,
{
    let serializer = KeySerializer {
        depth: 0,
        max_depth,
        select: key_fields,
    };
    let arguments = match args.serialize(serializer)? {
        // sequences at the top level already applied the selection
        Value::Array(arguments) => arguments,
        single => select_arguments(vec![Some(single)], key_fields),
    };
    Ok(Value::Array(arguments).to_string())
}

/// Creates a key that is unique within this process.
///
/// It combines the current wall-clock time in nanoseconds with a sequence number, as two calls
/// can observe the same clock reading.
pub fn fallback_key() -> String {
    static SEQUENCE: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("@fallback:{nanos}:{sequence}")
}

/// A caller-supplied function that derives the key for a call.
pub(crate) type KeyGenerator<A> = dyn Fn(&A) -> anyhow::Result<String> + Send + Sync;

/// A key derived for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InvocationKey {
    pub key: String,
    /// Whether derivation failed and `key` is a unique fallback key.
    pub fallback: bool,
}

impl InvocationKey {
    fn derived(key: String) -> Self {
        Self {
            key,
            fallback: false,
        }
    }

    fn fallback() -> Self {
        Self {
            key: fallback_key(),
            fallback: true,
        }
    }
}

/// Derives invocation keys according to the configured strategy.
pub(crate) struct KeyDeriver<A> {
    pub generator: Option<Box<KeyGenerator<A>>>,
    pub key_fields: Option<Vec<usize>>,
    pub max_depth: usize,
}

impl<A: Serialize> KeyDeriver<A> {
    /// Derives the key for `args`.
    ///
    /// A configured generator takes precedence over structural serialization. If the generator
    /// fails, the fallback key is used right away, without trying serialization.
    pub fn derive(&self, args: &A) -> InvocationKey {
        if let Some(generator) = &self.generator {
            return match panic::catch_unwind(AssertUnwindSafe(|| generator(args))) {
                Ok(Ok(key)) => InvocationKey::derived(key),
                Ok(Err(err)) => {
                    tracing::debug!(error = %err, "Key generator failed, using a fallback key");
                    InvocationKey::fallback()
                }
                Err(payload) => {
                    tracing::warn!(
                        panic = panic_message(&*payload),
                        "Key generator panicked, using a fallback key"
                    );
                    InvocationKey::fallback()
                }
            };
        }

        let key_fields = self.key_fields.as_deref();
        let serialized = panic::catch_unwind(AssertUnwindSafe(|| {
            structural_key(args, key_fields, self.max_depth)
        }));
        match serialized {
            Ok(Ok(key)) => InvocationKey::derived(key),
            Ok(Err(err)) => {
                tracing::debug!(
                    error = &err as &dyn std::error::Error,
                    "Arguments cannot be serialized, using a fallback key"
                );
                InvocationKey::fallback()
            }
            Err(payload) => {
                tracing::warn!(
                    panic = panic_message(&*payload),
                    "Serializing arguments panicked, using a fallback key"
                );
                InvocationKey::fallback()
            }
        }
    }
}

/// Picks the selected positions out of a list of (possibly skipped) arguments.
fn select_arguments(arguments: Vec<Option<Value>>, select: Option<&[usize]>) -> Vec<Value> {
    match select {
        Some(fields) => fields
            .iter()
            .map(|&position| {
                arguments
                    .get(position)
                    .cloned()
                    .flatten()
                    .unwrap_or(Value::Null)
            })
            .collect(),
        None => arguments
            .into_iter()
            .map(|argument| argument.unwrap_or(Value::Null))
            .collect(),
    }
}

#[derive(Clone, Copy)]
struct KeySerializer<'a> {
    depth: usize,
    max_depth: usize,
    /// Argument positions to keep. Only set for the top-level argument list.
    select: Option<&'a [usize]>,
}

impl<'a> KeySerializer<'a> {
    /// Returns the serializer for the contents of a container one level down.
    fn nested(self) -> Result<KeySerializer<'a>, KeyError> {
        if self.depth >= self.max_depth {
            return Err(KeyError::TooDeep(self.max_depth));
        }
        Ok(KeySerializer {
            depth: self.depth + 1,
            max_depth: self.max_depth,
            select: None,
        })
    }

    fn is_root(&self) -> bool {
        self.depth == 0
    }
}

impl<'a> ser::Serializer for KeySerializer<'a> {
    type Ok = Value;
    type Error = KeyError;

    type SerializeSeq = SerializeVec<'a>;
    type SerializeTuple = SerializeVec<'a>;
    type SerializeTupleStruct = SerializeVec<'a>;
    type SerializeTupleVariant = SerializeTupleVariant<'a>;
    type SerializeMap = SerializeMap<'a>;
    type SerializeStruct = SerializeMap<'a>;
    type SerializeStructVariant = SerializeStructVariant<'a>;

    fn serialize_bool(self, v: bool) -> Result<Value, KeyError> {
        Ok(Value::Bool(v))
    }

    fn serialize_i8(self, v: i8) -> Result<Value, KeyError> {
        self.serialize_i64(v.into())
    }

    fn serialize_i16(self, v: i16) -> Result<Value, KeyError> {
        self.serialize_i64(v.into())
    }

    fn serialize_i32(self, v: i32) -> Result<Value, KeyError> {
        self.serialize_i64(v.into())
    }

    fn serialize_i64(self, v: i64) -> Result<Value, KeyError> {
        Ok(Value::Number(v.into()))
    }

    fn serialize_i128(self, v: i128) -> Result<Value, KeyError> {
        if let Ok(v) = i64::try_from(v) {
            self.serialize_i64(v)
        } else if let Ok(v) = u64::try_from(v) {
            self.serialize_u64(v)
        } else {
            Err(KeyError::IntegerOutOfRange(v.to_string()))
        }
    }

    fn serialize_u8(self, v: u8) -> Result<Value, KeyError> {
        self.serialize_u64(v.into())
    }

    fn serialize_u16(self, v: u16) -> Result<Value, KeyError> {
        self.serialize_u64(v.into())
    }

    fn serialize_u32(self, v: u32) -> Result<Value, KeyError> {
        self.serialize_u64(v.into())
    }

    fn serialize_u64(self, v: u64) -> Result<Value, KeyError> {
        Ok(Value::Number(v.into()))
    }

    fn serialize_u128(self, v: u128) -> Result<Value, KeyError> {
        match u64::try_from(v) {
            Ok(v) => self.serialize_u64(v),
            // a string would collide with the equivalent string argument
            Err(_) => Err(KeyError::IntegerOutOfRange(v.to_string())),
        }
    }

    fn serialize_f32(self, v: f32) -> Result<Value, KeyError> {
        self.serialize_f64(v.into())
    }

    fn serialize_f64(self, v: f64) -> Result<Value, KeyError> {
        // JSON has no representation for NaN and infinities
        Ok(Number::from_f64(v).map_or(Value::Null, Value::Number))
    }

    fn serialize_char(self, v: char) -> Result<Value, KeyError> {
        Ok(Value::String(v.to_string()))
    }

    fn serialize_str(self, v: &str) -> Result<Value, KeyError> {
        Ok(Value::String(v.to_owned()))
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<Value, KeyError> {
        Ok(Value::Array(v.iter().map(|&byte| byte.into()).collect()))
    }

    fn serialize_none(self) -> Result<Value, KeyError> {
        Ok(Value::Null)
    }

    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<Value, KeyError> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<Value, KeyError> {
        if self.is_root() {
            // `()` is a call without arguments
            return Ok(Value::Array(select_arguments(Vec::new(), self.select)));
        }
        Ok(Value::Null)
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<Value, KeyError> {
        Ok(Value::Null)
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> Result<Value, KeyError> {
        Ok(Value::String(variant.to_owned()))
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<Value, KeyError> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<Value, KeyError> {
        let mut object = Map::new();
        object.insert(variant.to_owned(), value.serialize(self.nested()?)?);
        Ok(Value::Object(object))
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<SerializeVec<'a>, KeyError> {
        Ok(SerializeVec {
            child: self.nested()?,
            select: self.select,
            items: Vec::with_capacity(len.unwrap_or(0)),
        })
    }

    fn serialize_tuple(self, len: usize) -> Result<SerializeVec<'a>, KeyError> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> Result<SerializeVec<'a>, KeyError> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<SerializeTupleVariant<'a>, KeyError> {
        Ok(SerializeTupleVariant {
            variant,
            child: self.nested()?,
            items: Vec::with_capacity(len),
        })
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<SerializeMap<'a>, KeyError> {
        Ok(SerializeMap {
            child: self.nested()?,
            object: Map::new(),
            next_key: None,
        })
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> Result<SerializeMap<'a>, KeyError> {
        self.serialize_map(Some(len))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<SerializeStructVariant<'a>, KeyError> {
        Ok(SerializeStructVariant {
            variant,
            child: self.nested()?,
            object: Map::new(),
        })
    }
}

struct SerializeVec<'a> {
    child: KeySerializer<'a>,
    select: Option<&'a [usize]>,
    /// Serialized items, `None` for items that were skipped by `select`.
    items: Vec<Option<Value>>,
}

impl SerializeVec<'_> {
    fn push<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), KeyError> {
        let position = self.items.len();
        let selected = self
            .select
            .is_none_or(|fields| fields.contains(&position));
        let item = match selected {
            true => Some(value.serialize(self.child)?),
            false => None,
        };
        self.items.push(item);
        Ok(())
    }

    fn finish(self) -> Value {
        Value::Array(select_arguments(self.items, self.select))
    }
}

impl ser::SerializeSeq for SerializeVec<'_> {
    type Ok = Value;
    type Error = KeyError;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), KeyError> {
        self.push(value)
    }

    fn end(self) -> Result<Value, KeyError> {
        Ok(self.finish())
    }
}

impl ser::SerializeTuple for SerializeVec<'_> {
    type Ok = Value;
    type Error = KeyError;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), KeyError> {
        self.push(value)
    }

    fn end(self) -> Result<Value, KeyError> {
        Ok(self.finish())
    }
}

impl ser::SerializeTupleStruct for SerializeVec<'_> {
    type Ok = Value;
    type Error = KeyError;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), KeyError> {
        self.push(value)
    }

    fn end(self) -> Result<Value, KeyError> {
        Ok(self.finish())
    }
}

struct SerializeTupleVariant<'a> {
    variant: &'static str,
    child: KeySerializer<'a>,
    items: Vec<Value>,
}

impl ser::SerializeTupleVariant for SerializeTupleVariant<'_> {
    type Ok = Value;
    type Error = KeyError;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), KeyError> {
        self.items.push(value.serialize(self.child)?);
        Ok(())
    }

    fn end(self) -> Result<Value, KeyError> {
        let mut object = Map::new();
        object.insert(self.variant.to_owned(), Value::Array(self.items));
        Ok(Value::Object(object))
    }
}

struct SerializeMap<'a> {
    child: KeySerializer<'a>,
    object: Map<String, Value>,
    next_key: Option<String>,
}

impl ser::SerializeMap for SerializeMap<'_> {
    type Ok = Value;
    type Error = KeyError;

    fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> Result<(), KeyError> {
        self.next_key = Some(key.serialize(MapKeySerializer)?);
        Ok(())
    }

    fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), KeyError> {
        let key = self
            .next_key
            .take()
            .ok_or_else(|| KeyError::Custom("map value serialized before its key".into()))?;
        let value = value.serialize(self.child)?;
        self.object.insert(key, value);
        Ok(())
    }

    fn end(self) -> Result<Value, KeyError> {
        Ok(Value::Object(self.object))
    }
}

impl ser::SerializeStruct for SerializeMap<'_> {
    type Ok = Value;
    type Error = KeyError;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), KeyError> {
        let value = value.serialize(self.child)?;
        self.object.insert(key.to_owned(), value);
        Ok(())
    }

    fn end(self) -> Result<Value, KeyError> {
        Ok(Value::Object(self.object))
    }
}

struct SerializeStructVariant<'a> {
    variant: &'static str,
    child: KeySerializer<'a>,
    object: Map<String, Value>,
}

impl ser::SerializeStructVariant for SerializeStructVariant<'_> {
    type Ok = Value;
    type Error = KeyError;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), KeyError> {
        let value = value.serialize(self.child)?;
        self.object.insert(key.to_owned(), value);
        Ok(())
    }

    fn end(self) -> Result<Value, KeyError> {
        let mut object = Map::new();
        object.insert(self.variant.to_owned(), Value::Object(self.object));
        Ok(Value::Object(object))
    }
}

/// Turns scalar map keys into strings.
struct MapKeySerializer;

impl ser::Serializer for MapKeySerializer {
    type Ok = String;
    type Error = KeyError;

    type SerializeSeq = Impossible<String, KeyError>;
    type SerializeTuple = Impossible<String, KeyError>;
    type SerializeTupleStruct = Impossible<String, KeyError>;
    type SerializeTupleVariant = Impossible<String, KeyError>;
    type SerializeMap = Impossible<String, KeyError>;
    type SerializeStruct = Impossible<String, KeyError>;
    type SerializeStructVariant = Impossible<String, KeyError>;

    fn serialize_bool(self, v: bool) -> Result<String, KeyError> {
        Ok(v.to_string())
    }

    fn serialize_i8(self, v: i8) -> Result<String, KeyError> {
        Ok(v.to_string())
    }

    fn serialize_i16(self, v: i16) -> Result<String, KeyError> {
        Ok(v.to_string())
    }

    fn serialize_i32(self, v: i32) -> Result<String, KeyError> {
        Ok(v.to_string())
    }

    fn serialize_i64(self, v: i64) -> Result<String, KeyError> {
        Ok(v.to_string())
    }

    fn serialize_i128(self, v: i128) -> Result<String, KeyError> {
        Ok(v.to_string())
    }

    fn serialize_u8(self, v: u8) -> Result<String, KeyError> {
        Ok(v.to_string())
    }

    fn serialize_u16(self, v: u16) -> Result<String, KeyError> {
        Ok(v.to_string())
    }

    fn serialize_u32(self, v: u32) -> Result<String, KeyError> {
        Ok(v.to_string())
    }

    fn serialize_u64(self, v: u64) -> Result<String, KeyError> {
        Ok(v.to_string())
    }

    fn serialize_u128(self, v: u128) -> Result<String, KeyError> {
        Ok(v.to_string())
    }

    fn serialize_f32(self, v: f32) -> Result<String, KeyError> {
        Ok(v.to_string())
    }

    fn serialize_f64(self, v: f64) -> Result<String, KeyError> {
        Ok(v.to_string())
    }

    fn serialize_char(self, v: char) -> Result<String, KeyError> {
        Ok(v.to_string())
    }

    fn serialize_str(self, v: &str) -> Result<String, KeyError> {
        Ok(v.to_owned())
    }

    fn serialize_bytes(self, _v: &[u8]) -> Result<String, KeyError> {
        Err(KeyError::UnsupportedMapKey("bytes"))
    }

    fn serialize_none(self) -> Result<String, KeyError> {
        Err(KeyError::UnsupportedMapKey("none"))
    }

    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<String, KeyError> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<String, KeyError> {
        Err(KeyError::UnsupportedMapKey("unit"))
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<String, KeyError> {
        Err(KeyError::UnsupportedMapKey("unit struct"))
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> Result<String, KeyError> {
        Ok(variant.to_owned())
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<String, KeyError> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<String, KeyError> {
        Err(KeyError::UnsupportedMapKey("newtype variant"))
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq, KeyError> {
        Err(KeyError::UnsupportedMapKey("sequence"))
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple, KeyError> {
        Err(KeyError::UnsupportedMapKey("tuple"))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct, KeyError> {
        Err(KeyError::UnsupportedMapKey("tuple struct"))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant, KeyError> {
        Err(KeyError::UnsupportedMapKey("tuple variant"))
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap, KeyError> {
        Err(KeyError::UnsupportedMapKey("map"))
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStruct, KeyError> {
        Err(KeyError::UnsupportedMapKey("struct"))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant, KeyError> {
        Err(KeyError::UnsupportedMapKey("struct variant"))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Arc;

    use coalescer_test::SelfRef;
    use serde::Serialize;

    use super::*;

    const DEPTH: usize = 128;

    fn key<A: Serialize>(args: &A) -> String {
        structural_key(args, None, DEPTH).unwrap()
    }

    fn selected<A: Serialize>(args: &A, fields: &[usize]) -> String {
        structural_key(args, Some(fields), DEPTH).unwrap()
    }

    #[derive(Serialize)]
    struct User {
        id: &'static str,
        name: &'static str,
    }

    #[derive(Serialize)]
    enum Query {
        All,
        ById(u32),
        Range(u32, u32),
        Named { name: &'static str },
    }

    #[test]
    fn test_positional_arguments() {
        insta::assert_snapshot!(key(&("test", 1, true)), @r#"["test",1,true]"#);
        insta::assert_snapshot!(key(&()), @"[]");
        insta::assert_snapshot!(key(&("single",)), @r#"["single"]"#);
        // a lone value is a single argument
        insta::assert_snapshot!(key(&42), @"[42]");
        insta::assert_snapshot!(key(&(None::<u8>, 1.5, f64::NAN)), @"[null,1.5,null]");
    }

    #[test]
    fn test_nested_values() {
        let user = User {
            id: "user1",
            name: "Alice",
        };
        insta::assert_snapshot!(
            key(&(user, vec![1, 2])),
            @r#"[{"id":"user1","name":"Alice"},[1,2]]"#
        );

        insta::assert_snapshot!(
            key(&(Query::All, Query::ById(7), Query::Range(1, 2), Query::Named { name: "x" })),
            @r#"["All",{"ById":7},{"Range":[1,2]},{"Named":{"name":"x"}}]"#
        );
    }

    #[test]
    fn test_map_keys_are_sorted() {
        let mut first = HashMap::new();
        let mut second = HashMap::new();
        for (k, v) in [("b", 2), ("a", 1), ("c", 3)] {
            first.insert(k, v);
        }
        for (k, v) in [("c", 3), ("a", 1), ("b", 2)] {
            second.insert(k, v);
        }

        assert_eq!(key(&(&first,)), key(&(&second,)));
        insta::assert_snapshot!(key(&(&first,)), @r#"[{"a":1,"b":2,"c":3}]"#);

        let numeric: BTreeMap<u32, &str> = [(2, "two"), (10, "ten")].into_iter().collect();
        insta::assert_snapshot!(key(&(numeric,)), @r#"[{"10":"ten","2":"two"}]"#);
    }

    #[test]
    fn test_unsupported_map_keys() {
        let mut map = HashMap::new();
        map.insert((1, 2), "pair");

        assert_eq!(
            structural_key(&(map,), None, DEPTH),
            Err(KeyError::UnsupportedMapKey("tuple"))
        );
    }

    #[test]
    fn test_wide_integers() {
        insta::assert_snapshot!(key(&(-1i128, 7u128)), @"[-1,7]");
        insta::assert_snapshot!(key(&(u128::from(u64::MAX),)), @"[18446744073709551615]");

        assert_eq!(
            structural_key(&(u128::MAX,), None, DEPTH),
            Err(KeyError::IntegerOutOfRange(u128::MAX.to_string()))
        );
        assert_eq!(
            structural_key(&(i128::MIN,), None, DEPTH),
            Err(KeyError::IntegerOutOfRange(i128::MIN.to_string()))
        );
        // never the same key as the number spelled out as a string
        assert_ne!(
            structural_key(&(u128::MAX,), None, DEPTH).ok(),
            Some(key(&(u128::MAX.to_string(),)))
        );
    }

    #[test]
    fn test_key_fields() {
        let args = ("A", "B", "X");
        insta::assert_snapshot!(selected(&args, &[0, 1]), @r#"["A","B"]"#);
        insta::assert_snapshot!(selected(&args, &[2, 0]), @r#"["X","A"]"#);
        insta::assert_snapshot!(selected(&args, &[0, 5, 10]), @r#"["A",null,null]"#);
        insta::assert_snapshot!(selected(&args, &[]), @"[]");

        assert_eq!(selected(&("A", "B", "X"), &[0, 1]), selected(&("A", "B", "Y"), &[0, 1]));
        assert_ne!(selected(&("A", "B", "X"), &[0, 1]), selected(&("A", "C", "X"), &[0, 1]));

        // a lone value is argument zero
        insta::assert_snapshot!(selected(&"only", &[0, 1]), @r#"["only",null]"#);
        insta::assert_snapshot!(selected(&(), &[0]), @"[null]");
    }

    #[test]
    fn test_cycles_are_detected() {
        let node = SelfRef::new("loop");
        assert_eq!(
            structural_key(&(Arc::clone(&node),), None, DEPTH),
            Err(KeyError::TooDeep(DEPTH))
        );
    }

    #[test]
    fn test_unselected_arguments_are_not_serialized() {
        let node = SelfRef::new("loop");
        insta::assert_snapshot!(selected(&("user", node), &[0]), @r#"["user"]"#);
    }

    #[test]
    fn test_depth_limit() {
        let nested = vec![vec![vec![1]]];
        // the argument list itself is the first level
        assert!(structural_key(&(nested.clone(),), None, 4).is_ok());
        assert_eq!(
            structural_key(&(nested,), None, 3),
            Err(KeyError::TooDeep(3))
        );
    }

    #[test]
    fn test_fallback_keys_are_unique() {
        let keys: Vec<_> = (0..100).map(|_| fallback_key()).collect();
        let mut deduplicated = keys.clone();
        deduplicated.sort();
        deduplicated.dedup();

        assert_eq!(deduplicated.len(), keys.len());
        assert!(keys.iter().all(|key| key.starts_with("@fallback:")));
    }

    #[test]
    fn test_deriver_precedence() {
        let deriver = KeyDeriver::<(&'static str, u32)> {
            generator: Some(Box::new(|args: &(&'static str, u32)| {
                Ok(format!("user:{}", args.0))
            })),
            key_fields: Some(vec![1]),
            max_depth: DEPTH,
        };
        let key = deriver.derive(&("alice", 3));
        assert_eq!(key.key, "user:alice");
        assert!(!key.fallback);

        let deriver = KeyDeriver::<(&'static str, u32)> {
            generator: None,
            key_fields: Some(vec![1]),
            max_depth: DEPTH,
        };
        assert_eq!(deriver.derive(&("alice", 3)).key, "[3]");
    }

    #[test]
    fn test_deriver_falls_back() {
        let failing = KeyDeriver::<(u32,)> {
            generator: Some(Box::new(|_: &(u32,)| -> anyhow::Result<String> {
                anyhow::bail!("no key for you")
            })),
            key_fields: None,
            max_depth: DEPTH,
        };
        let first = failing.derive(&(1,));
        let second = failing.derive(&(1,));
        assert!(first.fallback && second.fallback);
        assert_ne!(first.key, second.key);

        let panicking = KeyDeriver::<(u32,)> {
            generator: Some(Box::new(|_: &(u32,)| -> anyhow::Result<String> {
                panic!("key generator exploded")
            })),
            key_fields: None,
            max_depth: DEPTH,
        };
        assert!(panicking.derive(&(1,)).fallback);

        let cyclic = KeyDeriver::<(Arc<SelfRef>,)> {
            generator: None,
            key_fields: None,
            max_depth: DEPTH,
        };
        assert!(cyclic.derive(&(SelfRef::new("loop"),)).fallback);
    }
}
