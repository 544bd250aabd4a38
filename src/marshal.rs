//! Body codecs.
//!
//! A [`Marshaller`] turns values into response bytes and request bytes into
//! values. Routes pick one by mime type when the router is built; `serde_json`
//! values are the interchange model, so a codec only has to understand that
//! one shape and every `Serialize`/`Deserialize` type works through it.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde::ser::{self, Impossible, Serializer};
use serde_json::Value;

use crate::error::MarshalError;

/// A pluggable body codec.
pub trait Marshaller: Send + Sync + 'static {
    fn marshal(&self, value: &Value) -> Result<Vec<u8>, MarshalError>;
    fn unmarshal(&self, body: &[u8]) -> Result<Value, MarshalError>;
}

/// `application/json`. Every encoded value is followed by a newline, so
/// consecutive frames on a stream stay separable.
#[derive(Clone, Copy, Debug, Default)]
pub struct Json;

impl Marshaller for Json {
    fn marshal(&self, value: &Value) -> Result<Vec<u8>, MarshalError> {
        let mut out = serde_json::to_vec(value)?;
        out.push(b'\n');
        Ok(out)
    }

    fn unmarshal(&self, body: &[u8]) -> Result<Value, MarshalError> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// `text/plain`. Strings go out verbatim, numbers and booleans in their
/// display form; anything structured is refused.
#[derive(Clone, Copy, Debug, Default)]
pub struct Text;

impl Marshaller for Text {
    fn marshal(&self, value: &Value) -> Result<Vec<u8>, MarshalError> {
        match value {
            Value::String(s) => Ok(s.clone().into_bytes()),
            Value::Number(n) => Ok(n.to_string().into_bytes()),
            Value::Bool(b) => Ok(b.to_string().into_bytes()),
            other => Err(MarshalError::Unsupported(format!(
                "text/plain can't carry a {} value",
                kind_name(other)
            ))),
        }
    }

    fn unmarshal(&self, body: &[u8]) -> Result<Value, MarshalError> {
        std::str::from_utf8(body)
            .map(|s| Value::String(s.to_owned()))
            .map_err(|e| MarshalError::Unsupported(format!("text/plain body is not utf-8: {e}")))
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Serialises `value`. `Ok(None)` means the value is `()`, a unit struct or
/// `None`, and no body should be written at all.
pub(crate) fn encode<T: Serialize + ?Sized>(
    marshaller: &dyn Marshaller,
    value: &T,
) -> Result<Option<Vec<u8>>, MarshalError> {
    if Shape::of(value) == Shape::Empty {
        return Ok(None);
    }
    marshaller.marshal(&to_value(value)?).map(Some)
}

/// Converts `value` for a codec. Non-finite floats have no representation
/// and are refused instead of turning into `null`.
pub(crate) fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value, MarshalError> {
    if Shape::of(value) == Shape::NonFinite {
        return Err(MarshalError::Unsupported("non-finite float can't be marshalled".to_owned()));
    }
    Ok(serde_json::to_value(value)?)
}

pub(crate) fn decode<T: DeserializeOwned>(
    marshaller: &dyn Marshaller,
    body: &[u8],
) -> Result<T, MarshalError> {
    let value = marshaller.unmarshal(body)?;
    Ok(serde_json::from_value(value)?)
}

/// What a value looks like at the top level, as far as body encoding cares.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Shape {
    Empty,
    NonFinite,
    Other,
}

impl Shape {
    fn of<T: Serialize + ?Sized>(value: &T) -> Self {
        // Compound values bail out with an error; they are `Other`.
        value.serialize(ShapeOf).unwrap_or(Shape::Other)
    }
}

struct ShapeOf;

macro_rules! other {
    ($($method:ident: $t:ty),*) => {$(
        fn $method(self, _: $t) -> Result<Shape, serde_json::Error> {
            Ok(Shape::Other)
        }
    )*};
}

impl Serializer for ShapeOf {
    type Ok = Shape;
    type Error = serde_json::Error;
    type SerializeSeq = Impossible<Shape, serde_json::Error>;
    type SerializeTuple = Impossible<Shape, serde_json::Error>;
    type SerializeTupleStruct = Impossible<Shape, serde_json::Error>;
    type SerializeTupleVariant = Impossible<Shape, serde_json::Error>;
    type SerializeMap = Impossible<Shape, serde_json::Error>;
    type SerializeStruct = Impossible<Shape, serde_json::Error>;
    type SerializeStructVariant = Impossible<Shape, serde_json::Error>;

    other!(
        serialize_bool: bool,
        serialize_i8: i8,
        serialize_i16: i16,
        serialize_i32: i32,
        serialize_i64: i64,
        serialize_u8: u8,
        serialize_u16: u16,
        serialize_u32: u32,
        serialize_u64: u64,
        serialize_char: char,
        serialize_str: &str,
        serialize_bytes: &[u8]
    );

    fn serialize_f32(self, v: f32) -> Result<Shape, Self::Error> {
        self.serialize_f64(f64::from(v))
    }

    fn serialize_f64(self, v: f64) -> Result<Shape, Self::Error> {
        Ok(if v.is_finite() { Shape::Other } else { Shape::NonFinite })
    }

    fn serialize_none(self) -> Result<Shape, Self::Error> {
        Ok(Shape::Empty)
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<Shape, Self::Error> {
        // `Some(())` is a value, even if a null one.
        Ok(match Shape::of(value) {
            Shape::Empty => Shape::Other,
            shape => shape,
        })
    }

    fn serialize_unit(self) -> Result<Shape, Self::Error> {
        Ok(Shape::Empty)
    }

    fn serialize_unit_struct(self, _: &'static str) -> Result<Shape, Self::Error> {
        Ok(Shape::Empty)
    }

    fn serialize_unit_variant(self, _: &'static str, _: u32, _: &'static str) -> Result<Shape, Self::Error> {
        Ok(Shape::Other)
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _: &'static str,
        value: &T,
    ) -> Result<Shape, Self::Error> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: &T,
    ) -> Result<Shape, Self::Error> {
        Ok(Shape::Other)
    }

    fn serialize_seq(self, _: Option<usize>) -> Result<Self::SerializeSeq, Self::Error> {
        Err(ser::Error::custom("compound"))
    }

    fn serialize_tuple(self, _: usize) -> Result<Self::SerializeTuple, Self::Error> {
        Err(ser::Error::custom("compound"))
    }

    fn serialize_tuple_struct(self, _: &'static str, _: usize) -> Result<Self::SerializeTupleStruct, Self::Error> {
        Err(ser::Error::custom("compound"))
    }

    fn serialize_tuple_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self::SerializeTupleVariant, Self::Error> {
        Err(ser::Error::custom("compound"))
    }

    fn serialize_map(self, _: Option<usize>) -> Result<Self::SerializeMap, Self::Error> {
        Err(ser::Error::custom("compound"))
    }

    fn serialize_struct(self, _: &'static str, _: usize) -> Result<Self::SerializeStruct, Self::Error> {
        Err(ser::Error::custom("compound"))
    }

    fn serialize_struct_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self::SerializeStructVariant, Self::Error> {
        Err(ser::Error::custom("compound"))
    }
}

/// Codecs by mime type.
#[derive(Clone)]
pub(crate) struct Marshallers {
    by_mime: HashMap<String, Arc<dyn Marshaller>>,
}

impl Marshallers {
    pub(crate) fn insert(&mut self, mime: &str, marshaller: Arc<dyn Marshaller>) {
        self.by_mime.insert(mime.to_ascii_lowercase(), marshaller);
    }

    pub(crate) fn get(&self, mime: &str) -> Option<Arc<dyn Marshaller>> {
        self.by_mime.get(&mime.to_ascii_lowercase()).cloned()
    }
}

impl Default for Marshallers {
    fn default() -> Self {
        let mut m = Self { by_mime: HashMap::new() };
        m.insert("application/json", Arc::new(Json));
        m.insert("text/plain", Arc::new(Text));
        m
    }
}
