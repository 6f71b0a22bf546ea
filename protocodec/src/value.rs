//! Runtime value variant shared by the expression engine, the bit codec, and
//! instance storage (§4.3, §6.2).
//!
//! Mirrors the "wrap every concrete representation behind one enum, dispatch
//! via match" idiom the teacher uses for `BitReaderContainer`/
//! `BitWriterContainer` (`utils/analyze_utils.rs`), generalized from "two
//! endian variants of a bitstream type" to "every value shape a protocol field
//! can carry".

use crate::error::{CodecError, Stage};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A value carried by a node at runtime: caller-supplied on encode, codec- or
/// expression-produced on decode.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    UInt(u64),
    Float(f64),
    Bytes(Vec<u8>),
    Str(String),
    Bool(bool),
    Null,
}

impl Value {
    /// Implicit coercion to an unsigned integer.
    ///
    /// `Bool -> 0/1`, `Str` parsed as decimal/hex/binary when purely numeric,
    /// `Bytes` read as unsigned big-endian.
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Value::Int(i) => Some(*i as u64),
            Value::UInt(u) => Some(*u),
            Value::Float(f) => Some(*f as u64),
            Value::Bool(b) => Some(*b as u64),
            Value::Str(s) => parse_numeric_str(s).map(|i| i as u64),
            Value::Bytes(b) => Some(bytes_to_u64_be(b)),
            Value::Null => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::UInt(u) => Some(*u as i64),
            Value::Float(f) => Some(*f as i64),
            Value::Bool(b) => Some(*b as i64),
            Value::Str(s) => parse_numeric_str(s),
            Value::Bytes(b) => Some(bytes_to_u64_be(b) as i64),
            Value::Null => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            Value::UInt(u) => Some(*u as f64),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Str(s) => s.parse::<f64>().ok().or_else(|| parse_numeric_str(s).map(|i| i as f64)),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            Value::UInt(u) => Some(*u != 0),
            Value::Str(s) => match s.as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => parse_numeric_str(s).map(|i| i != 0),
            },
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<std::borrow::Cow<'_, [u8]>> {
        match self {
            Value::Bytes(b) => Some(std::borrow::Cow::Borrowed(b)),
            Value::Str(s) => Some(std::borrow::Cow::Owned(s.as_bytes().to_vec())),
            Value::UInt(u) => Some(std::borrow::Cow::Owned(u.to_be_bytes().to_vec())),
            Value::Int(i) => Some(std::borrow::Cow::Owned(i.to_be_bytes().to_vec())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<std::borrow::Cow<'_, str>> {
        match self {
            Value::Str(s) => Some(std::borrow::Cow::Borrowed(s)),
            Value::Int(i) => Some(std::borrow::Cow::Owned(i.to_string())),
            Value::UInt(u) => Some(std::borrow::Cow::Owned(u.to_string())),
            Value::Float(f) => Some(std::borrow::Cow::Owned(f.to_string())),
            Value::Bool(b) => Some(std::borrow::Cow::Owned(b.to_string())),
            Value::Bytes(b) => Some(std::borrow::Cow::Owned(hex_upper(b))),
            Value::Null => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Float(_) => "float",
            Value::Bytes(_) => "bytes",
            Value::Str(_) => "str",
            Value::Bool(_) => "bool",
            Value::Null => "null",
        }
    }

    pub fn require_uint(&self, stage: Stage, node_path: &str) -> Result<u64, CodecError> {
        self.as_uint().ok_or_else(|| {
            CodecError::expr_runtime(
                stage,
                node_path,
                format!("expected a value coercible to uint, got {}", self.type_name()),
            )
        })
    }

    pub fn require_bytes(&self, stage: Stage, node_path: &str) -> Result<Vec<u8>, CodecError> {
        self.as_bytes().map(|c| c.into_owned()).ok_or_else(|| {
            CodecError::expr_runtime(
                stage,
                node_path,
                format!("expected a value coercible to bytes, got {}", self.type_name()),
            )
        })
    }
}

fn bytes_to_u64_be(bytes: &[u8]) -> u64 {
    let mut acc = 0u64;
    for &b in bytes.iter().rev().take(8).collect::<Vec<_>>().into_iter().rev() {
        acc = (acc << 8) | b as u64;
    }
    acc
}

fn parse_numeric_str(s: &str) -> Option<i64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16).ok();
    }
    if let Some(bin) = s.strip_prefix("0b").or_else(|| s.strip_prefix("0B")) {
        return i64::from_str_radix(bin, 2).ok();
    }
    s.parse::<i64>().ok()
}

fn hex_upper(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02X}", b));
    }
    out
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

/// Values are authored as plain YAML/JSON scalars (`42`, `"hello"`, `true`) —
/// the tag lives in the schema's `value_type`, not in the instance data.
impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::UInt(u) => serializer.serialize_u64(*u),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Str(s) => serializer.serialize_str(s),
            Value::Bytes(b) => serializer.serialize_str(&hex_upper(b)),
            Value::Null => serializer.serialize_none(),
        }
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a scalar value (int, float, bool, or string)")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Value, E> {
        Ok(Value::Int(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Value, E> {
        Ok(Value::UInt(v))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Value, E> {
        Ok(Value::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Value, E> {
        Ok(Value::Str(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Value, E> {
        Ok(Value::Str(v))
    }

    fn visit_none<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_unit<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Value, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}
