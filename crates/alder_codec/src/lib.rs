//! # Alder Codec
//!
//! Compact self-describing binary encoding for dynamically-typed value
//! trees, packed at bit granularity rather than byte granularity.
//!
//! ## Design
//!
//! - Every value starts with a 3-bit type tag; small integers (ticks,
//!   short counts) are the common case and get the shortest encodings
//! - Strings are written byte-aligned so their payload can be copied
//!   without bit shifting
//! - The encoding is self-delimiting: a terminal end-of-stream marker
//!   follows the outermost value, and nested containers carry their
//!   own close tags
//!
//! ## Example
//!
//! ```
//! use alder_codec::{encode, decode, Value};
//!
//! let value = Value::List(vec![Value::Int(5), Value::Str("hi".into())]);
//! let bytes = encode(&value).unwrap();
//! assert_eq!(decode(&bytes).unwrap(), value);
//! ```

mod bitstream;
mod decode;
mod encode;

pub use decode::decode;
pub use encode::encode;

use std::collections::BTreeMap;
use thiserror::Error;

/// A dynamically-typed value tree.
///
/// Whole-numbered floats are encoded through the integer path and
/// therefore decode as [`Value::Int`]; all other representable values
/// round-trip exactly.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Absence of a value.
    Null,
    /// A boolean.
    Bool(bool),
    /// A signed integer with a magnitude of at most 32 bits.
    Int(i64),
    /// A float with at most 9 significant decimal digits.
    Float(f64),
    /// A UTF-8 string.
    Str(String),
    /// An ordered list of values.
    List(Vec<Value>),
    /// A string-keyed map of values. Key order is not significant.
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Returns the integer payload, if this is an integer.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the string payload, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the list payload, if this is a list.
    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::List(v)
    }
}

/// Errors raised while encoding or decoding a value stream.
///
/// Decode errors indicate a malformed stream; callers at the network
/// boundary treat them as a protocol violation by the peer.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// The stream ended before the current value was complete.
    #[error("unexpected end of stream")]
    UnexpectedEnd,
    /// Integer magnitude does not fit the 32-bit wire limit.
    #[error("integer magnitude exceeds 32 bits")]
    IntOutOfRange,
    /// The float needs more than 9 significant decimal digits.
    #[error("float not representable within 9 significant digits")]
    FloatPrecision,
    /// String byte length does not fit the 32-bit length field.
    #[error("string length exceeds the 32-bit length field")]
    StringTooLong,
    /// An undefined type tag was read.
    #[error("invalid type tag")]
    InvalidTag,
    /// Container open and close tags do not pair up.
    #[error("unbalanced container tags")]
    UnbalancedContainer,
    /// A map entry was read in key position without a string key.
    #[error("map key missing or not a string")]
    MalformedKey,
    /// A string payload was not valid UTF-8.
    #[error("string payload is not valid utf-8")]
    InvalidUtf8,
}
