//! Value tree decoder.
//!
//! Single pass over the bit stream, driven by an explicit stack of
//! open container frames. Nesting depth is bounded by available
//! memory, not by the call stack.

use std::collections::BTreeMap;

use crate::bitstream::BitReader;
use crate::encode::{
    INT_WIDTHS, SUB_END, SUB_FALSE, SUB_NULL, SUB_TRUE, TAG_CLOSE, TAG_FLOAT, TAG_INT, TAG_LIST,
    TAG_MAP, TAG_SCALAR, TAG_STR,
};
use crate::{CodecError, Value};

/// An open container being filled in.
enum Frame {
    List(Vec<Value>),
    Map {
        map: BTreeMap<String, Value>,
        /// Key read for the entry whose value is still pending.
        key: Option<String>,
    },
}

impl Frame {
    fn into_value(self) -> Result<Value, CodecError> {
        match self {
            Self::List(items) => Ok(Value::List(items)),
            Self::Map { map, key: None } => Ok(Value::Map(map)),
            Self::Map { key: Some(_), .. } => Err(CodecError::MalformedKey),
        }
    }
}

/// Decodes one value tree from `data`.
///
/// A scalar at the top level returns as soon as it is complete; a
/// top-level container runs until the end-of-stream marker, since the
/// outermost container never writes its own close tag.
///
/// # Errors
///
/// Any truncation, invalid tag, unbalanced container, bad map key or
/// invalid UTF-8 yields a [`CodecError`]. Callers on the network path
/// must treat that as a protocol violation by the sender.
pub fn decode(data: &[u8]) -> Result<Value, CodecError> {
    let mut r = BitReader::new(data);
    let mut stack: Vec<Frame> = Vec::new();

    loop {
        let tag = r.read_bits(3)?;
        let item = match tag {
            TAG_SCALAR => match r.read_bits(2)? {
                SUB_FALSE => Value::Bool(false),
                SUB_TRUE => Value::Bool(true),
                SUB_NULL => Value::Null,
                SUB_END => {
                    // Terminal marker: exactly the root container may
                    // still be open here.
                    return match stack.pop() {
                        Some(frame) if stack.is_empty() => frame.into_value(),
                        _ => Err(CodecError::UnbalancedContainer),
                    };
                }
                _ => unreachable!("2-bit sub-tag"),
            },
            TAG_INT | TAG_FLOAT => {
                let class = r.read_bits(3)? as usize;
                let magnitude = r.read_bits(INT_WIDTHS[class])?;
                let negative = r.read_bits(1)? == 1;
                if tag == TAG_INT {
                    let v = i64::from(magnitude);
                    Value::Int(if negative { -v } else { v })
                } else {
                    let shift = r.read_bits(4)?;
                    let v = f64::from(magnitude) / 10f64.powi(shift as i32);
                    Value::Float(if negative { -v } else { v })
                }
            }
            TAG_STR => {
                let len = match r.read_bits(5)? {
                    29 => r.read_bits(8)?,
                    30 => r.read_bits(16)?,
                    31 => r.read_bits(32)?,
                    n => n,
                };
                let bytes = r.read_raw(len as usize)?;
                let s = String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)?;
                // In key position this string is the key, not a value.
                if let Some(Frame::Map { key: key @ None, .. }) = stack.last_mut() {
                    *key = Some(s);
                    continue;
                }
                Value::Str(s)
            }
            TAG_LIST => {
                stack.push(Frame::List(Vec::new()));
                continue;
            }
            TAG_MAP => {
                stack.push(Frame::Map { map: BTreeMap::new(), key: None });
                continue;
            }
            TAG_CLOSE => {
                let frame = stack.pop().ok_or(CodecError::UnbalancedContainer)?;
                if stack.is_empty() {
                    // The root never writes a close tag.
                    return Err(CodecError::UnbalancedContainer);
                }
                frame.into_value()?
            }
            _ => return Err(CodecError::InvalidTag),
        };

        match stack.last_mut() {
            None => return Ok(item),
            Some(Frame::List(items)) => items.push(item),
            Some(Frame::Map { map, key }) => match key.take() {
                Some(k) => {
                    map.insert(k, item);
                }
                None => return Err(CodecError::MalformedKey),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode;

    fn round_trip(value: Value) {
        let bytes = encode(&value).expect("encode");
        assert_eq!(decode(&bytes).expect("decode"), value, "round trip of {value:?}");
    }

    #[test]
    fn test_integer_boundaries() {
        for v in [
            0, 1, 2, 15, 16, 255, 256, 4095, 4096, 65535, 65536, 1_048_575, 1_048_576,
            16_777_215, 16_777_216, 2_147_483_647, 4_294_967_295,
        ] {
            round_trip(Value::Int(v));
            round_trip(Value::Int(-v));
        }
    }

    #[test]
    fn test_floats_within_nine_digits() {
        for v in [0.5, -0.5, 0.25, 3.125, 123.456, -9999.0001, 0.000_000_01, 12_345_678.9] {
            round_trip(Value::Float(v));
        }
    }

    #[test]
    fn test_float_precision_boundary_truncates() {
        // Ten significant digits: the last digit is rounded away.
        // This is the documented precision contract, not a bug.
        let bytes = encode(&Value::Float(0.1234567891)).unwrap();
        assert_eq!(decode(&bytes).unwrap(), Value::Float(0.12345679));
    }

    #[test]
    fn test_whole_float_decodes_as_int() {
        let bytes = encode(&Value::Float(42.0)).unwrap();
        assert_eq!(decode(&bytes).unwrap(), Value::Int(42));
    }

    #[test]
    fn test_strings() {
        round_trip(Value::Str(String::new()));
        round_trip(Value::Str("k".into()));
        round_trip(Value::Str("a".repeat(28)));
        round_trip(Value::Str("b".repeat(29)));
        round_trip(Value::Str("c".repeat(256)));
        round_trip(Value::Str("d".repeat(70_000)));
        round_trip(Value::Str("snowman \u{2603} and friends".into()));
    }

    #[test]
    fn test_scalars() {
        round_trip(Value::Null);
        round_trip(Value::Bool(true));
        round_trip(Value::Bool(false));
    }

    #[test]
    fn test_flat_containers() {
        round_trip(Value::List(vec![]));
        round_trip(Value::Map(BTreeMap::new()));
        round_trip(Value::List(vec![
            Value::Int(1),
            Value::Str("two".into()),
            Value::Bool(false),
            Value::Null,
        ]));
    }

    #[test]
    fn test_nested_depth_four() {
        let mut inner_map = BTreeMap::new();
        inner_map.insert("deep".to_owned(), Value::List(vec![Value::Int(-77)]));
        inner_map.insert("pi-ish".to_owned(), Value::Float(3.14159));
        let depth3 = Value::List(vec![Value::Map(inner_map), Value::Str("mid".into())]);
        let mut outer_map = BTreeMap::new();
        outer_map.insert("nested".to_owned(), depth3);
        outer_map.insert("flag".to_owned(), Value::Bool(true));
        round_trip(Value::List(vec![Value::Map(outer_map), Value::Int(250)]));
    }

    #[test]
    fn test_byte_exact_nested_round_trip() {
        let mut map = BTreeMap::new();
        map.insert("a".to_owned(), Value::List(vec![Value::List(vec![Value::Int(1)])]));
        let value = Value::List(vec![Value::Map(map)]);
        let first = encode(&value).unwrap();
        let second = encode(&decode(&first).unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_truncated_stream_fails() {
        let bytes = encode(&Value::List(vec![Value::Int(300), Value::Str("tail".into())])).unwrap();
        for cut in 1..bytes.len() {
            assert!(decode(&bytes[..cut]).is_err(), "cut at {cut} must not decode");
        }
    }

    #[test]
    fn test_unbalanced_close_fails() {
        // A bare close tag at the top level is never produced by the
        // encoder and must not decode.
        let mut w = crate::bitstream::BitWriter::new();
        w.write_bits(TAG_CLOSE, 3);
        assert!(decode(&w.finish()).is_err());
    }
}
