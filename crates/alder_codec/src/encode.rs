//! Value tree encoder.

use crate::bitstream::BitWriter;
use crate::{CodecError, Value};

// 3-bit type tags.
pub(crate) const TAG_SCALAR: u32 = 0;
pub(crate) const TAG_INT: u32 = 1;
pub(crate) const TAG_FLOAT: u32 = 2;
pub(crate) const TAG_STR: u32 = 3;
pub(crate) const TAG_LIST: u32 = 4;
pub(crate) const TAG_MAP: u32 = 5;
pub(crate) const TAG_CLOSE: u32 = 6;

// 2-bit sub-tags following TAG_SCALAR.
pub(crate) const SUB_FALSE: u32 = 0;
pub(crate) const SUB_TRUE: u32 = 1;
pub(crate) const SUB_NULL: u32 = 2;
pub(crate) const SUB_END: u32 = 3;

/// Magnitude bit widths per integer size class.
pub(crate) const INT_WIDTHS: [u32; 8] = [1, 4, 8, 12, 16, 20, 24, 32];

/// Encodes a value tree into its self-delimiting wire form.
///
/// # Errors
///
/// Fails if an integer magnitude exceeds 32 bits, a float needs more
/// than 9 significant decimal digits, or a string is longer than the
/// 32-bit length field allows.
pub fn encode(value: &Value) -> Result<Vec<u8>, CodecError> {
    let mut w = BitWriter::new();
    encode_value(&mut w, value, true)?;
    w.write_bits(TAG_SCALAR, 3);
    w.write_bits(SUB_END, 2);
    Ok(w.finish())
}

fn encode_value(w: &mut BitWriter, value: &Value, top: bool) -> Result<(), CodecError> {
    match value {
        Value::Null => {
            w.write_bits(TAG_SCALAR, 3);
            w.write_bits(SUB_NULL, 2);
        }
        Value::Bool(b) => {
            w.write_bits(TAG_SCALAR, 3);
            w.write_bits(if *b { SUB_TRUE } else { SUB_FALSE }, 2);
        }
        Value::Int(v) => {
            let magnitude = v.unsigned_abs();
            if magnitude > u64::from(u32::MAX) {
                return Err(CodecError::IntOutOfRange);
            }
            w.write_bits(TAG_INT, 3);
            write_magnitude(w, magnitude as u32);
            w.write_bits(u32::from(*v < 0), 1);
        }
        Value::Float(v) => {
            if !v.is_finite() {
                return Err(CodecError::FloatPrecision);
            }
            // Whole-numbered floats take the integer path, like any
            // other number whose fraction is zero.
            if v.fract() == 0.0 {
                let as_int = *v as i64;
                if as_int.unsigned_abs() > u64::from(u32::MAX) {
                    return Err(CodecError::IntOutOfRange);
                }
                return encode_value(w, &Value::Int(as_int), top);
            }
            let (magnitude, shift) = float_parts(v.abs())?;
            w.write_bits(TAG_FLOAT, 3);
            write_magnitude(w, magnitude);
            w.write_bits(u32::from(*v < 0.0), 1);
            w.write_bits(shift, 4);
        }
        Value::Str(s) => {
            w.write_bits(TAG_STR, 3);
            write_str_len(w, s.len())?;
            w.write_raw(s.as_bytes());
        }
        Value::List(items) => {
            w.write_bits(TAG_LIST, 3);
            for item in items {
                encode_value(w, item, false)?;
            }
            if !top {
                w.write_bits(TAG_CLOSE, 3);
            }
        }
        Value::Map(map) => {
            w.write_bits(TAG_MAP, 3);
            for (key, item) in map {
                w.write_bits(TAG_STR, 3);
                write_str_len(w, key.len())?;
                w.write_raw(key.as_bytes());
                encode_value(w, item, false)?;
            }
            if !top {
                w.write_bits(TAG_CLOSE, 3);
            }
        }
    }
    Ok(())
}

/// Writes a magnitude as a 3-bit size class plus that many value bits.
fn write_magnitude(w: &mut BitWriter, m: u32) {
    let class = match m {
        0..=1 => 0,
        2..=15 => 1,
        16..=255 => 2,
        256..=4095 => 3,
        4096..=65535 => 4,
        65536..=1_048_575 => 5,
        1_048_576..=16_777_215 => 6,
        _ => 7,
    };
    w.write_bits(class, 3);
    w.write_bits(m, INT_WIDTHS[class as usize]);
}

/// 5-bit string length with escapes to 8/16/32-bit fields.
fn write_str_len(w: &mut BitWriter, len: usize) -> Result<(), CodecError> {
    if len <= 28 {
        w.write_bits(len as u32, 5);
    } else if len <= 255 {
        w.write_bits(29, 5);
        w.write_bits(len as u32, 8);
    } else if len <= 65535 {
        w.write_bits(30, 5);
        w.write_bits(len as u32, 16);
    } else if len <= u32::MAX as usize {
        w.write_bits(31, 5);
        w.write_bits(len as u32, 32);
    } else {
        return Err(CodecError::StringTooLong);
    }
    Ok(())
}

/// Splits a positive non-integral float into a scaled magnitude and a
/// decimal shift so that `magnitude / 10^shift` reproduces the value.
///
/// At most 9 significant decimal digits survive the scaling; the last
/// digit is rounded. Values whose derived shift falls outside the
/// 4-bit field cannot be represented.
fn float_parts(v: f64) -> Result<(u32, u32), CodecError> {
    debug_assert!(v > 0.0);
    let mut int_digits: i32 = 1;
    let mut step = 10.0f64;
    while step <= v {
        int_digits += 1;
        step *= 10.0;
    }

    let mut shift = 9 - int_digits;
    if shift < 0 {
        return Err(CodecError::FloatPrecision);
    }

    let mut scaled = (v * (1_000_000_000.0 / step)).round() as u64;
    while scaled >= 10 && scaled % 10 == 0 {
        scaled /= 10;
        shift -= 1;
    }

    if !(0..=15).contains(&shift) || scaled > u64::from(u32::MAX) {
        return Err(CodecError::FloatPrecision);
    }
    Ok((scaled as u32, shift as u32))
}
