//! MSB-first bit cursors over a byte buffer.
//!
//! The writer and reader carry their cursor state explicitly
//! (`{buffer, partial byte, bits left}`) so they can be passed through
//! the encode/decode paths by reference.

use crate::CodecError;

/// Accumulates bits MSB-first into a growing byte buffer.
pub struct BitWriter {
    out: Vec<u8>,
    acc: u8,
    left: u32,
}

impl BitWriter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            out: Vec::new(),
            acc: 0,
            left: 8,
        }
    }

    /// Writes the low `count` bits of `val`, most significant first.
    ///
    /// `count` must be at most 32.
    pub fn write_bits(&mut self, mut val: u32, mut count: u32) {
        debug_assert!(count <= 32);
        if count < 32 {
            val &= (1u32 << count) - 1;
        }
        while count > 0 {
            let take = self.left.min(count);
            let overflow = count - take;
            let chunk = (val >> overflow) & ((1u32 << take) - 1);
            self.acc |= (chunk as u8) << (self.left - take);
            self.left -= take;
            count = overflow;
            if overflow > 0 {
                val &= (1u32 << overflow) - 1;
            }
            if self.left == 0 {
                self.out.push(self.acc);
                self.acc = 0;
                self.left = 8;
            }
        }
    }

    /// Writes raw bytes at the next byte boundary.
    ///
    /// Any partial bit accumulator is flushed first (low bits zeroed)
    /// and bit accumulation resumes fresh afterwards. This alignment
    /// is part of the wire format, not an optimization.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        if self.left != 8 {
            self.out.push(self.acc);
            self.acc = 0;
            self.left = 8;
        }
        self.out.extend_from_slice(bytes);
    }

    /// Flushes any partial byte and returns the encoded buffer.
    #[must_use]
    pub fn finish(mut self) -> Vec<u8> {
        if self.left != 8 {
            self.out.push(self.acc);
        }
        self.out
    }
}

impl Default for BitWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads bits MSB-first from a byte slice.
pub struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
    left: u32,
}

impl<'a> BitReader<'a> {
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0, left: 8 }
    }

    /// Reads `count` bits (at most 32), most significant first.
    pub fn read_bits(&mut self, mut count: u32) -> Result<u32, CodecError> {
        debug_assert!(count <= 32);
        let mut val = 0u32;
        while count > 0 {
            let cur = u32::from(*self.data.get(self.pos).ok_or(CodecError::UnexpectedEnd)?);
            let take = self.left.min(count);
            let chunk = (cur >> (self.left - take)) & ((1u32 << take) - 1);
            val = (val << take) | chunk;
            self.left -= take;
            count -= take;
            if self.left == 0 {
                self.pos += 1;
                self.left = 8;
            }
        }
        Ok(val)
    }

    /// Reads `count` raw bytes from the next byte boundary.
    ///
    /// Mirrors [`BitWriter::write_raw`]: a partially-consumed byte is
    /// skipped before the raw bytes start.
    pub fn read_raw(&mut self, count: usize) -> Result<&'a [u8], CodecError> {
        if self.left != 8 {
            self.pos += 1;
            self.left = 8;
        }
        let end = self.pos.checked_add(count).ok_or(CodecError::UnexpectedEnd)?;
        if end > self.data.len() {
            return Err(CodecError::UnexpectedEnd);
        }
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_round_trip() {
        let mut w = BitWriter::new();
        w.write_bits(0b101, 3);
        w.write_bits(0b0110_1001, 8);
        w.write_bits(0x1234, 16);
        w.write_bits(1, 1);
        let buf = w.finish();

        let mut r = BitReader::new(&buf);
        assert_eq!(r.read_bits(3).unwrap(), 0b101);
        assert_eq!(r.read_bits(8).unwrap(), 0b0110_1001);
        assert_eq!(r.read_bits(16).unwrap(), 0x1234);
        assert_eq!(r.read_bits(1).unwrap(), 1);
    }

    #[test]
    fn test_raw_alignment() {
        let mut w = BitWriter::new();
        w.write_bits(0b11, 2);
        w.write_raw(b"abc");
        w.write_bits(0b0101, 4);
        let buf = w.finish();

        let mut r = BitReader::new(&buf);
        assert_eq!(r.read_bits(2).unwrap(), 0b11);
        assert_eq!(r.read_raw(3).unwrap(), b"abc");
        assert_eq!(r.read_bits(4).unwrap(), 0b0101);
    }

    #[test]
    fn test_full_width_value() {
        let mut w = BitWriter::new();
        w.write_bits(0xDEAD_BEEF, 32);
        let buf = w.finish();
        assert_eq!(buf, vec![0xDE, 0xAD, 0xBE, 0xEF]);

        let mut r = BitReader::new(&buf);
        assert_eq!(r.read_bits(32).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn test_truncated_read_fails() {
        let mut r = BitReader::new(&[0xFF]);
        assert_eq!(r.read_bits(8).unwrap(), 0xFF);
        assert_eq!(r.read_bits(1), Err(CodecError::UnexpectedEnd));
    }
}
