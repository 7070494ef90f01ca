//! WebSocket frame codec, implemented from scratch.
//!
//! The parser is an incremental state machine fed raw socket bytes.
//! It understands single-frame text, binary, ping and pong messages;
//! fragmentation and extensions are not supported and any frame using
//! them terminates the connection.

use thiserror::Error;

pub(crate) const OP_TEXT: u8 = 1;
pub(crate) const OP_BINARY: u8 = 2;
pub(crate) const OP_CLOSE: u8 = 8;
pub(crate) const OP_PING: u8 = 9;
pub(crate) const OP_PONG: u8 = 10;

/// Protocol violations and terminal conditions in a frame stream.
///
/// Every variant ends the connection; the distinction only feeds the
/// close log line.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("reserved bits set in frame header")]
    ReservedBits,
    #[error("unsupported opcode {0}")]
    UnsupportedOpcode(u8),
    #[error("peer sent a close frame")]
    RemoteClose,
    #[error("buffered {buffered} bytes without a complete frame (limit {limit})")]
    Oversized { buffered: usize, limit: usize },
}

/// A complete frame surfaced by the parser.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameEvent {
    /// An application message payload, already unmasked.
    Message { payload: Vec<u8>, binary: bool },
    /// A ping to be answered with a pong echoing the payload.
    Ping(Vec<u8>),
    /// A pong; consumed silently by the connection.
    Pong(Vec<u8>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ParseState {
    Opcode,
    Length,
    Length16,
    Length64,
    Mask,
    Payload,
}

/// Incremental frame parser over a growing byte buffer.
#[derive(Debug)]
pub struct FrameParser {
    buffer: Vec<u8>,
    offset: usize,
    state: ParseState,
    opcode: u8,
    masked: bool,
    mask: [u8; 4],
    length: usize,
    max_buffered: usize,
    /// Servers assume client frames are masked even when the peer
    /// forgot to set the bit; some early clients did exactly that.
    assume_masked: bool,
    failed: Option<FrameError>,
}

impl FrameParser {
    /// Parser for the server side of a connection.
    #[must_use]
    pub fn server(max_buffered: usize) -> Self {
        Self::new(max_buffered, true)
    }

    /// Parser for the client side of a connection.
    #[must_use]
    pub fn client(max_buffered: usize) -> Self {
        Self::new(max_buffered, false)
    }

    fn new(max_buffered: usize, assume_masked: bool) -> Self {
        Self {
            buffer: Vec::new(),
            offset: 0,
            state: ParseState::Opcode,
            opcode: 0,
            masked: false,
            mask: [0; 4],
            length: 0,
            max_buffered,
            assume_masked,
            failed: None,
        }
    }

    /// Feeds raw socket bytes and returns every frame completed by
    /// them, in wire order.
    ///
    /// # Errors
    ///
    /// Any [`FrameError`] leaves the parser unusable; the caller must
    /// close the connection. When a violation follows complete frames
    /// in the same read, those frames are returned first and the error
    /// surfaces on the next call.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<FrameEvent>, FrameError> {
        if let Some(err) = self.failed {
            return Err(err);
        }
        if self.buffer.len() + data.len() > self.max_buffered {
            let err = FrameError::Oversized {
                buffered: self.buffer.len() + data.len(),
                limit: self.max_buffered,
            };
            self.failed = Some(err);
            return Err(err);
        }
        self.buffer.extend_from_slice(data);

        let mut events = Vec::new();
        loop {
            let avail = self.buffer.len() - self.offset;
            match self.state {
                ParseState::Opcode if avail >= 1 => {
                    let b = self.take_byte();
                    if b & 0x70 != 0 {
                        return self.fail(events, FrameError::ReservedBits);
                    }
                    match b & 0x0F {
                        OP_CLOSE => return self.fail(events, FrameError::RemoteClose),
                        op @ (OP_TEXT | OP_BINARY | OP_PING | OP_PONG) => {
                            self.opcode = op;
                            self.state = ParseState::Length;
                        }
                        op => return self.fail(events, FrameError::UnsupportedOpcode(op)),
                    }
                }
                ParseState::Length if avail >= 1 => {
                    let b = self.take_byte();
                    self.masked = if self.opcode == OP_PONG {
                        b & 0x80 != 0
                    } else {
                        b & 0x80 != 0 || self.assume_masked
                    };
                    match b & 0x7F {
                        126 => self.state = ParseState::Length16,
                        127 => self.state = ParseState::Length64,
                        n => {
                            self.length = n as usize;
                            self.state = self.after_length();
                        }
                    }
                }
                ParseState::Length16 if avail >= 2 => {
                    let hi = self.take_byte() as usize;
                    let lo = self.take_byte() as usize;
                    self.length = (hi << 8) | lo;
                    self.state = self.after_length();
                }
                ParseState::Length64 if avail >= 8 => {
                    let mut length = 0u64;
                    for _ in 0..8 {
                        length = (length << 8) | u64::from(self.take_byte());
                    }
                    // A frame that can never fit the buffer cap will
                    // never complete; fail it now.
                    if length > self.max_buffered as u64 {
                        let err = FrameError::Oversized {
                            buffered: length as usize,
                            limit: self.max_buffered,
                        };
                        return self.fail(events, err);
                    }
                    self.length = length as usize;
                    self.state = self.after_length();
                }
                ParseState::Mask if avail >= 4 => {
                    for i in 0..4 {
                        self.mask[i] = self.take_byte();
                    }
                    self.state = ParseState::Payload;
                }
                ParseState::Payload if avail >= self.length => {
                    let start = self.offset;
                    let end = start + self.length;
                    let mut payload = self.buffer[start..end].to_vec();
                    if self.masked {
                        for (i, byte) in payload.iter_mut().enumerate() {
                            *byte ^= self.mask[i % 4];
                        }
                    }
                    self.offset = end;
                    events.push(match self.opcode {
                        OP_PING => FrameEvent::Ping(payload),
                        OP_PONG => FrameEvent::Pong(payload),
                        op => FrameEvent::Message { payload, binary: op == OP_BINARY },
                    });
                    // Compact the consumed frame out of the buffer.
                    self.buffer.drain(..self.offset);
                    self.offset = 0;
                    self.state = ParseState::Opcode;
                }
                _ => break,
            }
        }
        Ok(events)
    }

    /// Records a terminal error. Frames already completed in this
    /// read are still delivered; the error re-surfaces on the next
    /// push.
    fn fail(
        &mut self,
        events: Vec<FrameEvent>,
        err: FrameError,
    ) -> Result<Vec<FrameEvent>, FrameError> {
        self.failed = Some(err);
        if events.is_empty() {
            Err(err)
        } else {
            Ok(events)
        }
    }

    fn take_byte(&mut self) -> u8 {
        let b = self.buffer[self.offset];
        self.offset += 1;
        b
    }

    const fn after_length(&self) -> ParseState {
        if self.masked {
            ParseState::Mask
        } else {
            ParseState::Payload
        }
    }
}

/// Encodes a single unfragmented data frame.
///
/// Servers send unmasked frames (`mask: None`); clients must supply a
/// masking key.
#[must_use]
pub fn encode_frame(payload: &[u8], binary: bool, mask: Option<[u8; 4]>) -> Vec<u8> {
    encode_with_opcode(if binary { OP_BINARY } else { OP_TEXT }, payload, mask)
}

/// Encodes a pong answering a ping.
#[must_use]
pub(crate) fn encode_pong(payload: &[u8]) -> Vec<u8> {
    encode_with_opcode(OP_PONG, payload, None)
}

/// A minimal close frame.
#[must_use]
pub(crate) fn close_frame() -> [u8; 2] {
    [0x80 | OP_CLOSE, 0]
}

fn encode_with_opcode(opcode: u8, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
    let len = payload.len() as u64;
    let mut out = Vec::with_capacity(payload.len() + 14);
    out.push(0x80 | opcode);

    let mask_bit = if mask.is_some() { 0x80 } else { 0 };
    if len <= 125 {
        out.push(mask_bit | len as u8);
    } else if len <= 65_535 {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&len.to_be_bytes());
    }

    match mask {
        Some(key) => {
            out.extend_from_slice(&key);
            out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
        }
        None => out.extend_from_slice(payload),
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_messages(parser: &mut FrameParser, bytes: &[u8]) -> Vec<Vec<u8>> {
        parser
            .push(bytes)
            .unwrap()
            .into_iter()
            .filter_map(|e| match e {
                FrameEvent::Message { payload, .. } => Some(payload),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_unmasked_round_trip() {
        let frame = encode_frame(b"hello", true, None);
        let mut parser = FrameParser::client(1024);
        let events = parser.push(&frame).unwrap();
        assert_eq!(events, vec![FrameEvent::Message { payload: b"hello".to_vec(), binary: true }]);
    }

    #[test]
    fn test_masked_round_trip() {
        let frame = encode_frame(b"masked payload", false, Some([0x12, 0x34, 0x56, 0x78]));
        let mut parser = FrameParser::server(1024);
        let events = parser.push(&frame).unwrap();
        assert_eq!(
            events,
            vec![FrameEvent::Message { payload: b"masked payload".to_vec(), binary: false }]
        );
    }

    #[test]
    fn test_one_byte_at_a_time() {
        let frame = encode_frame(b"trickle", true, Some([9, 8, 7, 6]));
        let mut parser = FrameParser::server(1024);
        let mut messages = Vec::new();
        for byte in frame {
            messages.extend(collect_messages(&mut parser, &[byte]));
        }
        assert_eq!(messages, vec![b"trickle".to_vec()]);
    }

    #[test]
    fn test_two_frames_in_one_read() {
        let mut bytes = encode_frame(b"first", true, None);
        bytes.extend(encode_frame(b"second", true, None));
        let mut parser = FrameParser::client(1024);
        assert_eq!(
            collect_messages(&mut parser, &bytes),
            vec![b"first".to_vec(), b"second".to_vec()]
        );
    }

    #[test]
    fn test_extended_lengths() {
        let medium = vec![0xAB; 300];
        let large = vec![0xCD; 70_000];
        let mut parser = FrameParser::client(200_000);
        assert_eq!(
            collect_messages(&mut parser, &encode_frame(&medium, true, None)),
            vec![medium]
        );
        assert_eq!(collect_messages(&mut parser, &encode_frame(&large, true, None)), vec![large]);
    }

    #[test]
    fn test_ping_and_pong_events() {
        let mut parser = FrameParser::client(1024);
        let ping = encode_with_opcode(OP_PING, b"probe", None);
        assert_eq!(parser.push(&ping).unwrap(), vec![FrameEvent::Ping(b"probe".to_vec())]);
        let pong = encode_pong(b"probe");
        assert_eq!(parser.push(&pong).unwrap(), vec![FrameEvent::Pong(b"probe".to_vec())]);
    }

    #[test]
    fn test_reserved_bits_terminate() {
        let mut parser = FrameParser::server(1024);
        assert_eq!(parser.push(&[0xF2]), Err(FrameError::ReservedBits));
    }

    #[test]
    fn test_close_frame_terminates() {
        let mut parser = FrameParser::server(1024);
        assert_eq!(parser.push(&close_frame()), Err(FrameError::RemoteClose));
    }

    #[test]
    fn test_unknown_opcode_terminates() {
        let mut parser = FrameParser::server(1024);
        assert_eq!(parser.push(&[0x83]), Err(FrameError::UnsupportedOpcode(3)));
    }

    #[test]
    fn test_frames_before_a_close_still_deliver() {
        let mut bytes = encode_frame(b"last words", true, None);
        bytes.extend(close_frame());
        let mut parser = FrameParser::client(1024);
        let events = parser.push(&bytes).unwrap();
        assert_eq!(
            events,
            vec![FrameEvent::Message { payload: b"last words".to_vec(), binary: true }]
        );
        // The close surfaces on the next push.
        assert_eq!(parser.push(&[]), Err(FrameError::RemoteClose));
    }

    #[test]
    fn test_oversized_buffer_rejected() {
        let mut parser = FrameParser::server(16);
        assert!(parser.push(&[0x82, 0x7E]).is_ok());
        assert!(matches!(parser.push(&vec![0u8; 32]), Err(FrameError::Oversized { .. })));
    }

    #[test]
    fn test_server_assumes_masking() {
        // Mask bit unset, but server-side parsing still unmasks.
        let mut frame = vec![0x82, 5];
        frame.extend_from_slice(&[1, 2, 3, 4]);
        frame.extend(b"abcde".iter().enumerate().map(|(i, b)| b ^ [1u8, 2, 3, 4][i % 4]));
        let mut parser = FrameParser::server(1024);
        assert_eq!(collect_messages(&mut parser, &frame), vec![b"abcde".to_vec()]);
    }
}
