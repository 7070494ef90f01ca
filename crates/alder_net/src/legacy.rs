//! Sentinel-framed messages for the old handshake drafts.
//!
//! Drafts 75 and 76 frame a text message as `0x00 payload 0xFF`. A
//! byte with the high bit set opens a close sequence terminated by a
//! 0x00 byte.

use crate::frame::{FrameError, FrameEvent};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LegacyState {
    Idle,
    Text,
    Closing,
}

/// Incremental parser for sentinel-framed streams.
#[derive(Debug)]
pub struct LegacyParser {
    frame: Vec<u8>,
    state: LegacyState,
    max_buffered: usize,
    failed: Option<FrameError>,
}

impl LegacyParser {
    #[must_use]
    pub fn new(max_buffered: usize) -> Self {
        Self { frame: Vec::new(), state: LegacyState::Idle, max_buffered, failed: None }
    }

    /// Feeds raw socket bytes, returning completed messages.
    ///
    /// # Errors
    ///
    /// A close sequence or an over-long frame terminates the stream.
    /// Messages completed earlier in the same read are returned first
    /// and the error surfaces on the next call.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<FrameEvent>, FrameError> {
        if let Some(err) = self.failed {
            return Err(err);
        }
        let mut events = Vec::new();
        for &byte in data {
            match self.state {
                LegacyState::Idle => {
                    self.state = if byte & 0x80 != 0 { LegacyState::Closing } else { LegacyState::Text };
                }
                LegacyState::Text => {
                    if byte == 0xFF {
                        let payload = std::mem::take(&mut self.frame);
                        events.push(FrameEvent::Message { payload, binary: false });
                        self.state = LegacyState::Idle;
                    } else {
                        if self.frame.len() >= self.max_buffered {
                            let err = FrameError::Oversized {
                                buffered: self.frame.len() + 1,
                                limit: self.max_buffered,
                            };
                            return self.fail(events, err);
                        }
                        self.frame.push(byte);
                    }
                }
                LegacyState::Closing => {
                    if byte == 0x00 {
                        return self.fail(events, FrameError::RemoteClose);
                    }
                }
            }
        }
        Ok(events)
    }

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
}

/// Wraps a payload in sentinel framing.
#[must_use]
pub fn encode_legacy_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 2);
    out.push(0x00);
    out.extend_from_slice(payload);
    out.push(0xFF);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut parser = LegacyParser::new(1024);
        let events = parser.push(&encode_legacy_frame(b"old school")).unwrap();
        assert_eq!(
            events,
            vec![FrameEvent::Message { payload: b"old school".to_vec(), binary: false }]
        );
    }

    #[test]
    fn test_split_across_reads() {
        let frame = encode_legacy_frame(b"pieces");
        let mut parser = LegacyParser::new(1024);
        assert!(parser.push(&frame[..3]).unwrap().is_empty());
        let events = parser.push(&frame[3..]).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_close_sequence() {
        let mut parser = LegacyParser::new(1024);
        assert_eq!(parser.push(&[0xFF, 0x00]), Err(FrameError::RemoteClose));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut parser = LegacyParser::new(4);
        assert!(matches!(
            parser.push(&[0x00, b'a', b'b', b'c', b'd', b'e']),
            Err(FrameError::Oversized { .. })
        ));
    }
}
