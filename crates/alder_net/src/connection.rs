//! A framed, non-blocking socket connection.
//!
//! Wraps a `TcpStream` with the frame dialect negotiated during the
//! handshake, byte accounting, and a write-behind buffer so a slow
//! peer can not stall the poll loop.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};

use crate::error::NetError;
use crate::frame::{self, FrameEvent, FrameParser};
use crate::handshake::ProtocolVersion;
use crate::legacy::{self, LegacyParser};
use crate::rng::SeededRng;

/// Which end of the connection this is; clients mask their frames,
/// servers never do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// Payload and raw byte counters for one connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ByteStats {
    /// Payload bytes handed to [`Connection::send`].
    pub send: u64,
    /// Framed bytes queued for the socket.
    pub send_raw: u64,
    /// Payload bytes surfaced from complete frames.
    pub received: u64,
    /// Bytes read off the socket.
    pub received_raw: u64,
}

#[derive(Debug)]
enum Parser {
    Modern(FrameParser),
    Legacy(LegacyParser),
}

/// One framed peer connection.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    parser: Parser,
    version: ProtocolVersion,
    role: Role,
    stats: ByteStats,
    open: bool,
    out_buf: Vec<u8>,
    mask_rng: SeededRng,
    peer: SocketAddr,
    /// A frame violation observed after complete frames in the same
    /// read; surfaced on the next poll so those frames deliver first.
    deferred: Option<NetError>,
}

impl Connection {
    /// Wraps an already-upgraded stream. The stream must be in
    /// non-blocking mode.
    pub fn new(
        stream: TcpStream,
        version: ProtocolVersion,
        role: Role,
        max_buffered: usize,
        mask_seed: u32,
    ) -> Result<Self, NetError> {
        let peer = stream.peer_addr()?;
        let parser = match version {
            ProtocolVersion::Modern => Parser::Modern(match role {
                Role::Server => FrameParser::server(max_buffered),
                Role::Client => FrameParser::client(max_buffered),
            }),
            ProtocolVersion::Draft76 | ProtocolVersion::Draft75 => {
                Parser::Legacy(LegacyParser::new(max_buffered))
            }
        };
        Ok(Self {
            stream,
            parser,
            version,
            role,
            stats: ByteStats::default(),
            open: true,
            out_buf: Vec::new(),
            mask_rng: SeededRng::new(mask_seed),
            peer,
            deferred: None,
        })
    }

    #[must_use]
    pub const fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.open
    }

    #[must_use]
    pub const fn stats(&self) -> ByteStats {
        self.stats
    }

    #[must_use]
    pub const fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Frames and queues a payload, returning the raw frame length.
    ///
    /// # Errors
    ///
    /// Fails if the connection is closed or the socket reports a hard
    /// error while flushing.
    pub fn send(&mut self, payload: &[u8], binary: bool) -> Result<usize, NetError> {
        if !self.open {
            return Err(NetError::ConnectionClosed);
        }
        let frame = match self.version {
            ProtocolVersion::Modern => {
                let mask = match self.role {
                    Role::Server => None,
                    Role::Client => Some(self.mask_rng.next_u32().to_be_bytes()),
                };
                frame::encode_frame(payload, binary, mask)
            }
            ProtocolVersion::Draft76 | ProtocolVersion::Draft75 => {
                legacy::encode_legacy_frame(payload)
            }
        };
        let raw_len = frame.len();
        self.stats.send += payload.len() as u64;
        self.stats.send_raw += raw_len as u64;
        self.out_buf.extend_from_slice(&frame);
        self.flush()?;
        Ok(raw_len)
    }

    /// Queues already-framed bytes, bypassing the frame writer and the
    /// payload counters. Used for the handshake response, which is the
    /// one thing sent outside the frame dialect.
    pub(crate) fn queue_raw(&mut self, bytes: &[u8]) {
        self.out_buf.extend_from_slice(bytes);
    }

    /// Pushes buffered output to the socket until it would block.
    pub fn flush(&mut self) -> Result<(), NetError> {
        while !self.out_buf.is_empty() {
            match self.stream.write(&self.out_buf) {
                Ok(0) => {
                    self.open = false;
                    return Err(NetError::ConnectionClosed);
                }
                Ok(n) => {
                    self.out_buf.drain(..n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    self.open = false;
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Drains the socket and returns complete message payloads.
    ///
    /// Pings are answered in place and pongs are swallowed; neither
    /// reaches the caller.
    ///
    /// # Errors
    ///
    /// [`NetError::ConnectionClosed`] on a clean remote shutdown; a
    /// frame error when the peer violated the protocol. Both leave the
    /// connection closed.
    pub fn poll(&mut self) -> Result<Vec<Vec<u8>>, NetError> {
        if !self.open {
            return Err(NetError::ConnectionClosed);
        }
        if let Some(e) = self.deferred.take() {
            self.open = false;
            return Err(e);
        }
        self.flush()?;

        let mut payloads = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    if payloads.is_empty() {
                        self.open = false;
                        return Err(NetError::ConnectionClosed);
                    }
                    self.deferred = Some(NetError::ConnectionClosed);
                    break;
                }
                Ok(n) => {
                    self.stats.received_raw += n as u64;
                    let events = match &mut self.parser {
                        Parser::Modern(p) => p.push(&buf[..n]),
                        Parser::Legacy(p) => p.push(&buf[..n]),
                    };
                    let events = match events {
                        Ok(events) => events,
                        Err(e) => {
                            if payloads.is_empty() {
                                self.open = false;
                                return Err(e.into());
                            }
                            self.deferred = Some(e.into());
                            break;
                        }
                    };
                    for event in events {
                        match event {
                            FrameEvent::Message { payload, .. } => {
                                self.stats.received += payload.len() as u64;
                                payloads.push(payload);
                            }
                            FrameEvent::Ping(payload) => {
                                self.out_buf.extend_from_slice(&frame::encode_pong(&payload));
                            }
                            FrameEvent::Pong(_) => {}
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    if payloads.is_empty() {
                        self.open = false;
                        return Err(e.into());
                    }
                    self.deferred = Some(e.into());
                    break;
                }
            }
        }
        if self.deferred.is_none() {
            self.flush()?;
        }
        Ok(payloads)
    }

    /// Sends a best-effort close frame and shuts the socket down.
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        let close_bytes: [u8; 2] = match self.version {
            ProtocolVersion::Modern => frame::close_frame(),
            ProtocolVersion::Draft76 | ProtocolVersion::Draft75 => [0xFF, 0x00],
        };
        let _ = self.stream.write(&close_bytes);
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Reads whatever a raw socket has buffered into `buf`. Returns
/// `false` when the peer is gone or `buf` exceeded `limit`.
pub(crate) fn read_available(stream: &mut TcpStream, buf: &mut Vec<u8>, limit: usize) -> bool {
    let mut tmp = [0u8; 1024];
    loop {
        match stream.read(&mut tmp) {
            Ok(0) => return false,
            Ok(n) => {
                buf.extend_from_slice(&tmp[..n]);
                if buf.len() > limit {
                    return false;
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => return true,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(_) => return false,
        }
    }
}

/// Writes a short message to a raw socket; gives up after a bounded
/// number of retries rather than stalling the poll loop.
pub(crate) fn write_best_effort(stream: &mut TcpStream, mut bytes: &[u8]) {
    let mut retries = 0;
    while !bytes.is_empty() && retries < 50 {
        match stream.write(bytes) {
            Ok(0) => break,
            Ok(n) => bytes = &bytes[n..],
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                retries += 1;
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::{Duration, Instant};

    fn pair() -> (Connection, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client_stream = TcpStream::connect(addr).unwrap();
        let (server_stream, _) = listener.accept().unwrap();
        client_stream.set_nonblocking(true).unwrap();
        server_stream.set_nonblocking(true).unwrap();
        let server =
            Connection::new(server_stream, ProtocolVersion::Modern, Role::Server, 32_768, 1)
                .unwrap();
        let client =
            Connection::new(client_stream, ProtocolVersion::Modern, Role::Client, 32_768, 2)
                .unwrap();
        (server, client)
    }

    fn poll_until(conn: &mut Connection, want: usize) -> Vec<Vec<u8>> {
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut got = Vec::new();
        while got.len() < want && Instant::now() < deadline {
            got.extend(conn.poll().unwrap());
            std::thread::sleep(Duration::from_millis(1));
        }
        got
    }

    #[test]
    fn test_masked_loopback_round_trip() {
        let (mut server, mut client) = pair();
        let raw = client.send(b"hello server", true).unwrap();
        assert!(raw > b"hello server".len());

        let payloads = poll_until(&mut server, 1);
        assert_eq!(payloads, vec![b"hello server".to_vec()]);
        assert_eq!(server.stats().received, 12);

        server.send(b"hello client", true).unwrap();
        let payloads = poll_until(&mut client, 1);
        assert_eq!(payloads, vec![b"hello client".to_vec()]);
        assert_eq!(client.stats().send, 12);
    }

    #[test]
    fn test_send_after_close_fails() {
        let (mut server, _client) = pair();
        server.close();
        assert!(matches!(server.send(b"late", true), Err(NetError::ConnectionClosed)));
    }
}
