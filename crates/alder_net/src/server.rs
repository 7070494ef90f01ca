//! Authoritative game server.
//!
//! Single-threaded and poll-driven: [`GameServer::poll`] accepts new
//! sockets, completes handshakes, routes client messages, and advances
//! the tick clock, firing [`ServerHandler`] callbacks along the way.
//! The server is the tick authority; every `sync_rate` ticks it
//! broadcasts the wrapped tick that clients anchor to.

use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use alder_codec::{decode, encode, Value};

use crate::clock::{ClockEvent, ServerClock};
use crate::connection::{read_available, write_best_effort, ByteStats, Connection, Role};
use crate::error::NetError;
use crate::handshake::{self, HandshakeError, HttpRequest};
use crate::message::{ControlCode, ErrorCode, Message, MessageTable, WireMessage};
use crate::registry::{ClientId, Registry};
use crate::rng::SeededRng;
use crate::{MAX_MESSAGE_LENGTH, PROTOCOL_VERSION};

/// Server session parameters.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Listen address.
    pub bind: SocketAddr,
    /// Ticks per second.
    pub tick_rate: u32,
    /// Logic steps run every `logic_rate` ticks.
    pub logic_rate: u32,
    /// Wrapped-tick broadcasts go out every `sync_rate` ticks.
    pub sync_rate: u32,
    /// Per-peer cap on bytes buffered without a complete frame.
    pub max_message_length: usize,
    /// Optional symbolic names announced to clients; a name's position
    /// becomes its message kind.
    pub message_types: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 4000)),
            tick_rate: 30,
            logic_rate: 2,
            sync_rate: 30,
            max_message_length: MAX_MESSAGE_LENGTH,
            message_types: Vec::new(),
        }
    }
}

/// Application callbacks fired from inside [`GameServer::poll`].
#[allow(unused_variables)]
pub trait ServerHandler {
    /// The session started and the listener is accepting.
    fn started(&mut self, ctx: &mut ServerContext) {}

    /// One logic step. Runs after the shared random source has been
    /// reseeded to `tick`.
    fn update(&mut self, ctx: &mut ServerContext, time_ms: u64, tick: u64) {}

    /// The session stopped and every connection is closed.
    fn stopped(&mut self) {}

    /// A client completed the CONNECT exchange.
    fn connected(&mut self, ctx: &mut ServerContext, client: ClientId) {}

    /// An established client went away. `by_remote` is true when the
    /// peer violated the protocol.
    fn disconnected(&mut self, ctx: &mut ServerContext, client: ClientId, by_remote: bool) {}

    /// An application message from an established client.
    fn message(&mut self, ctx: &mut ServerContext, client: ClientId, kind: i64, tick: u64, payload: &[Value]) {}

    /// A plain HTTP request on the game port. Return the raw response
    /// bytes to write before the socket closes.
    fn request(&mut self, request: &HttpRequest) -> Option<Vec<u8>> {
        None
    }
}

/// A socket that has connected but not finished its HTTP upgrade.
struct PendingPeer {
    stream: TcpStream,
    addr: SocketAddr,
    buf: Vec<u8>,
}

/// An upgraded peer. `established` flips once CONNECT is accepted.
struct Peer {
    conn: Connection,
    established: bool,
}

/// Everything the server owns apart from the handler. Handler
/// callbacks receive it mutably so they can send and broadcast from
/// inside the poll loop.
pub struct ServerContext {
    config: ServerConfig,
    listener: Option<TcpListener>,
    pending: Vec<PendingPeer>,
    peers: Registry<Peer>,
    clock: ServerClock,
    rng: SeededRng,
    table: MessageTable,
    seed: u32,
    bytes_sent: u64,
    running: bool,
}

impl ServerContext {
    fn new(config: ServerConfig) -> Self {
        let clock = ServerClock::new(config.tick_rate, config.logic_rate, config.sync_rate);
        let table = MessageTable::new(config.message_types.clone());
        Self {
            config,
            listener: None,
            pending: Vec::new(),
            peers: Registry::new(),
            clock,
            rng: SeededRng::new(0),
            table,
            seed: 0,
            bytes_sent: 0,
            running: false,
        }
    }

    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running
    }

    /// The next tick to be consumed by the clock.
    #[must_use]
    pub const fn tick(&self) -> u64 {
        self.clock.tick()
    }

    /// Tick-domain time in milliseconds.
    #[must_use]
    pub const fn time_ms(&self) -> u64 {
        self.clock.time_ms()
    }

    /// The seed shared with every client at CONNECT time.
    #[must_use]
    pub const fn seed(&self) -> u32 {
        self.seed
    }

    /// The next value of the shared random sequence.
    pub fn random(&mut self) -> f64 {
        self.rng.next_f64()
    }

    /// The actual listen address, once started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Ids of every established client, in join order.
    #[must_use]
    pub fn client_ids(&self) -> Vec<ClientId> {
        self.peers
            .iter()
            .filter(|(_, peer)| peer.established)
            .map(|(id, _)| id)
            .collect()
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.peers.iter().filter(|(_, peer)| peer.established).count()
    }

    /// Byte counters for one peer.
    #[must_use]
    pub fn stats_for(&self, client: ClientId) -> Option<ByteStats> {
        self.peers.get(client).map(|peer| peer.conn.stats())
    }

    /// Total raw bytes queued for all peers over the session.
    #[must_use]
    pub const fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    #[must_use]
    pub const fn message_table(&self) -> &MessageTable {
        &self.table
    }

    /// Sends `[kind, tick, payload...]` to one client, stamping the
    /// current tick. Returns the raw frame length.
    pub fn send(&mut self, client: ClientId, kind: i64, payload: Vec<Value>) -> Result<usize, NetError> {
        let message = Message::new(kind, self.clock.tick(), payload);
        let bytes = encode(&message.to_value())?;
        let peer = self.peers.get_mut(client).ok_or(NetError::ConnectionClosed)?;
        let raw = peer.conn.send(&bytes, true)?;
        self.bytes_sent += raw as u64;
        Ok(raw)
    }

    /// Broadcasts `[kind, tick, payload...]` to every established
    /// client. Returns the total raw bytes queued.
    pub fn broadcast(&mut self, kind: i64, payload: Vec<Value>) -> Result<u64, NetError> {
        let message = Message::new(kind, self.clock.tick(), payload);
        let bytes = encode(&message.to_value())?;
        Ok(self.broadcast_bytes(&bytes))
    }

    /// Send errors here are left for the next poll sweep to collect;
    /// a broadcast must reach the healthy peers regardless.
    fn broadcast_bytes(&mut self, bytes: &[u8]) -> u64 {
        let mut total = 0u64;
        for (_, peer) in self.peers.iter_mut() {
            if !peer.established {
                continue;
            }
            if let Ok(raw) = peer.conn.send(bytes, true) {
                total += raw as u64;
            }
        }
        self.bytes_sent += total;
        total
    }
}

/// The server session shell.
pub struct GameServer<H: ServerHandler> {
    handler: H,
    ctx: ServerContext,
}

impl<H: ServerHandler> GameServer<H> {
    #[must_use]
    pub fn new(config: ServerConfig, handler: H) -> Self {
        Self { handler, ctx: ServerContext::new(config) }
    }

    #[must_use]
    pub fn context(&self) -> &ServerContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut ServerContext {
        &mut self.ctx
    }

    #[must_use]
    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Binds the listener and starts the tick clock.
    ///
    /// # Errors
    ///
    /// Fails if already running or if the bind fails.
    pub fn start(&mut self) -> Result<(), NetError> {
        if self.ctx.running {
            return Err(NetError::AlreadyRunning);
        }
        let listener = TcpListener::bind(self.ctx.config.bind)?;
        listener.set_nonblocking(true)?;

        self.ctx.seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| (d.as_nanos() & 0xFFFF_FFFF) as u32);
        self.ctx.rng = SeededRng::new(self.ctx.seed);
        self.ctx.listener = Some(listener);
        self.ctx.clock.start(Instant::now());
        self.ctx.running = true;

        info!(
            addr = ?self.ctx.local_addr(),
            tick_rate = self.ctx.config.tick_rate,
            "server started"
        );
        self.handler.started(&mut self.ctx);
        Ok(())
    }

    /// One pass of the poll loop: accept, handshake, route, tick.
    ///
    /// # Errors
    ///
    /// Fails if the server is not running. Peer-level failures close
    /// that peer and are not surfaced here.
    pub fn poll(&mut self, now: Instant) -> Result<(), NetError> {
        if !self.ctx.running {
            return Err(NetError::NotRunning);
        }
        self.accept_new();
        self.pump_handshakes();
        self.pump_peers();
        self.advance_clock(now);
        Ok(())
    }

    /// Broadcasts STOP, closes every connection and stops the clock.
    ///
    /// # Errors
    ///
    /// Fails if the server is not running.
    pub fn stop(&mut self) -> Result<(), NetError> {
        if !self.ctx.running {
            return Err(NetError::NotRunning);
        }
        let _ = self.ctx.broadcast(ControlCode::Stop.kind(), Vec::new());
        for id in self.ctx.peers.ids() {
            self.drop_peer(id, false);
        }
        self.ctx.pending.clear();
        self.ctx.listener = None;
        self.ctx.clock.stop();
        self.ctx.running = false;
        info!("server stopped");
        self.handler.stopped();
        Ok(())
    }

    fn accept_new(&mut self) {
        loop {
            let Some(listener) = &self.ctx.listener else { return };
            match listener.accept() {
                Ok((stream, addr)) => {
                    if stream.set_nonblocking(true).is_err() {
                        continue;
                    }
                    let _ = stream.set_nodelay(true);
                    debug!(%addr, "socket accepted");
                    self.ctx.pending.push(PendingPeer { stream, addr, buf: Vec::new() });
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn pump_handshakes(&mut self) {
        let pending = std::mem::take(&mut self.ctx.pending);
        for mut p in pending {
            if !read_available(&mut p.stream, &mut p.buf, self.ctx.config.max_message_length) {
                debug!(addr = %p.addr, "socket dropped before handshake");
                continue;
            }
            let request = match handshake::parse_http_request(&p.buf) {
                Ok(None) => {
                    self.ctx.pending.push(p);
                    continue;
                }
                Ok(Some(request)) => request,
                Err(e) => {
                    debug!(addr = %p.addr, error = %e, "malformed request");
                    continue;
                }
            };

            if !request.is_upgrade() {
                // Plain HTTP on the game port: let the application
                // answer, then close.
                if let Some(response) = self.handler.request(&request) {
                    write_best_effort(&mut p.stream, &response);
                }
                continue;
            }

            match handshake::negotiate(&request) {
                Ok((version, response)) => {
                    let conn = Connection::new(
                        p.stream,
                        version,
                        Role::Server,
                        self.ctx.config.max_message_length,
                        self.ctx.rng.next_u32(),
                    );
                    let Ok(mut conn) = conn else { continue };
                    conn.queue_raw(&response);
                    let _ = conn.flush();
                    let id = self.ctx.peers.allocate_id();
                    if self.ctx.peers.insert(id, Peer { conn, established: false }).is_ok() {
                        info!(%id, addr = %p.addr, ?version, "peer upgraded");
                    }
                }
                Err(HandshakeError::IncompleteBody) => self.ctx.pending.push(p),
                Err(e) => {
                    // Rejected upgrades close with no response at all.
                    debug!(addr = %p.addr, error = %e, "handshake rejected");
                }
            }
        }
    }

    fn pump_peers(&mut self) {
        for id in self.ctx.peers.ids() {
            let Some(peer) = self.ctx.peers.get_mut(id) else { continue };
            match peer.conn.poll() {
                Ok(payloads) => {
                    for payload in payloads {
                        if !self.route(id, &payload) {
                            break;
                        }
                    }
                }
                Err(NetError::ConnectionClosed) => self.drop_peer(id, false),
                Err(e) => {
                    warn!(%id, error = %e, "closing peer");
                    self.drop_peer(id, true);
                }
            }
        }
    }

    /// Routes one decoded payload. Returns `false` once the peer has
    /// been closed and later payloads from the same read must drop.
    fn route(&mut self, id: ClientId, bytes: &[u8]) -> bool {
        let value = match decode(bytes) {
            Ok(value) => value,
            Err(e) => {
                debug!(%id, error = %e, "undecodable payload");
                self.fail_peer(id, ErrorCode::InvalidData);
                return false;
            }
        };
        let message = match WireMessage::from_value(value) {
            Ok(WireMessage::Envelope(message)) => message,
            // Bare sync ticks only ever flow server to client.
            Ok(WireMessage::SyncTick(_)) | Err(_) => {
                self.fail_peer(id, ErrorCode::MessageTooShort);
                return false;
            }
        };

        match ControlCode::from_kind(message.kind) {
            Some(ControlCode::Connect) => self.route_connect(id, &message),
            Some(ControlCode::Sync) => {
                // Latency probe: echo the payload straight back.
                let _ = self.ctx.send(id, ControlCode::Sync.kind(), message.payload);
                true
            }
            _ => {
                let established = self.ctx.peers.get(id).is_some_and(|p| p.established);
                if established {
                    self.handler.message(
                        &mut self.ctx,
                        id,
                        message.kind,
                        message.tick,
                        &message.payload,
                    );
                } else {
                    debug!(%id, kind = message.kind, "message before connect ignored");
                }
                true
            }
        }
    }

    fn route_connect(&mut self, id: ClientId, message: &Message) -> bool {
        let established = self.ctx.peers.get(id).is_some_and(|p| p.established);
        if established {
            self.fail_peer(id, ErrorCode::AlreadyConnected);
            return false;
        }
        let version = message.payload.first().and_then(Value::as_str);
        if version != Some(PROTOCOL_VERSION) {
            self.fail_peer(id, ErrorCode::UnsupportedVersion);
            return false;
        }

        if let Some(peer) = self.ctx.peers.get_mut(id) {
            peer.established = true;
        }
        let _ = self.ctx.send(id, ControlCode::Connect.kind(), vec![Value::Int(i64::from(id.0))]);

        let mut start = vec![
            Value::Int(i64::from(self.ctx.config.tick_rate)),
            Value::Int(i64::from(self.ctx.config.logic_rate)),
            Value::Int(i64::from(self.ctx.config.sync_rate)),
            Value::Int(i64::from(self.ctx.seed)),
        ];
        if !self.ctx.table.is_empty() {
            start.push(self.ctx.table.to_value());
        }
        let _ = self.ctx.send(id, ControlCode::Start.kind(), start);

        info!(%id, "client connected");
        self.handler.connected(&mut self.ctx, id);
        true
    }

    /// Reports a protocol error to the peer, then closes it.
    fn fail_peer(&mut self, id: ClientId, code: ErrorCode) {
        warn!(%id, code = code.code(), "protocol error");
        let _ = self.ctx.send(id, ControlCode::Error.kind(), vec![Value::Int(code.code())]);
        self.drop_peer(id, false);
    }

    fn drop_peer(&mut self, id: ClientId, by_remote: bool) {
        if let Ok(mut peer) = self.ctx.peers.remove(id) {
            peer.conn.close();
            if peer.established {
                info!(%id, by_remote, "client disconnected");
                self.handler.disconnected(&mut self.ctx, id, by_remote);
            }
        }
    }

    fn advance_clock(&mut self, now: Instant) {
        let mut events = Vec::new();
        self.ctx.clock.advance(now, &mut events);
        for event in events {
            match event {
                ClockEvent::Sync(wrapped) => {
                    if let Ok(bytes) = encode(&Value::Int(i64::from(wrapped))) {
                        self.ctx.broadcast_bytes(&bytes);
                    }
                }
                ClockEvent::Logic { time_ms, tick } => {
                    self.ctx.rng.reseed_from_tick(tick);
                    self.handler.update(&mut self.ctx, time_ms, tick);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullHandler;
    impl ServerHandler for NullHandler {}

    #[test]
    fn test_poll_and_stop_require_running() {
        let mut server = GameServer::new(ServerConfig::default(), NullHandler);
        assert!(matches!(server.poll(Instant::now()), Err(NetError::NotRunning)));
        assert!(matches!(server.stop(), Err(NetError::NotRunning)));
    }

    #[test]
    fn test_double_start_fails() {
        let config = ServerConfig {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..ServerConfig::default()
        };
        let mut server = GameServer::new(config, NullHandler);
        server.start().unwrap();
        assert!(matches!(server.start(), Err(NetError::AlreadyRunning)));
        server.stop().unwrap();
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.tick_rate, 30);
        assert_eq!(config.max_message_length, MAX_MESSAGE_LENGTH);
        assert!(config.message_types.is_empty());
    }
}
