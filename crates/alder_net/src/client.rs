//! Game client session.
//!
//! Connects over the modern handshake, performs the CONNECT exchange,
//! then follows the server's tick. Messages stamped for a tick the
//! local estimate has not reached yet wait in a pending queue and are
//! replayed, in arrival order, once the clock catches up.

use std::net::{SocketAddr, TcpStream};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::{debug, info, warn};

use alder_codec::{decode, encode, Value};

use crate::clock::{ClientClock, StartParams};
use crate::connection::{read_available, write_best_effort, ByteStats, Connection, Role};
use crate::error::NetError;
use crate::handshake::{self, HandshakeError, ProtocolVersion};
use crate::message::{ControlCode, Message, MessageTable, WireMessage};
use crate::queue::PendingQueue;
use crate::registry::ClientId;
use crate::rng::SeededRng;
use crate::{MAX_MESSAGE_LENGTH, PROTOCOL_VERSION};

/// Client session parameters.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Cap on bytes buffered without a complete frame.
    pub max_message_length: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { max_message_length: MAX_MESSAGE_LENGTH }
    }
}

/// Application callbacks fired from inside [`GameClient::poll`].
#[allow(unused_variables)]
pub trait ClientHandler {
    /// START arrived and the tick clock is following the server.
    fn started(&mut self, ctx: &mut ClientContext) {}

    /// One logic step. Runs after the shared random source has been
    /// reseeded to `tick`.
    fn update(&mut self, ctx: &mut ClientContext, time_ms: u64, tick: u64) {}

    /// The session ended, either by a STOP message or a disconnect.
    fn stopped(&mut self) {}

    /// The server acknowledged CONNECT and assigned our id.
    fn connected(&mut self, ctx: &mut ClientContext, client: ClientId) {}

    /// Immediate delivery of an application message, ahead of any tick
    /// gating. Return `true` to consume it; returning `false` leaves
    /// it to the synced path.
    fn message(&mut self, ctx: &mut ClientContext, kind: i64, tick: u64, payload: &[Value]) -> bool {
        false
    }

    /// Tick-gated delivery: the local tick has reached the stamp.
    fn synced_message(&mut self, ctx: &mut ClientContext, kind: i64, tick: u64, payload: &[Value]) {}

    /// The server reported a protocol error and will close on us.
    fn error(&mut self, ctx: &mut ClientContext, code: i64) {}

    /// The transport closed. `by_remote` is true when the peer
    /// violated the protocol.
    fn closed(&mut self, by_remote: bool) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ClientState {
    Disconnected,
    Handshaking,
    Connected,
}

/// Everything the client owns apart from the handler and the pending
/// queue. Handler callbacks receive it mutably so they can send from
/// inside the poll loop.
pub struct ClientContext {
    config: ClientConfig,
    state: ClientState,
    hs_stream: Option<TcpStream>,
    hs_buf: Vec<u8>,
    hs_key: String,
    conn: Option<Connection>,
    clock: ClientClock,
    rng: SeededRng,
    table: Option<MessageTable>,
    client_id: Option<ClientId>,
    last_tick: u64,
    stop_requested: bool,
    now: Instant,
}

impl ClientContext {
    fn new(config: ClientConfig) -> Self {
        Self {
            config,
            state: ClientState::Disconnected,
            hs_stream: None,
            hs_buf: Vec::new(),
            hs_key: String::new(),
            conn: None,
            clock: ClientClock::new(),
            rng: SeededRng::new(0),
            table: None,
            client_id: None,
            last_tick: 0,
            stop_requested: false,
            now: Instant::now(),
        }
    }

    /// Whether the transport is up and CONNECT has been sent.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state == ClientState::Connected
    }

    /// Whether START has arrived and the tick clock is live.
    #[must_use]
    pub const fn is_syncing(&self) -> bool {
        self.clock.is_syncing()
    }

    /// Current estimate of the server tick.
    #[must_use]
    pub fn tick(&self) -> u64 {
        self.clock.tick_estimate(self.now)
    }

    /// Tick-domain session time in milliseconds, anchored to the last
    /// sync broadcast like [`ClientContext::tick`].
    #[must_use]
    pub fn time_ms(&self) -> u64 {
        self.clock.time_ms(self.now)
    }

    /// Latest one-way latency estimate in milliseconds.
    #[must_use]
    pub const fn ping_ms(&self) -> f64 {
        self.clock.ping_ms()
    }

    /// The id the server assigned at CONNECT time.
    #[must_use]
    pub const fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    /// The name table announced in START, if the server sent one.
    #[must_use]
    pub const fn message_table(&self) -> Option<&MessageTable> {
        self.table.as_ref()
    }

    /// The next value of the shared random sequence.
    pub fn random(&mut self) -> f64 {
        self.rng.next_f64()
    }

    /// Byte counters for this connection.
    #[must_use]
    pub fn stats(&self) -> Option<ByteStats> {
        self.conn.as_ref().map(Connection::stats)
    }

    /// Sends `[kind, tick, payload...]`, stamping the current tick
    /// estimate (zero before the clock starts). Returns the raw frame
    /// length.
    pub fn send(&mut self, kind: i64, payload: Vec<Value>) -> Result<usize, NetError> {
        let tick = if self.clock.is_syncing() { self.clock.tick_estimate(self.now) } else { 0 };
        let message = Message::new(kind, tick, payload);
        let bytes = encode(&message.to_value())?;
        let conn = self.conn.as_mut().ok_or(NetError::ConnectionClosed)?;
        conn.send(&bytes, true)
    }
}

/// The client session shell.
pub struct GameClient<H: ClientHandler> {
    handler: H,
    queue: PendingQueue,
    ctx: ClientContext,
}

impl<H: ClientHandler> GameClient<H> {
    #[must_use]
    pub fn new(config: ClientConfig, handler: H) -> Self {
        Self { handler, queue: PendingQueue::new(), ctx: ClientContext::new(config) }
    }

    #[must_use]
    pub fn context(&self) -> &ClientContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut ClientContext {
        &mut self.ctx
    }

    #[must_use]
    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Opens the socket and sends the upgrade request. The handshake
    /// itself completes over subsequent [`GameClient::poll`] calls.
    ///
    /// # Errors
    ///
    /// Fails if already connected or if the socket can not be opened.
    pub fn connect(&mut self, addr: SocketAddr) -> Result<(), NetError> {
        if self.ctx.state != ClientState::Disconnected {
            return Err(NetError::AlreadyRunning);
        }
        let mut stream = TcpStream::connect(addr)?;
        stream.set_nonblocking(true)?;
        let _ = stream.set_nodelay(true);

        self.ctx.hs_key = generate_key();
        let request = handshake::client_request(&addr.to_string(), &self.ctx.hs_key);
        write_best_effort(&mut stream, request.as_bytes());

        self.ctx.hs_stream = Some(stream);
        self.ctx.hs_buf.clear();
        self.ctx.state = ClientState::Handshaking;
        self.ctx.now = Instant::now();
        info!(%addr, "connecting");
        Ok(())
    }

    /// One pass of the poll loop: handshake or message pump, catch-up
    /// logic ticks, latency probe.
    ///
    /// # Errors
    ///
    /// Fails if disconnected, or terminally during the handshake.
    /// Transport failures after the handshake close the session and
    /// surface through [`ClientHandler::closed`] instead.
    pub fn poll(&mut self, now: Instant) -> Result<(), NetError> {
        self.ctx.now = now;
        match self.ctx.state {
            ClientState::Disconnected => Err(NetError::NotRunning),
            ClientState::Handshaking => self.pump_handshake(),
            ClientState::Connected => {
                self.pump_messages();
                if self.ctx.state == ClientState::Connected {
                    self.run_ticks();
                    self.send_ping();
                }
                Ok(())
            }
        }
    }

    /// Closes the session voluntarily.
    ///
    /// # Errors
    ///
    /// Fails if not connected.
    pub fn disconnect(&mut self) -> Result<(), NetError> {
        if self.ctx.state == ClientState::Disconnected {
            return Err(NetError::NotRunning);
        }
        self.shutdown(false);
        Ok(())
    }

    /// Sends an application message. See [`ClientContext::send`].
    pub fn send(&mut self, kind: i64, payload: Vec<Value>) -> Result<usize, NetError> {
        self.ctx.send(kind, payload)
    }

    fn pump_handshake(&mut self) -> Result<(), NetError> {
        {
            let Some(stream) = self.ctx.hs_stream.as_mut() else {
                return Ok(());
            };
            if !read_available(stream, &mut self.ctx.hs_buf, self.ctx.config.max_message_length) {
                self.shutdown(false);
                return Err(NetError::ConnectionClosed);
            }
        }

        let response = match handshake::parse_http_response(&self.ctx.hs_buf) {
            Ok(None) => return Ok(()),
            Ok(Some(response)) => response,
            Err(e) => {
                self.shutdown(true);
                return Err(e.into());
            }
        };
        if response.status != 101 {
            self.shutdown(true);
            return Err(HandshakeError::BadStatus(response.status).into());
        }
        let expected = handshake::accept_token(&self.ctx.hs_key);
        if response.header("accept") != Some(expected.as_str()) {
            self.shutdown(true);
            return Err(HandshakeError::BadAccept.into());
        }
        if self.ctx.hs_buf.len() > response.consumed {
            // The server sends nothing before our CONNECT, so anything
            // trailing the response head is junk.
            debug!(bytes = self.ctx.hs_buf.len() - response.consumed, "discarding early bytes");
        }

        let Some(stream) = self.ctx.hs_stream.take() else {
            return Ok(());
        };
        self.ctx.hs_buf.clear();
        let conn = Connection::new(
            stream,
            ProtocolVersion::Modern,
            Role::Client,
            self.ctx.config.max_message_length,
            time_seed(),
        )?;
        self.ctx.conn = Some(conn);
        self.ctx.state = ClientState::Connected;
        self.ctx
            .send(ControlCode::Connect.kind(), vec![Value::Str(PROTOCOL_VERSION.to_owned())])?;
        info!("handshake complete");
        Ok(())
    }

    fn pump_messages(&mut self) {
        let result = match self.ctx.conn.as_mut() {
            Some(conn) => conn.poll(),
            None => return,
        };
        match result {
            Ok(payloads) => {
                for payload in payloads {
                    if self.ctx.state != ClientState::Connected {
                        break;
                    }
                    self.route(&payload);
                }
            }
            Err(NetError::ConnectionClosed) => self.shutdown(false),
            Err(e) => {
                warn!(error = %e, "closing connection");
                self.shutdown(true);
            }
        }
    }

    fn route(&mut self, bytes: &[u8]) {
        let Ok(value) = decode(bytes) else {
            warn!("undecodable payload from server");
            self.shutdown(true);
            return;
        };
        match WireMessage::from_value(value) {
            Ok(WireMessage::SyncTick(wrapped)) => {
                self.ctx.clock.observe_wrapped(wrapped, self.ctx.now);
            }
            Ok(WireMessage::Envelope(message)) => {
                if !Self::dispatch(&mut self.handler, &mut self.ctx, &message) {
                    self.queue.enqueue(message);
                }
                if self.ctx.stop_requested {
                    self.internal_stop();
                }
            }
            Err(_) => {
                warn!("malformed envelope from server");
                self.shutdown(true);
            }
        }
    }

    /// Runs one message through the delivery pipeline. Returns `true`
    /// when the message was consumed; `false` means it is tick-gated
    /// and must wait in the queue.
    fn dispatch(handler: &mut H, ctx: &mut ClientContext, message: &Message) -> bool {
        if Self::dispatch_immediate(handler, ctx, message) {
            return true;
        }
        if message.tick > 0 && message.tick > ctx.last_tick {
            return false;
        }
        Self::dispatch_synced(handler, ctx, message);
        true
    }

    fn dispatch_immediate(handler: &mut H, ctx: &mut ClientContext, message: &Message) -> bool {
        match ControlCode::from_kind(message.kind) {
            Some(ControlCode::Connect) => {
                let id = message.payload.first().and_then(Value::as_int).unwrap_or(0);
                let id = ClientId(id as u32);
                ctx.client_id = Some(id);
                info!(%id, "server acknowledged connect");
                handler.connected(ctx, id);
                true
            }
            Some(ControlCode::Start) => {
                Self::handle_start(handler, ctx, message);
                true
            }
            Some(ControlCode::Sync) => {
                if let Some(echoed) = message.payload.first().and_then(Value::as_int) {
                    ctx.clock.record_pong(echoed.max(0) as u64, ctx.now);
                }
                true
            }
            Some(ControlCode::Error) => {
                let code = message.payload.first().and_then(Value::as_int).unwrap_or(0);
                warn!(code, "server reported a protocol error");
                handler.error(ctx, code);
                true
            }
            // STOP is tick-gated like any game-state change.
            Some(ControlCode::Stop) => false,
            None => handler.message(ctx, message.kind, message.tick, &message.payload),
        }
    }

    fn handle_start(handler: &mut H, ctx: &mut ClientContext, message: &Message) {
        let field = |i: usize| message.payload.get(i).and_then(Value::as_int).unwrap_or(0);
        let params = StartParams {
            tick_rate: field(0).max(1) as u32,
            logic_rate: field(1).max(1) as u32,
            sync_rate: field(2).max(1) as u32,
            seed: field(3).max(0) as u32,
        };
        ctx.table = message
            .payload
            .get(4)
            .and_then(|v| MessageTable::from_value(v).ok());
        ctx.rng = SeededRng::new(params.seed);
        ctx.clock.start(params, message.tick, ctx.now);
        ctx.last_tick = message.tick;
        info!(
            tick_rate = params.tick_rate,
            seed = params.seed,
            anchor = message.tick,
            "session started"
        );
        handler.started(ctx);
    }

    fn dispatch_synced(handler: &mut H, ctx: &mut ClientContext, message: &Message) {
        if ControlCode::from_kind(message.kind) == Some(ControlCode::Stop) {
            ctx.stop_requested = true;
        } else {
            handler.synced_message(ctx, message.kind, message.tick, &message.payload);
        }
    }

    fn run_ticks(&mut self) {
        if !self.ctx.clock.is_syncing() {
            return;
        }
        self.drain_queue();
        if self.ctx.stop_requested {
            self.internal_stop();
            return;
        }

        let current = self.ctx.clock.tick_estimate(self.ctx.now);
        let logic = u64::from(self.ctx.clock.logic_rate());
        let period = self.ctx.clock.period_ms();
        for t in self.ctx.last_tick..current {
            if t > self.ctx.last_tick && t % logic == 0 {
                self.ctx.rng.reseed_from_tick(t);
                self.handler.update(&mut self.ctx, t * period, t);
                self.ctx.last_tick = t;
            }
        }
    }

    fn drain_queue(&mut self) {
        let handler = &mut self.handler;
        let ctx = &mut self.ctx;
        self.queue.drain(|message| Self::dispatch(handler, ctx, message));
    }

    fn send_ping(&mut self) {
        if let Some(echo) = self.ctx.clock.take_ping(self.ctx.now) {
            let _ = self.ctx.send(ControlCode::Sync.kind(), vec![Value::Int(echo as i64)]);
        }
    }

    /// A synced STOP: the server ended the session. The transport stays
    /// up until the server closes it.
    fn internal_stop(&mut self) {
        self.ctx.stop_requested = false;
        if !self.ctx.clock.is_syncing() {
            return;
        }
        self.ctx.clock.stop();
        self.queue.clear();
        info!("session stopped by server");
        self.handler.stopped();
    }

    fn shutdown(&mut self, by_remote: bool) {
        if self.ctx.state == ClientState::Disconnected {
            return;
        }
        if let Some(mut conn) = self.ctx.conn.take() {
            conn.close();
        }
        self.ctx.hs_stream = None;
        self.ctx.hs_buf.clear();
        let was_syncing = self.ctx.clock.is_syncing();
        self.ctx.clock.stop();
        self.queue.clear();
        self.ctx.state = ClientState::Disconnected;
        self.ctx.client_id = None;
        self.ctx.stop_requested = false;
        info!(by_remote, "connection closed");
        if was_syncing {
            self.handler.stopped();
        }
        self.handler.closed(by_remote);
    }
}

fn time_seed() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| (d.as_nanos() & 0xFFFF_FFFF) as u32)
}

fn generate_key() -> String {
    let mut rng = SeededRng::new(time_seed());
    let mut key = [0u8; 16];
    for chunk in key.chunks_mut(4) {
        chunk.copy_from_slice(&rng.next_u32().to_be_bytes());
    }
    BASE64.encode(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        started: bool,
        stopped: bool,
        synced: Vec<(i64, u64)>,
        updates: Vec<u64>,
    }

    impl ClientHandler for Recorder {
        fn started(&mut self, _ctx: &mut ClientContext) {
            self.started = true;
        }
        fn stopped(&mut self) {
            self.stopped = true;
        }
        fn update(&mut self, _ctx: &mut ClientContext, _time_ms: u64, tick: u64) {
            self.updates.push(tick);
        }
        fn synced_message(&mut self, _ctx: &mut ClientContext, kind: i64, tick: u64, _payload: &[Value]) {
            self.synced.push((kind, tick));
        }
    }

    fn started_client(anchor: u64, t0: Instant) -> GameClient<Recorder> {
        let mut client = GameClient::new(ClientConfig::default(), Recorder::default());
        client.ctx.state = ClientState::Connected;
        client.ctx.now = t0;
        let start = Message::new(
            ControlCode::Start.kind(),
            anchor,
            vec![Value::Int(30), Value::Int(1), Value::Int(30), Value::Int(9)],
        );
        assert!(GameClient::dispatch(&mut client.handler, &mut client.ctx, &start));
        assert!(client.handler.started);
        client
    }

    fn deliver(client: &mut GameClient<Recorder>, message: Message) {
        if !GameClient::dispatch(&mut client.handler, &mut client.ctx, &message) {
            client.queue.enqueue(message);
        }
    }

    #[test]
    fn test_future_message_waits_for_its_tick() {
        let t0 = Instant::now();
        let mut client = started_client(5, t0);

        deliver(&mut client, Message::new(7, 8, Vec::new()));
        assert_eq!(client.queue.len(), 1);
        assert!(client.handler.synced.is_empty());

        // Catch the clock up past tick 8: the anchor is tick 5 at t0.
        client.ctx.clock.observe_wrapped(9, t0);
        client.ctx.now = t0 + Duration::from_millis(1);
        client.run_ticks();
        assert!(client.ctx.last_tick >= 8, "logic ticks advanced past the stamp");

        // Delivery happens on the next drain, never before the local
        // tick reached the stamp.
        client.run_ticks();
        assert_eq!(client.handler.synced, vec![(7, 8)]);
        assert!(client.queue.is_empty());
    }

    #[test]
    fn test_released_messages_replay_in_arrival_order() {
        let t0 = Instant::now();
        let mut client = started_client(5, t0);

        for kind in [3, 1, 2] {
            deliver(&mut client, Message::new(kind, 7, Vec::new()));
        }
        client.ctx.clock.observe_wrapped(20, t0);
        client.ctx.now = t0 + Duration::from_millis(1);
        client.run_ticks();
        client.run_ticks();

        let kinds: Vec<i64> = client.handler.synced.iter().map(|(k, _)| *k).collect();
        assert_eq!(kinds, vec![3, 1, 2]);
    }

    #[test]
    fn test_past_stamped_message_delivers_at_once() {
        let t0 = Instant::now();
        let mut client = started_client(10, t0);

        deliver(&mut client, Message::new(4, 10, Vec::new()));
        assert!(client.queue.is_empty());
        assert_eq!(client.handler.synced, vec![(4, 10)]);
    }

    #[test]
    fn test_tick_zero_always_delivers_immediately() {
        let t0 = Instant::now();
        let mut client = started_client(5, t0);

        deliver(&mut client, Message::new(4, 0, Vec::new()));
        assert!(client.queue.is_empty());
        assert_eq!(client.handler.synced, vec![(4, 0)]);
    }

    #[test]
    fn test_stop_is_tick_gated() {
        let t0 = Instant::now();
        let mut client = started_client(5, t0);

        deliver(&mut client, Message::new(ControlCode::Stop.kind(), 8, Vec::new()));
        assert!(!client.handler.stopped);
        assert_eq!(client.queue.len(), 1);

        client.ctx.clock.observe_wrapped(9, t0);
        client.ctx.now = t0 + Duration::from_millis(1);
        client.run_ticks();
        client.run_ticks();
        assert!(client.handler.stopped);
        assert!(!client.ctx.clock.is_syncing());
    }

    #[test]
    fn test_logic_ticks_respect_logic_rate() {
        let t0 = Instant::now();
        let mut client = GameClient::new(ClientConfig::default(), Recorder::default());
        client.ctx.state = ClientState::Connected;
        client.ctx.now = t0;
        let start = Message::new(
            ControlCode::Start.kind(),
            0,
            vec![Value::Int(30), Value::Int(2), Value::Int(30), Value::Int(9)],
        );
        GameClient::dispatch(&mut client.handler, &mut client.ctx, &start);

        client.ctx.clock.observe_wrapped(10, t0);
        client.ctx.now = t0 + Duration::from_millis(1);
        client.run_ticks();
        assert_eq!(client.handler.updates, vec![2, 4, 6, 8]);
    }
}
