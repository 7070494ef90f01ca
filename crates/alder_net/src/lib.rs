//! # Alder Net
//!
//! Tick-synchronized multiplayer networking over a from-scratch
//! WebSocket transport.
//!
//! ## Design
//!
//! - The transport pieces (handshake negotiation, frame parsing) are
//!   sans-I/O state machines fed byte slices; the socket shells in
//!   [`server`] and [`client`] own the non-blocking `std::net` streams
//!   and pump those machines from their `poll` entry points
//! - Game state advances on a shared tick counter. The server is the
//!   tick authority and broadcasts a wrapped tick every `sync_rate`
//!   ticks; clients reconstruct the absolute tick and extrapolate
//!   between broadcasts
//! - Application payloads ride the [`alder_codec`] value encoding;
//!   control traffic uses reserved negative message kinds
//!
//! Both session shells are single-threaded and poll-driven. Call
//! `poll` from your own loop; handler callbacks fire from inside it.

mod clock;
mod connection;
mod error;
mod frame;
mod handshake;
mod legacy;
mod message;
mod queue;
mod registry;
mod rng;

pub mod client;
pub mod server;

pub use alder_codec::{decode, encode, CodecError, Value};

pub use clock::{ClientClock, ClockEvent, ServerClock, StartParams};
pub use connection::{ByteStats, Connection, Role};
pub use error::NetError;
pub use frame::{encode_frame, FrameError, FrameEvent, FrameParser};
pub use handshake::{
    accept_token, client_request, negotiate, parse_http_request, parse_http_response,
    HandshakeError, HttpRequest, HttpResponse, ProtocolVersion,
};
pub use message::{ControlCode, ErrorCode, Message, MessageTable, WireMessage};
pub use queue::PendingQueue;
pub use registry::{ClientId, Registry, RegistryError};
pub use rng::SeededRng;

pub use client::{ClientConfig, ClientContext, ClientHandler, GameClient};
pub use server::{GameServer, ServerConfig, ServerContext, ServerHandler};

/// Protocol version exchanged during the CONNECT handshake.
pub const PROTOCOL_VERSION: &str = "0.1";

/// Absolute ticks are broadcast modulo this wrap period.
pub const TICK_WRAP: u64 = 250;

/// Default cap on bytes buffered for a single peer without a complete
/// frame. Exceeding it closes the connection.
pub const MAX_MESSAGE_LENGTH: usize = 32_768;
