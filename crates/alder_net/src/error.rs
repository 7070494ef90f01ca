//! Crate-level error type.

use thiserror::Error;

use crate::frame::FrameError;
use crate::handshake::HandshakeError;
use crate::registry::RegistryError;
use alder_codec::CodecError;

/// Errors surfaced by the session shells and the transport layer.
#[derive(Debug, Error)]
pub enum NetError {
    /// Socket-level failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A payload failed to encode or decode.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The HTTP upgrade could not be negotiated.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// The frame stream violated the protocol.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Registry insert or removal against the wrong state.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A decoded message did not have the expected envelope shape.
    #[error("malformed message envelope")]
    MalformedEnvelope,

    /// Attempted to use a connection that is closed.
    #[error("connection is closed")]
    ConnectionClosed,

    /// The session is not in a state that allows the operation.
    #[error("session is not running")]
    NotRunning,

    /// The session was started twice.
    #[error("session is already running")]
    AlreadyRunning,
}
