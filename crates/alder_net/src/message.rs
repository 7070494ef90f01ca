//! Message envelopes and reserved control kinds.
//!
//! Every application message travels as a codec list `[kind, tick,
//! payload...]`. The server's periodic tick sync is the one exception:
//! it is a bare integer, distinguished from envelopes purely by shape.

use alder_codec::Value;

use crate::error::NetError;

/// Reserved message kinds used by the session layer itself.
///
/// Application kinds are non-negative; the control range is negative
/// so the two can never collide.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlCode {
    /// Client hello carrying the protocol version.
    Connect,
    /// Server reply carrying the session parameters.
    Start,
    /// Session teardown, tick-gated on the client.
    Stop,
    /// Server-reported protocol error, carries an [`ErrorCode`].
    Error,
    /// Latency probe; the server echoes the payload back.
    Sync,
}

impl ControlCode {
    /// The wire kind for this control message.
    #[must_use]
    pub const fn kind(self) -> i64 {
        match self {
            Self::Connect => -1,
            Self::Start => -2,
            Self::Stop => -3,
            Self::Error => -4,
            Self::Sync => -5,
        }
    }

    /// Maps a wire kind back to a control code.
    #[must_use]
    pub const fn from_kind(kind: i64) -> Option<Self> {
        match kind {
            -1 => Some(Self::Connect),
            -2 => Some(Self::Start),
            -3 => Some(Self::Stop),
            -4 => Some(Self::Error),
            -5 => Some(Self::Sync),
            _ => None,
        }
    }
}

/// Error codes carried in the payload of a [`ControlCode::Error`]
/// message, sent immediately before the server closes the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    /// The payload did not decode.
    InvalidData,
    /// The decoded value was not a well-formed envelope.
    MessageTooShort,
    /// A second CONNECT on an already-established session.
    AlreadyConnected,
    /// Client and server protocol versions differ.
    UnsupportedVersion,
}

impl ErrorCode {
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::InvalidData => -1,
            Self::MessageTooShort => -2,
            Self::AlreadyConnected => -3,
            Self::UnsupportedVersion => -4,
        }
    }

    #[must_use]
    pub const fn from_code(code: i64) -> Option<Self> {
        match code {
            -1 => Some(Self::InvalidData),
            -2 => Some(Self::MessageTooShort),
            -3 => Some(Self::AlreadyConnected),
            -4 => Some(Self::UnsupportedVersion),
            _ => None,
        }
    }
}

/// A decoded message envelope.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    /// Application kind (non-negative) or control kind (negative).
    pub kind: i64,
    /// Tick the sender stamped on the envelope.
    pub tick: u64,
    /// Everything after the two envelope fields.
    pub payload: Vec<Value>,
}

impl Message {
    #[must_use]
    pub fn new(kind: i64, tick: u64, payload: Vec<Value>) -> Self {
        Self { kind, tick, payload }
    }

    /// Builds the wire value `[kind, tick, payload...]`.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut items = Vec::with_capacity(2 + self.payload.len());
        items.push(Value::Int(self.kind));
        items.push(Value::Int(self.tick as i64));
        items.extend(self.payload.iter().cloned());
        Value::List(items)
    }
}

/// A message as it appears on the wire, before routing.
#[derive(Clone, Debug, PartialEq)]
pub enum WireMessage {
    /// Bare wrapped tick from the server's sync broadcast.
    SyncTick(u8),
    /// A regular `[kind, tick, payload...]` envelope.
    Envelope(Message),
}

impl WireMessage {
    /// Classifies a decoded value by shape.
    ///
    /// # Errors
    ///
    /// Anything that is neither a wrapped tick nor a list of at least
    /// two integers is a malformed envelope.
    pub fn from_value(value: Value) -> Result<Self, NetError> {
        match value {
            Value::Int(t) if (0..crate::TICK_WRAP as i64).contains(&t) => {
                Ok(Self::SyncTick(t as u8))
            }
            Value::List(mut items) => {
                if items.len() < 2 {
                    return Err(NetError::MalformedEnvelope);
                }
                let kind = items[0].as_int().ok_or(NetError::MalformedEnvelope)?;
                let tick = items[1].as_int().ok_or(NetError::MalformedEnvelope)?;
                if tick < 0 {
                    return Err(NetError::MalformedEnvelope);
                }
                let payload = items.split_off(2);
                Ok(Self::Envelope(Message::new(kind, tick as u64, payload)))
            }
            _ => Err(NetError::MalformedEnvelope),
        }
    }
}

/// Optional mapping between symbolic message names and small integer
/// kinds, announced by the server inside the START payload so both
/// sides agree without hard-coding numbers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageTable {
    names: Vec<String>,
}

impl MessageTable {
    #[must_use]
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// The kind assigned to `name`, which is its table position.
    #[must_use]
    pub fn kind_of(&self, name: &str) -> Option<i64> {
        self.names.iter().position(|n| n == name).map(|i| i as i64)
    }

    /// The name assigned to `kind`, if the table covers it.
    #[must_use]
    pub fn name_of(&self, kind: i64) -> Option<&str> {
        usize::try_from(kind).ok().and_then(|i| self.names.get(i)).map(String::as_str)
    }

    /// The wire form: a list of name strings.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::List(self.names.iter().map(|n| Value::Str(n.clone())).collect())
    }

    /// Rebuilds a table from its wire form.
    pub fn from_value(value: &Value) -> Result<Self, NetError> {
        let items = value.as_list().ok_or(NetError::MalformedEnvelope)?;
        let names = items
            .iter()
            .map(|v| v.as_str().map(str::to_owned).ok_or(NetError::MalformedEnvelope))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(names))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_codes_round_trip() {
        for code in [
            ControlCode::Connect,
            ControlCode::Start,
            ControlCode::Stop,
            ControlCode::Error,
            ControlCode::Sync,
        ] {
            assert_eq!(ControlCode::from_kind(code.kind()), Some(code));
        }
        assert_eq!(ControlCode::from_kind(0), None);
        assert_eq!(ControlCode::from_kind(-6), None);
    }

    #[test]
    fn test_bare_int_is_sync_tick() {
        assert_eq!(WireMessage::from_value(Value::Int(0)).unwrap(), WireMessage::SyncTick(0));
        assert_eq!(WireMessage::from_value(Value::Int(249)).unwrap(), WireMessage::SyncTick(249));
        assert!(WireMessage::from_value(Value::Int(250)).is_err());
        assert!(WireMessage::from_value(Value::Int(-1)).is_err());
    }

    #[test]
    fn test_envelope_shape() {
        let wire = WireMessage::from_value(Value::List(vec![
            Value::Int(7),
            Value::Int(120),
            Value::Str("payload".into()),
        ]))
        .unwrap();
        assert_eq!(
            wire,
            WireMessage::Envelope(Message::new(7, 120, vec![Value::Str("payload".into())]))
        );
    }

    #[test]
    fn test_short_or_misshapen_envelopes_rejected() {
        assert!(WireMessage::from_value(Value::List(vec![Value::Int(7)])).is_err());
        assert!(WireMessage::from_value(Value::Str("nope".into())).is_err());
        assert!(WireMessage::from_value(Value::List(vec![
            Value::Str("kind".into()),
            Value::Int(1),
        ]))
        .is_err());
        assert!(WireMessage::from_value(Value::List(vec![Value::Int(7), Value::Int(-3)])).is_err());
    }

    #[test]
    fn test_message_to_value_matches_wire_shape() {
        let msg = Message::new(3, 10, vec![Value::Bool(true)]);
        let back = WireMessage::from_value(msg.to_value()).unwrap();
        assert_eq!(back, WireMessage::Envelope(msg));
    }

    #[test]
    fn test_message_table_lookup() {
        let table = MessageTable::new(vec!["spawn".into(), "move".into(), "despawn".into()]);
        assert_eq!(table.kind_of("move"), Some(1));
        assert_eq!(table.name_of(2), Some("despawn"));
        assert_eq!(table.kind_of("missing"), None);
        assert_eq!(table.name_of(9), None);
        assert_eq!(MessageTable::from_value(&table.to_value()).unwrap(), table);
    }
}
