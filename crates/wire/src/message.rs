//! Framed messages and the sink/source capabilities used by the codec.
//!
//! The decoder pushes every message it completes into a [`MsgSink`]; the
//! encoder pulls the messages it serializes from a [`MsgSource`]. Both are
//! passed per call, so the owner can reroute the message flow (for example
//! during a handshake) without handing out shared references.

use bytes::Bytes;

use crate::error::ProtocolError;

/// Flags carried by every message frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsgFlags(u8);

impl MsgFlags {
    /// More frames of the same logical message follow.
    pub const MORE: u8 = 0b0000_0001;

    /// Create a new empty flags set.
    #[inline]
    pub fn new() -> Self {
        Self(0)
    }

    /// Create flags from a raw byte value.
    #[inline]
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Get the raw byte value of the flags.
    #[inline]
    pub fn as_byte(self) -> u8 {
        self.0
    }

    /// Check if the more flag is set.
    #[inline]
    pub fn has_more(self) -> bool {
        self.0 & Self::MORE != 0
    }

    /// Return a new flags value with the more flag set or cleared.
    #[inline]
    pub fn with_more(self, more: bool) -> Self {
        if more {
            Self(self.0 | Self::MORE)
        } else {
            Self(self.0 & !Self::MORE)
        }
    }
}

/// A single message frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Msg {
    data: Bytes,
    flags: MsgFlags,
}

impl Msg {
    /// Create a message that owns `data`.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            flags: MsgFlags::new(),
        }
    }

    /// Create a message with explicit flags.
    pub fn with_flags(data: impl Into<Bytes>, flags: MsgFlags) -> Self {
        Self {
            data: data.into(),
            flags,
        }
    }

    /// The message body.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The message body as shared bytes.
    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    /// Body length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the body is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Message flags.
    pub fn flags(&self) -> MsgFlags {
        self.flags
    }

    /// Whether more frames of the same logical message follow.
    pub fn has_more(&self) -> bool {
        self.flags.has_more()
    }
}

/// Why a sink did not take a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushError {
    /// The sink is full; the message is handed back so it can be retried.
    WouldBlock(Msg),
    /// The message violates the protocol; the connection must be dropped.
    Protocol(ProtocolError),
}

impl From<ProtocolError> for PushError {
    fn from(err: ProtocolError) -> Self {
        PushError::Protocol(err)
    }
}

/// Consumer of decoded messages.
pub trait MsgSink {
    /// Offer a message to the sink.
    fn push_msg(&mut self, msg: Msg) -> std::result::Result<(), PushError>;
}

/// Producer of messages to encode.
pub trait MsgSource {
    /// Take the next message, or `None` if nothing is queued right now.
    fn pull_msg(&mut self) -> Option<Msg>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msg_flags_default() {
        let flags = MsgFlags::new();
        assert_eq!(flags.as_byte(), 0);
        assert!(!flags.has_more());
    }

    #[test]
    fn test_msg_flags_more() {
        let flags = MsgFlags::new().with_more(true);
        assert!(flags.has_more());
        assert_eq!(flags.as_byte(), 0b0000_0001);
        assert!(!flags.with_more(false).has_more());
    }

    #[test]
    fn test_msg_flags_from_byte_keeps_unknown_bits() {
        let flags = MsgFlags::from_byte(0b1111_1110);
        assert!(!flags.has_more());
        assert_eq!(flags.as_byte(), 0b1111_1110);
    }

    #[test]
    fn test_msg_new() {
        let msg = Msg::new(vec![1, 2, 3]);
        assert_eq!(msg.data(), &[1, 2, 3]);
        assert_eq!(msg.len(), 3);
        assert!(!msg.has_more());
    }

    #[test]
    fn test_msg_empty() {
        let msg = Msg::new(Bytes::new());
        assert!(msg.is_empty());
    }

    #[test]
    fn test_push_error_from_protocol_error() {
        let err: PushError = ProtocolError::InvalidCommand.into();
        assert_eq!(err, PushError::Protocol(ProtocolError::InvalidCommand));
    }
}
