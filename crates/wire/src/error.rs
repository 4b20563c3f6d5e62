//! Error types for the wire crate.

use thiserror::Error;

/// Protocol error type covering every way a peer can violate the wire format.
///
/// All variants are fatal for the connection that produced them: the engine
/// never retries after a protocol error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    // Greeting errors
    /// The greeting bytes do not describe a valid peer.
    #[error("malformed greeting: {0}")]
    MalformedGreeting(String),

    /// The peer announced a protocol revision this engine does not speak.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// A legacy peer was detected but the engine requires the versioned protocol.
    #[error("legacy peer rejected: security requires the versioned protocol")]
    LegacyPeerRejected,

    // Frame errors
    /// Inbound message exceeds the configured maximum.
    #[error("message too large: {size} bytes exceeds maximum of {max} bytes")]
    MessageTooLarge {
        /// Announced message size.
        size: u64,
        /// Maximum allowed size.
        max: u64,
    },

    /// A frame header could not be parsed.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    // Handshake command errors
    /// A frame received during the handshake carries no known command tag.
    #[error("invalid handshake command")]
    InvalidCommand,

    /// A known command arrived in a state that does not expect it.
    #[error("unexpected {command} command while {state}")]
    UnexpectedCommand {
        /// Command name.
        command: &'static str,
        /// Mechanism state at the time.
        state: &'static str,
    },

    /// A command has the wrong length for its type.
    #[error("invalid {command} size: expected {expected}, got {got}")]
    InvalidCommandSize {
        /// Command name.
        command: &'static str,
        /// Expected size description.
        expected: usize,
        /// Actual size.
        got: usize,
    },

    /// An authenticated box failed to open.
    #[error("authentication failed: {0}")]
    Authentication(&'static str),

    /// The authenticated-encryption primitive refused to seal a box.
    #[error("encryption failed: {0}")]
    Encryption(&'static str),

    /// The peer sent an ERROR command.
    #[error("peer rejected handshake: {0}")]
    PeerError(String),

    /// The nonce counter for a key pair has been used up.
    #[error("nonce counter exhausted")]
    NonceExhausted,

    /// Handshake metadata could not be parsed.
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    /// Key material has the wrong shape.
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

/// Result type alias for wire operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_greeting_display() {
        let err = ProtocolError::MalformedGreeting("zero remaining length".to_string());
        assert_eq!(err.to_string(), "malformed greeting: zero remaining length");
    }

    #[test]
    fn test_unsupported_version_display() {
        let err = ProtocolError::UnsupportedVersion(7);
        assert_eq!(err.to_string(), "unsupported protocol version: 7");
    }

    #[test]
    fn test_message_too_large_display() {
        let err = ProtocolError::MessageTooLarge {
            size: 100_000,
            max: 65536,
        };
        assert_eq!(
            err.to_string(),
            "message too large: 100000 bytes exceeds maximum of 65536 bytes"
        );
    }

    #[test]
    fn test_unexpected_command_display() {
        let err = ProtocolError::UnexpectedCommand {
            command: "READY",
            state: "waiting for WELCOME",
        };
        assert_eq!(
            err.to_string(),
            "unexpected READY command while waiting for WELCOME"
        );
    }

    #[test]
    fn test_invalid_command_size_display() {
        let err = ProtocolError::InvalidCommandSize {
            command: "WELCOME",
            expected: 168,
            got: 167,
        };
        assert_eq!(err.to_string(), "invalid WELCOME size: expected 168, got 167");
    }

    #[test]
    fn test_peer_error_display() {
        let err = ProtocolError::PeerError("not authorized".to_string());
        assert_eq!(err.to_string(), "peer rejected handshake: not authorized");
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolError>();
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_result() -> Result<()> {
            Ok(())
        }
        assert!(returns_result().is_ok());
    }
}
