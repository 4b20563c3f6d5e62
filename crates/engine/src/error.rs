//! Error types for the stream engine.

use std::io;

use thiserror::Error;
use zmtp_wire::ProtocolError;

use crate::config::ConfigError;

/// Errors that end a connection or prevent one from being set up.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The peer violated the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The peer closed or reset the connection.
    #[error("peer disconnected: {0}")]
    PeerDisconnected(#[source] io::Error),

    /// An I/O error not attributable to the peer.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The encoder did not yield the identity header the preamble announced.
    #[error("identity header mismatch: preamble carried {expected} bytes, encoder produced {discarded}")]
    IdentityHeader {
        /// Header size announced by the preamble.
        expected: usize,
        /// Header bytes the encoder actually produced.
        discarded: usize,
    },

    /// Engine options or configuration are invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl EngineError {
    /// Whether the error was caused by the peer misbehaving on the wire.
    pub fn is_protocol(&self) -> bool {
        matches!(self, EngineError::Protocol(_))
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
