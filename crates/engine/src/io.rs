//! Non-blocking socket I/O with peer-failure classification.
//!
//! Both helpers return `Ok(0)` when no progress could be made right now
//! (would-block or interrupted). Peer failures map to
//! [`EngineError::PeerDisconnected`]; anything else is logged and returned as
//! [`EngineError::Io`], which the engine also treats as a dead connection.

use std::io::{self, ErrorKind, Read, Write};

use tracing::error;

use crate::error::{EngineError, Result};

/// Read into `buf`. End of stream counts as a peer failure.
pub fn read_nonblocking<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    match reader.read(buf) {
        Ok(0) => Err(EngineError::PeerDisconnected(io::Error::new(
            ErrorKind::UnexpectedEof,
            "connection closed by peer",
        ))),
        Ok(n) => Ok(n),
        Err(err) => classify(err),
    }
}

/// Write from `buf`.
pub fn write_nonblocking<W: Write + ?Sized>(writer: &mut W, buf: &[u8]) -> Result<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    match writer.write(buf) {
        Ok(n) => Ok(n),
        Err(err) => classify(err),
    }
}

/// Whether an error kind means the peer or the path to it is gone.
pub fn is_peer_failure(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionRefused
            | ErrorKind::BrokenPipe
            | ErrorKind::TimedOut
            | ErrorKind::HostUnreachable
            | ErrorKind::NetworkUnreachable
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof
    )
}

fn classify(err: io::Error) -> Result<usize> {
    match err.kind() {
        ErrorKind::WouldBlock | ErrorKind::Interrupted => Ok(0),
        kind if is_peer_failure(kind) => Err(EngineError::PeerDisconnected(err)),
        _ => {
            error!(error = %err, "unexpected socket error");
            Err(EngineError::Io(err))
        }
    }
}
