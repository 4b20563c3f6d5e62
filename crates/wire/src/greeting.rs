//! Greeting negotiation with bounded lookahead.
//!
//! A versioned peer opens the connection with what looks like the header of a
//! long identity frame whose flags byte has bit 0 set:
//!
//! ```text
//! +------+-------------------+-------+---------+-----------+-------------+
//! | 0xFF | length (8, BE)    | flags | version | remaining | socket type |
//! +------+-------------------+-------+---------+-----------+-------------+
//!   0      1..9                9       10        11          12..
//! ```
//!
//! A legacy peer sends its identity frame straight away, either with a
//! one-byte length (first byte is not `0xFF`) or with the long length form and
//! flags bit 0 clear. The [`Greeting`] state machine reads only as many bytes
//! as are needed to tell the two apart and never consumes a byte that belongs
//! to the frames that follow.

use crate::error::{ProtocolError, Result};

/// First byte of the long (8-byte) length form.
pub const LENGTH_ESCAPE: u8 = 0xFF;

/// Bytes needed to see the first length byte and the following byte.
pub const SHORT_PROBE_SIZE: usize = 2;

/// Bytes needed to see the flags byte of a long-form frame header.
pub const LONG_PROBE_SIZE: usize = 10;

/// Offset of the flags byte in a long-form frame header.
pub const FLAGS_OFFSET: usize = 9;

/// Flags bit distinguishing a versioned greeting from a legacy identity.
pub const VERSIONED_FLAG: u8 = 0x01;

/// Bytes up to and including the remaining-length field.
pub const VERSIONED_HEADER_SIZE: usize = 12;

/// Offset of the protocol version byte.
pub const VERSION_OFFSET: usize = 10;

/// Offset of the remaining-length byte.
pub const REMAINING_LENGTH_OFFSET: usize = 11;

/// Offset of the socket type byte.
pub const SOCKET_TYPE_OFFSET: usize = 12;

/// Protocol revision this engine announces.
pub const PROTOCOL_REVISION: u8 = 1;

/// Remaining length announced by this engine (just the socket type).
pub const LOCAL_REMAINING_LENGTH: u8 = 1;

/// Flags byte of the preamble sent to every peer.
pub const PREAMBLE_FLAGS: u8 = 0x7F;

/// Size of the preamble sent before the peer's generation is known.
pub const PREAMBLE_SIZE: usize = LONG_PROBE_SIZE;

/// Size of the versioned continuation (version, remaining length, socket type).
pub const CONTINUATION_SIZE: usize = 3;

/// Longest identity a legacy peer may announce.
pub const MAX_LEGACY_IDENTITY: usize = 255;

/// Fixed capacity of the greeting buffer.
pub const GREETING_CAPACITY: usize = VERSIONED_HEADER_SIZE + u8::MAX as usize;

const _: () = assert!(PREAMBLE_SIZE + CONTINUATION_SIZE == VERSIONED_HEADER_SIZE + 1);
const _: () = assert!(SOCKET_TYPE_OFFSET == VERSIONED_HEADER_SIZE);

/// Build the 10-byte preamble for a local identity of `identity_len` bytes.
///
/// The preamble is the long-form header of the identity frame with every
/// flags bit set, which a legacy peer reads as the start of our identity and
/// a versioned peer reads as the start of a greeting.
pub fn preamble(identity_len: usize) -> [u8; PREAMBLE_SIZE] {
    let mut out = [0u8; PREAMBLE_SIZE];
    out[0] = LENGTH_ESCAPE;
    out[1..FLAGS_OFFSET].copy_from_slice(&(identity_len as u64 + 1).to_be_bytes());
    out[FLAGS_OFFSET] = PREAMBLE_FLAGS;
    out
}

/// Build the versioned continuation sent once the peer is known to be versioned.
pub fn continuation(socket_type: u8) -> [u8; CONTINUATION_SIZE] {
    [PROTOCOL_REVISION, LOCAL_REMAINING_LENGTH, socket_type]
}

/// Size of the identity frame header the encoder will produce for a legacy peer.
///
/// The preamble already carried this header, so the encoder's copy is dropped.
pub fn legacy_header_size(identity_len: usize) -> usize {
    if identity_len + 1 >= LENGTH_ESCAPE as usize {
        LONG_PROBE_SIZE
    } else {
        SHORT_PROBE_SIZE
    }
}

/// Protocol generation selected by the greeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerProtocol {
    /// Pre-versioning peer; the bytes read so far start its identity frame.
    Legacy,
    /// Versioned peer.
    Versioned {
        /// Announced protocol revision.
        revision: u8,
        /// Announced socket type, absent when the remaining length is zero.
        socket_type: Option<u8>,
    },
}

/// Result of feeding bytes to the greeting state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GreetingStep {
    /// More bytes are needed.
    NeedMore,
    /// The peer is versioned; the local continuation must be sent now.
    SendContinuation,
    /// Negotiation finished.
    Complete(PeerProtocol),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    ShortProbe,
    LongProbe,
    VersionHeader,
    Body,
    Done(PeerProtocol),
}

/// Bounded-lookahead greeting reader.
#[derive(Debug, Clone)]
pub struct Greeting {
    buf: [u8; GREETING_CAPACITY],
    bytes_read: usize,
    target: usize,
    stage: Stage,
}

impl Default for Greeting {
    fn default() -> Self {
        Self::new()
    }
}

impl Greeting {
    /// Create a reader waiting for the first two bytes.
    pub fn new() -> Self {
        Self {
            buf: [0u8; GREETING_CAPACITY],
            bytes_read: 0,
            target: SHORT_PROBE_SIZE,
            stage: Stage::ShortProbe,
        }
    }

    /// The window the next read must fill. Empty once negotiation is complete.
    pub fn unfilled(&mut self) -> &mut [u8] {
        &mut self.buf[self.bytes_read..self.target]
    }

    /// Bytes received so far.
    pub fn received(&self) -> &[u8] {
        &self.buf[..self.bytes_read]
    }

    /// Number of bytes received so far.
    pub fn bytes_read(&self) -> usize {
        self.bytes_read
    }

    /// Number of bytes the reader currently expects in total.
    pub fn target(&self) -> usize {
        self.target
    }

    /// The negotiated protocol, once complete.
    pub fn outcome(&self) -> Option<PeerProtocol> {
        match self.stage {
            Stage::Done(protocol) => Some(protocol),
            _ => None,
        }
    }

    /// Record that `n` bytes were written into [`Greeting::unfilled`].
    pub fn advance(&mut self, n: usize) -> Result<GreetingStep> {
        assert!(
            self.bytes_read + n <= self.target,
            "greeting read past its target"
        );
        self.bytes_read += n;

        if self.bytes_read < self.target {
            return Ok(GreetingStep::NeedMore);
        }

        match self.stage {
            Stage::ShortProbe => {
                if self.buf[0] != LENGTH_ESCAPE {
                    if self.buf[0] == 0 {
                        return Err(ProtocolError::MalformedGreeting(
                            "zero-length identity frame".to_string(),
                        ));
                    }
                    return Ok(self.finish(PeerProtocol::Legacy));
                }
                // Possibly a 254 or 255 byte legacy identity; the flags byte decides.
                self.target = LONG_PROBE_SIZE;
                self.stage = Stage::LongProbe;
                Ok(GreetingStep::NeedMore)
            }
            Stage::LongProbe => {
                if self.buf[FLAGS_OFFSET] & VERSIONED_FLAG == 0 {
                    let mut len = [0u8; 8];
                    len.copy_from_slice(&self.buf[1..FLAGS_OFFSET]);
                    let len = u64::from_be_bytes(len);
                    if len == 0 || len > MAX_LEGACY_IDENTITY as u64 + 1 {
                        return Err(ProtocolError::MalformedGreeting(format!(
                            "legacy identity frame of {} bytes",
                            len
                        )));
                    }
                    return Ok(self.finish(PeerProtocol::Legacy));
                }
                self.target = VERSIONED_HEADER_SIZE;
                self.stage = Stage::VersionHeader;
                Ok(GreetingStep::SendContinuation)
            }
            Stage::VersionHeader => {
                let remaining = self.buf[REMAINING_LENGTH_OFFSET] as usize;
                if remaining == 0 {
                    return Ok(self.finish_versioned());
                }
                self.target = VERSIONED_HEADER_SIZE + remaining;
                self.stage = Stage::Body;
                Ok(GreetingStep::NeedMore)
            }
            Stage::Body => Ok(self.finish_versioned()),
            Stage::Done(protocol) => Ok(GreetingStep::Complete(protocol)),
        }
    }

    fn finish_versioned(&mut self) -> GreetingStep {
        let socket_type =
            (self.bytes_read > SOCKET_TYPE_OFFSET).then(|| self.buf[SOCKET_TYPE_OFFSET]);
        self.finish(PeerProtocol::Versioned {
            revision: self.buf[VERSION_OFFSET],
            socket_type,
        })
    }

    fn finish(&mut self, protocol: PeerProtocol) -> GreetingStep {
        self.target = self.bytes_read;
        self.stage = Stage::Done(protocol);
        tracing::trace!(bytes = self.bytes_read, ?protocol, "greeting complete");
        GreetingStep::Complete(protocol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feed `input` one window at a time, never offering more than requested.
    fn feed(greeting: &mut Greeting, input: &[u8]) -> Result<(usize, Vec<GreetingStep>)> {
        let mut offset = 0;
        let mut steps = Vec::new();
        while greeting.outcome().is_none() && offset < input.len() {
            let window = greeting.unfilled();
            let n = window.len().min(input.len() - offset);
            window[..n].copy_from_slice(&input[offset..offset + n]);
            offset += n;
            steps.push(greeting.advance(n)?);
        }
        Ok((offset, steps))
    }

    fn versioned_greeting(remaining: u8, socket_type: u8) -> Vec<u8> {
        versioned_greeting_with_revision(PROTOCOL_REVISION, remaining, socket_type)
    }

    fn versioned_greeting_with_revision(revision: u8, remaining: u8, socket_type: u8) -> Vec<u8> {
        let mut bytes = preamble(0).to_vec();
        bytes.push(revision);
        bytes.push(remaining);
        if remaining > 0 {
            bytes.push(socket_type);
            bytes.extend(std::iter::repeat(0xAA).take(remaining as usize - 1));
        }
        bytes
    }

    #[test]
    fn test_preamble_layout() {
        let bytes = preamble(5);
        assert_eq!(bytes[0], 0xFF);
        assert_eq!(&bytes[1..9], &6u64.to_be_bytes());
        assert_eq!(bytes[9], 0x7F);
    }

    #[test]
    fn test_continuation_layout() {
        assert_eq!(continuation(6), [1, 1, 6]);
    }

    #[test]
    fn test_legacy_header_size() {
        assert_eq!(legacy_header_size(0), 2);
        assert_eq!(legacy_header_size(253), 2);
        assert_eq!(legacy_header_size(254), 10);
        assert_eq!(legacy_header_size(255), 10);
    }

    #[test]
    fn test_versioned_completes_at_exact_length() {
        let mut input = versioned_greeting(1, 5);
        input.extend_from_slice(b"trailing frame bytes");

        let mut greeting = Greeting::new();
        let (consumed, steps) = feed(&mut greeting, &input).unwrap();

        assert_eq!(consumed, 13);
        assert_eq!(greeting.bytes_read(), 13);
        assert!(steps.contains(&GreetingStep::SendContinuation));
        assert_eq!(
            greeting.outcome(),
            Some(PeerProtocol::Versioned {
                revision: 1,
                socket_type: Some(5)
            })
        );
    }

    #[test]
    fn test_versioned_with_longer_remaining_length() {
        let mut input = versioned_greeting(4, 2);
        input.extend_from_slice(&[0x01, 0x00]);

        let mut greeting = Greeting::new();
        let (consumed, _) = feed(&mut greeting, &input).unwrap();

        assert_eq!(consumed, VERSIONED_HEADER_SIZE + 4);
        assert!(matches!(
            greeting.outcome(),
            Some(PeerProtocol::Versioned {
                socket_type: Some(2),
                ..
            })
        ));
    }

    #[test]
    fn test_legacy_short_identity_completes_after_two_bytes() {
        let input = [0x04, 0x00, b'a', b'b', b'c'];
        let mut greeting = Greeting::new();
        let (consumed, steps) = feed(&mut greeting, &input).unwrap();

        assert_eq!(consumed, 2);
        assert_eq!(steps, vec![GreetingStep::Complete(PeerProtocol::Legacy)]);
        assert_eq!(greeting.received(), &[0x04, 0x00]);
    }

    #[test]
    fn test_legacy_long_identity_completes_after_ten_bytes() {
        let mut input = vec![0xFF];
        input.extend_from_slice(&255u64.to_be_bytes());
        input.push(0x00);
        input.extend(std::iter::repeat(b'x').take(254));

        let mut greeting = Greeting::new();
        let (consumed, steps) = feed(&mut greeting, &input).unwrap();

        assert_eq!(consumed, 10);
        assert!(!steps.contains(&GreetingStep::SendContinuation));
        assert_eq!(greeting.outcome(), Some(PeerProtocol::Legacy));
    }

    #[test]
    fn test_byte_at_a_time_matches_bulk() {
        let input = versioned_greeting(1, 9);
        let mut greeting = Greeting::new();
        let mut steps = Vec::new();
        for byte in &input {
            let window = greeting.unfilled();
            window[0] = *byte;
            steps.push(greeting.advance(1).unwrap());
        }
        assert_eq!(
            steps.last(),
            Some(&GreetingStep::Complete(PeerProtocol::Versioned {
                revision: 1,
                socket_type: Some(9)
            }))
        );
        assert_eq!(
            steps
                .iter()
                .filter(|s| **s == GreetingStep::SendContinuation)
                .count(),
            1
        );
    }

    #[test]
    fn test_other_revision_completes_at_exact_length() {
        let mut input = versioned_greeting_with_revision(2, 1, 5);
        input.extend_from_slice(&[0x01, 0x00]);

        let mut greeting = Greeting::new();
        let (consumed, steps) = feed(&mut greeting, &input).unwrap();

        assert_eq!(consumed, 13);
        assert_eq!(
            steps.last(),
            Some(&GreetingStep::Complete(PeerProtocol::Versioned {
                revision: 2,
                socket_type: Some(5)
            }))
        );
    }

    #[test]
    fn test_zero_remaining_length_completes_after_header() {
        let mut input = versioned_greeting(0, 0);
        assert_eq!(input.len(), VERSIONED_HEADER_SIZE);
        input.extend_from_slice(&[0x01, 0x00]);

        let mut greeting = Greeting::new();
        let (consumed, steps) = feed(&mut greeting, &input).unwrap();

        assert_eq!(consumed, VERSIONED_HEADER_SIZE);
        assert!(steps.contains(&GreetingStep::SendContinuation));
        assert_eq!(
            greeting.outcome(),
            Some(PeerProtocol::Versioned {
                revision: 1,
                socket_type: None
            })
        );
        assert!(greeting.unfilled().is_empty());
    }

    #[test]
    fn test_oversized_legacy_identity_rejected() {
        let mut input = vec![0xFF];
        input.extend_from_slice(&(1u64 << 40).to_be_bytes());
        input.push(0x00);
        let mut greeting = Greeting::new();
        assert!(matches!(
            feed(&mut greeting, &input),
            Err(ProtocolError::MalformedGreeting(_))
        ));
    }

    #[test]
    fn test_zero_length_short_frame_rejected() {
        let mut greeting = Greeting::new();
        assert!(feed(&mut greeting, &[0x00, 0x00]).is_err());
    }

    #[test]
    fn test_unfilled_empty_once_complete() {
        let mut greeting = Greeting::new();
        feed(&mut greeting, &[0x03, 0x00]).unwrap();
        assert!(greeting.unfilled().is_empty());
    }

    #[test]
    fn test_window_never_exceeds_capacity() {
        let input = versioned_greeting(u8::MAX, 1);
        let mut greeting = Greeting::new();
        let (consumed, _) = feed(&mut greeting, &input).unwrap();
        assert_eq!(consumed, GREETING_CAPACITY);
        assert!(greeting.outcome().is_some());
    }
}
