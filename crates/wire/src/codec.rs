//! Length-prefixed frame codec.
//!
//! # Frame Format
//!
//! Each frame consists of:
//! - 1 byte length if the length is below 255, otherwise `0xFF` followed by an
//!   8-byte big-endian length. The length counts the flags byte.
//! - 1 byte: flags (bit 0 = more frames follow)
//! - N bytes: body
//!
//! Both directions are pull based. The engine hands raw input to
//! [`Decoder::process_buffer`] together with the sink that should receive the
//! decoded messages, and asks [`Encoder::get_data`] for the next chunk of
//! output, naming the source to pull messages from.

use bytes::Bytes;

use crate::error::{ProtocolError, Result};
use crate::greeting::LENGTH_ESCAPE;
use crate::message::{Msg, MsgFlags, MsgSink, MsgSource, PushError};

/// Largest frame header: escape byte, 8-byte length and flags byte.
pub const MAX_HEADER_SIZE: usize = 10;

/// Cap on the up-front allocation for a body, whatever length the peer announces.
const MAX_BODY_PREALLOC: usize = 64 * 1024;

/// Turns raw bytes into messages.
pub trait Decoder {
    /// Decode as much of `data` as `sink` accepts and return the bytes consumed.
    ///
    /// When the sink refuses a message the decoder keeps it and reports itself
    /// [`stalled`](Decoder::stalled); the next call, even with an empty
    /// buffer, offers that message again before decoding anything else.
    fn process_buffer(&mut self, data: &[u8], sink: &mut dyn MsgSink) -> Result<usize>;

    /// Whether a completed message is waiting for the sink.
    fn stalled(&self) -> bool;
}

/// Turns messages into raw bytes.
pub trait Encoder {
    /// Append at most `limit` bytes of encoded output to `out`, pulling new
    /// messages from `source` as needed. Returns the number of bytes added.
    fn get_data(&mut self, out: &mut Vec<u8>, limit: usize, source: &mut dyn MsgSource) -> usize;
}

/// Encode a single message as a complete frame.
pub fn encode_frame(msg: &Msg) -> Vec<u8> {
    let (header, header_len) = frame_header(msg);
    let mut out = Vec::with_capacity(header_len + msg.len());
    out.extend_from_slice(&header[..header_len]);
    out.extend_from_slice(msg.data());
    out
}

fn frame_header(msg: &Msg) -> ([u8; MAX_HEADER_SIZE], usize) {
    let mut header = [0u8; MAX_HEADER_SIZE];
    let size = msg.len() as u64 + 1;
    if size < LENGTH_ESCAPE as u64 {
        header[0] = size as u8;
        header[1] = msg.flags().as_byte();
        (header, 2)
    } else {
        header[0] = LENGTH_ESCAPE;
        header[1..9].copy_from_slice(&size.to_be_bytes());
        header[9] = msg.flags().as_byte();
        (header, MAX_HEADER_SIZE)
    }
}

#[derive(Debug)]
enum DecodeState {
    OneByteSize,
    EightByteSize { buf: [u8; 8], filled: usize },
    Flags { body_len: u64 },
    Body { flags: MsgFlags, body: Vec<u8>, remaining: u64 },
}

/// Decoder for the length-prefixed frame format.
#[derive(Debug)]
pub struct V1Decoder {
    state: DecodeState,
    pending: Option<Msg>,
    max_msg_size: Option<u64>,
}

impl V1Decoder {
    /// Create a decoder. `max_msg_size` bounds the body of any single message.
    pub fn new(max_msg_size: Option<u64>) -> Self {
        Self {
            state: DecodeState::OneByteSize,
            pending: None,
            max_msg_size,
        }
    }

    fn size_ready(&mut self, size: u64) -> Result<()> {
        if size == 0 {
            return Err(ProtocolError::MalformedFrame(
                "frame length must include the flags byte".to_string(),
            ));
        }
        let body_len = size - 1;
        if let Some(max) = self.max_msg_size {
            if body_len > max {
                return Err(ProtocolError::MessageTooLarge {
                    size: body_len,
                    max,
                });
            }
        }
        self.state = DecodeState::Flags { body_len };
        Ok(())
    }

    /// Offer a completed message. Returns `false` if the sink is full.
    fn deliver(&mut self, msg: Msg, sink: &mut dyn MsgSink) -> Result<bool> {
        match sink.push_msg(msg) {
            Ok(()) => Ok(true),
            Err(PushError::WouldBlock(msg)) => {
                self.pending = Some(msg);
                Ok(false)
            }
            Err(PushError::Protocol(err)) => Err(err),
        }
    }
}

impl Decoder for V1Decoder {
    fn process_buffer(&mut self, data: &[u8], sink: &mut dyn MsgSink) -> Result<usize> {
        if let Some(msg) = self.pending.take() {
            if !self.deliver(msg, sink)? {
                return Ok(0);
            }
        }

        let mut pos = 0;
        while pos < data.len() {
            let mut completed = None;
            match &mut self.state {
                DecodeState::OneByteSize => {
                    let byte = data[pos];
                    pos += 1;
                    if byte == LENGTH_ESCAPE {
                        self.state = DecodeState::EightByteSize {
                            buf: [0u8; 8],
                            filled: 0,
                        };
                    } else {
                        self.size_ready(byte as u64)?;
                    }
                }
                DecodeState::EightByteSize { buf, filled } => {
                    let n = (8 - *filled).min(data.len() - pos);
                    buf[*filled..*filled + n].copy_from_slice(&data[pos..pos + n]);
                    *filled += n;
                    pos += n;
                    if *filled == 8 {
                        let size = u64::from_be_bytes(*buf);
                        self.size_ready(size)?;
                    }
                }
                DecodeState::Flags { body_len } => {
                    let flags = MsgFlags::from_byte(data[pos]);
                    pos += 1;
                    let body_len = *body_len;
                    if body_len == 0 {
                        completed = Some(Msg::with_flags(Bytes::new(), flags));
                    } else {
                        let prealloc = usize::try_from(body_len)
                            .unwrap_or(usize::MAX)
                            .min(MAX_BODY_PREALLOC);
                        self.state = DecodeState::Body {
                            flags,
                            body: Vec::with_capacity(prealloc),
                            remaining: body_len,
                        };
                    }
                }
                DecodeState::Body {
                    flags,
                    body,
                    remaining,
                } => {
                    let available = (data.len() - pos) as u64;
                    let n = (*remaining).min(available) as usize;
                    body.extend_from_slice(&data[pos..pos + n]);
                    *remaining -= n as u64;
                    pos += n;
                    if *remaining == 0 {
                        completed = Some(Msg::with_flags(std::mem::take(body), *flags));
                    }
                }
            }

            if let Some(msg) = completed {
                self.state = DecodeState::OneByteSize;
                if !self.deliver(msg, sink)? {
                    return Ok(pos);
                }
            }
        }

        Ok(pos)
    }

    fn stalled(&self) -> bool {
        self.pending.is_some()
    }
}

#[derive(Debug)]
struct InFlight {
    header: [u8; MAX_HEADER_SIZE],
    header_len: usize,
    body: Bytes,
    pos: usize,
}

impl InFlight {
    fn new(msg: Msg) -> Self {
        let (header, header_len) = frame_header(&msg);
        Self {
            header,
            header_len,
            body: msg.bytes().clone(),
            pos: 0,
        }
    }

    fn total(&self) -> usize {
        self.header_len + self.body.len()
    }

    fn copy_into(&mut self, out: &mut Vec<u8>, limit: usize) -> usize {
        let mut written = 0;
        if self.pos < self.header_len {
            let n = (self.header_len - self.pos).min(limit);
            out.extend_from_slice(&self.header[self.pos..self.pos + n]);
            self.pos += n;
            written += n;
        }
        if written < limit && self.pos >= self.header_len {
            let offset = self.pos - self.header_len;
            let n = (self.body.len() - offset).min(limit - written);
            out.extend_from_slice(&self.body[offset..offset + n]);
            self.pos += n;
            written += n;
        }
        written
    }
}

/// Encoder for the length-prefixed frame format.
#[derive(Debug, Default)]
pub struct V1Encoder {
    in_flight: Option<InFlight>,
}

impl V1Encoder {
    /// Create an idle encoder.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Encoder for V1Encoder {
    fn get_data(&mut self, out: &mut Vec<u8>, limit: usize, source: &mut dyn MsgSource) -> usize {
        let mut written = 0;
        while written < limit {
            if self.in_flight.is_none() {
                match source.pull_msg() {
                    Some(msg) => self.in_flight = Some(InFlight::new(msg)),
                    None => break,
                }
            }
            if let Some(frame) = self.in_flight.as_mut() {
                written += frame.copy_into(out, limit - written);
                if frame.pos == frame.total() {
                    self.in_flight = None;
                }
            }
        }
        written
    }
}
