//! # ZMTP Wire Library
//!
//! Byte-level building blocks for the ZMTP stream engine: greeting
//! negotiation, message framing and the CurveZMQ handshake.
//!
//! ## Overview
//!
//! Everything in this crate is I/O free. Callers feed bytes in and take bytes
//! or messages out; the engine crate owns sockets and readiness.
//!
//! - **Greeting**: bounded-lookahead detection of legacy and versioned peers
//! - **Frame Codec**: length-prefixed frames with a MORE flag
//! - **CURVE**: HELLO/WELCOME/INITIATE/READY/ERROR builders, parsers and the
//!   client/server state machines
//! - **Metadata**: property lists carried inside the CURVE boxes
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │           Session (Msg queue)           │
//! ├─────────────────────────────────────────┤
//! │     CURVE mechanism (handshake only)    │  XSalsa20-Poly1305
//! ├─────────────────────────────────────────┤
//! │        Frame codec (V1 framing)         │  Length-prefixed
//! ├─────────────────────────────────────────┤
//! │     Greeting (version sniffing)         │  2, 10 or 12+N bytes
//! ├─────────────────────────────────────────┤
//! │          Non-blocking stream            │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use zmtp_wire::{Decoder, Msg, MsgSink, PushError, V1Decoder, encode_frame};
//!
//! struct Collect(Vec<Msg>);
//!
//! impl MsgSink for Collect {
//!     fn push_msg(&mut self, msg: Msg) -> Result<(), PushError> {
//!         self.0.push(msg);
//!         Ok(())
//!     }
//! }
//!
//! let frame = encode_frame(&Msg::new(&b"hello"[..]));
//! let mut decoder = V1Decoder::new(None);
//! let mut sink = Collect(Vec::new());
//! let consumed = decoder.process_buffer(&frame, &mut sink).unwrap();
//! assert_eq!(consumed, frame.len());
//! assert_eq!(sink.0[0].data(), b"hello");
//! ```
//!
//! ## Modules
//!
//! - [`greeting`]: greeting constants and state machine
//! - [`codec`]: decoder/encoder traits and the V1 frame codec
//! - [`curve`]: CurveZMQ command tools and mechanisms
//! - [`metadata`]: handshake metadata properties
//! - [`message`]: message type and sink/source traits
//! - [`error`]: Error types

pub mod codec;
pub mod curve;
pub mod error;
pub mod greeting;
pub mod message;
pub mod metadata;

pub use codec::{encode_frame, Decoder, Encoder, V1Decoder, V1Encoder, MAX_HEADER_SIZE};
pub use curve::mechanism::{
    ClientPhase, CurveClient, CurveServer, Mechanism, MechanismStatus, ServerPhase,
};
pub use curve::{KeyPair, NonceCounter, Precomputed, PublicKey, SecretKey};
pub use error::{ProtocolError, Result};
pub use greeting::{Greeting, GreetingStep, PeerProtocol, GREETING_CAPACITY};
pub use message::{Msg, MsgFlags, MsgSink, MsgSource, PushError};
pub use metadata::Metadata;
