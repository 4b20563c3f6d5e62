//! # zmtp-engine
//!
//! Non-blocking per-connection stream engine for the ZMTP wire protocol.
//!
//! ## Overview
//!
//! A [`StreamEngine`] owns one connected socket and shuttles messages between
//! it and a [`Session`]. It negotiates the protocol generation from the
//! greeting (falling back to the legacy unversioned format when the peer does
//! not announce a version), optionally authenticates the handshake with CURVE,
//! and applies backpressure when the session cannot take more input.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                    Driver                        │
//! │  ┌────────────┐   readiness   ┌───────────────┐  │
//! │  │ PollReactor│──────────────▶│ StreamEngine  │  │
//! │  └────────────┘               └──────┬────────┘  │
//! │                                      │ Msg       │
//! │                               ┌──────▼────────┐  │
//! │                               │ ChannelSession│  │
//! │                               └──────┬────────┘  │
//! └──────────────────────────────────────┼───────────┘
//!                                        │ tokio mpsc
//!                                   application
//! ```
//!
//! Every engine callback returns an [`EngineStatus`]. When an engine hits a
//! protocol error or loses its peer it notifies the session, unplugs itself
//! and reports [`EngineStatus::Terminated`]; the [`Driver`] then drops it.
//!
//! ## Modules
//!
//! - [`config`]: TOML configuration with environment overrides
//! - [`engine`]: the stream engine itself
//! - [`error`]: engine error type
//! - [`io`]: non-blocking read/write with peer-failure classification
//! - [`options`]: per-connection options and socket types
//! - [`reactor`]: poller abstraction, `poll(2)` reactor and engine registry
//! - [`session`]: session trait and channel-backed session

pub mod config;
pub mod engine;
pub mod error;
pub mod io;
pub mod options;
pub mod reactor;
pub mod session;

pub use config::{Config, ConfigError, CurveRole};
pub use engine::{EngineStatus, StreamEngine};
pub use error::{EngineError, Result};
pub use options::{CurveOptions, EngineOptions, SocketType};
pub use reactor::{Driver, EngineId, Handle, PollReactor, Poller};
pub use session::{ChannelSession, MonitorEvent, Session, SessionHandle};

pub use zmtp_wire;
