//! Per-connection engine options.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use zmtp_wire::greeting::{LONG_PROBE_SIZE, MAX_LEGACY_IDENTITY};
use zmtp_wire::metadata::{IDENTITY, SOCKET_TYPE};
use zmtp_wire::{KeyPair, Metadata, PublicKey};

use crate::config::ConfigError;

/// Default read and write batch size in bytes.
pub const DEFAULT_BATCH_SIZE: usize = 8192;

/// Socket pattern role announced in the greeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SocketType {
    Pair,
    Pub,
    Sub,
    Req,
    Rep,
    #[default]
    Dealer,
    Router,
    Pull,
    Push,
    Xpub,
    Xsub,
}

impl SocketType {
    /// Wire code sent in the greeting.
    pub fn code(self) -> u8 {
        match self {
            SocketType::Pair => 0,
            SocketType::Pub => 1,
            SocketType::Sub => 2,
            SocketType::Req => 3,
            SocketType::Rep => 4,
            SocketType::Dealer => 5,
            SocketType::Router => 6,
            SocketType::Pull => 7,
            SocketType::Push => 8,
            SocketType::Xpub => 9,
            SocketType::Xsub => 10,
        }
    }

    /// Look up a socket type by wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => SocketType::Pair,
            1 => SocketType::Pub,
            2 => SocketType::Sub,
            3 => SocketType::Req,
            4 => SocketType::Rep,
            5 => SocketType::Dealer,
            6 => SocketType::Router,
            7 => SocketType::Pull,
            8 => SocketType::Push,
            9 => SocketType::Xpub,
            10 => SocketType::Xsub,
            _ => return None,
        })
    }

    /// Upper-case name used in handshake metadata.
    pub fn name(self) -> &'static str {
        match self {
            SocketType::Pair => "PAIR",
            SocketType::Pub => "PUB",
            SocketType::Sub => "SUB",
            SocketType::Req => "REQ",
            SocketType::Rep => "REP",
            SocketType::Dealer => "DEALER",
            SocketType::Router => "ROUTER",
            SocketType::Pull => "PULL",
            SocketType::Push => "PUSH",
            SocketType::Xpub => "XPUB",
            SocketType::Xsub => "XSUB",
        }
    }

    /// Whether a legacy peer needs a synthetic subscription injected.
    pub fn is_publisher(self) -> bool {
        matches!(self, SocketType::Pub | SocketType::Xpub)
    }
}

impl fmt::Display for SocketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SocketType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "pair" => SocketType::Pair,
            "pub" => SocketType::Pub,
            "sub" => SocketType::Sub,
            "req" => SocketType::Req,
            "rep" => SocketType::Rep,
            "dealer" => SocketType::Dealer,
            "router" => SocketType::Router,
            "pull" => SocketType::Pull,
            "push" => SocketType::Push,
            "xpub" => SocketType::Xpub,
            "xsub" => SocketType::Xsub,
            _ => return Err(ConfigError::InvalidSocketType(s.to_string())),
        })
    }
}

/// CURVE role and key material.
#[derive(Debug, Clone)]
pub enum CurveOptions {
    /// Connect to a server whose long-term public key is known.
    Client {
        /// Our long-term key pair.
        keys: KeyPair,
        /// Server long-term public key.
        server_key: PublicKey,
    },
    /// Accept clients with our long-term key pair.
    Server {
        /// Our long-term key pair.
        keys: KeyPair,
    },
}

/// Options fixed for the lifetime of one engine.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Our socket type.
    pub socket_type: SocketType,
    /// Routing identity sent as the first message.
    pub identity: Vec<u8>,
    /// Maximum bytes read per input event.
    pub in_batch_size: usize,
    /// Maximum bytes encoded per output event.
    pub out_batch_size: usize,
    /// Largest inbound message body accepted. `None` is unlimited.
    pub max_msg_size: Option<u64>,
    /// `SO_SNDBUF` override.
    pub send_buffer_size: Option<usize>,
    /// `SO_RCVBUF` override.
    pub recv_buffer_size: Option<usize>,
    /// CURVE security, if enabled.
    pub curve: Option<CurveOptions>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            socket_type: SocketType::default(),
            identity: Vec::new(),
            in_batch_size: DEFAULT_BATCH_SIZE,
            out_batch_size: DEFAULT_BATCH_SIZE,
            max_msg_size: None,
            send_buffer_size: None,
            recv_buffer_size: None,
            curve: None,
        }
    }
}

impl EngineOptions {
    /// Options for the given socket type, everything else default.
    pub fn new(socket_type: SocketType) -> Self {
        Self {
            socket_type,
            ..Self::default()
        }
    }

    /// Set the routing identity.
    pub fn with_identity(mut self, identity: impl Into<Vec<u8>>) -> Self {
        self.identity = identity.into();
        self
    }

    /// Enable CURVE.
    pub fn with_curve(mut self, curve: CurveOptions) -> Self {
        self.curve = Some(curve);
        self
    }

    /// Check the options before an engine is built from them.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity.len() > MAX_LEGACY_IDENTITY {
            return Err(ConfigError::InvalidIdentityLength(self.identity.len()));
        }
        // The legacy path replays up to a full long-form probe from this buffer.
        if self.in_batch_size < LONG_PROBE_SIZE {
            return Err(ConfigError::InvalidBatchSize {
                name: "in_batch_size",
                value: self.in_batch_size,
            });
        }
        if self.out_batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize {
                name: "out_batch_size",
                value: self.out_batch_size,
            });
        }
        Ok(())
    }

    /// Metadata announced inside the CURVE handshake.
    pub fn handshake_metadata(&self) -> zmtp_wire::Result<Metadata> {
        let mut metadata = Metadata::new().with(SOCKET_TYPE, self.socket_type.name())?;
        if !self.identity.is_empty() {
            metadata.insert(IDENTITY, self.identity.clone())?;
        }
        Ok(metadata)
    }
}
