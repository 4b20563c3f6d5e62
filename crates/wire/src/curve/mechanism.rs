//! CURVE handshake state machines.
//!
//! A mechanism consumes handshake commands from the peer and queues the
//! commands it wants to send. The engine drains the queue through the encoder
//! and stops routing frames to the mechanism once [`MechanismStatus::Ready`]
//! is reported and nothing is left to send.
//!
//! ```text
//! client: SendHello -> ExpectWelcome -> SendInitiate -> ExpectReady -> Established
//! server: ExpectHello -> SendWelcome -> ExpectInitiate -> SendReady -> Established
//! ```
//!
//! Any failure moves either side to `Rejected`, which is terminal.

use std::collections::VecDeque;

use tracing::{debug, warn};

use super::client::{process_ready, process_welcome, produce_hello, produce_initiate, produce_vouch};
use super::server::{process_hello, process_initiate, produce_ready, produce_welcome, CookieKey};
use super::{
    is_handshake_command_error, is_handshake_command_hello, is_handshake_command_initiate,
    is_handshake_command_ready, is_handshake_command_welcome, process_error, KeyPair,
    NonceCounter, PublicKey,
};
use crate::error::{ProtocolError, Result};
use crate::message::Msg;
use crate::metadata::Metadata;

/// Coarse handshake status as seen by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MechanismStatus {
    /// Commands are still being exchanged.
    Handshaking,
    /// Both sides are authenticated.
    Ready,
    /// The handshake was rejected.
    Error,
}

/// A security handshake driven by framed commands.
pub trait Mechanism: Send {
    /// Take the next command to send, if one is queued.
    fn next_handshake_command(&mut self) -> Option<Msg>;

    /// Process a command received from the peer.
    ///
    /// An error is terminal: the mechanism moves to
    /// [`MechanismStatus::Error`] and the connection must be dropped.
    fn process_handshake_command(&mut self, msg: &Msg) -> Result<()>;

    /// Current status.
    fn status(&self) -> MechanismStatus;

    /// Metadata announced by the peer, once authenticated.
    fn peer_metadata(&self) -> Option<&Metadata>;
}

/// Name of the command in `msg`, for diagnostics.
fn command_name(msg: &[u8]) -> Option<&'static str> {
    if is_handshake_command_hello(msg) {
        Some("HELLO")
    } else if is_handshake_command_welcome(msg) {
        Some("WELCOME")
    } else if is_handshake_command_initiate(msg) {
        Some("INITIATE")
    } else if is_handshake_command_ready(msg) {
        Some("READY")
    } else if is_handshake_command_error(msg) {
        Some("ERROR")
    } else {
        None
    }
}

fn unexpected(msg: &[u8], state: &'static str) -> ProtocolError {
    match command_name(msg) {
        Some(command) => ProtocolError::UnexpectedCommand { command, state },
        None => ProtocolError::InvalidCommand,
    }
}

/// Client handshake phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    /// HELLO not yet queued.
    SendHello,
    /// HELLO queued; waiting for WELCOME.
    ExpectWelcome,
    /// WELCOME authenticated; INITIATE not yet queued.
    SendInitiate,
    /// INITIATE queued; waiting for READY or ERROR.
    ExpectReady,
    /// READY authenticated.
    Established,
    /// Handshake failed.
    Rejected,
}

impl ClientPhase {
    fn describe(self) -> &'static str {
        match self {
            ClientPhase::SendHello => "sending HELLO",
            ClientPhase::ExpectWelcome => "waiting for WELCOME",
            ClientPhase::SendInitiate => "sending INITIATE",
            ClientPhase::ExpectReady => "waiting for READY",
            ClientPhase::Established => "established",
            ClientPhase::Rejected => "rejected",
        }
    }
}

/// CURVE client mechanism.
pub struct CurveClient {
    phase: ClientPhase,
    long_term: KeyPair,
    transient: KeyPair,
    server_key: PublicKey,
    nonce: NonceCounter,
    metadata: Metadata,
    session_key: Option<super::Precomputed>,
    peer_metadata: Option<Metadata>,
    outbound: VecDeque<Msg>,
}

impl CurveClient {
    /// Create a client and queue its HELLO.
    pub fn new(long_term: KeyPair, server_key: PublicKey, metadata: Metadata) -> Result<Self> {
        let mut client = Self {
            phase: ClientPhase::SendHello,
            long_term,
            transient: KeyPair::generate(),
            server_key,
            nonce: NonceCounter::new(),
            metadata,
            session_key: None,
            peer_metadata: None,
            outbound: VecDeque::new(),
        };
        client.send_hello()?;
        Ok(client)
    }

    /// Current phase.
    pub fn phase(&self) -> ClientPhase {
        self.phase
    }

    fn send_hello(&mut self) -> Result<()> {
        let hello = produce_hello(
            &self.server_key,
            self.nonce.next_nonce()?,
            &self.transient.public,
            &self.transient.secret,
        )?;
        self.outbound.push_back(Msg::new(hello.to_vec()));
        self.phase = ClientPhase::ExpectWelcome;
        debug!("CURVE client queued HELLO");
        Ok(())
    }

    fn on_welcome(&mut self, msg: &[u8]) -> Result<()> {
        let welcome = process_welcome(msg, &self.server_key, &self.transient.secret)?;
        self.phase = ClientPhase::SendInitiate;
        debug!("CURVE client authenticated WELCOME");

        let vouch = produce_vouch(
            &self.long_term.secret,
            &self.transient.public,
            &self.server_key,
            &welcome.server_transient,
        )?;
        let initiate = produce_initiate(
            &welcome.cookie,
            self.nonce.next_nonce()?,
            &welcome.precomputed,
            &self.long_term.public,
            &vouch,
            &self.metadata.encode(),
        )?;
        self.outbound.push_back(Msg::new(initiate));
        self.session_key = Some(welcome.precomputed);
        self.phase = ClientPhase::ExpectReady;
        debug!("CURVE client queued INITIATE");
        Ok(())
    }

    fn on_ready(&mut self, msg: &[u8]) -> Result<()> {
        let key = self
            .session_key
            .as_ref()
            .ok_or(ProtocolError::UnexpectedCommand {
                command: "READY",
                state: self.phase.describe(),
            })?;
        let ready = process_ready(msg, key)?;
        self.peer_metadata = Some(ready.metadata);
        self.phase = ClientPhase::Established;
        debug!("CURVE client authenticated READY");
        Ok(())
    }

    fn step(&mut self, msg: &[u8]) -> Result<()> {
        match self.phase {
            ClientPhase::ExpectWelcome | ClientPhase::ExpectReady
                if is_handshake_command_error(msg) =>
            {
                Err(ProtocolError::PeerError(process_error(msg)?))
            }
            ClientPhase::ExpectWelcome if is_handshake_command_welcome(msg) => self.on_welcome(msg),
            ClientPhase::ExpectReady if is_handshake_command_ready(msg) => self.on_ready(msg),
            phase => Err(unexpected(msg, phase.describe())),
        }
    }
}

impl Mechanism for CurveClient {
    fn next_handshake_command(&mut self) -> Option<Msg> {
        self.outbound.pop_front()
    }

    fn process_handshake_command(&mut self, msg: &Msg) -> Result<()> {
        let result = self.step(msg.data());
        if let Err(ref err) = result {
            warn!(phase = ?self.phase, error = %err, "CURVE client handshake rejected");
            self.phase = ClientPhase::Rejected;
            self.outbound.clear();
            self.session_key = None;
        }
        result
    }

    fn status(&self) -> MechanismStatus {
        match self.phase {
            ClientPhase::Established => MechanismStatus::Ready,
            ClientPhase::Rejected => MechanismStatus::Error,
            _ => MechanismStatus::Handshaking,
        }
    }

    fn peer_metadata(&self) -> Option<&Metadata> {
        self.peer_metadata.as_ref()
    }
}

impl std::fmt::Debug for CurveClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CurveClient")
            .field("phase", &self.phase)
            .field("queued", &self.outbound.len())
            .finish()
    }
}

/// Server handshake phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerPhase {
    /// Waiting for HELLO.
    ExpectHello,
    /// HELLO authenticated; WELCOME not yet queued.
    SendWelcome,
    /// WELCOME queued; waiting for INITIATE.
    ExpectInitiate,
    /// INITIATE authenticated; READY not yet queued.
    SendReady,
    /// READY queued.
    Established,
    /// Handshake failed.
    Rejected,
}

impl ServerPhase {
    fn describe(self) -> &'static str {
        match self {
            ServerPhase::ExpectHello => "waiting for HELLO",
            ServerPhase::SendWelcome => "sending WELCOME",
            ServerPhase::ExpectInitiate => "waiting for INITIATE",
            ServerPhase::SendReady => "sending READY",
            ServerPhase::Established => "established",
            ServerPhase::Rejected => "rejected",
        }
    }
}

/// CURVE server mechanism.
pub struct CurveServer {
    phase: ServerPhase,
    long_term: KeyPair,
    cookie_key: CookieKey,
    nonce: NonceCounter,
    metadata: Metadata,
    hello: Option<super::server::Hello>,
    client_key: Option<PublicKey>,
    peer_metadata: Option<Metadata>,
    outbound: VecDeque<Msg>,
}

impl CurveServer {
    /// Create a server waiting for HELLO.
    pub fn new(long_term: KeyPair, metadata: Metadata) -> Self {
        Self {
            phase: ServerPhase::ExpectHello,
            long_term,
            cookie_key: CookieKey::generate(),
            nonce: NonceCounter::new(),
            metadata,
            hello: None,
            client_key: None,
            peer_metadata: None,
            outbound: VecDeque::new(),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> ServerPhase {
        self.phase
    }

    /// Long-term public key the client vouched with, once authenticated.
    pub fn client_key(&self) -> Option<&PublicKey> {
        self.client_key.as_ref()
    }

    fn on_hello(&mut self, msg: &[u8]) -> Result<()> {
        let hello = process_hello(msg, &self.long_term.secret)?;
        self.phase = ServerPhase::SendWelcome;
        debug!("CURVE server authenticated HELLO");

        let transient = KeyPair::generate();
        let welcome = produce_welcome(
            &hello.client_transient,
            &self.long_term.secret,
            &transient,
            &self.cookie_key,
        )?;
        self.outbound.push_back(Msg::new(welcome.to_vec()));
        self.hello = Some(hello);
        self.phase = ServerPhase::ExpectInitiate;
        debug!("CURVE server queued WELCOME");
        Ok(())
    }

    fn on_initiate(&mut self, msg: &[u8]) -> Result<()> {
        let initiate = process_initiate(msg, &self.cookie_key, &self.long_term.public)?;
        if let Some(hello) = &self.hello {
            if hello.client_transient != initiate.client_transient {
                return Err(ProtocolError::Authentication("cookie"));
            }
            if initiate.short_nonce <= hello.short_nonce {
                return Err(ProtocolError::Authentication("INITIATE nonce"));
            }
        }
        self.phase = ServerPhase::SendReady;
        debug!("CURVE server authenticated INITIATE");

        let ready = produce_ready(
            &initiate.precomputed,
            self.nonce.next_nonce()?,
            &self.metadata.encode(),
        )?;
        self.outbound.push_back(Msg::new(ready));
        self.client_key = Some(initiate.client_key);
        self.peer_metadata = Some(initiate.metadata);
        self.phase = ServerPhase::Established;
        debug!("CURVE server queued READY");
        Ok(())
    }

    fn step(&mut self, msg: &[u8]) -> Result<()> {
        match self.phase {
            ServerPhase::ExpectHello if is_handshake_command_hello(msg) => self.on_hello(msg),
            ServerPhase::ExpectInitiate if is_handshake_command_initiate(msg) => {
                self.on_initiate(msg)
            }
            phase => Err(unexpected(msg, phase.describe())),
        }
    }
}

impl Mechanism for CurveServer {
    fn next_handshake_command(&mut self) -> Option<Msg> {
        self.outbound.pop_front()
    }

    fn process_handshake_command(&mut self, msg: &Msg) -> Result<()> {
        let result = self.step(msg.data());
        if let Err(ref err) = result {
            warn!(phase = ?self.phase, error = %err, "CURVE server handshake rejected");
            self.phase = ServerPhase::Rejected;
            self.outbound.clear();
        }
        result
    }

    fn status(&self) -> MechanismStatus {
        match self.phase {
            ServerPhase::Established => MechanismStatus::Ready,
            ServerPhase::Rejected => MechanismStatus::Error,
            _ => MechanismStatus::Handshaking,
        }
    }

    fn peer_metadata(&self) -> Option<&Metadata> {
        self.peer_metadata.as_ref()
    }
}

impl std::fmt::Debug for CurveServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CurveServer")
            .field("phase", &self.phase)
            .field("queued", &self.outbound.len())
            .finish()
    }
}
