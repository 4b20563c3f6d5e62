//! The per-connection stream engine.
//!
//! A [`StreamEngine`] owns one connected, non-blocking byte stream and moves
//! messages between it and a [`Session`]. It starts by sniffing the peer's
//! protocol generation from the greeting, optionally runs a CURVE handshake,
//! and then pumps frames through the decoder and encoder.
//!
//! ```text
//! handshaking ──greeting──▶ securing (CURVE only) ──READY──▶ active
//!      │                          │                            │
//!      └────────── protocol error / peer failure ──────────────┴──▶ terminated
//! ```
//!
//! While the greeting is in progress the engine reads straight into the
//! greeting buffer. Afterwards every decoded message goes through the current
//! [`Route`]: directly to the session, through the legacy subscription shim,
//! or into the security mechanism.

use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};

use bytes::Bytes;
use socket2::SockRef;
use tracing::{debug, trace, warn};
use zmtp_wire::greeting::{continuation, legacy_header_size, preamble};
use zmtp_wire::{
    CurveClient, CurveServer, Decoder, Encoder, Greeting, GreetingStep, Mechanism,
    MechanismStatus, Msg, MsgSink, MsgSource, PeerProtocol, ProtocolError, PushError, V1Decoder,
    V1Encoder,
};

use crate::error::{EngineError, Result};
use crate::io::{read_nonblocking, write_nonblocking};
use crate::options::{CurveOptions, EngineOptions, SocketType};
use crate::reactor::{Handle, Poller};
use crate::session::{MonitorEvent, Session};

/// Body of the synthetic subscribe-to-everything message.
const SUBSCRIBE_ALL: &[u8] = &[0x01];

/// Whether the engine is still alive after a callback.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// Keep the engine.
    Active,
    /// The engine has unplugged itself and should be dropped.
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShimState {
    ExpectIdentity,
    SubscribePending,
    Done,
}

struct Security {
    mechanism: Box<dyn Mechanism>,
    ready: bool,
    drained: bool,
}

enum Route {
    Session,
    Subscribe(ShimState),
    Security(Security),
}

/// Sink that slips a subscribe-all message in right after the peer identity.
///
/// Legacy subscribers never send subscriptions, so without it a publisher
/// would filter out everything.
struct SubscriptionShim<'a, T> {
    state: &'a mut ShimState,
    session: &'a mut T,
}

impl<T: Session> SubscriptionShim<'_, T> {
    /// Offer the subscription. `Ok(false)` means the session is full.
    fn inject(&mut self) -> std::result::Result<bool, PushError> {
        match self.session.push_msg(Msg::new(Bytes::from_static(SUBSCRIBE_ALL))) {
            Ok(()) => {
                *self.state = ShimState::Done;
                self.session.flush();
                Ok(true)
            }
            Err(PushError::WouldBlock(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

impl<T: Session> MsgSink for SubscriptionShim<'_, T> {
    fn push_msg(&mut self, msg: Msg) -> std::result::Result<(), PushError> {
        match *self.state {
            ShimState::ExpectIdentity => {
                self.session.push_msg(msg)?;
                *self.state = ShimState::SubscribePending;
                self.inject()?;
                Ok(())
            }
            ShimState::SubscribePending => {
                if !self.inject()? {
                    return Err(PushError::WouldBlock(msg));
                }
                self.session.push_msg(msg)
            }
            ShimState::Done => self.session.push_msg(msg),
        }
    }
}

/// Sink that feeds handshake commands to the mechanism until it is ready.
struct SecuritySink<'a, T> {
    security: &'a mut Security,
    session: &'a mut T,
}

impl<T: Session> MsgSink for SecuritySink<'_, T> {
    fn push_msg(&mut self, msg: Msg) -> std::result::Result<(), PushError> {
        if self.security.mechanism.status() == MechanismStatus::Ready {
            return self.session.push_msg(msg);
        }
        self.security.mechanism.process_handshake_command(&msg)?;
        Ok(())
    }
}

/// Source that yields the local identity before any session output.
struct Outbound<'a, T> {
    identity: &'a mut Option<Msg>,
    session: &'a mut T,
}

impl<T: Session> MsgSource for Outbound<'_, T> {
    fn pull_msg(&mut self) -> Option<Msg> {
        self.identity.take().or_else(|| self.session.pull_msg())
    }
}

/// Source that drains the mechanism's commands before any session output.
struct SecuritySource<'a, T> {
    security: &'a mut Security,
    outbound: Outbound<'a, T>,
}

impl<T: Session> MsgSource for SecuritySource<'_, T> {
    fn pull_msg(&mut self) -> Option<Msg> {
        if let Some(command) = self.security.mechanism.next_handshake_command() {
            return Some(command);
        }
        if self.security.mechanism.status() == MechanismStatus::Ready {
            self.security.drained = true;
            return self.outbound.pull_msg();
        }
        None
    }
}

/// Non-blocking driver for one connection.
pub struct StreamEngine<S, T>
where
    S: Read + Write + AsFd,
    T: Session,
{
    stream: S,
    fd: RawFd,
    session: T,
    identity: Option<Msg>,
    options: EngineOptions,
    endpoint: String,

    handle: Option<Handle>,
    plugged: bool,
    pollin: bool,
    pollout: bool,

    inbuf: Vec<u8>,
    in_pos: usize,
    in_len: usize,
    input_error: bool,

    outbuf: Vec<u8>,
    out_pos: usize,

    handshaking: bool,
    greeting: Greeting,
    decoder: Option<Box<dyn Decoder>>,
    encoder: Option<Box<dyn Encoder>>,
    route: Route,
}

impl<S, T> StreamEngine<S, T>
where
    S: Read + Write + AsFd,
    T: Session,
{
    /// Wrap a connected stream.
    ///
    /// The descriptor is switched to non-blocking mode and the configured
    /// socket buffer sizes are applied.
    pub fn new(stream: S, session: T, options: EngineOptions, endpoint: impl Into<String>) -> Result<Self> {
        options.validate()?;
        {
            let socket = SockRef::from(&stream);
            socket.set_nonblocking(true)?;
            if let Some(size) = options.send_buffer_size {
                socket.set_send_buffer_size(size)?;
            }
            if let Some(size) = options.recv_buffer_size {
                socket.set_recv_buffer_size(size)?;
            }
        }
        let fd = stream.as_fd().as_raw_fd();

        Ok(Self {
            stream,
            fd,
            session,
            identity: Some(Msg::new(options.identity.clone())),
            inbuf: vec![0u8; options.in_batch_size],
            outbuf: Vec::with_capacity(options.out_batch_size),
            options,
            endpoint: endpoint.into(),
            handle: None,
            plugged: false,
            pollin: false,
            pollout: false,
            in_pos: 0,
            in_len: 0,
            input_error: false,
            out_pos: 0,
            handshaking: true,
            greeting: Greeting::new(),
            decoder: None,
            encoder: None,
            route: Route::Session,
        })
    }

    /// Peer endpoint used in diagnostics.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Poller registration, while plugged.
    pub fn handle(&self) -> Option<Handle> {
        self.handle
    }

    /// Whether the engine is registered with a poller.
    pub fn is_plugged(&self) -> bool {
        self.plugged
    }

    /// Whether the greeting is still in progress.
    pub fn is_handshaking(&self) -> bool {
        self.handshaking
    }

    /// Whether greeting and security are both done.
    pub fn is_established(&self) -> bool {
        !self.handshaking && !matches!(&self.route, Route::Security(s) if !s.ready)
    }

    /// Protocol generation the peer speaks, once known.
    pub fn peer_protocol(&self) -> Option<PeerProtocol> {
        self.greeting.outcome()
    }

    /// The attached session.
    pub fn session(&self) -> &T {
        &self.session
    }

    /// The attached session, mutably.
    pub fn session_mut(&mut self) -> &mut T {
        &mut self.session
    }

    /// Register with `poller`, queue the greeting preamble and read whatever
    /// the peer has already sent.
    pub fn plug(&mut self, poller: &mut dyn Poller) -> EngineStatus {
        assert!(!self.plugged, "engine plugged twice");
        self.plugged = true;
        self.handle = Some(poller.add_fd(self.fd));

        // Long-form length and flags of our identity frame. A legacy peer
        // reads them as a frame header; a versioned peer sees the flag bit.
        self.outbuf
            .extend_from_slice(&preamble(self.options.identity.len()));

        self.set_pollin(poller);
        self.set_pollout(poller);
        debug!(endpoint = %self.endpoint, fd = self.fd, "engine plugged");

        self.in_event(poller)
    }

    /// Deregister from the poller and stop moving messages.
    ///
    /// # Panics
    ///
    /// Panics if the engine is not plugged.
    pub fn unplug(&mut self, poller: &mut dyn Poller) {
        assert!(self.plugged, "engine unplugged twice");
        self.plugged = false;
        if let Some(handle) = self.handle.take() {
            poller.rm_fd(handle);
        }
        self.pollin = false;
        self.pollout = false;
        self.decoder = None;
        self.encoder = None;
        self.route = Route::Session;
        debug!(endpoint = %self.endpoint, fd = self.fd, "engine unplugged");
    }

    /// Unplug and retire the engine without notifying the session.
    pub fn terminate(&mut self, poller: &mut dyn Poller) -> EngineStatus {
        self.unplug(poller);
        EngineStatus::Terminated
    }

    /// The descriptor is readable.
    pub fn in_event(&mut self, poller: &mut dyn Poller) -> EngineStatus {
        if !self.plugged {
            return EngineStatus::Terminated;
        }
        match self.try_in_event(poller) {
            Ok(status) => status,
            Err(err) => self.fail(poller, err),
        }
    }

    /// The descriptor is writable.
    pub fn out_event(&mut self, poller: &mut dyn Poller) -> EngineStatus {
        if !self.plugged {
            return EngineStatus::Terminated;
        }

        if self.out_pos == self.outbuf.len() {
            self.outbuf.clear();
            self.out_pos = 0;
            if !self.handshaking {
                self.encode();
                self.settle_route(poller);
            }
            if self.outbuf.is_empty() {
                self.reset_pollout(poller);
                return EngineStatus::Active;
            }
        }

        match write_nonblocking(&mut self.stream, &self.outbuf[self.out_pos..]) {
            Ok(n) => {
                trace!(endpoint = %self.endpoint, bytes = n, "wrote");
                self.out_pos += n;
            }
            Err(err) => {
                // Teardown is left to the read side so inbound data is not lost.
                debug!(endpoint = %self.endpoint, error = %err, "write failed");
                self.reset_pollout(poller);
                return EngineStatus::Active;
            }
        }

        if self.handshaking && self.out_pos == self.outbuf.len() {
            self.reset_pollout(poller);
        }
        EngineStatus::Active
    }

    /// New output is available; resume writing and try right away.
    pub fn activate_out(&mut self, poller: &mut dyn Poller) -> EngineStatus {
        if !self.plugged {
            return EngineStatus::Terminated;
        }
        self.set_pollout(poller);
        self.out_event(poller)
    }

    /// The session has room again; resume reading.
    ///
    /// If the peer disconnected while a message was stuck in the decoder, the
    /// message is delivered now and the engine tears down.
    pub fn activate_in(&mut self, poller: &mut dyn Poller) -> EngineStatus {
        if !self.plugged {
            return EngineStatus::Terminated;
        }

        if self.input_error {
            if let Err(err) = self.decode() {
                return self.fail(poller, err.into());
            }
            self.session.flush();
            if self.decoder_stalled() {
                trace!(endpoint = %self.endpoint, "session still full, teardown deferred");
                return EngineStatus::Active;
            }
            return self.error(poller);
        }

        if let Route::Subscribe(state @ ShimState::SubscribePending) = &mut self.route {
            let mut shim = SubscriptionShim {
                state,
                session: &mut self.session,
            };
            if let Err(PushError::Protocol(err)) = shim.inject() {
                return self.fail(poller, err.into());
            }
            self.settle_route(poller);
        }

        self.set_pollin(poller);
        self.in_event(poller)
    }

    /// Resume whichever direction the session has unblocked since the last
    /// call. Called by the driver once per turn.
    pub fn poll_session(&mut self, poller: &mut dyn Poller) -> EngineStatus {
        if !self.plugged {
            return EngineStatus::Terminated;
        }
        if self.handshaking {
            return EngineStatus::Active;
        }

        if self.input_blocked()
            && self.session.input_ready()
            && self.activate_in(poller) == EngineStatus::Terminated
        {
            return EngineStatus::Terminated;
        }
        if !self.pollout && self.is_established() && self.output_pending() {
            return self.activate_out(poller);
        }
        EngineStatus::Active
    }

    fn try_in_event(&mut self, poller: &mut dyn Poller) -> Result<EngineStatus> {
        if self.handshaking && !self.handshake(poller)? {
            return Ok(EngineStatus::Active);
        }

        let mut disconnected = false;
        if self.in_len == 0 {
            self.in_pos = 0;
            match read_nonblocking(&mut self.stream, &mut self.inbuf) {
                Ok(0) => {
                    if !self.decoder_stalled() {
                        return Ok(EngineStatus::Active);
                    }
                }
                Ok(n) => {
                    trace!(endpoint = %self.endpoint, bytes = n, "read");
                    self.in_len = n;
                }
                Err(err) => {
                    debug!(endpoint = %self.endpoint, error = %err, "read failed");
                    disconnected = true;
                }
            }
        }

        let processed = self.decode()?;
        self.in_pos += processed;
        self.in_len -= processed;
        if self.in_len > 0 {
            // The session refused a message; wait for activate_in.
            self.reset_pollin(poller);
        }
        self.session.flush();

        if matches!(self.route, Route::Security(_)) {
            // The mechanism may have queued a reply.
            self.set_pollout(poller);
        }
        self.settle_route(poller);

        if disconnected {
            self.input_error = true;
            if self.decoder_stalled() {
                debug!(
                    endpoint = %self.endpoint,
                    "peer gone with a message pending, deferring teardown"
                );
                self.reset_pollin(poller);
            } else {
                return Ok(self.error(poller));
            }
        }
        Ok(EngineStatus::Active)
    }

    /// Advance the greeting. Returns `true` once it is complete and the
    /// codec is wired.
    fn handshake(&mut self, poller: &mut dyn Poller) -> Result<bool> {
        while self.greeting.outcome().is_none() {
            let n = read_nonblocking(&mut self.stream, self.greeting.unfilled())?;
            if n == 0 {
                return Ok(false);
            }
            trace!(endpoint = %self.endpoint, bytes = n, "greeting bytes");

            if self.greeting.advance(n)? == GreetingStep::SendContinuation {
                let idle = self.out_pos == self.outbuf.len();
                self.outbuf
                    .extend_from_slice(&continuation(self.options.socket_type.code()));
                if idle {
                    self.set_pollout(poller);
                }
                debug!(endpoint = %self.endpoint, "versioned peer, sending continuation");
            }
        }
        let Some(protocol) = self.greeting.outcome() else {
            return Ok(false);
        };

        self.decoder = Some(Box::new(V1Decoder::new(self.options.max_msg_size)));
        let mut encoder: Box<dyn Encoder> = Box::new(V1Encoder::new());

        match protocol {
            PeerProtocol::Legacy => {
                if self.options.curve.is_some() {
                    return Err(ProtocolError::LegacyPeerRejected.into());
                }

                // The preamble already went out as our identity frame header.
                let header_size = legacy_header_size(self.options.identity.len());
                let mut discarded = Vec::with_capacity(header_size);
                let n = encoder.get_data(
                    &mut discarded,
                    header_size,
                    &mut Outbound {
                        identity: &mut self.identity,
                        session: &mut self.session,
                    },
                );
                if n != header_size {
                    return Err(EngineError::IdentityHeader {
                        expected: header_size,
                        discarded: n,
                    });
                }

                // What we read so far is the start of the peer's identity frame.
                let received = self.greeting.received();
                self.inbuf[..received.len()].copy_from_slice(received);
                self.in_pos = 0;
                self.in_len = received.len();

                if self.options.socket_type.is_publisher() {
                    self.route = Route::Subscribe(ShimState::ExpectIdentity);
                }
                debug!(
                    endpoint = %self.endpoint,
                    greeting_bytes = self.in_len,
                    "legacy peer"
                );
            }
            PeerProtocol::Versioned {
                revision,
                socket_type,
            } => {
                debug!(
                    endpoint = %self.endpoint,
                    revision,
                    peer_socket_type = ?socket_type.and_then(SocketType::from_code),
                    "versioned greeting complete"
                );
                if let Some(curve) = &self.options.curve {
                    let metadata = self.options.handshake_metadata()?;
                    let mechanism: Box<dyn Mechanism> = match curve {
                        CurveOptions::Client { keys, server_key } => Box::new(CurveClient::new(
                            keys.clone(),
                            server_key.clone(),
                            metadata,
                        )?),
                        CurveOptions::Server { keys } => {
                            Box::new(CurveServer::new(keys.clone(), metadata))
                        }
                    };
                    self.route = Route::Security(Security {
                        mechanism,
                        ready: false,
                        drained: false,
                    });
                }
            }
        }
        self.encoder = Some(encoder);

        if self.out_pos == self.outbuf.len() {
            self.set_pollout(poller);
        }
        self.handshaking = false;
        if !matches!(self.route, Route::Security(_)) {
            self.announce_established();
        }
        Ok(true)
    }

    /// Feed buffered input to the decoder through the current route.
    fn decode(&mut self) -> std::result::Result<usize, ProtocolError> {
        let Some(decoder) = self.decoder.as_deref_mut() else {
            return Ok(0);
        };
        let data = &self.inbuf[self.in_pos..self.in_pos + self.in_len];
        match &mut self.route {
            Route::Session => decoder.process_buffer(data, &mut self.session),
            Route::Subscribe(state) => decoder.process_buffer(
                data,
                &mut SubscriptionShim {
                    state,
                    session: &mut self.session,
                },
            ),
            Route::Security(security) => decoder.process_buffer(
                data,
                &mut SecuritySink {
                    security,
                    session: &mut self.session,
                },
            ),
        }
    }

    /// Refill the output buffer from the current route.
    fn encode(&mut self) -> usize {
        let Some(encoder) = self.encoder.as_deref_mut() else {
            return 0;
        };
        let limit = self.options.out_batch_size;
        match &mut self.route {
            Route::Security(security) => encoder.get_data(
                &mut self.outbuf,
                limit,
                &mut SecuritySource {
                    security,
                    outbound: Outbound {
                        identity: &mut self.identity,
                        session: &mut self.session,
                    },
                },
            ),
            _ => encoder.get_data(
                &mut self.outbuf,
                limit,
                &mut Outbound {
                    identity: &mut self.identity,
                    session: &mut self.session,
                },
            ),
        }
    }

    fn output_pending(&self) -> bool {
        self.identity.is_some() || self.session.output_pending()
    }

    /// Drop adapters that have finished their job.
    fn settle_route(&mut self, poller: &mut dyn Poller) {
        let (became_ready, finished) = match &mut self.route {
            Route::Session => return,
            Route::Subscribe(state) => (false, *state == ShimState::Done),
            Route::Security(security) => {
                let became_ready =
                    !security.ready && security.mechanism.status() == MechanismStatus::Ready;
                security.ready |= became_ready;
                (became_ready, security.drained)
            }
        };

        if became_ready {
            self.announce_established();
            self.set_pollout(poller);
        }
        if finished {
            trace!(endpoint = %self.endpoint, "restoring direct session routing");
            self.route = Route::Session;
        }
    }

    fn announce_established(&mut self) {
        debug!(endpoint = %self.endpoint, fd = self.fd, "handshake complete");
        self.session.monitor_event(MonitorEvent::HandshakeSucceeded {
            endpoint: self.endpoint.clone(),
        });
    }

    fn decoder_stalled(&self) -> bool {
        self.decoder.as_ref().is_some_and(|decoder| decoder.stalled())
    }

    /// Whether input is waiting on the session rather than the socket.
    fn input_blocked(&self) -> bool {
        !self.pollin
            || self.decoder_stalled()
            || matches!(self.route, Route::Subscribe(ShimState::SubscribePending))
    }

    /// Log `err`, report a failed handshake if applicable, and tear down.
    fn fail(&mut self, poller: &mut dyn Poller, err: EngineError) -> EngineStatus {
        match &err {
            EngineError::Protocol(protocol) => {
                warn!(
                    endpoint = %self.endpoint,
                    fd = self.fd,
                    error = %protocol,
                    "protocol violation, closing connection"
                );
                if !self.is_established() {
                    self.session.monitor_event(MonitorEvent::HandshakeFailed {
                        endpoint: self.endpoint.clone(),
                        reason: protocol.to_string(),
                    });
                }
            }
            EngineError::IdentityHeader { .. } => {
                warn!(endpoint = %self.endpoint, fd = self.fd, error = %err, "closing connection");
            }
            other => {
                debug!(endpoint = %self.endpoint, fd = self.fd, error = %other, "connection lost");
            }
        }
        self.error(poller)
    }

    /// Single teardown path: notify, detach, unplug.
    fn error(&mut self, poller: &mut dyn Poller) -> EngineStatus {
        self.session.monitor_event(MonitorEvent::Disconnected {
            endpoint: self.endpoint.clone(),
            fd: self.fd,
        });
        self.session.detach();
        self.unplug(poller);
        EngineStatus::Terminated
    }

    fn set_pollin(&mut self, poller: &mut dyn Poller) {
        if let Some(handle) = self.handle {
            poller.set_pollin(handle);
            self.pollin = true;
        }
    }

    fn reset_pollin(&mut self, poller: &mut dyn Poller) {
        if let Some(handle) = self.handle {
            poller.reset_pollin(handle);
            self.pollin = false;
        }
    }

    fn set_pollout(&mut self, poller: &mut dyn Poller) {
        if let Some(handle) = self.handle {
            poller.set_pollout(handle);
            self.pollout = true;
        }
    }

    fn reset_pollout(&mut self, poller: &mut dyn Poller) {
        if let Some(handle) = self.handle {
            poller.reset_pollout(handle);
            self.pollout = false;
        }
    }
}

impl<S, T> AsFd for StreamEngine<S, T>
where
    S: Read + Write + AsFd,
    T: Session,
{
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

impl<S, T> Drop for StreamEngine<S, T>
where
    S: Read + Write + AsFd,
    T: Session,
{
    fn drop(&mut self) {
        if !std::thread::panicking() {
            assert!(!self.plugged, "engine dropped while plugged");
        }
    }
}

impl<S, T> std::fmt::Debug for StreamEngine<S, T>
where
    S: Read + Write + AsFd,
    T: Session,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamEngine")
            .field("endpoint", &self.endpoint)
            .field("fd", &self.fd)
            .field("plugged", &self.plugged)
            .field("handshaking", &self.handshaking)
            .field("established", &self.is_established())
            .field("input_error", &self.input_error)
            .field("buffered_in", &self.in_len)
            .field("buffered_out", &(self.outbuf.len() - self.out_pos))
            .finish()
    }
}
