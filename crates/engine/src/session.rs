//! The session side of an engine: where decoded messages go and where
//! outbound messages come from.
//!
//! [`ChannelSession`] bridges the reactor thread and the application with
//! tokio channels. The inbound channel is bounded; when it is full the session
//! refuses messages and the engine stops reading until the application
//! catches up.

use std::os::fd::RawFd;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace};
use zmtp_wire::{Msg, MsgSink, MsgSource, PushError};

/// Connection lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// Greeting and security handshake finished.
    HandshakeSucceeded {
        /// Peer endpoint.
        endpoint: String,
    },
    /// The peer violated the protocol before the handshake finished.
    HandshakeFailed {
        /// Peer endpoint.
        endpoint: String,
        /// Protocol error description.
        reason: String,
    },
    /// The connection was torn down.
    Disconnected {
        /// Peer endpoint.
        endpoint: String,
        /// Descriptor the connection used.
        fd: RawFd,
    },
}

/// Consumer and producer of one connection's messages.
///
/// The engine sends the local identity itself, so the first message pulled
/// is application data. The first message pushed is the peer's identity.
pub trait Session: MsgSink + MsgSource {
    /// Make pushed messages visible to the application.
    fn flush(&mut self);

    /// The engine is gone; no more messages will be pushed or pulled.
    fn detach(&mut self);

    /// Report a lifecycle event.
    fn monitor_event(&mut self, event: MonitorEvent);

    /// Whether a previously refused push would now succeed.
    fn input_ready(&self) -> bool {
        true
    }

    /// Whether messages are queued for sending.
    fn output_pending(&self) -> bool {
        false
    }
}

/// Application side of a [`ChannelSession`].
#[derive(Debug)]
pub struct SessionHandle {
    /// Messages received from the peer, starting with its identity.
    pub inbound: mpsc::Receiver<Msg>,
    /// Messages to send to the peer.
    pub outbound: mpsc::UnboundedSender<Msg>,
    /// Lifecycle events.
    pub events: mpsc::UnboundedReceiver<MonitorEvent>,
}

/// Channel-backed session.
#[derive(Debug)]
pub struct ChannelSession {
    inbound: mpsc::Sender<Msg>,
    outbound: mpsc::UnboundedReceiver<Msg>,
    events: mpsc::UnboundedSender<MonitorEvent>,
    detached: bool,
}

impl ChannelSession {
    /// Create a session that buffers at most `capacity` inbound messages.
    pub fn new(capacity: usize) -> (Self, SessionHandle) {
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity.max(1));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Self {
            inbound: inbound_tx,
            outbound: outbound_rx,
            events: events_tx,
            detached: false,
        };
        let handle = SessionHandle {
            inbound: inbound_rx,
            outbound: outbound_tx,
            events: events_rx,
        };
        (session, handle)
    }

    /// Whether the engine has detached.
    pub fn is_detached(&self) -> bool {
        self.detached
    }
}

impl MsgSink for ChannelSession {
    fn push_msg(&mut self, msg: Msg) -> Result<(), PushError> {
        match self.inbound.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(msg)) => Err(PushError::WouldBlock(msg)),
            Err(TrySendError::Closed(_)) => {
                trace!("inbound receiver dropped, discarding message");
                Ok(())
            }
        }
    }
}

impl MsgSource for ChannelSession {
    fn pull_msg(&mut self) -> Option<Msg> {
        self.outbound.try_recv().ok()
    }
}

impl Session for ChannelSession {
    fn flush(&mut self) {
        // Channel sends wake the receiver immediately.
    }

    fn detach(&mut self) {
        debug!("session detached");
        self.detached = true;
    }

    fn monitor_event(&mut self, event: MonitorEvent) {
        trace!(?event, "monitor event");
        let _ = self.events.send(event);
    }

    fn input_ready(&self) -> bool {
        self.inbound.capacity() > 0 || self.inbound.is_closed()
    }

    fn output_pending(&self) -> bool {
        !self.outbound.is_empty()
    }
}
