//! Readiness polling and engine ownership.
//!
//! ```text
//!            ┌──────────────────────────────┐
//!            │            Driver            │
//!            │  ┌────────────┐  ┌────────┐  │
//!   poll(2) ─┼─▶│ PollReactor│  │ engines│  │
//!            │  │ (interest) │  │ (slots)│  │
//!            │  └────────────┘  └────────┘  │
//!            └──────────────────────────────┘
//! ```
//!
//! Engines never hold the reactor. Every callback receives it as
//! `&mut dyn Poller`, and the [`Driver`] drops an engine as soon as a callback
//! reports [`EngineStatus::Terminated`].

use std::io::{Read, Write};
use std::os::fd::{AsFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, trace};

use crate::engine::{EngineStatus, StreamEngine};
use crate::error::Result;
use crate::session::Session;

/// Registration token returned by [`Poller::add_fd`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(usize);

/// Readiness interest registry.
pub trait Poller {
    /// Register a descriptor with no interest set.
    fn add_fd(&mut self, fd: RawFd) -> Handle;
    /// Forget a registration.
    fn rm_fd(&mut self, handle: Handle);
    /// Start reporting readability.
    fn set_pollin(&mut self, handle: Handle);
    /// Stop reporting readability.
    fn reset_pollin(&mut self, handle: Handle);
    /// Start reporting writability.
    fn set_pollout(&mut self, handle: Handle);
    /// Stop reporting writability.
    fn reset_pollout(&mut self, handle: Handle);
}

/// Interest recorded for one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    /// Registered descriptor.
    pub fd: RawFd,
    /// Readability wanted.
    pub pollin: bool,
    /// Writability wanted.
    pub pollout: bool,
}

/// Slot-based interest table consulted by [`Driver`] before each `poll(2)`.
#[derive(Debug, Default)]
pub struct PollReactor {
    slots: Vec<Option<Interest>>,
    free: Vec<usize>,
}

impl PollReactor {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current interest for `handle`, if registered.
    pub fn interest(&self, handle: Handle) -> Option<Interest> {
        self.slots.get(handle.0).copied().flatten()
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&mut self, handle: Handle) -> &mut Interest {
        match self.slots.get_mut(handle.0) {
            Some(Some(interest)) => interest,
            _ => panic!("poller handle {:?} is not registered", handle),
        }
    }
}

impl Poller for PollReactor {
    fn add_fd(&mut self, fd: RawFd) -> Handle {
        let interest = Interest {
            fd,
            pollin: false,
            pollout: false,
        };
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(interest);
                Handle(index)
            }
            None => {
                self.slots.push(Some(interest));
                Handle(self.slots.len() - 1)
            }
        }
    }

    fn rm_fd(&mut self, handle: Handle) {
        assert!(
            self.slots.get_mut(handle.0).and_then(Option::take).is_some(),
            "poller handle {:?} removed twice",
            handle
        );
        self.free.push(handle.0);
    }

    fn set_pollin(&mut self, handle: Handle) {
        self.slot(handle).pollin = true;
    }

    fn reset_pollin(&mut self, handle: Handle) {
        self.slot(handle).pollin = false;
    }

    fn set_pollout(&mut self, handle: Handle) {
        self.slot(handle).pollout = true;
    }

    fn reset_pollout(&mut self, handle: Handle) {
        self.slot(handle).pollout = false;
    }
}

/// Identifies an engine owned by a [`Driver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineId(usize);

/// Single-threaded event loop that owns engines and retires them.
pub struct Driver<S, T>
where
    S: Read + Write + AsFd,
    T: Session,
{
    reactor: PollReactor,
    engines: Vec<Option<StreamEngine<S, T>>>,
}

impl<S, T> Default for Driver<S, T>
where
    S: Read + Write + AsFd,
    T: Session,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<S, T> Driver<S, T>
where
    S: Read + Write + AsFd,
    T: Session,
{
    /// Create a driver with no engines.
    pub fn new() -> Self {
        Self {
            reactor: PollReactor::new(),
            engines: Vec::new(),
        }
    }

    /// Plug `engine` into this driver's reactor and take ownership of it.
    ///
    /// Returns `None` if the engine terminated during its speculative first
    /// read.
    pub fn attach(&mut self, mut engine: StreamEngine<S, T>) -> Option<EngineId> {
        if engine.plug(&mut self.reactor) == EngineStatus::Terminated {
            return None;
        }
        let index = match self.engines.iter().position(Option::is_none) {
            Some(index) => {
                self.engines[index] = Some(engine);
                index
            }
            None => {
                self.engines.push(Some(engine));
                self.engines.len() - 1
            }
        };
        debug!(engine = index, "engine attached");
        Some(EngineId(index))
    }

    /// Engine by id, if still alive.
    pub fn get(&self, id: EngineId) -> Option<&StreamEngine<S, T>> {
        self.engines.get(id.0).and_then(Option::as_ref)
    }

    /// Whether the engine is still alive.
    pub fn contains(&self, id: EngineId) -> bool {
        self.get(id).is_some()
    }

    /// Number of live engines.
    pub fn len(&self) -> usize {
        self.engines.iter().filter(|slot| slot.is_some()).count()
    }

    /// Whether no engine is alive.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The interest table.
    pub fn reactor(&self) -> &PollReactor {
        &self.reactor
    }

    /// Re-enable reading on an engine that stopped because of backpressure.
    pub fn activate_in(&mut self, id: EngineId) {
        self.dispatch(id, |engine, poller| engine.activate_in(poller));
    }

    /// Re-enable writing on an engine after new output was queued.
    pub fn activate_out(&mut self, id: EngineId) {
        self.dispatch(id, |engine, poller| engine.activate_out(poller));
    }

    /// Unplug and drop one engine.
    pub fn terminate(&mut self, id: EngineId) {
        self.dispatch(id, |engine, poller| engine.terminate(poller));
    }

    /// Unplug and drop every engine.
    pub fn shutdown(&mut self) {
        for index in 0..self.engines.len() {
            self.terminate(EngineId(index));
        }
    }

    /// Wait up to `timeout` for readiness, dispatch events, then let each
    /// engine resume work its session has unblocked.
    ///
    /// Returns the number of engines that had events.
    pub fn turn(&mut self, timeout: Duration) -> Result<usize> {
        let ready = self.wait(timeout)?;
        let count = ready.len();

        for (index, revents) in ready {
            let id = EngineId(index);
            let readable = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
            if revents.intersects(readable) && self.wants(id, |i| i.pollin) {
                self.dispatch(id, |engine, poller| engine.in_event(poller));
            }
            let writable = PollFlags::POLLOUT | PollFlags::POLLERR;
            if revents.intersects(writable) && self.wants(id, |i| i.pollout) {
                self.dispatch(id, |engine, poller| engine.out_event(poller));
            }
        }

        for index in 0..self.engines.len() {
            self.dispatch(EngineId(index), |engine, poller| engine.poll_session(poller));
        }
        Ok(count)
    }

    fn wait(&mut self, timeout: Duration) -> Result<Vec<(usize, PollFlags)>> {
        let mut indices = Vec::new();
        let mut fds = Vec::new();
        for (index, engine) in self.engines.iter().enumerate() {
            let Some(engine) = engine else { continue };
            let Some(interest) = engine.handle().and_then(|h| self.reactor.interest(h)) else {
                continue;
            };
            let mut events = PollFlags::empty();
            if interest.pollin {
                events |= PollFlags::POLLIN;
            }
            if interest.pollout {
                events |= PollFlags::POLLOUT;
            }
            if events.is_empty() {
                continue;
            }
            indices.push(index);
            fds.push(PollFd::new(engine.as_fd(), events));
        }

        let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        if fds.is_empty() {
            std::thread::sleep(Duration::from_millis(millis.into()));
            return Ok(Vec::new());
        }
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(Vec::new()),
            Err(errno) => return Err(std::io::Error::from(errno).into()),
        }

        let ready: Vec<(usize, PollFlags)> = indices
            .into_iter()
            .zip(fds.iter())
            .filter_map(|(index, fd)| {
                fd.revents()
                    .filter(|revents| !revents.is_empty())
                    .map(|revents| (index, revents))
            })
            .collect();
        trace!(polled = fds.len(), ready = ready.len(), "poll returned");
        Ok(ready)
    }

    fn wants(&self, id: EngineId, pred: impl Fn(&Interest) -> bool) -> bool {
        self.get(id)
            .and_then(|engine| engine.handle())
            .and_then(|handle| self.reactor.interest(handle))
            .is_some_and(|interest| pred(&interest))
    }

    fn dispatch<F>(&mut self, id: EngineId, f: F)
    where
        F: FnOnce(&mut StreamEngine<S, T>, &mut dyn Poller) -> EngineStatus,
    {
        let Some(slot) = self.engines.get_mut(id.0) else { return };
        let Some(engine) = slot.as_mut() else { return };
        let poller: &mut dyn Poller = &mut self.reactor;
        if f(engine, poller) == EngineStatus::Terminated {
            debug!(engine = id.0, "engine retired");
            *slot = None;
        }
    }
}

impl<S, T> Drop for Driver<S, T>
where
    S: Read + Write + AsFd,
    T: Session,
{
    fn drop(&mut self) {
        self.shutdown();
    }
}
