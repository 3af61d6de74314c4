//! Socket readiness.
//!
//! Sockets stay `std::net` types owned by their connection; they are
//! registered with a [`mio::Poll`] by raw descriptor. Registration is
//! edge-triggered, so a reader that stops before `WouldBlock` must remember
//! the connection itself (see [`ReadPoller::backlog`]).

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};
use std::collections::HashSet;
use std::io;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use crate::connection::ConnectionId;

/// Token reserved for a poll's [`mio::Waker`].
pub(crate) const WAKE: Token = Token(usize::MAX);

pub(crate) fn register(
    registry: &Registry,
    socket: &impl AsRawFd,
    token: Token,
    interest: Interest,
) -> io::Result<()> {
    registry.register(&mut SourceFd(&socket.as_raw_fd()), token, interest)
}

pub(crate) fn deregister(registry: &Registry, socket: &impl AsRawFd) -> io::Result<()> {
    registry.deregister(&mut SourceFd(&socket.as_raw_fd()))
}

/// Readiness state of the ready table, owned by whichever packet processor
/// holds the poll lock.
pub(crate) struct ReadPoller {
    poll: Poll,
    events: Events,
    /// Connections with input left over from the read budget or the
    /// handshake. Polls do not block while this is non-empty.
    pub backlog: HashSet<ConnectionId>,
    /// Connections not read at the in-flight watermark; retried every pass.
    pub paused: HashSet<ConnectionId>,
}

impl ReadPoller {
    pub fn new(poll: Poll, capacity: usize) -> Self {
        ReadPoller {
            poll,
            events: Events::with_capacity(capacity.max(16)),
            backlog: HashSet::new(),
            paused: HashSet::new(),
        }
    }

    /// Block up to `timeout` for readiness and return the tokens that fired.
    /// Wake-ups are consumed and never returned.
    pub fn wait(&mut self, timeout: Duration) -> io::Result<Vec<Token>> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }
        Ok(self
            .events
            .iter()
            .map(|event| event.token())
            .filter(|&token| token != WAKE)
            .collect())
    }
}
