//! Established connections and their identities.
//!
//! A [`Connection`] is created by the connection handler once the CFP
//! handshake completes and lives in the shared ready table until it breaks.
//! Reading is done by whichever packet processor holds the poll lock, for
//! connections its poll reports readable; writing is buffered in `outbound`
//! and flushed by the handler thread, which queueing wakes.

use bytes::{Buf, BytesMut};
use mio::{Token, Waker};
use parking_lot::Mutex;
use quanta::Instant;
use rivulet_transport::cfp::CfpRole;
use rivulet_transport::framing::FrameReader;
use rivulet_transport::stats::bump;
use rivulet_transport::wire::StreamKey;
use std::collections::HashSet;
use std::fmt;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

use crate::context::Shared;
use crate::event::{BreakReason, Event};
use crate::lifecycle;
use crate::poller;

// ─── Identity ────────────────────────────────────────────────────────────────

/// 64-bit connection id: host seed in the high half, counter in the low half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Allocates connection ids for locally initiated connections.
pub(crate) struct IdGenerator {
    seed: u64,
    counter: AtomicU32,
}

impl IdGenerator {
    pub fn new(host_seed: u32) -> Self {
        IdGenerator {
            seed: (host_seed as u64) << 32,
            counter: AtomicU32::new(1),
        }
    }

    /// Next id not rejected by `taken`. Gives up after one full counter cycle.
    pub fn next(&self, taken: impl Fn(ConnectionId) -> bool) -> Option<ConnectionId> {
        for _ in 0..u32::MAX {
            let n = self.counter.fetch_add(1, Ordering::Relaxed);
            if n == 0 {
                continue;
            }
            let id = ConnectionId(self.seed | n as u64);
            if !taken(id) {
                return Some(id);
            }
        }
        None
    }
}

// ─── TLS Step ────────────────────────────────────────────────────────────────

/// Opaque pre-handshake step (typically TLS) driven by the connection
/// handler on the non-blocking socket before the first CFP leg.
pub trait TlsStep: Send {
    /// Make progress. `Ok(true)` once complete; `WouldBlock` is not an error
    /// and should be reported as `Ok(false)`.
    fn poll(&mut self, socket: &mut TcpStream) -> io::Result<bool>;
}

/// Creates a [`TlsStep`] for each new connection.
pub type TlsFactory = Arc<dyn Fn(CfpRole) -> Box<dyn TlsStep> + Send + Sync>;

// ─── Connection ──────────────────────────────────────────────────────────────

pub(crate) struct Connection {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub local: SocketAddr,
    socket: TcpStream,
    /// Key in the shared token slab and the processors' poll.
    pub token: Token,
    pub reader: Mutex<FrameReader>,
    outbound: Mutex<BytesMut>,
    flush_waker: Arc<Waker>,
    /// Streams carried by this connection (lookup only).
    pub streams: Mutex<HashSet<StreamKey>>,
    last_rx: Mutex<Instant>,
    last_tx: Mutex<Instant>,
    /// Packets handed to the pipeline and not yet processed.
    pub in_flight: AtomicUsize,
    closed: AtomicBool,
    pub heartbeat_timeout: Duration,
    pub sends_heartbeats: bool,
    pub expects_heartbeats: bool,
}

pub(crate) struct ConnectionParts {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub local: SocketAddr,
    pub socket: TcpStream,
    pub token: Token,
    pub reader: FrameReader,
    pub outbound: BytesMut,
    pub flush_waker: Arc<Waker>,
    pub heartbeat_timeout: Duration,
    pub sends_heartbeats: bool,
    pub expects_heartbeats: bool,
}

impl Connection {
    pub fn new(parts: ConnectionParts) -> Self {
        let now = Instant::now();
        Connection {
            id: parts.id,
            peer: parts.peer,
            local: parts.local,
            socket: parts.socket,
            token: parts.token,
            reader: Mutex::new(parts.reader),
            outbound: Mutex::new(parts.outbound),
            flush_waker: parts.flush_waker,
            streams: Mutex::new(HashSet::new()),
            last_rx: Mutex::new(now),
            last_tx: Mutex::new(now),
            in_flight: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            heartbeat_timeout: parts.heartbeat_timeout,
            sends_heartbeats: parts.sends_heartbeats,
            expects_heartbeats: parts.expects_heartbeats,
        }
    }

    pub fn socket(&self) -> &TcpStream {
        &self.socket
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark closed and shut the socket down. Returns true only for the call
    /// that actually closed it.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.socket.shutdown(Shutdown::Both);
        true
    }

    /// Append an encoded frame to the outbound buffer, waking the handler
    /// when the buffer was empty.
    pub fn queue_frame(&self, frame: &[u8]) {
        if self.is_closed() {
            return;
        }
        let was_empty = {
            let mut out = self.outbound.lock();
            let was_empty = out.is_empty();
            out.extend_from_slice(frame);
            was_empty
        };
        *self.last_tx.lock() = Instant::now();
        if was_empty {
            if let Err(e) = self.flush_waker.wake() {
                trace!(conn = %self.id, error = %e, "flush wake failed");
            }
        }
    }

    pub fn pending_out(&self) -> usize {
        self.outbound.lock().len()
    }

    /// Write as much buffered output as the socket accepts.
    pub fn flush(&self) -> io::Result<()> {
        let mut out = self.outbound.lock();
        let mut sock = &self.socket;
        while !out.is_empty() {
            match sock.write(&out) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => out.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn touch_rx(&self, now: Instant) {
        *self.last_rx.lock() = now;
    }

    pub fn idle_rx(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_rx.lock())
    }

    pub fn idle_tx(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_tx.lock())
    }

    pub fn stream_keys(&self) -> Vec<StreamKey> {
        let mut keys: Vec<_> = self.streams.lock().iter().copied().collect();
        keys.sort();
        keys
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Take a connection out of service: remove it from the ready table, close
/// the socket, report it, and tear down every stream it carried.
///
/// Safe to call from any thread and any number of times; only the first
/// call has an effect. Must not be called with a stream lock held.
pub(crate) fn break_connection(shared: &Shared, conn: &Arc<Connection>, reason: &str) {
    shared.ready.write().remove(&conn.id);
    if !conn.close() {
        return;
    }
    if let Err(e) = poller::deregister(&shared.registry, conn.socket()) {
        trace!(conn = %conn.id, error = %e, "deregister failed");
    }
    shared.tokens.lock().try_remove(conn.token.0);
    bump(&shared.counters.connections_broken, 1);
    info!(conn = %conn.id, peer = %conn.peer, reason, "connection broke");
    shared.events.broadcast(Event::ConnectionBroke {
        conn: conn.id,
        peer: conn.peer,
        reason: reason.to_string(),
    });

    let keys = conn.stream_keys();
    for key in keys {
        debug!(conn = %conn.id, stream = %key, "tearing down stream of broken connection");
        lifecycle::teardown(shared, key, Some(BreakReason::ConnectionLost));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::WAKE;
    use mio::{Events, Poll};
    use std::net::TcpListener;

    #[test]
    fn ids_carry_host_seed() {
        let gen = IdGenerator::new(0xABCD);
        let a = gen.next(|_| false).unwrap();
        let b = gen.next(|_| false).unwrap();
        assert_eq!(a.0 >> 32, 0xABCD);
        assert_ne!(a, b);
        assert_eq!(format!("{a}"), "0000abcd00000001");
    }

    #[test]
    fn ids_skip_collisions() {
        let gen = IdGenerator::new(1);
        let taken = ConnectionId((1 << 32) | 1);
        let id = gen.next(|c| c == taken).unwrap();
        assert_eq!(id, ConnectionId((1 << 32) | 2));
    }

    fn pair() -> (Connection, TcpStream, Poll) {
        let poll = Poll::new().unwrap();
        let flush_waker = Arc::new(Waker::new(poll.registry(), WAKE).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let local = server.local_addr().unwrap();
        let conn = Connection::new(ConnectionParts {
            id: ConnectionId(7),
            peer,
            local,
            socket: server,
            token: Token(0),
            reader: FrameReader::new(1024),
            outbound: BytesMut::new(),
            flush_waker,
            heartbeat_timeout: Duration::from_secs(1),
            sends_heartbeats: true,
            expects_heartbeats: false,
        });
        (conn, client, poll)
    }

    #[test]
    fn queued_frames_flush_to_peer() {
        use std::io::Read;
        let (conn, mut client, _poll) = pair();
        conn.queue_frame(b"hello");
        conn.queue_frame(b" world");
        conn.flush().unwrap();
        assert_eq!(conn.pending_out(), 0);
        let mut buf = [0u8; 11];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn close_happens_once() {
        let (conn, _client, _poll) = pair();
        assert!(conn.close());
        assert!(!conn.close());
        conn.queue_frame(b"dropped");
        assert_eq!(conn.pending_out(), 0);
    }

    #[test]
    fn first_queued_frame_wakes_flusher() {
        let (conn, _client, mut poll) = pair();
        let mut events = Events::with_capacity(4);
        conn.queue_frame(b"one");
        poll.poll(&mut events, Some(Duration::from_secs(2))).unwrap();
        assert!(events.iter().any(|e| e.token() == WAKE));
    }
}
