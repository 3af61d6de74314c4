//! Asynchronous event reporting.
//!
//! Producers on any thread push [`EventRecord`]s into a bounded channel; the
//! event announcer thread delivers them to queue callbacks in order. Records
//! addressed to one queue go only to it; the rest are broadcast.

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use rivulet_transport::pool::WatermarkAlert;
use rivulet_transport::wire::StreamKey;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::connection::ConnectionId;
use crate::context::Shared;
use crate::queue::Queue;

/// Why a stream was torn down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakReason {
    /// The owning connection failed or closed.
    ConnectionLost,
    /// The connection's stream report no longer lists the stream.
    NotReported,
    /// No packets within the inactivity timeout.
    Inactive,
    /// NAK retries exhausted with the kill policy in force.
    Unrecoverable { seq: u64 },
    /// Malformed payload or option data.
    Framing(String),
}

impl fmt::Display for BreakReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakReason::ConnectionLost => f.write_str("connection lost"),
            BreakReason::NotReported => f.write_str("not reported by source"),
            BreakReason::Inactive => f.write_str("inactive"),
            BreakReason::Unrecoverable { seq } => write!(f, "unrecoverable loss at {seq}"),
            BreakReason::Framing(e) => write!(f, "framing error: {e}"),
        }
    }
}

/// Why a stream was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The queue's `accept_stream` callback declined it.
    Vetoed,
    /// The stream limit is reached.
    Capacity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ConnectionEstablished {
        conn: ConnectionId,
        peer: SocketAddr,
    },
    EstablishFailed {
        peer: SocketAddr,
        reason: String,
    },
    ConnectionBroke {
        conn: ConnectionId,
        peer: SocketAddr,
        reason: String,
    },
    NewStream {
        stream: StreamKey,
        topic: Option<String>,
        conn: ConnectionId,
    },
    /// A stream formation matched no queue; its parameters are cached.
    StreamNotFound {
        stream: StreamKey,
        topic: Option<String>,
    },
    StreamRejected {
        stream: StreamKey,
        reason: RejectReason,
    },
    /// The requested start is no longer available from the source; delivery
    /// begins at `available`.
    LateJoinFailed {
        stream: StreamKey,
        requested: u64,
        available: u64,
    },
    /// `count` consecutive sequence numbers from `seq` will never be delivered.
    PacketLoss {
        stream: StreamKey,
        seq: u64,
        count: u64,
    },
    StreamBroke {
        stream: StreamKey,
        reason: BreakReason,
    },
    StreamClosed {
        stream: StreamKey,
    },
    PoolWatermark(WatermarkAlert),
}

/// An event plus its target queue (`None` broadcasts to every queue).
pub(crate) struct EventRecord {
    pub target: Option<Arc<Queue>>,
    pub event: Event,
}

/// Producer side of the event channel.
#[derive(Clone)]
pub(crate) struct EventSender {
    tx: Sender<EventRecord>,
    timeout: Duration,
}

impl EventSender {
    pub fn new(tx: Sender<EventRecord>, timeout: Duration) -> Self {
        EventSender { tx, timeout }
    }

    /// Queue an event for one queue.
    pub fn to_queue(&self, queue: &Arc<Queue>, event: Event) {
        self.push(EventRecord {
            target: Some(Arc::clone(queue)),
            event,
        });
    }

    /// Queue an event for every queue.
    pub fn broadcast(&self, event: Event) {
        self.push(EventRecord {
            target: None,
            event,
        });
    }

    fn push(&self, record: EventRecord) {
        match self.tx.send_timeout(record, self.timeout) {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(r)) => {
                warn!(event = ?r.event, "event queue full, dropping event");
            }
            Err(SendTimeoutError::Disconnected(r)) => {
                debug!(event = ?r.event, "event announcer gone, dropping event");
            }
        }
    }
}

/// Event announcer thread body. Runs until shutdown, then drains what is
/// already queued. Producers still running at shutdown do not extend the
/// drain.
pub(crate) fn run_event_announcer(shared: Arc<Shared>, rx: Receiver<EventRecord>) {
    while !shared.is_shutdown() {
        match rx.recv_timeout(Duration::from_millis(50)) {
            Ok(record) => dispatch(&shared, record),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
    for _ in 0..rx.len() {
        match rx.try_recv() {
            Ok(record) => dispatch(&shared, record),
            Err(_) => break,
        }
    }
}

fn dispatch(shared: &Shared, record: EventRecord) {
    match record.target {
        Some(queue) => queue.callbacks.on_event(&record.event),
        None => {
            // Snapshot first so callbacks run without the table lock.
            let queues = shared.queues.read().all();
            for queue in queues {
                queue.callbacks.on_event(&record.event);
            }
        }
    }
}
