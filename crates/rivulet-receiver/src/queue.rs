//! Queues: the application-facing side of stream matching and delivery.
//!
//! A queue matches streams either by static topic name or with a predicate,
//! and receives their data in one [`DeliveryMode`]. Queues live in a slab;
//! handles carry a generation so a stale handle never reaches a newer queue
//! that reused the slot.

use bytes::Bytes;
use parking_lot::Mutex;
use rivulet_transport::wire::{Reliability, StreamKey};
use slab::Slab;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::connection::ConnectionId;
use crate::error::{ReceiverError, Result};
use crate::event::Event;

// ─── Delivery Types ──────────────────────────────────────────────────────────

/// What a matching predicate and `accept_stream` get to see about a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub stream: StreamKey,
    pub topic: Option<String>,
    pub reliability: Reliability,
    pub conn: ConnectionId,
    pub peer: SocketAddr,
}

/// One logical application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub stream: StreamKey,
    /// Sequence number of the packet that carried the message (the first
    /// fragment for reassembled messages).
    pub seq: u64,
    /// Source-assigned message number, when the stream advertises numbering.
    pub msg_num: Option<u64>,
    pub data: Bytes,
}

/// One data packet's payload, delivered as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredPacket {
    pub stream: StreamKey,
    pub seq: u64,
    pub retransmit: bool,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryMode {
    /// `on_message` per logical message, fragments reassembled.
    Message,
    /// `on_packet` per data packet.
    Packet,
    /// `on_data` per message or fragment piece, in order, no reassembly.
    Data,
}

/// Application callbacks. All methods have no-op defaults; implement the one
/// matching the queue's delivery mode plus `on_event` as needed.
///
/// Callbacks for one stream are never invoked concurrently. They run on
/// announcer threads and should not block for long.
pub trait QueueCallbacks: Send + Sync {
    fn on_message(&self, _msg: &Message) {}

    fn on_packet(&self, _pkt: &DeliveredPacket) {}

    fn on_data(&self, _stream: StreamKey, _seq: u64, _data: &[u8]) {}

    fn on_event(&self, _event: &Event) {}

    /// Final say on a stream that matched this queue. Declined stream ids
    /// are remembered and dropped silently from then on.
    fn accept_stream(&self, _info: &StreamInfo) -> bool {
        true
    }
}

pub type Predicate = Arc<dyn Fn(&StreamInfo) -> bool + Send + Sync>;

#[derive(Clone)]
pub enum MatchRule {
    /// Streams whose formation carries exactly this topic.
    Name(String),
    /// Streams for which the predicate returns true.
    Predicate(Predicate),
}

impl MatchRule {
    pub fn name(topic: impl Into<String>) -> Self {
        MatchRule::Name(topic.into())
    }

    pub fn predicate(f: impl Fn(&StreamInfo) -> bool + Send + Sync + 'static) -> Self {
        MatchRule::Predicate(Arc::new(f))
    }
}

impl fmt::Debug for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchRule::Name(n) => f.debug_tuple("Name").field(n).finish(),
            MatchRule::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

// ─── Queue ───────────────────────────────────────────────────────────────────

/// Opaque handle returned by `create_queue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueHandle {
    index: usize,
    generation: u64,
}

pub(crate) struct Queue {
    pub handle: QueueHandle,
    pub rule: MatchRule,
    pub mode: DeliveryMode,
    pub callbacks: Arc<dyn QueueCallbacks>,
    /// Streams attached to this queue (lookup only).
    pub streams: Mutex<HashSet<StreamKey>>,
    closed: AtomicBool,
}

impl Queue {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("handle", &self.handle)
            .field("rule", &self.rule)
            .field("mode", &self.mode)
            .finish()
    }
}

// ─── Queue Table ─────────────────────────────────────────────────────────────

pub(crate) struct QueueTable {
    slots: Slab<Arc<Queue>>,
    by_name: HashMap<String, QueueHandle>,
    next_generation: u64,
    max: usize,
}

impl QueueTable {
    pub fn new(max: usize) -> Self {
        QueueTable {
            slots: Slab::new(),
            by_name: HashMap::new(),
            next_generation: 1,
            max,
        }
    }

    pub fn insert(
        &mut self,
        rule: MatchRule,
        mode: DeliveryMode,
        callbacks: Arc<dyn QueueCallbacks>,
    ) -> Result<QueueHandle> {
        if let MatchRule::Name(name) = &rule {
            if name.is_empty() {
                return Err(ReceiverError::InvalidParameter("empty topic name".into()));
            }
            if name.len() > rivulet_transport::wire::MAX_OPTION_BODY {
                return Err(ReceiverError::InvalidParameter(format!(
                    "topic name longer than {} bytes",
                    rivulet_transport::wire::MAX_OPTION_BODY
                )));
            }
            if self.by_name.contains_key(name) {
                return Err(ReceiverError::DuplicateName(name.clone()));
            }
        }
        if self.slots.len() >= self.max {
            return Err(ReceiverError::CapacityExceeded {
                what: "queue",
                limit: self.max,
            });
        }

        let entry = self.slots.vacant_entry();
        let handle = QueueHandle {
            index: entry.key(),
            generation: self.next_generation,
        };
        self.next_generation += 1;
        if let MatchRule::Name(name) = &rule {
            self.by_name.insert(name.clone(), handle);
        }
        entry.insert(Arc::new(Queue {
            handle,
            rule,
            mode,
            callbacks,
            streams: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        }));
        Ok(handle)
    }

    pub fn get(&self, handle: QueueHandle) -> Option<Arc<Queue>> {
        self.slots
            .get(handle.index)
            .filter(|q| q.handle == handle)
            .cloned()
    }

    /// Remove a queue and mark it closed.
    pub fn remove(&mut self, handle: QueueHandle) -> Result<Arc<Queue>> {
        if self.get(handle).is_none() {
            return Err(ReceiverError::InvalidHandle);
        }
        let queue = self.slots.remove(handle.index);
        queue.closed.store(true, Ordering::Release);
        if let MatchRule::Name(name) = &queue.rule {
            self.by_name.remove(name);
        }
        Ok(queue)
    }

    /// Queue for a stream: exact topic match first, then predicates in
    /// creation order.
    pub fn match_stream(&self, info: &StreamInfo) -> Option<Arc<Queue>> {
        if let Some(topic) = &info.topic {
            if let Some(q) = self.by_name.get(topic).and_then(|h| self.get(*h)) {
                return Some(q);
            }
        }
        let mut preds: Vec<&Arc<Queue>> = self
            .slots
            .iter()
            .map(|(_, q)| q)
            .filter(|q| matches!(q.rule, MatchRule::Predicate(_)))
            .collect();
        preds.sort_by_key(|q| q.handle.generation);
        preds
            .into_iter()
            .find(|q| match &q.rule {
                MatchRule::Predicate(f) => f(info),
                MatchRule::Name(_) => false,
            })
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<Queue>> {
        self.slots.iter().map(|(_, q)| Arc::clone(q)).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Remove everything; used at shutdown.
    pub fn drain(&mut self) -> Vec<Arc<Queue>> {
        self.by_name.clear();
        self.slots
            .drain()
            .inspect(|q| q.closed.store(true, Ordering::Release))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    struct Nop;
    impl QueueCallbacks for Nop {}

    fn info(topic: Option<&str>, port: u16) -> StreamInfo {
        StreamInfo {
            stream: StreamKey::new(1, port),
            topic: topic.map(str::to_string),
            reliability: Reliability::Reliable,
            conn: ConnectionId(1),
            peer: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9),
        }
    }

    #[test]
    fn name_match_preferred_over_predicate() {
        let mut t = QueueTable::new(8);
        let p = t
            .insert(MatchRule::predicate(|_| true), DeliveryMode::Packet, Arc::new(Nop))
            .unwrap();
        let n = t
            .insert(MatchRule::name("quotes"), DeliveryMode::Message, Arc::new(Nop))
            .unwrap();
        assert_eq!(t.match_stream(&info(Some("quotes"), 1)).unwrap().handle, n);
        assert_eq!(t.match_stream(&info(Some("other"), 1)).unwrap().handle, p);
        assert_eq!(t.match_stream(&info(None, 1)).unwrap().handle, p);
    }

    #[test]
    fn predicates_checked_in_creation_order() {
        let mut t = QueueTable::new(8);
        let even = t
            .insert(
                MatchRule::predicate(|i| i.stream.port() % 2 == 0),
                DeliveryMode::Data,
                Arc::new(Nop),
            )
            .unwrap();
        let any = t
            .insert(MatchRule::predicate(|_| true), DeliveryMode::Data, Arc::new(Nop))
            .unwrap();
        assert_eq!(t.match_stream(&info(None, 4)).unwrap().handle, even);
        assert_eq!(t.match_stream(&info(None, 5)).unwrap().handle, any);
    }

    #[test]
    fn duplicate_name_rejected() {
        let mut t = QueueTable::new(8);
        t.insert(MatchRule::name("a"), DeliveryMode::Message, Arc::new(Nop))
            .unwrap();
        assert!(matches!(
            t.insert(MatchRule::name("a"), DeliveryMode::Message, Arc::new(Nop)),
            Err(ReceiverError::DuplicateName(n)) if n == "a"
        ));
    }

    #[test]
    fn empty_name_rejected() {
        let mut t = QueueTable::new(8);
        assert!(matches!(
            t.insert(MatchRule::name(""), DeliveryMode::Message, Arc::new(Nop)),
            Err(ReceiverError::InvalidParameter(_))
        ));
    }

    #[test]
    fn capacity_enforced() {
        let mut t = QueueTable::new(1);
        t.insert(MatchRule::name("a"), DeliveryMode::Message, Arc::new(Nop))
            .unwrap();
        assert!(matches!(
            t.insert(MatchRule::name("b"), DeliveryMode::Message, Arc::new(Nop)),
            Err(ReceiverError::CapacityExceeded { what: "queue", limit: 1 })
        ));
    }

    #[test]
    fn stale_handle_after_slot_reuse() {
        let mut t = QueueTable::new(4);
        let h1 = t
            .insert(MatchRule::name("a"), DeliveryMode::Message, Arc::new(Nop))
            .unwrap();
        let q = t.remove(h1).unwrap();
        assert!(q.is_closed());
        let h2 = t
            .insert(MatchRule::name("a"), DeliveryMode::Message, Arc::new(Nop))
            .unwrap();
        assert_ne!(h1, h2);
        assert!(t.get(h1).is_none());
        assert!(matches!(t.remove(h1), Err(ReceiverError::InvalidHandle)));
        assert!(t.get(h2).is_some());
    }
}
