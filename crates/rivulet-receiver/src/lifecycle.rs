//! Stream admission and teardown.
//!
//! Unknown streams are admitted from a formation (an SPM carrying a topic)
//! or from formation parameters cached when no queue matched. Admission
//! runs the queue match and the application's `accept_stream` veto without
//! any table lock held, then registers the stream under the stream table's
//! upgradable lock. Teardown removes the stream under the write lock and
//! reclaims its buffers before the lock is released.

use parking_lot::RwLockUpgradableReadGuard;
use rivulet_transport::stats::bump;
use rivulet_transport::wire::{unwrap_seq, ControlOption, SpmPacket, StreamKey};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use crate::connection::Connection;
use crate::context::Shared;
use crate::event::{BreakReason, Event, RejectReason};
use crate::queue::StreamInfo;
use crate::stream::{Stream, StreamParams};

// ─── Formation ───────────────────────────────────────────────────────────────

/// Stream parameters carried by a formation SPM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Formation {
    pub topic: Option<String>,
    pub control: ControlOption,
    pub join: Option<u32>,
    pub first_msg_num: Option<u64>,
    pub tx_trail: u64,
    pub lead: u64,
}

impl Formation {
    /// The lead is unwrapped against the trail, so a window straddling the
    /// 32-bit wrap keeps `lead >= tx_trail`.
    pub fn from_spm(spm: &SpmPacket) -> Self {
        let tx_trail = spm.trail as u64;
        Formation {
            topic: spm.options.topic.clone(),
            control: spm.options.control.unwrap_or_default(),
            join: spm.options.join,
            first_msg_num: spm.options.msg_info,
            tx_trail,
            lead: unwrap_seq(tx_trail, spm.lead).max(tx_trail),
        }
    }
}

/// Where a new stream starts delivering, and the requested start when that
/// had to be clamped forward.
///
/// Precedence: explicit join marker, then `backtrack` behind the lead, then
/// the transmitter's trail. Anything earlier than the transmitter's trail is
/// no longer available and is clamped to it.
pub(crate) fn starting_trail(
    join: Option<u32>,
    backtrack: Option<u64>,
    tx_trail: u64,
    lead: u64,
) -> (u64, Option<u64>) {
    let requested = match (join, backtrack) {
        (Some(j), _) => unwrap_seq(lead, j),
        (None, Some(b)) => lead.saturating_sub(b),
        (None, None) => tx_trail,
    };
    if requested < tx_trail {
        (tx_trail, Some(requested))
    } else {
        (requested, None)
    }
}

// ─── Caches ──────────────────────────────────────────────────────────────────

struct Cached {
    formation: Formation,
}

/// Bounded memory of refused stream ids and of formations that matched no
/// queue. The oldest entry is evicted first.
pub(crate) struct LifecycleCaches {
    formations: HashMap<StreamKey, Cached>,
    formation_order: VecDeque<StreamKey>,
    formation_cap: usize,
    rejected: HashMap<StreamKey, RejectReason>,
    rejected_order: VecDeque<StreamKey>,
    rejected_cap: usize,
}

fn evict<V>(map: &mut HashMap<StreamKey, V>, order: &mut VecDeque<StreamKey>, cap: usize) {
    while map.len() >= cap {
        match order.pop_front() {
            Some(old) => {
                map.remove(&old);
            }
            None => break,
        }
    }
}

impl LifecycleCaches {
    pub fn new(formation_cap: usize, rejected_cap: usize) -> Self {
        LifecycleCaches {
            formations: HashMap::new(),
            formation_order: VecDeque::new(),
            formation_cap,
            rejected: HashMap::new(),
            rejected_order: VecDeque::new(),
            rejected_cap,
        }
    }

    pub fn is_rejected(&self, key: StreamKey) -> bool {
        self.rejected.contains_key(&key)
    }

    pub fn reject(&mut self, key: StreamKey, reason: RejectReason) {
        if self.rejected_cap == 0 {
            return;
        }
        if self.rejected.insert(key, reason).is_none() {
            self.rejected_order.push_back(key);
            if self.rejected.len() > self.rejected_cap {
                if let Some(old) = self.rejected_order.pop_front() {
                    self.rejected.remove(&old);
                }
            }
        }
    }

    /// Forget capacity refusals so those streams may be admitted again.
    pub fn purge_capacity_rejections(&mut self) {
        self.rejected.retain(|_, r| *r != RejectReason::Capacity);
        let rejected = &self.rejected;
        self.rejected_order.retain(|k| rejected.contains_key(k));
    }

    /// Store or refresh a formation. Returns true if the key was not cached
    /// before.
    pub fn cache_formation(&mut self, key: StreamKey, formation: Formation) -> bool {
        if self.formation_cap == 0 {
            return true;
        }
        if let Some(entry) = self.formations.get_mut(&key) {
            entry.formation = formation;
            return false;
        }
        evict(&mut self.formations, &mut self.formation_order, self.formation_cap);
        self.formations.insert(key, Cached { formation });
        self.formation_order.push_back(key);
        true
    }

    pub fn cached(&self, key: StreamKey) -> Option<Formation> {
        self.formations.get(&key).map(|c| c.formation.clone())
    }

    pub fn forget(&mut self, key: StreamKey) {
        if self.formations.remove(&key).is_some() {
            self.formation_order.retain(|k| *k != key);
        }
    }
}

// ─── Admission ───────────────────────────────────────────────────────────────

/// What made an unknown stream show up.
pub(crate) enum Trigger<'a> {
    Spm(&'a SpmPacket),
    Data,
}

/// Try to create a stream for an unknown key seen on `conn`. Returns the
/// stream (possibly created concurrently by another processor) or `None`
/// when the packet should be dropped.
pub(crate) fn admit(
    shared: &Shared,
    conn: &Arc<Connection>,
    key: StreamKey,
    trigger: Trigger<'_>,
) -> Option<Arc<Stream>> {
    if shared.caches.lock().is_rejected(key) {
        bump(&shared.counters.unknown_stream, 1);
        return None;
    }
    let formation = match trigger {
        Trigger::Spm(spm) if spm.options.is_formation() => Some(Formation::from_spm(spm)),
        _ => shared.caches.lock().cached(key),
    };
    let Some(formation) = formation else {
        trace!(stream = %key, conn = %conn.id, "packet for unknown stream");
        bump(&shared.counters.unknown_stream, 1);
        return None;
    };

    let info = StreamInfo {
        stream: key,
        topic: formation.topic.clone(),
        reliability: formation.control.reliability,
        conn: conn.id,
        peer: conn.peer,
    };
    let matched = shared.queues.read().match_stream(&info);
    let Some(queue) = matched else {
        bump(&shared.counters.unknown_stream, 1);
        if shared.caches.lock().cache_formation(key, formation) {
            debug!(stream = %key, topic = ?info.topic, "no queue for stream");
            shared.events.broadcast(Event::StreamNotFound {
                stream: key,
                topic: info.topic,
            });
        }
        return None;
    };

    if !queue.callbacks.accept_stream(&info) {
        info!(stream = %key, topic = ?info.topic, "stream vetoed by application");
        {
            let mut caches = shared.caches.lock();
            caches.forget(key);
            caches.reject(key, RejectReason::Vetoed);
        }
        shared.events.to_queue(
            &queue,
            Event::StreamRejected {
                stream: key,
                reason: RejectReason::Vetoed,
            },
        );
        return None;
    }

    let (start, clamped_from) = starting_trail(
        formation.join,
        shared.config.window.late_join_backtrack,
        formation.tx_trail,
        formation.lead,
    );
    let stream = Arc::new(Stream::new(
        StreamParams {
            key,
            conn: conn.id,
            start,
            lead: formation.lead,
            tx_trail: formation.tx_trail,
            control: formation.control,
            first_msg_num: formation.first_msg_num,
        },
        Arc::clone(&queue),
        &shared.config,
    ));

    {
        let table = shared.streams.upgradable_read();
        if let Some(existing) = table.get(&key) {
            return Some(Arc::clone(existing));
        }
        if queue.is_closed() {
            return None;
        }
        let limit = shared.config.limits.max_streams;
        if table.len() >= limit {
            drop(table);
            warn!(stream = %key, limit, "stream limit reached, rejecting");
            shared.caches.lock().reject(key, RejectReason::Capacity);
            shared.events.to_queue(
                &queue,
                Event::StreamRejected {
                    stream: key,
                    reason: RejectReason::Capacity,
                },
            );
            return None;
        }
        let mut table = RwLockUpgradableReadGuard::upgrade(table);
        table.insert(key, Arc::clone(&stream));
    }

    conn.streams.lock().insert(key);
    queue.streams.lock().insert(key);
    shared.caches.lock().forget(key);
    bump(&shared.counters.streams_created, 1);
    info!(
        stream = %key,
        conn = %conn.id,
        topic = ?formation.topic,
        start,
        lead = formation.lead,
        "new stream"
    );
    shared.events.to_queue(
        &queue,
        Event::NewStream {
            stream: key,
            topic: formation.topic,
            conn: conn.id,
        },
    );
    if let Some(requested) = clamped_from {
        warn!(stream = %key, requested, available = start, "late join start no longer available");
        shared.events.to_queue(
            &queue,
            Event::LateJoinFailed {
                stream: key,
                requested,
                available: start,
            },
        );
    }

    // The connection or queue may have gone away while we were registering.
    if conn.is_closed() {
        teardown(shared, key, Some(BreakReason::ConnectionLost));
        return None;
    }
    if queue.is_closed() {
        teardown(shared, key, None);
        return None;
    }
    Some(stream)
}

// ─── Teardown ────────────────────────────────────────────────────────────────

/// Remove a stream and reclaim its resources. `None` is an orderly close
/// (`StreamClosed`); `Some` reports `StreamBroke`. Returns false if the
/// stream was not registered.
///
/// Never call with a lock of the stream held.
pub(crate) fn teardown(shared: &Shared, key: StreamKey, reason: Option<BreakReason>) -> bool {
    let stream = {
        let mut table = shared.streams.write();
        let Some(stream) = table.remove(&key) else {
            return false;
        };
        stream.kill();
        stream.reclaim();
        stream
    };

    if let Some(conn) = shared.connection(stream.conn) {
        conn.streams.lock().remove(&key);
    }
    stream.queue.streams.lock().remove(&key);
    shared.caches.lock().purge_capacity_rejections();
    bump(&shared.counters.streams_closed, 1);

    let event = match reason {
        Some(reason) => {
            info!(stream = %key, %reason, "stream broke");
            Event::StreamBroke {
                stream: key,
                reason,
            }
        }
        None => {
            info!(stream = %key, "stream closed");
            Event::StreamClosed { stream: key }
        }
    };
    shared.events.to_queue(&stream.queue, event);
    true
}
