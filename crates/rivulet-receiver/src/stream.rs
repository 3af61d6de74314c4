//! Per-stream receive state.
//!
//! Lock order inside a stream is `state` → `data_q` → `nak_q`; `fragments`
//! is only touched by the announcer that currently owns the stream.

use parking_lot::Mutex;
use quanta::Instant;
use rivulet_transport::nak::{NakElement, NakTimeouts};
use rivulet_transport::pool::Pooled;
use rivulet_transport::reassembly::FragmentTable;
use rivulet_transport::sorted_q::{PutError, SyncSortedQ, FLAG_LOST};
use rivulet_transport::stats::StreamStats;
use rivulet_transport::wire::{unwrap_seq, ControlOption, MsgMapEntry, Reliability, StreamKey};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ReceiverConfig;
use crate::connection::ConnectionId;
use crate::queue::Queue;

/// One stored data packet: the whole frame body in a pooled buffer.
pub(crate) struct DataSlot {
    pub buf: Pooled<Vec<u8>>,
    pub retransmit: bool,
}

/// Mutable per-stream bookkeeping, guarded by [`Stream::state`].
#[derive(Debug)]
pub(crate) struct StreamState {
    /// Window lower bound. Sequence numbers below it are never delivered.
    pub trail: u64,
    /// One past the highest sequence number known to exist.
    pub lead: u64,
    /// Transmitter's advertised trail.
    pub tx_trail: u64,
    pub reliability: Reliability,
    pub active: bool,
    pub keep_history: bool,
    /// Record offset fixed by the first payload seen.
    pub payload_offset: Option<u8>,
    /// Message number of the next delivered message, once known.
    pub next_msg_num: Option<u64>,
    /// Explicit message numbers keyed by sequence number.
    pub msg_map: BTreeMap<u64, u64>,
    pub last_activity: Instant,
    /// Delayed close deadline, set when the source reports itself inactive.
    pub close_at: Option<Instant>,
    pub timeouts: NakTimeouts,
    pub stats: StreamStats,
}

impl StreamState {
    /// Raise the transmitter trail; the window trail follows it.
    pub fn advance_tx_trail(&mut self, tx_trail: u64) {
        self.tx_trail = self.tx_trail.max(tx_trail);
        self.trail = self.trail.max(self.tx_trail);
        self.lead = self.lead.max(self.trail);
        self.stats.trail = self.trail;
        self.stats.lead = self.lead;
    }

    pub fn extend_lead(&mut self, lead: u64) {
        self.lead = self.lead.max(lead);
        self.stats.lead = self.lead;
    }

    /// Extend a wire sequence number relative to the current lead.
    pub fn unwrap(&self, wire: u32) -> u64 {
        unwrap_seq(self.lead, wire)
    }

    /// Merge a CONTROL option. Returns true when the source just went
    /// inactive and a delayed close was scheduled.
    pub fn apply_control(&mut self, ctrl: ControlOption, now: Instant, delay: Duration) -> bool {
        self.reliability = ctrl.reliability;
        self.keep_history = ctrl.keep_history;
        self.active = ctrl.active;
        if !ctrl.active && self.close_at.is_none() {
            self.close_at = Some(now + delay);
            return true;
        }
        if ctrl.active {
            self.close_at = None;
        }
        false
    }

    pub fn apply_msg_info(&mut self, first: u64) {
        if self.next_msg_num.is_none() {
            self.next_msg_num = Some(first);
        }
    }

    pub fn apply_msg_map(&mut self, entries: &[MsgMapEntry]) {
        for e in entries {
            let seq = self.unwrap(e.sqn);
            if seq >= self.trail {
                self.msg_map.insert(seq, e.msg_num);
            }
        }
    }

    /// Message number for the next message carried by `seq`.
    pub fn take_msg_num(&mut self, seq: u64) -> Option<u64> {
        if let Some(n) = self.msg_map.remove(&seq) {
            self.next_msg_num = Some(n);
        }
        let n = self.next_msg_num?;
        self.next_msg_num = Some(n + 1);
        Some(n)
    }

    /// Drop map entries that can no longer be used.
    pub fn prune_msg_map(&mut self, below: u64) {
        self.msg_map = self.msg_map.split_off(&below);
    }
}

/// Parameters a stream is created with.
#[derive(Debug, Clone)]
pub(crate) struct StreamParams {
    pub key: StreamKey,
    pub conn: ConnectionId,
    pub start: u64,
    pub lead: u64,
    pub tx_trail: u64,
    pub control: ControlOption,
    pub first_msg_num: Option<u64>,
}

pub(crate) struct Stream {
    pub key: StreamKey,
    /// Owning connection, re-validated through the ready table on use.
    pub conn: ConnectionId,
    pub queue: Arc<Queue>,
    pub state: Mutex<StreamState>,
    pub data_q: SyncSortedQ<DataSlot>,
    pub nak_q: SyncSortedQ<Pooled<NakElement>>,
    pub fragments: Mutex<FragmentTable>,
    in_queue: AtomicBool,
    dead: AtomicBool,
}

/// Outcome of [`Stream::store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stored {
    /// Stored; `wake` when the announcer has something new to drain.
    Ok { wake: bool },
    TooOld,
    TooNew,
    Duplicate,
    Dead,
}

impl Stream {
    pub fn new(params: StreamParams, queue: Arc<Queue>, config: &ReceiverConfig) -> Self {
        let now = Instant::now();
        let capacity = config.window.capacity;
        let trail = params.start;
        let lead = params.lead.max(trail);
        Stream {
            key: params.key,
            conn: params.conn,
            queue,
            state: Mutex::new(StreamState {
                trail,
                lead,
                tx_trail: params.tx_trail,
                reliability: params.control.reliability,
                active: params.control.active,
                keep_history: params.control.keep_history,
                payload_offset: None,
                next_msg_num: params.first_msg_num,
                msg_map: BTreeMap::new(),
                last_activity: now,
                close_at: None,
                timeouts: NakTimeouts::new(&config.nak.params),
                stats: StreamStats {
                    stream: Some(params.key),
                    trail,
                    lead,
                    ..StreamStats::default()
                },
            }),
            data_q: SyncSortedQ::new(capacity, trail),
            nak_q: SyncSortedQ::new(capacity, trail),
            fragments: Mutex::new(FragmentTable::new(config.window.max_message_len)),
            in_queue: AtomicBool::new(false),
            dead: AtomicBool::new(false),
        }
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// Mark dead. Returns true for the first caller only.
    pub fn kill(&self) -> bool {
        !self.dead.swap(true, Ordering::AcqRel)
    }

    /// Store a data packet at absolute sequence `seq`. The caller holds the
    /// state lock and passes it in.
    pub fn store(&self, state: &mut StreamState, seq: u64, slot: DataSlot) -> Stored {
        if self.is_dead() {
            return Stored::Dead;
        }
        if seq < state.trail {
            state.stats.out_of_window += 1;
            return Stored::TooOld;
        }
        let mut dq = self.data_q.lock();
        match dq.put(seq, slot) {
            Ok(()) => {
                state.extend_lead(seq + 1);
                state.stats.packets_stored += 1;
                let tail = dq.tail();
                // Best-effort streams skip gaps, so any arrival may unblock.
                Stored::Ok {
                    wake: seq == tail
                        || state.trail > tail
                        || state.reliability == Reliability::BestEffort,
                }
            }
            // Rejected buffers return to the pool as the error drops.
            Err(PutError::TooOld(_)) => {
                state.stats.out_of_window += 1;
                Stored::TooOld
            }
            Err(PutError::TooNew(_)) => {
                state.stats.out_of_window += 1;
                Stored::TooNew
            }
            Err(PutError::Duplicate(_)) => {
                state.stats.duplicates += 1;
                Stored::Duplicate
            }
        }
    }

    /// Whether the announcer could make progress right now.
    pub fn has_ready(&self) -> bool {
        let (trail, lead, best_effort) = {
            let st = self.state.lock();
            (st.trail, st.lead, st.reliability == Reliability::BestEffort)
        };
        let dq = self.data_q.lock();
        let tail = dq.tail();
        dq.contains(tail)
            || dq.flags(tail) & FLAG_LOST != 0
            || tail < trail
            || (best_effort && tail < lead && !dq.is_empty())
    }

    /// Claim the announcer slot. True if the caller must enqueue the stream.
    pub fn try_schedule(&self) -> bool {
        self.in_queue
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the announcer slot.
    pub fn unschedule(&self) {
        self.in_queue.store(false, Ordering::Release);
    }

    /// Drop every buffered packet, NAK record and partial message.
    pub fn reclaim(&self) {
        self.data_q.lock().clear();
        self.nak_q.lock().clear();
        self.fragments.lock().clear();
    }
}

/// Put a stream on the announcer work list unless it already is.
pub(crate) fn schedule(work_tx: &crossbeam_channel::Sender<Arc<Stream>>, stream: &Arc<Stream>) {
    if stream.is_dead() {
        return;
    }
    if stream.try_schedule() && work_tx.send(Arc::clone(stream)).is_err() {
        stream.unschedule();
    }
}
