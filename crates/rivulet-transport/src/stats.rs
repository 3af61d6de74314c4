//! # Receiver Statistics
//!
//! Counters are bumped from many threads through [`Counters`] (relaxed
//! atomics) and read as a [`ReceiverStats`] snapshot, which serializes to JSON
//! for export.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::wire::StreamKey;

// ─── Snapshots ───────────────────────────────────────────────────────────────

/// Point-in-time receiver-wide statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReceiverStats {
    /// Frames read from all connections.
    pub packets_received: u64,
    pub bytes_received: u64,
    /// Data packets stored into a stream window.
    pub packets_stored: u64,
    /// Dropped because the slot was already filled.
    pub duplicates: u64,
    /// Dropped because the sequence was behind the window.
    pub too_old: u64,
    /// Dropped because the sequence was beyond the window.
    pub too_new: u64,
    /// Packets for unknown or rejected streams.
    pub unknown_stream: u64,
    pub messages_delivered: u64,
    pub naks_sent: u64,
    pub ncfs_received: u64,
    /// Sequence numbers given up as unrecoverable.
    pub packets_lost: u64,
    /// Framing errors that invalidated a connection or stream.
    pub framing_errors: u64,
    pub fragments_expired: u64,
    pub connections_established: u64,
    pub connections_failed: u64,
    pub connections_broken: u64,
    pub streams_created: u64,
    pub streams_closed: u64,
    /// Gauges.
    pub connections_active: u64,
    pub streams_active: u64,
    pub queues_active: u64,
}

impl ReceiverStats {
    /// Fraction of stored + lost sequence numbers that were lost.
    pub fn loss_rate(&self) -> f64 {
        let total = self.packets_stored + self.packets_lost;
        if total == 0 {
            0.0
        } else {
            self.packets_lost as f64 / total as f64
        }
    }
}

/// Per-stream counters, kept under the stream's state lock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub stream: Option<StreamKey>,
    pub packets_stored: u64,
    pub duplicates: u64,
    pub out_of_window: u64,
    pub messages_delivered: u64,
    pub packets_lost: u64,
    pub naks_sent: u64,
    pub trail: u64,
    pub lead: u64,
}

// ─── Shared Counters ─────────────────────────────────────────────────────────

macro_rules! counters {
    ($($field:ident),* $(,)?) => {
        /// Lock-free receiver-wide counters.
        #[derive(Debug, Default)]
        pub struct Counters {
            $(pub $field: AtomicU64,)*
        }

        impl Counters {
            /// Snapshot the monotonic counters; gauges are filled by the caller.
            pub fn snapshot(&self) -> ReceiverStats {
                ReceiverStats {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                    ..ReceiverStats::default()
                }
            }
        }
    };
}

counters!(
    packets_received,
    bytes_received,
    packets_stored,
    duplicates,
    too_old,
    too_new,
    unknown_stream,
    messages_delivered,
    naks_sent,
    ncfs_received,
    packets_lost,
    framing_errors,
    fragments_expired,
    connections_established,
    connections_failed,
    connections_broken,
    streams_created,
    streams_closed,
);

/// `counter.fetch_add(n, Relaxed)`.
#[inline]
pub fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}
