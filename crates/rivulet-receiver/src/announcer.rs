//! Announcer threads: in-order delivery to queue callbacks.
//!
//! A stream is on the work list at most once. The announcer that takes it
//! owns delivery until it puts the stream back or releases it, so callbacks
//! for one stream never run concurrently and always see ascending sequence
//! numbers.

use bytes::Bytes;
use crossbeam_channel::RecvTimeoutError;
use rivulet_transport::reassembly::{preamble, PayloadError, Record};
use rivulet_transport::sorted_q::FLAG_LOST;
use rivulet_transport::stats::bump;
use rivulet_transport::wire::{DataView, Reliability};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::context::Shared;
use crate::event::{BreakReason, Event};
use crate::lifecycle;
use crate::queue::{DeliveredPacket, DeliveryMode, Message};
use crate::stream::{schedule, DataSlot, Stream};

pub(crate) fn run_announcer(shared: Arc<Shared>, index: usize) {
    debug!(index, "announcer started");
    while !shared.is_shutdown() {
        match shared.work_rx.recv_timeout(Duration::from_millis(50)) {
            Ok(stream) => announce(&shared, &stream),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!(index, "announcer stopped");
}

/// What the head of a stream's data window allows.
enum Step {
    Deliver(u64, DataSlot),
    /// Already reported lost by the NAK generator.
    Skipped,
    /// An unreported gap of `count` sequences starting at `seq` was passed.
    Gap { seq: u64, count: u64 },
    Idle,
}

fn next_step(stream: &Stream) -> Step {
    let (trail, lead, best_effort) = {
        let st = stream.state.lock();
        (st.trail, st.lead, st.reliability == Reliability::BestEffort)
    };
    let mut dq = stream.data_q.lock();
    let tail = dq.tail();
    if dq.contains(tail) {
        return match dq.advance_tail() {
            Some(slot) => Step::Deliver(tail, slot),
            None => Step::Idle,
        };
    }
    if dq.flags(tail) & FLAG_LOST != 0 {
        dq.advance_tail();
        return Step::Skipped;
    }

    let bound = if tail < trail {
        trail
    } else if best_effort && tail < lead && !dq.is_empty() {
        lead
    } else {
        return Step::Idle;
    };
    // Stop at the next stored packet; it is still deliverable.
    let next = dq
        .iter()
        .map(|(seq, _)| seq)
        .find(|&seq| seq > tail)
        .map_or(bound, |seq| seq.min(bound));
    let flagged = (tail..next.min(dq.limit()))
        .filter(|&seq| dq.flags(seq) & FLAG_LOST != 0)
        .count() as u64;
    dq.advance_tail_to(next);
    Step::Gap {
        seq: tail,
        count: next - tail - flagged,
    }
}

/// Drain up to one chunk from `stream`, then requeue or release it.
pub(crate) fn announce(shared: &Shared, stream: &Arc<Stream>) {
    let chunk = shared.config.stream.announce_chunk;
    let mut gaps: Vec<(u64, u64)> = Vec::new();
    let mut failure = None;

    for _ in 0..chunk {
        if stream.is_dead() {
            break;
        }
        match next_step(stream) {
            Step::Deliver(seq, slot) => {
                if let Err(e) = deliver(shared, stream, seq, slot) {
                    failure = Some(e);
                    break;
                }
            }
            Step::Skipped => {}
            Step::Gap { seq, count } => {
                if count > 0 {
                    gaps.push((seq, count));
                }
            }
            Step::Idle => break,
        }
    }

    if !gaps.is_empty() {
        report_gaps(shared, stream, &gaps);
    }
    if let Some(e) = failure {
        bump(&shared.counters.framing_errors, 1);
        warn!(stream = %stream.key, error = %e, "undeliverable payload, tearing down stream");
        stream.unschedule();
        lifecycle::teardown(shared, stream.key, Some(BreakReason::Framing(e.to_string())));
        return;
    }
    housekeeping(shared, stream);

    if stream.is_dead() {
        stream.unschedule();
        return;
    }
    if stream.has_ready() {
        if shared.work_tx.send(Arc::clone(stream)).is_err() {
            stream.unschedule();
        }
        return;
    }
    stream.unschedule();
    // A producer may have stored between the check and the release.
    if stream.has_ready() {
        schedule(&shared.work_tx, stream);
    }
}

fn report_gaps(shared: &Shared, stream: &Stream, gaps: &[(u64, u64)]) {
    let total: u64 = gaps.iter().map(|&(_, c)| c).sum();
    bump(&shared.counters.packets_lost, total);
    stream.state.lock().stats.packets_lost += total;
    for &(seq, count) in gaps {
        debug!(stream = %stream.key, seq, count, "passed over missing packets");
        shared.events.to_queue(
            &stream.queue,
            Event::PacketLoss {
                stream: stream.key,
                seq,
                count,
            },
        );
    }
}

/// Age out partial messages and stale message-map entries.
fn housekeeping(shared: &Shared, stream: &Stream) {
    let trail = {
        let mut st = stream.state.lock();
        let tail = stream.data_q.tail();
        st.prune_msg_map(tail);
        st.trail
    };
    let max_age = shared.config.window.fragment_max_age;
    if trail > max_age {
        let expired = stream.fragments.lock().expire_before(trail - max_age);
        if expired > 0 {
            bump(&shared.counters.fragments_expired, expired as u64);
            debug!(stream = %stream.key, expired, "discarded stale partial messages");
        }
    }
}

// ─── Delivery ────────────────────────────────────────────────────────────────

fn deliver(shared: &Shared, stream: &Stream, seq: u64, slot: DataSlot) -> Result<(), PayloadError> {
    let retransmit = slot.retransmit;
    let payload = Bytes::copy_from_slice(&slot.buf[DataView::PAYLOAD_OFFSET..]);
    drop(slot);

    let known = stream.state.lock().payload_offset;
    let offset = match known {
        Some(offset) => offset,
        None => preamble(&payload)?,
    };
    let callbacks = &stream.queue.callbacks;
    let mut delivered = 0u64;

    match stream.queue.mode {
        DeliveryMode::Packet => {
            if stream.is_dead() {
                return Ok(());
            }
            callbacks.on_packet(&DeliveredPacket {
                stream: stream.key,
                seq,
                retransmit,
                payload: payload.slice(offset as usize..),
            });
            delivered = 1;
        }
        DeliveryMode::Data => match Record::parse(&payload, offset)? {
            Record::Messages(msgs) => {
                for msg in msgs {
                    if stream.is_dead() {
                        break;
                    }
                    callbacks.on_data(stream.key, seq, &msg);
                    delivered += 1;
                }
            }
            Record::Fragment(piece) => {
                if !stream.is_dead() {
                    callbacks.on_data(stream.key, seq, &piece.data);
                    delivered = 1;
                }
            }
        },
        DeliveryMode::Message => {
            let ready: Vec<(u64, Bytes)> = match Record::parse(&payload, offset)? {
                Record::Messages(msgs) => msgs.into_iter().map(|m| (seq, m)).collect(),
                Record::Fragment(piece) => {
                    let done = stream.fragments.lock().insert(seq, piece)?;
                    match done {
                        Some(assembled) => {
                            trace!(stream = %stream.key, msg_id = assembled.msg_id, "message reassembled");
                            vec![(assembled.first_seq, assembled.data)]
                        }
                        None => Vec::new(),
                    }
                }
            };
            for (first_seq, data) in ready {
                if stream.is_dead() {
                    break;
                }
                let msg_num = stream.state.lock().take_msg_num(first_seq);
                callbacks.on_message(&Message {
                    stream: stream.key,
                    seq: first_seq,
                    msg_num,
                    data,
                });
                delivered += 1;
            }
        }
    }

    if delivered > 0 {
        bump(&shared.counters.messages_delivered, delivered);
        stream.state.lock().stats.messages_delivered += delivered;
    }
    Ok(())
}
