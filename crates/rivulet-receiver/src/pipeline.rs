//! Packet extraction and processing.
//!
//! Processor threads share two jobs. Whoever wins the poll lock waits on
//! socket readiness, reads the connections reported readable, splits the
//! byte stream into frames, handles control frames inline and copies
//! data/SPM frames into pooled buffers for the ready queue. Everyone else drains the ready queue: look up or admit the
//! stream, then store under the stream's lock and wake the announcer.

use bytes::Bytes;
use quanta::Instant;
use rivulet_transport::nak::apply_ncf;
use rivulet_transport::reassembly::{preamble, PayloadError};
use rivulet_transport::stats::bump;
use rivulet_transport::wire::{
    Body, DataView, NakPacket, Packet, PacketType, SpmPacket, StreamKey, StreamReportPacket,
};
use std::collections::HashSet;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::connection::{break_connection, Connection};
use crate::context::{InFlight, RawPacket, Shared};
use crate::event::BreakReason;
use crate::lifecycle::{self, Trigger};
use crate::poller::ReadPoller;
use crate::stream::{schedule, DataSlot, Stored, Stream};

/// Reads per connection per poll, so one busy peer cannot starve the rest.
const MAX_READS_PER_POLL: usize = 8;

// ─── Processor Thread ────────────────────────────────────────────────────────

pub(crate) fn run_processor(shared: Arc<Shared>, index: usize) {
    debug!(index, "packet processor started");
    let idle = shared.config.threads.idle_sleep;
    while !shared.is_shutdown() {
        if let Ok(raw) = shared.ready_rx.try_recv() {
            process(&shared, raw);
            continue;
        }
        if let Some(mut poller) = shared.poll_lock.try_lock() {
            poll_connections(&shared, &mut poller, idle);
            continue;
        }
        if let Ok(raw) = shared.ready_rx.recv_timeout(idle) {
            process(&shared, raw);
        }
    }
    debug!(index, "packet processor stopped");
}

// ─── Extraction ──────────────────────────────────────────────────────────────

/// Wait up to `timeout` for readable connections and read them, together
/// with the backlog left by earlier passes. Returns the number of frames
/// extracted.
pub(crate) fn poll_connections(shared: &Shared, poller: &mut ReadPoller, timeout: Duration) -> usize {
    let watermark = shared.config.connection.inflight_watermark;
    poller.backlog.extend(shared.promoted.lock().drain(..));
    let wait = if poller.backlog.is_empty() {
        timeout
    } else {
        Duration::ZERO
    };
    let fired = match poller.wait(wait) {
        Ok(tokens) => tokens,
        Err(e) => {
            warn!(error = %e, "readiness poll failed");
            return 0;
        }
    };

    let mut due: Vec<Arc<Connection>> = poller
        .backlog
        .drain()
        .chain(poller.paused.drain())
        .filter_map(|id| shared.connection(id))
        .collect();
    for token in fired {
        if let Some(conn) = shared.connection_by_token(token.0) {
            if !due.iter().any(|c| c.id == conn.id) {
                due.push(conn);
            }
        }
    }

    let mut total = 0;
    for conn in due {
        if conn.is_closed() {
            continue;
        }
        if conn.in_flight.load(Ordering::Acquire) >= watermark {
            trace!(conn = %conn.id, "read paused at in-flight watermark");
            poller.paused.insert(conn.id);
            continue;
        }
        let Some(read) = read_connection(shared, &conn) else {
            poller.paused.insert(conn.id);
            continue;
        };
        if !read.drained {
            poller.backlog.insert(conn.id);
        }
        total += read.frames;
    }
    total
}

struct ReadOutcome {
    frames: usize,
    /// The socket reported `WouldBlock`, end of stream or an error, so the
    /// next edge will announce new input.
    drained: bool,
}

/// Read and dispatch what `conn` has. `None` when another thread holds its
/// reader.
fn read_connection(shared: &Shared, conn: &Arc<Connection>) -> Option<ReadOutcome> {
    let mut frames = Vec::new();
    let mut failure = None;
    let mut drained = false;
    {
        let mut reader = conn.reader.try_lock()?;
        for _ in 0..MAX_READS_PER_POLL {
            let mut sock = conn.socket();
            match reader.read_from(&mut sock) {
                Ok(0) => {
                    failure = Some("closed by peer".to_string());
                    drained = true;
                    break;
                }
                Ok(n) => bump(&shared.counters.bytes_received, n as u64),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    drained = true;
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    failure = Some(format!("read error: {e}"));
                    drained = true;
                    break;
                }
            }
        }
        loop {
            match reader.next_frame() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break,
                Err(e) => {
                    bump(&shared.counters.framing_errors, 1);
                    failure = Some(format!("framing error: {e}"));
                    break;
                }
            }
        }
    }

    let count = frames.len();
    if count > 0 {
        conn.touch_rx(Instant::now());
        bump(&shared.counters.packets_received, count as u64);
    }
    for frame in frames {
        dispatch_frame(shared, conn, frame);
    }
    if let Some(reason) = failure {
        break_connection(shared, conn, &reason);
    }
    Some(ReadOutcome {
        frames: count,
        drained,
    })
}

/// Route one frame: pipeline types are queued, control types handled here.
fn dispatch_frame(shared: &Shared, conn: &Arc<Connection>, frame: Bytes) {
    let Some(ptype) = Packet::peek_type(&frame) else {
        bump(&shared.counters.framing_errors, 1);
        debug!(conn = %conn.id, len = frame.len(), "dropping frame with bad header");
        return;
    };

    if ptype.is_pipeline() {
        let Some(mut buf) = shared.packet_pool.acquire(shared.config.pool.acquire_timeout) else {
            warn!(conn = %conn.id, "packet buffer pool exhausted, dropping packet");
            return;
        };
        buf.extend_from_slice(&frame);
        let raw = RawPacket {
            buf,
            origin: InFlight::new(Arc::clone(conn)),
        };
        let _ = shared.ready_tx.send(raw);
        return;
    }

    let mut body = frame;
    let Some(packet) = Packet::decode(&mut body) else {
        bump(&shared.counters.framing_errors, 1);
        debug!(conn = %conn.id, ?ptype, "malformed control packet");
        return;
    };
    match packet.body {
        Body::Heartbeat(_) => trace!(conn = %conn.id, "heartbeat"),
        Body::StreamReport(report) => handle_stream_report(shared, conn, report),
        Body::Ncf(ncf) => handle_ncf(shared, conn, packet.header.stream, &ncf),
        Body::Nak(_) => trace!(conn = %conn.id, "ignoring NAK from peer"),
        Body::Cfp(leg, _) => debug!(conn = %conn.id, ?leg, "CFP leg on established connection"),
        Body::Spm(_) | Body::Odata(_) | Body::Rdata(_) => {}
    }
}

/// Tear down streams of `conn` that its peer no longer advertises.
fn handle_stream_report(shared: &Shared, conn: &Arc<Connection>, report: StreamReportPacket) {
    let live: HashSet<StreamKey> = report.streams.into_iter().collect();
    let gone: Vec<StreamKey> = conn
        .stream_keys()
        .into_iter()
        .filter(|k| !live.contains(k))
        .collect();
    for key in gone {
        info!(conn = %conn.id, stream = %key, "stream missing from report");
        lifecycle::teardown(shared, key, Some(BreakReason::NotReported));
    }
}

fn handle_ncf(shared: &Shared, conn: &Arc<Connection>, key: StreamKey, ncf: &NakPacket) {
    bump(&shared.counters.ncfs_received, 1);
    let Some(stream) = shared.stream(key) else {
        return;
    };
    if stream.conn != conn.id {
        return;
    }
    let now = Instant::now();
    let cfg = &shared.config.nak.params;
    let mut st = stream.state.lock();
    let mut naks = stream.nak_q.lock();
    let mut matched = 0usize;
    for wire in ncf.sequences() {
        let seq = st.unwrap(wire);
        if apply_ncf(&mut naks, seq, now, cfg, &mut st.timeouts) {
            matched += 1;
        }
    }
    trace!(stream = %key, matched, "NCF");
}

// ─── Processing ──────────────────────────────────────────────────────────────

/// Process one queued data or SPM frame.
pub(crate) fn process(shared: &Shared, raw: RawPacket) {
    let RawPacket { buf, origin } = raw;
    let conn = Arc::clone(origin.conn());
    match Packet::peek_type(&buf) {
        Some(PacketType::Spm) => {
            let mut body: &[u8] = &buf;
            match Packet::decode(&mut body) {
                Some(Packet {
                    header,
                    body: Body::Spm(spm),
                }) => process_spm(shared, &conn, header.stream, &spm),
                _ => {
                    bump(&shared.counters.framing_errors, 1);
                    debug!(conn = %conn.id, "malformed SPM");
                }
            }
        }
        Some(PacketType::Odata | PacketType::Rdata) => process_data(shared, &conn, buf),
        other => debug!(conn = %conn.id, ?other, "unexpected packet in pipeline"),
    }
    drop(origin);
}

/// Existing stream for `key` on `conn`, or a newly admitted one.
fn resolve_stream(
    shared: &Shared,
    conn: &Arc<Connection>,
    key: StreamKey,
    trigger: Trigger<'_>,
) -> Option<Arc<Stream>> {
    let stream = match shared.stream(key) {
        Some(s) => s,
        None => lifecycle::admit(shared, conn, key, trigger)?,
    };
    if stream.conn != conn.id {
        trace!(stream = %key, conn = %conn.id, owner = %stream.conn, "stream owned by another connection");
        bump(&shared.counters.unknown_stream, 1);
        return None;
    }
    Some(stream)
}

fn process_spm(shared: &Shared, conn: &Arc<Connection>, key: StreamKey, spm: &SpmPacket) {
    let Some(stream) = resolve_stream(shared, conn, key, Trigger::Spm(spm)) else {
        return;
    };
    let now = Instant::now();
    let wake = {
        let mut st = stream.state.lock();
        st.last_activity = now;
        let lead = st.unwrap(spm.lead);
        let tx_trail = st.unwrap(spm.trail);
        st.extend_lead(lead);
        st.advance_tx_trail(tx_trail);
        if let Some(ctrl) = spm.options.control {
            if st.apply_control(ctrl, now, shared.config.stream.close_delay) {
                info!(stream = %key, "source inactive, closing after delay");
            }
        }
        if let Some(first) = spm.options.msg_info {
            st.apply_msg_info(first);
        }
        st.apply_msg_map(&spm.options.msg_map);
        st.trail > stream.data_q.tail()
    };
    if wake {
        schedule(&shared.work_tx, &stream);
    }
}

fn process_data(
    shared: &Shared,
    conn: &Arc<Connection>,
    buf: rivulet_transport::pool::Pooled<Vec<u8>>,
) {
    let (key, wire_seq, wire_trail, retransmit, offset) = match DataView::parse(&buf) {
        Some(view) => (
            view.header.stream,
            view.sqn,
            view.trail,
            view.header.is_retransmit(),
            preamble(view.payload),
        ),
        None => {
            bump(&shared.counters.framing_errors, 1);
            debug!(conn = %conn.id, "malformed data packet");
            return;
        }
    };
    let Some(stream) = resolve_stream(shared, conn, key, Trigger::Data) else {
        return;
    };

    let now = Instant::now();
    let result: Result<(u64, Stored), PayloadError> = (|| {
        let mut st = stream.state.lock();
        st.last_activity = now;
        let offset = offset?;
        match st.payload_offset {
            None => st.payload_offset = Some(offset),
            Some(expected) if expected != offset => {
                return Err(PayloadError::OffsetChanged {
                    expected,
                    found: offset,
                })
            }
            Some(_) => {}
        }
        let tx_trail = st.unwrap(wire_trail);
        st.advance_tx_trail(tx_trail);
        let seq = st.unwrap(wire_seq);
        let stored = stream.store(&mut st, seq, DataSlot { buf, retransmit });
        Ok((seq, stored))
    })();

    match result {
        Ok((seq, stored)) => {
            let counters = &shared.counters;
            match stored {
                Stored::Ok { wake } => {
                    bump(&counters.packets_stored, 1);
                    trace!(stream = %key, seq, retransmit, "stored");
                    if wake {
                        schedule(&shared.work_tx, &stream);
                    }
                }
                Stored::Duplicate => bump(&counters.duplicates, 1),
                Stored::TooOld => bump(&counters.too_old, 1),
                Stored::TooNew => {
                    bump(&counters.too_new, 1);
                    debug!(stream = %key, seq, "packet beyond receive window");
                }
                Stored::Dead => {}
            }
        }
        Err(e) => {
            bump(&shared.counters.framing_errors, 1);
            warn!(stream = %key, error = %e, "bad payload, tearing down stream");
            lifecycle::teardown(shared, key, Some(BreakReason::Framing(e.to_string())));
        }
    }
}
