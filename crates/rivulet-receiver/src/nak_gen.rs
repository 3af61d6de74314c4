//! NAK generator thread.
//!
//! Every poll interval each reliable stream is scanned for gaps between its
//! delivery point and its lead. Gaps get a NAK element with a random
//! back-off; due elements are coalesced into NAK packets and written to the
//! owning connection. Sequences that exhaust their retries are flagged lost
//! and either skipped or fatal, per [`UnrecoverableAction`].

use quanta::Instant;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rivulet_transport::nak::{coalesce_requests, scan, ScanOutcome, Window};
use rivulet_transport::stats::bump;
use rivulet_transport::wire::{wire_seq, Body, NakPacket, Packet, Reliability};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::config::UnrecoverableAction;
use crate::connection::Connection;
use crate::context::Shared;
use crate::event::{BreakReason, Event};
use crate::lifecycle;
use crate::stream::{schedule, Stream};

pub(crate) fn run_nak_generator(shared: Arc<Shared>) {
    debug!("NAK generator started");
    let mut rng = StdRng::seed_from_u64(rand::random());
    let interval = shared.config.nak.poll_interval;
    while shared.sleep(interval) {
        for stream in shared.all_streams() {
            nak_cycle(&shared, &stream, &mut rng);
        }
    }
    debug!("NAK generator stopped");
}

/// One pass over one stream.
pub(crate) fn nak_cycle(shared: &Shared, stream: &Arc<Stream>, rng: &mut StdRng) {
    if stream.is_dead() {
        return;
    }
    let Some(conn) = shared.connection(stream.conn) else {
        return;
    };
    let now = Instant::now();
    let cfg = &shared.config.nak.params;

    let outcome = {
        let mut st = stream.state.lock();
        if st.reliability != Reliability::Reliable || !st.keep_history {
            return;
        }
        let window = Window {
            trail: st.trail,
            lead: st.lead,
        };
        let mut dq = stream.data_q.lock();
        let mut nq = stream.nak_q.lock();
        let outcome = scan(
            &mut dq,
            &mut nq,
            window,
            now,
            cfg,
            &mut st.timeouts,
            rng,
            || shared.nak_pool.try_acquire(),
        );
        st.stats.naks_sent += outcome.to_nak.len() as u64;
        st.stats.packets_lost += outcome.lost.len() as u64;
        outcome
    };

    if outcome.untracked > 0 {
        trace!(stream = %stream.key, gaps = outcome.untracked, "NAK pool exhausted");
    }
    if !outcome.to_nak.is_empty() {
        send_naks(shared, &conn, stream, &outcome.to_nak, cfg.max_seqs_per_nak);
    }
    if !outcome.lost.is_empty() {
        report_loss(shared, stream, &outcome);
    }
}

fn send_naks(shared: &Shared, conn: &Connection, stream: &Stream, seqs: &[u64], max: usize) {
    let path = conn.local.ip();
    for batch in coalesce_requests(seqs, max) {
        let wire: Vec<u32> = batch.iter().map(|&s| wire_seq(s)).collect();
        let Some(nak) = NakPacket::for_sequences(&wire, path) else {
            continue;
        };
        let frame = Packet::new(stream.key, Body::Nak(nak)).encode_frame();
        conn.queue_frame(&frame);
        bump(&shared.counters.naks_sent, 1);
        trace!(stream = %stream.key, first = batch[0], count = batch.len(), "NAK");
    }
}

fn report_loss(shared: &Shared, stream: &Arc<Stream>, outcome: &ScanOutcome) {
    bump(&shared.counters.packets_lost, outcome.lost.len() as u64);
    for (seq, count) in runs(&outcome.lost) {
        warn!(stream = %stream.key, seq, count, "unrecoverable loss");
        shared.events.to_queue(
            &stream.queue,
            Event::PacketLoss {
                stream: stream.key,
                seq,
                count,
            },
        );
    }
    match shared.config.nak.unrecoverable {
        UnrecoverableAction::Skip => schedule(&shared.work_tx, stream),
        UnrecoverableAction::Kill => {
            let seq = outcome.lost[0];
            lifecycle::teardown(shared, stream.key, Some(BreakReason::Unrecoverable { seq }));
        }
    }
}

/// Collapse ascending sequence numbers into `(first, count)` runs.
fn runs(seqs: &[u64]) -> Vec<(u64, u64)> {
    let mut out: Vec<(u64, u64)> = Vec::new();
    for &seq in seqs {
        match out.last_mut() {
            Some((first, count)) if *first + *count == seq => *count += 1,
            _ => out.push((seq, 1)),
        }
    }
    out
}
