//! # End-to-end receiver scenarios over loopback TCP
//!
//! A blocking test source connects to a live receiver, forms streams with
//! SPMs and sends ODATA. Assertions are on what the queue callbacks see and
//! what the source reads back (NAKs).

mod common;

use common::{init_tracing, test_config, wait_until, Recorder, TestSource};
use rivulet_receiver::{
    BreakReason, DeliveryMode, Event, MatchRule, Receiver, RejectReason, StreamKey,
};
use rivulet_transport::reassembly::fragment_message;
use rivulet_transport::wire::{ControlOption, Options};
use std::sync::Arc;
use std::time::Duration;

fn start(cfg: rivulet_receiver::ReceiverConfig, topic: &str) -> (Receiver, Arc<Recorder>, TestSource) {
    init_tracing();
    let rx = Receiver::new(cfg).unwrap();
    let rec = Arc::new(Recorder::default());
    rx.create_queue(MatchRule::name(topic), DeliveryMode::Message, rec.clone())
        .unwrap();
    let addr = rx.listen("127.0.0.1:0").unwrap();
    let src = TestSource::connect(addr, 0x5151).unwrap();
    (rx, rec, src)
}

/// One processor keeps arrival order, so no transient gaps get NAKed.
fn single_processor() -> rivulet_receiver::ReceiverConfig {
    let mut cfg = test_config();
    cfg.threads.processors = 1;
    cfg
}

fn form(rx: &Receiver, src: &mut TestSource, key: StreamKey, topic: &str, trail: u32, lead: u32) {
    src.announce(key, topic, trail, lead).unwrap();
    assert!(
        wait_until(|| rx.streams().contains(&key)),
        "stream {key} never formed"
    );
}

fn body(seq: u32) -> Vec<u8> {
    format!("msg-{seq}").into_bytes()
}

fn send(src: &mut TestSource, key: StreamKey, seq: u32, trail: u32) {
    let b = body(seq);
    src.odata(key, seq, trail, &[&b[..]]).unwrap();
}

// ─── Scenario 1: in-order delivery ──────────────────────────────────────────

#[test]
fn in_order_packets_deliver_without_naks() {
    let (rx, rec, mut src) = start(single_processor(), "alpha");
    let key = StreamKey::new(0xA1, 1);
    form(&rx, &mut src, key, "alpha", 100, 100);

    for seq in 100..105 {
        send(&mut src, key, seq, 100);
    }
    assert!(wait_until(|| rec.messages.lock().len() == 5));

    assert_eq!(rec.message_seqs(key), vec![100, 101, 102, 103, 104]);
    let msgs = rec.messages.lock().clone();
    for m in &msgs {
        assert_eq!(m.data.as_ref(), body(m.seq as u32).as_slice());
    }
    assert!(src.collect_naks(Duration::from_millis(100)).is_empty());

    let stats = rx.stream_stats(key).unwrap();
    assert_eq!(stats.packets_stored, 5);
    assert_eq!(stats.messages_delivered, 5);
    assert_eq!(stats.naks_sent, 0);
    assert_eq!(stats.lead, 105);
    assert_eq!(rx.stats().naks_sent, 0);
    assert!(rec.has_event(|e| matches!(e, Event::NewStream { stream, .. } if *stream == key)));
    rx.stop(Duration::from_secs(5)).unwrap();
}

// ─── Scenario 2: single loss, NAK, unrecoverable ────────────────────────────

#[test]
fn lost_packet_is_naked_once_then_skipped() {
    let mut cfg = single_processor();
    cfg.nak.params.ncf_timeout = Duration::from_millis(50);
    cfg.nak.params.ncf_retries = 1;
    let (rx, rec, mut src) = start(cfg, "beta");
    let key = StreamKey::new(0xB2, 2);
    form(&rx, &mut src, key, "beta", 0, 0);

    for seq in [0, 1, 3, 4] {
        send(&mut src, key, seq, 0);
    }

    let naks = src.collect_naks(Duration::from_millis(500));
    assert_eq!(naks, vec![(key, vec![2])]);

    assert!(wait_until(|| rec.message_seqs(key).len() == 4));
    assert_eq!(rec.message_seqs(key), vec![0, 1, 3, 4]);
    assert!(rec.has_event(|e| matches!(
        e,
        Event::PacketLoss { stream, seq: 2, count: 1 } if *stream == key
    )));
    let stats = rx.stats();
    assert_eq!(stats.naks_sent, 1);
    assert_eq!(stats.packets_lost, 1);
    rx.stop(Duration::from_secs(5)).unwrap();
}

#[test]
fn repair_fills_gap() {
    let (rx, rec, mut src) = start(test_config(), "repair");
    let key = StreamKey::new(0xB3, 3);
    form(&rx, &mut src, key, "repair", 0, 0);

    for seq in [0, 2, 3] {
        send(&mut src, key, seq, 0);
    }
    let naks = src.collect_naks(Duration::from_millis(300));
    assert!(naks.iter().any(|(k, seqs)| *k == key && seqs.contains(&1)));
    assert_eq!(rec.message_seqs(key), vec![0]);

    send(&mut src, key, 1, 0);
    assert!(wait_until(|| rec.message_seqs(key).len() == 4));
    assert_eq!(rec.message_seqs(key), vec![0, 1, 2, 3]);
    assert!(!rec.has_event(|e| matches!(e, Event::PacketLoss { .. })));
    rx.stop(Duration::from_secs(5)).unwrap();
}

// ─── Scenario 3: fragment reassembly ────────────────────────────────────────

#[test]
fn out_of_order_fragments_reassemble_once() {
    let (rx, rec, mut src) = start(test_config(), "gamma");
    let key = StreamKey::new(0xC3, 3);
    form(&rx, &mut src, key, "gamma", 0, 0);

    let msg: Vec<u8> = (0..75u8).collect();
    let pieces = fragment_message(11, &msg, 25);
    assert_eq!(pieces.len(), 3);
    for i in [2usize, 0, 1] {
        src.payload(key, i as u32, 0, pieces[i].clone()).unwrap();
    }

    assert!(wait_until(|| !rec.messages.lock().is_empty()));
    std::thread::sleep(Duration::from_millis(50));
    let msgs = rec.messages.lock().clone();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].seq, 0);
    assert_eq!(msgs[0].data.as_ref(), msg.as_slice());
    rx.stop(Duration::from_secs(5)).unwrap();
}

// ─── Scenario 4: connection failure ─────────────────────────────────────────

#[test]
fn connection_failure_breaks_every_stream() {
    let (rx, rec, mut src) = start(test_config(), "delta");
    let a = StreamKey::new(0xD4, 1);
    let b = StreamKey::new(0xD4, 2);
    form(&rx, &mut src, a, "delta", 0, 0);
    form(&rx, &mut src, b, "delta", 0, 0);
    send(&mut src, a, 0, 0);
    send(&mut src, b, 0, 0);
    assert!(wait_until(|| rec.messages.lock().len() == 2));

    src.kill();

    let broke = |key: StreamKey| {
        move |e: &Event| {
            matches!(e, Event::StreamBroke { stream, reason: BreakReason::ConnectionLost } if *stream == key)
        }
    };
    assert!(wait_until(|| rec.has_event(broke(a)) && rec.has_event(broke(b))));
    let conn_idx = rec
        .event_index(|e| matches!(e, Event::ConnectionBroke { .. }))
        .unwrap();
    assert!(conn_idx < rec.event_index(broke(a)).unwrap());
    assert!(conn_idx < rec.event_index(broke(b)).unwrap());

    assert!(rx.streams().is_empty());
    let delivered = rec.messages.lock().len();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(rec.messages.lock().len(), delivered);
    assert_eq!(rx.stats().connections_broken, 1);
    rx.stop(Duration::from_secs(5)).unwrap();
}

// ─── Lifecycle ──────────────────────────────────────────────────────────────

#[test]
fn unmatched_stream_reported_then_admitted_from_cache() {
    init_tracing();
    let rx = Receiver::new(test_config()).unwrap();
    let watcher = Arc::new(Recorder::default());
    rx.create_queue(MatchRule::name("other"), DeliveryMode::Message, watcher.clone())
        .unwrap();
    let addr = rx.listen("127.0.0.1:0").unwrap();
    let mut src = TestSource::connect(addr, 7).unwrap();
    let key = StreamKey::new(0xE5, 5);

    src.announce(key, "late", 0, 0).unwrap();
    assert!(wait_until(|| watcher.has_event(
        |e| matches!(e, Event::StreamNotFound { stream, topic: Some(t) } if *stream == key && t == "late")
    )));
    assert!(rx.streams().is_empty());

    let rec = Arc::new(Recorder::default());
    rx.create_queue(MatchRule::name("late"), DeliveryMode::Message, rec.clone())
        .unwrap();
    // Data alone forms the stream from the cached SPM.
    send(&mut src, key, 0, 0);
    assert!(wait_until(|| rec.message_seqs(key) == vec![0]));
    rx.stop(Duration::from_secs(5)).unwrap();
}

#[test]
fn vetoed_stream_is_rejected_and_remembered() {
    init_tracing();
    let rx = Receiver::new(test_config()).unwrap();
    let rec = Arc::new(Recorder::vetoing());
    rx.create_queue(MatchRule::name("veto"), DeliveryMode::Message, rec.clone())
        .unwrap();
    let addr = rx.listen("127.0.0.1:0").unwrap();
    let mut src = TestSource::connect(addr, 8).unwrap();
    let key = StreamKey::new(0xF6, 6);

    src.announce(key, "veto", 0, 0).unwrap();
    assert!(wait_until(|| rec.has_event(|e| matches!(
        e,
        Event::StreamRejected { stream, reason: RejectReason::Vetoed } if *stream == key
    ))));
    src.announce(key, "veto", 0, 0).unwrap();
    send(&mut src, key, 0, 0);
    std::thread::sleep(Duration::from_millis(50));
    assert!(rx.streams().is_empty());
    let rejections = rec
        .events
        .lock()
        .iter()
        .filter(|e| matches!(e, Event::StreamRejected { .. }))
        .count();
    assert_eq!(rejections, 1);
    rx.stop(Duration::from_secs(5)).unwrap();
}

#[test]
fn stream_limit_rejects_with_capacity() {
    let mut cfg = test_config();
    cfg.limits.max_streams = 1;
    let (rx, rec, mut src) = start(cfg, "cap");
    let a = StreamKey::new(0x11, 1);
    let b = StreamKey::new(0x11, 2);
    form(&rx, &mut src, a, "cap", 0, 0);
    src.announce(b, "cap", 0, 0).unwrap();
    assert!(wait_until(|| rec.has_event(|e| matches!(
        e,
        Event::StreamRejected { stream, reason: RejectReason::Capacity } if *stream == b
    ))));
    assert_eq!(rx.streams(), vec![a]);

    // Freeing a slot lets the rejected stream in on its next SPM.
    rx.remove_stream(a).unwrap();
    src.announce(b, "cap", 0, 0).unwrap();
    assert!(wait_until(|| rx.streams() == vec![b]));
    rx.stop(Duration::from_secs(5)).unwrap();
}

#[test]
fn join_marker_sets_start() {
    let (rx, rec, mut src) = start(test_config(), "join");
    let key = StreamKey::new(0x22, 2);
    src.announce_with(
        key,
        10,
        20,
        Options {
            topic: Some("join".into()),
            join: Some(15),
            control: Some(ControlOption::default()),
            ..Options::default()
        },
    )
    .unwrap();
    assert!(wait_until(|| rx.streams().contains(&key)));
    for seq in 15..20 {
        send(&mut src, key, seq, 10);
    }
    assert!(wait_until(|| rec.message_seqs(key).len() == 5));
    assert_eq!(rec.message_seqs(key), vec![15, 16, 17, 18, 19]);
    rx.stop(Duration::from_secs(5)).unwrap();
}

#[test]
fn late_join_beyond_history_is_reported() {
    let mut cfg = test_config();
    cfg.window.late_join_backtrack = Some(50);
    let (rx, rec, mut src) = start(cfg, "backtrack");
    let key = StreamKey::new(0x33, 3);
    form(&rx, &mut src, key, "backtrack", 30, 60);
    assert!(wait_until(|| rec.has_event(|e| matches!(
        e,
        Event::LateJoinFailed { stream, requested: 10, available: 30 } if *stream == key
    ))));
    rx.stop(Duration::from_secs(5)).unwrap();
}

#[test]
fn inactive_source_closes_after_delay() {
    let mut cfg = test_config();
    cfg.stream.close_delay = Duration::from_millis(50);
    let (rx, rec, mut src) = start(cfg, "bye");
    let key = StreamKey::new(0x44, 4);
    form(&rx, &mut src, key, "bye", 0, 0);
    send(&mut src, key, 0, 0);
    src.announce_with(
        key,
        0,
        1,
        Options {
            control: Some(ControlOption {
                active: false,
                ..ControlOption::default()
            }),
            ..Options::default()
        },
    )
    .unwrap();
    assert!(wait_until(
        || rec.has_event(|e| matches!(e, Event::StreamClosed { stream } if *stream == key))
    ));
    assert_eq!(rec.message_seqs(key), vec![0]);
    assert!(rx.streams().is_empty());
    rx.stop(Duration::from_secs(5)).unwrap();
}

#[test]
fn close_queue_closes_its_streams() {
    let (rx, rec, mut src) = start(test_config(), "q");
    let key = StreamKey::new(0x55, 5);
    form(&rx, &mut src, key, "q", 0, 0);
    let other = Arc::new(Recorder::default());
    let handle = rx
        .create_queue(MatchRule::name("q2"), DeliveryMode::Message, other)
        .unwrap();
    rx.close_queue(handle).unwrap();
    assert!(rx.close_queue(handle).is_err());
    assert_eq!(rx.streams(), vec![key]);
    assert!(rec.events.lock().iter().all(|e| !matches!(e, Event::StreamClosed { .. })));
    rx.stop(Duration::from_secs(5)).unwrap();
}

#[test]
fn stream_report_omission_breaks_stream() {
    let (rx, rec, mut src) = start(test_config(), "rep");
    let a = StreamKey::new(0x66, 1);
    let b = StreamKey::new(0x66, 2);
    form(&rx, &mut src, a, "rep", 0, 0);
    form(&rx, &mut src, b, "rep", 0, 0);
    src.send(&rivulet_transport::wire::Packet::stream_report(vec![a]))
        .unwrap();
    assert!(wait_until(|| rec.has_event(|e| matches!(
        e,
        Event::StreamBroke { stream, reason: BreakReason::NotReported } if *stream == b
    ))));
    assert_eq!(rx.streams(), vec![a]);
    rx.stop(Duration::from_secs(5)).unwrap();
}

// ─── Delivery modes ─────────────────────────────────────────────────────────

#[test]
fn packet_and_data_modes() {
    init_tracing();
    let rx = Receiver::new(test_config()).unwrap();
    let packets = Arc::new(Recorder::default());
    let data = Arc::new(Recorder::default());
    rx.create_queue(MatchRule::name("pkt"), DeliveryMode::Packet, packets.clone())
        .unwrap();
    rx.create_queue(
        MatchRule::predicate(|info| info.topic.as_deref() == Some("raw")),
        DeliveryMode::Data,
        data.clone(),
    )
    .unwrap();
    let addr = rx.listen("127.0.0.1:0").unwrap();
    let mut src = TestSource::connect(addr, 9).unwrap();
    let p = StreamKey::new(0x77, 1);
    let d = StreamKey::new(0x77, 2);
    form(&rx, &mut src, p, "pkt", 0, 0);
    form(&rx, &mut src, d, "raw", 0, 0);

    src.odata(p, 0, 0, &[&b"one"[..], &b"two"[..]]).unwrap();
    src.odata(d, 0, 0, &[&b"one"[..], &b"two"[..]]).unwrap();
    assert!(wait_until(|| packets.packets.lock().len() == 1 && data.data.lock().len() == 2));

    let pkt = packets.packets.lock()[0].clone();
    assert_eq!(pkt.seq, 0);
    assert!(!pkt.retransmit);
    // Packet mode hands over the record: kind byte then length-prefixed messages.
    assert_eq!(pkt.payload[0], 0);
    let got: Vec<Vec<u8>> = data.data.lock().iter().map(|(_, _, b)| b.clone()).collect();
    assert_eq!(got, vec![b"one".to_vec(), b"two".to_vec()]);
    rx.stop(Duration::from_secs(5)).unwrap();
}

// ─── Connection roles ───────────────────────────────────────────────────────

#[test]
fn receiver_can_initiate() {
    init_tracing();
    let rx = Receiver::new(test_config()).unwrap();
    let rec = Arc::new(Recorder::default());
    rx.create_queue(MatchRule::name("out"), DeliveryMode::Message, rec.clone())
        .unwrap();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    rx.connect(listener.local_addr().unwrap()).unwrap();
    let (mut src, conn_id) = TestSource::accept(&listener).unwrap();
    assert_ne!(conn_id, 0);

    assert!(wait_until(|| rec.has_event(|e| matches!(
        e,
        Event::ConnectionEstablished { conn, .. } if conn.0 == conn_id
    ))));
    let key = StreamKey::new(0x88, 8);
    form(&rx, &mut src, key, "out", 0, 0);
    send(&mut src, key, 0, 0);
    assert!(wait_until(|| rec.message_seqs(key) == vec![0]));
    rx.stop(Duration::from_secs(5)).unwrap();
}

#[test]
fn api_rejects_calls_after_stop() {
    let rx = Receiver::new(test_config()).unwrap();
    rx.stop(Duration::from_secs(5)).unwrap();
    rx.stop(Duration::from_secs(5)).unwrap();
    let res = rx.create_queue(
        MatchRule::name("x"),
        DeliveryMode::Message,
        Arc::new(Recorder::default()),
    );
    assert!(matches!(res, Err(rivulet_receiver::ReceiverError::Stopped)));
    assert!(rx.listen("127.0.0.1:0").is_err());
}
