//! Test source and recording callbacks shared by the receiver integration
//! tests.

#![allow(dead_code)]

use bytes::Bytes;
use parking_lot::Mutex;
use rivulet_receiver::{
    DeliveredPacket, Event, Message, QueueCallbacks, ReceiverConfig, StreamInfo, StreamKey,
};
use rivulet_transport::cfp::{Handshake, LocalParams};
use rivulet_transport::framing::FrameReader;
use rivulet_transport::reassembly::encode_messages;
use rivulet_transport::wire::{Body, ControlOption, Options, Packet, SpmPacket};
use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rivulet_receiver=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Small pools and fast timers.
pub fn test_config() -> ReceiverConfig {
    let mut cfg = ReceiverConfig::default();
    cfg.threads.processors = 2;
    cfg.window.capacity = 256;
    cfg.pool.packet_buffers = 512;
    cfg.pool.nak_elements = 512;
    cfg.nak.poll_interval = Duration::from_millis(5);
    cfg.nak.params.backoff_ivl = Duration::from_millis(10);
    cfg.connection.handshake_timeout = Duration::from_secs(2);
    cfg.limits.stats_interval = Duration::ZERO;
    cfg
}

/// Poll `check` until it returns true or `TIMEOUT` passes.
pub fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < TIMEOUT {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    check()
}

// ─── Test Source ─────────────────────────────────────────────────────────────

/// Blocking one-way source speaking the wire protocol over TCP.
pub struct TestSource {
    sock: TcpStream,
    reader: FrameReader,
    spm_sqn: u32,
}

impl TestSource {
    /// Connect to a listening receiver and complete the handshake as
    /// initiator.
    pub fn connect(addr: SocketAddr, conn_id: u64) -> io::Result<Self> {
        Self::connect_with_greeting(addr, conn_id, &[])
    }

    /// As [`connect`](Self::connect), writing `greeting` before the first
    /// CFP leg.
    pub fn connect_with_greeting(addr: SocketAddr, conn_id: u64, greeting: &[u8]) -> io::Result<Self> {
        let mut sock = TcpStream::connect(addr)?;
        sock.write_all(greeting)?;
        sock.set_nodelay(true)?;
        sock.set_read_timeout(Some(TIMEOUT))?;
        let local = sock.local_addr()?;
        let mut src = TestSource {
            sock,
            reader: FrameReader::new(1 << 20),
            spm_sqn: 0,
        };

        let mut hs = Handshake::initiator(
            LocalParams {
                port: local.port(),
                peer_port: addr.port(),
                heartbeat_timeout: Duration::from_secs(10),
                one_way: true,
                addr: local.ip(),
            },
            conn_id,
            false,
            TIMEOUT,
        );
        while !hs.is_established() {
            while let Some((leg, pkt)) = hs.poll_transmit() {
                src.send(&Packet::cfp(leg, pkt))?;
            }
            if hs.is_established() {
                break;
            }
            match src.next_packet()?.body {
                Body::Cfp(leg, pkt) => hs
                    .handle(leg, &pkt)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
                _ => continue,
            }
        }
        Ok(src)
    }

    /// Accept one connection from a receiver and complete the handshake as
    /// acceptor.
    pub fn accept(listener: &TcpListener) -> io::Result<(Self, u64)> {
        let (sock, peer) = listener.accept()?;
        sock.set_nodelay(true)?;
        sock.set_read_timeout(Some(TIMEOUT))?;
        let local = sock.local_addr()?;
        let mut src = TestSource {
            sock,
            reader: FrameReader::new(1 << 20),
            spm_sqn: 0,
        };
        let mut hs = Handshake::acceptor(
            LocalParams {
                port: local.port(),
                peer_port: peer.port(),
                heartbeat_timeout: Duration::from_secs(10),
                one_way: true,
                addr: local.ip(),
            },
            false,
            TIMEOUT,
        );
        while !hs.is_established() {
            if let Body::Cfp(leg, pkt) = src.next_packet()?.body {
                hs.handle(leg, &pkt)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            }
            while let Some((leg, pkt)) = hs.poll_transmit() {
                src.send(&Packet::cfp(leg, pkt))?;
            }
        }
        Ok((src, hs.conn_id()))
    }

    pub fn send(&mut self, pkt: &Packet) -> io::Result<()> {
        self.sock.write_all(&pkt.encode_frame())
    }

    /// SPM with a topic, so the receiver can form the stream.
    pub fn announce(&mut self, key: StreamKey, topic: &str, trail: u32, lead: u32) -> io::Result<()> {
        self.announce_with(
            key,
            trail,
            lead,
            Options {
                topic: Some(topic.to_string()),
                control: Some(ControlOption::default()),
                ..Options::default()
            },
        )
    }

    pub fn announce_with(
        &mut self,
        key: StreamKey,
        trail: u32,
        lead: u32,
        options: Options,
    ) -> io::Result<()> {
        self.spm_sqn += 1;
        let spm = SpmPacket {
            spm_sqn: self.spm_sqn,
            trail,
            lead,
            path: IpAddr::V4(Ipv4Addr::LOCALHOST),
            options,
        };
        self.send(&Packet::spm(key, spm))
    }

    pub fn odata(&mut self, key: StreamKey, seq: u32, trail: u32, msgs: &[&[u8]]) -> io::Result<()> {
        self.send(&Packet::odata(key, seq, trail, encode_messages(msgs)))
    }

    pub fn payload(&mut self, key: StreamKey, seq: u32, trail: u32, payload: Bytes) -> io::Result<()> {
        self.send(&Packet::odata(key, seq, trail, payload))
    }

    /// Next decodable packet from the receiver.
    pub fn next_packet(&mut self) -> io::Result<Packet> {
        loop {
            match self.reader.next_frame() {
                Ok(Some(mut frame)) => {
                    if let Some(pkt) = Packet::decode(&mut frame) {
                        return Ok(pkt);
                    }
                }
                Ok(None) => {
                    if self.reader.read_from(&mut self.sock)? == 0 {
                        return Err(io::ErrorKind::UnexpectedEof.into());
                    }
                }
                Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
            }
        }
    }

    /// NAKed sequence numbers seen within `window`, skipping other packets.
    pub fn collect_naks(&mut self, window: Duration) -> Vec<(StreamKey, Vec<u32>)> {
        let deadline = Instant::now() + window;
        let mut out = Vec::new();
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            let _ = self.sock.set_read_timeout(Some(left));
            match self.next_packet() {
                Ok(Packet {
                    header,
                    body: Body::Nak(nak),
                }) => out.push((header.stream, nak.sequences().collect())),
                Ok(_) => {}
                Err(_) => break,
            }
        }
        let _ = self.sock.set_read_timeout(Some(TIMEOUT));
        out
    }

    /// Drop the TCP connection abruptly.
    pub fn kill(self) {
        let _ = self.sock.shutdown(std::net::Shutdown::Both);
    }
}

// ─── Recording Callbacks ─────────────────────────────────────────────────────

#[derive(Default)]
pub struct Recorder {
    pub messages: Mutex<Vec<Message>>,
    pub packets: Mutex<Vec<DeliveredPacket>>,
    pub data: Mutex<Vec<(StreamKey, u64, Vec<u8>)>>,
    pub events: Mutex<Vec<Event>>,
    pub veto: bool,
}

impl Recorder {
    pub fn vetoing() -> Self {
        Recorder {
            veto: true,
            ..Recorder::default()
        }
    }

    pub fn message_seqs(&self, key: StreamKey) -> Vec<u64> {
        self.messages
            .lock()
            .iter()
            .filter(|m| m.stream == key)
            .map(|m| m.seq)
            .collect()
    }

    pub fn has_event(&self, pred: impl Fn(&Event) -> bool) -> bool {
        self.events.lock().iter().any(pred)
    }

    pub fn event_index(&self, pred: impl Fn(&Event) -> bool) -> Option<usize> {
        self.events.lock().iter().position(pred)
    }
}

impl QueueCallbacks for Recorder {
    fn on_message(&self, msg: &Message) {
        self.messages.lock().push(msg.clone());
    }

    fn on_packet(&self, pkt: &DeliveredPacket) {
        self.packets.lock().push(pkt.clone());
    }

    fn on_data(&self, stream: StreamKey, seq: u64, data: &[u8]) {
        self.data.lock().push((stream, seq, data.to_vec()));
    }

    fn on_event(&self, event: &Event) {
        self.events.lock().push(event.clone());
    }

    fn accept_stream(&self, _info: &StreamInfo) -> bool {
        !self.veto
    }
}
