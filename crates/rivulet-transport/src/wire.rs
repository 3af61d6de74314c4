//! # Rivulet Wire Format
//!
//! Every connection carries length-prefixed frames. Each frame body starts
//! with a fixed common header followed by a type-specific body.
//!
//! ## Common Header (12 bytes)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    Version    |     Type      |     Flags     |   Reserved    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                  Global Source ID (48 bits)                   |
//! +                               +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                               |          Source Port          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! GSI and source port together form the [`StreamKey`]. Connection-level
//! packets (CFP legs, heartbeats, stream reports) carry a zero key.
//!
//! ## Options
//!
//! SPM and NAK/NCF bodies may carry a TLV option block. The block opens with
//! `OPT_LENGTH` (type 0, length 4, 16-bit total block length); every option
//! is `type, length, body` and the last one has the END bit set in its type.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Protocol version carried in every common header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the common header.
pub const COMMON_HEADER_LEN: usize = 12;

/// Size of the frame length prefix.
pub const FRAME_PREFIX_LEN: usize = 4;

/// Header flag: an option block follows the type-specific fixed fields.
pub const FLAG_OPTIONS: u8 = 0x01;
/// Header flag: data packet is a retransmission.
pub const FLAG_RETRANSMIT: u8 = 0x02;

const OPT_LENGTH: u8 = 0x00;
const OPT_NAK_LIST: u8 = 0x01;
const OPT_JOIN: u8 = 0x03;
const OPT_CONN_MSG: u8 = 0x20;
const OPT_CONTROL: u8 = 0x21;
const OPT_MSG_INFO: u8 = 0x22;
const OPT_MSG_MAP: u8 = 0x23;
const OPT_END: u8 = 0x80;

/// Largest option body that fits the 8-bit option length.
pub const MAX_OPTION_BODY: usize = u8::MAX as usize - 2;

/// Most additional sequence numbers a single NAK_LIST option can carry.
pub const MAX_NAK_LIST: usize = MAX_OPTION_BODY / 4;

const ADDR_FAMILY_V4: u16 = 1;
const ADDR_FAMILY_V6: u16 = 2;

// ─── Stream Key ──────────────────────────────────────────────────────────────

/// Stream identity: 48-bit global source id plus 16-bit source port.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct StreamKey(u64);

impl StreamKey {
    /// Largest representable global source id.
    pub const GSI_MAX: u64 = (1 << 48) - 1;

    /// Zero key used by connection-level packets.
    pub const NONE: StreamKey = StreamKey(0);

    pub fn new(gsi: u64, port: u16) -> Self {
        StreamKey(((gsi & Self::GSI_MAX) << 16) | port as u64)
    }

    pub fn from_raw(raw: u64) -> Self {
        StreamKey(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn gsi(self) -> u64 {
        self.0 >> 16
    }

    pub fn port(self) -> u16 {
        self.0 as u16
    }
}

impl fmt::Debug for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamKey({:012x}:{})", self.gsi(), self.port())
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:012x}:{}", self.gsi(), self.port())
    }
}

// ─── Sequence Numbers ────────────────────────────────────────────────────────

/// Extend a 32-bit wire sequence number to 64 bits, choosing the value
/// closest to `reference` (serial-number arithmetic).
pub fn unwrap_seq(reference: u64, wire: u32) -> u64 {
    const SPAN: u64 = 1 << 32;
    const HALF: u64 = 1 << 31;
    let candidate = (reference & !0xFFFF_FFFF) | wire as u64;
    if candidate > reference && candidate - reference > HALF && candidate >= SPAN {
        candidate - SPAN
    } else if candidate < reference && reference - candidate > HALF {
        candidate + SPAN
    } else {
        candidate
    }
}

/// Truncate a 64-bit sequence number to its wire representation.
#[inline]
pub fn wire_seq(seq: u64) -> u32 {
    seq as u32
}

// ─── Packet Type ─────────────────────────────────────────────────────────────

/// Packet type byte of the common header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Spm = 0x00,
    Odata = 0x04,
    Rdata = 0x05,
    Nak = 0x08,
    Ncf = 0x0A,
    Heartbeat = 0x20,
    StreamReport = 0x21,
    CfpReq = 0x30,
    CfpRep = 0x31,
    CfpAck = 0x32,
}

impl PacketType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(PacketType::Spm),
            0x04 => Some(PacketType::Odata),
            0x05 => Some(PacketType::Rdata),
            0x08 => Some(PacketType::Nak),
            0x0A => Some(PacketType::Ncf),
            0x20 => Some(PacketType::Heartbeat),
            0x21 => Some(PacketType::StreamReport),
            0x30 => Some(PacketType::CfpReq),
            0x31 => Some(PacketType::CfpRep),
            0x32 => Some(PacketType::CfpAck),
            _ => None,
        }
    }

    /// Types handed to the packet-processing pipeline rather than dispatched
    /// inline by the extractor.
    pub fn is_pipeline(self) -> bool {
        matches!(self, PacketType::Spm | PacketType::Odata | PacketType::Rdata)
    }
}

// ─── Common Header ───────────────────────────────────────────────────────────

/// Header present on every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHeader {
    pub version: u8,
    pub packet_type: PacketType,
    pub flags: u8,
    pub stream: StreamKey,
}

impl CommonHeader {
    pub fn new(packet_type: PacketType, stream: StreamKey) -> Self {
        CommonHeader {
            version: PROTOCOL_VERSION,
            packet_type,
            flags: 0,
            stream,
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.packet_type as u8);
        buf.put_u8(self.flags);
        buf.put_u8(0);
        let gsi = self.stream.gsi();
        buf.put_u16((gsi >> 32) as u16);
        buf.put_u32(gsi as u32);
        buf.put_u16(self.stream.port());
    }

    /// Decode a header. Returns `None` on short input, a version mismatch, or
    /// an unknown packet type.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < COMMON_HEADER_LEN {
            return None;
        }
        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return None;
        }
        let packet_type = PacketType::from_byte(buf.get_u8())?;
        let flags = buf.get_u8();
        let _reserved = buf.get_u8();
        let gsi_hi = buf.get_u16() as u64;
        let gsi_lo = buf.get_u32() as u64;
        let port = buf.get_u16();
        Some(CommonHeader {
            version,
            packet_type,
            flags,
            stream: StreamKey::new((gsi_hi << 32) | gsi_lo, port),
        })
    }

    pub fn has_options(&self) -> bool {
        self.flags & FLAG_OPTIONS != 0
    }

    pub fn is_retransmit(&self) -> bool {
        self.flags & FLAG_RETRANSMIT != 0
    }
}

// ─── Addresses ───────────────────────────────────────────────────────────────

fn encode_addr(addr: &IpAddr, buf: &mut impl BufMut) {
    match addr {
        IpAddr::V4(v4) => {
            buf.put_u16(ADDR_FAMILY_V4);
            buf.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.put_u16(ADDR_FAMILY_V6);
            buf.put_slice(&v6.octets());
        }
    }
}

fn decode_addr(buf: &mut impl Buf) -> Option<IpAddr> {
    if buf.remaining() < 2 {
        return None;
    }
    match buf.get_u16() {
        ADDR_FAMILY_V4 => {
            if buf.remaining() < 4 {
                return None;
            }
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        ADDR_FAMILY_V6 => {
            if buf.remaining() < 16 {
                return None;
            }
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

// ─── Options ─────────────────────────────────────────────────────────────────

/// Reliability class advertised by a stream's source.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum Reliability {
    /// Gaps are never repaired.
    BestEffort = 0,
    /// Gaps are repaired by NAK-driven retransmission.
    #[default]
    Reliable = 1,
}

impl Reliability {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Reliability::BestEffort),
            1 => Some(Reliability::Reliable),
            _ => None,
        }
    }
}

/// CONTROL option: reliability, liveness and history retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlOption {
    pub reliability: Reliability,
    pub active: bool,
    pub keep_history: bool,
}

impl Default for ControlOption {
    fn default() -> Self {
        ControlOption {
            reliability: Reliability::Reliable,
            active: true,
            keep_history: true,
        }
    }
}

/// MSG_MAP option entry: the message number carried by a sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgMapEntry {
    pub msg_num: u64,
    pub sqn: u32,
}

/// Decoded option block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options {
    /// Additional NAK'd / NCF'd sequence numbers.
    pub nak_list: Vec<u32>,
    /// Late-join marker: first sequence number the receiver should request.
    pub join: Option<u32>,
    /// Topic name advertised by a stream-formation packet.
    pub topic: Option<String>,
    pub control: Option<ControlOption>,
    /// First message number of the stream.
    pub msg_info: Option<u64>,
    pub msg_map: Vec<MsgMapEntry>,
}

impl Options {
    pub fn is_empty(&self) -> bool {
        self.nak_list.is_empty()
            && self.join.is_none()
            && self.topic.is_none()
            && self.control.is_none()
            && self.msg_info.is_none()
            && self.msg_map.is_empty()
    }

    /// Whether these options describe a stream formation (carry a topic).
    pub fn is_formation(&self) -> bool {
        self.topic.is_some()
    }

    fn entries(&self) -> Vec<(u8, BytesMut)> {
        let mut out = Vec::new();
        for chunk in self.nak_list.chunks(MAX_NAK_LIST) {
            let mut body = BytesMut::with_capacity(chunk.len() * 4);
            for sqn in chunk {
                body.put_u32(*sqn);
            }
            out.push((OPT_NAK_LIST, body));
        }
        if let Some(join) = self.join {
            let mut body = BytesMut::with_capacity(4);
            body.put_u32(join);
            out.push((OPT_JOIN, body));
        }
        if let Some(topic) = &self.topic {
            let bytes = topic.as_bytes();
            let len = bytes.len().min(MAX_OPTION_BODY);
            out.push((OPT_CONN_MSG, BytesMut::from(&bytes[..len])));
        }
        if let Some(ctrl) = self.control {
            let mut body = BytesMut::with_capacity(2);
            body.put_u8(ctrl.reliability as u8);
            body.put_u8((ctrl.active as u8) | ((ctrl.keep_history as u8) << 1));
            out.push((OPT_CONTROL, body));
        }
        if let Some(first) = self.msg_info {
            let mut body = BytesMut::with_capacity(8);
            body.put_u64(first);
            out.push((OPT_MSG_INFO, body));
        }
        for entry in &self.msg_map {
            let mut body = BytesMut::with_capacity(12);
            body.put_u64(entry.msg_num);
            body.put_u32(entry.sqn);
            out.push((OPT_MSG_MAP, body));
        }
        out
    }

    /// Encode the option block. Writes nothing when there are no options.
    pub fn encode(&self, buf: &mut BytesMut) {
        let entries = self.entries();
        if entries.is_empty() {
            return;
        }
        let total: usize = 4 + entries.iter().map(|(_, b)| 2 + b.len()).sum::<usize>();
        buf.put_u8(OPT_LENGTH);
        buf.put_u8(4);
        buf.put_u16(total as u16);
        let last = entries.len() - 1;
        for (i, (ty, body)) in entries.into_iter().enumerate() {
            let ty = if i == last { ty | OPT_END } else { ty };
            buf.put_u8(ty);
            buf.put_u8((2 + body.len()) as u8);
            buf.put(body);
        }
    }

    /// Decode an option block. Returns `None` if the block is malformed.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 4 {
            return None;
        }
        if buf.get_u8() != OPT_LENGTH || buf.get_u8() != 4 {
            return None;
        }
        let total = buf.get_u16() as usize;
        if total < 4 || buf.remaining() < total - 4 {
            return None;
        }
        let mut block = buf.copy_to_bytes(total - 4);
        let mut opts = Options::default();
        let mut saw_end = false;
        while block.has_remaining() {
            if block.remaining() < 2 {
                return None;
            }
            let ty = block.get_u8();
            let len = block.get_u8() as usize;
            if len < 2 || block.remaining() < len - 2 {
                return None;
            }
            let mut body = block.copy_to_bytes(len - 2);
            match ty & !OPT_END {
                OPT_NAK_LIST => {
                    if body.len() % 4 != 0 {
                        return None;
                    }
                    while body.has_remaining() {
                        opts.nak_list.push(body.get_u32());
                    }
                }
                OPT_JOIN => {
                    if body.len() != 4 {
                        return None;
                    }
                    opts.join = Some(body.get_u32());
                }
                OPT_CONN_MSG => {
                    opts.topic = Some(String::from_utf8(body.to_vec()).ok()?);
                }
                OPT_CONTROL => {
                    if body.len() != 2 {
                        return None;
                    }
                    let reliability = Reliability::from_byte(body.get_u8())?;
                    let flags = body.get_u8();
                    opts.control = Some(ControlOption {
                        reliability,
                        active: flags & 0x01 != 0,
                        keep_history: flags & 0x02 != 0,
                    });
                }
                OPT_MSG_INFO => {
                    if body.len() != 8 {
                        return None;
                    }
                    opts.msg_info = Some(body.get_u64());
                }
                OPT_MSG_MAP => {
                    if body.len() != 12 {
                        return None;
                    }
                    opts.msg_map.push(MsgMapEntry {
                        msg_num: body.get_u64(),
                        sqn: body.get_u32(),
                    });
                }
                // Unknown options are skipped.
                _ => {}
            }
            if ty & OPT_END != 0 {
                saw_end = true;
                break;
            }
        }
        if saw_end {
            Some(opts)
        } else {
            None
        }
    }
}

// ─── Packet Bodies ───────────────────────────────────────────────────────────

/// Source Path Message: window advertisement and stream formation carrier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpmPacket {
    pub spm_sqn: u32,
    /// Oldest sequence number the transmitter can still retransmit.
    pub trail: u32,
    /// Next sequence number the transmitter will send.
    pub lead: u32,
    pub path: IpAddr,
    pub options: Options,
}

impl SpmPacket {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.spm_sqn);
        buf.put_u32(self.trail);
        buf.put_u32(self.lead);
        encode_addr(&self.path, buf);
        self.options.encode(buf);
    }

    fn decode(buf: &mut impl Buf, has_options: bool) -> Option<Self> {
        if buf.remaining() < 12 {
            return None;
        }
        let spm_sqn = buf.get_u32();
        let trail = buf.get_u32();
        let lead = buf.get_u32();
        let path = decode_addr(buf)?;
        let options = if has_options {
            Options::decode(buf)?
        } else {
            Options::default()
        };
        Some(SpmPacket {
            spm_sqn,
            trail,
            lead,
            path,
            options,
        })
    }
}

/// ODATA / RDATA body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub sqn: u32,
    /// Transmitter's trail at the time of sending.
    pub trail: u32,
    pub payload: Bytes,
}

impl DataPacket {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.sqn);
        buf.put_u32(self.trail);
        buf.extend_from_slice(&self.payload);
    }

    fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 8 {
            return None;
        }
        let sqn = buf.get_u32();
        let trail = buf.get_u32();
        let payload = buf.copy_to_bytes(buf.remaining());
        Some(DataPacket {
            sqn,
            trail,
            payload,
        })
    }
}

/// Borrowed view of an ODATA/RDATA frame body, for parsing in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataView<'a> {
    pub header: CommonHeader,
    pub sqn: u32,
    pub trail: u32,
    pub payload: &'a [u8],
}

impl<'a> DataView<'a> {
    /// Byte offset of the payload within the frame body.
    pub const PAYLOAD_OFFSET: usize = COMMON_HEADER_LEN + 8;

    /// Parse a frame body. `None` unless it is a well-formed ODATA or RDATA.
    pub fn parse(body: &'a [u8]) -> Option<Self> {
        let mut buf = body;
        let header = CommonHeader::decode(&mut buf)?;
        if !matches!(header.packet_type, PacketType::Odata | PacketType::Rdata) {
            return None;
        }
        if buf.remaining() < 8 {
            return None;
        }
        let sqn = buf.get_u32();
        let trail = buf.get_u32();
        Some(DataView {
            header,
            sqn,
            trail,
            payload: &body[Self::PAYLOAD_OFFSET..],
        })
    }
}

/// NAK (receiver → source) or NCF (source → receivers) body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NakPacket {
    pub sqn: u32,
    pub path: IpAddr,
    pub options: Options,
}

impl NakPacket {
    /// Build a NAK for a non-empty list of sequence numbers; the first is the
    /// primary sequence, the rest go into a NAK_LIST option.
    pub fn for_sequences(seqs: &[u32], path: IpAddr) -> Option<Self> {
        let (&first, rest) = seqs.split_first()?;
        Some(NakPacket {
            sqn: first,
            path,
            options: Options {
                nak_list: rest.to_vec(),
                ..Options::default()
            },
        })
    }

    /// All sequence numbers covered: the primary plus the NAK_LIST.
    pub fn sequences(&self) -> impl Iterator<Item = u32> + '_ {
        std::iter::once(self.sqn).chain(self.options.nak_list.iter().copied())
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.sqn);
        encode_addr(&self.path, buf);
        self.options.encode(buf);
    }

    fn decode(buf: &mut impl Buf, has_options: bool) -> Option<Self> {
        if buf.remaining() < 4 {
            return None;
        }
        let sqn = buf.get_u32();
        let path = decode_addr(buf)?;
        let options = if has_options {
            Options::decode(buf)?
        } else {
            Options::default()
        };
        Some(NakPacket { sqn, path, options })
    }
}

/// Connection keepalive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPacket {
    pub sent_at_ms: u64,
}

/// Periodic advertisement of the streams live on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamReportPacket {
    pub streams: Vec<StreamKey>,
}

impl StreamReportPacket {
    /// Sanity limit on advertised streams per report.
    pub const MAX_STREAMS: usize = 8192;

    fn encode(&self, buf: &mut BytesMut) {
        let count = self.streams.len().min(Self::MAX_STREAMS);
        buf.put_u16(count as u16);
        for key in &self.streams[..count] {
            buf.put_u64(key.raw());
        }
    }

    fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 2 {
            return None;
        }
        let count = buf.get_u16() as usize;
        if buf.remaining() < count * 8 {
            return None;
        }
        let streams = (0..count)
            .map(|_| StreamKey::from_raw(buf.get_u64()))
            .collect();
        Some(StreamReportPacket { streams })
    }
}

/// Which leg of the connection formation handshake a CFP packet is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfpLeg {
    Req,
    Rep,
    Ack,
}

impl CfpLeg {
    fn packet_type(self) -> PacketType {
        match self {
            CfpLeg::Req => PacketType::CfpReq,
            CfpLeg::Rep => PacketType::CfpRep,
            CfpLeg::Ack => PacketType::CfpAck,
        }
    }
}

/// Connection formation packet body, identical for all three legs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CfpPacket {
    pub src_port: u16,
    pub dst_port: u16,
    /// Sender of this leg does not emit heartbeats.
    pub one_way: bool,
    pub conn_id: u64,
    pub heartbeat_timeout_ms: u32,
    pub addr: IpAddr,
}

impl CfpPacket {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.src_port);
        buf.put_u16(self.dst_port);
        buf.put_u8(self.one_way as u8);
        buf.put_u64(self.conn_id);
        buf.put_u32(self.heartbeat_timeout_ms);
        encode_addr(&self.addr, buf);
    }

    fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 17 {
            return None;
        }
        let src_port = buf.get_u16();
        let dst_port = buf.get_u16();
        let one_way = buf.get_u8() & 0x01 != 0;
        let conn_id = buf.get_u64();
        let heartbeat_timeout_ms = buf.get_u32();
        let addr = decode_addr(buf)?;
        Some(CfpPacket {
            src_port,
            dst_port,
            one_way,
            conn_id,
            heartbeat_timeout_ms,
            addr,
        })
    }
}

// ─── Full Packet ─────────────────────────────────────────────────────────────

/// Typed packet body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Spm(SpmPacket),
    Odata(DataPacket),
    Rdata(DataPacket),
    Nak(NakPacket),
    Ncf(NakPacket),
    Heartbeat(HeartbeatPacket),
    StreamReport(StreamReportPacket),
    Cfp(CfpLeg, CfpPacket),
}

impl Body {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Body::Spm(_) => PacketType::Spm,
            Body::Odata(_) => PacketType::Odata,
            Body::Rdata(_) => PacketType::Rdata,
            Body::Nak(_) => PacketType::Nak,
            Body::Ncf(_) => PacketType::Ncf,
            Body::Heartbeat(_) => PacketType::Heartbeat,
            Body::StreamReport(_) => PacketType::StreamReport,
            Body::Cfp(leg, _) => leg.packet_type(),
        }
    }

    fn flags(&self) -> u8 {
        match self {
            Body::Spm(spm) if !spm.options.is_empty() => FLAG_OPTIONS,
            Body::Nak(nak) | Body::Ncf(nak) if !nak.options.is_empty() => FLAG_OPTIONS,
            Body::Rdata(_) => FLAG_RETRANSMIT,
            _ => 0,
        }
    }
}

/// A decoded packet: common header plus typed body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: CommonHeader,
    pub body: Body,
}

impl Packet {
    pub fn new(stream: StreamKey, body: Body) -> Self {
        let mut header = CommonHeader::new(body.packet_type(), stream);
        header.flags = body.flags();
        Packet { header, body }
    }

    pub fn odata(stream: StreamKey, sqn: u32, trail: u32, payload: Bytes) -> Self {
        Packet::new(
            stream,
            Body::Odata(DataPacket {
                sqn,
                trail,
                payload,
            }),
        )
    }

    pub fn rdata(stream: StreamKey, sqn: u32, trail: u32, payload: Bytes) -> Self {
        Packet::new(
            stream,
            Body::Rdata(DataPacket {
                sqn,
                trail,
                payload,
            }),
        )
    }

    pub fn spm(stream: StreamKey, spm: SpmPacket) -> Self {
        Packet::new(stream, Body::Spm(spm))
    }

    pub fn heartbeat(sent_at_ms: u64) -> Self {
        Packet::new(StreamKey::NONE, Body::Heartbeat(HeartbeatPacket { sent_at_ms }))
    }

    pub fn stream_report(streams: Vec<StreamKey>) -> Self {
        Packet::new(
            StreamKey::NONE,
            Body::StreamReport(StreamReportPacket { streams }),
        )
    }

    pub fn cfp(leg: CfpLeg, cfp: CfpPacket) -> Self {
        Packet::new(StreamKey::NONE, Body::Cfp(leg, cfp))
    }

    /// Serialize header + body (without the frame length prefix).
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(COMMON_HEADER_LEN + 64);
        self.header.encode(&mut buf);
        match &self.body {
            Body::Spm(spm) => spm.encode(&mut buf),
            Body::Odata(data) | Body::Rdata(data) => data.encode(&mut buf),
            Body::Nak(nak) | Body::Ncf(nak) => nak.encode(&mut buf),
            Body::Heartbeat(hb) => buf.put_u64(hb.sent_at_ms),
            Body::StreamReport(report) => report.encode(&mut buf),
            Body::Cfp(_, cfp) => cfp.encode(&mut buf),
        }
        buf
    }

    /// Serialize as a complete frame: `[u32 length][body]`.
    pub fn encode_frame(&self) -> BytesMut {
        let body = self.encode();
        let mut frame = BytesMut::with_capacity(FRAME_PREFIX_LEN + body.len());
        frame.put_u32(body.len() as u32);
        frame.extend_from_slice(&body);
        frame
    }

    /// Decode a frame body. Returns `None` for malformed input.
    pub fn decode(data: &mut impl Buf) -> Option<Self> {
        let header = CommonHeader::decode(data)?;
        let opts = header.has_options();
        let body = match header.packet_type {
            PacketType::Spm => Body::Spm(SpmPacket::decode(data, opts)?),
            PacketType::Odata => Body::Odata(DataPacket::decode(data)?),
            PacketType::Rdata => Body::Rdata(DataPacket::decode(data)?),
            PacketType::Nak => Body::Nak(NakPacket::decode(data, opts)?),
            PacketType::Ncf => Body::Ncf(NakPacket::decode(data, opts)?),
            PacketType::Heartbeat => {
                if data.remaining() < 8 {
                    return None;
                }
                Body::Heartbeat(HeartbeatPacket {
                    sent_at_ms: data.get_u64(),
                })
            }
            PacketType::StreamReport => Body::StreamReport(StreamReportPacket::decode(data)?),
            PacketType::CfpReq => Body::Cfp(CfpLeg::Req, CfpPacket::decode(data)?),
            PacketType::CfpRep => Body::Cfp(CfpLeg::Rep, CfpPacket::decode(data)?),
            PacketType::CfpAck => Body::Cfp(CfpLeg::Ack, CfpPacket::decode(data)?),
        };
        Some(Packet { header, body })
    }

    /// Peek the packet type of an encoded body without decoding it.
    pub fn peek_type(data: &[u8]) -> Option<PacketType> {
        if data.len() < COMMON_HEADER_LEN || data[0] != PROTOCOL_VERSION {
            return None;
        }
        PacketType::from_byte(data[1])
    }
}
