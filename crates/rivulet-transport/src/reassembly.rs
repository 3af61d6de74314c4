//! # Data Payloads and Fragment Reassembly
//!
//! ODATA/RDATA payloads carry a small preamble followed by one record:
//!
//! ```text
//! u8 version (= 1)
//! u8 header length (offset of the record, >= 2)
//! ── record at offset ──
//! kind 0 (messages):  u8 0, { u32 len, len bytes }*
//! kind 1 (fragment):  u8 1, u32 msg id, u32 total len, u32 offset, bytes
//! ```
//!
//! Messages larger than one packet travel as fragments. [`FragmentTable`]
//! collects them by message id, copying each piece to its offset, and yields
//! the message once every byte has arrived. Pieces may arrive in any order.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use thiserror::Error;

/// Version byte of the payload preamble.
pub const PAYLOAD_VERSION: u8 = 1;
/// Preamble length written by [`encode_messages`] / [`encode_fragment`].
pub const PAYLOAD_HEADER_LEN: u8 = 2;

const KIND_MESSAGES: u8 = 0;
const KIND_FRAGMENT: u8 = 1;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("payload too short ({0} bytes)")]
    Truncated(usize),
    #[error("payload version {found}, expected {expected}")]
    Version { found: u8, expected: u8 },
    #[error("payload header length {0} out of range")]
    HeaderLen(u8),
    #[error("payload header length changed from {expected} to {found}")]
    OffsetChanged { expected: u8, found: u8 },
    #[error("unknown payload record kind {0}")]
    Kind(u8),
    #[error("malformed message record")]
    Record,
    #[error("fragment {offset}+{len} exceeds message length {total}")]
    FragmentBounds { offset: u32, len: usize, total: u32 },
    #[error("fragmented message of {0} bytes exceeds limit")]
    TooLarge(u32),
}

// ─── Payload Codec ───────────────────────────────────────────────────────────

/// Validate the payload preamble and return the record offset.
pub fn preamble(payload: &[u8]) -> Result<u8, PayloadError> {
    if payload.len() < 2 {
        return Err(PayloadError::Truncated(payload.len()));
    }
    if payload[0] != PAYLOAD_VERSION {
        return Err(PayloadError::Version {
            found: payload[0],
            expected: PAYLOAD_VERSION,
        });
    }
    let offset = payload[1];
    if offset < 2 || offset as usize > payload.len() {
        return Err(PayloadError::HeaderLen(offset));
    }
    Ok(offset)
}

/// One piece of a fragmented message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentPiece {
    pub msg_id: u32,
    pub total_len: u32,
    pub offset: u32,
    pub data: Bytes,
}

/// Decoded payload record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Messages(Vec<Bytes>),
    Fragment(FragmentPiece),
}

impl Record {
    /// Parse the record that starts at `offset`.
    pub fn parse(payload: &Bytes, offset: u8) -> Result<Record, PayloadError> {
        let mut buf = payload.slice(offset as usize..);
        if !buf.has_remaining() {
            return Err(PayloadError::Truncated(payload.len()));
        }
        match buf.get_u8() {
            KIND_MESSAGES => {
                let mut msgs = Vec::new();
                while buf.has_remaining() {
                    if buf.remaining() < 4 {
                        return Err(PayloadError::Record);
                    }
                    let len = buf.get_u32() as usize;
                    if buf.remaining() < len {
                        return Err(PayloadError::Record);
                    }
                    msgs.push(buf.split_to(len));
                }
                Ok(Record::Messages(msgs))
            }
            KIND_FRAGMENT => {
                if buf.remaining() < 12 {
                    return Err(PayloadError::Record);
                }
                let msg_id = buf.get_u32();
                let total_len = buf.get_u32();
                let offset = buf.get_u32();
                let data = buf;
                if offset as u64 + data.len() as u64 > total_len as u64 {
                    return Err(PayloadError::FragmentBounds {
                        offset,
                        len: data.len(),
                        total: total_len,
                    });
                }
                Ok(Record::Fragment(FragmentPiece {
                    msg_id,
                    total_len,
                    offset,
                    data,
                }))
            }
            other => Err(PayloadError::Kind(other)),
        }
    }
}

fn put_preamble(buf: &mut BytesMut) {
    buf.put_u8(PAYLOAD_VERSION);
    buf.put_u8(PAYLOAD_HEADER_LEN);
}

/// Encode one or more complete messages into a payload.
pub fn encode_messages<M: AsRef<[u8]>>(msgs: &[M]) -> Bytes {
    let size = 3 + msgs.iter().map(|m| 4 + m.as_ref().len()).sum::<usize>();
    let mut buf = BytesMut::with_capacity(size);
    put_preamble(&mut buf);
    buf.put_u8(KIND_MESSAGES);
    for m in msgs {
        let m = m.as_ref();
        buf.put_u32(m.len() as u32);
        buf.extend_from_slice(m);
    }
    buf.freeze()
}

/// Encode one fragment piece into a payload.
pub fn encode_fragment(msg_id: u32, total_len: u32, offset: u32, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(15 + data.len());
    put_preamble(&mut buf);
    buf.put_u8(KIND_FRAGMENT);
    buf.put_u32(msg_id);
    buf.put_u32(total_len);
    buf.put_u32(offset);
    buf.extend_from_slice(data);
    buf.freeze()
}

/// Split `msg` into fragment payloads of at most `chunk` data bytes each.
pub fn fragment_message(msg_id: u32, msg: &[u8], chunk: usize) -> Vec<Bytes> {
    let chunk = chunk.max(1);
    let total = msg.len() as u32;
    if msg.is_empty() {
        return vec![encode_fragment(msg_id, 0, 0, &[])];
    }
    msg.chunks(chunk)
        .enumerate()
        .map(|(i, piece)| encode_fragment(msg_id, total, (i * chunk) as u32, piece))
        .collect()
}

// ─── Fragment Table ──────────────────────────────────────────────────────────

#[derive(Debug)]
struct FragmentRecord {
    data: BytesMut,
    total_len: u32,
    /// Byte ranges already copied, merged, as start → end.
    covered: BTreeMap<u32, u32>,
    received: u64,
    /// Sequence number of the first piece seen; used for aging.
    first_seq: u64,
}

/// A message completed by [`FragmentTable::insert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assembled {
    pub msg_id: u32,
    pub first_seq: u64,
    pub data: Bytes,
}

/// In-progress fragmented messages for one stream.
#[derive(Debug)]
pub struct FragmentTable {
    records: BTreeMap<u32, FragmentRecord>,
    max_message_len: u32,
}

impl FragmentTable {
    pub fn new(max_message_len: u32) -> Self {
        FragmentTable {
            records: BTreeMap::new(),
            max_message_len,
        }
    }

    /// Add a piece carried by the packet at `seq`. Returns the message when
    /// this piece completes it. Bytes already received are kept; only the
    /// uncovered part of an overlapping piece is copied and counted.
    pub fn insert(
        &mut self,
        seq: u64,
        piece: FragmentPiece,
    ) -> Result<Option<Assembled>, PayloadError> {
        if piece.total_len > self.max_message_len {
            return Err(PayloadError::TooLarge(piece.total_len));
        }
        if piece.offset as u64 + piece.data.len() as u64 > piece.total_len as u64 {
            return Err(PayloadError::FragmentBounds {
                offset: piece.offset,
                len: piece.data.len(),
                total: piece.total_len,
            });
        }
        let record = self
            .records
            .entry(piece.msg_id)
            .or_insert_with(|| FragmentRecord {
                data: BytesMut::zeroed(piece.total_len as usize),
                total_len: piece.total_len,
                covered: BTreeMap::new(),
                received: 0,
                first_seq: seq,
            });
        if record.total_len != piece.total_len {
            return Err(PayloadError::FragmentBounds {
                offset: piece.offset,
                len: piece.data.len(),
                total: record.total_len,
            });
        }
        record.first_seq = record.first_seq.min(seq);
        let start = piece.offset;
        let end = start + piece.data.len() as u32;
        for (lo, hi) in cover(&mut record.covered, start, end) {
            let src = (lo - start) as usize..(hi - start) as usize;
            record.data[lo as usize..hi as usize].copy_from_slice(&piece.data[src]);
            record.received += (hi - lo) as u64;
        }
        if record.received < record.total_len as u64 {
            return Ok(None);
        }
        match self.records.remove(&piece.msg_id) {
            Some(done) => Ok(Some(Assembled {
                msg_id: piece.msg_id,
                first_seq: done.first_seq,
                data: done.data.freeze(),
            })),
            None => Ok(None),
        }
    }

    /// Discard records whose first piece is older than `threshold`. Returns
    /// the number discarded.
    pub fn expire_before(&mut self, threshold: u64) -> usize {
        let before = self.records.len();
        self.records.retain(|_, r| r.first_seq >= threshold);
        before - self.records.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

/// Merge `[start, end)` into `covered` and return the sub-ranges that were
/// not covered before, in ascending order.
fn cover(covered: &mut BTreeMap<u32, u32>, start: u32, end: u32) -> Vec<(u32, u32)> {
    let touching: Vec<(u32, u32)> = covered
        .range(..=end)
        .filter(|&(_, &e)| e >= start)
        .map(|(&s, &e)| (s, e))
        .collect();
    let mut gaps = Vec::new();
    let (mut lo, mut hi, mut cursor) = (start, end, start);
    for (s, e) in touching {
        if s > cursor {
            gaps.push((cursor, s));
        }
        cursor = cursor.max(e);
        lo = lo.min(s);
        hi = hi.max(e);
        covered.remove(&s);
    }
    if cursor < end {
        gaps.push((cursor, end));
    }
    covered.insert(lo, hi);
    gaps
}
