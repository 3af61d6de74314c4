//! Incremental `[u32 length][body]` frame extraction.

use bytes::{Buf, Bytes, BytesMut};
use std::io::{self, Read};
use thiserror::Error;

use crate::wire::{COMMON_HEADER_LEN, FRAME_PREFIX_LEN};

/// Default upper bound on a frame body.
pub const DEFAULT_MAX_FRAME_LEN: usize = 65_600;

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame length {len} exceeds limit {max}")]
    TooLong { len: usize, max: usize },
    #[error("frame length {0} shorter than the common header")]
    TooShort(usize),
}

/// Accumulates bytes from a connection and yields whole frame bodies.
#[derive(Debug)]
pub struct FrameReader {
    buf: BytesMut,
    max_frame_len: usize,
}

impl FrameReader {
    pub fn new(max_frame_len: usize) -> Self {
        FrameReader {
            buf: BytesMut::with_capacity(READ_CHUNK),
            max_frame_len,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// One `read` call into the buffer. `Ok(0)` means EOF; `WouldBlock`
    /// passes through.
    pub fn read_from(&mut self, src: &mut impl Read) -> io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = src.read(&mut chunk)?;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Next complete frame body, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, FrameError> {
        if self.buf.len() < FRAME_PREFIX_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > self.max_frame_len {
            return Err(FrameError::TooLong {
                len,
                max: self.max_frame_len,
            });
        }
        if len < COMMON_HEADER_LEN {
            return Err(FrameError::TooShort(len));
        }
        if self.buf.len() < FRAME_PREFIX_LEN + len {
            return Ok(None);
        }
        self.buf.advance(FRAME_PREFIX_LEN);
        Ok(Some(self.buf.split_to(len).freeze()))
    }

    /// Bytes held that do not yet form a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}
