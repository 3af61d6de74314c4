//! # rivulet-transport
//!
//! Protocol logic for the Rivulet receiver: a PGM-style, NAK-based reliable
//! transport multiplexing many ordered streams over byte-stream connections.
//!
//! Everything here is single-threaded and socket-free. The threaded runtime
//! lives in `rivulet-receiver`.
//!
//! ## Crate structure
//!
//! - [`wire`]: Framing, common header, packet bodies, TLV options
//! - [`framing`]: Incremental frame extraction from a byte stream
//! - [`sorted_q`]: Sequence-addressed ring buffer with per-slot flags
//! - [`pool`]: Fixed-capacity object pools with watermark alerts
//! - [`nak`]: NAK element state machine and gap scanner
//! - [`cfp`]: Connection formation handshake
//! - [`reassembly`]: Data payload records and fragment reassembly
//! - [`stats`]: Receiver and per-stream statistics

pub mod cfp;
pub mod framing;
pub mod nak;
pub mod pool;
pub mod reassembly;
pub mod sorted_q;
pub mod stats;
pub mod wire;
