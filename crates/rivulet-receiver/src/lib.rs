//! # rivulet-receiver
//!
//! Threaded receive side of the Rivulet transport. Sources connect (or are
//! connected to) over TCP, complete the CFP handshake, and multiplex many
//! ordered data streams over each connection. The receiver admits streams
//! into application queues, requests missing packets with NAKs, and
//! delivers data strictly in sequence order through [`QueueCallbacks`].
//!
//! ## Threads
//!
//! - connection handler: accepts, connects, drives handshakes, flushes output
//! - packet processors: wait on socket readiness, store data, apply SPMs
//! - announcers: in-order delivery, fragment reassembly
//! - NAK generator: gap scanning and NAK transmission
//! - timer: heartbeats, liveness, stream reports, expiry, stats
//! - event announcer: serialized delivery of [`Event`]s
//!
//! ```no_run
//! use rivulet_receiver::{DeliveryMode, MatchRule, Message, QueueCallbacks, Receiver, ReceiverConfig};
//! use std::sync::Arc;
//!
//! struct Print;
//! impl QueueCallbacks for Print {
//!     fn on_message(&self, msg: &Message) {
//!         println!("{} #{}: {} bytes", msg.stream, msg.seq, msg.data.len());
//!     }
//! }
//!
//! let rx = Receiver::new(ReceiverConfig::default())?;
//! rx.create_queue(MatchRule::name("prices"), DeliveryMode::Message, Arc::new(Print))?;
//! rx.listen("0.0.0.0:7400")?;
//! # Ok::<(), rivulet_receiver::ReceiverError>(())
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod queue;

mod announcer;
mod context;
mod handler;
mod lifecycle;
mod nak_gen;
mod pipeline;
mod poller;
mod receiver;
mod stream;
mod timer;

pub use config::{ReceiverConfig, UnrecoverableAction};
pub use connection::{ConnectionId, TlsFactory, TlsStep};
pub use error::{ReceiverError, Result};
pub use event::{BreakReason, Event, RejectReason};
pub use queue::{
    DeliveredPacket, DeliveryMode, MatchRule, Message, QueueCallbacks, QueueHandle, StreamInfo,
};
pub use receiver::Receiver;
pub use rivulet_transport::stats::{ReceiverStats, StreamStats};
pub use rivulet_transport::wire::{Reliability, StreamKey};
