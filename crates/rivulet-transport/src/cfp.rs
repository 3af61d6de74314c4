//! # Connection Formation Protocol
//!
//! Three-leg handshake that gives a byte-stream connection its identity and
//! heartbeat parameters. An optional TLS step runs first.
//!
//! ```text
//!  initiator                                   acceptor
//!  ─────────                                   ────────
//!  [Tls] ─▶ SendReq ──── CFP REQ ───────────▶ [Tls] ─▶ WaitReq
//!           WaitRep ◀─── CFP REP ──────────── SendRep
//!           SendAck ──── CFP ACK ───────────▶ WaitAck
//!         Established                         Established
//! ```
//!
//! Any unexpected leg, connection-id mismatch or timeout moves the handshake
//! to `Failed`; the owner tears the connection down.

use quanta::Instant;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

use crate::wire::{CfpLeg, CfpPacket};

// ─── State ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfpRole {
    Initiator,
    Acceptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// TLS step in progress.
    Tls,
    SendReq,
    WaitRep,
    SendAck,
    WaitReq,
    SendRep,
    WaitAck,
    Established,
    Failed,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CfpError {
    #[error("unexpected CFP {leg:?} in state {state:?}")]
    UnexpectedLeg { state: HandshakeState, leg: CfpLeg },
    #[error("connection id mismatch: expected {expected:#x}, got {got:#x}")]
    ConnIdMismatch { expected: u64, got: u64 },
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
    #[error("handshake already failed")]
    Failed,
}

/// Parameters this side advertises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalParams {
    pub port: u16,
    pub peer_port: u16,
    pub heartbeat_timeout: Duration,
    /// This side never emits heartbeats.
    pub one_way: bool,
    pub addr: IpAddr,
}

/// Parameters learned from the peer's leg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerParams {
    pub port: u16,
    pub heartbeat_timeout: Duration,
    pub one_way: bool,
    pub addr: IpAddr,
}

// ─── Handshake ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Handshake {
    role: CfpRole,
    state: HandshakeState,
    local: LocalParams,
    peer: Option<PeerParams>,
    conn_id: u64,
    started: Instant,
    timeout: Duration,
}

impl Handshake {
    /// Initiator with a locally chosen connection id.
    pub fn initiator(local: LocalParams, conn_id: u64, tls: bool, timeout: Duration) -> Self {
        Handshake {
            role: CfpRole::Initiator,
            state: if tls {
                HandshakeState::Tls
            } else {
                HandshakeState::SendReq
            },
            local,
            peer: None,
            conn_id,
            started: Instant::now(),
            timeout,
        }
    }

    /// Acceptor; adopts the connection id carried by the peer's REQ.
    pub fn acceptor(local: LocalParams, tls: bool, timeout: Duration) -> Self {
        Handshake {
            role: CfpRole::Acceptor,
            state: if tls {
                HandshakeState::Tls
            } else {
                HandshakeState::WaitReq
            },
            local,
            peer: None,
            conn_id: 0,
            started: Instant::now(),
            timeout,
        }
    }

    pub fn role(&self) -> CfpRole {
        self.role
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn peer(&self) -> Option<&PeerParams> {
        self.peer.as_ref()
    }

    pub fn is_established(&self) -> bool {
        self.state == HandshakeState::Established
    }

    pub fn is_failed(&self) -> bool {
        self.state == HandshakeState::Failed
    }

    /// The TLS step finished; move on to the first CFP state.
    pub fn tls_complete(&mut self) {
        if self.state == HandshakeState::Tls {
            self.state = match self.role {
                CfpRole::Initiator => HandshakeState::SendReq,
                CfpRole::Acceptor => HandshakeState::WaitReq,
            };
        }
    }

    /// Mark the handshake failed (socket error, EOF, TLS failure).
    pub fn fail(&mut self) {
        self.state = HandshakeState::Failed;
    }

    fn make_leg(&self) -> CfpPacket {
        CfpPacket {
            src_port: self.local.port,
            dst_port: self.local.peer_port,
            one_way: self.local.one_way,
            conn_id: self.conn_id,
            heartbeat_timeout_ms: self.local.heartbeat_timeout.as_millis().min(u32::MAX as u128)
                as u32,
            addr: self.local.addr,
        }
    }

    /// Leg to transmit now, if any. Advances past the send state.
    pub fn poll_transmit(&mut self) -> Option<(CfpLeg, CfpPacket)> {
        let (leg, next) = match self.state {
            HandshakeState::SendReq => (CfpLeg::Req, HandshakeState::WaitRep),
            HandshakeState::SendRep => (CfpLeg::Rep, HandshakeState::WaitAck),
            HandshakeState::SendAck => (CfpLeg::Ack, HandshakeState::Established),
            _ => return None,
        };
        let pkt = self.make_leg();
        self.state = next;
        Some((leg, pkt))
    }

    /// Process an inbound leg.
    pub fn handle(&mut self, leg: CfpLeg, pkt: &CfpPacket) -> Result<(), CfpError> {
        let before = self.state;
        let result = self.handle_inner(leg, pkt);
        if result.is_err() {
            self.state = HandshakeState::Failed;
        }
        trace!(role = ?self.role, ?leg, from = ?before, to = ?self.state, "CFP leg");
        result
    }

    fn handle_inner(&mut self, leg: CfpLeg, pkt: &CfpPacket) -> Result<(), CfpError> {
        match (self.state, leg) {
            (HandshakeState::Failed, _) => Err(CfpError::Failed),
            (HandshakeState::WaitReq, CfpLeg::Req) => {
                self.conn_id = pkt.conn_id;
                self.record_peer(pkt);
                self.state = HandshakeState::SendRep;
                Ok(())
            }
            (HandshakeState::WaitRep, CfpLeg::Rep) => {
                self.check_id(pkt)?;
                self.record_peer(pkt);
                self.state = HandshakeState::SendAck;
                Ok(())
            }
            (HandshakeState::WaitAck, CfpLeg::Ack) => {
                self.check_id(pkt)?;
                self.state = HandshakeState::Established;
                Ok(())
            }
            (state, leg) => Err(CfpError::UnexpectedLeg { state, leg }),
        }
    }

    fn check_id(&self, pkt: &CfpPacket) -> Result<(), CfpError> {
        if pkt.conn_id != self.conn_id {
            return Err(CfpError::ConnIdMismatch {
                expected: self.conn_id,
                got: pkt.conn_id,
            });
        }
        Ok(())
    }

    fn record_peer(&mut self, pkt: &CfpPacket) {
        self.peer = Some(PeerParams {
            port: pkt.src_port,
            heartbeat_timeout: Duration::from_millis(pkt.heartbeat_timeout_ms as u64),
            one_way: pkt.one_way,
            addr: pkt.addr,
        });
    }

    /// Fail the handshake if it has been running longer than its timeout.
    pub fn check_timeout(&mut self, now: Instant) -> Result<(), CfpError> {
        if matches!(
            self.state,
            HandshakeState::Established | HandshakeState::Failed
        ) {
            return Ok(());
        }
        if now.saturating_duration_since(self.started) >= self.timeout {
            self.state = HandshakeState::Failed;
            return Err(CfpError::Timeout(self.timeout));
        }
        Ok(())
    }

    /// Liveness timeout for the established connection: the smaller of the
    /// two advertised values (a zero advertisement is ignored).
    pub fn heartbeat_timeout(&self) -> Duration {
        let local = self.local.heartbeat_timeout;
        match &self.peer {
            Some(p) if !p.heartbeat_timeout.is_zero() => local.min(p.heartbeat_timeout),
            _ => local,
        }
    }

    /// Whether we should send heartbeats on the established connection.
    pub fn sends_heartbeats(&self) -> bool {
        !self.local.one_way
    }

    /// Whether the peer is expected to send heartbeats.
    pub fn expects_heartbeats(&self) -> bool {
        self.peer.as_ref().is_some_and(|p| !p.one_way)
    }
}
