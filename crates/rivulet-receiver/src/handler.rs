//! Connection handler thread.
//!
//! Owns the listening sockets and every connection that has not finished
//! its handshake. Pending connections are driven through the optional TLS
//! step and the three CFP legs; established ones are promoted into the
//! shared ready table and registered with the processors' poll. The
//! handler also flushes buffered output for every ready connection.
//!
//! Between passes the handler blocks on its own poll, which watches the
//! listeners and pending sockets and is woken by commands, by output queued
//! on an idle connection and by shutdown.

use bytes::BytesMut;
use crossbeam_channel::Receiver;
use mio::{Events, Interest, Poll, Registry, Token};
use parking_lot::RwLockUpgradableReadGuard;
use quanta::Instant;
use rivulet_transport::cfp::{CfpRole, Handshake, HandshakeState, LocalParams};
use rivulet_transport::framing::FrameReader;
use rivulet_transport::stats::bump;
use rivulet_transport::wire::{Body, Packet};
use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::connection::{break_connection, Connection, ConnectionId, ConnectionParts, TlsStep};
use crate::context::{HandlerCmd, Shared};
use crate::event::Event;
use crate::poller::{deregister, register};

const LISTENER: Token = Token(0);
const PENDING: Token = Token(1);
/// Longest wait between passes. Bounds handshake timeout checks and retries
/// of output the socket would not take.
const TICK: Duration = Duration::from_millis(20);

struct Pending {
    socket: TcpStream,
    peer: SocketAddr,
    local: SocketAddr,
    reader: FrameReader,
    outbound: BytesMut,
    handshake: Handshake,
    tls: Option<Box<dyn TlsStep>>,
}

enum Progress {
    Waiting,
    Established,
    Failed(String),
}

pub(crate) fn run_handler(shared: Arc<Shared>, rx: Receiver<HandlerCmd>, mut poll: Poll) {
    debug!("connection handler started");
    let mut events = Events::with_capacity(64);
    let mut listeners: Vec<TcpListener> = Vec::new();
    let mut pending: Vec<Pending> = Vec::new();

    while !shared.is_shutdown() {
        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                HandlerCmd::Listen(listener) => {
                    match register(poll.registry(), &listener, LISTENER, Interest::READABLE) {
                        Ok(()) => listeners.push(listener),
                        Err(e) => warn!(error = %e, "cannot watch listener"),
                    }
                }
                HandlerCmd::Connect(socket, peer) => {
                    if let Some(p) = initiate(&shared, &pending, socket, peer) {
                        watch(&shared, poll.registry(), p, &mut pending);
                    }
                }
            }
        }

        for listener in &listeners {
            accept_all(&shared, poll.registry(), listener, &mut pending);
        }

        let mut i = 0;
        while i < pending.len() {
            match drive(&mut pending[i]) {
                Progress::Waiting => i += 1,
                Progress::Established => {
                    let p = pending.swap_remove(i);
                    unwatch(poll.registry(), &p);
                    promote(&shared, p);
                }
                Progress::Failed(reason) => {
                    let p = pending.swap_remove(i);
                    unwatch(poll.registry(), &p);
                    establish_failed(&shared, p.peer, &reason);
                }
            }
        }

        flush_ready(&shared);
        match poll.poll(&mut events, Some(TICK)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                warn!(error = %e, "handler poll failed");
                if !shared.sleep(TICK) {
                    break;
                }
            }
        }
    }

    for p in pending {
        debug!(peer = %p.peer, "abandoning handshake at shutdown");
    }
    debug!("connection handler stopped");
}

fn local_params(shared: &Shared, local: SocketAddr, peer: SocketAddr) -> LocalParams {
    LocalParams {
        port: local.port(),
        peer_port: peer.port(),
        heartbeat_timeout: shared.config.connection.heartbeat_timeout,
        one_way: shared.config.connection.one_way,
        addr: local.ip(),
    }
}

fn new_pending(
    shared: &Shared,
    socket: TcpStream,
    peer: SocketAddr,
    role: CfpRole,
    conn_id: u64,
) -> io::Result<Pending> {
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;
    let local = socket.local_addr()?;
    let params = local_params(shared, local, peer);
    let timeout = shared.config.connection.handshake_timeout;
    let tls = shared.tls.as_ref().map(|factory| factory(role));
    let handshake = match role {
        CfpRole::Initiator => Handshake::initiator(params, conn_id, tls.is_some(), timeout),
        CfpRole::Acceptor => Handshake::acceptor(params, tls.is_some(), timeout),
    };
    Ok(Pending {
        socket,
        peer,
        local,
        reader: FrameReader::new(shared.config.connection.max_frame_len),
        outbound: BytesMut::new(),
        handshake,
        tls,
    })
}

fn initiate(
    shared: &Shared,
    pending: &[Pending],
    socket: TcpStream,
    peer: SocketAddr,
) -> Option<Pending> {
    let id = {
        let ready = shared.ready.read();
        shared.ids.next(|id| {
            ready.contains_key(&id) || pending.iter().any(|p| p.handshake.conn_id() == id.0)
        })
    };
    let Some(id) = id else {
        establish_failed(shared, peer, "connection ids exhausted");
        return None;
    };
    match new_pending(shared, socket, peer, CfpRole::Initiator, id.0) {
        Ok(p) => {
            debug!(conn = %id, %peer, "initiating handshake");
            Some(p)
        }
        Err(e) => {
            establish_failed(shared, peer, &format!("socket setup: {e}"));
            None
        }
    }
}

/// Start watching a pending socket, or fail it if it cannot be watched.
fn watch(shared: &Shared, registry: &Registry, p: Pending, pending: &mut Vec<Pending>) {
    let interest = Interest::READABLE | Interest::WRITABLE;
    match register(registry, &p.socket, PENDING, interest) {
        Ok(()) => pending.push(p),
        Err(e) => establish_failed(shared, p.peer, &format!("poll registration: {e}")),
    }
}

fn unwatch(registry: &Registry, p: &Pending) {
    if let Err(e) = deregister(registry, &p.socket) {
        debug!(peer = %p.peer, error = %e, "deregister failed");
    }
}

fn accept_all(
    shared: &Shared,
    registry: &Registry,
    listener: &TcpListener,
    pending: &mut Vec<Pending>,
) {
    loop {
        match listener.accept() {
            Ok((socket, peer)) => {
                let total = shared.ready.read().len() + pending.len();
                if total >= shared.config.limits.max_connections {
                    warn!(%peer, limit = shared.config.limits.max_connections, "connection limit reached, refusing");
                    drop(socket);
                    establish_failed(shared, peer, "connection limit reached");
                    continue;
                }
                match new_pending(shared, socket, peer, CfpRole::Acceptor, 0) {
                    Ok(p) => {
                        debug!(%peer, "accepted connection");
                        watch(shared, registry, p, pending);
                    }
                    Err(e) => establish_failed(shared, peer, &format!("socket setup: {e}")),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "accept failed");
                return;
            }
        }
    }
}

// ─── Handshake Driving ───────────────────────────────────────────────────────

fn drive(p: &mut Pending) -> Progress {
    match step(p) {
        Ok(()) if p.handshake.is_established() => Progress::Established,
        Ok(()) => Progress::Waiting,
        Err(reason) => {
            p.handshake.fail();
            Progress::Failed(reason)
        }
    }
}

fn step(p: &mut Pending) -> Result<(), String> {
    p.handshake
        .check_timeout(Instant::now())
        .map_err(|e| e.to_string())?;

    if let Some(tls) = p.tls.as_mut() {
        if p.handshake.state() == HandshakeState::Tls {
            let done = tls.poll(&mut p.socket).map_err(|e| format!("tls: {e}"))?;
            if !done {
                return Ok(());
            }
            p.handshake.tls_complete();
        }
    }

    transmit(p);
    flush_pending(p)?;
    if p.handshake.is_established() {
        return Ok(());
    }

    loop {
        match p.reader.read_from(&mut p.socket) {
            Ok(0) => return Err("closed during handshake".into()),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(format!("read: {e}")),
        }
    }

    while !p.handshake.is_established() {
        let frame = match p.reader.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => return Err(e.to_string()),
        };
        let mut body = frame;
        match Packet::decode(&mut body) {
            Some(Packet {
                body: Body::Cfp(leg, pkt),
                ..
            }) => {
                p.handshake.handle(leg, &pkt).map_err(|e| e.to_string())?;
                transmit(p);
            }
            Some(other) => {
                return Err(format!(
                    "{:?} before handshake completed",
                    other.header.packet_type
                ))
            }
            None => return Err("malformed handshake frame".into()),
        }
    }
    flush_pending(p)
}

fn transmit(p: &mut Pending) {
    while let Some((leg, pkt)) = p.handshake.poll_transmit() {
        p.outbound
            .extend_from_slice(&Packet::cfp(leg, pkt).encode_frame());
    }
}

fn flush_pending(p: &mut Pending) -> Result<(), String> {
    while !p.outbound.is_empty() {
        match p.socket.write(&p.outbound) {
            Ok(0) => return Err("socket closed".into()),
            Ok(n) => {
                let _ = p.outbound.split_to(n);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(format!("write: {e}")),
        }
    }
    Ok(())
}

// ─── Promotion ───────────────────────────────────────────────────────────────

fn promote(shared: &Shared, p: Pending) {
    let id = ConnectionId(p.handshake.conn_id());
    let peer = p.peer;
    let sends = p.handshake.sends_heartbeats() && p.handshake.expects_heartbeats();
    let token = Token(shared.tokens.lock().insert(id));
    let conn = Arc::new(Connection::new(ConnectionParts {
        id,
        peer,
        local: p.local,
        socket: p.socket,
        token,
        reader: p.reader,
        outbound: p.outbound,
        flush_waker: Arc::clone(&shared.handler_waker),
        heartbeat_timeout: p.handshake.heartbeat_timeout(),
        sends_heartbeats: sends,
        expects_heartbeats: p.handshake.expects_heartbeats(),
    }));

    {
        let ready = shared.ready.upgradable_read();
        if ready.contains_key(&id) {
            drop(ready);
            shared.tokens.lock().remove(token.0);
            conn.close();
            establish_failed(shared, peer, &format!("connection id {id} already in use"));
            return;
        }
        if ready.len() >= shared.config.limits.max_connections {
            drop(ready);
            shared.tokens.lock().remove(token.0);
            conn.close();
            establish_failed(shared, peer, "connection limit reached");
            return;
        }
        let mut ready = RwLockUpgradableReadGuard::upgrade(ready);
        ready.insert(id, Arc::clone(&conn));
    }

    if let Err(e) = register(&shared.registry, conn.socket(), token, Interest::READABLE) {
        break_connection(shared, &conn, &format!("poll registration: {e}"));
        return;
    }
    shared.promoted.lock().push(id);

    bump(&shared.counters.connections_established, 1);
    info!(
        conn = %id,
        %peer,
        heartbeat_timeout = ?conn.heartbeat_timeout,
        sends_heartbeats = conn.sends_heartbeats,
        "connection established"
    );
    shared
        .events
        .broadcast(Event::ConnectionEstablished { conn: id, peer });
}

fn establish_failed(shared: &Shared, peer: SocketAddr, reason: &str) {
    bump(&shared.counters.connections_failed, 1);
    info!(%peer, reason, "connection failed");
    shared.events.broadcast(Event::EstablishFailed {
        peer,
        reason: reason.to_string(),
    });
}

fn flush_ready(shared: &Shared) {
    for conn in shared.ready_connections() {
        if conn.pending_out() == 0 {
            continue;
        }
        if let Err(e) = conn.flush() {
            break_connection(shared, &conn, &format!("write error: {e}"));
        }
    }
}
