use crossbeam_channel::{unbounded, Receiver as ChannelRx, Sender};
use parking_lot::Mutex;
use rivulet_transport::stats::{ReceiverStats, StreamStats};
use rivulet_transport::wire::StreamKey;
use std::collections::HashSet;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::announcer::run_announcer;
use crate::config::ReceiverConfig;
use crate::connection::TlsFactory;
use crate::context::{HandlerCmd, Shared};
use crate::error::{ReceiverError, Result};
use crate::event::run_event_announcer;
use crate::handler::run_handler;
use crate::lifecycle;
use crate::nak_gen::run_nak_generator;
use crate::pipeline::run_processor;
use crate::queue::{DeliveryMode, MatchRule, QueueCallbacks, QueueHandle};
use crate::timer::run_timer;

/// Join timeout used when a receiver is dropped without [`Receiver::stop`].
const DROP_STOP_TIMEOUT: Duration = Duration::from_secs(5);

struct Worker {
    name: String,
    handle: thread::JoinHandle<()>,
}

/// Reports a thread's exit, however it exits.
struct ExitNotice {
    name: String,
    tx: Sender<String>,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        let _ = self.tx.send(std::mem::take(&mut self.name));
    }
}

/// Multi-threaded receiver.
///
/// Owns one connection handler, a pool of packet processors, announcers,
/// the NAK generator, the timer and the event announcer. Applications
/// attach queues with [`create_queue`](Self::create_queue) and receive
/// data and events through [`QueueCallbacks`].
///
/// Dropping the receiver stops it with a five second join timeout.
pub struct Receiver {
    shared: Arc<Shared>,
    threads: Mutex<Vec<Worker>>,
    done_rx: ChannelRx<String>,
    stopped: AtomicBool,
}

impl Receiver {
    /// Start a receiver. Fails only if the readiness polls cannot be
    /// created.
    pub fn new(config: ReceiverConfig) -> Result<Self> {
        Self::build(config, None)
    }

    /// Receiver that runs `factory`'s step on every connection before the
    /// handshake.
    pub fn with_tls(config: ReceiverConfig, factory: TlsFactory) -> Result<Self> {
        Self::build(config, Some(factory))
    }

    fn build(config: ReceiverConfig, tls: Option<TlsFactory>) -> Result<Self> {
        let processors = config.threads.processors;
        let announcers = config.threads.announcers;
        let (shared, ends) = Shared::new(config, tls)?;
        let (done_tx, done_rx) = unbounded();
        let mut threads = Vec::new();

        let mut spawn = |name: String, body: Box<dyn FnOnce() + Send>| {
            let notice = ExitNotice {
                name: name.clone(),
                tx: done_tx.clone(),
            };
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    let _notice = notice;
                    body();
                })
                .expect("failed to spawn receiver thread");
            threads.push(Worker { name, handle });
        };

        let s = Arc::clone(&shared);
        let handler_rx = ends.handler_rx;
        let handler_poll = ends.handler_poll;
        spawn(
            "rivulet-conn".into(),
            Box::new(move || run_handler(s, handler_rx, handler_poll)),
        );
        for i in 0..processors {
            let s = Arc::clone(&shared);
            spawn(format!("rivulet-proc-{i}"), Box::new(move || run_processor(s, i)));
        }
        for i in 0..announcers {
            let s = Arc::clone(&shared);
            spawn(format!("rivulet-announce-{i}"), Box::new(move || run_announcer(s, i)));
        }
        let s = Arc::clone(&shared);
        spawn("rivulet-nak".into(), Box::new(move || run_nak_generator(s)));
        let s = Arc::clone(&shared);
        spawn("rivulet-timer".into(), Box::new(move || run_timer(s)));
        let s = Arc::clone(&shared);
        let events_rx = ends.events_rx;
        spawn("rivulet-events".into(), Box::new(move || run_event_announcer(s, events_rx)));

        info!(processors, announcers, "receiver started");
        Ok(Receiver {
            shared,
            threads: Mutex::new(threads),
            done_rx,
            stopped: AtomicBool::new(false),
        })
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shared.is_shutdown() {
            return Err(ReceiverError::Stopped);
        }
        Ok(())
    }

    /// Accept connections on `addr`. Returns the bound address.
    pub fn listen(&self, addr: impl ToSocketAddrs) -> Result<SocketAddr> {
        self.ensure_running()?;
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        if !self.shared.command(HandlerCmd::Listen(listener)) {
            return Err(ReceiverError::Stopped);
        }
        info!(%local, "listening");
        Ok(local)
    }

    /// Open a connection to a source. The TCP connect happens here; the
    /// handshake completes asynchronously and is reported as
    /// `ConnectionEstablished` or `EstablishFailed`.
    pub fn connect(&self, addr: SocketAddr) -> Result<()> {
        self.ensure_running()?;
        let socket = TcpStream::connect_timeout(&addr, self.shared.config.connection.handshake_timeout)?;
        if !self.shared.command(HandlerCmd::Connect(socket, addr)) {
            return Err(ReceiverError::Stopped);
        }
        Ok(())
    }

    pub fn create_queue(
        &self,
        rule: MatchRule,
        mode: DeliveryMode,
        callbacks: Arc<dyn QueueCallbacks>,
    ) -> Result<QueueHandle> {
        self.ensure_running()?;
        let handle = self.shared.queues.write().insert(rule, mode, callbacks)?;
        info!(?handle, ?mode, "queue created");
        Ok(handle)
    }

    /// Close a queue and every stream delivered to it. Each stream reports
    /// `StreamClosed` to the queue before it goes away.
    pub fn close_queue(&self, handle: QueueHandle) -> Result<()> {
        let queue = self.shared.queues.write().remove(handle)?;
        let keys: Vec<StreamKey> = queue.streams.lock().iter().copied().collect();
        for key in keys {
            lifecycle::teardown(&self.shared, key, None);
        }
        info!(?handle, "queue closed");
        Ok(())
    }

    /// Tear a stream down immediately.
    pub fn remove_stream(&self, key: StreamKey) -> Result<()> {
        if lifecycle::teardown(&self.shared, key, None) {
            Ok(())
        } else {
            Err(ReceiverError::InvalidParameter(format!("unknown stream {key}")))
        }
    }

    pub fn stats(&self) -> ReceiverStats {
        self.shared.stats()
    }

    pub fn stream_stats(&self, key: StreamKey) -> Option<StreamStats> {
        let stream = self.shared.stream(key)?;
        let stats = stream.state.lock().stats.clone();
        Some(stats)
    }

    /// Streams currently registered, in key order.
    pub fn streams(&self) -> Vec<StreamKey> {
        let mut keys: Vec<StreamKey> = self.shared.streams.read().keys().copied().collect();
        keys.sort();
        keys
    }

    /// Stop every thread and release all connections, streams and queues.
    ///
    /// Threads still running after `timeout` are left detached and named in
    /// [`ReceiverError::Unresponsive`]. Calling again is a no-op.
    pub fn stop(&self, timeout: Duration) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shared.begin_shutdown();
        let deadline = Instant::now() + timeout;

        let mut workers = std::mem::take(&mut *self.threads.lock());
        let mut exited = HashSet::new();
        while exited.len() < workers.len() {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.done_rx.recv_timeout(left) {
                Ok(name) => {
                    exited.insert(name);
                }
                Err(_) => break,
            }
        }

        let mut stragglers = Vec::new();
        for worker in workers.drain(..) {
            if exited.contains(&worker.name) {
                let _ = worker.handle.join();
            } else {
                stragglers.push(worker.name);
            }
        }

        self.release();
        if stragglers.is_empty() {
            info!("receiver stopped");
            Ok(())
        } else {
            warn!(threads = ?stragglers, "receiver threads did not exit in time");
            Err(ReceiverError::Unresponsive(stragglers))
        }
    }

    fn release(&self) {
        let shared = &self.shared;
        let conns: Vec<_> = shared.ready.write().drain().map(|(_, c)| c).collect();
        for conn in conns {
            conn.close();
        }
        let streams: Vec<_> = shared.streams.write().drain().map(|(_, s)| s).collect();
        for stream in streams {
            stream.kill();
            stream.reclaim();
        }
        for queue in shared.queues.write().drain() {
            queue.streams.lock().clear();
        }
        while shared.ready_rx.try_recv().is_ok() {}
        while shared.work_rx.try_recv().is_ok() {}
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        let _ = self.stop(DROP_STOP_TIMEOUT);
    }
}
