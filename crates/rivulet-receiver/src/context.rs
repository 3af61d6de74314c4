//! State shared by every receiver thread.

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use mio::{Poll, Registry, Waker};
use parking_lot::{Mutex, RwLock};
use rivulet_transport::nak::NakElement;
use rivulet_transport::pool::{Pool, Pooled};
use rivulet_transport::stats::{Counters, ReceiverStats};
use rivulet_transport::wire::StreamKey;
use slab::Slab;
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ReceiverConfig;
use crate::connection::{Connection, ConnectionId, IdGenerator, TlsFactory};
use crate::event::{Event, EventRecord, EventSender};
use crate::lifecycle::LifecycleCaches;
use crate::poller::{ReadPoller, WAKE};
use crate::queue::QueueTable;
use crate::stream::Stream;

/// A frame handed from the reading thread to the processing pipeline.
pub(crate) struct RawPacket {
    pub buf: Pooled<Vec<u8>>,
    pub origin: InFlight,
}

/// Counts a packet against its connection's in-flight watermark until
/// dropped.
pub(crate) struct InFlight(Arc<Connection>);

impl InFlight {
    pub fn new(conn: Arc<Connection>) -> Self {
        conn.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlight(conn)
    }

    pub fn conn(&self) -> &Arc<Connection> {
        &self.0
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Requests for the connection handler thread.
pub(crate) enum HandlerCmd {
    Listen(TcpListener),
    Connect(TcpStream, SocketAddr),
}

pub(crate) struct Shared {
    pub config: ReceiverConfig,
    shutdown: AtomicBool,
    /// Dropped at shutdown; every `sleep` wakes on the disconnect.
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,

    pub streams: RwLock<HashMap<StreamKey, Arc<Stream>>>,
    pub ready: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    pub queues: RwLock<QueueTable>,
    pub caches: Mutex<LifecycleCaches>,

    pub packet_pool: Pool<Vec<u8>>,
    pub nak_pool: Pool<NakElement>,
    pub events: EventSender,
    pub counters: Counters,
    pub ids: IdGenerator,
    pub tls: Option<TlsFactory>,

    /// Announcer work list.
    pub work_tx: Sender<Arc<Stream>>,
    pub work_rx: Receiver<Arc<Stream>>,
    /// Data and SPM frames awaiting a packet processor.
    pub ready_tx: Sender<RawPacket>,
    pub ready_rx: Receiver<RawPacket>,
    /// Held by the one processor currently reading sockets.
    pub poll_lock: Mutex<ReadPoller>,
    /// Connections promoted since the last read pass; their handshake may
    /// have left frames in the reader.
    pub promoted: Mutex<Vec<ConnectionId>>,
    /// Registers ready connections with the processors' poll.
    pub registry: Registry,
    /// Poll token of each ready connection.
    pub tokens: Mutex<Slab<ConnectionId>>,
    handler_tx: Sender<HandlerCmd>,
    /// Wakes the handler for commands, queued output and shutdown.
    pub handler_waker: Arc<Waker>,
}

/// Channel ends owned by individual threads rather than `Shared`.
pub(crate) struct ThreadEnds {
    pub events_rx: Receiver<EventRecord>,
    pub handler_rx: Receiver<HandlerCmd>,
    pub handler_poll: Poll,
}

impl Shared {
    pub fn new(
        config: ReceiverConfig,
        tls: Option<TlsFactory>,
    ) -> io::Result<(Arc<Shared>, ThreadEnds)> {
        let read_poll = Poll::new()?;
        let registry = read_poll.registry().try_clone()?;
        let handler_poll = Poll::new()?;
        let handler_waker = Arc::new(Waker::new(handler_poll.registry(), WAKE)?);

        let (stop_tx, stop_rx) = bounded(1);
        let (events_tx, events_rx) = bounded(config.pool.events);
        let (work_tx, work_rx) = unbounded();
        let (ready_tx, ready_rx) = unbounded();
        let (handler_tx, handler_rx) = unbounded();

        let events = EventSender::new(events_tx, config.pool.acquire_timeout);
        let packet_pool = Pool::new(
            "packet-buffers",
            config.pool.pool_config(config.pool.packet_buffers),
            || Vec::with_capacity(2048),
        );
        let nak_pool = Pool::new(
            "nak-elements",
            config.pool.pool_config(config.pool.nak_elements),
            || NakElement::new(quanta::Instant::now()),
        );
        let ev = events.clone();
        packet_pool.set_alert(move |alert| ev.broadcast(Event::PoolWatermark(alert)));
        let ev = events.clone();
        nak_pool.set_alert(move |alert| ev.broadcast(Event::PoolWatermark(alert)));

        let host_seed = config.host_seed.unwrap_or_else(rand::random::<u32>);
        let caches = LifecycleCaches::new(config.stream.formation_cache, config.stream.rejected_cache);
        let queues = QueueTable::new(config.limits.max_queues);

        let shared = Arc::new(Shared {
            shutdown: AtomicBool::new(false),
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
            streams: RwLock::new(HashMap::new()),
            ready: RwLock::new(HashMap::new()),
            queues: RwLock::new(queues),
            caches: Mutex::new(caches),
            packet_pool,
            nak_pool,
            events,
            counters: Counters::default(),
            ids: IdGenerator::new(host_seed),
            tls,
            work_tx,
            work_rx,
            ready_tx,
            ready_rx,
            poll_lock: Mutex::new(ReadPoller::new(read_poll, config.limits.max_connections)),
            promoted: Mutex::new(Vec::new()),
            registry,
            tokens: Mutex::new(Slab::new()),
            handler_tx,
            handler_waker,
            config,
        });
        let ends = ThreadEnds {
            events_rx,
            handler_rx,
            handler_poll,
        };
        Ok((shared, ends))
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Raise the shutdown flag and wake every sleeping thread.
    pub fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.stop_tx.lock().take();
        let _ = self.handler_waker.wake();
        self.packet_pool.close();
        self.nak_pool.close();
    }

    /// Hand `cmd` to the connection handler and wake it. False once the
    /// handler is gone.
    pub fn command(&self, cmd: HandlerCmd) -> bool {
        if self.handler_tx.send(cmd).is_err() {
            return false;
        }
        let _ = self.handler_waker.wake();
        true
    }

    /// Sleep for `dur` unless shutdown begins first. Returns false once the
    /// receiver is stopping.
    pub fn sleep(&self, dur: Duration) -> bool {
        if self.is_shutdown() {
            return false;
        }
        match self.stop_rx.recv_timeout(dur) {
            Err(RecvTimeoutError::Timeout) => !self.is_shutdown(),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    pub fn stream(&self, key: StreamKey) -> Option<Arc<Stream>> {
        self.streams.read().get(&key).cloned()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.ready.read().get(&id).cloned()
    }

    /// Ready connection registered under poll `token`.
    pub fn connection_by_token(&self, token: usize) -> Option<Arc<Connection>> {
        let id = self.tokens.lock().get(token).copied()?;
        self.connection(id)
    }

    pub fn ready_connections(&self) -> Vec<Arc<Connection>> {
        self.ready.read().values().cloned().collect()
    }

    pub fn all_streams(&self) -> Vec<Arc<Stream>> {
        self.streams.read().values().cloned().collect()
    }

    /// Counters plus live gauges.
    pub fn stats(&self) -> ReceiverStats {
        let mut stats = self.counters.snapshot();
        stats.connections_active = self.ready.read().len() as u64;
        stats.streams_active = self.streams.read().len() as u64;
        stats.queues_active = self.queues.read().len() as u64;
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn sleep_wakes_on_shutdown() {
        let (shared, _ends) = Shared::new(ReceiverConfig::default(), None).unwrap();
        let s = Arc::clone(&shared);
        let start = Instant::now();
        let sleeper = thread::spawn(move || s.sleep(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(20));
        shared.begin_shutdown();
        assert!(!sleeper.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!shared.sleep(Duration::from_millis(1)));
    }

    #[test]
    fn short_sleep_returns_true() {
        let (shared, _ends) = Shared::new(ReceiverConfig::default(), None).unwrap();
        assert!(shared.sleep(Duration::from_millis(1)));
    }

    #[test]
    fn fresh_stats_are_zero() {
        let (shared, _ends) = Shared::new(ReceiverConfig::default(), None).unwrap();
        assert_eq!(shared.stats(), ReceiverStats::default());
    }
}
