use std::time::Duration;

use anyhow::{bail, Context};
use rivulet_transport::framing::DEFAULT_MAX_FRAME_LEN;
use rivulet_transport::nak::NakConfig;
use rivulet_transport::pool::PoolConfig;
use serde::Deserialize;

pub const CONFIG_VERSION: u32 = 1;

// ─── TOML Input ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReceiverConfigInput {
    pub version: u32,
    pub host_seed: Option<u32>,
    pub threads: ThreadsInput,
    pub window: WindowInput,
    pub pool: PoolInput,
    pub nak: NakInput,
    pub stream: StreamInput,
    pub connection: ConnectionInput,
    pub limits: LimitsInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ThreadsInput {
    pub processors: Option<usize>,
    pub announcers: Option<usize>,
    pub idle_sleep_us: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WindowInput {
    pub capacity: Option<usize>,
    pub late_join_backtrack: Option<u64>,
    pub fragment_max_age: Option<u64>,
    pub max_message_len: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PoolInput {
    pub packet_buffers: Option<usize>,
    pub nak_elements: Option<usize>,
    pub events: Option<usize>,
    pub high_watermark_pct: Option<u8>,
    pub low_watermark_pct: Option<u8>,
    pub acquire_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NakInput {
    pub poll_interval_ms: Option<u64>,
    pub backoff_ms: Option<u64>,
    pub ncf_timeout_ms: Option<u64>,
    pub data_timeout_ms: Option<u64>,
    pub ncf_retries: Option<u32>,
    pub data_retries: Option<u32>,
    pub max_seqs_per_nak: Option<usize>,
    pub adapt_weight: Option<f64>,
    pub adapt_clamp: Option<f64>,
    pub unrecoverable: Option<UnrecoverableAction>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StreamInput {
    pub inactivity_timeout_ms: Option<u64>,
    pub close_delay_ms: Option<u64>,
    pub announce_chunk: Option<usize>,
    pub formation_cache: Option<usize>,
    pub rejected_cache: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConnectionInput {
    pub heartbeat_timeout_ms: Option<u64>,
    pub one_way: Option<bool>,
    pub handshake_timeout_ms: Option<u64>,
    pub report_interval_ms: Option<u64>,
    pub max_frame_len: Option<usize>,
    pub inflight_watermark: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LimitsInput {
    pub max_streams: Option<usize>,
    pub max_queues: Option<usize>,
    pub max_connections: Option<usize>,
    pub stats_interval_ms: Option<u64>,
}

// ─── Resolved Config ─────────────────────────────────────────────────────────

/// What to do when a sequence number exhausts its NAK retries.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnrecoverableAction {
    /// Report the loss and deliver past the gap.
    #[default]
    Skip,
    /// Tear the stream down.
    Kill,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThreadConfig {
    pub processors: usize,
    pub announcers: usize,
    /// Longest readiness wait of the poll-lock holder, and the ready-queue
    /// wait of the other processors.
    pub idle_sleep: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowConfig {
    /// SortedQ capacity per stream (data and NAK windows alike).
    pub capacity: usize,
    /// Start this many sequence numbers behind the advertised lead when the
    /// source gives no join marker.
    pub late_join_backtrack: Option<u64>,
    /// Fragment records older than `trail - fragment_max_age` are discarded.
    pub fragment_max_age: u64,
    pub max_message_len: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolSettings {
    pub packet_buffers: usize,
    pub nak_elements: usize,
    /// Bound on queued events awaiting the event announcer.
    pub events: usize,
    pub high_watermark_pct: u8,
    pub low_watermark_pct: u8,
    pub acquire_timeout: Duration,
}

impl PoolSettings {
    pub fn pool_config(&self, capacity: usize) -> PoolConfig {
        PoolConfig {
            capacity,
            high_watermark: capacity * self.high_watermark_pct as usize / 100,
            low_watermark: capacity * self.low_watermark_pct as usize / 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NakSettings {
    pub poll_interval: Duration,
    pub params: NakConfig,
    pub unrecoverable: UnrecoverableAction,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamSettings {
    pub inactivity_timeout: Duration,
    pub close_delay: Duration,
    /// Packets drained from one stream per announcer turn.
    pub announce_chunk: usize,
    pub formation_cache: usize,
    pub rejected_cache: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    pub heartbeat_timeout: Duration,
    pub one_way: bool,
    pub handshake_timeout: Duration,
    pub report_interval: Duration,
    pub max_frame_len: usize,
    /// Reads from a connection pause while this many of its packets are
    /// queued for processing.
    pub inflight_watermark: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Limits {
    pub max_streams: usize,
    pub max_queues: usize,
    pub max_connections: usize,
    pub stats_interval: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReceiverConfig {
    pub version: u32,
    /// High half of generated connection ids. Random when unset.
    pub host_seed: Option<u32>,
    pub threads: ThreadConfig,
    pub window: WindowConfig,
    pub pool: PoolSettings,
    pub nak: NakSettings,
    pub stream: StreamSettings,
    pub connection: ConnectionSettings,
    pub limits: Limits,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            host_seed: None,
            threads: ThreadConfig {
                processors: 4,
                announcers: 1,
                idle_sleep: Duration::from_micros(200),
            },
            window: WindowConfig {
                capacity: 4096,
                late_join_backtrack: None,
                fragment_max_age: 4096,
                max_message_len: 16 * 1024 * 1024,
            },
            pool: PoolSettings {
                packet_buffers: 8192,
                nak_elements: 16384,
                events: 4096,
                high_watermark_pct: 90,
                low_watermark_pct: 70,
                acquire_timeout: Duration::from_millis(100),
            },
            nak: NakSettings {
                poll_interval: Duration::from_millis(20),
                params: NakConfig::default(),
                unrecoverable: UnrecoverableAction::Skip,
            },
            stream: StreamSettings {
                inactivity_timeout: Duration::from_secs(30),
                close_delay: Duration::from_secs(1),
                announce_chunk: 64,
                formation_cache: 256,
                rejected_cache: 1024,
            },
            connection: ConnectionSettings {
                heartbeat_timeout: Duration::from_millis(5000),
                one_way: false,
                handshake_timeout: Duration::from_millis(3000),
                report_interval: Duration::from_secs(1),
                max_frame_len: DEFAULT_MAX_FRAME_LEN,
                inflight_watermark: 512,
            },
            limits: Limits {
                max_streams: 4096,
                max_queues: 256,
                max_connections: 1024,
                stats_interval: Duration::from_secs(10),
            },
        }
    }
}

fn ms(v: Option<u64>, default: Duration) -> Duration {
    v.map(Duration::from_millis).unwrap_or(default)
}

impl ReceiverConfigInput {
    pub fn resolve(self) -> anyhow::Result<ReceiverConfig> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            bail!("unsupported config version {}", version);
        }
        let d = ReceiverConfig::default();

        let threads = ThreadConfig {
            processors: self.threads.processors.unwrap_or(d.threads.processors).clamp(1, 64),
            announcers: self.threads.announcers.unwrap_or(d.threads.announcers).clamp(1, 64),
            idle_sleep: self
                .threads
                .idle_sleep_us
                .map(Duration::from_micros)
                .unwrap_or(d.threads.idle_sleep),
        };

        let window = WindowConfig {
            capacity: self.window.capacity.unwrap_or(d.window.capacity).max(16),
            late_join_backtrack: self.window.late_join_backtrack,
            fragment_max_age: self
                .window
                .fragment_max_age
                .unwrap_or(d.window.fragment_max_age)
                .max(1),
            max_message_len: self.window.max_message_len.unwrap_or(d.window.max_message_len),
        };

        let high = self
            .pool
            .high_watermark_pct
            .unwrap_or(d.pool.high_watermark_pct)
            .clamp(1, 100);
        let low = self
            .pool
            .low_watermark_pct
            .unwrap_or(d.pool.low_watermark_pct)
            .min(high);
        let pool = PoolSettings {
            packet_buffers: self.pool.packet_buffers.unwrap_or(d.pool.packet_buffers).max(16),
            nak_elements: self.pool.nak_elements.unwrap_or(d.pool.nak_elements).max(16),
            events: self.pool.events.unwrap_or(d.pool.events).max(16),
            high_watermark_pct: high,
            low_watermark_pct: low,
            acquire_timeout: ms(self.pool.acquire_timeout_ms, d.pool.acquire_timeout),
        };

        let dn = d.nak.params;
        let params = NakConfig {
            backoff_ivl: ms(self.nak.backoff_ms, dn.backoff_ivl),
            ncf_timeout: ms(self.nak.ncf_timeout_ms, dn.ncf_timeout).max(Duration::from_millis(1)),
            data_timeout: ms(self.nak.data_timeout_ms, dn.data_timeout)
                .max(Duration::from_millis(1)),
            ncf_retries: self.nak.ncf_retries.unwrap_or(dn.ncf_retries).max(1),
            data_retries: self.nak.data_retries.unwrap_or(dn.data_retries).max(1),
            max_seqs_per_nak: self
                .nak
                .max_seqs_per_nak
                .unwrap_or(dn.max_seqs_per_nak)
                .clamp(1, rivulet_transport::wire::MAX_NAK_LIST + 1),
            adapt_weight: self.nak.adapt_weight.unwrap_or(dn.adapt_weight).clamp(0.0, 1.0),
            adapt_clamp: self.nak.adapt_clamp.unwrap_or(dn.adapt_clamp).max(1.0),
        };
        let nak = NakSettings {
            poll_interval: ms(self.nak.poll_interval_ms, d.nak.poll_interval)
                .max(Duration::from_millis(1)),
            params,
            unrecoverable: self.nak.unrecoverable.unwrap_or_default(),
        };

        let stream = StreamSettings {
            inactivity_timeout: ms(self.stream.inactivity_timeout_ms, d.stream.inactivity_timeout),
            close_delay: ms(self.stream.close_delay_ms, d.stream.close_delay),
            announce_chunk: self
                .stream
                .announce_chunk
                .unwrap_or(d.stream.announce_chunk)
                .max(1),
            formation_cache: self.stream.formation_cache.unwrap_or(d.stream.formation_cache),
            rejected_cache: self.stream.rejected_cache.unwrap_or(d.stream.rejected_cache),
        };

        let connection = ConnectionSettings {
            heartbeat_timeout: ms(
                self.connection.heartbeat_timeout_ms,
                d.connection.heartbeat_timeout,
            )
            .max(Duration::from_millis(30)),
            one_way: self.connection.one_way.unwrap_or(d.connection.one_way),
            handshake_timeout: ms(
                self.connection.handshake_timeout_ms,
                d.connection.handshake_timeout,
            ),
            report_interval: ms(self.connection.report_interval_ms, d.connection.report_interval)
                .max(Duration::from_millis(10)),
            max_frame_len: self
                .connection
                .max_frame_len
                .unwrap_or(d.connection.max_frame_len)
                .max(rivulet_transport::wire::COMMON_HEADER_LEN),
            inflight_watermark: self
                .connection
                .inflight_watermark
                .unwrap_or(d.connection.inflight_watermark)
                .max(1),
        };

        let limits = Limits {
            max_streams: self.limits.max_streams.unwrap_or(d.limits.max_streams).max(1),
            max_queues: self.limits.max_queues.unwrap_or(d.limits.max_queues).max(1),
            max_connections: self
                .limits
                .max_connections
                .unwrap_or(d.limits.max_connections)
                .max(1),
            stats_interval: ms(self.limits.stats_interval_ms, d.limits.stats_interval),
        };

        Ok(ReceiverConfig {
            version,
            host_seed: self.host_seed,
            threads,
            window,
            pool,
            nak,
            stream,
            connection,
            limits,
        })
    }
}

impl ReceiverConfig {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        if input.trim().is_empty() {
            return Ok(ReceiverConfig::default());
        }
        let parsed: ReceiverConfigInput =
            toml::from_str(input).context("invalid receiver config TOML")?;
        parsed.resolve()
    }
}
