//! # NAK: Negative Acknowledgement State Machine
//!
//! Receiver-side gap tracking. Every missing sequence number inside a
//! stream's window `[trail, lead)` gets a [`NakElement`] stored in the
//! stream's NAK [`SortedQ`], addressed by the same sequence number as the
//! data window.
//!
//! ```text
//!            timeout                 NCF
//! BACK_OFF ───────────▶ WAIT_NCF ──────────▶ WAIT_DATA
//!    ▲   (send NAK)        │                    │
//!    └──── timeout ────────┴──── timeout ───────┘
//!          (retry++)              (retry++)
//! ```
//!
//! Arrival of the data resolves the element from any state. Each waiting
//! phase has its own retry ceiling; reaching it marks the sequence lost.
//!
//! ## Key design decisions
//!
//! - **Randomized back-off**: the first request waits a random dwell in
//!   `[0, backoff]` so receivers sharing a loss do not NAK in lockstep
//! - **NCF suppression**: an NCF seen during back-off skips straight to
//!   WAIT_DATA, so no request is sent for a repair already under way
//! - **Coalescing**: due sequences of one stream share a request, bounded by
//!   `max_seqs_per_nak`
//! - **Adaptive timeouts**: per-stream NCF/data waits blend toward observed
//!   latency and are clamped around the configured defaults

use quanta::Instant;
use rand::rngs::StdRng;
use rand::RngExt as _;
use std::time::Duration;

use crate::pool::{Pooled, Recycle};
use crate::sorted_q::{SortedQ, FLAG_LOST, FLAG_NAK_SENT, FLAG_NCF_SEEN};

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NakConfig {
    /// Upper bound of the randomized initial dwell.
    pub backoff_ivl: Duration,
    /// Default wait for an NCF after sending a NAK.
    pub ncf_timeout: Duration,
    /// Default wait for repair data after an NCF.
    pub data_timeout: Duration,
    /// NCF-wait timeouts tolerated before the sequence is lost.
    pub ncf_retries: u32,
    /// Data-wait timeouts tolerated before the sequence is lost.
    pub data_retries: u32,
    /// Sequence numbers per NAK request.
    pub max_seqs_per_nak: usize,
    /// Weight of the previous timeout in the adaptive blend.
    pub adapt_weight: f64,
    /// Adaptive timeouts stay within `[default / clamp, default * clamp]`.
    pub adapt_clamp: f64,
}

impl Default for NakConfig {
    fn default() -> Self {
        NakConfig {
            backoff_ivl: Duration::from_millis(50),
            ncf_timeout: Duration::from_millis(200),
            data_timeout: Duration::from_millis(500),
            ncf_retries: 5,
            data_retries: 5,
            max_seqs_per_nak: 63,
            adapt_weight: 0.85,
            adapt_clamp: 4.0,
        }
    }
}

// ─── Adaptive Timeouts ───────────────────────────────────────────────────────

/// Per-stream NCF-wait and data-wait timeouts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NakTimeouts {
    pub ncf: Duration,
    pub data: Duration,
}

impl NakTimeouts {
    pub fn new(cfg: &NakConfig) -> Self {
        NakTimeouts {
            ncf: cfg.ncf_timeout,
            data: cfg.data_timeout,
        }
    }

    /// Fold an observed NAK→NCF latency into the NCF timeout.
    pub fn observe_ncf(&mut self, observed: Duration, cfg: &NakConfig) {
        self.ncf = blend(self.ncf, observed, cfg.ncf_timeout, cfg);
    }

    /// Fold an observed NCF→data latency into the data timeout.
    pub fn observe_data(&mut self, observed: Duration, cfg: &NakConfig) {
        self.data = blend(self.data, observed, cfg.data_timeout, cfg);
    }
}

fn blend(prev: Duration, observed: Duration, default: Duration, cfg: &NakConfig) -> Duration {
    let w = cfg.adapt_weight.clamp(0.0, 1.0);
    let mixed = prev.as_secs_f64() * w + observed.as_secs_f64() * (1.0 - w);
    let clamp = cfg.adapt_clamp.max(1.0);
    let lo = default.as_secs_f64() / clamp;
    let hi = default.as_secs_f64() * clamp;
    Duration::from_secs_f64(mixed.clamp(lo, hi))
}

/// Random dwell in `[0, ivl]`.
pub fn random_backoff(rng: &mut StdRng, ivl: Duration) -> Duration {
    let max = ivl.as_micros().min(u64::MAX as u128) as u64;
    Duration::from_micros(rng.random_range(0..=max))
}

// ─── NAK Element ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NakState {
    BackOff,
    WaitNcf,
    WaitData,
}

/// What an expired element wants from the generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Back-off elapsed: include the sequence in this cycle's request.
    SendNak,
    /// A wait phase timed out; re-armed in BACK_OFF.
    Rearmed,
    /// Retry ceiling reached.
    Lost,
}

/// Retransmission record for one missing sequence number.
#[derive(Debug, Clone)]
pub struct NakElement {
    pub seq: u64,
    pub state: NakState,
    pub deadline: Instant,
    pub ncf_retries: u32,
    pub data_retries: u32,
    nak_sent_at: Option<Instant>,
    ncf_at: Option<Instant>,
}

impl NakElement {
    pub fn new(now: Instant) -> Self {
        NakElement {
            seq: 0,
            state: NakState::BackOff,
            deadline: now,
            ncf_retries: 0,
            data_retries: 0,
            nak_sent_at: None,
            ncf_at: None,
        }
    }

    /// Start tracking `seq` in BACK_OFF.
    pub fn arm(&mut self, seq: u64, now: Instant, backoff: Duration) {
        self.seq = seq;
        self.state = NakState::BackOff;
        self.deadline = now + backoff;
        self.ncf_retries = 0;
        self.data_retries = 0;
        self.nak_sent_at = None;
        self.ncf_at = None;
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// A request carrying this sequence went out.
    pub fn on_nak_sent(&mut self, now: Instant, timeouts: &NakTimeouts) {
        self.state = NakState::WaitNcf;
        self.deadline = now + timeouts.ncf;
        self.nak_sent_at = Some(now);
    }

    /// NCF received. Returns the NAK→NCF latency when a NAK of ours was
    /// outstanding, for the adaptive blend.
    pub fn on_ncf(&mut self, now: Instant, timeouts: &NakTimeouts) -> Option<Duration> {
        if self.state == NakState::WaitData {
            return None;
        }
        let latency = match (self.state, self.nak_sent_at) {
            (NakState::WaitNcf, Some(sent)) => Some(now.duration_since(sent)),
            _ => None,
        };
        self.state = NakState::WaitData;
        self.deadline = now + timeouts.data;
        self.ncf_at = Some(now);
        latency
    }

    /// Data arrived. Returns the NCF→data latency when the element was
    /// waiting for data.
    pub fn on_data(&self, now: Instant) -> Option<Duration> {
        match (self.state, self.ncf_at) {
            (NakState::WaitData, Some(at)) => Some(now.duration_since(at)),
            _ => None,
        }
    }

    /// Handle deadline expiry.
    pub fn on_timeout(&mut self, now: Instant, backoff: Duration, cfg: &NakConfig) -> Expiry {
        match self.state {
            NakState::BackOff => Expiry::SendNak,
            NakState::WaitNcf => {
                self.ncf_retries += 1;
                if self.ncf_retries >= cfg.ncf_retries {
                    Expiry::Lost
                } else {
                    self.state = NakState::BackOff;
                    self.deadline = now + backoff;
                    Expiry::Rearmed
                }
            }
            NakState::WaitData => {
                self.data_retries += 1;
                if self.data_retries >= cfg.data_retries {
                    Expiry::Lost
                } else {
                    self.state = NakState::BackOff;
                    self.deadline = now + backoff;
                    Expiry::Rearmed
                }
            }
        }
    }
}

impl Recycle for NakElement {
    fn recycle(&mut self) {
        self.seq = 0;
        self.state = NakState::BackOff;
        self.ncf_retries = 0;
        self.data_retries = 0;
        self.nak_sent_at = None;
        self.ncf_at = None;
    }
}

// ─── Gap Scanner ─────────────────────────────────────────────────────────────

/// Stream window bounds: `trail` inclusive, `lead` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub trail: u64,
    pub lead: u64,
}

/// Result of one [`scan`] pass over a stream.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanOutcome {
    /// Sequence numbers to request this cycle, ascending.
    pub to_nak: Vec<u64>,
    /// Sequence numbers that exhausted their retries this cycle.
    pub lost: Vec<u64>,
    /// Elements dropped because their data arrived.
    pub resolved: usize,
    /// Gaps left untracked because no NAK record could be allocated.
    pub untracked: usize,
}

/// One NAK-generator pass over a stream.
///
/// Advances the NAK window with `window.trail`, resolves elements whose data
/// arrived, creates elements for new gaps via `alloc`, and drives expired
/// elements. Lost sequences get [`FLAG_LOST`] in the data window.
#[allow(clippy::too_many_arguments)]
pub fn scan<D>(
    data: &mut SortedQ<D>,
    naks: &mut SortedQ<Pooled<NakElement>>,
    window: Window,
    now: Instant,
    cfg: &NakConfig,
    timeouts: &mut NakTimeouts,
    rng: &mut StdRng,
    mut alloc: impl FnMut() -> Option<Pooled<NakElement>>,
) -> ScanOutcome {
    let mut out = ScanOutcome::default();
    naks.advance_tail_to(window.trail.max(data.tail()));

    let start = naks.tail();
    let end = window.lead.min(naks.limit()).min(data.limit());
    for seq in start..end {
        if data.contains(seq) {
            if let Some(el) = naks.take(seq) {
                if let Some(latency) = el.on_data(now) {
                    timeouts.observe_data(latency, cfg);
                }
                out.resolved += 1;
            }
            continue;
        }
        if data.flags(seq) & FLAG_LOST != 0 {
            naks.take(seq);
            continue;
        }

        let expiry = match naks.get_mut(seq) {
            Some(el) if el.is_due(now) => {
                let backoff = random_backoff(rng, cfg.backoff_ivl);
                el.on_timeout(now, backoff, cfg)
            }
            Some(_) => continue,
            None => {
                match alloc() {
                    Some(mut el) => {
                        el.arm(seq, now, random_backoff(rng, cfg.backoff_ivl));
                        // The slot was free and inside the window.
                        let _ = naks.put(seq, el);
                    }
                    None => out.untracked += 1,
                }
                continue;
            }
        };
        match expiry {
            Expiry::SendNak => out.to_nak.push(seq),
            Expiry::Rearmed => naks.clear_flags(seq, FLAG_NAK_SENT | FLAG_NCF_SEEN),
            Expiry::Lost => {
                naks.take(seq);
                data.set_flags(seq, FLAG_LOST);
                out.lost.push(seq);
            }
        }
    }

    for &seq in &out.to_nak {
        if let Some(el) = naks.get_mut(seq) {
            el.on_nak_sent(now, timeouts);
        }
        naks.set_flags(seq, FLAG_NAK_SENT);
    }
    out
}

/// Apply an NCF for `seq` to the NAK window. Returns true if an element was
/// tracking it.
pub fn apply_ncf(
    naks: &mut SortedQ<Pooled<NakElement>>,
    seq: u64,
    now: Instant,
    cfg: &NakConfig,
    timeouts: &mut NakTimeouts,
) -> bool {
    let latency = match naks.get_mut(seq) {
        Some(el) => el.on_ncf(now, timeouts),
        None => return false,
    };
    naks.set_flags(seq, FLAG_NCF_SEEN);
    if let Some(latency) = latency {
        timeouts.observe_ncf(latency, cfg);
    }
    true
}

/// Split ascending sequence numbers into requests of at most `max` entries.
pub fn coalesce_requests(seqs: &[u64], max: usize) -> Vec<Vec<u64>> {
    if seqs.is_empty() {
        return Vec::new();
    }
    seqs.chunks(max.max(1)).map(|c| c.to_vec()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Pool, PoolConfig};
    use rand::SeedableRng;

    fn nak_pool() -> Pool<NakElement> {
        Pool::new("nak", PoolConfig::with_capacity(256), || {
            NakElement::new(Instant::now())
        })
    }

    fn cfg() -> NakConfig {
        NakConfig {
            ncf_retries: 2,
            data_retries: 2,
            ..NakConfig::default()
        }
    }

    struct Fixture {
        data: SortedQ<u32>,
        naks: SortedQ<Pooled<NakElement>>,
        pool: Pool<NakElement>,
        timeouts: NakTimeouts,
        rng: StdRng,
        cfg: NakConfig,
    }

    impl Fixture {
        fn new(trail: u64) -> Self {
            let cfg = cfg();
            Fixture {
                data: SortedQ::new(64, trail),
                naks: SortedQ::new(64, trail),
                pool: nak_pool(),
                timeouts: NakTimeouts::new(&cfg),
                rng: StdRng::seed_from_u64(7),
                cfg,
            }
        }

        fn scan(&mut self, lead: u64, now: Instant) -> ScanOutcome {
            let trail = self.data.tail();
            let pool = self.pool.clone();
            scan(
                &mut self.data,
                &mut self.naks,
                Window { trail, lead },
                now,
                &self.cfg,
                &mut self.timeouts,
                &mut self.rng,
                || pool.try_acquire(),
            )
        }
    }

    #[test]
    fn no_gaps_no_naks() {
        let mut f = Fixture::new(100);
        for s in 100..105 {
            f.data.put(s, s as u32).unwrap();
        }
        let t0 = Instant::now();
        let out = f.scan(105, t0);
        assert!(out.to_nak.is_empty());
        assert!(f.naks.is_empty());
    }

    #[test]
    fn single_gap_one_nak_after_backoff() {
        let mut f = Fixture::new(0);
        for s in [0, 1, 3, 4] {
            f.data.put(s, s as u32).unwrap();
        }
        let t0 = Instant::now();
        let first = f.scan(5, t0);
        assert!(first.to_nak.is_empty());
        assert_eq!(f.naks.len(), 1);

        let later = t0 + f.cfg.backoff_ivl;
        let second = f.scan(5, later);
        assert_eq!(second.to_nak, vec![2]);
        assert_eq!(f.naks.get_mut(2).unwrap().state, NakState::WaitNcf);
        assert_eq!(f.naks.flags(2) & FLAG_NAK_SENT, FLAG_NAK_SENT);

        // No duplicate request while waiting.
        let third = f.scan(5, later + Duration::from_millis(1));
        assert!(third.to_nak.is_empty());
    }

    #[test]
    fn ncf_moves_to_wait_data_then_data_resolves() {
        let mut f = Fixture::new(0);
        f.data.put(1, 1).unwrap();
        let t0 = Instant::now();
        f.scan(2, t0);
        let t1 = t0 + f.cfg.backoff_ivl;
        assert_eq!(f.scan(2, t1).to_nak, vec![0]);

        let t2 = t1 + Duration::from_millis(30);
        assert!(apply_ncf(&mut f.naks, 0, t2, &f.cfg, &mut f.timeouts));
        assert_eq!(f.naks.get_mut(0).unwrap().state, NakState::WaitData);
        // NCF latency 30ms pulled the NCF timeout down from 200ms.
        assert!(f.timeouts.ncf < f.cfg.ncf_timeout);

        f.data.put(0, 0).unwrap();
        let out = f.scan(2, t2 + Duration::from_millis(10));
        assert_eq!(out.resolved, 1);
        assert!(f.naks.is_empty());
    }

    #[test]
    fn ncf_during_backoff_suppresses_request() {
        let mut f = Fixture::new(0);
        f.data.put(1, 1).unwrap();
        let t0 = Instant::now();
        f.scan(2, t0);
        assert!(apply_ncf(&mut f.naks, 0, t0, &f.cfg, &mut f.timeouts));
        let out = f.scan(2, t0 + f.cfg.backoff_ivl);
        assert!(out.to_nak.is_empty());
        assert_eq!(f.naks.get_mut(0).unwrap().state, NakState::WaitData);
    }

    #[test]
    fn ncf_wait_exhaustion_marks_lost() {
        let mut f = Fixture::new(0);
        f.data.put(1, 1).unwrap();
        let mut now = Instant::now();
        let step = f.cfg.ncf_timeout + f.cfg.backoff_ivl;
        let mut lost = Vec::new();
        let mut naks_sent = 0;
        for _ in 0..20 {
            let out = f.scan(2, now);
            naks_sent += out.to_nak.len();
            lost.extend(out.lost);
            now = now + step;
        }
        assert_eq!(lost, vec![0]);
        assert_eq!(naks_sent, f.cfg.ncf_retries as usize);
        assert_eq!(f.data.flags(0) & FLAG_LOST, FLAG_LOST);
        assert!(f.naks.is_empty());
    }

    #[test]
    fn data_wait_exhaustion_marks_lost() {
        let mut f = Fixture::new(0);
        f.data.put(1, 1).unwrap();
        let mut now = Instant::now();
        let step = f.cfg.data_timeout * 4 + f.cfg.backoff_ivl;
        let mut lost = Vec::new();
        let mut naks_sent = 0;
        let mut rearms = 0;
        let mut last_retries = 0;
        for _ in 0..20 {
            let out = f.scan(2, now);
            naks_sent += out.to_nak.len();
            lost.extend(out.lost);
            let seen = f.naks.get_mut(0).map(|el| (el.state, el.data_retries));
            match seen {
                Some((NakState::WaitNcf, _)) => {
                    assert!(apply_ncf(&mut f.naks, 0, now, &f.cfg, &mut f.timeouts));
                    assert_eq!(f.naks.get_mut(0).unwrap().state, NakState::WaitData);
                }
                Some((NakState::BackOff, retries)) if retries > last_retries => {
                    rearms += 1;
                    last_retries = retries;
                    assert_eq!(f.naks.flags(0) & (FLAG_NAK_SENT | FLAG_NCF_SEEN), 0);
                }
                _ => {}
            }
            now = now + step;
        }
        assert_eq!(lost, vec![0]);
        assert_eq!(naks_sent, f.cfg.data_retries as usize);
        assert_eq!(rearms, f.cfg.data_retries - 1);
        assert_eq!(f.data.flags(0) & FLAG_LOST, FLAG_LOST);
        assert!(f.naks.is_empty());
        let out = f.scan(2, now);
        assert!(out.to_nak.is_empty());
        assert!(f.naks.is_empty());
    }

    #[test]
    fn lost_sequence_is_never_retracked() {
        let mut f = Fixture::new(0);
        f.data.put(1, 1).unwrap();
        f.data.set_flags(0, FLAG_LOST);
        let out = f.scan(2, Instant::now());
        assert!(out.to_nak.is_empty());
        assert!(f.naks.is_empty());
    }

    #[test]
    fn trail_advance_drops_tracking() {
        let mut f = Fixture::new(0);
        f.data.put(5, 5).unwrap();
        let t0 = Instant::now();
        f.scan(6, t0);
        assert_eq!(f.naks.len(), 5);
        assert_eq!(f.pool.in_use(), 5);
        f.data.advance_tail_to(4);
        f.scan(6, t0);
        assert_eq!(f.naks.tail(), 4);
        assert_eq!(f.naks.len(), 1);
        assert_eq!(f.pool.in_use(), 1);
    }

    #[test]
    fn pool_exhaustion_leaves_gaps_untracked() {
        let mut f = Fixture::new(0);
        f.pool = Pool::new("tiny", PoolConfig::with_capacity(2), || {
            NakElement::new(Instant::now())
        });
        f.data.put(4, 4).unwrap();
        let out = f.scan(5, Instant::now());
        assert_eq!(f.naks.len(), 2);
        assert_eq!(out.untracked, 2);
    }

    #[test]
    fn blend_clamps_to_bounds() {
        let cfg = NakConfig::default();
        let mut t = NakTimeouts::new(&cfg);
        for _ in 0..200 {
            t.observe_data(Duration::from_secs(60), &cfg);
        }
        assert_eq!(t.data, cfg.data_timeout * 4);
        for _ in 0..200 {
            t.observe_ncf(Duration::ZERO, &cfg);
        }
        assert_eq!(t.ncf, cfg.ncf_timeout / 4);
    }

    #[test]
    fn random_backoff_within_interval() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..100 {
            assert!(random_backoff(&mut rng, Duration::from_millis(10)) <= Duration::from_millis(10));
        }
        assert_eq!(random_backoff(&mut rng, Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn coalesce_respects_max() {
        let seqs: Vec<u64> = (0..10).collect();
        let reqs = coalesce_requests(&seqs, 4);
        assert_eq!(reqs.len(), 3);
        assert_eq!(reqs[2], vec![8, 9]);
        assert!(coalesce_requests(&[], 4).is_empty());
    }
}
