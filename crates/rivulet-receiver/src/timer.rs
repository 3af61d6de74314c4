//! Timer thread: heartbeats, liveness, stream reports, stream expiry and
//! periodic stats.
//!
//! Each task has its own period; the thread sleeps until the earliest
//! deadline and runs whatever is due.

use quanta::Instant;
use rivulet_transport::wire::Packet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, trace};

use crate::connection::break_connection;
use crate::context::Shared;
use crate::event::BreakReason;
use crate::lifecycle;

/// Upper bound on one timer sleep.
const MAX_SLEEP: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    Heartbeat,
    Liveness,
    Reports,
    Expiry,
    Stats,
}

struct Schedule {
    tasks: Vec<(Task, Duration, Instant)>,
}

impl Schedule {
    fn new(shared: &Shared, now: Instant) -> Self {
        let conn = &shared.config.connection;
        let mut tasks = vec![
            (Task::Heartbeat, heartbeat_tick(conn.heartbeat_timeout), now),
            (Task::Liveness, heartbeat_tick(conn.heartbeat_timeout), now),
            (Task::Reports, conn.report_interval, now + conn.report_interval),
            (Task::Expiry, Duration::from_millis(100), now),
        ];
        let stats = shared.config.limits.stats_interval;
        if !stats.is_zero() {
            tasks.push((Task::Stats, stats, now + stats));
        }
        Schedule { tasks }
    }

    /// Tasks due at `now`; their deadlines move one period past `now`.
    fn due(&mut self, now: Instant) -> Vec<Task> {
        let mut out = Vec::new();
        for (task, period, next) in &mut self.tasks {
            if *next <= now {
                out.push(*task);
                *next = now + *period;
            }
        }
        out
    }

    fn until_next(&self, now: Instant) -> Duration {
        self.tasks
            .iter()
            .map(|(_, _, next)| next.saturating_duration_since(now))
            .min()
            .unwrap_or(MAX_SLEEP)
            .min(MAX_SLEEP)
    }
}

/// Tick for heartbeat and liveness checks, a sixth of the timeout within
/// 5..=100 ms.
fn heartbeat_tick(timeout: Duration) -> Duration {
    (timeout / 6).clamp(Duration::from_millis(5), Duration::from_millis(100))
}

pub(crate) fn run_timer(shared: Arc<Shared>) {
    debug!("timer started");
    let mut schedule = Schedule::new(&shared, Instant::now());
    loop {
        let now = Instant::now();
        for task in schedule.due(now) {
            match task {
                Task::Heartbeat => send_heartbeats(&shared, now),
                Task::Liveness => check_liveness(&shared, now),
                Task::Reports => send_stream_reports(&shared),
                Task::Expiry => expire_streams(&shared, now),
                Task::Stats => log_stats(&shared),
            }
        }
        if !shared.sleep(schedule.until_next(Instant::now())) {
            break;
        }
    }
    debug!("timer stopped");
}

fn send_heartbeats(shared: &Shared, now: Instant) {
    let wall_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    for conn in shared.ready_connections() {
        if !conn.sends_heartbeats {
            continue;
        }
        if conn.idle_tx(now) >= conn.heartbeat_timeout / 3 {
            trace!(conn = %conn.id, "heartbeat");
            conn.queue_frame(&Packet::heartbeat(wall_ms).encode_frame());
        }
    }
}

fn check_liveness(shared: &Shared, now: Instant) {
    for conn in shared.ready_connections() {
        if conn.expects_heartbeats && conn.idle_rx(now) > conn.heartbeat_timeout {
            break_connection(shared, &conn, "heartbeat timeout");
        }
    }
}

/// Tell each peer which of its streams we still hold.
fn send_stream_reports(shared: &Shared) {
    for conn in shared.ready_connections() {
        let keys = conn.stream_keys();
        trace!(conn = %conn.id, streams = keys.len(), "stream report");
        conn.queue_frame(&Packet::stream_report(keys).encode_frame());
    }
}

fn expire_streams(shared: &Shared, now: Instant) {
    let idle_limit = shared.config.stream.inactivity_timeout;
    let mut closing = Vec::new();
    let mut inactive = Vec::new();
    for stream in shared.all_streams() {
        let st = stream.state.lock();
        if st.close_at.is_some_and(|at| at <= now) {
            closing.push(stream.key);
        } else if now.saturating_duration_since(st.last_activity) > idle_limit {
            inactive.push(stream.key);
        }
    }
    for key in closing {
        lifecycle::teardown(shared, key, None);
    }
    for key in inactive {
        info!(stream = %key, "no traffic within inactivity timeout");
        lifecycle::teardown(shared, key, Some(BreakReason::Inactive));
    }
}

fn log_stats(shared: &Shared) {
    let s = shared.stats();
    info!(
        connections = s.connections_active,
        streams = s.streams_active,
        queues = s.queues_active,
        received = s.packets_received,
        stored = s.packets_stored,
        delivered = s.messages_delivered,
        naks = s.naks_sent,
        lost = s.packets_lost,
        packet_buffers = shared.packet_pool.in_use(),
        "receiver stats"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReceiverConfig;

    #[test]
    fn heartbeat_tick_bounds() {
        assert_eq!(heartbeat_tick(Duration::from_millis(12)), Duration::from_millis(5));
        assert_eq!(heartbeat_tick(Duration::from_millis(300)), Duration::from_millis(50));
        assert_eq!(heartbeat_tick(Duration::from_secs(60)), Duration::from_millis(100));
    }

    #[test]
    fn schedule_runs_due_tasks_once_per_period() {
        let mut config = ReceiverConfig::default();
        config.limits.stats_interval = Duration::ZERO;
        let (shared, _ends) = Shared::new(config, None).unwrap();
        let start = Instant::now();
        let mut sched = Schedule::new(&shared, start);
        let first = sched.due(start);
        assert!(first.contains(&Task::Heartbeat));
        assert!(first.contains(&Task::Expiry));
        assert!(!first.contains(&Task::Reports));
        assert!(!first.contains(&Task::Stats));
        assert!(sched.due(start).is_empty());
        assert!(sched.until_next(start) <= MAX_SLEEP);

        let later = start + Duration::from_secs(2);
        assert!(sched.due(later).contains(&Task::Reports));
    }
}
