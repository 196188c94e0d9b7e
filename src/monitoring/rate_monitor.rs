//! Tick-driven reconciliation of the OS connection table with per-connection
//! counters.
//!
//! Every tick enumerates established connections, reads their counters when
//! detailed mode is on, diffs them against the previous tick, rolls the rates
//! up per process, evicts samples for vanished connections, and publishes the
//! results. A connection is "active" only if it produced a non-zero rate this
//! tick; connections without counters are counted but never active.

use crate::error::Result;
use crate::events::ConnectionKey;
use crate::platform::estats::{StatsOutcome, StatsProvider, UnavailableReason};
use crate::platform::tcp_table::{ConnectionInfo, ConnectionSource};
use crate::state::rate::{rate_delta, secs_between};
use crate::state::{ConnectionObservation, ConnectionState, GlobalNetworkMonitor};
use crate::utils::scheduler;
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConnectionRate {
    pub key: ConnectionKey,
    pub send_rate: f64,
    pub receive_rate: f64,
    pub stats_available: bool,
}

impl ConnectionRate {
    pub fn is_active(&self) -> bool {
        self.send_rate > 0.0 || self.receive_rate > 0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessNetworkStats {
    pub pid: u32,
    pub bytes_in_per_sec: f64,
    pub bytes_out_per_sec: f64,
    pub total_per_sec: f64,
    pub connection_count: usize,
    pub active_connections: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSnapshot {
    pub timestamp: DateTime<Utc>,
    pub total_connections: usize,
    pub active_connections: usize,
    pub stats_unavailable: usize,
    pub evicted: usize,
    pub processing_time_ms: f64,
    pub cache_size: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RateEvent {
    ProcessUpdated(ProcessNetworkStats),
    Batch(Vec<ProcessNetworkStats>),
    Performance(PerformanceSnapshot),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub connections: Vec<ConnectionRate>,
    pub processes: Vec<ProcessNetworkStats>,
    pub performance: PerformanceSnapshot,
}

#[derive(Debug, Clone, Copy)]
struct CachedSample {
    counters: Option<(u64, u64)>,
    at: DateTime<Utc>,
    misses: u32,
}

#[derive(Debug, Clone)]
pub struct RateSettings {
    pub detailed_stats: bool,
    pub max_elapsed_secs: f64,
    /// Consecutive absent ticks before a cached sample is dropped.
    pub eviction_cycles: u32,
}

impl Default for RateSettings {
    fn default() -> Self {
        Self {
            detailed_stats: true,
            max_elapsed_secs: crate::state::rate::DEFAULT_MAX_ELAPSED_SECS,
            eviction_cycles: 1,
        }
    }
}

pub struct RateMonitor {
    source: Arc<dyn ConnectionSource>,
    stats: Arc<dyn StatsProvider>,
    settings: RateSettings,
    monitor: Option<Arc<GlobalNetworkMonitor>>,
    events: Option<Sender<RateEvent>>,
    dropped_events: AtomicU64,
    cache: Mutex<HashMap<ConnectionKey, CachedSample>>,
    enable_attempted: Mutex<HashSet<ConnectionKey>>,
    latest: Mutex<Vec<ProcessNetworkStats>>,
}

impl RateMonitor {
    pub fn new(source: Arc<dyn ConnectionSource>, stats: Arc<dyn StatsProvider>, settings: RateSettings) -> Self {
        Self {
            source,
            stats,
            settings,
            monitor: None,
            events: None,
            dropped_events: AtomicU64::new(0),
            cache: Mutex::new(HashMap::new()),
            enable_attempted: Mutex::new(HashSet::new()),
            latest: Mutex::new(Vec::new()),
        }
    }

    /// Counter samples and presence are pushed into `monitor` every tick.
    pub fn with_monitor(mut self, monitor: Arc<GlobalNetworkMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_events(mut self, events: Sender<RateEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Events lost because the subscriber queue was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    pub fn cache_size(&self) -> usize {
        self.cache.lock().len()
    }

    fn fetch(&self, connection: &ConnectionInfo) -> StatsOutcome {
        if !self.settings.detailed_stats {
            return StatsOutcome::Unavailable(UnavailableReason::NotRequested);
        }
        let outcome = self.stats.get_stats(connection);
        if outcome == StatsOutcome::Unavailable(UnavailableReason::Disabled)
            && self.enable_attempted.lock().insert(connection.key())
        {
            // Counters start from zero once enabled; the next tick picks them up.
            self.stats.enable_stats(connection);
        }
        outcome
    }

    pub fn tick(&self) -> Result<TickReport> {
        self.tick_at(Utc::now())
    }

    pub fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let started = Instant::now();
        let connections = self.source.enumerate(true)?;

        let mut rates = Vec::with_capacity(connections.len());
        let mut seen = HashSet::with_capacity(connections.len());
        let mut unavailable = 0usize;
        {
            let mut cache = self.cache.lock();
            for connection in &connections {
                let key = connection.key();
                seen.insert(key);
                let outcome = self.fetch(connection);

                let previous = cache.get(&key).copied();
                let rate = match outcome {
                    StatsOutcome::Available(stats) => {
                        let (send_rate, receive_rate) = match previous.and_then(|p| p.counters.map(|c| (c, p.at))) {
                            Some(((prev_sent, prev_received), prev_at)) => {
                                let elapsed = secs_between(prev_at, now);
                                let max = self.settings.max_elapsed_secs;
                                (
                                    rate_delta(prev_sent, stats.bytes_sent, elapsed, max).unwrap_or(0.0),
                                    rate_delta(prev_received, stats.bytes_received, elapsed, max).unwrap_or(0.0),
                                )
                            }
                            None => (0.0, 0.0),
                        };
                        cache.insert(
                            key,
                            CachedSample {
                                counters: Some((stats.bytes_sent, stats.bytes_received)),
                                at: now,
                                misses: 0,
                            },
                        );
                        if let Some(monitor) = &self.monitor {
                            monitor.update_connection(ConnectionObservation::Sample {
                                key,
                                bytes_sent: stats.bytes_sent,
                                bytes_received: stats.bytes_received,
                                at: now,
                            });
                        }
                        ConnectionRate {
                            key,
                            send_rate,
                            receive_rate,
                            stats_available: true,
                        }
                    }
                    StatsOutcome::Unavailable(reason) => {
                        unavailable += 1;
                        log::trace!("No counters for {}: {:?}", key, reason);
                        cache.insert(
                            key,
                            CachedSample {
                                counters: None,
                                at: now,
                                misses: 0,
                            },
                        );
                        if let Some(monitor) = &self.monitor {
                            monitor.update_connection(ConnectionObservation::Seen {
                                key,
                                state: ConnectionState::Connected,
                                at: now,
                            });
                        }
                        ConnectionRate {
                            key,
                            send_rate: 0.0,
                            receive_rate: 0.0,
                            stats_available: false,
                        }
                    }
                };
                rates.push(rate);
            }
        }

        let evicted = self.evict_absent(&seen);
        let processes = group_by_process(&rates);
        let active = rates.iter().filter(|r| r.is_active()).count();

        let performance = PerformanceSnapshot {
            timestamp: now,
            total_connections: rates.len(),
            active_connections: active,
            stats_unavailable: unavailable,
            evicted,
            processing_time_ms: started.elapsed().as_secs_f64() * 1000.0,
            cache_size: self.cache_size(),
        };
        log::debug!(
            "Rate tick: {} connections, {} active, {} without counters, {} evicted, {:.2} ms, cache {}",
            performance.total_connections,
            performance.active_connections,
            performance.stats_unavailable,
            performance.evicted,
            performance.processing_time_ms,
            performance.cache_size
        );

        let active_processes: Vec<ProcessNetworkStats> =
            processes.iter().filter(|p| p.total_per_sec > 0.0).cloned().collect();
        *self.latest.lock() = active_processes.clone();
        self.publish(&active_processes, &performance);

        Ok(TickReport {
            connections: rates,
            processes,
            performance,
        })
    }

    /// Ages every cached sample not seen this tick and drops the ones that
    /// reached the configured number of misses.
    fn evict_absent(&self, seen: &HashSet<ConnectionKey>) -> usize {
        let limit = self.settings.eviction_cycles.max(1);
        let mut cache = self.cache.lock();
        let mut evicted = Vec::new();
        for (key, sample) in cache.iter_mut() {
            if seen.contains(key) {
                continue;
            }
            sample.misses += 1;
            if sample.misses >= limit {
                evicted.push(*key);
            }
        }
        for key in &evicted {
            cache.remove(key);
        }
        drop(cache);

        if !evicted.is_empty() {
            let mut attempted = self.enable_attempted.lock();
            for key in &evicted {
                attempted.remove(key);
            }
        }
        evicted.len()
    }

    fn publish(&self, active: &[ProcessNetworkStats], performance: &PerformanceSnapshot) {
        let Some(events) = &self.events else {
            return;
        };
        let outgoing = active
            .iter()
            .map(|p| RateEvent::ProcessUpdated(p.clone()))
            .chain([RateEvent::Batch(active.to_vec()), RateEvent::Performance(performance.clone())]);
        for event in outgoing {
            if events.try_send(event).is_err() {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Processes from the latest tick ranked by total rate. Processes without
    /// a non-zero rate never appear.
    pub fn top_processes(&self, n: usize) -> Vec<ProcessNetworkStats> {
        let mut ranked = self.latest.lock().clone();
        ranked.sort_by(|a, b| b.total_per_sec.total_cmp(&a.total_per_sec).then(a.pid.cmp(&b.pid)));
        ranked.truncate(n);
        ranked
    }

    /// Ticks every `interval` while `running` stays set. A failing tick is
    /// logged and skipped; privilege failures are reported once.
    pub fn start(self: &Arc<Self>, interval: Duration, running: Arc<AtomicBool>) -> std::io::Result<JoinHandle<()>> {
        let this = Arc::clone(self);
        let mut privilege_reported = false;
        scheduler::spawn_periodic("rate-monitor", interval, running, move || {
            if let Err(e) = this.tick() {
                if e.is_privilege() {
                    if !privilege_reported {
                        log::warn!("Rate monitor running without connection table access: {}", e);
                        privilege_reported = true;
                    }
                } else {
                    log::warn!("Rate tick skipped: {}", e);
                }
            }
        })
    }
}

pub const EVENT_QUEUE_CAPACITY: usize = 256;

pub fn event_channel() -> (Sender<RateEvent>, Receiver<RateEvent>) {
    crossbeam_channel::bounded(EVENT_QUEUE_CAPACITY)
}

pub fn log_rate_event(event: &RateEvent) {
    match event {
        RateEvent::ProcessUpdated(p) => log::trace!(
            "PID {} in {:.0} B/s out {:.0} B/s ({}/{} connections active)",
            p.pid,
            p.bytes_in_per_sec,
            p.bytes_out_per_sec,
            p.active_connections,
            p.connection_count
        ),
        RateEvent::Batch(batch) => {
            let total: f64 = batch.iter().map(|p| p.total_per_sec).sum();
            log::debug!("{} active processes, {:.0} B/s combined", batch.len(), total);
        }
        RateEvent::Performance(perf) => {
            if perf.stats_unavailable > 0 && perf.stats_unavailable == perf.total_connections {
                log::debug!("No connection exposes counters ({} connections)", perf.total_connections);
            }
        }
    }
}

/// Drains rate events into the log until `running` is cleared or the
/// monitor is dropped.
pub fn start_event_logger(events: Receiver<RateEvent>, running: Arc<AtomicBool>) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("rate-events".to_string())
        .spawn(move || {
            let mut consumed = 0u64;
            while running.load(Ordering::Relaxed) {
                match events.recv_timeout(Duration::from_millis(200)) {
                    Ok(event) => {
                        log_rate_event(&event);
                        consumed += 1;
                    }
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            log::debug!("Rate event logger stopped after {} events", consumed);
        })
}

/// Sums connection rates per process. Only active connections contribute to
/// the rate sums; every enumerated connection counts toward `connection_count`.
pub fn group_by_process(rates: &[ConnectionRate]) -> Vec<ProcessNetworkStats> {
    let mut by_pid: BTreeMap<u32, ProcessNetworkStats> = BTreeMap::new();
    for rate in rates {
        let entry = by_pid.entry(rate.key.pid).or_insert_with(|| ProcessNetworkStats {
            pid: rate.key.pid,
            bytes_in_per_sec: 0.0,
            bytes_out_per_sec: 0.0,
            total_per_sec: 0.0,
            connection_count: 0,
            active_connections: 0,
        });
        entry.connection_count += 1;
        if rate.is_active() {
            entry.active_connections += 1;
            entry.bytes_in_per_sec += rate.receive_rate;
            entry.bytes_out_per_sec += rate.send_rate;
            entry.total_per_sec += rate.send_rate + rate.receive_rate;
        }
    }
    by_pid.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MonitorError;
    use crate::platform::estats::ConnectionStats;
    use crate::platform::tcp_table::TcpState;
    use crate::utils::scheduler::join_with_timeout;
    use chrono::Duration as ChronoDuration;
    use std::net::SocketAddr;

    #[derive(Default)]
    struct FakeSource {
        connections: Mutex<Vec<ConnectionInfo>>,
        fail: Mutex<bool>,
    }

    impl ConnectionSource for FakeSource {
        fn enumerate(&self, only_established: bool) -> Result<Vec<ConnectionInfo>> {
            if *self.fail.lock() {
                return Err(MonitorError::BufferRace {
                    call: "GetExtendedTcpTable",
                    attempts: 2,
                });
            }
            let all = self.connections.lock().clone();
            Ok(all
                .into_iter()
                .filter(|c| !only_established || c.is_established())
                .collect())
        }
    }

    #[derive(Default)]
    struct FakeStats {
        by_port: Mutex<HashMap<u16, StatsOutcome>>,
        enable_calls: Mutex<u32>,
    }

    impl FakeStats {
        fn set(&self, port: u16, sent: u64, received: u64) {
            self.by_port.lock().insert(
                port,
                StatsOutcome::Available(ConnectionStats {
                    bytes_sent: sent,
                    bytes_received: received,
                    ..Default::default()
                }),
            );
        }
    }

    impl StatsProvider for FakeStats {
        fn get_stats(&self, connection: &ConnectionInfo) -> StatsOutcome {
            self.by_port
                .lock()
                .get(&connection.local.port())
                .copied()
                .unwrap_or(StatsOutcome::Unavailable(UnavailableReason::Disabled))
        }

        fn enable_stats(&self, _connection: &ConnectionInfo) -> bool {
            *self.enable_calls.lock() += 1;
            false
        }
    }

    fn conn(pid: u32, local_port: u16) -> ConnectionInfo {
        ConnectionInfo {
            pid,
            local: SocketAddr::new("192.168.1.10".parse().unwrap(), local_port),
            remote: "140.82.112.3:443".parse().unwrap(),
            state: TcpState::Established,
        }
    }

    fn setup(settings: RateSettings) -> (Arc<FakeSource>, Arc<FakeStats>, RateMonitor) {
        let source = Arc::new(FakeSource::default());
        let stats = Arc::new(FakeStats::default());
        let monitor = RateMonitor::new(source.clone(), stats.clone(), settings);
        (source, stats, monitor)
    }

    #[test]
    fn rates_come_from_counter_deltas() {
        let (source, stats, monitor) = setup(RateSettings::default());
        source.connections.lock().push(conn(10, 5000));
        let t0 = Utc::now();

        stats.set(5000, 1_000, 2_000);
        let first = monitor.tick_at(t0).unwrap();
        assert_eq!(first.connections[0].send_rate, 0.0);

        stats.set(5000, 3_000, 2_500);
        let second = monitor.tick_at(t0 + ChronoDuration::seconds(2)).unwrap();
        assert_eq!(second.connections[0].send_rate, 1_000.0);
        assert_eq!(second.connections[0].receive_rate, 250.0);
        assert_eq!(second.processes[0].total_per_sec, 1_250.0);
    }

    #[test]
    fn counter_reset_and_missed_ticks_yield_zero() {
        let (source, stats, monitor) = setup(RateSettings::default());
        source.connections.lock().push(conn(10, 5000));
        let t0 = Utc::now();

        stats.set(5000, 10_000, 0);
        monitor.tick_at(t0).unwrap();
        stats.set(5000, 100, 0);
        let reset = monitor.tick_at(t0 + ChronoDuration::seconds(1)).unwrap();
        assert_eq!(reset.connections[0].send_rate, 0.0);

        stats.set(5000, 100_000, 0);
        let gap = monitor.tick_at(t0 + ChronoDuration::seconds(120)).unwrap();
        assert_eq!(gap.connections[0].send_rate, 0.0);
        assert!(gap.processes[0].total_per_sec == 0.0);
    }

    #[test]
    fn unavailable_stats_count_toward_total_but_not_active() {
        let (source, stats, monitor) = setup(RateSettings::default());
        source.connections.lock().extend([conn(7, 6000), conn(7, 6001)]);
        let t0 = Utc::now();

        stats.set(6000, 0, 0);
        monitor.tick_at(t0).unwrap();
        stats.set(6000, 4_000, 0);
        let report = monitor.tick_at(t0 + ChronoDuration::seconds(1)).unwrap();

        assert_eq!(report.performance.total_connections, 2);
        assert_eq!(report.performance.active_connections, 1);
        assert_eq!(report.performance.stats_unavailable, 1);
        let process = &report.processes[0];
        assert_eq!(process.connection_count, 2);
        assert_eq!(process.active_connections, 1);
        assert_eq!(process.bytes_out_per_sec, 4_000.0);
        assert!(!report.connections.iter().find(|c| c.key.local.port() == 6001).unwrap().stats_available);

        // Enabling is attempted once per connection, not every tick.
        assert_eq!(*stats.enable_calls.lock(), 1);
    }

    #[test]
    fn detailed_mode_off_synthesizes_unavailable() {
        let (source, stats, monitor) = setup(RateSettings {
            detailed_stats: false,
            ..RateSettings::default()
        });
        source.connections.lock().push(conn(1, 7000));
        stats.set(7000, 100, 100);
        let report = monitor.tick_at(Utc::now()).unwrap();
        assert!(!report.connections[0].stats_available);
        assert_eq!(*stats.enable_calls.lock(), 0);
        assert!(monitor.top_processes(10).is_empty());
    }

    #[test]
    fn absent_connections_are_evicted_after_n_cycles_exactly_once() {
        let (source, stats, monitor) = setup(RateSettings {
            eviction_cycles: 3,
            ..RateSettings::default()
        });
        source.connections.lock().extend([conn(1, 8000), conn(1, 8001)]);
        stats.set(8000, 1, 1);
        stats.set(8001, 1, 1);
        let t0 = Utc::now();
        monitor.tick_at(t0).unwrap();
        assert_eq!(monitor.cache_size(), 2);

        source.connections.lock().retain(|c| c.local.port() == 8000);
        let evictions: Vec<usize> = (1..=4)
            .map(|i| monitor.tick_at(t0 + ChronoDuration::seconds(i)).unwrap().performance.evicted)
            .collect();
        assert_eq!(evictions, vec![0, 0, 1, 0]);
        assert_eq!(monitor.cache_size(), 1);
    }

    #[test]
    fn failed_enumeration_surfaces_as_error() {
        let (source, _stats, monitor) = setup(RateSettings::default());
        *source.fail.lock() = true;
        assert!(matches!(monitor.tick_at(Utc::now()), Err(MonitorError::BufferRace { .. })));
    }

    #[test]
    fn events_are_published_for_active_processes() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let source = Arc::new(FakeSource::default());
        let stats = Arc::new(FakeStats::default());
        let monitor = RateMonitor::new(source.clone(), stats.clone(), RateSettings::default()).with_events(tx);
        source.connections.lock().extend([conn(1, 9000), conn(2, 9001)]);
        let t0 = Utc::now();
        stats.set(9000, 0, 0);
        stats.set(9001, 0, 0);
        monitor.tick_at(t0).unwrap();
        rx.try_iter().for_each(drop);

        stats.set(9000, 500, 0);
        monitor.tick_at(t0 + ChronoDuration::seconds(1)).unwrap();
        let events: Vec<RateEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], RateEvent::ProcessUpdated(p) if p.pid == 1));
        assert!(matches!(&events[1], RateEvent::Batch(b) if b.len() == 1));
        assert!(matches!(&events[2], RateEvent::Performance(p) if p.total_connections == 2));
        assert_eq!(monitor.top_processes(5)[0].pid, 1);
    }

    fn run_ticks(monitor: &RateMonitor, stats: &FakeStats, ticks: u64, pending: &Receiver<RateEvent>, drain: bool) {
        let t0 = Utc::now();
        for i in 0..ticks {
            stats.set(9100, i * 1_000, 0);
            monitor.tick_at(t0 + ChronoDuration::seconds(i as i64)).unwrap();
            let deadline = Instant::now() + Duration::from_secs(5);
            while drain && !pending.is_empty() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    #[test]
    fn full_event_queue_counts_drops() {
        let (tx, rx) = event_channel();
        let source = Arc::new(FakeSource::default());
        let stats = Arc::new(FakeStats::default());
        let monitor = RateMonitor::new(source.clone(), stats.clone(), RateSettings::default()).with_events(tx);
        source.connections.lock().push(conn(7, 9100));

        let ticks = EVENT_QUEUE_CAPACITY as u64 / 2;
        run_ticks(&monitor, &stats, ticks, &rx, false);
        assert_eq!(rx.len(), EVENT_QUEUE_CAPACITY);
        assert_eq!(monitor.dropped_events(), 2 + 3 * (ticks - 1) - EVENT_QUEUE_CAPACITY as u64);
    }

    #[test]
    fn event_logger_keeps_the_queue_drained() {
        let (tx, rx) = event_channel();
        let source = Arc::new(FakeSource::default());
        let stats = Arc::new(FakeStats::default());
        let monitor = RateMonitor::new(source.clone(), stats.clone(), RateSettings::default()).with_events(tx);
        source.connections.lock().push(conn(7, 9100));
        let pending = rx.clone();
        let running = Arc::new(AtomicBool::new(true));
        let handle = start_event_logger(rx, Arc::clone(&running)).unwrap();

        run_ticks(&monitor, &stats, EVENT_QUEUE_CAPACITY as u64 / 2, &pending, true);
        assert_eq!(monitor.dropped_events(), 0);

        // Dropping the monitor disconnects the queue and ends the logger.
        drop(monitor);
        assert!(join_with_timeout(handle, Duration::from_secs(5)).is_ok());
        assert!(pending.is_empty());
    }

    #[test]
    fn reconciled_samples_reach_the_monitor_snapshot() {
        let state = Arc::new(GlobalNetworkMonitor::default());
        let source = Arc::new(FakeSource::default());
        let stats = Arc::new(FakeStats::default());
        let monitor = RateMonitor::new(source.clone(), stats.clone(), RateSettings::default())
            .with_monitor(Arc::clone(&state));
        source.connections.lock().push(conn(4242, 50123));
        let t0 = Utc::now();

        for (i, sent) in [0u64, 500_000, 1_000_000].into_iter().enumerate() {
            stats.set(50123, sent, 0);
            monitor.tick_at(t0 + ChronoDuration::seconds(i as i64)).unwrap();
        }

        let snapshot = state.get_snapshot_at(t0 + ChronoDuration::seconds(2));
        let app = snapshot.application(4242).unwrap();
        assert_eq!(app.total_bytes_sent, 1_000_000);
        assert!((app.total_send_speed - 500_000.0).abs() < 1.0);
    }
}
