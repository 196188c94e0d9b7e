//! Authoritative store for everything the monitor knows.
//!
//! All maps sit behind one readers-writer lock so that a snapshot never sees a
//! connection whose process was removed in between. Writers come from the
//! capture thread, the rate monitor and the maintenance sweeps; none of them
//! touch the maps directly.

pub mod rate;
pub mod records;
pub mod snapshot;

pub use rate::{compute_rate, rate_delta};
pub use records::{
    ApplicationRecord, ConnectionRecord, ConnectionState, DnsResolveInfo, ProcessNetworkInfo,
    TrafficDelta, TrafficTotals,
};
pub use snapshot::{
    ApplicationSnapshot, ConnectionSnapshot, IpTraffic, NetworkMonitorSnapshot, PortTraffic,
};

use crate::config::MonitorConfig;
use crate::events::{ConnectionKey, Direction, Protocol};
use crate::platform::process::{fallback_name, ProgramInfo};
use chrono::{DateTime, Duration, Utc};
use crossbeam_channel::Sender;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Minimum spacing between two rate recomputations of one record.
    pub rate_window: Duration,
    pub max_elapsed_secs: f64,
    /// Rates of records idle for longer read as zero.
    pub rate_stale: Duration,
    pub top_n: usize,
    pub tcp_idle_timeout: Duration,
    pub process_idle_timeout: Duration,
    pub dns_ttl: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self::from_config(&MonitorConfig::default())
    }
}

impl MonitorSettings {
    pub fn from_config(config: &MonitorConfig) -> Self {
        let secs = |s: u64| Duration::seconds(s.min(i64::MAX as u64) as i64);
        Self {
            rate_window: Duration::milliseconds(config.cleanup.rate_window_ms.min(i64::MAX as u64) as i64),
            max_elapsed_secs: config.rate.max_elapsed_secs as f64,
            rate_stale: secs(config.cleanup.rate_stale_secs),
            top_n: config.rate.top_n,
            tcp_idle_timeout: secs(config.cleanup.tcp_idle_timeout_secs),
            process_idle_timeout: secs(config.cleanup.process_idle_timeout_secs),
            dns_ttl: secs(config.cleanup.dns_ttl_secs),
        }
    }
}

/// One fact about a connection, from either the capture layer or the rate
/// monitor.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionObservation {
    /// Payload bytes carried by one send or receive event.
    Traffic {
        key: ConnectionKey,
        direction: Direction,
        bytes: u64,
        at: DateTime<Utc>,
    },
    /// A lifecycle transition (connect, accept, disconnect).
    State {
        key: ConnectionKey,
        state: ConnectionState,
        direction: Direction,
        at: DateTime<Utc>,
    },
    /// Cumulative counters read from the statistics facility.
    Sample {
        key: ConnectionKey,
        bytes_sent: u64,
        bytes_received: u64,
        at: DateTime<Utc>,
    },
    /// Enumerated without usable counters.
    Seen {
        key: ConnectionKey,
        state: ConnectionState,
        at: DateTime<Utc>,
    },
}

impl ConnectionObservation {
    pub fn key(&self) -> &ConnectionKey {
        match self {
            Self::Traffic { key, .. }
            | Self::State { key, .. }
            | Self::Sample { key, .. }
            | Self::Seen { key, .. } => key,
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Self::Traffic { at, .. }
            | Self::State { at, .. }
            | Self::Sample { at, .. }
            | Self::Seen { at, .. } => *at,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub connections: usize,
    pub processes: usize,
    pub applications: usize,
    pub dns_entries: usize,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.connections + self.processes + self.applications + self.dns_entries
    }
}

#[derive(Default)]
struct Inner {
    applications: HashMap<u32, ApplicationRecord>,
    processes: HashMap<u32, ProcessNetworkInfo>,
    connections: HashMap<ConnectionKey, ConnectionRecord>,
    dns: HashMap<String, DnsResolveInfo>,
    ports: HashMap<u16, TrafficTotals>,
    ips: HashMap<String, TrafficTotals>,
}

fn creditable_ip(ip: &IpAddr) -> bool {
    !ip.is_unspecified()
}

impl Inner {
    /// Returns true when the process record was created.
    fn ensure_process(&mut self, pid: u32, at: DateTime<Utc>) -> (&mut ProcessNetworkInfo, bool) {
        let mut created = false;
        let process = self.processes.entry(pid).or_insert_with(|| {
            created = true;
            ProcessNetworkInfo::new(pid, fallback_name(pid), at)
        });
        (process, created)
    }

    fn remove_connection(&mut self, key: &ConnectionKey) -> bool {
        let removed = self.connections.remove(key).is_some();
        if let Some(process) = self.processes.get_mut(&key.pid) {
            process.connections.remove(key);
        }
        removed
    }

    fn credit_port(&mut self, port: u16, sent: u64, received: u64, at: DateTime<Utc>) {
        if port == 0 {
            return;
        }
        let totals = self.ports.entry(port).or_insert_with(|| TrafficTotals::new(at));
        totals.bytes_sent = totals.bytes_sent.saturating_add(sent);
        totals.bytes_received = totals.bytes_received.saturating_add(received);
        totals.last_update = at;
    }

    fn credit_ip(&mut self, ip: &IpAddr, sent: u64, received: u64, at: DateTime<Utc>) {
        if !creditable_ip(ip) {
            return;
        }
        let totals = self.ips.entry(ip.to_string()).or_insert_with(|| TrafficTotals::new(at));
        totals.bytes_sent = totals.bytes_sent.saturating_add(sent);
        totals.bytes_received = totals.bytes_received.saturating_add(received);
        totals.last_update = at;
    }

    /// Local endpoint is credited with sent bytes, remote endpoint with
    /// received bytes.
    fn credit(&mut self, local: SocketAddr, remote: SocketAddr, delta: TrafficDelta, at: DateTime<Utc>) {
        if delta.sent > 0 {
            self.credit_port(local.port(), delta.sent, 0, at);
            self.credit_ip(&local.ip(), delta.sent, 0, at);
        }
        if delta.received > 0 {
            self.credit_port(remote.port(), 0, delta.received, at);
            self.credit_ip(&remote.ip(), 0, delta.received, at);
        }
    }

    fn domain_for(&self, ip: &IpAddr) -> Option<String> {
        self.dns.get(&ip.to_string()).map(|d| d.domain.clone())
    }

    fn connection_snapshot(&self, record: &ConnectionRecord, now: DateTime<Utc>, stale: Duration) -> ConnectionSnapshot {
        let (send_speed, receive_speed) = record.current_rates(now, stale);
        ConnectionSnapshot {
            process_id: record.key.pid,
            protocol: record.key.protocol,
            local_address: record.key.local.ip().to_string(),
            local_port: record.key.local.port(),
            remote_address: record.key.remote.ip().to_string(),
            remote_port: record.key.remote.port(),
            remote_domain: self.domain_for(&record.key.remote.ip()),
            state: record.state,
            direction: record.direction,
            start_time: record.start_time,
            last_activity: record.last_activity,
            bytes_sent: record.bytes_sent,
            bytes_received: record.bytes_received,
            send_speed,
            receive_speed,
            is_active: send_speed > 0.0 || receive_speed > 0.0,
        }
    }

    fn application_snapshot(&self, process: &ProcessNetworkInfo, now: DateTime<Utc>, stale: Duration) -> ApplicationSnapshot {
        let connections = process
            .connections
            .iter()
            .filter_map(|key| self.connections.get(key))
            .map(|record| self.connection_snapshot(record, now, stale))
            .collect();
        ApplicationSnapshot {
            process_id: process.pid,
            process_name: process.name.clone(),
            program_info: self.applications.get(&process.pid).map(|a| a.info.clone()),
            first_seen: process.first_seen,
            last_active: process.last_active,
            total_connections: 0,
            active_connections: 0,
            total_bytes_sent: 0,
            total_bytes_received: 0,
            total_send_speed: 0.0,
            total_receive_speed: 0.0,
            connections,
        }
        .rollup()
    }

    fn top_ports(&self, n: usize) -> Vec<PortTraffic> {
        let mut ports: Vec<PortTraffic> = self
            .ports
            .iter()
            .map(|(port, totals)| PortTraffic::new(*port, totals))
            .collect();
        ports.sort_by(|a, b| b.total().cmp(&a.total()).then(a.port.cmp(&b.port)));
        ports.truncate(n);
        ports
    }

    fn top_ips(&self, n: usize) -> Vec<IpTraffic> {
        let mut ips: Vec<IpTraffic> = self
            .ips
            .iter()
            .map(|(ip, totals)| IpTraffic {
                ip: ip.clone(),
                domain: self.dns.get(ip).map(|d| d.domain.clone()),
                bytes_sent: totals.bytes_sent,
                bytes_received: totals.bytes_received,
                last_update: totals.last_update,
            })
            .collect();
        ips.sort_by(|a, b| b.total().cmp(&a.total()).then_with(|| a.ip.cmp(&b.ip)));
        ips.truncate(n);
        ips
    }
}

pub struct GlobalNetworkMonitor {
    inner: RwLock<Inner>,
    settings: MonitorSettings,
    metadata_requests: Option<Sender<u32>>,
}

impl Default for GlobalNetworkMonitor {
    fn default() -> Self {
        Self::new(MonitorSettings::default())
    }
}

impl GlobalNetworkMonitor {
    pub fn new(settings: MonitorSettings) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            settings,
            metadata_requests: None,
        }
    }

    /// Newly seen process ids are sent here for metadata resolution.
    pub fn with_metadata_requests(mut self, requests: Sender<u32>) -> Self {
        self.metadata_requests = Some(requests);
        self
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    fn request_metadata(&self, pid: u32) {
        if let Some(tx) = &self.metadata_requests {
            let _ = tx.try_send(pid);
        }
    }

    pub fn update_application(&self, pid: u32, info: ProgramInfo) {
        self.update_application_at(pid, info, Utc::now());
    }

    pub fn update_application_at(&self, pid: u32, info: ProgramInfo, at: DateTime<Utc>) {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        if let Some(process) = inner.processes.get_mut(&pid) {
            if process.name == fallback_name(pid) && !info.name.is_empty() {
                process.name = info.name.clone();
            }
        }
        match inner.applications.get_mut(&pid) {
            Some(app) => {
                app.info = info;
                app.last_update = at;
            }
            None => {
                inner.applications.insert(
                    pid,
                    ApplicationRecord {
                        pid,
                        info,
                        first_seen: at,
                        last_update: at,
                    },
                );
            }
        }
    }

    pub fn update_process(&self, pid: u32, name: &str, thread_id: Option<u32>) {
        self.update_process_at(pid, name, thread_id, Utc::now());
    }

    /// Placeholder names never replace a resolved one.
    pub fn update_process_at(&self, pid: u32, name: &str, thread_id: Option<u32>, at: DateTime<Utc>) {
        let created = {
            let mut inner = self.inner.write();
            let (process, created) = inner.ensure_process(pid, at);
            let placeholder = fallback_name(pid);
            if !name.is_empty() && (name != placeholder || process.name == placeholder) {
                process.name = name.to_string();
            }
            if thread_id.is_some() {
                process.last_thread_id = thread_id;
            }
            process.touch(at);
            created
        };
        if created {
            self.request_metadata(pid);
        }
    }

    pub fn update_connection(&self, observation: ConnectionObservation) {
        let key = *observation.key();
        let at = observation.at();
        let window = self.settings.rate_window;
        let max_elapsed = self.settings.max_elapsed_secs;

        let created = {
            let mut guard = self.inner.write();
            let inner = &mut *guard;

            let delta = match observation {
                ConnectionObservation::Traffic { direction, bytes, .. } => {
                    let record = inner
                        .connections
                        .entry(key)
                        .or_insert_with(|| ConnectionRecord::new(key, ConnectionState::Connected, direction, at));
                    let delta = record.add_traffic(direction, bytes, at);
                    record.refresh_rates(at, window, max_elapsed);
                    delta
                }
                ConnectionObservation::State { state, direction, .. } => {
                    match inner.connections.get_mut(&key) {
                        Some(record) if state == ConnectionState::Disconnected => {
                            record.mark_disconnected(at);
                        }
                        Some(record) if record.state == ConnectionState::Disconnected => {
                            // Same five-tuple reopened: a new logical connection.
                            *record = ConnectionRecord::new(key, state, direction, at);
                        }
                        Some(record) => {
                            record.state = state;
                            record.direction = direction;
                            record.touch(at);
                        }
                        None if state == ConnectionState::Disconnected => return,
                        None => {
                            inner
                                .connections
                                .insert(key, ConnectionRecord::new(key, state, direction, at));
                        }
                    }
                    TrafficDelta::default()
                }
                ConnectionObservation::Sample { bytes_sent, bytes_received, .. } => {
                    match inner.connections.get_mut(&key) {
                        Some(record) => {
                            let delta = record.apply_sample(bytes_sent, bytes_received, at);
                            record.refresh_rates(at, window, max_elapsed);
                            delta
                        }
                        None => {
                            inner.connections.insert(
                                key,
                                ConnectionRecord::from_sample(key, bytes_sent, bytes_received, at),
                            );
                            TrafficDelta {
                                sent: bytes_sent,
                                received: bytes_received,
                            }
                        }
                    }
                }
                ConnectionObservation::Seen { state, .. } => {
                    match inner.connections.get_mut(&key) {
                        Some(record) => {
                            record.touch(at);
                            if matches!(record.state, ConnectionState::Connecting | ConnectionState::Unknown) {
                                record.state = state;
                            }
                            record.refresh_rates(at, window, max_elapsed);
                        }
                        None => {
                            inner
                                .connections
                                .insert(key, ConnectionRecord::new(key, state, Direction::Outbound, at));
                        }
                    }
                    TrafficDelta::default()
                }
            };

            let (process, created) = inner.ensure_process(key.pid, at);
            process.connections.insert(key);
            process.touch(at);

            if !delta.is_empty() {
                inner.credit(key.local, key.remote, delta, at);
                if let Some(dns) = inner.dns.get_mut(&key.remote.ip().to_string()) {
                    dns.last_used = at;
                }
            }
            created
        };

        if created {
            self.request_metadata(key.pid);
        }
    }

    pub fn update_dns(&self, ip: &str, domain: &str, query_type: u16) {
        self.update_dns_at(ip, domain, query_type, Utc::now());
    }

    pub fn update_dns_at(&self, ip: &str, domain: &str, query_type: u16, at: DateTime<Utc>) {
        if ip.is_empty() || domain.is_empty() {
            return;
        }
        let mut inner = self.inner.write();
        match inner.dns.get_mut(ip) {
            Some(info) => info.record(domain, query_type, at),
            None => {
                inner
                    .dns
                    .insert(ip.to_string(), DnsResolveInfo::new(domain, query_type, at));
            }
        }
    }

    pub fn lookup_domain(&self, ip: &str) -> Option<String> {
        self.inner.read().dns.get(ip).map(|d| d.domain.clone())
    }

    pub fn dns_entry(&self, ip: &str) -> Option<DnsResolveInfo> {
        self.inner.read().dns.get(ip).cloned()
    }

    pub fn remove_connection(&self, key: &ConnectionKey) -> bool {
        self.inner.write().remove_connection(key)
    }

    /// Drops a process together with its connections and metadata.
    pub fn remove_process(&self, pid: u32) -> bool {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let Some(process) = inner.processes.remove(&pid) else {
            return false;
        };
        for key in &process.connections {
            inner.connections.remove(key);
        }
        inner.applications.remove(&pid);
        true
    }

    pub fn connection(&self, key: &ConnectionKey) -> Option<ConnectionRecord> {
        self.inner.read().connections.get(key).cloned()
    }

    pub fn has_application(&self, pid: u32) -> bool {
        self.inner.read().applications.contains_key(&pid)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.read().connections.len()
    }

    pub fn process_count(&self) -> usize {
        self.inner.read().processes.len()
    }

    pub fn get_snapshot(&self) -> NetworkMonitorSnapshot {
        self.get_snapshot_at(Utc::now())
    }

    /// Everything is read under one lock acquisition.
    pub fn get_snapshot_at(&self, now: DateTime<Utc>) -> NetworkMonitorSnapshot {
        let inner = self.inner.read();
        let stale = self.settings.rate_stale;

        let mut applications: Vec<ApplicationSnapshot> = inner
            .processes
            .values()
            .map(|process| inner.application_snapshot(process, now, stale))
            .collect();
        applications.sort_by(|a, b| {
            let a_total = a.total_bytes_sent.saturating_add(a.total_bytes_received);
            let b_total = b.total_bytes_sent.saturating_add(b.total_bytes_received);
            b_total.cmp(&a_total).then(a.process_id.cmp(&b.process_id))
        });

        NetworkMonitorSnapshot {
            timestamp: now,
            total_connections: applications.iter().map(|a| a.total_connections).sum(),
            active_connections: applications.iter().map(|a| a.active_connections).sum(),
            total_bytes_sent: applications.iter().map(|a| a.total_bytes_sent).sum(),
            total_bytes_received: applications.iter().map(|a| a.total_bytes_received).sum(),
            total_send_speed: applications.iter().map(|a| a.total_send_speed).sum(),
            total_receive_speed: applications.iter().map(|a| a.total_receive_speed).sum(),
            top_ports: inner.top_ports(self.settings.top_n),
            top_ips: inner.top_ips(self.settings.top_n),
            dns_entries: inner.dns.len(),
            applications,
        }
    }

    pub fn get_process_details(&self, pid: u32) -> Option<ApplicationSnapshot> {
        self.get_process_details_at(pid, Utc::now())
    }

    pub fn get_process_details_at(&self, pid: u32, now: DateTime<Utc>) -> Option<ApplicationSnapshot> {
        let inner = self.inner.read();
        inner
            .processes
            .get(&pid)
            .map(|process| inner.application_snapshot(process, now, self.settings.rate_stale))
    }

    pub fn top_ports(&self, n: usize) -> Vec<PortTraffic> {
        self.inner.read().top_ports(n)
    }

    pub fn top_ips(&self, n: usize) -> Vec<IpTraffic> {
        self.inner.read().top_ips(n)
    }

    pub fn cleanup(&self) -> CleanupReport {
        self.cleanup_at(Utc::now())
    }

    /// Removes disconnected TCP records, TCP records idle past the TCP timeout,
    /// connectionless processes idle past the process timeout, and expired
    /// DNS entries.
    pub fn cleanup_at(&self, now: DateTime<Utc>) -> CleanupReport {
        let mut report = CleanupReport::default();
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let settings = &self.settings;

        let expired: Vec<ConnectionKey> = inner
            .connections
            .values()
            .filter(|r| {
                r.key.protocol == Protocol::Tcp
                    && (r.state == ConnectionState::Disconnected
                        || now - r.last_activity > settings.tcp_idle_timeout)
            })
            .map(|r| r.key)
            .collect();
        for key in &expired {
            if inner.remove_connection(key) {
                report.connections += 1;
            }
        }

        let idle: Vec<u32> = inner
            .processes
            .values()
            .filter(|p| p.connections.is_empty() && now - p.last_active > settings.process_idle_timeout)
            .map(|p| p.pid)
            .collect();
        for pid in idle {
            inner.processes.remove(&pid);
            report.processes += 1;
            if inner.applications.remove(&pid).is_some() {
                report.applications += 1;
            }
        }

        let orphaned: Vec<u32> = inner
            .applications
            .values()
            .filter(|a| !inner.processes.contains_key(&a.pid) && now - a.last_update > settings.process_idle_timeout)
            .map(|a| a.pid)
            .collect();
        for pid in orphaned {
            inner.applications.remove(&pid);
            report.applications += 1;
        }

        let before = inner.dns.len();
        inner.dns.retain(|_, d| now - d.last_used <= settings.dns_ttl);
        report.dns_entries = before - inner.dns.len();

        report
    }
}
