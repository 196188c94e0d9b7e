//! Append-only traffic rows.
//!
//! Each flush turns the current snapshot into per-connection byte deltas since
//! the previous flush and appends them to the sink. Nothing is ever read back.

use crate::error::{MonitorError, Result};
use crate::events::Protocol;
use crate::state::{GlobalNetworkMonitor, NetworkMonitorSnapshot};
use crate::utils::scheduler;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficRow {
    pub timestamp: DateTime<Utc>,
    pub local_ip: String,
    pub local_port: u16,
    pub remote_ip: String,
    pub remote_port: u16,
    pub protocol: Protocol,
    pub upload_bytes: u64,
    pub download_bytes: u64,
    /// Process name the bytes are attributed to.
    pub app_id: String,
}

pub trait TrafficSink: Send {
    fn write_rows(&mut self, rows: &[TrafficRow]) -> Result<()>;
}

/// One JSON object per line, appended to a single file.
pub struct JsonLinesSink {
    path: PathBuf,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| MonitorError::io(parent, e))?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl TrafficSink for JsonLinesSink {
    fn write_rows(&mut self, rows: &[TrafficRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| MonitorError::io(&self.path, e))?;

        let mut buffer = String::new();
        for row in rows {
            buffer.push_str(&serde_json::to_string(row)?);
            buffer.push('\n');
        }
        file.write_all(buffer.as_bytes())
            .map_err(|e| MonitorError::io(&self.path, e))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RowKey {
    pid: u32,
    protocol: Protocol,
    local: (String, u16),
    remote: (String, u16),
}

#[derive(Debug, Clone, Copy)]
struct Flushed {
    sent: u64,
    received: u64,
    start_time: DateTime<Utc>,
}

/// Remembers what was already written per connection.
#[derive(Debug, Default)]
pub struct DeltaTracker {
    flushed: HashMap<RowKey, Flushed>,
}

impl DeltaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows for every connection that moved bytes since the previous call. A
    /// connection whose start time changed is a new logical connection and
    /// starts from zero.
    pub fn rows(&mut self, snapshot: &NetworkMonitorSnapshot) -> Vec<TrafficRow> {
        let mut rows = Vec::new();
        let mut current = HashMap::with_capacity(self.flushed.len());

        for app in &snapshot.applications {
            for conn in &app.connections {
                let key = RowKey {
                    pid: conn.process_id,
                    protocol: conn.protocol,
                    local: (conn.local_address.clone(), conn.local_port),
                    remote: (conn.remote_address.clone(), conn.remote_port),
                };
                let (prev_sent, prev_received) = match self.flushed.get(&key) {
                    Some(prev) if prev.start_time == conn.start_time => (prev.sent, prev.received),
                    _ => (0, 0),
                };
                let upload = conn.bytes_sent.saturating_sub(prev_sent);
                let download = conn.bytes_received.saturating_sub(prev_received);
                if upload > 0 || download > 0 {
                    rows.push(TrafficRow {
                        timestamp: snapshot.timestamp,
                        local_ip: conn.local_address.clone(),
                        local_port: conn.local_port,
                        remote_ip: conn.remote_address.clone(),
                        remote_port: conn.remote_port,
                        protocol: conn.protocol,
                        upload_bytes: upload,
                        download_bytes: download,
                        app_id: app.process_name.clone(),
                    });
                }
                current.insert(
                    key,
                    Flushed {
                        sent: conn.bytes_sent.max(prev_sent),
                        received: conn.bytes_received.max(prev_received),
                        start_time: conn.start_time,
                    },
                );
            }
        }

        self.flushed = current;
        rows
    }

    pub fn tracked(&self) -> usize {
        self.flushed.len()
    }
}

/// Writes deltas every `interval` while `running` stays set, then once more on
/// the way out.
pub fn start_persistence(
    monitor: Arc<GlobalNetworkMonitor>,
    mut sink: Box<dyn TrafficSink>,
    interval: Duration,
    running: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("persistence".to_string())
        .spawn(move || {
            let mut tracker = DeltaTracker::new();
            let mut flush = |tracker: &mut DeltaTracker| {
                let rows = tracker.rows(&monitor.get_snapshot());
                match sink.write_rows(&rows) {
                    Ok(()) if !rows.is_empty() => log::debug!("Persisted {} traffic rows", rows.len()),
                    Ok(()) => {}
                    Err(e) => log::warn!("Failed to persist {} traffic rows: {}", rows.len(), e),
                }
            };
            while scheduler::sleep_while_running(&running, interval) {
                flush(&mut tracker);
            }
            flush(&mut tracker);
            log::debug!("Persistence stopped");
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ConnectionKey, Direction};
    use crate::state::{ConnectionObservation, ConnectionState};
    use chrono::Duration as ChronoDuration;
    use std::io::{BufRead, BufReader};

    fn key() -> ConnectionKey {
        ConnectionKey::tcp(
            12,
            "192.168.1.10:50000".parse().unwrap(),
            "93.184.216.34:443".parse().unwrap(),
        )
    }

    fn send(monitor: &GlobalNetworkMonitor, direction: Direction, bytes: u64, at: DateTime<Utc>) {
        monitor.update_connection(ConnectionObservation::Traffic {
            key: key(),
            direction,
            bytes,
            at,
        });
    }

    #[test]
    fn deltas_cover_only_new_bytes() {
        let monitor = GlobalNetworkMonitor::default();
        let t0 = Utc::now();
        monitor.update_process_at(12, "browser.exe", None, t0);
        send(&monitor, Direction::Outbound, 1_000, t0);
        send(&monitor, Direction::Inbound, 5_000, t0);

        let mut tracker = DeltaTracker::new();
        let rows = tracker.rows(&monitor.get_snapshot_at(t0));
        assert_eq!(rows.len(), 1);
        assert_eq!((rows[0].upload_bytes, rows[0].download_bytes), (1_000, 5_000));
        assert_eq!(rows[0].app_id, "browser.exe");
        assert_eq!(rows[0].remote_port, 443);

        assert!(tracker.rows(&monitor.get_snapshot_at(t0)).is_empty());

        send(&monitor, Direction::Outbound, 250, t0 + ChronoDuration::seconds(1));
        let rows = tracker.rows(&monitor.get_snapshot_at(t0 + ChronoDuration::seconds(1)));
        assert_eq!((rows[0].upload_bytes, rows[0].download_bytes), (250, 0));
    }

    #[test]
    fn reopened_connection_counts_from_zero() {
        let monitor = GlobalNetworkMonitor::default();
        let t0 = Utc::now();
        send(&monitor, Direction::Outbound, 1_000, t0);
        let mut tracker = DeltaTracker::new();
        tracker.rows(&monitor.get_snapshot_at(t0));

        monitor.update_connection(ConnectionObservation::State {
            key: key(),
            state: ConnectionState::Disconnected,
            direction: Direction::Outbound,
            at: t0,
        });
        let t1 = t0 + ChronoDuration::seconds(5);
        monitor.update_connection(ConnectionObservation::State {
            key: key(),
            state: ConnectionState::Connected,
            direction: Direction::Outbound,
            at: t1,
        });
        send(&monitor, Direction::Outbound, 300, t1);
        let rows = tracker.rows(&monitor.get_snapshot_at(t1));
        assert_eq!(rows[0].upload_bytes, 300);
    }

    #[test]
    fn vanished_connections_are_forgotten() {
        let monitor = GlobalNetworkMonitor::default();
        let t0 = Utc::now();
        send(&monitor, Direction::Outbound, 10, t0);
        let mut tracker = DeltaTracker::new();
        tracker.rows(&monitor.get_snapshot_at(t0));
        assert_eq!(tracker.tracked(), 1);

        monitor.remove_connection(&key());
        tracker.rows(&monitor.get_snapshot_at(t0));
        assert_eq!(tracker.tracked(), 0);
    }

    #[test]
    fn json_lines_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("traffic.jsonl");
        let mut sink = JsonLinesSink::new(&path).unwrap();
        let row = TrafficRow {
            timestamp: Utc::now(),
            local_ip: "10.0.0.1".into(),
            local_port: 5000,
            remote_ip: "10.0.0.2".into(),
            remote_port: 80,
            protocol: Protocol::Tcp,
            upload_bytes: 1,
            download_bytes: 2,
            app_id: "a.exe".into(),
        };
        sink.write_rows(&[row.clone()]).unwrap();
        sink.write_rows(&[]).unwrap();
        sink.write_rows(&[row.clone(), row.clone()]).unwrap();

        let file = fs::File::open(sink.path()).unwrap();
        let lines: Vec<String> = BufReader::new(file).lines().map(|l| l.unwrap()).collect();
        assert_eq!(lines.len(), 3);
        let parsed: TrafficRow = serde_json::from_str(&lines[2]).unwrap();
        assert_eq!(parsed, row);
        assert!(lines[0].contains("\"protocol\":\"TCP\""));
    }
}
