//! Detached, serializable views of the monitor state.

use super::records::{ConnectionState, TrafficTotals};
use crate::events::{Direction, Protocol};
use crate::platform::process::ProgramInfo;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    pub process_id: u32,
    pub protocol: Protocol,
    pub local_address: String,
    pub local_port: u16,
    pub remote_address: String,
    pub remote_port: u16,
    pub remote_domain: Option<String>,
    pub state: ConnectionState,
    pub direction: Direction,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_speed: f64,
    pub receive_speed: f64,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSnapshot {
    pub process_id: u32,
    pub process_name: String,
    pub program_info: Option<ProgramInfo>,
    pub first_seen: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub total_connections: usize,
    pub active_connections: usize,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
    pub total_send_speed: f64,
    pub total_receive_speed: f64,
    pub connections: Vec<ConnectionSnapshot>,
}

impl ApplicationSnapshot {
    /// Fills the rollup fields from `connections`.
    pub fn rollup(mut self) -> Self {
        self.total_connections = self.connections.len();
        self.active_connections = self.connections.iter().filter(|c| c.is_active).count();
        self.total_bytes_sent = self.connections.iter().map(|c| c.bytes_sent).sum();
        self.total_bytes_received = self.connections.iter().map(|c| c.bytes_received).sum();
        self.total_send_speed = self.connections.iter().map(|c| c.send_speed).sum();
        self.total_receive_speed = self.connections.iter().map(|c| c.receive_speed).sum();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortTraffic {
    pub port: u16,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub last_update: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IpTraffic {
    pub ip: String,
    pub domain: Option<String>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub last_update: DateTime<Utc>,
}

impl PortTraffic {
    pub fn new(port: u16, totals: &TrafficTotals) -> Self {
        Self {
            port,
            bytes_sent: totals.bytes_sent,
            bytes_received: totals.bytes_received,
            last_update: totals.last_update,
        }
    }

    pub fn total(&self) -> u64 {
        self.bytes_sent.saturating_add(self.bytes_received)
    }
}

impl IpTraffic {
    pub fn total(&self) -> u64 {
        self.bytes_sent.saturating_add(self.bytes_received)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkMonitorSnapshot {
    pub timestamp: DateTime<Utc>,
    pub applications: Vec<ApplicationSnapshot>,
    pub total_connections: usize,
    pub active_connections: usize,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
    pub total_send_speed: f64,
    pub total_receive_speed: f64,
    pub top_ports: Vec<PortTraffic>,
    pub top_ips: Vec<IpTraffic>,
    pub dns_entries: usize,
}

impl NetworkMonitorSnapshot {
    pub fn connections(&self) -> impl Iterator<Item = &ConnectionSnapshot> {
        self.applications.iter().flat_map(|a| a.connections.iter())
    }

    pub fn application(&self, pid: u32) -> Option<&ApplicationSnapshot> {
        self.applications.iter().find(|a| a.process_id == pid)
    }
}
