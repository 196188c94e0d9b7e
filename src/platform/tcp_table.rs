//! Snapshot of the OS TCP connection table (IPv4 and IPv6) with owning PIDs.
//!
//! The native call uses a size-then-fill protocol. The table can grow between
//! the two calls, so a fill that reports an insufficient buffer is retried once
//! with the updated size before the enumeration is abandoned. Rows are decoded
//! from the raw buffer bytes, which keeps the decoding independent of the
//! binding crate and testable off-Windows.

use crate::error::Result;
use crate::events::ConnectionKey;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

#[cfg(not(windows))]
use crate::error::MonitorError;

pub const AF_INET: u32 = 2;
pub const AF_INET6: u32 = 23;

const IPV4_ROW_SIZE: usize = 24;
const IPV6_ROW_SIZE: usize = 56;
const TABLE_HEADER_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
    DeleteTcb,
    Unknown,
}

impl TcpState {
    pub fn from_raw(val: u32) -> Self {
        match val {
            1 => Self::Closed,
            2 => Self::Listen,
            3 => Self::SynSent,
            4 => Self::SynReceived,
            5 => Self::Established,
            6 => Self::FinWait1,
            7 => Self::FinWait2,
            8 => Self::CloseWait,
            9 => Self::Closing,
            10 => Self::LastAck,
            11 => Self::TimeWait,
            12 => Self::DeleteTcb,
            _ => Self::Unknown,
        }
    }

    pub fn raw(&self) -> u32 {
        match self {
            Self::Closed => 1,
            Self::Listen => 2,
            Self::SynSent => 3,
            Self::SynReceived => 4,
            Self::Established => 5,
            Self::FinWait1 => 6,
            Self::FinWait2 => 7,
            Self::CloseWait => 8,
            Self::Closing => 9,
            Self::LastAck => 10,
            Self::TimeWait => 11,
            Self::DeleteTcb => 12,
            Self::Unknown => 0,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Listen => "LISTEN",
            Self::SynSent => "SYN_SENT",
            Self::SynReceived => "SYN_RCVD",
            Self::Established => "ESTABLISHED",
            Self::FinWait1 => "FIN_WAIT1",
            Self::FinWait2 => "FIN_WAIT2",
            Self::CloseWait => "CLOSE_WAIT",
            Self::Closing => "CLOSING",
            Self::LastAck => "LAST_ACK",
            Self::TimeWait => "TIME_WAIT",
            Self::DeleteTcb => "DELETE_TCB",
            Self::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub pid: u32,
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub state: TcpState,
}

impl ConnectionInfo {
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey::tcp(self.pid, self.local, self.remote)
    }

    pub fn is_established(&self) -> bool {
        self.state == TcpState::Established
    }
}

/// Source of the definitive connection list.
pub trait ConnectionSource: Send + Sync {
    fn enumerate(&self, only_established: bool) -> Result<Vec<ConnectionInfo>>;
}

#[derive(Debug, Clone)]
pub struct TcpTableEnumerator {
    include_ipv6: bool,
}

impl Default for TcpTableEnumerator {
    fn default() -> Self {
        Self { include_ipv6: true }
    }
}

impl TcpTableEnumerator {
    pub fn new(include_ipv6: bool) -> Self {
        Self { include_ipv6 }
    }
}

impl ConnectionSource for TcpTableEnumerator {
    fn enumerate(&self, only_established: bool) -> Result<Vec<ConnectionInfo>> {
        let mut connections = parse_ipv4_table(&native::fetch_table(AF_INET)?);
        if self.include_ipv6 {
            match native::fetch_table(AF_INET6) {
                Ok(buffer) => connections.extend(parse_ipv6_table(&buffer)),
                Err(e) => log::debug!("IPv6 TCP table unavailable: {}", e),
            }
        }
        Ok(filter_established(connections, only_established))
    }
}

/// State filtering happens after parsing; the OS is always asked for the full table.
pub fn filter_established(connections: Vec<ConnectionInfo>, only_established: bool) -> Vec<ConnectionInfo> {
    if only_established {
        connections.into_iter().filter(|c| c.is_established()).collect()
    } else {
        connections
    }
}

fn read_u32(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Port fields hold a network-order u16 in their first two bytes.
fn read_port(buf: &[u8], offset: usize) -> Option<u16> {
    let bytes = buf.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_ipv4(buf: &[u8], offset: usize) -> Option<IpAddr> {
    let b = buf.get(offset..offset + 4)?;
    Some(IpAddr::V4(Ipv4Addr::new(b[0], b[1], b[2], b[3])))
}

fn read_ipv6(buf: &[u8], offset: usize) -> Option<IpAddr> {
    let b = buf.get(offset..offset + 16)?;
    let mut octets = [0u8; 16];
    octets.copy_from_slice(b);
    Some(IpAddr::V6(Ipv6Addr::from(octets)))
}

fn row_count(buf: &[u8], row_size: usize) -> usize {
    let declared = read_u32(buf, 0).unwrap_or(0) as usize;
    let fits = buf.len().saturating_sub(TABLE_HEADER_SIZE) / row_size;
    declared.min(fits)
}

/// Layout of `MIB_TCPROW_OWNER_PID`: state, local addr, local port, remote addr,
/// remote port, owning pid.
pub fn parse_ipv4_table(buf: &[u8]) -> Vec<ConnectionInfo> {
    let count = row_count(buf, IPV4_ROW_SIZE);
    let mut rows = Vec::with_capacity(count);
    for i in 0..count {
        let base = TABLE_HEADER_SIZE + i * IPV4_ROW_SIZE;
        let row = (|| {
            Some(ConnectionInfo {
                state: TcpState::from_raw(read_u32(buf, base)?),
                local: SocketAddr::new(read_ipv4(buf, base + 4)?, read_port(buf, base + 8)?),
                remote: SocketAddr::new(read_ipv4(buf, base + 12)?, read_port(buf, base + 16)?),
                pid: read_u32(buf, base + 20)?,
            })
        })();
        if let Some(row) = row {
            rows.push(row);
        }
    }
    rows
}

/// Layout of `MIB_TCP6ROW_OWNER_PID`: local addr, local scope, local port,
/// remote addr, remote scope, remote port, state, owning pid.
pub fn parse_ipv6_table(buf: &[u8]) -> Vec<ConnectionInfo> {
    let count = row_count(buf, IPV6_ROW_SIZE);
    let mut rows = Vec::with_capacity(count);
    for i in 0..count {
        let base = TABLE_HEADER_SIZE + i * IPV6_ROW_SIZE;
        let row = (|| {
            Some(ConnectionInfo {
                local: SocketAddr::new(read_ipv6(buf, base)?, read_port(buf, base + 20)?),
                remote: SocketAddr::new(read_ipv6(buf, base + 24)?, read_port(buf, base + 44)?),
                state: TcpState::from_raw(read_u32(buf, base + 48)?),
                pid: read_u32(buf, base + 52)?,
            })
        })();
        if let Some(row) = row {
            rows.push(row);
        }
    }
    rows
}

pub fn group_by_process(connections: &[ConnectionInfo]) -> BTreeMap<u32, Vec<ConnectionInfo>> {
    let mut groups: BTreeMap<u32, Vec<ConnectionInfo>> = BTreeMap::new();
    for conn in connections {
        groups.entry(conn.pid).or_default().push(conn.clone());
    }
    groups
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionTableSummary {
    pub total: usize,
    pub established: usize,
    pub listening: usize,
    pub by_state: BTreeMap<&'static str, usize>,
    /// Processes owning at least one established connection.
    pub active_processes: usize,
}

pub fn summarize(connections: &[ConnectionInfo]) -> ConnectionTableSummary {
    let mut summary = ConnectionTableSummary {
        total: connections.len(),
        ..Default::default()
    };
    let mut active = std::collections::BTreeSet::new();
    for conn in connections {
        *summary.by_state.entry(conn.state.label()).or_insert(0) += 1;
        match conn.state {
            TcpState::Established => {
                summary.established += 1;
                active.insert(conn.pid);
            }
            TcpState::Listen => summary.listening += 1,
            _ => {}
        }
    }
    summary.active_processes = active.len();
    summary
}

#[cfg(windows)]
mod native {
    use crate::error::{MonitorError, Result};
    use std::ffi::c_void;
    use windows::Win32::Foundation::{ERROR_ACCESS_DENIED, ERROR_INSUFFICIENT_BUFFER, NO_ERROR};
    use windows::Win32::NetworkManagement::IpHelper::{GetExtendedTcpTable, TCP_TABLE_OWNER_PID_ALL};

    const FILL_ATTEMPTS: u32 = 2;

    pub fn fetch_table(family: u32) -> Result<Vec<u8>> {
        let mut size: u32 = 0;
        let ret = unsafe {
            GetExtendedTcpTable(None, &mut size, false, family, TCP_TABLE_OWNER_PID_ALL, 0)
        };
        if ret != NO_ERROR.0 && ret != ERROR_INSUFFICIENT_BUFFER.0 {
            return Err(status_error(ret));
        }

        for attempt in 1..=FILL_ATTEMPTS {
            let mut buffer = vec![0u8; size as usize];
            let ret = unsafe {
                GetExtendedTcpTable(
                    Some(buffer.as_mut_ptr() as *mut c_void),
                    &mut size,
                    false,
                    family,
                    TCP_TABLE_OWNER_PID_ALL,
                    0,
                )
            };
            match ret {
                r if r == NO_ERROR.0 => return Ok(buffer),
                r if r == ERROR_INSUFFICIENT_BUFFER.0 => {
                    log::debug!(
                        "TCP table grew during enumeration (attempt {}), new size {}",
                        attempt,
                        size
                    );
                }
                r => return Err(status_error(r)),
            }
        }

        Err(MonitorError::BufferRace {
            call: "GetExtendedTcpTable",
            attempts: FILL_ATTEMPTS,
        })
    }

    fn status_error(code: u32) -> MonitorError {
        if code == ERROR_ACCESS_DENIED.0 {
            MonitorError::PrivilegeRequired {
                operation: "TCP table enumeration",
            }
        } else {
            MonitorError::Syscall {
                call: "GetExtendedTcpTable",
                code,
            }
        }
    }
}

#[cfg(not(windows))]
mod native {
    use super::MonitorError;
    use crate::error::Result;

    pub fn fetch_table(_family: u32) -> Result<Vec<u8>> {
        Err(MonitorError::Unsupported {
            operation: "TCP table enumeration",
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn ipv4_row(state: u32, local: ([u8; 4], u16), remote: ([u8; 4], u16), pid: u32) -> Vec<u8> {
        let mut row = Vec::with_capacity(IPV4_ROW_SIZE);
        row.extend_from_slice(&state.to_le_bytes());
        row.extend_from_slice(&local.0);
        row.extend_from_slice(&local.1.to_be_bytes());
        row.extend_from_slice(&[0, 0]);
        row.extend_from_slice(&remote.0);
        row.extend_from_slice(&remote.1.to_be_bytes());
        row.extend_from_slice(&[0, 0]);
        row.extend_from_slice(&pid.to_le_bytes());
        row
    }

    fn table(rows: &[Vec<u8>]) -> Vec<u8> {
        let mut buf = (rows.len() as u32).to_le_bytes().to_vec();
        for row in rows {
            buf.extend_from_slice(row);
        }
        buf
    }

    #[test]
    fn ipv4_rows_convert_network_byte_order() {
        let buf = table(&[ipv4_row(5, ([192, 168, 1, 10], 50123), ([140, 82, 112, 3], 443), 4242)]);
        let rows = parse_ipv4_table(&buf);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].pid, 4242);
        assert_eq!(rows[0].state, TcpState::Established);
        assert_eq!(rows[0].local, "192.168.1.10:50123".parse().unwrap());
        assert_eq!(rows[0].remote, "140.82.112.3:443".parse().unwrap());
    }

    #[test]
    fn ipv6_rows_decode() {
        let local: Ipv6Addr = "fe80::1".parse().unwrap();
        let remote: Ipv6Addr = "2606:4700::6810:84e5".parse().unwrap();
        let mut row = Vec::new();
        row.extend_from_slice(&local.octets());
        row.extend_from_slice(&3u32.to_le_bytes());
        row.extend_from_slice(&8080u16.to_be_bytes());
        row.extend_from_slice(&[0, 0]);
        row.extend_from_slice(&remote.octets());
        row.extend_from_slice(&0u32.to_le_bytes());
        row.extend_from_slice(&443u16.to_be_bytes());
        row.extend_from_slice(&[0, 0]);
        row.extend_from_slice(&2u32.to_le_bytes());
        row.extend_from_slice(&99u32.to_le_bytes());
        assert_eq!(row.len(), IPV6_ROW_SIZE);

        let rows = parse_ipv6_table(&table(&[row]));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, TcpState::Listen);
        assert_eq!(rows[0].pid, 99);
        assert_eq!(rows[0].local, SocketAddr::new(IpAddr::V6(local), 8080));
        assert_eq!(rows[0].remote, SocketAddr::new(IpAddr::V6(remote), 443));
    }

    #[test]
    fn declared_count_is_bounded_by_buffer_length() {
        let mut buf = table(&[ipv4_row(5, ([1, 1, 1, 1], 1), ([2, 2, 2, 2], 2), 1)]);
        buf[0] = 50;
        assert_eq!(parse_ipv4_table(&buf).len(), 1);
        assert!(parse_ipv4_table(&[]).is_empty());
    }

    #[test]
    fn established_filter_applies_after_parsing() {
        let buf = table(&[
            ipv4_row(5, ([10, 0, 0, 1], 1000), ([10, 0, 0, 2], 80), 1),
            ipv4_row(2, ([0, 0, 0, 0], 445), ([0, 0, 0, 0], 0), 4),
            ipv4_row(11, ([10, 0, 0, 1], 1001), ([10, 0, 0, 2], 80), 1),
        ]);
        let all = parse_ipv4_table(&buf);
        assert_eq!(filter_established(all.clone(), false).len(), 3);
        let established = filter_established(all, true);
        assert_eq!(established.len(), 1);
        assert_eq!(established[0].local.port(), 1000);
    }

    #[test]
    fn summary_counts_states_and_active_processes() {
        let buf = table(&[
            ipv4_row(5, ([10, 0, 0, 1], 1000), ([10, 0, 0, 2], 80), 1),
            ipv4_row(5, ([10, 0, 0, 1], 1001), ([10, 0, 0, 3], 80), 1),
            ipv4_row(5, ([10, 0, 0, 1], 1002), ([10, 0, 0, 3], 80), 2),
            ipv4_row(2, ([0, 0, 0, 0], 445), ([0, 0, 0, 0], 0), 4),
        ]);
        let rows = parse_ipv4_table(&buf);
        let summary = summarize(&rows);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.established, 3);
        assert_eq!(summary.listening, 1);
        assert_eq!(summary.active_processes, 2);
        assert_eq!(summary.by_state.get("ESTABLISHED"), Some(&3));

        let groups = group_by_process(&rows);
        assert_eq!(groups.get(&1).map(Vec::len), Some(2));
        assert_eq!(groups.len(), 3);
    }

    #[test]
    fn state_raw_roundtrip() {
        for raw in 1..=12 {
            assert_eq!(TcpState::from_raw(raw).raw(), raw);
        }
        assert_eq!(TcpState::from_raw(99), TcpState::Unknown);
    }
}
