//! Per-connection extended TCP statistics.
//!
//! The kernel keeps cumulative data counters per connection once collection is
//! switched on for it. Reading can fail for many reasons; every failure is
//! folded into an [`UnavailableReason`] so callers never see a bare status code.
//! Only IPv4 rows are queried.

use super::tcp_table::ConnectionInfo;
use serde::Serialize;

const ERROR_ACCESS_DENIED: u32 = 5;
const ERROR_NOT_SUPPORTED: u32 = 50;
const ERROR_INVALID_PARAMETER: u32 = 87;
const ERROR_NOT_FOUND: u32 = 1168;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub segments_sent: u64,
    pub segments_received: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UnavailableReason {
    /// Detailed collection was never requested for this run.
    NotRequested,
    /// Collection is off for the connection, or the connection is gone.
    Disabled,
    NotSupported,
    AccessDenied,
    Transient(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StatsOutcome {
    Available(ConnectionStats),
    Unavailable(UnavailableReason),
}

impl StatsOutcome {
    pub fn stats(&self) -> Option<&ConnectionStats> {
        match self {
            Self::Available(stats) => Some(stats),
            Self::Unavailable(_) => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available(_))
    }
}

pub trait StatsProvider: Send + Sync {
    fn get_stats(&self, connection: &ConnectionInfo) -> StatsOutcome;

    /// Switches on collection for one connection. Returns false on failure.
    fn enable_stats(&self, connection: &ConnectionInfo) -> bool;
}

pub fn classify_status(code: u32) -> UnavailableReason {
    match code {
        ERROR_ACCESS_DENIED => UnavailableReason::AccessDenied,
        ERROR_NOT_FOUND => UnavailableReason::Disabled,
        ERROR_NOT_SUPPORTED | ERROR_INVALID_PARAMETER => UnavailableReason::NotSupported,
        other => UnavailableReason::Transient(other),
    }
}

/// Reads extended statistics through the IP helper library.
#[derive(Debug, Default, Clone)]
pub struct EStatsCollector;

impl EStatsCollector {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(windows)]
mod native {
    use super::{ConnectionInfo, ConnectionStats};
    use std::net::IpAddr;
    use windows::Win32::NetworkManagement::IpHelper::{
        GetPerTcpConnectionEStats, SetPerTcpConnectionEStats, TcpConnectionEstatsData, MIB_TCPROW_LH,
        MIB_TCPROW_LH_0, TCP_ESTATS_DATA_ROD_v0, TCP_ESTATS_DATA_RW_v0,
    };

    /// The IP helper calls take versioned structures as byte buffers.
    fn as_bytes_mut<T>(value: &mut T) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(value as *mut T as *mut u8, std::mem::size_of::<T>()) }
    }

    fn as_bytes<T>(value: &T) -> &[u8] {
        unsafe { std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>()) }
    }

    pub fn to_row(connection: &ConnectionInfo) -> Option<MIB_TCPROW_LH> {
        let (IpAddr::V4(local), IpAddr::V4(remote)) = (connection.local.ip(), connection.remote.ip()) else {
            return None;
        };
        Some(MIB_TCPROW_LH {
            Anonymous: MIB_TCPROW_LH_0 {
                dwState: connection.state.raw(),
            },
            dwLocalAddr: u32::from_ne_bytes(local.octets()),
            dwLocalPort: u32::from(connection.local.port().to_be()),
            dwRemoteAddr: u32::from_ne_bytes(remote.octets()),
            dwRemotePort: u32::from(connection.remote.port().to_be()),
        })
    }

    pub fn stats_from_rod(rod: &TCP_ESTATS_DATA_ROD_v0) -> ConnectionStats {
        ConnectionStats {
            bytes_sent: rod.DataBytesOut,
            bytes_received: rod.DataBytesIn,
            segments_sent: rod.DataSegsOut,
            segments_received: rod.DataSegsIn,
        }
    }

    /// Returns the status code, whether collection is on, and the counters.
    pub fn read(row: &MIB_TCPROW_LH) -> (u32, bool, TCP_ESTATS_DATA_ROD_v0) {
        let mut rw = TCP_ESTATS_DATA_RW_v0::default();
        let mut rod = TCP_ESTATS_DATA_ROD_v0::default();
        let ret = unsafe {
            GetPerTcpConnectionEStats(
                row,
                TcpConnectionEstatsData,
                Some(as_bytes_mut(&mut rw)),
                0,
                None,
                0,
                Some(as_bytes_mut(&mut rod)),
                0,
            )
        };
        (ret, rw.EnableCollection, rod)
    }

    pub fn enable(row: &MIB_TCPROW_LH) -> u32 {
        let rw = TCP_ESTATS_DATA_RW_v0 { EnableCollection: true };
        unsafe { SetPerTcpConnectionEStats(row, TcpConnectionEstatsData, as_bytes(&rw), 0, 0) }
    }

}

#[cfg(windows)]
impl StatsProvider for EStatsCollector {
    fn get_stats(&self, connection: &ConnectionInfo) -> StatsOutcome {
        let Some(row) = native::to_row(connection) else {
            return StatsOutcome::Unavailable(UnavailableReason::NotSupported);
        };

        let (ret, collecting, rod) = native::read(&row);
        if ret != 0 {
            return StatsOutcome::Unavailable(classify_status(ret));
        }
        if !collecting {
            return StatsOutcome::Unavailable(UnavailableReason::Disabled);
        }
        StatsOutcome::Available(native::stats_from_rod(&rod))
    }

    fn enable_stats(&self, connection: &ConnectionInfo) -> bool {
        let Some(row) = native::to_row(connection) else {
            return false;
        };
        let ret = native::enable(&row);
        if ret != 0 {
            log::trace!("Enabling statistics for {} failed: {}", connection.key(), ret);
        }
        ret == 0
    }
}

#[cfg(not(windows))]
impl StatsProvider for EStatsCollector {
    fn get_stats(&self, _connection: &ConnectionInfo) -> StatsOutcome {
        StatsOutcome::Unavailable(UnavailableReason::NotSupported)
    }

    fn enable_stats(&self, _connection: &ConnectionInfo) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_reasons() {
        assert_eq!(classify_status(5), UnavailableReason::AccessDenied);
        assert_eq!(classify_status(1168), UnavailableReason::Disabled);
        assert_eq!(classify_status(50), UnavailableReason::NotSupported);
        assert_eq!(classify_status(87), UnavailableReason::NotSupported);
        assert_eq!(classify_status(1231), UnavailableReason::Transient(1231));
    }

    #[test]
    fn outcome_accessors() {
        let available = StatsOutcome::Available(ConnectionStats::default());
        assert!(available.is_available());
        assert!(available.stats().is_some());
        let missing = StatsOutcome::Unavailable(UnavailableReason::Disabled);
        assert!(missing.stats().is_none());
    }
}
