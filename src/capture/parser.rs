//! Decoding of provider payloads into typed events.
//!
//! Everything here works on plain byte slices so it can be exercised without a
//! live trace session.

use super::providers::{dns_client, http_service, kernel_network, network_profile, Provider};
use crate::events::{
    Direction, DnsEvent, EventKind, HttpEvent, InterfaceEvent, InterfaceState, NetworkEvent,
    TcpAction, TcpEvent, UdpAction, UdpEvent,
};
use chrono::{DateTime, TimeZone, Utc};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// 100ns intervals between 1601-01-01 and 1970-01-01.
const FILETIME_UNIX_EPOCH: i64 = 116_444_736_000_000_000;

/// One raw trace record, copied out of the OS callback structure.
#[derive(Debug, Clone)]
pub struct RawRecord<'a> {
    pub provider: Provider,
    pub event_id: u16,
    pub pid: u32,
    pub thread_id: u32,
    pub timestamp: DateTime<Utc>,
    pub pointer_size: usize,
    pub data: &'a [u8],
}

/// Result of decoding a payload. Kernel network events carry the owning pid in
/// the payload, which takes precedence over the header pid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub pid: u32,
    pub kind: EventKind,
}

impl Decoded {
    pub fn into_event(
        self,
        record: &RawRecord<'_>,
        process_name: impl Into<String>,
    ) -> NetworkEvent {
        NetworkEvent::new(
            record.timestamp,
            self.pid,
            record.thread_id,
            process_name,
            self.kind,
        )
    }
}

pub fn filetime_to_datetime(filetime: i64) -> DateTime<Utc> {
    let since_epoch = filetime.saturating_sub(FILETIME_UNIX_EPOCH);
    let secs = since_epoch.div_euclid(10_000_000);
    let nanos = (since_epoch.rem_euclid(10_000_000) * 100) as u32;
    Utc.timestamp_opt(secs, nanos)
        .single()
        .unwrap_or_else(Utc::now)
}

pub fn decode(record: &RawRecord<'_>) -> Option<Decoded> {
    match record.provider {
        Provider::KernelNetwork => decode_kernel_network(record.event_id, record.data),
        Provider::DnsClient => decode_dns(record),
        Provider::HttpService => decode_http(record),
        Provider::NetworkProfile => decode_profile(record),
        Provider::WinsockAfd => None,
    }
}

struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn skip(&mut self, len: usize) -> Option<()> {
        self.take(len).map(|_| ())
    }

    fn u32_le(&mut self) -> Option<u32> {
        let bytes = self.take(4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64_le(&mut self) -> Option<u64> {
        let bytes = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Some(u64::from_le_bytes(buf))
    }

    /// Ports are carried in network byte order.
    fn port(&mut self) -> Option<u16> {
        let bytes = self.take(2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn ipv4(&mut self) -> Option<IpAddr> {
        let bytes = self.take(4)?;
        Some(IpAddr::V4(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3])))
    }

    fn ipv6(&mut self) -> Option<IpAddr> {
        let bytes = self.take(16)?;
        let mut octets = [0u8; 16];
        octets.copy_from_slice(bytes);
        Some(IpAddr::V6(Ipv6Addr::from(octets)))
    }

    fn pointer(&mut self, size: usize) -> Option<u64> {
        match size {
            4 => self.u32_le().map(u64::from),
            _ => self.u64_le(),
        }
    }

    /// Null-terminated UTF-16LE string. A missing terminator consumes the rest.
    fn utf16z(&mut self) -> Option<String> {
        let rest = self.data.get(self.pos..)?;
        let mut units = Vec::new();
        let mut consumed = 0;
        for chunk in rest.chunks_exact(2) {
            consumed += 2;
            let unit = u16::from_le_bytes([chunk[0], chunk[1]]);
            if unit == 0 {
                break;
            }
            units.push(unit);
        }
        self.pos += consumed;
        Some(String::from_utf16_lossy(&units))
    }
}

enum TransportShape {
    Tcp(TcpAction, Direction),
    Udp(UdpAction, Direction),
}

fn transport_shape(event_id: u16) -> Option<(TransportShape, bool)> {
    use kernel_network::*;
    let shape = match event_id {
        TCP_SEND_V4 => (TransportShape::Tcp(TcpAction::Send, Direction::Outbound), false),
        TCP_RECV_V4 => (TransportShape::Tcp(TcpAction::Receive, Direction::Inbound), false),
        TCP_CONNECT_V4 => (TransportShape::Tcp(TcpAction::Connect, Direction::Outbound), false),
        TCP_ACCEPT_V4 => (TransportShape::Tcp(TcpAction::Connect, Direction::Inbound), false),
        TCP_DISCONNECT_V4 => (
            TransportShape::Tcp(TcpAction::Disconnect, Direction::Outbound),
            false,
        ),
        TCP_SEND_V6 => (TransportShape::Tcp(TcpAction::Send, Direction::Outbound), true),
        TCP_RECV_V6 => (TransportShape::Tcp(TcpAction::Receive, Direction::Inbound), true),
        TCP_CONNECT_V6 => (TransportShape::Tcp(TcpAction::Connect, Direction::Outbound), true),
        TCP_ACCEPT_V6 => (TransportShape::Tcp(TcpAction::Connect, Direction::Inbound), true),
        TCP_DISCONNECT_V6 => (
            TransportShape::Tcp(TcpAction::Disconnect, Direction::Outbound),
            true,
        ),
        UDP_SEND_V4 => (TransportShape::Udp(UdpAction::Send, Direction::Outbound), false),
        UDP_RECV_V4 => (TransportShape::Udp(UdpAction::Receive, Direction::Inbound), false),
        UDP_SEND_V6 => (TransportShape::Udp(UdpAction::Send, Direction::Outbound), true),
        UDP_RECV_V6 => (TransportShape::Udp(UdpAction::Receive, Direction::Inbound), true),
        _ => return None,
    };
    Some(shape)
}

/// Kernel network templates share a prefix of
/// `PID, size, daddr, saddr, dport, sport`, where `saddr`/`sport` are always the
/// local endpoint. What follows the prefix differs per event.
fn decode_kernel_network(event_id: u16, data: &[u8]) -> Option<Decoded> {
    let (shape, ipv6) = transport_shape(event_id)?;
    let mut reader = PayloadReader::new(data);

    let pid = reader.u32_le()?;
    let size = reader.u32_le()?;
    let (remote_ip, local_ip) = if ipv6 {
        (reader.ipv6()?, reader.ipv6()?)
    } else {
        (reader.ipv4()?, reader.ipv4()?)
    };
    let remote_port = reader.port()?;
    let local_port = reader.port()?;
    let local = SocketAddr::new(local_ip, local_port);
    let remote = SocketAddr::new(remote_ip, remote_port);

    let kind = match shape {
        TransportShape::Tcp(action, direction) => {
            let sequence = match (event_id, action) {
                (kernel_network::TCP_SEND_V4 | kernel_network::TCP_SEND_V6, _) => {
                    // startime, endtime
                    reader.skip(8).and_then(|_| reader.u32_le())
                }
                (_, TcpAction::Connect) => {
                    // mss, sackopt, tsopt, wsopt, rcvwin, rcvwinscale, sndwinscale
                    reader.skip(16).and_then(|_| reader.u32_le())
                }
                _ => reader.u32_le(),
            };
            let length = match action {
                TcpAction::Send | TcpAction::Receive => size,
                TcpAction::Connect | TcpAction::Disconnect => 0,
            };
            let (source, destination) = oriented(direction, local, remote);
            EventKind::Tcp(TcpEvent {
                source,
                destination,
                length,
                sequence,
                direction,
                action,
            })
        }
        TransportShape::Udp(action, direction) => {
            let (source, destination) = oriented(direction, local, remote);
            EventKind::Udp(UdpEvent {
                source,
                destination,
                length: size,
                direction,
                action,
            })
        }
    };

    Some(Decoded { pid, kind })
}

fn oriented(direction: Direction, local: SocketAddr, remote: SocketAddr) -> (SocketAddr, SocketAddr) {
    match direction {
        Direction::Outbound => (local, remote),
        Direction::Inbound => (remote, local),
    }
}

/// Query-completed template: `QueryName, QueryType, QueryOptions, QueryStatus, QueryResults`.
fn decode_dns(record: &RawRecord<'_>) -> Option<Decoded> {
    if record.event_id != dns_client::QUERY_COMPLETED {
        return None;
    }
    let mut reader = PayloadReader::new(record.data);
    let query_name = reader.utf16z()?;
    let query_type = reader.u32_le()?;
    let _options = reader.u64_le()?;
    let status = reader.u32_le()?;
    let results = reader.utf16z().unwrap_or_default();

    if query_name.is_empty() {
        return None;
    }

    Some(Decoded {
        pid: record.pid,
        kind: EventKind::Dns(DnsEvent {
            query_name,
            query_type: u16::try_from(query_type).unwrap_or(0),
            addresses: parse_query_results(&results),
            status,
        }),
    })
}

/// Results look like `"type:  5 cdn.example.net;93.184.216.34;::ffff:93.184.216.34;"`.
/// Only literal addresses are kept; v4-mapped v6 addresses collapse to v4.
pub fn parse_query_results(results: &str) -> Vec<IpAddr> {
    let mut addresses = Vec::new();
    for token in results.split(';') {
        let token = token.trim();
        let Ok(ip) = token.parse::<IpAddr>() else {
            continue;
        };
        let ip = match ip {
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::V4(v4),
                None => IpAddr::V6(v6),
            },
            v4 => v4,
        };
        if !addresses.contains(&ip) {
            addresses.push(ip);
        }
    }
    addresses
}

/// Request-parsed template: `RequestObj (pointer), HttpVerb, Url`.
fn decode_http(record: &RawRecord<'_>) -> Option<Decoded> {
    if record.event_id != http_service::REQUEST_PARSED {
        return None;
    }
    let mut reader = PayloadReader::new(record.data);
    let _request = reader.pointer(record.pointer_size)?;
    let verb = reader.u32_le()?;
    let url = reader.utf16z()?;
    Some(Decoded {
        pid: record.pid,
        kind: EventKind::Http(HttpEvent {
            method: http_verb(verb).to_string(),
            url,
        }),
    })
}

pub fn http_verb(verb: u32) -> &'static str {
    match verb {
        3 => "OPTIONS",
        4 => "GET",
        5 => "HEAD",
        6 => "POST",
        7 => "PUT",
        8 => "DELETE",
        9 => "TRACE",
        10 => "CONNECT",
        11 => "TRACK",
        12 => "MOVE",
        13 => "COPY",
        14 => "PROPFIND",
        15 => "PROPPATCH",
        16 => "MKCOL",
        17 => "LOCK",
        18 => "UNLOCK",
        19 => "SEARCH",
        _ => "UNKNOWN",
    }
}

fn decode_profile(record: &RawRecord<'_>) -> Option<Decoded> {
    let state = match record.event_id {
        network_profile::NETWORK_CONNECTED => InterfaceState::Connected,
        network_profile::NETWORK_DISCONNECTED => InterfaceState::Disconnected,
        _ => return None,
    };
    let mut reader = PayloadReader::new(record.data);
    let name = reader.utf16z()?;
    Some(Decoded {
        pid: record.pid,
        kind: EventKind::Interface(InterfaceEvent { name, state }),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn kernel_payload_v4(
        pid: u32,
        size: u32,
        remote: ([u8; 4], u16),
        local: ([u8; 4], u16),
        tail: &[u8],
    ) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&pid.to_le_bytes());
        data.extend_from_slice(&size.to_le_bytes());
        data.extend_from_slice(&remote.0);
        data.extend_from_slice(&local.0);
        data.extend_from_slice(&remote.1.to_be_bytes());
        data.extend_from_slice(&local.1.to_be_bytes());
        data.extend_from_slice(tail);
        data
    }

    fn utf16z(s: &str) -> Vec<u8> {
        let mut out: Vec<u8> = s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        out.extend_from_slice(&[0, 0]);
        out
    }

    fn record(provider: Provider, event_id: u16, data: &[u8]) -> RawRecord<'_> {
        RawRecord {
            provider,
            event_id,
            pid: 4,
            thread_id: 9,
            timestamp: Utc::now(),
            pointer_size: 8,
            data,
        }
    }

    #[test]
    fn tcp_send_v4_decodes_endpoints_and_sequence() {
        let mut tail = Vec::new();
        tail.extend_from_slice(&1u32.to_le_bytes());
        tail.extend_from_slice(&2u32.to_le_bytes());
        tail.extend_from_slice(&777u32.to_le_bytes());
        let data = kernel_payload_v4(4242, 1500, ([93, 184, 216, 34], 443), ([10, 0, 0, 5], 51000), &tail);

        let decoded = decode(&record(Provider::KernelNetwork, kernel_network::TCP_SEND_V4, &data))
            .expect("decodes");
        assert_eq!(decoded.pid, 4242);
        let EventKind::Tcp(tcp) = decoded.kind else {
            panic!("expected tcp");
        };
        assert_eq!(tcp.action, TcpAction::Send);
        assert_eq!(tcp.length, 1500);
        assert_eq!(tcp.sequence, Some(777));
        assert_eq!(tcp.local(), "10.0.0.5:51000".parse().unwrap());
        assert_eq!(tcp.remote(), "93.184.216.34:443".parse().unwrap());
        assert_eq!(tcp.source, tcp.local());
    }

    #[test]
    fn tcp_receive_is_inbound() {
        let data = kernel_payload_v4(10, 64, ([1, 1, 1, 1], 443), ([192, 168, 1, 2], 60000), &5u32.to_le_bytes());
        let decoded = decode(&record(Provider::KernelNetwork, kernel_network::TCP_RECV_V4, &data)).unwrap();
        let EventKind::Tcp(tcp) = decoded.kind else {
            panic!("expected tcp");
        };
        assert_eq!(tcp.direction, Direction::Inbound);
        assert_eq!(tcp.source, "1.1.1.1:443".parse().unwrap());
        assert_eq!(tcp.local(), "192.168.1.2:60000".parse().unwrap());
        assert_eq!(tcp.sequence, Some(5));
    }

    #[test]
    fn tcp_connect_reports_zero_length() {
        let mut tail = vec![0u8; 16];
        tail.extend_from_slice(&99u32.to_le_bytes());
        let data = kernel_payload_v4(10, 0, ([8, 8, 8, 8], 53), ([10, 0, 0, 1], 40000), &tail);
        let decoded = decode(&record(Provider::KernelNetwork, kernel_network::TCP_CONNECT_V4, &data)).unwrap();
        let EventKind::Tcp(tcp) = decoded.kind else {
            panic!("expected tcp");
        };
        assert_eq!(tcp.action, TcpAction::Connect);
        assert_eq!(tcp.length, 0);
        assert_eq!(tcp.sequence, Some(99));
    }

    #[test]
    fn udp_v6_send_decodes() {
        let remote: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let local: Ipv6Addr = "2001:db8::2".parse().unwrap();
        let mut data = Vec::new();
        data.extend_from_slice(&77u32.to_le_bytes());
        data.extend_from_slice(&512u32.to_le_bytes());
        data.extend_from_slice(&remote.octets());
        data.extend_from_slice(&local.octets());
        data.extend_from_slice(&53u16.to_be_bytes());
        data.extend_from_slice(&50123u16.to_be_bytes());

        let decoded = decode(&record(Provider::KernelNetwork, kernel_network::UDP_SEND_V6, &data)).unwrap();
        let EventKind::Udp(udp) = decoded.kind else {
            panic!("expected udp");
        };
        assert_eq!(udp.length, 512);
        assert_eq!(udp.remote(), SocketAddr::new(IpAddr::V6(remote), 53));
        assert_eq!(udp.local(), SocketAddr::new(IpAddr::V6(local), 50123));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let data = [1u8, 0, 0, 0, 5];
        assert!(decode(&record(Provider::KernelNetwork, kernel_network::TCP_SEND_V4, &data)).is_none());
    }

    #[test]
    fn unknown_event_id_is_ignored() {
        let data = kernel_payload_v4(1, 1, ([1, 1, 1, 1], 1), ([2, 2, 2, 2], 2), &[]);
        assert!(decode(&record(Provider::KernelNetwork, 14, &data)).is_none());
    }

    #[test]
    fn dns_completion_decodes_addresses() {
        let mut data = utf16z("example.com");
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&0u64.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend(utf16z("type:  5 edge.example.net;93.184.216.34;::ffff:93.184.216.35;"));

        let decoded = decode(&record(Provider::DnsClient, dns_client::QUERY_COMPLETED, &data)).unwrap();
        let EventKind::Dns(dns) = decoded.kind else {
            panic!("expected dns");
        };
        assert_eq!(dns.query_name, "example.com");
        assert_eq!(dns.query_type_name(), "A");
        assert_eq!(
            dns.addresses,
            vec![
                "93.184.216.34".parse::<IpAddr>().unwrap(),
                "93.184.216.35".parse::<IpAddr>().unwrap()
            ]
        );
    }

    #[test]
    fn http_request_decodes_verb_and_url() {
        let mut data = 0xdead_beef_u64.to_le_bytes().to_vec();
        data.extend_from_slice(&6u32.to_le_bytes());
        data.extend(utf16z("http://localhost:8080/api/items"));
        let decoded = decode(&record(Provider::HttpService, http_service::REQUEST_PARSED, &data)).unwrap();
        assert_eq!(
            decoded.kind,
            EventKind::Http(HttpEvent {
                method: "POST".to_string(),
                url: "http://localhost:8080/api/items".to_string(),
            })
        );
    }

    #[test]
    fn http_request_honours_32_bit_pointers() {
        let mut data = 0x1234_u32.to_le_bytes().to_vec();
        data.extend_from_slice(&4u32.to_le_bytes());
        data.extend(utf16z("/"));
        let mut rec = record(Provider::HttpService, http_service::REQUEST_PARSED, &data);
        rec.pointer_size = 4;
        let decoded = decode(&rec).unwrap();
        let EventKind::Http(http) = decoded.kind else {
            panic!("expected http");
        };
        assert_eq!(http.method, "GET");
        assert_eq!(http.url, "/");
    }

    #[test]
    fn profile_events_map_to_interface_state() {
        let data = utf16z("Corp WiFi");
        let decoded =
            decode(&record(Provider::NetworkProfile, network_profile::NETWORK_DISCONNECTED, &data)).unwrap();
        assert_eq!(
            decoded.kind,
            EventKind::Interface(InterfaceEvent {
                name: "Corp WiFi".to_string(),
                state: InterfaceState::Disconnected,
            })
        );
    }

    #[test]
    fn filetime_converts_to_unix_time() {
        let ft = FILETIME_UNIX_EPOCH + 10_000_000 * 60 + 5;
        let dt = filetime_to_datetime(ft);
        assert_eq!(dt.timestamp(), 60);
        assert_eq!(dt.timestamp_subsec_nanos(), 500);
    }
}
