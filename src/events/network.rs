use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
    Other,
}

impl Protocol {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
            Self::Other => "OTHER",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Identity of one logical connection, shared by every component.
///
/// Two connections that reuse the same pid and five-tuple inside one
/// enumeration gap are indistinguishable; records carry a start time so that
/// consumers can tell a restarted connection apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionKey {
    pub pid: u32,
    pub protocol: Protocol,
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

impl ConnectionKey {
    pub fn new(pid: u32, protocol: Protocol, local: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            pid,
            protocol,
            local,
            remote,
        }
    }

    pub fn tcp(pid: u32, local: SocketAddr, remote: SocketAddr) -> Self {
        Self::new(pid, Protocol::Tcp, local, remote)
    }

    pub fn udp(pid: u32, local: SocketAddr, remote: SocketAddr) -> Self {
        Self::new(pid, Protocol::Udp, local, remote)
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} {} -> {}",
            self.pid, self.protocol, self.local, self.remote
        )
    }
}

pub fn unspecified_endpoint() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TcpAction {
    Connect,
    Disconnect,
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UdpAction {
    Send,
    Receive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpEvent {
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub length: u32,
    pub sequence: Option<u32>,
    pub direction: Direction,
    pub action: TcpAction,
}

impl TcpEvent {
    pub fn local(&self) -> SocketAddr {
        match self.direction {
            Direction::Outbound => self.source,
            Direction::Inbound => self.destination,
        }
    }

    pub fn remote(&self) -> SocketAddr {
        match self.direction {
            Direction::Outbound => self.destination,
            Direction::Inbound => self.source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdpEvent {
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub length: u32,
    pub direction: Direction,
    pub action: UdpAction,
}

impl UdpEvent {
    pub fn local(&self) -> SocketAddr {
        match self.direction {
            Direction::Outbound => self.source,
            Direction::Inbound => self.destination,
        }
    }

    pub fn remote(&self) -> SocketAddr {
        match self.direction {
            Direction::Outbound => self.destination,
            Direction::Inbound => self.source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsEvent {
    pub query_name: String,
    pub query_type: u16,
    pub addresses: Vec<IpAddr>,
    pub status: u32,
}

impl DnsEvent {
    pub fn query_type_name(&self) -> &'static str {
        query_type_name(self.query_type)
    }
}

pub fn query_type_name(query_type: u16) -> &'static str {
    match query_type {
        1 => "A",
        2 => "NS",
        5 => "CNAME",
        6 => "SOA",
        12 => "PTR",
        15 => "MX",
        16 => "TXT",
        28 => "AAAA",
        33 => "SRV",
        65 => "HTTPS",
        255 => "ANY",
        _ => "OTHER",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpEvent {
    pub method: String,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterfaceState {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceEvent {
    pub name: String,
    pub state: InterfaceState,
}
