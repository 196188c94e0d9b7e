pub mod network;

pub use network::{
    ConnectionKey, Direction, DnsEvent, HttpEvent, InterfaceEvent, InterfaceState, Protocol,
    TcpAction, TcpEvent, UdpAction, UdpEvent,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventCategory {
    Tcp,
    Udp,
    Dns,
    Http,
    Interface,
}

impl EventCategory {
    pub const ALL: [EventCategory; 5] = [
        EventCategory::Tcp,
        EventCategory::Udp,
        EventCategory::Dns,
        EventCategory::Http,
        EventCategory::Interface,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Tcp(TcpEvent),
    Udp(UdpEvent),
    Dns(DnsEvent),
    Http(HttpEvent),
    Interface(InterfaceEvent),
}

/// One decoded trace record. Produced once by the capture layer and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkEvent {
    pub timestamp: DateTime<Utc>,
    pub pid: u32,
    pub thread_id: u32,
    pub process_name: String,
    pub protocol: Protocol,
    pub kind: EventKind,
}

impl NetworkEvent {
    pub fn new(
        timestamp: DateTime<Utc>,
        pid: u32,
        thread_id: u32,
        process_name: impl Into<String>,
        kind: EventKind,
    ) -> Self {
        let protocol = match &kind {
            EventKind::Tcp(_) | EventKind::Http(_) => Protocol::Tcp,
            EventKind::Udp(_) | EventKind::Dns(_) => Protocol::Udp,
            EventKind::Interface(_) => Protocol::Other,
        };
        Self {
            timestamp,
            pid,
            thread_id,
            process_name: process_name.into(),
            protocol,
            kind,
        }
    }

    pub fn category(&self) -> EventCategory {
        match self.kind {
            EventKind::Tcp(_) => EventCategory::Tcp,
            EventKind::Udp(_) => EventCategory::Udp,
            EventKind::Dns(_) => EventCategory::Dns,
            EventKind::Http(_) => EventCategory::Http,
            EventKind::Interface(_) => EventCategory::Interface,
        }
    }

    /// Join key for transport events; `None` for DNS, HTTP and interface events.
    pub fn connection_key(&self) -> Option<ConnectionKey> {
        match &self.kind {
            EventKind::Tcp(tcp) => Some(ConnectionKey::tcp(self.pid, tcp.local(), tcp.remote())),
            EventKind::Udp(udp) => Some(ConnectionKey::udp(self.pid, udp.local(), udp.remote())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_event_yields_connection_key() {
        let event = NetworkEvent::new(
            Utc::now(),
            4242,
            7,
            "app.exe",
            EventKind::Tcp(TcpEvent {
                source: "10.0.0.2:51000".parse().unwrap(),
                destination: "1.1.1.1:443".parse().unwrap(),
                length: 10,
                sequence: Some(1),
                direction: Direction::Outbound,
                action: TcpAction::Send,
            }),
        );
        let key = event.connection_key().unwrap();
        assert_eq!(key.pid, 4242);
        assert_eq!(key.protocol, Protocol::Tcp);
        assert_eq!(key.remote.port(), 443);
        assert_eq!(event.category(), EventCategory::Tcp);
    }

    #[test]
    fn dns_event_has_no_key() {
        let event = NetworkEvent::new(
            Utc::now(),
            1,
            1,
            "dns.exe",
            EventKind::Dns(DnsEvent {
                query_name: "example.com".into(),
                query_type: 1,
                addresses: vec![],
                status: 0,
            }),
        );
        assert!(event.connection_key().is_none());
        assert_eq!(event.protocol, Protocol::Udp);
    }
}
