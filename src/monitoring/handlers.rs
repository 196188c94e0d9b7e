//! Wires capture callbacks into the state store and the UDP tracker.

use super::udp_tracker::UdpTracker;
use crate::capture::{CallbackId, EventDispatcher};
use crate::events::{EventKind, InterfaceState, NetworkEvent, TcpAction};
use crate::state::{ConnectionObservation, ConnectionState, GlobalNetworkMonitor};
use std::sync::Arc;

fn record_process(monitor: &GlobalNetworkMonitor, event: &NetworkEvent) {
    monitor.update_process_at(event.pid, &event.process_name, Some(event.thread_id), event.timestamp);
}

pub fn handle_tcp(monitor: &GlobalNetworkMonitor, event: &NetworkEvent) {
    let EventKind::Tcp(tcp) = &event.kind else {
        return;
    };
    let Some(key) = event.connection_key() else {
        return;
    };
    record_process(monitor, event);

    let observation = match tcp.action {
        TcpAction::Connect => ConnectionObservation::State {
            key,
            state: ConnectionState::Connected,
            direction: tcp.direction,
            at: event.timestamp,
        },
        TcpAction::Disconnect => ConnectionObservation::State {
            key,
            state: ConnectionState::Disconnected,
            direction: tcp.direction,
            at: event.timestamp,
        },
        TcpAction::Send | TcpAction::Receive => ConnectionObservation::Traffic {
            key,
            direction: tcp.direction,
            bytes: u64::from(tcp.length),
            at: event.timestamp,
        },
    };
    monitor.update_connection(observation);
}

pub fn handle_udp(monitor: &GlobalNetworkMonitor, udp: &UdpTracker, event: &NetworkEvent) {
    if !matches!(event.kind, EventKind::Udp(_)) {
        return;
    }
    record_process(monitor, event);
    udp.on_event(event);
}

/// Every resolved address is mapped back to the queried name.
pub fn handle_dns(monitor: &GlobalNetworkMonitor, event: &NetworkEvent) {
    let EventKind::Dns(dns) = &event.kind else {
        return;
    };
    if dns.status != 0 || dns.query_name.is_empty() {
        return;
    }
    for address in &dns.addresses {
        monitor.update_dns_at(&address.to_string(), &dns.query_name, dns.query_type, event.timestamp);
    }
    log::trace!(
        "DNS {} {} -> {} addresses (pid {})",
        dns.query_type_name(),
        dns.query_name,
        dns.addresses.len(),
        event.pid
    );
}

pub fn handle_http(monitor: &GlobalNetworkMonitor, event: &NetworkEvent) {
    let EventKind::Http(http) = &event.kind else {
        return;
    };
    record_process(monitor, event);
    log::debug!("HTTP {} {} (pid {})", http.method, http.url, event.pid);
}

pub fn handle_interface(event: &NetworkEvent) {
    let EventKind::Interface(iface) = &event.kind else {
        return;
    };
    match iface.state {
        InterfaceState::Connected => log::info!("Network interface connected: {}", iface.name),
        InterfaceState::Disconnected => log::warn!("Network interface disconnected: {}", iface.name),
    }
}

/// Registers one callback per event category. The returned ids can be passed
/// to [`EventDispatcher::unregister`].
pub fn register(
    dispatcher: &EventDispatcher,
    monitor: Arc<GlobalNetworkMonitor>,
    udp: Arc<UdpTracker>,
) -> Vec<CallbackId> {
    let mut ids = Vec::with_capacity(5);

    let m = Arc::clone(&monitor);
    ids.push(dispatcher.on_tcp(move |event| handle_tcp(&m, event)));

    let m = Arc::clone(&monitor);
    ids.push(dispatcher.on_udp(move |event| handle_udp(&m, &udp, event)));

    let m = Arc::clone(&monitor);
    ids.push(dispatcher.on_dns(move |event| handle_dns(&m, event)));

    let m = monitor;
    ids.push(dispatcher.on_http(move |event| handle_http(&m, event)));

    ids.push(dispatcher.on_interface(handle_interface));

    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::BatchingDispatcher;
    use crate::config::CaptureConfig;
    use crate::events::{
        ConnectionKey, Direction, DnsEvent, HttpEvent, TcpEvent, UdpAction, UdpEvent,
    };
    use chrono::{DateTime, Duration, Utc};
    use std::net::SocketAddr;

    const LOCAL: &str = "192.168.1.10:50123";
    const REMOTE: &str = "140.82.112.3:443";

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn tcp(action: TcpAction, direction: Direction, length: u32, at: DateTime<Utc>) -> NetworkEvent {
        let (source, destination) = match direction {
            Direction::Outbound => (addr(LOCAL), addr(REMOTE)),
            Direction::Inbound => (addr(REMOTE), addr(LOCAL)),
        };
        NetworkEvent::new(
            at,
            4242,
            9,
            "client.exe",
            EventKind::Tcp(TcpEvent {
                source,
                destination,
                length,
                sequence: None,
                direction,
                action,
            }),
        )
    }

    fn wired() -> (Arc<GlobalNetworkMonitor>, Arc<EventDispatcher>) {
        let monitor = Arc::new(GlobalNetworkMonitor::default());
        let udp = Arc::new(UdpTracker::new(Arc::clone(&monitor), std::time::Duration::from_secs(60)));
        let dispatcher = Arc::new(EventDispatcher::new());
        let ids = register(&dispatcher, Arc::clone(&monitor), udp);
        assert_eq!(ids.len(), 5);
        (monitor, dispatcher)
    }

    #[test]
    fn event_payloads_sum_to_cumulative_bytes() {
        let (monitor, dispatcher) = wired();
        let batching = BatchingDispatcher::new(Arc::clone(&dispatcher), &CaptureConfig::default());
        let t0 = Utc::now();

        let sends = [1_200u32, 800, 4_000, 16];
        let receives = [9_000u32, 3];
        batching.enqueue(tcp(TcpAction::Connect, Direction::Outbound, 0, t0));
        for (i, len) in sends.iter().enumerate() {
            batching.enqueue(tcp(TcpAction::Send, Direction::Outbound, *len, t0 + Duration::milliseconds(i as i64)));
        }
        for len in receives {
            batching.enqueue(tcp(TcpAction::Receive, Direction::Inbound, len, t0));
        }
        batching.drain_once();

        let key = ConnectionKey::tcp(4242, addr(LOCAL), addr(REMOTE));
        let record = monitor.connection(&key).unwrap();
        assert_eq!(record.bytes_sent, sends.iter().map(|&l| u64::from(l)).sum::<u64>());
        assert_eq!(record.bytes_received, receives.iter().map(|&l| u64::from(l)).sum::<u64>());
        assert_eq!(monitor.get_process_details(4242).unwrap().process_name, "client.exe");
    }

    #[test]
    fn disconnect_marks_the_connection_closed() {
        let (monitor, dispatcher) = wired();
        let t0 = Utc::now();
        dispatcher.dispatch(&tcp(TcpAction::Connect, Direction::Outbound, 0, t0));
        dispatcher.dispatch(&tcp(TcpAction::Disconnect, Direction::Outbound, 0, t0));
        let key = ConnectionKey::tcp(4242, addr(LOCAL), addr(REMOTE));
        assert_eq!(monitor.connection(&key).unwrap().state, ConnectionState::Disconnected);
    }

    #[test]
    fn dns_answers_populate_the_cache() {
        let (monitor, dispatcher) = wired();
        let event = NetworkEvent::new(
            Utc::now(),
            1000,
            1,
            "svchost.exe",
            EventKind::Dns(DnsEvent {
                query_name: "github.com".into(),
                query_type: 1,
                addresses: vec!["140.82.112.3".parse().unwrap(), "140.82.112.4".parse().unwrap()],
                status: 0,
            }),
        );
        dispatcher.dispatch(&event);
        assert_eq!(monitor.lookup_domain("140.82.112.4").as_deref(), Some("github.com"));

        let failed = NetworkEvent::new(
            Utc::now(),
            1000,
            1,
            "svchost.exe",
            EventKind::Dns(DnsEvent {
                query_name: "missing.example".into(),
                query_type: 1,
                addresses: vec!["10.9.9.9".parse().unwrap()],
                status: 9003,
            }),
        );
        dispatcher.dispatch(&failed);
        assert!(monitor.lookup_domain("10.9.9.9").is_none());
    }

    #[test]
    fn udp_and_http_events_register_processes() {
        let (monitor, dispatcher) = wired();
        dispatcher.dispatch(&NetworkEvent::new(
            Utc::now(),
            77,
            2,
            "game.exe",
            EventKind::Udp(UdpEvent {
                source: addr("192.168.1.10:3074"),
                destination: addr("52.1.1.1:3074"),
                length: 512,
                direction: Direction::Outbound,
                action: UdpAction::Send,
            }),
        ));
        dispatcher.dispatch(&NetworkEvent::new(
            Utc::now(),
            78,
            2,
            "w3wp.exe",
            EventKind::Http(HttpEvent {
                method: "GET".into(),
                url: "/index.html".into(),
            }),
        ));
        assert_eq!(monitor.get_process_details(77).unwrap().total_bytes_sent, 512);
        assert_eq!(monitor.get_process_details(78).unwrap().process_name, "w3wp.exe");
    }
}
