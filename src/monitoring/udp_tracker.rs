//! UDP pseudo-sessions.
//!
//! UDP has no connect or close. A session starts with the first packet for a
//! key, is refreshed by every later packet, and ends only when the idle sweep
//! finds it quiet for longer than the timeout.

use crate::events::{ConnectionKey, Direction, EventKind, NetworkEvent};
use crate::state::{ConnectionObservation, GlobalNetworkMonitor};
use crate::utils::scheduler;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UdpSession {
    pub key: ConnectionKey,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
}

pub struct UdpTracker {
    sessions: Mutex<HashMap<ConnectionKey, UdpSession>>,
    idle_timeout: Duration,
    monitor: Arc<GlobalNetworkMonitor>,
}

impl UdpTracker {
    pub fn new(monitor: Arc<GlobalNetworkMonitor>, idle_timeout: std::time::Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            idle_timeout: Duration::from_std(idle_timeout).unwrap_or(Duration::seconds(60)),
            monitor,
        }
    }

    pub fn on_event(&self, event: &NetworkEvent) {
        if let EventKind::Udp(udp) = &event.kind {
            let key = ConnectionKey::udp(event.pid, udp.local(), udp.remote());
            self.on_packet(key, udp.direction, u64::from(udp.length), event.timestamp);
        }
    }

    /// The session lock is held across the monitor update so a concurrent
    /// sweep sees either both sides of the packet or neither. Lock order is
    /// tracker then monitor.
    pub fn on_packet(&self, key: ConnectionKey, direction: Direction, bytes: u64, at: DateTime<Utc>) {
        let mut sessions = self.sessions.lock();
        let session = sessions.entry(key).or_insert_with(|| UdpSession {
            key,
            first_seen: at,
            last_seen: at,
            bytes_sent: 0,
            bytes_received: 0,
            packets_sent: 0,
            packets_received: 0,
        });
        if at > session.last_seen {
            session.last_seen = at;
        }
        match direction {
            Direction::Outbound => {
                session.bytes_sent = session.bytes_sent.saturating_add(bytes);
                session.packets_sent += 1;
            }
            Direction::Inbound => {
                session.bytes_received = session.bytes_received.saturating_add(bytes);
                session.packets_received += 1;
            }
        }
        self.monitor.update_connection(ConnectionObservation::Traffic {
            key,
            direction,
            bytes,
            at,
        });
    }

    pub fn sweep(&self) -> Vec<ConnectionKey> {
        self.sweep_at(Utc::now())
    }

    /// Removes sessions idle for longer than the timeout, here and in the
    /// monitor.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> Vec<ConnectionKey> {
        let mut sessions = self.sessions.lock();
        let expired: Vec<ConnectionKey> = sessions
            .values()
            .filter(|s| now - s.last_seen > self.idle_timeout)
            .map(|s| s.key)
            .collect();
        for key in &expired {
            sessions.remove(key);
            self.monitor.remove_connection(key);
        }
        drop(sessions);
        if !expired.is_empty() {
            log::debug!("UDP sweep removed {} idle sessions", expired.len());
        }
        expired
    }

    pub fn session(&self, key: &ConnectionKey) -> Option<UdpSession> {
        self.sessions.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    pub fn start_sweeper(
        self: &Arc<Self>,
        interval: std::time::Duration,
        running: Arc<AtomicBool>,
    ) -> std::io::Result<JoinHandle<()>> {
        let this = Arc::clone(self);
        scheduler::spawn_periodic("udp-sweep", interval, running, move || {
            this.sweep();
        })
    }
}
