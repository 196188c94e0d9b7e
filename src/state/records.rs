use super::rate::{compute_rate, secs_between};
use crate::events::{ConnectionKey, Direction, Protocol};
use crate::platform::process::ProgramInfo;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};

pub const MAX_ALTERNATE_DOMAINS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Listening,
    Unknown,
}

/// Byte movement between two observations of one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficDelta {
    pub sent: u64,
    pub received: u64,
}

impl TrafficDelta {
    pub fn is_empty(&self) -> bool {
        self.sent == 0 && self.received == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionRecord {
    pub key: ConnectionKey,
    pub state: ConnectionState,
    pub direction: Direction,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub last_sample_sent: u64,
    pub last_sample_received: u64,
    pub last_sample_at: DateTime<Utc>,
    pub send_rate: f64,
    pub receive_rate: f64,
    pub is_active: bool,
    /// Last raw kernel counters seen. Once set, totals grow by counter deltas
    /// and event bytes are ignored.
    pub raw_counters: Option<(u64, u64)>,
}

impl ConnectionRecord {
    /// A record first seen through events starts from a zero baseline.
    pub fn new(key: ConnectionKey, state: ConnectionState, direction: Direction, at: DateTime<Utc>) -> Self {
        Self {
            key,
            state,
            direction,
            start_time: at,
            last_activity: at,
            bytes_sent: 0,
            bytes_received: 0,
            last_sample_sent: 0,
            last_sample_received: 0,
            last_sample_at: at,
            send_rate: 0.0,
            receive_rate: 0.0,
            is_active: false,
            raw_counters: None,
        }
    }

    /// A record first seen through a counter sample uses that sample as its
    /// rate baseline, so a long-lived connection does not show its whole
    /// history as one burst.
    pub fn from_sample(key: ConnectionKey, sent: u64, received: u64, at: DateTime<Utc>) -> Self {
        let mut record = Self::new(key, ConnectionState::Connected, Direction::Outbound, at);
        record.bytes_sent = sent;
        record.bytes_received = received;
        record.last_sample_sent = sent;
        record.last_sample_received = received;
        record.raw_counters = Some((sent, received));
        record
    }

    pub fn protocol(&self) -> Protocol {
        self.key.protocol
    }

    pub fn is_counter_backed(&self) -> bool {
        self.raw_counters.is_some()
    }

    pub fn add_traffic(&mut self, direction: Direction, bytes: u64, at: DateTime<Utc>) -> TrafficDelta {
        self.touch(at);
        if self.is_counter_backed() {
            return TrafficDelta::default();
        }
        match direction {
            Direction::Outbound => {
                self.bytes_sent = self.bytes_sent.saturating_add(bytes);
                TrafficDelta { sent: bytes, received: 0 }
            }
            Direction::Inbound => {
                self.bytes_received = self.bytes_received.saturating_add(bytes);
                TrafficDelta { sent: 0, received: bytes }
            }
        }
    }

    /// Folds cumulative counters in. The first sample only sets the raw
    /// baseline, since counters enabled mid-connection start from zero. Later
    /// samples add their raw-to-raw delta to the totals; a counter that went
    /// backwards is a reset, contributes nothing and becomes the new baseline.
    pub fn apply_sample(&mut self, sent: u64, received: u64, at: DateTime<Utc>) -> TrafficDelta {
        self.touch(at);
        if matches!(self.state, ConnectionState::Connecting | ConnectionState::Unknown) {
            self.state = ConnectionState::Connected;
        }
        let delta = match self.raw_counters {
            Some((prev_sent, prev_received)) => TrafficDelta {
                sent: sent.saturating_sub(prev_sent),
                received: received.saturating_sub(prev_received),
            },
            None => TrafficDelta::default(),
        };
        self.raw_counters = Some((sent, received));
        self.bytes_sent = self.bytes_sent.saturating_add(delta.sent);
        self.bytes_received = self.bytes_received.saturating_add(delta.received);
        delta
    }

    pub fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.last_activity {
            self.last_activity = at;
        }
    }

    /// Recomputes rates once at least `window` has passed since the previous
    /// sample point.
    pub fn refresh_rates(&mut self, at: DateTime<Utc>, window: Duration, max_elapsed_secs: f64) {
        if at - self.last_sample_at < window {
            return;
        }
        let elapsed = secs_between(self.last_sample_at, at);
        self.send_rate = compute_rate(self.last_sample_sent, self.bytes_sent, elapsed, max_elapsed_secs);
        self.receive_rate = compute_rate(self.last_sample_received, self.bytes_received, elapsed, max_elapsed_secs);
        self.last_sample_sent = self.bytes_sent;
        self.last_sample_received = self.bytes_received;
        self.last_sample_at = at;
        self.is_active = self.send_rate > 0.0 || self.receive_rate > 0.0;
    }

    pub fn mark_disconnected(&mut self, at: DateTime<Utc>) {
        self.state = ConnectionState::Disconnected;
        self.touch(at);
        self.send_rate = 0.0;
        self.receive_rate = 0.0;
        self.is_active = false;
    }

    /// Rates older than `stale` are no longer current.
    pub fn current_rates(&self, now: DateTime<Utc>, stale: Duration) -> (f64, f64) {
        if self.state == ConnectionState::Disconnected || now - self.last_activity > stale {
            (0.0, 0.0)
        } else {
            (self.send_rate, self.receive_rate)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationRecord {
    pub pid: u32,
    pub info: ProgramInfo,
    pub first_seen: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessNetworkInfo {
    pub pid: u32,
    pub name: String,
    pub first_seen: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub last_thread_id: Option<u32>,
    pub connections: BTreeSet<ConnectionKey>,
}

impl ProcessNetworkInfo {
    pub fn new(pid: u32, name: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            pid,
            name: name.into(),
            first_seen: at,
            last_active: at,
            last_thread_id: None,
            connections: BTreeSet::new(),
        }
    }

    pub fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.last_active {
            self.last_active = at;
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DnsResolveInfo {
    pub domain: String,
    pub query_type: u16,
    pub resolved_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    /// Other names seen for the same address, most recent last.
    pub alternates: VecDeque<String>,
}

impl DnsResolveInfo {
    pub fn new(domain: impl Into<String>, query_type: u16, at: DateTime<Utc>) -> Self {
        Self {
            domain: domain.into(),
            query_type,
            resolved_at: at,
            last_used: at,
            alternates: VecDeque::new(),
        }
    }

    /// The newest name becomes primary; the previous one moves to the
    /// alternates list.
    pub fn record(&mut self, domain: &str, query_type: u16, at: DateTime<Utc>) {
        if !self.domain.eq_ignore_ascii_case(domain) {
            let previous = std::mem::replace(&mut self.domain, domain.to_string());
            self.alternates.retain(|d| !d.eq_ignore_ascii_case(domain) && !d.eq_ignore_ascii_case(&previous));
            self.alternates.push_back(previous);
            while self.alternates.len() > MAX_ALTERNATE_DOMAINS {
                self.alternates.pop_front();
            }
        }
        self.query_type = query_type;
        self.resolved_at = at;
        self.last_used = at;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficTotals {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub last_update: DateTime<Utc>,
}

impl TrafficTotals {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            bytes_sent: 0,
            bytes_received: 0,
            last_update: at,
        }
    }

    pub fn total(&self) -> u64 {
        self.bytes_sent.saturating_add(self.bytes_received)
    }
}
