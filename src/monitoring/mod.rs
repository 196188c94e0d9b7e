//! Consumers of the capture stream and the connection table: event handlers,
//! the rate sampler, UDP session tracking, metadata lookup and persistence.

pub mod handlers;
pub mod metadata;
pub mod persistence;
pub mod rate_monitor;
pub mod udp_tracker;

pub use metadata::{request_channel, MetadataResolver};
pub use persistence::{start_persistence, DeltaTracker, JsonLinesSink, TrafficRow, TrafficSink};
pub use rate_monitor::{
    event_channel, start_event_logger, ConnectionRate, PerformanceSnapshot, ProcessNetworkStats, RateEvent,
    RateMonitor, RateSettings, TickReport,
};
pub use udp_tracker::{UdpSession, UdpTracker};
