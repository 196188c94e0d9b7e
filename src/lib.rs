//! Per-process network traffic attribution for Windows hosts.
//!
//! Kernel trace events and periodic TCP table samples are reconciled into one
//! shared store that answers "which process moved how many bytes to where".

pub mod capture;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod monitoring;
pub mod platform;
pub mod state;
pub mod utils;

pub use error::{MonitorError, Result};
pub use state::GlobalNetworkMonitor;
