//! Start/stop facade over the platform trace session.

use super::providers::{enabled_providers, Provider};
use super::EventSink;
use crate::config::CaptureConfig;
use crate::error::{MonitorError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[cfg(windows)]
use super::etw::EtwSession;

/// Counters maintained by the trace callback.
#[derive(Debug, Default)]
pub struct SessionCounters {
    pub records: AtomicU64,
    pub decoded: AtomicU64,
    pub undecoded: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub records: u64,
    pub decoded: u64,
    pub undecoded: u64,
}

impl SessionCounters {
    pub fn snapshot(&self) -> SessionStats {
        SessionStats {
            records: self.records.load(Ordering::Relaxed),
            decoded: self.decoded.load(Ordering::Relaxed),
            undecoded: self.undecoded.load(Ordering::Relaxed),
        }
    }
}

pub struct CaptureSession {
    name: String,
    providers: Vec<Provider>,
    sink: Arc<dyn EventSink>,
    counters: Arc<SessionCounters>,
    #[cfg(windows)]
    active: Mutex<Option<EtwSession>>,
    #[cfg(not(windows))]
    active: Mutex<Option<()>>,
}

impl CaptureSession {
    pub fn new(config: &CaptureConfig, sink: Arc<dyn EventSink>) -> Self {
        let providers = enabled_providers(&config.providers);
        if providers.contains(&Provider::WinsockAfd) {
            log::warn!("Winsock AFD provider enabled: its records are counted but not decoded");
        }
        Self {
            name: config.session_name.clone(),
            providers,
            sink,
            counters: Arc::new(SessionCounters::default()),
            active: Mutex::new(None),
        }
    }

    pub fn providers(&self) -> &[Provider] {
        &self.providers
    }

    pub fn is_running(&self) -> bool {
        self.active.lock().is_some()
    }

    pub fn stats(&self) -> SessionStats {
        self.counters.snapshot()
    }

    /// Opens the trace session and begins delivering events to the sink on a
    /// dedicated thread. Starting an already running session is a no-op.
    #[cfg(windows)]
    pub fn start(&self) -> Result<()> {
        let mut active = self.active.lock();
        if active.is_some() {
            return Ok(());
        }
        if self.providers.is_empty() {
            return Err(MonitorError::config("no trace providers enabled"));
        }
        let session = EtwSession::start(
            &self.name,
            &self.providers,
            Arc::clone(&self.sink),
            Arc::clone(&self.counters),
        )?;
        *active = Some(session);
        Ok(())
    }

    #[cfg(not(windows))]
    pub fn start(&self) -> Result<()> {
        let _ = (&self.name, &self.sink);
        Err(MonitorError::Unsupported {
            operation: "real-time trace session",
        })
    }

    /// Tears the session down and waits for the delivery thread to exit.
    pub fn stop(&self) -> Result<()> {
        let Some(session) = self.active.lock().take() else {
            return Ok(());
        };
        #[cfg(windows)]
        {
            let stats = self.counters.snapshot();
            log::info!(
                "Trace session '{}' stopping: {} records, {} decoded, {} undecoded",
                self.name,
                stats.records,
                stats.decoded,
                stats.undecoded
            );
            session.stop()
        }
        #[cfg(not(windows))]
        {
            let () = session;
            Ok(())
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("Trace session did not stop cleanly: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NetworkEvent;

    struct NullSink;

    impl EventSink for NullSink {
        fn submit(&self, _event: NetworkEvent) {}
    }

    #[test]
    fn session_uses_enabled_providers() {
        let mut config = CaptureConfig::default();
        config.providers.http = false;
        let session = CaptureSession::new(&config, Arc::new(NullSink));
        assert!(!session.providers().contains(&Provider::HttpService));
        assert!(session.providers().contains(&Provider::KernelNetwork));
        assert!(!session.is_running());
        assert!(!session.providers().contains(&Provider::WinsockAfd));
    }

    #[test]
    fn stopping_an_idle_session_is_a_no_op() {
        let session = CaptureSession::new(&CaptureConfig::default(), Arc::new(NullSink));
        assert!(session.stop().is_ok());
        assert_eq!(session.stats(), SessionStats::default());
    }

    #[cfg(not(windows))]
    #[test]
    fn start_is_unsupported_off_windows() {
        let session = CaptureSession::new(&CaptureConfig::default(), Arc::new(NullSink));
        assert!(matches!(session.start(), Err(MonitorError::Unsupported { .. })));
        assert!(!session.is_running());
    }
}
