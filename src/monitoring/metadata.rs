//! Background resolution of program metadata for newly seen processes.

use crate::platform::process::{ProcessMetadataSource, ProcessNameCache};
use crate::state::GlobalNetworkMonitor;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub const REQUEST_QUEUE_CAPACITY: usize = 1024;

pub fn request_channel() -> (Sender<u32>, Receiver<u32>) {
    crossbeam_channel::bounded(REQUEST_QUEUE_CAPACITY)
}

pub struct MetadataResolver {
    source: Arc<dyn ProcessMetadataSource>,
    monitor: Arc<GlobalNetworkMonitor>,
    names: Option<Arc<ProcessNameCache>>,
}

impl MetadataResolver {
    pub fn new(source: Arc<dyn ProcessMetadataSource>, monitor: Arc<GlobalNetworkMonitor>) -> Self {
        Self {
            source,
            monitor,
            names: None,
        }
    }

    /// Resolved names are also published to `names` for the capture path.
    pub fn with_name_cache(mut self, names: Arc<ProcessNameCache>) -> Self {
        self.names = Some(names);
        self
    }

    /// Looks the pid up unless the monitor already holds its metadata. A pid
    /// whose application record was swept is looked up again. Returns true
    /// when the monitor was updated.
    pub fn resolve(&self, pid: u32) -> bool {
        if self.monitor.has_application(pid) {
            return false;
        }
        match self.source.program_info(pid) {
            Some(info) => {
                log::debug!("Resolved PID {} to {}", pid, info.name);
                if let Some(names) = &self.names {
                    names.insert(pid, info.name.clone());
                }
                self.monitor.update_application(pid, info);
                true
            }
            None => {
                log::trace!("No program metadata for PID {}", pid);
                false
            }
        }
    }

    /// Serves requests until `running` is cleared or every sender is gone.
    pub fn start(self, requests: Receiver<u32>, running: Arc<AtomicBool>) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("metadata-resolver".to_string())
            .spawn(move || {
                log::debug!("Metadata resolver started");
                while running.load(Ordering::Relaxed) {
                    match requests.recv_timeout(Duration::from_millis(200)) {
                        Ok(pid) => {
                            self.resolve(pid);
                        }
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                log::debug!("Metadata resolver stopped");
            })
    }
}
