//! Process name and program metadata lookup.
//!
//! Opening a process handle is slow relative to event delivery, so names are
//! cached with a short lifetime (pids get reused) and full program metadata is
//! only ever resolved off the hot path.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const NAME_CACHE_TTL: Duration = Duration::from_secs(60);

lazy_static::lazy_static! {
    /// Names filled in by the metadata resolver and read by the capture
    /// callback, which must never open process handles itself.
    pub static ref PROCESS_NAMES: Arc<ProcessNameCache> = Arc::new(ProcessNameCache::default());
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramInfo {
    pub name: String,
    pub path: Option<String>,
    pub product_name: Option<String>,
    pub company: Option<String>,
    pub version: Option<String>,
    /// Base64-encoded icon, when a source provides one.
    pub icon: Option<String>,
}

pub trait ProcessMetadataSource: Send + Sync {
    fn program_info(&self, pid: u32) -> Option<ProgramInfo>;
}

pub fn well_known_name(pid: u32) -> Option<&'static str> {
    match pid {
        0 => Some("Idle"),
        4 => Some("System"),
        _ => None,
    }
}

pub fn fallback_name(pid: u32) -> String {
    format!("PID:{}", pid)
}

fn file_name(path: &str) -> Option<String> {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .map(|s| s.to_string())
}

/// Looks processes up through the process handle APIs. Only the executable
/// name and path are filled in.
#[derive(Debug, Default, Clone)]
pub struct SystemProcessSource;

impl ProcessMetadataSource for SystemProcessSource {
    fn program_info(&self, pid: u32) -> Option<ProgramInfo> {
        if let Some(name) = well_known_name(pid) {
            return Some(ProgramInfo {
                name: name.to_string(),
                ..Default::default()
            });
        }
        let path = native::image_path(pid)?;
        Some(ProgramInfo {
            name: file_name(&path).unwrap_or_else(|| fallback_name(pid)),
            path: Some(path),
            ..Default::default()
        })
    }
}

/// Pid to name cache with per-entry expiry.
pub struct ProcessNameCache {
    entries: Mutex<HashMap<u32, (String, Instant)>>,
    ttl: Duration,
}

impl Default for ProcessNameCache {
    fn default() -> Self {
        Self::new(NAME_CACHE_TTL)
    }
}

impl ProcessNameCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Fresh cached name only. Never resolves.
    pub fn cached(&self, pid: u32) -> Option<String> {
        let now = Instant::now();
        self.entries
            .lock()
            .get(&pid)
            .filter(|(_, at)| now.duration_since(*at) < self.ttl)
            .map(|(name, _)| name.clone())
    }

    /// Name for the event hot path: the cached name, the well-known name, or
    /// the `PID:<n>` placeholder that the metadata resolver replaces later.
    pub fn name_or_placeholder(&self, pid: u32) -> String {
        self.cached(pid)
            .or_else(|| well_known_name(pid).map(str::to_string))
            .unwrap_or_else(|| fallback_name(pid))
    }

    pub fn insert(&self, pid: u32, name: impl Into<String>) {
        self.entries.lock().insert(pid, (name.into(), Instant::now()));
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, (_, at)| now.duration_since(*at) < self.ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(windows)]
mod native {
    use windows::Win32::{
        Foundation::CloseHandle,
        System::ProcessStatus::GetModuleFileNameExW,
        System::Threading::{OpenProcess, PROCESS_QUERY_INFORMATION, PROCESS_VM_READ},
    };

    pub fn image_path(pid: u32) -> Option<String> {
        let handle = unsafe { OpenProcess(PROCESS_QUERY_INFORMATION | PROCESS_VM_READ, false, pid) }.ok()?;
        let mut buffer = [0u16; 260];
        let len = unsafe { GetModuleFileNameExW(Some(handle), None, &mut buffer) };
        let _ = unsafe { CloseHandle(handle) };
        if len == 0 {
            return None;
        }
        Some(String::from_utf16_lossy(&buffer[..len as usize]))
    }
}

#[cfg(not(windows))]
mod native {
    pub fn image_path(_pid: u32) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_entries_are_purged() {
        let cache = ProcessNameCache::new(Duration::ZERO);
        cache.insert(1, "old.exe");
        assert_eq!(cache.cached(1), None);
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn hot_path_lookup_never_resolves() {
        let cache = ProcessNameCache::new(Duration::from_secs(60));
        assert_eq!(cache.name_or_placeholder(5150), "PID:5150");
        assert_eq!(cache.name_or_placeholder(4), "System");
        assert!(cache.is_empty());

        cache.insert(5150, "svc.exe");
        assert_eq!(cache.name_or_placeholder(5150), "svc.exe");

        let expired = ProcessNameCache::new(Duration::ZERO);
        expired.insert(5150, "svc.exe");
        assert_eq!(expired.cached(5150), None);
    }

    #[test]
    fn well_known_pids_resolve_without_handles() {
        let source = SystemProcessSource;
        assert_eq!(source.program_info(4).map(|p| p.name), Some("System".to_string()));
        assert_eq!(source.program_info(0).map(|p| p.name), Some("Idle".to_string()));
    }

    #[test]
    fn file_name_strips_directories() {
        assert_eq!(file_name("C:/Program Files/app/app.exe").as_deref(), Some("app.exe"));
    }
}
