//! Token inspection and privilege adjustment, plus the capability summary the
//! monitor uses to pick between detailed and synthesized statistics.

use serde::Serialize;

/// What the current process is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub elevated: bool,
    pub privileges_enabled: bool,
    /// Per-connection kernel counters can be read and switched on.
    pub detailed_stats: bool,
    /// A real-time trace session can be started.
    pub tracing: bool,
}

impl Capabilities {
    pub fn from_flags(elevated: bool, privileges_enabled: bool, detailed_requested: bool) -> Self {
        Self {
            elevated,
            privileges_enabled,
            detailed_stats: elevated && detailed_requested,
            tracing: elevated,
        }
    }

    pub fn log_summary(&self) {
        log::info!(
            "Capabilities: elevated={} privileges={} detailed_stats={} tracing={}",
            self.elevated,
            self.privileges_enabled,
            self.detailed_stats,
            self.tracing
        );
        if !self.elevated {
            log::warn!("Not running elevated: live tracing and per-connection counters are unavailable");
            log::warn!("Rates will be estimated from connection presence only");
        }
    }
}

pub fn detect_capabilities(detailed_requested: bool) -> Capabilities {
    let elevated = is_elevated();
    let privileges_enabled = elevated && enable_required_privileges();
    Capabilities::from_flags(elevated, privileges_enabled, detailed_requested)
}

#[cfg(windows)]
pub use self::native::{enable_required_privileges, is_elevated};

#[cfg(not(windows))]
pub fn is_elevated() -> bool {
    false
}

#[cfg(not(windows))]
pub fn enable_required_privileges() -> bool {
    false
}

#[cfg(windows)]
mod native {
    use std::ffi::c_void;
    use windows::{
        core::{w, PCWSTR},
        Win32::{
            Foundation::{CloseHandle, HANDLE},
            Security::{
                AdjustTokenPrivileges, GetTokenInformation, LookupPrivilegeValueW, TokenElevation,
                LUID_AND_ATTRIBUTES, SE_PRIVILEGE_ENABLED, TOKEN_ADJUST_PRIVILEGES, TOKEN_ELEVATION,
                TOKEN_PRIVILEGES, TOKEN_QUERY,
            },
            System::Threading::{GetCurrentProcess, OpenProcessToken},
        },
    };

    pub fn is_elevated() -> bool {
        let mut token = HANDLE::default();
        if unsafe { OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) }.is_err() {
            return false;
        }

        let mut elevation = TOKEN_ELEVATION::default();
        let mut returned = 0u32;
        let ok = unsafe {
            GetTokenInformation(
                token,
                TokenElevation,
                Some(&mut elevation as *mut TOKEN_ELEVATION as *mut c_void),
                std::mem::size_of::<TOKEN_ELEVATION>() as u32,
                &mut returned,
            )
        }
        .is_ok();
        let _ = unsafe { CloseHandle(token) };

        ok && elevation.TokenIsElevated != 0
    }

    /// Debug privilege is needed to name processes of other users, system
    /// profile privilege to start kernel-level traces.
    pub fn enable_required_privileges() -> bool {
        let debug = unsafe { enable_privilege(w!("SeDebugPrivilege")) };
        let profile = unsafe { enable_privilege(w!("SeSystemProfilePrivilege")) };
        if !debug {
            log::debug!("SeDebugPrivilege could not be enabled");
        }
        debug && profile
    }

    unsafe fn enable_privilege(privilege_name: PCWSTR) -> bool {
        let mut token_handle = HANDLE::default();

        if unsafe {
            OpenProcessToken(
                GetCurrentProcess(),
                TOKEN_ADJUST_PRIVILEGES | TOKEN_QUERY,
                &mut token_handle,
            )
        }
        .is_err()
        {
            return false;
        }

        let mut luid = unsafe { std::mem::zeroed() };
        if unsafe { LookupPrivilegeValueW(PCWSTR::null(), privilege_name, &mut luid) }.is_err() {
            let _ = unsafe { CloseHandle(token_handle) };
            return false;
        }

        let tp = TOKEN_PRIVILEGES {
            PrivilegeCount: 1,
            Privileges: [LUID_AND_ATTRIBUTES {
                Luid: luid,
                Attributes: SE_PRIVILEGE_ENABLED,
            }],
        };

        let adjusted =
            unsafe { AdjustTokenPrivileges(token_handle, false, Some(&tp), 0, None, None) }.is_ok();
        let _ = unsafe { CloseHandle(token_handle) };
        adjusted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detailed_stats_need_elevation_and_request() {
        assert!(Capabilities::from_flags(true, true, true).detailed_stats);
        assert!(!Capabilities::from_flags(true, true, false).detailed_stats);
        assert!(!Capabilities::from_flags(false, false, true).detailed_stats);
    }

    #[test]
    fn tracing_follows_elevation() {
        assert!(Capabilities::from_flags(true, false, false).tracing);
        assert!(!Capabilities::from_flags(false, false, true).tracing);
    }
}
