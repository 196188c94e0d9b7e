//! Real-time ETW session over the manifest network providers.
//!
//! The OS calls back into a plain `extern "system"` function, so the active
//! sink lives in a process-wide slot. Only one session can be active at a time.

use super::parser::{self, RawRecord};
use super::providers::Provider;
use super::session::SessionCounters;
use super::EventSink;
use crate::error::{MonitorError, Result};
use crate::platform::process::PROCESS_NAMES;
use parking_lot::RwLock;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use widestring::U16CString;

use windows::core::{GUID, PCWSTR, PWSTR};
use windows::Win32::{
    Foundation::{ERROR_ACCESS_DENIED, ERROR_SUCCESS},
    System::Diagnostics::Etw::*,
};

const WNODE_FLAG_TRACED_GUID: u32 = 0x0002_0000;
const EVENT_HEADER_FLAG_32_BIT_HEADER: u16 = 0x0020;
/// Record timestamps as FILETIME.
const CLIENT_CONTEXT_SYSTEM_TIME: u32 = 2;
const PROPERTIES_SLACK: usize = 1024;

struct CallbackContext {
    sink: Arc<dyn EventSink>,
    counters: Arc<SessionCounters>,
}

lazy_static::lazy_static! {
    static ref ACTIVE: RwLock<Option<CallbackContext>> = RwLock::new(None);
}

pub struct EtwSession {
    name: U16CString,
    properties: Vec<u8>,
    session_handle: CONTROLTRACE_HANDLE,
    trace_handle: PROCESSTRACE_HANDLE,
    pump: Option<JoinHandle<()>>,
}

fn properties_buffer(name: &U16CString) -> Vec<u8> {
    let header = std::mem::size_of::<EVENT_TRACE_PROPERTIES>();
    let mut buffer = vec![0u8; header + (name.len() + 1) * 2 + PROPERTIES_SLACK];
    let props = buffer.as_mut_ptr() as *mut EVENT_TRACE_PROPERTIES;
    unsafe {
        (*props).Wnode.BufferSize = buffer.len() as u32;
        (*props).Wnode.Flags = WNODE_FLAG_TRACED_GUID;
        (*props).Wnode.ClientContext = CLIENT_CONTEXT_SYSTEM_TIME;
        (*props).LogFileMode = EVENT_TRACE_REAL_TIME_MODE;
        (*props).LoggerNameOffset = header as u32;
    }
    buffer
}

/// A session left behind by a crashed run keeps the name reserved.
fn stop_stale_session(name: &U16CString) {
    let mut buffer = properties_buffer(name);
    let status = unsafe {
        ControlTraceW(
            CONTROLTRACE_HANDLE::default(),
            PCWSTR(name.as_ptr()),
            buffer.as_mut_ptr() as *mut EVENT_TRACE_PROPERTIES,
            EVENT_TRACE_CONTROL_STOP,
        )
    };
    if status == ERROR_SUCCESS {
        log::info!("Stopped stale trace session '{}'", name.to_string_lossy());
    }
}

impl EtwSession {
    pub fn start(
        session_name: &str,
        providers: &[Provider],
        sink: Arc<dyn EventSink>,
        counters: Arc<SessionCounters>,
    ) -> Result<Self> {
        let name = U16CString::from_str(session_name)
            .map_err(|_| MonitorError::config("trace session name contains a NUL character"))?;

        stop_stale_session(&name);

        let mut properties = properties_buffer(&name);
        let mut session_handle = CONTROLTRACE_HANDLE::default();
        let status = unsafe {
            StartTraceW(
                &mut session_handle,
                PCWSTR(name.as_ptr()),
                properties.as_mut_ptr() as *mut EVENT_TRACE_PROPERTIES,
            )
        };
        if status == ERROR_ACCESS_DENIED {
            return Err(MonitorError::PrivilegeRequired {
                operation: "trace session",
            });
        }
        if status != ERROR_SUCCESS {
            return Err(MonitorError::Session {
                message: format!("StartTraceW failed for '{}'", session_name),
                code: status.0,
            });
        }
        log::info!("Trace session '{}' started", session_name);

        let mut enabled = 0usize;
        for provider in providers {
            let guid = GUID::from_u128(provider.guid_u128());
            let status = unsafe {
                EnableTraceEx2(
                    session_handle,
                    &guid,
                    EVENT_CONTROL_CODE_ENABLE_PROVIDER.0 as u32,
                    provider.level(),
                    provider.keywords(),
                    0,
                    0,
                    None,
                )
            };
            if status == ERROR_SUCCESS {
                enabled += 1;
                log::debug!("Enabled provider {}", provider.name());
            } else {
                log::warn!("EnableTraceEx2 failed for {}: 0x{:08X}", provider.name(), status.0);
            }
        }
        log::info!("{}/{} trace providers enabled", enabled, providers.len());

        *ACTIVE.write() = Some(CallbackContext { sink, counters });

        let mut logfile: EVENT_TRACE_LOGFILEW = unsafe { std::mem::zeroed() };
        logfile.LoggerName = PWSTR(name.as_ptr() as *mut u16);
        logfile.Anonymous1.ProcessTraceMode =
            PROCESS_TRACE_MODE_REAL_TIME | PROCESS_TRACE_MODE_EVENT_RECORD;
        logfile.Anonymous2.EventRecordCallback = Some(on_event_record);

        let trace_handle = unsafe { OpenTraceW(&mut logfile) };
        if trace_handle.Value == u64::MAX {
            *ACTIVE.write() = None;
            let _ = unsafe {
                ControlTraceW(
                    session_handle,
                    PCWSTR(name.as_ptr()),
                    properties.as_mut_ptr() as *mut EVENT_TRACE_PROPERTIES,
                    EVENT_TRACE_CONTROL_STOP,
                )
            };
            return Err(MonitorError::Session {
                message: "OpenTraceW returned an invalid handle".to_string(),
                code: 0,
            });
        }

        let pump_handle = trace_handle;
        let pump = std::thread::Builder::new()
            .name("etw-pump".to_string())
            .spawn(move || {
                let status = unsafe { ProcessTrace(&[pump_handle], None, None) };
                if status != ERROR_SUCCESS {
                    log::warn!("ProcessTrace returned 0x{:08X}", status.0);
                }
                log::debug!("Trace pump exited");
            });

        let mut session = Self {
            name,
            properties,
            session_handle,
            trace_handle,
            pump: None,
        };
        match pump {
            Ok(handle) => {
                session.pump = Some(handle);
                Ok(session)
            }
            Err(e) => {
                let _ = session.stop();
                Err(MonitorError::Session {
                    message: format!("could not spawn trace pump: {}", e),
                    code: 0,
                })
            }
        }
    }

    pub fn stop(mut self) -> Result<()> {
        let _ = unsafe { CloseTrace(self.trace_handle) };
        let status = unsafe {
            ControlTraceW(
                self.session_handle,
                PCWSTR(self.name.as_ptr()),
                self.properties.as_mut_ptr() as *mut EVENT_TRACE_PROPERTIES,
                EVENT_TRACE_CONTROL_STOP,
            )
        };

        if let Some(pump) = self.pump.take() {
            if pump.join().is_err() {
                log::error!("Trace pump thread panicked");
            }
        }
        *ACTIVE.write() = None;

        if status != ERROR_SUCCESS {
            return Err(MonitorError::Session {
                message: format!("ControlTraceW stop failed for '{}'", self.name.to_string_lossy()),
                code: status.0,
            });
        }
        log::info!("Trace session '{}' stopped", self.name.to_string_lossy());
        Ok(())
    }
}

unsafe extern "system" fn on_event_record(record: *mut EVENT_RECORD) {
    if record.is_null() {
        return;
    }
    let rec = unsafe { &*record };

    let guard = ACTIVE.read();
    let Some(ctx) = guard.as_ref() else {
        return;
    };
    ctx.counters.records.fetch_add(1, Ordering::Relaxed);

    let header = &rec.EventHeader;
    let Some(provider) = Provider::from_guid_u128(header.ProviderId.to_u128()) else {
        ctx.counters.undecoded.fetch_add(1, Ordering::Relaxed);
        return;
    };

    let data: &[u8] = if rec.UserData.is_null() || rec.UserDataLength == 0 {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(rec.UserData as *const u8, rec.UserDataLength as usize) }
    };

    let raw = RawRecord {
        provider,
        event_id: header.EventDescriptor.Id,
        pid: header.ProcessId,
        thread_id: header.ThreadId,
        timestamp: parser::filetime_to_datetime(header.TimeStamp),
        pointer_size: if header.Flags & EVENT_HEADER_FLAG_32_BIT_HEADER != 0 { 4 } else { 8 },
        data,
    };

    match parser::decode(&raw) {
        Some(decoded) => {
            // Unknown pids carry a placeholder until the metadata resolver runs.
            let name = PROCESS_NAMES.name_or_placeholder(decoded.pid);
            ctx.counters.decoded.fetch_add(1, Ordering::Relaxed);
            ctx.sink.submit(decoded.into_event(&raw, name));
        }
        None => {
            ctx.counters.undecoded.fetch_add(1, Ordering::Relaxed);
        }
    }
}
