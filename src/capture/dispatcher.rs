//! Explicit observer registration and synchronous fan-out.
//!
//! Callbacks run on the thread that delivers the event (the trace pump or the
//! batch drain). They must not block: anything slow belongs on a channel.

use super::EventSink;
use crate::error::{MonitorError, Result};
use crate::events::{EventCategory, NetworkEvent};
use parking_lot::RwLock;
use regex::RegexSet;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type EventCallback = Arc<dyn Fn(&NetworkEvent) + Send + Sync>;
pub type BatchCallback = Arc<dyn Fn(&[NetworkEvent]) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// Drops events from processes whose lowercase name matches any pattern.
#[derive(Debug, Clone)]
pub struct ProcessFilter {
    patterns: RegexSet,
}

impl ProcessFilter {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let patterns = RegexSet::new(patterns)
            .map_err(|e| MonitorError::config(format!("excluded process patterns: {}", e)))?;
        Ok(Self { patterns })
    }

    pub fn is_excluded(&self, process_name: &str) -> bool {
        !self.patterns.is_empty() && self.patterns.is_match(&process_name.to_lowercase())
    }
}

type Registry<C> = RwLock<Arc<Vec<(CallbackId, C)>>>;

#[derive(Default)]
pub struct DispatchCounters {
    pub dispatched: AtomicU64,
    pub filtered: AtomicU64,
    pub callback_panics: AtomicU64,
}

pub struct EventDispatcher {
    by_category: RwLock<HashMap<EventCategory, Arc<Vec<(CallbackId, EventCallback)>>>>,
    catch_all: Registry<EventCallback>,
    next_id: AtomicU64,
    filter: Option<ProcessFilter>,
    counters: DispatchCounters,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            by_category: RwLock::new(HashMap::new()),
            catch_all: RwLock::new(Arc::new(Vec::new())),
            next_id: AtomicU64::new(1),
            filter: None,
            counters: DispatchCounters::default(),
        }
    }

    pub fn with_filter(mut self, filter: ProcessFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub(crate) fn allocate_id(&self) -> CallbackId {
        CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn on<F>(&self, category: EventCategory, callback: F) -> CallbackId
    where
        F: Fn(&NetworkEvent) + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        let mut map = self.by_category.write();
        let entry = map.entry(category).or_insert_with(|| Arc::new(Vec::new()));
        let mut callbacks = entry.as_ref().clone();
        callbacks.push((id, Arc::new(callback)));
        *entry = Arc::new(callbacks);
        id
    }

    pub fn on_tcp<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&NetworkEvent) + Send + Sync + 'static,
    {
        self.on(EventCategory::Tcp, callback)
    }

    pub fn on_udp<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&NetworkEvent) + Send + Sync + 'static,
    {
        self.on(EventCategory::Udp, callback)
    }

    pub fn on_dns<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&NetworkEvent) + Send + Sync + 'static,
    {
        self.on(EventCategory::Dns, callback)
    }

    pub fn on_http<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&NetworkEvent) + Send + Sync + 'static,
    {
        self.on(EventCategory::Http, callback)
    }

    pub fn on_interface<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&NetworkEvent) + Send + Sync + 'static,
    {
        self.on(EventCategory::Interface, callback)
    }

    /// Receives every dispatched event regardless of category.
    pub fn on_any<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&NetworkEvent) + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        let mut registry = self.catch_all.write();
        let mut callbacks = registry.as_ref().clone();
        callbacks.push((id, Arc::new(callback)));
        *registry = Arc::new(callbacks);
        id
    }

    pub fn unregister(&self, id: CallbackId) -> bool {
        let mut removed = false;
        {
            let mut map = self.by_category.write();
            for entry in map.values_mut() {
                if entry.iter().any(|(cid, _)| *cid == id) {
                    let kept: Vec<_> = entry.iter().filter(|(cid, _)| *cid != id).cloned().collect();
                    *entry = Arc::new(kept);
                    removed = true;
                }
            }
        }
        let mut registry = self.catch_all.write();
        if registry.iter().any(|(cid, _)| *cid == id) {
            let kept: Vec<_> = registry.iter().filter(|(cid, _)| *cid != id).cloned().collect();
            *registry = Arc::new(kept);
            removed = true;
        }
        removed
    }

    pub fn is_excluded(&self, event: &NetworkEvent) -> bool {
        self.filter
            .as_ref()
            .is_some_and(|f| f.is_excluded(&event.process_name))
    }

    pub fn note_filtered(&self) {
        self.counters.filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counters(&self) -> &DispatchCounters {
        &self.counters
    }

    /// Hands the event to every category callback and every catch-all callback.
    /// A panicking callback is logged and does not affect the others.
    pub fn dispatch(&self, event: &NetworkEvent) {
        if self.is_excluded(event) {
            self.note_filtered();
            return;
        }

        let category = self.by_category.read().get(&event.category()).cloned();
        let catch_all = self.catch_all.read().clone();

        if let Some(callbacks) = category {
            for (_, callback) in callbacks.iter() {
                self.invoke(callback, event);
            }
        }
        for (_, callback) in catch_all.iter() {
            self.invoke(callback, event);
        }
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    fn invoke(&self, callback: &EventCallback, event: &NetworkEvent) {
        if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
            self.counters.callback_panics.fetch_add(1, Ordering::Relaxed);
            log::error!(
                "Event callback panicked for {:?} event from PID {}",
                event.category(),
                event.pid
            );
        }
    }

    pub fn callback_count(&self) -> usize {
        let categorized: usize = self.by_category.read().values().map(|v| v.len()).sum();
        categorized + self.catch_all.read().len()
    }
}

impl EventSink for EventDispatcher {
    fn submit(&self, event: NetworkEvent) {
        self.dispatch(&event);
    }
}
