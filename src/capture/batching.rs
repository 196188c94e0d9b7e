//! Burst-tolerant capture: events are parked in bounded queues by the trace
//! thread and drained on a fixed tick.
//!
//! The trace thread never blocks here. When a queue is full the oldest entry is
//! evicted and counted, which is the observable trace of kernel-side overload.

use super::dispatcher::{BatchCallback, CallbackId, EventDispatcher};
use super::EventSink;
use crate::config::CaptureConfig;
use crate::events::{EventCategory, NetworkEvent};
use crate::utils::scheduler;
use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Fixed-capacity FIFO that evicts its oldest entry instead of rejecting a push.
pub struct BoundedQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    capacity: usize,
    dropped: AtomicU64,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Returns how many entries were evicted to make room.
    pub fn push(&self, item: T) -> u64 {
        let mut item = item;
        let mut evicted = 0;
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return evicted,
                Err(TrySendError::Full(back)) => {
                    item = back;
                    if self.rx.try_recv().is_ok() {
                        evicted += 1;
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                // Both ends live in self.
                Err(TrySendError::Disconnected(_)) => return evicted,
            }
        }
    }

    pub fn pop(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(item) => Some(item),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn pop_batch(&self, max: usize) -> Vec<T> {
        let mut batch = Vec::with_capacity(max.min(self.len()));
        while batch.len() < max {
            match self.pop() {
                Some(item) => batch.push(item),
                None => break,
            }
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CaptureStats {
    pub events_received: u64,
    pub events_processed: u64,
    pub events_dropped: u64,
    pub events_filtered: u64,
    pub batches_delivered: u64,
    pub queue_depth: usize,
    pub tcp_queue_depth: usize,
    pub udp_queue_depth: usize,
    pub other_queue_depth: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub processed: usize,
    pub cancelled: bool,
}

pub struct BatchingDispatcher {
    dispatcher: Arc<EventDispatcher>,
    tcp: BoundedQueue<NetworkEvent>,
    udp: BoundedQueue<NetworkEvent>,
    other: BoundedQueue<NetworkEvent>,
    batch_callbacks: RwLock<Arc<Vec<(CallbackId, BatchCallback)>>>,
    received: AtomicU64,
    processed: AtomicU64,
    batches: AtomicU64,
    cancelled: AtomicBool,
}

impl BatchingDispatcher {
    pub fn new(dispatcher: Arc<EventDispatcher>, config: &CaptureConfig) -> Self {
        Self::with_capacities(
            dispatcher,
            config.tcp_queue_capacity,
            config.udp_queue_capacity,
            config.other_queue_capacity,
        )
    }

    pub fn with_capacities(
        dispatcher: Arc<EventDispatcher>,
        tcp_capacity: usize,
        udp_capacity: usize,
        other_capacity: usize,
    ) -> Self {
        Self {
            dispatcher,
            tcp: BoundedQueue::new(tcp_capacity),
            udp: BoundedQueue::new(udp_capacity),
            other: BoundedQueue::new(other_capacity),
            batch_callbacks: RwLock::new(Arc::new(Vec::new())),
            received: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    /// Registers a callback that receives each drained slice as a whole.
    pub fn on_batch<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&[NetworkEvent]) + Send + Sync + 'static,
    {
        let id = self.dispatcher.allocate_id();
        let mut registry = self.batch_callbacks.write();
        let mut callbacks = registry.as_ref().clone();
        callbacks.push((id, Arc::new(callback)));
        *registry = Arc::new(callbacks);
        id
    }

    fn queue_for(&self, category: EventCategory) -> &BoundedQueue<NetworkEvent> {
        match category {
            EventCategory::Tcp => &self.tcp,
            EventCategory::Udp => &self.udp,
            _ => &self.other,
        }
    }

    pub fn enqueue(&self, event: NetworkEvent) {
        self.received.fetch_add(1, Ordering::Relaxed);
        if self.dispatcher.is_excluded(&event) {
            self.dispatcher.note_filtered();
            return;
        }
        self.queue_for(event.category()).push(event);
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Drains at most one capacity-sized slice from each queue. Cancellation is
    /// checked before every dequeue; a slice already taken is always delivered.
    pub fn drain_once(&self) -> DrainReport {
        let mut report = DrainReport::default();
        for queue in [&self.tcp, &self.udp, &self.other] {
            if self.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let batch = queue.pop_batch(queue.capacity());
            if batch.is_empty() {
                continue;
            }
            self.deliver(&batch);
            report.processed += batch.len();
        }
        report
    }

    fn deliver(&self, batch: &[NetworkEvent]) {
        for event in batch {
            self.dispatcher.dispatch(event);
        }

        let callbacks = self.batch_callbacks.read().clone();
        for (_, callback) in callbacks.iter() {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(batch))).is_err() {
                log::error!("Batch callback panicked on a batch of {} events", batch.len());
            }
        }

        self.processed.fetch_add(batch.len() as u64, Ordering::Relaxed);
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CaptureStats {
        let tcp_queue_depth = self.tcp.len();
        let udp_queue_depth = self.udp.len();
        let other_queue_depth = self.other.len();
        CaptureStats {
            events_received: self.received.load(Ordering::Relaxed),
            events_processed: self.processed.load(Ordering::Relaxed),
            events_dropped: self.tcp.dropped() + self.udp.dropped() + self.other.dropped(),
            events_filtered: self.dispatcher.counters().filtered.load(Ordering::Relaxed),
            batches_delivered: self.batches.load(Ordering::Relaxed),
            queue_depth: tcp_queue_depth + udp_queue_depth + other_queue_depth,
            tcp_queue_depth,
            udp_queue_depth,
            other_queue_depth,
        }
    }

    pub fn log_stats(&self) {
        let stats = self.stats();
        log::info!(
            "Capture: received={} processed={} dropped={} filtered={} queued={} (tcp={} udp={} other={})",
            stats.events_received,
            stats.events_processed,
            stats.events_dropped,
            stats.events_filtered,
            stats.queue_depth,
            stats.tcp_queue_depth,
            stats.udp_queue_depth,
            stats.other_queue_depth,
        );
        if stats.events_dropped > 0 {
            log::warn!(
                "Capture queues overflowed: {} events dropped since start",
                stats.events_dropped
            );
        }
    }

    /// Runs the drain tick while `running` stays set, logging counters every
    /// `stats_interval`.
    pub fn start_drain_loop(
        self: &Arc<Self>,
        interval: Duration,
        stats_interval: Duration,
        running: Arc<AtomicBool>,
    ) -> std::io::Result<JoinHandle<()>> {
        let this = Arc::clone(self);
        let mut last_stats = Instant::now();
        scheduler::spawn_periodic("capture-drain", interval, running, move || {
            this.drain_once();
            if last_stats.elapsed() >= stats_interval {
                this.log_stats();
                last_stats = Instant::now();
            }
        })
    }
}

impl EventSink for BatchingDispatcher {
    fn submit(&self, event: NetworkEvent) {
        self.enqueue(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Direction, EventKind, UdpAction, UdpEvent};
    use chrono::Utc;
    use parking_lot::Mutex;

    fn udp_event(length: u32) -> NetworkEvent {
        NetworkEvent::new(
            Utc::now(),
            7,
            1,
            "app.exe",
            EventKind::Udp(UdpEvent {
                source: "10.0.0.1:5000".parse().unwrap(),
                destination: "10.0.0.2:53".parse().unwrap(),
                length,
                direction: Direction::Outbound,
                action: UdpAction::Send,
            }),
        )
    }

    #[test]
    fn queue_overflow_drops_oldest_and_counts_exactly() {
        let queue = BoundedQueue::new(3);
        let mut evicted = 0;
        for i in 0..8 {
            evicted += queue.push(i);
        }
        assert_eq!(evicted, 5);
        assert_eq!(queue.dropped(), 5);
        assert_eq!(queue.pop_batch(10), vec![5, 6, 7]);
    }

    #[test]
    fn pop_batch_respects_limit() {
        let queue = BoundedQueue::new(10);
        for i in 0..6 {
            queue.push(i);
        }
        assert_eq!(queue.pop_batch(4), vec![0, 1, 2, 3]);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn drain_delivers_per_event_and_batch_callbacks() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let per_event = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&per_event);
        dispatcher.on_udp(move |_| {
            c.fetch_add(1, Ordering::Relaxed);
        });

        let batching = BatchingDispatcher::with_capacities(Arc::clone(&dispatcher), 10, 10, 10);
        let batch_sizes = Arc::new(Mutex::new(Vec::new()));
        let b = Arc::clone(&batch_sizes);
        batching.on_batch(move |batch| b.lock().push(batch.len()));

        for len in [10, 20, 30] {
            batching.submit(udp_event(len));
        }
        let report = batching.drain_once();

        assert_eq!(report.processed, 3);
        assert_eq!(per_event.load(Ordering::Relaxed), 3);
        assert_eq!(*batch_sizes.lock(), vec![3]);
        let stats = batching.stats();
        assert_eq!(stats.events_received, 3);
        assert_eq!(stats.events_processed, 3);
        assert_eq!(stats.queue_depth, 0);
        assert_eq!(stats.batches_delivered, 1);
    }

    #[test]
    fn overflow_in_dispatcher_is_reported_in_stats() {
        let batching = BatchingDispatcher::with_capacities(Arc::new(EventDispatcher::new()), 4, 4, 4);
        for _ in 0..10 {
            batching.submit(udp_event(1));
        }
        let stats = batching.stats();
        assert_eq!(stats.events_received, 10);
        assert_eq!(stats.events_dropped, 6);
        assert_eq!(stats.udp_queue_depth, 4);
    }

    #[test]
    fn cancelled_drain_dequeues_nothing() {
        let batching = BatchingDispatcher::with_capacities(Arc::new(EventDispatcher::new()), 4, 4, 4);
        batching.submit(udp_event(1));
        batching.cancel();
        let report = batching.drain_once();
        assert!(report.cancelled);
        assert_eq!(report.processed, 0);
        assert_eq!(batching.stats().queue_depth, 1);
    }

    #[test]
    fn drain_takes_at_most_capacity_per_tick() {
        let batching = BatchingDispatcher::with_capacities(Arc::new(EventDispatcher::new()), 4, 2, 4);
        for _ in 0..2 {
            batching.submit(udp_event(1));
        }
        assert_eq!(batching.drain_once().processed, 2);
        assert_eq!(batching.drain_once().processed, 0);
    }
}
