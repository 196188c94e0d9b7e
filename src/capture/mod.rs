//! Event capture: trace session, payload decoding and delivery to observers.

pub mod batching;
pub mod dispatcher;
#[cfg(windows)]
mod etw;
pub mod parser;
pub mod providers;
pub mod session;

use crate::events::NetworkEvent;

pub use batching::{BatchingDispatcher, BoundedQueue, CaptureStats, DrainReport};
pub use dispatcher::{BatchCallback, CallbackId, EventCallback, EventDispatcher, ProcessFilter};
pub use providers::Provider;
pub use session::{CaptureSession, SessionCounters};

/// Receives decoded events from the trace thread. Implementations must return
/// quickly.
pub trait EventSink: Send + Sync {
    fn submit(&self, event: NetworkEvent);
}
