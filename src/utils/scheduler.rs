//! Background thread helpers shared by the periodic workers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Sleeps for `duration` in short slices. Returns false as soon as `running`
/// is cleared.
pub fn sleep_while_running(running: &AtomicBool, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if !running.load(Ordering::Relaxed) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

/// Spawns a named thread that runs `tick` every `interval` until `running` is
/// cleared. The first tick happens after one full interval.
pub fn spawn_periodic<F>(
    name: &str,
    interval: Duration,
    running: Arc<AtomicBool>,
    mut tick: F,
) -> std::io::Result<JoinHandle<()>>
where
    F: FnMut() + Send + 'static,
{
    let thread_name = name.to_string();
    std::thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            log::debug!("{} started ({:?} interval)", thread_name, interval);
            while sleep_while_running(&running, interval) {
                tick();
            }
            log::debug!("{} stopped", thread_name);
        })
}

#[derive(Debug)]
pub enum JoinError {
    Timeout,
    Panic(Box<dyn std::any::Any + Send + 'static>),
}

/// Polls the handle until it finishes or `timeout` elapses.
pub fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) -> Result<(), JoinError> {
    let start = Instant::now();

    while start.elapsed() < timeout {
        if handle.is_finished() {
            return handle.join().map_err(JoinError::Panic);
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    Err(JoinError::Timeout)
}
