use anyhow::Context;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use netscope::capture::{BatchingDispatcher, CaptureSession, EventDispatcher, EventSink, ProcessFilter};
use netscope::config::{load_config, MonitorConfig, DEFAULT_CONFIG_PATH};
use netscope::logging;
use netscope::monitoring::{
    event_channel, handlers, metadata, persistence, start_event_logger, JsonLinesSink, MetadataResolver,
    RateMonitor, RateSettings, UdpTracker,
};
use netscope::platform::{EStatsCollector, SystemProcessSource, TcpTableEnumerator, PROCESS_NAMES};
use netscope::state::{GlobalNetworkMonitor, MonitorSettings};
use netscope::utils::privilege;
use netscope::utils::scheduler::{self, join_with_timeout, JoinError};
use std::io::{self, BufRead};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::thread::JoinHandle;
use std::time::Duration;

static RUNNING: AtomicBool = AtomicBool::new(true);
static SHUTDOWN_ONCE: Once = Once::new();

const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

fn request_shutdown(reason: &str) {
    SHUTDOWN_ONCE.call_once(|| {
        log::info!("Shutdown requested ({})", reason);
        RUNNING.store(false, Ordering::Relaxed);
    });
}

fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = load_config(&config_path);
    logging::init_logging(&config.logging).context("failed to initialise logging")?;

    log::info!("NetScope {} starting (config: {})", env!("CARGO_PKG_VERSION"), config_path);

    let caps = privilege::detect_capabilities(config.rate.detailed_stats);
    caps.log_summary();

    let (metadata_tx, metadata_rx) = metadata::request_channel();
    let monitor = Arc::new(
        GlobalNetworkMonitor::new(MonitorSettings::from_config(&config)).with_metadata_requests(metadata_tx),
    );

    // One flag per component so each can be stopped and joined in order.
    let capture_running = Arc::new(AtomicBool::new(true));
    let rate_running = Arc::new(AtomicBool::new(true));
    let rate_events_running = Arc::new(AtomicBool::new(true));
    let udp_running = Arc::new(AtomicBool::new(true));
    let cleanup_running = Arc::new(AtomicBool::new(true));
    let persistence_running = Arc::new(AtomicBool::new(true));
    let metadata_running = Arc::new(AtomicBool::new(true));

    let filter = ProcessFilter::new(&config.capture.excluded_processes)
        .context("invalid excluded process patterns")?;
    let dispatcher = Arc::new(EventDispatcher::new().with_filter(filter));
    let udp = Arc::new(UdpTracker::new(Arc::clone(&monitor), config.udp.idle_timeout()));
    handlers::register(&dispatcher, Arc::clone(&monitor), Arc::clone(&udp));

    let batching = config
        .capture
        .batching
        .then(|| Arc::new(BatchingDispatcher::new(Arc::clone(&dispatcher), &config.capture)));
    let sink: Arc<dyn EventSink> = match &batching {
        Some(batching) => Arc::clone(batching) as Arc<dyn EventSink>,
        None => Arc::clone(&dispatcher) as Arc<dyn EventSink>,
    };

    let session = CaptureSession::new(&config.capture, sink);
    if config.capture.enabled && caps.tracing {
        match session.start() {
            Ok(()) => log::info!("Capture session started with {} providers", session.providers().len()),
            Err(e) => log::warn!("Capture unavailable, continuing with table sampling only: {}", e),
        }
    } else if config.capture.enabled {
        log::warn!("Capture needs administrator rights, continuing with table sampling only");
    }

    let mut components: Vec<(&str, Arc<AtomicBool>, JoinHandle<()>)> = Vec::new();

    if let Some(batching) = &batching {
        let handle = batching.start_drain_loop(
            config.capture.drain_interval(),
            Duration::from_secs(config.capture.stats_log_interval_secs.max(1)),
            Arc::clone(&capture_running),
        )?;
        components.push(("Capture drain", Arc::clone(&capture_running), handle));
    }

    let (rate_tx, rate_rx) = event_channel();
    let rate_monitor = Arc::new(
        RateMonitor::new(
            Arc::new(TcpTableEnumerator::default()),
            Arc::new(EStatsCollector::new()),
            RateSettings {
                detailed_stats: caps.detailed_stats,
                max_elapsed_secs: config.rate.max_elapsed_secs as f64,
                eviction_cycles: config.rate.eviction_cycles,
            },
        )
        .with_monitor(Arc::clone(&monitor))
        .with_events(rate_tx),
    );
    let handle = rate_monitor.start(config.rate.interval(), Arc::clone(&rate_running))?;
    components.push(("Rate monitor", Arc::clone(&rate_running), handle));
    let handle = start_event_logger(rate_rx, Arc::clone(&rate_events_running))?;
    components.push(("Rate event logger", Arc::clone(&rate_events_running), handle));

    let handle = udp.start_sweeper(config.udp.sweep_interval(), Arc::clone(&udp_running))?;
    components.push(("UDP sweeper", Arc::clone(&udp_running), handle));

    let handle = {
        let monitor = Arc::clone(&monitor);
        scheduler::spawn_periodic(
            "state-cleanup",
            Duration::from_secs(config.cleanup.interval_secs),
            Arc::clone(&cleanup_running),
            move || {
                let report = monitor.cleanup();
                PROCESS_NAMES.purge_expired();
                if report.total() > 0 {
                    log::debug!(
                        "Cleanup removed {} connections, {} processes, {} applications, {} DNS entries",
                        report.connections,
                        report.processes,
                        report.applications,
                        report.dns_entries
                    );
                }
            },
        )?
    };
    components.push(("State cleanup", Arc::clone(&cleanup_running), handle));

    if config.persistence.enabled {
        match JsonLinesSink::new(&config.persistence.path) {
            Ok(sink) => {
                let handle = persistence::start_persistence(
                    Arc::clone(&monitor),
                    Box::new(sink),
                    Duration::from_secs(config.persistence.flush_interval_secs),
                    Arc::clone(&persistence_running),
                )?;
                components.push(("Persistence", Arc::clone(&persistence_running), handle));
            }
            Err(e) => log::error!("Traffic persistence disabled: {}", e),
        }
    }

    let handle = MetadataResolver::new(Arc::new(SystemProcessSource), Arc::clone(&monitor))
        .with_name_cache(Arc::clone(&PROCESS_NAMES))
        .start(metadata_rx, Arc::clone(&metadata_running))?;
    components.push(("Metadata resolver", Arc::clone(&metadata_running), handle));

    ctrlc::set_handler(|| request_shutdown("Ctrl+C")).context("failed to set Ctrl+C handler")?;

    log::info!("Monitoring. Commands: status, snapshot, top, quit");
    let commands = spawn_console()?;
    run_console(&commands, &config, &monitor, &rate_monitor, &session, batching.as_deref());

    log::info!("Initiating graceful shutdown");
    if let Err(e) = session.stop() {
        log::warn!("Capture session did not stop cleanly: {}", e);
    }
    if let Some(batching) = &batching {
        batching.cancel();
    }

    for (name, running, handle) in components {
        running.store(false, Ordering::Relaxed);
        match join_with_timeout(handle, JOIN_TIMEOUT) {
            Ok(()) => log::info!("{} stopped", name),
            Err(JoinError::Timeout) => log::warn!("{} didn't stop in time, continuing", name),
            Err(JoinError::Panic(e)) => log::error!("{} panicked during shutdown: {:?}", name, e),
        }
    }

    log::info!("Shutdown complete");
    Ok(())
}

/// Reads stdin lines on a detached thread. The thread may stay blocked in
/// `read_line` after shutdown; the process exit reclaims it.
fn spawn_console() -> io::Result<Receiver<String>> {
    let (tx, rx) = crossbeam_channel::unbounded();
    std::thread::Builder::new().name("console".to_string()).spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    })?;
    Ok(rx)
}

fn run_console(
    commands: &Receiver<String>,
    config: &MonitorConfig,
    monitor: &GlobalNetworkMonitor,
    rates: &RateMonitor,
    session: &CaptureSession,
    batching: Option<&BatchingDispatcher>,
) {
    while RUNNING.load(Ordering::Relaxed) {
        let line = match commands.recv_timeout(Duration::from_millis(200)) {
            Ok(line) => line,
            Err(RecvTimeoutError::Timeout) => continue,
            // stdin closed: keep running until Ctrl+C.
            Err(RecvTimeoutError::Disconnected) => {
                while RUNNING.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_millis(200));
                }
                break;
            }
        };

        match line.trim().to_lowercase().as_str() {
            "q" | "quit" | "exit" | "stop" => request_shutdown("console"),
            "status" | "info" => {
                let session_stats = session.stats();
                log::info!(
                    "Tracking {} connections across {} processes; capture {} ({} records, {} decoded)",
                    monitor.connection_count(),
                    monitor.process_count(),
                    if session.is_running() { "running" } else { "stopped" },
                    session_stats.records,
                    session_stats.decoded
                );
                if rates.dropped_events() > 0 {
                    log::info!("Rate events dropped: {}", rates.dropped_events());
                }
                if let Some(batching) = batching {
                    batching.log_stats();
                }
            }
            "snapshot" => match serde_json::to_string_pretty(&monitor.get_snapshot()) {
                Ok(json) => println!("{}", json),
                Err(e) => log::error!("Failed to serialise snapshot: {}", e),
            },
            "top" => {
                for stats in rates.top_processes(config.rate.top_n) {
                    log::info!(
                        "PID {:>6}  in {:>10.0} B/s  out {:>10.0} B/s  ({} connections)",
                        stats.pid,
                        stats.bytes_in_per_sec,
                        stats.bytes_out_per_sec,
                        stats.connection_count
                    );
                }
                for port in monitor.top_ports(config.rate.top_n) {
                    log::info!("Port {:>5}  {} bytes", port.port, port.total());
                }
                for ip in monitor.top_ips(config.rate.top_n) {
                    log::info!(
                        "{} ({})  {} bytes",
                        ip.ip,
                        ip.domain.as_deref().unwrap_or("-"),
                        ip.total()
                    );
                }
            }
            "" => {}
            other => log::info!("Unknown command '{}'. Available: status, snapshot, top, quit", other),
        }
    }
}
