use crate::config::LoggingConfig;
use crate::error::{MonitorError, Result};
use simplelog::*;
use std::fs::{self, OpenOptions};
use std::path::Path;

pub fn parse_level(level: &str) -> LevelFilter {
    match level.trim().to_ascii_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" | "warning" => LevelFilter::Warn,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

/// Installs the global logger: terminal output always, plus an appending file
/// logger when a path is configured.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let level = parse_level(&config.level);
    let log_config = ConfigBuilder::new()
        .set_thread_level(LevelFilter::Debug)
        .set_target_level(LevelFilter::Error)
        .build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        level,
        log_config.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];

    if let Some(file) = &config.file {
        let path = Path::new(file);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| MonitorError::io(parent, e))?;
            }
        }
        let handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| MonitorError::io(path, e))?;
        loggers.push(WriteLogger::new(level, log_config, handle));
    }

    CombinedLogger::init(loggers).map_err(|e| MonitorError::config(format!("logger: {}", e)))
}
