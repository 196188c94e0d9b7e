pub mod settings;

pub use settings::{
    load_config, load_config_strict, save_config, CaptureConfig, CleanupConfig, LoggingConfig,
    MonitorConfig, PersistenceConfig, ProviderToggles, RateConfig, UdpConfig,
    DEFAULT_CONFIG_PATH,
};
