mod tests;
mod relay_config;
mod logging_config;
pub mod config;
pub mod snapshot;

pub use config::{Config, ConfigError};
pub use logging_config::LoggingConfig;
pub use relay_config::{ConversionConfig, RelayConfig, SenderConfig, WatcherConfig};
pub use snapshot::{Snapshot, SnapshotHandle};

/// Startup arguments
#[derive(Debug, clap::Parser)]
#[command(name = "rtrelay", version, about = "Radiotherapy plan relay")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config/rtrelay.toml")]
    pub config: std::path::PathBuf,
}
