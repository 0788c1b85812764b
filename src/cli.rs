//! Command-line interface definitions using clap.

use crate::logging::{LogConfig, LogFormat};
use clap::Parser;
use std::path::PathBuf;
use tracing::Level;

/// procpool - application process pool server
#[derive(Parser, Debug)]
#[command(name = "procpool")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path of the local socket to listen on.
    #[arg(long, env = "PROCPOOL_SOCKET")]
    pub socket: PathBuf,

    /// Hard cap on workers across all applications.
    #[arg(long, default_value_t = 6)]
    pub max: u32,

    /// Default per-application worker cap (0 = unlimited).
    #[arg(long = "max-per-app", default_value_t = 0)]
    pub max_per_app: u32,

    /// Seconds a worker may idle before it is retired (0 = never).
    #[arg(long = "idle-time", default_value_t = 120)]
    pub idle_time: u64,

    /// Username clients authenticate with.
    #[arg(long, env = "PROCPOOL_USER", default_value = "procpool")]
    pub user: String,

    /// File holding the client password. Alternatively set
    /// PROCPOOL_PASSWORD.
    #[arg(long = "password-file", env = "PROCPOOL_PASSWORD_FILE")]
    pub password_file: Option<PathBuf>,

    /// Log level: error, warn, info, debug, trace.
    #[arg(long, env = "PROCPOOL_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log format: pretty, compact, json.
    #[arg(long, env = "PROCPOOL_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// Log to this file in addition to stderr.
    #[arg(long, env = "PROCPOOL_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    /// Turn the logging flags into a [`LogConfig`], with env overrides for
    /// anything left unset.
    pub fn log_config(&self) -> LogConfig {
        let mut config = LogConfig::new();
        if let Some(level) = &self.log_level {
            config.level = match level.to_lowercase().as_str() {
                "error" => Level::ERROR,
                "warn" | "warning" => Level::WARN,
                "debug" => Level::DEBUG,
                "trace" => Level::TRACE,
                _ => Level::INFO,
            };
        }
        if let Some(format) = &self.log_format {
            config.format = format.parse::<LogFormat>().unwrap_or_default();
        }
        if let Some(path) = &self.log_file {
            config = config.with_file(path.clone());
        }
        config.with_env_overrides()
    }
}
