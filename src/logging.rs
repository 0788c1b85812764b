//! Logging setup for the pool server.
//!
//! # Environment variables
//!
//! - `PROCPOOL_LOG` - log filter (overrides `RUST_LOG`)
//! - `PROCPOOL_LOG_FORMAT` - output format: pretty, compact, json
//! - `PROCPOOL_LOG_FILE` - log file path (in addition to stderr)
//! - `RUST_LOG` - standard filter, used as fallback

use std::path::PathBuf;
use std::str::FromStr;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format (default)
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON for log aggregation systems
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

/// Logging configuration, built from CLI flags and environment overrides.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (default: INFO)
    pub level: Level,
    /// Output format
    pub format: LogFormat,
    /// Log file (None = stderr only)
    pub file_path: Option<PathBuf>,
    /// Custom filter string; overrides `level` when set
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            file_path: None,
            filter: None,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    /// Apply environment overrides. CLI-provided values win: env vars fill
    /// in only what is still unset.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            if let Ok(filter) = std::env::var("PROCPOOL_LOG") {
                self.filter = Some(filter);
            } else if let Ok(filter) = std::env::var("RUST_LOG") {
                self.filter = Some(filter);
            }
        }
        if let Ok(format) = std::env::var("PROCPOOL_LOG_FORMAT") {
            if let Ok(parsed) = format.parse() {
                self.format = parsed;
            }
        }
        if self.file_path.is_none() {
            if let Ok(path) = std::env::var("PROCPOOL_LOG_FILE") {
                self.file_path = Some(PathBuf::from(path));
            }
        }
        self
    }

    fn build_filter(&self) -> EnvFilter {
        if let Some(ref filter) = self.filter {
            EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                EnvFilter::new(self.level.to_string().to_lowercase())
            })
        } else {
            EnvFilter::new(self.level.to_string().to_lowercase())
        }
    }
}

/// Initialize the global tracing subscriber. Call once at startup; later
/// calls are ignored. The returned guard must live as long as the process
/// when file logging is enabled, or buffered lines are lost.
pub fn init(config: LogConfig) -> Option<WorkerGuard> {
    let filter = config.build_filter();

    let stderr_layer = match config.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Pretty => fmt::layer().with_writer(std::io::stderr).boxed(),
    };

    let (file_layer, guard) = match &config.file_path {
        Some(path) => {
            let directory = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "procpool.log".to_string());
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer).boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
    guard
}
