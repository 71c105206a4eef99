//! Unified logging module for pumpsrv services
//!
//! Console output plus a daily rolling log file, both filtered by a single
//! `EnvFilter` built from `RUST_LOG` or the configured level.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use errors::{ServiceError, ServiceResult};
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Environment variable overriding the log root directory
pub const LOG_DIR_ENV: &str = "PUMPSRV_LOG_DIR";

/// Custom format for log level with brackets: `[INFO]`, `[WARN]`, etc.
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Custom event formatter that outputs: `timestamp [LEVEL] message`
///
/// Example output: `2025-12-02T00:50:44.809Z [INFO] Dispatcher started on /dev/ttyUSB0`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.3fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m", // magenta
                Level::DEBUG => "\x1b[34m", // blue
                Level::INFO => "\x1b[32m",  // green
                Level::WARN => "\x1b[33m",  // yellow
                Level::ERROR => "\x1b[31m", // red
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Logging section of a service configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log root directory
    #[serde(default = "default_log_dir")]
    pub dir: String,
    /// Default filter when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Write the log file as JSON lines
    #[serde(default)]
    pub json: bool,
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            level: default_log_level(),
            json: false,
        }
    }
}

/// Logger runtime configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name (e.g., "pumpsrv"); also the log file prefix
    pub service_name: String,
    /// Directory receiving the daily log files
    pub log_dir: PathBuf,
    /// Level used when `RUST_LOG` is not set
    pub level: Level,
    /// Enable JSON format for the file layer
    pub enable_json: bool,
    /// Colored console output
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".to_string(),
            log_dir: PathBuf::from(default_log_dir()),
            level: Level::INFO,
            enable_json: false,
            ansi: true,
        }
    }
}

/// Resolve the log root directory
///
/// Priority: `PUMPSRV_LOG_DIR` > configured directory > `logs`
pub fn resolve_log_root(env_dir: Option<String>, config_dir: Option<&str>) -> PathBuf {
    env_dir
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .or_else(|| config_dir.map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(default_log_dir()))
}

/// Log root directory for the current process environment
pub fn log_root(config_dir: Option<&str>) -> PathBuf {
    resolve_log_root(std::env::var(LOG_DIR_ENV).ok(), config_dir)
}

/// Parse a level name, falling back to INFO
pub fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

// ============================================================================
// Initialization
// ============================================================================

// Keeps the non-blocking file writer alive for the process lifetime
static FILE_GUARD: OnceLock<Mutex<Option<WorkerGuard>>> = OnceLock::new();

fn default_filter(config: &LogConfig) -> String {
    format!(
        "{},{}=debug",
        config.level.as_str().to_lowercase(),
        config.service_name
    )
}

/// Initialize logging system with configuration
pub fn init_with_config(config: LogConfig) -> ServiceResult<()> {
    std::fs::create_dir_all(&config.log_dir)?;

    let file_appender =
        tracing_appender::rolling::daily(&config.log_dir, format!("{}.log", config.service_name));
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let guard_slot = FILE_GUARD.get_or_init(|| Mutex::new(None));
    match guard_slot.lock() {
        Ok(mut slot) => *slot = Some(guard),
        Err(poisoned) => *poisoned.into_inner() = Some(guard),
    }

    // RUST_LOG wins over the configured level
    let filter_str = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter(&config));
    let env_filter = EnvFilter::try_new(&filter_str)
        .map_err(|e| ServiceError::configuration(format!("Invalid log filter: {e}")))?;

    let console_layer = fmt::layer()
        .with_ansi(config.ansi)
        .event_format(BracketedLevelFormat)
        .boxed();

    let file_layer = if config.enable_json {
        fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_level(true)
            .with_target(true)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .event_format(BracketedLevelFormat)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| ServiceError::configuration(format!("Failed to init logging: {e}")))?;

    tracing::info!(
        "Logging: {} @ {}",
        config.service_name,
        config.log_dir.display()
    );
    Ok(())
}

/// Initialize logging for a service from its configuration section
pub fn init_service_logging(
    service_name: &str,
    logging: &LoggingConfig,
    level_override: Option<&str>,
    ansi: bool,
) -> ServiceResult<()> {
    let log_dir = log_root(Some(&logging.dir)).join(service_name);
    init_with_config(LogConfig {
        service_name: service_name.to_string(),
        log_dir,
        level: parse_level(level_override.unwrap_or(&logging.level)),
        enable_json: logging.json,
        ansi,
    })
}

/// Whether a directory looks writable for log files
pub fn is_log_dir_writable(dir: &Path) -> bool {
    if std::fs::create_dir_all(dir).is_err() {
        return false;
    }
    let marker = dir.join(".write_check");
    let ok = std::fs::write(&marker, b"").is_ok();
    let _ = std::fs::remove_file(&marker);
    ok
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_format_level() {
        assert_eq!(format_level(&Level::INFO), "[INFO]");
        assert_eq!(format_level(&Level::ERROR), "[ERROR]");
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), Level::DEBUG);
        assert_eq!(parse_level("WARN"), Level::WARN);
        assert_eq!(parse_level("warning"), Level::WARN);
        assert_eq!(parse_level("bogus"), Level::INFO);
    }

    #[test]
    fn test_resolve_log_root_priority() {
        assert_eq!(
            resolve_log_root(Some("/var/log/pumps".into()), Some("cfg")),
            PathBuf::from("/var/log/pumps")
        );
        assert_eq!(
            resolve_log_root(Some(String::new()), Some("cfg")),
            PathBuf::from("cfg")
        );
        assert_eq!(resolve_log_root(None, None), PathBuf::from("logs"));
    }

    #[test]
    fn test_default_filter_includes_service_target() {
        let config = LogConfig {
            service_name: "pumpsrv".to_string(),
            level: Level::WARN,
            ..Default::default()
        };
        assert_eq!(default_filter(&config), "warn,pumpsrv=debug");
    }

    #[test]
    fn test_log_dir_writable() {
        let dir = tempfile::tempdir().unwrap();
        assert!(is_log_dir_writable(&dir.path().join("nested")));
    }

    #[test]
    fn test_logging_config_defaults() {
        let config = LoggingConfig::default();
        assert_eq!(config.dir, "logs");
        assert_eq!(config.level, "info");
        assert!(!config.json);
    }
}
