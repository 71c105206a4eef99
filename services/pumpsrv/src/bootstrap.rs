//! Service Bootstrap and Initialization
//!
//! Command line, logging and configuration validation for the `pumpsrv`
//! daemon.

use std::path::PathBuf;

use clap::Parser;
use errors::ServiceResult;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, DEFAULT_CONFIG_PATH};

/// Command-line arguments for pumpsrv
#[derive(Parser, Debug, Clone)]
#[command(
    name = "pumpsrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Syringe Pump Bus Service",
    long_about = None
)]
pub struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH, env = "PUMPSRV_CONFIG")]
    pub config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short = 'l', long)]
    pub log_level: Option<String>,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    /// Validation mode - only validate configuration without starting service
    #[arg(long)]
    pub validate: bool,
}

/// Load and validate the configuration named on the command line
pub fn load_configuration(args: &Args) -> ServiceResult<AppConfig> {
    debug!("Loading configuration from {}", args.config.display());
    Ok(AppConfig::load(&args.config)?)
}

/// Initialize logging from the service section
///
/// Log root directory priority:
/// 1. PUMPSRV_LOG_DIR environment variable
/// 2. `service.logging.dir`
/// 3. Default "logs"
pub fn initialize_logging(args: &Args, config: &AppConfig) -> ServiceResult<()> {
    common::logging::init_service_logging(
        &config.service.name,
        &config.service.logging,
        args.log_level.as_deref(),
        !args.no_color,
    )
}

/// Print what the configuration describes
pub fn validate_configuration(config: &AppConfig) {
    info!("Service: {}", config.service.name);
    let log_dir = common::logging::log_root(Some(&config.service.logging.dir));
    if !common::logging::is_log_dir_writable(&log_dir) {
        warn!("Log directory {} is not writable", log_dir.display());
    }
    info!("Found {} bus(es)", config.buses.len());
    for bus in &config.buses {
        info!(
            "  Bus {} @ {} baud (guard {} ms, read timeout {} ms)",
            bus.port, bus.baud_rate, bus.guard_interval_ms, bus.read_timeout_ms
        );
    }
    info!("Found {} pump(s)", config.pumps.len());
    for pump in &config.pumps {
        let address = match pump.address() {
            Ok(address) => address.to_string(),
            Err(_) => "?".to_string(),
        };
        info!(
            "  Pump {} ({:?}) on {} address {}",
            pump.name, pump.kind, pump.port, address
        );
    }
    match serde_yaml::to_string(config) {
        Ok(yaml) => debug!("Effective configuration:\n{}", yaml),
        Err(e) => warn!("Effective configuration not printable: {}", e),
    }
    info!("Configuration validation completed successfully");
}
