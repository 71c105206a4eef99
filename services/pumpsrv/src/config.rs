//! Service configuration
//!
//! Loaded with Figment: a YAML (or TOML/JSON, by extension) file merged with
//! `PUMPSRV_`-prefixed environment variables, `__` separating nested keys
//! (e.g. `PUMPSRV_SERVICE__LOGGING__LEVEL=debug`).

use std::collections::HashSet;
use std::path::Path;

use common::LoggingConfig;
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PumpError, Result};
use crate::protocols::new_era::{Address, RateUnits, VolumeUnits};
use crate::transport::SerialTransportConfig;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "config/pumpsrv.yaml";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "PUMPSRV_";

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,

    /// Physical serial lines
    #[serde(default)]
    pub buses: Vec<BusConfig>,

    /// Pumps, each attached to one bus
    #[serde(default)]
    pub pumps: Vec<PumpConfig>,
}

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Interval for the debug-level snapshot log, 0 disables it
    #[serde(default = "default_snapshot_log_interval_ms")]
    pub snapshot_log_interval_ms: u64,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            snapshot_log_interval_ms: default_snapshot_log_interval_ms(),
            logging: LoggingConfig::default(),
        }
    }
}

/// One physical serial line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0", "COM3")
    pub port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    #[serde(default = "default_data_bits")]
    pub data_bits: u8,

    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,

    #[serde(default = "default_none")]
    pub parity: String,

    #[serde(default = "default_none")]
    pub flow_control: String,

    /// Pause after each write
    #[serde(default = "default_guard_interval_ms")]
    pub guard_interval_ms: u64,

    /// Silence after a write before the line is unresponsive
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Grace period for the line tasks on close
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: default_none(),
            flow_control: default_none(),
            guard_interval_ms: default_guard_interval_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            close_grace_ms: default_close_grace_ms(),
        }
    }
}

/// Pump model family
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PumpKind {
    /// NE-1000 family: volume moves, purge, prime
    #[default]
    Ne1000,
    /// X2 / continuous next-gen: rate-driven, no volume tracking
    Continuous,
}

/// Allowed position range, in the pump's volume units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    #[serde(default)]
    pub min: f64,
    #[serde(default = "default_limit_max")]
    pub max: f64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            min: 0.0,
            max: default_limit_max(),
        }
    }
}

impl Limits {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// One pump on a bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpConfig {
    /// Unique pump name
    pub name: String,

    #[serde(default)]
    pub kind: PumpKind,

    /// Port of the bus this pump is wired to
    pub port: String,

    /// Bus address 0-9; omit when `broadcast` is set
    #[serde(default)]
    pub address: Option<u8>,

    /// Send unaddressed `*` commands (single pump on the line)
    #[serde(default)]
    pub broadcast: bool,

    #[serde(default = "default_volume_units")]
    pub volume_units: VolumeUnits,

    #[serde(default = "default_rate_units")]
    pub rate_units: RateUnits,

    #[serde(default)]
    pub limits: Limits,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Bound on waiting for an operation to settle
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Per-attempt wait for a query response
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    #[serde(default = "default_query_retries")]
    pub query_retries: u32,
}

impl PumpConfig {
    /// Validated bus address
    pub fn address(&self) -> Result<Address> {
        match (self.broadcast, self.address) {
            (true, None) => Ok(Address::Broadcast),
            (true, Some(_)) => Err(PumpError::config(format!(
                "Pump {}: address and broadcast are mutually exclusive",
                self.name
            ))),
            (false, Some(address)) => Address::unit(address),
            (false, None) => Err(PumpError::config(format!(
                "Pump {}: address (0-9) or broadcast is required",
                self.name
            ))),
        }
    }
}

// Serde default functions
fn default_service_name() -> String {
    "pumpsrv".to_string()
}

fn default_snapshot_log_interval_ms() -> u64 {
    5000
}

fn default_baud_rate() -> u32 {
    19200
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_none() -> String {
    "None".to_string()
}

fn default_guard_interval_ms() -> u64 {
    250
}

fn default_read_timeout_ms() -> u64 {
    3000
}

fn default_close_grace_ms() -> u64 {
    1000
}

fn default_limit_max() -> f64 {
    f64::INFINITY
}

fn default_volume_units() -> VolumeUnits {
    VolumeUnits::Milliliters
}

fn default_rate_units() -> RateUnits {
    RateUnits::MillilitersPerMinute
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_query_timeout_ms() -> u64 {
    1000
}

fn default_query_retries() -> u32 {
    3
}

// ============================================================================
// Loading and validation
// ============================================================================

impl AppConfig {
    /// Load from `path` (format by extension) plus environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading configuration from {}", path.display());

        let figment = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Figment::new().merge(Toml::file(path)),
            Some("json") => Figment::new().merge(Json::file(path)),
            _ => Figment::new().merge(Yaml::file(path)),
        };
        Self::from_figment(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Parse an inline YAML document, without environment overrides
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Self::from_figment(Figment::new().merge(Yaml::string(yaml)))
    }

    fn from_figment(figment: Figment) -> Result<Self> {
        let config: AppConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn bus(&self, port: &str) -> Option<&BusConfig> {
        self.buses.iter().find(|b| b.port == port)
    }

    /// Reject configurations that cannot start
    pub fn validate(&self) -> Result<()> {
        if self.service.name.trim().is_empty() {
            return Err(PumpError::config("service.name cannot be empty"));
        }

        let mut ports = HashSet::new();
        for bus in &self.buses {
            SerialTransportConfig::from(bus).validate()?;
            if !ports.insert(bus.port.as_str()) {
                return Err(PumpError::config(format!(
                    "Bus {} is configured more than once",
                    bus.port
                )));
            }
            if bus.read_timeout_ms == 0 {
                return Err(PumpError::config(format!(
                    "Bus {}: read_timeout_ms must be greater than zero",
                    bus.port
                )));
            }
        }

        let mut names = HashSet::new();
        for pump in &self.pumps {
            if pump.name.trim().is_empty() {
                return Err(PumpError::config("Pump name cannot be empty"));
            }
            if !names.insert(pump.name.as_str()) {
                return Err(PumpError::config(format!(
                    "Duplicate pump name {}",
                    pump.name
                )));
            }
            if !ports.contains(pump.port.as_str()) {
                return Err(PumpError::config(format!(
                    "Pump {} references unknown bus {}",
                    pump.name, pump.port
                )));
            }
            pump.address()?;
            if pump.limits.min.is_nan() || pump.limits.min > pump.limits.max {
                return Err(PumpError::config(format!(
                    "Pump {}: limits.min must not exceed limits.max",
                    pump.name
                )));
            }
            if pump.poll_interval_ms == 0 || pump.query_retries == 0 {
                return Err(PumpError::config(format!(
                    "Pump {}: poll_interval_ms and query_retries must be positive",
                    pump.name
                )));
            }
        }

        Ok(())
    }
}
