//! Serial Transport Implementation
//!
//! Line settings and port opening for a physical pump bus.

use serde::{Deserialize, Serialize};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info};

use crate::config::BusConfig;
use crate::error::{PumpError, Result};

/// Serial port configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialTransportConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0", "COM1")
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5, 6, 7, 8)
    pub data_bits: u8,
    /// Stop bits (1, 2)
    pub stop_bits: u8,
    /// Parity ("None", "Even", "Odd")
    pub parity: String,
    /// Flow control ("None", "Software", "Hardware")
    pub flow_control: String,
}

impl Default for SerialTransportConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 19200,
            data_bits: 8,
            stop_bits: 1,
            parity: "None".to_string(),
            flow_control: "None".to_string(),
        }
    }
}

impl From<&BusConfig> for SerialTransportConfig {
    fn from(bus: &BusConfig) -> Self {
        Self {
            port: bus.port.clone(),
            baud_rate: bus.baud_rate,
            data_bits: bus.data_bits,
            stop_bits: bus.stop_bits,
            parity: bus.parity.clone(),
            flow_control: bus.flow_control.clone(),
        }
    }
}

impl SerialTransportConfig {
    pub fn validate(&self) -> Result<()> {
        if self.port.is_empty() {
            return Err(PumpError::config("Port path cannot be empty"));
        }

        if self.baud_rate == 0 {
            return Err(PumpError::config("Baud rate must be greater than zero"));
        }

        if ![5, 6, 7, 8].contains(&self.data_bits) {
            return Err(PumpError::config("Data bits must be 5, 6, 7, or 8"));
        }

        if ![1, 2].contains(&self.stop_bits) {
            return Err(PumpError::config("Stop bits must be 1 or 2"));
        }

        if !["None", "Even", "Odd"].contains(&self.parity.as_str()) {
            return Err(PumpError::config("Parity must be None, Even, or Odd"));
        }

        if !["None", "Software", "Hardware"].contains(&self.flow_control.as_str()) {
            return Err(PumpError::config(
                "Flow control must be None, Software, or Hardware",
            ));
        }

        Ok(())
    }

    /// Convert string parity to tokio_serial parity
    fn parse_parity(&self) -> tokio_serial::Parity {
        match self.parity.as_str() {
            "Even" => tokio_serial::Parity::Even,
            "Odd" => tokio_serial::Parity::Odd,
            _ => tokio_serial::Parity::None,
        }
    }

    /// Convert string flow control to tokio_serial flow control
    fn parse_flow_control(&self) -> tokio_serial::FlowControl {
        match self.flow_control.as_str() {
            "Software" => tokio_serial::FlowControl::Software,
            "Hardware" => tokio_serial::FlowControl::Hardware,
            _ => tokio_serial::FlowControl::None,
        }
    }

    /// Convert data bits to tokio_serial data bits
    fn parse_data_bits(&self) -> tokio_serial::DataBits {
        match self.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        }
    }

    /// Convert stop bits to tokio_serial stop bits
    fn parse_stop_bits(&self) -> tokio_serial::StopBits {
        match self.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        }
    }

    /// Open the port for exclusive use by one dispatcher
    pub fn open(&self) -> Result<SerialStream> {
        self.validate()?;
        debug!("Opening serial port: {}", self.port);

        let port_result = tokio_serial::new(&self.port, self.baud_rate)
            .data_bits(self.parse_data_bits())
            .parity(self.parse_parity())
            .stop_bits(self.parse_stop_bits())
            .flow_control(self.parse_flow_control())
            .open_native_async();

        match port_result {
            Ok(mut port) => {
                #[cfg(unix)]
                port.set_exclusive(true).map_err(|e| {
                    PumpError::transport(format!("Failed to set exclusive mode: {e}"))
                })?;

                info!(
                    "Opened serial port: {} @ {} baud",
                    self.port, self.baud_rate
                );
                Ok(port)
            },
            Err(e) => {
                let error_msg = format!("Failed to open serial port {}: {e}", self.port);
                error!("{error_msg}");
                Err(PumpError::Transport(error_msg))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_config_validation() {
        let config = SerialTransportConfig::default();
        assert!(config.validate().is_ok());

        let invalid_config = SerialTransportConfig {
            port: String::new(),
            ..Default::default()
        };
        assert!(invalid_config.validate().is_err());

        let invalid_config = SerialTransportConfig {
            data_bits: 9,
            ..Default::default()
        };
        assert!(invalid_config.validate().is_err());

        let invalid_config = SerialTransportConfig {
            parity: "Mark".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            invalid_config.validate(),
            Err(PumpError::Configuration(_))
        ));
    }

    #[test]
    fn test_serial_config_parsing() {
        let config = SerialTransportConfig {
            parity: "Even".to_string(),
            stop_bits: 2,
            data_bits: 7,
            ..Default::default()
        };
        assert_eq!(config.parse_parity(), tokio_serial::Parity::Even);
        assert_eq!(config.parse_stop_bits(), tokio_serial::StopBits::Two);
        assert_eq!(config.parse_data_bits(), tokio_serial::DataBits::Seven);
        assert_eq!(config.parse_flow_control(), tokio_serial::FlowControl::None);
    }

    #[tokio::test]
    async fn test_open_missing_port_fails() {
        let config = SerialTransportConfig {
            port: "/dev/pumpsrv-does-not-exist".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.open(), Err(PumpError::Transport(_))));
    }
}
