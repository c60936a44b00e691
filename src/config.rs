//! # Engine Configuration
//!
//! Configuration consumed by the protocol engine at startup: which transports
//! are enabled, serial line parameters and slave address per RTU port, the
//! zero-base addressing convention, broadcast-answer policy and the RX-to-TX
//! turnaround delay.
//!
//! Configurations are usually loaded from YAML or JSON:
//!
//! ```rust
//! use servo_modbus::config::EngineConfig;
//!
//! let yaml = r#"
//! hardware_revision: 3
//! zero_base_address: false
//! rtu_ports:
//!   - device: /dev/ttyS1
//!     baud_rate: 115200
//!     parity: even
//!     slave_address: 1
//!     turnaround_us: 500
//! "#;
//! let config = EngineConfig::from_yaml_str(yaml).unwrap();
//! assert_eq!(config.rtu_ports[0].frame_bits(), 11);
//! assert!(config.validate().is_ok());
//! ```

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::MAX_SLAVE_ADDRESS;
use crate::transport::TransportId;

/// Maximum number of RTU ports served by one engine
pub const MAX_RTU_PORTS: usize = 2;

/// Serial parity setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Even,
    Odd,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        }
    }
}

/// Configuration of one RTU serial port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RtuPortConfig {
    pub enabled: bool,
    /// Serial device path, e.g. `/dev/ttyUSB0`
    pub device: String,
    pub baud_rate: u32,
    pub parity: Parity,
    /// 1 or 2
    pub stop_bits: u8,
    /// 1-247
    pub slave_address: u8,
    /// Reply to broadcast requests (address 0)
    pub broadcast_answer: bool,
    /// Minimum delay between end of request reception and reply transmission
    pub turnaround_us: u32,
}

impl Default for RtuPortConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device: "/dev/ttyUSB0".to_string(),
            baud_rate: 19_200,
            parity: Parity::Even,
            stop_bits: 1,
            slave_address: 1,
            broadcast_answer: false,
            turnaround_us: 0,
        }
    }
}

impl RtuPortConfig {
    /// Bits per transmitted character: start + 8 data + parity + stop bits
    pub fn frame_bits(&self) -> u32 {
        let parity = if self.parity == Parity::None { 0 } else { 1 };
        1 + 8 + parity + u32::from(self.stop_bits)
    }

    fn validate(&self, index: usize) -> ModbusResult<()> {
        if self.slave_address == 0 || self.slave_address > MAX_SLAVE_ADDRESS {
            return Err(ModbusError::configuration(format!(
                "rtu_ports[{}]: slave address {} outside 1-{}",
                index, self.slave_address, MAX_SLAVE_ADDRESS
            )));
        }
        if self.baud_rate == 0 {
            return Err(ModbusError::configuration(format!("rtu_ports[{}]: baud rate must be non-zero", index)));
        }
        if !matches!(self.stop_bits, 1 | 2) {
            return Err(ModbusError::configuration(format!(
                "rtu_ports[{}]: stop bits must be 1 or 2, got {}",
                index, self.stop_bits
            )));
        }
        Ok(())
    }
}

/// Configuration of the Modbus TCP peer (Ethernet transport)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpPeerConfig {
    pub enabled: bool,
    pub bind_address: SocketAddr,
    pub max_connections: usize,
    /// Idle timeout per connection
    pub request_timeout_ms: u64,
    /// Boards older than this revision have no Ethernet PHY
    pub min_hardware_revision: u8,
}

impl Default for TcpPeerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: SocketAddr::from(([0, 0, 0, 0], crate::DEFAULT_TCP_PORT)),
            max_connections: 4,
            request_timeout_ms: 30_000,
            min_hardware_revision: 2,
        }
    }
}

impl TcpPeerConfig {
    /// Idle timeout as a [`Duration`]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Board revision reported by the hardware
    pub hardware_revision: u8,
    /// Use wire addresses as-is; otherwise add one before resolution
    pub zero_base_address: bool,
    /// Period of the framer timer tick
    pub tick_period_us: u32,
    /// Period of the dispatcher polling tick
    pub poll_period_ms: u64,
    pub rtu_ports: Vec<RtuPortConfig>,
    pub tcp: Option<TcpPeerConfig>,
    /// Dump raw frames through `tracing`
    pub packet_logging: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hardware_revision: 1,
            zero_base_address: false,
            tick_period_us: 500,
            poll_period_ms: 1,
            rtu_ports: vec![RtuPortConfig::default()],
            tcp: None,
            packet_logging: false,
        }
    }
}

impl EngineConfig {
    /// Parse a YAML document
    pub fn from_yaml_str(text: &str) -> ModbusResult<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Parse a JSON document
    pub fn from_json_str(text: &str) -> ModbusResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load a configuration file, choosing the parser from its extension
    pub fn from_file<P: AsRef<Path>>(path: P) -> ModbusResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ModbusError::configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&text)?,
            Some("yaml") | Some("yml") => Self::from_yaml_str(&text)?,
            other => {
                return Err(ModbusError::configuration(format!(
                    "Unsupported configuration format: {:?}",
                    other
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> ModbusResult<()> {
        if self.rtu_ports.len() > MAX_RTU_PORTS {
            return Err(ModbusError::configuration(format!(
                "At most {} RTU ports are supported, got {}",
                MAX_RTU_PORTS,
                self.rtu_ports.len()
            )));
        }
        if self.tick_period_us == 0 {
            return Err(ModbusError::configuration("tick_period_us must be non-zero"));
        }
        if self.poll_period_ms == 0 {
            return Err(ModbusError::configuration("poll_period_ms must be non-zero"));
        }
        for (index, port) in self.rtu_ports.iter().enumerate() {
            port.validate(index)?;
        }
        if let Some(tcp) = &self.tcp {
            if tcp.max_connections == 0 {
                return Err(ModbusError::configuration("tcp.max_connections must be non-zero"));
            }
        }
        Ok(())
    }

    /// Transport enable bitmask after the hardware-revision gate
    pub fn enable_mask(&self) -> u8 {
        let mut mask = 0;
        for (index, port) in self.rtu_ports.iter().enumerate() {
            if port.enabled {
                if let Some(id) = TransportId::rtu(index) {
                    mask |= id.bit();
                }
            }
        }
        if let Some(tcp) = &self.tcp {
            if tcp.enabled && tcp.min_hardware_revision <= self.hardware_revision {
                mask |= TransportId::ETHERNET.bit();
            }
        }
        mask
    }

    /// Polling period as a [`Duration`]
    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_period_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.enable_mask(), TransportId::RTU0.bit());
    }

    #[test]
    fn test_frame_bits() {
        let mut port = RtuPortConfig::default();
        assert_eq!(port.frame_bits(), 11);
        port.parity = Parity::None;
        assert_eq!(port.frame_bits(), 10);
        port.stop_bits = 2;
        assert_eq!(port.frame_bits(), 11);
    }

    #[test]
    fn test_invalid_slave_address() {
        let mut config = EngineConfig::default();
        config.rtu_ports[0].slave_address = 0;
        assert!(matches!(config.validate(), Err(ModbusError::Configuration { .. })));
        config.rtu_ports[0].slave_address = 248;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_too_many_ports() {
        let mut config = EngineConfig::default();
        config.rtu_ports = vec![RtuPortConfig::default(); 3];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_hardware_gate_disables_ethernet() {
        let mut config = EngineConfig::default();
        config.tcp = Some(TcpPeerConfig { enabled: true, min_hardware_revision: 2, ..Default::default() });

        config.hardware_revision = 1;
        assert_eq!(config.enable_mask() & TransportId::ETHERNET.bit(), 0);

        config.hardware_revision = 2;
        assert_ne!(config.enable_mask() & TransportId::ETHERNET.bit(), 0);
    }

    #[test]
    fn test_json_and_yaml_agree() {
        let yaml = "zero_base_address: true\nrtu_ports:\n  - slave_address: 5\n    parity: none\n";
        let json = r#"{"zero_base_address": true, "rtu_ports": [{"slave_address": 5, "parity": "none"}]}"#;
        let a = EngineConfig::from_yaml_str(yaml).unwrap();
        let b = EngineConfig::from_json_str(json).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.rtu_ports[0].baud_rate, 19_200);
    }

    #[test]
    fn test_from_file_dispatches_on_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        std::fs::write(&path, "hardware_revision: 4\n").unwrap();
        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.hardware_revision, 4);

        let path = dir.path().join("engine.ini");
        std::fs::write(&path, "x=1").unwrap();
        assert!(EngineConfig::from_file(&path).is_err());
    }
}
