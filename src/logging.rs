//! Callback-based request/reply logging.
//!
//! A [`CallbackLogger`] attached to the engine receives one line per request
//! and per reply, either as raw hex, as an interpretation of the PDU fields,
//! or both. Library diagnostics go through the `log` facade; this logger is
//! for operators watching the traffic of a running drive.

use std::sync::Arc;

use crate::memory::{MemoryOpcode, MemoryStatus};
use crate::protocol::{ExceptionCode, FunctionCode, COIL_ON, EXCEPTION_FLAG};
use crate::transport::TransportId;

/// Log levels for the callback logging system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Error messages
    Error,
    /// Warning messages
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
}

/// Logging mode for packet display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// Show raw packet data only
    Raw,
    /// Show interpreted packet data with field descriptions
    Interpreted,
    /// Show both raw and interpreted data
    Both,
}

impl LogLevel {
    /// Convert log level to string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// Type alias for log callback functions
///
/// The callback receives a log level and message string
pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Logger that uses callbacks for flexible logging
#[derive(Clone)]
pub struct CallbackLogger {
    callback: Option<Arc<LogCallback>>,
    min_level: LogLevel,
    mode: LoggingMode,
}

fn be16(data: &[u8], offset: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*data.get(offset)?, *data.get(offset + 1)?]))
}

impl CallbackLogger {
    /// Create a new callback logger
    pub fn new(callback: Option<LogCallback>, min_level: LogLevel) -> Self {
        Self::with_mode(callback, min_level, LoggingMode::Interpreted)
    }

    /// Create a new callback logger with specific mode
    pub fn with_mode(callback: Option<LogCallback>, min_level: LogLevel, mode: LoggingMode) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
            mode,
        }
    }

    /// Create a logger with default console output
    pub fn console() -> Self {
        let callback: LogCallback = Box::new(|level, message| {
            let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
            match level {
                LogLevel::Error | LogLevel::Warn => eprintln!("[{}] {}: {}", timestamp, level.as_str(), message),
                LogLevel::Info | LogLevel::Debug => println!("[{}] {}: {}", timestamp, level.as_str(), message),
            }
        });
        Self::new(Some(callback), LogLevel::Info)
    }

    /// Create a logger that outputs nothing (disabled)
    pub fn disabled() -> Self {
        Self::new(None, LogLevel::Error)
    }

    /// Set logging mode
    pub fn set_mode(&mut self, mode: LoggingMode) {
        self.mode = mode;
    }

    /// Get current logging mode
    pub fn mode(&self) -> LoggingMode {
        self.mode
    }

    /// Check if the logger has an output
    pub fn is_enabled(&self) -> bool {
        self.callback.is_some()
    }

    /// Log a message at the specified level
    pub fn log(&self, level: LogLevel, message: &str) {
        if self.should_log(level) {
            if let Some(ref callback) = self.callback {
                callback(level, message);
            }
        }
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    fn should_log(&self, level: LogLevel) -> bool {
        self.callback.is_some() && level as u8 <= self.min_level as u8
    }

    /// Log a request PDU received on `transport`
    pub fn log_request(&self, transport: TransportId, unit_id: u8, pdu: &[u8]) {
        self.log_pdu("Request ->", transport, unit_id, pdu, describe_request(pdu));
    }

    /// Log a reply PDU sent on `transport`
    pub fn log_response(&self, transport: TransportId, unit_id: u8, pdu: &[u8]) {
        self.log_pdu("Response <-", transport, unit_id, pdu, describe_response(pdu));
    }

    fn log_pdu(&self, direction: &str, transport: TransportId, unit_id: u8, pdu: &[u8], interpreted: String) {
        if !self.should_log(LogLevel::Info) {
            return;
        }
        let raw = format!("Modbus {} {} Raw: {}", direction, transport, hex::encode_upper(pdu));
        let interpreted = format!("Modbus {} {} Unit: {}, {}", direction, transport, unit_id, interpreted);
        match self.mode {
            LoggingMode::Raw => self.info(&raw),
            LoggingMode::Interpreted => self.info(&interpreted),
            LoggingMode::Both => {
                self.info(&interpreted);
                self.debug(&raw);
            }
        }
    }
}

fn function_label(code: u8) -> String {
    match FunctionCode::from_u8(code) {
        Ok(function) => function.to_string(),
        Err(_) => format!("Unknown Function (0x{:02X})", code),
    }
}

fn describe_request(pdu: &[u8]) -> String {
    let Some(&code) = pdu.first() else {
        return "Empty PDU".to_string();
    };
    let label = function_label(code);
    let fields = match code {
        0x01..=0x04 | 0x0F | 0x10 => match (be16(pdu, 1), be16(pdu, 3)) {
            (Some(address), Some(quantity)) => format!("Address: {}, Quantity: {}", address, quantity),
            _ => format!("Data: {}", hex::encode(&pdu[1..])),
        },
        0x05 | 0x06 => match (be16(pdu, 1), be16(pdu, 3)) {
            (Some(address), Some(value)) => format!("Address: {}, Value: 0x{:04X}", address, value),
            _ => format!("Data: {}", hex::encode(&pdu[1..])),
        },
        0x0D => match pdu.get(3).map(|&op| MemoryOpcode::from_u8(op)) {
            Some(Ok(opcode)) => {
                let address = pdu
                    .get(4..8)
                    .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
                    .unwrap_or(0);
                let length = be16(pdu, 8).unwrap_or(0);
                format!("Command: {:?}, Address: 0x{:08X}, Length: {}", opcode, address, length)
            }
            _ => format!("Data: {}", hex::encode(&pdu[1..])),
        },
        _ => format!("Data: {}", hex::encode(&pdu[1..])),
    };
    format!("Function: {}, {}", label, fields)
}

fn describe_response(pdu: &[u8]) -> String {
    let Some(&code) = pdu.first() else {
        return "Empty PDU".to_string();
    };
    if code & EXCEPTION_FLAG != 0 {
        let exception = pdu
            .get(1)
            .and_then(|&c| ExceptionCode::from_u8(c))
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown exception".to_string());
        return format!("Function: {}, {}", function_label(code & !EXCEPTION_FLAG), exception);
    }

    let data = &pdu[1..];
    let fields = match code {
        0x01 | 0x02 if !data.is_empty() => {
            let coils: Vec<bool> = data[1..]
                .iter()
                .flat_map(|byte| (0..8).map(move |bit| byte & (1 << bit) != 0))
                .take(16)
                .collect();
            format!("Byte count: {}, Coils: {:?}", data[0], coils)
        }
        0x03 | 0x04 if !data.is_empty() => {
            let registers: Vec<u16> = data[1..]
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .take(8)
                .collect();
            format!("Byte count: {}, Registers: {:?}", data[0], registers)
        }
        0x05 => match (be16(data, 0), be16(data, 2)) {
            (Some(address), Some(value)) => format!(
                "Address: {}, Value: 0x{:04X} ({})",
                address,
                value,
                if value == COIL_ON { "ON" } else { "OFF" }
            ),
            _ => format!("Data: {}", hex::encode(data)),
        },
        0x06 => match (be16(data, 0), be16(data, 2)) {
            (Some(address), Some(value)) => format!("Address: {}, Value: {} (0x{:04X})", address, value, value),
            _ => format!("Data: {}", hex::encode(data)),
        },
        0x0F | 0x10 => match (be16(data, 0), be16(data, 2)) {
            (Some(address), Some(quantity)) => format!("Address: {}, Quantity: {}", address, quantity),
            _ => format!("Data: {}", hex::encode(data)),
        },
        0x0D => match data.get(2) {
            Some(&status) => {
                let status = if status == MemoryStatus::Ready as u8 { "Ready" } else { "Error" };
                format!("Status: {}, Data bytes: {}", status, data.len().saturating_sub(3))
            }
            None => format!("Data: {}", hex::encode(data)),
        },
        _ => format!("Data: {}", hex::encode(data)),
    };
    format!("Function: {}, {}", function_label(code), fields)
}

impl Default for CallbackLogger {
    fn default() -> Self {
        Self::disabled()
    }
}
