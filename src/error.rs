//! # Servo Modbus Error Handling
//!
//! This module provides the error taxonomy for the protocol engine. Every error
//! raised while framing, dispatching or executing a request is recovered locally
//! into a wire reply (or a silent discard), so the types here mostly exist to
//! carry enough context for logging and to pick the right exception code.
//!
//! ## Error Categories
//!
//! ### Transport Errors
//! - **Frame Errors**: bad length, silence-interval violations, buffer overruns
//! - **CRC Errors**: checksum mismatch on an RTU envelope
//! - **I/O / Connection Errors**: serial port or socket failures
//!
//! ### Protocol Errors
//! - **Invalid Function**: function code with no handler (exception 0x01)
//! - **Invalid Data**: count / byte-count / value bound violations (exception 0x03)
//! - **Address Not Mapped**: no parameter binding covers the address (exception 0x03)
//! - **Permission Denied**: write to a read-only or currently locked parameter (exception 0x03)
//! - **Hook**: a hook parameter phase returned failure (exception 0x03)
//!
//! ### Sub-Protocol Errors
//! - **Region**: memory command outside any region or not allowed there
//! - **Drive Locked**: the motor-control runtime refused the reload lock
//!
//! ## Usage Examples
//!
//! ```rust
//! use servo_modbus::{ModbusError, ExceptionCode};
//!
//! let err = ModbusError::address_not_mapped(18081);
//! // Unmapped addresses intentionally answer Illegal Data Value, not Illegal Data Address.
//! assert_eq!(err.exception_code(), ExceptionCode::IllegalDataValue);
//! assert!(err.is_protocol_error());
//! ```

use thiserror::Error;

use crate::protocol::ExceptionCode;

/// Result type alias for engine operations
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Phase of a hook transaction, carried by [`ModbusError::Hook`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    Init,
    Segment,
    End,
}

impl std::fmt::Display for HookPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HookPhase::Init => "INIT",
            HookPhase::Segment => "SEGMENT",
            HookPhase::End => "END",
        };
        f.write_str(name)
    }
}

/// Engine error types
///
/// Each variant provides context about the specific failure. Protocol-level
/// variants map onto a Modbus exception code through
/// [`ModbusError::exception_code`]; transport-level variants never reach the
/// wire and only feed statistics and logs.
#[derive(Error, Debug, Clone)]
pub enum ModbusError {
    /// I/O related errors (serial port, socket)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection establishment or maintenance failure
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Frame-level violation detected by a transport framer
    ///
    /// # Examples
    /// - Envelope shorter than address + function + CRC
    /// - Inter-character silence exceeded t1.5
    /// - Byte received while a completed frame was still unconsumed
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// CRC validation failure on an RTU envelope
    #[error("CRC validation failed: expected={expected:04X}, actual={actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// Function code with no registered handler
    #[error("Invalid function code: 0x{code:02X}")]
    InvalidFunction { code: u8 },

    /// Request field outside its allowed bounds
    ///
    /// # Examples
    /// - Read Holding Registers with count 0 or 121
    /// - Write Multiple Coils whose byte count is not ceil(count/8)
    /// - Write Single Coil value other than 0x0000 / 0xFF00
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// No binding covers the requested register or coil index
    #[error("Address {index} is not mapped to a parameter")]
    AddressNotMapped { index: u32 },

    /// Write refused by the parameter's flags or the current system status
    #[error("Permission denied: {message}")]
    PermissionDenied { message: String },

    /// A hook parameter failed one of its transaction phases
    #[error("Hook transaction failed during {phase}: {message}")]
    Hook { phase: HookPhase, message: String },

    /// Memory sub-protocol address outside any region or not allowed there
    #[error("Memory region error at 0x{address:08X}: {message}")]
    Region { address: u32, message: String },

    /// The motor-control runtime refused the exclusive reload lock
    #[error("Drive refused reload lock")]
    DriveLocked,

    /// Configuration problems found at startup
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Internal errors (should not occur in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ModbusError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Create a frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create a CRC mismatch error
    ///
    /// # Arguments
    ///
    /// * `expected` - CRC computed over the received address and PDU
    /// * `actual` - CRC carried by the envelope
    pub fn crc_mismatch(expected: u16, actual: u16) -> Self {
        Self::CrcMismatch { expected, actual }
    }

    /// Create an invalid function error
    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData { message: message.into() }
    }

    /// Create an address resolution error
    pub fn address_not_mapped(index: u32) -> Self {
        Self::AddressNotMapped { index }
    }

    /// Create a permission error
    pub fn permission_denied<S: Into<String>>(message: S) -> Self {
        Self::PermissionDenied { message: message.into() }
    }

    /// Create a hook transaction error
    pub fn hook<S: Into<String>>(phase: HookPhase, message: S) -> Self {
        Self::Hook { phase, message: message.into() }
    }

    /// Create a memory region error
    pub fn region<S: Into<String>>(address: u32, message: S) -> Self {
        Self::Region { address, message: message.into() }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Map the error onto the exception code sent back to the master
    ///
    /// Address resolution failures answer `IllegalDataValue` rather than the
    /// canonical `IllegalDataAddress`; deployed tooling depends on it.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use servo_modbus::{ModbusError, ExceptionCode};
    ///
    /// assert_eq!(ModbusError::invalid_function(0x2B).exception_code(), ExceptionCode::IllegalFunction);
    /// assert_eq!(ModbusError::invalid_data("count").exception_code(), ExceptionCode::IllegalDataValue);
    /// assert_eq!(ModbusError::internal("bug").exception_code(), ExceptionCode::SlaveDeviceFailure);
    /// ```
    pub fn exception_code(&self) -> ExceptionCode {
        match self {
            Self::InvalidFunction { .. } => ExceptionCode::IllegalFunction,
            Self::InvalidData { .. }
            | Self::AddressNotMapped { .. }
            | Self::PermissionDenied { .. }
            | Self::Hook { .. } => ExceptionCode::IllegalDataValue,
            _ => ExceptionCode::SlaveDeviceFailure,
        }
    }

    /// Check if the error belongs to transport framing (never answered on the wire)
    pub fn is_framing_error(&self) -> bool {
        matches!(self, Self::Frame { .. } | Self::CrcMismatch { .. })
    }

    /// Check if the error is answered with a Modbus exception reply
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidFunction { .. }
                | Self::InvalidData { .. }
                | Self::AddressNotMapped { .. }
                | Self::PermissionDenied { .. }
                | Self::Hook { .. }
        )
    }

    /// Check if the error is a network/serial issue
    pub fn is_transport_error(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Connection { .. })
    }
}

/// Convert from std::io::Error
impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

/// Convert from serde JSON errors (configuration loading)
impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

/// Convert from serde YAML errors (configuration loading)
impl From<serde_yaml::Error> for ModbusError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("YAML error: {}", err))
    }
}

/// Convert from tokio-serial errors
impl From<tokio_serial::Error> for ModbusError {
    fn from(err: tokio_serial::Error) -> Self {
        Self::connection(err.to_string())
    }
}
