/// Modbus protocol definitions and request parsing
///
/// This module contains the function and exception codes understood by the
/// engine, the per-function bounds table, and the parsed [`Request`] sum type
/// that the dispatcher routes to handlers.

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ModbusError, ModbusResult};

/// Modbus address type (0-65535)
pub type ModbusAddress = u16;

/// Modbus slave/unit identifier (1-247, 0 = broadcast)
pub type SlaveId = u8;

/// Broadcast slave address
pub const BROADCAST_ADDRESS: SlaveId = 0;

/// Highest assignable slave address
pub const MAX_SLAVE_ADDRESS: SlaveId = 247;

/// Maximum PDU size (function code + payload)
pub const MAX_PDU_SIZE: usize = 256;

/// Largest PDU that fits a 256-byte RTU envelope (address + PDU + CRC)
pub const MAX_RTU_PDU_SIZE: usize = 253;

/// Maximum registers per read or write-multiple request
pub const MAX_REGISTERS_PER_REQUEST: u16 = 120;

/// Maximum coils per read or write-multiple request
pub const MAX_COILS_PER_REQUEST: u16 = 1920;

/// Single-coil wire value for ON
pub const COIL_ON: u16 = 0xFF00;

/// Single-coil wire value for OFF
pub const COIL_OFF: u16 = 0x0000;

/// Exception flag OR-ed into the function code of an exception reply
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Modbus function codes handled by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FunctionCode {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Program Controller (0x0D), carries the memory sub-protocol
    ProgramController = 0x0D,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    /// Convert from u8 to FunctionCode
    pub fn from_u8(value: u8) -> ModbusResult<Self> {
        match value {
            0x01 => Ok(FunctionCode::ReadCoils),
            0x02 => Ok(FunctionCode::ReadDiscreteInputs),
            0x03 => Ok(FunctionCode::ReadHoldingRegisters),
            0x04 => Ok(FunctionCode::ReadInputRegisters),
            0x05 => Ok(FunctionCode::WriteSingleCoil),
            0x06 => Ok(FunctionCode::WriteSingleRegister),
            0x0D => Ok(FunctionCode::ProgramController),
            0x0F => Ok(FunctionCode::WriteMultipleCoils),
            0x10 => Ok(FunctionCode::WriteMultipleRegisters),
            _ => Err(ModbusError::invalid_function(value)),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Human-readable function name
    pub fn name(self) -> &'static str {
        match self {
            FunctionCode::ReadCoils => "Read Coils",
            FunctionCode::ReadDiscreteInputs => "Read Discrete Inputs",
            FunctionCode::ReadHoldingRegisters => "Read Holding Registers",
            FunctionCode::ReadInputRegisters => "Read Input Registers",
            FunctionCode::WriteSingleCoil => "Write Single Coil",
            FunctionCode::WriteSingleRegister => "Write Single Register",
            FunctionCode::ProgramController => "Program Controller",
            FunctionCode::WriteMultipleCoils => "Write Multiple Coils",
            FunctionCode::WriteMultipleRegisters => "Write Multiple Registers",
        }
    }

    /// Check if this function reads registers or bits
    pub fn is_read_function(self) -> bool {
        matches!(
            self,
            FunctionCode::ReadCoils
                | FunctionCode::ReadDiscreteInputs
                | FunctionCode::ReadHoldingRegisters
                | FunctionCode::ReadInputRegisters
        )
    }

    /// Check if this function writes registers or bits
    pub fn is_write_function(self) -> bool {
        matches!(
            self,
            FunctionCode::WriteSingleCoil
                | FunctionCode::WriteSingleRegister
                | FunctionCode::WriteMultipleCoils
                | FunctionCode::WriteMultipleRegisters
        )
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), *self as u8)
    }
}

/// Modbus exception codes emitted by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ExceptionCode {
    Success = 0x00,
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    SlaveDeviceFailure = 0x04,
}

impl ExceptionCode {
    /// Convert from u8 to ExceptionCode
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(ExceptionCode::Success),
            0x01 => Some(ExceptionCode::IllegalFunction),
            0x02 => Some(ExceptionCode::IllegalDataAddress),
            0x03 => Some(ExceptionCode::IllegalDataValue),
            0x04 => Some(ExceptionCode::SlaveDeviceFailure),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Get human-readable description
    pub fn description(self) -> &'static str {
        match self {
            ExceptionCode::Success => "Success",
            ExceptionCode::IllegalFunction => "Illegal Function",
            ExceptionCode::IllegalDataAddress => "Illegal Data Address",
            ExceptionCode::IllegalDataValue => "Illegal Data Value",
            ExceptionCode::SlaveDeviceFailure => "Slave Device Failure",
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Modbus Exception 0x{:02X}: {}", self.to_u8(), self.description())
    }
}

/// Build the exception reply `[fc | 0x80][code]`
pub fn exception_reply(function_code: u8, code: ExceptionCode) -> Vec<u8> {
    vec![function_code | EXCEPTION_FLAG, code.to_u8()]
}

/// A request PDU that passed the function-specific bounds checks
///
/// Addresses are the raw wire values; zero-base adjustment happens at
/// resolution time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request<'a> {
    /// 0x03 / 0x04
    ReadRegisters { function: FunctionCode, address: ModbusAddress, count: u16 },
    /// 0x06
    WriteSingleRegister { address: ModbusAddress, value: u16 },
    /// 0x10, `values` holds `2 * count` wire-order bytes
    WriteMultipleRegisters { address: ModbusAddress, count: u16, values: &'a [u8] },
    /// 0x01 / 0x02
    ReadBits { function: FunctionCode, address: ModbusAddress, count: u16 },
    /// 0x05
    WriteSingleCoil { address: ModbusAddress, value: bool },
    /// 0x0F, `packed` holds `ceil(count / 8)` LSB-first bytes
    WriteMultipleCoils { address: ModbusAddress, count: u16, packed: &'a [u8] },
    /// 0x0D, `command` is the length-delimited sub-protocol payload
    ProgramController { command: &'a [u8] },
}

fn read_u16(pdu: &[u8], offset: usize) -> u16 {
    BigEndian::read_u16(&pdu[offset..offset + 2])
}

fn require_len(pdu: &[u8], len: usize, function: FunctionCode) -> ModbusResult<()> {
    if pdu.len() < len {
        return Err(ModbusError::invalid_data(format!(
            "{} request too short: {} bytes",
            function,
            pdu.len()
        )));
    }
    Ok(())
}

fn check_count(count: u16, max: u16, function: FunctionCode) -> ModbusResult<()> {
    if count == 0 || count > max {
        return Err(ModbusError::invalid_data(format!(
            "{} count {} outside 1-{}",
            function, count, max
        )));
    }
    Ok(())
}

impl<'a> Request<'a> {
    /// Parse a PDU and enforce the per-function bounds
    ///
    /// | Function | Element bound | Byte-count check |
    /// |---|---|---|
    /// | 0x03 / 0x04 | 1–120 | - |
    /// | 0x10 | 1–120 | = 2 × count |
    /// | 0x01 / 0x02 | 1–1920 | - |
    /// | 0x0F | 1–1920 | = ceil(count / 8) |
    /// | 0x05 | - | value ∈ {0x0000, 0xFF00} |
    ///
    /// Unknown codes fail with [`ModbusError::InvalidFunction`]; every other
    /// violation fails with [`ModbusError::InvalidData`].
    pub fn parse(pdu: &'a [u8]) -> ModbusResult<Self> {
        let function_code = *pdu
            .first()
            .ok_or_else(|| ModbusError::frame("Empty PDU"))?;
        let function = FunctionCode::from_u8(function_code)?;

        match function {
            FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
                require_len(pdu, 5, function)?;
                let count = read_u16(pdu, 3);
                check_count(count, MAX_REGISTERS_PER_REQUEST, function)?;
                Ok(Request::ReadRegisters { function, address: read_u16(pdu, 1), count })
            }
            FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
                require_len(pdu, 5, function)?;
                let count = read_u16(pdu, 3);
                check_count(count, MAX_COILS_PER_REQUEST, function)?;
                Ok(Request::ReadBits { function, address: read_u16(pdu, 1), count })
            }
            FunctionCode::WriteSingleRegister => {
                require_len(pdu, 5, function)?;
                Ok(Request::WriteSingleRegister { address: read_u16(pdu, 1), value: read_u16(pdu, 3) })
            }
            FunctionCode::WriteSingleCoil => {
                require_len(pdu, 5, function)?;
                let value = match read_u16(pdu, 3) {
                    COIL_ON => true,
                    COIL_OFF => false,
                    other => {
                        return Err(ModbusError::invalid_data(format!(
                            "Invalid coil value 0x{:04X}",
                            other
                        )))
                    }
                };
                Ok(Request::WriteSingleCoil { address: read_u16(pdu, 1), value })
            }
            FunctionCode::WriteMultipleRegisters => {
                require_len(pdu, 6, function)?;
                let count = read_u16(pdu, 3);
                check_count(count, MAX_REGISTERS_PER_REQUEST, function)?;
                let byte_count = pdu[5] as usize;
                if byte_count != count as usize * 2 {
                    return Err(ModbusError::invalid_data(format!(
                        "Byte count {} does not match {} registers",
                        byte_count, count
                    )));
                }
                require_len(pdu, 6 + byte_count, function)?;
                Ok(Request::WriteMultipleRegisters {
                    address: read_u16(pdu, 1),
                    count,
                    values: &pdu[6..6 + byte_count],
                })
            }
            FunctionCode::WriteMultipleCoils => {
                require_len(pdu, 6, function)?;
                let count = read_u16(pdu, 3);
                check_count(count, MAX_COILS_PER_REQUEST, function)?;
                let byte_count = pdu[5] as usize;
                if byte_count != (count as usize + 7) / 8 {
                    return Err(ModbusError::invalid_data(format!(
                        "Byte count {} does not match {} coils",
                        byte_count, count
                    )));
                }
                require_len(pdu, 6 + byte_count, function)?;
                Ok(Request::WriteMultipleCoils {
                    address: read_u16(pdu, 1),
                    count,
                    packed: &pdu[6..6 + byte_count],
                })
            }
            FunctionCode::ProgramController => {
                require_len(pdu, 3, function)?;
                let length = read_u16(pdu, 1) as usize;
                if length == 0 || pdu.len() != 3 + length {
                    return Err(ModbusError::invalid_data(format!(
                        "Program command length {} does not match payload of {} bytes",
                        length,
                        pdu.len() - 3
                    )));
                }
                Ok(Request::ProgramController { command: &pdu[3..] })
            }
        }
    }

    /// Function code of the request
    pub fn function(&self) -> FunctionCode {
        match self {
            Request::ReadRegisters { function, .. } | Request::ReadBits { function, .. } => *function,
            Request::WriteSingleRegister { .. } => FunctionCode::WriteSingleRegister,
            Request::WriteMultipleRegisters { .. } => FunctionCode::WriteMultipleRegisters,
            Request::WriteSingleCoil { .. } => FunctionCode::WriteSingleCoil,
            Request::WriteMultipleCoils { .. } => FunctionCode::WriteMultipleCoils,
            Request::ProgramController { .. } => FunctionCode::ProgramController,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_pdu(function: u8, address: u16, count: u16) -> Vec<u8> {
        let mut pdu = vec![function];
        pdu.extend_from_slice(&address.to_be_bytes());
        pdu.extend_from_slice(&count.to_be_bytes());
        pdu
    }

    #[test]
    fn test_function_conversion() {
        assert_eq!(FunctionCode::from_u8(0x03).unwrap(), FunctionCode::ReadHoldingRegisters);
        assert_eq!(FunctionCode::ProgramController.to_u8(), 0x0D);
        assert!(matches!(
            FunctionCode::from_u8(0x2B),
            Err(ModbusError::InvalidFunction { code: 0x2B })
        ));
    }

    #[test]
    fn test_register_count_bounds() {
        assert!(Request::parse(&read_pdu(0x03, 0, 0)).is_err());
        assert!(Request::parse(&read_pdu(0x03, 0, 121)).is_err());
        assert!(Request::parse(&read_pdu(0x04, 0, 1)).is_ok());
        assert_eq!(
            Request::parse(&read_pdu(0x03, 10, 120)).unwrap(),
            Request::ReadRegisters { function: FunctionCode::ReadHoldingRegisters, address: 10, count: 120 }
        );
    }

    #[test]
    fn test_coil_count_bounds() {
        assert!(Request::parse(&read_pdu(0x01, 0, 0)).is_err());
        assert!(Request::parse(&read_pdu(0x02, 0, 1921)).is_err());
        assert!(Request::parse(&read_pdu(0x01, 0, 1920)).is_ok());
    }

    #[test]
    fn test_write_multiple_registers_byte_count() {
        let good = vec![0x10, 0x00, 0x05, 0x00, 0x02, 0x04, 0x00, 0x01, 0x00, 0x02];
        match Request::parse(&good).unwrap() {
            Request::WriteMultipleRegisters { address, count, values } => {
                assert_eq!(address, 5);
                assert_eq!(count, 2);
                assert_eq!(values, &[0x00, 0x01, 0x00, 0x02]);
            }
            other => panic!("unexpected request {:?}", other),
        }

        let bad = vec![0x10, 0x00, 0x05, 0x00, 0x02, 0x03, 0x00, 0x01, 0x00];
        let err = Request::parse(&bad).unwrap_err();
        assert_eq!(err.exception_code(), ExceptionCode::IllegalDataValue);
    }

    #[test]
    fn test_write_multiple_coils_byte_count() {
        let good = vec![0x0F, 0x00, 0x00, 0x00, 0x0A, 0x02, 0xFF, 0x03];
        assert!(Request::parse(&good).is_ok());
        let bad = vec![0x0F, 0x00, 0x00, 0x00, 0x0A, 0x01, 0xFF];
        assert!(Request::parse(&bad).is_err());
    }

    #[test]
    fn test_single_coil_values() {
        assert_eq!(
            Request::parse(&[0x05, 0x00, 0x07, 0xFF, 0x00]).unwrap(),
            Request::WriteSingleCoil { address: 7, value: true }
        );
        assert_eq!(
            Request::parse(&[0x05, 0x00, 0x07, 0x00, 0x00]).unwrap(),
            Request::WriteSingleCoil { address: 7, value: false }
        );
        assert!(Request::parse(&[0x05, 0x00, 0x07, 0x00, 0x01]).is_err());
    }

    #[test]
    fn test_program_controller_length() {
        assert_eq!(
            Request::parse(&[0x0D, 0x00, 0x01, 0x00]).unwrap(),
            Request::ProgramController { command: &[0x00] }
        );
        assert!(Request::parse(&[0x0D, 0x00, 0x02, 0x00]).is_err());
        assert!(Request::parse(&[0x0D, 0x00, 0x00]).is_err());
    }

    #[test]
    fn test_exception_reply() {
        assert_eq!(exception_reply(0x41, ExceptionCode::IllegalFunction), vec![0xC1, 0x01]);
    }
}
