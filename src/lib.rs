//! # Servo Modbus - Modbus Slave Protocol Engine for Servo Drives
//!
//! This crate lets an external master (SCADA tool, commissioning application
//! or another controller) read and write a servo drive's parameters over
//! several simultaneous transports using the Modbus application protocol.
//!
//! ## Features
//!
//! - **RTU Framing**: frame boundaries recovered from t1.5 / t3.5 silence
//!   intervals, CRC16 validation, broadcast handling and RX-to-TX turnaround
//! - **Multiple Transports**: two RTU serial ports, Modbus TCP, and any
//!   packet link (CAN, USB) through the same receive/send PDU contract
//! - **Parameter Binding**: register and coil addresses resolved onto a sorted
//!   table of heterogeneous parameters, with runtime overrides
//! - **Hook Parameters**: computed values (alarm lists, live data) served
//!   through a three-phase INIT / SEGMENT / END transaction
//! - **Firmware Provisioning**: memory and flash sub-protocol inside function
//!   0x0D, interlocked with the motor-control runtime
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Bound |
//! |------|----------|-------|
//! | 0x01 | Read Coils | 1-1920 |
//! | 0x02 | Read Discrete Inputs | 1-1920 |
//! | 0x03 | Read Holding Registers | 1-120 |
//! | 0x04 | Read Input Registers | 1-120 |
//! | 0x05 | Write Single Coil | 0x0000 / 0xFF00 |
//! | 0x06 | Write Single Register | 1 |
//! | 0x0D | Program Controller | memory sub-protocol |
//! | 0x0F | Write Multiple Coils | 1-1920 |
//! | 0x10 | Write Multiple Registers | 1-120 |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use servo_modbus::{
//!     BindingEntry, BindingTable, EngineConfig, MemoryParameterDatabase, ModbusEngine,
//!     ParamType, ParameterDescriptor, SerialLink, SimulatedDrive, TransportId,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::from_file("drive.yaml")?;
//!
//!     let speed = ParameterDescriptor::new(1, "speed", ParamType::Word, 1).signed().writable();
//!     let mut db = MemoryParameterDatabase::new();
//!     db.add(&speed);
//!
//!     let mut engine = ModbusEngine::new(
//!         &config,
//!         BindingTable::registers(vec![BindingEntry::new(18081, speed)]),
//!         BindingTable::coils(Vec::new()),
//!         Arc::new(db),
//!         Arc::new(SimulatedDrive::new()),
//!     );
//!
//!     let (port, _link) = SerialLink::open(
//!         TransportId::RTU0,
//!         &config.rtu_ports[0],
//!         config.tick_period_us,
//!         config.packet_logging,
//!     )?;
//!     engine.attach_transport(Box::new(port));
//!
//!     let (_shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
//!     engine.run(Duration::from_millis(1), shutdown_rx).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐ ┌──────────┐ ┌──────────┐ ┌──────────┐
//! │ RTU port │ │ RTU port │ │ TCP peer │ │ CAN/USB  │
//! └──────────┘ └──────────┘ └──────────┘ └──────────┘
//!       └────────────┴─────┬──────┴────────────┘
//!                 ┌─────────────────┐
//!                 │  ModbusEngine   │  poll / dispatch
//!                 └─────────────────┘
//!                  │               │
//!        ┌──────────────────┐ ┌──────────────────┐
//!        │ Binding + Codec  │ │  MemoryService   │
//!        └──────────────────┘ └──────────────────┘
//!                  │               │
//!        ┌──────────────────┐ ┌──────────────────┐
//!        │ParameterDatabase │ │ Flash / Runtime  │
//!        └──────────────────┘ └──────────────────┘
//! ```

/// Core error types and result handling
pub mod error;

/// Table-driven Modbus CRC16
pub mod crc;

/// Function codes, exception codes and request parsing
pub mod protocol;

/// Receive/send PDU contract shared by every transport
pub mod transport;

/// RTU serial framing
pub mod rtu;

/// Modbus TCP peer
pub mod tcp;

/// Parameter database contract and hook capability
pub mod params;

/// Register and coil address resolution
pub mod binding;

/// Byte-order, sign and bit-packing conversions
pub mod codec;

/// Register and coil request handlers
pub mod handlers;

/// Motor-control runtime contract
pub mod runtime;

/// Memory/flash sub-protocol of function 0x0D
pub mod memory;

/// Protocol engine and dispatcher
pub mod engine;

/// Engine configuration
pub mod config;

/// Callback-based request/reply logging
pub mod logging;

// Re-export main types for convenience
pub use binding::{AddressSpace, BindingEntry, BindingTable};
pub use config::{EngineConfig, Parity, RtuPortConfig, TcpPeerConfig};
pub use engine::{EngineStats, ModbusEngine};
pub use error::{HookPhase, ModbusError, ModbusResult};
pub use logging::{CallbackLogger, LogCallback, LogLevel, LoggingMode};
pub use memory::{MemoryRegion, MemoryService, RegionTable, SimulatedMemory};
pub use params::{
    MemoryParameterDatabase, ParamFlags, ParamType, ParameterDatabase, ParameterDescriptor, ParameterHook,
};
pub use protocol::{ExceptionCode, FunctionCode, Request};
pub use rtu::{RtuPort, SerialLink};
pub use runtime::{DriveRuntime, SimulatedDrive};
pub use tcp::TcpPeer;
pub use transport::{ChannelTransport, Transport, TransportContext, TransportId, TransportStats};

/// Maximum Modbus PDU size
pub const MAX_PDU_SIZE: usize = protocol::MAX_PDU_SIZE;

/// Largest PDU carried by one RTU frame
pub const MAX_RTU_PDU_SIZE: usize = protocol::MAX_RTU_PDU_SIZE;

/// Maximum Modbus RTU frame size
pub const MAX_RTU_FRAME_SIZE: usize = rtu::MAX_RTU_FRAME_SIZE;

/// Maximum Modbus TCP frame size (MBAP header + PDU)
pub const MAX_TCP_FRAME_SIZE: usize = tcp::MAX_TCP_FRAME_SIZE;

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Servo Modbus v{} - Modbus slave protocol engine for servo drives", VERSION)
}
