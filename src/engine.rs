//! # Protocol Engine
//!
//! [`ModbusEngine`] owns everything the protocol layer needs at runtime: the
//! attached transports and their enable mask, the register and coil binding
//! tables, the parameter database, the motor-control runtime and the optional
//! memory sub-protocol service. There is no module-level state; every
//! operation goes through the engine.
//!
//! Each call to [`ModbusEngine::poll`] visits every enabled transport once.
//! A received PDU is parsed, bounds-checked and handled, and the success or
//! exception reply goes back through the transport the request arrived on.
//!
//! ## Usage Example
//!
//! ```rust
//! use std::sync::Arc;
//! use servo_modbus::binding::{BindingEntry, BindingTable};
//! use servo_modbus::config::EngineConfig;
//! use servo_modbus::engine::ModbusEngine;
//! use servo_modbus::params::{MemoryParameterDatabase, ParamType, ParameterDescriptor};
//! use servo_modbus::runtime::SimulatedDrive;
//! use servo_modbus::transport::{ChannelTransport, TransportId};
//!
//! let speed = ParameterDescriptor::new(1, "speed", ParamType::Word, 1).writable();
//! let mut db = MemoryParameterDatabase::new();
//! db.add(&speed);
//!
//! let mut config = EngineConfig::default();
//! config.zero_base_address = true;
//! let mut engine = ModbusEngine::new(
//!     &config,
//!     BindingTable::registers(vec![BindingEntry::new(10, speed)]),
//!     BindingTable::coils(Vec::new()),
//!     Arc::new(db),
//!     Arc::new(SimulatedDrive::new()),
//! );
//! engine.enable_transports(TransportId::USB.bit());
//!
//! let (usb, mut master) = ChannelTransport::pair(TransportId::USB);
//! assert!(engine.attach_transport(Box::new(usb)));
//!
//! master.send_request(vec![0x06, 0x00, 0x0A, 0x01, 0xF4]).unwrap();
//! engine.poll();
//! assert_eq!(master.try_recv_reply().unwrap().1, vec![0x06, 0x00, 0x0A, 0x01, 0xF4]);
//! ```

use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use crate::binding::{BindingEntry, BindingTable};
use crate::config::EngineConfig;
use crate::error::{ModbusError, ModbusResult};
use crate::handlers::RequestHandler;
use crate::logging::CallbackLogger;
use crate::memory::MemoryService;
use crate::params::ParameterDatabase;
use crate::protocol::{exception_reply, FunctionCode, Request};
use crate::runtime::DriveRuntime;
use crate::transport::{Transport, TransportId, TransportStats};

/// Dispatcher counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub requests: u64,
    pub replies: u64,
    pub exceptions: u64,
    pub memory_commands: u64,
    pub send_errors: u64,
}

/// Owned protocol engine context
pub struct ModbusEngine {
    transports: Vec<Box<dyn Transport>>,
    enable_mask: u8,
    hardware_revision: u8,
    zero_base: bool,
    registers: BindingTable,
    coils: BindingTable,
    database: Arc<dyn ParameterDatabase>,
    runtime: Arc<dyn DriveRuntime>,
    memory: Option<MemoryService>,
    logger: CallbackLogger,
    stats: EngineStats,
}

impl ModbusEngine {
    /// Create an engine with the transport mask and addressing of `config`
    pub fn new(
        config: &EngineConfig,
        registers: BindingTable,
        coils: BindingTable,
        database: Arc<dyn ParameterDatabase>,
        runtime: Arc<dyn DriveRuntime>,
    ) -> Self {
        let enable_mask = config.enable_mask();
        info!(
            "Modbus engine: hardware revision {}, enable mask 0x{:02X}, zero-base {}",
            config.hardware_revision, enable_mask, config.zero_base_address
        );
        Self {
            transports: Vec::new(),
            enable_mask,
            hardware_revision: config.hardware_revision,
            zero_base: config.zero_base_address,
            registers,
            coils,
            database,
            runtime,
            memory: None,
            logger: CallbackLogger::disabled(),
            stats: EngineStats::default(),
        }
    }

    /// Serve function 0x0D through `service`
    pub fn with_memory_service(mut self, service: MemoryService) -> Self {
        self.memory = Some(service);
        self
    }

    /// Report every request and reply to `logger`
    pub fn set_logger(&mut self, logger: CallbackLogger) {
        self.logger = logger;
    }

    /// Enable additional transports by mask bit
    pub fn enable_transports(&mut self, mask: u8) {
        self.enable_mask |= mask;
    }

    /// Disable transports by mask bit
    pub fn disable_transports(&mut self, mask: u8) {
        self.enable_mask &= !mask;
    }

    pub fn enable_mask(&self) -> u8 {
        self.enable_mask
    }

    /// Check if a transport is enabled
    pub fn is_enabled(&self, id: TransportId) -> bool {
        self.enable_mask & id.bit() != 0
    }

    /// Attach a transport
    ///
    /// Returns `false` and drops the transport if it is disabled in the mask
    /// or the board revision is older than the transport requires.
    pub fn attach_transport(&mut self, transport: Box<dyn Transport>) -> bool {
        let id = transport.id();
        if transport.min_hardware_revision() > self.hardware_revision {
            warn!(
                "{} requires hardware revision {}, board is {}; disabled",
                id,
                transport.min_hardware_revision(),
                self.hardware_revision
            );
            self.disable_transports(id.bit());
            return false;
        }
        if !self.is_enabled(id) {
            info!("{} is disabled by configuration", id);
            return false;
        }
        if self.transports.iter().any(|t| t.id() == id) {
            warn!("{} attached twice; keeping the first", id);
            return false;
        }
        info!("{} attached", id);
        self.transports.push(transport);
        true
    }

    /// Counters of an attached transport
    pub fn transport_stats(&self, id: TransportId) -> Option<TransportStats> {
        self.transports.iter().find(|t| t.id() == id).map(|t| t.stats())
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.clone()
    }

    /// Bind a parameter over the fixed register table at runtime
    pub fn register_override(&mut self, entry: BindingEntry) -> ModbusResult<()> {
        self.registers.add_override(entry)
    }

    /// Bind a parameter over the fixed coil table at runtime
    pub fn coil_override(&mut self, entry: BindingEntry) -> ModbusResult<()> {
        self.coils.add_override(entry)
    }

    /// Remove every runtime binding
    pub fn clear_overrides(&mut self) {
        self.registers.clear_overrides();
        self.coils.clear_overrides();
    }

    /// Visit every enabled transport once; returns the number of requests served
    pub fn poll(&mut self) -> usize {
        let mut served = 0;
        for index in 0..self.transports.len() {
            let id = self.transports[index].id();
            if !self.is_enabled(id) {
                continue;
            }
            let Some(received) = self.transports[index].receive() else {
                continue;
            };
            served += 1;
            self.logger.log_request(id, received.context.unit_id, &received.pdu);

            let Some(reply) = self.process_pdu(&received.pdu) else {
                continue;
            };
            self.logger.log_response(id, received.context.unit_id, &reply);
            match self.transports[index].send(&received.context, &reply) {
                Ok(()) => self.stats.replies += 1,
                Err(e) => {
                    self.stats.send_errors += 1;
                    warn!("{}: reply not sent: {}", id, e);
                }
            }
        }
        served
    }

    /// Handle one request PDU and build the reply PDU
    ///
    /// Returns `None` only for an empty PDU, which no transport delivers.
    pub fn process_pdu(&mut self, pdu: &[u8]) -> Option<Vec<u8>> {
        let function_code = *pdu.first()?;
        self.stats.requests += 1;
        match self.execute(pdu) {
            Ok(reply) => Some(reply),
            Err(e) => {
                self.stats.exceptions += 1;
                debug!("Request 0x{:02X} answered with exception: {}", function_code, e);
                Some(exception_reply(function_code, e.exception_code()))
            }
        }
    }

    fn execute(&mut self, pdu: &[u8]) -> ModbusResult<Vec<u8>> {
        let request = Request::parse(pdu)?;
        if let Request::ProgramController { command } = request {
            return self.program_controller(command);
        }
        let handler = RequestHandler {
            registers: &self.registers,
            coils: &self.coils,
            database: self.database.as_ref(),
            system_status: self.runtime.system_status(),
            zero_base: self.zero_base,
        };
        handler.handle(&request)
    }

    /// `[0x0D][len:2][status][data]`
    fn program_controller(&mut self, command: &[u8]) -> ModbusResult<Vec<u8>> {
        let memory = self
            .memory
            .as_mut()
            .ok_or_else(|| ModbusError::invalid_function(FunctionCode::ProgramController.to_u8()))?;
        self.stats.memory_commands += 1;
        let answer = memory.execute(command, self.runtime.as_ref());
        let mut reply = Vec::with_capacity(3 + answer.len());
        reply.push(FunctionCode::ProgramController.to_u8());
        reply.extend_from_slice(&(answer.len() as u16).to_be_bytes());
        reply.extend_from_slice(&answer);
        Ok(reply)
    }

    /// Poll once per `period` until `shutdown` fires
    pub async fn run(&mut self, period: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Modbus engine running, polling every {:?}", period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.poll();
                }
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, Modbus engine stopped");
                    break;
                }
            }
        }
    }
}
