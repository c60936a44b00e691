//! Shared fixtures for the integration tests: a small drive parameter table,
//! a recording hook and helpers for building engines and RTU frames.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use servo_modbus::crc::checksum;
use servo_modbus::error::HookPhase;
use servo_modbus::params::{HookSegment, HookSession};
use servo_modbus::runtime::STATUS_MOVING;
use servo_modbus::{
    BindingEntry, BindingTable, EngineConfig, MemoryParameterDatabase, ModbusEngine, ModbusError, ModbusResult,
    ParamType, ParameterDescriptor, ParameterHook, SimulatedDrive,
};

/// Binding index of the signed speed reference (1 register)
pub const SPEED: u32 = 18082;
/// Binding index of the signed 32-bit position (read as 2 registers)
pub const POSITION: u32 = 18083;
/// Validated parameter limited to 0..=1000
pub const CURRENT_LIMIT: u32 = 18100;
/// Writable only while the motor is standing still
pub const TORQUE_LIMIT: u32 = 18101;
/// Read-only bus voltage
pub const BUS_VOLTAGE: u32 = 18102;
/// Hook-backed stream of 120 registers
pub const ALARM_LIST: u32 = 20000;
/// 32 writable coils
pub const OUTPUTS: u32 = 0;
/// 8 read-only coils
pub const INPUTS: u32 = 100;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Hook that records the phases it sees and can be told to fail in one
#[derive(Default)]
pub struct RecordingHook {
    pub phases: Mutex<Vec<HookPhase>>,
    pub fail_at: Mutex<Option<HookPhase>>,
}

impl RecordingHook {
    pub fn phases(&self) -> Vec<HookPhase> {
        self.phases.lock().unwrap().clone()
    }

    pub fn fail_at(&self, phase: Option<HookPhase>) {
        *self.fail_at.lock().unwrap() = phase;
    }

    pub fn reset(&self) {
        self.phases.lock().unwrap().clear();
    }

    fn enter(&self, phase: HookPhase) -> ModbusResult<()> {
        self.phases.lock().unwrap().push(phase);
        if *self.fail_at.lock().unwrap() == Some(phase) {
            return Err(ModbusError::hook(phase, "injected failure"));
        }
        Ok(())
    }
}

impl ParameterHook for RecordingHook {
    fn init(&self, _session: &mut HookSession) -> ModbusResult<()> {
        self.enter(HookPhase::Init)
    }

    fn segment(&self, session: &mut HookSession, data: HookSegment<'_>) -> ModbusResult<()> {
        self.enter(HookPhase::Segment)?;
        if let HookSegment::Read(buf) = data {
            // register i of the list holds its own element number
            for (i, slot) in buf.chunks_exact_mut(2).enumerate() {
                slot.copy_from_slice(&((session.element + i) as u16).to_ne_bytes());
            }
        }
        Ok(())
    }

    fn end(&self, _session: &mut HookSession) -> ModbusResult<()> {
        self.enter(HookPhase::End)
    }
}

pub struct Drive {
    pub registers: BindingTable,
    pub coils: BindingTable,
    pub database: Arc<MemoryParameterDatabase>,
    pub runtime: Arc<SimulatedDrive>,
    pub hook: Arc<RecordingHook>,
}

/// Parameter table shared by all integration tests
pub fn drive() -> Drive {
    let hook = Arc::new(RecordingHook::default());

    let speed = ParameterDescriptor::new(1, "speed", ParamType::Word, 1).signed().writable();
    let position = ParameterDescriptor::new(2, "position", ParamType::DoubleWord, 1).signed().writable();
    let current_limit = ParameterDescriptor::new(3, "current_limit", ParamType::Word, 1)
        .writable()
        .validated();
    let torque_limit = ParameterDescriptor::new(4, "torque_limit", ParamType::Word, 1)
        .writable()
        .deny_writes_when(STATUS_MOVING);
    let bus_voltage = ParameterDescriptor::new(5, "bus_voltage", ParamType::Word, 1);
    let alarm_list = ParameterDescriptor::new(6, "alarm_list", ParamType::Stream, 120).with_hook(hook.clone());
    let outputs = ParameterDescriptor::new(10, "outputs", ParamType::BitDouble, 1).writable();
    let inputs = ParameterDescriptor::new(11, "inputs", ParamType::BitByte, 1);

    let mut database = MemoryParameterDatabase::new();
    for descriptor in [&speed, &position, &current_limit, &torque_limit, &bus_voltage, &outputs, &inputs] {
        database.add(descriptor);
    }
    database.set_limits(&current_limit, 0, 1000);

    let registers = BindingTable::registers(vec![
        BindingEntry::new(SPEED, speed),
        BindingEntry::new(POSITION, position),
        BindingEntry::new(CURRENT_LIMIT, current_limit),
        BindingEntry::new(TORQUE_LIMIT, torque_limit),
        BindingEntry::new(BUS_VOLTAGE, bus_voltage),
        BindingEntry::new(ALARM_LIST, alarm_list),
    ]);
    let coils = BindingTable::coils(vec![BindingEntry::new(OUTPUTS, outputs), BindingEntry::new(INPUTS, inputs)]);

    Drive {
        registers,
        coils,
        database: Arc::new(database),
        runtime: Arc::new(SimulatedDrive::new()),
        hook,
    }
}

/// Engine over the shared table; also returns the pieces tests inspect
pub fn engine(config: &EngineConfig) -> (ModbusEngine, Drive) {
    let drive = drive();
    let engine = ModbusEngine::new(
        config,
        drive.registers.clone(),
        drive.coils.clone(),
        drive.database.clone(),
        drive.runtime.clone(),
    );
    (engine, drive)
}

/// Engine using wire addresses unchanged
pub fn native_engine() -> (ModbusEngine, Drive) {
    let config = EngineConfig { zero_base_address: true, ..Default::default() };
    engine(&config)
}

/// `[address][pdu][crc lo][crc hi]`
pub fn rtu_frame(address: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = vec![address];
    frame.extend_from_slice(pdu);
    let crc = checksum(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

pub fn read_holding(address: u16, count: u16) -> Vec<u8> {
    let mut pdu = vec![0x03];
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&count.to_be_bytes());
    pdu
}

pub fn read_coils(address: u16, count: u16) -> Vec<u8> {
    let mut pdu = vec![0x01];
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&count.to_be_bytes());
    pdu
}

pub fn write_single(address: u16, value: u16) -> Vec<u8> {
    let mut pdu = vec![0x06];
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&value.to_be_bytes());
    pdu
}

pub fn write_coil(address: u16, on: bool) -> Vec<u8> {
    let mut pdu = vec![0x05];
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&(if on { 0xFF00u16 } else { 0x0000 }).to_be_bytes());
    pdu
}

pub fn write_coils(address: u16, count: u16, packed: &[u8]) -> Vec<u8> {
    let mut pdu = vec![0x0F];
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&count.to_be_bytes());
    pdu.push(packed.len() as u8);
    pdu.extend_from_slice(packed);
    pdu
}
