//! Simulated servo drive answering Modbus masters
//!
//! Serves a small demo parameter table on every transport the configuration
//! enables: the RTU serial ports and, on boards that have one, Modbus TCP.
//! Function 0x0D reaches a simulated RAM/flash layout.
//!
//! Usage: `drive_sim [config.yaml]`

use byteorder::{ByteOrder, NativeEndian};
use log::{error, info, warn};
use std::sync::{Arc, Mutex};
use tokio::signal;
use tokio::sync::broadcast;

use servo_modbus::memory::FlashBank;
use servo_modbus::params::{HookDirection, HookSegment, HookSession};
use servo_modbus::runtime::STATUS_MOVING;
use servo_modbus::{
    BindingEntry, BindingTable, CallbackLogger, EngineConfig, MemoryParameterDatabase, MemoryRegion,
    MemoryService, ModbusEngine, ModbusError, ModbusResult, ParamType, ParameterDatabase, ParameterDescriptor,
    ParameterHook, RegionTable, SerialLink, SimulatedDrive, SimulatedMemory, TcpPeer, TransportId,
};

const ALARM_CAPACITY: usize = 16;

const RAM_BASE: u32 = 0x2000_0000;
const RAM_SIZE: u32 = 0x1000;
const FLASH_BASE: u32 = 0x0800_0000;
const FLASH_SIZE: u32 = 0x4000;
const SECTOR_SIZE: u32 = 0x400;

/// Active alarm codes, served read-only through the hook capability
#[derive(Default)]
struct AlarmList {
    alarms: Mutex<Vec<u16>>,
}

impl AlarmList {
    fn raise(&self, code: u16) {
        if let Ok(mut alarms) = self.alarms.lock() {
            if alarms.len() < ALARM_CAPACITY && !alarms.contains(&code) {
                alarms.push(code);
            }
        }
    }
}

impl ParameterHook for AlarmList {
    fn init(&self, session: &mut HookSession) -> ModbusResult<()> {
        if session.direction == HookDirection::Write {
            return Err(ModbusError::permission_denied("alarm list is read-only"));
        }
        if session.element + session.byte_len / 2 > ALARM_CAPACITY {
            return Err(ModbusError::invalid_data("read beyond the alarm list"));
        }
        Ok(())
    }

    fn segment(&self, session: &mut HookSession, data: HookSegment<'_>) -> ModbusResult<()> {
        let HookSegment::Read(buf) = data else {
            return Err(ModbusError::permission_denied("alarm list is read-only"));
        };
        let alarms = self
            .alarms
            .lock()
            .map_err(|_| ModbusError::internal("alarm list poisoned"))?;
        for (i, slot) in buf.chunks_exact_mut(2).enumerate() {
            let code = alarms.get(session.element + i).copied().unwrap_or(0);
            NativeEndian::write_u16(slot, code);
        }
        Ok(())
    }

    fn end(&self, _session: &mut HookSession) -> ModbusResult<()> {
        Ok(())
    }
}

struct DemoDrive {
    registers: BindingTable,
    coils: BindingTable,
    database: MemoryParameterDatabase,
    alarms: Arc<AlarmList>,
}

/// Register map of the demo drive (1-based addresses, as shown on the HMI)
fn demo_drive() -> DemoDrive {
    let alarms = Arc::new(AlarmList::default());

    let speed_reference = ParameterDescriptor::new(1, "speed_reference", ParamType::Word, 1)
        .signed()
        .writable()
        .validated();
    let torque_limit = ParameterDescriptor::new(2, "torque_limit", ParamType::Word, 1)
        .writable()
        .deny_writes_when(STATUS_MOVING);
    let position = ParameterDescriptor::new(3, "position", ParamType::DoubleWord, 1).signed().writable();
    let bus_voltage = ParameterDescriptor::new(4, "bus_voltage", ParamType::Word, 1);
    let alarm_list = ParameterDescriptor::new(5, "alarm_list", ParamType::Stream, ALARM_CAPACITY)
        .with_hook(alarms.clone());
    let digital_outputs = ParameterDescriptor::new(6, "digital_outputs", ParamType::BitWord, 1).writable();
    let digital_inputs = ParameterDescriptor::new(7, "digital_inputs", ParamType::BitByte, 1);

    let mut database = MemoryParameterDatabase::new();
    for descriptor in [
        &speed_reference,
        &torque_limit,
        &position,
        &bus_voltage,
        &digital_outputs,
        &digital_inputs,
    ] {
        database.add(descriptor);
    }
    database.set_limits(&speed_reference, -6000, 6000);

    let registers = BindingTable::registers(vec![
        BindingEntry::new(18081, speed_reference),
        BindingEntry::new(18082, torque_limit),
        BindingEntry::new(18083, position),
        BindingEntry::new(18084, bus_voltage),
        BindingEntry::new(18200, alarm_list),
    ]);
    let coils = BindingTable::coils(vec![
        BindingEntry::new(1, digital_outputs),
        BindingEntry::new(17, digital_inputs),
    ]);

    DemoDrive { registers, coils, database, alarms }
}

fn memory_service() -> MemoryService {
    let memory = Arc::new(
        SimulatedMemory::new(SECTOR_SIZE)
            .with_segment(RAM_BASE, RAM_SIZE as usize, 0x00)
            .with_segment(FLASH_BASE, FLASH_SIZE as usize, 0xFF),
    );
    let regions = RegionTable::new(vec![
        MemoryRegion::ram("ram", RAM_BASE, RAM_SIZE),
        MemoryRegion::flash("application", FLASH_BASE, FLASH_SIZE, FlashBank::OnChip),
    ]);
    MemoryService::new(regions, memory.clone(), memory)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let subscriber = tracing_subscriber::fmt().with_target(false).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match std::env::args().nth(1) {
        Some(path) => {
            info!("Loading configuration from {}", path);
            EngineConfig::from_file(&path)?
        }
        None => {
            info!("No configuration file given, using defaults");
            EngineConfig::default()
        }
    };
    config.validate()?;

    info!("{}", servo_modbus::info());
    info!("=============================");

    let drive = demo_drive();
    let runtime = Arc::new(SimulatedDrive::new());
    // 48.0 V in 0.1 V units
    drive.database.write_bytes(4, 0, &480u16.to_ne_bytes())?;
    drive.alarms.raise(0x7301);

    let mut engine = ModbusEngine::new(
        &config,
        drive.registers,
        drive.coils,
        Arc::new(drive.database),
        runtime,
    )
    .with_memory_service(memory_service());
    engine.set_logger(CallbackLogger::console());

    let mut links = Vec::new();
    for (index, port_config) in config.rtu_ports.iter().enumerate() {
        let Some(id) = TransportId::rtu(index) else { break };
        if !port_config.enabled {
            continue;
        }
        match SerialLink::open(id, port_config, config.tick_period_us, config.packet_logging) {
            Ok((port, link)) => {
                engine.attach_transport(Box::new(port));
                links.push(link);
            }
            Err(e) => warn!("{} not available: {}", id, e),
        }
    }

    if let Some(tcp) = config.tcp.as_ref().filter(|tcp| tcp.enabled) {
        match TcpPeer::bind(tcp, config.packet_logging).await {
            Ok(peer) => {
                engine.attach_transport(Box::new(peer));
            }
            Err(e) => error!("Modbus TCP not available: {}", e),
        }
    }

    info!("📋 Register map:");
    info!("  18081: speed reference (rpm, signed, -6000..6000)");
    info!("  18082: torque limit (locked while moving)");
    info!("  18083: position (32-bit signed, read as 2 registers)");
    info!("  18084: bus voltage (0.1 V, read-only)");
    info!("  18200-18215: active alarm list");
    info!("  coils 1-16: digital outputs, 17-24: digital inputs");
    info!("Press Ctrl+C to stop");

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("🛑 Received Ctrl+C, shutting down..."),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
        let _ = shutdown_tx.send(());
    });

    engine.run(config.poll_period(), shutdown_rx).await;

    let stats = engine.stats();
    info!("📊 Final Statistics:");
    info!("  Requests: {}", stats.requests);
    info!("  Replies: {}", stats.replies);
    info!("  Exceptions: {}", stats.exceptions);
    info!("  Memory commands: {}", stats.memory_commands);
    info!("  Send errors: {}", stats.send_errors);
    for id in [TransportId::RTU0, TransportId::RTU1, TransportId::ETHERNET] {
        if let Some(t) = engine.transport_stats(id) {
            info!(
                "  {}: {} frames in, {} replies, {} CRC errors, {} overruns",
                id, t.frames_received, t.replies_sent, t.crc_errors, t.overruns
            );
        }
    }

    drop(links);
    info!("✅ Drive simulator stopped");
    Ok(())
}
