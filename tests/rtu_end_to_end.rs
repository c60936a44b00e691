//! RTU framing through the whole engine: bytes in through the interrupt-side
//! line, replies out through the captured transmitter.

mod common;

use std::sync::Arc;

use common::*;
use servo_modbus::crc::checksum;
use servo_modbus::memory::{MemoryCommand, MemoryOpcode, MemoryStatus, MAX_READ_SIZE};
use servo_modbus::rtu::{CaptureTx, RtuLine, RtuPort, RtuTiming, MAX_RTU_FRAME_SIZE};
use servo_modbus::{
    EngineConfig, MemoryRegion, MemoryService, ModbusEngine, ParameterDatabase, RegionTable, RtuPortConfig,
    SimulatedMemory, Transport, TransportId,
};

const TICK_US: u32 = 50;

fn port_config() -> RtuPortConfig {
    RtuPortConfig { slave_address: 1, ..Default::default() }
}

fn ticks(config: &RtuPortConfig) -> (u32, u32) {
    RtuTiming::new(config.baud_rate, config.frame_bits()).ticks(TICK_US)
}

struct Rig {
    engine: ModbusEngine,
    drive: Drive,
    line: Arc<RtuLine>,
    capture: CaptureTx,
    t35: u32,
}

fn rig(port: RtuPortConfig) -> Rig {
    init_logging();
    let (engine, drive) = engine(&EngineConfig::default());
    rig_with(engine, drive, port)
}

fn rig_with(mut engine: ModbusEngine, drive: Drive, config: RtuPortConfig) -> Rig {
    let capture = CaptureTx::new();
    let port = RtuPort::new(TransportId::RTU0, &config, TICK_US, Box::new(capture.clone()));
    let line = port.line();
    assert!(engine.attach_transport(Box::new(port)));
    let (_, t35) = ticks(&config);
    Rig { engine, drive, line, capture, t35 }
}

impl Rig {
    fn feed(&self, frame: &[u8]) {
        for &byte in frame {
            self.line.on_byte(byte);
        }
    }

    fn tick(&self, n: u32) {
        for _ in 0..n {
            self.line.on_timer_tick();
        }
    }

    /// Feed a frame, let t3.5 elapse and poll once
    fn exchange(&mut self, frame: &[u8]) -> Vec<Vec<u8>> {
        self.feed(frame);
        self.tick(self.t35);
        self.engine.poll();
        self.capture.drain()
    }

    fn stats(&self) -> servo_modbus::TransportStats {
        self.engine.transport_stats(TransportId::RTU0).unwrap()
    }
}

#[test]
fn test_read_holding_register_after_silence() {
    let mut rig = rig(port_config());
    rig.drive
        .database
        .write_bytes(1, 0, &(-1234i16).to_ne_bytes())
        .unwrap();

    // classic addressing: wire 18081 is binding index 18082
    rig.feed(&rtu_frame(1, &read_holding(18081, 1)));
    rig.tick(rig.t35 - 1);
    assert_eq!(rig.engine.poll(), 0);
    assert!(rig.capture.drain().is_empty());

    rig.tick(1);
    assert_eq!(rig.engine.poll(), 1);
    let replies = rig.capture.drain();
    assert_eq!(replies.len(), 1);

    let reply = &replies[0];
    let [hi, lo] = (-1234i16 as u16).to_be_bytes();
    assert_eq!(&reply[..5], &[0x01, 0x03, 0x02, hi, lo]);
    assert_eq!(reply[5..], checksum(&reply[..5]).to_le_bytes());
}

#[test]
fn test_single_bit_flips_are_rejected() {
    let mut rig = rig(port_config());
    let frame = rtu_frame(1, &read_holding(18081, 1));
    assert_eq!(rig.exchange(&frame).len(), 1);

    for byte in 0..frame.len() {
        for bit in 0..8 {
            let mut corrupted = frame.clone();
            corrupted[byte] ^= 1 << bit;
            assert!(
                rig.exchange(&corrupted).is_empty(),
                "flip of bit {} in byte {} was accepted",
                bit,
                byte
            );
        }
    }
    assert_eq!(rig.stats().frames_received, 1);
    assert_eq!(rig.stats().crc_errors, (frame.len() * 8) as u64);
}

#[test]
fn test_short_frames_and_other_slaves_are_ignored() {
    let mut rig = rig(port_config());
    assert!(rig.exchange(&[0x01, 0x03, 0x00]).is_empty());
    assert!(rig.exchange(&rtu_frame(7, &read_holding(18081, 1))).is_empty());

    let stats = rig.stats();
    assert_eq!(stats.framing_errors, 1);
    assert_eq!(stats.address_mismatches, 1);
    assert_eq!(rig.engine.stats().requests, 0);
}

#[test]
fn test_broadcast_without_answer_executes_silently() {
    let mut rig = rig(port_config());
    assert!(rig.exchange(&rtu_frame(0, &write_single(18081, 0x0102))).is_empty());
    assert_eq!(rig.stats().broadcasts_suppressed, 1);

    let reply = rig.exchange(&rtu_frame(1, &read_holding(18081, 1)));
    assert_eq!(&reply[0][..5], &[0x01, 0x03, 0x02, 0x01, 0x02]);
}

#[test]
fn test_broadcast_answer_is_addressed_zero() {
    let mut rig = rig(RtuPortConfig { broadcast_answer: true, ..port_config() });
    let replies = rig.exchange(&rtu_frame(0, &read_holding(18081, 1)));
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0][0], 0x00);
    assert_eq!(replies[0][1], 0x03);
}

#[test]
fn test_overrun_drops_pending_frame() {
    let mut rig = rig(port_config());
    rig.feed(&rtu_frame(1, &read_holding(18081, 1)));
    rig.tick(rig.t35);
    // next master byte arrives before the poll consumed the frame
    rig.feed(&[0x01]);
    rig.tick(rig.t35);

    assert_eq!(rig.engine.poll(), 0);
    assert!(rig.capture.drain().is_empty());
    assert_eq!(rig.stats().overruns, 1);

    // line recovers on the next clean frame
    assert_eq!(rig.exchange(&rtu_frame(1, &read_holding(18081, 1))).len(), 1);
}

#[test]
fn test_gap_longer_than_t15_breaks_frame() {
    let config = port_config();
    let (t15, _) = ticks(&config);
    let mut rig = rig(config);
    let frame = rtu_frame(1, &read_holding(18081, 1));

    rig.feed(&frame[..3]);
    rig.tick(t15);
    assert!(rig.exchange(&frame[3..]).is_empty());
    assert!(rig.stats().framing_errors >= 1);
    assert_eq!(rig.stats().frames_received, 0);
}

#[test]
fn test_turnaround_delay_holds_reply() {
    let config = RtuPortConfig { turnaround_us: 1_000, ..port_config() };
    let turnaround = servo_modbus::rtu::timing::us_to_ticks(1_000, TICK_US);
    let mut rig = rig(config);

    assert!(rig.exchange(&rtu_frame(1, &read_holding(18081, 1))).is_empty());
    rig.tick(turnaround - 1);
    assert!(rig.capture.drain().is_empty());
    rig.tick(1);
    assert_eq!(rig.capture.drain().len(), 1);
}

#[test]
fn test_exception_reply_framing() {
    let mut rig = rig(port_config());
    let replies = rig.exchange(&rtu_frame(1, &[0x2B, 0x0E, 0x01, 0x00]));
    assert_eq!(&replies[0][..3], &[0x01, 0xAB, 0x01]);
    assert_eq!(replies[0][3..], checksum(&replies[0][..3]).to_le_bytes());
}

#[test]
fn test_two_ports_answer_independently() {
    init_logging();
    let config = EngineConfig {
        rtu_ports: vec![port_config(), RtuPortConfig { slave_address: 2, ..port_config() }],
        ..Default::default()
    };
    let (engine, drive) = engine(&config);
    let mut rig = rig_with(engine, drive, port_config());

    let capture1 = CaptureTx::new();
    let port1 = RtuPort::new(TransportId::RTU1, &config.rtu_ports[1], TICK_US, Box::new(capture1.clone()));
    let line1 = port1.line();
    assert_eq!(port1.id(), TransportId::RTU1);
    assert!(rig.engine.attach_transport(Box::new(port1)));

    for &byte in &rtu_frame(2, &read_holding(18081, 1)) {
        line1.on_byte(byte);
    }
    for _ in 0..rig.t35 {
        line1.on_timer_tick();
    }
    assert_eq!(rig.engine.poll(), 1);
    assert!(rig.capture.drain().is_empty());
    let replies = capture1.drain();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0][0], 2);
}

#[test]
fn test_largest_memory_read_fits_one_frame() {
    init_logging();
    const RAM: u32 = 0x2000_0000;
    let memory = Arc::new(SimulatedMemory::new(0x400).with_segment(RAM, 0x400, 0x5A));
    let service = MemoryService::new(
        RegionTable::new(vec![MemoryRegion::ram("ram", RAM, 0x400)]),
        memory.clone(),
        memory,
    );
    let (engine, drive) = engine(&EngineConfig::default());
    let mut rig = rig_with(engine.with_memory_service(service), drive, port_config());

    let read = |length: u16| {
        let command = MemoryCommand { opcode: MemoryOpcode::ReadMemory, address: RAM, length, data: &[] }.encode();
        let mut pdu = vec![0x0D];
        pdu.extend_from_slice(&(command.len() as u16).to_be_bytes());
        pdu.extend_from_slice(&command);
        rtu_frame(1, &pdu)
    };

    let replies = rig.exchange(&read(MAX_READ_SIZE as u16));
    assert_eq!(MAX_READ_SIZE, 249);
    assert_eq!(replies.len(), 1);
    let reply = &replies[0];
    assert_eq!(reply.len(), MAX_RTU_FRAME_SIZE);
    assert_eq!(reply[1], 0x0D);
    assert_eq!(reply[4], MemoryStatus::Ready as u8);
    assert!(reply[5..5 + MAX_READ_SIZE].iter().all(|&b| b == 0x5A));
    assert_eq!(reply[reply.len() - 2..], checksum(&reply[..reply.len() - 2]).to_le_bytes());

    let replies = rig.exchange(&read(MAX_READ_SIZE as u16 + 1));
    assert_eq!(replies.len(), 1);
    assert_eq!(&replies[0][1..5], &[0x0D, 0x00, 0x01, MemoryStatus::Error as u8]);
    assert_eq!(rig.engine.stats().send_errors, 0);
}
