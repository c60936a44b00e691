//! Poll-side RTU port: envelope validation, addressing and reply transmission.
//!
//! An [`RtuPort`] owns the configuration of one serial port and implements the
//! [`Transport`] contract. The state touched from interrupt context lives in a
//! shared [`RtuLine`]: the framer, the turnaround timer and a parked reply.
//! Interrupt handlers (or the async tasks standing in for them) call
//! [`RtuLine::on_byte`] and [`RtuLine::on_timer_tick`]; the polling task only
//! takes completed frames.

use log::{debug, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::framer::{ByteEvent, RtuFramer};
use super::timing::{us_to_ticks, RtuTiming};
use crate::config::RtuPortConfig;
use crate::crc::{crc16, CRC_SEED};
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{SlaveId, BROADCAST_ADDRESS, MAX_RTU_PDU_SIZE};
use crate::transport::{log_packet, ReceivedPdu, Transport, TransportContext, TransportId, TransportStats};

/// Smallest valid envelope: address + function code + CRC
pub const MIN_RTU_FRAME_SIZE: usize = 4;

/// Byte sink of the UART transmitter
pub trait SerialTx: Send {
    /// Start transmitting a complete envelope
    fn transmit(&mut self, frame: &[u8]) -> ModbusResult<()>;
}

#[derive(Default)]
struct LineCounters {
    frames_received: AtomicU64,
    replies_sent: AtomicU64,
    crc_errors: AtomicU64,
    address_mismatches: AtomicU64,
    framing_errors: AtomicU64,
    overruns: AtomicU64,
    broadcasts_suppressed: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

struct LineState {
    framer: RtuFramer,
    turnaround_reload: u32,
    turnaround_remaining: u32,
    pending_reply: Option<Vec<u8>>,
    tx: Box<dyn SerialTx>,
}

impl LineState {
    fn transmit(&mut self, counters: &LineCounters, frame: &[u8]) -> ModbusResult<()> {
        self.tx.transmit(frame)?;
        bump(&counters.replies_sent);
        counters.bytes_sent.fetch_add(frame.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

/// State shared between the interrupt side and the polling side of a port
pub struct RtuLine {
    state: Mutex<LineState>,
    frame_ready: AtomicBool,
    counters: LineCounters,
}

impl RtuLine {
    fn lock(&self) -> ModbusResult<MutexGuard<'_, LineState>> {
        self.state
            .lock()
            .map_err(|_| ModbusError::internal("RTU line state poisoned"))
    }

    /// UART receive interrupt: feed one byte to the framer
    pub fn on_byte(&self, byte: u8) {
        let Ok(mut state) = self.lock() else { return };
        self.counters.bytes_received.fetch_add(1, Ordering::Relaxed);
        match state.framer.on_byte(byte) {
            ByteEvent::Started | ByteEvent::Appended => {}
            ByteEvent::FramingError | ByteEvent::Overflow => bump(&self.counters.framing_errors),
            ByteEvent::Overrun => {
                self.frame_ready.store(false, Ordering::Release);
                bump(&self.counters.overruns);
            }
        }
    }

    /// Timer-compare interrupt: advance silence and turnaround timers one tick
    pub fn on_timer_tick(&self) {
        let Ok(mut state) = self.lock() else { return };
        if state.framer.on_tick() {
            state.turnaround_remaining = state.turnaround_reload;
            self.frame_ready.store(true, Ordering::Release);
        } else if state.turnaround_remaining > 0 {
            state.turnaround_remaining -= 1;
        }

        if state.turnaround_remaining == 0 {
            if let Some(reply) = state.pending_reply.take() {
                if let Err(e) = state.transmit(&self.counters, &reply) {
                    warn!("RTU transmit failed: {}", e);
                }
            }
        }
    }

    fn take_frame(&self) -> Option<Vec<u8>> {
        if !self.frame_ready.swap(false, Ordering::AcqRel) {
            return None;
        }
        self.lock().ok()?.framer.take_frame()
    }
}

/// One RTU serial port running the silence-timed framer
pub struct RtuPort {
    id: TransportId,
    slave_address: SlaveId,
    broadcast_answer: bool,
    line: Arc<RtuLine>,
    packet_logging: bool,
}

impl RtuPort {
    /// Create a port whose timers tick every `tick_us` microseconds
    pub fn new(id: TransportId, config: &RtuPortConfig, tick_us: u32, tx: Box<dyn SerialTx>) -> Self {
        let timing = RtuTiming::new(config.baud_rate, config.frame_bits());
        let framer = RtuFramer::new(timing, tick_us);
        debug!(
            "{}: slave {} at {} baud, t1.5={}us t3.5={}us ({} / {} ticks)",
            id,
            config.slave_address,
            config.baud_rate,
            timing.t15_us,
            timing.t35_us,
            framer.t15_ticks(),
            framer.t35_ticks()
        );
        let turnaround_reload = if config.turnaround_us == 0 {
            0
        } else {
            us_to_ticks(config.turnaround_us, tick_us)
        };
        let line = RtuLine {
            state: Mutex::new(LineState {
                framer,
                turnaround_reload,
                turnaround_remaining: 0,
                pending_reply: None,
                tx,
            }),
            frame_ready: AtomicBool::new(false),
            counters: LineCounters::default(),
        };
        Self {
            id,
            slave_address: config.slave_address,
            broadcast_answer: config.broadcast_answer,
            line: Arc::new(line),
            packet_logging: false,
        }
    }

    /// Enable or disable packet logging
    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    /// Handle for the interrupt side (byte reception and timer ticks)
    pub fn line(&self) -> Arc<RtuLine> {
        Arc::clone(&self.line)
    }

    /// Configured slave address
    pub fn slave_address(&self) -> SlaveId {
        self.slave_address
    }

    /// Check length, CRC and address of a completed envelope
    fn validate(&self, frame: &[u8]) -> ModbusResult<(SlaveId, Vec<u8>)> {
        if frame.len() < MIN_RTU_FRAME_SIZE {
            bump(&self.line.counters.framing_errors);
            return Err(ModbusError::frame(format!("RTU frame too short: {} bytes", frame.len())));
        }
        let address = frame[0];
        let pdu_len = frame.len() - 3;
        let pdu = &frame[1..1 + pdu_len];
        let received = u16::from_le_bytes([frame[frame.len() - 2], frame[frame.len() - 1]]);
        let calculated = crc16(crc16(CRC_SEED, &[address]), pdu);
        if received != calculated {
            bump(&self.line.counters.crc_errors);
            return Err(ModbusError::crc_mismatch(calculated, received));
        }
        if address != BROADCAST_ADDRESS && address != self.slave_address {
            bump(&self.line.counters.address_mismatches);
            return Err(ModbusError::frame(format!("Frame for slave {} ignored", address)));
        }
        Ok((address, pdu.to_vec()))
    }
}

impl Transport for RtuPort {
    fn id(&self) -> TransportId {
        self.id
    }

    fn receive(&mut self) -> Option<ReceivedPdu> {
        let frame = self.line.take_frame()?;
        if self.packet_logging {
            log_packet("receive", &frame, "RTU", None);
        }
        match self.validate(&frame) {
            Ok((address, pdu)) => {
                bump(&self.line.counters.frames_received);
                let context = TransportContext {
                    transport: self.id,
                    unit_id: address,
                    broadcast: address == BROADCAST_ADDRESS,
                    tag: 0,
                };
                Some(ReceivedPdu { pdu, context })
            }
            Err(e) => {
                debug!("{}: frame discarded: {}", self.id, e);
                None
            }
        }
    }

    fn send(&mut self, context: &TransportContext, pdu: &[u8]) -> ModbusResult<()> {
        if context.broadcast && !self.broadcast_answer {
            bump(&self.line.counters.broadcasts_suppressed);
            return Ok(());
        }
        if pdu.is_empty() || pdu.len() > MAX_RTU_PDU_SIZE {
            return Err(ModbusError::frame(format!(
                "Reply PDU of {} bytes does not fit an RTU frame",
                pdu.len()
            )));
        }

        let mut frame = Vec::with_capacity(pdu.len() + 3);
        frame.push(context.unit_id);
        frame.extend_from_slice(pdu);
        let crc = crc16(crc16(CRC_SEED, &[context.unit_id]), pdu);
        frame.extend_from_slice(&crc.to_le_bytes());

        if self.packet_logging {
            log_packet("send", &frame, "RTU", Some(context.unit_id));
        }

        let mut state = self.line.lock()?;
        if state.turnaround_remaining == 0 {
            state.transmit(&self.line.counters, &frame)
        } else {
            // sent by the timer tick once the turnaround delay has elapsed
            state.pending_reply = Some(frame);
            Ok(())
        }
    }

    fn stats(&self) -> TransportStats {
        let c = &self.line.counters;
        TransportStats {
            frames_received: c.frames_received.load(Ordering::Relaxed),
            replies_sent: c.replies_sent.load(Ordering::Relaxed),
            crc_errors: c.crc_errors.load(Ordering::Relaxed),
            address_mismatches: c.address_mismatches.load(Ordering::Relaxed),
            framing_errors: c.framing_errors.load(Ordering::Relaxed),
            overruns: c.overruns.load(Ordering::Relaxed),
            broadcasts_suppressed: c.broadcasts_suppressed.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

/// [`SerialTx`] that records every transmitted envelope, for simulated links
#[derive(Clone, Default)]
pub struct CaptureTx {
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl CaptureTx {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything transmitted so far
    pub fn drain(&self) -> Vec<Vec<u8>> {
        self.frames
            .lock()
            .map(|mut frames| std::mem::take(&mut *frames))
            .unwrap_or_default()
    }
}

impl SerialTx for CaptureTx {
    fn transmit(&mut self, frame: &[u8]) -> ModbusResult<()> {
        self.frames
            .lock()
            .map_err(|_| ModbusError::internal("capture buffer poisoned"))?
            .push(frame.to_vec());
        Ok(())
    }
}
