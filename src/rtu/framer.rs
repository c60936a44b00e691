//! Interrupt-side RTU frame recovery.
//!
//! RTU frames carry no length field. A frame starts with the first byte after
//! a silence of at least t3.5 and ends when the line stays silent for t3.5
//! again. A gap longer than t1.5 inside a frame is a framing error.
//!
//! [`RtuFramer`] is driven by two interrupt sources: [`RtuFramer::on_byte`]
//! from UART reception and [`RtuFramer::on_tick`] from a periodic
//! timer-compare interrupt that counts both silence timers down. The
//! accumulation buffer doubles as a single-slot mailbox: once a frame is
//! complete it stays put until the polling side takes it.

use log::debug;

use super::timing::RtuTiming;

/// Maximum RTU envelope size (address + PDU + CRC)
pub const MAX_RTU_FRAME_SIZE: usize = 256;

/// Framer state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramerState {
    /// Line idle, next byte starts a frame
    WaitFirstByte,
    /// Receiving, silence timers running
    Accumulating,
    /// t3.5 elapsed, frame waiting for the polling side
    FrameReady,
}

/// Outcome of one received byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteEvent {
    /// First byte of a new frame
    Started,
    /// Appended to the current frame
    Appended,
    /// Arrived after t1.5; frame dropped
    FramingError,
    /// Frame longer than [`MAX_RTU_FRAME_SIZE`]; frame dropped
    Overflow,
    /// Arrived while a completed frame was unconsumed; both dropped
    Overrun,
}

/// Silence-timed RTU frame assembler
#[derive(Debug)]
pub struct RtuFramer {
    state: FramerState,
    buffer: Vec<u8>,
    t15_reload: u32,
    t35_reload: u32,
    t15_remaining: u32,
    t35_remaining: u32,
}

impl RtuFramer {
    /// Create a framer whose timers count in ticks of `tick_us` microseconds
    pub fn new(timing: RtuTiming, tick_us: u32) -> Self {
        let (t15_reload, t35_reload) = timing.ticks(tick_us);
        Self {
            state: FramerState::WaitFirstByte,
            buffer: Vec::with_capacity(MAX_RTU_FRAME_SIZE),
            t15_reload,
            t35_reload,
            t15_remaining: 0,
            t35_remaining: 0,
        }
    }

    /// Current state
    pub fn state(&self) -> FramerState {
        self.state
    }

    /// t3.5 reload value in ticks
    pub fn t35_ticks(&self) -> u32 {
        self.t35_reload
    }

    /// t1.5 reload value in ticks
    pub fn t15_ticks(&self) -> u32 {
        self.t15_reload
    }

    /// Handle one received byte (UART RX interrupt)
    pub fn on_byte(&mut self, byte: u8) -> ByteEvent {
        match self.state {
            FramerState::WaitFirstByte => {
                self.buffer.clear();
                self.buffer.push(byte);
                self.reload_timers();
                self.state = FramerState::Accumulating;
                ByteEvent::Started
            }
            FramerState::Accumulating => {
                if self.t15_remaining == 0 {
                    debug!("RTU framing error: inter-character gap exceeded t1.5 after {} bytes", self.buffer.len());
                    self.reset();
                    return ByteEvent::FramingError;
                }
                if self.buffer.len() >= MAX_RTU_FRAME_SIZE {
                    debug!("RTU frame exceeds {} bytes, dropped", MAX_RTU_FRAME_SIZE);
                    self.reset();
                    return ByteEvent::Overflow;
                }
                self.buffer.push(byte);
                self.reload_timers();
                ByteEvent::Appended
            }
            FramerState::FrameReady => {
                debug!("RTU overrun: byte received before previous frame was consumed");
                self.reset();
                ByteEvent::Overrun
            }
        }
    }

    /// Count the silence timers down by one tick (timer-compare interrupt)
    ///
    /// Returns `true` on the tick that completes a frame.
    pub fn on_tick(&mut self) -> bool {
        if self.state != FramerState::Accumulating {
            return false;
        }
        self.t15_remaining = self.t15_remaining.saturating_sub(1);
        self.t35_remaining = self.t35_remaining.saturating_sub(1);
        if self.t35_remaining == 0 {
            self.state = FramerState::FrameReady;
            return true;
        }
        false
    }

    /// Hand the completed frame to the polling side and rearm
    pub fn take_frame(&mut self) -> Option<Vec<u8>> {
        if self.state != FramerState::FrameReady {
            return None;
        }
        let frame = std::mem::replace(&mut self.buffer, Vec::with_capacity(MAX_RTU_FRAME_SIZE));
        self.state = FramerState::WaitFirstByte;
        Some(frame)
    }

    /// Drop any partial or pending frame
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.t15_remaining = 0;
        self.t35_remaining = 0;
        self.state = FramerState::WaitFirstByte;
    }

    fn reload_timers(&mut self) {
        self.t15_remaining = self.t15_reload;
        self.t35_remaining = self.t35_reload;
    }
}
