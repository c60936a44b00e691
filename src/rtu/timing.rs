//! Silence-interval constants for RTU framing.
//!
//! At or below 19200 baud the inter-character (t1.5) and inter-frame (t3.5)
//! timeouts scale with the character time. Above it the Modbus serial line
//! recommendation fixes them at 750 µs and 1750 µs.

/// Highest baud rate whose timeouts are derived from the character time
pub const TIMING_SCALE_LIMIT_BAUD: u32 = 19_200;

/// Fixed inter-character timeout above [`TIMING_SCALE_LIMIT_BAUD`]
pub const FIXED_T15_US: u32 = 750;

/// Fixed inter-frame timeout above [`TIMING_SCALE_LIMIT_BAUD`]
pub const FIXED_T35_US: u32 = 1_750;

/// Inter-character and inter-frame timeouts of one serial port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtuTiming {
    /// t1.5 in microseconds
    pub t15_us: u32,
    /// t3.5 in microseconds
    pub t35_us: u32,
}

impl RtuTiming {
    /// Derive the timeouts for a baud rate and character frame size
    ///
    /// `frame_bits` is the full character: start bit, 8 data bits, optional
    /// parity bit and the stop bits.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use servo_modbus::rtu::RtuTiming;
    ///
    /// let slow = RtuTiming::new(9600, 11);
    /// assert_eq!((slow.t15_us, slow.t35_us), (1719, 4011));
    ///
    /// let fast = RtuTiming::new(115_200, 11);
    /// assert_eq!((fast.t15_us, fast.t35_us), (750, 1750));
    /// ```
    pub fn new(baud_rate: u32, frame_bits: u32) -> Self {
        if baud_rate > TIMING_SCALE_LIMIT_BAUD {
            return Self { t15_us: FIXED_T15_US, t35_us: FIXED_T35_US };
        }
        let baud = u64::from(baud_rate.max(1));
        // bit time × frame bits × (15 | 35) / 10, rounded up
        let scaled = |tenths: u64| -> u32 {
            let numerator = 1_000_000u64 * u64::from(frame_bits) * tenths;
            let denominator = baud * 10;
            ((numerator + denominator - 1) / denominator) as u32
        };
        Self { t15_us: scaled(15), t35_us: scaled(35) }
    }

    /// Timer reload values for a periodic tick of `tick_us` microseconds
    ///
    /// Returns `(t1.5 ticks, t3.5 ticks)`, each rounded up and at least one.
    pub fn ticks(&self, tick_us: u32) -> (u32, u32) {
        (us_to_ticks(self.t15_us, tick_us), us_to_ticks(self.t35_us, tick_us))
    }
}

/// Convert a duration in microseconds to whole timer ticks, rounding up
pub fn us_to_ticks(us: u32, tick_us: u32) -> u32 {
    let tick = tick_us.max(1);
    ((us + tick - 1) / tick).max(1)
}
