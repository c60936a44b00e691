//! Table-driven Modbus CRC16 (reflected polynomial 0xA001).
//!
//! The checksum state is kept as two bytes, each updated from its own
//! 256-entry table, so the running value returned by [`crc16`] can be fed back
//! as the seed of the next call. The RTU framer relies on this to checksum the
//! address byte first and then continue over the PDU.

/// Initial value for a fresh Modbus checksum
pub const CRC_SEED: u16 = 0xFFFF;

const POLY: u16 = 0xA001;

const fn crc_of_byte(byte: u8) -> u16 {
    let mut crc = byte as u16;
    let mut bit = 0;
    while bit < 8 {
        crc = if crc & 0x0001 != 0 { (crc >> 1) ^ POLY } else { crc >> 1 };
        bit += 1;
    }
    crc
}

const fn build_table(high: bool) -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let crc = crc_of_byte(i as u8);
        table[i] = if high { (crc >> 8) as u8 } else { crc as u8 };
        i += 1;
    }
    table
}

/// Low-byte contribution per table index
static CRC_TABLE_LO: [u8; 256] = build_table(false);

/// High-byte contribution per table index
static CRC_TABLE_HI: [u8; 256] = build_table(true);

/// Continue a Modbus CRC16 from `seed` over `bytes`.
///
/// `crc16(crc16(seed, a), b) == crc16(seed, a ‖ b)` for every split. The result
/// is transmitted little-endian (low byte first).
///
/// # Examples
///
/// ```rust
/// use servo_modbus::crc::{crc16, CRC_SEED};
///
/// let frame = [0x01, 0x03, 0x00, 0x00, 0x00, 0x02];
/// assert_eq!(crc16(CRC_SEED, &frame).to_le_bytes(), [0xC4, 0x0B]);
/// assert_eq!(crc16(crc16(CRC_SEED, &frame[..1]), &frame[1..]), crc16(CRC_SEED, &frame));
/// ```
pub fn crc16(seed: u16, bytes: &[u8]) -> u16 {
    let mut lo = seed as u8;
    let mut hi = (seed >> 8) as u8;
    for &byte in bytes {
        let index = (lo ^ byte) as usize;
        lo = hi ^ CRC_TABLE_LO[index];
        hi = CRC_TABLE_HI[index];
    }
    u16::from(hi) << 8 | u16::from(lo)
}

/// Checksum of a complete buffer starting from [`CRC_SEED`]
pub fn checksum(bytes: &[u8]) -> u16 {
    crc16(CRC_SEED, bytes)
}
