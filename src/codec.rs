//! Byte-order, sign-extension and bit-packing conversions.
//!
//! Parameter storage is in host byte order; Modbus registers travel
//! big-endian, with the high register first when a value spans two registers.
//! Coils travel packed LSB-first, eight per byte.

use byteorder::{BigEndian, ByteOrder, NativeEndian};

use crate::error::{ModbusError, ModbusResult};

/// Convert host-order 16-bit registers to wire order, in place
pub fn registers_to_wire(buf: &mut [u8]) {
    for chunk in buf.chunks_exact_mut(2) {
        let value = NativeEndian::read_u16(chunk);
        BigEndian::write_u16(chunk, value);
    }
}

/// Convert wire-order 16-bit registers to host order, in place
pub fn registers_to_host(buf: &mut [u8]) {
    for chunk in buf.chunks_exact_mut(2) {
        let value = BigEndian::read_u16(chunk);
        NativeEndian::write_u16(chunk, value);
    }
}

/// Widen a 1, 2 or 4 byte host-order value to 32 bits
pub fn extend(raw: &[u8], signed: bool) -> ModbusResult<u32> {
    if !matches!(raw.len(), 1 | 2 | 4) {
        return Err(ModbusError::internal(format!("Unsupported element size {}", raw.len())));
    }
    Ok(if signed {
        NativeEndian::read_int(raw, raw.len()) as u32
    } else {
        NativeEndian::read_uint(raw, raw.len()) as u32
    })
}

/// Encode an element as one or two wire registers
///
/// A single register carries the low 16 bits. Two registers carry the full
/// 32-bit value of a 4-byte element, or the widened value of a narrower one so
/// that the upper register holds its sign or zero extension.
///
/// # Examples
///
/// ```rust
/// use servo_modbus::codec::entry_to_registers;
///
/// let raw = (-1i16).to_ne_bytes();
/// assert_eq!(entry_to_registers(&raw, true, 1).unwrap(), vec![0xFF, 0xFF]);
/// assert_eq!(entry_to_registers(&raw, true, 2).unwrap(), vec![0xFF, 0xFF, 0xFF, 0xFF]);
/// assert_eq!(entry_to_registers(&raw, false, 2).unwrap(), vec![0x00, 0x00, 0xFF, 0xFF]);
/// ```
pub fn entry_to_registers(raw: &[u8], signed: bool, count: u16) -> ModbusResult<Vec<u8>> {
    let value = extend(raw, signed)?;
    match count {
        1 => Ok((value as u16).to_be_bytes().to_vec()),
        2 => Ok(value.to_be_bytes().to_vec()),
        _ => Err(ModbusError::invalid_data(format!(
            "Plain parameters span at most 2 registers, {} requested",
            count
        ))),
    }
}

/// Decode one or two wire registers into an element of `size` bytes
///
/// A single register written to a signed element is sign-extended before it
/// is narrowed or widened to the element size.
pub fn registers_to_entry(wire: &[u8], size: usize, signed: bool) -> ModbusResult<Vec<u8>> {
    let value: u32 = match wire.len() {
        2 if signed => BigEndian::read_i16(wire) as i32 as u32,
        2 => u32::from(BigEndian::read_u16(wire)),
        4 => BigEndian::read_u32(wire),
        n => {
            return Err(ModbusError::invalid_data(format!(
                "Plain parameters span at most 2 registers, {} bytes written",
                n
            )))
        }
    };
    let mut raw = vec![0u8; size];
    match size {
        1 => raw[0] = value as u8,
        2 => NativeEndian::write_u16(&mut raw, value as u16),
        4 => NativeEndian::write_u32(&mut raw, value),
        _ => return Err(ModbusError::internal(format!("Unsupported element size {}", size))),
    }
    Ok(raw)
}

/// Pack `count` bits of `storage` starting at `bit_offset` into LSB-first bytes
///
/// Each output byte is cut from a window of up to four storage bytes shifted
/// to the requested bit alignment. Bits past `count` in the last byte are
/// cleared.
pub fn pack_bits(storage: &[u8], bit_offset: usize, count: usize) -> Vec<u8> {
    let byte_count = (count + 7) / 8;
    let mut packed = Vec::with_capacity(byte_count);
    for i in 0..byte_count {
        let position = bit_offset + i * 8;
        let start = position / 8;
        let end = (start + 4).min(storage.len());
        let mut window = [0u8; 4];
        if start < end {
            window[..end - start].copy_from_slice(&storage[start..end]);
        }
        let bits = u32::from_le_bytes(window) >> (position % 8);
        packed.push(bits as u8);
    }
    let tail = count % 8;
    if tail != 0 {
        if let Some(last) = packed.last_mut() {
            *last &= (1u8 << tail) - 1;
        }
    }
    packed
}

/// Bit `index` of an LSB-first packed buffer
pub fn packed_bit(packed: &[u8], index: usize) -> bool {
    packed
        .get(index / 8)
        .map(|byte| byte & (1 << (index % 8)) != 0)
        .unwrap_or(false)
}
