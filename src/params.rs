//! # Parameter Database Contract
//!
//! The drive keeps its parameters in a typed database owned by the
//! motor-control firmware. The protocol engine only needs a narrow view of it:
//! a [`ParameterDescriptor`] per bound parameter (size, count, type, flags,
//! signedness, optional hook) and byte-offset read/write primitives exposed by
//! [`ParameterDatabase`].
//!
//! Parameters that are not plain memory (computed values, alarm or warning
//! lists, streamed buffers) implement [`ParameterHook`] instead. A hook is
//! driven through a three-phase transaction for every read or write call:
//!
//! 1. `init` announces the direction, the element and the byte budget
//! 2. `segment` transfers the bytes, in host register order
//! 3. `end` closes the transaction
//!
//! The transaction lives only for the duration of one call. A failing phase
//! stops the sequence; no later phase is invoked.
//!
//! ## Example
//!
//! ```rust
//! use servo_modbus::params::{
//!     MemoryParameterDatabase, ParamType, ParameterDatabase, ParameterDescriptor,
//! };
//!
//! let speed = ParameterDescriptor::new(100, "speed_limit", ParamType::Word, 1)
//!     .signed()
//!     .writable();
//!
//! let mut db = MemoryParameterDatabase::new();
//! db.add(&speed);
//! db.write_bytes(100, 0, &(-250i16).to_ne_bytes()).unwrap();
//!
//! let mut raw = [0u8; 2];
//! db.read_bytes(100, 0, &mut raw).unwrap();
//! assert_eq!(i16::from_ne_bytes(raw), -250);
//! ```

use byteorder::{ByteOrder, NativeEndian};
use std::collections::HashMap;
use std::fmt;
use std::ops::BitOr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::error::{ModbusError, ModbusResult};

/// Parameter identifier inside the drive database
pub type ParamId = u16;

/// Storage type tag of a parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Byte,
    Word,
    DoubleWord,
    /// Bit field stored in bytes, addressable as coils
    BitByte,
    /// Bit field stored in 16-bit words
    BitWord,
    /// Bit field stored in 32-bit double words
    BitDouble,
    /// Variable content produced by a hook, 16-bit elements
    Stream,
}

impl ParamType {
    /// Size in bytes of one element
    pub fn element_size(self) -> usize {
        match self {
            ParamType::Byte | ParamType::BitByte => 1,
            ParamType::Word | ParamType::BitWord | ParamType::Stream => 2,
            ParamType::DoubleWord | ParamType::BitDouble => 4,
        }
    }

    /// Check if the parameter is a bit field
    pub fn is_bit_field(self) -> bool {
        matches!(self, ParamType::BitByte | ParamType::BitWord | ParamType::BitDouble)
    }
}

/// Parameter flag set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParamFlags(u8);

impl ParamFlags {
    pub const NONE: ParamFlags = ParamFlags(0);
    /// Value is produced by a [`ParameterHook`]
    pub const HOOK: ParamFlags = ParamFlags(0x01);
    /// Masters may write the value
    pub const WRITABLE: ParamFlags = ParamFlags(0x02);
    /// Database checks the value before committing a write
    pub const VALIDATED: ParamFlags = ParamFlags(0x04);

    /// Check if every flag in `other` is set
    pub fn contains(self, other: ParamFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw flag bits
    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for ParamFlags {
    type Output = ParamFlags;

    fn bitor(self, rhs: ParamFlags) -> ParamFlags {
        ParamFlags(self.0 | rhs.0)
    }
}

/// Direction of a hook transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookDirection {
    Read,
    Write,
}

/// State threaded through the three phases of one hook transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookSession {
    pub direction: HookDirection,
    /// Element of the parameter the request starts at
    pub element: usize,
    /// Number of bytes the segment phase transfers
    pub byte_len: usize,
    /// Opaque value the hook may set during `init` and use later
    pub cookie: u64,
}

impl HookSession {
    pub fn new(direction: HookDirection, element: usize, byte_len: usize) -> Self {
        Self { direction, element, byte_len, cookie: 0 }
    }
}

/// Data transferred by the segment phase
pub enum HookSegment<'a> {
    /// Buffer the hook fills with `byte_len` bytes of host-order registers
    Read(&'a mut [u8]),
    /// Host-order registers written by the master
    Write(&'a [u8]),
}

/// Capability interface of a hook-backed parameter
///
/// Errors returned by any phase are reported to the master as Illegal Data
/// Value; the transaction is not retried.
pub trait ParameterHook: Send + Sync {
    /// Announce direction and byte budget; may reject the transaction
    fn init(&self, session: &mut HookSession) -> ModbusResult<()>;

    /// Transfer the data
    fn segment(&self, session: &mut HookSession, data: HookSegment<'_>) -> ModbusResult<()>;

    /// Close the transaction
    fn end(&self, session: &mut HookSession) -> ModbusResult<()>;
}

/// Description of one bound parameter, consumed read-only by the codec
#[derive(Clone)]
pub struct ParameterDescriptor {
    pub id: ParamId,
    pub name: &'static str,
    pub param_type: ParamType,
    /// Bytes per element: 1, 2 or 4
    pub element_size: usize,
    pub element_count: usize,
    pub flags: ParamFlags,
    /// Writes are refused while any of these system status bits is set
    pub write_deny_mask: u32,
    pub signed: bool,
    pub hook: Option<Arc<dyn ParameterHook>>,
}

impl ParameterDescriptor {
    /// Read-only, unsigned parameter of `element_count` elements
    pub fn new(id: ParamId, name: &'static str, param_type: ParamType, element_count: usize) -> Self {
        Self {
            id,
            name,
            param_type,
            element_size: param_type.element_size(),
            element_count,
            flags: ParamFlags::NONE,
            write_deny_mask: 0,
            signed: false,
            hook: None,
        }
    }

    pub fn signed(mut self) -> Self {
        self.signed = true;
        self
    }

    pub fn writable(mut self) -> Self {
        self.flags = self.flags | ParamFlags::WRITABLE;
        self
    }

    pub fn validated(mut self) -> Self {
        self.flags = self.flags | ParamFlags::VALIDATED;
        self
    }

    /// Refuse writes while any bit of `mask` is set in the system status
    pub fn deny_writes_when(mut self, mask: u32) -> Self {
        self.write_deny_mask = mask;
        self
    }

    /// Back the parameter with a hook instead of database memory
    pub fn with_hook(mut self, hook: Arc<dyn ParameterHook>) -> Self {
        self.flags = self.flags | ParamFlags::HOOK;
        self.hook = Some(hook);
        self
    }

    pub fn is_hook(&self) -> bool {
        self.flags.contains(ParamFlags::HOOK)
    }

    pub fn is_writable(&self) -> bool {
        self.flags.contains(ParamFlags::WRITABLE)
    }

    /// Total storage size in bytes
    pub fn byte_len(&self) -> usize {
        self.element_size * self.element_count
    }

    /// Check that a write is allowed under the current system status
    pub fn check_writable(&self, system_status: u32) -> ModbusResult<()> {
        if !self.is_writable() {
            return Err(ModbusError::permission_denied(format!("{} is read-only", self.name)));
        }
        if self.write_deny_mask & system_status != 0 {
            return Err(ModbusError::permission_denied(format!(
                "{} locked by system status 0x{:08X}",
                self.name, system_status
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for ParameterDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("param_type", &self.param_type)
            .field("element_size", &self.element_size)
            .field("element_count", &self.element_count)
            .field("flags", &self.flags)
            .field("write_deny_mask", &self.write_deny_mask)
            .field("signed", &self.signed)
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

/// Byte-offset access to the drive parameter database
///
/// Offsets are relative to the start of the parameter storage; data is in
/// host byte order.
pub trait ParameterDatabase: Send + Sync {
    fn read_bytes(&self, id: ParamId, offset: usize, buf: &mut [u8]) -> ModbusResult<()>;

    fn write_bytes(&self, id: ParamId, offset: usize, data: &[u8]) -> ModbusResult<()>;

    /// Set or clear one bit with an atomic read-modify-write of its byte
    fn update_bit(&self, id: ParamId, byte_offset: usize, bit: u8, value: bool) -> ModbusResult<()>;

    /// Check a value before it is committed; called for validated parameters
    fn validate(&self, _id: ParamId, _offset: usize, _data: &[u8]) -> ModbusResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    min: i64,
    max: i64,
    signed: bool,
}

/// In-memory parameter database
///
/// Every parameter is a slice of atomic bytes, so bit updates from different
/// writers of the same byte never lose each other's changes.
#[derive(Default)]
pub struct MemoryParameterDatabase {
    storage: HashMap<ParamId, Vec<AtomicU8>>,
    limits: HashMap<ParamId, Limits>,
}

impl MemoryParameterDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate zeroed storage for a parameter
    pub fn add(&mut self, descriptor: &ParameterDescriptor) {
        let bytes = (0..descriptor.byte_len()).map(|_| AtomicU8::new(0)).collect();
        self.storage.insert(descriptor.id, bytes);
    }

    /// Restrict validated writes of a parameter to `min..=max`
    pub fn set_limits(&mut self, descriptor: &ParameterDescriptor, min: i64, max: i64) {
        self.limits.insert(descriptor.id, Limits { min, max, signed: descriptor.signed });
    }

    /// Number of parameters with storage
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    fn slot(&self, id: ParamId, offset: usize, len: usize) -> ModbusResult<&[AtomicU8]> {
        let bytes = self
            .storage
            .get(&id)
            .ok_or_else(|| ModbusError::internal(format!("Parameter {} has no storage", id)))?;
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| {
                ModbusError::invalid_data(format!(
                    "Access {}+{} beyond parameter {} ({} bytes)",
                    offset,
                    len,
                    id,
                    bytes.len()
                ))
            })?;
        Ok(&bytes[offset..end])
    }
}

impl ParameterDatabase for MemoryParameterDatabase {
    fn read_bytes(&self, id: ParamId, offset: usize, buf: &mut [u8]) -> ModbusResult<()> {
        let slot = self.slot(id, offset, buf.len())?;
        for (dst, src) in buf.iter_mut().zip(slot) {
            *dst = src.load(Ordering::Acquire);
        }
        Ok(())
    }

    fn write_bytes(&self, id: ParamId, offset: usize, data: &[u8]) -> ModbusResult<()> {
        let slot = self.slot(id, offset, data.len())?;
        for (dst, &src) in slot.iter().zip(data) {
            dst.store(src, Ordering::Release);
        }
        Ok(())
    }

    fn update_bit(&self, id: ParamId, byte_offset: usize, bit: u8, value: bool) -> ModbusResult<()> {
        if bit >= 8 {
            return Err(ModbusError::internal(format!("Bit {} outside a byte", bit)));
        }
        let slot = self.slot(id, byte_offset, 1)?;
        let mask = 1u8 << bit;
        if value {
            slot[0].fetch_or(mask, Ordering::AcqRel);
        } else {
            slot[0].fetch_and(!mask, Ordering::AcqRel);
        }
        Ok(())
    }

    fn validate(&self, id: ParamId, _offset: usize, data: &[u8]) -> ModbusResult<()> {
        let Some(limits) = self.limits.get(&id) else {
            return Ok(());
        };
        if data.is_empty() || data.len() > 8 {
            return Ok(());
        }
        let value = if limits.signed {
            NativeEndian::read_int(data, data.len())
        } else {
            NativeEndian::read_uint(data, data.len()) as i64
        };
        if value < limits.min || value > limits.max {
            return Err(ModbusError::invalid_data(format!(
                "Value {} for parameter {} outside {}..={}",
                value, id, limits.min, limits.max
            )));
        }
        Ok(())
    }
}
