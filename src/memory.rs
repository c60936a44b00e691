//! # Memory/Flash Sub-Protocol
//!
//! Function 0x0D (Program Controller) carries a second, low-level protocol
//! used for firmware provisioning: raw memory reads and writes, flash erase
//! and program, and a streamed image write with explicit start/data/commit
//! steps.
//!
//! ## Wire Format
//!
//! The dispatcher strips the outer `[0x0D][len:2]` header and passes the
//! command:
//!
//! ```text
//! [opcode:1][address:4 BE][length:2 BE][data...]
//! ```
//!
//! | Opcode | Command | Gate |
//! |---|---|---|
//! | 0x00 | Synchronize | none |
//! | 0x01 | ReadMemory | region readable |
//! | 0x02 | WriteMemory | region writable |
//! | 0x03 | EraseFlash | region erasable, reload lock |
//! | 0x04 | WriteFlash | region erasable, reload lock |
//! | 0x05 | StartStream | region erasable, reload lock held until EndStream |
//! | 0x06 | WriteStream | active stream, next expected address |
//! | 0x07 | EndStream | active stream, all announced bytes written |
//!
//! The answer is one status byte ([`MemoryStatus`]) followed, for
//! ReadMemory, by the bytes read. Every failure answers
//! [`MemoryStatus::Error`]; the reason is only logged.
//!
//! Regions with a key id receive encrypted data: flash writes must be whole
//! 16-byte blocks, each decrypted through the [`BlockCipher`] before it is
//! programmed.

use byteorder::{BigEndian, ByteOrder};
use log::{debug, info, warn};
use std::sync::{Arc, Mutex};

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::MAX_RTU_PDU_SIZE;
use crate::runtime::{DriveRuntime, ReloadGuard};

/// Command header size: opcode + address + length
pub const COMMAND_HEADER_SIZE: usize = 7;

/// Cipher block size of encrypted regions
pub const CIPHER_BLOCK_SIZE: usize = 16;

/// Largest ReadMemory payload whose reply `[0x0D][len:2][status][data]`
/// still fits an RTU envelope
pub const MAX_READ_SIZE: usize = MAX_RTU_PDU_SIZE - 4;

/// Sub-protocol opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MemoryOpcode {
    Synchronize = 0x00,
    ReadMemory = 0x01,
    WriteMemory = 0x02,
    EraseFlash = 0x03,
    WriteFlash = 0x04,
    StartStream = 0x05,
    WriteStream = 0x06,
    EndStream = 0x07,
}

impl MemoryOpcode {
    pub fn from_u8(value: u8) -> ModbusResult<Self> {
        match value {
            0x00 => Ok(MemoryOpcode::Synchronize),
            0x01 => Ok(MemoryOpcode::ReadMemory),
            0x02 => Ok(MemoryOpcode::WriteMemory),
            0x03 => Ok(MemoryOpcode::EraseFlash),
            0x04 => Ok(MemoryOpcode::WriteFlash),
            0x05 => Ok(MemoryOpcode::StartStream),
            0x06 => Ok(MemoryOpcode::WriteStream),
            0x07 => Ok(MemoryOpcode::EndStream),
            other => Err(ModbusError::invalid_data(format!("Unknown memory opcode 0x{:02X}", other))),
        }
    }
}

/// Status byte of a sub-protocol reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MemoryStatus {
    Ready = 0x00,
    Error = 0x01,
}

/// A decoded sub-protocol command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryCommand<'a> {
    pub opcode: MemoryOpcode,
    pub address: u32,
    pub length: u16,
    pub data: &'a [u8],
}

impl<'a> MemoryCommand<'a> {
    /// Decode `[opcode][address:4][length:2][data]`
    ///
    /// For write commands the data must be exactly `length` bytes; read and
    /// erase commands carry no data.
    pub fn parse(bytes: &'a [u8]) -> ModbusResult<Self> {
        if bytes.len() < COMMAND_HEADER_SIZE {
            return Err(ModbusError::invalid_data(format!(
                "Memory command too short: {} bytes",
                bytes.len()
            )));
        }
        let opcode = MemoryOpcode::from_u8(bytes[0])?;
        let address = BigEndian::read_u32(&bytes[1..5]);
        let length = BigEndian::read_u16(&bytes[5..7]);
        let data = &bytes[COMMAND_HEADER_SIZE..];

        let carries_data = matches!(
            opcode,
            MemoryOpcode::WriteMemory | MemoryOpcode::WriteFlash | MemoryOpcode::StartStream | MemoryOpcode::WriteStream
        );
        if carries_data && data.len() != usize::from(length) {
            return Err(ModbusError::invalid_data(format!(
                "Memory command announces {} bytes but carries {}",
                length,
                data.len()
            )));
        }
        Ok(Self { opcode, address, length, data })
    }

    /// Encode the command, as a master would send it
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(COMMAND_HEADER_SIZE + self.data.len());
        bytes.push(self.opcode as u8);
        bytes.extend_from_slice(&self.address.to_be_bytes());
        bytes.extend_from_slice(&self.length.to_be_bytes());
        bytes.extend_from_slice(self.data);
        bytes
    }
}

/// Flash device a region lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashBank {
    OnChip,
    External,
}

/// Memory-layout entry with its access permissions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub name: &'static str,
    pub start: u32,
    pub length: u32,
    pub readable: bool,
    pub writable: bool,
    pub erasable: bool,
    /// Flash bank for erasable regions
    pub flash: Option<FlashBank>,
    /// Decryption key for data written to the region
    pub key_id: Option<u8>,
}

impl MemoryRegion {
    /// Readable and writable RAM
    pub fn ram(name: &'static str, start: u32, length: u32) -> Self {
        Self { name, start, length, readable: true, writable: true, erasable: false, flash: None, key_id: None }
    }

    /// Read-only memory
    pub fn read_only(name: &'static str, start: u32, length: u32) -> Self {
        Self { writable: false, ..Self::ram(name, start, length) }
    }

    /// Readable, erasable flash
    pub fn flash(name: &'static str, start: u32, length: u32, bank: FlashBank) -> Self {
        Self {
            name,
            start,
            length,
            readable: true,
            writable: false,
            erasable: true,
            flash: Some(bank),
            key_id: None,
        }
    }

    /// Require encrypted data decrypted with `key_id`
    pub fn encrypted(mut self, key_id: u8) -> Self {
        self.key_id = Some(key_id);
        self
    }

    pub fn contains(&self, address: u32) -> bool {
        address >= self.start && u64::from(address) < u64::from(self.start) + u64::from(self.length)
    }

    /// Check that `address..address+len` lies inside the region
    pub fn check_bounds(&self, address: u32, len: usize) -> ModbusResult<()> {
        let end = u64::from(address) + len as u64;
        if !self.contains(address) || end > u64::from(self.start) + u64::from(self.length) {
            return Err(ModbusError::region(
                address,
                format!("{} bytes exceed region {}", len, self.name),
            ));
        }
        Ok(())
    }
}

/// Table of memory regions
#[derive(Debug, Clone, Default)]
pub struct RegionTable {
    regions: Vec<MemoryRegion>,
}

impl RegionTable {
    pub fn new(regions: Vec<MemoryRegion>) -> Self {
        Self { regions }
    }

    /// Region containing `address`
    pub fn find(&self, address: u32) -> ModbusResult<&MemoryRegion> {
        self.regions
            .iter()
            .find(|r| r.contains(address))
            .ok_or_else(|| ModbusError::region(address, "no region"))
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }
}

/// Raw memory access
pub trait MemoryBus: Send + Sync {
    fn read(&self, address: u32, buf: &mut [u8]) -> ModbusResult<()>;

    fn write(&self, address: u32, data: &[u8]) -> ModbusResult<()>;
}

/// Flash erase/program driver
pub trait FlashDriver: Send + Sync {
    /// Erase the sector containing `address`
    fn erase(&self, bank: FlashBank, address: u32) -> ModbusResult<()>;

    fn program(&self, bank: FlashBank, address: u32, data: &[u8]) -> ModbusResult<()>;
}

/// In-place block decryption
pub trait BlockCipher: Send + Sync {
    fn decrypt_block(&self, key_id: u8, block: &mut [u8; CIPHER_BLOCK_SIZE]) -> ModbusResult<()>;
}

#[derive(Debug)]
struct StreamState {
    region: MemoryRegion,
    next_address: u32,
    end_address: u64,
}

/// Executor of sub-protocol commands
pub struct MemoryService {
    regions: RegionTable,
    bus: Arc<dyn MemoryBus>,
    flash: Arc<dyn FlashDriver>,
    cipher: Option<Arc<dyn BlockCipher>>,
    stream: Option<StreamState>,
}

impl MemoryService {
    pub fn new(regions: RegionTable, bus: Arc<dyn MemoryBus>, flash: Arc<dyn FlashDriver>) -> Self {
        Self { regions, bus, flash, cipher: None, stream: None }
    }

    /// Decrypt data for regions that declare a key id
    pub fn with_cipher(mut self, cipher: Arc<dyn BlockCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Check if a stream is open
    pub fn stream_active(&self) -> bool {
        self.stream.is_some()
    }

    /// Execute one command and return `[status][data...]`
    pub fn execute(&mut self, command: &[u8], drive: &dyn DriveRuntime) -> Vec<u8> {
        let result = MemoryCommand::parse(command).and_then(|cmd| self.dispatch(&cmd, drive));
        match result {
            Ok(data) => {
                let mut reply = Vec::with_capacity(1 + data.len());
                reply.push(MemoryStatus::Ready as u8);
                reply.extend_from_slice(&data);
                reply
            }
            Err(e) => {
                debug!("Memory command failed: {}", e);
                vec![MemoryStatus::Error as u8]
            }
        }
    }

    fn dispatch(&mut self, cmd: &MemoryCommand<'_>, drive: &dyn DriveRuntime) -> ModbusResult<Vec<u8>> {
        match cmd.opcode {
            MemoryOpcode::Synchronize => Ok(Vec::new()),
            MemoryOpcode::ReadMemory => self.read_memory(cmd.address, usize::from(cmd.length)),
            MemoryOpcode::WriteMemory => self.write_memory(cmd.address, cmd.data).map(|_| Vec::new()),
            MemoryOpcode::EraseFlash => self.erase_flash(cmd.address, drive).map(|_| Vec::new()),
            MemoryOpcode::WriteFlash => self.write_flash(cmd.address, cmd.data, drive).map(|_| Vec::new()),
            MemoryOpcode::StartStream => self.start_stream(cmd.address, cmd.data, drive).map(|_| Vec::new()),
            MemoryOpcode::WriteStream => self.write_stream(cmd.address, cmd.data, drive).map(|_| Vec::new()),
            MemoryOpcode::EndStream => self.end_stream(drive).map(|_| Vec::new()),
        }
    }

    fn read_memory(&self, address: u32, len: usize) -> ModbusResult<Vec<u8>> {
        if len > MAX_READ_SIZE {
            return Err(ModbusError::invalid_data(format!("Read of {} bytes exceeds {}", len, MAX_READ_SIZE)));
        }
        let region = self.regions.find(address)?;
        if !region.readable {
            return Err(ModbusError::region(address, format!("{} is not readable", region.name)));
        }
        region.check_bounds(address, len)?;
        let mut buf = vec![0u8; len];
        self.bus.read(address, &mut buf)?;
        Ok(buf)
    }

    fn write_memory(&self, address: u32, data: &[u8]) -> ModbusResult<()> {
        let region = self.regions.find(address)?;
        if !region.writable {
            return Err(ModbusError::region(address, format!("{} is not writable", region.name)));
        }
        region.check_bounds(address, data.len())?;
        self.bus.write(address, data)
    }

    fn flash_region(&self, address: u32) -> ModbusResult<(MemoryRegion, FlashBank)> {
        let region = self.regions.find(address)?;
        match (region.erasable, region.flash) {
            (true, Some(bank)) => Ok((region.clone(), bank)),
            _ => Err(ModbusError::region(address, format!("{} is not flash", region.name))),
        }
    }

    fn erase_flash(&self, address: u32, drive: &dyn DriveRuntime) -> ModbusResult<()> {
        let (region, bank) = self.flash_region(address)?;
        let _lock = ReloadGuard::acquire(drive).ok_or(ModbusError::DriveLocked)?;
        info!("Erasing {:?} flash at 0x{:08X} ({})", bank, address, region.name);
        self.flash.erase(bank, address)
    }

    fn write_flash(&self, address: u32, data: &[u8], drive: &dyn DriveRuntime) -> ModbusResult<()> {
        let (region, bank) = self.flash_region(address)?;
        region.check_bounds(address, data.len())?;
        let plain = self.decrypt(&region, address, data)?;
        let _lock = ReloadGuard::acquire(drive).ok_or(ModbusError::DriveLocked)?;
        self.flash.program(bank, address, &plain)
    }

    fn start_stream(&mut self, address: u32, data: &[u8], drive: &dyn DriveRuntime) -> ModbusResult<()> {
        if let Some(previous) = self.stream.take() {
            warn!(
                "Stream into {} restarted at 0x{:08X}, previous stream abandoned",
                previous.region.name, previous.next_address
            );
            drive.release_reload();
        }
        if data.len() != 4 {
            return Err(ModbusError::invalid_data("StartStream carries a 4-byte total length"));
        }
        let total = BigEndian::read_u32(data);
        let (region, _) = self.flash_region(address)?;
        region.check_bounds(address, total as usize)?;
        if !drive.try_lock_reload() {
            return Err(ModbusError::DriveLocked);
        }
        info!("Stream of {} bytes into {} at 0x{:08X}", total, region.name, address);
        self.stream = Some(StreamState {
            region,
            next_address: address,
            end_address: u64::from(address) + u64::from(total),
        });
        Ok(())
    }

    fn write_stream(&mut self, address: u32, data: &[u8], drive: &dyn DriveRuntime) -> ModbusResult<()> {
        let result = self.stream_chunk(address, data);
        if result.is_err() {
            self.abort_stream(drive);
        }
        result
    }

    fn stream_chunk(&mut self, address: u32, data: &[u8]) -> ModbusResult<()> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| ModbusError::region(address, "no stream open"))?;
        if address != stream.next_address {
            return Err(ModbusError::region(
                address,
                format!("stream expected 0x{:08X}", stream.next_address),
            ));
        }
        if u64::from(address) + data.len() as u64 > stream.end_address {
            return Err(ModbusError::region(address, "stream data beyond announced length"));
        }
        let bank = stream
            .region
            .flash
            .ok_or_else(|| ModbusError::internal("stream region lost its flash bank"))?;
        let plain = self.decrypt(&stream.region, address, data)?;
        self.flash.program(bank, address, &plain)?;
        if let Some(stream) = self.stream.as_mut() {
            stream.next_address = address + data.len() as u32;
        }
        Ok(())
    }

    fn end_stream(&mut self, drive: &dyn DriveRuntime) -> ModbusResult<()> {
        let stream = self
            .stream
            .take()
            .ok_or_else(|| ModbusError::invalid_data("EndStream without an open stream"))?;
        drive.release_reload();
        if u64::from(stream.next_address) != stream.end_address {
            return Err(ModbusError::region(
                stream.next_address,
                format!("stream ended {} bytes short", stream.end_address - u64::from(stream.next_address)),
            ));
        }
        info!("Stream into {} committed", stream.region.name);
        Ok(())
    }

    fn abort_stream(&mut self, drive: &dyn DriveRuntime) {
        if let Some(stream) = self.stream.take() {
            warn!("Stream into {} aborted at 0x{:08X}", stream.region.name, stream.next_address);
            drive.release_reload();
        }
    }

    fn decrypt(&self, region: &MemoryRegion, address: u32, data: &[u8]) -> ModbusResult<Vec<u8>> {
        let Some(key_id) = region.key_id else {
            return Ok(data.to_vec());
        };
        if data.len() % CIPHER_BLOCK_SIZE != 0 {
            return Err(ModbusError::region(
                address,
                format!("encrypted data must be whole {}-byte blocks", CIPHER_BLOCK_SIZE),
            ));
        }
        let cipher = self
            .cipher
            .as_ref()
            .ok_or_else(|| ModbusError::region(address, "no cipher for encrypted region"))?;
        let mut plain = Vec::with_capacity(data.len());
        for chunk in data.chunks_exact(CIPHER_BLOCK_SIZE) {
            let mut block = [0u8; CIPHER_BLOCK_SIZE];
            block.copy_from_slice(chunk);
            cipher.decrypt_block(key_id, &mut block)?;
            plain.extend_from_slice(&block);
        }
        Ok(plain)
    }
}

struct Segment {
    base: u32,
    bytes: Vec<u8>,
}

/// Simulated RAM and flash for hosts and tests
///
/// Erasing sets a whole sector to 0xFF; programming can only clear bits, as
/// on NOR flash.
pub struct SimulatedMemory {
    segments: Mutex<Vec<Segment>>,
    sector_size: u32,
}

impl SimulatedMemory {
    pub fn new(sector_size: u32) -> Self {
        Self { segments: Mutex::new(Vec::new()), sector_size: sector_size.max(1) }
    }

    /// Back `base..base+len` with storage filled with `fill`
    pub fn with_segment(self, base: u32, len: usize, fill: u8) -> Self {
        if let Ok(mut segments) = self.segments.lock() {
            segments.push(Segment { base, bytes: vec![fill; len] });
        }
        self
    }

    fn with_bytes<T>(&self, address: u32, len: usize, f: impl FnOnce(&mut [u8]) -> T) -> ModbusResult<T> {
        let mut segments = self
            .segments
            .lock()
            .map_err(|_| ModbusError::internal("simulated memory poisoned"))?;
        let segment = segments
            .iter_mut()
            .find(|s| address >= s.base && (address - s.base) as usize + len <= s.bytes.len())
            .ok_or_else(|| ModbusError::region(address, format!("{} bytes not backed", len)))?;
        let start = (address - segment.base) as usize;
        Ok(f(&mut segment.bytes[start..start + len]))
    }
}

impl MemoryBus for SimulatedMemory {
    fn read(&self, address: u32, buf: &mut [u8]) -> ModbusResult<()> {
        self.with_bytes(address, buf.len(), |bytes| buf.copy_from_slice(bytes))
    }

    fn write(&self, address: u32, data: &[u8]) -> ModbusResult<()> {
        self.with_bytes(address, data.len(), |bytes| bytes.copy_from_slice(data))
    }
}

impl FlashDriver for SimulatedMemory {
    fn erase(&self, _bank: FlashBank, address: u32) -> ModbusResult<()> {
        let sector = address - address % self.sector_size;
        self.with_bytes(sector, self.sector_size as usize, |bytes| bytes.fill(0xFF))
    }

    fn program(&self, _bank: FlashBank, address: u32, data: &[u8]) -> ModbusResult<()> {
        self.with_bytes(address, data.len(), |bytes| {
            for (dst, &src) in bytes.iter_mut().zip(data) {
                *dst &= src;
            }
        })
    }
}
