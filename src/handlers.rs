//! Register and coil request handlers.
//!
//! Each handler resolves the request address through a [`BindingTable`], runs
//! the conversion in [`crate::codec`] against the parameter database or the
//! parameter's hook, and builds the success reply. Any error leaves the
//! database untouched and is turned into an exception reply by the caller.
//!
//! Input registers (0x04) share the holding register table and discrete
//! inputs (0x02) share the coil table.

use log::debug;

use crate::binding::{AddressSpace, BindingTable};
use crate::codec::{entry_to_registers, pack_bits, packed_bit, registers_to_entry, registers_to_host, registers_to_wire};
use crate::error::{HookPhase, ModbusError, ModbusResult};
use crate::params::{
    HookDirection, HookSegment, HookSession, ParamFlags, ParameterDatabase, ParameterDescriptor, ParameterHook,
};
use crate::protocol::{FunctionCode, ModbusAddress, Request, COIL_OFF, COIL_ON};

fn phase_error(phase: HookPhase, err: ModbusError) -> ModbusError {
    match err {
        ModbusError::Hook { .. } => err,
        other => ModbusError::hook(phase, other.to_string()),
    }
}

/// Run INIT, SEGMENT and END once each, stopping at the first failure
fn hook_transaction(hook: &dyn ParameterHook, mut session: HookSession, data: HookSegment<'_>) -> ModbusResult<()> {
    hook.init(&mut session).map_err(|e| phase_error(HookPhase::Init, e))?;
    hook.segment(&mut session, data)
        .map_err(|e| phase_error(HookPhase::Segment, e))?;
    hook.end(&mut session).map_err(|e| phase_error(HookPhase::End, e))
}

fn hook_of(descriptor: &ParameterDescriptor) -> ModbusResult<&dyn ParameterHook> {
    descriptor
        .hook
        .as_deref()
        .ok_or_else(|| ModbusError::internal(format!("{} flagged as hook without a hook", descriptor.name)))
}

/// Request handlers bound to one engine's tables and database
pub struct RequestHandler<'a> {
    pub registers: &'a BindingTable,
    pub coils: &'a BindingTable,
    pub database: &'a dyn ParameterDatabase,
    /// System status sampled for this request
    pub system_status: u32,
    /// Use wire addresses unchanged instead of adding one
    pub zero_base: bool,
}

impl RequestHandler<'_> {
    /// Binding index of a wire address
    pub fn resolve_index(&self, address: ModbusAddress) -> u32 {
        if self.zero_base {
            u32::from(address)
        } else {
            u32::from(address) + 1
        }
    }

    /// Execute a register or coil request and build the success reply
    pub fn handle(&self, request: &Request<'_>) -> ModbusResult<Vec<u8>> {
        match *request {
            Request::ReadRegisters { function, address, count } => {
                let data = self.read_registers(self.resolve_index(address), count)?;
                let mut reply = Vec::with_capacity(2 + data.len());
                reply.push(function.to_u8());
                reply.push(data.len() as u8);
                reply.extend_from_slice(&data);
                Ok(reply)
            }
            Request::WriteSingleRegister { address, value } => {
                self.write_registers(self.resolve_index(address), &value.to_be_bytes())?;
                Ok(echo(FunctionCode::WriteSingleRegister, address, value))
            }
            Request::WriteMultipleRegisters { address, count, values } => {
                self.write_registers(self.resolve_index(address), values)?;
                Ok(echo(FunctionCode::WriteMultipleRegisters, address, count))
            }
            Request::ReadBits { function, address, count } => {
                let packed = self.read_coils(self.resolve_index(address), count)?;
                let mut reply = Vec::with_capacity(2 + packed.len());
                reply.push(function.to_u8());
                reply.push(packed.len() as u8);
                reply.extend_from_slice(&packed);
                Ok(reply)
            }
            Request::WriteSingleCoil { address, value } => {
                self.write_coils(self.resolve_index(address), 1, &[u8::from(value)])?;
                let echoed = if value { COIL_ON } else { COIL_OFF };
                Ok(echo(FunctionCode::WriteSingleCoil, address, echoed))
            }
            Request::WriteMultipleCoils { address, count, packed } => {
                self.write_coils(self.resolve_index(address), count, packed)?;
                Ok(echo(FunctionCode::WriteMultipleCoils, address, count))
            }
            Request::ProgramController { .. } => Err(ModbusError::internal(
                "Program controller requests are handled by the memory service",
            )),
        }
    }

    /// Read `count` registers starting at `index`, in wire order
    pub fn read_registers(&self, index: u32, count: u16) -> ModbusResult<Vec<u8>> {
        let resolved = self.registers.resolve(index)?;
        let descriptor = resolved.descriptor();

        if descriptor.is_hook() {
            let hook = hook_of(descriptor)?;
            let mut buf = vec![0u8; usize::from(count) * 2];
            let session = HookSession::new(HookDirection::Read, resolved.offset as usize, buf.len());
            hook_transaction(hook, session, HookSegment::Read(&mut buf))?;
            registers_to_wire(&mut buf);
            return Ok(buf);
        }

        if count > 2 {
            return Err(ModbusError::invalid_data(format!(
                "{} registers requested from plain parameter {}",
                count, descriptor.name
            )));
        }
        let mut raw = vec![0u8; descriptor.element_size];
        self.database
            .read_bytes(descriptor.id, resolved.offset as usize * descriptor.element_size, &mut raw)?;
        entry_to_registers(&raw, descriptor.signed, count)
    }

    /// Write wire-order registers starting at `index`
    pub fn write_registers(&self, index: u32, wire: &[u8]) -> ModbusResult<()> {
        let resolved = self.registers.resolve(index)?;
        let descriptor = resolved.descriptor();
        descriptor.check_writable(self.system_status)?;

        if descriptor.is_hook() {
            let hook = hook_of(descriptor)?;
            let mut buf = wire.to_vec();
            registers_to_host(&mut buf);
            let session = HookSession::new(HookDirection::Write, resolved.offset as usize, buf.len());
            return hook_transaction(hook, session, HookSegment::Write(&buf));
        }

        let raw = registers_to_entry(wire, descriptor.element_size, descriptor.signed)?;
        let offset = resolved.offset as usize * descriptor.element_size;
        if descriptor.flags.contains(ParamFlags::VALIDATED) {
            self.database.validate(descriptor.id, offset, &raw)?;
        }
        self.database.write_bytes(descriptor.id, offset, &raw)?;
        debug!("{} <- {:02X?}", descriptor.name, raw);
        Ok(())
    }

    /// Read `count` coils starting at `index`, packed LSB-first
    pub fn read_coils(&self, index: u32, count: u16) -> ModbusResult<Vec<u8>> {
        let resolved = self.coils.resolve(index)?;
        let descriptor = resolved.descriptor();
        if descriptor.is_hook() {
            return Err(ModbusError::invalid_data(format!("{} is not bit-addressable", descriptor.name)));
        }
        check_bit_range(index, count, resolved.remaining(AddressSpace::Coils))?;

        let first_bit = resolved.offset as usize;
        let first_byte = first_bit / 8;
        let last_byte = (first_bit + usize::from(count) - 1) / 8;
        let mut storage = vec![0u8; last_byte - first_byte + 1];
        self.database.read_bytes(descriptor.id, first_byte, &mut storage)?;
        Ok(pack_bits(&storage, first_bit % 8, usize::from(count)))
    }

    /// Write `count` packed coils starting at `index`
    ///
    /// Bits are written one at a time with the database's atomic bit update.
    pub fn write_coils(&self, index: u32, count: u16, packed: &[u8]) -> ModbusResult<()> {
        let resolved = self.coils.resolve(index)?;
        let descriptor = resolved.descriptor();
        if descriptor.is_hook() {
            return Err(ModbusError::invalid_data(format!("{} is not bit-addressable", descriptor.name)));
        }
        descriptor.check_writable(self.system_status)?;
        check_bit_range(index, count, resolved.remaining(AddressSpace::Coils))?;

        for i in 0..usize::from(count) {
            let bit = resolved.offset as usize + i;
            self.database
                .update_bit(descriptor.id, bit / 8, (bit % 8) as u8, packed_bit(packed, i))?;
        }
        Ok(())
    }
}

fn check_bit_range(index: u32, count: u16, remaining: u32) -> ModbusResult<()> {
    if u32::from(count) > remaining {
        return Err(ModbusError::address_not_mapped(index + remaining));
    }
    Ok(())
}

/// `[fc][addrHi][addrLo][valueHi][valueLo]`
fn echo(function: FunctionCode, address: ModbusAddress, value: u16) -> Vec<u8> {
    let mut reply = Vec::with_capacity(5);
    reply.push(function.to_u8());
    reply.extend_from_slice(&address.to_be_bytes());
    reply.extend_from_slice(&value.to_be_bytes());
    reply
}
