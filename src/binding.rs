//! Register and coil address resolution.
//!
//! A [`BindingTable`] maps Modbus indices onto parameter descriptors with two
//! explicit collections:
//!
//! - a fixed table sorted by start index, searched with a binary search
//! - an override list, scanned linearly and consulted first
//!
//! Register entries span one index per element. Coil entries are bit-addressed
//! and span `element_count * element_size * 8` indices.

use log::debug;
use std::cmp::Ordering;

use crate::error::{ModbusError, ModbusResult};
use crate::params::ParameterDescriptor;

/// Address space a table resolves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSpace {
    Registers,
    Coils,
}

/// A parameter bound at a start index
#[derive(Debug, Clone)]
pub struct BindingEntry {
    pub start: u32,
    pub descriptor: ParameterDescriptor,
}

impl BindingEntry {
    pub fn new(start: u32, descriptor: ParameterDescriptor) -> Self {
        Self { start, descriptor }
    }

    /// Number of indices covered by the entry
    pub fn span(&self, space: AddressSpace) -> u32 {
        let span = match space {
            AddressSpace::Registers => self.descriptor.element_count,
            AddressSpace::Coils => self.descriptor.byte_len() * 8,
        };
        span as u32
    }

    /// Last index covered by the entry
    pub fn last(&self, space: AddressSpace) -> u32 {
        self.start + self.span(space).saturating_sub(1)
    }

    fn compare(&self, space: AddressSpace, index: u32) -> Ordering {
        if index < self.start {
            Ordering::Greater
        } else if index - self.start >= self.span(space) {
            Ordering::Less
        } else {
            Ordering::Equal
        }
    }

    fn contains(&self, space: AddressSpace, index: u32) -> bool {
        self.compare(space, index) == Ordering::Equal
    }
}

/// A resolved index: the entry and the offset of the index inside it
#[derive(Debug, Clone, Copy)]
pub struct Resolved<'a> {
    pub entry: &'a BindingEntry,
    /// Element offset for registers, bit offset for coils
    pub offset: u32,
}

impl Resolved<'_> {
    pub fn descriptor(&self) -> &ParameterDescriptor {
        &self.entry.descriptor
    }

    /// Indices left in the entry from the resolved one, inclusive
    pub fn remaining(&self, space: AddressSpace) -> u32 {
        self.entry.span(space) - self.offset
    }
}

/// Sorted fixed bindings plus a runtime override list
#[derive(Debug, Clone)]
pub struct BindingTable {
    space: AddressSpace,
    fixed: Vec<BindingEntry>,
    overrides: Vec<BindingEntry>,
}

fn is_sorted_and_disjoint(space: AddressSpace, entries: &[BindingEntry]) -> bool {
    entries
        .windows(2)
        .all(|pair| pair[0].start + pair[0].span(space) <= pair[1].start)
}

impl BindingTable {
    /// Build a table from entries sorted by start index
    ///
    /// Ordering and overlap are only checked in debug builds.
    pub fn new(space: AddressSpace, fixed: Vec<BindingEntry>) -> Self {
        debug_assert!(
            is_sorted_and_disjoint(space, &fixed),
            "binding table entries must be sorted and non-overlapping"
        );
        debug_assert!(
            space == AddressSpace::Registers || fixed.iter().all(|e| !e.descriptor.is_hook()),
            "coil bindings cannot be hook parameters"
        );
        Self { space, fixed, overrides: Vec::new() }
    }

    /// Register table
    pub fn registers(fixed: Vec<BindingEntry>) -> Self {
        Self::new(AddressSpace::Registers, fixed)
    }

    /// Coil table
    pub fn coils(fixed: Vec<BindingEntry>) -> Self {
        Self::new(AddressSpace::Coils, fixed)
    }

    /// Empty table
    pub fn empty(space: AddressSpace) -> Self {
        Self::new(space, Vec::new())
    }

    pub fn space(&self) -> AddressSpace {
        self.space
    }

    /// Fixed entries in index order
    pub fn entries(&self) -> &[BindingEntry] {
        &self.fixed
    }

    /// Current overrides in insertion order
    pub fn overrides(&self) -> &[BindingEntry] {
        &self.overrides
    }

    /// Resolve an index to its binding
    ///
    /// Overrides win over fixed entries. An unmapped index fails with
    /// [`ModbusError::AddressNotMapped`].
    pub fn resolve(&self, index: u32) -> ModbusResult<Resolved<'_>> {
        let entry = match self.overrides.iter().find(|e| e.contains(self.space, index)) {
            Some(entry) => entry,
            None => {
                let position = self
                    .fixed
                    .binary_search_by(|e| e.compare(self.space, index))
                    .map_err(|_| ModbusError::address_not_mapped(index))?;
                &self.fixed[position]
            }
        };
        Ok(Resolved { entry, offset: index - entry.start })
    }

    /// Add a runtime binding that takes precedence over the fixed table
    pub fn add_override(&mut self, entry: BindingEntry) -> ModbusResult<()> {
        if entry.span(self.space) == 0 {
            return Err(ModbusError::configuration(format!(
                "Override for {} covers no indices",
                entry.descriptor.name
            )));
        }
        if self.space == AddressSpace::Coils && entry.descriptor.is_hook() {
            return Err(ModbusError::configuration(format!(
                "Hook parameter {} cannot be bound as coils",
                entry.descriptor.name
            )));
        }
        debug!(
            "Override {} bound at {}..={}",
            entry.descriptor.name,
            entry.start,
            entry.last(self.space)
        );
        self.overrides.push(entry);
        Ok(())
    }

    /// Remove every override
    pub fn clear_overrides(&mut self) {
        self.overrides.clear();
    }
}
