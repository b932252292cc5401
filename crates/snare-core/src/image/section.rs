//! Image sections.

use std::fmt;

use super::Symbol;
use crate::error::SnareResult;
use crate::memory::TargetMemory;
use crate::types::Address;

/// One section of a loaded image
///
/// The range is `[base, base + size)` where `size` is the section's raw data
/// size, as recorded in the section table.
#[derive(Clone)]
pub struct Section
{
    name: String,
    base: Address,
    size: u64,
    symbols: Vec<Symbol>,
    memory: TargetMemory,
}

impl Section
{
    pub(crate) fn new(name: String, base: Address, size: u64, memory: TargetMemory) -> Self
    {
        Self {
            name,
            base,
            size,
            symbols: Vec::new(),
            memory,
        }
    }

    pub(crate) fn push_symbol(&mut self, symbol: Symbol)
    {
        self.symbols.push(symbol);
    }

    /// Section name (may be empty).
    pub fn name(&self) -> &str
    {
        &self.name
    }

    /// Absolute start address.
    pub fn base(&self) -> Address
    {
        self.base
    }

    /// Size in bytes.
    pub fn size(&self) -> u64
    {
        self.size
    }

    /// Exports located in this section, in export-table order.
    pub fn symbols(&self) -> &[Symbol]
    {
        &self.symbols
    }

    /// `true` when `address` lies inside the section.
    pub fn contains(&self, address: Address) -> bool
    {
        address.rva_from(self.base).is_some_and(|offset| offset < self.size)
    }

    /// Read bytes `offset` bytes past the section start.
    pub fn read_memory(&self, offset: u64, buffer: &mut [u8]) -> usize
    {
        self.memory.read(self.base + offset, buffer)
    }

    /// Write bytes `offset` bytes past the section start.
    pub fn write_memory(&self, offset: u64, data: &[u8]) -> usize
    {
        self.memory.write(self.base + offset, data)
    }

    /// Flush the instruction cache over the whole section.
    ///
    /// ## Errors
    ///
    /// - `SnareError::FlushFailed`: the OS reported a failure
    pub fn flush_instruction_cache(&self) -> SnareResult<()>
    {
        self.memory.flush_instruction_cache(self.base, self.size as usize)
    }
}

impl fmt::Display for Section
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        if self.name.is_empty() {
            write!(f, "section: 0x{:X}", self.base.value())
        } else {
            write!(f, "section: {}", self.name)
        }
    }
}

impl fmt::Debug for Section
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Section")
            .field("name", &self.name)
            .field("base", &self.base)
            .field("size", &self.size)
            .field("symbols", &self.symbols.len())
            .finish()
    }
}
