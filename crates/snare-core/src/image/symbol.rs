//! Exported symbols.

use std::fmt;

use rustc_demangle::try_demangle;

use crate::memory::TargetMemory;
use crate::types::Address;

/// A named export of a loaded image
///
/// Symbols are owned by the [`Section`](super::Section) whose range contains
/// them. Only named exports become symbols; ordinal-only exports are skipped.
#[derive(Clone)]
pub struct Symbol
{
    name: String,
    base: Address,
    memory: TargetMemory,
}

impl Symbol
{
    pub(crate) fn new(name: String, base: Address, memory: TargetMemory) -> Self
    {
        Self { name, base, memory }
    }

    /// Export name as stored in the image.
    pub fn name(&self) -> &str
    {
        &self.name
    }

    /// Demangled name for Rust exports, `None` for anything else.
    pub fn demangled_name(&self) -> Option<String>
    {
        try_demangle(&self.name).ok().map(|d| format!("{d:#}"))
    }

    /// Absolute address of the symbol.
    pub fn base(&self) -> Address
    {
        self.base
    }

    /// Read `buffer.len()` bytes starting `offset` bytes past the symbol.
    ///
    /// Returns the number of bytes read. Used to sniff function prologues.
    pub fn read_memory(&self, offset: u64, buffer: &mut [u8]) -> usize
    {
        self.memory.read(self.base + offset, buffer)
    }
}

impl fmt::Display for Symbol
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "symbol: {}", self.name)
    }
}

impl fmt::Debug for Symbol
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Symbol").field("name", &self.name).field("base", &self.base).finish()
    }
}
