//! Raw context buffer layouts for x86 and x86-64.
//!
//! The offsets follow the Windows `WOW64_CONTEXT` (32-bit targets) and AMD64
//! `CONTEXT` (64-bit targets) structures. Registers are addressed by their
//! instruction-encoding number, which is also the order used by `ModR/M`.
//!
//! ## References
//!
//! - [CONTEXT structure (winnt.h)](https://learn.microsoft.com/en-us/windows/win32/api/winnt/ns-winnt-context)
//! - [WOW64_CONTEXT structure (winnt.h)](https://learn.microsoft.com/en-us/windows/win32/api/winnt/ns-winnt-wow64_context)

use crate::types::Architecture;

/// Description of one architecture's raw register context
///
/// Implemented by [`X86Layout`] and [`X64Layout`]; a session picks one of the
/// two once, from the target's bitness, through [`layout_for`].
pub trait RegisterLayout: Send + Sync
{
    /// Architecture this layout describes.
    fn architecture(&self) -> Architecture;

    /// Size of the raw context buffer in bytes.
    fn context_size(&self) -> usize;

    /// Byte offset of the `ContextFlags` field.
    fn flags_offset(&self) -> usize;

    /// `ContextFlags` value requesting the complete context.
    fn flags_all(&self) -> u32;

    /// Width of one integer register in bytes (4 or 8).
    fn register_width(&self) -> usize;

    /// Number of integer registers addressable by index.
    fn register_count(&self) -> usize;

    /// Byte offset of integer register `index`, or `None` when out of range.
    fn register_offset(&self, index: usize) -> Option<usize>;

    /// Byte offset of the instruction pointer.
    fn instruction_pointer_offset(&self) -> usize;

    /// Byte offset of the flags register.
    fn eflags_offset(&self) -> usize;

    /// Assembler name of integer register `index`.
    fn register_name(&self, index: usize) -> Option<&'static str>;

    /// Read a register-sized little-endian value at `offset`.
    fn read_value(&self, bytes: &[u8], offset: usize) -> Option<u64>
    {
        let width = self.register_width();
        let field = bytes.get(offset..offset + width)?;
        let mut raw = [0u8; 8];
        raw[..width].copy_from_slice(field);
        Some(u64::from_le_bytes(raw))
    }

    /// Write a register-sized little-endian value at `offset`.
    ///
    /// On 32-bit layouts the value is truncated to the low 32 bits.
    fn write_value(&self, bytes: &mut [u8], offset: usize, value: u64) -> Option<()>
    {
        let width = self.register_width();
        let field = bytes.get_mut(offset..offset + width)?;
        field.copy_from_slice(&value.to_le_bytes()[..width]);
        Some(())
    }
}

/// `WOW64_CONTEXT` layout for 32-bit targets
#[derive(Debug, Clone, Copy, Default)]
pub struct X86Layout;

/// `WOW64_CONTEXT_ALL` (i386 | control | integer | segments | floating point | debug registers | extended registers)
pub const WOW64_CONTEXT_ALL: u32 = 0x0001_003F;

const X86_NAMES: [&str; 8] = ["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"];

// Encoding order mapped onto the structure, which stores
// Edi, Esi, Ebx, Edx, Ecx, Eax, Ebp, Eip, SegCs, EFlags, Esp.
const X86_OFFSETS: [usize; 8] = [0xB0, 0xAC, 0xA8, 0xA4, 0xC4, 0xB4, 0xA0, 0x9C];

impl RegisterLayout for X86Layout
{
    fn architecture(&self) -> Architecture
    {
        Architecture::X86
    }

    fn context_size(&self) -> usize
    {
        0x2CC
    }

    fn flags_offset(&self) -> usize
    {
        0x00
    }

    fn flags_all(&self) -> u32
    {
        WOW64_CONTEXT_ALL
    }

    fn register_width(&self) -> usize
    {
        4
    }

    fn register_count(&self) -> usize
    {
        X86_OFFSETS.len()
    }

    fn register_offset(&self, index: usize) -> Option<usize>
    {
        X86_OFFSETS.get(index).copied()
    }

    fn instruction_pointer_offset(&self) -> usize
    {
        0xB8
    }

    fn eflags_offset(&self) -> usize
    {
        0xC0
    }

    fn register_name(&self, index: usize) -> Option<&'static str>
    {
        X86_NAMES.get(index).copied()
    }
}

/// AMD64 `CONTEXT` layout for 64-bit targets
#[derive(Debug, Clone, Copy, Default)]
pub struct X64Layout;

/// `CONTEXT_ALL` for AMD64
pub const CONTEXT_ALL_AMD64: u32 = 0x0010_001F;

const X64_NAMES: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12", "r13", "r14", "r15",
];

// Rax..R15 are stored contiguously in encoding order.
const X64_RAX: usize = 0x78;

impl RegisterLayout for X64Layout
{
    fn architecture(&self) -> Architecture
    {
        Architecture::X86_64
    }

    fn context_size(&self) -> usize
    {
        0x4D0
    }

    fn flags_offset(&self) -> usize
    {
        0x30
    }

    fn flags_all(&self) -> u32
    {
        CONTEXT_ALL_AMD64
    }

    fn register_width(&self) -> usize
    {
        8
    }

    fn register_count(&self) -> usize
    {
        X64_NAMES.len()
    }

    fn register_offset(&self, index: usize) -> Option<usize>
    {
        (index < X64_NAMES.len()).then(|| X64_RAX + 8 * index)
    }

    fn instruction_pointer_offset(&self) -> usize
    {
        0xF8
    }

    fn eflags_offset(&self) -> usize
    {
        0x44
    }

    fn register_name(&self, index: usize) -> Option<&'static str>
    {
        X64_NAMES.get(index).copied()
    }
}

static X86: X86Layout = X86Layout;
static X64: X64Layout = X64Layout;

/// Layout used for targets of `architecture`.
pub fn layout_for(architecture: Architecture) -> &'static dyn RegisterLayout
{
    match architecture {
        Architecture::X86 => &X86,
        Architecture::X86_64 => &X64,
    }
}
