//! Process, thread, handle, and architecture types.

use std::fmt;

/// Process identifier (PID)
///
/// Wrapping the raw `u32` keeps PIDs from being mixed up with thread ids,
/// which share the same numeric space on Windows.
///
/// ## Example
///
/// ```rust
/// use snare_core::types::ProcessId;
///
/// let pid = ProcessId::from(4242);
/// assert_eq!(u32::from(pid), 4242);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(pub u32);

impl From<u32> for ProcessId
{
    fn from(pid: u32) -> Self
    {
        ProcessId(pid)
    }
}

impl From<ProcessId> for u32
{
    fn from(pid: ProcessId) -> Self
    {
        pid.0
    }
}

impl fmt::Display for ProcessId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// Thread identifier
///
/// On Windows this is the system-wide thread id (what `GetThreadId` returns
/// for a thread handle), not the handle itself. Ids are recycled by the OS
/// once a thread has exited, so a `ThreadId` only identifies a thread for as
/// long as the thread is registered with a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u32);

impl ThreadId
{
    /// Get the raw numeric id.
    pub fn raw(self) -> u32
    {
        self.0
    }
}

impl From<u32> for ThreadId
{
    fn from(value: u32) -> Self
    {
        Self(value)
    }
}

impl fmt::Display for ThreadId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// Opaque OS handle value (process, thread, or file)
///
/// The engine never interprets handles; it only hands them back to the
/// [`DebugBackend`](crate::backend::DebugBackend) that produced them. A null
/// handle means "not provided by the OS" (e.g. a module loaded without a file
/// handle).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Handle(u64);

impl Handle
{
    /// The null handle.
    pub const NULL: Self = Handle(0);

    /// Wrap a raw handle value.
    pub const fn from_raw(value: u64) -> Self
    {
        Handle(value)
    }

    /// Raw handle value.
    pub const fn raw(self) -> u64
    {
        self.0
    }

    /// `true` when the OS did not supply a handle.
    pub const fn is_null(self) -> bool
    {
        self.0 == 0
    }
}

impl fmt::Display for Handle
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "0x{:x}", self.0)
    }
}

/// Instruction-set architecture of the debuggee
///
/// Chosen once per session from the target's pointer width. It decides which
/// register layout thread contexts use and how many integer registers can be
/// addressed by index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture
{
    /// 32-bit x86 (on a 64-bit host this is a WOW64 process)
    X86,
    /// 64-bit x86 (AMD64)
    X86_64,
}

impl Architecture
{
    /// Pointer width of the architecture in bytes.
    pub const fn pointer_size(self) -> usize
    {
        match self {
            Architecture::X86 => 4,
            Architecture::X86_64 => 8,
        }
    }

    /// Number of integer registers addressable by index.
    pub const fn integer_register_count(self) -> usize
    {
        match self {
            Architecture::X86 => 8,
            Architecture::X86_64 => 16,
        }
    }

    /// Architecture of the running debugger binary.
    ///
    /// Used as the fallback when the backend cannot tell the target's bitness.
    pub const fn host() -> Self
    {
        #[cfg(target_pointer_width = "64")]
        {
            Architecture::X86_64
        }
        #[cfg(not(target_pointer_width = "64"))]
        {
            Architecture::X86
        }
    }
}

impl fmt::Display for Architecture
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Architecture::X86 => write!(f, "x86"),
            Architecture::X86_64 => write!(f, "x86_64"),
        }
    }
}
