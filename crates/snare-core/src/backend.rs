//! # Debug Backend Trait
//!
//! The capability boundary between the engine and the operating system.
//!
//! Everything the [`Session`](crate::session::Session) needs from the OS goes
//! through [`DebugBackend`]: attaching, the wait/continue event protocol,
//! memory access, thread contexts. The engine itself never calls a platform
//! API, which means:
//!
//! - The Windows implementation lives in [`crate::platform::windows`]
//! - Tests drive the whole engine with a scripted in-memory backend
//!
//! ## Contract highlights
//!
//! - `wait_for_event` and `continue_event` are only ever called from the
//!   session's event-loop thread.
//! - Memory reads and writes never fail; they return how many bytes were
//!   transferred (`0` on total failure).
//! - `flush_instruction_cache` reports failure with `false`; the session turns
//!   that into an error.

use std::fmt;
use std::time::Duration;

use crate::error::SnareResult;
use crate::launch::{LaunchOptions, LaunchedProcess};
use crate::registers::SavedContext;
use crate::types::{Address, Architecture, Handle, ProcessId, Protection, ThreadId};

/// `EXCEPTION_BREAKPOINT`, raised by an `int3` trap.
pub const EXCEPTION_BREAKPOINT: u32 = 0x8000_0003;

/// `STATUS_WX86_BREAKPOINT`, the `int3` code reported for WOW64 targets.
pub const STATUS_WX86_BREAKPOINT: u32 = 0x4000_001F;

/// Continuation code handed back to the OS for every debug event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContinueStatus
{
    /// `DBG_CONTINUE`: resume normally (exceptions count as handled)
    Continue,
    /// `DBG_EXCEPTION_NOT_HANDLED`: let the target's own handlers run
    ExceptionNotHandled,
}

impl ContinueStatus
{
    /// Raw NTSTATUS value.
    pub const fn code(self) -> u32
    {
        match self {
            ContinueStatus::Continue => 0x0001_0002,
            ContinueStatus::ExceptionNotHandled => 0x8001_0001,
        }
    }
}

/// One debug event as delivered by the OS, already split by kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDebugEvent
{
    /// Process reporting the event
    pub process_id: ProcessId,
    /// Thread reporting the event
    pub thread_id: ThreadId,
    /// Kind-specific payload
    pub payload: RawEventPayload,
}

/// Kind-specific part of a [`RawDebugEvent`]
///
/// The backend reads the event-kind discriminant first and only then
/// interprets the matching payload, so every variant is fully typed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEventPayload
{
    /// `CREATE_PROCESS_DEBUG_EVENT`
    CreateProcess
    {
        /// Process handle owned by the debugger
        process: Handle,
        /// Handle of the initial thread
        thread: Handle,
        /// Handle of the executable image file (may be null)
        file: Handle,
        /// Load address of the executable image
        image_base: Address,
    },
    /// `CREATE_THREAD_DEBUG_EVENT`
    CreateThread
    {
        /// Handle of the new thread
        thread: Handle,
        /// Thread entry point
        start_address: Address,
    },
    /// `EXCEPTION_DEBUG_EVENT`
    Exception
    {
        /// NTSTATUS exception code
        code: u32,
        /// Faulting instruction address
        address: Address,
        /// `true` when the target has not seen the exception yet
        first_chance: bool,
    },
    /// `EXIT_THREAD_DEBUG_EVENT`
    ExitThread
    {
        /// Thread exit code
        exit_code: u32,
    },
    /// `EXIT_PROCESS_DEBUG_EVENT`
    ExitProcess
    {
        /// Process exit code
        exit_code: u32,
    },
    /// `LOAD_DLL_DEBUG_EVENT`
    LoadDll
    {
        /// Handle of the image file (may be null)
        file: Handle,
        /// Load address of the image
        base: Address,
    },
    /// `UNLOAD_DLL_DEBUG_EVENT`
    UnloadDll
    {
        /// Load address of the image being unloaded
        base: Address,
    },
    /// `OUTPUT_DEBUG_STRING_EVENT`
    DebugString
    {
        /// Address of the string in target memory
        data: Address,
        /// Length in characters, terminator included
        length: u16,
        /// `true` for UTF-16 text, `false` for 8-bit text
        unicode: bool,
    },
    /// `RIP_EVENT`: the debuggee died outside the debugger's control
    Rip
    {
        /// Error code
        error: u32,
        /// Error type
        kind: u32,
    },
    /// Any event code the backend does not know
    Unknown
    {
        /// Raw event code
        code: u32,
    },
}

impl RawEventPayload
{
    /// Short name of the event kind, for logging.
    pub fn kind(&self) -> &'static str
    {
        match self {
            RawEventPayload::CreateProcess { .. } => "create-process",
            RawEventPayload::CreateThread { .. } => "create-thread",
            RawEventPayload::Exception { .. } => "exception",
            RawEventPayload::ExitThread { .. } => "exit-thread",
            RawEventPayload::ExitProcess { .. } => "exit-process",
            RawEventPayload::LoadDll { .. } => "load-dll",
            RawEventPayload::UnloadDll { .. } => "unload-dll",
            RawEventPayload::DebugString { .. } => "debug-string",
            RawEventPayload::Rip { .. } => "rip",
            RawEventPayload::Unknown { .. } => "unknown",
        }
    }
}

/// OS debug/memory primitives required by the engine
///
/// Implementations must be shareable across threads: the event loop calls
/// `wait_for_event`/`continue_event` while consumer threads read memory or
/// registers concurrently.
///
/// ## Lifecycle
///
/// 1. Optionally `create_suspended` the target
/// 2. `process_architecture` + `attach` + `set_kill_on_exit(false)` on the
///    event-loop thread
/// 3. Repeated `wait_for_event` / `continue_event`
pub trait DebugBackend: Send + Sync
{
    /// Start debugging a running process.
    ///
    /// ## Errors
    ///
    /// - `SnareError::AttachFailed`: the OS refused (no such process, access denied, already debugged)
    fn attach(&self, pid: ProcessId) -> SnareResult<()>;

    /// Choose whether the target is killed when the debugger goes away.
    ///
    /// ## Errors
    ///
    /// Platform error if the setting could not be applied.
    fn set_kill_on_exit(&self, kill_on_exit: bool) -> SnareResult<()>;

    /// Create a process whose initial thread is suspended.
    ///
    /// ## Errors
    ///
    /// - `SnareError::LaunchFailed`: the process could not be created
    fn create_suspended(&self, options: &LaunchOptions) -> SnareResult<LaunchedProcess>;

    /// Determine the target's instruction set from its pointer width.
    ///
    /// ## Errors
    ///
    /// Platform error if the process cannot be queried.
    fn process_architecture(&self, pid: ProcessId) -> SnareResult<Architecture>;

    /// Block until the next debug event, or until `timeout` elapses.
    ///
    /// `None` as timeout waits forever. `Ok(None)` means the wait timed out.
    ///
    /// ## Errors
    ///
    /// Platform error if waiting is no longer possible (e.g. the debugger
    /// was detached).
    fn wait_for_event(&self, timeout: Option<Duration>) -> SnareResult<Option<RawDebugEvent>>;

    /// Acknowledge the last event reported by `(pid, tid)`.
    ///
    /// ## Errors
    ///
    /// Platform error if the OS rejects the acknowledgment.
    fn continue_event(&self, pid: ProcessId, tid: ThreadId, status: ContinueStatus) -> SnareResult<()>;

    /// Read up to `buffer.len()` bytes at `address`; returns the byte count read.
    fn read_memory(&self, process: Handle, address: Address, buffer: &mut [u8]) -> usize;

    /// Write `data` at `address`; returns the byte count written.
    fn write_memory(&self, process: Handle, address: Address, data: &[u8]) -> usize;

    /// Reserve and commit `size` bytes, at `address` or wherever the OS likes.
    fn allocate_memory(
        &self,
        process: Handle,
        address: Option<Address>,
        size: usize,
        protection: Protection,
    ) -> Option<Address>;

    /// Change the protection of an existing range.
    fn change_protection(&self, process: Handle, address: Address, size: usize, protection: Protection) -> bool;

    /// Invalidate the instruction cache for a range.
    fn flush_instruction_cache(&self, process: Handle, address: Address, size: usize) -> bool;

    /// Resolve the id of a thread handle.
    fn thread_id(&self, thread: Handle) -> ThreadId;

    /// Capture the complete hardware context of a thread.
    ///
    /// ## Errors
    ///
    /// - `SnareError::ContextFailed`: the context could not be read
    fn get_thread_context(&self, thread: Handle, architecture: Architecture) -> SnareResult<SavedContext>;

    /// Overwrite the complete hardware context of a thread.
    ///
    /// ## Errors
    ///
    /// - `SnareError::ContextFailed`: the context could not be written
    fn set_thread_context(&self, thread: Handle, context: &SavedContext) -> SnareResult<()>;

    /// Decrement a thread's suspend count.
    ///
    /// ## Errors
    ///
    /// Platform error if the thread cannot be resumed.
    fn resume_thread(&self, thread: Handle) -> SnareResult<()>;

    /// Best-effort path of an open file handle; empty when unknown.
    fn resolve_path(&self, file: Handle) -> String;

    /// Release a handle the debugger owns. Null handles are ignored.
    fn close_handle(&self, handle: Handle);

    /// Make the target raise a breakpoint exception as soon as possible.
    ///
    /// ## Errors
    ///
    /// Platform error if the break could not be requested.
    fn break_process(&self, process: Handle) -> SnareResult<()>;
}

impl fmt::Debug for dyn DebugBackend
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str("DebugBackend")
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_continue_status_codes()
    {
        assert_eq!(ContinueStatus::Continue.code(), 0x0001_0002);
        assert_eq!(ContinueStatus::ExceptionNotHandled.code(), 0x8001_0001);
    }

    #[test]
    fn test_payload_kind_names()
    {
        let payload = RawEventPayload::UnloadDll { base: Address::new(0x1000) };
        assert_eq!(payload.kind(), "unload-dll");
        assert_eq!(RawEventPayload::Unknown { code: 42 }.kind(), "unknown");
    }
}
