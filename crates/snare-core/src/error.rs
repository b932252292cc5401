//! # Error Types
//!
//! General error handling for the debugging engine.
//!
//! We use `thiserror` to generate the `Error` trait implementations and the
//! display messages.
//!
//! Memory reads and writes are deliberately *not* represented here: they
//! report short counts instead of failing, and callers compare the returned
//! length with what they asked for.

use thiserror::Error;

use crate::types::{Address, ProcessId, ThreadId};

/// Main error type for engine operations
///
/// ## Error Categories
///
/// 1. **Session errors**: AttachFailed, LaunchFailed, UnknownThread, NotAttached
/// 2. **Breakpoint errors**: BreakpointExists, NoBreakpoint, BreakpointPatch
/// 3. **Register errors**: InvalidRegisterIndex, ContextFailed
/// 4. **Memory errors**: FlushFailed
/// 5. **Backend errors**: Backend, Windows (Win32 API failures)
#[derive(Error, Debug)]
pub enum SnareError
{
    /// Attaching the debugger to the target failed
    ///
    /// The process may have exited, may already have a debugger attached, or
    /// the caller may lack the rights to debug it.
    #[error("Failed to attach to process {pid}: {reason}")]
    AttachFailed
    {
        /// Target that could not be attached to
        pid: ProcessId,
        /// What the backend reported
        reason: String,
    },

    /// Creating the target process failed
    #[error("Failed to start process {program}: {reason}")]
    LaunchFailed
    {
        /// Program that was being started
        program: String,
        /// What the backend reported
        reason: String,
    },

    /// The session has no process handle yet
    ///
    /// Memory can only be touched once the create-process event has been seen
    /// (or the session launched the process itself).
    #[error("Not attached to a process")]
    NotAttached,

    /// A debug event named a thread the session has never registered
    ///
    /// Threads are always registered by their create event before any other
    /// event can refer to them, so this indicates an ordering defect rather
    /// than a recoverable condition. The event loop stops when it sees it.
    #[error("Debug event references unregistered thread {0}")]
    UnknownThread(ThreadId),

    /// A breakpoint is already installed at this address
    #[error("Breakpoint already defined at {0}")]
    BreakpointExists(Address),

    /// No breakpoint is registered at this address
    #[error("No breakpoint at {0}")]
    NoBreakpoint(Address),

    /// Saving or patching the bytes under a breakpoint failed
    ///
    /// The breakpoint keeps its previous enabled state.
    #[error("Failed to {action} breakpoint at {address}: transferred {transferred} of {expected} bytes")]
    BreakpointPatch
    {
        /// "enable" or "disable"
        action: &'static str,
        /// Breakpoint location
        address: Address,
        /// Bytes actually read or written
        transferred: usize,
        /// Bytes requested
        expected: usize,
    },

    /// Register index outside the architecture's integer register file
    #[error("Invalid register index {index} (architecture has {count} integer registers)")]
    InvalidRegisterIndex
    {
        /// Requested index
        index: usize,
        /// Number of addressable registers
        count: usize,
    },

    /// Reading or writing a thread's hardware context failed
    #[error("Failed to {operation} context of thread {thread}: {details}")]
    ContextFailed
    {
        /// "get" or "set"
        operation: &'static str,
        /// Thread whose context was requested
        thread: ThreadId,
        /// Additional error details
        details: String,
    },

    /// Flushing the instruction cache failed
    ///
    /// This is fatal for the caller: continuing after a code patch without a
    /// flush may execute stale instructions.
    #[error("Error while flushing instruction cache for memory [{start}, {end}[")]
    FlushFailed
    {
        /// Start of the range
        start: Address,
        /// End of the range (exclusive)
        end: Address,
    },

    /// Invalid argument passed to an engine function
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Failure reported by a debug backend
    #[error("Backend error: {0}")]
    Backend(String),

    /// Win32 API failure
    #[cfg(windows)]
    #[error("Windows API error: {0}")]
    Windows(#[from] windows::core::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for `Result<T, SnareError>`
///
/// ```rust
/// use snare_core::error::SnareResult;
/// fn foo() -> SnareResult<()>
/// {
///     Ok(())
/// }
/// ```
pub type SnareResult<T> = std::result::Result<T, SnareError>;
