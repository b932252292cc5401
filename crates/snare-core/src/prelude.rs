//! Common module for library exports

pub use crate::backend::{ContinueStatus, DebugBackend, RawDebugEvent, RawEventPayload};
pub use crate::breakpoint::Breakpoint;
pub use crate::error::{SnareError, SnareResult};
pub use crate::events::{
    BreakpointEvent, DebugEvent, DebugStringEvent, Describe, ExceptionEvent, ModuleLoadedEvent, ModuleUnloadedEvent,
    OtherDebugEvent, ProcessCreatedEvent, ProcessExitedEvent, ThreadCreatedEvent, ThreadExitedEvent,
};
pub use crate::image::{Module, Section, Symbol};
pub use crate::launch::LaunchOptions;
pub use crate::platform::create_backend;
pub use crate::registers::{RegisterContext, SavedContext};
pub use crate::session::{Session, SessionState};
pub use crate::thread::Thread;
pub use crate::types::{Address, Architecture, Handle, ProcessId, Protection, ThreadId};
