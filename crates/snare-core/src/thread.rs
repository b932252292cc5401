//! Debuggee threads.

use std::fmt;
use std::sync::Arc;

use crate::backend::DebugBackend;
use crate::registers::RegisterContext;
use crate::types::{Architecture, Handle, ThreadId};

/// One thread of the debuggee
///
/// Registered with the session when its create event (or the create-process
/// event, for the initial thread) is processed and removed again on its exit
/// event. Thread ids are recycled by the OS, so a `Thread` must not be used
/// to identify a thread after it has exited.
pub struct Thread
{
    id: ThreadId,
    handle: Handle,
    context: RegisterContext,
}

impl Thread
{
    /// Wrap a thread handle reported by the OS.
    ///
    /// The id is resolved from the handle through the backend; the register
    /// view is chosen from the session's architecture.
    pub fn new(backend: Arc<dyn DebugBackend>, handle: Handle, architecture: Architecture) -> Self
    {
        let id = backend.thread_id(handle);
        Self::with_id(backend, handle, id, architecture)
    }

    /// Wrap a thread handle whose id is already known.
    pub fn with_id(backend: Arc<dyn DebugBackend>, handle: Handle, id: ThreadId, architecture: Architecture) -> Self
    {
        Self {
            id,
            handle,
            context: RegisterContext::new(backend, handle, id, architecture),
        }
    }

    /// Thread id.
    pub fn id(&self) -> ThreadId
    {
        self.id
    }

    /// Control handle.
    pub fn handle(&self) -> Handle
    {
        self.handle
    }

    /// Register view.
    pub fn context(&self) -> &RegisterContext
    {
        &self.context
    }
}

impl fmt::Display for Thread
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "thread: 0x{:X}", self.id.raw())
    }
}

impl fmt::Debug for Thread
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .field("architecture", &self.context.architecture())
            .finish()
    }
}
