//! # Register Context
//!
//! Per-thread access to integer registers and the instruction pointer.
//!
//! Every accessor is a full round trip through the backend: the thread's
//! complete context is fetched, one field is read or patched, and (for
//! setters) the whole context is written back. Nothing is cached, so a value
//! read here is always what the thread will see when it resumes.
//!
//! ## Example
//!
//! ```rust,no_run
//! # use snare_core::session::Session;
//! # fn demo(session: &Session, tid: snare_core::types::ThreadId) -> snare_core::error::SnareResult<()> {
//! let thread = session.thread(tid).unwrap();
//! let context = thread.context();
//!
//! let snapshot = context.save()?;
//! let ip = context.instruction_pointer()?;
//! context.set_instruction_pointer(ip.displace(-1))?;
//! context.load(&snapshot)?; // back to where we started
//! # Ok(())
//! # }
//! ```

mod layout;

use std::fmt;
use std::sync::Arc;

pub use layout::{layout_for, RegisterLayout, X64Layout, X86Layout, CONTEXT_ALL_AMD64, WOW64_CONTEXT_ALL};
use tracing::trace;

use crate::backend::DebugBackend;
use crate::error::{SnareError, SnareResult};
use crate::types::{Address, Architecture, Handle, ThreadId};

/// Owned copy of a thread's complete hardware context
///
/// The buffer uses the raw OS layout of its architecture and is reinstated
/// verbatim by [`RegisterContext::load`].
#[derive(Clone, PartialEq, Eq)]
pub struct SavedContext
{
    architecture: Architecture,
    bytes: Box<[u8]>,
}

impl SavedContext
{
    /// Zeroed buffer with `ContextFlags` already requesting the full context.
    pub fn new(architecture: Architecture) -> Self
    {
        let layout = layout_for(architecture);
        let mut bytes = vec![0u8; layout.context_size()].into_boxed_slice();
        let flags = layout.flags_offset();
        bytes[flags..flags + 4].copy_from_slice(&layout.flags_all().to_le_bytes());
        Self { architecture, bytes }
    }

    /// Wrap raw bytes captured from the OS.
    ///
    /// ## Errors
    ///
    /// - `SnareError::InvalidArgument`: `bytes` is not the architecture's context size
    pub fn from_bytes(architecture: Architecture, bytes: impl Into<Box<[u8]>>) -> SnareResult<Self>
    {
        let bytes = bytes.into();
        let expected = layout_for(architecture).context_size();
        if bytes.len() != expected {
            return Err(SnareError::InvalidArgument(format!(
                "{architecture} context must be {expected} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self { architecture, bytes })
    }

    /// Architecture of the captured context.
    pub fn architecture(&self) -> Architecture
    {
        self.architecture
    }

    /// Layout describing the buffer.
    pub fn layout(&self) -> &'static dyn RegisterLayout
    {
        layout_for(self.architecture)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8]
    {
        &self.bytes
    }

    /// Raw bytes, mutable (backends fill the buffer in place).
    pub fn as_bytes_mut(&mut self) -> &mut [u8]
    {
        &mut self.bytes
    }

    /// Integer register `index`.
    ///
    /// ## Errors
    ///
    /// - `SnareError::InvalidRegisterIndex`: index out of range for the architecture
    pub fn register(&self, index: usize) -> SnareResult<u64>
    {
        let offset = self.offset(index)?;
        self.layout().read_value(&self.bytes, offset).ok_or(SnareError::InvalidRegisterIndex {
            index,
            count: self.layout().register_count(),
        })
    }

    /// Set integer register `index`.
    ///
    /// ## Errors
    ///
    /// - `SnareError::InvalidRegisterIndex`: index out of range for the architecture
    pub fn set_register(&mut self, index: usize, value: u64) -> SnareResult<()>
    {
        let offset = self.offset(index)?;
        let layout = self.layout();
        layout.write_value(&mut self.bytes, offset, value).ok_or(SnareError::InvalidRegisterIndex {
            index,
            count: layout.register_count(),
        })
    }

    /// Instruction pointer.
    pub fn instruction_pointer(&self) -> Address
    {
        let layout = self.layout();
        Address::new(layout.read_value(&self.bytes, layout.instruction_pointer_offset()).unwrap_or(0))
    }

    /// Set the instruction pointer.
    pub fn set_instruction_pointer(&mut self, address: Address)
    {
        let layout = self.layout();
        // The offset is always inside a buffer validated at construction.
        let _ = layout.write_value(&mut self.bytes, layout.instruction_pointer_offset(), address.value());
    }

    /// Flags register.
    pub fn flags(&self) -> u32
    {
        let offset = self.layout().eflags_offset();
        self.bytes
            .get(offset..offset + 4)
            .and_then(|b| b.try_into().ok())
            .map(u32::from_le_bytes)
            .unwrap_or(0)
    }

    fn offset(&self, index: usize) -> SnareResult<usize>
    {
        let layout = self.layout();
        layout.register_offset(index).ok_or(SnareError::InvalidRegisterIndex {
            index,
            count: layout.register_count(),
        })
    }
}

impl fmt::Debug for SavedContext
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let layout = self.layout();
        let mut map = f.debug_map();
        for index in 0..layout.register_count() {
            if let (Some(name), Ok(value)) = (layout.register_name(index), self.register(index)) {
                map.entry(&name, &format_args!("{value:#x}"));
            }
        }
        map.entry(&"ip", &format_args!("{:#x}", self.instruction_pointer()));
        map.finish()
    }
}

/// Live register view of one thread
///
/// Holds only the thread handle and the session's architecture; each call
/// fetches a fresh context from the backend.
#[derive(Clone)]
pub struct RegisterContext
{
    backend: Arc<dyn DebugBackend>,
    thread: Handle,
    thread_id: ThreadId,
    architecture: Architecture,
}

impl RegisterContext
{
    /// Register view of `thread` for a target of `architecture`.
    pub fn new(backend: Arc<dyn DebugBackend>, thread: Handle, thread_id: ThreadId, architecture: Architecture) -> Self
    {
        Self {
            backend,
            thread,
            thread_id,
            architecture,
        }
    }

    /// Architecture selected for this thread.
    pub fn architecture(&self) -> Architecture
    {
        self.architecture
    }

    /// Number of integer registers addressable by index.
    pub fn register_count(&self) -> usize
    {
        layout_for(self.architecture).register_count()
    }

    /// Read integer register `index` (encoding order).
    ///
    /// ## Errors
    ///
    /// - `SnareError::InvalidRegisterIndex`: index out of range, checked before any OS call
    /// - `SnareError::ContextFailed`: the context could not be fetched
    pub fn register(&self, index: usize) -> SnareResult<u64>
    {
        self.check_index(index)?;
        self.save()?.register(index)
    }

    /// Write integer register `index` (encoding order).
    ///
    /// ## Errors
    ///
    /// Same as [`RegisterContext::register`], plus a failed context write.
    pub fn set_register(&self, index: usize, value: u64) -> SnareResult<()>
    {
        self.check_index(index)?;
        let mut context = self.save()?;
        context.set_register(index, value)?;
        trace!(tid = %self.thread_id, index, value, "set register");
        self.load(&context)
    }

    /// Read the instruction pointer.
    ///
    /// ## Errors
    ///
    /// - `SnareError::ContextFailed`: the context could not be fetched
    pub fn instruction_pointer(&self) -> SnareResult<Address>
    {
        Ok(self.save()?.instruction_pointer())
    }

    /// Move the instruction pointer.
    ///
    /// ## Errors
    ///
    /// - `SnareError::ContextFailed`: the context could not be fetched or written
    pub fn set_instruction_pointer(&self, address: Address) -> SnareResult<()>
    {
        let mut context = self.save()?;
        context.set_instruction_pointer(address);
        trace!(tid = %self.thread_id, %address, "set instruction pointer");
        self.load(&context)
    }

    /// Capture the thread's complete context.
    ///
    /// ## Errors
    ///
    /// - `SnareError::ContextFailed`: the context could not be fetched
    pub fn save(&self) -> SnareResult<SavedContext>
    {
        self.backend.get_thread_context(self.thread, self.architecture)
    }

    /// Reinstate a context captured by [`RegisterContext::save`].
    ///
    /// ## Errors
    ///
    /// - `SnareError::InvalidArgument`: the snapshot belongs to another architecture
    /// - `SnareError::ContextFailed`: the context could not be written
    pub fn load(&self, context: &SavedContext) -> SnareResult<()>
    {
        if context.architecture() != self.architecture {
            return Err(SnareError::InvalidArgument(format!(
                "cannot load {} context into {} thread",
                context.architecture(),
                self.architecture
            )));
        }
        self.backend.set_thread_context(self.thread, context)
    }

    fn check_index(&self, index: usize) -> SnareResult<()>
    {
        let count = self.register_count();
        if index < count {
            Ok(())
        } else {
            Err(SnareError::InvalidRegisterIndex { index, count })
        }
    }
}

impl fmt::Debug for RegisterContext
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("RegisterContext")
            .field("thread", &self.thread_id)
            .field("architecture", &self.architecture)
            .finish()
    }
}
