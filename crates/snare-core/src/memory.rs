//! # Target Memory
//!
//! Process-scoped access to the debuggee's address space.
//!
//! [`TargetMemory`] is a cheap clone of the session's backend plus the process
//! handle. The session, every module, section, symbol and breakpoint hold one,
//! so they can touch target memory without a back-reference to the session.
//!
//! The process handle is only known once the create-process event has been
//! processed (or the session started the process itself); until then every
//! transfer reports zero bytes.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::{trace, warn};

use crate::backend::DebugBackend;
use crate::error::{SnareError, SnareResult};
use crate::types::{Address, Handle, Protection};

/// Shared handle to the debuggee's memory
#[derive(Clone)]
pub struct TargetMemory
{
    backend: Arc<dyn DebugBackend>,
    process: Arc<OnceCell<Handle>>,
}

impl std::fmt::Debug for TargetMemory
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("TargetMemory").field("process", &self.process.get()).finish()
    }
}

impl TargetMemory
{
    /// Memory of a process whose handle is not known yet.
    pub fn new(backend: Arc<dyn DebugBackend>) -> Self
    {
        Self {
            backend,
            process: Arc::new(OnceCell::new()),
        }
    }

    /// Memory of a process with a known handle.
    pub fn with_process(backend: Arc<dyn DebugBackend>, process: Handle) -> Self
    {
        let memory = Self::new(backend);
        memory.bind(process);
        memory
    }

    /// Record the process handle. Only the first call has an effect.
    pub fn bind(&self, process: Handle) -> bool
    {
        self.process.set(process).is_ok()
    }

    /// Process handle, once known.
    pub fn process(&self) -> Option<Handle>
    {
        self.process.get().copied()
    }

    /// Backend this memory goes through.
    pub fn backend(&self) -> &Arc<dyn DebugBackend>
    {
        &self.backend
    }

    /// Read up to `buffer.len()` bytes at `address`.
    ///
    /// Returns the number of bytes actually read; `0` when nothing could be
    /// read or no process is attached yet.
    pub fn read(&self, address: Address, buffer: &mut [u8]) -> usize
    {
        let Some(process) = self.process() else {
            warn!(%address, "memory read before process handle is known");
            return 0;
        };
        let read = self.backend.read_memory(process, address, buffer);
        trace!(%address, requested = buffer.len(), read, "read target memory");
        read
    }

    /// Read exactly `len` bytes, or `None` on a short read.
    pub fn read_vec(&self, address: Address, len: usize) -> Option<Vec<u8>>
    {
        let mut buffer = vec![0u8; len];
        (self.read(address, &mut buffer) == len).then_some(buffer)
    }

    /// Write `data` at `address`; returns the number of bytes written.
    pub fn write(&self, address: Address, data: &[u8]) -> usize
    {
        let Some(process) = self.process() else {
            warn!(%address, "memory write before process handle is known");
            return 0;
        };
        let written = self.backend.write_memory(process, address, data);
        trace!(%address, requested = data.len(), written, "wrote target memory");
        written
    }

    /// Reserve and commit `size` bytes in the target.
    ///
    /// ## Errors
    ///
    /// - `SnareError::NotAttached`: no process handle yet
    /// - `SnareError::InvalidArgument`: unsupported protection combination
    /// - `SnareError::Backend`: the OS refused the allocation
    pub fn allocate(&self, address: Option<Address>, size: usize, protection: Protection) -> SnareResult<Address>
    {
        let process = self.process().ok_or(SnareError::NotAttached)?;
        protection.to_page_flags()?;
        self.backend
            .allocate_memory(process, address, size, protection)
            .ok_or_else(|| SnareError::Backend(format!("failed to allocate {size} bytes ({protection})")))
    }

    /// Change the protection of `[address, address + size)`.
    ///
    /// ## Errors
    ///
    /// Same as [`TargetMemory::allocate`].
    pub fn change_protection(&self, address: Address, size: usize, protection: Protection) -> SnareResult<()>
    {
        let process = self.process().ok_or(SnareError::NotAttached)?;
        protection.to_page_flags()?;
        if self.backend.change_protection(process, address, size, protection) {
            Ok(())
        } else {
            Err(SnareError::Backend(format!(
                "failed to change protection of {size} bytes at {address} to {protection}"
            )))
        }
    }

    /// Invalidate the instruction cache for `[address, address + size)`.
    ///
    /// ## Errors
    ///
    /// - `SnareError::NotAttached`: no process handle yet
    /// - `SnareError::FlushFailed`: the OS reported a failure
    pub fn flush_instruction_cache(&self, address: Address, size: usize) -> SnareResult<()>
    {
        let process = self.process().ok_or(SnareError::NotAttached)?;
        if self.backend.flush_instruction_cache(process, address, size) {
            Ok(())
        } else {
            Err(SnareError::FlushFailed {
                start: address,
                end: address + size as u64,
            })
        }
    }
}
