//! # Software Breakpoints
//!
//! A software breakpoint replaces the first byte of an instruction with the
//! `int3` trap (`0xCC`). When the target executes it, the OS reports an
//! `EXCEPTION_BREAKPOINT` at the patched address and the session routes the
//! event to the breakpoint's hit handler.
//!
//! ## Lifecycle
//!
//! ```text
//! disabled ──set_enabled(true)──> enabled    (save original bytes, write trap)
//! enabled  ──set_enabled(false)─> disabled   (write original bytes back)
//! ```
//!
//! Setting the current state again is a no-op: the original bytes are saved
//! exactly once per enable, so they are never overwritten with the trap.
//!
//! After a hit the instruction pointer sits one byte past the trap. Handlers
//! that want the original instruction to run must disable the breakpoint,
//! flush the instruction cache and move the instruction pointer back to
//! [`Breakpoint::address`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use smallvec::{smallvec, SmallVec};
use tracing::debug;

use crate::error::{SnareError, SnareResult};
use crate::memory::TargetMemory;
use crate::session::handlers::BreakpointHandler;
use crate::types::Address;

/// `int3`
pub const TRAP_OPCODE: u8 = 0xCC;

type PatchBytes = SmallVec<[u8; 4]>;

struct BreakpointState
{
    enabled: bool,
    saved: PatchBytes,
    on_hit: Option<BreakpointHandler>,
}

/// One patched code address
pub struct Breakpoint
{
    address: Address,
    memory: TargetMemory,
    trap: PatchBytes,
    hits: AtomicU64,
    state: Mutex<BreakpointState>,
}

impl Breakpoint
{
    /// A disabled breakpoint at `address`.
    pub(crate) fn new(address: Address, memory: TargetMemory) -> Self
    {
        Self {
            address,
            memory,
            trap: smallvec![TRAP_OPCODE],
            hits: AtomicU64::new(0),
            state: Mutex::new(BreakpointState {
                enabled: false,
                saved: PatchBytes::new(),
                on_hit: None,
            }),
        }
    }

    /// Patched address.
    pub fn address(&self) -> Address
    {
        self.address
    }

    /// `true` while the trap is written to target memory.
    pub fn is_enabled(&self) -> bool
    {
        self.lock().enabled
    }

    /// Bytes the trap replaced, empty while disabled.
    pub fn saved_bytes(&self) -> Vec<u8>
    {
        self.lock().saved.to_vec()
    }

    /// Number of times the session routed a hit to this breakpoint.
    pub fn hit_count(&self) -> u64
    {
        self.hits.load(Ordering::Relaxed)
    }

    /// Install or remove the trap.
    ///
    /// The call does not flush the instruction cache; callers patching code
    /// the target may already have fetched should flush afterwards.
    ///
    /// ## Errors
    ///
    /// - `SnareError::BreakpointPatch`: the original bytes could not be read,
    ///   or the trap (or the original bytes) could not be written. The
    ///   breakpoint keeps its previous state.
    pub fn set_enabled(&self, enabled: bool) -> SnareResult<()>
    {
        let mut state = self.lock();
        if state.enabled == enabled {
            return Ok(());
        }

        if enabled {
            let mut saved: PatchBytes = smallvec![0u8; self.trap.len()];
            let read = self.memory.read(self.address, &mut saved);
            if read != saved.len() {
                return Err(self.patch_error("enable", read));
            }
            let written = self.memory.write(self.address, &self.trap);
            if written != self.trap.len() {
                return Err(self.patch_error("enable", written));
            }
            state.saved = saved;
        } else {
            let written = self.memory.write(self.address, &state.saved);
            if written != state.saved.len() {
                return Err(self.patch_error("disable", written));
            }
            state.saved.clear();
        }

        state.enabled = enabled;
        debug!(address = %self.address, enabled, "breakpoint toggled");
        Ok(())
    }

    /// Install the hit handler, replacing any previous one.
    pub fn on_hit<F>(&self, handler: F)
    where
        F: Fn(&crate::session::Session, crate::events::BreakpointEvent) + Send + Sync + 'static,
    {
        self.lock().on_hit = Some(Arc::new(handler));
    }

    /// Handler to run for a hit, if any.
    pub(crate) fn hit_handler(&self) -> Option<BreakpointHandler>
    {
        self.lock().on_hit.clone()
    }

    pub(crate) fn record_hit(&self) -> u64
    {
        self.hits.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn patch_error(&self, action: &'static str, transferred: usize) -> SnareError
    {
        SnareError::BreakpointPatch {
            action,
            address: self.address,
            transferred,
            expected: self.trap.len(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakpointState>
    {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Breakpoint
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let state = self.lock();
        f.debug_struct("Breakpoint")
            .field("address", &self.address)
            .field("enabled", &state.enabled)
            .field("saved", &state.saved.as_slice())
            .field("has_handler", &state.on_hit.is_some())
            .field("hits", &self.hit_count())
            .finish()
    }
}

impl fmt::Display for Breakpoint
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "breakpoint: 0x{:X}", self.address.value())
    }
}
