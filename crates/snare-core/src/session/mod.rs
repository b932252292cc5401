//! # Debug Session
//!
//! A [`Session`] attaches to one target process and runs its debug-event loop
//! on a dedicated thread (`snare-event-loop`). It keeps track of the target's
//! threads, loaded modules and breakpoints, turns every OS event into a typed
//! [`Event`](crate::events::Event), and hands it to the handler registered for
//! that kind.
//!
//! ## Example
//!
//! ```rust,no_run
//! use snare_core::prelude::*;
//!
//! # fn demo(backend: std::sync::Arc<dyn DebugBackend>) -> SnareResult<()> {
//! let session = Session::attach(backend, ProcessId(1234))?;
//!
//! session.on_module_loaded(|_, event| {
//!     println!("{}", event.module);
//!     event.continue_event();
//! });
//! session.on_breakpoint(|_, event| {
//!     event.continue_event();
//! });
//! // Registered last: the loop holds the create-process event until a
//! // handler for it exists.
//! session.on_process_created(|_, event| {
//!     println!("{}", event.describe());
//!     event.continue_event();
//! });
//!
//! session.wait()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Handlers
//!
//! Handlers run synchronously on the event-loop thread; the target stays
//! stopped until the handler returns. A handler may register other handlers,
//! add breakpoints, and read or write memory and registers.
//!
//! Kinds without a handler are answered automatically, with two exceptions:
//! the create-process event and breakpoint traps at addresses the session
//! knows nothing about wait until a handler for them is registered.

mod dispatch;
pub mod handlers;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{mpsc, Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{info, warn};

use self::handlers::Handlers;
use crate::backend::DebugBackend;
use crate::breakpoint::Breakpoint;
use crate::error::{SnareError, SnareResult};
use crate::events::{
    BreakpointEvent, DebugEvent, DebugStringEvent, ExceptionEvent, ModuleLoadedEvent, ModuleUnloadedEvent, OtherDebugEvent,
    ProcessCreatedEvent, ProcessExitedEvent, ThreadCreatedEvent, ThreadExitedEvent,
};
use crate::image::Module;
use crate::launch::LaunchOptions;
use crate::memory::TargetMemory;
use crate::thread::Thread;
use crate::types::{Address, Architecture, Handle, ProcessId, Protection, ThreadId};

/// Name of the event-loop thread.
pub const EVENT_LOOP_THREAD: &str = "snare-event-loop";

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState
{
    /// Attach in progress
    Attaching,
    /// Attached; events are flowing
    Running,
    /// The target exited (terminal)
    Exited,
}

struct Registry
{
    state: SessionState,
    /// Thread created suspended by [`Session::launch`], resumed on first sight
    resume: Option<(ThreadId, Handle)>,
    threads: HashMap<ThreadId, Arc<Thread>>,
    modules: BTreeMap<Address, Arc<Module>>,
    breakpoints: HashMap<Address, Arc<Breakpoint>>,
}

struct Shared
{
    backend: Arc<dyn DebugBackend>,
    memory: TargetMemory,
    process_id: ProcessId,
    architecture: Architecture,
    registry: Mutex<Registry>,
    handlers: Mutex<Handlers>,
    handler_registered: Condvar,
    event_loop: Mutex<Option<JoinHandle<SnareResult<()>>>>,
    loop_thread: OnceLock<thread::ThreadId>,
    /// Process handle returned by [`DebugBackend::create_suspended`]
    launched_process: Option<Handle>,
}

impl Drop for Shared
{
    fn drop(&mut self)
    {
        if let Some(process) = self.launched_process {
            self.backend.close_handle(process);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T>
{
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to a debugging session
///
/// Cheap to clone; all clones refer to the same session.
#[derive(Clone)]
pub struct Session
{
    shared: Arc<Shared>,
}

impl Session
{
    /// Attach to a running process and start its event loop.
    ///
    /// Returns once the OS accepted the attach.
    ///
    /// ## Errors
    ///
    /// - `SnareError::AttachFailed`: the target's architecture could not be
    ///   determined or the OS refused to attach
    pub fn attach(backend: Arc<dyn DebugBackend>, pid: ProcessId) -> SnareResult<Session>
    {
        let architecture = backend.process_architecture(pid).map_err(|err| SnareError::AttachFailed {
            pid,
            reason: err.to_string(),
        })?;
        Self::new(backend, pid, architecture, None, None).start()
    }

    /// Start a program suspended, attach to it and start its event loop.
    ///
    /// The initial thread is resumed when the create-process event is
    /// processed, so no target code runs before the create-process handler.
    ///
    /// ## Errors
    ///
    /// - `SnareError::LaunchFailed`: the process could not be created
    /// - `SnareError::AttachFailed`: the OS refused to attach
    pub fn launch(backend: Arc<dyn DebugBackend>, options: &LaunchOptions) -> SnareResult<Session>
    {
        let launched = backend.create_suspended(options)?;
        let architecture = backend.process_architecture(launched.pid).unwrap_or_else(|err| {
            warn!(pid = %launched.pid, error = %err, "cannot determine target architecture, assuming host");
            Architecture::host()
        });

        let session = Self::new(
            backend,
            launched.pid,
            architecture,
            Some((launched.tid, launched.thread)),
            Some(launched.process),
        );
        session.shared.memory.bind(launched.process);
        info!(pid = %launched.pid, program = %options.program().display(), "launched target suspended");
        session.start()
    }

    fn new(
        backend: Arc<dyn DebugBackend>,
        process_id: ProcessId,
        architecture: Architecture,
        resume: Option<(ThreadId, Handle)>,
        launched_process: Option<Handle>,
    ) -> Self
    {
        let memory = TargetMemory::new(Arc::clone(&backend));
        Self {
            shared: Arc::new(Shared {
                backend,
                memory,
                process_id,
                architecture,
                registry: Mutex::new(Registry {
                    state: SessionState::Attaching,
                    resume,
                    threads: HashMap::new(),
                    modules: BTreeMap::new(),
                    breakpoints: HashMap::new(),
                }),
                handlers: Mutex::new(Handlers::default()),
                handler_registered: Condvar::new(),
                event_loop: Mutex::new(None),
                loop_thread: OnceLock::new(),
                launched_process,
            }),
        }
    }

    fn start(self) -> SnareResult<Session>
    {
        let (attached_tx, attached_rx) = mpsc::channel();
        let session = self.clone();
        let handle = thread::Builder::new()
            .name(EVENT_LOOP_THREAD.to_string())
            .spawn(move || session.event_loop(attached_tx))?;
        let _ = self.shared.loop_thread.set(handle.thread().id());

        match attached_rx.recv() {
            Ok(Ok(())) => {
                *lock(&self.shared.event_loop) = Some(handle);
                Ok(self)
            }
            Ok(Err(err)) => {
                let _ = handle.join();
                Err(err)
            }
            Err(_) => {
                let _ = handle.join();
                Err(SnareError::AttachFailed {
                    pid: self.shared.process_id,
                    reason: "event loop exited before attaching".to_string(),
                })
            }
        }
    }

    /// Block until the event loop ends and return its outcome.
    ///
    /// The loop ends after the process-exit event was handled, or on a fatal
    /// error. Returns `Ok(())` if the outcome was already collected by an
    /// earlier call.
    ///
    /// ## Errors
    ///
    /// - Whatever stopped the loop (`UnknownThread`, backend failures)
    /// - `SnareError::InvalidArgument`: called from a handler, which would deadlock
    pub fn wait(&self) -> SnareResult<()>
    {
        if self.is_event_loop_thread() {
            return Err(SnareError::InvalidArgument(
                "Session::wait called from the event-loop thread".to_string(),
            ));
        }
        let Some(handle) = lock(&self.shared.event_loop).take() else {
            return Ok(());
        };
        handle
            .join()
            .unwrap_or_else(|_| Err(SnareError::Backend("event loop panicked".to_string())))
    }

    fn is_event_loop_thread(&self) -> bool
    {
        self.shared.loop_thread.get() == Some(&thread::current().id())
    }

    /// Target process id.
    pub fn process_id(&self) -> ProcessId
    {
        self.shared.process_id
    }

    /// Target architecture, fixed for the whole session.
    pub fn architecture(&self) -> Architecture
    {
        self.shared.architecture
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState
    {
        lock(&self.shared.registry).state
    }

    /// Process handle, once known.
    pub fn process_handle(&self) -> Option<Handle>
    {
        self.shared.memory.process()
    }

    /// Backend driving this session.
    pub fn backend(&self) -> &Arc<dyn DebugBackend>
    {
        &self.shared.backend
    }

    /// Process-scoped memory handle.
    pub fn memory(&self) -> &TargetMemory
    {
        &self.shared.memory
    }

    /// Snapshot of the registered threads.
    pub fn threads(&self) -> Vec<Arc<Thread>>
    {
        lock(&self.shared.registry).threads.values().cloned().collect()
    }

    /// Registered thread with id `id`.
    pub fn thread(&self, id: ThreadId) -> Option<Arc<Thread>>
    {
        lock(&self.shared.registry).threads.get(&id).cloned()
    }

    /// Snapshot of the loaded modules, ordered by base address.
    pub fn modules(&self) -> Vec<Arc<Module>>
    {
        lock(&self.shared.registry).modules.values().cloned().collect()
    }

    /// Module loaded at `base`.
    pub fn module_at(&self, base: Address) -> Option<Arc<Module>>
    {
        lock(&self.shared.registry).modules.get(&base).cloned()
    }

    /// Module with a section containing `address`.
    pub fn module_containing(&self, address: Address) -> Option<Arc<Module>>
    {
        let registry = lock(&self.shared.registry);
        registry
            .modules
            .range(..=address)
            .rev()
            .map(|(_, module)| module)
            .find(|module| module.sections().iter().any(|section| section.contains(address)))
            .cloned()
    }

    /// Snapshot of the breakpoint table.
    pub fn breakpoints(&self) -> Vec<Arc<Breakpoint>>
    {
        lock(&self.shared.registry).breakpoints.values().cloned().collect()
    }

    /// Breakpoint at `address`.
    pub fn breakpoint(&self, address: Address) -> Option<Arc<Breakpoint>>
    {
        lock(&self.shared.registry).breakpoints.get(&address).cloned()
    }

    /// Create a (disabled) breakpoint at `address`.
    ///
    /// ## Errors
    ///
    /// - `SnareError::BreakpointExists`: the address already has one; the
    ///   existing breakpoint is left untouched
    pub fn add_breakpoint(&self, address: Address) -> SnareResult<Arc<Breakpoint>>
    {
        let mut registry = lock(&self.shared.registry);
        if registry.breakpoints.contains_key(&address) {
            return Err(SnareError::BreakpointExists(address));
        }
        let breakpoint = Arc::new(Breakpoint::new(address, self.shared.memory.clone()));
        registry.breakpoints.insert(address, Arc::clone(&breakpoint));
        Ok(breakpoint)
    }

    /// Disable and forget the breakpoint at `address`.
    ///
    /// ## Errors
    ///
    /// - `SnareError::NoBreakpoint`: nothing registered at `address`
    /// - `SnareError::BreakpointPatch`: the original bytes could not be
    ///   restored; the breakpoint stays registered
    pub fn remove_breakpoint(&self, address: Address) -> SnareResult<()>
    {
        let breakpoint = self.breakpoint(address).ok_or(SnareError::NoBreakpoint(address))?;
        breakpoint.set_enabled(false)?;
        lock(&self.shared.registry).breakpoints.remove(&address);
        Ok(())
    }

    /// Read target memory; returns the number of bytes read.
    pub fn read_memory(&self, address: Address, buffer: &mut [u8]) -> usize
    {
        self.shared.memory.read(address, buffer)
    }

    /// Write target memory; returns the number of bytes written.
    pub fn write_memory(&self, address: Address, data: &[u8]) -> usize
    {
        self.shared.memory.write(address, data)
    }

    /// Reserve and commit memory in the target.
    ///
    /// ## Errors
    ///
    /// See [`TargetMemory::allocate`].
    pub fn allocate_memory(&self, address: Option<Address>, size: usize, protection: Protection) -> SnareResult<Address>
    {
        self.shared.memory.allocate(address, size, protection)
    }

    /// Change the protection of target memory.
    ///
    /// ## Errors
    ///
    /// See [`TargetMemory::change_protection`].
    pub fn change_memory_protection(&self, address: Address, size: usize, protection: Protection) -> SnareResult<()>
    {
        self.shared.memory.change_protection(address, size, protection)
    }

    /// Flush the target's instruction cache for a range.
    ///
    /// ## Errors
    ///
    /// - `SnareError::FlushFailed`: the OS reported a failure
    pub fn flush_instruction_cache(&self, address: Address, size: usize) -> SnareResult<()>
    {
        self.shared.memory.flush_instruction_cache(address, size)
    }

    /// Make the running target stop with a breakpoint exception.
    ///
    /// The resulting trap is at an address the session does not know, so it
    /// is delivered to the [`on_breakpoint`](Session::on_breakpoint) handler.
    ///
    /// ## Errors
    ///
    /// - `SnareError::NotAttached`: no process handle yet
    /// - Backend error if the break could not be requested
    pub fn break_in(&self) -> SnareResult<()>
    {
        let process = self.process_handle().ok_or(SnareError::NotAttached)?;
        self.shared.backend.break_process(process)
    }

    fn register(&self, install: impl FnOnce(&mut Handlers))
    {
        install(&mut lock(&self.shared.handlers));
        self.shared.handler_registered.notify_all();
    }

    /// Handle the create-process event. Mandatory: the loop waits for it.
    pub fn on_process_created<F>(&self, handler: F)
    where
        F: Fn(&Session, ProcessCreatedEvent) + Send + Sync + 'static,
    {
        self.register(|h| h.process_created = Some(Arc::new(handler)));
    }

    /// Handle thread creation.
    pub fn on_thread_created<F>(&self, handler: F)
    where
        F: Fn(&Session, ThreadCreatedEvent) + Send + Sync + 'static,
    {
        self.register(|h| h.thread_created = Some(Arc::new(handler)));
    }

    /// Handle thread exit. The thread is already unregistered.
    pub fn on_thread_exited<F>(&self, handler: F)
    where
        F: Fn(&Session, ThreadExitedEvent) + Send + Sync + 'static,
    {
        self.register(|h| h.thread_exited = Some(Arc::new(handler)));
    }

    /// Handle process exit. The loop stops afterwards.
    pub fn on_process_exited<F>(&self, handler: F)
    where
        F: Fn(&Session, ProcessExitedEvent) + Send + Sync + 'static,
    {
        self.register(|h| h.process_exited = Some(Arc::new(handler)));
    }

    /// Handle exceptions other than breakpoint traps.
    ///
    /// Without a handler they are passed back to the target unhandled.
    pub fn on_exception<F>(&self, handler: F)
    where
        F: Fn(&Session, ExceptionEvent) + Send + Sync + 'static,
    {
        self.register(|h| h.exception = Some(Arc::new(handler)));
    }

    /// Handle breakpoint traps at addresses without a registered breakpoint
    /// (the loader breakpoint, [`break_in`](Session::break_in), traps compiled
    /// into the target). Mandatory: the loop waits for it when such a trap
    /// arrives.
    pub fn on_breakpoint<F>(&self, handler: F)
    where
        F: Fn(&Session, BreakpointEvent) + Send + Sync + 'static,
    {
        self.register(|h| h.breakpoint = Some(Arc::new(handler)));
    }

    /// Handle image loads. The module is already published.
    pub fn on_module_loaded<F>(&self, handler: F)
    where
        F: Fn(&Session, ModuleLoadedEvent) + Send + Sync + 'static,
    {
        self.register(|h| h.module_loaded = Some(Arc::new(handler)));
    }

    /// Handle image unloads. The module is already unpublished.
    pub fn on_module_unloaded<F>(&self, handler: F)
    where
        F: Fn(&Session, ModuleUnloadedEvent) + Send + Sync + 'static,
    {
        self.register(|h| h.module_unloaded = Some(Arc::new(handler)));
    }

    /// Handle debug strings.
    pub fn on_debug_string<F>(&self, handler: F)
    where
        F: Fn(&Session, DebugStringEvent) + Send + Sync + 'static,
    {
        self.register(|h| h.debug_string = Some(Arc::new(handler)));
    }

    /// Handle every other event kind.
    pub fn on_other<F>(&self, handler: F)
    where
        F: Fn(&Session, OtherDebugEvent) + Send + Sync + 'static,
    {
        self.register(|h| h.other = Some(Arc::new(handler)));
    }
}

impl Session
{
    /// Route every event kind to one handler, wrapped in [`DebugEvent`].
    ///
    /// Replaces all per-kind handlers, including the mandatory ones.
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&Session, DebugEvent) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        macro_rules! forward {
            ($variant:ident) => {{
                let handler = Arc::clone(&handler);
                Some(Arc::new(move |session: &Session, event| handler(session, DebugEvent::$variant(event))))
            }};
        }
        self.register(|h| {
            h.process_created = forward!(ProcessCreated);
            h.thread_created = forward!(ThreadCreated);
            h.thread_exited = forward!(ThreadExited);
            h.process_exited = forward!(ProcessExited);
            h.exception = forward!(ExceptionRaised);
            h.breakpoint = forward!(Breakpoint);
            h.module_loaded = forward!(ModuleLoaded);
            h.module_unloaded = forward!(ModuleUnloaded);
            h.debug_string = forward!(DebugStringEmitted);
            h.other = forward!(Other);
        });
    }
}

impl fmt::Debug for Session
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let registry = lock(&self.shared.registry);
        f.debug_struct("Session")
            .field("pid", &self.shared.process_id)
            .field("architecture", &self.shared.architecture)
            .field("state", &registry.state)
            .field("threads", &registry.threads.len())
            .field("modules", &registry.modules.len())
            .field("breakpoints", &registry.breakpoints.len())
            .finish()
    }
}
