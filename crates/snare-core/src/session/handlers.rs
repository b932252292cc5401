//! Handler slots.
//!
//! One optional handler per event kind. Registration replaces the previous
//! handler and wakes the event loop if it is waiting for a mandatory one.

use std::sync::Arc;

use super::Session;
use crate::events::{
    BreakpointEvent, DebugStringEvent, ExceptionEvent, ModuleLoadedEvent, ModuleUnloadedEvent, OtherDebugEvent,
    ProcessCreatedEvent, ProcessExitedEvent, ThreadCreatedEvent, ThreadExitedEvent,
};

/// Shared handler for events of type `E`
pub type Handler<E> = Arc<dyn Fn(&Session, E) + Send + Sync>;

/// Handler for breakpoint hits
pub type BreakpointHandler = Handler<BreakpointEvent>;

#[derive(Default)]
pub(crate) struct Handlers
{
    pub(crate) process_created: Option<Handler<ProcessCreatedEvent>>,
    pub(crate) thread_created: Option<Handler<ThreadCreatedEvent>>,
    pub(crate) thread_exited: Option<Handler<ThreadExitedEvent>>,
    pub(crate) process_exited: Option<Handler<ProcessExitedEvent>>,
    pub(crate) exception: Option<Handler<ExceptionEvent>>,
    pub(crate) breakpoint: Option<BreakpointHandler>,
    pub(crate) module_loaded: Option<Handler<ModuleLoadedEvent>>,
    pub(crate) module_unloaded: Option<Handler<ModuleUnloadedEvent>>,
    pub(crate) debug_string: Option<Handler<DebugStringEvent>>,
    pub(crate) other: Option<Handler<OtherDebugEvent>>,
}
