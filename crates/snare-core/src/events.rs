//! # Debug Events
//!
//! Typed events delivered to session handlers, and the acknowledgment
//! protocol attached to each of them.
//!
//! Every event is an [`Event<P>`]: the reporting process, the reporting
//! thread (when known), a kind-specific payload `P`, and an
//! [`Acknowledgment`]. Payload fields are reachable directly on the event
//! through `Deref`:
//!
//! ```rust,no_run
//! # use snare_core::events::ExceptionEvent;
//! fn on_exception(event: ExceptionEvent)
//! {
//!     println!("exception 0x{:08x} at {}", event.code, event.address);
//!     let _ = event.exception_not_handled();
//! }
//! ```
//!
//! ## Acknowledgment
//!
//! The OS keeps the debuggee stopped until the debugger answers each event
//! with a continuation code. A handler answers with
//! [`Event::continue_event`] or [`Event::exception_not_handled`]; the answer
//! is recorded and the event loop hands it to the OS as soon as the handler
//! returns, on the loop thread. Only the first answer counts. An event that is
//! never answered (dropped, or the handler panicked) gets its kind's default
//! answer and an error is logged, so every OS event is answered exactly once.
//!
//! Synthetic events (a module unload inferred by the session, not reported by
//! the OS) carry an acknowledgment that has nothing to answer.

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{error, warn};

use crate::backend::ContinueStatus;
use crate::breakpoint::Breakpoint;
use crate::image::Module;
use crate::thread::Thread;
use crate::types::{Address, ProcessId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckState
{
    Pending,
    Decided(ContinueStatus),
    Closed,
}

type AckSlot = Arc<Mutex<AckState>>;

fn lock(slot: &AckSlot) -> MutexGuard<'_, AckState>
{
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Exactly-once answer to one debug event
pub struct Acknowledgment
{
    slot: AckSlot,
    default: ContinueStatus,
    synthetic: bool,
}

impl Acknowledgment
{
    /// Guard for an OS event, plus the loop's side of it.
    pub(crate) fn new(default: ContinueStatus) -> (Self, PendingAcknowledgment)
    {
        let slot = Arc::new(Mutex::new(AckState::Pending));
        let ack = Self {
            slot: Arc::clone(&slot),
            default,
            synthetic: false,
        };
        (ack, PendingAcknowledgment { slot, default })
    }

    /// Guard for an event with no OS counterpart.
    pub(crate) fn synthetic() -> Self
    {
        Self {
            slot: Arc::new(Mutex::new(AckState::Pending)),
            default: ContinueStatus::Continue,
            synthetic: true,
        }
    }

    /// Record `status` as the answer; returns `false` when an answer was
    /// already given (the call is then ignored).
    pub fn acknowledge(&self, status: ContinueStatus) -> bool
    {
        let mut state = lock(&self.slot);
        match *state {
            AckState::Pending => {
                *state = AckState::Decided(status);
                true
            }
            AckState::Decided(previous) => {
                warn!(?previous, ignored = ?status, "event acknowledged twice");
                false
            }
            AckState::Closed => {
                warn!(ignored = ?status, "event acknowledged after the event loop moved on");
                false
            }
        }
    }

    /// `true` once an answer was recorded.
    pub fn is_acknowledged(&self) -> bool
    {
        !matches!(*lock(&self.slot), AckState::Pending)
    }

    /// `true` for events the session made up.
    pub fn is_synthetic(&self) -> bool
    {
        self.synthetic
    }

    /// Answer used when the event is never acknowledged.
    pub fn default_status(&self) -> ContinueStatus
    {
        self.default
    }
}

impl Drop for Acknowledgment
{
    fn drop(&mut self)
    {
        let mut state = lock(&self.slot);
        if *state == AckState::Pending {
            if !self.synthetic {
                error!(status = ?self.default, "debug event dropped without acknowledgment, applying default");
            }
            *state = AckState::Decided(self.default);
        }
    }
}

impl fmt::Debug for Acknowledgment
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Acknowledgment")
            .field("state", &*lock(&self.slot))
            .field("default", &self.default)
            .field("synthetic", &self.synthetic)
            .finish()
    }
}

/// Event-loop side of an [`Acknowledgment`]
pub(crate) struct PendingAcknowledgment
{
    slot: AckSlot,
    default: ContinueStatus,
}

impl PendingAcknowledgment
{
    /// Take the recorded answer and close the slot.
    pub(crate) fn resolve(self) -> ContinueStatus
    {
        let mut state = lock(&self.slot);
        let status = match *state {
            AckState::Decided(status) => status,
            _ => {
                error!(status = ?self.default, "handler kept debug event without acknowledging it, applying default");
                self.default
            }
        };
        *state = AckState::Closed;
        status
    }
}

/// A debug event of payload type `P`
pub struct Event<P>
{
    process_id: ProcessId,
    thread: Option<Arc<Thread>>,
    payload: P,
    ack: Acknowledgment,
}

impl<P> Event<P>
{
    pub(crate) fn new(process_id: ProcessId, thread: Option<Arc<Thread>>, payload: P, ack: Acknowledgment) -> Self
    {
        Self {
            process_id,
            thread,
            payload,
            ack,
        }
    }

    /// Reporting process.
    pub fn process_id(&self) -> ProcessId
    {
        self.process_id
    }

    /// Reporting thread, when the event has one.
    pub fn thread(&self) -> Option<&Arc<Thread>>
    {
        self.thread.as_ref()
    }

    /// Kind-specific data.
    pub fn payload(&self) -> &P
    {
        &self.payload
    }

    /// Resume the target normally.
    ///
    /// Returns `false` if the event was already acknowledged.
    pub fn continue_event(&self) -> bool
    {
        self.ack.acknowledge(ContinueStatus::Continue)
    }

    /// Resume the target and let it handle the exception itself.
    ///
    /// Returns `false` if the event was already acknowledged.
    pub fn exception_not_handled(&self) -> bool
    {
        self.ack.acknowledge(ContinueStatus::ExceptionNotHandled)
    }

    /// The event's acknowledgment guard.
    pub fn acknowledgment(&self) -> &Acknowledgment
    {
        &self.ack
    }
}

impl<P> Deref for Event<P>
{
    type Target = P;

    fn deref(&self) -> &Self::Target
    {
        &self.payload
    }
}

impl<P: Describe> Event<P>
{
    /// One-line human-readable description.
    #[must_use]
    pub fn describe(&self) -> String
    {
        let mut description = self.payload.describe();
        if let Some(thread) = &self.thread {
            description.push_str(&format!(" ({thread})"));
        }
        description
    }
}

impl<P: fmt::Debug> fmt::Debug for Event<P>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Event")
            .field("process_id", &self.process_id)
            .field("thread", &self.thread.as_ref().map(|t| t.id()))
            .field("payload", &self.payload)
            .field("ack", &self.ack)
            .finish()
    }
}

/// Human-readable form of an event payload
pub trait Describe
{
    /// One-line description.
    fn describe(&self) -> String;
}

/// The target process was created (or attached to)
#[derive(Debug, Clone)]
pub struct ProcessCreated
{
    /// Main executable image
    pub module: Arc<Module>,
}

/// A thread was created
#[derive(Debug, Clone, Copy)]
pub struct ThreadCreated
{
    /// Entry point of the thread
    pub start_address: Address,
}

/// A thread exited
#[derive(Debug, Clone, Copy)]
pub struct ThreadExited
{
    /// Thread exit code
    pub exit_code: u32,
}

/// The target process exited
#[derive(Debug, Clone, Copy)]
pub struct ProcessExited
{
    /// Process exit code
    pub exit_code: u32,
}

/// A non-breakpoint exception was raised
#[derive(Debug, Clone, Copy)]
pub struct ExceptionRaised
{
    /// NTSTATUS exception code
    pub code: u32,
    /// Faulting instruction address
    pub address: Address,
    /// `true` when the target has not seen the exception yet
    pub first_chance: bool,
}

/// A breakpoint trap was executed
#[derive(Debug, Clone)]
pub struct BreakpointHit
{
    /// Address of the trap instruction
    pub address: Address,
    /// Registered breakpoint at `address`, if any
    pub breakpoint: Option<Arc<Breakpoint>>,
}

/// An image was mapped
#[derive(Debug, Clone)]
pub struct ModuleLoaded
{
    /// The parsed image
    pub module: Arc<Module>,
}

/// An image was unmapped
#[derive(Debug, Clone)]
pub struct ModuleUnloaded
{
    /// The image, already removed from the session
    pub module: Arc<Module>,
}

/// The target emitted a debug string
#[derive(Debug, Clone)]
pub struct DebugStringEmitted
{
    /// Decoded text, trailing NULs trimmed
    pub message: String,
}

/// Any other event (RIP, unknown codes)
#[derive(Debug, Clone)]
pub struct OtherEvent
{
    /// Short kind name
    pub kind: &'static str,
    /// Details, if any
    pub details: Option<String>,
}

impl Describe for ProcessCreated
{
    fn describe(&self) -> String
    {
        format!("process created: {}", self.module)
    }
}

impl Describe for ThreadCreated
{
    fn describe(&self) -> String
    {
        format!("thread created at {}", self.start_address)
    }
}

impl Describe for ThreadExited
{
    fn describe(&self) -> String
    {
        format!("thread exited with code {}", self.exit_code)
    }
}

impl Describe for ProcessExited
{
    fn describe(&self) -> String
    {
        format!("process exited with code {}", self.exit_code)
    }
}

impl Describe for ExceptionRaised
{
    fn describe(&self) -> String
    {
        let chance = if self.first_chance { "first" } else { "second" };
        format!("exception 0x{:08X} at {} ({chance} chance)", self.code, self.address)
    }
}

impl Describe for BreakpointHit
{
    fn describe(&self) -> String
    {
        match &self.breakpoint {
            Some(_) => format!("breakpoint hit at {}", self.address),
            None => format!("breakpoint exception at {}", self.address),
        }
    }
}

impl Describe for ModuleLoaded
{
    fn describe(&self) -> String
    {
        format!("module loaded: {}", self.module)
    }
}

impl Describe for ModuleUnloaded
{
    fn describe(&self) -> String
    {
        format!("module unloaded: {}", self.module)
    }
}

impl Describe for DebugStringEmitted
{
    fn describe(&self) -> String
    {
        format!("debug string: {}", self.message)
    }
}

impl Describe for OtherEvent
{
    fn describe(&self) -> String
    {
        match &self.details {
            Some(details) => format!("{} event: {details}", self.kind),
            None => format!("{} event", self.kind),
        }
    }
}

/// Target process created
pub type ProcessCreatedEvent = Event<ProcessCreated>;
/// Thread created
pub type ThreadCreatedEvent = Event<ThreadCreated>;
/// Thread exited
pub type ThreadExitedEvent = Event<ThreadExited>;
/// Target process exited
pub type ProcessExitedEvent = Event<ProcessExited>;
/// Exception other than a breakpoint trap
pub type ExceptionEvent = Event<ExceptionRaised>;
/// Breakpoint trap
pub type BreakpointEvent = Event<BreakpointHit>;
/// Image mapped
pub type ModuleLoadedEvent = Event<ModuleLoaded>;
/// Image unmapped
pub type ModuleUnloadedEvent = Event<ModuleUnloaded>;
/// Debug string output
pub type DebugStringEvent = Event<DebugStringEmitted>;
/// Anything else
pub type OtherDebugEvent = Event<OtherEvent>;

/// Any debug event
#[derive(Debug)]
pub enum DebugEvent
{
    /// See [`ProcessCreated`]
    ProcessCreated(ProcessCreatedEvent),
    /// See [`ThreadCreated`]
    ThreadCreated(ThreadCreatedEvent),
    /// See [`ThreadExited`]
    ThreadExited(ThreadExitedEvent),
    /// See [`ExceptionRaised`]
    ExceptionRaised(ExceptionEvent),
    /// See [`BreakpointHit`]
    Breakpoint(BreakpointEvent),
    /// See [`ProcessExited`]
    ProcessExited(ProcessExitedEvent),
    /// See [`ModuleLoaded`]
    ModuleLoaded(ModuleLoadedEvent),
    /// See [`ModuleUnloaded`]
    ModuleUnloaded(ModuleUnloadedEvent),
    /// See [`DebugStringEmitted`]
    DebugStringEmitted(DebugStringEvent),
    /// See [`OtherEvent`]
    Other(OtherDebugEvent),
}

macro_rules! each_event {
    ($self:expr, $event:ident => $body:expr) => {
        match $self {
            DebugEvent::ProcessCreated($event) => $body,
            DebugEvent::ThreadCreated($event) => $body,
            DebugEvent::ThreadExited($event) => $body,
            DebugEvent::ExceptionRaised($event) => $body,
            DebugEvent::Breakpoint($event) => $body,
            DebugEvent::ProcessExited($event) => $body,
            DebugEvent::ModuleLoaded($event) => $body,
            DebugEvent::ModuleUnloaded($event) => $body,
            DebugEvent::DebugStringEmitted($event) => $body,
            DebugEvent::Other($event) => $body,
        }
    };
}

impl DebugEvent
{
    /// Reporting process.
    pub fn process_id(&self) -> ProcessId
    {
        each_event!(self, event => event.process_id())
    }

    /// Reporting thread, when the event has one.
    pub fn thread(&self) -> Option<&Arc<Thread>>
    {
        each_event!(self, event => event.thread())
    }

    /// The event's acknowledgment guard.
    pub fn acknowledgment(&self) -> &Acknowledgment
    {
        each_event!(self, event => event.acknowledgment())
    }

    /// One-line human-readable description.
    #[must_use]
    pub fn describe(&self) -> String
    {
        each_event!(self, event => event.describe())
    }

    /// Resume the target normally. Returns `false` if already acknowledged.
    pub fn continue_event(&self) -> bool
    {
        self.acknowledgment().acknowledge(ContinueStatus::Continue)
    }

    /// Resume the target with the exception unhandled. Returns `false` if
    /// already acknowledged.
    pub fn exception_not_handled(&self) -> bool
    {
        self.acknowledgment().acknowledge(ContinueStatus::ExceptionNotHandled)
    }

    /// Answer with what the session would have done without a handler.
    pub fn acknowledge_default(&self) -> bool
    {
        let ack = self.acknowledgment();
        ack.acknowledge(ack.default_status())
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_first_acknowledgment_wins()
    {
        let (ack, pending) = Acknowledgment::new(ContinueStatus::Continue);
        assert!(ack.acknowledge(ContinueStatus::ExceptionNotHandled));
        assert!(!ack.acknowledge(ContinueStatus::Continue));
        drop(ack);
        assert_eq!(pending.resolve(), ContinueStatus::ExceptionNotHandled);
    }

    #[test]
    fn test_dropped_event_gets_default()
    {
        let (ack, pending) = Acknowledgment::new(ContinueStatus::ExceptionNotHandled);
        drop(ack);
        assert_eq!(pending.resolve(), ContinueStatus::ExceptionNotHandled);
    }

    #[test]
    fn test_kept_event_resolves_to_default_and_closes()
    {
        let (ack, pending) = Acknowledgment::new(ContinueStatus::Continue);
        assert_eq!(pending.resolve(), ContinueStatus::Continue);
        assert!(ack.is_acknowledged());
        assert!(!ack.acknowledge(ContinueStatus::ExceptionNotHandled));
    }

    #[test]
    fn test_describe_payloads()
    {
        let exception = ExceptionRaised {
            code: 0xC000_0005,
            address: Address::new(0x1000),
            first_chance: true,
        };
        assert_eq!(exception.describe(), "exception 0xC0000005 at 0x1000 (first chance)");

        let other = OtherEvent {
            kind: "rip",
            details: Some("error 5".into()),
        };
        let event = Event::new(ProcessId(4), None, other, Acknowledgment::synthetic());
        assert_eq!(event.describe(), "rip event: error 5");
        assert!(event.acknowledgment().is_synthetic());
        assert!(event.continue_event());
    }
}
