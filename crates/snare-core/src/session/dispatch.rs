//! Event loop and per-kind dispatch.
//!
//! Every OS event goes through `Session::dispatch`: registry side effects
//! first, then the handler (or the kind's default answer), then exactly one
//! `continue_event` on the loop thread.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{mpsc, Arc, PoisonError};

use tracing::{debug, error, info, trace};

use super::handlers::{Handler, Handlers};
use super::{lock, Session, SessionState};
use crate::backend::{ContinueStatus, RawDebugEvent, RawEventPayload, EXCEPTION_BREAKPOINT, STATUS_WX86_BREAKPOINT};
use crate::error::{SnareError, SnareResult};
use crate::events::{
    Acknowledgment, BreakpointHit, DebugStringEmitted, Event, ExceptionRaised, ModuleLoaded, ModuleUnloaded,
    OtherEvent, ProcessCreated, ProcessExited, ThreadCreated, ThreadExited,
};
use crate::image::Module;
use crate::thread::Thread;
use crate::types::{Address, Handle, ProcessId, ThreadId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow
{
    Continue,
    Stop,
}

fn is_trap(code: u32) -> bool
{
    code == EXCEPTION_BREAKPOINT || code == STATUS_WX86_BREAKPOINT
}

fn default_status(payload: &RawEventPayload) -> ContinueStatus
{
    match payload {
        RawEventPayload::Exception { code, .. } if !is_trap(*code) => ContinueStatus::ExceptionNotHandled,
        _ => ContinueStatus::Continue,
    }
}

impl Session
{
    /// Body of the event-loop thread.
    pub(super) fn event_loop(&self, attached: mpsc::Sender<SnareResult<()>>) -> SnareResult<()>
    {
        if let Err(err) = self.attach_target() {
            let _ = attached.send(Err(err));
            return Ok(());
        }
        let _ = attached.send(Ok(()));

        let outcome = self.run();
        match &outcome {
            Ok(()) => info!(pid = %self.shared.process_id, "event loop finished"),
            Err(err) => error!(pid = %self.shared.process_id, error = %err, "event loop stopped"),
        }
        outcome
    }

    fn attach_target(&self) -> SnareResult<()>
    {
        let pid = self.shared.process_id;
        self.shared.backend.attach(pid).map_err(|err| match err {
            err @ SnareError::AttachFailed { .. } => err,
            other => SnareError::AttachFailed {
                pid,
                reason: other.to_string(),
            },
        })?;
        self.shared.backend.set_kill_on_exit(false)?;

        lock(&self.shared.registry).state = SessionState::Running;
        info!(%pid, architecture = %self.shared.architecture, "attached");
        Ok(())
    }

    fn run(&self) -> SnareResult<()>
    {
        loop {
            let Some(raw) = self.shared.backend.wait_for_event(None)? else {
                continue;
            };
            if self.dispatch(raw)? == Flow::Stop {
                return Ok(());
            }
        }
    }

    fn dispatch(&self, raw: RawDebugEvent) -> SnareResult<Flow>
    {
        let RawDebugEvent {
            process_id,
            thread_id,
            payload,
        } = raw;
        debug!(pid = %process_id, tid = %thread_id, kind = payload.kind(), "debug event");

        let (ack, pending) = Acknowledgment::new(default_status(&payload));
        let outcome = self.route(process_id, thread_id, payload, ack);

        let status = pending.resolve();
        trace!(pid = %process_id, tid = %thread_id, ?status, "continuing");
        self.shared.backend.continue_event(process_id, thread_id, status)?;
        outcome
    }

    fn route(&self, pid: ProcessId, tid: ThreadId, payload: RawEventPayload, ack: Acknowledgment) -> SnareResult<Flow>
    {
        match payload {
            RawEventPayload::CreateProcess {
                process,
                thread,
                file,
                image_base,
            } => {
                if self.shared.memory.bind(process) {
                    debug!(%pid, %process, "process handle recorded");
                }
                let thread = self.register_thread(thread, tid);
                self.resume_if_launched(thread.id());

                let module = Arc::new(Module::load(self.shared.memory.clone(), file, image_base));
                self.publish_module(pid, Some(&thread), Arc::clone(&module));

                let handler = self.wait_for_handler(|h| h.process_created.clone());
                self.invoke(handler, Event::new(pid, Some(thread), ProcessCreated { module }, ack));
            }

            RawEventPayload::CreateThread { thread, start_address } => {
                let thread = self.register_thread(thread, tid);
                self.resume_if_launched(thread.id());
                let event = Event::new(pid, Some(thread), ThreadCreated { start_address }, ack);
                self.deliver(|h| h.thread_created.clone(), event);
            }

            RawEventPayload::Exception {
                code,
                address,
                first_chance,
            } => {
                let thread = self.require_thread(tid, &ack)?;
                if is_trap(code) {
                    self.route_trap(pid, thread, address, ack);
                } else {
                    let event = Event::new(
                        pid,
                        Some(thread),
                        ExceptionRaised {
                            code,
                            address,
                            first_chance,
                        },
                        ack,
                    );
                    self.deliver(|h| h.exception.clone(), event);
                }
            }

            RawEventPayload::ExitThread { exit_code } => {
                let Some(thread) = lock(&self.shared.registry).threads.remove(&tid) else {
                    ack.acknowledge(ack.default_status());
                    return Err(SnareError::UnknownThread(tid));
                };
                let event = Event::new(pid, Some(thread), ThreadExited { exit_code }, ack);
                self.deliver(|h| h.thread_exited.clone(), event);
            }

            RawEventPayload::ExitProcess { exit_code } => {
                let thread = {
                    let mut registry = lock(&self.shared.registry);
                    registry.state = SessionState::Exited;
                    registry.threads.remove(&tid)
                };
                info!(%pid, exit_code, "target exited");
                let event = Event::new(pid, thread, ProcessExited { exit_code }, ack);
                self.deliver(|h| h.process_exited.clone(), event);
                return Ok(Flow::Stop);
            }

            RawEventPayload::LoadDll { file, base } => {
                let thread = self.thread(tid);
                let module = Arc::new(Module::load(self.shared.memory.clone(), file, base));
                self.publish_module(pid, thread.as_ref(), Arc::clone(&module));
                let event = Event::new(pid, thread, ModuleLoaded { module }, ack);
                self.deliver(|h| h.module_loaded.clone(), event);
            }

            RawEventPayload::UnloadDll { base } => {
                let Some(module) = lock(&self.shared.registry).modules.remove(&base) else {
                    debug!(%pid, %base, "unload of unknown module");
                    ack.acknowledge(ContinueStatus::Continue);
                    return Ok(Flow::Continue);
                };
                let event = Event::new(pid, self.thread(tid), ModuleUnloaded { module }, ack);
                self.deliver(|h| h.module_unloaded.clone(), event);
            }

            RawEventPayload::DebugString { data, length, unicode } => {
                let message = self.read_debug_string(data, length, unicode);
                let event = Event::new(pid, self.thread(tid), DebugStringEmitted { message }, ack);
                self.deliver(|h| h.debug_string.clone(), event);
            }

            RawEventPayload::Rip { error, kind } => {
                let other = OtherEvent {
                    kind: "rip",
                    details: Some(format!("error {error}, type {kind}")),
                };
                self.deliver(|h| h.other.clone(), Event::new(pid, self.thread(tid), other, ack));
            }

            RawEventPayload::Unknown { code } => {
                let other = OtherEvent {
                    kind: "unknown",
                    details: Some(format!("event code {code}")),
                };
                self.deliver(|h| h.other.clone(), Event::new(pid, self.thread(tid), other, ack));
            }
        }
        Ok(Flow::Continue)
    }

    fn route_trap(&self, pid: ProcessId, thread: Arc<Thread>, address: Address, ack: Acknowledgment)
    {
        match self.breakpoint(address) {
            Some(breakpoint) => {
                let handler = breakpoint.hit_handler().filter(|_| breakpoint.is_enabled());
                let Some(handler) = handler else {
                    trace!(%address, "breakpoint without active handler");
                    ack.acknowledge(ContinueStatus::Continue);
                    return;
                };
                let hits = breakpoint.record_hit();
                trace!(%address, hits, "breakpoint hit");
                let hit = BreakpointHit {
                    address,
                    breakpoint: Some(breakpoint),
                };
                self.invoke(handler, Event::new(pid, Some(thread), hit, ack));
            }
            None => {
                let handler = self.wait_for_handler(|h| h.breakpoint.clone());
                let hit = BreakpointHit {
                    address,
                    breakpoint: None,
                };
                self.invoke(handler, Event::new(pid, Some(thread), hit, ack));
            }
        }
    }

    /// Register the thread behind `handle`, or return the one already known.
    fn register_thread(&self, handle: Handle, reported: ThreadId) -> Arc<Thread>
    {
        let thread = Thread::new(Arc::clone(&self.shared.backend), handle, self.shared.architecture);
        if thread.id() != reported {
            debug!(reported = %reported, resolved = %thread.id(), "thread id differs from event");
        }

        let mut registry = lock(&self.shared.registry);
        Arc::clone(registry.threads.entry(thread.id()).or_insert_with(|| {
            debug!(tid = %thread.id(), "thread registered");
            Arc::new(thread)
        }))
    }

    fn require_thread(&self, tid: ThreadId, ack: &Acknowledgment) -> SnareResult<Arc<Thread>>
    {
        self.thread(tid).ok_or_else(|| {
            ack.acknowledge(ack.default_status());
            SnareError::UnknownThread(tid)
        })
    }

    fn resume_if_launched(&self, tid: ThreadId)
    {
        let handle = {
            let mut registry = lock(&self.shared.registry);
            match registry.resume {
                Some((initial, handle)) if initial == tid => {
                    registry.resume = None;
                    handle
                }
                _ => return,
            }
        };
        match self.shared.backend.resume_thread(handle) {
            Ok(()) => debug!(%tid, "initial thread resumed"),
            Err(err) => error!(%tid, error = %err, "failed to resume initial thread"),
        }
        self.shared.backend.close_handle(handle);
    }

    /// Publish `module`. A stale module at the same base leaves the registry
    /// and is reported unloaded before `module` takes its place.
    fn publish_module(&self, pid: ProcessId, thread: Option<&Arc<Thread>>, module: Arc<Module>)
    {
        let base = module.base();
        let stale = lock(&self.shared.registry).modules.remove(&base);
        if let Some(stale) = stale {
            debug!(%pid, %base, "replacing stale module");
            let event = Event::new(pid, thread.cloned(), ModuleUnloaded { module: stale }, Acknowledgment::synthetic());
            self.deliver(|h| h.module_unloaded.clone(), event);
        }
        lock(&self.shared.registry).modules.insert(base, module);
    }

    fn read_debug_string(&self, data: Address, length: u16, unicode: bool) -> String
    {
        let char_size = if unicode { 2 } else { 1 };
        let mut buffer = vec![0u8; usize::from(length) * char_size];
        let read = self.shared.memory.read(data, &mut buffer);
        buffer.truncate(read - read % char_size);

        let text = if unicode {
            let units: Vec<u16> = buffer.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
            String::from_utf16_lossy(&units)
        } else {
            String::from_utf8_lossy(&buffer).into_owned()
        };
        text.trim_end_matches('\0').to_string()
    }

    /// Run the registered handler, or answer with the event's default.
    fn deliver<P>(&self, select: impl Fn(&Handlers) -> Option<Handler<Event<P>>>, event: Event<P>)
    {
        let handler = select(&*lock(&self.shared.handlers));
        match handler {
            Some(handler) => self.invoke(handler, event),
            None => {
                let ack = event.acknowledgment();
                ack.acknowledge(ack.default_status());
            }
        }
    }

    fn wait_for_handler<E>(&self, select: impl Fn(&Handlers) -> Option<Handler<E>>) -> Handler<E>
    {
        let mut handlers = lock(&self.shared.handlers);
        let mut logged = false;
        loop {
            if let Some(handler) = select(&*handlers) {
                return handler;
            }
            if !logged {
                debug!("waiting for a handler to be registered");
                logged = true;
            }
            handlers = self
                .shared
                .handler_registered
                .wait(handlers)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn invoke<E>(&self, handler: Handler<E>, event: E)
    {
        if catch_unwind(AssertUnwindSafe(|| handler(self, event))).is_err() {
            error!(pid = %self.shared.process_id, "event handler panicked");
        }
    }
}
