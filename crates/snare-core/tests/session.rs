//! Event-loop behavior against a scripted backend.

mod common;

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use common::*;
use snare_core::backend::{ContinueStatus, RawEventPayload};
use snare_core::error::SnareError;
use snare_core::events::DebugEvent;
use snare_core::session::SessionState;
use snare_core::types::{Address, Architecture, Handle, Protection, ThreadId};

const ACCESS_VIOLATION: u32 = 0xC000_0005;

fn recorder() -> Arc<Mutex<Vec<String>>>
{
    Arc::new(Mutex::new(Vec::new()))
}

#[test]
fn test_thread_registry_tracks_creates_and_exits()
{
    let backend = MockBackend::new(Architecture::X86_64);
    backend.push_event(MAIN_TID, create_process(IMAGE_BASE));
    backend.push_event(ThreadId(0x20), create_thread(ThreadId(0x20)));
    backend.push_event(ThreadId(0x30), create_thread(ThreadId(0x30)));
    backend.push_event(ThreadId(0x20), RawEventPayload::ExitThread { exit_code: 0 });
    backend.push_event(MAIN_TID, exit_process(7));

    let session = attached_session(&backend).unwrap();
    let exit_codes = recorder();
    let codes = Arc::clone(&exit_codes);
    session.on_process_exited(move |_, event| {
        codes.lock().unwrap().push(event.exit_code.to_string());
        event.continue_event();
    });
    session.on_process_created(|_, event| {
        event.continue_event();
    });
    session.wait().unwrap();

    let remaining: Vec<ThreadId> = session.threads().iter().map(|t| t.id()).collect();
    assert_eq!(remaining, vec![ThreadId(0x30)]);
    assert_eq!(session.state(), SessionState::Exited);
    assert_eq!(*exit_codes.lock().unwrap(), vec!["7".to_string()]);
    assert_eq!(backend.kill_on_exit(), Some(false));
}

#[test]
fn test_every_event_is_continued_exactly_once_in_order()
{
    let backend = MockBackend::new(Architecture::X86_64);
    backend.push_event(MAIN_TID, create_process(IMAGE_BASE));
    backend.push_event(
        MAIN_TID,
        RawEventPayload::Exception {
            code: ACCESS_VIOLATION,
            address: Address::new(0x1_4000_1234),
            first_chance: true,
        },
    );
    backend.push_event(
        MAIN_TID,
        RawEventPayload::LoadDll {
            file: Handle::default(),
            base: Address::new(0x7FF0_0000),
        },
    );
    backend.push_event(MAIN_TID, RawEventPayload::Rip { error: 5, kind: 1 });
    backend.push_event(MAIN_TID, exit_process(0));

    let session = attached_session(&backend).unwrap();
    session.on_process_created(|_, event| {
        event.continue_event();
    });
    session.wait().unwrap();

    let continuations = backend.continuations();
    assert_eq!(continuations.len(), 5);
    assert!(continuations.iter().all(|(pid, tid, _)| *pid == PID && *tid == MAIN_TID));
    assert_eq!(
        backend.statuses(),
        vec![
            ContinueStatus::Continue,
            ContinueStatus::ExceptionNotHandled,
            ContinueStatus::Continue,
            ContinueStatus::Continue,
            ContinueStatus::Continue,
        ]
    );
}

#[test]
fn test_process_created_waits_for_its_handler()
{
    let backend = MockBackend::new(Architecture::X86_64);
    backend.push_event(MAIN_TID, create_process(IMAGE_BASE));
    backend.push_event(MAIN_TID, exit_process(0));

    let session = attached_session(&backend).unwrap();
    thread::sleep(Duration::from_millis(50));
    assert!(backend.continuations().is_empty());

    let seen = recorder();
    let log = Arc::clone(&seen);
    session.on_process_created(move |session, event| {
        log.lock().unwrap().push(format!("{}", event.module.base()));
        assert_eq!(session.threads().len(), 1);
        event.continue_event();
    });
    session.wait().unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![IMAGE_BASE.to_string()]);
    assert_eq!(backend.continuations().len(), 2);
}

#[test]
fn test_exception_from_unknown_thread_stops_the_loop()
{
    let backend = MockBackend::new(Architecture::X86_64);
    backend.push_event(MAIN_TID, create_process(IMAGE_BASE));
    backend.push_event(
        ThreadId(0x99),
        RawEventPayload::Exception {
            code: ACCESS_VIOLATION,
            address: Address::new(0x1000),
            first_chance: true,
        },
    );
    backend.push_event(MAIN_TID, exit_process(0));

    let session = attached_session(&backend).unwrap();
    session.on_process_created(|_, event| {
        event.continue_event();
    });

    let err = session.wait().unwrap_err();
    assert!(matches!(err, SnareError::UnknownThread(ThreadId(0x99))));
    assert_eq!(
        backend.statuses(),
        vec![ContinueStatus::Continue, ContinueStatus::ExceptionNotHandled]
    );
}

#[test]
fn test_exit_of_unknown_thread_stops_the_loop()
{
    let backend = MockBackend::new(Architecture::X86_64);
    backend.push_event(MAIN_TID, create_process(IMAGE_BASE));
    backend.push_event(ThreadId(0x55), RawEventPayload::ExitThread { exit_code: 1 });

    let session = attached_session(&backend).unwrap();
    session.on_process_created(|_, event| {
        event.continue_event();
    });

    assert!(matches!(session.wait(), Err(SnareError::UnknownThread(ThreadId(0x55)))));
    assert_eq!(backend.continuations().len(), 2);
}

#[test]
fn test_registered_breakpoint_runs_its_handler()
{
    let target = Address::new(0x1_4000_1000);
    let backend = MockBackend::new(Architecture::X86_64);
    backend.map(target, &[0x48, 0x89, 0x5C, 0x24]);
    backend.push_event(MAIN_TID, create_process(IMAGE_BASE));
    backend.push_event(MAIN_TID, trap(target));
    backend.push_event(MAIN_TID, trap(target));
    backend.push_event(MAIN_TID, exit_process(0));

    let session = attached_session(&backend).unwrap();
    let hits = recorder();
    let log = Arc::clone(&hits);
    session.on_breakpoint(|_, _| panic!("session-wide handler must not see registered breakpoints"));
    session.on_process_created(move |session, event| {
        let breakpoint = session.add_breakpoint(target).unwrap();
        breakpoint.set_enabled(true).unwrap();
        let log = Arc::clone(&log);
        breakpoint.on_hit(move |_, hit| {
            let thread = hit.thread().unwrap();
            thread.context().set_instruction_pointer(hit.address).unwrap();
            log.lock().unwrap().push(format!("{}", hit.address));
            hit.continue_event();
        });
        event.continue_event();
    });
    session.wait().unwrap();

    assert_eq!(hits.lock().unwrap().len(), 2);
    let breakpoint = session.breakpoint(target).unwrap();
    assert_eq!(breakpoint.hit_count(), 2);
    assert_eq!(backend.bytes(target, 1), vec![0xCC]);
    let context = backend.context(thread_handle(MAIN_TID)).unwrap();
    assert_eq!(context.instruction_pointer(), target);
}

#[test]
fn test_disabled_breakpoint_is_continued_silently()
{
    let target = Address::new(0x1_4000_1000);
    let backend = MockBackend::new(Architecture::X86_64);
    backend.map(target, &[0x90]);
    backend.push_event(MAIN_TID, create_process(IMAGE_BASE));
    backend.push_event(MAIN_TID, trap(target));
    backend.push_event(MAIN_TID, exit_process(0));

    let session = attached_session(&backend).unwrap();
    session.on_process_created(move |session, event| {
        let breakpoint = session.add_breakpoint(target).unwrap();
        breakpoint.on_hit(|_, _| panic!("disabled breakpoint must not run its handler"));
        event.continue_event();
    });
    session.wait().unwrap();

    assert_eq!(session.breakpoint(target).unwrap().hit_count(), 0);
    assert_eq!(backend.statuses(), vec![ContinueStatus::Continue; 3]);
}

#[test]
fn test_unknown_trap_goes_to_session_breakpoint_handler()
{
    let address = Address::new(0x7FFE_0010);
    let backend = MockBackend::new(Architecture::X86_64);
    backend.push_event(MAIN_TID, create_process(IMAGE_BASE));
    backend.push_event(MAIN_TID, trap(address));
    backend.push_event(MAIN_TID, exit_process(0));

    let session = attached_session(&backend).unwrap();
    let seen = recorder();
    session.on_process_created(|_, event| {
        event.continue_event();
    });

    // The trap waits until a handler exists.
    thread::sleep(Duration::from_millis(50));
    assert_eq!(backend.continuations().len(), 1);

    let log = Arc::clone(&seen);
    session.on_breakpoint(move |_, event| {
        assert!(event.breakpoint.is_none());
        log.lock().unwrap().push(event.describe());
        event.continue_event();
    });
    session.wait().unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![format!("breakpoint exception at {address} (thread: 0x10)")]
    );
}

#[test]
fn test_unload_of_unknown_module_is_silent()
{
    let backend = MockBackend::new(Architecture::X86_64);
    backend.push_event(MAIN_TID, create_process(IMAGE_BASE));
    backend.push_event(MAIN_TID, RawEventPayload::UnloadDll { base: Address::new(0xDEAD_0000) });
    backend.push_event(MAIN_TID, exit_process(0));

    let session = attached_session(&backend).unwrap();
    session.on_module_unloaded(|_, _| panic!("unknown module must not be reported"));
    session.on_process_created(|_, event| {
        event.continue_event();
    });
    session.wait().unwrap();

    assert_eq!(backend.statuses(), vec![ContinueStatus::Continue; 3]);
}

#[test]
fn test_reloaded_base_reports_stale_module_first()
{
    let dll_base = Address::new(0x7FF0_0000);
    let backend = MockBackend::new(Architecture::X86_64);
    backend.set_path(Handle::from_raw(0x200), r"\\?\C:\Windows\System32\first.dll");
    backend.set_path(Handle::from_raw(0x201), r"\\?\C:\Windows\System32\second.dll");
    backend.push_event(MAIN_TID, create_process(IMAGE_BASE));
    backend.push_event(
        MAIN_TID,
        RawEventPayload::LoadDll {
            file: Handle::from_raw(0x200),
            base: dll_base,
        },
    );
    backend.push_event(
        MAIN_TID,
        RawEventPayload::LoadDll {
            file: Handle::from_raw(0x201),
            base: dll_base,
        },
    );
    backend.push_event(MAIN_TID, RawEventPayload::UnloadDll { base: dll_base });
    backend.push_event(MAIN_TID, exit_process(0));

    let session = attached_session(&backend).unwrap();
    let order = recorder();
    let unloads = Arc::clone(&order);
    session.on_module_unloaded(move |session, event| {
        let kind = if event.acknowledgment().is_synthetic() { "synthetic" } else { "os" };
        let registered = session
            .module_at(dll_base)
            .map_or_else(|| "none".to_string(), |module| module.path().to_string());
        unloads
            .lock()
            .unwrap()
            .push(format!("unload {} {kind} registered {registered}", event.module.path()));
        event.continue_event();
    });
    let loads = Arc::clone(&order);
    session.on_module_loaded(move |session, event| {
        let registered = session
            .module_at(dll_base)
            .map_or_else(|| "none".to_string(), |module| module.path().to_string());
        loads
            .lock()
            .unwrap()
            .push(format!("load {} registered {registered}", event.module.path()));
        event.continue_event();
    });
    session.on_process_created(|_, event| {
        event.continue_event();
    });
    session.wait().unwrap();

    assert_eq!(
        *order.lock().unwrap(),
        vec![
            r"load C:\Windows\System32\first.dll registered C:\Windows\System32\first.dll".to_string(),
            r"unload C:\Windows\System32\first.dll synthetic registered none".to_string(),
            r"load C:\Windows\System32\second.dll registered C:\Windows\System32\second.dll".to_string(),
            r"unload C:\Windows\System32\second.dll os registered none".to_string(),
        ]
    );
    // Synthetic events never reach the OS.
    assert_eq!(backend.continuations().len(), 5);
    assert!(session.module_at(dll_base).is_none());
}

#[test]
fn test_debug_strings_are_decoded()
{
    let ansi = Address::new(0x5000_0000);
    let wide = Address::new(0x5000_1000);
    let backend = MockBackend::new(Architecture::X86_64);
    backend.map(ansi, b"hello\0");
    let utf16: Vec<u8> = "wide\0".encode_utf16().flat_map(u16::to_le_bytes).collect();
    backend.map(wide, &utf16);

    backend.push_event(MAIN_TID, create_process(IMAGE_BASE));
    backend.push_event(
        MAIN_TID,
        RawEventPayload::DebugString {
            data: ansi,
            length: 6,
            unicode: false,
        },
    );
    backend.push_event(
        MAIN_TID,
        RawEventPayload::DebugString {
            data: wide,
            length: 5,
            unicode: true,
        },
    );
    // Longer than what is mapped: truncated to the readable part.
    backend.push_event(
        MAIN_TID,
        RawEventPayload::DebugString {
            data: ansi,
            length: 64,
            unicode: false,
        },
    );
    backend.push_event(MAIN_TID, exit_process(0));

    let session = attached_session(&backend).unwrap();
    let messages = recorder();
    let log = Arc::clone(&messages);
    session.on_debug_string(move |_, event| {
        log.lock().unwrap().push(event.message.clone());
        event.continue_event();
    });
    session.on_process_created(|_, event| {
        event.continue_event();
    });
    session.wait().unwrap();

    assert_eq!(
        *messages.lock().unwrap(),
        vec!["hello".to_string(), "wide".to_string(), "hello".to_string()]
    );
}

#[test]
fn test_unacknowledged_and_double_acknowledged_events()
{
    let backend = MockBackend::new(Architecture::X86_64);
    backend.push_event(MAIN_TID, create_process(IMAGE_BASE));
    for _ in 0..2 {
        backend.push_event(
            MAIN_TID,
            RawEventPayload::Exception {
                code: ACCESS_VIOLATION,
                address: Address::new(0x1000),
                first_chance: true,
            },
        );
    }
    backend.push_event(MAIN_TID, exit_process(0));

    let session = attached_session(&backend).unwrap();
    let calls = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&calls);
    session.on_exception(move |_, event| {
        let mut calls = counter.lock().unwrap();
        *calls += 1;
        if *calls == 2 {
            assert!(event.continue_event());
            assert!(!event.exception_not_handled());
        }
        // First call: dropped without an answer.
    });
    session.on_process_created(|_, event| {
        event.continue_event();
    });
    session.wait().unwrap();

    assert_eq!(
        backend.statuses(),
        vec![
            ContinueStatus::Continue,
            ContinueStatus::ExceptionNotHandled,
            ContinueStatus::Continue,
            ContinueStatus::Continue,
        ]
    );
}

#[test]
fn test_panicking_handler_gets_default_answer()
{
    let backend = MockBackend::new(Architecture::X86_64);
    backend.push_event(MAIN_TID, create_process(IMAGE_BASE));
    backend.push_event(ThreadId(0x20), create_thread(ThreadId(0x20)));
    backend.push_event(MAIN_TID, exit_process(0));

    let session = attached_session(&backend).unwrap();
    session.on_thread_created(|_, _| panic!("handler failure"));
    session.on_process_created(|_, event| {
        event.continue_event();
    });
    session.wait().unwrap();

    assert_eq!(backend.continuations().len(), 3);
    assert_eq!(session.state(), SessionState::Exited);
}

#[test]
fn test_launch_resumes_initial_thread_once()
{
    let backend = MockBackend::new(Architecture::X86);
    backend.push_event(MAIN_TID, create_process(IMAGE_BASE));
    backend.push_event(ThreadId(0x20), create_thread(ThreadId(0x20)));
    backend.push_event(MAIN_TID, exit_process(0));

    let session = launched_session(&backend);
    assert_eq!(session.process_handle(), Some(PROCESS));
    assert_eq!(session.architecture(), Architecture::X86);

    let resumed_in_handler = Arc::new(Mutex::new(None));
    let observed = Arc::clone(&resumed_in_handler);
    let seen_by = Arc::clone(&backend);
    session.on_process_created(move |_, event| {
        *observed.lock().unwrap() = Some(seen_by.resumed().len());
        event.continue_event();
    });
    session.wait().unwrap();

    assert_eq!(backend.resumed(), vec![thread_handle(MAIN_TID)]);
    assert_eq!(*resumed_in_handler.lock().unwrap(), Some(1));
}

#[test]
fn test_owned_handles_are_closed()
{
    let dll_base = Address::new(0x7FF0_0000);
    let dll_file = Handle::from_raw(0x200);
    let backend = MockBackend::new(Architecture::X86_64);
    backend.push_event(MAIN_TID, create_process(IMAGE_BASE));
    backend.push_event(
        MAIN_TID,
        RawEventPayload::LoadDll {
            file: dll_file,
            base: dll_base,
        },
    );
    backend.push_event(MAIN_TID, RawEventPayload::UnloadDll { base: dll_base });
    backend.push_event(MAIN_TID, exit_process(0));

    let session = launched_session(&backend);
    session.on_process_created(|_, event| {
        event.continue_event();
    });
    session.wait().unwrap();

    // The suspended thread after its resume, the DLL file once unloaded.
    assert_eq!(backend.closed(), vec![thread_handle(MAIN_TID), dll_file]);

    drop(session);
    let closed = backend.closed();
    assert_eq!(closed.len(), 4);
    assert!(closed.contains(&PROCESS));
    assert!(closed.contains(&Handle::from_raw(0x100)));
}

#[test]
fn test_attach_failure_is_reported()
{
    let backend = MockBackend::new(Architecture::X86_64);
    backend.fail_attach("access denied");

    let err = attached_session(&backend).unwrap_err();
    assert!(matches!(err, SnareError::AttachFailed { pid, .. } if pid == PID));
    assert!(err.to_string().contains("access denied"));
}

#[test]
fn test_catch_all_handler_sees_every_kind()
{
    let backend = MockBackend::new(Architecture::X86_64);
    backend.push_event(MAIN_TID, create_process(IMAGE_BASE));
    backend.push_event(ThreadId(0x20), create_thread(ThreadId(0x20)));
    backend.push_event(ThreadId(0x20), RawEventPayload::ExitThread { exit_code: 3 });
    backend.push_event(MAIN_TID, RawEventPayload::Unknown { code: 42 });
    backend.push_event(MAIN_TID, exit_process(0));

    let session = attached_session(&backend).unwrap();
    let kinds = recorder();
    let log = Arc::clone(&kinds);
    session.on_event(move |_, event| {
        let kind = match &event {
            DebugEvent::ProcessCreated(_) => "process-created",
            DebugEvent::ThreadCreated(_) => "thread-created",
            DebugEvent::ThreadExited(_) => "thread-exited",
            DebugEvent::ProcessExited(_) => "process-exited",
            DebugEvent::Other(other) => other.kind,
            _ => "unexpected",
        };
        log.lock().unwrap().push(kind.to_string());
        assert_eq!(event.process_id(), PID);
        event.acknowledge_default();
    });
    session.wait().unwrap();

    assert_eq!(
        *kinds.lock().unwrap(),
        vec!["process-created", "thread-created", "thread-exited", "unknown", "process-exited"]
    );
}

#[test]
fn test_wait_from_handler_is_rejected()
{
    let backend = MockBackend::new(Architecture::X86_64);
    backend.push_event(MAIN_TID, create_process(IMAGE_BASE));
    backend.push_event(MAIN_TID, exit_process(0));

    let session = attached_session(&backend).unwrap();
    let outcome = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&outcome);
    session.on_process_created(move |session, event| {
        *slot.lock().unwrap() = Some(matches!(session.wait(), Err(SnareError::InvalidArgument(_))));
        event.continue_event();
    });
    session.wait().unwrap();

    assert_eq!(*outcome.lock().unwrap(), Some(true));
    // Outcome already collected.
    assert!(session.wait().is_ok());
}

#[test]
fn test_break_in_and_memory_helpers()
{
    let backend = MockBackend::new(Architecture::X86_64);
    let session = launched_session(&backend);

    session.break_in().unwrap();
    assert_eq!(backend.break_requests(), 1);

    let page = session
        .allocate_memory(None, 0x10, Protection::new(true, true, false))
        .unwrap();
    assert_eq!(session.write_memory(page, &[1, 2, 3]), 3);
    let mut buffer = [0u8; 3];
    assert_eq!(session.read_memory(page, &mut buffer), 3);
    assert_eq!(buffer, [1, 2, 3]);

    backend.fail_flushes();
    assert!(matches!(
        session.flush_instruction_cache(page, 0x10),
        Err(SnareError::FlushFailed { .. })
    ));
}
