//! # Windows Debugging Implementation
//!
//! [`DebugBackend`] on top of the Win32 debug API.
//!
//! ## Key APIs Used
//!
//! - `DebugActiveProcess` / `DebugSetProcessKillOnExit`: attach without owning the target's lifetime
//! - `WaitForDebugEvent` / `ContinueDebugEvent`: the event protocol
//! - `ReadProcessMemory` / `WriteProcessMemory` / `FlushInstructionCache`: code patching
//! - `GetThreadContext` / `Wow64GetThreadContext` (and the setters): registers
//! - `CreateProcessW` with `CREATE_SUSPENDED`: launching targets
//!
//! `WaitForDebugEvent` and `ContinueDebugEvent` only work on the thread that
//! attached; the session guarantees that by running both on its event-loop
//! thread.
//!
//! ## References
//!
//! - [Debugging Functions](https://learn.microsoft.com/en-us/windows/win32/debug/debugging-functions)
//! - [DEBUG_EVENT structure](https://learn.microsoft.com/en-us/windows/win32/api/minwinbase/ns-minwinbase-debug_event)

mod context;

use std::ffi::c_void;
use std::iter::once;
use std::mem::size_of;
use std::time::Duration;

use ::windows::core::{PCWSTR, PWSTR};
use ::windows::Win32::Foundation::{CloseHandle, BOOL, ERROR_SEM_TIMEOUT, HANDLE, NTSTATUS};
use ::windows::Win32::Storage::FileSystem::{GetFinalPathNameByHandleW, FILE_NAME_NORMALIZED};
use ::windows::Win32::System::Diagnostics::Debug::{
    ContinueDebugEvent, DebugActiveProcess, DebugBreakProcess, DebugSetProcessKillOnExit, FlushInstructionCache,
    ReadProcessMemory, WaitForDebugEvent, WriteProcessMemory, CREATE_PROCESS_DEBUG_EVENT, CREATE_THREAD_DEBUG_EVENT,
    DEBUG_EVENT, EXCEPTION_DEBUG_EVENT, EXIT_PROCESS_DEBUG_EVENT, EXIT_THREAD_DEBUG_EVENT, LOAD_DLL_DEBUG_EVENT,
    OUTPUT_DEBUG_STRING_EVENT, RIP_EVENT, UNLOAD_DLL_DEBUG_EVENT,
};
use ::windows::Win32::System::Memory::{
    VirtualAllocEx, VirtualProtectEx, MEM_COMMIT, MEM_RESERVE, PAGE_PROTECTION_FLAGS,
};
use ::windows::Win32::System::Threading::{
    CreateProcessW, GetThreadId, IsWow64Process, OpenProcess, ResumeThread, CREATE_SUSPENDED, INFINITE,
    PROCESS_INFORMATION, PROCESS_QUERY_LIMITED_INFORMATION, STARTUPINFOW,
};
use tracing::{debug, trace, warn};

use crate::backend::{ContinueStatus, DebugBackend, RawDebugEvent, RawEventPayload};
use crate::error::{SnareError, SnareResult};
use crate::launch::{LaunchOptions, LaunchedProcess};
use crate::registers::SavedContext;
use crate::types::{Address, Architecture, Handle, ProcessId, Protection, ThreadId};

fn to_win(handle: Handle) -> HANDLE
{
    HANDLE(handle.raw() as isize)
}

fn from_win(handle: HANDLE) -> Handle
{
    Handle::from_raw(handle.0 as u64)
}

fn ptr(address: Address) -> *const c_void
{
    address.value() as usize as *const c_void
}

fn wide(text: &str) -> Vec<u16>
{
    text.encode_utf16().chain(once(0)).collect()
}

/// Win32 debug API backend
///
/// Stateless: every handle it works with is handed in by the session.
#[derive(Debug, Default)]
pub struct WindowsBackend
{
    _private: (),
}

impl WindowsBackend
{
    /// Create the backend.
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Split a `DEBUG_EVENT` by its event code.
    ///
    /// # Safety
    ///
    /// `event` must have been filled in by `WaitForDebugEvent`, so that the
    /// union member matching `dwDebugEventCode` is initialized.
    unsafe fn decode(event: &DEBUG_EVENT) -> RawDebugEvent
    {
        let info = &event.u;
        let payload = match event.dwDebugEventCode {
            EXCEPTION_DEBUG_EVENT => {
                let exception = &info.Exception;
                RawEventPayload::Exception {
                    code: exception.ExceptionRecord.ExceptionCode.0 as u32,
                    address: Address::new(exception.ExceptionRecord.ExceptionAddress as usize as u64),
                    first_chance: exception.dwFirstChance != 0,
                }
            }
            CREATE_THREAD_DEBUG_EVENT => {
                let created = &info.CreateThread;
                RawEventPayload::CreateThread {
                    thread: from_win(created.hThread),
                    start_address: Address::new(created.lpStartAddress.map_or(0, |start| start as usize as u64)),
                }
            }
            CREATE_PROCESS_DEBUG_EVENT => {
                let created = &info.CreateProcessInfo;
                RawEventPayload::CreateProcess {
                    process: from_win(created.hProcess),
                    thread: from_win(created.hThread),
                    file: from_win(created.hFile),
                    image_base: Address::new(created.lpBaseOfImage as usize as u64),
                }
            }
            EXIT_THREAD_DEBUG_EVENT => RawEventPayload::ExitThread {
                exit_code: info.ExitThread.dwExitCode,
            },
            EXIT_PROCESS_DEBUG_EVENT => RawEventPayload::ExitProcess {
                exit_code: info.ExitProcess.dwExitCode,
            },
            LOAD_DLL_DEBUG_EVENT => RawEventPayload::LoadDll {
                file: from_win(info.LoadDll.hFile),
                base: Address::new(info.LoadDll.lpBaseOfDll as usize as u64),
            },
            UNLOAD_DLL_DEBUG_EVENT => RawEventPayload::UnloadDll {
                base: Address::new(info.UnloadDll.lpBaseOfDll as usize as u64),
            },
            OUTPUT_DEBUG_STRING_EVENT => {
                let output = &info.DebugString;
                RawEventPayload::DebugString {
                    data: Address::new(output.lpDebugStringData.0 as usize as u64),
                    length: output.nDebugStringLength,
                    unicode: output.fUnicode != 0,
                }
            }
            RIP_EVENT => RawEventPayload::Rip {
                error: info.RipInfo.dwError,
                kind: info.RipInfo.dwType.0,
            },
            other => RawEventPayload::Unknown { code: other.0 },
        };

        RawDebugEvent {
            process_id: ProcessId(event.dwProcessId),
            thread_id: ThreadId(event.dwThreadId),
            payload,
        }
    }
}

impl DebugBackend for WindowsBackend
{
    fn attach(&self, pid: ProcessId) -> SnareResult<()>
    {
        // SAFETY: plain Win32 call without pointer arguments.
        unsafe { DebugActiveProcess(pid.0) }.map_err(|err| SnareError::AttachFailed {
            pid,
            reason: err.to_string(),
        })
    }

    fn set_kill_on_exit(&self, kill_on_exit: bool) -> SnareResult<()>
    {
        // SAFETY: plain Win32 call without pointer arguments.
        unsafe { DebugSetProcessKillOnExit(BOOL::from(kill_on_exit))? };
        Ok(())
    }

    fn create_suspended(&self, options: &LaunchOptions) -> SnareResult<LaunchedProcess>
    {
        let program = options.program().to_string_lossy().into_owned();
        let application = wide(&program);
        let mut command_line = wide(&options.command_line());
        let cwd = options.working_dir().map(|dir| wide(&dir.to_string_lossy()));

        let startup = STARTUPINFOW {
            cb: size_of::<STARTUPINFOW>() as u32,
            ..Default::default()
        };
        let mut info = PROCESS_INFORMATION::default();

        // SAFETY: all strings are NUL-terminated UTF-16 buffers that outlive
        // the call; the command line buffer is mutable as the API requires.
        let created = unsafe {
            CreateProcessW(
                PCWSTR(application.as_ptr()),
                PWSTR(command_line.as_mut_ptr()),
                None,
                None,
                BOOL::from(false),
                CREATE_SUSPENDED,
                None,
                cwd.as_ref().map_or(PCWSTR::null(), |dir| PCWSTR(dir.as_ptr())),
                &startup,
                &mut info,
            )
        };
        created.map_err(|err| SnareError::LaunchFailed {
            program: program.clone(),
            reason: err.to_string(),
        })?;

        debug!(pid = info.dwProcessId, tid = info.dwThreadId, %program, "created suspended process");
        Ok(LaunchedProcess {
            pid: ProcessId(info.dwProcessId),
            tid: ThreadId(info.dwThreadId),
            process: from_win(info.hProcess),
            thread: from_win(info.hThread),
        })
    }

    fn process_architecture(&self, pid: ProcessId) -> SnareResult<Architecture>
    {
        // SAFETY: the handle is checked by `?` and closed before returning;
        // `wow64` outlives the call that writes it.
        unsafe {
            let process = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, BOOL::from(false), pid.0)?;
            let mut wow64 = BOOL::default();
            let queried = IsWow64Process(process, &mut wow64);
            let _ = CloseHandle(process);
            queried?;
            Ok(if wow64.as_bool() {
                Architecture::X86
            } else {
                Architecture::X86_64
            })
        }
    }

    fn wait_for_event(&self, timeout: Option<Duration>) -> SnareResult<Option<RawDebugEvent>>
    {
        let millis = timeout.map_or(INFINITE, |t| t.as_millis().min(u128::from(INFINITE - 1)) as u32);
        let mut event = DEBUG_EVENT::default();

        // SAFETY: `event` is a valid out-pointer for the duration of the call.
        match unsafe { WaitForDebugEvent(&mut event, millis) } {
            // SAFETY: WaitForDebugEvent succeeded, so the union is filled in.
            Ok(()) => Ok(Some(unsafe { Self::decode(&event) })),
            Err(err) if err.code() == ERROR_SEM_TIMEOUT.to_hresult() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn continue_event(&self, pid: ProcessId, tid: ThreadId, status: ContinueStatus) -> SnareResult<()>
    {
        // SAFETY: plain Win32 call without pointer arguments.
        unsafe { ContinueDebugEvent(pid.0, tid.0, NTSTATUS(status.code() as i32))? };
        Ok(())
    }

    fn read_memory(&self, process: Handle, address: Address, buffer: &mut [u8]) -> usize
    {
        let mut read = 0usize;
        // SAFETY: `buffer` is valid for `buffer.len()` bytes; the target
        // address is only dereferenced by the kernel.
        let result = unsafe {
            ReadProcessMemory(
                to_win(process),
                ptr(address),
                buffer.as_mut_ptr().cast(),
                buffer.len(),
                Some(&mut read),
            )
        };
        if let Err(err) = result {
            trace!(%address, len = buffer.len(), read, error = %err, "ReadProcessMemory failed");
        }
        read
    }

    fn write_memory(&self, process: Handle, address: Address, data: &[u8]) -> usize
    {
        let mut written = 0usize;
        // SAFETY: `data` is valid for `data.len()` bytes.
        let result = unsafe {
            WriteProcessMemory(
                to_win(process),
                ptr(address),
                data.as_ptr().cast(),
                data.len(),
                Some(&mut written),
            )
        };
        if let Err(err) = result {
            trace!(%address, len = data.len(), written, error = %err, "WriteProcessMemory failed");
        }
        written
    }

    fn allocate_memory(
        &self,
        process: Handle,
        address: Option<Address>,
        size: usize,
        protection: Protection,
    ) -> Option<Address>
    {
        let flags = protection.to_page_flags().ok()?;
        // SAFETY: the kernel validates the requested range.
        let allocated = unsafe {
            VirtualAllocEx(
                to_win(process),
                address.map(ptr),
                size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_PROTECTION_FLAGS(flags),
            )
        };
        if allocated.is_null() {
            warn!(size, %protection, "VirtualAllocEx failed");
            None
        } else {
            Some(Address::new(allocated as usize as u64))
        }
    }

    fn change_protection(&self, process: Handle, address: Address, size: usize, protection: Protection) -> bool
    {
        let Ok(flags) = protection.to_page_flags() else {
            return false;
        };
        let mut previous = PAGE_PROTECTION_FLAGS::default();
        // SAFETY: `previous` is a valid out-pointer.
        unsafe { VirtualProtectEx(to_win(process), ptr(address), size, PAGE_PROTECTION_FLAGS(flags), &mut previous) }
            .is_ok()
    }

    fn flush_instruction_cache(&self, process: Handle, address: Address, size: usize) -> bool
    {
        // SAFETY: the kernel validates the range.
        unsafe { FlushInstructionCache(to_win(process), Some(ptr(address)), size) }.is_ok()
    }

    fn thread_id(&self, thread: Handle) -> ThreadId
    {
        // SAFETY: plain Win32 call; an invalid handle yields 0.
        ThreadId(unsafe { GetThreadId(to_win(thread)) })
    }

    fn get_thread_context(&self, thread: Handle, architecture: Architecture) -> SnareResult<SavedContext>
    {
        let bytes = context::get(to_win(thread), architecture).map_err(|err| SnareError::ContextFailed {
            operation: "get",
            thread: self.thread_id(thread),
            details: err.to_string(),
        })?;
        SavedContext::from_bytes(architecture, bytes)
    }

    fn set_thread_context(&self, thread: Handle, context: &SavedContext) -> SnareResult<()>
    {
        context::set(to_win(thread), context).map_err(|err| SnareError::ContextFailed {
            operation: "set",
            thread: self.thread_id(thread),
            details: err.to_string(),
        })
    }

    fn resume_thread(&self, thread: Handle) -> SnareResult<()>
    {
        // SAFETY: plain Win32 call.
        let previous = unsafe { ResumeThread(to_win(thread)) };
        if previous == u32::MAX {
            return Err(::windows::core::Error::from_win32().into());
        }
        Ok(())
    }

    fn resolve_path(&self, file: Handle) -> String
    {
        let mut buffer = vec![0u16; 512];
        loop {
            // SAFETY: the API writes at most `buffer.len()` units.
            let len = unsafe { GetFinalPathNameByHandleW(to_win(file), &mut buffer, FILE_NAME_NORMALIZED) } as usize;
            if len == 0 {
                return String::new();
            }
            if len < buffer.len() {
                return String::from_utf16_lossy(&buffer[..len]);
            }
            // Too small: `len` is the required size including the terminator.
            buffer.resize(len + 1, 0);
        }
    }

    fn close_handle(&self, handle: Handle)
    {
        if handle.is_null() {
            return;
        }
        // SAFETY: the debugger owns `handle` and closes it exactly once.
        if let Err(err) = unsafe { CloseHandle(to_win(handle)) } {
            warn!(%handle, error = %err, "failed to close handle");
        }
    }

    fn break_process(&self, process: Handle) -> SnareResult<()>
    {
        // SAFETY: plain Win32 call.
        unsafe { DebugBreakProcess(to_win(process))? };
        Ok(())
    }
}
