//! Scripted in-memory backend and synthetic PE images for integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use snare_core::backend::{ContinueStatus, DebugBackend, RawDebugEvent, RawEventPayload, EXCEPTION_BREAKPOINT};
use snare_core::error::{SnareError, SnareResult};
use snare_core::launch::{LaunchOptions, LaunchedProcess};
use snare_core::registers::SavedContext;
use snare_core::session::Session;
use snare_core::types::{Address, Architecture, Handle, ProcessId, Protection, ThreadId};

pub const PID: ProcessId = ProcessId(0x1000);
pub const PROCESS: Handle = Handle::from_raw(0x44);
pub const MAIN_TID: ThreadId = ThreadId(0x10);
pub const IMAGE_BASE: Address = Address::new(0x1_4000_0000);

#[derive(Default)]
struct MockState
{
    memory: BTreeMap<u64, u8>,
    events: VecDeque<RawDebugEvent>,
    continuations: Vec<(ProcessId, ThreadId, ContinueStatus)>,
    contexts: HashMap<Handle, SavedContext>,
    paths: HashMap<Handle, String>,
    attach_error: Option<String>,
    flush_fails: bool,
    whole_reads: bool,
    reads: usize,
    writes: usize,
    context_gets: usize,
    context_sets: usize,
    flushes: Vec<(Address, usize)>,
    resumed: Vec<Handle>,
    closed: Vec<Handle>,
    break_requests: usize,
    kill_on_exit: Option<bool>,
}

/// In-memory [`DebugBackend`] driven by a scripted event queue
///
/// - Memory is a sparse byte map; reads and writes stop at the first
///   unmapped byte, unless [`MockBackend::whole_reads`] makes a read that
///   touches an unmapped byte return nothing.
/// - Thread handles double as thread ids.
/// - `wait_for_event` fails once the queue is exhausted.
pub struct MockBackend
{
    architecture: Architecture,
    state: Mutex<MockState>,
}

impl MockBackend
{
    pub fn new(architecture: Architecture) -> Arc<Self>
    {
        Arc::new(Self {
            architecture,
            state: Mutex::new(MockState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, MockState>
    {
        self.state.lock().unwrap()
    }

    pub fn push_event(&self, thread_id: ThreadId, payload: RawEventPayload)
    {
        self.state().events.push_back(RawDebugEvent {
            process_id: PID,
            thread_id,
            payload,
        });
    }

    pub fn map(&self, address: Address, bytes: &[u8])
    {
        let mut state = self.state();
        for (offset, byte) in bytes.iter().enumerate() {
            state.memory.insert(address.value() + offset as u64, *byte);
        }
    }

    pub fn bytes(&self, address: Address, len: usize) -> Vec<u8>
    {
        let state = self.state();
        (0..len as u64)
            .map(|offset| state.memory.get(&(address.value() + offset)).copied().unwrap_or(0))
            .collect()
    }

    pub fn set_path(&self, file: Handle, path: &str)
    {
        self.state().paths.insert(file, path.to_string());
    }

    pub fn fail_attach(&self, reason: &str)
    {
        self.state().attach_error = Some(reason.to_string());
    }

    pub fn fail_flushes(&self)
    {
        self.state().flush_fails = true;
    }

    /// Reads succeed completely or not at all, like `ReadProcessMemory`.
    pub fn whole_reads(&self)
    {
        self.state().whole_reads = true;
    }

    pub fn continuations(&self) -> Vec<(ProcessId, ThreadId, ContinueStatus)>
    {
        self.state().continuations.clone()
    }

    pub fn statuses(&self) -> Vec<ContinueStatus>
    {
        self.continuations().into_iter().map(|(_, _, status)| status).collect()
    }

    pub fn reads(&self) -> usize
    {
        self.state().reads
    }

    pub fn writes(&self) -> usize
    {
        self.state().writes
    }

    pub fn context_gets(&self) -> usize
    {
        self.state().context_gets
    }

    pub fn context_sets(&self) -> usize
    {
        self.state().context_sets
    }

    pub fn flushes(&self) -> Vec<(Address, usize)>
    {
        self.state().flushes.clone()
    }

    pub fn resumed(&self) -> Vec<Handle>
    {
        self.state().resumed.clone()
    }

    pub fn closed(&self) -> Vec<Handle>
    {
        self.state().closed.clone()
    }

    pub fn break_requests(&self) -> usize
    {
        self.state().break_requests
    }

    pub fn kill_on_exit(&self) -> Option<bool>
    {
        self.state().kill_on_exit
    }

    pub fn context(&self, thread: Handle) -> Option<SavedContext>
    {
        self.state().contexts.get(&thread).cloned()
    }
}

impl DebugBackend for MockBackend
{
    fn attach(&self, pid: ProcessId) -> SnareResult<()>
    {
        match self.state().attach_error.clone() {
            Some(reason) => Err(SnareError::AttachFailed { pid, reason }),
            None => Ok(()),
        }
    }

    fn set_kill_on_exit(&self, kill_on_exit: bool) -> SnareResult<()>
    {
        self.state().kill_on_exit = Some(kill_on_exit);
        Ok(())
    }

    fn create_suspended(&self, _options: &LaunchOptions) -> SnareResult<LaunchedProcess>
    {
        Ok(LaunchedProcess {
            pid: PID,
            tid: MAIN_TID,
            process: PROCESS,
            thread: thread_handle(MAIN_TID),
        })
    }

    fn process_architecture(&self, _pid: ProcessId) -> SnareResult<Architecture>
    {
        Ok(self.architecture)
    }

    fn wait_for_event(&self, _timeout: Option<Duration>) -> SnareResult<Option<RawDebugEvent>>
    {
        self.state()
            .events
            .pop_front()
            .map(Some)
            .ok_or_else(|| SnareError::Backend("event script exhausted".to_string()))
    }

    fn continue_event(&self, pid: ProcessId, tid: ThreadId, status: ContinueStatus) -> SnareResult<()>
    {
        self.state().continuations.push((pid, tid, status));
        Ok(())
    }

    fn read_memory(&self, _process: Handle, address: Address, buffer: &mut [u8]) -> usize
    {
        let mut state = self.state();
        state.reads += 1;
        let mut read = 0;
        for (offset, slot) in buffer.iter_mut().enumerate() {
            match state.memory.get(&(address.value() + offset as u64)) {
                Some(byte) => {
                    *slot = *byte;
                    read += 1;
                }
                None => break,
            }
        }
        if state.whole_reads && read < buffer.len() {
            return 0;
        }
        read
    }

    fn write_memory(&self, _process: Handle, address: Address, data: &[u8]) -> usize
    {
        let mut state = self.state();
        state.writes += 1;
        let mut written = 0;
        for (offset, byte) in data.iter().enumerate() {
            let key = address.value() + offset as u64;
            match state.memory.get_mut(&key) {
                Some(slot) => {
                    *slot = *byte;
                    written += 1;
                }
                None => break,
            }
        }
        written
    }

    fn allocate_memory(
        &self,
        _process: Handle,
        address: Option<Address>,
        size: usize,
        _protection: Protection,
    ) -> Option<Address>
    {
        let base = address.unwrap_or(Address::new(0x7000_0000));
        self.map(base, &vec![0u8; size]);
        Some(base)
    }

    fn change_protection(&self, _process: Handle, address: Address, _size: usize, _protection: Protection) -> bool
    {
        self.state().memory.contains_key(&address.value())
    }

    fn flush_instruction_cache(&self, _process: Handle, address: Address, size: usize) -> bool
    {
        let mut state = self.state();
        state.flushes.push((address, size));
        !state.flush_fails
    }

    fn thread_id(&self, thread: Handle) -> ThreadId
    {
        ThreadId(thread.raw() as u32)
    }

    fn get_thread_context(&self, thread: Handle, architecture: Architecture) -> SnareResult<SavedContext>
    {
        let mut state = self.state();
        state.context_gets += 1;
        Ok(state
            .contexts
            .entry(thread)
            .or_insert_with(|| SavedContext::new(architecture))
            .clone())
    }

    fn set_thread_context(&self, thread: Handle, context: &SavedContext) -> SnareResult<()>
    {
        let mut state = self.state();
        state.context_sets += 1;
        state.contexts.insert(thread, context.clone());
        Ok(())
    }

    fn resume_thread(&self, thread: Handle) -> SnareResult<()>
    {
        self.state().resumed.push(thread);
        Ok(())
    }

    fn resolve_path(&self, file: Handle) -> String
    {
        self.state().paths.get(&file).cloned().unwrap_or_default()
    }

    fn close_handle(&self, handle: Handle)
    {
        if !handle.is_null() {
            self.state().closed.push(handle);
        }
    }

    fn break_process(&self, _process: Handle) -> SnareResult<()>
    {
        self.state().break_requests += 1;
        Ok(())
    }
}

pub fn thread_handle(tid: ThreadId) -> Handle
{
    Handle::from_raw(u64::from(tid.raw()))
}

pub fn create_process(image_base: Address) -> RawEventPayload
{
    RawEventPayload::CreateProcess {
        process: PROCESS,
        thread: thread_handle(MAIN_TID),
        file: Handle::from_raw(0x100),
        image_base,
    }
}

pub fn create_thread(tid: ThreadId) -> RawEventPayload
{
    RawEventPayload::CreateThread {
        thread: thread_handle(tid),
        start_address: Address::new(0x1_4000_2000),
    }
}

pub fn trap(address: Address) -> RawEventPayload
{
    RawEventPayload::Exception {
        code: EXCEPTION_BREAKPOINT,
        address,
        first_chance: true,
    }
}

pub fn exit_process(exit_code: u32) -> RawEventPayload
{
    RawEventPayload::ExitProcess { exit_code }
}

/// Launch a session against `backend` (process handle known up front).
pub fn launched_session(backend: &Arc<MockBackend>) -> Session
{
    let dyn_backend: Arc<dyn DebugBackend> = backend.clone();
    Session::launch(dyn_backend, &LaunchOptions::new("target.exe")).unwrap()
}

/// Attach a session to the scripted process.
pub fn attached_session(backend: &Arc<MockBackend>) -> SnareResult<Session>
{
    let dyn_backend: Arc<dyn DebugBackend> = backend.clone();
    Session::attach(dyn_backend, PID)
}

/// Builder for minimal PE images
pub struct PeImage
{
    pe32_plus: bool,
    sections: Vec<(String, u32, u32)>,
    exports: Vec<(String, u32)>,
    function_count: Option<u32>,
    export_rva: u32,
}

const E_LFANEW: usize = 0x80;
const IMAGE_SIZE: usize = 0x6000;

impl PeImage
{
    pub fn new() -> Self
    {
        Self {
            pe32_plus: true,
            sections: Vec::new(),
            exports: Vec::new(),
            function_count: None,
            export_rva: 0x5000,
        }
    }

    pub fn pe32(mut self) -> Self
    {
        self.pe32_plus = false;
        self
    }

    pub fn section(mut self, name: &str, rva: u32, size: u32) -> Self
    {
        self.sections.push((name.to_string(), rva, size));
        self
    }

    pub fn export(mut self, name: &str, rva: u32) -> Self
    {
        self.exports.push((name.to_string(), rva));
        self
    }

    /// Override `NumberOfFunctions` (defaults to the number of exports).
    pub fn function_count(mut self, count: u32) -> Self
    {
        self.function_count = Some(count);
        self
    }

    pub fn build(&self) -> Vec<u8>
    {
        let mut image = vec![0u8; IMAGE_SIZE];
        put16(&mut image, 0, 0x5A4D);
        put32(&mut image, 0x3C, E_LFANEW as u32);

        image[E_LFANEW..E_LFANEW + 4].copy_from_slice(b"PE\0\0");
        let file_header = E_LFANEW + 4;
        let optional_size: u16 = if self.pe32_plus { 112 + 16 * 8 } else { 96 + 16 * 8 };
        put16(&mut image, file_header, if self.pe32_plus { 0x8664 } else { 0x014C });
        put16(&mut image, file_header + 2, self.sections.len() as u16);
        put16(&mut image, file_header + 16, optional_size);
        put16(&mut image, file_header + 18, 0x0022);

        let optional = file_header + 20;
        let (magic, rva_count_offset, directories) = if self.pe32_plus {
            (0x20B, 108, 112)
        } else {
            (0x10B, 92, 96)
        };
        put16(&mut image, optional, magic);
        put32(&mut image, optional + rva_count_offset, 16);
        if !self.exports.is_empty() {
            put32(&mut image, optional + directories, self.export_rva);
            put32(&mut image, optional + directories + 4, 0x400);
        }

        let table = optional + optional_size as usize;
        for (index, (name, rva, size)) in self.sections.iter().enumerate() {
            let entry = table + index * 40;
            let name = name.as_bytes();
            image[entry..entry + name.len().min(8)].copy_from_slice(&name[..name.len().min(8)]);
            put32(&mut image, entry + 8, *size);
            put32(&mut image, entry + 12, *rva);
            put32(&mut image, entry + 16, *size);
        }

        if !self.exports.is_empty() {
            let directory = self.export_rva as usize;
            let functions = directory + 0x40;
            let names = directory + 0x140;
            let mut strings = directory + 0x240;

            let function_count = self.function_count.unwrap_or(self.exports.len() as u32);
            put32(&mut image, directory + 20, function_count);
            put32(&mut image, directory + 24, self.exports.len() as u32);
            put32(&mut image, directory + 28, functions as u32);
            put32(&mut image, directory + 32, names as u32);

            for (index, (name, rva)) in self.exports.iter().enumerate() {
                put32(&mut image, functions + index * 4, *rva);
                put32(&mut image, names + index * 4, strings as u32);
                image[strings..strings + name.len()].copy_from_slice(name.as_bytes());
                strings += name.len() + 1;
            }
        }
        image
    }

    /// Build and map the image at `base`.
    pub fn map(&self, backend: &MockBackend, base: Address)
    {
        backend.map(base, &self.build());
    }
}

fn put16(image: &mut [u8], offset: usize, value: u16)
{
    image[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put32(image: &mut [u8], offset: usize, value: u32)
{
    image[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Image with `.text` at 0x1000..0x2000 exporting `Foo` (0x1000) and `Bar` (0x3000).
pub fn foo_bar_image() -> PeImage
{
    PeImage::new()
        .section(".text", 0x1000, 0x1000)
        .export("Foo", 0x1000)
        .export("Bar", 0x3000)
}
