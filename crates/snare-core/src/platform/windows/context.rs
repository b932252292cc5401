//! Thread context capture for native and WOW64 threads.
//!
//! `GetThreadContext` needs a 16-byte aligned `CONTEXT`; the buffers below
//! guarantee that and are copied into a [`SavedContext`] afterwards.

use std::ffi::c_void;

use ::windows::Win32::Foundation::HANDLE;
use ::windows::Win32::System::Diagnostics::Debug::{
    GetThreadContext, SetThreadContext, Wow64GetThreadContext, Wow64SetThreadContext, CONTEXT, WOW64_CONTEXT,
};

use crate::registers::{layout_for, SavedContext};
use crate::types::Architecture;

const X64_CONTEXT_SIZE: usize = 0x4D0;
const WOW64_CONTEXT_SIZE: usize = 0x2CC;

const _: () = assert!(std::mem::size_of::<CONTEXT>() == X64_CONTEXT_SIZE);
const _: () = assert!(std::mem::size_of::<WOW64_CONTEXT>() == WOW64_CONTEXT_SIZE);

#[repr(C, align(16))]
struct AlignedContext([u8; X64_CONTEXT_SIZE]);

impl AlignedContext
{
    fn zeroed() -> Box<Self>
    {
        Box::new(Self([0; X64_CONTEXT_SIZE]))
    }

    fn as_mut_ptr(&mut self) -> *mut c_void
    {
        self.0.as_mut_ptr().cast()
    }
}

/// Capture the complete context of `thread`.
pub(super) fn get(thread: HANDLE, architecture: Architecture) -> ::windows::core::Result<Vec<u8>>
{
    let template = SavedContext::new(architecture);
    let size = layout_for(architecture).context_size();
    let mut buffer = AlignedContext::zeroed();
    buffer.0[..size].copy_from_slice(template.as_bytes());

    // SAFETY: the buffer is 16-byte aligned, at least as large as the
    // structure for `architecture`, and carries the ContextFlags requesting
    // the full context.
    unsafe {
        match architecture {
            Architecture::X86_64 => GetThreadContext(thread, buffer.as_mut_ptr().cast::<CONTEXT>())?,
            Architecture::X86 => Wow64GetThreadContext(thread, buffer.as_mut_ptr().cast::<WOW64_CONTEXT>())?,
        }
    }
    Ok(buffer.0[..size].to_vec())
}

/// Overwrite the complete context of `thread`.
pub(super) fn set(thread: HANDLE, context: &SavedContext) -> ::windows::core::Result<()>
{
    let bytes = context.as_bytes();
    let mut buffer = AlignedContext::zeroed();
    buffer.0[..bytes.len()].copy_from_slice(bytes);

    // SAFETY: same layout guarantees as in `get`; `SavedContext` is always
    // exactly the structure size of its architecture.
    unsafe {
        match context.architecture() {
            Architecture::X86_64 => SetThreadContext(thread, buffer.as_mut_ptr().cast::<CONTEXT>()),
            Architecture::X86 => Wow64SetThreadContext(thread, buffer.as_mut_ptr().cast::<WOW64_CONTEXT>()),
        }
    }
}
