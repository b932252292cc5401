//! # Platform-Specific Implementations
//!
//! Concrete [`DebugBackend`] implementations.
//!
//! - **Windows (x86-64 hosts)**: Win32 debug API (`WaitForDebugEvent`,
//!   `ContinueDebugEvent`, `ReadProcessMemory`, `GetThreadContext`, ...)
//!   - See: [Debugging Functions](https://learn.microsoft.com/en-us/windows/win32/debug/debugging-functions)
//!
//! Everything else in the crate is platform independent; on other hosts the
//! engine still builds (and is tested against scripted backends), but
//! [`create_backend`] reports that no live backend exists.

use std::sync::Arc;

use crate::backend::DebugBackend;
use crate::error::SnareResult;

#[cfg(all(windows, target_arch = "x86_64"))]
pub mod windows;

/// Backend for the running host.
///
/// ## Errors
///
/// - `SnareError::Backend`: the host has no live debugging backend
#[cfg(all(windows, target_arch = "x86_64"))]
pub fn create_backend() -> SnareResult<Arc<dyn DebugBackend>>
{
    Ok(Arc::new(windows::WindowsBackend::new()))
}

/// Backend for the running host.
///
/// ## Errors
///
/// - `SnareError::Backend`: the host has no live debugging backend
#[cfg(not(all(windows, target_arch = "x86_64")))]
pub fn create_backend() -> SnareResult<Arc<dyn DebugBackend>>
{
    Err(crate::error::SnareError::Backend(format!(
        "no debugging backend for {}-{}",
        std::env::consts::OS,
        std::env::consts::ARCH
    )))
}
