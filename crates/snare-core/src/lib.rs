//! # snare-core
//!
//! Live process debugging engine for Windows targets.
//!
//! This crate provides:
//! - A debug [`Session`](session::Session) that attaches to (or launches) a
//!   process and runs its debug-event loop on a dedicated thread
//! - Software breakpoints with per-breakpoint hit handlers
//! - In-memory PE parsing of every loaded image (sections, named exports)
//! - Per-thread register access for x86 (WOW64) and x86-64 targets
//!
//! ## Platform Support
//!
//! - **Windows (x86-64 hosts)**: Win32 debug API, see [`platform::windows`]
//! - **Everywhere else**: the engine builds and can be driven by any
//!   [`DebugBackend`](backend::DebugBackend), but there is no live backend
//!
//! ## Why unsafe code is needed
//!
//! The Windows backend calls the Win32 debug and memory APIs, which read and
//! write other processes' memory and thread state. Those calls are wrapped in
//! safe functions; the rest of the crate is safe code.

#![allow(unsafe_code)] // Required for the Win32 debug API

pub mod backend;
pub mod breakpoint;
pub mod error;
pub mod events;
pub mod image;
pub mod launch;
pub mod memory;
pub mod platform;
pub mod prelude;
pub mod registers;
pub mod session;
pub mod thread;
pub mod types;

pub use backend::DebugBackend;
pub use error::{SnareError, SnareResult};
pub use session::Session;
pub use types::{Address, Architecture, ProcessId, ThreadId};
