//! # Types
//!
//! Small value types shared by every part of the engine.
//!
//! These keep raw numbers from being mixed up: an [`Address`] is never a
//! [`Handle`], a [`ThreadId`] is never a [`ProcessId`].

pub mod address;
pub mod memory;
pub mod process;

pub use address::Address;
pub use memory::Protection;
pub use process::{Architecture, Handle, ProcessId, ThreadId};
