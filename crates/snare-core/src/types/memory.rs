//! Page protection requests.

use std::fmt;
use std::ops::BitOr;

use crate::error::{SnareError, SnareResult};

/// `PAGE_READONLY`
pub const PAGE_READONLY: u32 = 0x02;
/// `PAGE_READWRITE`
pub const PAGE_READWRITE: u32 = 0x04;
/// `PAGE_EXECUTE`
pub const PAGE_EXECUTE: u32 = 0x10;
/// `PAGE_EXECUTE_READ`
pub const PAGE_EXECUTE_READ: u32 = 0x20;
/// `PAGE_EXECUTE_READWRITE`
pub const PAGE_EXECUTE_READWRITE: u32 = 0x40;

/// Access rights requested for a block of target memory
///
/// Combine the constants with `|`:
///
/// ```rust
/// use snare_core::types::Protection;
///
/// let rx = Protection::READ | Protection::EXECUTE;
/// assert_eq!(rx, Protection::READ_EXECUTE);
/// assert_eq!(rx.to_page_flags().unwrap(), 0x20);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Protection
{
    /// Pages may be read.
    pub read: bool,
    /// Pages may be written.
    pub write: bool,
    /// Pages may be executed.
    pub execute: bool,
}

impl Protection
{
    /// No access requested.
    pub const NONE: Self = Self::new(false, false, false);
    /// Read-only.
    pub const READ: Self = Self::new(true, false, false);
    /// Write (only meaningful combined with `READ`).
    pub const WRITE: Self = Self::new(false, true, false);
    /// Execute-only.
    pub const EXECUTE: Self = Self::new(false, false, true);
    /// Read + write.
    pub const READ_WRITE: Self = Self::new(true, true, false);
    /// Read + execute.
    pub const READ_EXECUTE: Self = Self::new(true, false, true);
    /// Read + write + execute.
    pub const READ_WRITE_EXECUTE: Self = Self::new(true, true, true);

    /// Build a protection from individual flags.
    pub const fn new(read: bool, write: bool, execute: bool) -> Self
    {
        Self { read, write, execute }
    }

    /// Map to the Windows `PAGE_*` constant.
    ///
    /// An empty request maps to `PAGE_READONLY`. Write-only and
    /// write+execute without read have no page-protection equivalent.
    ///
    /// ## Errors
    ///
    /// - `SnareError::InvalidArgument`: unsupported flag combination
    pub fn to_page_flags(self) -> SnareResult<u32>
    {
        match (self.read, self.write, self.execute) {
            (true, true, true) => Ok(PAGE_EXECUTE_READWRITE),
            (true, false, true) => Ok(PAGE_EXECUTE_READ),
            (false, false, true) => Ok(PAGE_EXECUTE),
            (true, true, false) => Ok(PAGE_READWRITE),
            (true, false, false) | (false, false, false) => Ok(PAGE_READONLY),
            (false, true, _) => Err(SnareError::InvalidArgument(format!(
                "unsupported memory protection {self}"
            ))),
        }
    }
}

impl BitOr for Protection
{
    type Output = Protection;

    fn bitor(self, rhs: Self) -> Self::Output
    {
        Protection::new(self.read || rhs.read, self.write || rhs.write, self.execute || rhs.execute)
    }
}

impl fmt::Display for Protection
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let r = if self.read { 'r' } else { '-' };
        let w = if self.write { 'w' } else { '-' };
        let x = if self.execute { 'x' } else { '-' };
        write!(f, "{r}{w}{x}")
    }
}
