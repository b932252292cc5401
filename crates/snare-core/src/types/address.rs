//! Target address type.

use std::fmt;
use std::ops::{Add, Sub};

/// Strongly typed address in the debuggee's virtual address space
///
/// Addresses handed out by the session are always *absolute*: a section's
/// base, a symbol's base, a breakpoint location. Image metadata speaks in
/// relative virtual addresses (RVAs); those stay plain `u32`/`u64` values until
/// they are rebased with [`Address::rebase`].
///
/// ## Example
///
/// ```rust
/// use snare_core::types::Address;
///
/// let base = Address::new(0x7ff6_0000_0000);
/// assert_eq!(base.rebase(0x1000), Address::new(0x7ff6_0000_1000));
/// assert_eq!(base.rebase(0x1000).rva_from(base), Some(0x1000));
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(u64);

impl Address
{
    /// The null address.
    pub const ZERO: Self = Address(0);

    /// Create an address from a raw value. Usable in const contexts.
    pub const fn new(value: u64) -> Self
    {
        Address(value)
    }

    /// Raw value, for handing to the backend.
    pub const fn value(self) -> u64
    {
        self.0
    }

    /// `true` for the null address.
    pub const fn is_null(self) -> bool
    {
        self.0 == 0
    }

    /// Turn a relative virtual address into an absolute one, using `self` as
    /// the image base.
    pub fn rebase(self, rva: u64) -> Self
    {
        Address(self.0.wrapping_add(rva))
    }

    /// Distance from `base` to `self`, or `None` when `self` lies below `base`.
    pub fn rva_from(self, base: Address) -> Option<u64>
    {
        self.0.checked_sub(base.0)
    }

    /// Add a signed displacement (as found in `rel32`/`disp32` operands).
    pub fn displace(self, displacement: i64) -> Self
    {
        Address(self.0.wrapping_add_signed(displacement))
    }
}

impl From<u64> for Address
{
    fn from(value: u64) -> Self
    {
        Address(value)
    }
}

impl From<Address> for u64
{
    fn from(address: Address) -> Self
    {
        address.0
    }
}

impl fmt::Display for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::LowerHex for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl fmt::UpperHex for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        fmt::UpperHex::fmt(&self.0, f)
    }
}

impl Add<u64> for Address
{
    type Output = Address;

    fn add(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_add(rhs))
    }
}

impl Sub<u64> for Address
{
    type Output = Address;

    fn sub(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_sub(rhs))
    }
}
