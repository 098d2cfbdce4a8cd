//! Guest and host addresses.
//!
//! A cage sees its memory through narrow, 32-bit offsets into a linear
//! memory region.  The runtime and grates work with 64-bit host addresses.
//! Translation between the two lives on `LinearMemory` (see `memory.rs`) and
//! is exposed per cage through the runtime.
//!
//! ## Authors
//!
//! The Veracruz Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the Veracruz root directory for
//! information on licensing and copyright.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of a linear memory page.  Cage memories are sized in whole pages.
pub const PAGE_SIZE: u64 = 0x1_0000;
/// Narrow pointers cap a cage's address space at 4 GiB.
pub const MAX_LINEAR_MEMORY_SIZE: u64 = 0x1_0000_0000;

/// A cage-relative address.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct GuestAddr(pub u32);

impl GuestAddr {
    /// The "absent" sentinel.
    pub const NULL: GuestAddr = GuestAddr(0);

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// The address `by` bytes further on, if it is still representable.
    #[inline]
    pub fn offset(self, by: u32) -> Option<GuestAddr> {
        self.0.checked_add(by).map(GuestAddr)
    }
}

impl From<u32> for GuestAddr {
    fn from(address: u32) -> Self {
        GuestAddr(address)
    }
}

impl From<GuestAddr> for u64 {
    fn from(address: GuestAddr) -> Self {
        address.0 as u64
    }
}

impl fmt::Display for GuestAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// An address in the runtime's own (host) address space.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct HostAddr(pub u64);

impl HostAddr {
    pub const NULL: HostAddr = HostAddr(0);

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl From<HostAddr> for u64 {
    fn from(address: HostAddr) -> Self {
        address.0
    }
}

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
