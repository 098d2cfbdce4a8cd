//! Boundary compatibility with the narrow calling convention.
//!
//! A 64-bit host address does not fit one narrow argument slot, so the C
//! library layer carries it as a low half plus a high half in the adjacent
//! "shadow" slot.  Everything inside the runtime works with whole `HostAddr`
//! values: the split form is produced and consumed only here.
//!
//! ## Authors
//!
//! The Veracruz Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the Veracruz root directory for
//! information on licensing and copyright.

use crate::{
    address::HostAddr,
    error::{RuntimeError, RuntimeResult},
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Splits a host address into its (low, high) slot pair.
#[inline]
pub fn split_host_addr(address: HostAddr) -> (u32, u32) {
    (address.0 as u32, (address.0 >> 32) as u32)
}

/// Joins a (low, high) slot pair back into a host address.
#[inline]
pub fn join_host_addr(low: u32, high: u32) -> HostAddr {
    HostAddr(((high as u64) << 32) | low as u64)
}

////////////////////////////////////////////////////////////////////////////////
// Wire structures.
////////////////////////////////////////////////////////////////////////////////

/// Unpack a sequence of `bytes` and return a `T`.
pub trait Unpack: Sized {
    /// Size in bytes of the structure in the guest memory space.  This may
    /// differ from the size of the resulting type.
    const SIZE: u32;

    /// Unpack the `T`
    fn unpack(bytes: &[u8]) -> RuntimeResult<Self>;
}

/// A scatter/gather entry whose buffer pointer has already been translated
/// into host space.  On the wire:
///
/// | offset | field |
/// |--------|-------|
/// | 0      | low 32 bits of the buffer address |
/// | 4      | high 32 bits (shadow slot) |
/// | 8      | length, 64 bits |
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoVec {
    pub base: HostAddr,
    pub len: u64,
}

impl IoVec {
    /// Encodes the entry in its wire layout.
    pub fn pack(&self) -> Vec<u8> {
        let (low, high) = split_host_addr(self.base);
        let mut bytes = Vec::with_capacity(Self::SIZE as usize);
        // Writing into a `Vec` cannot fail.
        let _ = bytes.write_u32::<LittleEndian>(low);
        let _ = bytes.write_u32::<LittleEndian>(high);
        let _ = bytes.write_u64::<LittleEndian>(self.len);
        bytes
    }
}

impl Unpack for IoVec {
    const SIZE: u32 = 16;

    fn unpack(bytes: &[u8]) -> RuntimeResult<Self> {
        if bytes.len() != Self::SIZE as usize {
            return Err(RuntimeError::InvalidArgument);
        }
        let mut rdr = Cursor::new(bytes);
        let low = rdr
            .read_u32::<LittleEndian>()
            .map_err(|_| RuntimeError::InvalidArgument)?;
        let high = rdr
            .read_u32::<LittleEndian>()
            .map_err(|_| RuntimeError::InvalidArgument)?;
        let len = rdr
            .read_u64::<LittleEndian>()
            .map_err(|_| RuntimeError::InvalidArgument)?;
        Ok(IoVec {
            base: join_host_addr(low, high),
            len,
        })
    }
}
