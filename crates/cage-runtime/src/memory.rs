//! Cage linear memories and the address translator.
//!
//! Every cage, grates included, owns one fixed-size `LinearMemory`.  A guest
//! address is an offset into it; the matching host address is the memory's
//! base plus that offset.  Translation is pure arithmetic and never checks the
//! length of the access that follows: callers that touch memory go through
//! `resolve_range` or the `MemoryHandler` helpers, which do.
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
    abi::Unpack,
    address::{GuestAddr, HostAddr, MAX_LINEAR_MEMORY_SIZE},
    cage::CageId,
    error::{RuntimeError, RuntimeResult},
};
use std::{convert::TryFrom, mem::size_of, ops::Range, string::String, vec::Vec};

////////////////////////////////////////////////////////////////////////////////
// Linear memories.
////////////////////////////////////////////////////////////////////////////////

/// A zero-initialised, fixed-size region of bytes backing one cage.
pub struct LinearMemory {
    /// The cage whose address space this is.
    owner: CageId,
    /// The contents.  NOTE: never reallocated, so the host base is stable for
    /// the lifetime of the memory.
    bytes: Box<[u8]>,
}

impl LinearMemory {
    /// Creates a memory of `size` bytes for `owner`.
    pub fn new(owner: CageId, size: u64) -> RuntimeResult<Self> {
        if size == 0 || size > MAX_LINEAR_MEMORY_SIZE {
            return Err(RuntimeError::InvalidArgument);
        }
        let size = usize::try_from(size).map_err(|_| RuntimeError::InvalidArgument)?;
        Ok(Self {
            owner,
            bytes: vec![0u8; size].into_boxed_slice(),
        })
    }

    /// A byte-for-byte copy of this memory, owned by `owner`.  The copy has
    /// its own host base.
    pub fn duplicate(&self, owner: CageId) -> Self {
        Self {
            owner,
            bytes: self.bytes.clone(),
        }
    }

    /// Zeroes the whole memory.
    pub fn reset(&mut self) {
        self.bytes.fill(0);
    }

    #[inline]
    pub fn owner(&self) -> CageId {
        self.owner
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// The host address of guest offset zero.
    #[inline]
    pub fn base(&self) -> HostAddr {
        HostAddr(self.bytes.as_ptr() as u64)
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    ////////////////////////////////////////////////////////////////////////////
    // Address translation.
    ////////////////////////////////////////////////////////////////////////////

    fn out_of_range(&self, address: u64) -> RuntimeError {
        RuntimeError::OutOfRange {
            cage: self.owner,
            address,
        }
    }

    /// Translates a guest address into host space.  The null guest address
    /// translates to the null host address.
    pub fn to_host(&self, address: GuestAddr) -> RuntimeResult<HostAddr> {
        if address.is_null() {
            return Ok(HostAddr::NULL);
        }
        if u64::from(address) >= self.size() {
            return Err(self.out_of_range(address.into()));
        }
        Ok(HostAddr(self.base().0 + u64::from(address)))
    }

    /// Translates a host address back into guest space.  The null host
    /// address translates to the null guest address.
    pub fn to_guest(&self, address: HostAddr) -> RuntimeResult<GuestAddr> {
        if address.is_null() {
            return Ok(GuestAddr::NULL);
        }
        match address.0.checked_sub(self.base().0) {
            // NOTE: the size is at most 4 GiB, so the offset fits a `u32`.
            Some(offset) if offset < self.size() => Ok(GuestAddr(offset as u32)),
            _ => Err(self.out_of_range(address.0)),
        }
    }

    /// Resolves `address` to an offset into this memory, accepting either
    /// form: an address inside the host window is already host-space,
    /// anything else below the memory size is a guest offset.
    pub fn resolve(&self, address: u64) -> RuntimeResult<u64> {
        let base = self.base().0;
        if address >= base && address - base < self.size() {
            return Ok(address - base);
        }
        if address < self.size() {
            return Ok(address);
        }
        Err(self.out_of_range(address))
    }

    /// Resolves a whole access range.  Fails with `ShortRange` unless every
    /// byte of `[address, address + length)` is mapped.
    pub fn resolve_range(&self, address: u64, length: u64) -> RuntimeResult<Range<usize>> {
        let short = RuntimeError::ShortRange {
            cage: self.owner,
            address,
            length,
        };
        let start = self.resolve(address).map_err(|_| short)?;
        let end = start
            .checked_add(length)
            .filter(|end| *end <= self.size())
            .ok_or(short)?;
        Ok(start as usize..end as usize)
    }

    /// The byte range of a guest-addressed access.
    fn guest_range(&self, address: u32, length: u32) -> RuntimeResult<Range<usize>> {
        let start = address as u64;
        if length > 0 && start >= self.size() {
            return Err(self.out_of_range(start));
        }
        let end = start + length as u64;
        if end > self.size() {
            return Err(RuntimeError::ShortRange {
                cage: self.owner,
                address: start,
                length: length as u64,
            });
        }
        Ok(start as usize..end as usize)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Memory access helpers.
////////////////////////////////////////////////////////////////////////////////

/// Typed access to a guest memory, indexed by guest offsets.
pub trait MemoryHandler {
    /// Get an immutable slice of the memory.
    fn get_slice(&self, address: u32, length: u32) -> RuntimeResult<&[u8]>;

    /// Get a mutable slice of the memory.
    fn get_slice_mut(&mut self, address: u32, length: u32) -> RuntimeResult<&mut [u8]>;

    /// Get the size of the underlying memory.
    fn get_size(&self) -> u64;

    /// Write the `buffer` to `address`.
    fn write_buffer(&mut self, address: u32, buffer: &[u8]) -> RuntimeResult<()> {
        let length = u32::try_from(buffer.len()).map_err(|_| RuntimeError::InvalidArgument)?;
        self.get_slice_mut(address, length)?.copy_from_slice(buffer);
        Ok(())
    }

    /// Read into the `buffer` from `address`.
    fn read_buffer(&self, address: u32, buffer: &mut [u8]) -> RuntimeResult<()> {
        let length = u32::try_from(buffer.len()).map_err(|_| RuntimeError::InvalidArgument)?;
        buffer.copy_from_slice(self.get_slice(address, length)?);
        Ok(())
    }

    /// Reads a NUL-terminated string starting at `address`, looking at no more
    /// than `bound` bytes (and never past the end of memory).
    fn read_cstring(&self, address: u32, bound: u32) -> RuntimeResult<String> {
        let available = self.get_size().saturating_sub(address as u64);
        let length = available.min(bound as u64) as u32;
        let bytes = self.get_slice(address, length)?;
        let end = bytes
            .iter()
            .position(|b| *b == 0)
            .ok_or(RuntimeError::InvalidArgument)?;
        String::from_utf8(bytes[..end].to_vec()).map_err(|_| RuntimeError::InvalidArgument)
    }

    fn read_u16(&self, address: u32) -> RuntimeResult<u16> {
        let mut bytes = [0u8; 2];
        self.read_buffer(address, &mut bytes)?;
        Ok(u16::from_le_bytes(bytes))
    }

    fn write_u16(&mut self, address: u32, number: u16) -> RuntimeResult<()> {
        self.write_buffer(address, &u16::to_le_bytes(number))
    }

    fn read_u32(&self, address: u32) -> RuntimeResult<u32> {
        let mut bytes = [0u8; 4];
        self.read_buffer(address, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    fn write_u32(&mut self, address: u32, number: u32) -> RuntimeResult<()> {
        self.write_buffer(address, &u32::to_le_bytes(number))
    }

    fn read_u64(&self, address: u32) -> RuntimeResult<u64> {
        let mut bytes = [0u8; 8];
        self.read_buffer(address, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    fn write_u64(&mut self, address: u32, number: u64) -> RuntimeResult<()> {
        self.write_buffer(address, &u64::to_le_bytes(number))
    }

    /// The default implementation for reading an Unpack from `address`.
    fn unpack<T: Unpack>(&self, address: u32) -> RuntimeResult<T> {
        T::unpack(self.get_slice(address, T::SIZE)?)
    }

    /// Unpack an array of Unpacks
    fn unpack_array<T: Unpack>(&self, address: u32, count: u32) -> RuntimeResult<Vec<T>> {
        (0..count)
            .map(|i| {
                let offset = i
                    .checked_mul(T::SIZE)
                    .and_then(|o| o.checked_add(address))
                    .ok_or(RuntimeError::InvalidArgument)?;
                self.unpack(offset)
            })
            .collect()
    }

    /// Lays out `content` as consecutive strings starting at `buf_address`,
    /// recording each string's address in the pointer array at
    /// `buf_pointers`.  The pointer array is terminated by a null entry.
    fn write_string_list(
        &mut self,
        content: &[Vec<u8>],
        mut buf_address: u32,
        mut buf_pointers: u32,
    ) -> RuntimeResult<()> {
        for to_write in content {
            self.write_buffer(buf_address, to_write)?;
            self.write_u32(buf_pointers, buf_address)?;
            buf_address += to_write.len() as u32;
            buf_pointers += size_of::<u32>() as u32;
        }
        self.write_u32(buf_pointers, 0)
    }

    /// Reads back a null-terminated pointer array of strings.
    fn read_string_list(&self, mut buf_pointers: u32, bound: u32) -> RuntimeResult<Vec<String>> {
        let mut result = Vec::new();
        loop {
            let pointer = self.read_u32(buf_pointers)?;
            if pointer == 0 {
                return Ok(result);
            }
            result.push(self.read_cstring(pointer, bound)?);
            buf_pointers = buf_pointers
                .checked_add(size_of::<u32>() as u32)
                .ok_or(RuntimeError::InvalidArgument)?;
        }
    }
}

impl MemoryHandler for LinearMemory {
    fn get_slice(&self, address: u32, length: u32) -> RuntimeResult<&[u8]> {
        let range = self.guest_range(address, length)?;
        Ok(&self.bytes[range])
    }

    fn get_slice_mut(&mut self, address: u32, length: u32) -> RuntimeResult<&mut [u8]> {
        let range = self.guest_range(address, length)?;
        Ok(&mut self.bytes[range])
    }

    #[inline]
    fn get_size(&self) -> u64 {
        self.size()
    }
}
