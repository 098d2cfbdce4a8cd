//! The cross-cage copy primitive.
//!
//! Moves bytes from one cage's address space into another's.  Each endpoint
//! is resolved against its own owning cage, so a grate copying into its
//! private memory simply names itself as the destination owner.  A copy
//! either completes or fails before writing anything.
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
    cage::CageId,
    error::{RuntimeError, RuntimeResult},
    memory::LinearMemory,
    runtime::Runtime,
};
use log::{trace, warn};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use strum_macros::{EnumString, IntoStaticStr};

/// How many bytes a copy moves.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    FromPrimitive,
    ToPrimitive,
    Serialize,
    Deserialize,
    EnumString,
    IntoStaticStr,
)]
#[strum(serialize_all = "kebab-case")]
pub enum CopyMode {
    /// Exactly `length` bytes.
    Raw = 0,
    /// Up to and including the first NUL, never more than `length` bytes.
    BoundedString = 1,
}

/// One copy between two address spaces.  Addresses may be given in guest or
/// host form for their owning cage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyRequest {
    pub source_cage: CageId,
    pub source_addr: u64,
    pub dest_cage: CageId,
    pub dest_addr: u64,
    pub length: u64,
    pub mode: CopyMode,
}

impl CopyRequest {
    fn short_source(&self) -> RuntimeError {
        RuntimeError::ShortRange {
            cage: self.source_cage,
            address: self.source_addr,
            length: self.length,
        }
    }

    fn short_dest(&self) -> RuntimeError {
        RuntimeError::ShortRange {
            cage: self.dest_cage,
            address: self.dest_addr,
            length: self.length,
        }
    }

    /// The source bytes to move.  In bounded-string mode the scan stops at
    /// the end of the mapped region, so an unterminated string that runs off
    /// the memory fails rather than over-reading.
    fn source_range(&self, memory: &LinearMemory) -> RuntimeResult<Range<usize>> {
        if self.source_addr == 0 {
            return Err(self.short_source());
        }
        match self.mode {
            CopyMode::Raw => memory
                .resolve_range(self.source_addr, self.length)
                .map_err(|_| self.short_source()),
            CopyMode::BoundedString => {
                let start = memory
                    .resolve(self.source_addr)
                    .map_err(|_| self.short_source())?;
                let available = (memory.size() - start).min(self.length);
                let window = &memory.bytes()[start as usize..(start + available) as usize];
                let count = match window.iter().position(|b| *b == 0) {
                    Some(nul) => nul as u64 + 1,
                    None if available == self.length => self.length,
                    None => return Err(self.short_source()),
                };
                Ok(start as usize..(start + count) as usize)
            }
        }
    }

    fn dest_range(&self, memory: &LinearMemory, count: usize) -> RuntimeResult<Range<usize>> {
        if self.dest_addr == 0 {
            return Err(self.short_dest());
        }
        memory
            .resolve_range(self.dest_addr, count as u64)
            .map_err(|_| self.short_dest())
    }
}

impl Runtime {
    /// Performs `request`, returning the number of bytes copied.  Both ranges
    /// are checked before any byte is written.
    pub fn copy(&self, request: &CopyRequest) -> RuntimeResult<u64> {
        let source = self.live_cage(request.source_cage)?;
        let dest = self.live_cage(request.dest_cage)?;
        if request.length == 0 {
            return Ok(0);
        }

        let result = if source.id() == dest.id() {
            let mut memory = source.memory_mut();
            request.source_range(&memory).and_then(|from| {
                let to = request.dest_range(&memory, from.len())?;
                memory.bytes_mut().copy_within(from.clone(), to.start);
                Ok(from.len() as u64)
            })
        } else {
            // Memories are always locked in cage id order.
            let (source_memory, mut dest_memory) = if source.id() < dest.id() {
                let s = source.memory();
                (s, dest.memory_mut())
            } else {
                let d = dest.memory_mut();
                (source.memory(), d)
            };
            request.source_range(&source_memory).and_then(|from| {
                let to = request.dest_range(&dest_memory, from.len())?;
                dest_memory.bytes_mut()[to].copy_from_slice(&source_memory.bytes()[from.clone()]);
                Ok(from.len() as u64)
            })
        };

        match &result {
            Ok(copied) => trace!(
                "Copied {} bytes from {}:{:#x} to {}:{:#x}.",
                copied,
                request.source_cage,
                request.source_addr,
                request.dest_cage,
                request.dest_addr
            ),
            Err(e) => warn!("Cross-cage copy failed: {}", e),
        }
        result
    }
}
