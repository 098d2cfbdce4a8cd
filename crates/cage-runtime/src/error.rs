//! Errors raised by the cage runtime.
//!
//! None of these is fatal to the runtime itself: every variant is surfaced to
//! the immediate caller, and at the syscall boundary it is folded into a
//! conventional negative errno (see `RuntimeError::errno`).
//!
//! ## Authors
//!
//! The Veracruz Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the Veracruz root directory for
//! information on licensing and copyright.

use crate::cage::CageId;
use err_derive::Error;
use nix::errno::Errno;
use serde::{Deserialize, Serialize};

/// Runtime operations either return a result of type `T` or a `RuntimeError`.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeError {
    /// The cage id does not name a live cage.
    #[error(display = "RuntimeError: Unknown cage {}.", _0)]
    UnknownCage(CageId),
    /// The cage is being torn down and accepts no further calls.
    #[error(display = "RuntimeError: Cage {} is exiting.", _0)]
    CageExiting(CageId),
    /// An address lies outside the mapped region of a cage.
    #[error(
        display = "RuntimeError: Address {:#x} is outside the address space of cage {}.",
        address,
        cage
    )]
    OutOfRange { cage: CageId, address: u64 },
    /// Part of an access range is unmapped.
    #[error(
        display = "RuntimeError: Range of {} bytes at {:#x} is not fully mapped in cage {}.",
        length,
        address,
        cage
    )]
    ShortRange {
        cage: CageId,
        address: u64,
        length: u64,
    },
    /// The registration carries the null handler reference.
    #[error(display = "RuntimeError: Null handler for syscall {} of cage {}.", syscall, cage)]
    NullHandler { cage: CageId, syscall: u64 },
    /// The handler reference is not installed in the owning grate.
    #[error(display = "RuntimeError: Grate {} has no handler {}.", grate, handler)]
    UnknownHandler { grate: CageId, handler: u64 },
    /// Another grate already owns the registration and the registry policy
    /// rejects foreign overwrites.
    #[error(
        display = "RuntimeError: Syscall {} of cage {} is already owned by grate {}.",
        syscall,
        cage,
        owner
    )]
    AlreadyOwnedByOther {
        cage: CageId,
        syscall: u64,
        owner: CageId,
    },
    /// A copy request named a mode other than raw or bounded-string.
    #[error(display = "RuntimeError: Invalid copy mode {}.", _0)]
    InvalidCopyMode(u64),
    /// A malformed argument (a bad UTF-8 string, a value out of range).
    #[error(display = "RuntimeError: Invalid argument.")]
    InvalidArgument,
    /// The argument and environment vectors do not fit their guest area.
    #[error(display = "RuntimeError: Argument list too long.")]
    ArgumentListTooLong,
    /// The guest heap of a cage is exhausted.
    #[error(display = "RuntimeError: Cage {} is out of memory.", _0)]
    OutOfMemory(CageId),
}

impl RuntimeError {
    /// The conventional error number reported to the originating syscall site.
    pub fn errno(&self) -> Errno {
        match self {
            RuntimeError::UnknownCage(_) | RuntimeError::CageExiting(_) => Errno::ESRCH,
            RuntimeError::OutOfRange { .. } | RuntimeError::ShortRange { .. } => Errno::EFAULT,
            RuntimeError::NullHandler { .. } | RuntimeError::UnknownHandler { .. } => {
                Errno::ENOSYS
            }
            RuntimeError::AlreadyOwnedByOther { .. } => Errno::EPERM,
            RuntimeError::InvalidCopyMode(_) | RuntimeError::InvalidArgument => Errno::EINVAL,
            RuntimeError::ArgumentListTooLong => Errno::E2BIG,
            RuntimeError::OutOfMemory(_) => Errno::ENOMEM,
        }
    }

    /// The raw negative return value of a syscall failing with this error.
    #[inline]
    pub fn as_return(&self) -> i64 {
        -(self.errno() as i64)
    }
}
