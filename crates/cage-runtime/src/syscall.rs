//! Syscall numbers known to the runtime.
//!
//! Numbers follow the x86-64 Linux table used by the cage C library.  The
//! runtime's own interposition calls live above 1000.  Any other number is
//! still routable: registrations and dispatch work on raw `u64` numbers, and
//! this enum only names the ones the runtime and its grates act on.
//!
//! ## Authors
//!
//! The Veracruz Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the Veracruz root directory for
//! information on licensing and copyright.

#![allow(non_camel_case_types)]

use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};
use strum_macros::{EnumString, IntoStaticStr};

/// List of named syscalls.
/// It can be converted between primitive numbers and enum values via `primitive` related derive,
/// and between lowercase str and enum values via `strum`.
#[derive(
    IntoStaticStr,
    EnumString,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Clone,
    FromPrimitive,
    ToPrimitive,
    Serialize,
    Deserialize,
    Copy,
)]
#[strum(serialize_all = "lowercase")]
pub enum SyscallNumber {
    READ = 0,
    WRITE = 1,
    OPEN = 2,
    CLOSE = 3,
    LSEEK = 8,
    PREAD = 17,
    PWRITE = 18,
    READV = 19,
    WRITEV = 20,
    GETPID = 39,
    FORK = 57,
    EXECVE = 59,
    EXIT = 60,
    FCNTL = 72,
    UNLINK = 87,
    REGISTER_HANDLER = 1001,
    COPY_DATA_BETWEEN_CAGES = 1002,
    COPY_HANDLER_TABLE = 1003,
}

impl SyscallNumber {
    #[inline]
    pub fn number(self) -> u64 {
        self as u64
    }

    /// The name used in strace output, or `None` for unnamed numbers.
    pub fn name_of(number: u64) -> Option<&'static str> {
        SyscallNumber::from_u64(number).map(<&'static str>::from)
    }
}

impl From<SyscallNumber> for u64 {
    fn from(syscall: SyscallNumber) -> Self {
        syscall.number()
    }
}
