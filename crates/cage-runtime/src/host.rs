//! Host backends: what a syscall does when nobody interposes it and the
//! runtime does not implement it itself.
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
    cage::CageId, dispatch::SyscallArgs, error::RuntimeResult, runtime::Runtime,
    syscall::SyscallNumber,
};
use cfg_if::cfg_if;
use log::{debug, warn};
use nix::errno::Errno;
use num_traits::FromPrimitive;

/// The bottom layer of the dispatch stack.
pub trait HostBackend: Send + Sync {
    /// Services `syscall` for `cage`, returning a result or a negative errno.
    fn call(&self, runtime: &Runtime, cage: CageId, syscall: u64, args: &SyscallArgs) -> i64;
}

/// A backend that supports nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnsupportedHost;

impl HostBackend for UnsupportedHost {
    fn call(&self, _runtime: &Runtime, cage: CageId, syscall: u64, _args: &SyscallArgs) -> i64 {
        debug!("Syscall {} of cage {} has no host implementation.", syscall, cage);
        -(Errno::ENOSYS as i64)
    }
}

/// A backend exposing the standard streams: writes to descriptors 1 and 2
/// reach the host's stdout and stderr, descriptor 0 reads as empty.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdioHost;

impl StdioHost {
    fn write(runtime: &Runtime, fd: i32, args: &SyscallArgs) -> RuntimeResult<i64> {
        let bytes = runtime.read_resolved(args[1].cage, args[1].value, args[2].value)?;
        Ok(write_host(fd, &bytes))
    }
}

impl HostBackend for StdioHost {
    fn call(&self, runtime: &Runtime, cage: CageId, syscall: u64, args: &SyscallArgs) -> i64 {
        let fd = args[0].as_i32();
        match (SyscallNumber::from_u64(syscall), fd) {
            (Some(SyscallNumber::WRITE), 1) | (Some(SyscallNumber::WRITE), 2) => {
                StdioHost::write(runtime, fd, args).unwrap_or_else(|e| {
                    warn!("Write of cage {} to fd {} failed: {}", cage, fd, e);
                    e.as_return()
                })
            }
            (Some(SyscallNumber::READ), 0) => 0,
            (Some(SyscallNumber::CLOSE), 0..=2) => 0,
            (Some(SyscallNumber::READ), _)
            | (Some(SyscallNumber::WRITE), _)
            | (Some(SyscallNumber::CLOSE), _)
            | (Some(SyscallNumber::LSEEK), _)
            | (Some(SyscallNumber::FCNTL), _) => -(Errno::EBADF as i64),
            _ => UnsupportedHost.call(runtime, cage, syscall, args),
        }
    }
}

fn write_host(fd: i32, bytes: &[u8]) -> i64 {
    cfg_if! {
        if #[cfg(unix)] {
            match nix::unistd::write(fd, bytes) {
                Ok(written) => written as i64,
                Err(errno) => -(errno as i64),
            }
        } else {
            use std::io::Write;
            let result = if fd == 1 {
                std::io::stdout().write(bytes)
            } else {
                std::io::stderr().write(bytes)
            };
            match result {
                Ok(written) => written as i64,
                Err(_) => -(Errno::EIO as i64),
            }
        }
    }
}
