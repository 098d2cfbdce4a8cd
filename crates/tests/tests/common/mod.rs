//! Shared harness for the integration tests
//!
//! Builds a runtime with a grate cage and a program cage, the in-memory
//! filesystem grate attached to the program, and helpers that stage guest
//! buffers and issue syscalls the way the C library layer would.
//!
//! ## Authors
//!
//! The Veracruz Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the Veracruz root directory for
//! information on licensing and copyright.

#![allow(dead_code)]

pub mod util;

use cage_runtime::{
    CageId, ErrnoMode, GuestAddr, Options, Runtime, SyscallArgs, SyscallNumber,
};
use imfs::{FileSystem, UnlinkPolicy};
use imfs_grate::ImfsGrate;
use nix::{errno::Errno, fcntl::OFlag};
use std::sync::Arc;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// The raw return value of a call failing with `errno`.
pub fn failure(errno: Errno) -> i64 {
    -(errno as i64)
}

pub fn create_flags() -> u64 {
    (OFlag::O_CREAT | OFlag::O_TRUNC | OFlag::O_RDWR).bits() as u64
}

pub struct Harness {
    pub runtime: Runtime,
    pub grate: CageId,
    pub program: CageId,
    pub imfs: ImfsGrate,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(Options::default(), UnlinkPolicy::default())
    }

    pub fn with(options: Options, unlink_policy: UnlinkPolicy) -> Self {
        init_logging();
        let runtime = Runtime::new(options);
        let grate = runtime.spawn_cage(None).unwrap();
        let program = runtime.spawn_cage(None).unwrap();
        let fs = Arc::new(FileSystem::new(unlink_policy));
        let imfs = ImfsGrate::attach(&runtime, grate, program, fs).unwrap();
        Self {
            runtime,
            grate,
            program,
            imfs,
        }
    }

    pub fn fs(&self) -> &FileSystem {
        self.imfs.filesystem()
    }

    /// Issues `syscall` from `cage` with every argument owned by `cage`.
    pub fn call(&self, cage: CageId, syscall: SyscallNumber, values: &[u64]) -> i64 {
        self.call_with(cage, syscall, &SyscallArgs::from_values(cage, values))
    }

    pub fn call_with(&self, cage: CageId, syscall: SyscallNumber, args: &SyscallArgs) -> i64 {
        self.runtime
            .make_syscall(cage, syscall.number(), cage, args, ErrnoMode::Raw)
    }

    /// Copies `bytes` into fresh guest memory of `cage`.
    pub fn put(&self, cage: CageId, bytes: &[u8]) -> u64 {
        let address = self.runtime.allocate(cage, bytes.len().max(1) as u32).unwrap();
        self.runtime.write_memory(cage, address, bytes).unwrap();
        address.0 as u64
    }

    pub fn put_str(&self, cage: CageId, s: &str) -> u64 {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        self.put(cage, &bytes)
    }

    pub fn get(&self, cage: CageId, address: u64, length: u32) -> Vec<u8> {
        self.runtime
            .read_memory(cage, GuestAddr(address as u32), length)
            .unwrap()
    }

    pub fn open(&self, cage: CageId, path: &str, flags: u64) -> i64 {
        let path = self.put_str(cage, path);
        self.call(cage, SyscallNumber::OPEN, &[path, flags, 0o644])
    }

    pub fn close(&self, cage: CageId, fd: i64) -> i64 {
        self.call(cage, SyscallNumber::CLOSE, &[fd as u64])
    }

    pub fn write(&self, cage: CageId, fd: i64, data: &[u8]) -> i64 {
        let buffer = self.put(cage, data);
        self.call(
            cage,
            SyscallNumber::WRITE,
            &[fd as u64, buffer, data.len() as u64],
        )
    }

    /// Reads up to `length` bytes, panicking on failure.
    pub fn read(&self, cage: CageId, fd: i64, length: u32) -> Vec<u8> {
        let buffer = self.put(cage, &vec![0u8; length as usize]);
        let read = self.call(cage, SyscallNumber::READ, &[fd as u64, buffer, length as u64]);
        assert!(read >= 0, "read of fd {} failed with {}", fd, read);
        self.get(cage, buffer, read as u32)
    }

    pub fn lseek(&self, cage: CageId, fd: i64, offset: i64, whence: u64) -> i64 {
        self.call(cage, SyscallNumber::LSEEK, &[fd as u64, offset as u64, whence])
    }

    pub fn unlink(&self, cage: CageId, path: &str) -> i64 {
        let path = self.put_str(cage, path);
        self.call(cage, SyscallNumber::UNLINK, &[path])
    }

    pub fn fork(&self, cage: CageId) -> CageId {
        let child = self.call(cage, SyscallNumber::FORK, &[]);
        assert!(child > 0, "fork failed with {}", child);
        CageId(child as u64)
    }
}
