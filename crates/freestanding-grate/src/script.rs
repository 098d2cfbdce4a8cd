//! Syscall scripts.
//!
//! A script is a JSON array of steps, each tagged by `op`.  Steps are issued
//! from the current cage in raw errno mode; a `fork` makes the child the
//! current cage.
//!
//! ## Authors
//!
//! The Veracruz Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the Veracruz root directory for
//! information on licensing and copyright.

use anyhow::{anyhow, Result};
use cage_runtime::{CageId, ErrnoMode, GuestAddr, Runtime, SyscallArgs, SyscallNumber};
use log::{debug, info};
use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, convert::TryFrom, fmt};

/// Bytes of each cage's I/O buffer.
const IO_BUFFER_SIZE: u32 = 0x10000;

fn default_mode() -> u32 {
    0o644
}

/// One step of a script.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Step {
    Open {
        path: String,
        #[serde(default)]
        flags: i32,
        #[serde(default = "default_mode")]
        mode: u32,
    },
    Close {
        fd: i32,
    },
    Read {
        fd: i32,
        len: u32,
    },
    Write {
        fd: i32,
        data: String,
    },
    Pread {
        fd: i32,
        len: u32,
        offset: i64,
    },
    Pwrite {
        fd: i32,
        data: String,
        offset: i64,
    },
    Lseek {
        fd: i32,
        offset: i64,
        #[serde(default)]
        whence: u32,
    },
    Fcntl {
        fd: i32,
        cmd: u32,
        #[serde(default)]
        arg: u64,
    },
    Unlink {
        path: String,
    },
    Fork,
    Getpid,
    Exit {
        #[serde(default)]
        status: i32,
    },
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Step::Open { .. } => "open",
            Step::Close { .. } => "close",
            Step::Read { .. } => "read",
            Step::Write { .. } => "write",
            Step::Pread { .. } => "pread",
            Step::Pwrite { .. } => "pwrite",
            Step::Lseek { .. } => "lseek",
            Step::Fcntl { .. } => "fcntl",
            Step::Unlink { .. } => "unlink",
            Step::Fork => "fork",
            Step::Getpid => "getpid",
            Step::Exit { .. } => "exit",
        }
    }
}

/// Parses a script.
pub fn parse(json: &str) -> Result<Vec<Step>> {
    serde_json::from_str(json).map_err(|e| anyhow!("Malformed script: {}", e))
}

/// The outcome of one step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outcome {
    pub op: &'static str,
    pub cage: CageId,
    pub result: i64,
    /// Bytes returned by a read.
    pub data: Option<Vec<u8>>,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.op, self.result)?;
        if let Some(errno) = self
            .result
            .checked_neg()
            .filter(|n| *n > 0)
            .and_then(|n| i32::try_from(n).ok())
        {
            write!(f, " ({:?})", Errno::from_i32(errno))?;
        }
        if let Some(data) = &self.data {
            write!(f, " {:?}", String::from_utf8_lossy(data))?;
        }
        Ok(())
    }
}

/// Replays steps against a runtime.
pub struct Driver<'a> {
    runtime: &'a Runtime,
    cage: CageId,
    buffers: HashMap<CageId, GuestAddr>,
}

impl<'a> Driver<'a> {
    pub fn new(runtime: &'a Runtime, cage: CageId) -> Self {
        Self {
            runtime,
            cage,
            buffers: HashMap::new(),
        }
    }

    /// The cage steps are currently issued from.
    #[inline]
    pub fn cage(&self) -> CageId {
        self.cage
    }

    pub fn run(&mut self, steps: &[Step]) -> Result<Vec<Outcome>> {
        steps.iter().map(|step| self.step(step)).collect()
    }

    fn buffer(&mut self) -> Result<GuestAddr> {
        if let Some(buffer) = self.buffers.get(&self.cage) {
            return Ok(*buffer);
        }
        let buffer = self.runtime.allocate(self.cage, IO_BUFFER_SIZE)?;
        self.buffers.insert(self.cage, buffer);
        Ok(buffer)
    }

    /// Copies `bytes` into the I/O buffer.
    fn stage(&mut self, bytes: &[u8]) -> Result<u64> {
        if bytes.len() > IO_BUFFER_SIZE as usize {
            return Err(anyhow!(
                "{} bytes do not fit the {} byte I/O buffer",
                bytes.len(),
                IO_BUFFER_SIZE
            ));
        }
        let buffer = self.buffer()?;
        self.runtime.write_memory(self.cage, buffer, bytes)?;
        Ok(buffer.0 as u64)
    }

    fn stage_path(&mut self, path: &str) -> Result<u64> {
        let mut bytes = path.as_bytes().to_vec();
        bytes.push(0);
        self.stage(&bytes)
    }

    fn call(&self, syscall: SyscallNumber, values: &[u64]) -> i64 {
        self.runtime.make_syscall(
            self.cage,
            syscall.number(),
            self.cage,
            &SyscallArgs::from_values(self.cage, values),
            ErrnoMode::Raw,
        )
    }

    /// Reads back what a read left in the I/O buffer.
    fn collect(&self, result: i64) -> Result<Option<Vec<u8>>> {
        if result < 0 {
            return Ok(None);
        }
        let buffer = self
            .buffers
            .get(&self.cage)
            .copied()
            .ok_or_else(|| anyhow!("Cage {} has no I/O buffer", self.cage))?;
        Ok(Some(self.runtime.read_memory(
            self.cage,
            buffer,
            result as u32,
        )?))
    }

    fn step(&mut self, step: &Step) -> Result<Outcome> {
        let cage = self.cage;
        let mut data = None;
        let result = match step {
            Step::Open { path, flags, mode } => {
                let path = self.stage_path(path)?;
                self.call(SyscallNumber::OPEN, &[path, *flags as u64, *mode as u64])
            }
            Step::Close { fd } => self.call(SyscallNumber::CLOSE, &[*fd as u64]),
            Step::Read { fd, len } => {
                let buffer = self.stage(&vec![0u8; *len as usize])?;
                let result = self.call(SyscallNumber::READ, &[*fd as u64, buffer, *len as u64]);
                data = self.collect(result)?;
                result
            }
            Step::Write { fd, data: bytes } => {
                let buffer = self.stage(bytes.as_bytes())?;
                self.call(
                    SyscallNumber::WRITE,
                    &[*fd as u64, buffer, bytes.len() as u64],
                )
            }
            Step::Pread { fd, len, offset } => {
                let buffer = self.stage(&vec![0u8; *len as usize])?;
                let result = self.call(
                    SyscallNumber::PREAD,
                    &[*fd as u64, buffer, *len as u64, *offset as u64],
                );
                data = self.collect(result)?;
                result
            }
            Step::Pwrite {
                fd,
                data: bytes,
                offset,
            } => {
                let buffer = self.stage(bytes.as_bytes())?;
                self.call(
                    SyscallNumber::PWRITE,
                    &[*fd as u64, buffer, bytes.len() as u64, *offset as u64],
                )
            }
            Step::Lseek { fd, offset, whence } => self.call(
                SyscallNumber::LSEEK,
                &[*fd as u64, *offset as u64, *whence as u64],
            ),
            Step::Fcntl { fd, cmd, arg } => {
                self.call(SyscallNumber::FCNTL, &[*fd as u64, *cmd as u64, *arg])
            }
            Step::Unlink { path } => {
                let path = self.stage_path(path)?;
                self.call(SyscallNumber::UNLINK, &[path])
            }
            Step::Fork => {
                let child = self.call(SyscallNumber::FORK, &[]);
                if child > 0 {
                    info!("Continuing the script in cage {}.", child);
                    self.cage = CageId(child as u64);
                }
                child
            }
            Step::Getpid => self.call(SyscallNumber::GETPID, &[]),
            Step::Exit { status } => self.call(SyscallNumber::EXIT, &[*status as u64]),
        };
        debug!("Step {:?} on cage {} returned {}.", step, cage, result);
        Ok(Outcome {
            op: step.name(),
            cage,
            result,
            data,
        })
    }
}
