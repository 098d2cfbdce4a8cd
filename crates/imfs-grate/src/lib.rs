//! The in-memory filesystem grate
//!
//! A grate that takes over the file-I/O syscalls of the cages it serves and
//! answers them from a shared `FileSystem`.  Every pointer argument is moved
//! through the cross-cage copy primitive: paths and outgoing data are copied
//! into a scratch area in the grate's own memory, incoming data is staged
//! there and copied out to the caller.  Descriptors 0, 1 and 2 are not the
//! filesystem's and are forwarded one layer down.
//!
//! The grate also interposes `fork`, `execve` and `exit` so that descriptor
//! tables follow the cages they belong to.
//!
//! ## Authors
//!
//! The Veracruz Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the Veracruz root directory for
//! information on licensing and copyright.

use anyhow::Context;
use cage_runtime::{
    abi::{IoVec, Unpack},
    handler_fn, Arg, CageId, CopyMode, CopyRequest, GrateContext, GuestAddr, HandlerRef,
    Runtime, RuntimeError, RuntimeResult, SyscallArgs, SyscallNumber,
};
use imfs::{FcntlCommand, Fd, FileSystem, Whence};
use log::{debug, info};
use nix::{errno::Errno, fcntl::OFlag};
use num_traits::FromPrimitive;
use parking_lot::Mutex;
use std::{env, path::Path, sync::Arc};


////////////////////////////////////////////////////////////////////////////////
// Constants.
////////////////////////////////////////////////////////////////////////////////

/// Longest path accepted, terminator included.
pub const PATH_MAX: u64 = 4096;
/// Most entries accepted in one `readv`/`writev` vector.
pub const IOV_MAX: u64 = 1024;
/// Bytes of grate memory used to stage transfers.
pub const SCRATCH_SIZE: u32 = 0x10000;
/// Environment variable listing host files to preload, colon-separated.
pub const PRELOADS_VARIABLE: &str = "PRELOADS";

/// Grate operations either return the call's result or the errno handed back
/// to the cage.
type GrateResult<T> = Result<T, Errno>;

type Operation = fn(&GrateState, &GrateContext<'_>, CageId, &SyscallArgs) -> GrateResult<i64>;

/// The calls the grate services, and how.
fn operations() -> Vec<(SyscallNumber, Operation)> {
    vec![
        (SyscallNumber::READ, GrateState::read as Operation),
        (SyscallNumber::WRITE, GrateState::write as Operation),
        (SyscallNumber::OPEN, GrateState::open as Operation),
        (SyscallNumber::CLOSE, GrateState::close as Operation),
        (SyscallNumber::LSEEK, GrateState::lseek as Operation),
        (SyscallNumber::PREAD, GrateState::pread as Operation),
        (SyscallNumber::PWRITE, GrateState::pwrite as Operation),
        (SyscallNumber::READV, GrateState::readv as Operation),
        (SyscallNumber::WRITEV, GrateState::writev as Operation),
        (SyscallNumber::FORK, GrateState::fork as Operation),
        (SyscallNumber::EXECVE, GrateState::execve as Operation),
        (SyscallNumber::EXIT, GrateState::exit as Operation),
        (SyscallNumber::FCNTL, GrateState::fcntl as Operation),
        (SyscallNumber::UNLINK, GrateState::unlink as Operation),
    ]
}

fn fault(error: RuntimeError) -> Errno {
    debug!("Transfer failed: {}", error);
    error.errno()
}

#[inline]
fn is_stdio(fd: &Arg) -> bool {
    (0..FileSystem::FIRST_FD).contains(&fd.as_i32())
}

#[inline]
fn fd(arg: &Arg) -> Fd {
    Fd(arg.as_i32())
}

////////////////////////////////////////////////////////////////////////////////
// Grate state.
////////////////////////////////////////////////////////////////////////////////

/// What the handlers share.
struct GrateState {
    fs: Arc<FileSystem>,
    grate: CageId,
    /// Guest address of the staging area in the grate's memory.  Held for
    /// the whole of a transfer.
    scratch: Mutex<GuestAddr>,
}

impl GrateState {
    fn dispatch(
        &self,
        operation: Operation,
        context: &GrateContext<'_>,
        cage: CageId,
        args: &SyscallArgs,
    ) -> i64 {
        match operation(self, context, cage, args) {
            Ok(result) => result,
            Err(errno) => {
                debug!(
                    "Syscall {} of cage {} failed in the filesystem: {}",
                    context.syscall(),
                    cage,
                    errno
                );
                -(errno as i64)
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // Moving data across cages.
    ////////////////////////////////////////////////////////////////////////////

    /// Fails with `EFAULT` unless `length` bytes at `buffer` are mapped in
    /// their owning cage.
    fn check_buffer(&self, context: &GrateContext<'_>, buffer: &Arg, length: u64) -> GrateResult<()> {
        if length == 0 {
            return Ok(());
        }
        if buffer.value == 0 {
            return Err(Errno::EFAULT);
        }
        let cage = context.runtime().cage(buffer.cage).map_err(fault)?;
        let memory = cage.memory();
        memory
            .resolve_range(buffer.value, length)
            .map(|_| ())
            .map_err(fault)
    }

    /// Pulls `length` bytes at `source` into the grate.
    fn copy_in(&self, context: &GrateContext<'_>, source: &Arg, length: u64) -> GrateResult<Vec<u8>> {
        self.check_buffer(context, source, length)?;
        let scratch = self.scratch.lock();
        let mut bytes = Vec::with_capacity(length as usize);
        let mut done = 0;
        while done < length {
            let chunk = (length - done).min(SCRATCH_SIZE as u64);
            context
                .copy(&CopyRequest {
                    source_cage: source.cage,
                    source_addr: source.value + done,
                    dest_cage: self.grate,
                    dest_addr: scratch.0 as u64,
                    length: chunk,
                    mode: CopyMode::Raw,
                })
                .map_err(fault)?;
            let staged = context
                .runtime()
                .read_memory(self.grate, *scratch, chunk as u32)
                .map_err(fault)?;
            bytes.extend_from_slice(&staged);
            done += chunk;
        }
        Ok(bytes)
    }

    /// Pushes `bytes` out to `destination`.
    fn copy_out(&self, context: &GrateContext<'_>, destination: &Arg, bytes: &[u8]) -> GrateResult<()> {
        self.check_buffer(context, destination, bytes.len() as u64)?;
        let scratch = self.scratch.lock();
        let mut done = 0;
        for chunk in bytes.chunks(SCRATCH_SIZE as usize) {
            context
                .runtime()
                .write_memory(self.grate, *scratch, chunk)
                .map_err(fault)?;
            context
                .copy(&CopyRequest {
                    source_cage: self.grate,
                    source_addr: scratch.0 as u64,
                    dest_cage: destination.cage,
                    dest_addr: destination.value + done,
                    length: chunk.len() as u64,
                    mode: CopyMode::Raw,
                })
                .map_err(fault)?;
            done += chunk.len() as u64;
        }
        Ok(())
    }

    /// Pulls a NUL-terminated path into the grate.
    fn copy_path(&self, context: &GrateContext<'_>, path: &Arg) -> GrateResult<String> {
        if path.value == 0 {
            return Err(Errno::EFAULT);
        }
        let scratch = self.scratch.lock();
        let copied = context
            .copy(&CopyRequest {
                source_cage: path.cage,
                source_addr: path.value,
                dest_cage: self.grate,
                dest_addr: scratch.0 as u64,
                length: PATH_MAX,
                mode: CopyMode::BoundedString,
            })
            .map_err(fault)?;
        let mut bytes = context
            .runtime()
            .read_memory(self.grate, *scratch, copied as u32)
            .map_err(fault)?;
        if bytes.pop() != Some(0) {
            return Err(Errno::ENAMETOOLONG);
        }
        String::from_utf8(bytes).map_err(|_| Errno::EINVAL)
    }

    /// Reads the `IoVec` array of a vectored call.
    fn copy_iovecs(
        &self,
        context: &GrateContext<'_>,
        array: &Arg,
        count: &Arg,
    ) -> GrateResult<Vec<IoVec>> {
        if count.value > IOV_MAX {
            return Err(Errno::EINVAL);
        }
        let bytes = self.copy_in(context, array, count.value * IoVec::SIZE as u64)?;
        bytes
            .chunks(IoVec::SIZE as usize)
            .map(|entry| IoVec::unpack(entry).map_err(fault))
            .collect()
    }

    ////////////////////////////////////////////////////////////////////////////
    // File I/O.
    ////////////////////////////////////////////////////////////////////////////

    /// `open(path, flags, mode)`
    fn open(&self, context: &GrateContext<'_>, cage: CageId, args: &SyscallArgs) -> GrateResult<i64> {
        let path = self.copy_path(context, &args[0])?;
        let flags = OFlag::from_bits_truncate(args[1].as_i32());
        let fd = self.fs.open(cage.0, &path, flags, args[2].value as u32)?;
        Ok(fd.0 as i64)
    }

    /// `close(fd)`
    fn close(&self, context: &GrateContext<'_>, cage: CageId, args: &SyscallArgs) -> GrateResult<i64> {
        if is_stdio(&args[0]) {
            return Ok(context.forward(cage, args));
        }
        self.fs.close(cage.0, fd(&args[0]))?;
        Ok(0)
    }

    /// `read(fd, buf, count)`
    fn read(&self, context: &GrateContext<'_>, cage: CageId, args: &SyscallArgs) -> GrateResult<i64> {
        if is_stdio(&args[0]) {
            return Ok(context.forward(cage, args));
        }
        self.check_buffer(context, &args[1], args[2].value)?;
        let data = self.fs.read(cage.0, fd(&args[0]), args[2].value as usize)?;
        self.copy_out(context, &args[1], &data)?;
        Ok(data.len() as i64)
    }

    /// `write(fd, buf, count)`
    fn write(&self, context: &GrateContext<'_>, cage: CageId, args: &SyscallArgs) -> GrateResult<i64> {
        if is_stdio(&args[0]) {
            return Ok(context.forward(cage, args));
        }
        let data = self.copy_in(context, &args[1], args[2].value)?;
        let written = self.fs.write(cage.0, fd(&args[0]), &data)?;
        Ok(written as i64)
    }

    /// `pread(fd, buf, count, offset)`
    fn pread(&self, context: &GrateContext<'_>, cage: CageId, args: &SyscallArgs) -> GrateResult<i64> {
        if is_stdio(&args[0]) {
            return Ok(context.forward(cage, args));
        }
        if args[3].as_i64() < 0 {
            return Err(Errno::EINVAL);
        }
        self.check_buffer(context, &args[1], args[2].value)?;
        let data = self
            .fs
            .pread(cage.0, fd(&args[0]), args[2].value as usize, args[3].value)?;
        self.copy_out(context, &args[1], &data)?;
        Ok(data.len() as i64)
    }

    /// `pwrite(fd, buf, count, offset)`
    fn pwrite(&self, context: &GrateContext<'_>, cage: CageId, args: &SyscallArgs) -> GrateResult<i64> {
        if is_stdio(&args[0]) {
            return Ok(context.forward(cage, args));
        }
        if args[3].as_i64() < 0 {
            return Err(Errno::EINVAL);
        }
        let data = self.copy_in(context, &args[1], args[2].value)?;
        let written = self.fs.pwrite(cage.0, fd(&args[0]), &data, args[3].value)?;
        Ok(written as i64)
    }

    /// `readv(fd, iov, iovcnt)`: one read, scattered over the buffers in
    /// order.
    fn readv(&self, context: &GrateContext<'_>, cage: CageId, args: &SyscallArgs) -> GrateResult<i64> {
        if is_stdio(&args[0]) {
            return Ok(context.forward(cage, args));
        }
        let iovecs = self.copy_iovecs(context, &args[1], &args[2])?;
        let mut total: u64 = 0;
        for iovec in iovecs.iter() {
            self.check_buffer(context, &Arg::new(iovec.base.0, args[1].cage), iovec.len)?;
            total = total.checked_add(iovec.len).ok_or(Errno::EINVAL)?;
        }
        let data = self.fs.read(cage.0, fd(&args[0]), total as usize)?;
        let mut remaining = &data[..];
        for iovec in iovecs.iter() {
            if remaining.is_empty() {
                break;
            }
            let (head, tail) = remaining.split_at(remaining.len().min(iovec.len as usize));
            self.copy_out(context, &Arg::new(iovec.base.0, args[1].cage), head)?;
            remaining = tail;
        }
        Ok(data.len() as i64)
    }

    /// `writev(fd, iov, iovcnt)`: the buffers are gathered and written at
    /// once.
    fn writev(&self, context: &GrateContext<'_>, cage: CageId, args: &SyscallArgs) -> GrateResult<i64> {
        if is_stdio(&args[0]) {
            return Ok(context.forward(cage, args));
        }
        let iovecs = self.copy_iovecs(context, &args[1], &args[2])?;
        let mut data = Vec::new();
        for iovec in iovecs.iter() {
            let bytes = self.copy_in(context, &Arg::new(iovec.base.0, args[1].cage), iovec.len)?;
            data.extend_from_slice(&bytes);
        }
        let written = self.fs.write(cage.0, fd(&args[0]), &data)?;
        Ok(written as i64)
    }

    /// `lseek(fd, offset, whence)`
    fn lseek(&self, context: &GrateContext<'_>, cage: CageId, args: &SyscallArgs) -> GrateResult<i64> {
        if is_stdio(&args[0]) {
            return Ok(context.forward(cage, args));
        }
        let whence = Whence::from_u64(args[2].value).ok_or(Errno::EINVAL)?;
        let offset = self
            .fs
            .lseek(cage.0, fd(&args[0]), args[1].as_i64(), whence)?;
        Ok(offset as i64)
    }

    /// `fcntl(fd, cmd, arg)`
    fn fcntl(&self, context: &GrateContext<'_>, cage: CageId, args: &SyscallArgs) -> GrateResult<i64> {
        if is_stdio(&args[0]) {
            return Ok(context.forward(cage, args));
        }
        let command = FcntlCommand::from_u64(args[1].value).ok_or(Errno::EINVAL)?;
        self.fs.fcntl(cage.0, fd(&args[0]), command, args[2].value)
    }

    /// `unlink(path)`
    fn unlink(&self, context: &GrateContext<'_>, _cage: CageId, args: &SyscallArgs) -> GrateResult<i64> {
        let path = self.copy_path(context, &args[0])?;
        self.fs.unlink(&path)?;
        Ok(0)
    }

    ////////////////////////////////////////////////////////////////////////////
    // Lifecycle.
    ////////////////////////////////////////////////////////////////////////////

    /// The child gets a copy of the parent's descriptors and is served by
    /// this grate too.
    fn fork(&self, context: &GrateContext<'_>, cage: CageId, args: &SyscallArgs) -> GrateResult<i64> {
        let child = context.forward(cage, args);
        if child < 0 {
            return Ok(child);
        }
        let child_cage = CageId(child as u64);
        self.fs.fork_table(cage.0, child_cage.0)?;
        let inherited = context
            .runtime()
            .copy_handler_table(cage, child_cage)
            .map_err(fault)?;
        info!(
            "Grate {} now serves cage {} ({} registrations inherited from cage {}).",
            self.grate, child_cage, inherited, cage
        );
        Ok(child)
    }

    fn execve(&self, context: &GrateContext<'_>, cage: CageId, args: &SyscallArgs) -> GrateResult<i64> {
        let result = context.forward(cage, args);
        if result >= 0 {
            self.fs.exec_table(cage.0)?;
        }
        Ok(result)
    }

    fn exit(&self, context: &GrateContext<'_>, cage: CageId, args: &SyscallArgs) -> GrateResult<i64> {
        self.fs.remove_table(cage.0);
        Ok(context.forward(cage, args))
    }
}

////////////////////////////////////////////////////////////////////////////////
// The grate.
////////////////////////////////////////////////////////////////////////////////

/// An IMFS grate: its handlers, installed in the grate cage's arena, and the
/// filesystem behind them.
pub struct ImfsGrate {
    state: Arc<GrateState>,
    handlers: Vec<(u64, HandlerRef)>,
}

impl ImfsGrate {
    /// Installs the grate's handlers in `grate`, serving `fs`.  Nothing is
    /// registered yet.
    pub fn new(runtime: &Runtime, grate: CageId, fs: Arc<FileSystem>) -> RuntimeResult<Self> {
        let scratch = runtime.allocate(grate, SCRATCH_SIZE)?;
        let state = Arc::new(GrateState {
            fs,
            grate,
            scratch: Mutex::new(scratch),
        });
        let handlers = operations()
            .into_iter()
            .map(|(syscall, operation)| {
                let handler_state = Arc::clone(&state);
                let handler = runtime.install_handler(
                    grate,
                    handler_fn(move |context, cage, args| {
                        handler_state.dispatch(operation, context, cage, args)
                    }),
                )?;
                Ok((syscall.number(), handler))
            })
            .collect::<RuntimeResult<Vec<_>>>()?;
        Ok(Self { state, handlers })
    }

    /// Creates a grate in `grate` and has it serve `target`.
    pub fn attach(
        runtime: &Runtime,
        grate: CageId,
        target: CageId,
        fs: Arc<FileSystem>,
    ) -> RuntimeResult<Self> {
        let imfs_grate = Self::new(runtime, grate, fs)?;
        imfs_grate.serve(runtime, target)?;
        Ok(imfs_grate)
    }

    /// Registers every handler on `target`.
    pub fn serve(&self, runtime: &Runtime, target: CageId) -> RuntimeResult<()> {
        for (syscall, handler) in self.handlers.iter() {
            runtime.register_handler(target, *syscall, self.state.grate, *handler)?;
        }
        info!(
            "Grate {} attached to cage {} ({} syscalls).",
            self.state.grate,
            target,
            self.handlers.len()
        );
        Ok(())
    }

    /// Removes this grate's registrations from `target`.  Returns how many
    /// there were.
    pub fn detach(&self, runtime: &Runtime, target: CageId) -> usize {
        let mut removed = 0;
        for (syscall, _) in self.handlers.iter() {
            let owned = runtime
                .lookup_handler(target, *syscall)
                .map_or(false, |entry| entry.grate == self.state.grate);
            if owned && runtime.deregister_handler(target, *syscall) {
                removed += 1;
            }
        }
        removed
    }

    #[inline]
    pub fn grate(&self) -> CageId {
        self.state.grate
    }

    #[inline]
    pub fn filesystem(&self) -> &Arc<FileSystem> {
        &self.state.fs
    }

    /// The `(syscall, handle)` pairs this grate registers.
    #[inline]
    pub fn handlers(&self) -> &[(u64, HandlerRef)] {
        &self.handlers
    }

    /// Copies host files into the filesystem under their own paths.
    pub fn preload<P: AsRef<Path>>(&self, paths: &[P]) -> anyhow::Result<usize> {
        for path in paths {
            let path: &Path = path.as_ref();
            let data = std::fs::read(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let name = path
                .to_str()
                .ok_or_else(|| anyhow::anyhow!("Path {} is not UTF-8", path.display()))?;
            self.state
                .fs
                .write_file_by_absolute_path(name, &data)
                .with_context(|| format!("Failed to preload {}", name))?;
        }
        Ok(paths.len())
    }

    /// Preloads the files named in `PRELOADS`, if set.
    pub fn preload_from_env(&self) -> anyhow::Result<usize> {
        match env::var(PRELOADS_VARIABLE) {
            Ok(list) => {
                let paths: Vec<&str> = list.split(':').filter(|p| !p.is_empty()).collect();
                self.preload(&paths)
            }
            Err(_) => Ok(0),
        }
    }
}
