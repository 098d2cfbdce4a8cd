//! The dispatch trampoline and the syscall entry point.
//!
//! A syscall arrives as `(calling cage, number, six arguments)`.  Each
//! argument is a `(value, owning cage)` pair: a pointer only means something
//! relative to the address space it indexes, so the owner travels with it.
//! Plain values carry the caller's id by convention.
//!
//! Routing: the registry is consulted for `(calling cage, number)`.  A hit is
//! handed to the owning grate's handler through the trampoline; a miss falls
//! through to the runtime's own calls and then to the host backend.  A grate
//! that wants the original behaviour re-issues the call as itself
//! (`GrateContext::forward`), which in turn may be interposed by a further
//! grate.
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
    copy::{CopyMode, CopyRequest},
    error::{RuntimeError, RuntimeResult},
    memory::{LinearMemory, MemoryHandler},
    registry::{HandlerEntry, HandlerRef},
    runtime::Runtime,
    strace::Strace,
    syscall::SyscallNumber,
    Environment,
};
use log::{debug, warn};
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};
use std::{ops::Index, sync::Arc};

/// Longest string accepted in an exec vector.
const EXEC_STRING_BOUND: u32 = 4096;
/// Largest errno value; results in `-MAX_ERRNO..0` are errors.
const MAX_ERRNO: i64 = 4095;

////////////////////////////////////////////////////////////////////////////////
// Arguments.
////////////////////////////////////////////////////////////////////////////////

/// One argument slot: a value and the cage whose address space it refers to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Arg {
    pub value: u64,
    pub cage: CageId,
}

impl Arg {
    #[inline]
    pub fn new(value: u64, cage: CageId) -> Self {
        Self { value, cage }
    }

    /// The value reinterpreted as a signed quantity.
    #[inline]
    pub fn as_i64(&self) -> i64 {
        self.value as i64
    }

    /// The low 32 bits reinterpreted as a C `int`.
    #[inline]
    pub fn as_i32(&self) -> i32 {
        self.value as u32 as i32
    }
}

/// The six argument slots of a call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyscallArgs(pub [Arg; 6]);

impl SyscallArgs {
    /// Six zero values owned by `caller`.
    pub fn new(caller: CageId) -> Self {
        SyscallArgs([Arg::new(0, caller); 6])
    }

    /// Leading slots set to `values`, all owned by `caller`.  Extra values
    /// beyond six are ignored.
    pub fn from_values(caller: CageId, values: &[u64]) -> Self {
        let mut args = Self::new(caller);
        for (slot, value) in args.0.iter_mut().zip(values.iter()) {
            slot.value = *value;
        }
        args
    }

    /// Sets slot `index` to `value` owned by `cage`.
    pub fn with(mut self, index: usize, value: u64, cage: CageId) -> Self {
        if let Some(slot) = self.0.get_mut(index) {
            *slot = Arg::new(value, cage);
        }
        self
    }
}

impl Index<usize> for SyscallArgs {
    type Output = Arg;

    fn index(&self, index: usize) -> &Arg {
        &self.0[index]
    }
}

/// How a failing result is reported to the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrnoMode {
    /// Negative errno values are returned as they are.
    Raw,
    /// A failure returns `-1` and records the errno on the calling cage.
    Translate,
}

////////////////////////////////////////////////////////////////////////////////
// Handlers.
////////////////////////////////////////////////////////////////////////////////

/// A grate's implementation of a syscall.  `cage` is the cage the call acts
/// on; the result flows back to it unchanged.
pub trait SyscallHandler: Send + Sync {
    fn handle(&self, context: &GrateContext<'_>, cage: CageId, args: &SyscallArgs) -> i64;
}

impl<F> SyscallHandler for F
where
    F: Fn(&GrateContext<'_>, CageId, &SyscallArgs) -> i64 + Send + Sync,
{
    fn handle(&self, context: &GrateContext<'_>, cage: CageId, args: &SyscallArgs) -> i64 {
        self(context, cage, args)
    }
}

/// Wraps a closure as a handler ready for `Runtime::install_handler`.
pub fn handler_fn<F>(f: F) -> Arc<dyn SyscallHandler>
where
    F: Fn(&GrateContext<'_>, CageId, &SyscallArgs) -> i64 + Send + Sync + 'static,
{
    Arc::new(f)
}

/// What a handler sees of the runtime while it runs.
pub struct GrateContext<'a> {
    runtime: &'a Runtime,
    grate: CageId,
    syscall: u64,
}

impl<'a> GrateContext<'a> {
    #[inline]
    pub fn runtime(&self) -> &'a Runtime {
        self.runtime
    }

    /// The grate running the handler.
    #[inline]
    pub fn grate(&self) -> CageId {
        self.grate
    }

    /// The syscall being serviced.
    #[inline]
    pub fn syscall(&self) -> u64 {
        self.syscall
    }

    /// Re-issues the serviced call one layer down, as the grate, on behalf of
    /// `target`.
    pub fn forward(&self, target: CageId, args: &SyscallArgs) -> i64 {
        self.make_syscall(self.syscall, target, args)
    }

    /// Issues any call as the grate, on behalf of `target`.
    pub fn make_syscall(&self, syscall: u64, target: CageId, args: &SyscallArgs) -> i64 {
        self.runtime
            .make_syscall(self.grate, syscall, target, args, ErrnoMode::Raw)
    }

    pub fn copy(&self, request: &CopyRequest) -> RuntimeResult<u64> {
        self.runtime.copy(request)
    }
}

/// The handlers installed by one grate.  A `HandlerRef` is the slot index
/// plus one.
#[derive(Default)]
pub(crate) struct HandlerArena {
    slots: Vec<Arc<dyn SyscallHandler>>,
}

impl HandlerArena {
    fn install(&mut self, handler: Arc<dyn SyscallHandler>) -> HandlerRef {
        self.slots.push(handler);
        HandlerRef(self.slots.len() as u64)
    }

    fn get(&self, handler: HandlerRef) -> Option<Arc<dyn SyscallHandler>> {
        let index = handler.0.checked_sub(1)?;
        self.slots.get(index as usize).cloned()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Dispatch.
////////////////////////////////////////////////////////////////////////////////

impl Runtime {
    /// Installs `handler` in `grate`'s arena, returning its handle.
    pub fn install_handler(
        &self,
        grate: CageId,
        handler: Arc<dyn SyscallHandler>,
    ) -> RuntimeResult<HandlerRef> {
        self.live_cage(grate)?;
        Ok(self.arenas.entry(grate).or_default().install(handler))
    }

    /// Invokes the handler named by `entry`.  No lock is held while the
    /// handler runs.
    pub fn trampoline(
        &self,
        entry: HandlerEntry,
        syscall: u64,
        cage: CageId,
        args: &SyscallArgs,
    ) -> RuntimeResult<i64> {
        if entry.handler.is_null() {
            return Err(RuntimeError::NullHandler { cage, syscall });
        }
        let handler = self
            .arenas
            .get(&entry.grate)
            .and_then(|arena| arena.get(entry.handler))
            .ok_or(RuntimeError::UnknownHandler {
                grate: entry.grate,
                handler: entry.handler.0,
            })?;
        let context = GrateContext {
            runtime: self,
            grate: entry.grate,
            syscall,
        };
        Ok(handler.handle(&context, cage, args))
    }

    /// The syscall entry point.  `self_cage` issues call `syscall` on behalf
    /// of `target` (the same cage, unless a grate is forwarding).  `mode`
    /// selects how failures are reported.
    pub fn make_syscall(
        &self,
        self_cage: CageId,
        syscall: u64,
        target: CageId,
        args: &SyscallArgs,
        mode: ErrnoMode,
    ) -> i64 {
        let mut strace = self.strace_call(self_cage, syscall, args);
        let result = self.route(self_cage, syscall, target, args);
        strace.result(result);

        match mode {
            ErrnoMode::Raw => result,
            ErrnoMode::Translate if (-MAX_ERRNO..0).contains(&result) => {
                if let Some(cage) = self.cages.get(&self_cage) {
                    cage.set_errno((-result) as i32);
                }
                -1
            }
            ErrnoMode::Translate => result,
        }
    }

    /// Starts the trace line of a call.  Buffers and paths are shown from
    /// the memory of the cage owning the argument; `read` buffers are not
    /// filled in yet and print as dots.
    pub(crate) fn strace_call(
        &self,
        self_cage: CageId,
        syscall: u64,
        args: &SyscallArgs,
    ) -> Strace {
        let mut strace = Strace::func(self.options.enable_strace, self_cage, syscall);
        if !self.options.enable_strace {
            return strace;
        }
        let shown = match SyscallNumber::from_u64(syscall) {
            Some(SyscallNumber::WRITE) | Some(SyscallNumber::PWRITE) => {
                strace.arg_value(args[0].value);
                self.trace_pointer(&mut strace, args[1], |strace, memory, offset| {
                    let length = args[2].value.min(u64::from(u32::MAX)) as u32;
                    strace.arg_buffer(memory, offset, length)
                });
                2
            }
            Some(SyscallNumber::READ) | Some(SyscallNumber::PREAD) => {
                strace.arg_value(args[0].value);
                strace.arg_dots();
                2
            }
            Some(SyscallNumber::OPEN) | Some(SyscallNumber::UNLINK) => {
                self.trace_pointer(&mut strace, args[0], |strace, memory, offset| {
                    strace.arg_path(memory, offset)
                });
                1
            }
            _ => 0,
        };
        for arg in args.0[shown..].iter() {
            strace.arg_value(arg.value);
        }
        strace
    }

    fn trace_pointer<F>(&self, strace: &mut Strace, arg: Arg, show: F)
    where
        F: FnOnce(&mut Strace, &LinearMemory, u32),
    {
        if arg.value == 0 {
            return strace.arg_value(0);
        }
        let cage = match self.cage(arg.cage) {
            Ok(cage) => cage,
            Err(_) => return strace.arg_hex(arg.value),
        };
        let memory = cage.memory();
        match memory.resolve(arg.value) {
            Ok(offset) => show(strace, &*memory, offset as u32),
            Err(_) => strace.arg_hex(arg.value),
        }
    }

    fn route(&self, self_cage: CageId, syscall: u64, target: CageId, args: &SyscallArgs) -> i64 {
        if syscall != SyscallNumber::EXIT.number() {
            for cage in [self_cage, target].iter() {
                if self.is_exiting(*cage) {
                    return RuntimeError::CageExiting(*cage).as_return();
                }
            }
        }
        for cage in [self_cage, target].iter() {
            if let Err(e) = self.cage(*cage) {
                debug!("Syscall {} from a cage not in the table: {}", syscall, e);
                return e.as_return();
            }
        }

        if let Some(entry) = self.registry.lookup(self_cage, syscall) {
            debug!(
                "Syscall {} of cage {} dispatched to grate {}.",
                syscall, self_cage, entry.grate
            );
            return match self.trampoline(entry, syscall, target, args) {
                Ok(result) => result,
                Err(e) => {
                    warn!("Dispatch of syscall {} failed: {}", syscall, e);
                    e.as_return()
                }
            };
        }

        match self.runtime_call(syscall, target, args) {
            Some(Ok(result)) => result,
            Some(Err(e)) => {
                debug!("Runtime call {} failed: {}", syscall, e);
                e.as_return()
            }
            None => self.host.call(self, target, syscall, args),
        }
    }

    /// The calls the runtime services itself when nobody interposes them.
    fn runtime_call(
        &self,
        syscall: u64,
        target: CageId,
        args: &SyscallArgs,
    ) -> Option<RuntimeResult<i64>> {
        let result = match SyscallNumber::from_u64(syscall)? {
            SyscallNumber::GETPID => self.live_cage(target).map(|_| target.0 as i64),
            SyscallNumber::FORK => self.fork(target).map(|child| child.0 as i64),
            SyscallNumber::EXECVE => self.exec_from_args(target, args).map(|_| 0),
            SyscallNumber::EXIT => self
                .exit(target, args[0].as_i32())
                .map(|status| status as i64),
            SyscallNumber::REGISTER_HANDLER => self
                .register_handler(
                    CageId(args[0].value),
                    args[1].value,
                    CageId(args[2].value),
                    HandlerRef(args[3].value),
                )
                .map(|_| 0),
            SyscallNumber::COPY_DATA_BETWEEN_CAGES => CopyMode::from_u64(args[3].value)
                .ok_or(RuntimeError::InvalidCopyMode(args[3].value))
                .and_then(|mode| {
                    self.copy(&CopyRequest {
                        source_cage: args[0].cage,
                        source_addr: args[0].value,
                        dest_cage: args[1].cage,
                        dest_addr: args[1].value,
                        length: args[2].value,
                        mode,
                    })
                })
                .map(|copied| copied as i64),
            SyscallNumber::COPY_HANDLER_TABLE => self
                .copy_handler_table(CageId(args[0].value), CageId(args[1].value))
                .map(|copied| copied as i64),
            _ => return None,
        };
        Some(result)
    }

    /// `execve(path, argv, envp)`: the vectors are null-terminated pointer
    /// arrays in the address space of their owning cages.  A null `argv`
    /// runs with the path alone as `argv[0]`.
    fn exec_from_args(&self, target: CageId, args: &SyscallArgs) -> RuntimeResult<()> {
        let path = self.read_exec_path(args[0])?;
        let mut program_arguments = self.read_string_vector(args[1])?;
        if program_arguments.is_empty() {
            program_arguments.push(path);
        }
        let environment_variables = self
            .read_string_vector(args[2])?
            .into_iter()
            .map(|binding| match binding.find('=') {
                Some(n) => (binding[..n].to_string(), binding[n + 1..].to_string()),
                None => (binding, String::new()),
            })
            .collect();
        self.exec(
            target,
            Environment {
                environment_variables,
                program_arguments,
            },
        )
    }

    fn read_exec_path(&self, arg: Arg) -> RuntimeResult<String> {
        if arg.value == 0 {
            return Err(RuntimeError::OutOfRange {
                cage: arg.cage,
                address: 0,
            });
        }
        let cage = self.live_cage(arg.cage)?;
        let memory = cage.memory();
        let offset = memory.resolve(arg.value)?;
        memory.read_cstring(offset as u32, EXEC_STRING_BOUND)
    }

    fn read_string_vector(&self, arg: Arg) -> RuntimeResult<Vec<String>> {
        if arg.value == 0 {
            return Ok(Vec::new());
        }
        let cage = self.live_cage(arg.cage)?;
        let memory = cage.memory();
        let offset = memory.resolve(arg.value)?;
        memory.read_string_list(offset as u32, EXEC_STRING_BOUND)
    }
}
