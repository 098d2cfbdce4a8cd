//! Cages and their per-process state.
//!
//! A cage owns a linear memory and the process state that its C library
//! expects to find there: the argument and environment vectors, and a
//! thread-local block pointing at the character classification table.
//!
//! Guest-relative state survives a byte copy of the memory unchanged.  Host
//! addresses cached from it do not: after a fork the child's memory lives
//! somewhere else, and anything host-relative must be recomputed
//! (`ThreadState::rebase`) before the child runs.
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
    address::{GuestAddr, HostAddr},
    ctype::{self, CharClass, Parsed, CTYPE_TABLE_ENTRIES, CTYPE_TABLE_SIZE, C_LOCALE_TABLE},
    error::{RuntimeError, RuntimeResult},
    memory::{LinearMemory, MemoryHandler},
    Environment,
};
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    mem::size_of,
    sync::atomic::{AtomicI32, Ordering},
};

////////////////////////////////////////////////////////////////////////////////
// Guest memory layout.
////////////////////////////////////////////////////////////////////////////////

/// The first page is never handed out, so no live object sits at null.
pub const NULL_GUARD_SIZE: u32 = 0x1000;
/// The thread-local block.  Word 0 holds the guest address of the
/// classification table.
pub const TLS_BLOCK: GuestAddr = GuestAddr(0x1000);
/// The classification table.
pub const CTYPE_TABLE: GuestAddr = GuestAddr(0x1100);
/// Start of the argument and environment area.
pub const VECTOR_AREA: GuestAddr = GuestAddr(0x2000);
/// Size of the argument and environment area.
pub const VECTOR_AREA_SIZE: u32 = 0x8000;
/// The heap begins above the runtime-reserved area.
pub const HEAP_START: GuestAddr = GuestAddr(VECTOR_AREA.0 + VECTOR_AREA_SIZE);
/// Heap allocations are aligned to this many bytes.
pub const HEAP_ALIGNMENT: u32 = 16;
/// Longest string read back from the vectors.
const VECTOR_STRING_BOUND: u32 = 4096;

////////////////////////////////////////////////////////////////////////////////
// Cage identifiers.
////////////////////////////////////////////////////////////////////////////////

/// A cage (or grate) identifier.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct CageId(pub u64);

impl From<u64> for CageId {
    fn from(id: u64) -> Self {
        CageId(id)
    }
}

impl From<CageId> for u64 {
    fn from(id: CageId) -> Self {
        id.0
    }
}

impl fmt::Display for CageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Thread-local state.
////////////////////////////////////////////////////////////////////////////////

/// Thread-local addressing state of a cage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadState {
    /// Guest address of the thread-local block.
    tls_block: GuestAddr,
    /// Host address of the classification table, cached from the guest
    /// pointer stored in the thread-local block.
    ctype_table: HostAddr,
}

impl ThreadState {
    /// Writes the "C" locale table and the thread-local block into `memory`.
    pub fn install(memory: &mut LinearMemory) -> RuntimeResult<Self> {
        for (index, entry) in C_LOCALE_TABLE.iter().enumerate() {
            memory.write_u16(CTYPE_TABLE.0 + (index as u32) * 2, *entry)?;
        }
        memory.write_u32(TLS_BLOCK.0, CTYPE_TABLE.0)?;
        let mut state = ThreadState {
            tls_block: TLS_BLOCK,
            ctype_table: HostAddr::NULL,
        };
        state.rebase(memory)?;
        Ok(state)
    }

    /// Recomputes the host-relative part of the state from the guest
    /// pointers held in `memory`.
    pub fn rebase(&mut self, memory: &LinearMemory) -> RuntimeResult<()> {
        let table = GuestAddr(memory.read_u32(self.tls_block.0)?);
        if table.is_null() {
            return Err(RuntimeError::OutOfRange {
                cage: memory.owner(),
                address: 0,
            });
        }
        // The whole table must be mapped.
        memory.get_slice(table.0, CTYPE_TABLE_SIZE)?;
        self.ctype_table = memory.to_host(table)?;
        Ok(())
    }

    #[inline]
    pub fn tls_block(&self) -> GuestAddr {
        self.tls_block
    }

    #[inline]
    pub fn ctype_table(&self) -> HostAddr {
        self.ctype_table
    }

    /// Classifies `c` (an `unsigned char` value or EOF) through the cached
    /// table address.  A cached address outside `memory` faults.
    pub fn classify(&self, memory: &LinearMemory, c: i32) -> RuntimeResult<CharClass> {
        if !(-128..256).contains(&c) {
            return Err(RuntimeError::InvalidArgument);
        }
        let table = memory.to_guest(self.ctype_table)?;
        let index = (c + 128) as u32;
        debug_assert!(index < CTYPE_TABLE_ENTRIES);
        Ok(CharClass(memory.read_u16(table.0 + index * 2)?))
    }
}

////////////////////////////////////////////////////////////////////////////////
// Process state.
////////////////////////////////////////////////////////////////////////////////

/// Guest addresses of the process vectors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProcessVectors {
    pub argc: u32,
    pub argv: GuestAddr,
    pub envp: GuestAddr,
}

/// Process state that is copied on fork and rebuilt on exec.
#[derive(Clone, Debug)]
pub struct ProcessState {
    pub environment: Environment,
    pub vectors: ProcessVectors,
    pub thread: ThreadState,
    /// Next free heap address.
    pub heap_break: u32,
}

impl ProcessState {
    /// Lays `environment` out in `memory` and installs the thread-local
    /// block, producing the state of a freshly started process.
    pub fn build(memory: &mut LinearMemory, environment: Environment) -> RuntimeResult<Self> {
        let thread = ThreadState::install(memory)?;
        let vectors = write_vectors(memory, &environment)?;
        Ok(Self {
            environment,
            vectors,
            thread,
            heap_break: HEAP_START.0,
        })
    }
}

/// Writes argv and envp into the vector area: the two null-terminated
/// pointer arrays first, then the strings.
fn write_vectors(
    memory: &mut LinearMemory,
    environment: &Environment,
) -> RuntimeResult<ProcessVectors> {
    let to_cstring = |s: &str| -> Vec<u8> {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        bytes
    };
    let args: Vec<Vec<u8>> = environment
        .program_arguments
        .iter()
        .map(|a| to_cstring(a))
        .collect();
    let envs: Vec<Vec<u8>> = environment
        .environment_variables
        .iter()
        .map(|(k, v)| to_cstring(&format!("{}={}", k, v)))
        .collect();

    let word = size_of::<u32>() as u64;
    let argv_size = (args.len() as u64 + 1) * word;
    let envp_size = (envs.len() as u64 + 1) * word;
    let strings_size: u64 = args.iter().chain(envs.iter()).map(|s| s.len() as u64).sum();
    if argv_size + envp_size + strings_size > VECTOR_AREA_SIZE as u64 {
        return Err(RuntimeError::ArgumentListTooLong);
    }

    let argv = VECTOR_AREA;
    let envp = GuestAddr(argv.0 + argv_size as u32);
    let arg_strings = envp.0 + envp_size as u32;
    let args_size: u32 = args.iter().map(|s| s.len() as u32).sum();
    let env_strings = arg_strings + args_size;

    memory.write_string_list(&args, arg_strings, argv.0)?;
    memory.write_string_list(&envs, env_strings, envp.0)?;
    Ok(ProcessVectors {
        argc: args.len() as u32,
        argv,
        envp,
    })
}

////////////////////////////////////////////////////////////////////////////////
// Cages.
////////////////////////////////////////////////////////////////////////////////

/// An isolated execution context.
pub struct Cage {
    id: CageId,
    parent: Option<CageId>,
    memory: RwLock<LinearMemory>,
    process: Mutex<ProcessState>,
    /// The errno of the last failed call made in translating mode.
    errno: AtomicI32,
}

impl Cage {
    /// A new cage with a zeroed memory of `memory_size` bytes.
    pub fn new(
        id: CageId,
        parent: Option<CageId>,
        memory_size: u64,
        environment: Environment,
    ) -> RuntimeResult<Self> {
        let mut memory = LinearMemory::new(id, memory_size)?;
        if memory.size() <= HEAP_START.0 as u64 {
            return Err(RuntimeError::InvalidArgument);
        }
        let process = ProcessState::build(&mut memory, environment)?;
        Ok(Self {
            id,
            parent,
            memory: RwLock::new(memory),
            process: Mutex::new(process),
            errno: AtomicI32::new(0),
        })
    }

    /// The child of a fork: a byte copy of this cage's memory under a new id,
    /// with its host-relative state rebased onto the copy.
    pub fn fork(&self, child: CageId) -> RuntimeResult<Self> {
        let memory = self.memory.read().duplicate(child);
        let mut process = self.process.lock().clone();
        process.thread.rebase(&memory)?;
        Ok(Self {
            id: child,
            parent: Some(self.id),
            memory: RwLock::new(memory),
            process: Mutex::new(process),
            errno: AtomicI32::new(0),
        })
    }

    /// Replaces the process image: memory is zeroed and the process state
    /// rebuilt for `environment`.
    pub fn exec(&self, environment: Environment) -> RuntimeResult<()> {
        let mut memory = self.memory.write();
        let mut process = self.process.lock();
        memory.reset();
        *process = ProcessState::build(&mut memory, environment)?;
        Ok(())
    }

    #[inline]
    pub fn id(&self) -> CageId {
        self.id
    }

    #[inline]
    pub fn parent(&self) -> Option<CageId> {
        self.parent
    }

    #[inline]
    pub fn memory(&self) -> RwLockReadGuard<'_, LinearMemory> {
        self.memory.read()
    }

    #[inline]
    pub fn memory_mut(&self) -> RwLockWriteGuard<'_, LinearMemory> {
        self.memory.write()
    }

    #[inline]
    pub fn process(&self) -> MutexGuard<'_, ProcessState> {
        self.process.lock()
    }

    #[inline]
    pub fn errno(&self) -> i32 {
        self.errno.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_errno(&self, errno: i32) {
        self.errno.store(errno, Ordering::Release)
    }

    /// Reserves `length` bytes of guest heap.
    pub fn allocate(&self, length: u32) -> RuntimeResult<GuestAddr> {
        let size = self.memory.read().size();
        let mut process = self.process.lock();
        let start = process.heap_break;
        let end = (start as u64 + length as u64 + (HEAP_ALIGNMENT - 1) as u64)
            & !((HEAP_ALIGNMENT - 1) as u64);
        if end > size {
            return Err(RuntimeError::OutOfMemory(self.id));
        }
        process.heap_break = end as u32;
        Ok(GuestAddr(start))
    }

    /// Character classification as seen by this cage's C library.
    pub fn classify(&self, c: i32) -> RuntimeResult<CharClass> {
        let thread = self.process.lock().thread;
        thread.classify(&self.memory.read(), c)
    }

    /// `strtol` on the NUL-terminated string at `address`.
    pub fn strtol(&self, address: GuestAddr, base: u32) -> RuntimeResult<Parsed<i64>> {
        let thread = self.process.lock().thread;
        let memory = self.memory.read();
        let text = read_guest_bytes(&memory, address)?;
        ctype::strtol(&text, base, |c| thread.classify(&memory, c as i32))
    }

    /// `strtoul` on the NUL-terminated string at `address`.
    pub fn strtoul(&self, address: GuestAddr, base: u32) -> RuntimeResult<Parsed<u64>> {
        let thread = self.process.lock().thread;
        let memory = self.memory.read();
        let text = read_guest_bytes(&memory, address)?;
        ctype::strtoul(&text, base, |c| thread.classify(&memory, c as i32))
    }

    /// The program arguments, read back from guest memory.
    pub fn args(&self) -> RuntimeResult<Vec<String>> {
        let argv = self.process.lock().vectors.argv;
        self.memory
            .read()
            .read_string_list(argv.0, VECTOR_STRING_BOUND)
    }

    /// The environment, read back from guest memory.
    pub fn environ(&self) -> RuntimeResult<Vec<String>> {
        let envp = self.process.lock().vectors.envp;
        self.memory
            .read()
            .read_string_list(envp.0, VECTOR_STRING_BOUND)
    }
}

/// The bytes of the NUL-terminated string at `address`, without the NUL.
fn read_guest_bytes(memory: &LinearMemory, address: GuestAddr) -> RuntimeResult<Vec<u8>> {
    let start = address.0 as u64;
    if start >= memory.size() {
        return Err(RuntimeError::OutOfRange {
            cage: memory.owner(),
            address: start,
        });
    }
    let tail = &memory.bytes()[start as usize..];
    let end = tail
        .iter()
        .position(|b| *b == 0)
        .ok_or(RuntimeError::InvalidArgument)?;
    Ok(tail[..end].to_vec())
}
