//! The cage runtime
//!
//! Cages are lightweight isolated processes, each with its own narrow linear
//! memory.  Grates are cooperating processes that take over individual
//! system calls of other cages.  This crate provides:
//!
//! 1. address translation between a cage's linear memory and host space,
//! 2. the cross-cage copy primitive,
//! 3. the handler registry and the dispatch trampoline, and
//! 4. the lifecycle glue that keeps per-process state valid across fork and
//!    exec.
//!
//! Everything hangs off an explicitly constructed `Runtime`; there is no
//! ambient global state.
//!
//! ## Authors
//!
//! The Veracruz Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the Veracruz root directory for
//! information on licensing and copyright.

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate num_derive;

pub mod abi;
pub mod address;
pub mod cage;
pub mod copy;
pub mod ctype;
pub mod dispatch;
pub mod error;
pub mod host;
pub mod memory;
pub mod registry;
pub mod runtime;
pub mod strace;
pub mod syscall;

pub use address::{GuestAddr, HostAddr};
pub use cage::CageId;
pub use copy::{CopyMode, CopyRequest};
pub use dispatch::{handler_fn, Arg, ErrnoMode, GrateContext, SyscallArgs, SyscallHandler};
pub use error::{RuntimeError, RuntimeResult};
pub use host::{HostBackend, StdioHost, UnsupportedHost};
pub use registry::{HandlerEntry, HandlerRef, RegistrationPolicy};
pub use runtime::Runtime;
pub use syscall::SyscallNumber;

use address::{MAX_LINEAR_MEMORY_SIZE, PAGE_SIZE};
use serde::{Deserialize, Serialize};

/// Runtime environment for a program.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct Environment {
    /// The environment variables currently set, and their bindings.
    pub environment_variables: Vec<(String, String)>,
    /// The program arguments of the executable being executed.
    pub program_arguments: Vec<String>,
}

/// Runtime configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Bytes of linear memory given to every cage.
    pub memory_size: u64,
    /// What happens when a second grate registers for a taken key.
    pub registration_policy: RegistrationPolicy,
    /// Whether strace-like output is enabled.
    pub enable_strace: bool,
    /// Environment installed in freshly spawned cages.
    pub environment: Environment,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            memory_size: 16 * PAGE_SIZE,
            registration_policy: RegistrationPolicy::default(),
            enable_strace: false,
            environment: Environment::default(),
        }
    }
}

impl Options {
    /// Reads options from a JSON document.  Absent fields take their
    /// defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// The memory size actually used: rounded up to whole pages and capped
    /// at the narrow-pointer limit.
    pub fn effective_memory_size(&self) -> u64 {
        let pages = self.memory_size.max(1).saturating_add(PAGE_SIZE - 1) / PAGE_SIZE;
        pages.saturating_mul(PAGE_SIZE).min(MAX_LINEAR_MEMORY_SIZE)
    }
}
