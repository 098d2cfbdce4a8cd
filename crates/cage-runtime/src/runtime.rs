//! The runtime: the table of live cages and everything that acts on more
//! than one of them.
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
    cage::{Cage, CageId},
    dispatch::HandlerArena,
    error::{RuntimeError, RuntimeResult},
    host::{HostBackend, UnsupportedHost},
    memory::MemoryHandler,
    registry::{HandlerEntry, HandlerRef, HandlerRegistry},
    Environment, Options,
};
use dashmap::{DashMap, DashSet};
use log::info;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Owns every cage, the handler registry and the host backend.
pub struct Runtime {
    pub(crate) options: Options,
    pub(crate) cages: DashMap<CageId, Arc<Cage>>,
    /// Cages being torn down.  Calls on their behalf fail.
    exiting: DashSet<CageId>,
    next_cage_id: AtomicU64,
    pub(crate) registry: HandlerRegistry,
    pub(crate) arenas: DashMap<CageId, HandlerArena>,
    pub(crate) host: Box<dyn HostBackend>,
}

impl Runtime {
    /// A runtime whose unhandled syscalls fail with `ENOSYS`.
    pub fn new(options: Options) -> Self {
        Self::with_host(options, Box::new(UnsupportedHost))
    }

    pub fn with_host(options: Options, host: Box<dyn HostBackend>) -> Self {
        let registry = HandlerRegistry::new(options.registration_policy);
        Self {
            options,
            cages: DashMap::new(),
            exiting: DashSet::new(),
            next_cage_id: AtomicU64::new(1),
            registry,
            arenas: DashMap::new(),
            host,
        }
    }

    #[inline]
    pub fn options(&self) -> &Options {
        &self.options
    }

    #[inline]
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    fn allocate_cage_id(&self) -> CageId {
        CageId(self.next_cage_id.fetch_add(1, Ordering::Relaxed))
    }

    fn insert(&self, cage: Cage) -> CageId {
        let id = cage.id();
        self.cages.insert(id, Arc::new(cage));
        id
    }

    ////////////////////////////////////////////////////////////////////////////
    // Cage table.
    ////////////////////////////////////////////////////////////////////////////

    /// Starts a cage with the configured default environment.
    pub fn spawn_cage(&self, parent: Option<CageId>) -> RuntimeResult<CageId> {
        self.spawn_cage_with(parent, self.options.environment.clone())
    }

    /// Starts a cage running with `environment`.
    pub fn spawn_cage_with(
        &self,
        parent: Option<CageId>,
        environment: Environment,
    ) -> RuntimeResult<CageId> {
        if let Some(parent) = parent {
            self.live_cage(parent)?;
        }
        let id = self.allocate_cage_id();
        let cage = Cage::new(
            id,
            parent,
            self.options.effective_memory_size(),
            environment,
        )?;
        info!("Spawned cage {}.", id);
        Ok(self.insert(cage))
    }

    /// The cage named `id`.
    pub fn cage(&self, id: CageId) -> RuntimeResult<Arc<Cage>> {
        self.cages
            .get(&id)
            .map(|cage| Arc::clone(&cage))
            .ok_or(RuntimeError::UnknownCage(id))
    }

    /// The cage named `id`, provided it is not exiting.
    pub(crate) fn live_cage(&self, id: CageId) -> RuntimeResult<Arc<Cage>> {
        if self.is_exiting(id) {
            return Err(RuntimeError::CageExiting(id));
        }
        self.cage(id)
    }

    #[inline]
    pub fn is_exiting(&self, id: CageId) -> bool {
        self.exiting.contains(&id)
    }

    /// The ids of every cage in the table, ascending.
    pub fn cage_ids(&self) -> Vec<CageId> {
        let mut ids: Vec<CageId> = self.cages.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }

    ////////////////////////////////////////////////////////////////////////////
    // Address translation.
    ////////////////////////////////////////////////////////////////////////////

    /// Translates a guest address of `cage` into host space.
    pub fn to_host(&self, cage: CageId, address: GuestAddr) -> RuntimeResult<HostAddr> {
        self.cage(cage)?.memory().to_host(address)
    }

    /// Translates a host address back into the guest space of `cage`.
    pub fn to_guest(&self, cage: CageId, address: HostAddr) -> RuntimeResult<GuestAddr> {
        self.cage(cage)?.memory().to_guest(address)
    }

    ////////////////////////////////////////////////////////////////////////////
    // Registration.
    ////////////////////////////////////////////////////////////////////////////

    /// Routes `syscall` of `target` to `handler` of `grate`.  The null handle
    /// deregisters.
    pub fn register_handler(
        &self,
        target: CageId,
        syscall: u64,
        grate: CageId,
        handler: HandlerRef,
    ) -> RuntimeResult<()> {
        self.live_cage(target)?;
        if handler.is_null() {
            self.registry.deregister(target, syscall);
            return Ok(());
        }
        self.live_cage(grate)?;
        self.registry.register(target, syscall, grate, handler)
    }

    /// Removes the registration of `syscall` on `target`, if any.
    pub fn deregister_handler(&self, target: CageId, syscall: u64) -> bool {
        self.registry.deregister(target, syscall)
    }

    pub fn lookup_handler(&self, target: CageId, syscall: u64) -> Option<HandlerEntry> {
        self.registry.lookup(target, syscall)
    }

    /// Copies the registrations of `source` onto `destination`, keeping any
    /// the destination already has.
    pub fn copy_handler_table(&self, source: CageId, destination: CageId) -> RuntimeResult<usize> {
        self.live_cage(source)?;
        self.live_cage(destination)?;
        Ok(self.registry.copy_table(source, destination))
    }

    ////////////////////////////////////////////////////////////////////////////
    // Lifecycle.
    ////////////////////////////////////////////////////////////////////////////

    /// Forks `parent`, returning the child's id.  The child's memory is a
    /// copy of the parent's and its thread-local state has been rebased onto
    /// it.  Registrations are not inherited.
    pub fn fork(&self, parent: CageId) -> RuntimeResult<CageId> {
        let parent_cage = self.live_cage(parent)?;
        let child = self.allocate_cage_id();
        let cage = parent_cage.fork(child)?;
        info!("Forked cage {} into cage {}.", parent, child);
        Ok(self.insert(cage))
    }

    /// Replaces the process image of `cage`.
    pub fn exec(&self, cage: CageId, environment: Environment) -> RuntimeResult<()> {
        self.live_cage(cage)?.exec(environment)?;
        info!("Cage {} exec'd.", cage);
        Ok(())
    }

    /// Tears `cage` down: registrations that target it or are serviced by it
    /// go, then the cage itself.  Returns `status`.
    pub fn exit(&self, cage: CageId, status: i32) -> RuntimeResult<i32> {
        self.cage(cage)?;
        if !self.exiting.insert(cage) {
            return Err(RuntimeError::CageExiting(cage));
        }
        let targeted = self.registry.remove_cage(cage);
        let serviced = self.registry.remove_grate(cage);
        self.arenas.remove(&cage);
        self.cages.remove(&cage);
        self.exiting.remove(&cage);
        info!(
            "Cage {} exited with status {} ({} registrations dropped).",
            cage,
            status,
            targeted + serviced
        );
        Ok(status)
    }

    ////////////////////////////////////////////////////////////////////////////
    // Per-cage helpers.
    ////////////////////////////////////////////////////////////////////////////

    /// The errno recorded by the last failing translated call of `cage`.
    pub fn errno(&self, cage: CageId) -> RuntimeResult<i32> {
        Ok(self.cage(cage)?.errno())
    }

    /// Reserves `length` bytes of guest heap in `cage`.
    pub fn allocate(&self, cage: CageId, length: u32) -> RuntimeResult<GuestAddr> {
        self.live_cage(cage)?.allocate(length)
    }

    /// Writes `bytes` at guest address `address` of `cage`.
    pub fn write_memory(&self, cage: CageId, address: GuestAddr, bytes: &[u8]) -> RuntimeResult<()> {
        self.live_cage(cage)?
            .memory_mut()
            .write_buffer(address.0, bytes)
    }

    /// Reads `length` bytes at guest address `address` of `cage`.
    pub fn read_memory(
        &self,
        cage: CageId,
        address: GuestAddr,
        length: u32,
    ) -> RuntimeResult<Vec<u8>> {
        let mut bytes = vec![0u8; length as usize];
        self.live_cage(cage)?
            .memory()
            .read_buffer(address.0, &mut bytes)?;
        Ok(bytes)
    }

    /// Reads `length` bytes at `address` of `cage`, given in either form.
    pub fn read_resolved(&self, cage: CageId, address: u64, length: u64) -> RuntimeResult<Vec<u8>> {
        if address == 0 && length > 0 {
            return Err(RuntimeError::ShortRange {
                cage,
                address,
                length,
            });
        }
        let cage = self.live_cage(cage)?;
        let memory = cage.memory();
        let range = memory.resolve_range(address, length)?;
        Ok(memory.bytes()[range].to_vec())
    }

    /// The program arguments of `cage`, read back from its memory.
    pub fn args(&self, cage: CageId) -> RuntimeResult<Vec<String>> {
        self.live_cage(cage)?.args()
    }

    /// The environment of `cage`, read back from its memory.
    pub fn environ(&self, cage: CageId) -> RuntimeResult<Vec<String>> {
        self.live_cage(cage)?.environ()
    }
}
