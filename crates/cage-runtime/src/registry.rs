//! The handler registry.
//!
//! Maps `(target cage, syscall number)` to the grate handler that services
//! it.  Lookups sit on the hot syscall path, so the table is published as an
//! immutable snapshot: a writer builds the next table on the side and then
//! swaps a pointer.  A lookup only ever waits for that swap, never for a
//! registration being computed, and it holds nothing once it returns, so a
//! handler may re-enter the registry freely.
//!
//! Visibility is monotonic: once `register` returns, every later lookup sees
//! the entry.
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
    error::{RuntimeError, RuntimeResult},
};
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, mem, sync::Arc};
use strum_macros::{EnumString, IntoStaticStr};

/// What `register` does when a different grate already owns the key.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, EnumString, IntoStaticStr,
)]
#[strum(serialize_all = "kebab-case")]
pub enum RegistrationPolicy {
    /// The newer registration replaces the older one.
    LastWriterWins,
    /// The registration fails with `AlreadyOwnedByOther`.
    RejectForeign,
}

impl Default for RegistrationPolicy {
    fn default() -> Self {
        RegistrationPolicy::LastWriterWins
    }
}

/// A stable handle to a handler installed in a grate.  Zero is the null
/// handle.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct HandlerRef(pub u64);

impl HandlerRef {
    pub const NULL: HandlerRef = HandlerRef(0);

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for HandlerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The override registered for one key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerEntry {
    /// The grate servicing the call.
    pub grate: CageId,
    /// The handler within that grate.
    pub handler: HandlerRef,
}

type Table = HashMap<(CageId, u64), HandlerEntry>;

pub struct HandlerRegistry {
    policy: RegistrationPolicy,
    /// The published table.
    snapshot: RwLock<Arc<Table>>,
    /// Serialises writers so that each one builds on the latest table.
    writer: Mutex<()>,
}

impl HandlerRegistry {
    pub fn new(policy: RegistrationPolicy) -> Self {
        Self {
            policy,
            snapshot: RwLock::new(Arc::new(Table::new())),
            writer: Mutex::new(()),
        }
    }

    #[inline]
    pub fn policy(&self) -> RegistrationPolicy {
        self.policy
    }

    #[inline]
    fn current(&self) -> Arc<Table> {
        self.snapshot.read().clone()
    }

    /// Builds the next table with `f` and publishes it, unless `f` fails or
    /// reports that nothing changed.
    fn update<F, T>(&self, f: F) -> RuntimeResult<T>
    where
        F: FnOnce(&mut Table) -> RuntimeResult<(T, bool)>,
    {
        let _writer = self.writer.lock();
        let mut table = (*self.current()).clone();
        let (result, changed) = f(&mut table)?;
        if changed {
            let old = mem::replace(&mut *self.snapshot.write(), Arc::new(table));
            // Released outside the lock.
            drop(old);
        }
        Ok(result)
    }

    /// Routes `syscall` of `target` to `handler` in `grate`.  The null handle
    /// deregisters.
    pub fn register(
        &self,
        target: CageId,
        syscall: u64,
        grate: CageId,
        handler: HandlerRef,
    ) -> RuntimeResult<()> {
        if handler.is_null() {
            self.deregister(target, syscall);
            return Ok(());
        }
        let policy = self.policy;
        self.update(|table| {
            if let Some(existing) = table.get(&(target, syscall)) {
                if policy == RegistrationPolicy::RejectForeign && existing.grate != grate {
                    return Err(RuntimeError::AlreadyOwnedByOther {
                        cage: target,
                        syscall,
                        owner: existing.grate,
                    });
                }
            }
            table.insert((target, syscall), HandlerEntry { grate, handler });
            Ok(((), true))
        })?;
        info!(
            "Syscall {} of cage {} routed to handler {} of grate {}.",
            syscall, target, handler, grate
        );
        Ok(())
    }

    /// Removes the registration for the key, if any.  Returns whether one was
    /// present.
    pub fn deregister(&self, target: CageId, syscall: u64) -> bool {
        // NOTE: the closure cannot fail.
        self.update(|table| {
            let removed = table.remove(&(target, syscall)).is_some();
            Ok((removed, removed))
        })
        .unwrap_or(false)
    }

    /// The registration for the key, if any.
    #[inline]
    pub fn lookup(&self, target: CageId, syscall: u64) -> Option<HandlerEntry> {
        self.snapshot.read().get(&(target, syscall)).copied()
    }

    /// Copies every registration of `source` onto `destination`, keeping the
    /// ones `destination` already has.  Returns the number copied.
    pub fn copy_table(&self, source: CageId, destination: CageId) -> usize {
        let copied = self
            .update(|table| {
                let inherited: Vec<(u64, HandlerEntry)> = table
                    .iter()
                    .filter(|((cage, syscall), _)| {
                        *cage == source && !table.contains_key(&(destination, *syscall))
                    })
                    .map(|((_, syscall), entry)| (*syscall, *entry))
                    .collect();
                let count = inherited.len();
                for (syscall, entry) in inherited {
                    table.insert((destination, syscall), entry);
                }
                Ok((count, count > 0))
            })
            .unwrap_or(0);
        debug!(
            "Copied {} registrations from cage {} to cage {}.",
            copied, source, destination
        );
        copied
    }

    /// Drops every registration whose target is `cage`.
    pub fn remove_cage(&self, cage: CageId) -> usize {
        self.remove_where(|(target, _), _| *target == cage)
    }

    /// Drops every registration serviced by `grate`, on every cage.
    pub fn remove_grate(&self, grate: CageId) -> usize {
        self.remove_where(|_, entry| entry.grate == grate)
    }

    fn remove_where<P>(&self, predicate: P) -> usize
    where
        P: Fn(&(CageId, u64), &HandlerEntry) -> bool,
    {
        self.update(|table| {
            let before = table.len();
            table.retain(|key, entry| !predicate(key, entry));
            let removed = before - table.len();
            Ok((removed, removed > 0))
        })
        .unwrap_or(0)
    }

    /// The registrations of `cage`, ordered by syscall number.
    pub fn entries_for(&self, cage: CageId) -> Vec<(u64, HandlerEntry)> {
        let mut entries: Vec<(u64, HandlerEntry)> = self
            .current()
            .iter()
            .filter(|((target, _), _)| *target == cage)
            .map(|((_, syscall), entry)| (*syscall, *entry))
            .collect();
        entries.sort_by_key(|(syscall, _)| *syscall);
        entries
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new(RegistrationPolicy::default())
    }
}
