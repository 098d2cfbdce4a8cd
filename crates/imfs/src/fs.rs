//! A synthetic filesystem.
//!
//! This in-memory file system (IMFS) backs the file-I/O syscalls of the cages
//! a grate services.  It follows POSIX semantics with *strict typing* and
//! *Rust-style error handling*: every operation returns a `FileSystemResult`
//! whose error is a conventional `Errno`, which the grate hands back to the
//! cage as a negative return value.
//!
//! Locks are always taken in this order: path table, inode table, the map of
//! descriptor tables, one descriptor table, one inode.
//!
//! ## Authors
//!
//! The Veracruz Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the Veracruz root directory for
//! information on licensing and copyright.

use log::{debug, info};
use nix::{
    errno::Errno,
    fcntl::{FdFlag, OFlag},
    sys::stat::SFlag,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    convert::TryFrom,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use strum_macros::{EnumString, IntoStaticStr};

////////////////////////////////////////////////////////////////////////////////
// Filesystem errors.
////////////////////////////////////////////////////////////////////////////////

/// Filesystem operations either return a result of type `T` or the error
/// number reported to the cage.
pub type FileSystemResult<T> = Result<T, Errno>;

////////////////////////////////////////////////////////////////////////////////
// Basic types.
////////////////////////////////////////////////////////////////////////////////

/// An inode number.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Inode(pub u64);

/// A file descriptor, as seen by one cage.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Fd(pub i32);

impl fmt::Display for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The base of a seek.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum Whence {
    Start = 0,
    Current = 1,
    End = 2,
}

/// The `fcntl` commands the filesystem understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum FcntlCommand {
    DupFd = 0,
    GetFd = 1,
    SetFd = 2,
    GetFl = 3,
    SetFl = 4,
    DupFdCloexec = 1030,
}

/// What `unlink` does to a file that is still open.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, EnumString, IntoStaticStr,
)]
#[strum(serialize_all = "kebab-case")]
pub enum UnlinkPolicy {
    /// The name goes at once; open descriptors keep the data until closed.
    Posix,
    /// The unlink fails with `EBUSY` while any descriptor refers to the file.
    FailIfOpen,
}

impl Default for UnlinkPolicy {
    fn default() -> Self {
        UnlinkPolicy::Posix
    }
}

/// Status of a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub inode: Inode,
    /// File type and permission bits, as in `st_mode`.
    pub mode: u32,
    /// Number of names; zero once unlinked.
    pub num_links: u64,
    pub file_size: u64,
}

/// Status of a descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FdStat {
    /// Access mode and status flags (`O_APPEND`, `O_NONBLOCK`).
    pub flags: OFlag,
    /// Descriptor flags (`FD_CLOEXEC`).
    pub fd_flags: FdFlag,
}

impl FdStat {
    #[inline]
    fn access_mode(&self) -> OFlag {
        self.flags & OFlag::O_ACCMODE
    }

    #[inline]
    fn readable(&self) -> bool {
        self.access_mode() != OFlag::O_WRONLY
    }

    #[inline]
    fn writable(&self) -> bool {
        let mode = self.access_mode();
        mode == OFlag::O_WRONLY || mode == OFlag::O_RDWR
    }
}

////////////////////////////////////////////////////////////////////////////////
// INodes.
////////////////////////////////////////////////////////////////////////////////

/// INodes wrap the actual raw file data, and associate meta-data with that raw
/// data buffer.
#[derive(Clone, Debug)]
struct InodeImpl {
    /// The status of this file.
    file_stat: FileStat,
    /// The content of the file in bytes.  NOTE: the buffer length *must* match
    /// `file_stat.file_size`.
    raw_file_data: Vec<u8>,
}

impl InodeImpl {
    fn new(inode: Inode, mode: u32, raw_file_data: Vec<u8>) -> Self {
        Self {
            file_stat: FileStat {
                inode,
                mode: SFlag::S_IFREG.bits() as u32 | (mode & 0o7777),
                num_links: 1,
                file_size: raw_file_data.len() as u64,
            },
            raw_file_data,
        }
    }

    /// Up to `len` bytes starting at `offset`.  Reading at or past the end
    /// yields nothing.
    fn read_at(&self, len: usize, offset: u64) -> Vec<u8> {
        if offset >= self.file_stat.file_size {
            return Vec::new();
        }
        let start = offset as usize;
        let end = start.saturating_add(len).min(self.raw_file_data.len());
        self.raw_file_data[start..end].to_vec()
    }

    /// Writes `buf` at `offset`, zero-filling any gap past the old end.
    fn write_at(&mut self, buf: &[u8], offset: u64) -> FileSystemResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(buf.len() as u64)
            .filter(|end| *end <= FileSystem::MAX_FILE_SIZE)
            .ok_or(Errno::EFBIG)?;
        if end > self.raw_file_data.len() as u64 {
            let grow = end as usize - self.raw_file_data.len();
            self.raw_file_data
                .try_reserve_exact(grow)
                .map_err(|_| Errno::ENOSPC)?;
            self.raw_file_data.resize(end as usize, 0);
        }
        self.raw_file_data[offset as usize..end as usize].copy_from_slice(buf);
        self.file_stat.file_size = self.raw_file_data.len() as u64;
        Ok(buf.len())
    }

    fn truncate(&mut self) {
        self.raw_file_data = Vec::new();
        self.file_stat.file_size = 0;
    }
}

type SharedInode = Arc<RwLock<InodeImpl>>;

////////////////////////////////////////////////////////////////////////////////
// File-table entries.
////////////////////////////////////////////////////////////////////////////////

/// Each file table entry holds the inode it refers to, which keeps the data
/// alive after an unlink.
#[derive(Clone, Debug)]
struct FileTableEntry {
    /// The file itself.
    node: SharedInode,
    /// Metadata for the file descriptor.
    fd_stat: FdStat,
    /// The current offset of the file descriptor.
    offset: u64,
}

/// The descriptors of one cage.  Cloning a table (fork) gives every
/// descriptor its own cursor.
#[derive(Clone, Debug, Default)]
struct FileTable {
    entries: BTreeMap<Fd, FileTableEntry>,
}

impl FileTable {
    /// The lowest free descriptor not below `min`.
    fn lowest_free(&self, min: i32) -> FileSystemResult<Fd> {
        if min < 0 || min >= FileSystem::MAX_FDS {
            return Err(Errno::EINVAL);
        }
        let mut candidate = min.max(FileSystem::FIRST_FD);
        for fd in self.entries.range(Fd(candidate)..).map(|(fd, _)| fd.0) {
            if fd != candidate {
                break;
            }
            candidate += 1;
        }
        if candidate >= FileSystem::MAX_FDS {
            return Err(Errno::EMFILE);
        }
        Ok(Fd(candidate))
    }

    fn get(&self, fd: Fd) -> FileSystemResult<&FileTableEntry> {
        self.entries.get(&fd).ok_or(Errno::EBADF)
    }

    fn get_mut(&mut self, fd: Fd) -> FileSystemResult<&mut FileTableEntry> {
        self.entries.get_mut(&fd).ok_or(Errno::EBADF)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Paths.
////////////////////////////////////////////////////////////////////////////////

/// Normalises `path` into the canonical form used as a key: rooted at `/`,
/// with empty and `.` components dropped and `..` resolved.
fn normalise_path(path: &str) -> FileSystemResult<String> {
    if path.is_empty() {
        return Err(Errno::ENOENT);
    }
    let mut components: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => (),
            ".." => {
                components.pop();
            }
            c => components.push(c),
        }
    }
    if components.is_empty() {
        return Err(Errno::EISDIR);
    }
    Ok(format!("/{}", components.join("/")))
}

////////////////////////////////////////////////////////////////////////////////
// Filesystems.
////////////////////////////////////////////////////////////////////////////////

/// The filesystem proper, which collects together various tables and bits of
/// meta-data.
pub struct FileSystem {
    policy: UnlinkPolicy,
    /// The structure of the file system.
    ///
    /// NOTE: This is a flat map from files to inodes.
    path_table: RwLock<HashMap<String, Inode>>,
    /// The inode table, which points to the actual data associated with a file
    /// and other metadata.  This table is indexed by the Inode.  Unlinked
    /// files leave it even while descriptors still hold them.
    inode_table: RwLock<HashMap<Inode, SharedInode>>,
    /// The descriptor table of each cage, indexed by cage id.
    file_tables: RwLock<HashMap<u64, Arc<Mutex<FileTable>>>>,
    next_inode: AtomicU64,
}

impl FileSystem {
    ////////////////////////////////////////////////////////////////////////////
    // Creating filesystems.
    ////////////////////////////////////////////////////////////////////////////

    /// Descriptors below this belong to the standard streams.
    pub const FIRST_FD: i32 = 3;
    /// Descriptors per cage.
    pub const MAX_FDS: i32 = 1024;
    /// Largest file the filesystem holds.  Files are stored densely, so a
    /// write that would grow one past this fails with `EFBIG`; seeking
    /// further is still allowed.
    pub const MAX_FILE_SIZE: u64 = 64 << 20;
    /// Permissions of files created without an explicit mode.
    pub const DEFAULT_MODE: u32 = 0o644;
    /// The first inode handed out.
    const FIRST_INODE: u64 = 2;

    /// Creates a new, empty filesystem.
    pub fn new(policy: UnlinkPolicy) -> Self {
        Self {
            policy,
            path_table: RwLock::new(HashMap::new()),
            inode_table: RwLock::new(HashMap::new()),
            file_tables: RwLock::new(HashMap::new()),
            next_inode: AtomicU64::new(Self::FIRST_INODE),
        }
    }

    #[inline]
    pub fn policy(&self) -> UnlinkPolicy {
        self.policy
    }

    fn new_inode(&self) -> Inode {
        Inode(self.next_inode.fetch_add(1, Ordering::Relaxed))
    }

    /// Installs a file under the (normalised) `path`, replacing any existing
    /// contents.  Existing descriptors on the file see the new contents.
    pub fn write_file_by_absolute_path(&self, path: &str, data: &[u8]) -> FileSystemResult<()> {
        let path = normalise_path(path)?;
        let mut path_table = self.path_table.write();
        let mut inode_table = self.inode_table.write();
        let existing = path_table
            .get(&path)
            .and_then(|inode| inode_table.get(inode))
            .cloned();
        match existing {
            Some(node) => {
                let mut node = node.write();
                node.truncate();
                node.write_at(data, 0)?;
            }
            None => {
                let inode = self.new_inode();
                let node = InodeImpl::new(inode, Self::DEFAULT_MODE, data.to_vec());
                inode_table.insert(inode, Arc::new(RwLock::new(node)));
                path_table.insert(path.clone(), inode);
            }
        }
        info!("Installed {} ({} bytes).", path, data.len());
        Ok(())
    }

    /// The whole contents of the file at `path`.
    pub fn read_file_by_absolute_path(&self, path: &str) -> FileSystemResult<Vec<u8>> {
        let node = self.lookup(&normalise_path(path)?)?;
        let data = node.read().raw_file_data.clone();
        Ok(data)
    }

    /// Every path in the filesystem, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.path_table.read().keys().cloned().collect();
        paths.sort();
        paths
    }

    fn lookup(&self, path: &str) -> FileSystemResult<SharedInode> {
        let path_table = self.path_table.read();
        let inode = path_table.get(path).ok_or(Errno::ENOENT)?;
        self.inode_table
            .read()
            .get(inode)
            .cloned()
            .ok_or(Errno::ENOENT)
    }

    ////////////////////////////////////////////////////////////////////////////
    // Descriptor tables.
    ////////////////////////////////////////////////////////////////////////////

    fn table(&self, cage: u64) -> FileSystemResult<Arc<Mutex<FileTable>>> {
        self.file_tables
            .read()
            .get(&cage)
            .cloned()
            .ok_or(Errno::EBADF)
    }

    fn table_or_create(&self, cage: u64) -> Arc<Mutex<FileTable>> {
        if let Ok(table) = self.table(cage) {
            return table;
        }
        Arc::clone(self.file_tables.write().entry(cage).or_default())
    }

    /// Runs `f` on the entry for `fd` of `cage`, with the table locked.
    fn with_entry<T, F>(&self, cage: u64, fd: Fd, f: F) -> FileSystemResult<T>
    where
        F: FnOnce(&mut FileTableEntry) -> FileSystemResult<T>,
    {
        let table = self.table(cage)?;
        let mut table = table.lock();
        f(table.get_mut(fd)?)
    }

    /// Gives `child` a copy of the descriptor table of `parent`.  Each copied
    /// descriptor starts at its parent's position and moves independently.
    pub fn fork_table(&self, parent: u64, child: u64) -> FileSystemResult<()> {
        let copy = match self.table(parent) {
            Ok(table) => table.lock().clone(),
            Err(_) => FileTable::default(),
        };
        let count = copy.entries.len();
        self.file_tables
            .write()
            .insert(child, Arc::new(Mutex::new(copy)));
        info!(
            "Copied {} descriptors of cage {} to cage {}.",
            count, parent, child
        );
        Ok(())
    }

    /// Closes the close-on-exec descriptors of `cage`.
    pub fn exec_table(&self, cage: u64) -> FileSystemResult<usize> {
        let table = match self.table(cage) {
            Ok(table) => table,
            Err(_) => return Ok(0),
        };
        let mut table = table.lock();
        let before = table.entries.len();
        table
            .entries
            .retain(|_, entry| !entry.fd_stat.fd_flags.contains(FdFlag::FD_CLOEXEC));
        let closed = before - table.entries.len();
        debug!("Closed {} close-on-exec descriptors of cage {}.", closed, cage);
        Ok(closed)
    }

    /// Closes every descriptor of `cage`.
    pub fn remove_table(&self, cage: u64) -> usize {
        let removed = self.file_tables.write().remove(&cage);
        let count = removed.map(|table| table.lock().entries.len()).unwrap_or(0);
        debug!("Dropped the {} descriptors of cage {}.", count, cage);
        count
    }

    /// The open descriptors of `cage`, ascending.
    pub fn descriptors(&self, cage: u64) -> Vec<Fd> {
        match self.table(cage) {
            Ok(table) => table.lock().entries.keys().copied().collect(),
            Err(_) => Vec::new(),
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // Operations on the filesystem.
    ////////////////////////////////////////////////////////////////////////////

    /// Opens `path` for `cage`, creating it when `O_CREAT` is given.  Returns
    /// the lowest free descriptor.
    pub fn open(&self, cage: u64, path: &str, flags: OFlag, mode: u32) -> FileSystemResult<Fd> {
        debug!(
            "open on cage {}, path {:?}, flags {:?}, mode {:o}",
            cage, path, flags, mode
        );
        let path = normalise_path(path)?;
        let mut fd_stat = FdStat {
            flags: flags
                & (OFlag::O_ACCMODE | OFlag::O_APPEND | OFlag::O_NONBLOCK),
            fd_flags: FdFlag::empty(),
        };
        if flags.contains(OFlag::O_CLOEXEC) {
            fd_stat.fd_flags.insert(FdFlag::FD_CLOEXEC);
        }
        if fd_stat.access_mode() == OFlag::O_ACCMODE {
            return Err(Errno::EINVAL);
        }

        let mut path_table = self.path_table.write();
        let mut inode_table = self.inode_table.write();
        let existing = path_table.get(&path).copied();
        let (inode, node) = match existing {
            Some(inode) => {
                if flags.contains(OFlag::O_CREAT | OFlag::O_EXCL) {
                    return Err(Errno::EEXIST);
                }
                let node = inode_table.get(&inode).cloned().ok_or(Errno::ENOENT)?;
                (inode, node)
            }
            None => {
                if !flags.contains(OFlag::O_CREAT) {
                    return Err(Errno::ENOENT);
                }
                let inode = self.new_inode();
                let node = Arc::new(RwLock::new(InodeImpl::new(inode, mode, Vec::new())));
                inode_table.insert(inode, Arc::clone(&node));
                path_table.insert(path.clone(), inode);
                (inode, node)
            }
        };

        let table = self.table_or_create(cage);
        let mut table = table.lock();
        let fd = table.lowest_free(Self::FIRST_FD)?;
        if flags.contains(OFlag::O_TRUNC) && fd_stat.writable() {
            node.write().truncate();
        }
        // Append-mode descriptors start at the end of the file.
        let offset = if flags.contains(OFlag::O_APPEND) {
            node.read().file_stat.file_size
        } else {
            0
        };
        table.entries.insert(
            fd,
            FileTableEntry {
                node,
                fd_stat,
                offset,
            },
        );
        debug!(
            "new fd {} created for {:?} ({:?}) on cage {}.",
            fd, path, inode, cage
        );
        Ok(fd)
    }

    /// Closes `fd` of `cage`.  Returns `EBADF` if `fd` is not open.
    pub fn close(&self, cage: u64, fd: Fd) -> FileSystemResult<()> {
        debug!("close on cage {}, fd {}", cage, fd);
        let table = self.table(cage)?;
        let removed = table.lock().entries.remove(&fd).ok_or(Errno::EBADF)?;
        // The data of an unlinked file goes with its last descriptor.
        drop(removed);
        Ok(())
    }

    /// Reads up to `len` bytes at `offset` without moving the cursor.
    pub fn pread(&self, cage: u64, fd: Fd, len: usize, offset: u64) -> FileSystemResult<Vec<u8>> {
        debug!(
            "pread on cage {}, fd {}, len {} and offset {}",
            cage, fd, len, offset
        );
        self.with_entry(cage, fd, |entry| Self::pread_entry(entry, len, offset))
    }

    fn pread_entry(entry: &FileTableEntry, len: usize, offset: u64) -> FileSystemResult<Vec<u8>> {
        if !entry.fd_stat.readable() {
            return Err(Errno::EBADF);
        }
        let data = entry.node.read().read_at(len, offset);
        Ok(data)
    }

    /// Writes `buf` at `offset` without moving the cursor.
    pub fn pwrite(&self, cage: u64, fd: Fd, buf: &[u8], offset: u64) -> FileSystemResult<usize> {
        debug!(
            "pwrite on cage {}, fd {}, offset {} and {} bytes",
            cage,
            fd,
            offset,
            buf.len()
        );
        self.with_entry(cage, fd, |entry| Self::pwrite_entry(entry, buf, offset))
    }

    fn pwrite_entry(entry: &FileTableEntry, buf: &[u8], offset: u64) -> FileSystemResult<usize> {
        if !entry.fd_stat.writable() {
            return Err(Errno::EBADF);
        }
        entry.node.write().write_at(buf, offset)
    }

    /// Reads up to `len` bytes at the cursor and advances it.
    pub fn read(&self, cage: u64, fd: Fd, len: usize) -> FileSystemResult<Vec<u8>> {
        debug!("read on cage {}, fd {}, len {}", cage, fd, len);
        self.with_entry(cage, fd, |entry| {
            let data = Self::pread_entry(entry, len, entry.offset)?;
            entry.offset += data.len() as u64;
            Ok(data)
        })
    }

    /// Writes `buf` at the cursor, or at the end of the file when the
    /// descriptor is in append mode, and advances the cursor past it.
    pub fn write(&self, cage: u64, fd: Fd, buf: &[u8]) -> FileSystemResult<usize> {
        debug!("write on cage {}, fd {}, {} bytes", cage, fd, buf.len());
        self.with_entry(cage, fd, |entry| {
            if !entry.fd_stat.writable() {
                return Err(Errno::EBADF);
            }
            if buf.is_empty() {
                return Ok(0);
            }
            let mut node = entry.node.write();
            let offset = if entry.fd_stat.flags.contains(OFlag::O_APPEND) {
                node.file_stat.file_size
            } else {
                entry.offset
            };
            let written = node.write_at(buf, offset)?;
            entry.offset = offset + written as u64;
            Ok(written)
        })
    }

    /// Moves the cursor.  Seeking past the end is allowed; a later write
    /// there leaves a zero-filled hole.
    pub fn lseek(&self, cage: u64, fd: Fd, offset: i64, whence: Whence) -> FileSystemResult<u64> {
        debug!(
            "lseek on cage {}, fd {}, offset {} and whence {:?}",
            cage, fd, offset, whence
        );
        self.with_entry(cage, fd, |entry| {
            let base = match whence {
                Whence::Start => 0,
                Whence::Current => entry.offset,
                Whence::End => entry.node.read().file_stat.file_size,
            };
            let new_offset = base as i128 + offset as i128;
            if new_offset < 0 || new_offset > i64::MAX as i128 {
                return Err(Errno::EINVAL);
            }
            entry.offset = new_offset as u64;
            Ok(entry.offset)
        })
    }

    /// Returns the current offset associated with the file descriptor.
    pub fn tell(&self, cage: u64, fd: Fd) -> FileSystemResult<u64> {
        self.with_entry(cage, fd, |entry| Ok(entry.offset))
    }

    /// Implements `fcntl`.  Duplicates get the lowest free descriptor not
    /// below `arg` and their own cursor, starting where the original's is.
    pub fn fcntl(&self, cage: u64, fd: Fd, command: FcntlCommand, arg: u64) -> FileSystemResult<i64> {
        debug!(
            "fcntl on cage {}, fd {}, command {:?}, arg {}",
            cage, fd, command, arg
        );
        let table = self.table(cage)?;
        let mut table = table.lock();
        match command {
            FcntlCommand::GetFl => Ok(table.get(fd)?.fd_stat.flags.bits() as i64),
            FcntlCommand::SetFl => {
                let settable = OFlag::O_APPEND | OFlag::O_NONBLOCK;
                let requested = OFlag::from_bits_truncate(arg as i32) & settable;
                let entry = table.get_mut(fd)?;
                entry.fd_stat.flags = (entry.fd_stat.flags - settable) | requested;
                Ok(0)
            }
            FcntlCommand::GetFd => Ok(table.get(fd)?.fd_stat.fd_flags.bits() as i64),
            FcntlCommand::SetFd => {
                let entry = table.get_mut(fd)?;
                entry.fd_stat.fd_flags = FdFlag::from_bits_truncate(arg as i32) & FdFlag::FD_CLOEXEC;
                Ok(0)
            }
            FcntlCommand::DupFd | FcntlCommand::DupFdCloexec => {
                let mut copy = table.get(fd)?.clone();
                copy.fd_stat.fd_flags = if command == FcntlCommand::DupFdCloexec {
                    FdFlag::FD_CLOEXEC
                } else {
                    FdFlag::empty()
                };
                let min = i32::try_from(arg).map_err(|_| Errno::EINVAL)?;
                let new_fd = table.lowest_free(min)?;
                table.entries.insert(new_fd, copy);
                Ok(new_fd.0 as i64)
            }
        }
    }

    /// Removes the name `path`.  Under the POSIX policy open descriptors keep
    /// reading and writing the data until they are closed.
    pub fn unlink(&self, path: &str) -> FileSystemResult<()> {
        debug!("unlink on path {:?}", path);
        let path = normalise_path(path)?;
        let mut path_table = self.path_table.write();
        let mut inode_table = self.inode_table.write();
        let inode = *path_table.get(&path).ok_or(Errno::ENOENT)?;
        let node = inode_table.get(&inode).cloned().ok_or(Errno::ENOENT)?;
        // One count for the inode table, one for `node`.
        let open = Arc::strong_count(&node) > 2;
        if open && self.policy == UnlinkPolicy::FailIfOpen {
            return Err(Errno::EBUSY);
        }
        path_table.remove(&path);
        inode_table.remove(&inode);
        node.write().file_stat.num_links = 0;
        info!("Unlinked {}{}.", path, if open { " (still open)" } else { "" });
        Ok(())
    }

    /// Status of the file open as `fd`.
    pub fn fd_filestat_get(&self, cage: u64, fd: Fd) -> FileSystemResult<FileStat> {
        self.with_entry(cage, fd, |entry| Ok(entry.node.read().file_stat))
    }

    /// Status of the descriptor `fd`.
    pub fn fd_fdstat_get(&self, cage: u64, fd: Fd) -> FileSystemResult<FdStat> {
        self.with_entry(cage, fd, |entry| Ok(entry.fd_stat))
    }

    /// Status of the file named `path`.
    pub fn path_filestat_get(&self, path: &str) -> FileSystemResult<FileStat> {
        let node = self.lookup(&normalise_path(path)?)?;
        let stat = node.read().file_stat;
        Ok(stat)
    }
}

impl Default for FileSystem {
    fn default() -> Self {
        Self::new(UnlinkPolicy::default())
    }
}
