//! The in-memory filesystem
//!
//! A flat namespace of regular files kept entirely in memory, shared by every
//! cage that a grate services.  Each cage has its own descriptor table; the
//! files behind the descriptors are shared.
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
extern crate num_derive;

pub mod fs;

pub use fs::{
    FcntlCommand, Fd, FdStat, FileStat, FileSystem, FileSystemResult, Inode, UnlinkPolicy, Whence,
};
