//! File I/O through the grate
//!
//! A program cage issues file syscalls; the IMFS grate services them.
//!
//! ## Authors
//!
//! The Veracruz Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the Veracruz root directory for
//! information on licensing and copyright.

mod common;

use cage_runtime::{Options, SyscallNumber};
use common::{
    create_flags, failure,
    util::{parallel, timeout},
    Harness,
};
use imfs::UnlinkPolicy;
use nix::{errno::Errno, fcntl::OFlag};
use std::{sync::Arc, time::Duration};

const SEEK_SET: u64 = 0;
const SEEK_CUR: u64 = 1;

#[test]
fn chunked_writes_read_back_after_reopen() {
    let h = Harness::new();
    let fd = h.open(h.program, "/testfile.txt", create_flags());
    assert_eq!(fd, 3);
    for chunk in b"ABCDEFGHI".chunks(3) {
        assert_eq!(h.write(h.program, fd, chunk), 3);
    }
    assert_eq!(h.close(h.program, fd), 0);

    let fd = h.open(h.program, "/testfile.txt", OFlag::O_RDONLY.bits() as u64);
    assert_eq!(h.read(h.program, fd, 9), b"ABCDEFGHI");
    assert_eq!(h.read(h.program, fd, 9), b"");
}

#[test]
fn append_ignores_seeks() {
    let h = Harness::new();
    let fd = h.open(h.program, "/append.txt", create_flags());
    h.write(h.program, fd, b"12345");
    h.close(h.program, fd);

    let flags = (OFlag::O_WRONLY | OFlag::O_APPEND).bits() as u64;
    let fd = h.open(h.program, "/append.txt", flags);
    assert_eq!(h.lseek(h.program, fd, 0, SEEK_SET), 0);
    assert_eq!(h.write(h.program, fd, b"67890"), 5);
    h.close(h.program, fd);

    assert_eq!(
        h.fs().read_file_by_absolute_path("/append.txt").unwrap(),
        b"1234567890"
    );
}

#[test]
fn writes_past_the_end_zero_fill() {
    let h = Harness::new();
    let fd = h.open(h.program, "/sparse", create_flags());
    h.write(h.program, fd, b"data");
    // Seeking alone does not extend the file.
    assert_eq!(h.lseek(h.program, fd, 10, SEEK_SET), 10);
    assert_eq!(h.fs().path_filestat_get("/sparse").unwrap().file_size, 4);
    h.write(h.program, fd, b"X");

    assert_eq!(h.lseek(h.program, fd, 0, SEEK_SET), 0);
    assert_eq!(h.read(h.program, fd, 64), b"data\0\0\0\0\0\0X");
}

#[test]
fn writes_at_huge_offsets_report_efbig() {
    let h = Harness::new();
    let fd = h.open(h.program, "/huge", create_flags());
    assert_eq!(h.lseek(h.program, fd, 0xFFFF_FFF0, SEEK_SET), 0xFFFF_FFF0);
    assert_eq!(h.write(h.program, fd, b"X"), failure(Errno::EFBIG));
    assert_eq!(h.fs().path_filestat_get("/huge").unwrap().file_size, 0);
    // The grate is still serving.
    assert_eq!(h.lseek(h.program, fd, 0, SEEK_SET), 0);
    assert_eq!(h.write(h.program, fd, b"ok"), 2);
}

#[test]
fn zero_length_transfers_return_zero() {
    let h = Harness::new();
    let fd = h.open(h.program, "/empty", create_flags());
    // A null buffer is fine when nothing moves.
    assert_eq!(h.call(h.program, SyscallNumber::WRITE, &[fd as u64, 0, 0]), 0);
    assert_eq!(h.call(h.program, SyscallNumber::READ, &[fd as u64, 0, 0]), 0);
    assert_eq!(h.lseek(h.program, fd, 0, SEEK_CUR), 0);
}

#[test]
fn missing_and_existing_paths() {
    let h = Harness::new();
    assert_eq!(
        h.open(h.program, "/nope", OFlag::O_RDONLY.bits() as u64),
        failure(Errno::ENOENT)
    );
    h.open(h.program, "/there", create_flags());
    let exclusive = (OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR).bits() as u64;
    assert_eq!(
        h.open(h.program, "/there", exclusive),
        failure(Errno::EEXIST)
    );
}

#[test]
fn forked_descriptors_seek_independently() {
    let h = Harness::new();
    let fd = h.open(h.program, "/shared", create_flags());
    h.write(h.program, fd, b"abcdefghij");
    h.lseek(h.program, fd, 2, SEEK_SET);

    let child = h.fork(h.program);
    assert_eq!(h.lseek(child, fd, 0, SEEK_CUR), 2);
    assert_eq!(h.lseek(child, fd, 8, SEEK_SET), 8);
    assert_eq!(h.read(h.program, fd, 3), b"cde");
    assert_eq!(h.read(child, fd, 3), b"ij");
    assert_eq!(h.lseek(h.program, fd, 0, SEEK_CUR), 5);

    // Files opened after the fork are private to their cage.
    let private = h.open(child, "/child-only", create_flags());
    assert_eq!(private, 4);
    assert_eq!(h.close(h.program, private), failure(Errno::EBADF));
}

#[test]
fn grandchildren_are_served_too() {
    let h = Harness::new();
    let fd = h.open(h.program, "/lineage", create_flags());
    let child = h.fork(h.program);
    let grandchild = h.fork(child);
    assert_eq!(h.write(grandchild, fd, b"from below"), 10);
    assert_eq!(
        h.fs().read_file_by_absolute_path("/lineage").unwrap(),
        b"from below"
    );
    assert_eq!(h.call(grandchild, SyscallNumber::EXIT, &[0]), 0);
    assert!(h.fs().descriptors(grandchild.0).is_empty());
    assert_eq!(h.fs().descriptors(child.0).len(), 1);
}

#[test]
fn unlinked_files_stay_readable_while_open() {
    let h = Harness::new();
    let fd = h.open(h.program, "/scratch", create_flags());
    h.write(h.program, fd, b"keep me");
    assert_eq!(h.unlink(h.program, "/scratch"), 0);
    assert_eq!(
        h.open(h.program, "/scratch", OFlag::O_RDONLY.bits() as u64),
        failure(Errno::ENOENT)
    );
    h.lseek(h.program, fd, 0, SEEK_SET);
    assert_eq!(h.read(h.program, fd, 64), b"keep me");
    assert_eq!(h.close(h.program, fd), 0);
}

#[test]
fn unlink_can_be_refused_while_open() {
    let h = Harness::with(Options::default(), UnlinkPolicy::FailIfOpen);
    let fd = h.open(h.program, "/pinned", create_flags());
    assert_eq!(h.unlink(h.program, "/pinned"), failure(Errno::EBUSY));
    h.close(h.program, fd);
    assert_eq!(h.unlink(h.program, "/pinned"), 0);
}

#[test]
fn fcntl_switches_to_append() {
    let h = Harness::new();
    let fd = h.open(h.program, "/log", create_flags());
    h.write(h.program, fd, b"one ");
    h.lseek(h.program, fd, 0, SEEK_SET);

    const F_GETFL: u64 = 3;
    const F_SETFL: u64 = 4;
    let append = OFlag::O_APPEND.bits() as u64;
    assert_eq!(h.call(h.program, SyscallNumber::FCNTL, &[fd as u64, F_SETFL, append]), 0);
    let flags = h.call(h.program, SyscallNumber::FCNTL, &[fd as u64, F_GETFL, 0]);
    assert_ne!(flags as u64 & append, 0);
    h.write(h.program, fd, b"two");
    assert_eq!(
        h.fs().read_file_by_absolute_path("/log").unwrap(),
        b"one two"
    );
}

#[test]
fn cages_work_concurrently() {
    let h = Arc::new(Harness::new());
    timeout(Duration::from_secs(60), move || {
        let workers = Arc::clone(&h);
        let cages = parallel(4, move |i| {
            let h = &workers;
            let cage = h.runtime.spawn_cage(None).unwrap();
            h.imfs.serve(&h.runtime, cage).unwrap();
            let path = format!("/worker-{}", i);
            let fd = h.open(cage, &path, create_flags());
            let shared = h.open(
                cage,
                "/shared-log",
                (OFlag::O_CREAT | OFlag::O_WRONLY | OFlag::O_APPEND).bits() as u64,
            );
            for _ in 0..50 {
                assert_eq!(h.write(cage, fd, b"0123456789"), 10);
                assert_eq!(h.write(cage, shared, b"x"), 1);
            }
            h.lseek(cage, fd, 0, SEEK_SET);
            assert_eq!(h.read(cage, fd, 1000).len(), 500);
            cage
        });
        for cage in cages {
            assert_eq!(h.fs().descriptors(cage.0).len(), 2);
        }
        assert_eq!(
            h.fs().path_filestat_get("/shared-log").unwrap().file_size,
            200
        );
    });
}
