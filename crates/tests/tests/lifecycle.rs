//! Fork, exec and exit of a cage served by the filesystem grate
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

use cage_runtime::{CageId, Environment, GuestAddr, Options, SyscallArgs, SyscallNumber};
use common::{create_flags, failure, Harness};
use imfs::UnlinkPolicy;
use nix::{errno::Errno, fcntl::OFlag};

/// Lays out a null-terminated pointer array of strings in `cage`.
fn put_vector(h: &Harness, cage: CageId, strings: &[&str]) -> u64 {
    let mut pointers = Vec::new();
    for s in strings {
        pointers.extend_from_slice(&(h.put_str(cage, s) as u32).to_le_bytes());
    }
    pointers.extend_from_slice(&0u32.to_le_bytes());
    h.put(cage, &pointers)
}

#[test]
fn programs_start_with_the_configured_environment() {
    let options = Options {
        environment: Environment {
            environment_variables: vec![("LANG".to_string(), "C".to_string())],
            program_arguments: vec!["prog".to_string(), "--quiet".to_string()],
        },
        ..Options::default()
    };
    let h = Harness::with(options, UnlinkPolicy::default());
    assert_eq!(h.runtime.args(h.program).unwrap(), vec!["prog", "--quiet"]);
    assert_eq!(h.runtime.environ(h.program).unwrap(), vec!["LANG=C"]);

    let child = h.fork(h.program);
    assert_eq!(h.runtime.args(child).unwrap(), vec!["prog", "--quiet"]);
}

#[test]
fn forked_children_classify_through_their_own_memory() {
    let h = Harness::new();
    let number = h.put_str(h.program, "  +0x7f");
    let child = h.fork(h.program);

    let parent_cage = h.runtime.cage(h.program).unwrap();
    let child_cage = h.runtime.cage(child).unwrap();
    let parent_table = parent_cage.process().thread.ctype_table();
    let child_table = child_cage.process().thread.ctype_table();
    assert_ne!(parent_table, child_table);
    assert_eq!(
        h.runtime.to_guest(child, child_table).unwrap(),
        h.runtime.to_guest(h.program, parent_table).unwrap()
    );

    assert!(child_cage.classify(b'x' as i32).unwrap().is_xdigit());
    assert!(child_cage.classify(b'\t' as i32).unwrap().is_space());
    let parsed = child_cage.strtol(GuestAddr(number as u32), 16).unwrap();
    assert_eq!(parsed.value, 0x7f);
    assert_eq!(parsed.consumed, 7);

    // The child outlives changes to its parent.
    assert_eq!(h.call(h.program, SyscallNumber::EXIT, &[0]), 0);
    assert!(child_cage.classify(b'A' as i32).unwrap().is_upper());
    assert_eq!(h.call(child, SyscallNumber::GETPID, &[]), child.0 as i64);
}

#[test]
fn exec_replaces_the_image_and_closes_close_on_exec_files() {
    let h = Harness::new();
    let kept = h.open(h.program, "/kept", create_flags());
    h.write(h.program, kept, b"survives");
    let cloexec = (OFlag::O_CREAT | OFlag::O_RDWR | OFlag::O_CLOEXEC).bits() as u64;
    let closed = h.open(h.program, "/closed", cloexec);

    let path = h.put_str(h.program, "/bin/next");
    let argv = put_vector(&h, h.program, &["next", "--stage", "2"]);
    let envp = put_vector(&h, h.program, &["HOME=/tmp", "EMPTY="]);
    assert_eq!(
        h.call(h.program, SyscallNumber::EXECVE, &[path, argv, envp]),
        0
    );

    assert_eq!(
        h.runtime.args(h.program).unwrap(),
        vec!["next", "--stage", "2"]
    );
    assert_eq!(
        h.runtime.environ(h.program).unwrap(),
        vec!["HOME=/tmp", "EMPTY="]
    );
    // The old heap is gone.
    assert_eq!(h.runtime.read_memory(h.program, GuestAddr(path as u32), 4).unwrap(), vec![0; 4]);

    assert_eq!(h.close(h.program, closed), failure(Errno::EBADF));
    assert_eq!(h.lseek(h.program, kept, 0, 0), 0);
    assert_eq!(h.read(h.program, kept, 64), b"survives");
    assert!(h
        .runtime
        .cage(h.program)
        .unwrap()
        .classify(b'z' as i32)
        .unwrap()
        .is_lower());
}

#[test]
fn failed_execs_leave_descriptors_alone() {
    let h = Harness::new();
    let cloexec = (OFlag::O_CREAT | OFlag::O_RDWR | OFlag::O_CLOEXEC).bits() as u64;
    let fd = h.open(h.program, "/pending", cloexec);
    assert_eq!(
        h.call(h.program, SyscallNumber::EXECVE, &[0, 0, 0]),
        failure(Errno::EFAULT)
    );
    assert_eq!(h.fs().descriptors(h.program.0).len(), 1);
    assert_eq!(h.close(h.program, fd), 0);
}

#[test]
fn vectors_may_live_in_another_cage() {
    let h = Harness::new();
    // A grate issues the exec on the program's behalf with its own strings.
    let path = h.put_str(h.grate, "/bin/launched");
    let argv = put_vector(&h, h.grate, &["launched"]);
    let args = SyscallArgs::new(h.grate)
        .with(0, path, h.grate)
        .with(1, argv, h.grate)
        .with(2, 0, h.grate);
    let exec = SyscallNumber::EXECVE.number();
    let result = h.runtime.make_syscall(
        h.grate,
        exec,
        h.program,
        &args,
        cage_runtime::ErrnoMode::Raw,
    );
    assert_eq!(result, 0);
    assert_eq!(h.runtime.args(h.program).unwrap(), vec!["launched"]);
    assert!(h.runtime.environ(h.program).unwrap().is_empty());
}

#[test]
fn exit_releases_the_cage() {
    let h = Harness::new();
    h.open(h.program, "/left-open", create_flags());
    let child = h.fork(h.program);
    assert_eq!(h.fs().descriptors(child.0).len(), 1);

    assert_eq!(h.call(child, SyscallNumber::EXIT, &[7]), 7);
    assert!(h.fs().descriptors(child.0).is_empty());
    assert!(h.runtime.registry().entries_for(child).is_empty());
    assert_eq!(
        h.call(child, SyscallNumber::GETPID, &[]),
        failure(Errno::ESRCH)
    );
    assert!(!h.runtime.cage_ids().contains(&child));

    // The file itself stays for the parent.
    assert_eq!(h.fs().descriptors(h.program.0).len(), 1);
    assert_eq!(h.fs().paths(), vec!["/left-open".to_string()]);
}
