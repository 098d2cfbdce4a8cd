//! Grates stacked on grates
//!
//! Several grates sharing one runtime: a grate in front of the filesystem
//! grate, path rewriting through arguments owned by the grate, interposed
//! registration calls and the teardown of a grate.
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

use cage_runtime::{
    handler_fn, CageId, CopyMode, CopyRequest, ErrnoMode, GuestAddr, HandlerRef, Options,
    RegistrationPolicy, SyscallArgs, SyscallNumber,
};
use common::{create_flags, failure, Harness};
use imfs::UnlinkPolicy;
use nix::{errno::Errno, fcntl::OFlag};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

#[test]
fn a_counting_grate_sits_in_front_of_the_filesystem() {
    let h = Harness::new();
    let counter = h.runtime.spawn_cage(None).unwrap();
    // The counter's own calls reach the filesystem grate.
    h.imfs.serve(&h.runtime, counter).unwrap();

    let writes = Arc::new(AtomicU64::new(0));
    let seen = Arc::clone(&writes);
    let handle = h
        .runtime
        .install_handler(
            counter,
            handler_fn(move |context, cage, args| {
                seen.fetch_add(1, Ordering::SeqCst);
                context.forward(cage, args)
            }),
        )
        .unwrap();
    h.runtime
        .register_handler(h.program, SyscallNumber::WRITE.number(), counter, handle)
        .unwrap();

    let fd = h.open(h.program, "/counted", create_flags());
    assert_eq!(h.write(h.program, fd, b"one"), 3);
    assert_eq!(h.write(h.program, fd, b"two"), 3);
    assert_eq!(writes.load(Ordering::SeqCst), 2);
    // The descriptor is the program's, not the counter's.
    assert!(h.fs().descriptors(counter.0).is_empty());
    assert_eq!(
        h.fs().read_file_by_absolute_path("/counted").unwrap(),
        b"onetwo"
    );
}

#[test]
fn a_grate_can_rewrite_pointer_arguments() {
    let h = Harness::new();
    let rewriter = h.runtime.spawn_cage(None).unwrap();
    h.imfs.serve(&h.runtime, rewriter).unwrap();

    let handle = h
        .runtime
        .install_handler(
            rewriter,
            handler_fn(|context, cage, args| {
                let runtime = context.runtime();
                let grate = context.grate();
                let staging = runtime.allocate(grate, 256).unwrap();
                let copied = context
                    .copy(&CopyRequest {
                        source_cage: args[0].cage,
                        source_addr: args[0].value,
                        dest_cage: grate,
                        dest_addr: staging.0 as u64,
                        length: 256,
                        mode: CopyMode::BoundedString,
                    })
                    .unwrap();
                let mut path = b"/sandbox".to_vec();
                path.extend(runtime.read_memory(grate, staging, copied as u32).unwrap());
                let rewritten = runtime.allocate(grate, path.len() as u32).unwrap();
                runtime.write_memory(grate, rewritten, &path).unwrap();
                // The new path lives in the grate's memory; the call still
                // acts on the original cage.
                context.forward(cage, &args.with(0, rewritten.0 as u64, grate))
            }),
        )
        .unwrap();
    h.runtime
        .register_handler(h.program, SyscallNumber::OPEN.number(), rewriter, handle)
        .unwrap();

    let fd = h.open(h.program, "/notes", create_flags());
    assert_eq!(fd, 3);
    h.write(h.program, fd, b"rewritten");
    assert_eq!(h.fs().paths(), vec!["/sandbox/notes".to_string()]);
    assert_eq!(h.fs().descriptors(h.program.0).len(), 1);
}

#[test]
fn registration_calls_pass_through_an_auditing_grate() {
    let h = Harness::new();
    let auditor = h.runtime.spawn_cage(None).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let audit = Arc::clone(&log);
    let handle = h
        .runtime
        .install_handler(
            auditor,
            handler_fn(move |context, cage, args| {
                audit.lock().unwrap().push((args[0].value, args[1].value));
                context.forward(cage, args)
            }),
        )
        .unwrap();
    let register = SyscallNumber::REGISTER_HANDLER.number();
    h.runtime
        .register_handler(h.program, register, auditor, handle)
        .unwrap();

    // The program hands its getpid to a fresh grate through the syscall.
    let pid_grate = h.runtime.spawn_cage(None).unwrap();
    let pid = h
        .runtime
        .install_handler(pid_grate, handler_fn(|_, _, _| 4242))
        .unwrap();
    let getpid = SyscallNumber::GETPID.number();
    let result = h.call(
        h.program,
        SyscallNumber::REGISTER_HANDLER,
        &[h.program.0, getpid, pid_grate.0, pid.0],
    );
    assert_eq!(result, 0);
    assert_eq!(*log.lock().unwrap(), vec![(h.program.0, getpid)]);
    assert_eq!(h.call(h.program, SyscallNumber::GETPID, &[]), 4242);

    // The null handle takes it back, again through the auditor.
    let result = h.call(
        h.program,
        SyscallNumber::REGISTER_HANDLER,
        &[h.program.0, getpid, pid_grate.0, HandlerRef::NULL.0],
    );
    assert_eq!(result, 0);
    assert_eq!(log.lock().unwrap().len(), 2);
    assert_eq!(
        h.call(h.program, SyscallNumber::GETPID, &[]),
        h.program.0 as i64
    );
}

#[test]
fn foreign_grates_cannot_steal_file_calls() {
    let options = Options {
        registration_policy: RegistrationPolicy::RejectForeign,
        ..Options::default()
    };
    let h = Harness::with(options, UnlinkPolicy::default());
    let intruder = h.runtime.spawn_cage(None).unwrap();
    let handle = h
        .runtime
        .install_handler(intruder, handler_fn(|_, _, _| 0))
        .unwrap();

    let result = h.call(
        h.program,
        SyscallNumber::REGISTER_HANDLER,
        &[h.program.0, SyscallNumber::OPEN.number(), intruder.0, handle.0],
    );
    assert_eq!(result, failure(Errno::EPERM));
    assert_eq!(
        h.runtime
            .lookup_handler(h.program, SyscallNumber::OPEN.number())
            .unwrap()
            .grate,
        h.grate
    );
    assert_eq!(h.open(h.program, "/still-mine", create_flags()), 3);
}

#[test]
fn stale_handles_fail_with_enosys() {
    let h = Harness::new();
    h.runtime
        .register_handler(
            h.program,
            SyscallNumber::GETPID.number(),
            h.grate,
            HandlerRef(99),
        )
        .unwrap();
    assert_eq!(
        h.call(h.program, SyscallNumber::GETPID, &[]),
        failure(Errno::ENOSYS)
    );
}

#[test]
fn translated_failures_land_in_errno() {
    let h = Harness::new();
    let path = h.put_str(h.program, "/absent");
    let args = SyscallArgs::from_values(h.program, &[path, OFlag::O_RDONLY.bits() as u64, 0]);
    let open = SyscallNumber::OPEN.number();

    let result = h
        .runtime
        .make_syscall(h.program, open, h.program, &args, ErrnoMode::Translate);
    assert_eq!(result, -1);
    assert_eq!(h.runtime.errno(h.program).unwrap(), Errno::ENOENT as i32);

    let result = h
        .runtime
        .make_syscall(h.program, open, h.program, &args, ErrnoMode::Raw);
    assert_eq!(result, failure(Errno::ENOENT));
}

#[test]
fn an_exited_grate_leaves_its_cages_to_the_host() {
    let h = Harness::new();
    let fd = h.open(h.program, "/orphan", create_flags());
    assert_eq!(fd, 3);

    assert_eq!(h.call(h.grate, SyscallNumber::EXIT, &[0]), 0);
    assert!(h.runtime.registry().entries_for(h.program).is_empty());
    let buffer = h.put(h.program, &[0u8; 8]);
    assert_eq!(
        h.call(h.program, SyscallNumber::READ, &[fd as u64, buffer, 8]),
        failure(Errno::ENOSYS)
    );
}

#[test]
fn copies_between_cages_are_syscalls() {
    let h = Harness::new();
    let source = h.put_str(h.program, "handed over");
    let dest = h.put(h.grate, &[0xff; 32]);

    let args = SyscallArgs::new(h.grate)
        .with(0, source, h.program)
        .with(1, dest, h.grate)
        .with(2, 32, h.grate)
        .with(3, CopyMode::BoundedString as u64, h.grate);
    let copied = h.call_with(h.grate, SyscallNumber::COPY_DATA_BETWEEN_CAGES, &args);
    assert_eq!(copied, 12);
    assert_eq!(h.get(h.grate, dest, 13), b"handed over\0\xff");

    let bad_mode = args.with(3, 7, h.grate);
    assert_eq!(
        h.call_with(h.grate, SyscallNumber::COPY_DATA_BETWEEN_CAGES, &bad_mode),
        failure(Errno::EINVAL)
    );

    // Nothing is written when the destination runs off the memory.
    let size = h.runtime.options().effective_memory_size();
    let past_the_end = args.with(1, size - 4, h.grate);
    assert_eq!(
        h.call_with(h.grate, SyscallNumber::COPY_DATA_BETWEEN_CAGES, &past_the_end),
        failure(Errno::EFAULT)
    );
    let tail = h
        .runtime
        .read_memory(h.grate, GuestAddr((size - 4) as u32), 4)
        .unwrap();
    assert_eq!(tail, vec![0; 4]);
}

#[test]
fn handler_tables_copy_by_syscall() {
    let h = Harness::new();
    let sibling: CageId = h.runtime.spawn_cage(None).unwrap();
    let copied = h.call(
        h.grate,
        SyscallNumber::COPY_HANDLER_TABLE,
        &[h.program.0, sibling.0],
    );
    assert_eq!(copied as usize, h.imfs.handlers().len());
    assert_eq!(h.open(sibling, "/sibling", create_flags()), 3);
    assert_eq!(h.fs().descriptors(sibling.0).len(), 1);
}
