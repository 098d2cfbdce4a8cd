//! Test utilities: deadlines and worker threads
//!
//! ## Authors
//!
//! The Veracruz Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the Veracruz root directory for
//! information on licensing and copyright.

use either::{Left, Right};
use std::{
    env::{self, VarError},
    sync::mpsc::channel,
    thread,
    time::Duration,
};

/// Overrides every deadline, in seconds.
const TIMEOUT_VARIABLE: &str = "GRATE_TEST_TIMEOUT";

/// The deadline to use: `default`, unless `GRATE_TEST_TIMEOUT` says
/// otherwise.
fn deadline(default: Duration) -> Duration {
    match env::var(TIMEOUT_VARIABLE)
        .map_err(Left)
        .and_then(|seconds| seconds.parse::<u64>().map_err(Right))
    {
        Ok(seconds) => Duration::from_secs(seconds),
        Err(Left(VarError::NotPresent)) => default,
        Err(err) => panic!("Couldn't parse {}: {:?}", TIMEOUT_VARIABLE, err),
    }
}

/// Runs `f` on its own thread and panics if it has not finished within the
/// deadline.  A grate that deadlocks fails the test instead of hanging it.
pub fn timeout<R: Send + 'static, F: (FnOnce() -> R) + Send + 'static>(
    default: Duration,
    f: F,
) -> R {
    let limit = deadline(default);
    let (done_tx, done_rx) = channel();
    let body = thread::spawn(move || {
        let r = f();
        // The receiver is gone only if the deadline already passed.
        let _ = done_tx.send(());
        r
    });

    match done_rx.recv_timeout(limit) {
        Ok(()) => body.join().expect("test body panicked"),
        Err(_) => panic!(
            "no result after {:?}, set {} to allow longer",
            limit, TIMEOUT_VARIABLE
        ),
    }
}

/// Runs `worker(0)`, ..., `worker(count - 1)` on their own threads and
/// collects the results in order, propagating any panic.
pub fn parallel<R, F>(count: usize, worker: F) -> Vec<R>
where
    R: Send + 'static,
    F: Fn(usize) -> R + Send + Sync + Clone + 'static,
{
    let handles: Vec<_> = (0..count)
        .map(|index| {
            let worker = worker.clone();
            thread::spawn(move || worker(index))
        })
        .collect();
    handles
        .into_iter()
        .map(|handle| handle.join().expect("worker panicked"))
        .collect()
}
