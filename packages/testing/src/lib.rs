#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for testing the request relay with real producer and consumer threads.

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// Runs a test with a timeout to prevent infinite hangs.
///
/// Relay tests park producer threads on a condition variable; a bug in the wake-up protocol
/// shows up as a test that never finishes. This wraps the test closure so that such a test
/// fails instead of stalling the whole run.
///
/// The timeout is 10 seconds under normal conditions and 60 seconds under Miri, where thread
/// synchronization primitives are significantly slower.
///
/// When the `MUTATION_TESTING` environment variable is set to "1", the watchdog is disabled and
/// the test function is executed directly. This allows mutation testing to properly detect
/// hanging mutations.
///
/// # Panics
///
/// Panics if the test exceeds the timeout (when not in mutation testing mode) and propagates
/// any panic raised by the test itself.
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// let answer = with_watchdog(|| 6 * 7);
/// assert_eq!(answer, 42);
/// ```
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if std::env::var("MUTATION_TESTING").as_deref() == Ok("1") {
        return test_fn();
    }

    let (tx, rx) = mpsc::channel();

    let test_handle = thread::spawn(move || {
        let result = test_fn();
        // If this fails, the receiver has already timed out.
        drop(tx.send(result));
    });

    let timeout = if cfg!(miri) {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(10)
    };

    match rx.recv_timeout(timeout) {
        Ok(result) => {
            test_handle.join().expect("Test thread should not panic");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!(
                "Test exceeded {timeout:?} timeout - a blocked thread was probably never released"
            );
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => match test_handle.join() {
            Ok(()) => panic!("Test thread disconnected unexpectedly"),
            Err(e) => std::panic::resume_unwind(e),
        },
    }
}

/// Polls `condition` until it returns `true`.
///
/// Used to wait until another thread has reached a known point (e.g. its request has been
/// queued) before the test continues in a different role.
///
/// # Panics
///
/// Panics if the condition is not met within 5 seconds.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use std::thread;
///
/// use testing::wait_for;
///
/// let flag = Arc::new(AtomicBool::new(false));
///
/// thread::spawn({
///     let flag = Arc::clone(&flag);
///     move || flag.store(true, Ordering::Release)
/// });
///
/// wait_for(|| flag.load(Ordering::Acquire));
/// ```
pub fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now()
        .checked_add(Duration::from_secs(5))
        .expect("deadline is representable");

    while !condition() {
        assert!(
            Instant::now() < deadline,
            "condition was not met within 5 seconds"
        );
        thread::sleep(Duration::from_millis(1));
    }
}
