//! # strand
//!
//! Write straight-line, blocking-looking code; run many such flows on a
//! fixed pool of worker threads.
//!
//! ```ignore
//! use strand::{fiber_main, go, sleep};
//!
//! fiber_main!({
//!     go(|| {
//!         sleep(100);
//!         println!("hello from a fiber");
//!     })
//!     .unwrap();
//!     sleep(200);
//!     0
//! });
//! ```
//!
//! The facade re-exports the runtime surface: `go`/`create`/`yield_now`/
//! `sleep`, the I/O module, the fiber synchronizers, and channels. The
//! [`fiber_main!`] macro wraps `main`, runs its body inside a fiber, and
//! drives the scheduler's event loop on the main thread until the body
//! returns; the process exits with the body's return code.

pub use strand_runtime::{
    channel, create, go, sleep, yield_now, Channel, Fiber, FiberCondition, FiberError,
    FiberListener, FiberMutex, FiberMutexGuard, FiberResult, FiberState, FiberStream, IoError,
    IoResult, RuntimeConfig, Scheduler, TryRecvError, TrySendError, WaitGroup, WaitQueue,
};

/// The blocking-looking I/O calls (`read`, `write`, `accept`, ...).
pub use strand_runtime::io;

/// Fiber-ize `main`: the body runs in a fiber while the real main thread
/// drives the scheduler. The body must evaluate to an `i32`, which
/// becomes the process exit code.
#[macro_export]
macro_rules! fiber_main {
    ($body:block) => {
        fn main() {
            let exit_code = ::std::sync::Arc::new(::std::sync::atomic::AtomicI32::new(0));
            let fiber_code = ::std::sync::Arc::clone(&exit_code);
            $crate::go(move || {
                let code: i32 = (move || $body)();
                fiber_code.store(code, ::std::sync::atomic::Ordering::Release);
                $crate::Scheduler::get().stop();
            })
            .expect("failed to spawn the main fiber");

            $crate::Scheduler::get().run();
            ::std::process::exit(exit_code.load(::std::sync::atomic::Ordering::Acquire));
        }
    };
}
