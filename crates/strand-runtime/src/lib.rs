//! # strand-runtime
//!
//! M:N stackful fiber runtime. Application code writes straight-line,
//! blocking-looking logic; the runtime multiplexes many such flows onto a
//! fixed pool of worker threads.
//!
//! The pieces:
//!
//! - Stack contexts with guard pages and hand-written register switching
//! - A lock-free FIFO (from `strand-core`) backing every run and wait
//!   queue, with the invariant that a fiber is owned by exactly one queue
//!   at any instant
//! - Per-worker consumers with sticky fiber affinity
//! - An edge-triggered epoll reactor and a hashed timer wheel, both
//!   driven by the thread that calls [`Scheduler::run`]
//! - A blocking-looking I/O facade with optional timeouts
//! - Fiber-aware synchronization: mutex, condition variable, wait group,
//!   channel

pub mod arch;
pub mod channel;
pub mod config;
pub mod consumer;
pub mod context;
pub mod fiber;
pub mod io;
pub mod scheduler;
pub mod stack;
pub mod sync;
pub mod timer;
pub mod wait_queue;

// Re-exports
pub use channel::{channel, Channel};
pub use config::RuntimeConfig;
pub use fiber::{sleep, yield_now, Fiber, FiberState};
pub use io::net::{FiberListener, FiberStream};
pub use io::IoEvent;
pub use scheduler::{create, go, Scheduler};
pub use sync::{FiberCondition, FiberMutex, FiberMutexGuard, WaitGroup};
pub use wait_queue::WaitQueue;

pub use strand_core::{FiberError, FiberResult, IoError, IoResult, TryRecvError, TrySendError};
