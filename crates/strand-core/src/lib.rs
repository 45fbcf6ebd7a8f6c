//! # strand-core
//!
//! Platform-agnostic primitives for the strand fiber runtime.
//!
//! This crate contains no OS-specific code. Everything that touches the
//! kernel (stacks, context switching, epoll, timers) lives in
//! `strand-runtime`.
//!
//! ## Modules
//!
//! - `tagged` - 48-bit pointer | 16-bit tag words for ABA-safe CAS
//! - `list` - Michael-Scott lock-free FIFO with pooled nodes
//! - `spinlock` - internal spinlock for very short critical sections
//! - `pad` - cache-line alignment helper
//! - `error` - error types shared across the runtime
//! - `env` - environment variable parsing utilities

pub mod env;
pub mod error;
pub mod list;
pub mod pad;
pub mod spinlock;
pub mod tagged;

// Re-exports for convenience
pub use error::{FiberError, FiberResult, IoError, IoResult, TryRecvError, TrySendError};
pub use list::LinkedQueue;
pub use pad::{CacheAligned, CACHE_LINE_SIZE};
pub use spinlock::SpinLock;
pub use tagged::{AtomicTaggedPtr, TaggedPtr};
