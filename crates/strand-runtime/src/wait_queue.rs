//! Wait queue: the park/wake primitive under every synchronizer
//!
//! A thin wrapper over the lock-free FIFO whose value type is a fiber
//! reference. Parking pushes the current fiber and block-yields; waking
//! pops fibers and submits them to the scheduler for immediate
//! placement.
//!
//! The push happens-before the yield so a concurrent wake cannot miss
//! the waiter. The converse race (a wake popping the fiber before its
//! register save finishes) is closed by the fiber's switch-pending
//! handshake, which `Fiber::resume` waits out.

use crate::fiber::{block_yield, current_fiber, Fiber};
use crate::scheduler::Scheduler;
use std::sync::Arc;
use strand_core::{FiberError, FiberResult, LinkedQueue};

pub struct WaitQueue {
    queue: LinkedQueue<Arc<Fiber>>,
}

impl WaitQueue {
    pub fn new() -> Self {
        WaitQueue {
            queue: LinkedQueue::new(),
        }
    }

    /// Register a fiber without yielding. The caller must block-yield
    /// afterwards; used by paths (like the reactor) that need to finish
    /// other registration work between enqueue and yield.
    pub(crate) fn push(&self, fiber: Arc<Fiber>) {
        fiber.begin_park();
        fiber.mark_enqueued();
        self.queue.push(fiber);
    }

    /// Park the current fiber until a wake pops it.
    pub fn park_current(&self) -> FiberResult<()> {
        let current = current_fiber().ok_or(FiberError::NotInFiber)?;
        self.push(current);
        block_yield();
        Ok(())
    }

    /// Wake one parked fiber. Returns whether anything was woken.
    pub fn wake_one(&self) -> bool {
        match self.queue.pop() {
            Some(fiber) => {
                fiber.mark_dequeued();
                Scheduler::get().schedule_immediate(fiber);
                true
            }
            None => false,
        }
    }

    /// Wake every parked fiber; returns the count.
    pub fn wake_all(&self) -> usize {
        let mut count = 0;
        while let Some(fiber) = self.queue.pop() {
            fiber.mark_dequeued();
            Scheduler::get().schedule_immediate(fiber);
            count += 1;
        }
        count
    }

    /// Approximate; debugging only.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        WaitQueue::new()
    }
}

impl std::fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitQueue").field("len", &self.len()).finish()
    }
}
