//! Per-worker consumer: one OS thread plus one lock-free run queue
//!
//! Consumers own the resume side of the fiber lifecycle. Any thread may
//! push onto a consumer's run queue; only the consumer itself pops.
//! Yielded fibers go back onto the same consumer's queue, which is what
//! makes affinity sticky.

use crate::fiber::{Fiber, FiberState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use strand_core::{FiberError, FiberResult, LinkedQueue, SpinLock};

/// Consecutive empty polls before the consumer briefly sleeps.
const IDLE_SPINS: u32 = 64;
const IDLE_SLEEP: Duration = Duration::from_micros(50);

pub struct Consumer {
    id: usize,
    queue: Arc<LinkedQueue<Arc<Fiber>>>,
    running: Arc<AtomicBool>,
    handle: SpinLock<Option<JoinHandle<()>>>,
}

impl Consumer {
    /// Spawn the worker thread and return its handle object.
    pub fn start(id: usize) -> FiberResult<Consumer> {
        let queue = Arc::new(LinkedQueue::new());
        let running = Arc::new(AtomicBool::new(true));

        let thread_queue = Arc::clone(&queue);
        let thread_running = Arc::clone(&running);
        let handle = std::thread::Builder::new()
            .name(format!("strand-consumer-{}", id))
            .spawn(move || consumer_loop(id, thread_queue, thread_running))
            .map_err(|_| FiberError::SpawnFailed)?;

        Ok(Consumer {
            id,
            queue,
            running,
            handle: SpinLock::new(Some(handle)),
        })
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Hand a fiber to this consumer. Any thread may call this.
    pub fn submit(&self, fiber: Arc<Fiber>) {
        fiber.mark_enqueued();
        self.queue.push(fiber);
    }

    /// Approximate queue depth, used by shortest-queue placement.
    #[inline]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Signal the loop to exit and join the thread.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    /// Resume residual fibers to completion. Called on the controlling
    /// thread after the worker has been joined; no new work can arrive,
    /// so this terminates once every fiber runs out.
    pub fn drain(&self) {
        while let Some(fiber) = self.queue.pop() {
            fiber.mark_dequeued();
            if fiber.state() == FiberState::Done {
                continue;
            }
            if Fiber::resume(&fiber).is_err() {
                continue;
            }
            if fiber.state() == FiberState::Suspended {
                fiber.mark_enqueued();
                self.queue.push(fiber);
            }
            // BLOCKED here means the fiber parked on something that will
            // never wake during shutdown; it is dropped with a warning
            // from Fiber::drop when the last reference goes.
        }
    }
}

fn consumer_loop(id: usize, queue: Arc<LinkedQueue<Arc<Fiber>>>, running: Arc<AtomicBool>) {
    log::debug!("consumer {} started", id);
    let mut idle = 0u32;

    while running.load(Ordering::Acquire) {
        let fiber = match queue.pop() {
            Some(fiber) => fiber,
            None => {
                idle += 1;
                if idle < IDLE_SPINS {
                    std::thread::yield_now();
                } else {
                    std::thread::sleep(IDLE_SLEEP);
                }
                continue;
            }
        };
        idle = 0;
        fiber.mark_dequeued();
        fiber.set_consumer(id);

        if let Err(err) = Fiber::resume(&fiber) {
            log::warn!("consumer {}: could not resume fiber {}: {}", id, fiber.id(), err);
            continue;
        }

        match fiber.state() {
            FiberState::Suspended => {
                // Voluntary yield: stays on this consumer
                fiber.mark_enqueued();
                queue.push(fiber);
            }
            FiberState::Blocked => {
                // A wake path owns re-entry; drop our reference
            }
            FiberState::Done => {
                // Destructor runs when the last reference releases
            }
            other => {
                log::warn!("consumer {}: fiber {} returned in state {:?}", id, fiber.id(), other);
            }
        }
    }

    log::debug!("consumer {} stopped", id);
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("id", &self.id)
            .field("queue_len", &self.queue_len())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}
