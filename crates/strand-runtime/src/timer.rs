//! Hashed timing wheel
//!
//! S slots, one tick interval T. `add_timer` is callable from any thread
//! and stages the node on a multi-producer pending queue; `tick` runs on
//! the controlling thread only (the one driving `Scheduler::run`) and is
//! the sole toucher of the wheel slots. Cancellation is a lazy flag,
//! resolved the next time the wheel visits the node.

use crossbeam_queue::ArrayQueue;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strand_core::SpinLock;

/// Capacity of the staging queue for newly added timers.
const PENDING_CAPACITY: usize = 1024;

/// Max staged additions drained per tick.
const PENDING_BATCH: usize = 100;

/// Tick lateness tolerance.
const TICK_TOLERANCE: Duration = Duration::from_millis(1);

pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// A single timer. Returned from [`TimerWheel::add_timer`] so the caller
/// can cancel or refresh it.
pub struct TimerNode {
    delay_ms: u64,
    /// Remaining full wheel rotations; touched by the tick thread only
    rotations: AtomicUsize,
    callback: TimerCallback,
    repeat: AtomicBool,
    cancelled: AtomicBool,
}

impl TimerNode {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn delay_ms(&self) -> u64 {
        self.delay_ms
    }
}

impl std::fmt::Debug for TimerNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerNode")
            .field("delay_ms", &self.delay_ms)
            .field("repeat", &self.repeat.load(Ordering::Relaxed))
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Wheel state owned by the tick thread. The spinlock documents that
/// ownership; it is never contended in steady state because every locker
/// is the controlling thread.
struct WheelState {
    buckets: Vec<Vec<Arc<TimerNode>>>,
    current_slot: usize,
    last_tick: Instant,
}

pub struct TimerWheel {
    slots: usize,
    tick_ms: u64,
    state: SpinLock<WheelState>,
    pending: ArrayQueue<Arc<TimerNode>>,
    running: AtomicBool,
}

impl TimerWheel {
    pub fn new(slots: usize, tick_ms: u64) -> TimerWheel {
        let mut buckets = Vec::with_capacity(slots);
        for _ in 0..slots {
            buckets.push(Vec::with_capacity(16));
        }
        TimerWheel {
            slots,
            tick_ms,
            state: SpinLock::new(WheelState {
                buckets,
                current_slot: 0,
                last_tick: Instant::now(),
            }),
            pending: ArrayQueue::new(PENDING_CAPACITY),
            running: AtomicBool::new(true),
        }
    }

    pub fn tick_interval_ms(&self) -> u64 {
        self.tick_ms
    }

    /// Register a callback to fire after `ms` milliseconds (at tick
    /// granularity; anything below one tick rounds up to one).
    ///
    /// Returns `None` once the wheel has been stopped.
    pub fn add_timer<F>(&self, ms: u64, callback: F, repeat: bool) -> Option<Arc<TimerNode>>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_node(ms, Arc::new(callback), repeat)
    }

    fn add_node(&self, ms: u64, callback: TimerCallback, repeat: bool) -> Option<Arc<TimerNode>> {
        if !self.running.load(Ordering::Acquire) {
            return None;
        }

        let node = Arc::new(TimerNode {
            delay_ms: ms,
            rotations: AtomicUsize::new(0),
            callback,
            repeat: AtomicBool::new(repeat),
            cancelled: AtomicBool::new(false),
        });

        let mut staged = Arc::clone(&node);
        loop {
            match self.pending.push(staged) {
                Ok(()) => break,
                Err(back) => {
                    // Staging queue full; wait for the next tick to drain
                    if !self.running.load(Ordering::Acquire) {
                        return None;
                    }
                    staged = back;
                    std::thread::yield_now();
                }
            }
        }

        Some(node)
    }

    /// Lazily cancel; the node is dropped on its next wheel visit.
    pub fn cancel(&self, node: &Arc<TimerNode>) {
        node.cancelled.store(true, Ordering::Release);
    }

    /// Cancel `node` and arm a fresh timer with the same parameters.
    pub fn refresh(&self, node: &Arc<TimerNode>) -> Option<Arc<TimerNode>> {
        if node.is_cancelled() {
            return None;
        }
        self.cancel(node);
        self.add_node(
            node.delay_ms,
            Arc::clone(&node.callback),
            node.repeat.load(Ordering::Acquire),
        )
    }

    /// Cancel `node` and run its callback inline.
    pub fn trigger_now(&self, node: &Arc<TimerNode>) {
        self.cancel(node);
        run_callback(&node.callback);
    }

    /// Milliseconds until the next scheduled tick; zero when overdue.
    /// Bounds the reactor's wait.
    pub fn next_timeout_ms(&self) -> u64 {
        let state = self.state.lock();
        let elapsed = state.last_tick.elapsed();
        let interval = Duration::from_millis(self.tick_ms);
        if elapsed >= interval {
            0
        } else {
            (interval - elapsed).as_millis() as u64
        }
    }

    /// Advance the wheel by one slot if a full tick interval has passed.
    /// Controlling thread only.
    pub fn tick(&self) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }

        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now - state.last_tick;
        if elapsed + TICK_TOLERANCE < Duration::from_millis(self.tick_ms) {
            return;
        }

        self.drain_pending(&mut state);

        let current = state.current_slot;
        let mut bucket = std::mem::take(&mut state.buckets[current]);
        let mut keep = Vec::with_capacity(bucket.len());

        for node in bucket.drain(..) {
            if node.is_cancelled() {
                continue;
            }

            let rotations = node.rotations.load(Ordering::Relaxed);
            if rotations > 0 {
                node.rotations.store(rotations - 1, Ordering::Relaxed);
                keep.push(node);
                continue;
            }

            run_callback(&node.callback);

            let should_repeat =
                node.repeat.load(Ordering::Acquire) && !node.is_cancelled();
            if should_repeat {
                let (slot, rotations) = self.placement(current, node.delay_ms);
                node.rotations.store(rotations, Ordering::Relaxed);
                if slot == current {
                    // Re-fires on the next full rotation
                    node.rotations.store(rotations + 1, Ordering::Relaxed);
                    keep.push(node);
                } else {
                    state.buckets[slot].push(node);
                }
            }
        }

        state.buckets[current] = keep;
        state.current_slot = (current + 1) % self.slots;
        state.last_tick = now;
    }

    /// Stop accepting timers. Staged and armed nodes are dropped without
    /// firing.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn drain_pending(&self, state: &mut WheelState) {
        for _ in 0..PENDING_BATCH {
            let node = match self.pending.pop() {
                Some(node) => node,
                None => return,
            };
            if node.is_cancelled() {
                continue;
            }
            let (slot, rotations) = self.placement(state.current_slot, node.delay_ms);
            node.rotations.store(rotations, Ordering::Relaxed);
            state.buckets[slot].push(node);
        }
    }

    /// Target slot and rotation count for a delay measured from
    /// `current_slot`.
    fn placement(&self, current_slot: usize, delay_ms: u64) -> (usize, usize) {
        let mut ticks = (delay_ms / self.tick_ms) as usize;
        if ticks == 0 {
            ticks = 1;
        }
        let slot = (current_slot + ticks) % self.slots;
        let rotations = ticks / self.slots;
        (slot, rotations)
    }
}

fn run_callback(callback: &TimerCallback) {
    if catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
        log::error!("timer callback panicked");
    }
}
