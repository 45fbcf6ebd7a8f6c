//! Fiber-aware synchronization primitives
//!
//! All of these park the calling fiber instead of blocking the worker
//! thread. They are built from wait queues and atomics only. Calling
//! them from outside fiber context is a contract violation and returns
//! an error.

use crate::fiber::{block_yield, current_fiber};
use crate::scheduler::Scheduler;
use crate::timer::TimerNode;
use crate::wait_queue::WaitQueue;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use strand_core::{FiberError, FiberResult};

/// A mutex that parks contending fibers.
///
/// Unlike `std::sync::Mutex`, a contended `lock` suspends the calling
/// fiber and lets the worker run other fibers. Recursion is not
/// supported; the owner check exists to catch unlock-by-stranger bugs,
/// which the guard API makes hard to write in the first place.
pub struct FiberMutex<T> {
    locked: AtomicBool,
    /// Fiber id of the holder; 0 when free
    owner: AtomicU64,
    waiters: WaitQueue,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for FiberMutex<T> {}
unsafe impl<T: Send> Sync for FiberMutex<T> {}

impl<T> FiberMutex<T> {
    pub fn new(value: T) -> Self {
        FiberMutex {
            locked: AtomicBool::new(false),
            owner: AtomicU64::new(0),
            waiters: WaitQueue::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, parking the current fiber while contended.
    pub fn lock(&self) -> FiberResult<FiberMutexGuard<'_, T>> {
        let current = current_fiber().ok_or(FiberError::NotInFiber)?;

        loop {
            if self.try_acquire(current.id()) {
                return Ok(FiberMutexGuard { mutex: self });
            }
            // Two-phase park: publish the waiter, then re-check the
            // flag. An unlock that raced our enqueue found an empty
            // queue, so make sure somebody gets woken for the free lock.
            self.waiters.push(current.clone());
            if !self.locked.load(Ordering::Acquire) {
                self.waiters.wake_one();
            }
            block_yield();
            // Woken: the previous holder released; race for the flag
        }
    }

    /// Acquire without parking.
    pub fn try_lock(&self) -> Option<FiberMutexGuard<'_, T>> {
        let current = current_fiber()?;
        if self.try_acquire(current.id()) {
            Some(FiberMutexGuard { mutex: self })
        } else {
            None
        }
    }

    fn try_acquire(&self, owner_id: u64) -> bool {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner.store(owner_id, Ordering::Release);
            true
        } else {
            false
        }
    }

    fn unlock_internal(&self) {
        self.owner.store(0, Ordering::Release);
        self.locked.store(false, Ordering::Release);
        self.waiters.wake_one();
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    pub fn is_locked_by_current(&self) -> bool {
        match current_fiber() {
            Some(fiber) => {
                self.is_locked() && self.owner.load(Ordering::Acquire) == fiber.id()
            }
            None => false,
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default> Default for FiberMutex<T> {
    fn default() -> Self {
        FiberMutex::new(T::default())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for FiberMutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_locked() {
            f.debug_struct("FiberMutex").field("data", &"<locked>").finish()
        } else {
            // Unlocked snapshot; racy but this is a debug aid
            f.debug_struct("FiberMutex")
                .field("data", unsafe { &*self.data.get() })
                .finish()
        }
    }
}

pub struct FiberMutexGuard<'a, T> {
    mutex: &'a FiberMutex<T>,
}

impl<'a, T> FiberMutexGuard<'a, T> {
    fn mutex(&self) -> &'a FiberMutex<T> {
        self.mutex
    }
}

impl<'a, T> Deref for FiberMutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard holds the lock
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T> DerefMut for FiberMutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard holds the lock
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T> Drop for FiberMutexGuard<'a, T> {
    fn drop(&mut self) {
        self.mutex.unlock_internal();
    }
}

/// Condition variable for fibers.
///
/// `wait` releases the guard, parks, and re-acquires on wake. Waits can
/// wake spuriously (a timed wait racing a notify, for instance); use
/// [`wait_while`](FiberCondition::wait_while) to fold the re-check in.
pub struct FiberCondition {
    waiters: Arc<WaitQueue>,
}

impl FiberCondition {
    pub fn new() -> Self {
        FiberCondition {
            waiters: Arc::new(WaitQueue::new()),
        }
    }

    /// Release `guard`, park until notified, re-acquire.
    pub fn wait<'a, T>(&self, guard: FiberMutexGuard<'a, T>) -> FiberResult<FiberMutexGuard<'a, T>> {
        let current = current_fiber().ok_or(FiberError::NotInFiber)?;
        let mutex = guard.mutex();

        // Enqueue before releasing the lock so a notifier that still
        // holds it cannot slip a notify between release and park.
        self.waiters.push(current);
        drop(guard);
        block_yield();

        mutex.lock()
    }

    /// Wait until `pred` is false, re-checking after every wake.
    pub fn wait_while<'a, T, F>(
        &self,
        mut guard: FiberMutexGuard<'a, T>,
        mut pred: F,
    ) -> FiberResult<FiberMutexGuard<'a, T>>
    where
        F: FnMut(&T) -> bool,
    {
        while pred(&guard) {
            guard = self.wait(guard)?;
        }
        Ok(guard)
    }

    /// Wait with a timeout. The boolean is true when the wake came from
    /// a notify, false when the timer fired first.
    pub fn wait_for<'a, T>(
        &self,
        guard: FiberMutexGuard<'a, T>,
        timeout_ms: u64,
    ) -> FiberResult<(FiberMutexGuard<'a, T>, bool)> {
        let current = current_fiber().ok_or(FiberError::NotInFiber)?;
        let mutex = guard.mutex();

        let timed_out = Arc::new(AtomicBool::new(false));
        // Enqueue before arming the timer: a tick that fires into an
        // empty queue would strand this waiter past its deadline
        self.waiters.push(current);
        let timer = self.arm_timeout(timeout_ms, Arc::clone(&timed_out));

        drop(guard);
        block_yield();

        let guard = mutex.lock()?;
        let notified = !timed_out.load(Ordering::Acquire);
        if notified {
            if let Some(node) = &timer {
                Scheduler::get().timer().cancel(node);
            }
        }
        Ok((guard, notified))
    }

    fn arm_timeout(&self, timeout_ms: u64, timed_out: Arc<AtomicBool>) -> Option<Arc<TimerNode>> {
        let waiters = Arc::clone(&self.waiters);
        Scheduler::get().timer().add_timer(
            timeout_ms,
            move || {
                timed_out.store(true, Ordering::Release);
                waiters.wake_one();
            },
            false,
        )
    }

    pub fn notify_one(&self) -> bool {
        self.waiters.wake_one()
    }

    pub fn notify_all(&self) -> usize {
        self.waiters.wake_all()
    }
}

impl Default for FiberCondition {
    fn default() -> Self {
        FiberCondition::new()
    }
}

/// Waits for a collection of fibers to finish.
///
/// `add` before spawning, `done` when each fiber completes, `wait` to
/// park until the counter returns to zero.
pub struct WaitGroup {
    counter: AtomicI64,
    waiters: WaitQueue,
}

impl WaitGroup {
    pub fn new() -> Self {
        WaitGroup {
            counter: AtomicI64::new(0),
            waiters: WaitQueue::new(),
        }
    }

    /// Adjust the counter. A delta that would push it negative is
    /// rejected and rolled back.
    pub fn add(&self, delta: i64) -> FiberResult<()> {
        let old = self.counter.fetch_add(delta, Ordering::AcqRel);
        let new = old + delta;
        if new < 0 {
            self.counter.fetch_sub(delta, Ordering::AcqRel);
            return Err(FiberError::NegativeCounter);
        }
        if new == 0 {
            self.waiters.wake_all();
        }
        Ok(())
    }

    pub fn done(&self) -> FiberResult<()> {
        self.add(-1)
    }

    /// Park until the counter reaches zero. Returns immediately when it
    /// already is. Re-parks on an early wake.
    pub fn wait(&self) -> FiberResult<()> {
        if self.counter.load(Ordering::Acquire) == 0 {
            return Ok(());
        }
        let current = current_fiber().ok_or(FiberError::NotInFiber)?;
        while self.counter.load(Ordering::Acquire) != 0 {
            // Two-phase park: a done() that hit zero between our check
            // and our enqueue has already woken an empty queue
            self.waiters.push(current.clone());
            if self.counter.load(Ordering::Acquire) == 0 {
                self.waiters.wake_one();
            }
            block_yield();
        }
        Ok(())
    }

    pub fn count(&self) -> i64 {
        self.counter.load(Ordering::Acquire)
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        WaitGroup::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::Fiber;

    /// Run `f` inside a manually resumed fiber on this thread.
    fn in_fiber(f: impl FnOnce() + Send + 'static) {
        let fiber = Fiber::new(Box::new(f), 64 * 1024).unwrap();
        Fiber::resume(&fiber).unwrap();
        assert_eq!(fiber.state(), crate::fiber::FiberState::Done);
    }

    #[test]
    fn test_mutex_requires_fiber() {
        let mutex = FiberMutex::new(0);
        assert_eq!(mutex.lock().err(), Some(FiberError::NotInFiber));
        assert!(mutex.try_lock().is_none());
    }

    #[test]
    fn test_mutex_uncontended() {
        let mutex = Arc::new(FiberMutex::new(0u32));
        let m = Arc::clone(&mutex);
        in_fiber(move || {
            {
                let mut guard = m.lock().unwrap();
                *guard = 41;
                assert!(m.is_locked());
                assert!(m.is_locked_by_current());
            }
            assert!(!m.is_locked());
            assert_eq!(*m.lock().unwrap(), 41);
        });
    }

    #[test]
    fn test_mutex_try_lock_held() {
        let mutex = Arc::new(FiberMutex::new(0u32));
        let m = Arc::clone(&mutex);
        in_fiber(move || {
            let guard = m.try_lock().unwrap();
            assert!(m.try_lock().is_none());
            drop(guard);
            assert!(m.try_lock().is_some());
        });
    }

    #[test]
    fn test_wait_group_counts() {
        let wg = WaitGroup::new();
        wg.add(3).unwrap();
        assert_eq!(wg.count(), 3);
        wg.done().unwrap();
        wg.done().unwrap();
        wg.done().unwrap();
        assert_eq!(wg.count(), 0);
        // Counter at zero: wait returns immediately even off-fiber
        wg.wait().unwrap();
    }

    #[test]
    fn test_wait_group_rejects_negative() {
        let wg = WaitGroup::new();
        assert_eq!(wg.done().err(), Some(FiberError::NegativeCounter));
        assert_eq!(wg.count(), 0);

        wg.add(2).unwrap();
        assert_eq!(wg.add(-3).err(), Some(FiberError::NegativeCounter));
        assert_eq!(wg.count(), 2);
    }

    #[test]
    fn test_mutex_into_inner() {
        let mutex = FiberMutex::new(7);
        assert_eq!(mutex.into_inner(), 7);
    }
}
