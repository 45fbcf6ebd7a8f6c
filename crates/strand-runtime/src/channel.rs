//! Bounded MPMC channel for fibers
//!
//! A lock-free slot ring carries the values; wait queues park senders on
//! a full ring and receivers on an empty one. Capacity 0 is promoted to
//! a single usable slot, so a "rendezvous" channel buffers one value.
//!
//! Closing wakes every parked fiber. Receivers drain whatever is
//! buffered before observing the close.

use crate::fiber::{block_yield, current_fiber};
use crate::wait_queue::WaitQueue;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;
use strand_core::pad::CacheAligned;
use strand_core::{FiberError, FiberResult, TryRecvError, TrySendError};

struct Slot<T> {
    data: AtomicPtr<T>,
}

pub struct Channel<T> {
    /// Ring size; one slot always stays vacant
    ring: usize,
    buffer: Box<[Slot<T>]>,
    head: CacheAligned<AtomicUsize>,
    tail: CacheAligned<AtomicUsize>,
    closed: AtomicBool,
    send_waiters: WaitQueue,
    recv_waiters: WaitQueue,
}

unsafe impl<T: Send> Send for Channel<T> {}
unsafe impl<T: Send> Sync for Channel<T> {}

/// Create a channel with the given capacity.
pub fn channel<T>(capacity: usize) -> Arc<Channel<T>> {
    Arc::new(Channel::new(capacity))
}

impl<T> Channel<T> {
    pub fn new(capacity: usize) -> Channel<T> {
        let ring = if capacity == 0 { 2 } else { capacity + 1 };
        let buffer = (0..ring)
            .map(|_| Slot {
                data: AtomicPtr::new(std::ptr::null_mut()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Channel {
            ring,
            buffer,
            head: CacheAligned::new(AtomicUsize::new(0)),
            tail: CacheAligned::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
            send_waiters: WaitQueue::new(),
            recv_waiters: WaitQueue::new(),
        }
    }

    #[inline]
    fn next_index(&self, index: usize) -> usize {
        (index + 1) % self.ring
    }

    /// Send, parking while the ring is full.
    ///
    /// Fails with `ChannelClosed` once the channel closes; a value that
    /// was not yet buffered is dropped with the error, as the peer side
    /// no longer exists.
    pub fn send(&self, value: T) -> FiberResult<()> {
        if self.is_closed() {
            return Err(FiberError::ChannelClosed);
        }

        let mut value = value;
        match self.try_push(value) {
            Ok(()) => {
                self.recv_waiters.wake_one();
                return Ok(());
            }
            Err(back) => value = back,
        }

        let current = current_fiber().ok_or(FiberError::NotInFiber)?;
        loop {
            // Two-phase park: publish the waiter, then re-check. A recv
            // that drained the ring (or a close) before our enqueue
            // woke an empty queue.
            self.send_waiters.push(current.clone());
            if !self.is_full() || self.is_closed() {
                self.send_waiters.wake_one();
            }
            block_yield();

            if self.is_closed() {
                return Err(FiberError::ChannelClosed);
            }
            match self.try_push(value) {
                Ok(()) => {
                    self.recv_waiters.wake_one();
                    return Ok(());
                }
                Err(back) => value = back,
            }
        }
    }

    /// Receive, parking while the ring is empty.
    ///
    /// Buffered values are drained even after a close; only an empty,
    /// closed channel reports `ChannelClosed`.
    pub fn recv(&self) -> FiberResult<T> {
        if let Some(value) = self.try_pop() {
            self.send_waiters.wake_one();
            return Ok(value);
        }
        if self.is_closed() && self.is_empty() {
            return Err(FiberError::ChannelClosed);
        }

        let current = current_fiber().ok_or(FiberError::NotInFiber)?;
        loop {
            self.recv_waiters.push(current.clone());
            if !self.is_empty() || self.is_closed() {
                self.recv_waiters.wake_one();
            }
            block_yield();

            if let Some(value) = self.try_pop() {
                self.send_waiters.wake_one();
                return Ok(value);
            }
            if self.is_closed() && self.is_empty() {
                return Err(FiberError::ChannelClosed);
            }
        }
    }

    /// Non-blocking send.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        if self.is_closed() {
            return Err(TrySendError::Closed(value));
        }
        match self.try_push(value) {
            Ok(()) => {
                self.recv_waiters.wake_one();
                Ok(())
            }
            Err(back) => Err(TrySendError::Full(back)),
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        match self.try_pop() {
            Some(value) => {
                self.send_waiters.wake_one();
                Ok(value)
            }
            None => {
                if self.is_closed() {
                    Err(TryRecvError::Closed)
                } else {
                    Err(TryRecvError::Empty)
                }
            }
        }
    }

    /// Close the channel and wake everything parked on it. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.send_waiters.wake_all();
        self.recv_waiters.wake_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of buffered values (approximate under concurrency).
    pub fn len(&self) -> usize {
        let head = self.head.0.load(Ordering::Acquire);
        let tail = self.tail.0.load(Ordering::Acquire);
        if tail >= head {
            tail - head
        } else {
            self.ring - head + tail
        }
    }

    /// Usable capacity.
    pub fn capacity(&self) -> usize {
        self.ring - 1
    }

    pub fn is_empty(&self) -> bool {
        self.head.0.load(Ordering::Acquire) == self.tail.0.load(Ordering::Acquire)
    }

    pub fn is_full(&self) -> bool {
        let head = self.head.0.load(Ordering::Acquire);
        let tail = self.tail.0.load(Ordering::Acquire);
        self.next_index(tail) == head
    }

    fn try_push(&self, value: T) -> Result<(), T> {
        let tail = self.tail.0.load(Ordering::Relaxed);
        let next = self.next_index(tail);
        if next == self.head.0.load(Ordering::Acquire) {
            return Err(value);
        }

        let boxed = Box::into_raw(Box::new(value));
        if self.buffer[tail]
            .data
            .compare_exchange(
                std::ptr::null_mut(),
                boxed,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            self.tail.0.store(next, Ordering::Release);
            Ok(())
        } else {
            // Another sender claimed the slot first
            let value = *unsafe { Box::from_raw(boxed) };
            Err(value)
        }
    }

    fn try_pop(&self) -> Option<T> {
        let head = self.head.0.load(Ordering::Relaxed);
        if head == self.tail.0.load(Ordering::Acquire) {
            return None;
        }

        let data = self.buffer[head]
            .data
            .swap(std::ptr::null_mut(), Ordering::AcqRel);
        if data.is_null() {
            // Another receiver got here first
            return None;
        }
        let value = *unsafe { Box::from_raw(data) };
        self.head.0.store(self.next_index(head), Ordering::Release);
        Some(value)
    }
}

impl<T> Drop for Channel<T> {
    fn drop(&mut self) {
        while self.try_pop().is_some() {}
    }
}

impl<T> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_send_recv() {
        let ch = channel(10);
        ch.try_send(42).unwrap();
        assert_eq!(ch.try_recv().unwrap(), 42);
    }

    #[test]
    fn test_fifo() {
        let ch = channel(10);
        for i in 0..5 {
            ch.try_send(i).unwrap();
        }
        assert_eq!(ch.len(), 5);
        for i in 0..5 {
            assert_eq!(ch.try_recv().unwrap(), i);
        }
    }

    #[test]
    fn test_full() {
        let ch = channel(2);
        ch.try_send(1).unwrap();
        ch.try_send(2).unwrap();
        assert!(ch.is_full());

        let err = ch.try_send(3).unwrap_err();
        assert!(matches!(err, TrySendError::Full(3)));

        ch.try_recv().unwrap();
        ch.try_send(3).unwrap();
    }

    #[test]
    fn test_zero_capacity_buffers_one() {
        let ch = channel(0);
        assert_eq!(ch.capacity(), 1);
        ch.try_send(9).unwrap();
        assert!(matches!(ch.try_send(10), Err(TrySendError::Full(10))));
        assert_eq!(ch.try_recv().unwrap(), 9);
    }

    #[test]
    fn test_empty_recv() {
        let ch = channel::<i32>(4);
        assert_eq!(ch.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn test_close_drains_then_reports() {
        let ch = channel(4);
        ch.try_send(1).unwrap();
        ch.close();

        assert!(ch.is_closed());
        assert!(matches!(ch.try_send(2), Err(TrySendError::Closed(2))));

        // Buffered value still drains
        assert_eq!(ch.try_recv().unwrap(), 1);
        assert_eq!(ch.try_recv(), Err(TryRecvError::Closed));
    }

    #[test]
    fn test_close_is_idempotent() {
        let ch = channel::<i32>(1);
        ch.close();
        ch.close();
        assert!(ch.is_closed());
    }

    #[test]
    fn test_drop_releases_buffered() {
        let probe = Arc::new(7);
        let ch = channel(4);
        ch.try_send(Arc::clone(&probe)).unwrap();
        ch.try_send(Arc::clone(&probe)).unwrap();
        drop(ch);
        assert_eq!(Arc::strong_count(&probe), 1);
    }
}
