//! Edge-triggered epoll reactor
//!
//! One instance, owned by the scheduler. Registration (`add_event` /
//! `del_event`) may be called from any worker; `process_events` runs on
//! the controlling thread only. Each fd's entry is a spinlock so that a
//! readiness edge delivered while a worker is mid-registration waits for
//! the waiter push instead of missing it.
//!
//! An eventfd is registered at init so the controlling thread can be
//! kicked out of `epoll_wait` from outside (shutdown, stop-waiting-now).

use crate::fiber::current_fiber;
use crate::wait_queue::WaitQueue;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use strand_core::{FiberError, FiberResult, SpinLock};

/// Highest fd the reactor will track.
pub const MAX_FD: usize = 65536;

const MAX_EVENTS: usize = 1024;

/// The two sides a fiber can wait on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEvent {
    Read,
    Write,
}

impl IoEvent {
    #[inline]
    pub(crate) fn mask(self) -> u32 {
        match self {
            IoEvent::Read => libc::EPOLLIN as u32,
            IoEvent::Write => libc::EPOLLOUT as u32,
        }
    }
}

/// Per-fd reactor state, created lazily on first registration and
/// dropped when the registered mask returns to zero.
struct FdContext {
    read_waiters: WaitQueue,
    write_waiters: WaitQueue,
    /// Currently registered epoll mask (EPOLLIN/EPOLLOUT bits)
    events: AtomicU32,
}

impl FdContext {
    fn new() -> FdContext {
        FdContext {
            read_waiters: WaitQueue::new(),
            write_waiters: WaitQueue::new(),
            events: AtomicU32::new(0),
        }
    }

    fn waiters(&self, event: IoEvent) -> &WaitQueue {
        match event {
            IoEvent::Read => &self.read_waiters,
            IoEvent::Write => &self.write_waiters,
        }
    }
}

pub struct IoManager {
    epoll_fd: RawFd,
    wake_fd: RawFd,
    table: Box<[SpinLock<Option<Arc<FdContext>>>]>,
    running: AtomicBool,
}

impl IoManager {
    pub fn new() -> FiberResult<IoManager> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(FiberError::ReactorInit(super::errno()));
        }

        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_fd < 0 {
            let err = super::errno();
            unsafe { libc::close(epoll_fd) };
            return Err(FiberError::ReactorInit(err));
        }

        let mut event = libc::epoll_event {
            events: (libc::EPOLLIN as u32) | (libc::EPOLLET as u32),
            u64: wake_fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, wake_fd, &mut event) };
        if ret < 0 {
            let err = super::errno();
            unsafe {
                libc::close(wake_fd);
                libc::close(epoll_fd);
            }
            return Err(FiberError::ReactorInit(err));
        }

        let table = (0..MAX_FD)
            .map(|_| SpinLock::new(None))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        log::debug!("reactor initialized (epoll fd {})", epoll_fd);
        Ok(IoManager {
            epoll_fd,
            wake_fd,
            table,
            running: AtomicBool::new(true),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Register interest in `event` on `fd` and enqueue the current
    /// fiber on the matching waiter queue. The caller must block-yield
    /// afterwards.
    ///
    /// Returns false when the reactor is down, the fd is out of range,
    /// there is no current fiber, or the kernel rejects the
    /// registration.
    pub fn add_event(&self, fd: RawFd, event: IoEvent) -> bool {
        if !self.is_running() {
            return false;
        }
        let Some(slot) = self.slot(fd) else {
            log::error!("add_event: fd {} out of range", fd);
            return false;
        };
        let Some(current) = current_fiber() else {
            log::error!("add_event: no current fiber");
            return false;
        };

        // Hold the entry lock across both the epoll_ctl and the waiter
        // push: a readiness edge for this fd delivered in between will
        // block on this lock in process_events, so it cannot pop an
        // empty queue and lose the wake.
        let mut entry = slot.lock();
        let ctx = entry
            .get_or_insert_with(|| Arc::new(FdContext::new()))
            .clone();

        let old = ctx.events.load(Ordering::Relaxed);
        let new = old | event.mask();
        let op = if old == 0 {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ep_event = libc::epoll_event {
            events: new | (libc::EPOLLET as u32),
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ep_event) };
        if ret < 0 {
            log::error!(
                "add_event: epoll_ctl failed: fd={} op={} errno={}",
                fd,
                op,
                super::errno()
            );
            if old == 0 {
                *entry = None;
            }
            return false;
        }
        ctx.events.store(new, Ordering::Relaxed);

        ctx.waiters(event).push(current);
        true
    }

    /// Drop interest in `event` on `fd`. The fd context is released when
    /// its mask reaches zero.
    pub fn del_event(&self, fd: RawFd, event: IoEvent) -> bool {
        if !self.is_running() {
            return false;
        }
        let Some(slot) = self.slot(fd) else {
            return false;
        };

        let mut entry = slot.lock();
        let Some(ctx) = entry.as_ref().cloned() else {
            return false;
        };

        let old = ctx.events.load(Ordering::Relaxed);
        let new = old & !event.mask();
        if new == old {
            return true;
        }
        let op = if new != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_DEL
        };
        let mut ep_event = libc::epoll_event {
            events: new | (libc::EPOLLET as u32),
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ep_event) };
        if ret < 0 {
            // The fd may already be closed; registration went with it
            log::debug!(
                "del_event: epoll_ctl failed: fd={} op={} errno={}",
                fd,
                op,
                super::errno()
            );
        }
        ctx.events.store(new, Ordering::Relaxed);
        if new == 0 {
            *entry = None;
        }
        true
    }

    /// Wake all waiters on one side of `fd` and drop that registration.
    /// Used by timeout callbacks and by close/shutdown.
    ///
    /// Wake before deregistering: deregistration may release the fd
    /// context the waiters live in.
    pub fn wake(&self, fd: RawFd, event: IoEvent) {
        self.trigger(fd, event);
        self.del_event(fd, event);
    }

    /// Wake both sides of `fd` and drop all registrations.
    pub fn wake_all_fd(&self, fd: RawFd) {
        self.trigger(fd, IoEvent::Read);
        self.trigger(fd, IoEvent::Write);
        self.del_event(fd, IoEvent::Read);
        self.del_event(fd, IoEvent::Write);
    }

    fn trigger(&self, fd: RawFd, event: IoEvent) {
        let Some(ctx) = self.lookup(fd) else {
            return;
        };
        ctx.waiters(event).wake_all();
    }

    /// Interrupt a blocked `process_events` from another thread.
    pub fn notify(&self) {
        let value: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.wake_fd,
                &value as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        // EAGAIN means the counter is saturated; a wakeup is already
        // pending
        if ret < 0 && super::errno() != libc::EAGAIN {
            log::error!("reactor notify failed: errno={}", super::errno());
        }
    }

    /// One reactor poll. Controlling thread only.
    pub fn process_events(&self, timeout_ms: i32) {
        if !self.is_running() {
            return;
        }

        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                events.as_mut_ptr(),
                MAX_EVENTS as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            if super::errno() != libc::EINTR {
                log::error!("epoll_wait failed: errno={}", super::errno());
            }
            return;
        }

        for event in events.iter().take(n as usize) {
            let fd = event.u64 as RawFd;
            let revents = event.events;

            if fd == self.wake_fd {
                self.drain_wake_fd();
                continue;
            }

            let Some(ctx) = self.lookup(fd) else {
                // Stale edge for a registration that was already torn
                // down (timeout or close won the race)
                log::debug!("readiness for fd {} with no context", fd);
                continue;
            };

            let read_mask =
                (libc::EPOLLIN as u32) | (libc::EPOLLHUP as u32) | (libc::EPOLLERR as u32);
            let write_mask =
                (libc::EPOLLOUT as u32) | (libc::EPOLLHUP as u32) | (libc::EPOLLERR as u32);

            if revents & read_mask != 0 {
                ctx.read_waiters.wake_all();
            }
            if revents & write_mask != 0 {
                ctx.write_waiters.wake_all();
            }
        }
    }

    /// Tear the reactor down: refuse new registrations, wake every
    /// parked fiber on every fd, release the kernel objects.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        let mut woken = 0;
        for slot in self.table.iter() {
            let ctx = slot.lock().take();
            if let Some(ctx) = ctx {
                woken += ctx.read_waiters.wake_all();
                woken += ctx.write_waiters.wake_all();
            }
        }
        if woken > 0 {
            log::debug!("reactor shutdown woke {} waiters", woken);
        }

        unsafe {
            libc::close(self.wake_fd);
            libc::close(self.epoll_fd);
        }
        log::debug!("reactor shut down");
    }

    #[inline]
    fn slot(&self, fd: RawFd) -> Option<&SpinLock<Option<Arc<FdContext>>>> {
        if fd < 0 || fd as usize >= MAX_FD {
            return None;
        }
        Some(&self.table[fd as usize])
    }

    fn lookup(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        self.slot(fd)?.lock().clone()
    }

    fn drain_wake_fd(&self) {
        let mut value: u64 = 0;
        loop {
            let ret = unsafe {
                libc::read(
                    self.wake_fd,
                    &mut value as *mut u64 as *mut libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
            if ret <= 0 {
                return;
            }
        }
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reactor_creates_and_drops() {
        let io = IoManager::new().unwrap();
        assert!(io.is_running());
        io.shutdown();
        assert!(!io.is_running());
        // Second shutdown is a no-op (Drop also calls it)
        io.shutdown();
    }

    #[test]
    fn test_event_masks() {
        assert_eq!(IoEvent::Read.mask(), libc::EPOLLIN as u32);
        assert_eq!(IoEvent::Write.mask(), libc::EPOLLOUT as u32);
    }

    #[test]
    fn test_add_event_requires_fiber() {
        let io = IoManager::new().unwrap();
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        // Plain thread context: refused
        assert!(!io.add_event(fds[0], IoEvent::Read));

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_out_of_range_fd() {
        let io = IoManager::new().unwrap();
        assert!(!io.add_event(-1, IoEvent::Read));
        assert!(!io.add_event(MAX_FD as RawFd, IoEvent::Read));
        assert!(!io.del_event(-1, IoEvent::Read));
    }

    #[test]
    fn test_notify_is_safe_repeatedly() {
        let io = IoManager::new().unwrap();
        for _ in 0..100 {
            io.notify();
        }
        // Coalesced into (at most) one pending wakeup; draining happens
        // in process_events
        io.process_events(0);
    }
}
