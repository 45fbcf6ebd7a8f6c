//! Blocking-looking I/O for fibers
//!
//! Every call sets the fd non-blocking once, attempts the syscall, and
//! on EAGAIN-family errors parks the fiber on the reactor until
//! readiness, a timeout, or cancellation. `timeout_ms < 0` waits
//! forever.
//!
//! A timeout arms a wheel timer; the timer callback and the completion
//! path race on a shared wake-once flag, so the fiber is woken exactly
//! once and the losing path does nothing.
//!
//! Edge-triggered discipline: the reactor only re-notifies on a fresh
//! edge, so the `_et` variants drain the fd to EAGAIN in user space
//! before re-parking.

pub mod manager;
pub mod net;

pub use manager::{IoEvent, IoManager};

use crate::fiber::{block_yield, current_fiber};
use crate::scheduler::Scheduler;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use strand_core::{IoError, IoResult};

/// Last OS error for the calling thread.
pub(crate) fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

fn set_nonblocking(fd: RawFd) -> bool {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return false;
    }
    if flags & libc::O_NONBLOCK != 0 {
        return true;
    }
    unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) >= 0 }
}

#[inline]
fn would_block(err: i32) -> bool {
    err == libc::EAGAIN
        || err == libc::EWOULDBLOCK
        || err == libc::EINPROGRESS
        || err == libc::EALREADY
}

/// The attempt/park/retry loop shared by every facade call.
fn do_io<F>(fd: RawFd, event: IoEvent, timeout_ms: i64, mut op: F) -> IoResult<isize>
where
    F: FnMut() -> isize,
{
    if current_fiber().is_none() {
        log::error!("I/O facade called outside fiber context (fd {})", fd);
        return Err(IoError::NotInFiber);
    }

    let scheduler = Scheduler::get();
    let io = scheduler.io();
    let wheel = scheduler.timer();

    let timed_out = Arc::new(AtomicBool::new(false));
    let woken = Arc::new(AtomicBool::new(false));

    let timer = if timeout_ms >= 0 {
        let timed_out = Arc::clone(&timed_out);
        let woken = Arc::clone(&woken);
        wheel.add_timer(
            timeout_ms as u64,
            move || {
                timed_out.store(true, Ordering::Release);
                // Wake-once: only the race winner touches the fd
                if !woken.swap(true, Ordering::AcqRel) {
                    Scheduler::get().io().wake(fd, event);
                }
            },
            false,
        )
    } else {
        None
    };

    // Cancel the timer if the I/O side wins the race.
    let disarm = |result: IoResult<isize>| -> IoResult<isize> {
        if let Some(node) = &timer {
            if !woken.swap(true, Ordering::AcqRel) {
                wheel.cancel(node);
            }
        }
        result
    };

    loop {
        let result = op();
        if result >= 0 {
            return disarm(Ok(result));
        }
        let err = errno();
        if !would_block(err) {
            return disarm(Err(IoError::Os(err)));
        }

        if timed_out.load(Ordering::Acquire) {
            return Err(IoError::TimedOut);
        }

        if !io.add_event(fd, event) {
            // Reactor refused: shutting down or the fd is gone
            return disarm(Err(IoError::Cancelled));
        }

        block_yield();

        io.del_event(fd, event);

        if timed_out.load(Ordering::Acquire) {
            return Err(IoError::TimedOut);
        }
    }
}

pub fn read(fd: RawFd, buf: &mut [u8], timeout_ms: i64) -> IoResult<usize> {
    set_nonblocking(fd);
    do_io(fd, IoEvent::Read, timeout_ms, || unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) as isize
    })
    .map(|n| n as usize)
}

pub fn write(fd: RawFd, buf: &[u8], timeout_ms: i64) -> IoResult<usize> {
    set_nonblocking(fd);
    do_io(fd, IoEvent::Write, timeout_ms, || unsafe {
        libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) as isize
    })
    .map(|n| n as usize)
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: i32, timeout_ms: i64) -> IoResult<usize> {
    set_nonblocking(fd);
    do_io(fd, IoEvent::Read, timeout_ms, || unsafe {
        libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), flags) as isize
    })
    .map(|n| n as usize)
}

pub fn send(fd: RawFd, buf: &[u8], flags: i32, timeout_ms: i64) -> IoResult<usize> {
    set_nonblocking(fd);
    do_io(fd, IoEvent::Write, timeout_ms, || unsafe {
        libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags) as isize
    })
    .map(|n| n as usize)
}

/// Gathered write. `IoSlice` is ABI-compatible with `iovec`.
pub fn writev(fd: RawFd, bufs: &[std::io::IoSlice<'_>], timeout_ms: i64) -> IoResult<usize> {
    set_nonblocking(fd);
    do_io(fd, IoEvent::Write, timeout_ms, || unsafe {
        libc::writev(
            fd,
            bufs.as_ptr() as *const libc::iovec,
            bufs.len() as libc::c_int,
        ) as isize
    })
    .map(|n| n as usize)
}

/// Kernel-side file-to-socket copy. `offset`, when provided, is updated
/// by the kernel as the copy advances.
pub fn sendfile(
    out_fd: RawFd,
    in_fd: RawFd,
    offset: Option<&mut i64>,
    count: usize,
    timeout_ms: i64,
) -> IoResult<usize> {
    set_nonblocking(out_fd);
    let offset_ptr = offset.map_or(std::ptr::null_mut(), |o| o as *mut i64);
    do_io(out_fd, IoEvent::Write, timeout_ms, || unsafe {
        libc::sendfile(out_fd, in_fd, offset_ptr, count) as isize
    })
    .map(|n| n as usize)
}

/// Accept one connection. The returned fd is already non-blocking.
pub fn accept(fd: RawFd, timeout_ms: i64) -> IoResult<RawFd> {
    set_nonblocking(fd);
    let client = do_io(fd, IoEvent::Read, timeout_ms, || unsafe {
        libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) as isize
    })?;
    let client = client as RawFd;
    set_nonblocking(client);
    Ok(client)
}

/// Connect `fd` to `addr`.
///
/// After the in-progress wait completes, `SO_ERROR` decides whether the
/// connection actually established.
///
/// # Safety
///
/// `addr` must point to a valid socket address of `len` bytes.
pub unsafe fn connect(
    fd: RawFd,
    addr: *const libc::sockaddr,
    len: libc::socklen_t,
    timeout_ms: i64,
) -> IoResult<()> {
    set_nonblocking(fd);

    let ret = libc::connect(fd, addr, len);
    if ret == 0 {
        return Ok(());
    }
    let err = errno();
    if err != libc::EINPROGRESS {
        return Err(IoError::Os(err));
    }

    // Wait for WRITE readiness; re-probing with connect reports EALREADY
    // until the handshake resolves and EISCONN afterwards.
    do_io(fd, IoEvent::Write, timeout_ms, || {
        let ret = libc::connect(fd, addr, len);
        if ret == 0 || errno() == libc::EISCONN {
            return 0;
        }
        ret as isize
    })?;

    let mut so_error: libc::c_int = 0;
    let mut so_len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = libc::getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut so_error as *mut _ as *mut libc::c_void,
        &mut so_len,
    );
    if ret < 0 {
        return Err(IoError::Os(errno()));
    }
    if so_error != 0 {
        return Err(IoError::Os(so_error));
    }
    Ok(())
}

/// Close `fd`, waking every fiber parked on it first so nobody sleeps on
/// a dead descriptor. A second close is a no-op on the runtime side; the
/// kernel reports EBADF.
pub fn close(fd: RawFd) -> IoResult<()> {
    if let Some(scheduler) = Scheduler::try_get() {
        scheduler.io().wake_all_fd(fd);
    }
    let ret = unsafe { libc::close(fd) };
    if ret < 0 {
        return Err(IoError::Os(errno()));
    }
    Ok(())
}

/// Which sides `shutdown` tears down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownHow {
    Read,
    Write,
    Both,
}

/// Shut down one or both directions of a socket, waking the matching
/// waiters first.
pub fn shutdown(fd: RawFd, how: ShutdownHow) -> IoResult<()> {
    if let Some(scheduler) = Scheduler::try_get() {
        let io = scheduler.io();
        match how {
            ShutdownHow::Read => io.wake(fd, IoEvent::Read),
            ShutdownHow::Write => io.wake(fd, IoEvent::Write),
            ShutdownHow::Both => io.wake_all_fd(fd),
        }
    }
    let flag = match how {
        ShutdownHow::Read => libc::SHUT_RD,
        ShutdownHow::Write => libc::SHUT_WR,
        ShutdownHow::Both => libc::SHUT_RDWR,
    };
    let ret = unsafe { libc::shutdown(fd, flag) };
    if ret < 0 {
        return Err(IoError::Os(errno()));
    }
    Ok(())
}

/// Edge-triggered read: wait for the first byte, then drain the fd into
/// `buf` until EAGAIN, EOF, or the buffer fills. Returns the accumulated
/// count; callers own the partial-result semantics.
pub fn read_et(fd: RawFd, buf: &mut [u8], timeout_ms: i64) -> IoResult<usize> {
    let first = read(fd, buf, timeout_ms)?;
    if first == 0 {
        return Ok(0);
    }
    let mut total = first;
    while total < buf.len() {
        let n = unsafe {
            libc::read(
                fd,
                buf[total..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - total,
            )
        };
        if n > 0 {
            total += n as usize;
        } else if n == 0 {
            break; // EOF
        } else {
            let err = errno();
            if err == libc::EAGAIN || err == libc::EWOULDBLOCK {
                break; // drained
            }
            return Err(IoError::Os(err));
        }
    }
    Ok(total)
}

/// Edge-triggered recv; see [`read_et`].
pub fn recv_et(fd: RawFd, buf: &mut [u8], flags: i32, timeout_ms: i64) -> IoResult<usize> {
    let first = recv(fd, buf, flags, timeout_ms)?;
    if first == 0 {
        return Ok(0);
    }
    let mut total = first;
    while total < buf.len() {
        let n = unsafe {
            libc::recv(
                fd,
                buf[total..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - total,
                flags,
            )
        };
        if n > 0 {
            total += n as usize;
        } else if n == 0 {
            break;
        } else {
            let err = errno();
            if err == libc::EAGAIN || err == libc::EWOULDBLOCK {
                break;
            }
            return Err(IoError::Os(err));
        }
    }
    Ok(total)
}

/// Edge-triggered accept: wait for one connection, then drain the accept
/// queue until EAGAIN. Every returned fd is non-blocking.
pub fn accept_et(fd: RawFd, timeout_ms: i64) -> IoResult<Vec<RawFd>> {
    let first = accept(fd, timeout_ms)?;
    let mut accepted = vec![first];
    loop {
        let client = unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) };
        if client >= 0 {
            set_nonblocking(client);
            accepted.push(client);
        } else {
            let err = errno();
            if err == libc::EAGAIN || err == libc::EWOULDBLOCK {
                break;
            }
            return Err(IoError::Os(err));
        }
    }
    Ok(accepted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_nonblocking_idempotent() {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        assert!(set_nonblocking(fds[0]));
        assert!(set_nonblocking(fds[0]));
        let flags = unsafe { libc::fcntl(fds[0], libc::F_GETFL, 0) };
        assert_ne!(flags & libc::O_NONBLOCK, 0);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_would_block_set() {
        assert!(would_block(libc::EAGAIN));
        assert!(would_block(libc::EINPROGRESS));
        assert!(would_block(libc::EALREADY));
        assert!(!would_block(libc::EBADF));
        assert!(!would_block(libc::ECONNRESET));
    }

    #[test]
    fn test_refuses_outside_fiber() {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let mut buf = [0u8; 8];
        assert_eq!(read(fds[0], &mut buf, 0), Err(IoError::NotInFiber));

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
