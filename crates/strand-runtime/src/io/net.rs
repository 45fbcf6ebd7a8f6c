//! TCP convenience layer over the I/O facade
//!
//! `FiberListener` and `FiberStream` wrap raw fds with the blocking-
//! looking facade calls, giving fiber code a Go-like shape:
//!
//! ```ignore
//! let listener = FiberListener::bind(8080)?;
//! loop {
//!     let stream = listener.accept(-1)?;
//!     go(move || handle(stream))?;
//! }
//! ```

use super::{accept, close, connect, read, write};
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use strand_core::{IoError, IoResult};

fn set_tcp_nodelay(fd: RawFd) {
    let opt: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &opt as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

fn sockaddr_in(addr: Ipv4Addr, port: u16) -> libc::sockaddr_in {
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = port.to_be();
    sa.sin_addr.s_addr = u32::from(addr).to_be();
    sa
}

/// A listening TCP socket whose `accept` parks the calling fiber.
pub struct FiberListener {
    fd: RawFd,
}

impl FiberListener {
    /// Bind `0.0.0.0:port` and listen. `port` 0 picks an ephemeral port.
    pub fn bind(port: u16) -> IoResult<FiberListener> {
        Self::bind_addr(Ipv4Addr::UNSPECIFIED, port)
    }

    pub fn bind_addr(addr: Ipv4Addr, port: u16) -> IoResult<FiberListener> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            return Err(IoError::Os(super::errno()));
        }

        let opt: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &opt as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }

        let sa = sockaddr_in(addr, port);
        let ret = unsafe {
            libc::bind(
                fd,
                &sa as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            let err = super::errno();
            unsafe { libc::close(fd) };
            return Err(IoError::Os(err));
        }

        if unsafe { libc::listen(fd, 1024) } != 0 {
            let err = super::errno();
            unsafe { libc::close(fd) };
            return Err(IoError::Os(err));
        }

        Ok(FiberListener { fd })
    }

    /// Wrap an fd that is already listening.
    pub fn from_raw(fd: RawFd) -> FiberListener {
        FiberListener { fd }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// The port this listener is bound to.
    pub fn local_port(&self) -> IoResult<u16> {
        let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockname(self.fd, &mut sa as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if ret != 0 {
            return Err(IoError::Os(super::errno()));
        }
        Ok(u16::from_be(sa.sin_port))
    }

    /// Park until a client connects. Returns a stream with TCP_NODELAY
    /// already applied.
    pub fn accept(&self, timeout_ms: i64) -> IoResult<FiberStream> {
        let client = accept(self.fd, timeout_ms)?;
        set_tcp_nodelay(client);
        Ok(FiberStream { fd: client })
    }
}

impl Drop for FiberListener {
    fn drop(&mut self) {
        let _ = close(self.fd);
    }
}

/// A connected TCP socket for fiber I/O.
pub struct FiberStream {
    fd: RawFd,
}

impl FiberStream {
    /// Connect to `addr:port`, parking until established or `timeout_ms`
    /// elapses.
    pub fn connect(addr: Ipv4Addr, port: u16, timeout_ms: i64) -> IoResult<FiberStream> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            return Err(IoError::Os(super::errno()));
        }

        let sa = sockaddr_in(addr, port);
        let result = unsafe {
            connect(
                fd,
                &sa as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                timeout_ms,
            )
        };
        if let Err(err) = result {
            unsafe { libc::close(fd) };
            return Err(err);
        }

        set_tcp_nodelay(fd);
        Ok(FiberStream { fd })
    }

    pub fn from_raw(fd: RawFd) -> FiberStream {
        FiberStream { fd }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn read(&self, buf: &mut [u8], timeout_ms: i64) -> IoResult<usize> {
        read(self.fd, buf, timeout_ms)
    }

    pub fn write(&self, buf: &[u8], timeout_ms: i64) -> IoResult<usize> {
        write(self.fd, buf, timeout_ms)
    }

    /// Read until `buf` is full. Fails with `Os(ECONNRESET)` on EOF
    /// before the buffer fills.
    pub fn read_exact(&self, buf: &mut [u8], timeout_ms: i64) -> IoResult<()> {
        let mut total = 0;
        while total < buf.len() {
            let n = self.read(&mut buf[total..], timeout_ms)?;
            if n == 0 {
                return Err(IoError::Os(libc::ECONNRESET));
            }
            total += n;
        }
        Ok(())
    }

    /// Write all of `buf`.
    pub fn write_all(&self, buf: &[u8], timeout_ms: i64) -> IoResult<()> {
        let mut total = 0;
        while total < buf.len() {
            let n = self.write(&buf[total..], timeout_ms)?;
            total += n;
        }
        Ok(())
    }
}

impl Drop for FiberStream {
    fn drop(&mut self) {
        let _ = close(self.fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_ephemeral_port() {
        let listener = FiberListener::bind(0).unwrap();
        let port = listener.local_port().unwrap();
        assert!(port > 0);
    }

    #[test]
    fn test_bind_conflict() {
        let first = FiberListener::bind(0).unwrap();
        let port = first.local_port().unwrap();
        // Without SO_REUSEPORT a second bind on the same port fails
        let second = FiberListener::bind(port);
        assert!(matches!(second, Err(IoError::Os(_))));
    }

    #[test]
    fn test_sockaddr_layout() {
        let sa = sockaddr_in(Ipv4Addr::new(127, 0, 0, 1), 8080);
        assert_eq!(u16::from_be(sa.sin_port), 8080);
        assert_eq!(u32::from_be(sa.sin_addr.s_addr), 0x7F000001);
    }
}
