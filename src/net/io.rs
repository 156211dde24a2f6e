//! Uniform socket I/O facade.

use std::cell::Cell;
use std::io as stdio;
use std::net::SocketAddr;
use std::time::Duration;

use log::trace;

use crate::runtime::Handle;
use crate::sys::{self, SocketFd};
use crate::{Error, Result};

#[cfg(windows)]
use crate::runtime::{when_any, Either};

/// A connected socket bound to an event loop.
///
/// `Io` only moves bytes; framing and parsing live in the protocol
/// layers above. All operations go through the loop's driver, so an
/// `Io` must only be used on the loop it was created against.
///
/// The descriptor is poisoned (set to the invalid sentinel) by
/// [`close`] and by a timed-out linked operation on platforms where
/// timeout emulation closes the handle; any further operation then
/// fails eagerly with `EBADF` instead of touching a recycled
/// descriptor.
///
/// [`close`]: Io::close
pub struct Io {
    fd: Cell<SocketFd>,
    handle: Handle,
}

impl Io {
    /// Receive scratch size used by the protocol layers.
    pub const BUF_MAX_SIZE: usize = 1 << 14;

    pub fn new(fd: SocketFd, handle: Handle) -> Io {
        Io {
            fd: Cell::new(fd),
            handle,
        }
    }

    /// Creates a stream socket and connects it to `addr`.
    pub async fn connect(addr: SocketAddr, handle: &Handle) -> Result<Io> {
        let res = handle.socket(family(&addr), sock_stream(), 0).await;
        let fd = Error::check(res)? as SocketFd;
        match Error::check(handle.connect(fd, &addr).await) {
            Ok(_) => {
                trace!("connected fd={} to {}", fd, addr);
                Ok(Io::new(fd, handle.clone()))
            }
            Err(e) => {
                handle.close(fd).await;
                Err(e)
            }
        }
    }

    pub fn fd(&self) -> SocketFd {
        self.fd.get()
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn is_open(&self) -> bool {
        self.fd.get() != sys::INVALID_SOCKET
    }

    fn checked_fd(&self) -> Result<SocketFd> {
        let fd = self.fd.get();
        if fd == sys::INVALID_SOCKET {
            return Err(Error::Kernel(stdio::Error::from_raw_os_error(
                bad_fd_errno(),
            )));
        }
        Ok(fd)
    }

    /// One receive; `Ok(0)` means the peer closed its half.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let fd = self.checked_fd()?;
        let res = self.handle.recv(fd, buf, 0).await;
        Error::check(res).map(|n| n as usize)
    }

    /// One receive limited to the first `n` bytes of `buf`.
    pub async fn recv_n(&self, buf: &mut [u8], n: usize) -> Result<usize> {
        self.recv(&mut buf[..n]).await
    }

    /// Keeps receiving until `buf` is full. A peer close before that
    /// is an error.
    pub async fn fully_recv(&self, mut buf: &mut [u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.recv(buf).await?;
            if n == 0 {
                return Err(Error::PeerClosed);
            }
            buf = &mut buf[n..];
        }
        Ok(())
    }

    /// Fully receives a fixed-size array; byte order is the caller's
    /// business.
    pub async fn recv_array<const N: usize>(&self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.fully_recv(&mut buf).await?;
        Ok(buf)
    }

    /// One receive raced against a timeout. `Ok(None)` is the timeout
    /// branch; the receive is cancelled and no bytes of it are
    /// observable afterwards.
    pub async fn recv_link_timeout(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<usize>> {
        let fd = self.checked_fd()?;
        #[cfg(unix)]
        {
            let res = self.handle.recv_linked(fd, buf, timeout).await;
            if res == -i64::from(libc::ECANCELED) {
                trace!("recv timed out; fd={}", fd);
                return Ok(None);
            }
            Error::check(res).map(|n| Some(n as usize))
        }
        #[cfg(windows)]
        {
            let mut op = self.handle.recv(fd, buf, 0);
            match when_any(&mut op, self.handle.sleep(timeout)).await {
                Either::Left(res) => Error::check(res).map(|n| Some(n as usize)),
                Either::Right(()) => {
                    // Timeout emulation closes the socket; poison the
                    // descriptor so reuse fails eagerly.
                    op.cancel_hard(fd);
                    drop(op);
                    self.fd.set(sys::INVALID_SOCKET);
                    Ok(None)
                }
            }
        }
    }

    /// Sends the whole buffer, looping over short writes.
    pub async fn fully_send(&self, mut buf: &[u8]) -> Result<()> {
        let fd = self.checked_fd()?;
        while !buf.is_empty() {
            let res = self.handle.send(fd, buf, 0).await;
            let sent = Error::check(res)? as usize;
            buf = &buf[sent..];
        }
        Ok(())
    }

    /// Sends the whole buffer with a per-chunk deadline. The first
    /// chunk to miss it raises [`Error::Timeout`].
    pub async fn send_link_timeout(&self, mut buf: &[u8], timeout: Duration) -> Result<()> {
        let fd = self.checked_fd()?;
        while !buf.is_empty() {
            #[cfg(unix)]
            let sent = {
                let res = self.handle.send_linked(fd, buf, timeout).await;
                if res == -i64::from(libc::ECANCELED) {
                    return Err(Error::Timeout);
                }
                Error::check(res)? as usize
            };
            #[cfg(windows)]
            let sent = {
                let mut op = self.handle.send(fd, buf, 0);
                match when_any(&mut op, self.handle.sleep(timeout)).await {
                    Either::Left(res) => Error::check(res)? as usize,
                    Either::Right(()) => {
                        op.cancel_hard(fd);
                        drop(op);
                        self.fd.set(sys::INVALID_SOCKET);
                        return Err(Error::Timeout);
                    }
                }
            };
            buf = &buf[sent..];
        }
        Ok(())
    }

    /// Closes the socket. Never fails; the result of the close op is
    /// returned for callers that care, and the descriptor is poisoned
    /// either way.
    pub async fn close(&self) -> i64 {
        let fd = self.fd.replace(sys::INVALID_SOCKET);
        if fd == sys::INVALID_SOCKET {
            return 0;
        }
        trace!("closing fd={}", fd);
        self.handle.close(fd).await
    }

    /// Closes the current descriptor and adopts `fd`.
    pub async fn bind_new_fd(&self, fd: SocketFd) {
        self.close().await;
        self.fd.set(fd);
    }

    /// Releases the descriptor to the caller without closing it.
    pub fn into_fd(self) -> SocketFd {
        self.fd.replace(sys::INVALID_SOCKET)
    }
}

impl std::fmt::Debug for Io {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Io").field("fd", &self.fd.get()).finish()
    }
}

#[cfg(unix)]
fn bad_fd_errno() -> i32 {
    libc::EBADF
}

#[cfg(windows)]
fn bad_fd_errno() -> i32 {
    // WSAENOTSOCK
    10038
}

#[cfg(unix)]
pub(crate) fn family(addr: &SocketAddr) -> i32 {
    match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    }
}

#[cfg(unix)]
pub(crate) fn sock_stream() -> i32 {
    libc::SOCK_STREAM
}

#[cfg(windows)]
pub(crate) fn family(addr: &SocketAddr) -> i32 {
    use windows_sys::Win32::Networking::WinSock::{AF_INET, AF_INET6};
    match addr {
        SocketAddr::V4(_) => i32::from(AF_INET),
        SocketAddr::V6(_) => i32::from(AF_INET6),
    }
}

#[cfg(windows)]
pub(crate) fn sock_stream() -> i32 {
    windows_sys::Win32::Networking::WinSock::SOCK_STREAM
}
