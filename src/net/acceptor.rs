//! Listening socket.

use std::net::{SocketAddr, TcpListener, ToSocketAddrs};

use log::debug;

use crate::net::Io;
use crate::runtime::Handle;
use crate::sys::SocketFd;
use crate::{Error, Result};

#[cfg(unix)]
use std::os::unix::io::IntoRawFd;
#[cfg(windows)]
use std::os::windows::io::IntoRawSocket;

/// A bound, listening TCP socket accepting through the event loop.
///
/// Binding and listening are synchronous setup; only `accept` goes
/// through the driver. The usual shape is an accept loop that hands
/// each connection to a detached task:
///
/// ```no_run
/// use coio::net::Acceptor;
/// use coio::EventLoop;
///
/// let ev = EventLoop::new().unwrap();
/// let handle = ev.handle();
/// let acceptor = Acceptor::bind("127.0.0.1:0", &handle).unwrap();
/// ev.block_on(async {
///     loop {
///         let io = acceptor.accept().await.unwrap();
///         let handle = io.handle().clone();
///         handle.detach(async move {
///             // serve the connection
///             io.close().await;
///         });
///     }
/// });
/// ```
pub struct Acceptor {
    fd: SocketFd,
    local_addr: SocketAddr,
    handle: Handle,
}

impl Acceptor {
    /// Binds `addr` and starts listening.
    pub fn bind<A: ToSocketAddrs>(addr: A, handle: &Handle) -> Result<Acceptor> {
        let listener = TcpListener::bind(addr).map_err(Error::Kernel)?;
        let local_addr = listener.local_addr().map_err(Error::Kernel)?;
        #[cfg(unix)]
        let fd = listener.into_raw_fd();
        #[cfg(windows)]
        let fd = listener.into_raw_socket() as SocketFd;
        debug!("listening on {}", local_addr);
        Ok(Acceptor {
            fd,
            local_addr,
            handle: handle.clone(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts one connection.
    pub async fn accept(&self) -> Result<Io> {
        let res = self.handle.accept(self.fd).await;
        let fd = Error::check(res)? as SocketFd;
        debug!("accepted fd={}", fd);
        Ok(Io::new(fd, self.handle.clone()))
    }

    /// Closes the listening socket.
    pub async fn close(self) {
        self.handle.close(self.fd).await;
    }
}
