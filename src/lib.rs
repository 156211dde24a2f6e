//! Single-threaded completion-based async I/O.
//!
//! Coio binds a cooperative executor to the kernel's completion
//! interface — io_uring on Linux, I/O completion ports on Windows —
//! and layers an HTTP/1.1 and WebSocket engine on top of it. One
//! [`EventLoop`] owns one driver and one timer wheel; everything
//! created against a loop stays on that loop.
//!
//! # Layers
//!
//! * [`EventLoop`] / [`Handle`] — the executor, timers, and raw
//!   submission futures.
//! * [`net`] — the [`Io`](net::Io) socket facade and the
//!   [`Acceptor`](net::Acceptor).
//! * [`fs`] — async file access with an explicit cursor.
//! * [`http`] — incremental request/response parsing, the sender side,
//!   the [`HttpClient`](http::HttpClient), and SOCKS5 proxying.
//! * [`ws`] — RFC 6455 framing, handshakes, and ping/pong handling.
//!
//! Timeouts are not a side channel: the only cancellation primitive is
//! racing an operation against a timer ([`when_any`]), which on Linux
//! compiles down to a kernel link-timeout. A timed-out operation is
//! cancelled and its completion discarded; no bytes of it are
//! observable afterwards.
//!
//! # Examples
//!
//! ```no_run
//! use coio::EventLoop;
//! use std::time::Duration;
//!
//! let ev = EventLoop::new().unwrap();
//! let handle = ev.handle();
//! ev.block_on(async {
//!     handle.sleep(Duration::from_millis(10)).await;
//! });
//! ```

mod error;
mod runtime;
mod sys;

pub mod fs;
pub mod http;
pub mod net;
pub mod ws;

pub use crate::error::{Error, Result};
pub use crate::runtime::{
    when_any, Either, EventLoop, FuturePromise, FutureResult, Handle, JoinHandle, Op, Sleep,
    WhenAny,
};
pub use crate::sys::{FileFd, SocketFd, INVALID_FILE, INVALID_SOCKET};
