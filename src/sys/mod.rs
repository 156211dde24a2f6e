//! Per-OS driver implementations with a uniform surface.
//!
//! Both drivers expose the same set of submission constructors and the
//! same completion flow: a slot is allocated in the op slab, the slot
//! index is handed to the kernel as the completion cookie, and
//! [`Driver::wait`] drains the completion queue into the slots before
//! returning the wakers of every operation that finished. Dropping an
//! in-flight operation marks its slot ignored; the eventual completion
//! is then discarded silently.

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub(crate) use self::unix::Driver;
#[cfg(unix)]
pub use self::unix::{FileFd, SocketFd, INVALID_FILE, INVALID_SOCKET};

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub(crate) use self::windows::Driver;
#[cfg(windows)]
pub use self::windows::{FileFd, SocketFd, INVALID_FILE, INVALID_SOCKET};
