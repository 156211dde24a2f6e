//! The io_uring driver.
//!
//! One ring per event loop. Every submission gets a slot in `ops`; the
//! slot key doubles as the kernel's `user_data` cookie, so completions
//! are matched by index instead of by address and op futures stay
//! freely movable. Memory the kernel dereferences while an entry is in
//! flight (socket addresses, timespecs, path strings) is owned by the
//! slot, not by the future, and is released only when the CQE arrives.

use std::ffi::CString;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::task::{Poll, Waker};
use std::time::Duration;

use io_uring::{opcode, squeue, types, IoUring};
use log::trace;
use slab::Slab;

/// Socket descriptor type of this platform.
pub type SocketFd = RawFd;
/// Local file descriptor type of this platform.
pub type FileFd = RawFd;

/// Sentinel for a closed or not-yet-opened socket.
pub const INVALID_SOCKET: SocketFd = -1;
/// Sentinel for a closed or not-yet-opened file.
pub const INVALID_FILE: FileFd = -1;

/// Default submission ring size.
const RING_ENTRIES: u32 = 256;

enum Lifecycle {
    /// In the kernel, nobody polled yet.
    Submitted,
    /// In the kernel, a future is parked on the result.
    Waiting(Waker),
    /// The CQE arrived.
    Completed(i64),
    /// The owning future is gone; discard the CQE when it arrives.
    Ignored,
}

/// Kernel-referenced memory tied to the lifetime of one submission.
enum Keep {
    None,
    Addr(#[allow(dead_code)] Box<libc::sockaddr_storage>),
    Path(#[allow(dead_code)] CString),
    Timespec(#[allow(dead_code)] Box<types::Timespec>),
}

struct OpSlot {
    state: Lifecycle,
    keep: Keep,
}

impl OpSlot {
    fn new() -> OpSlot {
        OpSlot {
            state: Lifecycle::Submitted,
            keep: Keep::None,
        }
    }
}

pub(crate) struct Driver {
    ring: IoUring,
    ops: Slab<OpSlot>,
    /// Submissions handed to the kernel that have not completed yet.
    inflight: usize,
}

impl Driver {
    pub(crate) fn new() -> io::Result<Driver> {
        let ring = IoUring::new(RING_ENTRIES)?;
        Ok(Driver {
            ring,
            ops: Slab::with_capacity(RING_ENTRIES as usize),
            inflight: 0,
        })
    }

    /// True while at least one submission is pending.
    pub(crate) fn is_active(&self) -> bool {
        self.inflight > 0
    }

    /// Flushes the submission queue and blocks for up to `timeout` or
    /// until at least one completion arrives. Returns the wakers of
    /// every completed operation; they must be woken only after this
    /// call returns so a resumed future may submit again without
    /// stepping on entries of the same batch.
    pub(crate) fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Waker>> {
        trace!("driver wait; inflight={}; timeout={:?}", self.inflight, timeout);
        let res = match timeout {
            Some(t) => {
                let ts = types::Timespec::new()
                    .sec(t.as_secs())
                    .nsec(t.subsec_nanos());
                let args = types::SubmitArgs::new().timespec(&ts);
                self.ring.submitter().submit_with_args(1, &args)
            }
            None => self.ring.submit_and_wait(1),
        };
        match res {
            Ok(_) => {}
            // ETIME: the wait timed out. EINTR: interrupted by a signal.
            // EBUSY: the completion queue is saturated; drain it.
            Err(e)
                if matches!(
                    e.raw_os_error(),
                    Some(libc::ETIME) | Some(libc::EINTR) | Some(libc::EBUSY)
                ) => {}
            Err(e) => return Err(e),
        }

        let mut completed = Vec::new();
        for cqe in self.ring.completion() {
            completed.push((cqe.user_data() as usize, i64::from(cqe.result())));
        }

        let mut wakers = Vec::with_capacity(completed.len());
        for (key, res) in completed {
            self.inflight -= 1;
            trace!("completion; key={}; res={}", key, res);
            let slot = match self.ops.get_mut(key) {
                Some(slot) => slot,
                None => continue,
            };
            match mem::replace(&mut slot.state, Lifecycle::Completed(res)) {
                Lifecycle::Waiting(waker) => wakers.push(waker),
                Lifecycle::Submitted => {}
                Lifecycle::Ignored => {
                    self.ops.remove(key);
                }
                Lifecycle::Completed(_) => unreachable!("op completed twice"),
            }
        }
        Ok(wakers)
    }

    pub(crate) fn poll_op(&mut self, key: usize, waker: &Waker) -> Poll<i64> {
        let slot = &mut self.ops[key];
        match slot.state {
            Lifecycle::Completed(res) => {
                self.ops.remove(key);
                Poll::Ready(res)
            }
            _ => {
                slot.state = Lifecycle::Waiting(waker.clone());
                Poll::Pending
            }
        }
    }

    /// Called when an op future is dropped. A completed slot is simply
    /// freed; an in-flight one is marked ignored and a best-effort
    /// cancel is pushed for its cookie.
    pub(crate) fn drop_op(&mut self, key: usize) {
        if matches!(self.ops[key].state, Lifecycle::Completed(_)) {
            self.ops.remove(key);
            return;
        }
        self.ops[key].state = Lifecycle::Ignored;
        let cancel_key = self.ops.insert(OpSlot {
            state: Lifecycle::Ignored,
            keep: Keep::None,
        });
        let entry = opcode::AsyncCancel::new(key as u64)
            .build()
            .user_data(cancel_key as u64);
        self.push(entry);
    }

    fn push(&mut self, entry: squeue::Entry) {
        loop {
            // SAFETY: every resource the entry points at is owned by
            // the matching op slot until its CQE is reaped.
            let full = unsafe { self.ring.submission().push(&entry).is_err() };
            if !full {
                break;
            }
            // The ring is full. Hand what we have to the kernel; if
            // nothing can be submitted either, park until one entry
            // drains so this cannot spin.
            if self.ring.submit().is_err() {
                self.ring
                    .submit_and_wait(1)
                    .expect("io_uring submission queue stalled");
            }
        }
        self.inflight += 1;
    }

    /// Pushes `first` (flagged `IO_LINK`) directly followed by `second`
    /// in the same submission batch.
    fn push_linked(&mut self, first: squeue::Entry, second: squeue::Entry) {
        let first = first.flags(squeue::Flags::IO_LINK);
        loop {
            let mut sq = self.ring.submission();
            if sq.capacity() - sq.len() >= 2 {
                // SAFETY: as in `push`.
                unsafe {
                    sq.push(&first).expect("reserved space");
                    sq.push(&second).expect("reserved space");
                }
                break;
            }
            drop(sq);
            if self.ring.submit().is_err() {
                self.ring
                    .submit_and_wait(1)
                    .expect("io_uring submission queue stalled");
            }
        }
        self.inflight += 2;
    }

    fn submit_entry(&mut self, entry: squeue::Entry, keep: Keep) -> usize {
        let key = self.ops.insert(OpSlot {
            state: Lifecycle::Submitted,
            keep,
        });
        trace!("submit; key={}", key);
        self.push(entry.user_data(key as u64));
        key
    }

    // Submission constructors. Each one mirrors the matching
    // `io_uring_prep_*` call; negative results propagate errno-style
    // through the op future.

    pub(crate) fn prep_openat(&mut self, path: CString, flags: i32, mode: u32) -> usize {
        let entry = opcode::OpenAt::new(types::Fd(libc::AT_FDCWD), path.as_ptr())
            .flags(flags)
            .mode(mode)
            .build();
        self.submit_entry(entry, Keep::Path(path))
    }

    pub(crate) fn prep_socket(&mut self, domain: i32, ty: i32, protocol: i32) -> usize {
        let entry = opcode::Socket::new(domain, ty, protocol).build();
        self.submit_entry(entry, Keep::None)
    }

    pub(crate) fn prep_accept(&mut self, fd: SocketFd) -> usize {
        let entry = opcode::Accept::new(types::Fd(fd), std::ptr::null_mut(), std::ptr::null_mut())
            .flags(libc::SOCK_CLOEXEC)
            .build();
        self.submit_entry(entry, Keep::None)
    }

    pub(crate) fn prep_connect(&mut self, fd: SocketFd, addr: &SocketAddr) -> usize {
        let (storage, len) = socket_addr(addr);
        let storage = Box::new(storage);
        let entry = opcode::Connect::new(
            types::Fd(fd),
            &*storage as *const libc::sockaddr_storage as *const libc::sockaddr,
            len,
        )
        .build();
        self.submit_entry(entry, Keep::Addr(storage))
    }

    pub(crate) fn prep_read(&mut self, fd: FileFd, buf: &mut [u8], offset: u64) -> usize {
        let entry = opcode::Read::new(types::Fd(fd), buf.as_mut_ptr(), buf.len() as u32)
            .offset(offset)
            .build();
        self.submit_entry(entry, Keep::None)
    }

    pub(crate) fn prep_write(&mut self, fd: FileFd, buf: &[u8], offset: u64) -> usize {
        let entry = opcode::Write::new(types::Fd(fd), buf.as_ptr(), buf.len() as u32)
            .offset(offset)
            .build();
        self.submit_entry(entry, Keep::None)
    }

    pub(crate) fn prep_recv(&mut self, fd: SocketFd, buf: &mut [u8], flags: i32) -> usize {
        let entry = opcode::Recv::new(types::Fd(fd), buf.as_mut_ptr(), buf.len() as u32)
            .flags(flags)
            .build();
        self.submit_entry(entry, Keep::None)
    }

    pub(crate) fn prep_send(&mut self, fd: SocketFd, buf: &[u8], flags: i32) -> usize {
        let entry = opcode::Send::new(types::Fd(fd), buf.as_ptr(), buf.len() as u32)
            .flags(flags)
            .build();
        self.submit_entry(entry, Keep::None)
    }

    pub(crate) fn prep_close(&mut self, fd: SocketFd) -> usize {
        let entry = opcode::Close::new(types::Fd(fd)).build();
        self.submit_entry(entry, Keep::None)
    }

    pub(crate) fn prep_poll_add(&mut self, fd: SocketFd, mask: u32) -> usize {
        let entry = opcode::PollAdd::new(types::Fd(fd), mask).build();
        self.submit_entry(entry, Keep::None)
    }

    /// Submits `op` linked to a kernel timeout. If the timeout fires
    /// first the kernel cancels the op, whose result then reads
    /// `-ECANCELED`. The timeout entry's own completion (`-ETIME` when
    /// it fired, `-ECANCELED` when the op won) is never observed by a
    /// future and is discarded on arrival.
    fn prep_linked(&mut self, op: squeue::Entry, timeout: Duration) -> usize {
        let ts = Box::new(
            types::Timespec::new()
                .sec(timeout.as_secs())
                .nsec(timeout.subsec_nanos()),
        );
        let op_key = self.ops.insert(OpSlot::new());
        let tmo_key = self.ops.insert(OpSlot {
            state: Lifecycle::Ignored,
            keep: Keep::Timespec(ts),
        });
        let ts_ptr = match &self.ops[tmo_key].keep {
            Keep::Timespec(ts) => &**ts as *const types::Timespec,
            _ => unreachable!(),
        };
        let tmo = opcode::LinkTimeout::new(ts_ptr)
            .build()
            .user_data(tmo_key as u64);
        trace!("submit linked; key={}; timeout={:?}", op_key, timeout);
        self.push_linked(op.user_data(op_key as u64), tmo);
        op_key
    }

    pub(crate) fn prep_recv_linked(
        &mut self,
        fd: SocketFd,
        buf: &mut [u8],
        timeout: Duration,
    ) -> usize {
        let op = opcode::Recv::new(types::Fd(fd), buf.as_mut_ptr(), buf.len() as u32).build();
        self.prep_linked(op, timeout)
    }

    pub(crate) fn prep_send_linked(
        &mut self,
        fd: SocketFd,
        buf: &[u8],
        timeout: Duration,
    ) -> usize {
        let op = opcode::Send::new(types::Fd(fd), buf.as_ptr(), buf.len() as u32).build();
        self.prep_linked(op, timeout)
    }
}

/// Converts a `SocketAddr` into its C representation.
fn socket_addr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: all-zeroes is a valid representation of sockaddr_storage.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(addr) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: addr.port().to_be(),
                sin_addr: libc::in_addr {
                    // Octets are already in network order; keep the bytes.
                    s_addr: u32::from_ne_bytes(addr.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            // SAFETY: sockaddr_in fits in sockaddr_storage.
            unsafe {
                *(&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in) = sin;
            }
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(addr) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: addr.port().to_be(),
                sin6_flowinfo: addr.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: addr.ip().octets(),
                },
                sin6_scope_id: addr.scope_id(),
            };
            // SAFETY: sockaddr_in6 fits in sockaddr_storage.
            unsafe {
                *(&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6) = sin6;
            }
            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}
