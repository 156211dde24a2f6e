//! The IOCP driver.
//!
//! Completion-based like io_uring, with two differences the rest of the
//! crate never sees: handles must be associated with the completion
//! port exactly once before their first overlapped operation (tracked
//! in `registered`), and there is no kernel cancellation primitive —
//! timeouts are emulated by flagging the op's `OVERLAPPED` as cancelled
//! and closing the target handle, after which the kernel completes the
//! op with a failure that [`Driver::wait`] filters out.
//!
//! Every overlapped operation owns a heap-pinned [`Overlapped`] whose
//! address the kernel holds; the slot index inside it routes the
//! completion back to the op slab, mirroring the io_uring cookie.

use std::collections::HashSet;
use std::ffi::c_void;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::ptr;
use std::task::{Poll, Waker};
use std::time::Duration;

use log::trace;
use slab::Slab;

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_GEN_FAILURE, ERROR_INVALID_PARAMETER, ERROR_IO_PENDING,
    HANDLE, INVALID_HANDLE_VALUE, WAIT_TIMEOUT,
};
use windows_sys::Win32::Networking::WinSock::{
    bind, closesocket, AcceptEx, WSAGetLastError, WSAIoctl, WSARecv, WSASend, WSASocketW,
    AF_INET, AF_INET6, INVALID_SOCKET as WS_INVALID_SOCKET, SIO_GET_EXTENSION_FUNCTION_POINTER,
    SOCKADDR, SOCKADDR_IN, SOCKADDR_IN6, SOCKADDR_STORAGE, SOCKET, SOCKET_ERROR, SOCK_STREAM,
    WSABUF, WSAID_CONNECTEX, WSA_FLAG_OVERLAPPED,
};
use windows_sys::Win32::Storage::FileSystem::{ReadFile, WriteFile};
use windows_sys::Win32::System::IO::{
    CreateIoCompletionPort, GetQueuedCompletionStatusEx, OVERLAPPED, OVERLAPPED_ENTRY,
};

/// Socket descriptor type of this platform.
pub type SocketFd = usize;
/// Local file handle type of this platform.
pub type FileFd = isize;

/// Sentinel for a closed or not-yet-opened socket.
pub const INVALID_SOCKET: SocketFd = WS_INVALID_SOCKET;
/// Sentinel for a closed or not-yet-opened file.
pub const INVALID_FILE: FileFd = -1;

/// Wait batch size, as in the reference loop.
const ENTRY_BATCH: usize = 64;

type ConnectExFn = unsafe extern "system" fn(
    SOCKET,
    *const SOCKADDR,
    i32,
    *const c_void,
    u32,
    *mut u32,
    *mut OVERLAPPED,
) -> i32;

enum Lifecycle {
    Submitted,
    Waiting(Waker),
    Completed(i64),
    Ignored,
}

/// What the completion's byte count means for this op.
enum OpKind {
    Plain,
    /// AcceptEx: the result is the pre-created client socket.
    Accept(SocketFd),
    /// ConnectEx: the result is 0 on success.
    Connect,
}

/// The `OVERLAPPED` the kernel holds, heap-pinned for the duration of
/// the op. `cancelled` is set by the user-space timeout emulation
/// before the handle is closed.
#[repr(C)]
struct Overlapped {
    raw: OVERLAPPED,
    key: usize,
    cancelled: bool,
}

struct OpSlot {
    state: Lifecycle,
    kind: OpKind,
    over: Option<Box<Overlapped>>,
    /// AcceptEx scratch for the two address blocks.
    accept_buf: Option<Box<[u8]>>,
    /// ConnectEx target address.
    addr: Option<Box<SOCKADDR_STORAGE>>,
}

impl OpSlot {
    fn pending(key: usize, kind: OpKind) -> OpSlot {
        // SAFETY: OVERLAPPED must start zeroed.
        let raw: OVERLAPPED = unsafe { mem::zeroed() };
        OpSlot {
            state: Lifecycle::Submitted,
            kind,
            over: Some(Box::new(Overlapped {
                raw,
                key,
                cancelled: false,
            })),
            accept_buf: None,
            addr: None,
        }
    }

    fn done(res: i64) -> OpSlot {
        OpSlot {
            state: Lifecycle::Completed(res),
            kind: OpKind::Plain,
            over: None,
            accept_buf: None,
            addr: None,
        }
    }
}

pub(crate) struct Driver {
    port: HANDLE,
    ops: Slab<OpSlot>,
    /// Handles already associated with the completion port.
    registered: HashSet<usize>,
    inflight: usize,
    connect_ex: Option<ConnectExFn>,
}

impl Driver {
    pub(crate) fn new() -> io::Result<Driver> {
        // SAFETY: creating a fresh port, no handle is associated yet.
        let port = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, ptr::null_mut(), 0, 0) };
        if port.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(Driver {
            port,
            ops: Slab::new(),
            registered: HashSet::new(),
            inflight: 0,
            connect_ex: None,
        })
    }

    pub(crate) fn is_active(&self) -> bool {
        self.inflight > 0
    }

    pub(crate) fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Waker>> {
        trace!("driver wait; inflight={}; timeout={:?}", self.inflight, timeout);
        let millis = match timeout {
            Some(t) => t.as_millis().min(u128::from(u32::MAX - 1)) as u32,
            None => u32::MAX, // INFINITE
        };
        let mut entries: [OVERLAPPED_ENTRY; ENTRY_BATCH] = unsafe { mem::zeroed() };
        let mut n: u32 = 0;
        // SAFETY: `entries` outlives the call; the port is valid.
        let ok = unsafe {
            GetQueuedCompletionStatusEx(
                self.port,
                entries.as_mut_ptr(),
                ENTRY_BATCH as u32,
                &mut n,
                millis,
                0,
            )
        };
        if ok == 0 {
            let err = unsafe { GetLastError() };
            if err == WAIT_TIMEOUT {
                return Ok(Vec::new());
            }
            return Err(io::Error::from_raw_os_error(err as i32));
        }

        let mut wakers = Vec::with_capacity(n as usize);
        for entry in entries.iter().take(n as usize) {
            if entry.lpOverlapped.is_null() {
                continue;
            }
            // SAFETY: the pointer is the Overlapped box owned by the
            // matching slot; the slot is alive until removed below.
            let over = unsafe { &*(entry.lpOverlapped as *const Overlapped) };
            let key = over.key;
            let cancelled = over.cancelled;
            self.inflight -= 1;
            let slot = match self.ops.get_mut(key) {
                Some(slot) => slot,
                None => continue,
            };
            let res = if cancelled {
                // The timeout emulation closed the handle; the racing
                // waiter was resumed by the timer branch already.
                self.ops.remove(key);
                continue;
            } else if unsafe { (*entry.lpOverlapped).Internal } != 0 {
                // Non-zero NTSTATUS; surface a generic failure.
                -i64::from(ERROR_GEN_FAILURE)
            } else {
                match slot.kind {
                    OpKind::Accept(sock) => sock as i64,
                    OpKind::Connect => 0,
                    OpKind::Plain => i64::from(entry.dwNumberOfBytesTransferred),
                }
            };
            trace!("completion; key={}; res={}", key, res);
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

    pub(crate) fn drop_op(&mut self, key: usize) {
        if matches!(self.ops[key].state, Lifecycle::Completed(_)) {
            self.ops.remove(key);
        } else {
            self.ops[key].state = Lifecycle::Ignored;
        }
    }

    /// Timeout emulation: flag the op cancelled, then close the target
    /// so the kernel fails the pending op. The failure completion is
    /// filtered in [`Driver::wait`].
    pub(crate) fn cancel_hard(&mut self, key: usize, sock: SocketFd) {
        if let Some(slot) = self.ops.get_mut(key) {
            if let Some(over) = slot.over.as_mut() {
                over.cancelled = true;
            }
        }
        self.registered.remove(&sock);
        unsafe {
            closesocket(sock);
        }
    }

    fn associate(&mut self, handle: usize) -> io::Result<()> {
        if self.registered.contains(&handle) {
            return Ok(());
        }
        // SAFETY: associating a fresh handle with our port.
        let res =
            unsafe { CreateIoCompletionPort(handle as HANDLE, self.port, 0, 0) };
        if res.is_null() && unsafe { GetLastError() } != ERROR_INVALID_PARAMETER {
            return Err(io::Error::last_os_error());
        }
        self.registered.insert(handle);
        Ok(())
    }

    fn overlapped_ptr(&mut self, key: usize) -> *mut OVERLAPPED {
        let over = self.ops[key].over.as_mut().expect("pending op");
        &mut over.raw as *mut OVERLAPPED
    }

    /// Interprets the immediate return of an overlapped starter:
    /// pending and success both resolve through the completion port.
    fn started(&mut self, key: usize, ok: bool) -> usize {
        if ok || unsafe { WSAGetLastError() } == ERROR_IO_PENDING as i32 {
            self.inflight += 1;
        } else {
            let err = unsafe { WSAGetLastError() };
            self.ops[key] = OpSlot::done(-i64::from(err));
        }
        key
    }

    pub(crate) fn prep_socket(&mut self, domain: i32, ty: i32, protocol: i32) -> usize {
        let sock = unsafe {
            WSASocketW(
                domain,
                ty,
                protocol,
                ptr::null(),
                0,
                WSA_FLAG_OVERLAPPED,
            )
        };
        if sock == WS_INVALID_SOCKET {
            let err = unsafe { WSAGetLastError() };
            return self.ops.insert(OpSlot::done(-i64::from(err)));
        }
        if let Err(e) = self.associate(sock) {
            let raw = e.raw_os_error().unwrap_or(1);
            return self.ops.insert(OpSlot::done(-i64::from(raw)));
        }
        self.ops.insert(OpSlot::done(sock as i64))
    }

    pub(crate) fn prep_accept(&mut self, listener: SocketFd) -> usize {
        let cli = unsafe {
            WSASocketW(
                AF_INET as i32,
                SOCK_STREAM,
                0,
                ptr::null(),
                0,
                WSA_FLAG_OVERLAPPED,
            )
        };
        if cli == WS_INVALID_SOCKET {
            let err = unsafe { WSAGetLastError() };
            return self.ops.insert(OpSlot::done(-i64::from(err)));
        }
        if self.associate(listener).is_err() || self.associate(cli).is_err() {
            unsafe { closesocket(cli) };
            return self.ops.insert(OpSlot::done(-i64::from(ERROR_INVALID_PARAMETER)));
        }

        let key = self.ops.vacant_key();
        let mut slot = OpSlot::pending(key, OpKind::Accept(cli));
        let addr_len = mem::size_of::<SOCKADDR_STORAGE>() + 16;
        slot.accept_buf = Some(vec![0u8; 2 * addr_len].into_boxed_slice());
        let key = self.ops.insert(slot);

        let buf_ptr = self.ops[key].accept_buf.as_mut().unwrap().as_mut_ptr();
        let over = self.overlapped_ptr(key);
        let mut received: u32 = 0;
        let ok = unsafe {
            AcceptEx(
                listener,
                cli,
                buf_ptr as *mut c_void,
                0,
                addr_len as u32,
                addr_len as u32,
                &mut received,
                over,
            ) != 0
        };
        self.started(key, ok)
    }

    pub(crate) fn prep_connect(&mut self, sock: SocketFd, addr: &SocketAddr) -> usize {
        if let Err(e) = self.associate(sock) {
            let raw = e.raw_os_error().unwrap_or(1);
            return self.ops.insert(OpSlot::done(-i64::from(raw)));
        }
        // ConnectEx requires the socket to be bound first.
        let (local, local_len) = any_addr(addr);
        let rc = unsafe { bind(sock, &local as *const SOCKADDR_STORAGE as *const SOCKADDR, local_len) };
        if rc == SOCKET_ERROR {
            let err = unsafe { WSAGetLastError() };
            return self.ops.insert(OpSlot::done(-i64::from(err)));
        }
        let connect_ex = match self.load_connect_ex(sock) {
            Ok(f) => f,
            Err(e) => {
                let raw = e.raw_os_error().unwrap_or(1);
                return self.ops.insert(OpSlot::done(-i64::from(raw)));
            }
        };

        let key = self.ops.vacant_key();
        let mut slot = OpSlot::pending(key, OpKind::Connect);
        let (storage, len) = socket_addr(addr);
        slot.addr = Some(Box::new(storage));
        let key = self.ops.insert(slot);

        let addr_ptr =
            &**self.ops[key].addr.as_ref().unwrap() as *const SOCKADDR_STORAGE as *const SOCKADDR;
        let over = self.overlapped_ptr(key);
        let mut sent: u32 = 0;
        let ok = unsafe { connect_ex(sock, addr_ptr, len, ptr::null(), 0, &mut sent, over) != 0 };
        self.started(key, ok)
    }

    pub(crate) fn prep_recv(&mut self, sock: SocketFd, buf: &mut [u8], _flags: i32) -> usize {
        if let Err(e) = self.associate(sock) {
            let raw = e.raw_os_error().unwrap_or(1);
            return self.ops.insert(OpSlot::done(-i64::from(raw)));
        }
        let key = self.ops.vacant_key();
        let key = self.ops.insert(OpSlot::pending(key, OpKind::Plain));
        let over = self.overlapped_ptr(key);
        let mut wsabuf = WSABUF {
            len: buf.len() as u32,
            buf: buf.as_mut_ptr(),
        };
        let mut flags: u32 = 0;
        let rc = unsafe {
            WSARecv(sock, &mut wsabuf, 1, ptr::null_mut(), &mut flags, over, None)
        };
        self.started(key, rc != SOCKET_ERROR)
    }

    pub(crate) fn prep_send(&mut self, sock: SocketFd, buf: &[u8], _flags: i32) -> usize {
        if let Err(e) = self.associate(sock) {
            let raw = e.raw_os_error().unwrap_or(1);
            return self.ops.insert(OpSlot::done(-i64::from(raw)));
        }
        let key = self.ops.vacant_key();
        let key = self.ops.insert(OpSlot::pending(key, OpKind::Plain));
        let over = self.overlapped_ptr(key);
        let mut wsabuf = WSABUF {
            len: buf.len() as u32,
            buf: buf.as_ptr() as *mut u8,
        };
        let rc = unsafe { WSASend(sock, &mut wsabuf, 1, ptr::null_mut(), 0, over, None) };
        self.started(key, rc != SOCKET_ERROR)
    }

    pub(crate) fn prep_read(&mut self, file: FileFd, buf: &mut [u8], offset: u64) -> usize {
        let _ = self.associate(file as usize);
        let key = self.ops.vacant_key();
        let key = self.ops.insert(OpSlot::pending(key, OpKind::Plain));
        {
            let over = self.ops[key].over.as_mut().unwrap();
            over.raw.Anonymous.Anonymous.Offset = (offset & 0xFFFF_FFFF) as u32;
            over.raw.Anonymous.Anonymous.OffsetHigh = (offset >> 32) as u32;
        }
        let over = self.overlapped_ptr(key);
        let ok = unsafe {
            ReadFile(
                file as HANDLE,
                buf.as_mut_ptr(),
                buf.len() as u32,
                ptr::null_mut(),
                over,
            ) != 0
        };
        self.started(key, ok)
    }

    pub(crate) fn prep_write(&mut self, file: FileFd, buf: &[u8], offset: u64) -> usize {
        let _ = self.associate(file as usize);
        let key = self.ops.vacant_key();
        let key = self.ops.insert(OpSlot::pending(key, OpKind::Plain));
        {
            let over = self.ops[key].over.as_mut().unwrap();
            over.raw.Anonymous.Anonymous.Offset = (offset & 0xFFFF_FFFF) as u32;
            over.raw.Anonymous.Anonymous.OffsetHigh = (offset >> 32) as u32;
        }
        let over = self.overlapped_ptr(key);
        let ok = unsafe {
            WriteFile(
                file as HANDLE,
                buf.as_ptr(),
                buf.len() as u32,
                ptr::null_mut(),
                over,
            ) != 0
        };
        self.started(key, ok)
    }

    /// Close is synchronous on this platform; the op completes
    /// immediately so the uniform awaitable surface holds.
    pub(crate) fn prep_close(&mut self, sock: SocketFd) -> usize {
        self.registered.remove(&sock);
        let rc = unsafe { closesocket(sock) };
        let res = if rc == SOCKET_ERROR {
            -i64::from(unsafe { WSAGetLastError() })
        } else {
            0
        };
        self.ops.insert(OpSlot::done(res))
    }

    pub(crate) fn prep_close_file(&mut self, file: FileFd) -> usize {
        self.registered.remove(&(file as usize));
        let ok = unsafe { CloseHandle(file as HANDLE) } != 0;
        let res = if ok {
            0
        } else {
            -i64::from(unsafe { GetLastError() })
        };
        self.ops.insert(OpSlot::done(res))
    }

    fn load_connect_ex(&mut self, sock: SocketFd) -> io::Result<ConnectExFn> {
        if let Some(f) = self.connect_ex {
            return Ok(f);
        }
        let guid = WSAID_CONNECTEX;
        let mut func: *mut c_void = ptr::null_mut();
        let mut bytes: u32 = 0;
        let rc = unsafe {
            WSAIoctl(
                sock,
                SIO_GET_EXTENSION_FUNCTION_POINTER,
                &guid as *const _ as *const c_void,
                mem::size_of_val(&guid) as u32,
                &mut func as *mut _ as *mut c_void,
                mem::size_of::<*mut c_void>() as u32,
                &mut bytes,
                ptr::null_mut(),
                None,
            )
        };
        if rc == SOCKET_ERROR {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: the kernel returned the ConnectEx entry point.
        let f: ConnectExFn = unsafe { mem::transmute(func) };
        self.connect_ex = Some(f);
        Ok(f)
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.port);
        }
    }
}

fn socket_addr(addr: &SocketAddr) -> (SOCKADDR_STORAGE, i32) {
    // SAFETY: all-zeroes is a valid representation of SOCKADDR_STORAGE.
    let mut storage: SOCKADDR_STORAGE = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(addr) => {
            let sin = SOCKADDR_IN {
                sin_family: AF_INET,
                sin_port: addr.port().to_be(),
                sin_addr: unsafe { mem::transmute(addr.ip().octets()) },
                sin_zero: [0; 8],
            };
            unsafe {
                *(&mut storage as *mut SOCKADDR_STORAGE as *mut SOCKADDR_IN) = sin;
            }
            (storage, mem::size_of::<SOCKADDR_IN>() as i32)
        }
        SocketAddr::V6(addr) => {
            let mut sin6: SOCKADDR_IN6 = unsafe { mem::zeroed() };
            sin6.sin6_family = AF_INET6;
            sin6.sin6_port = addr.port().to_be();
            sin6.sin6_addr = unsafe { mem::transmute(addr.ip().octets()) };
            unsafe {
                *(&mut storage as *mut SOCKADDR_STORAGE as *mut SOCKADDR_IN6) = sin6;
            }
            (storage, mem::size_of::<SOCKADDR_IN6>() as i32)
        }
    }
}

/// A wildcard local address of the same family, for the `bind` that
/// `ConnectEx` requires.
fn any_addr(peer: &SocketAddr) -> (SOCKADDR_STORAGE, i32) {
    let any = match peer {
        SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
    };
    socket_addr(&any)
}
