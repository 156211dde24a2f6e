//! The event loop: a single-threaded executor bound to the completion
//! driver and the timer wheel.
//!
//! One [`EventLoop`] owns exactly one driver and one timer wheel. Tasks,
//! timers, and I/O operations created against a loop must only be
//! awaited on that loop; nothing here is `Send` across loop boundaries
//! by design. Each loop iteration drains the ready queue, wakes due
//! timers, then blocks in the kernel for `min(next timer, forever)`.
//! Completion wakers are collected while the CQE batch is drained and
//! invoked only afterwards, so a resumed future can submit new entries
//! without stepping on in-flight ones from the same batch.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};
use std::thread;
use std::time::{Duration, Instant};

use log::{error, trace};
use slab::Slab;

use crate::sys;

mod future_result;
mod timer;
mod when_any;

pub use self::future_result::{FuturePromise, FutureResult};
pub use self::timer::Sleep;
pub use self::when_any::{when_any, Either, WhenAny};

pub(crate) use self::timer::TimerWheel;

/// Queue slot reserved for the future driven by `block_on` itself.
const ROOT: usize = usize::MAX;

/// Ready queue shared with task wakers.
///
/// Wakers must be `Send`, hence the mutex; in practice it is only ever
/// contended by threads holding a [`FuturePromise`] paired with loop
/// code, and a push is a few instructions.
struct ReadyQueue {
    queue: Mutex<VecDeque<usize>>,
}

impl ReadyQueue {
    fn push(&self, id: usize) {
        self.queue.lock().unwrap().push_back(id);
    }

    fn pop(&self) -> Option<usize> {
        self.queue.lock().unwrap().pop_front()
    }

    fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }
}

struct TaskWaker {
    id: usize,
    ready: Arc<ReadyQueue>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.ready.push(self.id);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.ready.push(self.id);
    }
}

struct TaskEntry {
    /// Taken while the task is being polled.
    fut: Option<Pin<Box<dyn Future<Output = ()>>>>,
    waker: Waker,
}

pub(crate) struct Inner {
    pub(crate) driver: RefCell<sys::Driver>,
    pub(crate) timers: RefCell<TimerWheel>,
    tasks: RefCell<Slab<TaskEntry>>,
    ready: Arc<ReadyQueue>,
    running: Cell<bool>,
}

/// A single-threaded event loop.
///
/// # Examples
///
/// ```no_run
/// use coio::EventLoop;
///
/// let ev = EventLoop::new().unwrap();
/// let out = ev.block_on(async { 1 + 2 });
/// assert_eq!(out, 3);
/// ```
pub struct EventLoop {
    inner: Rc<Inner>,
}

/// A cheap clonable reference to an [`EventLoop`].
///
/// Everything that submits work — sockets, files, timers, spawned
/// tasks — goes through a `Handle`. Handles must not be moved to
/// another thread.
#[derive(Clone)]
pub struct Handle {
    pub(crate) inner: Rc<Inner>,
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle").finish_non_exhaustive()
    }
}

impl EventLoop {
    pub fn new() -> std::io::Result<EventLoop> {
        let driver = sys::Driver::new()?;
        Ok(EventLoop {
            inner: Rc::new(Inner {
                driver: RefCell::new(driver),
                timers: RefCell::new(TimerWheel::new()),
                tasks: RefCell::new(Slab::new()),
                ready: Arc::new(ReadyQueue {
                    queue: Mutex::new(VecDeque::new()),
                }),
                running: Cell::new(false),
            }),
        })
    }

    pub fn handle(&self) -> Handle {
        Handle {
            inner: self.inner.clone(),
        }
    }

    /// Runs `fut` to completion, driving the loop.
    ///
    /// This is the synchronous entry point; it must be called from
    /// outside the loop (nesting panics). Spawned tasks keep running
    /// while the root future is pending; when the root completes,
    /// `block_on` returns even if detached tasks remain.
    ///
    /// # Panics
    ///
    /// Panics when nested, when the driver fails fatally, or when the
    /// root future is pending with no I/O and no timers left to wait
    /// for.
    pub fn block_on<F: Future>(&self, fut: F) -> F::Output {
        if self.inner.running.replace(true) {
            panic!("nested block_on on the same event loop");
        }
        struct Reset<'a>(&'a Cell<bool>);
        impl Drop for Reset<'_> {
            fn drop(&mut self) {
                self.0.set(false);
            }
        }
        let _reset = Reset(&self.inner.running);

        let mut fut = Box::pin(fut);
        let root_waker = Waker::from(Arc::new(TaskWaker {
            id: ROOT,
            ready: self.inner.ready.clone(),
        }));
        let mut cx = Context::from_waker(&root_waker);
        self.inner.ready.push(ROOT);

        loop {
            while let Some(id) = self.inner.ready.pop() {
                if id == ROOT {
                    if let Poll::Ready(out) = fut.as_mut().poll(&mut cx) {
                        return out;
                    }
                } else {
                    self.run_task(id);
                }
            }

            // Timers first: entries that expired before the kernel wait
            // are resumed before completions.
            let timeout = self.inner.timers.borrow_mut().tick(Instant::now());
            if !self.inner.ready.is_empty() {
                continue;
            }

            let active = self.inner.driver.borrow().is_active();
            if active {
                let wakers = self
                    .inner
                    .driver
                    .borrow_mut()
                    .wait(timeout)
                    .expect("event driver failure");
                for waker in wakers {
                    waker.wake();
                }
            } else if let Some(dur) = timeout {
                trace!("no I/O pending; sleeping {:?}", dur);
                thread::sleep(dur);
            } else {
                panic!("event loop stalled: root future pending with no I/O or timers");
            }
        }
    }

    fn run_task(&self, id: usize) {
        let (mut fut, waker) = {
            let mut tasks = self.inner.tasks.borrow_mut();
            match tasks.get_mut(id) {
                // A stale wake for a finished task, or a duplicate wake
                // while the task sits in the queue twice.
                None => return,
                Some(entry) => match entry.fut.take() {
                    None => return,
                    Some(fut) => (fut, entry.waker.clone()),
                },
            }
        };
        let mut cx = Context::from_waker(&waker);
        match panic::catch_unwind(AssertUnwindSafe(|| fut.as_mut().poll(&mut cx))) {
            Ok(Poll::Pending) => {
                if let Some(entry) = self.inner.tasks.borrow_mut().get_mut(id) {
                    entry.fut = Some(fut);
                }
            }
            Ok(Poll::Ready(())) => {
                self.inner.tasks.borrow_mut().remove(id);
            }
            Err(_) => {
                // Detached tasks must not take the loop down with them.
                self.inner.tasks.borrow_mut().remove(id);
                error!("task {} panicked; dropping it", id);
            }
        }
    }
}

struct JoinState<T> {
    result: Option<T>,
    waker: Option<Waker>,
    finished: bool,
}

/// Handle to a spawned task; awaiting it yields the task's output.
///
/// A task may be awaited at most once: the result is moved out on
/// completion and a second await is a logic error. Dropping the handle
/// detaches the task.
pub struct JoinHandle<T> {
    state: Rc<RefCell<JoinState<T>>>,
}

impl<T> Future for JoinHandle<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let mut state = self.state.borrow_mut();
        match state.result.take() {
            Some(value) => Poll::Ready(value),
            None if state.finished => panic!("JoinHandle polled after completion"),
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl Handle {
    /// Spawns a task onto the loop and returns a handle to its result.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let state = Rc::new(RefCell::new(JoinState {
            result: None,
            waker: None,
            finished: false,
        }));
        let shared = state.clone();
        self.spawn_raw(async move {
            let out = fut.await;
            let waker = {
                let mut state = shared.borrow_mut();
                state.result = Some(out);
                state.finished = true;
                state.waker.take()
            };
            if let Some(waker) = waker {
                waker.wake();
            }
        });
        JoinHandle { state }
    }

    /// Spawns a fire-and-forget task. Its storage is released when it
    /// finishes and panics are logged and swallowed.
    pub fn detach<F>(&self, fut: F)
    where
        F: Future<Output = ()> + 'static,
    {
        self.spawn_raw(fut);
    }

    fn spawn_raw<F>(&self, fut: F)
    where
        F: Future<Output = ()> + 'static,
    {
        let mut tasks = self.inner.tasks.borrow_mut();
        let entry = tasks.vacant_entry();
        let id = entry.key();
        let waker = Waker::from(Arc::new(TaskWaker {
            id,
            ready: self.inner.ready.clone(),
        }));
        entry.insert(TaskEntry {
            fut: Some(Box::pin(fut)),
            waker,
        });
        trace!("spawn task {}", id);
        self.inner.ready.push(id);
    }

    /// Completes after `dur` has elapsed.
    pub fn sleep(&self, dur: Duration) -> Sleep {
        Sleep::new(self.clone(), Instant::now() + dur)
    }

    /// Completes at `deadline`.
    pub fn sleep_until(&self, deadline: Instant) -> Sleep {
        Sleep::new(self.clone(), deadline)
    }
}

/// One kernel submission, awaitable for its errno-style result.
///
/// The submission is in flight from the moment the op is constructed.
/// The driver slot index — not this object's address — is the kernel
/// cookie, so an `Op` may be moved freely. Dropping it before
/// completion marks the slot ignored: the eventual completion is
/// discarded without waking anyone.
pub struct Op<'a> {
    handle: Handle,
    key: usize,
    done: bool,
    /// Ties the op to buffers the kernel reads or writes.
    _buf: PhantomData<&'a mut [u8]>,
}

impl<'a> Op<'a> {
    fn new(handle: &Handle, key: usize) -> Op<'a> {
        Op {
            handle: handle.clone(),
            key,
            done: false,
            _buf: PhantomData,
        }
    }

    #[cfg(windows)]
    pub(crate) fn cancel_hard(&self, sock: sys::SocketFd) {
        self.handle
            .inner
            .driver
            .borrow_mut()
            .cancel_hard(self.key, sock);
    }
}

impl Future for Op<'_> {
    type Output = i64;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<i64> {
        let this = &mut *self;
        match this
            .handle
            .inner
            .driver
            .borrow_mut()
            .poll_op(this.key, cx.waker())
        {
            Poll::Ready(res) => {
                this.done = true;
                Poll::Ready(res)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Op<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.handle.inner.driver.borrow_mut().drop_op(self.key);
        }
    }
}

// Submission factories. Negative results propagate errno-style and are
// converted by `Error::check` at the call sites.
impl Handle {
    /// Creates a socket.
    pub fn socket(&self, domain: i32, ty: i32, protocol: i32) -> Op<'static> {
        let key = self
            .inner
            .driver
            .borrow_mut()
            .prep_socket(domain, ty, protocol);
        Op::new(self, key)
    }

    /// Accepts one connection; resolves to the client descriptor.
    pub fn accept(&self, fd: sys::SocketFd) -> Op<'static> {
        let key = self.inner.driver.borrow_mut().prep_accept(fd);
        Op::new(self, key)
    }

    /// Connects `fd` to `addr`; resolves to 0.
    pub fn connect(&self, fd: sys::SocketFd, addr: &std::net::SocketAddr) -> Op<'static> {
        let key = self.inner.driver.borrow_mut().prep_connect(fd, addr);
        Op::new(self, key)
    }

    /// Stream receive; resolves to the byte count, 0 meaning the peer
    /// closed.
    pub fn recv<'a>(&self, fd: sys::SocketFd, buf: &'a mut [u8], flags: i32) -> Op<'a> {
        let key = self.inner.driver.borrow_mut().prep_recv(fd, buf, flags);
        Op::new(self, key)
    }

    /// Stream send; resolves to the byte count written.
    pub fn send<'a>(&self, fd: sys::SocketFd, buf: &'a [u8], flags: i32) -> Op<'a> {
        let key = self.inner.driver.borrow_mut().prep_send(fd, buf, flags);
        Op::new(self, key)
    }

    /// Positional file read.
    pub fn read_at<'a>(&self, fd: sys::FileFd, buf: &'a mut [u8], offset: u64) -> Op<'a> {
        let key = self.inner.driver.borrow_mut().prep_read(fd, buf, offset);
        Op::new(self, key)
    }

    /// Positional file write.
    pub fn write_at<'a>(&self, fd: sys::FileFd, buf: &'a [u8], offset: u64) -> Op<'a> {
        let key = self.inner.driver.borrow_mut().prep_write(fd, buf, offset);
        Op::new(self, key)
    }

    /// Closes a socket.
    pub fn close(&self, fd: sys::SocketFd) -> Op<'static> {
        let key = self.inner.driver.borrow_mut().prep_close(fd);
        Op::new(self, key)
    }

    /// Closes a file.
    pub fn close_file(&self, fd: sys::FileFd) -> Op<'static> {
        #[cfg(unix)]
        let key = self.inner.driver.borrow_mut().prep_close(fd);
        #[cfg(windows)]
        let key = self.inner.driver.borrow_mut().prep_close_file(fd);
        Op::new(self, key)
    }

    /// Waits until `fd` is readable.
    #[cfg(unix)]
    pub fn poll_readable(&self, fd: sys::SocketFd) -> Op<'static> {
        let key = self
            .inner
            .driver
            .borrow_mut()
            .prep_poll_add(fd, libc::POLLIN as u32);
        Op::new(self, key)
    }

    /// Opens a path relative to the current directory.
    #[cfg(unix)]
    pub(crate) fn openat(&self, path: std::ffi::CString, flags: i32, mode: u32) -> Op<'static> {
        let key = self.inner.driver.borrow_mut().prep_openat(path, flags, mode);
        Op::new(self, key)
    }

    /// Receive with an attached kernel link-timeout. A `-ECANCELED`
    /// result means the timeout fired first.
    #[cfg(unix)]
    pub(crate) fn recv_linked<'a>(
        &self,
        fd: sys::SocketFd,
        buf: &'a mut [u8],
        timeout: Duration,
    ) -> Op<'a> {
        let key = self
            .inner
            .driver
            .borrow_mut()
            .prep_recv_linked(fd, buf, timeout);
        Op::new(self, key)
    }

    /// Send with an attached kernel link-timeout.
    #[cfg(unix)]
    pub(crate) fn send_linked<'a>(
        &self,
        fd: sys::SocketFd,
        buf: &'a [u8],
        timeout: Duration,
    ) -> Op<'a> {
        let key = self
            .inner
            .driver
            .borrow_mut()
            .prep_send_linked(fd, buf, timeout);
        Op::new(self, key)
    }
}
