//! Blocking result carrier for threads outside the loop.

use std::sync::{Arc, Condvar, Mutex};

struct Shared<T> {
    slot: Mutex<Option<T>>,
    cond: Condvar,
}

/// A one-shot result slot a thread outside the event loop can block on.
///
/// The loop side completes it through the paired [`FuturePromise`];
/// [`FutureResult::wait`] parks the calling thread until then. This is
/// the only place the runtime uses a lock, and it guards exactly the
/// result slot.
pub struct FutureResult<T> {
    shared: Arc<Shared<T>>,
}

/// Completion side of a [`FutureResult`].
pub struct FuturePromise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> FutureResult<T> {
    pub fn new() -> (FutureResult<T>, FuturePromise<T>) {
        let shared = Arc::new(Shared {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        });
        (
            FutureResult {
                shared: shared.clone(),
            },
            FuturePromise { shared },
        )
    }

    /// Blocks until the promise is fulfilled and takes the value.
    pub fn wait(self) -> T {
        let mut slot = self.shared.slot.lock().unwrap();
        loop {
            match slot.take() {
                Some(value) => return value,
                None => slot = self.shared.cond.wait(slot).unwrap(),
            }
        }
    }

    /// Takes the value if it is already there.
    pub fn try_take(&self) -> Option<T> {
        self.shared.slot.lock().unwrap().take()
    }
}

impl<T> FuturePromise<T> {
    /// Stores the value and wakes every waiting thread.
    pub fn set(&self, value: T) {
        let mut slot = self.shared.slot.lock().unwrap();
        *slot = Some(value);
        self.shared.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wait_blocks_until_set() {
        let (result, promise) = FutureResult::new();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            promise.set(7u32);
        });
        assert_eq!(result.wait(), 7);
        handle.join().unwrap();
    }

    #[test]
    fn try_take_is_non_blocking() {
        let (result, promise) = FutureResult::<u32>::new();
        assert!(result.try_take().is_none());
        promise.set(1);
        assert_eq!(result.try_take(), Some(1));
    }
}
