//! Timer wheel.
//!
//! An ordered map of deadline to waker. The loop calls [`TimerWheel::tick`]
//! once per iteration; it wakes everything that is due and reports how
//! long the kernel wait may block. A [`Sleep`] erases its own entry when
//! dropped before firing, so cancellation needs no extra bookkeeping.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use log::trace;

use crate::runtime::Handle;

/// Key of one timer entry. The counter disambiguates entries sharing a
/// deadline, which also makes the map a multimap in effect.
pub(crate) type TimerKey = (Instant, u64);

pub(crate) struct TimerWheel {
    entries: BTreeMap<TimerKey, Waker>,
    next_id: u64,
}

impl TimerWheel {
    pub(crate) fn new() -> TimerWheel {
        TimerWheel {
            entries: BTreeMap::new(),
            next_id: 0,
        }
    }

    pub(crate) fn insert(&mut self, deadline: Instant, waker: Waker) -> TimerKey {
        let key = (deadline, self.next_id);
        self.next_id += 1;
        trace!("timer insert; key={:?}", key.1);
        self.entries.insert(key, waker);
        key
    }

    /// Replaces the waker of a still-armed entry.
    pub(crate) fn update(&mut self, key: TimerKey, waker: &Waker) {
        if let Some(slot) = self.entries.get_mut(&key) {
            slot.clone_from(waker);
        }
    }

    /// A no-op if the entry already fired.
    pub(crate) fn remove(&mut self, key: TimerKey) {
        self.entries.remove(&key);
    }

    /// Wakes every entry with `deadline <= now` and returns the time
    /// until the next armed entry, or `None` if the wheel is empty.
    pub(crate) fn tick(&mut self, now: Instant) -> Option<Duration> {
        loop {
            let key = match self.entries.keys().next() {
                Some(&key) => key,
                None => return None,
            };
            if key.0 <= now {
                trace!("timer fire; key={:?}", key.1);
                let waker = self.entries.remove(&key).expect("armed entry");
                waker.wake();
            } else {
                return Some(key.0 - now);
            }
        }
    }
}

/// Future returned by [`Handle::sleep`] and [`Handle::sleep_until`].
///
/// The wheel entry is created on first poll and removed on drop if it
/// has not fired yet, so abandoning a `Sleep` (for example as the loser
/// of a [`when_any`]) costs one map erase and nothing else.
///
/// [`when_any`]: crate::when_any
#[derive(Debug)]
pub struct Sleep {
    handle: Handle,
    deadline: Instant,
    key: Option<TimerKey>,
}

impl Sleep {
    pub(crate) fn new(handle: Handle, deadline: Instant) -> Sleep {
        Sleep {
            handle,
            deadline,
            key: None,
        }
    }

    /// The instant this sleep elapses.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if Instant::now() >= self.deadline {
            // Fired (or zero-length): the wheel entry, if any, is
            // already gone when we got here through `tick`.
            if let Some(key) = self.key.take() {
                self.handle.inner.timers.borrow_mut().remove(key);
            }
            return Poll::Ready(());
        }
        let mut timers = self.handle.inner.timers.borrow_mut();
        match self.key {
            Some(key) => timers.update(key, cx.waker()),
            None => {
                let key = timers.insert(self.deadline, cx.waker().clone());
                drop(timers);
                self.key = Some(key);
            }
        }
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.handle.inner.timers.borrow_mut().remove(key);
        }
    }
}
