use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::time::{Duration, Instant};

/// Auto-reset event.
///
/// A call to [`Event::trigger`] releases exactly one waiter. If nobody is
/// waiting, the event stays signaled and the next call to [`Event::wait`]
/// returns immediately, resetting it.
#[derive(Default)]
pub struct Event {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.cond.notify_one();
    }

    /// Blocks until the event is triggered.
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.cond.wait(&mut signaled);
        }
        *signaled = false;
    }

    /// Blocks until the event is triggered or `timeout` elapses. Returns
    /// `true` if the event was triggered.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signaled = self.signaled.lock();

        while !*signaled {
            if self.cond.wait_until(&mut signaled, deadline).timed_out() {
                break;
            }
        }

        std::mem::replace(&mut *signaled, false)
    }

    pub fn reset(&self) {
        *self.signaled.lock() = false;
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("signaled", &*self.signaled.lock())
            .finish()
    }
}
