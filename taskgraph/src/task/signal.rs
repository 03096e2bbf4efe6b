use crate::runtime::Schedule;
use crate::task::{Payload, Task, TaskBuffer};
use crate::thread::ThreadSelector;
use crate::utils::ClosableStack;
use parking_lot::Mutex;
use std::fmt;
use std::slice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{trace, warn};

/// Observable state of a [`CompletionSignal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalState {
    /// The work has not finished yet.
    Open,

    /// The work finished but prerequisites added with
    /// [`CompletionSignal::dont_complete_until`] are still pending.
    Completing,

    Complete,
}

/// Shared handle meaning "this piece of work is done".
///
/// Every task owns one. Other tasks register on it as subsequents and get
/// queued once it completes. A signal is complete exactly when its subsequents
/// list is closed, which happens once.
#[derive(Clone)]
pub struct CompletionSignal {
    inner: Arc<Inner>,
}

struct Inner {
    subsequents: ClosableStack<Arc<Task>>,

    /// Extra signals that must complete before this one does. Only touched by
    /// the task that owns the signal, while it executes.
    prerequisites: Mutex<Vec<CompletionSignal>>,

    completing: AtomicBool,

    executing: AtomicBool,

    /// Not owned by a task, completed through
    /// [`CompletionSignal::dispatch_subsequents`].
    standalone: bool,

    scheduler: Weak<dyn Schedule>,
}

impl CompletionSignal {
    /// Signal owned by a task, completed when the task executes.
    pub(crate) fn new(scheduler: Weak<dyn Schedule>) -> Self {
        Self::with_owner(scheduler, false)
    }

    pub(crate) fn standalone(scheduler: Weak<dyn Schedule>) -> Self {
        Self::with_owner(scheduler, true)
    }

    fn with_owner(scheduler: Weak<dyn Schedule>, standalone: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                subsequents: ClosableStack::new(),
                prerequisites: Mutex::new(Vec::new()),
                completing: AtomicBool::new(false),
                executing: AtomicBool::new(false),
                standalone,
                scheduler,
            }),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.inner.subsequents.is_closed()
    }

    pub fn state(&self) -> SignalState {
        if self.is_complete() {
            SignalState::Complete
        } else if self.inner.completing.load(Ordering::Acquire) {
            SignalState::Completing
        } else {
            SignalState::Open
        }
    }

    /// Returns `true` when both handles point to the same signal.
    pub fn ptr_eq(&self, other: &CompletionSignal) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Registers `task` to be resolved on completion. Returns `false` if the
    /// signal already completed, in which case `task` is dropped.
    pub(crate) fn add_subsequent(&self, task: Arc<Task>) -> bool {
        self.inner.subsequents.push(task).is_ok()
    }

    /// Keeps this signal from completing until `other` completes.
    ///
    /// Only valid from inside the task that owns this signal. Does nothing if
    /// `other` already completed.
    #[track_caller]
    pub fn dont_complete_until(&self, other: &CompletionSignal) {
        debug_assert!(
            !self.is_complete(),
            "prerequisite added to a completed signal"
        );
        debug_assert!(
            self.inner.executing.load(Ordering::Acquire),
            "prerequisite added outside of task execution"
        );

        if other.is_complete() {
            return;
        }

        self.inner.prerequisites.lock().push(other.clone());
    }

    pub(crate) fn begin_execution(&self) {
        self.inner.executing.store(true, Ordering::Release);
    }

    pub(crate) fn end_execution(&self) {
        self.inner.executing.store(false, Ordering::Release);
    }

    /// Completes a standalone signal, one created with
    /// [`Handle::new_signal`](crate::runtime::Handle::new_signal), queuing
    /// every subsequent that became ready.
    ///
    /// # Panics
    ///
    /// Panics if the signal belongs to a task, or was already dispatched.
    #[track_caller]
    pub fn dispatch_subsequents(&self) {
        assert!(
            self.inner.standalone,
            "dispatch_subsequents called on a task-owned signal"
        );

        let current = self
            .inner
            .scheduler
            .upgrade()
            .map_or(ThreadSelector::ANY, |s| s.current_thread());

        let mut ready = TaskBuffer::new();
        self.dispatch_subsequents_into(&mut ready, current);

        for task in ready {
            task.queue(current);
        }
    }

    /// Completes the signal, or defers completion to a gather task when
    /// prerequisites are still pending. Ready subsequents are pushed into
    /// `ready`, in registration order.
    #[track_caller]
    pub(crate) fn dispatch_subsequents_into(&self, ready: &mut TaskBuffer, current: ThreadSelector) {
        let prerequisites = std::mem::take(&mut *self.inner.prerequisites.lock());

        if !prerequisites.is_empty() {
            if let Some(scheduler) = self.inner.scheduler.upgrade() {
                let fast_path = prerequisites.len() < scheduler.small_wait_set_threshold()
                    && prerequisites.iter().all(CompletionSignal::is_complete);

                if !fast_path {
                    self.inner.completing.store(true, Ordering::Release);

                    let gather = Task::new(
                        Some("gather"),
                        Payload::Null,
                        scheduler.gather_thread(),
                        self.clone(),
                        prerequisites.len(),
                        Weak::clone(&self.inner.scheduler),
                    );

                    trace!(
                        task_id = %gather.id(),
                        pending = prerequisites.len(),
                        "deferring completion to gather task"
                    );

                    gather.setup_prerequisites(&prerequisites, current, true);
                    return;
                }
            } else {
                warn!(
                    pending = prerequisites.len(),
                    "scheduler gone, completing without prerequisites"
                );
            }
        }

        let Some(subsequents) = self.inner.subsequents.close() else {
            panic!("FATAL: completion signal dispatched twice");
        };

        ready.extend(
            subsequents
                .into_iter()
                .filter(|task| task.resolve_prerequisite()),
        );
    }

    /// Blocks until the signal completes.
    ///
    /// On a named thread this pumps the thread's queue while waiting, anywhere
    /// else it blocks on an event.
    pub fn wait(&self) {
        self.wait_on(ThreadSelector::ANY);
    }

    /// Same as [`CompletionSignal::wait`] with the calling thread given
    /// explicitly.
    pub fn wait_on(&self, current: ThreadSelector) {
        if self.is_complete() {
            return;
        }

        match self.inner.scheduler.upgrade() {
            Some(scheduler) => scheduler.wait_until_complete(slice::from_ref(self), current),
            None => warn!("scheduler gone, signal can never complete"),
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert!(
                self.prerequisites.get_mut().is_empty(),
                "completion signal dropped with pending prerequisites"
            );
        }
    }
}

impl fmt::Debug for CompletionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionSignal")
            .field("state", &self.state())
            .finish()
    }
}
