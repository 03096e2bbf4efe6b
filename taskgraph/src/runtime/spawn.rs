//! Building and submitting tasks.
//!
//! [`Scheduler::spawn`] and [`Scheduler::submit`] cover the common cases. The
//! [`TaskBuilder`] returned by [`Scheduler::task`] adds prerequisites, names,
//! and the option to hold a task back until it is explicitly unlocked.
//!
//! ```no_run
//! use taskgraph::thread::ThreadSelector;
//!
//! let rt = taskgraph::Builder::new_multi_thread().try_build().unwrap();
//!
//! let load = rt.spawn(|| { /* ... */ });
//! let parse = rt.task(|_, _| { /* ... */ }).after(&[load]).dispatch();
//!
//! // Runs on named thread 0 once `parse` completed.
//! let apply = rt
//!     .task(|_, _| { /* ... */ })
//!     .on(ThreadSelector::named(0))
//!     .after(&[parse])
//!     .hold();
//!
//! let done = apply.signal().clone();
//! apply.unlock();
//! done.wait();
//! ```
use crate::runtime::Scheduler;
use crate::task::{CompletionSignal, Payload, Task, TaskFn};
use crate::thread::ThreadSelector;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

// Most tasks have at most a couple of prerequisites.
type Prerequisites = SmallVec<[CompletionSignal; 4]>;

/// A builder for configuring and submitting a new task.
///
/// Created by calling [`Scheduler::task`].
#[must_use = "a task only runs once dispatched or held then unlocked"]
pub struct TaskBuilder<'a> {
    scheduler: &'a Scheduler,

    f: TaskFn,

    thread: ThreadSelector,

    current: ThreadSelector,

    prerequisites: Prerequisites,

    name: Option<&'static str>,
}

impl<'a> TaskBuilder<'a> {
    pub(crate) fn new(scheduler: &'a Scheduler, f: TaskFn) -> Self {
        Self {
            scheduler,
            f,
            thread: ThreadSelector::ANY,
            current: ThreadSelector::ANY,
            prerequisites: Prerequisites::new(),
            name: None,
        }
    }

    /// Thread the task runs on.
    #[track_caller]
    pub fn on(mut self, thread: ThreadSelector) -> Self {
        self.scheduler.check_target(thread);
        self.thread = thread;
        self
    }

    /// Adds prerequisites. The task runs only after all of them completed.
    pub fn after(mut self, prerequisites: &[CompletionSignal]) -> Self {
        self.prerequisites.extend(prerequisites.iter().cloned());
        self
    }

    /// Thread the task is submitted from, when the caller knows it. Saves a
    /// thread-local lookup when queuing to a named thread.
    pub fn current_thread(mut self, current: ThreadSelector) -> Self {
        self.current = current;
        self
    }

    /// Name shown in logs.
    pub fn name(mut self, name: &'static str) -> Self {
        self.name = Some(name);
        self
    }

    /// Submits the task. It gets queued as soon as every prerequisite
    /// completed, which may be right away.
    pub fn dispatch(self) -> CompletionSignal {
        let (task, prerequisites, current) = self.build();
        let signal = task.signal().clone();

        task.setup_prerequisites(&prerequisites, current, true);
        signal
    }

    /// Registers the task with its prerequisites but keeps it from running
    /// until [`HeldTask::unlock`]. Lets callers wire subsequents onto the
    /// task's signal before it can possibly complete.
    pub fn hold(self) -> HeldTask {
        let (task, prerequisites, current) = self.build();

        task.setup_prerequisites(&prerequisites, current, false);
        HeldTask { task }
    }

    fn build(self) -> (Arc<Task>, Prerequisites, ThreadSelector) {
        let task = Task::new(
            self.name,
            Payload::Run(self.f),
            self.thread,
            CompletionSignal::new(self.scheduler.weak()),
            self.prerequisites.len(),
            self.scheduler.weak(),
        );

        (task, self.prerequisites, self.current)
    }
}

impl fmt::Debug for TaskBuilder<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskBuilder")
            .field("thread", &self.thread)
            .field("prerequisites", &self.prerequisites.len())
            .field("name", &self.name)
            .finish()
    }
}

/// Task created with [`TaskBuilder::hold`].
///
/// Dropping it without unlocking means the task never runs and its signal
/// never completes.
#[must_use = "a held task never runs until unlocked"]
pub struct HeldTask {
    task: Arc<Task>,
}

impl HeldTask {
    pub fn signal(&self) -> &CompletionSignal {
        self.task.signal()
    }

    /// Lets the task run once its prerequisites completed.
    ///
    /// A held task may be unlocked from any thread, so the calling thread is
    /// looked up here rather than taken from the builder.
    pub fn unlock(self) {
        self.unlock_on(ThreadSelector::ANY);
    }

    /// Same as [`HeldTask::unlock`] with the calling thread given explicitly.
    pub fn unlock_on(self, current: ThreadSelector) {
        self.task.unlock(current);
    }
}

impl fmt::Debug for HeldTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeldTask")
            .field("task", &self.task)
            .finish()
    }
}
