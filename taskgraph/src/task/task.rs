use crate::runtime::{SPILL_TO_HEAP_THRESHOLD, Schedule};
use crate::sync::Event;
use crate::task::id::TaskIdGuard;
use crate::task::{CompletionSignal, Id};
use crate::thread::ThreadSelector;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{error, trace, warn};

/// Body of a user task. Receives the thread it runs on and its own completion
/// signal, which it may hold open with [`CompletionSignal::dont_complete_until`].
pub(crate) type TaskFn = Box<dyn FnOnce(ThreadSelector, &CompletionSignal) + Send + 'static>;

/// Tasks made ready while executing another task. Kept on the stack for the
/// common case of a handful of subsequents.
pub(crate) type TaskBuffer = SmallVec<[Arc<Task>; SPILL_TO_HEAP_THRESHOLD]>;

pub(crate) enum Payload {
    Run(TaskFn),

    /// Does nothing, only completes its signal. Used to gather prerequisites.
    Null,

    /// Makes the pump of the task's target sub-queue return.
    Return,

    TriggerEvent(Arc<Event>),
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Run(_) => f.write_str("Run"),
            Payload::Null => f.write_str("Null"),
            Payload::Return => f.write_str("Return"),
            Payload::TriggerEvent(_) => f.write_str("TriggerEvent"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Stage {
    Created = 0,
    Queued = 1,
    Executing = 2,
    Finished = 3,
}

impl Stage {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Stage::Created,
            1 => Stage::Queued,
            2 => Stage::Executing,
            _ => Stage::Finished,
        }
    }
}

/// Schedulable unit of work.
///
/// A task becomes runnable once every prerequisite completed *and* its setup
/// lock was released. Both are tracked by `unresolved`, which starts at the
/// number of prerequisites plus one.
pub(crate) struct Task {
    id: Id,

    name: Option<&'static str>,

    thread: ThreadSelector,

    payload: Mutex<Option<Payload>>,

    signal: CompletionSignal,

    unresolved: AtomicUsize,

    stage: AtomicU8,

    scheduler: Weak<dyn Schedule>,
}

impl Task {
    pub(crate) fn new(
        name: Option<&'static str>,
        payload: Payload,
        thread: ThreadSelector,
        signal: CompletionSignal,
        num_prerequisites: usize,
        scheduler: Weak<dyn Schedule>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Id::next(),
            name,
            thread,
            payload: Mutex::new(Some(payload)),
            signal,
            unresolved: AtomicUsize::new(num_prerequisites + 1),
            stage: AtomicU8::new(Stage::Created as u8),
            scheduler,
        })
    }

    pub(crate) fn id(&self) -> Id {
        self.id
    }

    pub(crate) fn thread(&self) -> ThreadSelector {
        self.thread
    }

    pub(crate) fn signal(&self) -> &CompletionSignal {
        &self.signal
    }

    pub(crate) fn stage(&self) -> Stage {
        Stage::from_u8(self.stage.load(Ordering::Acquire))
    }

    /// Registers the task with each prerequisite. Prerequisites that already
    /// completed are resolved right away, as is the setup lock when `unlock`
    /// is set. Queues the task if nothing is left to wait for.
    pub(crate) fn setup_prerequisites(
        self: &Arc<Self>,
        prerequisites: &[CompletionSignal],
        current: ThreadSelector,
        unlock: bool,
    ) {
        let already_complete = prerequisites
            .iter()
            .filter(|p| !p.add_subsequent(Arc::clone(self)))
            .count();

        let release = already_complete + usize::from(unlock);
        if release == 0 {
            return;
        }

        let prev = self.unresolved.fetch_sub(release, Ordering::AcqRel);
        debug_assert!(prev >= release, "task {} over-resolved", self.id);

        if prev == release {
            Arc::clone(self).queue(current);
        }
    }

    /// Resolves one prerequisite (or the setup lock). Returns `true` when the
    /// task just became ready and the caller is responsible for queuing it.
    pub(crate) fn resolve_prerequisite(&self) -> bool {
        let prev = self.unresolved.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "task {} over-resolved", self.id);
        prev == 1
    }

    pub(crate) fn conditional_queue(self: Arc<Self>, current: ThreadSelector) {
        if self.resolve_prerequisite() {
            self.queue(current);
        }
    }

    /// Releases the setup lock of a held task.
    pub(crate) fn unlock(self: Arc<Self>, current: ThreadSelector) {
        self.conditional_queue(current);
    }

    /// Hands the task to its scheduler.
    #[track_caller]
    pub(crate) fn queue(self: Arc<Self>, current: ThreadSelector) {
        self.mark_queued();

        match self.scheduler.upgrade() {
            Some(scheduler) => scheduler.queue_task(self, current),
            None => warn!(task_id = %self.id, "scheduler gone, dropping task"),
        }
    }

    #[track_caller]
    pub(crate) fn mark_queued(&self) {
        let prev = self.stage.compare_exchange(
            Stage::Created as u8,
            Stage::Queued as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        assert!(prev.is_ok(), "FATAL: task {} queued twice", self.id);
    }

    /// Runs the payload once, then dispatches the signal's subsequents. Tasks
    /// that became ready are pushed into `ready` for the caller to queue.
    pub(crate) fn execute(&self, ready: &mut TaskBuffer, current: ThreadSelector) {
        let prev = self.stage.swap(Stage::Executing as u8, Ordering::AcqRel);
        assert_eq!(
            Stage::from_u8(prev),
            Stage::Queued,
            "FATAL: task {} executed while not queued",
            self.id
        );

        let payload = self.payload.lock().take();

        trace!(task_id = %self.id, name = self.name, thread = %current, ?payload, "execute");

        {
            let _guard = TaskIdGuard::enter(self.id);
            self.signal.begin_execution();

            match payload {
                Some(Payload::Run(f)) => {
                    let signal = &self.signal;
                    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| f(current, signal)))
                    {
                        error!(
                            task_id = %self.id,
                            name = self.name,
                            "task panicked: {}",
                            panic_message(&*panic)
                        );
                    }
                }
                Some(Payload::Return) => match self.scheduler.upgrade() {
                    Some(scheduler) => scheduler.request_return(self.thread),
                    None => warn!(task_id = %self.id, "scheduler gone, return not delivered"),
                },
                Some(Payload::TriggerEvent(event)) => event.trigger(),
                Some(Payload::Null) | None => {}
            }

            self.signal.end_execution();
        }

        self.stage.store(Stage::Finished as u8, Ordering::Release);
        self.signal.dispatch_subsequents_into(ready, current);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("thread", &self.thread)
            .field("stage", &self.stage())
            .field("unresolved", &self.unresolved.load(Ordering::Relaxed))
            .finish()
    }
}
