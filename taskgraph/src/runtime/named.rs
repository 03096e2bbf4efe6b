use crate::queue::StallingQueue;
use crate::runtime::Scheduler;
use crate::sync::Event;
use crate::task::Task;
use crate::thread::{QueueIndex, TaskPriority, ThreadSelector};
use crate::utils::ScopeGuard;
use bitflags::bitflags;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use tracing::trace;

bitflags! {
    /// Reasons for a `pump_until_quit` to return.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct QuitFlags: u8 {
        /// The pump was only needed for a wait that is now satisfied.
        const RETURN = 1;

        /// The scheduler is going away, for good.
        const SHUTDOWN = 1 << 1;
    }
}

/// Worker record of a thread the scheduler does not own.
///
/// The host drives it by calling the pump methods from the thread itself,
/// typically the main loop of an application.
pub(crate) struct NamedThread {
    selector: ThreadSelector,

    queues: [NamedQueue; 2],

    /// OS thread that attached itself as this named thread.
    attached: OnceLock<ThreadId>,
}

pub(crate) struct NamedQueue {
    /// Single consumer: the named thread itself.
    queue: StallingQueue<Arc<Task>>,

    /// Set while the owner pumps this queue.
    pumping: AtomicBool,

    quit: AtomicU8,
}

impl NamedQueue {
    fn new() -> Self {
        Self {
            queue: StallingQueue::new(vec![Arc::new(Event::new())]),
            pumping: AtomicBool::new(false),
            quit: AtomicU8::new(0),
        }
    }

    fn quit_flags(&self) -> QuitFlags {
        QuitFlags::from_bits_truncate(self.quit.load(Ordering::Acquire))
    }

    fn set_quit(&self, flags: QuitFlags) {
        self.quit.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    fn clear_quit(&self, flags: QuitFlags) {
        self.quit.fetch_and(!flags.bits(), Ordering::AcqRel);
    }
}

impl NamedThread {
    pub(crate) fn new(index: u32) -> Self {
        Self {
            selector: ThreadSelector::named(index),
            queues: [NamedQueue::new(), NamedQueue::new()],
            attached: OnceLock::new(),
        }
    }

    pub(crate) fn selector(&self) -> ThreadSelector {
        self.selector
    }

    fn queue(&self, q: QueueIndex) -> &NamedQueue {
        &self.queues[q.index()]
    }

    /// Binds the calling OS thread to this named thread.
    #[track_caller]
    pub(crate) fn attach(&self) {
        let me = thread::current().id();
        let owner = *self.attached.get_or_init(|| me);

        assert_eq!(
            owner,
            me,
            "FATAL: named thread {} attached from two different OS threads",
            self.selector.thread_index()
        );
    }

    /// Push done by the named thread itself. It is running, so it can't be
    /// stalled on its own queue.
    pub(crate) fn enqueue_from_this_thread(
        &self,
        q: QueueIndex,
        task: Arc<Task>,
        priority: TaskPriority,
    ) {
        let claimed = self.queue(q).queue.push(task, priority);
        debug_assert!(
            claimed.is_none(),
            "named thread {} stalled while enqueuing to itself",
            self.selector.thread_index()
        );
    }

    /// Returns `true` if the thread was stalled and had to be woken.
    pub(crate) fn enqueue_from_other_thread(
        &self,
        q: QueueIndex,
        task: Arc<Task>,
        priority: TaskPriority,
    ) -> bool {
        let queue = &self.queue(q).queue;

        match queue.push(task, priority) {
            Some(consumer) => {
                queue.wake(consumer);
                true
            }
            None => false,
        }
    }

    /// Runs queued tasks until the queue is empty, without ever blocking.
    /// Returns how many tasks ran.
    #[track_caller]
    pub(crate) fn pump_until_idle(&self, q: QueueIndex, scheduler: &Scheduler) -> usize {
        let queue = self.queue(q);
        let _guard = self.enter(q);
        let current = self.selector.with_queue(q);

        let mut processed = 0;
        while let Some(task) = queue.queue.pop(0, false) {
            scheduler.execute_task(task, current);
            processed += 1;
        }

        processed
    }

    /// Runs queued tasks, stalling when idle, until a return or a shutdown is
    /// requested for this queue.
    #[track_caller]
    pub(crate) fn pump_until_quit(&self, q: QueueIndex, scheduler: &Scheduler) {
        let queue = self.queue(q);
        let _guard = self.enter(q);
        let current = self.selector.with_queue(q);

        queue.clear_quit(QuitFlags::RETURN);
        trace!(thread = %current, "pumping until quit");

        while queue.quit_flags().is_empty() {
            // `None` means interrupted or shut down, the flags tell which.
            if let Some(task) = queue.queue.pop(0, true) {
                scheduler.execute_task(task, current);
            }
        }

        queue.clear_quit(QuitFlags::RETURN);
    }

    pub(crate) fn request_return(&self, q: QueueIndex) {
        let queue = self.queue(q);
        queue.set_quit(QuitFlags::RETURN);
        queue.queue.interrupt(0);
    }

    pub(crate) fn request_quit_shutdown(&self) {
        for queue in &self.queues {
            queue.set_quit(QuitFlags::SHUTDOWN);
            queue.queue.shutdown();
        }
    }

    pub(crate) fn is_processing(&self, q: QueueIndex) -> bool {
        self.queue(q).pumping.load(Ordering::Acquire)
    }

    /// Drops every task still queued, returns how many there were.
    pub(crate) fn drain(&self) -> usize {
        self.queues.iter().map(|queue| queue.queue.drain()).sum()
    }

    #[track_caller]
    fn enter(&self, q: QueueIndex) -> ScopeGuard<impl FnOnce() + '_> {
        debug_assert!(
            self.attached
                .get()
                .is_none_or(|owner| *owner == thread::current().id()),
            "named thread {} pumped from a foreign OS thread",
            self.selector.thread_index()
        );

        let pumping = &self.queue(q).pumping;
        assert!(
            !pumping.swap(true, Ordering::AcqRel),
            "FATAL: reentrant pump of {}",
            self.selector.with_queue(q)
        );

        ScopeGuard::new(move || pumping.store(false, Ordering::Release))
    }
}

impl fmt::Debug for NamedThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedThread")
            .field("selector", &self.selector)
            .field("main", &self.queues[0].queue)
            .field("local", &self.queues[1].queue)
            .field("attached", &self.attached.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queues_pump_independently() {
        let named = NamedThread::new(3);
        named.attach();

        let _main = named.enter(QueueIndex::Main);
        assert!(named.is_processing(QueueIndex::Main));
        assert!(!named.is_processing(QueueIndex::Local));

        {
            let _local = named.enter(QueueIndex::Local);
            assert!(named.is_processing(QueueIndex::Local));
        }
        assert!(!named.is_processing(QueueIndex::Local));
    }

    #[test]
    #[should_panic(expected = "reentrant pump")]
    fn test_reentrant_pump_panics() {
        let named = NamedThread::new(0);

        let _outer = named.enter(QueueIndex::Main);
        let _inner = named.enter(QueueIndex::Main);
    }

    #[test]
    fn test_return_flag_is_per_queue() {
        let named = NamedThread::new(1);

        named.request_return(QueueIndex::Local);
        assert_eq!(named.queue(QueueIndex::Local).quit_flags(), QuitFlags::RETURN);
        assert!(named.queue(QueueIndex::Main).quit_flags().is_empty());

        named.request_quit_shutdown();
        assert!(
            named
                .queue(QueueIndex::Main)
                .quit_flags()
                .contains(QuitFlags::SHUTDOWN)
        );
    }
}
