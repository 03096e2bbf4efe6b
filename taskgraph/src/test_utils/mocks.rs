use crate::runtime::{RuntimeConfig, Schedule};
use crate::task::{CompletionSignal, Payload, Task, TaskBuffer};
use crate::thread::ThreadSelector;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};

/// Single threaded `Schedule` mock.
///
/// Records every task it is asked to queue instead of running it, so tests
/// can drive execution by hand with [`SpyScheduler::run_next`] and inspect
/// where things were routed.
#[derive(Debug)]
pub(crate) struct SpyScheduler {
    me: Weak<SpyScheduler>,

    queued: Mutex<VecDeque<Arc<Task>>>,

    /// Every selector a queued task targeted, in queuing order.
    routed: Mutex<Vec<ThreadSelector>>,

    returns: Mutex<Vec<ThreadSelector>>,

    small_wait_set_threshold: usize,

    gather_thread: ThreadSelector,
}

impl SpyScheduler {
    pub(crate) fn new() -> Arc<Self> {
        Self::with_threshold(RuntimeConfig::default().small_wait_set_threshold)
    }

    pub(crate) fn with_threshold(small_wait_set_threshold: usize) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: Weak::clone(me),
            queued: Mutex::new(VecDeque::new()),
            routed: Mutex::new(Vec::new()),
            returns: Mutex::new(Vec::new()),
            small_wait_set_threshold,
            gather_thread: RuntimeConfig::default().gather_thread,
        })
    }

    pub(crate) fn weak(&self) -> Weak<dyn Schedule> {
        self.me.clone()
    }

    pub(crate) fn new_signal(&self) -> CompletionSignal {
        CompletionSignal::standalone(self.weak())
    }

    /// Builds a task, registers it with `prerequisites` and releases its
    /// setup lock.
    pub(crate) fn dispatch<F>(
        &self,
        thread: ThreadSelector,
        prerequisites: &[CompletionSignal],
        f: F,
    ) -> Arc<Task>
    where
        F: FnOnce(ThreadSelector, &CompletionSignal) + Send + 'static,
    {
        let task = self.build(Payload::Run(Box::new(f)), thread, prerequisites.len());
        task.setup_prerequisites(prerequisites, ThreadSelector::ANY, true);
        task
    }

    /// Same as [`SpyScheduler::dispatch`] but the setup lock stays held.
    pub(crate) fn hold<F>(&self, prerequisites: &[CompletionSignal], f: F) -> Arc<Task>
    where
        F: FnOnce(ThreadSelector, &CompletionSignal) + Send + 'static,
    {
        let task = self.build(
            Payload::Run(Box::new(f)),
            ThreadSelector::ANY,
            prerequisites.len(),
        );
        task.setup_prerequisites(prerequisites, ThreadSelector::ANY, false);
        task
    }

    pub(crate) fn build(
        &self,
        payload: Payload,
        thread: ThreadSelector,
        num_prerequisites: usize,
    ) -> Arc<Task> {
        Task::new(
            None,
            payload,
            thread,
            CompletionSignal::new(self.weak()),
            num_prerequisites,
            self.weak(),
        )
    }

    pub(crate) fn num_queued(&self) -> usize {
        self.queued.lock().len()
    }

    pub(crate) fn routed(&self) -> Vec<ThreadSelector> {
        self.routed.lock().clone()
    }

    pub(crate) fn returns(&self) -> Vec<ThreadSelector> {
        self.returns.lock().clone()
    }

    /// Executes the oldest queued task. Returns `false` if there was none.
    pub(crate) fn run_next(&self) -> bool {
        // Never hold the lock while executing, tasks queue more tasks.
        let Some(task) = self.queued.lock().pop_front() else {
            return false;
        };

        let current = ThreadSelector::ANY;
        let mut ready = TaskBuffer::new();
        task.execute(&mut ready, current);

        for task in ready {
            task.queue(current);
        }

        true
    }

    /// Runs queued tasks until none is left, returns how many ran.
    pub(crate) fn run_all(&self) -> usize {
        std::iter::from_fn(|| self.run_next().then_some(())).count()
    }
}

impl Schedule for SpyScheduler {
    fn queue_task(&self, task: Arc<Task>, _current: ThreadSelector) {
        self.routed.lock().push(task.thread());
        self.queued.lock().push_back(task);
    }

    fn current_thread(&self) -> ThreadSelector {
        ThreadSelector::ANY
    }

    fn gather_thread(&self) -> ThreadSelector {
        self.gather_thread
    }

    fn small_wait_set_threshold(&self) -> usize {
        self.small_wait_set_threshold
    }

    fn request_return(&self, thread: ThreadSelector) {
        self.returns.lock().push(thread);
    }

    #[track_caller]
    fn wait_until_complete(&self, signals: &[CompletionSignal], _current: ThreadSelector) {
        while !signals.iter().all(CompletionSignal::is_complete) {
            assert!(self.run_next(), "waiting on signals that can never complete");
        }
    }
}
