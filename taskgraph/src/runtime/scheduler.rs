use crate::context;
use crate::queue::StallingQueue;
use crate::runtime::named::NamedThread;
use crate::runtime::pool::ThreadPool;
use crate::runtime::spawn::TaskBuilder;
use crate::runtime::worker::PoolWorker;
use crate::runtime::{RuntimeConfig, Schedule};
use crate::sync::Event;
use crate::task::{CompletionSignal, Payload, Task, TaskBuffer};
use crate::thread::{
    NUM_THREAD_PRIORITIES, QueueIndex, TaskPriority, ThreadPriority, ThreadSelector,
};
use anyhow::Result;
use parking_lot::Mutex;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tracing::{debug, info, trace, warn};

type ShutdownCallback = Box<dyn FnOnce() + Send + 'static>;

/// Pool threads of one priority band and the queue they share.
pub(crate) struct WorkerBand {
    queue: StallingQueue<Arc<Task>>,

    workers: Box<[PoolWorker]>,
}

impl WorkerBand {
    fn new(band: ThreadPriority, first_index: u32, num_workers: usize) -> Self {
        let events = (0..num_workers)
            .map(|_| Arc::new(Event::new()))
            .collect::<Vec<_>>();

        let queue = StallingQueue::new(events.clone());

        let workers = events
            .into_iter()
            .enumerate()
            .map(|(i, event)| PoolWorker::new(first_index + i as u32, band, i, event))
            .collect();

        Self { queue, workers }
    }

    pub(crate) fn num_workers(&self) -> usize {
        self.workers.len()
    }

    pub(crate) fn worker(&self, local_index: usize) -> &PoolWorker {
        &self.workers[local_index]
    }
}

/// Owns every worker record and routes tasks between them.
///
/// Obtained through [`Runtime`](crate::Runtime) or a [`Handle`], both of which
/// dereference to it.
pub struct Scheduler {
    /// Distinguishes thread registrations of different schedulers.
    id: u64,

    cfg: RuntimeConfig,

    named: Box<[NamedThread]>,

    /// Indexed by `ThreadPriority::index`, `None` for disabled bands.
    bands: [Option<WorkerBand>; NUM_THREAD_PRIORITIES],

    pool: OnceLock<ThreadPool>,

    shutdown: AtomicBool,

    shutdown_callbacks: Mutex<Vec<ShutdownCallback>>,

    workers_to_ignore: AtomicUsize,

    /// Handed to tasks and signals, which must never keep the scheduler alive.
    me: Weak<Scheduler>,
}

impl Scheduler {
    pub(crate) fn new(cfg: RuntimeConfig) -> Arc<Self> {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);

        let named = (0..cfg.named_threads as u32)
            .map(NamedThread::new)
            .collect::<Box<[_]>>();

        // Pool threads are numbered right after the named ones, band by band.
        let mut next_index = cfg.named_threads as u32;
        let bands = ThreadPriority::ALL.map(|band| {
            if !cfg.has_band(band) {
                return None;
            }

            let record = WorkerBand::new(band, next_index, cfg.workers_per_band);
            next_index += cfg.workers_per_band as u32;
            Some(record)
        });

        Arc::new_cyclic(|me| Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            workers_to_ignore: AtomicUsize::new(cfg.num_worker_threads_to_ignore),
            cfg,
            named,
            bands,
            pool: OnceLock::new(),
            shutdown: AtomicBool::new(false),
            shutdown_callbacks: Mutex::new(Vec::new()),
            me: Weak::clone(me),
        })
    }

    /// Starts the pool threads. Returns once every one of them is running.
    pub(crate) fn spawn_workers(self: &Arc<Self>) {
        if self.bands.iter().all(Option::is_none) {
            return;
        }

        let pool = ThreadPool::new(self);
        debug!(scheduler = self.id, threads = pool.len(), "pool started");

        if self.pool.set(pool).is_err() {
            panic!("FATAL: pool threads spawned twice");
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn cfg(&self) -> &RuntimeConfig {
        &self.cfg
    }

    pub(crate) fn band(&self, band: ThreadPriority) -> Option<&WorkerBand> {
        self.bands[band.index()].as_ref()
    }

    pub(crate) fn weak(&self) -> Weak<dyn Schedule> {
        self.me.clone()
    }

    #[track_caller]
    fn named_thread(&self, thread: ThreadSelector) -> &NamedThread {
        match self.named.get(thread.thread_index() as usize) {
            Some(named) => named,
            None => panic!("FATAL: {thread} is not a named thread of this scheduler"),
        }
    }

    fn pool_worker(&self, thread: ThreadSelector) -> Option<&PoolWorker> {
        self.bands
            .iter()
            .flatten()
            .flat_map(|band| band.workers.iter())
            .find(|w| w.selector().thread_index() == thread.thread_index())
    }

    /// Replaces an unknown (any) current thread by the calling thread's
    /// registration, keeping the requested priorities.
    fn resolve_current(&self, current: ThreadSelector) -> ThreadSelector {
        if !current.is_any() {
            return current;
        }

        let me = context::current_thread(self.id);
        if me.is_any() {
            return current;
        }

        ThreadSelector::encode(
            me.thread_index(),
            current.thread_priority(),
            current.task_priority(),
            QueueIndex::Main,
        )
    }

    fn small_set_complete(&self, signals: &[CompletionSignal]) -> bool {
        signals.len() < self.cfg.small_wait_set_threshold
            && signals.iter().all(CompletionSignal::is_complete)
    }

    /// Runs a task and queues whatever became ready because of it.
    pub(crate) fn execute_task(&self, task: Arc<Task>, current: ThreadSelector) {
        let mut ready = TaskBuffer::new();
        task.execute(&mut ready, current);

        for task in ready {
            task.queue(current);
        }
    }

    /// Next task for a pool worker, stalling while its band queue is empty.
    /// `None` once the scheduler shuts down.
    pub(crate) fn find_work(&self, worker: &PoolWorker) -> Option<Arc<Task>> {
        let band = self.band(worker.band())?;
        band.queue.pop(worker.local_index(), true)
    }

    pub(crate) fn is_worker_ignored(&self, worker: &PoolWorker) -> bool {
        let ignored = self.workers_to_ignore.load(Ordering::Acquire);
        worker.local_index() >= self.cfg.workers_per_band.saturating_sub(ignored)
    }

    fn route(&self, task: Arc<Task>, current: ThreadSelector) {
        let target = task.thread();

        if !target.is_any() {
            let named = self.named_thread(target);
            let me = self.resolve_current(current);
            let priority = target.task_priority();

            trace!(task_id = %task.id(), thread = %target, "queue on named thread");

            if !me.is_any() && me.thread_index() == target.thread_index() {
                named.enqueue_from_this_thread(target.queue_index(), task, priority);
            } else {
                named.enqueue_from_other_thread(target.queue_index(), task, priority);
            }
            return;
        }

        if self.cfg.is_restricted() {
            let named = &self.named[0];
            trace!(task_id = %task.id(), "restricted runtime, queue on named thread 0");

            let me = self.resolve_current(current);
            let priority = target.task_priority();
            if !me.is_any() && me.thread_index() == 0 {
                named.enqueue_from_this_thread(QueueIndex::Main, task, priority);
            } else {
                named.enqueue_from_other_thread(QueueIndex::Main, task, priority);
            }
            return;
        }

        let (band, priority) = match target.thread_priority() {
            ThreadPriority::Background if !self.cfg.has_band(ThreadPriority::Background) => {
                (ThreadPriority::Normal, TaskPriority::Normal)
            }
            ThreadPriority::High if !self.cfg.has_band(ThreadPriority::High) => {
                (ThreadPriority::Normal, TaskPriority::High)
            }
            band => (band, target.task_priority()),
        };

        let Some(record) = self.band(band) else {
            unreachable!("normal band is always enabled outside restricted mode");
        };

        trace!(task_id = %task.id(), band = band.as_str(), ?priority, "queue on pool");

        if let Some(consumer) = record.queue.push(task, priority) {
            record.queue.wake(consumer);
        }
    }

    /// Creates a signal that isn't tied to a task. It completes when
    /// [`CompletionSignal::dispatch_subsequents`] is called.
    pub fn new_signal(&self) -> CompletionSignal {
        CompletionSignal::standalone(self.weak())
    }

    /// Starts building a task running `f`. By default the task runs on any
    /// normal band pool thread and has no prerequisite.
    pub fn task<F>(&self, f: F) -> TaskBuilder<'_>
    where
        F: FnOnce(ThreadSelector, &CompletionSignal) + Send + 'static,
    {
        TaskBuilder::new(self, Box::new(f))
    }

    /// Runs `f` on any pool thread.
    pub fn spawn<F>(&self, f: F) -> CompletionSignal
    where
        F: FnOnce() + Send + 'static,
    {
        self.task(move |_, _| f()).dispatch()
    }

    /// Runs `f` on `target`. `current` is the calling thread, if known.
    pub fn submit<F>(&self, f: F, target: ThreadSelector, current: ThreadSelector) -> CompletionSignal
    where
        F: FnOnce(ThreadSelector, &CompletionSignal) + Send + 'static,
    {
        self.task(f).on(target).current_thread(current).dispatch()
    }

    pub(crate) fn new_task(
        &self,
        name: Option<&'static str>,
        payload: Payload,
        thread: ThreadSelector,
        num_prerequisites: usize,
    ) -> Arc<Task> {
        Task::new(
            name,
            payload,
            thread,
            CompletionSignal::new(self.weak()),
            num_prerequisites,
            self.weak(),
        )
    }

    #[track_caller]
    pub(crate) fn check_target(&self, thread: ThreadSelector) {
        assert!(
            thread.is_any() || (thread.thread_index() as usize) < self.named.len(),
            "{thread} is neither any pool thread nor a named thread"
        );
    }

    /// Blocks until every signal completed.
    ///
    /// A named thread keeps running the tasks of the sub-queue `current`
    /// designates while it waits, so waiting from inside one of its own tasks
    /// must go through [`QueueIndex::Local`]. Other threads block on an event.
    #[track_caller]
    pub fn wait_until_complete(&self, signals: &[CompletionSignal], current: ThreadSelector) {
        if self.small_set_complete(signals) {
            return;
        }

        let current = self.resolve_current(current);

        if let Some(named) = self.named.get(current.thread_index() as usize) {
            let q = current.queue_index();

            assert!(
                !(self.cfg.is_restricted()
                    && current.thread_index() == 0
                    && named.is_processing(QueueIndex::Main)),
                "FATAL: recursive wait on named thread 0 of a restricted runtime"
            );

            if !named.is_processing(q) {
                let target = named.selector().with_queue(q);
                let ret = self.new_task(Some("return"), Payload::Return, target, signals.len());
                ret.setup_prerequisites(signals, current, true);

                named.pump_until_quit(q, self);
                return;
            }
        }

        let event = Arc::new(Event::new());
        self.notify_on_complete(&event, signals, current, self.cfg.trigger_thread);

        while !event.wait_timeout(self.cfg.wait_warn_interval) {
            warn!(
                thread = %current,
                pending = signals.iter().filter(|s| !s.is_complete()).count(),
                "still waiting for tasks to complete"
            );
        }
    }

    /// Triggers `event` once every signal completed. The trigger runs on
    /// `trigger_thread`, unless all signals are already complete.
    pub fn notify_on_complete(
        &self,
        event: &Arc<Event>,
        signals: &[CompletionSignal],
        current: ThreadSelector,
        trigger_thread: ThreadSelector,
    ) {
        if self.small_set_complete(signals) {
            event.trigger();
            return;
        }

        self.check_target(trigger_thread);

        let task = self.new_task(
            Some("trigger"),
            Payload::TriggerEvent(Arc::clone(event)),
            trigger_thread,
            signals.len(),
        );
        task.setup_prerequisites(signals, current, true);
    }

    /// Binds the calling OS thread to the named thread `thread`. Tasks it
    /// queues to itself then skip the wake-up path, and waits it performs pump
    /// its queue.
    ///
    /// # Panics
    ///
    /// Panics if another OS thread already attached as `thread`.
    #[track_caller]
    pub fn attach_named_thread(&self, thread: ThreadSelector) {
        let named = self.named_thread(thread);
        named.attach();

        context::enter(self.id, named.selector());
        debug!(scheduler = self.id, thread = %named.selector(), "named thread attached");
    }

    /// Runs the tasks queued on a named sub-queue until it is empty, without
    /// blocking. Returns how many ran.
    #[track_caller]
    pub fn pump_until_idle(&self, thread: ThreadSelector) -> usize {
        self.named_thread(thread)
            .pump_until_idle(thread.queue_index(), self)
    }

    /// Runs the tasks queued on a named sub-queue, blocking when idle, until
    /// [`Scheduler::request_return`] or shutdown.
    #[track_caller]
    pub fn pump_until_quit(&self, thread: ThreadSelector) {
        self.named_thread(thread)
            .pump_until_quit(thread.queue_index(), self);
    }

    #[track_caller]
    pub fn request_return(&self, thread: ThreadSelector) {
        self.named_thread(thread).request_return(thread.queue_index());
    }

    /// Registers `f` to run at the start of shutdown, before any thread is
    /// stopped.
    pub fn register_shutdown_callback<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shutdown_callbacks.lock().push(Box::new(f));
    }

    /// Selector of the calling thread, [`ThreadSelector::ANY`] for threads
    /// unknown to this scheduler.
    pub fn current_thread(&self) -> ThreadSelector {
        context::current_thread(self.id)
    }

    /// Whether the thread is running tasks right now. For a named thread this
    /// means it pumps the sub-queue `thread` designates.
    pub fn is_thread_processing_tasks(&self, thread: ThreadSelector) -> bool {
        if thread.is_any() {
            return false;
        }

        if let Some(named) = self.named.get(thread.thread_index() as usize) {
            return named.is_processing(thread.queue_index());
        }

        self.pool_worker(thread)
            .is_some_and(PoolWorker::is_processing)
    }

    /// Active pool threads per band.
    pub fn num_worker_threads(&self) -> usize {
        self.cfg
            .workers_per_band
            .saturating_sub(self.num_worker_threads_to_ignore())
    }

    pub fn num_named_threads(&self) -> usize {
        self.named.len()
    }

    pub fn has_band(&self, band: ThreadPriority) -> bool {
        self.cfg.has_band(band)
    }

    /// Parks the last `n` pool threads of every band, at most all but one.
    /// Parked threads finish the task at hand first. Returns the count
    /// actually applied.
    pub fn set_num_worker_threads_to_ignore(&self, n: usize) -> usize {
        let n = n.min(self.cfg.workers_per_band.saturating_sub(1));
        let prev = self.workers_to_ignore.swap(n, Ordering::AcqRel);

        info!(scheduler = self.id, ignored = n, "worker threads to ignore");

        if n < prev {
            let per_band = self.cfg.workers_per_band;
            for band in self.bands.iter().flatten() {
                for worker in &band.workers[per_band - prev..per_band - n] {
                    worker.event().trigger();
                }
            }
        }

        n
    }

    pub fn num_worker_threads_to_ignore(&self) -> usize {
        self.workers_to_ignore.load(Ordering::Acquire)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Stops every thread and drops the tasks still queued. Idempotent.
    ///
    /// Must not be called from a pool thread, and tasks should no longer be
    /// submitted once it started.
    pub(crate) fn shutdown(&self) -> Result<()> {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        info!(scheduler = self.id, "shutting down");

        let callbacks = std::mem::take(&mut *self.shutdown_callbacks.lock());
        for callback in callbacks {
            callback();
        }

        for named in self.named.iter() {
            named.request_quit_shutdown();
        }

        for band in self.bands.iter().flatten() {
            band.queue.shutdown();
        }

        let joined = match self.pool.get() {
            Some(pool) => pool.join_all(),
            None => Ok(()),
        };

        let dropped = self.named.iter().map(NamedThread::drain).sum::<usize>()
            + self
                .bands
                .iter()
                .flatten()
                .map(|band| band.queue.drain())
                .sum::<usize>();

        if dropped > 0 {
            warn!(scheduler = self.id, dropped, "dropped queued tasks at shutdown");
        }

        joined
    }
}

impl Schedule for Scheduler {
    fn queue_task(&self, task: Arc<Task>, current: ThreadSelector) {
        self.route(task, current);
    }

    fn current_thread(&self) -> ThreadSelector {
        Scheduler::current_thread(self)
    }

    fn gather_thread(&self) -> ThreadSelector {
        self.cfg.gather_thread
    }

    fn small_wait_set_threshold(&self) -> usize {
        self.cfg.small_wait_set_threshold
    }

    fn request_return(&self, thread: ThreadSelector) {
        Scheduler::request_return(self, thread);
    }

    fn wait_until_complete(&self, signals: &[CompletionSignal], current: ThreadSelector) {
        Scheduler::wait_until_complete(self, signals, current);
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("id", &self.id)
            .field("kind", &self.cfg.kind)
            .field("named", &self.named)
            .field("workers_per_band", &self.cfg.workers_per_band)
            .field("bands", &self.cfg.bands)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// Cheaply cloneable reference to a [`Scheduler`].
#[derive(Debug, Clone)]
pub struct Handle(Arc<Scheduler>);

impl Handle {
    pub(crate) fn new(scheduler: Arc<Scheduler>) -> Self {
        Handle(scheduler)
    }

    #[cfg(test)]
    pub(crate) fn downgrade(&self) -> Weak<Scheduler> {
        Arc::downgrade(&self.0)
    }
}

impl Deref for Handle {
    type Target = Scheduler;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
