use crate::queue::MAX_CONSUMERS;
use crate::runtime::{ConfigError, Handle, Scheduler};
use crate::thread::{
    ANY_THREAD_INDEX, NUM_THREAD_PRIORITIES, TaskPriority, ThreadPriority, ThreadSelector,
};
use anyhow::Result;
use std::convert::TryFrom;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, error};

// Used wherever we rely on SmallVec to store entries on stack first. Most tasks
// release a handful of subsequents at most.
pub(crate) const SPILL_TO_HEAP_THRESHOLD: usize = 16;

/// Below this many signals, waiting on an all-complete set skips the helper task.
const SMALL_WAIT_SET_THRESHOLD: usize = 8;

/// How long a blocked waiter sleeps before logging that it is still waiting.
const WAIT_WARN_INTERVAL: Duration = Duration::from_secs(10);

/// Sleep slice of a worker parked by `num_worker_threads_to_ignore`.
const TUNING_STALL_INTERVAL: Duration = Duration::from_millis(100);

/// Background workers yield the CPU to everything else by default.
const BACKGROUND_NICE: i32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    /// Pool threads per enabled band plus externally driven named threads.
    MultiThread,

    /// No pool threads at all. Any-worker tasks run on named thread 0.
    Restricted,
}

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn() -> String + Send + Sync + 'static>);

fn default_thread_name_fn() -> ThreadNameFn {
    let worker_count = Arc::new(AtomicUsize::new(0));

    ThreadNameFn(Arc::new(move || {
        let id = worker_count.fetch_add(1, Ordering::Relaxed);
        format!("taskgraph-{}", id)
    }))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

#[derive(Debug)]
pub struct Builder {
    /// Runtime type
    kind: Kind,

    /// Pool threads per enabled band. Defaults to one per core, minus the
    /// named threads.
    worker_threads: Option<usize>,

    /// Threads owned by the host and attached with
    /// [`Handle::attach_named_thread`].
    named_threads: usize,

    high_priority_band: bool,

    background_band: bool,

    /// Name fn used for threads spawned by the runtime.
    thread_name: ThreadNameFn,

    /// Stack size used for threads spawned by the runtime.
    thread_stack_size: Option<usize>,

    /// Nice value applied to the pool threads of each band.
    worker_nice: [Option<i32>; NUM_THREAD_PRIORITIES],

    small_wait_set_threshold: usize,

    gather_thread: ThreadSelector,

    trigger_thread: ThreadSelector,

    wait_warn_interval: Duration,

    tuning_stall_interval: Duration,

    num_worker_threads_to_ignore: usize,
}

impl Builder {
    fn new(kind: Kind) -> Self {
        let mut worker_nice = [None; NUM_THREAD_PRIORITIES];
        worker_nice[ThreadPriority::Background.index()] = Some(BACKGROUND_NICE);

        let helper = ThreadSelector::any(ThreadPriority::High, TaskPriority::High);

        Self {
            kind,
            worker_threads: None,
            named_threads: 1,
            high_priority_band: false,
            background_band: false,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            worker_nice,
            small_wait_set_threshold: SMALL_WAIT_SET_THRESHOLD,
            gather_thread: helper,
            trigger_thread: helper,
            wait_warn_interval: WAIT_WARN_INTERVAL,
            tuning_stall_interval: TUNING_STALL_INTERVAL,
            num_worker_threads_to_ignore: 0,
        }
    }

    /// Returns a new builder for a runtime with a pool of worker threads.
    ///
    /// Configuration methods can be chained on the return value.
    pub fn new_multi_thread() -> Builder {
        Builder::new(Kind::MultiThread)
    }

    /// Returns a new builder for a runtime without any pool thread. Every
    /// task meant for "any worker" runs on named thread 0 instead, which has
    /// to pump its queue.
    pub fn new_restricted() -> Builder {
        Builder::new(Kind::Restricted)
    }

    /// The number of pool threads in each enabled band.
    ///
    /// Defaults to one per CPU core minus the named threads, at least 1.
    /// Ignored by restricted runtimes.
    #[track_caller]
    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "worker_threads must be greater than 0");
        self.worker_threads = Some(val);
        self
    }

    /// Number of named threads. Named thread `0` is usually the thread that
    /// built the runtime. Defaults to 1.
    pub fn named_threads(mut self, val: usize) -> Self {
        self.named_threads = val;
        self
    }

    /// Runs a second band of pool threads for [`ThreadPriority::High`] work.
    /// When disabled, such work is demoted to the normal band with a high task
    /// priority.
    pub fn enable_high_priority_band(mut self, enable: bool) -> Self {
        self.high_priority_band = enable;
        self
    }

    /// Runs a band of low priority pool threads for
    /// [`ThreadPriority::Background`] work. When disabled, such work runs on
    /// the normal band.
    pub fn enable_background_band(mut self, enable: bool) -> Self {
        self.background_band = enable;
        self
    }

    /// Sets name of threads spawned by the `Runtime`'s thread pool.
    ///
    /// The default name is "taskgraph-{id}", where id is monotonically
    /// increasing.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move || val.clone()));
        self
    }

    /// Sets a function used to generate the name of threads spawned by the
    /// `Runtime`'s thread pool.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets the stack size (in bytes) for pool threads.
    ///
    /// The actual stack size may be greater than this value if the platform
    /// specifies minimal stack size.
    #[track_caller]
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        assert!(
            val.is_power_of_two(),
            "thread_stack_size must be a power of two"
        );
        self.thread_stack_size = Some(val);
        self
    }

    /// Nice value of the pool threads in `band`. Background threads default
    /// to 10, the others inherit the nice value of the building thread.
    ///
    /// Applied on a best effort basis, raising priority usually requires
    /// privileges.
    #[track_caller]
    pub fn worker_nice(mut self, band: ThreadPriority, nice: i32) -> Self {
        assert!((-20..=19).contains(&nice), "nice must be within -20..=19");
        self.worker_nice[band.index()] = Some(nice);
        self
    }

    /// Waits on fewer signals than this, all already complete, are resolved
    /// inline instead of through a helper task. Defaults to 8.
    pub fn small_wait_set_threshold(mut self, val: usize) -> Self {
        self.small_wait_set_threshold = val;
        self
    }

    /// Thread that runs the helper tasks gathering deferred prerequisites.
    pub fn gather_thread(mut self, thread: ThreadSelector) -> Self {
        self.gather_thread = thread;
        self
    }

    /// Thread that runs the helper tasks triggering the events of blocked
    /// waiters.
    pub fn trigger_thread(mut self, thread: ThreadSelector) -> Self {
        self.trigger_thread = thread;
        self
    }

    /// How long a thread blocked in a wait sleeps between warnings.
    #[track_caller]
    pub fn wait_warn_interval(mut self, val: Duration) -> Self {
        assert!(!val.is_zero(), "wait_warn_interval must be greater than 0");
        self.wait_warn_interval = val;
        self
    }

    /// Sleep slice of a pool thread parked by
    /// [`Builder::num_worker_threads_to_ignore`].
    #[track_caller]
    pub fn tuning_stall_interval(mut self, val: Duration) -> Self {
        assert!(!val.is_zero(), "tuning_stall_interval must be greater than 0");
        self.tuning_stall_interval = val;
        self
    }

    /// Parks the last `val` pool threads of each band. Can be changed later
    /// with [`Handle::set_num_worker_threads_to_ignore`].
    pub fn num_worker_threads_to_ignore(mut self, val: usize) -> Self {
        self.num_worker_threads_to_ignore = val;
        self
    }

    /// Creates the configured `Runtime`.
    ///
    /// Pool threads are started and waiting for work when this returns. Named
    /// threads still have to attach themselves.
    pub fn try_build(self) -> Result<Runtime> {
        let cfg = RuntimeConfig::try_from(self)?;

        debug!(
            kind = ?cfg.kind,
            workers_per_band = cfg.workers_per_band,
            named = cfg.named_threads,
            "building runtime"
        );

        let scheduler = Scheduler::new(cfg);
        scheduler.spawn_workers();

        Ok(Runtime::new(Handle::new(scheduler)))
    }
}

/// Owns a scheduler and shuts it down when dropped.
///
/// Dereferences to its [`Handle`], which exposes the whole scheduling API and
/// can be cloned to share the scheduler with other threads.
#[derive(Debug)]
pub struct Runtime {
    handle: Handle,
}

impl Runtime {
    pub(super) fn new(handle: Handle) -> Runtime {
        Runtime { handle }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Shuts the runtime down.
    ///
    /// Runs the shutdown callbacks, stops every pump and pool thread, then
    /// drops the tasks still queued without running them. Blocks until all
    /// pool threads exited.
    pub fn shutdown(self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&self) {
        if let Err(e) = self.handle.shutdown() {
            error!("error during runtime shutdown: {:?}", e);
        }
    }
}

impl Deref for Runtime {
    type Target = Handle;

    fn deref(&self) -> &Handle {
        &self.handle
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

// Export runtime builder as a RuntimeConfig object owned by the scheduler.
#[derive(Debug, Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) kind: Kind,
    pub(crate) workers_per_band: usize,
    pub(crate) named_threads: usize,
    pub(crate) bands: [bool; NUM_THREAD_PRIORITIES],
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
    pub(crate) worker_nice: [Option<i32>; NUM_THREAD_PRIORITIES],
    pub(crate) small_wait_set_threshold: usize,
    pub(crate) gather_thread: ThreadSelector,
    pub(crate) trigger_thread: ThreadSelector,
    pub(crate) wait_warn_interval: Duration,
    pub(crate) tuning_stall_interval: Duration,
    pub(crate) num_worker_threads_to_ignore: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let builder = Builder::new(Kind::MultiThread);

        RuntimeConfig {
            kind: builder.kind,
            workers_per_band: 1,
            named_threads: builder.named_threads,
            bands: [true, false, false],
            thread_name: builder.thread_name,
            thread_stack_size: None,
            worker_nice: builder.worker_nice,
            small_wait_set_threshold: builder.small_wait_set_threshold,
            gather_thread: builder.gather_thread,
            trigger_thread: builder.trigger_thread,
            wait_warn_interval: builder.wait_warn_interval,
            tuning_stall_interval: builder.tuning_stall_interval,
            num_worker_threads_to_ignore: 0,
        }
    }
}

impl RuntimeConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        match self.kind {
            Kind::Restricted if self.named_threads == 0 => {
                return Err(ConfigError::NoNamedThreads);
            }
            Kind::MultiThread if self.workers_per_band == 0 => {
                return Err(ConfigError::NoWorkerThreads);
            }
            _ => {}
        }

        if self.workers_per_band > MAX_CONSUMERS {
            return Err(ConfigError::TooManyWorkerThreads {
                requested: self.workers_per_band,
                max: MAX_CONSUMERS,
            });
        }

        let required = self.num_threads();
        if required > ANY_THREAD_INDEX as usize {
            return Err(ConfigError::ThreadIndexSpaceExhausted {
                required,
                available: ANY_THREAD_INDEX as usize,
            });
        }

        if self.workers_per_band > 0 && self.num_worker_threads_to_ignore >= self.workers_per_band
        {
            return Err(ConfigError::IgnoringAllWorkers {
                ignored: self.num_worker_threads_to_ignore,
                per_band: self.workers_per_band,
            });
        }

        for (role, thread) in [
            ("gather", self.gather_thread),
            ("trigger", self.trigger_thread),
        ] {
            if !thread.is_any() && thread.thread_index() as usize >= self.named_threads {
                return Err(ConfigError::UnknownThread { role, thread });
            }
        }

        Ok(())
    }

    pub(crate) fn is_restricted(&self) -> bool {
        matches!(self.kind, Kind::Restricted)
    }

    pub(crate) fn num_bands(&self) -> usize {
        self.bands.iter().filter(|enabled| **enabled).count()
    }

    /// Named threads plus every pool thread.
    pub(crate) fn num_threads(&self) -> usize {
        self.named_threads + self.workers_per_band * self.num_bands()
    }

    pub(crate) fn has_band(&self, band: ThreadPriority) -> bool {
        self.bands[band.index()]
    }
}

impl TryFrom<Builder> for RuntimeConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let (workers_per_band, bands) = match builder.kind {
            Kind::Restricted => (0, [false; NUM_THREAD_PRIORITIES]),
            Kind::MultiThread => {
                let workers_per_band = match builder.worker_threads {
                    Some(n) => n,
                    None => thread::available_parallelism()?
                        .get()
                        .saturating_sub(builder.named_threads)
                        .max(1),
                };

                let mut bands = [false; NUM_THREAD_PRIORITIES];
                bands[ThreadPriority::Normal.index()] = true;
                bands[ThreadPriority::High.index()] = builder.high_priority_band;
                bands[ThreadPriority::Background.index()] = builder.background_band;

                (workers_per_band, bands)
            }
        };

        let cfg = RuntimeConfig {
            kind: builder.kind,
            workers_per_band,
            named_threads: builder.named_threads,
            bands,
            thread_name: builder.thread_name,
            thread_stack_size: builder.thread_stack_size,
            worker_nice: builder.worker_nice,
            small_wait_set_threshold: builder.small_wait_set_threshold,
            gather_thread: builder.gather_thread,
            trigger_thread: builder.trigger_thread,
            wait_warn_interval: builder.wait_warn_interval,
            tuning_stall_interval: builder.tuning_stall_interval,
            num_worker_threads_to_ignore: builder.num_worker_threads_to_ignore,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}
