use crate::context;
use crate::runtime::Scheduler;
use crate::thread::{ThreadPriority, ThreadSelector};
use crate::utils::thread::set_current_thread_nice;
use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use std::sync::{Arc, Barrier};
use std::thread;
use tracing::{debug, error};

/// Join handles of every pool thread.
#[derive(Debug)]
pub(super) struct ThreadPool {
    handles: Mutex<Vec<(ThreadSelector, thread::JoinHandle<()>)>>,
}

impl ThreadPool {
    /// Spawns one OS thread per pool worker and returns once all of them are
    /// running.
    pub(super) fn new(scheduler: &Arc<Scheduler>) -> Self {
        let workers = ThreadPriority::ALL
            .into_iter()
            .filter_map(|band| scheduler.band(band).map(|b| (band, b.num_workers())))
            .flat_map(|(band, n)| (0..n).map(move |i| (band, i)))
            .collect::<Vec<_>>();

        // Spawning threads is async, the barrier makes `try_build` return with
        // every worker's thread context installed.
        let barrier = Arc::new(Barrier::new(workers.len() + 1));

        let handles = workers
            .into_iter()
            .map(|(band, i)| spawn_worker_thread(Arc::clone(scheduler), band, i, barrier.clone()))
            .collect::<Vec<_>>();

        barrier.wait();

        Self {
            handles: Mutex::new(handles),
        }
    }

    pub(super) fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub(super) fn join_all(&self) -> Result<()> {
        let handles = std::mem::take(&mut *self.handles.lock());

        let errors = handles
            .into_iter()
            .filter_map(|(selector, handle)| handle.join().err().map(|_| selector))
            .collect::<Vec<_>>();

        if errors.is_empty() {
            Ok(())
        } else {
            error!(threads = ?errors, "pool threads panicked");
            Err(anyhow!("{} thread(s) panicked", errors.len()))
        }
    }
}

fn spawn_worker_thread(
    scheduler: Arc<Scheduler>,
    band: ThreadPriority,
    local_index: usize,
    barrier: Arc<Barrier>,
) -> (ThreadSelector, thread::JoinHandle<()>) {
    let cfg = scheduler.cfg();
    let mut builder = thread::Builder::new();

    if let Some(stack_size) = cfg.thread_stack_size {
        builder = builder.stack_size(stack_size);
    }

    let nice = cfg.worker_nice[band.index()];
    let name = (cfg.thread_name.0)();

    let selector = match scheduler.band(band) {
        Some(b) => b.worker(local_index).selector(),
        None => unreachable!("spawning a worker for a disabled band"),
    };

    let handle = builder
        .name(name)
        .spawn(move || {
            context::enter(scheduler.id(), selector);

            if let Some(nice) = nice {
                if let Err(e) = set_current_thread_nice(nice) {
                    debug!(thread = %selector, nice, "could not set worker nice value: {}", e);
                }
            }

            barrier.wait();

            if let Some(b) = scheduler.band(band) {
                b.worker(local_index).run(&scheduler);
            }

            context::exit(scheduler.id());
        })
        .unwrap_or_else(|e| panic!("FATAL: failed to spawn pool thread {selector}: {e}"));

    (selector, handle)
}
