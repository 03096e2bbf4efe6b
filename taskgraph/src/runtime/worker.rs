use crate::runtime::Scheduler;
use crate::sync::Event;
use crate::thread::{QueueIndex, TaskPriority, ThreadPriority, ThreadSelector};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace};

/// Worker record of a pool thread.
///
/// Pool workers have no queue of their own. They all pop from the queue of
/// their band, each through its own consumer slot.
#[derive(Debug)]
pub(crate) struct PoolWorker {
    selector: ThreadSelector,

    band: ThreadPriority,

    /// Consumer slot in the band queue.
    local_index: usize,

    /// Shared with the band queue, which triggers it to end a stall.
    event: Arc<Event>,

    processing: AtomicBool,
}

impl PoolWorker {
    pub(crate) fn new(
        thread_index: u32,
        band: ThreadPriority,
        local_index: usize,
        event: Arc<Event>,
    ) -> Self {
        Self {
            selector: ThreadSelector::encode(
                thread_index,
                band,
                TaskPriority::Normal,
                QueueIndex::Main,
            ),
            band,
            local_index,
            event,
            processing: AtomicBool::new(false),
        }
    }

    pub(crate) fn selector(&self) -> ThreadSelector {
        self.selector
    }

    pub(crate) fn band(&self) -> ThreadPriority {
        self.band
    }

    pub(crate) fn local_index(&self) -> usize {
        self.local_index
    }

    pub(crate) fn event(&self) -> &Arc<Event> {
        &self.event
    }

    pub(crate) fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// Worker thread main loop. Returns once the scheduler shuts down.
    pub(crate) fn run(&self, scheduler: &Scheduler) {
        debug!(thread = %self.selector, "pool worker started");

        while !scheduler.is_shutdown() {
            if scheduler.is_worker_ignored(self) {
                trace!(thread = %self.selector, "tuning stall");
                self.event.wait_timeout(scheduler.cfg().tuning_stall_interval);
                continue;
            }

            let Some(task) = scheduler.find_work(self) else {
                continue;
            };

            self.processing.store(true, Ordering::Release);
            scheduler.execute_task(task, self.selector);
            self.processing.store(false, Ordering::Release);
        }

        debug!(thread = %self.selector, "pool worker exiting");
    }
}
