use crate::task::{CompletionSignal, Task};
use crate::thread::ThreadSelector;
use std::fmt;
use std::sync::Arc;

// Public API
pub mod runtime;
pub use runtime::{Builder, Runtime};

mod error;
pub use error::ConfigError;

mod scheduler;
pub use scheduler::{Handle, Scheduler};

pub mod spawn;
pub use spawn::{HeldTask, TaskBuilder};

// Exports
pub(crate) use runtime::{RuntimeConfig, SPILL_TO_HEAP_THRESHOLD};

mod named;

mod pool;

mod worker;


/// What tasks and completion signals need from the scheduler that owns them.
///
/// Both only keep a `Weak<dyn Schedule>`, so queued work never keeps a
/// scheduler alive past shutdown.
pub(crate) trait Schedule: Send + Sync + fmt::Debug + 'static {
    /// Routes a ready task to the queue its selector designates.
    fn queue_task(&self, task: Arc<Task>, current: ThreadSelector);

    /// Selector of the calling thread, [`ThreadSelector::ANY`] if unknown.
    fn current_thread(&self) -> ThreadSelector;

    /// Where prerequisite gather tasks run.
    fn gather_thread(&self) -> ThreadSelector;

    /// Below this many signals, an all-complete set is handled inline without
    /// creating a helper task.
    fn small_wait_set_threshold(&self) -> usize;

    /// Makes the pump of the given named sub-queue return.
    fn request_return(&self, thread: ThreadSelector);

    fn wait_until_complete(&self, signals: &[CompletionSignal], current: ThreadSelector);
}
