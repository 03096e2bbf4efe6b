//! Thread-local view of "where am I running".
//!
//! Every thread known to a scheduler (pool workers, attached named threads)
//! records its selector here, keyed by the scheduler id so a thread that
//! outlives one scheduler and gets attached to another never reports a stale
//! identity.

use crate::task::Id;
use crate::thread::ThreadSelector;
use std::cell::Cell;
use std::thread_local;

#[derive(Debug, Clone, Copy)]
struct ThreadContext {
    scheduler_id: u64,
    selector: ThreadSelector,
}

thread_local! {
    static CURRENT_THREAD: Cell<Option<ThreadContext>> = const { Cell::new(None) };

    static CURRENT_TASK_ID: Cell<Option<Id>> = const { Cell::new(None) };
}

/// Records the calling thread as `selector` of scheduler `scheduler_id`.
/// Returns the previous registration, if any.
pub(crate) fn enter(scheduler_id: u64, selector: ThreadSelector) -> Option<(u64, ThreadSelector)> {
    let prev = CURRENT_THREAD.replace(Some(ThreadContext {
        scheduler_id,
        selector: selector.thread_only(),
    }));

    prev.map(|ctx| (ctx.scheduler_id, ctx.selector))
}

/// Forgets the calling thread's registration if it belongs to `scheduler_id`.
pub(crate) fn exit(scheduler_id: u64) {
    CURRENT_THREAD.with(|cell| {
        if matches!(cell.get(), Some(ctx) if ctx.scheduler_id == scheduler_id) {
            cell.set(None);
        }
    });
}

/// Selector (thread index only) of the calling thread for `scheduler_id`, or
/// [`ThreadSelector::ANY`] when the thread is unknown to that scheduler.
pub(crate) fn current_thread(scheduler_id: u64) -> ThreadSelector {
    match CURRENT_THREAD.get() {
        Some(ctx) if ctx.scheduler_id == scheduler_id => ctx.selector,
        _ => ThreadSelector::ANY.thread_only(),
    }
}

pub(crate) fn current_task_id() -> Option<Id> {
    CURRENT_TASK_ID.get()
}

pub(crate) fn set_current_task_id(id: Option<Id>) -> Option<Id> {
    CURRENT_TASK_ID.replace(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_keyed_by_scheduler() {
        thread::spawn(|| {
            assert!(current_thread(1).is_any());

            assert_eq!(enter(1, ThreadSelector::named(2)), None);
            assert_eq!(current_thread(1), ThreadSelector::named(2).thread_only());
            assert!(current_thread(7).is_any());

            // Exiting another scheduler is a no-op.
            exit(7);
            assert_eq!(current_thread(1).thread_index(), 2);

            let prev = enter(7, ThreadSelector::named(0));
            assert_eq!(prev.map(|(id, _)| id), Some(1));
            assert!(current_thread(1).is_any());

            exit(7);
            assert!(current_thread(7).is_any());
        })
        .join()
        .unwrap();
    }
}
