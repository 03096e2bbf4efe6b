use super::*;
use crate::runtime::Schedule;
use crate::sync::Event;
use crate::test_utils::SpyScheduler;
use crate::thread::{QueueIndex, ThreadSelector};
use parking_lot::Mutex;
use static_assertions::assert_impl_all;
use std::sync::Arc;
use std::time::Duration;

assert_impl_all!(Task: Send, Sync);
assert_impl_all!(CompletionSignal: Send, Sync, Clone);

fn noop(_: ThreadSelector, _: &CompletionSignal) {}

#[test]
fn test_subsequents_released_in_registration_order() {
    let spy = SpyScheduler::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    let first = spy.dispatch(ThreadSelector::ANY, &[], noop);
    assert_eq!(spy.num_queued(), 1);

    for i in 0..5 {
        let order = Arc::clone(&order);
        spy.dispatch(ThreadSelector::ANY, &[first.signal().clone()], move |_, _| {
            order.lock().push(i)
        });
    }

    // Only `first` is runnable until it completes.
    assert_eq!(spy.num_queued(), 1);
    assert_eq!(spy.run_all(), 6);

    assert_eq!(*order.lock(), [0, 1, 2, 3, 4]);
    assert!(first.signal().is_complete());
    assert_eq!(first.stage(), Stage::Finished);
}

#[test]
fn test_waits_for_every_prerequisite() {
    let spy = SpyScheduler::new();
    let a = spy.new_signal();
    let b = spy.new_signal();

    let task = spy.dispatch(ThreadSelector::ANY, &[a.clone(), b.clone()], noop);
    assert_eq!(task.stage(), Stage::Created);

    a.dispatch_subsequents();
    assert_eq!(spy.num_queued(), 0);

    b.dispatch_subsequents();
    assert_eq!(spy.num_queued(), 1);
    assert_eq!(task.stage(), Stage::Queued);
}

#[test]
fn test_completed_prerequisite_resolves_immediately() {
    let spy = SpyScheduler::new();
    let done = spy.new_signal();
    done.dispatch_subsequents();

    spy.dispatch(ThreadSelector::ANY, &[done], noop);
    assert_eq!(spy.num_queued(), 1);
}

#[test]
fn test_completed_signal_rejects_subsequents() {
    let spy = SpyScheduler::new();
    let signal = spy.new_signal();

    assert_eq!(signal.state(), SignalState::Open);
    signal.dispatch_subsequents();
    assert_eq!(signal.state(), SignalState::Complete);

    let late = spy.build(Payload::Null, ThreadSelector::ANY, 1);
    assert!(!signal.add_subsequent(Arc::clone(&late)));

    // Rejected tasks are handed back, not kept alive by the signal.
    assert_eq!(Arc::strong_count(&late), 1);
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "prerequisite added to a completed signal")]
fn test_dont_complete_until_after_completion_panics() {
    let spy = SpyScheduler::new();
    let signal = spy.new_signal();
    let other = spy.new_signal();

    signal.dispatch_subsequents();
    signal.dont_complete_until(&other);
}

#[test]
#[should_panic(expected = "task-owned signal")]
fn test_dispatch_task_signal_panics() {
    let spy = SpyScheduler::new();
    let task = spy.dispatch(ThreadSelector::ANY, &[], noop);

    task.signal().dispatch_subsequents();
}

#[test]
#[should_panic(expected = "dispatched twice")]
fn test_dispatch_twice_panics() {
    let spy = SpyScheduler::new();
    let signal = spy.new_signal();

    signal.dispatch_subsequents();
    signal.dispatch_subsequents();
}

#[test]
fn test_dont_complete_until_defers_completion() {
    let spy = SpyScheduler::new();
    let external = spy.new_signal();

    let held_open = {
        let external = external.clone();
        spy.dispatch(ThreadSelector::ANY, &[], move |_, signal| {
            signal.dont_complete_until(&external)
        })
    };

    let ran_after = Arc::new(Mutex::new(false));
    {
        let ran_after = Arc::clone(&ran_after);
        spy.dispatch(
            ThreadSelector::ANY,
            &[held_open.signal().clone()],
            move |_, _| *ran_after.lock() = true,
        );
    }

    assert_eq!(spy.run_all(), 1);
    assert_eq!(held_open.stage(), Stage::Finished);
    assert_eq!(held_open.signal().state(), SignalState::Completing);
    assert!(!*ran_after.lock());

    // The gather task is parked on `external`, nothing is runnable.
    assert_eq!(spy.num_queued(), 0);

    external.dispatch_subsequents();
    assert_eq!(spy.routed().last(), Some(&spy.gather_thread()));

    // Gather task, then the subsequent.
    assert_eq!(spy.run_all(), 2);
    assert!(held_open.signal().is_complete());
    assert!(*ran_after.lock());
}

#[test]
fn test_small_set_fast_path_skips_gather() {
    let spy = SpyScheduler::new();

    let task = spy.dispatch(ThreadSelector::ANY, &[], {
        let spy = Arc::clone(&spy);
        move |_, signal| {
            let inner = spy.new_signal();
            signal.dont_complete_until(&inner);
            inner.dispatch_subsequents();
        }
    });

    assert_eq!(spy.run_all(), 1);
    assert!(task.signal().is_complete());
    assert_eq!(spy.routed().len(), 1);
}

#[test]
fn test_zero_threshold_always_gathers() {
    let spy = SpyScheduler::with_threshold(0);

    let task = spy.dispatch(ThreadSelector::ANY, &[], {
        let spy = Arc::clone(&spy);
        move |_, signal| {
            let inner = spy.new_signal();
            signal.dont_complete_until(&inner);
            inner.dispatch_subsequents();
        }
    });

    assert!(spy.run_next());
    assert_eq!(task.signal().state(), SignalState::Completing);
    assert_eq!(spy.num_queued(), 1);

    assert_eq!(spy.run_all(), 1);
    assert!(task.signal().is_complete());
}

#[test]
fn test_dont_complete_until_completed_signal_is_noop() {
    let spy = SpyScheduler::new();
    let done = spy.new_signal();
    done.dispatch_subsequents();

    let task = spy.dispatch(ThreadSelector::ANY, &[], move |_, signal| {
        signal.dont_complete_until(&done)
    });

    assert_eq!(spy.run_all(), 1);
    assert!(task.signal().is_complete());
}

#[test]
#[should_panic(expected = "queued twice")]
fn test_queue_twice_panics() {
    let spy = SpyScheduler::new();
    let task = spy.dispatch(ThreadSelector::ANY, &[], noop);

    task.queue(ThreadSelector::ANY);
}

#[test]
fn test_panicking_payload_still_completes() {
    crate::test_utils::init_tracing();

    let spy = SpyScheduler::new();
    let boom = spy.dispatch(ThreadSelector::ANY, &[], |_, _| panic!("boom"));

    let after = spy.dispatch(ThreadSelector::ANY, &[boom.signal().clone()], noop);

    assert_eq!(spy.run_all(), 2);
    assert!(boom.signal().is_complete());
    assert!(after.signal().is_complete());
}

#[test]
fn test_return_payload_targets_own_queue() {
    let spy = SpyScheduler::new();
    let local = ThreadSelector::named(1).with_queue(QueueIndex::Local);

    let task = spy.build(Payload::Return, local, 0);
    task.setup_prerequisites(&[], ThreadSelector::ANY, true);

    assert_eq!(spy.run_all(), 1);
    assert_eq!(spy.returns(), [local]);
}

#[test]
fn test_trigger_event_payload() {
    let spy = SpyScheduler::new();
    let event = Arc::new(Event::new());
    let gate = spy.new_signal();

    let task = spy.build(Payload::TriggerEvent(Arc::clone(&event)), ThreadSelector::ANY, 1);
    task.setup_prerequisites(&[gate.clone()], ThreadSelector::ANY, true);

    assert_eq!(spy.run_all(), 0);
    assert!(!event.wait_timeout(Duration::ZERO));

    gate.dispatch_subsequents();
    assert_eq!(spy.run_all(), 1);
    assert!(event.wait_timeout(Duration::ZERO));
}

#[test]
fn test_held_task_waits_for_unlock() {
    let spy = SpyScheduler::new();

    let task = spy.hold(&[], noop);
    assert_eq!(spy.num_queued(), 0);

    // Subsequents can be wired before the task could possibly complete.
    let after = spy.dispatch(ThreadSelector::ANY, &[task.signal().clone()], noop);

    Arc::clone(&task).unlock(ThreadSelector::ANY);
    assert_eq!(spy.run_all(), 2);
    assert!(after.signal().is_complete());
}

#[test]
fn test_wait_delegates_to_scheduler() {
    let spy = SpyScheduler::new();

    let first = spy.dispatch(ThreadSelector::ANY, &[], noop);
    let second = spy.dispatch(ThreadSelector::ANY, &[first.signal().clone()], noop);

    second.signal().wait();
    assert!(first.signal().is_complete());
    assert!(second.signal().is_complete());
}

#[test]
fn test_task_id_visible_from_payload() {
    let spy = SpyScheduler::new();
    let seen = Arc::new(Mutex::new(None));

    let task = {
        let seen = Arc::clone(&seen);
        spy.dispatch(ThreadSelector::ANY, &[], move |_, _| {
            *seen.lock() = try_id();
        })
    };

    spy.run_all();
    assert_eq!(*seen.lock(), Some(task.id()));
    assert_eq!(try_id(), None);
}

#[test]
fn test_completion_releases_subsequents() {
    let spy = SpyScheduler::new();
    let signal = spy.new_signal();

    let task = spy.dispatch(ThreadSelector::ANY, &[signal.clone()], noop);
    assert_eq!(Arc::strong_count(&task), 2);

    signal.dispatch_subsequents();
    spy.run_all();

    assert_eq!(Arc::strong_count(&task), 1);
}
