use crate::sync::Event;
use crate::thread::{NUM_TASK_PRIORITIES, TaskPriority};
use crossbeam_deque::{Injector, Steal};
use crossbeam_utils::{Backoff, CachePadded};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering, fence};

#[cfg(test)]
use std::sync::atomic::AtomicUsize;

/// One bit per consumer in the stall mask.
pub(crate) const MAX_CONSUMERS: usize = u64::BITS as usize;

/// Multi-producer queue drained by a fixed set of consumers, with two priority
/// classes.
///
/// High priority items always drain before normal ones. Within one class items
/// come out in push order. A consumer that finds the queue empty may *stall*
/// on its own [`Event`]; the next push claims that consumer and returns its
/// index so the producer can wake it with [`StallingQueue::wake`].
pub(crate) struct StallingQueue<T> {
    // Index 0 holds high priority items, see `class_of`.
    queues: [Injector<T>; NUM_TASK_PRIORITIES],

    consumers: Box<[Consumer]>,

    /// Bit `i` is set while consumer `i` is stalled and nobody claimed it yet.
    stalled: CachePadded<AtomicU64>,

    shutdown: AtomicBool,

    #[cfg(test)]
    pub(crate) stalls: AtomicUsize,
}

struct Consumer {
    event: Arc<Event>,

    /// Makes the next stalled `pop` return `None` without an item.
    interrupted: AtomicBool,
}

impl<T> StallingQueue<T> {
    /// Creates a queue with one consumer per event. The event of consumer `i`
    /// is `events[i]`, and is shared with whoever owns that consumer.
    #[track_caller]
    pub(crate) fn new(events: Vec<Arc<Event>>) -> Self {
        assert!(!events.is_empty(), "queue needs at least one consumer");
        assert!(
            events.len() <= MAX_CONSUMERS,
            "queue supports at most {MAX_CONSUMERS} consumers, got {}",
            events.len()
        );

        let consumers = events
            .into_iter()
            .map(|event| Consumer {
                event,
                interrupted: AtomicBool::new(false),
            })
            .collect();

        Self {
            queues: [Injector::new(), Injector::new()],
            consumers,
            stalled: CachePadded::new(AtomicU64::new(0)),
            shutdown: AtomicBool::new(false),
            #[cfg(test)]
            stalls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn num_consumers(&self) -> usize {
        self.consumers.len()
    }

    /// Pushes an item and returns the index of a stalled consumer that the
    /// caller must now wake, if any. Each stall is claimed by a single push.
    pub(crate) fn push(&self, item: T, priority: TaskPriority) -> Option<usize> {
        self.queues[class_of(priority)].push(item);

        // Pairs with the fence in `pop` after announcing a stall: either the
        // consumer sees our item, or we see its stall bit.
        fence(Ordering::SeqCst);

        let mut stalled = self.stalled.load(Ordering::SeqCst);
        while stalled != 0 {
            let consumer = stalled.trailing_zeros() as usize;
            let claimed = stalled & !(1 << consumer);

            match self.stalled.compare_exchange_weak(
                stalled,
                claimed,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Some(consumer),
                Err(actual) => stalled = actual,
            }
        }

        None
    }

    /// Pops the next item, high priority first.
    ///
    /// When empty and `allow_stall` is set, blocks on the consumer's event
    /// until an item shows up, the queue shuts down, or the consumer is
    /// interrupted. The last two return `None`.
    pub(crate) fn pop(&self, consumer: usize, allow_stall: bool) -> Option<T> {
        let slot = &self.consumers[consumer];
        let bit = 1u64 << consumer;

        loop {
            if let Some(item) = self.try_pop() {
                return Some(item);
            }

            if !allow_stall
                || self.is_shutdown()
                || slot.interrupted.swap(false, Ordering::AcqRel)
            {
                return None;
            }

            let prev = self.stalled.fetch_or(bit, Ordering::SeqCst);
            debug_assert_eq!(prev & bit, 0, "consumer {consumer} stalled twice");
            fence(Ordering::SeqCst);

            #[cfg(test)]
            self.stalls.fetch_add(1, Ordering::Relaxed);

            // Catch pushes that raced with the stall announcement.
            if let Some(item) = self.try_pop() {
                // If a producer already claimed us, its wake stays pending on
                // the event and only costs one extra loop on the next stall.
                self.stalled.fetch_and(!bit, Ordering::SeqCst);
                return Some(item);
            }

            if self.is_shutdown() {
                self.stalled.fetch_and(!bit, Ordering::SeqCst);
                return None;
            }

            slot.event.wait();

            // Woken by a push claim (bit already clear), or by an interrupt or
            // shutdown (bit still set).
            self.stalled.fetch_and(!bit, Ordering::SeqCst);
        }
    }

    pub(crate) fn try_pop(&self) -> Option<T> {
        self.queues.iter().find_map(steal)
    }

    /// Triggers the event of a consumer returned by [`StallingQueue::push`].
    pub(crate) fn wake(&self, consumer: usize) {
        self.consumers[consumer].event.trigger();
    }

    /// Makes a stalled (or the next stalling) `pop` of this consumer return.
    pub(crate) fn interrupt(&self, consumer: usize) {
        let slot = &self.consumers[consumer];
        slot.interrupted.store(true, Ordering::Release);
        slot.event.trigger();
    }

    /// Releases every stalled consumer for good. Items still queued remain
    /// poppable until [`StallingQueue::drain`].
    pub(crate) fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);

        for slot in self.consumers.iter() {
            slot.event.trigger();
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn is_stalled(&self, consumer: usize) -> bool {
        self.stalled.load(Ordering::Acquire) & (1 << consumer) != 0
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.queues.iter().all(Injector::is_empty)
    }

    /// Drops everything still queued and returns how many items that was.
    pub(crate) fn drain(&self) -> usize {
        let mut count = 0;
        while self.try_pop().is_some() {
            count += 1;
        }
        count
    }
}

fn class_of(priority: TaskPriority) -> usize {
    match priority {
        TaskPriority::High => 0,
        TaskPriority::Normal => 1,
    }
}

fn steal<T>(queue: &Injector<T>) -> Option<T> {
    let backoff = Backoff::new();

    loop {
        match queue.steal() {
            Steal::Success(item) => return Some(item),
            Steal::Empty => return None,
            Steal::Retry => backoff.spin(),
        }
    }
}

impl<T> fmt::Debug for StallingQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StallingQueue")
            .field("high", &self.queues[0].len())
            .field("normal", &self.queues[1].len())
            .field("consumers", &self.num_consumers())
            .field(
                "stalled",
                &format_args!("{:#b}", self.stalled.load(Ordering::Relaxed)),
            )
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
