use std::fmt;

/// Number of worker priority bands a scheduler can run.
pub const NUM_THREAD_PRIORITIES: usize = 3;

/// Number of task priority classes inside a single queue.
pub const NUM_TASK_PRIORITIES: usize = 2;

// Bit layout of a `ThreadSelector`. Other components rely on these exact field
// widths, do not reorder.
const THREAD_INDEX_MASK: u32 = 0xff;
const QUEUE_INDEX_SHIFT: u32 = 8;
const QUEUE_INDEX_MASK: u32 = 1 << QUEUE_INDEX_SHIFT;
const TASK_PRIORITY_SHIFT: u32 = 9;
const TASK_PRIORITY_MASK: u32 = 1 << TASK_PRIORITY_SHIFT;
const THREAD_PRIORITY_SHIFT: u32 = 10;
const THREAD_PRIORITY_MASK: u32 = 0b11 << THREAD_PRIORITY_SHIFT;

const ALL_FIELDS_MASK: u32 =
    THREAD_INDEX_MASK | QUEUE_INDEX_MASK | TASK_PRIORITY_MASK | THREAD_PRIORITY_MASK;

/// Thread index reserved for "any pool worker". Every real thread index, named
/// or pool, is strictly below it.
pub const ANY_THREAD_INDEX: u32 = THREAD_INDEX_MASK;

/// Worker band a task is routed to when it targets any pool worker.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ThreadPriority {
    #[default]
    Normal = 0,
    High = 1,
    Background = 2,
}

impl ThreadPriority {
    /// All bands, in band index order.
    pub const ALL: [ThreadPriority; NUM_THREAD_PRIORITIES] = [
        ThreadPriority::Normal,
        ThreadPriority::High,
        ThreadPriority::Background,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    const fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0 => Some(ThreadPriority::Normal),
            1 => Some(ThreadPriority::High),
            2 => Some(ThreadPriority::Background),
            _ => None,
        }
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            ThreadPriority::Normal => "normal",
            ThreadPriority::High => "high",
            ThreadPriority::Background => "background",
        }
    }
}

/// Picks one of the two priority classes of the queue a task lands in.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum TaskPriority {
    #[default]
    Normal = 0,
    High = 1,
}

impl TaskPriority {
    pub const fn is_high(self) -> bool {
        matches!(self, TaskPriority::High)
    }
}

/// Sub-queue of a named thread.
///
/// The `Local` queue lets a named thread pump a second queue while it is
/// already busy pumping its `Main` queue, which is how a named thread can wait
/// on work from within one of its own tasks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum QueueIndex {
    #[default]
    Main = 0,
    Local = 1,
}

impl QueueIndex {
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Packed identifier of a logical thread used to route tasks.
///
/// A selector carries a thread index (a named thread, a pool worker, or the
/// [`ANY_THREAD_INDEX`] sentinel), the worker band, the task priority bit and
/// the named thread sub-queue. It is a plain `u32` so it can be copied around
/// freely and stored atomically.
///
/// ```
/// use taskgraph::thread::{QueueIndex, TaskPriority, ThreadPriority, ThreadSelector};
///
/// let game = ThreadSelector::named(0);
/// let local = game.with_queue(QueueIndex::Local);
/// assert_eq!(local.thread_index(), 0);
///
/// let any = ThreadSelector::any(ThreadPriority::High, TaskPriority::High);
/// assert!(any.is_any());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadSelector(u32);

impl ThreadSelector {
    /// Any pool worker, normal band, normal task priority.
    pub const ANY: ThreadSelector =
        ThreadSelector::any(ThreadPriority::Normal, TaskPriority::Normal);

    /// Any pool worker of the given band.
    pub const fn any(band: ThreadPriority, task: TaskPriority) -> Self {
        Self::encode(ANY_THREAD_INDEX, band, task, QueueIndex::Main)
    }

    /// The main queue of a named thread.
    #[track_caller]
    pub const fn named(index: u32) -> Self {
        assert!(
            index < ANY_THREAD_INDEX,
            "named thread index collides with the any-worker sentinel"
        );
        Self::encode(index, ThreadPriority::Normal, TaskPriority::Normal, QueueIndex::Main)
    }

    #[track_caller]
    pub const fn encode(
        index: u32,
        band: ThreadPriority,
        task: TaskPriority,
        queue: QueueIndex,
    ) -> Self {
        assert!(index <= THREAD_INDEX_MASK, "thread index out of range");
        assert!(
            !(index == ANY_THREAD_INDEX && matches!(queue, QueueIndex::Local)),
            "any-worker selectors only address the main queue"
        );

        Self(
            index
                | (queue as u32) << QUEUE_INDEX_SHIFT
                | (task as u32) << TASK_PRIORITY_SHIFT
                | (band as u32) << THREAD_PRIORITY_SHIFT,
        )
    }

    /// Rebuilds a selector from its raw representation, rejecting values that
    /// no call to [`ThreadSelector::encode`] could have produced.
    pub const fn from_bits(bits: u32) -> Option<Self> {
        if bits & !ALL_FIELDS_MASK != 0 {
            return None;
        }

        if ThreadPriority::from_bits((bits & THREAD_PRIORITY_MASK) >> THREAD_PRIORITY_SHIFT)
            .is_none()
        {
            return None;
        }

        if bits & THREAD_INDEX_MASK == ANY_THREAD_INDEX && bits & QUEUE_INDEX_MASK != 0 {
            return None;
        }

        Some(Self(bits))
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn thread_index(self) -> u32 {
        self.0 & THREAD_INDEX_MASK
    }

    pub const fn is_any(self) -> bool {
        self.thread_index() == ANY_THREAD_INDEX
    }

    pub const fn thread_priority(self) -> ThreadPriority {
        match ThreadPriority::from_bits((self.0 & THREAD_PRIORITY_MASK) >> THREAD_PRIORITY_SHIFT) {
            Some(band) => band,
            None => unreachable!(),
        }
    }

    pub const fn task_priority(self) -> TaskPriority {
        if self.0 & TASK_PRIORITY_MASK != 0 {
            TaskPriority::High
        } else {
            TaskPriority::Normal
        }
    }

    pub const fn queue_index(self) -> QueueIndex {
        if self.0 & QUEUE_INDEX_MASK != 0 {
            QueueIndex::Local
        } else {
            QueueIndex::Main
        }
    }

    /// Replaces the band and task priority, keeping thread and queue index.
    pub const fn with_priorities(self, band: ThreadPriority, high_task: bool) -> Self {
        let task = if high_task {
            TaskPriority::High
        } else {
            TaskPriority::Normal
        };

        Self::encode(self.thread_index(), band, task, self.queue_index())
    }

    #[track_caller]
    pub const fn with_queue(self, queue: QueueIndex) -> Self {
        Self::encode(
            self.thread_index(),
            self.thread_priority(),
            self.task_priority(),
            queue,
        )
    }

    /// Strips everything but the thread index.
    pub const fn thread_only(self) -> Self {
        Self(self.0 & THREAD_INDEX_MASK)
    }
}

impl Default for ThreadSelector {
    fn default() -> Self {
        ThreadSelector::ANY
    }
}

impl fmt::Debug for ThreadSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("ThreadSelector");

        if self.is_any() {
            s.field("thread", &"any");
        } else {
            s.field("thread", &self.thread_index());
        }

        s.field("band", &self.thread_priority())
            .field("task", &self.task_priority())
            .field("queue", &self.queue_index())
            .finish()
    }
}

impl fmt::Display for ThreadSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_any() {
            write!(f, "any")?;
        } else {
            write!(f, "#{}", self.thread_index())?;
        }

        write!(f, "/{}", self.thread_priority().as_str())?;

        if self.task_priority().is_high() {
            write!(f, "/hi")?;
        }

        if matches!(self.queue_index(), QueueIndex::Local) {
            write!(f, "/local")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use static_assertions::{assert_eq_size, assert_impl_all};

    assert_impl_all!(ThreadSelector: Send, Sync, Copy);
    assert_eq_size!(ThreadSelector, u32);

    #[rstest]
    #[case::named_main(3, ThreadPriority::Normal, TaskPriority::Normal, QueueIndex::Main)]
    #[case::named_local_hi(7, ThreadPriority::High, TaskPriority::High, QueueIndex::Local)]
    #[case::pool_worker(42, ThreadPriority::Background, TaskPriority::High, QueueIndex::Main)]
    #[case::any_background(
        ANY_THREAD_INDEX,
        ThreadPriority::Background,
        TaskPriority::Normal,
        QueueIndex::Main
    )]
    fn test_encode_decode(
        #[case] index: u32,
        #[case] band: ThreadPriority,
        #[case] task: TaskPriority,
        #[case] queue: QueueIndex,
    ) {
        let sel = ThreadSelector::encode(index, band, task, queue);

        assert_eq!(sel.thread_index(), index);
        assert_eq!(sel.thread_priority(), band);
        assert_eq!(sel.task_priority(), task);
        assert_eq!(sel.queue_index(), queue);

        let again = ThreadSelector::encode(
            sel.thread_index(),
            sel.thread_priority(),
            sel.task_priority(),
            sel.queue_index(),
        );
        assert_eq!(again, sel);
        assert_eq!(ThreadSelector::from_bits(sel.bits()), Some(sel));
    }

    #[test]
    fn test_field_widths() {
        let sel = ThreadSelector::encode(
            0x12,
            ThreadPriority::Background,
            TaskPriority::High,
            QueueIndex::Local,
        );
        assert_eq!(sel.bits(), 0x12 | 0x100 | 0x200 | 0x800);
        assert_eq!(ThreadSelector::ANY.bits(), 0xff);
    }

    #[test]
    fn test_any_sentinel_outside_named_range() {
        let any = ThreadSelector::any(ThreadPriority::High, TaskPriority::High);
        assert!(any.is_any());
        assert_eq!(any.thread_index(), ANY_THREAD_INDEX);

        for i in 0..ANY_THREAD_INDEX {
            assert!(!ThreadSelector::named(i).is_any());
        }
    }

    #[test]
    fn test_with_priorities_keeps_index_and_queue() {
        let sel = ThreadSelector::named(5).with_queue(QueueIndex::Local);
        let out = sel.with_priorities(ThreadPriority::High, true);

        assert_eq!(out.thread_index(), 5);
        assert_eq!(out.queue_index(), QueueIndex::Local);
        assert_eq!(out.thread_priority(), ThreadPriority::High);
        assert_eq!(out.task_priority(), TaskPriority::High);

        let back = out.with_priorities(ThreadPriority::Normal, false);
        assert_eq!(back, sel);
        assert_eq!(back.thread_only(), ThreadSelector::named(5).thread_only());
    }

    #[rstest]
    #[case::unknown_bits(1 << 20)]
    #[case::invalid_band(0b11 << 10)]
    #[case::any_local(0xff | 0x100)]
    fn test_from_bits_rejects(#[case] bits: u32) {
        assert_eq!(ThreadSelector::from_bits(bits), None);
    }

    #[test]
    #[should_panic(expected = "any-worker selectors only address the main queue")]
    fn test_any_with_local_queue_panics() {
        let _ = ThreadSelector::ANY.with_queue(QueueIndex::Local);
    }

    #[test]
    fn test_display() {
        assert_eq!(ThreadSelector::ANY.to_string(), "any/normal");
        assert_eq!(
            ThreadSelector::named(2)
                .with_queue(QueueIndex::Local)
                .with_priorities(ThreadPriority::High, true)
                .to_string(),
            "#2/high/hi/local"
        );
    }
}
