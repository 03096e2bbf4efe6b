//! Thread identification used to route tasks.

mod selector;
pub use selector::{
    ANY_THREAD_INDEX, NUM_TASK_PRIORITIES, NUM_THREAD_PRIORITIES, QueueIndex, TaskPriority,
    ThreadPriority, ThreadSelector,
};
