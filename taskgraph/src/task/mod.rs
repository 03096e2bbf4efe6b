// Public API
pub mod id;
pub use self::id::{Id, id, try_id};

mod signal;
pub use self::signal::{CompletionSignal, SignalState};

// Exports
pub(crate) mod task;
pub(crate) use self::task::{Payload, Stage, Task, TaskBuffer, TaskFn};

#[cfg(test)]
mod tests;
