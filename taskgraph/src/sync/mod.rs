//! Platform synchronization primitives used by the scheduler.

mod event;
pub use event::Event;
