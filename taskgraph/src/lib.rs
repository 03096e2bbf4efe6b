#[doc(inline)]
pub use taskgraph_macros::main;

#[doc(inline)]
pub use taskgraph_macros::test;

mod context;

mod queue;

pub mod runtime;
pub use runtime::{Builder, Handle, Runtime};

pub mod sync;

pub mod task;

pub mod thread;

mod utils;

#[cfg(test)]
mod test_utils;
