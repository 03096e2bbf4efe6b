use crate::thread::ThreadSelector;

/// Invalid runtime configuration, reported by
/// [`Builder::try_build`](crate::runtime::Builder::try_build).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("multi-threaded runtime needs at least one worker thread per band")]
    NoWorkerThreads,

    #[error("restricted runtime needs at least one named thread")]
    NoNamedThreads,

    #[error("{requested} worker threads per band exceeds the maximum of {max}")]
    TooManyWorkerThreads { requested: usize, max: usize },

    #[error("{required} threads requested but only {available} thread indices are addressable")]
    ThreadIndexSpaceExhausted { required: usize, available: usize },

    #[error("cannot ignore {ignored} out of {per_band} worker threads per band")]
    IgnoringAllWorkers { ignored: usize, per_band: usize },

    #[error("{role} thread {thread} does not exist")]
    UnknownThread {
        role: &'static str,
        thread: ThreadSelector,
    },
}
