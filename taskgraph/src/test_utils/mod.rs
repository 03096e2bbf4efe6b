use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};

// Exports
pub(crate) mod mocks;
pub(crate) use mocks::SpyScheduler;

/// Installs a fmt subscriber writing through the test harness, once per test
/// binary. Filter with `RUST_LOG`.
pub(crate) fn init_tracing() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .with_thread_names(true)
            .try_init();
    });
}

/// Yields until `cond` holds, panicking after a generous deadline instead of
/// hanging the test binary.
#[track_caller]
pub(crate) fn spin_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);

    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::yield_now();
    }
}
