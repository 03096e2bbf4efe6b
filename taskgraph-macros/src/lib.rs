#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub
)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! Entry point macros for taskgraph.

mod entry;
mod parse;

/// Runs the function body against a freshly built `Runtime`.
///
/// The calling thread is attached as named thread 0, so the body can pump
/// that thread's queue or wait on signals while still running tasks routed
/// to it. The runtime shuts down once the body returns.
///
/// The function may take a single argument, bound to `&taskgraph::Runtime`.
///
/// # Options
///
/// - `flavor`: `"multi_thread"` (default) or `"restricted"`.
/// - `worker_threads`: pool threads per band, multi-thread flavor only.
/// - `named_threads`: defaults to 1. With 0 nothing is attached.
/// - `high_priority_band`, `background_band`: enable the extra bands.
///
/// # Usage
///
/// ```ignore
/// #[taskgraph::main(worker_threads = 4)]
/// fn main(rt: &taskgraph::Runtime) {
///     let done = rt.spawn(|| println!("Hello world"));
///     done.wait();
/// }
/// ```
///
/// Equivalent code not using `#[taskgraph::main]`
///
/// ```ignore
/// fn main() {
///     let rt = taskgraph::runtime::Builder::new_multi_thread()
///         .worker_threads(4)
///         .try_build()
///         .unwrap();
///     rt.attach_named_thread(taskgraph::thread::ThreadSelector::named(0));
///
///     let done = rt.spawn(|| println!("Hello world"));
///     done.wait();
///
///     rt.shutdown();
/// }
/// ```
#[proc_macro_attribute]
pub fn main(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::main(args.into(), item.into()).into()
}

/// Same as [`macro@main`], for `#[test]` functions.
///
/// Each test gets its own runtime, built with the restricted flavor unless
/// told otherwise.
///
/// ```ignore
/// #[taskgraph::test(flavor = "multi_thread", worker_threads = 2, high_priority_band = true)]
/// fn my_test(rt: &taskgraph::Runtime) {
///     assert_eq!(rt.num_worker_threads(), 2);
/// }
/// ```
///
/// ```ignore
/// #[taskgraph::test]
/// fn my_test(rt: &taskgraph::Runtime) {
///     let main = taskgraph::thread::ThreadSelector::named(0);
///     rt.submit(|_, _| {}, main, main);
///     assert_eq!(rt.pump_until_idle(main), 1);
/// }
/// ```
#[proc_macro_attribute]
pub fn test(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::test(args.into(), item.into()).into()
}
