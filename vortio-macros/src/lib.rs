#![warn(missing_docs, rust_2018_idioms, unreachable_pub)]

//! Entry-point macros for vortio.

mod entry;

/// Marks an async function to be executed by a vortio runtime. This macro
/// sets up a `Runtime` without requiring the user to go through `Builder`.
///
/// # Usage
///
/// ```no_run
/// #[vortio::main]
/// async fn main() {
///     println!("Hello world");
/// }
/// ```
///
/// Equivalent code not using `#[vortio::main]`
///
/// ```no_run
/// fn main() {
///     vortio::runtime::Builder::new()
///         .try_build()
///         .unwrap()
///         .block_on(async {
///             println!("Hello world");
///         })
/// }
/// ```
///
/// ## Set number of worker threads
///
/// ```no_run
/// #[vortio::main(worker_threads = 2)]
/// async fn main() {
///     println!("Hello world");
/// }
/// ```
///
/// The `worker_threads` option configures the number of worker threads and
/// defaults to the number of cpus on the system.
#[proc_macro_attribute]
pub fn main(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::expand(args.into(), item.into(), false).into()
}

/// Marks an async function to be executed by a vortio runtime, suitable for
/// a test environment. Each test gets its own runtime.
///
/// # Usage
///
/// ```no_run
/// #[vortio::test]
/// async fn my_test() {
///     assert!(true);
/// }
/// ```
///
/// Equivalent code not using `#[vortio::test]`
///
/// ```no_run
/// #[test]
/// fn my_test() {
///     vortio::runtime::Builder::new()
///         .try_build()
///         .unwrap()
///         .block_on(async {
///             assert!(true);
///         })
/// }
/// ```
///
/// Tests default to a single worker thread to keep scheduling deterministic;
/// pass `worker_threads = N` for multi-worker tests.
#[proc_macro_attribute]
pub fn test(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::expand(args.into(), item.into(), true).into()
}
