//! The process-wide worker pool.
//!
//! All connection and handler work runs on one shared multi-thread
//! runtime. It is created when the first server in the process starts,
//! sized from that server's configuration, and shared by every server
//! started afterwards (later size settings are ignored).

use std::sync::OnceLock;

use tokio::runtime::{Builder, Runtime};

static POOL: OnceLock<Runtime> = OnceLock::new();

/// The pool, if some server already created it.
pub(crate) fn try_pool() -> Option<&'static Runtime> {
    POOL.get()
}

/// Returns the shared pool, creating it with `workers` threads on
/// first use.
pub(crate) fn pool(workers: usize) -> &'static Runtime {
    POOL.get_or_init(|| {
        Builder::new_multi_thread()
            .worker_threads(workers)
            .thread_name("junction-worker")
            .enable_io()
            .enable_time()
            .build()
            .expect("worker pool must build")
    })
}
