// Copyright 2020 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
//
//! A cloneable handle onto a tokio runtime, so that every component of the worker that needs to
//! spawn background work (the CAS cache's writers, the materializer's fetchers, the command
//! executor's stdio drain tasks) shares one pool rather than each owning its own.

use std::future::Future;
use std::sync::Arc;

use tokio::runtime::{Builder, Handle, Runtime};

/// Wraps a `tokio::runtime::Handle`, optionally along with the `Runtime` that owns it.
///
/// An `Executor` constructed with [`Executor::new`] borrows an already-running runtime (e.g. the
/// one driving `#[tokio::main]`) and never shuts it down. One constructed with
/// [`Executor::new_owned`] holds the `Runtime` itself, and that runtime is shut down when the
/// last clone of the `Executor` is dropped.
#[derive(Clone)]
pub struct Executor {
    handle: Handle,
    // Only set for owned runtimes: on Drop of the last Executor referencing it, the Runtime
    // is dropped, which blocks until all of its tasks finish.
    _runtime: Option<Arc<Runtime>>,
}

impl Executor {
    /// Wraps the handle of a runtime that is already running elsewhere; this `Executor` has no
    /// say over that runtime's lifecycle.
    pub fn new(handle: Handle) -> Executor {
        Executor {
            handle,
            _runtime: None,
        }
    }

    /// Creates and owns a new multi-threaded runtime with the given number of worker threads (0
    /// means let tokio pick a default based on available parallelism).
    pub fn new_owned(thread_name_prefix: &str, num_threads: Option<usize>) -> Result<Executor, String> {
        let mut builder = Builder::new_multi_thread();
        builder.thread_name(thread_name_prefix).enable_all();
        if let Some(threads) = num_threads {
            builder.worker_threads(threads);
        }
        let runtime = builder
            .build()
            .map_err(|e| format!("failed to start the {thread_name_prefix} runtime: {e}"))?;
        let handle = runtime.handle().clone();
        Ok(Executor {
            handle,
            _runtime: Some(Arc::new(runtime)),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Spawns a future onto this executor's runtime, detached from the caller.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let _join = self.handle.spawn(future);
    }

    /// Runs a future to completion on this executor's runtime from synchronous code. Panics if
    /// called from within an async context already driven by this runtime.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn new_wraps_current_runtime() {
        let executor = Executor::new(Handle::current());
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        executor.spawn(async move {
            ran2.store(true, Ordering::SeqCst);
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn new_owned_runs_blocking_work() {
        let executor = Executor::new_owned("worker-test", Some(1)).unwrap();
        let result = executor.block_on(async { 1 + 1 });
        assert_eq!(result, 2);
    }

    #[test]
    fn cloned_executor_shares_the_same_handle() {
        let executor = Executor::new_owned("worker-test-clone", Some(1)).unwrap();
        let clone = executor.clone();
        assert_eq!(
            format!("{:?}", executor.handle().id()),
            format!("{:?}", clone.handle().id())
        );
    }
}
