use eyre::WrapErr;
use tokio::runtime::{Handle, Runtime};

/// Reusable threads backing worker requests and scheduler timers
///
/// Workers run on the runtime's blocking pool, so a command stuck on the
/// debuggee only ties up its own thread.
pub struct WorkerPool {
    runtime: Option<Runtime>,
    handle: Handle,
}

impl WorkerPool {
    /// Create a pool allowing up to `max_threads` concurrently blocked workers
    #[tracing::instrument]
    pub fn new(max_threads: usize) -> eyre::Result<Self> {
        tracing::debug!("creating worker pool");
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(max_threads.max(2))
            .thread_name("stepwise-worker")
            .enable_time()
            .build()
            .wrap_err("creating worker pool runtime")?;
        let handle = runtime.handle().clone();
        Ok(Self {
            runtime: Some(runtime),
            handle,
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // a worker may be stuck in a command forever, never wait for it
        if let Some(runtime) = self.runtime.take() {
            tracing::debug!("shutting down worker pool");
            runtime.shutdown_background();
        }
    }
}
