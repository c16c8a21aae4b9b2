use std::{
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::utils::lock;

/// Identity of a worker request, distinct from the scheduler it serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub(crate) u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// One pool-backed execution context serving a scheduler
pub struct WorkerRequest {
    id: RequestId,
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    finished: Receiver<()>,
}

/// Moved into the pool task; dropping it marks the request finished, including
/// when the pool discards the task without ever running it.
pub(crate) struct FinishGuard {
    _finished: Sender<()>,
}

impl WorkerRequest {
    pub(crate) fn new(id: RequestId) -> (Arc<Self>, FinishGuard) {
        let (tx, rx) = crossbeam_channel::bounded(0);
        let request = Arc::new(Self {
            id,
            token: CancellationToken::new(),
            handle: Mutex::new(None),
            finished: rx,
        });
        (request, FinishGuard { _finished: tx })
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_stop_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) fn attach(&self, handle: JoinHandle<()>) {
        *lock(&self.handle) = Some(handle);
    }

    /// Cancel the token and the pool task
    ///
    /// A command that is already running and never looks at its token keeps
    /// running; the worker exits once it returns.
    pub(crate) fn stop(&self) {
        tracing::debug!(request_id = %self.id, "stopping worker request");
        self.token.cancel();
        if let Some(handle) = lock(&self.handle).as_ref() {
            handle.abort();
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.finished.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Wait up to `timeout` for the worker to exit
    ///
    /// Returns whether it did. Timing out only stops the waiting, not the worker.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        matches!(
            self.finished.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }
}

impl fmt::Debug for WorkerRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRequest")
            .field("id", &self.id)
            .field("stop_requested", &self.is_stop_requested())
            .finish()
    }
}
