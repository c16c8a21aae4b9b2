use std::{
    panic::{self, AssertUnwindSafe},
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::Sender;
use eyre::WrapErr;

pub type Callback = Box<dyn FnOnce() + Send>;

/// The single thread listeners are notified on
pub trait Dispatcher: Send + Sync {
    /// Run `callback` later on the dispatch thread, in submission order
    fn invoke_later(&self, callback: Callback);
}

/// A [`Dispatcher`] backed by one dedicated thread
pub struct DispatchThread {
    tx: Option<Sender<Callback>>,
    handle: Option<JoinHandle<()>>,
}

impl DispatchThread {
    pub fn spawn(name: impl Into<String>) -> eyre::Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded::<Callback>();
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                for callback in rx {
                    if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
                        tracing::error!("dispatched callback panicked");
                    }
                }
                tracing::debug!("dispatch thread finished");
            })
            .wrap_err("spawning dispatch thread")?;

        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    /// Wait until every callback submitted so far has run
    pub fn flush(&self, timeout: Duration) -> bool {
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        self.invoke_later(Box::new(move || {
            let _ = done_tx.send(());
        }));
        done_rx.recv_timeout(timeout).is_ok()
    }
}

impl Dispatcher for DispatchThread {
    fn invoke_later(&self, callback: Callback) {
        if let Some(tx) = &self.tx {
            if tx.send(callback).is_err() {
                tracing::warn!("dispatch thread gone, dropping callback");
            }
        }
    }
}

impl Drop for DispatchThread {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
