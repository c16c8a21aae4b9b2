use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

use crate::{state::StateChange, utils::lock};

/// Observer of committed session states, always called on the dispatch thread
pub trait SessionListener: Send + Sync {
    fn state_changed(&self, change: &StateChange);
}

impl<F> SessionListener for F
where
    F: Fn(&StateChange) + Send + Sync,
{
    fn state_changed(&self, change: &StateChange) {
        self(change)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Listener registry; dispatch iterates over a snapshot so listeners may add or
/// remove listeners while being notified
#[derive(Default)]
pub(crate) struct Listeners {
    entries: Mutex<Vec<(ListenerId, Arc<dyn SessionListener>)>>,
    next: AtomicU64,
}

impl Listeners {
    pub(crate) fn add(&self, listener: Arc<dyn SessionListener>) -> ListenerId {
        let id = ListenerId(self.next.fetch_add(1, Ordering::Relaxed));
        lock(&self.entries).push((id, listener));
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    pub(crate) fn clear(&self) {
        lock(&self.entries).clear();
    }

    pub(crate) fn notify(&self, change: &StateChange) {
        let snapshot: Vec<_> = lock(&self.entries)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in snapshot {
            listener.state_changed(change);
        }
    }
}
