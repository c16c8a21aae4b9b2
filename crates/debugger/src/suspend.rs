//! Suspend contexts: the stopped moments of a debuggee
//!
//! Contexts live in an arena owned by their session and are addressed by
//! [`SuspendContextId`]. A context only refers back to its session by
//! [`SessionId`], and commands only hold a [`ContextBinding`], which can tell
//! whether the context is still live but keeps nothing alive itself.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex, Weak},
};

use scheduler::Binding;

use crate::{target::ThreadId, utils::lock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub(crate) u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SuspendContextId(u64);

impl fmt::Display for SuspendContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "suspend-{}", self.0)
    }
}

/// How much of the debuggee a stop suspended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendPolicy {
    All,
    Thread,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuspendContext {
    pub id: SuspendContextId,
    pub session: SessionId,
    /// Thread that hit the stop. `None` for a user requested pause of everything.
    pub thread: Option<ThreadId>,
    pub policy: SuspendPolicy,
}

#[derive(Debug, Default)]
struct Arena {
    next: u64,
    live: BTreeMap<SuspendContextId, SuspendContext>,
}

/// Arena of the live suspend contexts of one session
#[derive(Debug, Clone)]
pub struct SuspendContexts {
    session: SessionId,
    arena: Arc<Mutex<Arena>>,
}

impl SuspendContexts {
    pub(crate) fn new(session: SessionId) -> Self {
        Self {
            session,
            arena: Arc::new(Mutex::new(Arena::default())),
        }
    }

    /// Record a new stop of the debuggee
    pub fn push(&self, thread: Option<ThreadId>, policy: SuspendPolicy) -> SuspendContext {
        let mut arena = lock(&self.arena);
        arena.next += 1;
        let context = SuspendContext {
            id: SuspendContextId(arena.next),
            session: self.session,
            thread,
            policy,
        };
        arena.live.insert(context.id, context.clone());
        tracing::trace!(context = %context.id, ?thread, ?policy, "suspend context pushed");
        context
    }

    pub fn get(&self, id: SuspendContextId) -> Option<SuspendContext> {
        lock(&self.arena).live.get(&id).cloned()
    }

    pub fn is_live(&self, id: SuspendContextId) -> bool {
        lock(&self.arena).live.contains_key(&id)
    }

    /// Mark a context as resumed. Returns whether it was still live.
    pub fn invalidate(&self, id: SuspendContextId) -> bool {
        lock(&self.arena).live.remove(&id).is_some()
    }

    pub fn invalidate_all(&self) {
        lock(&self.arena).live.clear();
    }

    /// The most recently pushed context that is still live
    pub fn latest_live(&self) -> Option<SuspendContext> {
        lock(&self.arena)
            .live
            .last_key_value()
            .map(|(_, context)| context.clone())
    }

    pub fn binding(&self, id: SuspendContextId) -> Arc<dyn Binding> {
        Arc::new(ContextBinding {
            id,
            arena: Arc::downgrade(&self.arena),
        })
    }
}

/// Liveness of one suspend context, for binding commands to it
pub struct ContextBinding {
    id: SuspendContextId,
    arena: Weak<Mutex<Arena>>,
}

impl fmt::Debug for ContextBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ContextBinding").field(&self.id).finish()
    }
}

impl Binding for ContextBinding {
    fn is_live(&self) -> bool {
        self.arena
            .upgrade()
            .is_some_and(|arena| lock(&arena).live.contains_key(&self.id))
    }
}
