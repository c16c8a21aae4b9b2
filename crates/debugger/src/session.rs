//! The session state machine
//!
//! Every transition runs as a command on the session's scheduler. The one
//! exception is the optimistic [`State::WaitingEvaluation`] committed by
//! whoever issues a resume or step, so the UI reacts before the worker gets to
//! the actual resume.

use std::{
    fmt,
    sync::{
        Arc, Condvar, Mutex, PoisonError, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use config::Config;
use eyre::WrapErr;
use scheduler::{BoundCommand, CommandScheduler, FnCommand, Priority, WorkerPool};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::{
    commands::{Detach, Dispose, Paused, Refresh, Resume},
    dispatch::Dispatcher,
    listeners::{ListenerId, Listeners, SessionListener},
    state::{DebuggerContext, SessionEvent, State, StateChange},
    suspend::{SessionId, SuspendContext, SuspendContexts, SuspendPolicy},
    target::{SourcePosition, StepKind, Target, ThreadId, ThreadInfo},
    threads,
    utils::lock,
};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Whether the debuggee connection is usable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachState {
    Initial,
    Attached,
    Detaching,
    Detached,
}

struct Committed {
    state: State,
    event: SessionEvent,
    description: String,
    context: DebuggerContext,
    last_thread: Option<ThreadId>,
}

pub(crate) struct SessionInner {
    id: SessionId,
    pub(crate) scheduler: CommandScheduler,
    pub(crate) target: Arc<dyn Target>,
    dispatcher: Arc<dyn Dispatcher>,
    pub(crate) contexts: SuspendContexts,
    listeners: Arc<Listeners>,
    config: Config,
    pool: Handle,
    committed: Mutex<Committed>,
    stepping: Mutex<Option<ThreadId>>,
    attach: Mutex<AttachState>,
    pause_pressed: AtomicBool,
    refresh: Mutex<Option<CancellationToken>>,
    detached: Mutex<bool>,
    detached_changed: Condvar,
}

/// A debugger session attached to one debuggee
///
/// Cloning gives another handle to the same session. All methods may be called
/// from any thread; transitions are queued on the session's scheduler and
/// listeners hear about them on the dispatch thread.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session and start its command worker on `pool`
    #[tracing::instrument(skip(pool, target, dispatcher, config))]
    pub fn new(
        name: &str,
        pool: &WorkerPool,
        target: Arc<dyn Target>,
        dispatcher: Arc<dyn Dispatcher>,
        config: Config,
    ) -> eyre::Result<Self> {
        config.validate().wrap_err("invalid session configuration")?;

        let id = SessionId(NEXT_SESSION.fetch_add(1, Ordering::Relaxed));
        let scheduler = CommandScheduler::new(format!("{name}-{id}"), pool.handle());
        let inner = Arc::new(SessionInner {
            id,
            scheduler,
            target,
            dispatcher,
            contexts: SuspendContexts::new(id),
            listeners: Arc::new(Listeners::default()),
            config,
            pool: pool.handle(),
            committed: Mutex::new(Committed {
                state: State::Stopped,
                event: SessionEvent::Context,
                description: String::new(),
                context: DebuggerContext::empty(),
                last_thread: None,
            }),
            stepping: Mutex::new(None),
            attach: Mutex::new(AttachState::Initial),
            pause_pressed: AtomicBool::new(false),
            refresh: Mutex::new(None),
            detached: Mutex::new(false),
            detached_changed: Condvar::new(),
        });
        let request = inner.scheduler.start();
        tracing::debug!(session = %id, request_id = %request.id(), "session created");
        Ok(Self { inner })
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn scheduler(&self) -> &CommandScheduler {
        &self.inner.scheduler
    }

    /// Arena the protocol layer records stops in
    pub fn suspend_contexts(&self) -> &SuspendContexts {
        &self.inner.contexts
    }

    pub fn state(&self) -> State {
        lock(&self.inner.committed).state
    }

    pub fn description(&self) -> String {
        lock(&self.inner.committed).description.clone()
    }

    pub fn context(&self) -> DebuggerContext {
        lock(&self.inner.committed).context.clone()
    }

    /// The thread of the step in flight, if any
    pub fn stepping_through(&self) -> Option<ThreadId> {
        *lock(&self.inner.stepping)
    }

    pub fn attach_state(&self) -> AttachState {
        *lock(&self.inner.attach)
    }

    pub fn is_attached(&self) -> bool {
        self.attach_state() == AttachState::Attached
    }

    pub fn add_listener(&self, listener: impl SessionListener + 'static) -> ListenerId {
        self.inner.listeners.add(Arc::new(listener))
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    fn weak(&self) -> Weak<SessionInner> {
        Arc::downgrade(&self.inner)
    }

    /// Schedule a transition that needs nothing but the session itself
    fn transition<F>(&self, label: &'static str, f: F) -> bool
    where
        F: FnOnce(&SessionInner) + Send + 'static,
    {
        let session = self.weak();
        self.inner
            .scheduler
            .schedule(FnCommand::new(Priority::Normal, label, move |_| {
                if let Some(session) = session.upgrade() {
                    f(session.as_ref());
                }
                Ok(())
            }))
    }

    /// Wait for a debuggee to connect
    pub fn start_wait_attach(&self) -> bool {
        self.transition("start waiting for attach", |session| {
            *lock(&session.attach) = AttachState::Initial;
            *lock(&session.detached) = false;
            session.commit(
                State::WaitingAttach,
                SessionEvent::Context,
                "Waiting for the debuggee to connect",
                DebuggerContext::empty(),
            );
        })
    }

    pub fn attached(&self) -> bool {
        self.transition("attached", |session| {
            *lock(&session.attach) = AttachState::Attached;
            session.commit(
                State::Running,
                SessionEvent::Attached,
                "Connected to the debuggee",
                DebuggerContext::empty(),
            );
        })
    }

    pub fn attach_failed(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.transition("attach failed", move |session| session.mark_detached(reason))
    }

    /// The protocol layer lost the debuggee
    pub fn detached(&self, description: impl Into<String>) -> bool {
        let description = description.into();
        self.transition("detached", move |session| session.mark_detached(description))
    }

    /// Ask the target to suspend everything
    ///
    /// A second request while the first has not been answered by a resume is
    /// ignored.
    #[tracing::instrument(skip(self), fields(session = %self.id()))]
    pub fn pause(&self) -> bool {
        if !self.is_attached() {
            tracing::debug!(attach = ?self.attach_state(), "not attached, ignoring pause");
            return false;
        }
        if self.inner.pause_pressed.swap(true, Ordering::SeqCst) {
            tracing::debug!("pause already requested");
            return false;
        }

        let session = self.weak();
        let scheduled =
            self.inner
                .scheduler
                .schedule(FnCommand::new(Priority::High, "suspend all", move |_| {
                    let Some(session) = session.upgrade() else {
                        return Ok(());
                    };
                    session.target.suspend_all().inspect_err(|_| {
                        session.pause_pressed.store(false, Ordering::SeqCst);
                    })?;
                    Ok(())
                }));
        if !scheduled {
            self.inner.pause_pressed.store(false, Ordering::SeqCst);
        }
        scheduled
    }

    /// The debuggee stopped in `context`
    ///
    /// The transition is bound to `context` and is dropped if the context was
    /// resumed before the worker got to it.
    pub fn paused(&self, context: SuspendContext) -> bool {
        let binding = self.inner.contexts.binding(context.id);
        self.inner
            .scheduler
            .schedule(BoundCommand::new(Paused::new(self.weak(), context, binding)))
    }

    pub fn resume(&self) -> bool {
        self.resume_from_pause(None)
    }

    pub fn step_into(&self) -> bool {
        self.resume_from_pause(Some(StepKind::Into))
    }

    pub fn step_over(&self) -> bool {
        self.resume_from_pause(Some(StepKind::Over))
    }

    pub fn step_out(&self) -> bool {
        self.resume_from_pause(Some(StepKind::Out))
    }

    pub fn run_to_cursor(&self, position: SourcePosition) -> bool {
        self.resume_from_pause(Some(StepKind::RunToCursor(position)))
    }

    #[tracing::instrument(skip(self), fields(session = %self.id()))]
    fn resume_from_pause(&self, step: Option<StepKind>) -> bool {
        let (previous, step) = {
            let mut committed = lock(&self.inner.committed);
            if committed.state != State::Paused {
                tracing::debug!(state = %committed.state, "not paused, ignoring");
                return false;
            }
            let previous = committed.context.clone();
            if previous.suspend_context.is_none() {
                tracing::debug!("no suspend context to resume");
                return false;
            }

            let step = match step {
                Some(kind) => {
                    let Some(thread) = previous.thread else {
                        tracing::debug!("no thread selected to step");
                        return false;
                    };
                    *lock(&self.inner.stepping) = Some(thread);
                    Some((thread, kind))
                }
                None => {
                    *lock(&self.inner.stepping) = None;
                    None
                }
            };

            self.inner.apply(
                &mut committed,
                State::WaitingEvaluation,
                SessionEvent::Context,
                "Waiting for the debuggee to resume".to_string(),
                DebuggerContext::empty(),
            );
            (previous, step)
        };

        self.inner
            .scheduler
            .schedule(Resume::new(self.weak(), previous, step))
    }

    /// Disconnect from the debuggee, optionally terminating it
    ///
    /// Goes through the scheduler even when its worker is stuck: after the
    /// configured command timeout the detach gets a fresh worker.
    #[tracing::instrument(skip(self), fields(session = %self.id()))]
    pub fn detach(&self, terminate: bool) -> bool {
        {
            let mut attach = lock(&self.inner.attach);
            if matches!(*attach, AttachState::Detaching | AttachState::Detached) {
                tracing::debug!(attach = ?*attach, "already detaching");
                return false;
            }
            *attach = AttachState::Detaching;
        }
        let timeout = self.inner.config.scheduler.command_timeout();
        self.inner
            .scheduler
            .terminate_and_invoke(Detach::new(self.weak(), terminate), timeout)
    }

    /// Re-announce the current pause to listeners once things have been quiet
    /// for the configured refresh delay
    pub fn refresh(&self) {
        let token = CancellationToken::new();
        if let Some(previous) = lock(&self.inner.refresh).replace(token.clone()) {
            previous.cancel();
        }

        let session = self.weak();
        let delay = self.inner.config.session.refresh_delay();
        self.inner.pool.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::trace!("refresh superseded");
                }
                _ = tokio::time::sleep(delay) => {
                    if let Some(session) = session.upgrade() {
                        session.scheduler.schedule(Refresh::new(Arc::downgrade(&session)));
                    }
                }
            }
        });
    }

    /// Tear the session down; [`State::Disposed`] is the last state listeners see
    #[tracing::instrument(skip(self), fields(session = %self.id()))]
    pub fn dispose(&self) -> bool {
        let timeout = self.inner.config.scheduler.command_timeout();
        self.inner
            .scheduler
            .terminate_and_invoke(Dispose::new(self.weak()), timeout)
    }

    /// Block until the session detached or was disposed
    pub fn wait_for_detach(&self, timeout: Duration) -> bool {
        let detached = lock(&self.inner.detached);
        let (detached, _) = self
            .inner
            .detached_changed
            .wait_timeout_while(detached, timeout, |detached| !*detached)
            .unwrap_or_else(PoisonError::into_inner);
        *detached
    }
}

impl SessionInner {
    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    /// Commit a new state and queue its delivery to listeners
    ///
    /// Refused once the session is disposed.
    pub(crate) fn commit(
        &self,
        state: State,
        event: SessionEvent,
        description: impl Into<String>,
        context: DebuggerContext,
    ) -> bool {
        let mut committed = lock(&self.committed);
        self.apply(&mut committed, state, event, description.into(), context)
    }

    fn apply(
        &self,
        committed: &mut Committed,
        state: State,
        event: SessionEvent,
        description: String,
        context: DebuggerContext,
    ) -> bool {
        if committed.state.is_terminal() {
            tracing::debug!(session = %self.id, %state, ?event, "session disposed, ignoring state");
            return false;
        }
        tracing::debug!(session = %self.id, %state, ?event, %description, "committing state");

        if let Some(thread) = context.thread {
            committed.last_thread = Some(thread);
        }
        committed.state = state;
        committed.event = event;
        committed.description = description.clone();
        committed.context = context.clone();

        // queued under the lock so listeners see states in commit order
        let change = StateChange {
            state,
            event,
            description,
            context,
        };
        let listeners = Arc::clone(&self.listeners);
        self.dispatcher.invoke_later(Box::new(move || {
            listeners.notify(&change);
            if change.state.is_terminal() {
                listeners.clear();
            }
        }));
        true
    }

    pub(crate) fn state(&self) -> State {
        lock(&self.committed).state
    }

    pub(crate) fn context(&self) -> DebuggerContext {
        lock(&self.committed).context.clone()
    }

    pub(crate) fn description(&self) -> String {
        lock(&self.committed).description.clone()
    }

    pub(crate) fn commit_paused(&self, context: SuspendContext, thread: Option<ThreadId>) -> bool {
        let description = match thread {
            Some(thread) => format!("Paused in {thread}"),
            None => "Paused".to_string(),
        };
        self.commit(
            State::Paused,
            SessionEvent::Pause,
            description,
            DebuggerContext::suspended(context, thread),
        )
    }

    pub(crate) fn presentable_thread(&self, threads: &[ThreadInfo]) -> Option<ThreadId> {
        let last = lock(&self.committed).last_thread;
        threads::select_presentable_thread(threads, last, &self.config.session).map(|t| t.id)
    }

    pub(crate) fn set_stepping(&self, thread: Option<ThreadId>) {
        *lock(&self.stepping) = thread;
    }

    /// The target resumed `context`
    pub(crate) fn resumed(&self, context: &SuspendContext) {
        match context.policy {
            SuspendPolicy::All => self.contexts.invalidate_all(),
            SuspendPolicy::Thread => {
                self.contexts.invalidate(context.id);
            }
        }
        self.pause_pressed.store(false, Ordering::SeqCst);
    }

    fn cancel_refresh(&self) {
        if let Some(token) = lock(&self.refresh).take() {
            token.cancel();
        }
    }

    fn signal_detached(&self) {
        *lock(&self.detached) = true;
        self.detached_changed.notify_all();
    }

    /// A detach that never reached the target still releases its waiters
    pub(crate) fn detach_abandoned(&self) {
        let mut attach = lock(&self.attach);
        if *attach == AttachState::Detaching {
            *attach = AttachState::Detached;
        }
        drop(attach);
        self.signal_detached();
    }

    /// The debuggee is gone, for whatever reason
    pub(crate) fn mark_detached(&self, description: impl Into<String>) {
        self.cancel_refresh();
        self.set_stepping(None);
        self.contexts.invalidate_all();
        self.pause_pressed.store(false, Ordering::SeqCst);
        *lock(&self.attach) = AttachState::Detached;
        self.commit(
            State::Stopped,
            SessionEvent::Detached,
            description,
            DebuggerContext::empty(),
        );
        self.signal_detached();
    }

    pub(crate) fn dispose_now(&self) {
        self.cancel_refresh();
        self.set_stepping(None);
        self.contexts.invalidate_all();
        self.commit(
            State::Disposed,
            SessionEvent::Dispose,
            "Disposed",
            DebuggerContext::empty(),
        );
        self.signal_detached();
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.cancel_refresh();
        self.scheduler.close();
    }
}
