//! Session transitions that run as scheduler commands
//!
//! Commands only hold a weak reference to their session, so a queued
//! transition never keeps a dropped session alive; it just does nothing.

use std::sync::{Arc, Weak};

use scheduler::{
    Binding, BoundCommand, Command, CommandContext, CommandError, Priority, Reentry,
};

use crate::{
    session::SessionInner,
    state::{DebuggerContext, SessionEvent, State},
    suspend::SuspendContext,
    target::{StepKind, TargetError, ThreadId},
};

/// Commit a stop of the debuggee, bound to its suspend context
///
/// Scheduled wrapped in a [`scheduler::BoundCommand`], so a context resumed in
/// the meantime turns this into a no-op.
pub(crate) struct Paused {
    session: Weak<SessionInner>,
    context: SuspendContext,
    binding: Arc<dyn Binding>,
}

impl Paused {
    pub(crate) fn new(
        session: Weak<SessionInner>,
        context: SuspendContext,
        binding: Arc<dyn Binding>,
    ) -> Self {
        Self {
            session,
            context,
            binding,
        }
    }
}

impl Command for Paused {
    fn priority(&self) -> Priority {
        Priority::High
    }

    fn label(&self) -> &str {
        "paused"
    }

    fn binding(&self) -> Option<Arc<dyn Binding>> {
        Some(Arc::clone(&self.binding))
    }

    fn action(&mut self, cx: &CommandContext) -> Result<(), CommandError> {
        let Some(session) = self.session.upgrade() else {
            return Ok(());
        };

        if let Some(thread) = self.context.thread {
            session.commit_paused(self.context.clone(), Some(thread));
            return Ok(());
        }

        // everything is suspended, find a thread worth showing
        tracing::debug!(session = %session.id(), context = %self.context.id, "listing threads for pause");
        let reentry = Reentry::capture(cx);
        let weak = self.session.clone();
        let context = self.context.clone();
        session.target.threads(Box::new(move |result| {
            reentry.complete_with(
                "present paused thread",
                move |_| {
                    let Some(session) = weak.upgrade() else {
                        return Ok(());
                    };
                    let thread = match result {
                        Ok(threads) => session.presentable_thread(&threads),
                        Err(TargetError::Disconnected) => {
                            session.mark_detached("Lost connection to the debuggee");
                            return Err(CommandError::Disconnected);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "listing threads failed");
                            None
                        }
                    };
                    session.commit_paused(context, thread);
                    Ok(())
                },
                || tracing::debug!("suspend context resumed before its threads were listed"),
            );
        }));
        Ok(())
    }

    fn on_cancel(&mut self) {
        tracing::debug!(context = %self.context.id, "discarding pause of a resumed suspend context");
    }
}

/// Settle on a stop that is still live instead of reporting `Running`
///
/// A whole-process stop goes back through [`Paused`] so a thread gets picked.
fn present_live(
    weak: &Weak<SessionInner>,
    session: &SessionInner,
    live: SuspendContext,
    cx: &CommandContext,
) {
    let shown = session.context();
    let already_shown = session.state() == State::Paused
        && shown.suspend_context.as_ref().is_some_and(|c| c.id == live.id);
    if already_shown {
        return;
    }

    if let Some(thread) = live.thread {
        session.commit_paused(live, Some(thread));
        return;
    }

    let binding = session.contexts.binding(live.id);
    let id = live.id;
    if !cx
        .scheduler()
        .push_back(BoundCommand::new(Paused::new(weak.clone(), live, binding)))
    {
        tracing::debug!(context = %id, "scheduler closed before the stop could be presented");
    }
}

/// Resume the debuggee, optionally arming a step first
///
/// Not bound to the suspend context it resumes: a resume must never wait
/// behind commands bound to a stale context.
pub(crate) struct Resume {
    session: Weak<SessionInner>,
    /// What was committed before the optimistic update
    previous: DebuggerContext,
    step: Option<(ThreadId, StepKind)>,
}

impl Resume {
    pub(crate) fn new(
        session: Weak<SessionInner>,
        previous: DebuggerContext,
        step: Option<(ThreadId, StepKind)>,
    ) -> Self {
        Self {
            session,
            previous,
            step,
        }
    }

    fn event(&self) -> SessionEvent {
        if self.step.is_some() {
            SessionEvent::Step
        } else {
            SessionEvent::Resume
        }
    }

    /// Put the session back where it was before the optimistic update
    fn restore(&self, session: &SessionInner, description: String) {
        session.set_stepping(None);
        session.commit(
            State::Paused,
            SessionEvent::Context,
            description,
            self.previous.clone(),
        );
    }
}

impl Command for Resume {
    fn priority(&self) -> Priority {
        Priority::High
    }

    fn label(&self) -> &str {
        match self.step {
            Some((_, StepKind::Into)) => "step into",
            Some((_, StepKind::Over)) => "step over",
            Some((_, StepKind::Out)) => "step out",
            Some((_, StepKind::RunToCursor(_))) => "run to cursor",
            None => "resume",
        }
    }

    fn action(&mut self, cx: &CommandContext) -> Result<(), CommandError> {
        let Some(session) = self.session.upgrade() else {
            return Ok(());
        };
        let Some(context) = self.previous.suspend_context.clone() else {
            return Ok(());
        };

        if !session.contexts.is_live(context.id) {
            // resumed behind our back, report whatever stop is current instead
            tracing::debug!(context = %context.id, "suspend context already resumed");
            match session.contexts.latest_live() {
                Some(live) => present_live(&self.session, &session, live, cx),
                None => {
                    session.commit(
                        State::Running,
                        self.event(),
                        "Running",
                        DebuggerContext::empty(),
                    );
                }
            }
            return Ok(());
        }

        let outcome = match &self.step {
            Some((thread, kind)) => session.target.prepare_step(*thread, kind),
            None => Ok(()),
        }
        .and_then(|()| session.target.resume(&context));

        match outcome {
            Ok(()) => {
                session.resumed(&context);
                match session.contexts.latest_live() {
                    // another thread stopped before we got here
                    Some(live) => present_live(&self.session, &session, live, cx),
                    None => {
                        session.commit(
                            State::Running,
                            self.event(),
                            "Running",
                            DebuggerContext::empty(),
                        );
                    }
                }
                Ok(())
            }
            Err(TargetError::Disconnected) => {
                session.mark_detached("Lost connection to the debuggee");
                Err(CommandError::Disconnected)
            }
            Err(e) => {
                tracing::warn!(error = %e, command = %self.label(), "resume failed");
                self.restore(&session, e.to_string());
                Ok(())
            }
        }
    }

    fn on_cancel(&mut self) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        let still_suspended = self
            .previous
            .suspend_context
            .as_ref()
            .is_some_and(|context| session.contexts.is_live(context.id));
        if still_suspended && session.state() == State::WaitingEvaluation {
            self.restore(&session, "Resume cancelled".to_string());
        }
    }
}

pub(crate) struct Detach {
    session: Weak<SessionInner>,
    terminate: bool,
}

impl Detach {
    pub(crate) fn new(session: Weak<SessionInner>, terminate: bool) -> Self {
        Self { session, terminate }
    }
}

impl Command for Detach {
    fn priority(&self) -> Priority {
        Priority::High
    }

    fn label(&self) -> &str {
        if self.terminate { "terminate" } else { "detach" }
    }

    fn action(&mut self, _cx: &CommandContext) -> Result<(), CommandError> {
        let Some(session) = self.session.upgrade() else {
            return Ok(());
        };
        if let Err(e) = session.target.detach(self.terminate) {
            // gone either way
            tracing::warn!(error = %e, terminate = self.terminate, "detaching from target failed");
        }
        let description = if self.terminate {
            "Debuggee terminated"
        } else {
            "Detached from the debuggee"
        };
        session.mark_detached(description);
        Ok(())
    }

    fn on_cancel(&mut self) {
        if let Some(session) = self.session.upgrade() {
            session.detach_abandoned();
        }
    }
}

pub(crate) struct Dispose {
    session: Weak<SessionInner>,
}

impl Dispose {
    pub(crate) fn new(session: Weak<SessionInner>) -> Self {
        Self { session }
    }
}

impl Command for Dispose {
    fn label(&self) -> &str {
        "dispose"
    }

    fn action(&mut self, cx: &CommandContext) -> Result<(), CommandError> {
        // closed first, so nothing queued behind us gets accepted once Disposed is visible
        cx.scheduler().close();
        if let Some(session) = self.session.upgrade() {
            session.dispose_now();
        }
        Ok(())
    }

    /// A closed scheduler still disposes
    fn on_cancel(&mut self) {
        if let Some(session) = self.session.upgrade() {
            session.dispose_now();
        }
    }
}

/// Re-announce the current pause with a [`SessionEvent::Refresh`]
pub(crate) struct Refresh {
    session: Weak<SessionInner>,
}

impl Refresh {
    pub(crate) fn new(session: Weak<SessionInner>) -> Self {
        Self { session }
    }
}

impl Command for Refresh {
    fn priority(&self) -> Priority {
        Priority::Low
    }

    fn label(&self) -> &str {
        "refresh"
    }

    fn is_sync(&self) -> bool {
        true
    }

    fn action(&mut self, _cx: &CommandContext) -> Result<(), CommandError> {
        let Some(session) = self.session.upgrade() else {
            return Ok(());
        };
        if session.state() != State::Paused {
            tracing::trace!(state = %session.state(), "not paused, nothing to refresh");
            return Ok(());
        }
        let context = session.context();
        let live = context
            .suspend_context
            .as_ref()
            .is_some_and(|c| session.contexts.is_live(c.id));
        if live {
            session.commit(
                State::Paused,
                SessionEvent::Refresh,
                session.description(),
                context,
            );
        }
        Ok(())
    }
}
