//! Handing results of asynchronous target calls back to the worker
//!
//! A command that issues an asynchronous call captures a [`Reentry`] from its
//! context before the call goes out. Whichever thread later completes the call
//! finishes through it, and the continuation then runs on the scheduler with the
//! issuing command's priority and suspend-context binding.

use std::{borrow::Cow, fmt, sync::Arc};

use crate::{
    Binding, BoundCommand, CommandContext, CommandError, CommandScheduler, FnCommand, Priority,
};

#[derive(Clone)]
pub struct Reentry {
    scheduler: CommandScheduler,
    priority: Priority,
    binding: Option<Arc<dyn Binding>>,
}

impl fmt::Debug for Reentry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reentry")
            .field("scheduler", &self.scheduler.name())
            .field("priority", &self.priority)
            .field("binding", &self.binding)
            .finish()
    }
}

impl Reentry {
    pub fn capture(cx: &CommandContext) -> Self {
        Self {
            scheduler: cx.scheduler().clone(),
            priority: cx.priority(),
            binding: cx.binding().cloned(),
        }
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Run `continuation` on the worker
    ///
    /// Returns `false` if it was cancelled up front because the scheduler is
    /// closed.
    pub fn complete<F>(&self, label: impl Into<Cow<'static, str>>, continuation: F) -> bool
    where
        F: FnOnce(&CommandContext) -> Result<(), CommandError> + Send + 'static,
    {
        self.submit(FnCommand::new(self.priority, label, continuation))
    }

    /// Like [`Reentry::complete`], with `on_cancel` run instead when the binding
    /// went stale or the scheduler closed before the continuation could run
    pub fn complete_with<F, C>(
        &self,
        label: impl Into<Cow<'static, str>>,
        continuation: F,
        on_cancel: C,
    ) -> bool
    where
        F: FnOnce(&CommandContext) -> Result<(), CommandError> + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        self.submit(FnCommand::new(self.priority, label, continuation).with_cancel(on_cancel))
    }

    fn submit(&self, command: FnCommand) -> bool {
        let command = match &self.binding {
            Some(binding) => command.bound_to(Arc::clone(binding)),
            None => command,
        };
        let command = BoundCommand::new(command);

        if self.scheduler.is_worker_thread() {
            tracing::trace!(scheduler = %self.scheduler.name(), "completing inline on worker");
            return self.scheduler.run_inline(command);
        }
        self.scheduler.schedule(command)
    }
}
