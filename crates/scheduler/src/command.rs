//! Units of work executed by a [`CommandScheduler`]

use std::{borrow::Cow, fmt, sync::Arc};

use tokio_util::sync::CancellationToken;

use crate::{CommandScheduler, Priority, error::CommandError, request::RequestId};

/// Liveness of whatever a command is bound to, typically a suspend context
///
/// The scheduler never consults a binding on its own; commands that care wrap
/// themselves in [`BoundCommand`], which checks it right before running.
pub trait Binding: Send + Sync + fmt::Debug {
    fn is_live(&self) -> bool;
}

/// A unit of work for the scheduler
pub trait Command: Send {
    fn priority(&self) -> Priority {
        Priority::Normal
    }

    /// Name used in log output
    fn label(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn binding(&self) -> Option<Arc<dyn Binding>> {
        None
    }

    /// Commands that never outlive their own dequeue step
    fn is_sync(&self) -> bool {
        false
    }

    fn action(&mut self, cx: &CommandContext) -> Result<(), CommandError>;

    /// Called once the action returned, whether it succeeded or not
    fn on_finished(&mut self) {}

    /// Called instead of the action when the command will never run
    fn on_cancel(&mut self) {}
}

impl<C: Command + ?Sized> Command for Box<C> {
    fn priority(&self) -> Priority {
        (**self).priority()
    }

    fn label(&self) -> &str {
        (**self).label()
    }

    fn binding(&self) -> Option<Arc<dyn Binding>> {
        (**self).binding()
    }

    fn is_sync(&self) -> bool {
        (**self).is_sync()
    }

    fn action(&mut self, cx: &CommandContext) -> Result<(), CommandError> {
        (**self).action(cx)
    }

    fn on_finished(&mut self) {
        (**self).on_finished()
    }

    fn on_cancel(&mut self) {
        (**self).on_cancel()
    }
}

/// Everything a running command may need from the worker executing it
///
/// This is the explicit replacement for a "current worker" global: the
/// scheduler instance, the worker request and its cancellation token, and the
/// priority and binding the command was queued with.
#[derive(Clone)]
pub struct CommandContext {
    scheduler: CommandScheduler,
    request: RequestId,
    token: CancellationToken,
    priority: Priority,
    binding: Option<Arc<dyn Binding>>,
}

impl fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandContext")
            .field("scheduler", &self.scheduler.name())
            .field("request", &self.request)
            .field("priority", &self.priority)
            .field("binding", &self.binding)
            .finish()
    }
}

impl CommandContext {
    pub(crate) fn new(
        scheduler: CommandScheduler,
        request: RequestId,
        token: CancellationToken,
        priority: Priority,
        binding: Option<Arc<dyn Binding>>,
    ) -> Self {
        Self {
            scheduler,
            request,
            token,
            priority,
            binding,
        }
    }

    pub fn scheduler(&self) -> &CommandScheduler {
        &self.scheduler
    }

    pub fn request_id(&self) -> RequestId {
        self.request
    }

    /// Cancelled when the worker request running this command is asked to stop
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Bail out of a long running action if its worker has been replaced
    pub fn check_cancelled(&self) -> Result<(), CommandError> {
        if self.token.is_cancelled() {
            return Err(CommandError::Cancelled);
        }
        Ok(())
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn binding(&self) -> Option<&Arc<dyn Binding>> {
        self.binding.as_ref()
    }
}

type Action = Box<dyn FnOnce(&CommandContext) -> Result<(), CommandError> + Send>;
type Hook = Box<dyn FnOnce() + Send>;

/// A [`Command`] assembled from closures
pub struct FnCommand {
    label: Cow<'static, str>,
    priority: Priority,
    action: Option<Action>,
    on_cancel: Option<Hook>,
    on_finished: Option<Hook>,
    binding: Option<Arc<dyn Binding>>,
    sync: bool,
}

impl FnCommand {
    pub fn new<F>(priority: Priority, label: impl Into<Cow<'static, str>>, action: F) -> Self
    where
        F: FnOnce(&CommandContext) -> Result<(), CommandError> + Send + 'static,
    {
        Self {
            label: label.into(),
            priority,
            action: Some(Box::new(action)),
            on_cancel: None,
            on_finished: None,
            binding: None,
            sync: false,
        }
    }

    pub fn with_cancel<F>(mut self, on_cancel: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_cancel = Some(Box::new(on_cancel));
        self
    }

    pub fn with_finished<F>(mut self, on_finished: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_finished = Some(Box::new(on_finished));
        self
    }

    pub fn bound_to(mut self, binding: Arc<dyn Binding>) -> Self {
        self.binding = Some(binding);
        self
    }

    pub fn sync(mut self) -> Self {
        self.sync = true;
        self
    }
}

impl fmt::Debug for FnCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnCommand")
            .field("label", &self.label)
            .field("priority", &self.priority)
            .field("binding", &self.binding)
            .finish_non_exhaustive()
    }
}

impl Command for FnCommand {
    fn priority(&self) -> Priority {
        self.priority
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn binding(&self) -> Option<Arc<dyn Binding>> {
        self.binding.clone()
    }

    fn is_sync(&self) -> bool {
        self.sync
    }

    fn action(&mut self, cx: &CommandContext) -> Result<(), CommandError> {
        match self.action.take() {
            Some(action) => action(cx),
            None => Ok(()),
        }
    }

    fn on_finished(&mut self) {
        if let Some(hook) = self.on_finished.take() {
            hook();
        }
    }

    fn on_cancel(&mut self) {
        if let Some(hook) = self.on_cancel.take() {
            hook();
        }
    }
}

/// Runs the wrapped command only while its binding is still live
///
/// A stale binding turns the action into a cancellation: the inner command's
/// `on_cancel` runs and its action and `on_finished` do not.
#[derive(Debug)]
pub struct BoundCommand<C> {
    inner: C,
    stale: bool,
}

impl<C: Command> BoundCommand<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            stale: false,
        }
    }
}

impl<C: Command> Command for BoundCommand<C> {
    fn priority(&self) -> Priority {
        self.inner.priority()
    }

    fn label(&self) -> &str {
        self.inner.label()
    }

    fn binding(&self) -> Option<Arc<dyn Binding>> {
        self.inner.binding()
    }

    fn is_sync(&self) -> bool {
        self.inner.is_sync()
    }

    fn action(&mut self, cx: &CommandContext) -> Result<(), CommandError> {
        if let Some(binding) = self.inner.binding() {
            if !binding.is_live() {
                tracing::debug!(command = %self.inner.label(), ?binding, "binding no longer live, cancelling");
                self.stale = true;
                self.inner.on_cancel();
                return Ok(());
            }
        }
        self.inner.action(cx)
    }

    fn on_finished(&mut self) {
        if !self.stale {
            self.inner.on_finished();
        }
    }

    fn on_cancel(&mut self) {
        self.inner.on_cancel();
    }
}
