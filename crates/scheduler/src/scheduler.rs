//! The logical single worker serialising every command for one debuggee
//!
//! Producers on any thread call [`CommandScheduler::schedule`]; exactly one
//! current [`WorkerRequest`] drains the queue on a pool thread. A hand-off via
//! [`CommandScheduler::switch_to_request`] lets queued work carry on even while
//! the previous worker is stuck inside a command that never returns.

use std::{
    any::Any,
    collections::HashMap,
    fmt,
    ops::ControlFlow,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, ThreadId},
    time::Duration,
};

use tokio::runtime::Handle;

use crate::{
    Binding, Command, CommandContext, Priority,
    error::CommandError,
    queue::{PriorityQueue, QueueItem},
    request::{FinishGuard, RequestId, WorkerRequest},
    utils::lock,
};

struct Envelope {
    command: Box<dyn Command>,
    priority: Priority,
}

impl QueueItem for Envelope {
    fn is_sync(&self) -> bool {
        self.command.is_sync()
    }
}

struct Shared {
    name: String,
    queue: PriorityQueue<Envelope>,
    current: Mutex<Option<Arc<WorkerRequest>>>,
    /// Which pool thread is running which request
    workers: Mutex<HashMap<ThreadId, RequestId>>,
    pool: Handle,
    next_request: AtomicU64,
}

/// Handle to one logical scheduler; cheap to clone
#[derive(Clone)]
pub struct CommandScheduler {
    shared: Arc<Shared>,
}

impl fmt::Debug for CommandScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandScheduler")
            .field("name", &self.shared.name)
            .field("queued", &self.shared.queue.len())
            .field("closed", &self.shared.queue.is_closed())
            .finish()
    }
}

impl CommandScheduler {
    /// Create a scheduler whose workers run on `pool`
    ///
    /// No worker runs until [`CommandScheduler::start`] is called, but commands
    /// may be queued before that.
    pub fn new(name: impl Into<String>, pool: Handle) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                queue: PriorityQueue::new(),
                current: Mutex::new(None),
                workers: Mutex::new(HashMap::new()),
                pool,
                next_request: AtomicU64::new(1),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Start a worker unless a live one is already current
    pub fn start(&self) -> Arc<WorkerRequest> {
        if let Some(current) = self.current_request() {
            if !current.is_finished() && !current.is_stop_requested() {
                return current;
            }
        }
        self.switch_to_request()
    }

    /// Re-open a closed scheduler and start a fresh worker
    pub fn restart_worker(&self) -> Arc<WorkerRequest> {
        tracing::debug!(scheduler = %self.name(), "restarting scheduler");
        self.shared.queue.reopen();
        self.switch_to_request()
    }

    /// Queue `command` at the tail of its priority bucket
    ///
    /// Returns `false` if the scheduler is closed; the command's `on_cancel` has
    /// then already been called.
    pub fn schedule(&self, command: impl Command + 'static) -> bool {
        self.enqueue(Box::new(command), false)
    }

    /// Queue `command` ahead of everything else at its priority
    pub fn push_back(&self, command: impl Command + 'static) -> bool {
        self.enqueue(Box::new(command), true)
    }

    fn enqueue(&self, command: Box<dyn Command>, front: bool) -> bool {
        let priority = command.priority();
        let envelope = Envelope { command, priority };
        let result = if front {
            self.shared.queue.push_back(envelope, priority)
        } else {
            self.shared.queue.put(envelope, priority)
        };
        match result {
            Ok(()) => true,
            Err(rejected) => {
                tracing::debug!(
                    scheduler = %self.name(),
                    command = %rejected.command.label(),
                    "scheduler closed, rejecting command"
                );
                cancel(rejected.command);
                false
            }
        }
    }

    /// Run `command` on the worker and block until it finished
    ///
    /// Returns `false` if the command was cancelled instead of run. Called from
    /// the scheduler's own worker the command runs inline, since waiting on the
    /// queue from there would never return.
    pub fn invoke_and_wait(&self, command: impl Command + 'static) -> bool {
        if self.is_worker_thread() {
            return self.run_inline(command);
        }

        let (tx, rx) = oneshot::channel();
        let waiting = Completion {
            inner: command,
            done: Some(tx),
        };
        if !self.schedule(waiting) {
            return false;
        }
        rx.recv().unwrap_or(false)
    }

    /// Queue `command`, and if it has not started after `timeout` while the same
    /// worker is still current, hand off to a new worker so it gets to run
    #[tracing::instrument(skip(self, command), fields(scheduler = %self.name()))]
    pub fn terminate_and_invoke(&self, command: impl Command + 'static, timeout: Duration) -> bool {
        let observed = self.current_request();
        let started = Arc::new(AtomicBool::new(false));
        let tracked = Tracked {
            inner: command,
            started: Arc::clone(&started),
        };
        if !self.schedule(tracked) {
            return false;
        }

        let Some(observed) = observed else {
            return true;
        };
        let scheduler = self.clone();
        self.shared.pool.spawn(async move {
            tokio::time::sleep(timeout).await;
            if started.load(Ordering::SeqCst) || scheduler.is_closed() {
                return;
            }
            if scheduler.is_current(&observed) {
                tracing::warn!(
                    scheduler = %scheduler.name(),
                    request_id = %observed.id(),
                    ?timeout,
                    "worker did not reach terminating command in time, switching worker"
                );
                scheduler.switch_to_request();
            }
        });
        true
    }

    /// Make a fresh worker request current, then stop the previous one
    ///
    /// The new worker starts consuming the queue immediately. The old one exits
    /// once its in-flight command (if any) returns, without running another one.
    pub fn switch_to_request(&self) -> Arc<WorkerRequest> {
        let id = RequestId(self.shared.next_request.fetch_add(1, Ordering::SeqCst));
        let (request, guard) = WorkerRequest::new(id);

        let previous = {
            let mut current = lock(&self.shared.current);
            let previous = current.replace(Arc::clone(&request));
            self.spawn_worker(&request, guard);
            previous
        };

        if let Some(previous) = previous {
            tracing::debug!(
                scheduler = %self.name(),
                previous = %previous.id(),
                next = %request.id(),
                "switching worker request"
            );
            previous.stop();
        }
        request
    }

    fn spawn_worker(&self, request: &Arc<WorkerRequest>, guard: FinishGuard) {
        let scheduler = self.clone();
        let worker = Arc::clone(request);
        let handle = self.shared.pool.spawn_blocking(move || {
            let _guard = guard;
            scheduler.run(&worker);
        });
        request.attach(handle);
    }

    /// Close the queue; the worker drains what is left through cancellation hooks
    pub fn close(&self) {
        tracing::debug!(scheduler = %self.name(), "closing scheduler");
        self.shared.queue.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.queue.is_closed()
    }

    pub fn current_request(&self) -> Option<Arc<WorkerRequest>> {
        lock(&self.shared.current).clone()
    }

    fn is_current(&self, request: &Arc<WorkerRequest>) -> bool {
        lock(&self.shared.current)
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, request))
    }

    fn current_worker_id(&self) -> Option<RequestId> {
        let thread = thread::current().id();
        let id = lock(&self.shared.workers).get(&thread).copied()?;
        self.current_request()
            .filter(|current| current.id() == id)
            .map(|_| id)
    }

    /// Whether the calling thread is this scheduler's current worker
    pub fn is_worker_thread(&self) -> bool {
        self.current_worker_id().is_some()
    }

    pub fn has_async_commands(&self) -> bool {
        self.shared.queue.has_async_commands()
    }

    /// Number of commands waiting to run
    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }

    /// Build the context a command would see if it ran right now on this thread
    pub(crate) fn context_for_current_thread(
        &self,
        priority: Priority,
        binding: Option<Arc<dyn Binding>>,
    ) -> Option<CommandContext> {
        let request = self.current_request()?;
        let id = self.current_worker_id()?;
        Some(CommandContext::new(
            self.clone(),
            id,
            request.token().clone(),
            priority,
            binding,
        ))
    }

    /// Execute `command` on the calling worker thread, bypassing the queue
    pub(crate) fn run_inline(&self, command: impl Command + 'static) -> bool {
        let mut command: Box<dyn Command> = Box::new(command);
        let Some(cx) = self.context_for_current_thread(command.priority(), command.binding())
        else {
            // not on the worker after all, go through the queue
            return self.enqueue(command, false);
        };
        // a disconnect already closed the queue, the outer loop stops on its next dequeue
        let _ = self.execute(command.as_mut(), &cx);
        true
    }

    fn run(&self, request: &Arc<WorkerRequest>) {
        let thread = thread::current().id();
        lock(&self.shared.workers).insert(thread, request.id());
        tracing::debug!(scheduler = %self.name(), request_id = %request.id(), "worker started");

        loop {
            if request.is_stop_requested() {
                tracing::debug!(request_id = %request.id(), "stop requested");
                break;
            }
            if !self.is_current(request) {
                tracing::debug!(request_id = %request.id(), "worker request replaced");
                break;
            }

            let envelope = match self.shared.queue.get() {
                Ok(envelope) => envelope,
                Err(_) => {
                    tracing::debug!(request_id = %request.id(), "queue closed");
                    break;
                }
            };

            if !self.is_current(request) {
                // replaced while blocked in `get`, leave this one to the new worker
                let priority = envelope.priority;
                if let Err(rejected) = self.shared.queue.push_back(envelope, priority) {
                    cancel(rejected.command);
                }
                break;
            }

            let Envelope {
                mut command,
                priority,
            } = envelope;
            let cx = CommandContext::new(
                self.clone(),
                request.id(),
                request.token().clone(),
                priority,
                command.binding(),
            );
            if self.execute(command.as_mut(), &cx).is_break() {
                break;
            }
        }

        lock(&self.shared.workers).remove(&thread);
        if self.is_current(request) {
            self.process_remaining();
        }
        tracing::debug!(scheduler = %self.name(), request_id = %request.id(), "worker stopped");
    }

    fn execute(&self, command: &mut dyn Command, cx: &CommandContext) -> ControlFlow<()> {
        tracing::trace!(command = %command.label(), priority = %cx.priority(), "running command");
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| command.action(cx)));

        let flow = match outcome {
            Ok(Ok(())) => ControlFlow::Continue(()),
            Ok(Err(CommandError::Cancelled)) => {
                tracing::debug!(command = %command.label(), "command cancelled");
                ControlFlow::Continue(())
            }
            Ok(Err(CommandError::Disconnected)) => {
                tracing::warn!(
                    scheduler = %self.name(),
                    command = %command.label(),
                    "remote target disconnected, stopping worker"
                );
                self.shared.queue.close();
                ControlFlow::Break(())
            }
            Ok(Err(CommandError::QueueClosed)) => ControlFlow::Break(()),
            Ok(Err(CommandError::Failed(e))) => {
                tracing::error!(command = %command.label(), error = ?e, "command failed");
                ControlFlow::Continue(())
            }
            Err(payload) => {
                tracing::error!(
                    command = %command.label(),
                    panic = panic_message(payload.as_ref()),
                    "command panicked"
                );
                ControlFlow::Continue(())
            }
        };

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| command.on_finished())) {
            tracing::error!(
                command = %command.label(),
                panic = panic_message(payload.as_ref()),
                "completion hook panicked"
            );
        }
        flow
    }

    fn process_remaining(&self) {
        let remaining = self.shared.queue.clear_queue();
        if remaining.is_empty() {
            return;
        }
        tracing::debug!(
            scheduler = %self.name(),
            count = remaining.len(),
            "cancelling remaining commands"
        );
        for envelope in remaining {
            cancel(envelope.command);
        }
    }
}

fn cancel(mut command: Box<dyn Command>) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| command.on_cancel())) {
        tracing::error!(
            command = %command.label(),
            panic = panic_message(payload.as_ref()),
            "cancellation hook panicked"
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Reports through a oneshot whether the wrapped command ran or was cancelled
struct Completion<C> {
    inner: C,
    done: Option<oneshot::Sender<bool>>,
}

impl<C> Completion<C> {
    fn signal(&mut self, ran: bool) {
        if let Some(done) = self.done.take() {
            let _ = done.send(ran);
        }
    }
}

impl<C: Command> Command for Completion<C> {
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
        self.inner.action(cx)
    }

    fn on_finished(&mut self) {
        self.inner.on_finished();
        self.signal(true);
    }

    fn on_cancel(&mut self) {
        self.inner.on_cancel();
        self.signal(false);
    }
}

/// Records that the wrapped command reached the worker
struct Tracked<C> {
    inner: C,
    started: Arc<AtomicBool>,
}

impl<C: Command> Command for Tracked<C> {
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
        self.started.store(true, Ordering::SeqCst);
        self.inner.action(cx)
    }

    fn on_finished(&mut self) {
        self.inner.on_finished();
    }

    fn on_cancel(&mut self) {
        self.started.store(true, Ordering::SeqCst);
        self.inner.on_cancel();
    }
}
