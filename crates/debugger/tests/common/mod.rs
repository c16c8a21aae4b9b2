#![allow(dead_code)]

use std::{
    collections::VecDeque,
    io::IsTerminal,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use config::Config;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use debugger::{
    DispatchThread, Session, SessionEvent, State, StateChange, StepKind, SuspendContext,
    SuspendContextId, SuspendPolicy, Target, TargetError, ThreadId, ThreadInfo, ThreadStatus,
    ThreadsReply,
};
use scheduler::WorkerPool;
use tracing_subscriber::EnvFilter;

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let in_ci = std::env::var("CI")
        .map(|val| val == "true")
        .unwrap_or(false);

    if std::io::stderr().is_terminal() || in_ci {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .json()
            .try_init();
    }

    // error traces
    let _ = color_eyre::install();
}

/// Requests the session made against the fake target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetCall {
    SuspendAll,
    Resume(SuspendContextId),
    PrepareStep(ThreadId, StepKind),
    Threads,
    Detach(bool),
}

/// In-memory debuggee
pub struct FakeTarget {
    calls: Sender<TargetCall>,
    threads: Vec<ThreadInfo>,
    resume_gate: Mutex<Option<Receiver<()>>>,
    resume_error: Mutex<Option<TargetError>>,
    threads_error: Mutex<Option<TargetError>>,
}

impl FakeTarget {
    fn new(threads: Vec<ThreadInfo>) -> (Self, Receiver<TargetCall>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let target = Self {
            calls: tx,
            threads,
            resume_gate: Mutex::new(None),
            resume_error: Mutex::new(None),
            threads_error: Mutex::new(None),
        };
        (target, rx)
    }

    /// Make the next resume block until the returned sender is dropped
    pub fn hold_next_resume(&self) -> Sender<()> {
        let (tx, rx) = crossbeam_channel::bounded(0);
        *self.resume_gate.lock().unwrap() = Some(rx);
        tx
    }

    pub fn fail_next_resume(&self, error: TargetError) {
        *self.resume_error.lock().unwrap() = Some(error);
    }

    pub fn fail_next_threads(&self, error: TargetError) {
        *self.threads_error.lock().unwrap() = Some(error);
    }

    fn record(&self, call: TargetCall) {
        tracing::debug!(?call, "fake target call");
        let _ = self.calls.send(call);
    }
}

impl Target for FakeTarget {
    fn suspend_all(&self) -> Result<(), TargetError> {
        self.record(TargetCall::SuspendAll);
        Ok(())
    }

    fn resume(&self, context: &SuspendContext) -> Result<(), TargetError> {
        self.record(TargetCall::Resume(context.id));
        let gate = self.resume_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.recv();
        }
        match self.resume_error.lock().unwrap().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn prepare_step(&self, thread: ThreadId, kind: &StepKind) -> Result<(), TargetError> {
        self.record(TargetCall::PrepareStep(thread, kind.clone()));
        Ok(())
    }

    fn threads(&self, reply: ThreadsReply) {
        self.record(TargetCall::Threads);
        let result = match self.threads_error.lock().unwrap().take() {
            Some(error) => Err(error),
            None => Ok(self.threads.clone()),
        };
        // replies arrive on the protocol reader thread
        thread::spawn(move || reply(result));
    }

    fn detach(&self, terminate: bool) -> Result<(), TargetError> {
        self.record(TargetCall::Detach(terminate));
        Ok(())
    }
}

pub fn thread_info(id: u64, name: &str, status: ThreadStatus, frame_count: usize) -> ThreadInfo {
    ThreadInfo {
        id: ThreadId(id),
        name: name.to_string(),
        status,
        frame_count,
    }
}

/// Test harness wrapping a session, buffering the state changes it delivers
pub struct SessionHarness {
    pub session: Session,
    pub target: Arc<FakeTarget>,
    changes: Receiver<StateChange>,
    buffer: VecDeque<StateChange>,
    calls: Receiver<TargetCall>,
    call_buffer: VecDeque<TargetCall>,
    dispatcher: Arc<DispatchThread>,
    _pool: WorkerPool,
}

impl SessionHarness {
    pub fn new() -> eyre::Result<Self> {
        Self::with_config(Config::default(), Vec::new())
    }

    pub fn with_config(config: Config, threads: Vec<ThreadInfo>) -> eyre::Result<Self> {
        let pool = WorkerPool::new(config.scheduler.pool_threads)?;
        let dispatcher = Arc::new(DispatchThread::spawn("test-dispatch")?);
        let (target, calls) = FakeTarget::new(threads);
        let target = Arc::new(target);

        let session = Session::new(
            "test",
            &pool,
            Arc::clone(&target) as Arc<dyn Target>,
            Arc::clone(&dispatcher) as Arc<dyn debugger::Dispatcher>,
            config,
        )?;

        let (tx, changes) = crossbeam_channel::unbounded();
        session.add_listener(move |change: &StateChange| {
            let _ = tx.send(change.clone());
        });

        Ok(Self {
            session,
            target,
            changes,
            buffer: VecDeque::new(),
            calls,
            call_buffer: VecDeque::new(),
            dispatcher,
            _pool: pool,
        })
    }

    /// Wait for a state change matching the predicate, buffering the others
    #[tracing::instrument(skip(self, pred))]
    pub fn wait_for_change<F>(&mut self, message: &str, pred: F) -> StateChange
    where
        F: Fn(&StateChange) -> bool,
    {
        tracing::debug!("waiting for {message} state");
        if let Some(pos) = self.buffer.iter().position(&pred) {
            return self.buffer.remove(pos).unwrap();
        }

        loop {
            let change = match self.changes.recv_timeout(TIMEOUT) {
                Ok(change) => change,
                Err(RecvTimeoutError::Timeout) => {
                    panic!("timeout waiting for {message} state, buffered: {:?}", self.buffer);
                }
                Err(RecvTimeoutError::Disconnected) => {
                    panic!("listener disconnected while waiting for {message} state");
                }
            };

            if pred(&change) {
                tracing::debug!(?change, "received expected state");
                return change;
            }
            tracing::trace!(?change, "non-matching state, buffering for later");
            self.buffer.push_back(change);
        }
    }

    pub fn wait_for_state(&mut self, state: State, event: SessionEvent) -> StateChange {
        self.wait_for_change(&format!("{state}/{event:?}"), |c| {
            c.state == state && c.event == event
        })
    }

    /// Every state delivered so far, in order, buffered ones first
    pub fn drain_changes(&mut self) -> Vec<StateChange> {
        assert!(self.dispatcher.flush(TIMEOUT), "dispatch thread stalled");
        let mut all: Vec<_> = self.buffer.drain(..).collect();
        all.extend(self.changes.try_iter());
        all
    }

    /// Assert that nothing new reaches listeners for a while
    pub fn expect_quiet(&mut self, window: Duration) {
        if let Ok(change) = self.changes.recv_timeout(window) {
            panic!("unexpected state change {change:?}");
        }
    }

    pub fn wait_for_call<F>(&mut self, message: &str, pred: F) -> TargetCall
    where
        F: Fn(&TargetCall) -> bool,
    {
        if let Some(pos) = self.call_buffer.iter().position(&pred) {
            return self.call_buffer.remove(pos).unwrap();
        }
        loop {
            let call = self
                .calls
                .recv_timeout(TIMEOUT)
                .unwrap_or_else(|_| panic!("timeout waiting for {message} call"));
            if pred(&call) {
                return call;
            }
            self.call_buffer.push_back(call);
        }
    }

    /// Let every command queued so far run
    pub fn settle(&self) {
        let done = self
            .session
            .scheduler()
            .invoke_and_wait(scheduler::FnCommand::new(
                scheduler::Priority::Lowest,
                "settle",
                |_| Ok(()),
            ));
        assert!(done, "scheduler closed while settling");
        assert!(self.dispatcher.flush(TIMEOUT), "dispatch thread stalled");
    }

    pub fn attach(&mut self) {
        assert!(self.session.start_wait_attach());
        assert!(self.session.attached());
        self.wait_for_state(State::Running, SessionEvent::Attached);
    }

    /// Report a stop of `thread` and wait until it is committed
    pub fn stop_in(&mut self, thread: u64) -> SuspendContext {
        let context = self
            .session
            .suspend_contexts()
            .push(Some(ThreadId(thread)), SuspendPolicy::Thread);
        assert!(self.session.paused(context.clone()));
        self.wait_for_state(State::Paused, SessionEvent::Pause);
        context
    }
}
