use std::fmt;

use crate::{suspend::SuspendContext, target::ThreadId};

/// Observable state of a debugger session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Stopped,
    Running,
    WaitingAttach,
    Paused,
    /// A resume or step was issued and the target has not confirmed it yet
    WaitingEvaluation,
    /// Terminal; nothing is committed after it
    Disposed,
}

impl State {
    pub fn is_terminal(self) -> bool {
        self == State::Disposed
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Stopped => "stopped",
            State::Running => "running",
            State::WaitingAttach => "waiting for attach",
            State::Paused => "paused",
            State::WaitingEvaluation => "waiting for evaluation",
            State::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

/// Why a state was committed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    Attached,
    Detached,
    Pause,
    Resume,
    Step,
    Context,
    Refresh,
    Dispose,
}

/// Where the user is looking while the debuggee is suspended
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebuggerContext {
    pub suspend_context: Option<SuspendContext>,
    pub thread: Option<ThreadId>,
    /// Index into the thread's stack, 0 being the top frame
    pub frame: Option<usize>,
}

impl DebuggerContext {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The top frame of `thread` in `context`
    pub fn suspended(context: SuspendContext, thread: Option<ThreadId>) -> Self {
        Self {
            suspend_context: Some(context),
            thread,
            frame: thread.map(|_| 0),
        }
    }
}

/// One committed state, as delivered to listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub state: State,
    pub event: SessionEvent,
    pub description: String,
    pub context: DebuggerContext,
}
