//! The protocol layer driving the debuggee, as seen by a session

use std::{fmt, path::PathBuf};

use scheduler::CommandError;

use crate::suspend::SuspendContext;

/// Identity of a debuggee thread, as reported by the protocol layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Running,
    Sleeping,
    Waiting,
    Monitor,
    Zombie,
    NotStarted,
    Unknown,
}

/// Snapshot of one debuggee thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub name: String,
    pub status: ThreadStatus,
    /// Number of stack frames while suspended
    pub frame_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePosition {
    pub path: PathBuf,
    pub line: usize,
}

/// What the target should do when the suspended thread is next resumed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepKind {
    Into,
    Over,
    Out,
    RunToCursor(SourcePosition),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TargetError {
    /// The debuggee connection is gone
    #[error("target disconnected")]
    Disconnected,

    /// The target refused or failed a request
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<TargetError> for CommandError {
    fn from(value: TargetError) -> Self {
        match value {
            TargetError::Disconnected => CommandError::Disconnected,
            other => CommandError::Failed(eyre::Report::new(other)),
        }
    }
}

/// Completion of [`Target::threads`], called on whichever thread the protocol
/// layer delivers replies on
pub type ThreadsReply = Box<dyn FnOnce(Result<Vec<ThreadInfo>, TargetError>) + Send>;

/// Operations a session issues against the debuggee
///
/// Every method is only ever called from the session's scheduler worker.
pub trait Target: Send + Sync {
    /// Suspend every thread; the protocol layer reports the stop through
    /// [`Session::paused`](crate::Session::paused).
    fn suspend_all(&self) -> Result<(), TargetError>;

    fn resume(&self, context: &SuspendContext) -> Result<(), TargetError>;

    /// Arrange for `thread` to stop again after `kind` once it resumes
    fn prepare_step(&self, thread: ThreadId, kind: &StepKind) -> Result<(), TargetError>;

    /// List the debuggee's threads asynchronously
    fn threads(&self, reply: ThreadsReply);

    fn detach(&self, terminate: bool) -> Result<(), TargetError>;
}
