//! Debugger session state machine
//!
//! A [`Session`] drives one debuggee through a [`Target`]. Each transition
//! (attach, pause, resume, step, detach, dispose) is a command on the
//! session's [`scheduler::CommandScheduler`], and committed states reach
//! [`SessionListener`]s on a single [`Dispatcher`] thread.
mod commands;
mod dispatch;
mod listeners;
mod session;
mod state;
mod suspend;
mod target;
mod threads;
mod utils;

pub use dispatch::{Callback, DispatchThread, Dispatcher};
pub use listeners::{ListenerId, SessionListener};
pub use session::{AttachState, Session};
pub use state::{DebuggerContext, SessionEvent, State, StateChange};
pub use suspend::{
    ContextBinding, SessionId, SuspendContext, SuspendContextId, SuspendContexts, SuspendPolicy,
};
pub use target::{
    SourcePosition, StepKind, Target, TargetError, ThreadId, ThreadInfo, ThreadStatus,
    ThreadsReply,
};
pub use threads::select_presentable_thread;
