//! Serialised execution of debugger commands
//!
//! Every interaction with a debuggee is a [`Command`] queued on a
//! [`CommandScheduler`]. Commands run one at a time, most urgent first and FIFO
//! within a [`Priority`], on a single worker borrowed from a [`WorkerPool`].
//! Results of asynchronous target calls come back onto the worker through
//! [`Reentry`].

mod command;
mod error;
mod pool;
mod priority;
mod queue;
mod reentry;
mod request;
mod scheduler;
mod utils;

pub use command::{Binding, BoundCommand, Command, CommandContext, FnCommand};
pub use error::{CommandError, QueueClosed};
pub use pool::WorkerPool;
pub use priority::Priority;
pub use queue::{PriorityQueue, QueueItem};
pub use reentry::Reentry;
pub use request::{RequestId, WorkerRequest};
pub use scheduler::CommandScheduler;
