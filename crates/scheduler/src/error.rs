//! Error types for the command scheduler.

/// Returned by a blocking dequeue once the queue has been closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("command queue closed")]
pub struct QueueClosed;

/// Outcome of a failed command action
///
/// Only [`CommandError::Disconnected`] and [`CommandError::QueueClosed`] stop the
/// worker loop; everything else is isolated to the command that produced it.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The remote target went away. Terminal for the scheduler.
    #[error("remote target disconnected")]
    Disconnected,

    /// The command observed a cancellation request and gave up.
    #[error("operation cancelled")]
    Cancelled,

    /// The command queue was closed while the command was running.
    #[error("command queue closed")]
    QueueClosed,

    /// Any other failure; logged at the worker loop boundary.
    #[error(transparent)]
    Failed(#[from] eyre::Report),
}

impl From<QueueClosed> for CommandError {
    fn from(_: QueueClosed) -> Self {
        CommandError::QueueClosed
    }
}

impl CommandError {
    /// Whether this error ends the worker loop
    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandError::Disconnected | CommandError::QueueClosed)
    }
}
