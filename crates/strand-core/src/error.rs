//! Error types for the fiber runtime

use core::fmt;

/// Result type for runtime operations
pub type FiberResult<T> = Result<T, FiberError>;

/// Errors that can occur in runtime operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FiberError {
    /// Resume was called on a fiber that already finished
    #[error("fiber is already done")]
    ResumeDone,

    /// An operation that requires a fiber was called from plain thread
    /// context
    #[error("no current fiber on this thread")]
    NotInFiber,

    /// The runtime has not been started or is shutting down
    #[error("scheduler is not running")]
    NotRunning,

    /// The global scheduler was initialized twice
    #[error("scheduler already initialized")]
    AlreadyInitialized,

    /// A mutex contract was violated (unlock of an unlocked mutex)
    #[error("mutex is not locked")]
    NotLocked,

    /// A mutex contract was violated (unlock by a non-owner)
    #[error("mutex is not owned by the current fiber")]
    NotOwner,

    /// A wait group counter would go negative
    #[error("wait group counter cannot go negative")]
    NegativeCounter,

    /// Channel was closed
    #[error("channel closed")]
    ChannelClosed,

    /// Stack mapping failed; carries the raw OS error
    #[error("stack allocation failed: os error {0}")]
    StackAllocation(i32),

    /// Reactor or notifier creation failed; carries the raw OS error
    #[error("reactor initialization failed: os error {0}")]
    ReactorInit(i32),

    /// Worker thread could not be spawned
    #[error("failed to spawn worker thread")]
    SpawnFailed,

    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Result type for the I/O facade
pub type IoResult<T> = Result<T, IoError>;

/// Errors surfaced by the I/O facade.
///
/// The facade never panics: every call resolves to a value or one of
/// these. `Os` carries the untranslated errno; `TimedOut` stands in for
/// `ETIMEDOUT`, `Cancelled` for a wait torn down by close or shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IoError {
    #[error("operation timed out")]
    TimedOut,

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O must be called from within a fiber")]
    NotInFiber,

    #[error("os error {0}")]
    Os(i32),
}

/// Error returned when trying to send on a full or closed channel.
/// Carries the value back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrySendError<T> {
    Full(T),
    Closed(T),
}

impl<T> TrySendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(v) | TrySendError::Closed(v) => v,
        }
    }
}

impl<T> fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => write!(f, "channel full"),
            TrySendError::Closed(_) => write!(f, "channel closed"),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for TrySendError<T> {}

/// Error returned when trying to receive from an empty channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TryRecvError {
    #[error("channel empty")]
    Empty,

    #[error("channel closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            format!("{}", FiberError::ResumeDone),
            "fiber is already done"
        );
        assert_eq!(
            format!("{}", FiberError::StackAllocation(12)),
            "stack allocation failed: os error 12"
        );
        assert_eq!(format!("{}", IoError::TimedOut), "operation timed out");
        assert_eq!(format!("{}", IoError::Os(104)), "os error 104");
    }

    #[test]
    fn test_try_send_error_returns_value() {
        let err = TrySendError::Full(41);
        assert_eq!(err.into_inner(), 41);
    }
}
