//! Error types for the looper runtime.

use thiserror::Error;

use crate::handler::HandlerId;

/// Errors returned by looper, message and registry operations.
///
/// `NotFound` is the benign "target gone" outcome: callers should treat it as
/// a lost race with teardown rather than a bug.
#[derive(Debug, Error)]
pub enum LooperError {
    /// The target handler, looper or reply looper no longer exists, or the
    /// looper stopped while a response was awaited.
    #[error("target not found")]
    NotFound,

    /// The handler is already registered under the given id.
    #[error("handler is already registered as {0}")]
    AlreadyRegistered(HandlerId),

    /// `start` was called on a looper that is already running.
    #[error("looper is already active")]
    AlreadyActive,

    /// `stop` was called on a looper that is not running.
    #[error("looper is not active")]
    NotActive,

    /// A reply token was answered more than once.
    #[error("reply token has already been answered")]
    AlreadyAnswered,

    /// The worker thread failed.
    #[error("thread error: {0}")]
    Thread(#[from] ThreadError),
}

impl LooperError {
    /// Returns true for the "target gone" family of soft failures.
    pub fn is_not_found(&self) -> bool {
        matches!(self, LooperError::NotFound)
    }
}

/// Errors produced by the managed thread lifecycle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ThreadError {
    /// `run` was called while the thread is still running.
    #[error("thread is already running")]
    AlreadyRunning,

    /// `join` or `request_exit_and_wait` was called from the thread itself.
    #[error("operation would deadlock: called from the thread's own context")]
    WouldBlock,

    /// The OS thread could not be created.
    #[error("failed to spawn thread: {0}")]
    SpawnFailed(String),

    /// `ready_to_run` reported a failure.
    #[error("thread failed to start: {0}")]
    StartupFailed(String),

    /// The thread body panicked.
    #[error("thread panicked: {0}")]
    Panicked(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LooperError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LooperError::NotFound;
        assert_eq!(err.to_string(), "target not found");

        let err = LooperError::AlreadyRegistered(HandlerId::new(3));
        assert_eq!(err.to_string(), "handler is already registered as 3");

        let err = ThreadError::Panicked("boom".to_string());
        assert_eq!(err.to_string(), "thread panicked: boom");
    }

    #[test]
    fn test_thread_error_converts() {
        let err: LooperError = ThreadError::WouldBlock.into();
        assert!(matches!(err, LooperError::Thread(ThreadError::WouldBlock)));
        assert!(!err.is_not_found());
        assert!(LooperError::NotFound.is_not_found());
    }
}
