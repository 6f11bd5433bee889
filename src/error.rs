//! Unified error handling for the mergequeue library.
//!
//! This module provides the error hierarchy using `thiserror` for
//! programmatic error handling and informative error messages.
//!
//! ## Error Categories
//!
//! - [`DaemonError`]: Errors surfaced to control-interface callers
//! - [`GitError`]: Errors from git subprocess operations
//!
//! Caller mistakes (unknown worker, duplicate registration, malformed
//! requests) are distinct variants so the control interface can report
//! them without tearing anything down. Merge conflicts are *not* errors;
//! they are ordinary outcomes carried by
//! [`MergeOutcome`](crate::engine::MergeOutcome).

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used throughout the queue and control layers.
pub type DaemonResult<T> = Result<T, DaemonError>;

/// Errors surfaced by the queue manager and control interface.
#[derive(Error, Debug)]
pub enum DaemonError {
    /// The referenced worker was never registered (or has been removed).
    #[error("Unknown worker: {worker_id}")]
    UnknownWorker {
        /// The worker id that was not found.
        worker_id: String,
    },

    /// A worker with this id is already registered.
    #[error("Worker already registered: {worker_id}")]
    DuplicateWorker {
        /// The conflicting worker id.
        worker_id: String,
    },

    /// The worker already has a request in the pending queue or in flight.
    #[error("Worker already queued: {worker_id}")]
    AlreadyQueued {
        /// The worker id that is already queued.
        worker_id: String,
    },

    /// The pending queue is at capacity.
    #[error("Merge queue is full (capacity: {capacity})")]
    QueueFull {
        /// Configured queue capacity.
        capacity: usize,
    },

    /// The worker exhausted its conflict-retry budget and was abandoned.
    #[error("Worker {worker_id} exceeded {max_retries} conflict retries and was abandoned")]
    MaxRetriesExceeded {
        /// The abandoned worker id.
        worker_id: String,
        /// The configured retry bound.
        max_retries: u32,
    },

    /// The referenced session does not exist.
    #[error("Unknown session: {session_id}")]
    UnknownSession {
        /// The session id that was not found.
        session_id: String,
    },

    /// The session still has workers that are neither merged nor abandoned.
    #[error("Session {session_id} still has active workers")]
    SessionNotTerminal {
        /// The session id that could not be cancelled.
        session_id: String,
    },

    /// The requested session state change is not a legal transition.
    #[error("Invalid session transition: {from} -> {to}")]
    InvalidTransition {
        /// Current session state.
        from: String,
        /// Requested session state.
        to: String,
    },

    /// No conflict report is recorded for the worker.
    #[error("No conflict recorded for worker: {worker_id}")]
    NoConflictRecorded {
        /// The worker id without a conflict report.
        worker_id: String,
    },

    /// The request was malformed or not applicable in the current state.
    #[error("Invalid request: {message}")]
    BadRequest {
        /// Description of what was wrong with the request.
        message: String,
    },

    /// The daemon is draining and no longer accepts new work.
    #[error("Daemon is shutting down")]
    ShuttingDown,

    /// An error occurred during a git operation.
    #[error("Git error: {0}")]
    Git(#[from] GitError),
}

impl DaemonError {
    /// Stable machine-readable code reported on the wire.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownWorker { .. } => "UNKNOWN_WORKER",
            Self::DuplicateWorker { .. } => "DUPLICATE_WORKER",
            Self::AlreadyQueued { .. } => "ALREADY_QUEUED",
            Self::QueueFull { .. } => "QUEUE_FULL",
            Self::MaxRetriesExceeded { .. } => "ABANDONED",
            Self::UnknownSession { .. } => "UNKNOWN_SESSION",
            Self::SessionNotTerminal { .. } => "SESSION_NOT_TERMINAL",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::NoConflictRecorded { .. } => "NOT_FOUND",
            Self::BadRequest { .. } => "BAD_REQUEST",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::Git(_) => "GIT_ERROR",
        }
    }
}

/// Errors that can occur during git subprocess operations.
#[derive(Error, Debug, Clone)]
pub enum GitError {
    /// The specified path is not a valid git repository.
    #[error("Not a valid git repository: {path}")]
    NotARepository {
        /// Path that was expected to be a repository.
        path: PathBuf,
    },

    /// The specified branch does not exist in the repository.
    #[error("Branch '{branch}' not found")]
    BranchNotFound {
        /// Name of the missing branch.
        branch: String,
    },

    /// A git command exited unsuccessfully (or could not be spawned).
    #[error("git {command} failed: {message}")]
    CommandFailed {
        /// The git subcommand and arguments that ran.
        command: String,
        /// Captured stderr (or spawn error).
        message: String,
    },
}

/// Convenience alias for git adapter results.
pub type GitResult<T> = Result<T, GitError>;
