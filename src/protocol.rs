//! Wire protocol for the control interface.
//!
//! Each message is one JSON object on one line. Requests carry a
//! `type` tag in SCREAMING_SNAKE_CASE; responses carry a `status` tag.
//! Field names are camelCase on the wire. Malformed input is answered
//! with an `ERROR` response, never a dropped connection.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{DaemonError, DaemonResult};
use crate::queue::{ConflictReport, StatusSnapshot, WaitResult};
use crate::session::SessionState;

/// A control-interface request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Request {
    /// Announce a worker. Creates its session on first sight.
    Register {
        worker_id: String,
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_branch: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_branch: Option<String>,
    },
    /// Submit a worker's branch for merging.
    Enqueue {
        worker_id: String,
        branch: String,
        worktree: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_branch: Option<String>,
        /// Insert at the head of the queue instead of the tail, as a
        /// conflict-retry resubmission does.
        #[serde(default)]
        priority: bool,
    },
    /// Withdraw a pending submission.
    Dequeue { worker_id: String },
    /// Query the whole queue.
    Status,
    /// Fetch the conflict report from a worker's last attempt.
    Conflicts { worker_id: String },
    /// Resubmit a conflicted worker at the head of the queue.
    Retry { worker_id: String },
    /// Block until the worker reaches a terminal state.
    Wait {
        worker_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_seconds: Option<u64>,
    },
    /// Apply an orchestrator-driven session transition.
    Session {
        session_id: String,
        state: SessionState,
    },
    /// Remove a finished session and its workers.
    CancelSession { session_id: String },
    /// Drain and stop the daemon.
    Shutdown,
}

/// Terminal disposition reported by a WAIT response.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WaitStatus {
    Merged,
    Abandoned,
    TimedOut,
    ShuttingDown,
}

/// A control-interface response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "status",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Response {
    /// The request was applied.
    Ok {
        /// 1-based queue position, for ENQUEUE and RETRY.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        position: Option<usize>,
    },
    /// Reply to STATUS.
    Status {
        #[serde(flatten)]
        snapshot: StatusSnapshot,
    },
    /// Reply to CONFLICTS.
    Conflicts {
        #[serde(flatten)]
        report: ConflictReport,
    },
    /// Reply to WAIT.
    Wait {
        result: WaitStatus,
        /// Merge commit for MERGED, reason for ABANDONED.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
    /// The request failed; the connection stays usable.
    Error { code: String, message: String },
}

impl Response {
    /// Plain acknowledgment without a position.
    #[must_use]
    pub fn ok() -> Self {
        Self::Ok { position: None }
    }

    /// Acknowledgment carrying a queue position.
    #[must_use]
    pub fn ok_at(position: usize) -> Self {
        Self::Ok {
            position: Some(position),
        }
    }

    /// Error response preserving the machine-readable code.
    #[must_use]
    pub fn error(err: &DaemonError) -> Self {
        Self::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    /// Maps a wait resolution onto the wire shape.
    #[must_use]
    pub fn from_wait(result: WaitResult) -> Self {
        match result {
            WaitResult::Merged { commit } => Self::Wait {
                result: WaitStatus::Merged,
                details: Some(commit),
            },
            WaitResult::Abandoned { reason } => Self::Wait {
                result: WaitStatus::Abandoned,
                details: Some(reason),
            },
            WaitResult::TimedOut => Self::Wait {
                result: WaitStatus::TimedOut,
                details: None,
            },
            WaitResult::ShuttingDown => Self::Wait {
                result: WaitStatus::ShuttingDown,
                details: None,
            },
        }
    }
}

/// Parses one request line, mapping JSON errors to BadRequest.
pub fn parse_request(line: &str) -> DaemonResult<Request> {
    serde_json::from_str(line).map_err(|e| DaemonError::BadRequest {
        message: format!("malformed request: {e}"),
    })
}
