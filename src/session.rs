//! Fork/join session tracking.
//!
//! A session groups the workers spawned for one fan-out round and
//! tracks the lifecycle of their joined result. The queue manager
//! advances a session between WORKING and MERGING on its own; the
//! validation states (VALIDATING, READY, COMPLETE, RESOLVING) are
//! driven by the external orchestrator through the control interface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DaemonError, DaemonResult};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created; no worker activity yet.
    Started,
    /// Workers are producing changes in their worktrees.
    Working,
    /// The queue holds (or is executing) merge requests.
    Merging,
    /// All submissions merged; the combined result is being validated.
    Validating,
    /// Validation passed; awaiting completion.
    Ready,
    /// The session is finished.
    Complete,
    /// Validation failed; fixes are being produced.
    Resolving,
}

impl SessionState {
    /// Human-readable description for status output.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::Started => "created, no worker activity yet",
            Self::Working => "workers producing changes",
            Self::Merging => "merges pending or in flight",
            Self::Validating => "combined result under validation",
            Self::Ready => "validated, awaiting completion",
            Self::Complete => "finished",
            Self::Resolving => "validation failed, fixes in progress",
        }
    }

    /// Whether the session has reached its final state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Started, Self::Working)
                | (Self::Working, Self::Merging)
                | (Self::Merging, Self::Working)
                | (Self::Merging, Self::Validating)
                | (Self::Validating, Self::Ready)
                | (Self::Validating, Self::Resolving)
                | (Self::Ready, Self::Complete)
                | (Self::Resolving, Self::Working)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Started => "STARTED",
            Self::Working => "WORKING",
            Self::Merging => "MERGING",
            Self::Validating => "VALIDATING",
            Self::Ready => "READY",
            Self::Complete => "COMPLETE",
            Self::Resolving => "RESOLVING",
        };
        write!(f, "{s}")
    }
}

/// One merge recorded against a session, in merge order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MergedCommit {
    /// The worker whose branch produced this merge.
    pub worker_id: String,
    /// The target-branch head after the merge.
    pub commit: String,
    /// When the merge was recorded.
    pub merged_at: DateTime<Utc>,
}

/// A fork/join session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Caller-chosen session identifier.
    pub id: String,
    /// Integration branch merges land on.
    pub target_branch: String,
    /// Branch the workers forked from.
    pub base_branch: String,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last state or merge-list change.
    pub updated_at: DateTime<Utc>,
    /// Merges recorded for this session, in merge order.
    pub merged_commits: Vec<MergedCommit>,
}

impl Session {
    /// Creates a new session in the STARTED state.
    #[must_use]
    pub fn new(id: String, target_branch: String, base_branch: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            target_branch,
            base_branch,
            state: SessionState::Started,
            created_at: now,
            updated_at: now,
            merged_commits: Vec::new(),
        }
    }

    /// Moves the session to `next`, rejecting illegal transitions.
    pub fn transition(&mut self, next: SessionState) -> DaemonResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(DaemonError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        tracing::debug!(session_id = %self.id, from = %self.state, to = %next, "session transition");
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Like [`transition`](Self::transition), but a no-op when the
    /// session is already in `next`. Used for queue-driven movement
    /// where repeated events are normal.
    pub fn transition_if_needed(&mut self, next: SessionState) -> bool {
        if self.state == next || !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        self.updated_at = Utc::now();
        true
    }

    /// Records a merged commit for this session.
    ///
    /// Idempotent on the commit id: replaying an outcome that is
    /// already recorded does not append a duplicate. Returns whether
    /// the commit was appended.
    pub fn record_merge(&mut self, worker_id: &str, commit: &str) -> bool {
        if self.merged_commits.iter().any(|m| m.commit == commit) {
            return false;
        }
        self.merged_commits.push(MergedCommit {
            worker_id: worker_id.to_string(),
            commit: commit.to_string(),
            merged_at: Utc::now(),
        });
        self.updated_at = Utc::now();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(
            "s-1".to_string(),
            "main".to_string(),
            "main".to_string(),
        )
    }

    /// # Test: Legal Transition Chain
    ///
    /// Verifies the full happy-path lifecycle.
    ///
    /// ## Test Scenario
    /// - Walk STARTED through WORKING, MERGING, VALIDATING, READY to
    ///   COMPLETE
    ///
    /// ## Expected Outcome
    /// - Every step succeeds and COMPLETE is terminal
    #[test]
    fn test_happy_path_transitions() {
        let mut s = session();
        for next in [
            SessionState::Working,
            SessionState::Merging,
            SessionState::Validating,
            SessionState::Ready,
            SessionState::Complete,
        ] {
            s.transition(next).unwrap();
        }
        assert!(s.state.is_terminal());
    }

    /// # Test: Resolution Cycle
    ///
    /// Verifies the fix cycle after failed validation.
    ///
    /// ## Test Scenario
    /// - Reach VALIDATING, fail into RESOLVING, return to WORKING, and
    ///   merge again
    ///
    /// ## Expected Outcome
    /// - The cycle VALIDATING -> RESOLVING -> WORKING -> MERGING is legal
    #[test]
    fn test_resolution_cycle() {
        let mut s = session();
        s.transition(SessionState::Working).unwrap();
        s.transition(SessionState::Merging).unwrap();
        s.transition(SessionState::Validating).unwrap();
        s.transition(SessionState::Resolving).unwrap();
        s.transition(SessionState::Working).unwrap();
        s.transition(SessionState::Merging).unwrap();
    }

    /// # Test: Illegal Transitions Rejected
    ///
    /// Verifies that skipping states fails with InvalidTransition.
    ///
    /// ## Test Scenario
    /// - Attempt STARTED -> COMPLETE and STARTED -> VALIDATING
    ///
    /// ## Expected Outcome
    /// - Both are rejected and the state is unchanged
    #[test]
    fn test_illegal_transitions() {
        let mut s = session();
        assert!(matches!(
            s.transition(SessionState::Complete),
            Err(DaemonError::InvalidTransition { .. })
        ));
        assert!(s.transition(SessionState::Validating).is_err());
        assert_eq!(s.state, SessionState::Started);
    }

    /// # Test: Idempotent Merge Recording
    ///
    /// Verifies that replaying a recorded outcome does not duplicate it.
    ///
    /// ## Test Scenario
    /// - Record the same commit id twice, then a different one
    ///
    /// ## Expected Outcome
    /// - Two entries total, in merge order
    #[test]
    fn test_record_merge_idempotent() {
        let mut s = session();
        assert!(s.record_merge("w-1", "abc"));
        assert!(!s.record_merge("w-1", "abc"));
        assert!(s.record_merge("w-2", "def"));

        assert_eq!(s.merged_commits.len(), 2);
        assert_eq!(s.merged_commits[0].commit, "abc");
        assert_eq!(s.merged_commits[1].commit, "def");
    }

    /// # Test: Conditional Transition
    ///
    /// Verifies transition_if_needed semantics for queue-driven moves.
    ///
    /// ## Test Scenario
    /// - Apply the same transition twice and an illegal one
    ///
    /// ## Expected Outcome
    /// - First applies, repeat and illegal are silent no-ops
    #[test]
    fn test_transition_if_needed() {
        let mut s = session();
        assert!(s.transition_if_needed(SessionState::Working));
        assert!(!s.transition_if_needed(SessionState::Working));
        assert!(!s.transition_if_needed(SessionState::Complete));
        assert_eq!(s.state, SessionState::Working);
    }
}
