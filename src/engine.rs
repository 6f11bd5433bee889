//! Merge engine: executes exactly one integration attempt at a time.
//!
//! The engine is deliberately synchronous; the queue manager runs it on
//! a blocking task so a long merge never stalls status queries. Every
//! attempt leaves the integration checkout clean: a conflicted or
//! failed merge is aborted before the outcome is returned.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::git::{self, MergeResult};

/// Classified result of one merge attempt.
///
/// `Conflict` is an expected outcome, not an error; `Error` covers
/// transient repository trouble (missing branch, dirty checkout, git
/// failure) that may succeed on a later attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MergeOutcome {
    /// The branch landed on the target; `commit` is the new target head.
    Success { commit: String },
    /// The merge conflicted in `paths`; `merge_base` is the common
    /// ancestor of the target and the worker branch at attempt time.
    Conflict {
        paths: Vec<String>,
        merge_base: String,
    },
    /// The attempt could not run to a merge decision.
    Error { reason: String },
}

/// Executes merge attempts against a single integration repository.
#[derive(Debug, Clone)]
pub struct MergeEngine {
    repo_path: PathBuf,
}

impl MergeEngine {
    /// Creates an engine for the repository at `repo_path`.
    #[must_use]
    pub fn new(repo_path: PathBuf) -> Self {
        Self { repo_path }
    }

    /// The integration repository this engine operates on.
    #[must_use]
    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Runs one merge attempt: check out the target branch, merge the
    /// worker branch with `--no-ff`, classify the result.
    ///
    /// Never leaves a merge in progress; conflicted and failed merges
    /// are aborted before returning.
    pub fn attempt(&self, worker_id: &str, branch: &str, target_branch: &str) -> MergeOutcome {
        tracing::debug!(worker_id, branch, target_branch, "starting merge attempt");

        match git::branch_exists(&self.repo_path, branch) {
            Ok(true) => {}
            Ok(false) => {
                return MergeOutcome::Error {
                    reason: format!("branch '{branch}' does not exist"),
                };
            }
            Err(e) => return self.fail(e.to_string()),
        }

        if let Err(e) = git::checkout_branch(&self.repo_path, target_branch) {
            return self.fail(format!("cannot check out '{target_branch}': {e}"));
        }

        // The merge base is captured up front so a conflict report can
        // still name the common ancestor after the merge is aborted.
        let merge_base = match git::merge_base(&self.repo_path, target_branch, branch) {
            Ok(base) => base,
            Err(e) => return self.fail(format!("no merge base for '{branch}': {e}")),
        };

        let message = format!("Merge branch '{branch}' (worker {worker_id})");
        match git::merge_no_ff(&self.repo_path, branch, &message) {
            Ok(MergeResult::Merged { commit }) => {
                tracing::info!(worker_id, branch, %commit, "merge succeeded");
                MergeOutcome::Success { commit }
            }
            Ok(MergeResult::Conflict { paths }) => {
                git::abort_merge(&self.repo_path);
                tracing::info!(
                    worker_id,
                    branch,
                    conflicts = paths.len(),
                    "merge conflicted"
                );
                MergeOutcome::Conflict { paths, merge_base }
            }
            Err(e) => self.fail(e.to_string()),
        }
    }

    fn fail(&self, reason: String) -> MergeOutcome {
        if git::merge_in_progress(&self.repo_path) {
            git::abort_merge(&self.repo_path);
        }
        tracing::warn!(%reason, "merge attempt failed");
        MergeOutcome::Error { reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn git(repo: &Path, args: &[&str]) {
        let output = Command::new("git")
            .current_dir(repo)
            .args(args)
            .output()
            .expect("Failed to run git");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn setup_test_repo() -> (TempDir, PathBuf) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let repo_path = temp_dir.path().to_path_buf();

        git(&repo_path, &["init", "--quiet"]);
        git(&repo_path, &["config", "user.name", "Test User"]);
        git(&repo_path, &["config", "user.email", "test@example.com"]);
        std::fs::write(repo_path.join("README.md"), "# test\n").unwrap();
        git(&repo_path, &["add", "."]);
        git(&repo_path, &["commit", "--quiet", "-m", "initial commit"]);
        git(&repo_path, &["branch", "-M", "main"]);

        (temp_dir, repo_path)
    }

    fn branch_with_file(repo: &Path, branch: &str, name: &str, content: &str) {
        git(repo, &["checkout", "--quiet", "-b", branch]);
        std::fs::write(repo.join(name), content).unwrap();
        git(repo, &["add", "."]);
        git(repo, &["commit", "--quiet", "-m", &format!("edit {name}")]);
        git(repo, &["checkout", "--quiet", "main"]);
    }

    /// # Test: Successful Attempt
    ///
    /// Verifies outcome classification for a clean merge.
    ///
    /// ## Test Scenario
    /// - Merge a branch that adds a new file
    ///
    /// ## Expected Outcome
    /// - MergeOutcome::Success carrying the new target head
    #[test]
    fn test_attempt_success() {
        let (_temp_dir, repo_path) = setup_test_repo();
        branch_with_file(&repo_path, "feature", "a.txt", "a\n");

        let engine = MergeEngine::new(repo_path.clone());
        let outcome = engine.attempt("w-1", "feature", "main");

        match outcome {
            MergeOutcome::Success { commit } => {
                assert_eq!(commit, crate::git::rev_parse(&repo_path, "HEAD").unwrap());
            }
            other => panic!("expected Success, got {:?}", other),
        }
    }

    /// # Test: Conflicting Attempt Leaves Target Unchanged
    ///
    /// Verifies that a conflict is reported and fully rolled back.
    ///
    /// ## Test Scenario
    /// - Merge two branches editing the same file; the second conflicts
    ///
    /// ## Expected Outcome
    /// - MergeOutcome::Conflict with the path and pre-fork merge base;
    ///   target head identical to before the attempt
    #[test]
    fn test_attempt_conflict_rolls_back() {
        let (_temp_dir, repo_path) = setup_test_repo();
        std::fs::write(repo_path.join("shared.txt"), "base\n").unwrap();
        git(&repo_path, &["add", "."]);
        git(&repo_path, &["commit", "--quiet", "-m", "add shared"]);
        let fork_point = crate::git::rev_parse(&repo_path, "HEAD").unwrap();

        branch_with_file(&repo_path, "left", "shared.txt", "left\n");
        branch_with_file(&repo_path, "right", "shared.txt", "right\n");

        let engine = MergeEngine::new(repo_path.clone());
        assert!(matches!(
            engine.attempt("w-1", "left", "main"),
            MergeOutcome::Success { .. }
        ));
        let head_before = crate::git::rev_parse(&repo_path, "HEAD").unwrap();

        match engine.attempt("w-2", "right", "main") {
            MergeOutcome::Conflict { paths, merge_base } => {
                assert_eq!(paths, vec!["shared.txt".to_string()]);
                assert_eq!(merge_base, fork_point);
            }
            other => panic!("expected Conflict, got {:?}", other),
        }

        assert_eq!(
            crate::git::rev_parse(&repo_path, "HEAD").unwrap(),
            head_before
        );
        assert!(!crate::git::merge_in_progress(&repo_path));
    }

    /// # Test: Missing Branch Is a Transient Error
    ///
    /// Verifies that a vanished worker branch does not panic or poison
    /// the checkout.
    ///
    /// ## Test Scenario
    /// - Attempt to merge a branch that was never created
    ///
    /// ## Expected Outcome
    /// - MergeOutcome::Error naming the branch
    #[test]
    fn test_attempt_missing_branch() {
        let (_temp_dir, repo_path) = setup_test_repo();
        let engine = MergeEngine::new(repo_path);

        match engine.attempt("w-1", "ghost", "main") {
            MergeOutcome::Error { reason } => assert!(reason.contains("ghost")),
            other => panic!("expected Error, got {:?}", other),
        }
    }

    /// # Test: Already-Merged Branch Succeeds Without New Commit
    ///
    /// Verifies idempotent behavior when a branch was already merged.
    ///
    /// ## Test Scenario
    /// - Merge the same branch twice
    ///
    /// ## Expected Outcome
    /// - Second attempt reports Success with the unchanged target head
    #[test]
    fn test_attempt_already_merged() {
        let (_temp_dir, repo_path) = setup_test_repo();
        branch_with_file(&repo_path, "feature", "a.txt", "a\n");

        let engine = MergeEngine::new(repo_path.clone());
        let MergeOutcome::Success { commit: first } = engine.attempt("w-1", "feature", "main")
        else {
            panic!("first merge should succeed");
        };

        match engine.attempt("w-1", "feature", "main") {
            MergeOutcome::Success { commit } => assert_eq!(commit, first),
            other => panic!("expected Success, got {:?}", other),
        }
    }

    /// # Test: Outcome Serialization
    ///
    /// Verifies the tagged JSON shape persisted in the state file.
    ///
    /// ## Test Scenario
    /// - Serialize each outcome variant and deserialize it back
    ///
    /// ## Expected Outcome
    /// - The "outcome" tag distinguishes variants losslessly
    #[test]
    fn test_outcome_serialization() {
        let outcome = MergeOutcome::Conflict {
            paths: vec!["src/lib.rs".to_string()],
            merge_base: "abc123".to_string(),
        };
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains("\"outcome\":\"conflict\""));
        let back: MergeOutcome = serde_json::from_str(&json).unwrap();
        assert_eq!(back, outcome);

        let outcome = MergeOutcome::Success {
            commit: "def456".to_string(),
        };
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains("\"outcome\":\"success\""));
    }
}
