//! Git repository adapter.
//!
//! Thin wrapper over the `git` binary. Every operation shells out with
//! `std::process::Command`, captures stdout/stderr, and classifies the
//! exit status. The daemon owns a single checkout of the integration
//! repository; callers above this module never touch git directly.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use crate::error::{GitError, GitResult};

/// Result of a `git merge` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResult {
    /// The merge succeeded; `commit` is the resulting HEAD of the
    /// target branch (the merge commit, or the previous head when the
    /// branch was already merged).
    Merged { commit: String },
    /// The merge stopped on conflicts in the listed paths.
    Conflict { paths: Vec<String> },
}

fn command_string(args: &[&str]) -> String {
    args.join(" ")
}

fn run(repo: &Path, args: &[&str]) -> GitResult<Output> {
    Command::new("git")
        .current_dir(repo)
        .args(args)
        .output()
        .map_err(|e| GitError::CommandFailed {
            command: command_string(args),
            message: format!("failed to spawn git: {e}"),
        })
}

/// Runs a git command and returns trimmed stdout, failing on non-zero exit.
fn run_checked(repo: &Path, args: &[&str]) -> GitResult<String> {
    let output = run(repo, args)?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(GitError::CommandFailed {
            command: command_string(args),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Verifies that `path` is inside a git work tree.
pub fn verify_repository(path: &Path) -> GitResult<()> {
    let output = run(path, &["rev-parse", "--git-dir"])?;
    if output.status.success() {
        Ok(())
    } else {
        Err(GitError::NotARepository {
            path: path.to_path_buf(),
        })
    }
}

/// Returns whether a local branch with the given name exists.
pub fn branch_exists(repo: &Path, branch: &str) -> GitResult<bool> {
    let refname = format!("refs/heads/{branch}");
    let output = run(repo, &["rev-parse", "--verify", "--quiet", &refname])?;
    Ok(output.status.success())
}

/// Resolves a revision (branch name, `HEAD`, ...) to a commit id.
pub fn rev_parse(repo: &Path, rev: &str) -> GitResult<String> {
    run_checked(repo, &["rev-parse", rev])
}

/// Checks out an existing branch.
pub fn checkout_branch(repo: &Path, branch: &str) -> GitResult<()> {
    if !branch_exists(repo, branch)? {
        return Err(GitError::BranchNotFound {
            branch: branch.to_string(),
        });
    }
    run_checked(repo, &["checkout", branch]).map(|_| ())
}

/// Returns the merge base of two revisions.
pub fn merge_base(repo: &Path, a: &str, b: &str) -> GitResult<String> {
    run_checked(repo, &["merge-base", a, b])
}

/// Lists paths currently in conflicted (unmerged) state.
pub fn conflicted_paths(repo: &Path) -> GitResult<Vec<String>> {
    let stdout = run_checked(repo, &["diff", "--name-only", "--diff-filter=U"])?;
    Ok(stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

/// Returns whether a merge is currently in progress in the checkout.
pub fn merge_in_progress(repo: &Path) -> bool {
    run(repo, &["rev-parse", "--verify", "--quiet", "MERGE_HEAD"])
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Aborts an in-progress merge, restoring the pre-merge checkout.
///
/// A failure here is ignored when no merge is in progress, so the call
/// is safe to use as cleanup on any non-success path.
pub fn abort_merge(repo: &Path) {
    let _ = run(repo, &["merge", "--abort"]);
}

/// Merges `branch` into the currently checked-out branch with a merge
/// commit (`--no-ff`).
///
/// On a conflicted merge the index is left dirty; the caller decides
/// whether to collect the conflict set before aborting.
pub fn merge_no_ff(repo: &Path, branch: &str, message: &str) -> GitResult<MergeResult> {
    let args = ["merge", "--no-ff", "--no-edit", "-m", message, branch];
    let output = run(repo, &args)?;

    if output.status.success() {
        let commit = rev_parse(repo, "HEAD")?;
        return Ok(MergeResult::Merged { commit });
    }

    // Non-zero exit: distinguish a content conflict from a hard failure
    // by asking git which paths are unmerged.
    let paths = conflicted_paths(repo)?;
    if !paths.is_empty() {
        return Ok(MergeResult::Conflict { paths });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    if stdout.contains("CONFLICT") {
        // Conflict reported but no unmerged paths (e.g. modify/delete
        // already resolved by the index); report it without a path list.
        return Ok(MergeResult::Conflict { paths: Vec::new() });
    }

    Err(GitError::CommandFailed {
        command: command_string(&args),
        message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// Canonicalizes a repository path, verifying it exists.
pub fn canonical_repo_path(path: &Path) -> GitResult<PathBuf> {
    path.canonicalize().map_err(|_| GitError::NotARepository {
        path: path.to_path_buf(),
    })
}
