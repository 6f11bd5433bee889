//! Durable queue state.
//!
//! The whole coordination state (sessions, workers, pending queue,
//! in-flight attempt) is persisted as one JSON snapshot, rewritten
//! atomically after every mutation: write to a temp file, fsync,
//! rename. On startup the snapshot is validated before any of it is
//! trusted.
//!
//! Snapshots live in the XDG state directory (overridable via
//! `MERGEQUEUE_STATE_DIR`), one file per repository keyed by a hash of
//! the canonical repository path. A PID lock file next to the snapshot
//! keeps two daemons from coordinating the same repository.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::queue::{MergeRequest, Worker, WorkerState};
use crate::session::Session;

/// Current schema version of the state snapshot.
pub const SCHEMA_VERSION: u32 = 1;

/// Environment variable to override the state directory location.
pub const STATE_DIR_ENV: &str = "MERGEQUEUE_STATE_DIR";

/// The merge attempt that was running when the snapshot was taken.
///
/// Recorded at dispatch time so a crash mid-merge can be recovered:
/// the full request is re-queued at the head, unless the target head
/// moved underneath us while the daemon was down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InFlightAttempt {
    /// The request that was dispatched.
    pub request: MergeRequest,
    /// Target-branch head observed when the attempt started.
    pub target_head: String,
    /// When the attempt was dispatched.
    pub started_at: DateTime<Utc>,
}

/// Serialized form of the entire coordination state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Schema version for forward compatibility.
    pub schema_version: u32,
    /// Canonical path of the coordinated repository.
    pub repo_path: PathBuf,
    /// When this snapshot was written.
    pub saved_at: DateTime<Utc>,
    /// Next queue sequence number to assign.
    pub next_seq: u64,
    /// All known sessions.
    pub sessions: Vec<Session>,
    /// All known workers.
    pub workers: Vec<Worker>,
    /// Pending merge requests in queue order (head first).
    pub pending: Vec<MergeRequest>,
    /// The attempt in flight at snapshot time, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_flight: Option<InFlightAttempt>,
}

impl StateSnapshot {
    /// Creates an empty snapshot for a repository.
    #[must_use]
    pub fn empty(repo_path: PathBuf) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            repo_path,
            saved_at: Utc::now(),
            next_seq: 1,
            sessions: Vec::new(),
            workers: Vec::new(),
            pending: Vec::new(),
            in_flight: None,
        }
    }

    /// Validates the snapshot for consistency and correctness.
    ///
    /// Checks:
    /// - Schema version is supported
    /// - Required fields are present
    /// - Every pending request references a known, queued worker
    /// - The in-flight record matches exactly the MERGING workers
    pub fn validate(&self) -> Result<()> {
        if self.schema_version != SCHEMA_VERSION {
            anyhow::bail!(
                "Unsupported schema version: {} (expected {}). \
                 The state file may have been written by a different version of mergequeue.",
                self.schema_version,
                SCHEMA_VERSION
            );
        }

        if self.repo_path.as_os_str().is_empty() {
            anyhow::bail!("State file corrupted: missing required field 'repo_path'");
        }

        for request in &self.pending {
            let worker = self
                .workers
                .iter()
                .find(|w| w.id == request.worker_id)
                .with_context(|| {
                    format!(
                        "State file corrupted: pending request for unknown worker '{}'",
                        request.worker_id
                    )
                })?;
            if worker.state != WorkerState::Queued {
                anyhow::bail!(
                    "State file corrupted: worker '{}' has a pending request but is in state {:?}",
                    worker.id,
                    worker.state
                );
            }
        }

        let merging: Vec<_> = self
            .workers
            .iter()
            .filter(|w| w.state == WorkerState::Merging)
            .collect();
        match (&self.in_flight, merging.as_slice()) {
            (None, []) => {}
            (Some(attempt), [worker]) if worker.id == attempt.request.worker_id => {}
            (Some(attempt), _) => anyhow::bail!(
                "State file corrupted: in-flight attempt for '{}' does not match MERGING workers",
                attempt.request.worker_id
            ),
            (None, _) => anyhow::bail!(
                "State file corrupted: {} MERGING worker(s) but no in-flight attempt recorded",
                merging.len()
            ),
        }

        for worker in &self.workers {
            if !self.sessions.iter().any(|s| s.id == worker.session_id) {
                anyhow::bail!(
                    "State file corrupted: worker '{}' references unknown session '{}'",
                    worker.id,
                    worker.session_id
                );
            }
        }

        Ok(())
    }
}

/// Reads and writes [`StateSnapshot`]s at a fixed path.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Creates a store writing to an explicit path.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Creates a store at the default location for a repository.
    pub fn for_repo(repo_path: &Path) -> Result<Self> {
        Ok(Self::new(path_for_repo(repo_path)?))
    }

    /// The snapshot file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads and validates the snapshot, if one exists.
    pub fn load(&self) -> Result<Option<StateSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read state file: {}", self.path.display()))?;
        let snapshot: StateSnapshot = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {}", self.path.display()))?;
        snapshot
            .validate()
            .with_context(|| format!("Invalid state file: {}", self.path.display()))?;

        Ok(Some(snapshot))
    }

    /// Saves the snapshot to disk atomically.
    ///
    /// Uses write-to-temp-then-rename so readers never observe a
    /// partially written file.
    pub fn save(&self, snapshot: &mut StateSnapshot) -> Result<()> {
        snapshot.saved_at = Utc::now();

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create state directory: {}", parent.display())
            })?;
        }

        let temp_path = self.path.with_extension("json.tmp");
        let content =
            serde_json::to_string_pretty(snapshot).context("Failed to serialize state file")?;

        let mut file = fs::File::create(&temp_path)
            .with_context(|| format!("Failed to create temp file: {}", temp_path.display()))?;
        file.write_all(content.as_bytes())
            .with_context(|| format!("Failed to write temp file: {}", temp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync temp file: {}", temp_path.display()))?;

        fs::rename(&temp_path, &self.path)
            .with_context(|| format!("Failed to rename temp file to: {}", self.path.display()))?;

        Ok(())
    }
}

/// Returns the state directory path.
///
/// Uses `MERGEQUEUE_STATE_DIR` environment variable if set,
/// otherwise uses the XDG state directory.
pub fn state_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(STATE_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }

    let state_home = if cfg!(target_os = "macos") {
        // macOS doesn't have XDG by default, use Application Support
        dirs::data_local_dir().map(|p| p.join("mergequeue"))
    } else {
        // Linux and others: use XDG state directory
        dirs::state_dir().map(|p| p.join("mergequeue")).or_else(|| {
            // Fallback to ~/.local/state/mergequeue
            dirs::home_dir().map(|p| p.join(".local").join("state").join("mergequeue"))
        })
    };

    state_home.context("Could not determine state directory")
}

/// Computes a hash of the repository path for unique file naming.
///
/// Returns the first 16 characters of the SHA-256 hash of the
/// canonicalized path.
pub fn compute_repo_hash(repo_path: &Path) -> Result<String> {
    let canonical = repo_path
        .canonicalize()
        .with_context(|| format!("Failed to canonicalize path: {}", repo_path.display()))?;

    let path_str = canonical.to_string_lossy();
    let mut hasher = Sha256::new();
    hasher.update(path_str.as_bytes());
    let result = hasher.finalize();

    Ok(hex::encode(&result[..8]))
}

/// Returns the state file path for a repository.
pub fn path_for_repo(repo_path: &Path) -> Result<PathBuf> {
    let hash = compute_repo_hash(repo_path)?;
    let dir = state_dir()?;
    Ok(dir.join(format!("queue-{hash}.json")))
}

/// Returns the lock file path for a repository.
pub fn lock_path_for_repo(repo_path: &Path) -> Result<PathBuf> {
    let hash = compute_repo_hash(repo_path)?;
    let dir = state_dir()?;
    Ok(dir.join(format!("queue-{hash}.lock")))
}

/// A lock guard that marks a repository as coordinated by this daemon.
///
/// The lock is automatically released when the guard is dropped.
/// Uses a simple PID-based locking mechanism with stale lock detection.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    /// Attempts to acquire the coordination lock for a repository.
    ///
    /// Returns `Ok(Some(guard))` if the lock was acquired,
    /// `Ok(None)` if another live process holds the lock,
    /// or `Err` if an error occurred.
    pub fn acquire(repo_path: &Path) -> Result<Option<Self>> {
        let lock_path = lock_path_for_repo(repo_path)?;

        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create lock directory: {}", parent.display())
            })?;
        }

        // Check if lock file exists and if the process is still alive
        if lock_path.exists() {
            if let Ok(content) = fs::read_to_string(&lock_path)
                && let Ok(pid) = content.trim().parse::<u32>()
                && is_process_alive(pid)
            {
                // Another process holds the lock
                return Ok(None);
            }
            // Lock is stale or unreadable, remove it
            let _ = fs::remove_file(&lock_path);
        }

        let pid = std::process::id();
        fs::write(&lock_path, pid.to_string())
            .with_context(|| format!("Failed to create lock file: {}", lock_path.display()))?;

        // Verify we own the lock (handle race condition)
        if let Ok(content) = fs::read_to_string(&lock_path)
            && content.trim() == pid.to_string()
        {
            return Ok(Some(LockGuard { path: lock_path }));
        }

        // Someone else won the race
        Ok(None)
    }

    /// Returns the path to the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn release(&self) {
        let _ = fs::remove_file(&self.path);
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Checks if a process with the given PID is still alive.
#[cfg(unix)]
fn is_process_alive(pid: u32) -> bool {
    // On Unix, send signal 0 to check if process exists
    // SAFETY: signal 0 only checks process existence, no signal is actually delivered; pid cast is safe for valid PIDs
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn is_process_alive(_pid: u32) -> bool {
    // Conservative: assume process is alive on unknown platforms
    true
}

// Provide hex encoding since we don't want to add another dependency
mod hex {
    pub fn encode(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use serial_test::serial;
    use tempfile::TempDir;

    fn worker(id: &str, session_id: &str, state: WorkerState) -> Worker {
        let mut w = Worker::new(id.to_string(), session_id.to_string());
        w.state = state;
        w
    }

    fn request(worker_id: &str, seq: u64) -> MergeRequest {
        MergeRequest {
            worker_id: worker_id.to_string(),
            branch: format!("branch-{worker_id}"),
            worktree: PathBuf::from(format!("/tmp/{worker_id}")),
            target_branch: "main".to_string(),
            seq,
            priority: false,
            requeued_after_error: false,
        }
    }

    fn snapshot_with_queue() -> StateSnapshot {
        let mut snapshot = StateSnapshot::empty(PathBuf::from("/test/repo"));
        snapshot.sessions.push(Session::new(
            "s-1".to_string(),
            "main".to_string(),
            "main".to_string(),
        ));
        snapshot
            .workers
            .push(worker("w-1", "s-1", WorkerState::Queued));
        snapshot.pending.push(request("w-1", 1));
        snapshot.next_seq = 2;
        snapshot
    }

    /// # Test: Snapshot Round-Trip
    ///
    /// Verifies atomic save and load of a populated snapshot.
    ///
    /// ## Test Scenario
    /// - Save a snapshot with a session, worker, and pending request
    /// - Load it back from the same path
    ///
    /// ## Expected Outcome
    /// - All collections survive; no temp file is left behind
    #[test]
    fn test_snapshot_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("queue.json"));

        let mut snapshot = snapshot_with_queue();
        store.save(&mut snapshot).unwrap();

        let loaded = store.load().unwrap().expect("snapshot should exist");
        assert_eq!(loaded.next_seq, 2);
        assert_eq!(loaded.sessions.len(), 1);
        assert_eq!(loaded.workers.len(), 1);
        assert_eq!(loaded.pending.len(), 1);
        assert_eq!(loaded.pending[0].worker_id, "w-1");
        assert_eq!(loaded.sessions[0].state, SessionState::Started);

        assert!(!dir.path().join("queue.json.tmp").exists());
    }

    /// # Test: Missing Snapshot Loads as None
    ///
    /// Verifies first-boot behavior.
    ///
    /// ## Test Scenario
    /// - Load from a path that does not exist
    ///
    /// ## Expected Outcome
    /// - Ok(None), not an error
    #[test]
    fn test_load_missing() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("queue.json"));
        assert!(store.load().unwrap().is_none());
    }

    /// # Test: Schema Version Mismatch Rejected
    ///
    /// Verifies that snapshots from other schema versions are refused.
    ///
    /// ## Test Scenario
    /// - Validate a snapshot with a bumped schema_version
    ///
    /// ## Expected Outcome
    /// - Validation fails mentioning the version
    #[test]
    fn test_schema_version_mismatch() {
        let mut snapshot = StateSnapshot::empty(PathBuf::from("/test/repo"));
        snapshot.schema_version = SCHEMA_VERSION + 1;
        let err = snapshot.validate().unwrap_err();
        assert!(err.to_string().contains("schema version"));
    }

    /// # Test: Validation Catches Inconsistencies
    ///
    /// Verifies the structural checks on load.
    ///
    /// ## Test Scenario
    /// - A pending request whose worker is not QUEUED
    /// - A MERGING worker without an in-flight record
    /// - A worker referencing an unknown session
    ///
    /// ## Expected Outcome
    /// - Each snapshot fails validation
    #[test]
    fn test_validation_inconsistencies() {
        let mut snapshot = snapshot_with_queue();
        snapshot.workers[0].state = WorkerState::Working;
        assert!(snapshot.validate().is_err());

        let mut snapshot = snapshot_with_queue();
        snapshot.pending.clear();
        snapshot.workers[0].state = WorkerState::Merging;
        assert!(snapshot.validate().is_err());

        let mut snapshot = snapshot_with_queue();
        snapshot.workers[0].session_id = "ghost".to_string();
        assert!(snapshot.validate().is_err());
    }

    /// # Test: In-Flight Record Round-Trip
    ///
    /// Verifies that a snapshot taken mid-merge validates and reloads.
    ///
    /// ## Test Scenario
    /// - Snapshot with one MERGING worker and a matching in-flight
    ///   attempt recording the observed target head
    ///
    /// ## Expected Outcome
    /// - Validates, saves, and loads with the attempt intact
    #[test]
    fn test_in_flight_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("queue.json"));

        let mut snapshot = snapshot_with_queue();
        snapshot.pending.clear();
        snapshot.workers[0].state = WorkerState::Merging;
        snapshot.in_flight = Some(InFlightAttempt {
            request: request("w-1", 1),
            target_head: "abc123".to_string(),
            started_at: Utc::now(),
        });

        snapshot.validate().unwrap();
        store.save(&mut snapshot).unwrap();

        let loaded = store.load().unwrap().unwrap();
        let attempt = loaded.in_flight.expect("in-flight attempt should survive");
        assert_eq!(attempt.request.worker_id, "w-1");
        assert_eq!(attempt.target_head, "abc123");
    }

    /// # Test: State Directory Override
    ///
    /// Verifies the environment override for the state directory.
    ///
    /// ## Test Scenario
    /// - Point MERGEQUEUE_STATE_DIR at a tempdir and derive paths
    ///
    /// ## Expected Outcome
    /// - Snapshot and lock paths land in the tempdir and share a hash
    #[test]
    #[serial]
    fn test_state_dir_override() {
        let dir = TempDir::new().unwrap();
        // SAFETY: test is serialized; no other thread reads the environment concurrently
        unsafe { std::env::set_var(STATE_DIR_ENV, dir.path()) };

        let repo = TempDir::new().unwrap();
        let state_path = path_for_repo(repo.path()).unwrap();
        let lock_path = lock_path_for_repo(repo.path()).unwrap();

        assert!(state_path.starts_with(dir.path()));
        assert!(lock_path.starts_with(dir.path()));
        assert_eq!(
            state_path.file_stem().unwrap(),
            lock_path.file_stem().unwrap()
        );

        // SAFETY: test is serialized; no other thread reads the environment concurrently
        unsafe { std::env::remove_var(STATE_DIR_ENV) };
    }

    /// # Test: Lock Acquisition and Release
    ///
    /// Verifies the PID lock lifecycle including stale-lock takeover.
    ///
    /// ## Test Scenario
    /// - Acquire a lock, fail to acquire it again, drop it, reacquire
    /// - Acquire over a stale lock naming a dead PID
    ///
    /// ## Expected Outcome
    /// - Second acquire fails while held, succeeds after drop and over
    ///   the stale file
    #[test]
    #[serial]
    fn test_lock_guard() {
        let dir = TempDir::new().unwrap();
        // SAFETY: test is serialized; no other thread reads the environment concurrently
        unsafe { std::env::set_var(STATE_DIR_ENV, dir.path()) };

        let repo = TempDir::new().unwrap();

        let guard = LockGuard::acquire(repo.path()).unwrap();
        assert!(guard.is_some());
        assert!(LockGuard::acquire(repo.path()).unwrap().is_none());

        drop(guard);
        let guard = LockGuard::acquire(repo.path()).unwrap();
        assert!(guard.is_some());
        drop(guard);

        // Stale lock: PID that cannot be a live process
        let lock_path = lock_path_for_repo(repo.path()).unwrap();
        fs::write(&lock_path, "999999999").unwrap();
        assert!(LockGuard::acquire(repo.path()).unwrap().is_some());

        // SAFETY: test is serialized; no other thread reads the environment concurrently
        unsafe { std::env::remove_var(STATE_DIR_ENV) };
    }
}
