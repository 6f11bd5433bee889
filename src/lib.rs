//! # Mergequeue Library
//!
//! Coordination core for serializing concurrent branch merges from
//! isolated workers into a single integration branch. This library
//! provides:
//!
//! - A FIFO merge queue with head-insertion for conflict retries
//! - A merge engine executing one `git merge --no-ff` attempt at a time
//! - Session and worker lifecycle tracking for fork/join workflows
//! - Crash-safe state snapshots with atomic writes and recovery
//! - A newline-delimited JSON control protocol over a unix socket
//!
//! The daemon binary (`mergequeued`) wires these together; everything
//! here is usable in-process as well, which is how the test suite
//! drives it.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::path::PathBuf;
//! use mergequeue::config::Config;
//! use mergequeue::engine::MergeEngine;
//! use mergequeue::queue::QueueManager;
//! use mergequeue::state::{StateSnapshot, StateStore};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let repo = PathBuf::from("/path/to/repo");
//! let store = StateStore::for_repo(&repo)?;
//! let snapshot = store
//!     .load()?
//!     .unwrap_or_else(|| StateSnapshot::empty(repo.clone()));
//!
//! let handle = QueueManager::spawn(
//!     Config::default(),
//!     MergeEngine::new(repo),
//!     store,
//!     snapshot,
//! );
//!
//! handle.register("s-1".into(), "w-1".into(), None, None).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod git;
pub mod ipc;
pub mod logging;
pub mod protocol;
pub mod queue;
pub mod session;
pub mod state;

pub use config::Config;
pub use engine::{MergeEngine, MergeOutcome};
pub use error::{DaemonError, DaemonResult, GitError};
pub use queue::{QueueHandle, QueueManager, WaitResult, WorkerState};
pub use session::SessionState;

/// Library version from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
