//! Queue manager: the single owner of all coordination state.
//!
//! All state lives inside one actor task. Callers hold a cheap
//! [`QueueHandle`] and talk to the actor over an mpsc channel; each
//! command carries a oneshot for its reply. Merge attempts run on a
//! blocking task and re-enter the actor as an internal message, so the
//! actor never blocks and status queries stay responsive mid-merge.
//!
//! Ordering rules:
//! - Requests are served strictly FIFO by sequence number.
//! - A retry after a conflict (and the single automatic requeue after a
//!   transient error) is inserted at the *head* of the queue, never
//!   ahead of the attempt already in flight.
//! - At most one merge attempt is in flight at any time.
//!
//! Every state transition is persisted before its effects become
//! visible to callers.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::config::Config;
use crate::engine::{MergeEngine, MergeOutcome};
use crate::error::{DaemonError, DaemonResult};
use crate::git;
use crate::session::{Session, SessionState};
use crate::state::{InFlightAttempt, StateSnapshot, StateStore};

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Registered; producing changes in its worktree.
    Working,
    /// Has a request in the pending queue.
    Queued,
    /// Its request is the attempt currently in flight.
    Merging,
    /// Branch landed on the target. Terminal.
    Merged,
    /// Last attempt conflicted; awaiting a rebase-and-retry.
    Conflict,
    /// Retry budget exhausted or unrecoverable; needs manual
    /// intervention. Terminal.
    Abandoned,
}

impl WorkerState {
    /// Whether no further automatic processing will happen.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Merged | Self::Abandoned)
    }
}

/// A registered worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    /// Caller-chosen worker identifier.
    pub id: String,
    /// Session this worker belongs to.
    pub session_id: String,
    /// Current lifecycle state.
    pub state: WorkerState,
    /// Branch submitted with the most recent enqueue, if any.
    pub branch: Option<String>,
    /// Worktree submitted with the most recent enqueue, if any.
    pub worktree: Option<PathBuf>,
    /// Conflicting attempts accumulated so far.
    pub conflict_retries: u32,
    /// Registration time.
    pub created_at: DateTime<Utc>,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
    /// Outcome of the most recent merge attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_outcome: Option<MergeOutcome>,
    /// Explanation of the most recent failure or abandonment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Worker {
    /// Creates a freshly registered worker in the WORKING state.
    #[must_use]
    pub fn new(id: String, session_id: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            session_id,
            state: WorkerState::Working,
            branch: None,
            worktree: None,
            conflict_retries: 0,
            created_at: now,
            updated_at: now,
            last_outcome: None,
            last_error: None,
        }
    }

    fn set_state(&mut self, state: WorkerState) {
        self.state = state;
        self.updated_at = Utc::now();
    }
}

/// A merge request waiting in (or dispatched from) the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRequest {
    /// The submitting worker.
    pub worker_id: String,
    /// Branch to merge into the target.
    pub branch: String,
    /// Worktree the branch was produced in.
    pub worktree: PathBuf,
    /// Integration branch to merge onto.
    pub target_branch: String,
    /// Monotonic sequence number; defines FIFO order.
    pub seq: u64,
    /// Head-inserted (conflict retry) rather than appended.
    #[serde(default)]
    pub priority: bool,
    /// Already requeued once after a transient error; a second
    /// transient failure abandons the worker.
    #[serde(default)]
    pub requeued_after_error: bool,
}

/// Resolution delivered to a blocked `wait` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitResult {
    /// The worker's branch merged; carries the merge commit.
    Merged { commit: String },
    /// The worker was abandoned; carries the recorded reason.
    Abandoned { reason: String },
    /// The caller-supplied timeout elapsed first.
    TimedOut,
    /// The daemon shut down before the worker reached a terminal state.
    ShuttingDown,
}

/// Conflict details for one worker's most recent attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConflictReport {
    /// The conflicted worker.
    pub worker_id: String,
    /// Paths that conflicted.
    pub paths: Vec<String>,
    /// Common ancestor of target and worker branch at attempt time.
    pub merge_base_commit: String,
}

/// One worker's line in a status report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSummary {
    pub id: String,
    pub session_id: String,
    pub state: WorkerState,
    /// 1-based position in the pending queue, for QUEUED workers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    pub conflict_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// One session's line in a status report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub state: SessionState,
    pub target_branch: String,
    /// Number of merges recorded for the session.
    pub merged_commits: usize,
}

/// Point-in-time view of the whole queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub queue_length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_flight_worker: Option<String>,
    pub workers: Vec<WorkerSummary>,
    pub sessions: Vec<SessionSummary>,
}

enum Command {
    Register {
        session_id: String,
        worker_id: String,
        target_branch: Option<String>,
        base_branch: Option<String>,
        reply: oneshot::Sender<DaemonResult<()>>,
    },
    Enqueue {
        worker_id: String,
        branch: String,
        worktree: PathBuf,
        target_branch: Option<String>,
        priority: bool,
        reply: oneshot::Sender<DaemonResult<usize>>,
    },
    Dequeue {
        worker_id: String,
        reply: oneshot::Sender<DaemonResult<()>>,
    },
    Retry {
        worker_id: String,
        reply: oneshot::Sender<DaemonResult<usize>>,
    },
    Status {
        reply: oneshot::Sender<StatusSnapshot>,
    },
    Conflicts {
        worker_id: String,
        reply: oneshot::Sender<DaemonResult<ConflictReport>>,
    },
    Wait {
        worker_id: String,
        notify: oneshot::Sender<WaitResult>,
        reply: oneshot::Sender<DaemonResult<()>>,
    },
    SessionSignal {
        session_id: String,
        state: SessionState,
        reply: oneshot::Sender<DaemonResult<()>>,
    },
    CancelSession {
        session_id: String,
        reply: oneshot::Sender<DaemonResult<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    MergeFinished {
        worker_id: String,
        outcome: MergeOutcome,
    },
}

/// Cloneable handle to the queue actor.
#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::Sender<Command>,
}

impl QueueHandle {
    async fn send(&self, command: Command) -> DaemonResult<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| DaemonError::ShuttingDown)
    }

    /// Registers a worker, creating its session on first sight.
    pub async fn register(
        &self,
        session_id: String,
        worker_id: String,
        target_branch: Option<String>,
        base_branch: Option<String>,
    ) -> DaemonResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Register {
            session_id,
            worker_id,
            target_branch,
            base_branch,
            reply,
        })
        .await?;
        rx.await.map_err(|_| DaemonError::ShuttingDown)?
    }

    /// Submits a worker's branch for merging. Returns the 1-based queue
    /// position. `priority` requests head insertion, as a conflict-retry
    /// resubmission does.
    pub async fn enqueue(
        &self,
        worker_id: String,
        branch: String,
        worktree: PathBuf,
        target_branch: Option<String>,
        priority: bool,
    ) -> DaemonResult<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Enqueue {
            worker_id,
            branch,
            worktree,
            target_branch,
            priority,
            reply,
        })
        .await?;
        rx.await.map_err(|_| DaemonError::ShuttingDown)?
    }

    /// Withdraws a worker's pending request before it is dispatched.
    pub async fn dequeue(&self, worker_id: String) -> DaemonResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Dequeue { worker_id, reply }).await?;
        rx.await.map_err(|_| DaemonError::ShuttingDown)?
    }

    /// Resubmits a conflicted worker at the head of the queue.
    pub async fn retry(&self, worker_id: String) -> DaemonResult<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Retry { worker_id, reply }).await?;
        rx.await.map_err(|_| DaemonError::ShuttingDown)?
    }

    /// Returns a point-in-time view of the queue.
    pub async fn status(&self) -> DaemonResult<StatusSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { reply }).await?;
        rx.await.map_err(|_| DaemonError::ShuttingDown)
    }

    /// Returns the conflict report from a worker's most recent attempt.
    pub async fn conflicts(&self, worker_id: String) -> DaemonResult<ConflictReport> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Conflicts { worker_id, reply }).await?;
        rx.await.map_err(|_| DaemonError::ShuttingDown)?
    }

    /// Blocks until the worker reaches a terminal state, the timeout
    /// elapses, or the daemon shuts down.
    pub async fn wait(&self, worker_id: String, timeout: Duration) -> DaemonResult<WaitResult> {
        let (notify, notified) = oneshot::channel();
        let (reply, rx) = oneshot::channel();
        self.send(Command::Wait {
            worker_id,
            notify,
            reply,
        })
        .await?;
        rx.await.map_err(|_| DaemonError::ShuttingDown)??;

        match tokio::time::timeout(timeout, notified).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Ok(WaitResult::ShuttingDown),
            Err(_) => Ok(WaitResult::TimedOut),
        }
    }

    /// Applies an orchestrator-driven session transition.
    pub async fn session_signal(
        &self,
        session_id: String,
        state: SessionState,
    ) -> DaemonResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SessionSignal {
            session_id,
            state,
            reply,
        })
        .await?;
        rx.await.map_err(|_| DaemonError::ShuttingDown)?
    }

    /// Removes a finished session and its workers.
    pub async fn cancel_session(&self, session_id: String) -> DaemonResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::CancelSession { session_id, reply })
            .await?;
        rx.await.map_err(|_| DaemonError::ShuttingDown)?
    }

    /// Initiates a graceful shutdown. Idempotent.
    pub async fn shutdown(&self) -> DaemonResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown { reply }).await?;
        rx.await.map_err(|_| DaemonError::ShuttingDown)
    }
}

/// Spawns the queue actor.
pub struct QueueManager;

impl QueueManager {
    /// Starts the actor from a (possibly recovered) snapshot and
    /// returns a handle to it.
    pub fn spawn(
        config: Config,
        engine: MergeEngine,
        store: StateStore,
        snapshot: StateSnapshot,
    ) -> QueueHandle {
        let (tx, rx) = mpsc::channel(64);
        let actor = QueueActor::from_snapshot(config, Arc::new(engine), store, snapshot, tx.clone());
        tokio::spawn(actor.run(rx));
        QueueHandle { tx }
    }
}

/// Inserts a request, returning its 1-based position.
///
/// Priority requests go to the head; everything else is appended.
fn insert_pending(pending: &mut VecDeque<MergeRequest>, request: MergeRequest) -> usize {
    if request.priority {
        pending.push_front(request);
        1
    } else {
        pending.push_back(request);
        pending.len()
    }
}

struct QueueActor {
    config: Config,
    engine: Arc<MergeEngine>,
    store: StateStore,
    repo_path: PathBuf,
    sessions: HashMap<String, Session>,
    workers: HashMap<String, Worker>,
    pending: VecDeque<MergeRequest>,
    next_seq: u64,
    in_flight: Option<InFlightAttempt>,
    waiters: HashMap<String, Vec<oneshot::Sender<WaitResult>>>,
    shutting_down: bool,
    internal_tx: mpsc::Sender<Command>,
}

impl QueueActor {
    fn from_snapshot(
        config: Config,
        engine: Arc<MergeEngine>,
        store: StateStore,
        snapshot: StateSnapshot,
        internal_tx: mpsc::Sender<Command>,
    ) -> Self {
        let repo_path = engine.repo_path().to_path_buf();
        Self {
            config,
            engine,
            store,
            repo_path,
            sessions: snapshot.sessions.into_iter().map(|s| (s.id.clone(), s)).collect(),
            workers: snapshot.workers.into_iter().map(|w| (w.id.clone(), w)).collect(),
            pending: snapshot.pending.into(),
            next_seq: snapshot.next_seq,
            in_flight: snapshot.in_flight,
            waiters: HashMap::new(),
            shutting_down: false,
            internal_tx,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        self.recover();
        self.maybe_dispatch();

        while let Some(command) = rx.recv().await {
            self.handle(command);
            if self.shutting_down && self.in_flight.is_none() {
                break;
            }
        }
        tracing::info!("queue manager stopped");
    }

    /// Reconciles an attempt that was in flight when the last process
    /// died. The request is re-queued at the head, unless the target
    /// head moved while we were down; a moved head means someone
    /// touched the branch manually, so the worker is parked in CONFLICT
    /// for an operator to decide instead of being silently retried.
    fn recover(&mut self) {
        let Some(attempt) = self.in_flight.take() else {
            return;
        };

        let worker_id = attempt.request.worker_id.clone();
        let current_head = git::rev_parse(&self.repo_path, &attempt.request.target_branch).ok();
        let head_unchanged = attempt.target_head.is_empty()
            || current_head.as_deref() == Some(attempt.target_head.as_str());

        let Some(worker) = self.workers.get_mut(&worker_id) else {
            tracing::error!(%worker_id, "in-flight attempt for unknown worker dropped");
            self.persist();
            return;
        };

        if head_unchanged {
            tracing::warn!(
                %worker_id,
                branch = %attempt.request.branch,
                "recovered interrupted merge; re-queued at head"
            );
            worker.set_state(WorkerState::Queued);
            let mut request = attempt.request;
            request.priority = true;
            self.pending.push_front(request);
        } else {
            tracing::warn!(
                %worker_id,
                recorded_head = %attempt.target_head,
                current_head = current_head.as_deref().unwrap_or("<unknown>"),
                "target branch moved during an interrupted merge; flagging worker for manual review"
            );
            worker.set_state(WorkerState::Conflict);
            worker.last_error = Some(
                "target branch changed while a merge was interrupted; review and RETRY manually"
                    .to_string(),
            );
        }
        self.persist();
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Register {
                session_id,
                worker_id,
                target_branch,
                base_branch,
                reply,
            } => {
                let result = self.register(session_id, worker_id, target_branch, base_branch);
                let _ = reply.send(result);
            }
            Command::Enqueue {
                worker_id,
                branch,
                worktree,
                target_branch,
                priority,
                reply,
            } => {
                let result = self.enqueue(worker_id, branch, worktree, target_branch, priority);
                let _ = reply.send(result);
                self.maybe_dispatch();
            }
            Command::Dequeue { worker_id, reply } => {
                let _ = reply.send(self.dequeue(&worker_id));
            }
            Command::Retry { worker_id, reply } => {
                let result = self.retry(&worker_id);
                let _ = reply.send(result);
                self.maybe_dispatch();
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Conflicts { worker_id, reply } => {
                let _ = reply.send(self.conflicts(&worker_id));
            }
            Command::Wait {
                worker_id,
                notify,
                reply,
            } => {
                let _ = reply.send(self.wait(&worker_id, notify));
            }
            Command::SessionSignal {
                session_id,
                state,
                reply,
            } => {
                let _ = reply.send(self.session_signal(&session_id, state));
            }
            Command::CancelSession { session_id, reply } => {
                let _ = reply.send(self.cancel_session(&session_id));
            }
            Command::Shutdown { reply } => {
                self.begin_shutdown();
                let _ = reply.send(());
            }
            Command::MergeFinished { worker_id, outcome } => {
                self.finish_merge(&worker_id, outcome);
                self.maybe_dispatch();
            }
        }
    }

    fn register(
        &mut self,
        session_id: String,
        worker_id: String,
        target_branch: Option<String>,
        base_branch: Option<String>,
    ) -> DaemonResult<()> {
        if self.shutting_down {
            return Err(DaemonError::ShuttingDown);
        }
        if self.workers.contains_key(&worker_id) {
            return Err(DaemonError::DuplicateWorker { worker_id });
        }

        let target = target_branch.unwrap_or_else(|| self.config.default_target_branch.clone());
        let base = base_branch.unwrap_or_else(|| target.clone());

        let session = self
            .sessions
            .entry(session_id.clone())
            .or_insert_with(|| Session::new(session_id.clone(), target, base));
        session.transition_if_needed(SessionState::Working);

        tracing::info!(%worker_id, %session_id, "worker registered");
        self.workers
            .insert(worker_id.clone(), Worker::new(worker_id, session_id));
        self.persist();
        Ok(())
    }

    fn enqueue(
        &mut self,
        worker_id: String,
        branch: String,
        worktree: PathBuf,
        target_branch: Option<String>,
        priority: bool,
    ) -> DaemonResult<usize> {
        if self.shutting_down {
            return Err(DaemonError::ShuttingDown);
        }
        let max_retries = self.config.max_retries;
        let max_queue_size = self.config.max_queue_size;
        let default_target = self.config.default_target_branch.clone();

        let Some(worker) = self.workers.get_mut(&worker_id) else {
            return Err(DaemonError::UnknownWorker { worker_id });
        };

        match worker.state {
            WorkerState::Queued | WorkerState::Merging => {
                return Err(DaemonError::AlreadyQueued { worker_id });
            }
            WorkerState::Merged => {
                return Err(DaemonError::BadRequest {
                    message: format!("worker '{worker_id}' is already merged"),
                });
            }
            WorkerState::Abandoned => {
                return Err(DaemonError::BadRequest {
                    message: format!("worker '{worker_id}' was abandoned"),
                });
            }
            WorkerState::Conflict if worker.conflict_retries >= max_retries => {
                worker.set_state(WorkerState::Abandoned);
                worker.last_error = Some(format!(
                    "abandoned after {max_retries} conflicting attempts"
                ));
                let session_id = worker.session_id.clone();
                tracing::warn!(%worker_id, max_retries, "retry budget exhausted; worker abandoned");
                self.persist();
                self.notify_waiters(
                    &worker_id,
                    WaitResult::Abandoned {
                        reason: format!("abandoned after {max_retries} conflicting attempts"),
                    },
                );
                self.settle_session_if_drained(&session_id);
                return Err(DaemonError::MaxRetriesExceeded {
                    worker_id,
                    max_retries,
                });
            }
            WorkerState::Working | WorkerState::Conflict => {}
        }

        if self.pending.len() >= max_queue_size {
            return Err(DaemonError::QueueFull {
                capacity: max_queue_size,
            });
        }

        // Re-borrow: the capacity check above needed `self.pending`.
        let worker = self.workers.get_mut(&worker_id).expect("checked above");
        let target = target_branch.unwrap_or(default_target);
        worker.branch = Some(branch.clone());
        worker.worktree = Some(worktree.clone());
        worker.set_state(WorkerState::Queued);
        let session_id = worker.session_id.clone();

        let request = MergeRequest {
            worker_id: worker_id.clone(),
            branch,
            worktree,
            target_branch: target,
            seq: self.next_seq,
            priority,
            requeued_after_error: false,
        };
        self.next_seq += 1;
        let position = insert_pending(&mut self.pending, request);

        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.transition_if_needed(SessionState::Merging);
        }

        tracing::info!(%worker_id, position, priority, "merge request enqueued");
        self.persist();
        Ok(position)
    }

    fn dequeue(&mut self, worker_id: &str) -> DaemonResult<()> {
        let Some(worker) = self.workers.get_mut(worker_id) else {
            return Err(DaemonError::UnknownWorker {
                worker_id: worker_id.to_string(),
            });
        };

        if worker.state == WorkerState::Merging {
            return Err(DaemonError::BadRequest {
                message: format!("worker '{worker_id}' is mid-merge and cannot be withdrawn"),
            });
        }

        let before = self.pending.len();
        self.pending.retain(|r| r.worker_id != worker_id);
        if self.pending.len() == before {
            return Err(DaemonError::BadRequest {
                message: format!("worker '{worker_id}' has no pending request"),
            });
        }

        let worker = self.workers.get_mut(worker_id).expect("checked above");
        worker.set_state(WorkerState::Working);
        let session_id = worker.session_id.clone();
        tracing::info!(worker_id, "merge request withdrawn");
        self.persist();
        self.settle_session_if_drained(&session_id);
        Ok(())
    }

    fn retry(&mut self, worker_id: &str) -> DaemonResult<usize> {
        let Some(worker) = self.workers.get(worker_id) else {
            return Err(DaemonError::UnknownWorker {
                worker_id: worker_id.to_string(),
            });
        };
        if worker.state != WorkerState::Conflict {
            return Err(DaemonError::BadRequest {
                message: format!(
                    "worker '{worker_id}' has no conflict to retry (state: {:?})",
                    worker.state
                ),
            });
        }
        let (Some(branch), Some(worktree)) = (worker.branch.clone(), worker.worktree.clone())
        else {
            return Err(DaemonError::BadRequest {
                message: format!("worker '{worker_id}' has no recorded submission"),
            });
        };

        self.enqueue(worker_id.to_string(), branch, worktree, None, true)
    }

    fn status(&self) -> StatusSnapshot {
        let mut workers: Vec<WorkerSummary> = self
            .workers
            .values()
            .map(|w| WorkerSummary {
                id: w.id.clone(),
                session_id: w.session_id.clone(),
                state: w.state,
                queue_position: self
                    .pending
                    .iter()
                    .position(|r| r.worker_id == w.id)
                    .map(|i| i + 1),
                conflict_retries: w.conflict_retries,
                last_error: w.last_error.clone(),
            })
            .collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));

        let mut sessions: Vec<SessionSummary> = self
            .sessions
            .values()
            .map(|s| SessionSummary {
                id: s.id.clone(),
                state: s.state,
                target_branch: s.target_branch.clone(),
                merged_commits: s.merged_commits.len(),
            })
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));

        StatusSnapshot {
            queue_length: self.pending.len(),
            in_flight_worker: self
                .in_flight
                .as_ref()
                .map(|a| a.request.worker_id.clone()),
            workers,
            sessions,
        }
    }

    fn conflicts(&self, worker_id: &str) -> DaemonResult<ConflictReport> {
        let Some(worker) = self.workers.get(worker_id) else {
            return Err(DaemonError::UnknownWorker {
                worker_id: worker_id.to_string(),
            });
        };
        match &worker.last_outcome {
            Some(MergeOutcome::Conflict { paths, merge_base }) => Ok(ConflictReport {
                worker_id: worker_id.to_string(),
                paths: paths.clone(),
                merge_base_commit: merge_base.clone(),
            }),
            _ => Err(DaemonError::NoConflictRecorded {
                worker_id: worker_id.to_string(),
            }),
        }
    }

    fn wait(&mut self, worker_id: &str, notify: oneshot::Sender<WaitResult>) -> DaemonResult<()> {
        if self.shutting_down {
            let _ = notify.send(WaitResult::ShuttingDown);
            return Ok(());
        }
        let Some(worker) = self.workers.get(worker_id) else {
            return Err(DaemonError::UnknownWorker {
                worker_id: worker_id.to_string(),
            });
        };

        // Terminal workers resolve immediately; everyone else parks.
        match (worker.state, &worker.last_outcome) {
            (WorkerState::Merged, Some(MergeOutcome::Success { commit })) => {
                let _ = notify.send(WaitResult::Merged {
                    commit: commit.clone(),
                });
            }
            (WorkerState::Merged, _) => {
                let _ = notify.send(WaitResult::Merged {
                    commit: String::new(),
                });
            }
            (WorkerState::Abandoned, _) => {
                let _ = notify.send(WaitResult::Abandoned {
                    reason: worker
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "abandoned".to_string()),
                });
            }
            _ => {
                self.waiters
                    .entry(worker_id.to_string())
                    .or_default()
                    .push(notify);
            }
        }
        Ok(())
    }

    fn session_signal(&mut self, session_id: &str, state: SessionState) -> DaemonResult<()> {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return Err(DaemonError::UnknownSession {
                session_id: session_id.to_string(),
            });
        };
        session.transition(state)?;
        self.persist();
        Ok(())
    }

    fn cancel_session(&mut self, session_id: &str) -> DaemonResult<()> {
        if !self.sessions.contains_key(session_id) {
            return Err(DaemonError::UnknownSession {
                session_id: session_id.to_string(),
            });
        }
        let active = self
            .workers
            .values()
            .any(|w| w.session_id == session_id && !w.state.is_terminal());
        if active {
            return Err(DaemonError::SessionNotTerminal {
                session_id: session_id.to_string(),
            });
        }

        self.sessions.remove(session_id);
        self.workers.retain(|_, w| w.session_id != session_id);
        tracing::info!(session_id, "session cancelled");
        self.persist();
        Ok(())
    }

    fn begin_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        tracing::info!(
            pending = self.pending.len(),
            in_flight = self.in_flight.is_some(),
            "shutdown requested; refusing new work"
        );
        self.shutting_down = true;
        self.persist();

        let waiters = std::mem::take(&mut self.waiters);
        for (_, senders) in waiters {
            for sender in senders {
                let _ = sender.send(WaitResult::ShuttingDown);
            }
        }
    }

    /// Starts the next attempt if nothing is in flight.
    fn maybe_dispatch(&mut self) {
        if self.shutting_down || self.in_flight.is_some() {
            return;
        }
        let Some(request) = self.pending.pop_front() else {
            return;
        };

        if let Some(worker) = self.workers.get_mut(&request.worker_id) {
            worker.set_state(WorkerState::Merging);
        }

        // Record the observed target head so an interrupted attempt can
        // be reconciled on the next boot.
        let target_head = git::rev_parse(&self.repo_path, &request.target_branch)
            .unwrap_or_default();
        self.in_flight = Some(InFlightAttempt {
            request: request.clone(),
            target_head,
            started_at: Utc::now(),
        });
        self.persist();

        tracing::info!(
            worker_id = %request.worker_id,
            branch = %request.branch,
            target_branch = %request.target_branch,
            seq = request.seq,
            "dispatching merge attempt"
        );

        let engine = Arc::clone(&self.engine);
        let tx = self.internal_tx.clone();
        tokio::task::spawn_blocking(move || {
            let outcome = engine.attempt(&request.worker_id, &request.branch, &request.target_branch);
            let _ = tx.blocking_send(Command::MergeFinished {
                worker_id: request.worker_id,
                outcome,
            });
        });
    }

    fn finish_merge(&mut self, worker_id: &str, outcome: MergeOutcome) {
        let Some(attempt) = self.in_flight.take() else {
            tracing::error!(worker_id, "merge finished with no attempt in flight");
            return;
        };
        if attempt.request.worker_id != worker_id {
            tracing::error!(
                worker_id,
                in_flight = %attempt.request.worker_id,
                "merge finished for a different worker than dispatched"
            );
        }
        let request = attempt.request;
        let max_retries = self.config.max_retries;

        let Some(worker) = self.workers.get_mut(worker_id) else {
            tracing::error!(worker_id, "merge finished for unknown worker");
            self.persist();
            return;
        };
        let session_id = worker.session_id.clone();

        match outcome {
            MergeOutcome::Success { commit } => {
                worker.set_state(WorkerState::Merged);
                worker.last_outcome = Some(MergeOutcome::Success {
                    commit: commit.clone(),
                });
                worker.last_error = None;
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    session.record_merge(worker_id, &commit);
                }
                self.persist();
                self.notify_waiters(worker_id, WaitResult::Merged { commit });
                self.settle_session_if_drained(&session_id);
            }
            MergeOutcome::Conflict { paths, merge_base } => {
                worker.conflict_retries += 1;
                let retries = worker.conflict_retries;
                worker.last_outcome = Some(MergeOutcome::Conflict {
                    paths: paths.clone(),
                    merge_base,
                });
                if retries > max_retries {
                    let reason = format!("abandoned after {retries} conflicting attempts");
                    worker.set_state(WorkerState::Abandoned);
                    worker.last_error = Some(reason.clone());
                    tracing::warn!(worker_id, retries, "conflict retry budget exceeded");
                    self.persist();
                    self.notify_waiters(worker_id, WaitResult::Abandoned { reason });
                } else {
                    worker.set_state(WorkerState::Conflict);
                    tracing::info!(
                        worker_id,
                        retries,
                        conflicts = paths.len(),
                        "merge conflicted; awaiting rebase and retry"
                    );
                    self.persist();
                }
                self.settle_session_if_drained(&session_id);
            }
            MergeOutcome::Error { reason } => {
                if request.requeued_after_error {
                    worker.set_state(WorkerState::Abandoned);
                    worker.last_error = Some(reason.clone());
                    tracing::error!(worker_id, %reason, "repeated transient failure; worker abandoned");
                    self.persist();
                    self.notify_waiters(worker_id, WaitResult::Abandoned { reason });
                    self.settle_session_if_drained(&session_id);
                } else {
                    // One bounded automatic retry at the head.
                    worker.set_state(WorkerState::Queued);
                    worker.last_error = Some(reason.clone());
                    let mut requeued = request;
                    requeued.priority = true;
                    requeued.requeued_after_error = true;
                    self.pending.push_front(requeued);
                    tracing::warn!(worker_id, %reason, "transient failure; re-queued at head");
                    self.persist();
                }
            }
        }
    }

    fn notify_waiters(&mut self, worker_id: &str, result: WaitResult) {
        if let Some(senders) = self.waiters.remove(worker_id) {
            for sender in senders {
                let _ = sender.send(result.clone());
            }
        }
    }

    /// Moves a session back to WORKING once it has nothing pending or
    /// in flight and still has unfinished workers.
    fn settle_session_if_drained(&mut self, session_id: &str) {
        let busy = self
            .pending
            .iter()
            .any(|r| self.worker_session(&r.worker_id) == Some(session_id))
            || self
                .in_flight
                .as_ref()
                .is_some_and(|a| self.worker_session(&a.request.worker_id) == Some(session_id));
        if busy {
            return;
        }
        if let Some(session) = self.sessions.get_mut(session_id)
            && session.transition_if_needed(SessionState::Working)
        {
            self.persist();
        }
    }

    fn worker_session(&self, worker_id: &str) -> Option<&str> {
        self.workers.get(worker_id).map(|w| w.session_id.as_str())
    }

    fn snapshot(&self) -> StateSnapshot {
        let mut sessions: Vec<Session> = self.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        let mut workers: Vec<Worker> = self.workers.values().cloned().collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));

        StateSnapshot {
            schema_version: crate::state::SCHEMA_VERSION,
            repo_path: self.repo_path.clone(),
            saved_at: Utc::now(),
            next_seq: self.next_seq,
            sessions,
            workers,
            pending: self.pending.iter().cloned().collect(),
            in_flight: self.in_flight.clone(),
        }
    }

    fn persist(&mut self) {
        let mut snapshot = self.snapshot();
        if let Err(e) = self.store.save(&mut snapshot) {
            // Nothing sensible to do mid-flight; the next mutation
            // rewrites the whole snapshot anyway.
            tracing::error!(error = %e, path = %self.store.path().display(), "failed to persist state");
        }
    }
}
