//! Control interface: newline-delimited JSON over a unix socket.
//!
//! Each connection gets its own task and is served request-by-request;
//! a malformed line produces an `ERROR` response and the connection
//! stays open. `WAIT` parks inside the queue manager, so a blocked
//! waiter never stalls other connections.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;

use crate::protocol::{self, Request, Response};
use crate::queue::QueueHandle;

/// Wait requests without an explicit timeout block this long.
pub const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 300;

/// The unix-socket control server.
pub struct IpcServer {
    socket_path: PathBuf,
    handle: QueueHandle,
    shutdown: Arc<watch::Sender<bool>>,
}

impl IpcServer {
    /// Creates a server bound to `socket_path` once [`run`](Self::run)
    /// is called. The watch sender is flipped when a SHUTDOWN request
    /// arrives, and observed to stop accepting.
    #[must_use]
    pub fn new(
        socket_path: PathBuf,
        handle: QueueHandle,
        shutdown: Arc<watch::Sender<bool>>,
    ) -> Self {
        Self {
            socket_path,
            handle,
            shutdown,
        }
    }

    /// Accepts connections until shutdown is signalled.
    ///
    /// A leftover socket file from a previous run is removed before
    /// binding; the lock file already guarantees single ownership of
    /// the repository.
    pub async fn run(self) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).with_context(|| {
                format!(
                    "Failed to remove stale socket: {}",
                    self.socket_path.display()
                )
            })?;
        }
        if let Some(parent) = self.socket_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create socket directory: {}", parent.display())
            })?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind socket: {}", self.socket_path.display()))?;
        tracing::info!(socket = %self.socket_path.display(), "control interface listening");

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let handle = self.handle.clone();
                            let shutdown = Arc::clone(&self.shutdown);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, handle, shutdown).await {
                                    tracing::debug!(error = %e, "connection closed with error");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    break;
                }
            }
        }

        let _ = std::fs::remove_file(&self.socket_path);
        tracing::info!("control interface stopped");
        Ok(())
    }
}

async fn serve_connection(
    stream: UnixStream,
    handle: QueueHandle,
    shutdown: Arc<watch::Sender<bool>>,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = dispatch(&handle, &shutdown, &line).await;
        let mut payload = serde_json::to_string(&response)
            .context("Failed to serialize response")?;
        payload.push('\n');
        write_half.write_all(payload.as_bytes()).await?;
    }
    Ok(())
}

async fn dispatch(
    handle: &QueueHandle,
    shutdown: &watch::Sender<bool>,
    line: &str,
) -> Response {
    let request = match protocol::parse_request(line) {
        Ok(request) => request,
        Err(e) => return Response::error(&e),
    };

    match request {
        Request::Register {
            worker_id,
            session_id,
            target_branch,
            base_branch,
        } => match handle
            .register(session_id, worker_id, target_branch, base_branch)
            .await
        {
            Ok(()) => Response::ok(),
            Err(e) => Response::error(&e),
        },
        Request::Enqueue {
            worker_id,
            branch,
            worktree,
            target_branch,
            priority,
        } => match handle
            .enqueue(worker_id, branch, worktree, target_branch, priority)
            .await
        {
            Ok(position) => Response::ok_at(position),
            Err(e) => Response::error(&e),
        },
        Request::Dequeue { worker_id } => match handle.dequeue(worker_id).await {
            Ok(()) => Response::ok(),
            Err(e) => Response::error(&e),
        },
        Request::Status => match handle.status().await {
            Ok(snapshot) => Response::Status { snapshot },
            Err(e) => Response::error(&e),
        },
        Request::Conflicts { worker_id } => match handle.conflicts(worker_id).await {
            Ok(report) => Response::Conflicts { report },
            Err(e) => Response::error(&e),
        },
        Request::Retry { worker_id } => match handle.retry(worker_id).await {
            Ok(position) => Response::ok_at(position),
            Err(e) => Response::error(&e),
        },
        Request::Wait {
            worker_id,
            timeout_seconds,
        } => {
            let timeout =
                Duration::from_secs(timeout_seconds.unwrap_or(DEFAULT_WAIT_TIMEOUT_SECS));
            match handle.wait(worker_id, timeout).await {
                Ok(result) => Response::from_wait(result),
                Err(e) => Response::error(&e),
            }
        }
        Request::Session { session_id, state } => {
            match handle.session_signal(session_id, state).await {
                Ok(()) => Response::ok(),
                Err(e) => Response::error(&e),
            }
        }
        Request::CancelSession { session_id } => match handle.cancel_session(session_id).await {
            Ok(()) => Response::ok(),
            Err(e) => Response::error(&e),
        },
        Request::Shutdown => match handle.shutdown().await {
            Ok(()) => {
                let _ = shutdown.send(true);
                Response::ok()
            }
            Err(e) => Response::error(&e),
        },
    }
}
