use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;

use mergequeue::config::Config;
use mergequeue::engine::MergeEngine;
use mergequeue::git;
use mergequeue::ipc::IpcServer;
use mergequeue::logging::{LogConfig, LogFormat, LogLevel, init_logging};
use mergequeue::queue::QueueManager;
use mergequeue::state::{LockGuard, StateSnapshot, StateStore};

/// Merge-coordination daemon for multi-worker git repositories.
#[derive(Parser, Debug)]
#[command(name = "mergequeued", version, about)]
struct Args {
    /// Path to the integration repository.
    #[arg(short, long, default_value = ".")]
    repo: PathBuf,

    /// Unix socket path for the control interface.
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Explicit state file path (defaults to the per-repo state dir).
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the conflict-retry bound.
    #[arg(long)]
    max_retries: Option<u32>,

    /// Override the default integration branch.
    #[arg(long)]
    target_branch: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to a file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Log format (text, json).
    #[arg(long, default_value = "text")]
    log_format: String,
}

impl Args {
    fn resolve_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load_from_file(path)?,
            None => Config::default(),
        };
        if let Some(max_retries) = self.max_retries {
            config.max_retries = max_retries;
        }
        if let Some(target_branch) = &self.target_branch {
            config.default_target_branch = target_branch.clone();
        }
        if let Some(socket) = &self.socket {
            config.socket_path = socket.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let _log_guard = init_logging(LogConfig {
        level: LogLevel::parse(&args.log_level),
        file: args.log_file.clone(),
        format: LogFormat::parse(&args.log_format).unwrap_or_default(),
    });

    let config = args.resolve_config()?;

    git::verify_repository(&args.repo)
        .with_context(|| format!("{} is not a git repository", args.repo.display()))?;
    let repo_path = git::canonical_repo_path(&args.repo)?;

    let lock = LockGuard::acquire(&repo_path)?
        .with_context(|| format!("another mergequeued already coordinates {}", repo_path.display()))?;

    let store = match (&args.state_file, &config.state_dir) {
        (Some(path), _) => StateStore::new(path.clone()),
        (None, Some(dir)) => {
            let hash = mergequeue::state::compute_repo_hash(&repo_path)?;
            StateStore::new(dir.join(format!("queue-{hash}.json")))
        }
        (None, None) => StateStore::for_repo(&repo_path)?,
    };
    let snapshot = store
        .load()?
        .unwrap_or_else(|| StateSnapshot::empty(repo_path.clone()));

    tracing::info!(
        version = mergequeue::VERSION,
        git_hash = env!("GIT_HASH"),
        repo = %repo_path.display(),
        state_file = %store.path().display(),
        "mergequeued starting"
    );

    let handle = QueueManager::spawn(
        config.clone(),
        MergeEngine::new(repo_path),
        store,
        snapshot,
    );

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let shutdown = Arc::new(shutdown_tx);
    let server = IpcServer::new(config.socket_path.clone(), handle.clone(), Arc::clone(&shutdown));
    let server_task = tokio::spawn(server.run());

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("termination signal received");
        }
        _ = shutdown_rx.changed() => {
            tracing::info!("shutdown requested over the control interface");
        }
    }

    // Drain: refuse new work, release waiters, let an in-flight merge
    // finish, then stop the listener.
    if let Err(e) = handle.shutdown().await {
        tracing::warn!(error = %e, "queue manager already stopped");
    }
    let _ = shutdown.send(true);
    server_task
        .await
        .context("control interface task panicked")??;

    drop(lock);
    tracing::info!("mergequeued stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
