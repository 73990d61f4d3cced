//! Coordinator: opens the store, reconciles, and runs the four workers.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cancel::CancelRegistry;
use crate::config::Config;
use crate::exec::CommandRunner;
use crate::paths::{DB_FILE, DOT_DIR};
use crate::store::{SqliteStore, StoreError};
use crate::worker::{self, WorkerDeps};

/// Open (creating if missing) the storage file under `<repo>/.conveyor/`.
///
/// The pool carries the busy timeout and foreign-key enforcement every
/// store operation relies on.
pub async fn open_store(repo_root: &Path) -> Result<SqliteStore, StoreError> {
    let dir = repo_root.join(DOT_DIR);
    std::fs::create_dir_all(&dir).map_err(|err| {
        StoreError::Database(sqlx::Error::Io(err))
    })?;

    let options = SqliteConnectOptions::new()
        .filename(dir.join(DB_FILE))
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    Ok(SqliteStore::new(pool))
}

/// Handle owning the four workers; [`CoordinatorHandle::shutdown`] cancels
/// them and waits for their loops to exit.
pub struct CoordinatorHandle {
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl CoordinatorHandle {
    /// Shutdown token shared with the workers; per-attempt tokens are
    /// children of it, so cancelling stops in-flight commands too.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for handle in self.workers {
            let _ = handle.await;
        }
    }
}

/// Migrate, reconcile stale in-flight attempts from a previous process, and
/// start the four stage workers.
pub async fn start(
    store: SqliteStore,
    runner: Arc<dyn CommandRunner>,
    registry: Arc<CancelRegistry>,
    repo_root: PathBuf,
    config: &Config,
) -> Result<CoordinatorHandle, StoreError> {
    store.migrate().await?;

    // Workers still make progress without a successful reconcile; stale
    // attempts stay visible until the next restart.
    if let Err(err) = store.reconcile(&repo_root).await {
        warn!(error = %err, "reconcile of in-flight attempts failed");
    }

    let shutdown = CancellationToken::new();
    let deps = Arc::new(WorkerDeps {
        store,
        runner,
        registry,
        repo_root,
        commands: config.workers.clone(),
        hooks: config.hooks.clone(),
        poll_interval: config.poll_interval(),
        shutdown: shutdown.clone(),
    });

    info!(
        poll_interval_ms = config.core.poll_interval_ms,
        "starting stage workers"
    );
    let workers = vec![
        tokio::spawn(worker::prepare::run(deps.clone())),
        tokio::spawn(worker::produce::run(deps.clone())),
        tokio::spawn(worker::review::run(deps.clone())),
        tokio::spawn(worker::finalize::run(deps)),
    ];

    Ok(CoordinatorHandle { shutdown, workers })
}
