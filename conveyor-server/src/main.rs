//! Orchestrator daemon: store + workers + HTTP surface in one process.

use std::sync::Arc;

use anyhow::Context;
use tower_http::trace::TraceLayer;
use tracing::info;

use conveyor::exec::{CommandRunner, TokioCommandRunner};
use conveyor::{telemetry, CancelRegistry};
use conveyor_server::{router, AppState, DEFAULT_ADDR};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();

    let repo_root = std::env::current_dir().context("resolve working directory")?;
    let config = conveyor::config::load(&repo_root).context("load config")?;

    let store = conveyor::open_store(&repo_root)
        .await
        .context("open store")?;
    let registry = Arc::new(CancelRegistry::new());
    let runner: Arc<dyn CommandRunner> = Arc::new(TokioCommandRunner);

    // Migrates, reconciles in-flight attempts from a prior crash, then
    // starts the four stage workers.
    let coordinator = conveyor::coordinator::start(
        store.clone(),
        runner,
        registry.clone(),
        repo_root.clone(),
        &config,
    )
    .await
    .context("start coordinator")?;

    let state = Arc::new(AppState {
        store,
        registry,
        repo_root,
        retry: config.retry,
    });
    let app = router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(DEFAULT_ADDR)
        .await
        .with_context(|| format!("bind {DEFAULT_ADDR}"))?;
    info!("conveyor-server listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("serve")?;

    coordinator.shutdown().await;
    Ok(())
}
