//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use conveyor::config::Config;
use conveyor::exec::{CommandRunner, ExecError};
use conveyor::{CancelRegistry, CoordinatorHandle, CreateTaskRequest, SqliteStore, Task};

/// In-memory store with migrations applied.
pub async fn setup_store() -> SqliteStore {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .unwrap();
    let store = SqliteStore::new(pool);
    store.migrate().await.unwrap();
    store
}

/// One scripted response for a program invocation.
#[derive(Clone)]
pub enum Script {
    /// Write the given streams and exit with `code`.
    Exit {
        code: i32,
        stdout: String,
        stderr: String,
    },
    /// Hang until the attempt is cancelled.
    Block,
}

impl Script {
    pub fn ok(stdout: &str) -> Self {
        Self::Exit {
            code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn exit(code: i32) -> Self {
        Self::Exit {
            code,
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

/// Command runner that plays back scripted responses keyed by program name.
///
/// Unscripted programs succeed silently, which keeps the git plumbing in
/// prepare/finalize out of the way of scenario tests.
#[derive(Default)]
pub struct ScriptedRunner {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    invocations: Mutex<Vec<Vec<String>>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for the next invocation of `program`.
    pub fn push(&self, program: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .entry(program.to_string())
            .or_default()
            .push_back(script);
    }

    /// Queue the same response `n` times.
    pub fn push_n(&self, program: &str, script: Script, n: usize) {
        for _ in 0..n {
            self.push(program, script.clone());
        }
    }

    /// All argv vectors seen so far.
    pub fn invocations(&self) -> Vec<Vec<String>> {
        self.invocations.lock().unwrap().clone()
    }

    fn next(&self, program: &str) -> Script {
        self.scripts
            .lock()
            .unwrap()
            .get_mut(program)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(Script::Exit {
                code: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(
        &self,
        cancel: &CancellationToken,
        _dir: &Path,
        argv: &[String],
        _env: &[(String, String)],
        stdout: &mut (dyn AsyncWrite + Send + Unpin),
        stderr: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<i32, ExecError> {
        let program = argv.first().cloned().unwrap_or_default();
        self.invocations.lock().unwrap().push(argv.to_vec());
        match self.next(&program) {
            Script::Exit {
                code,
                stdout: out,
                stderr: err,
            } => {
                stdout.write_all(out.as_bytes()).await?;
                stderr.write_all(err.as_bytes()).await?;
                Ok(code)
            }
            Script::Block => {
                cancel.cancelled().await;
                Err(ExecError::Cancelled)
            }
        }
    }
}

/// A full worker setup over a temp repo root and in-memory store.
pub struct Harness {
    pub store: SqliteStore,
    pub registry: Arc<CancelRegistry>,
    pub runner: Arc<ScriptedRunner>,
    pub repo_root: tempfile::TempDir,
    pub config: Config,
    handle: Option<CoordinatorHandle>,
}

impl Harness {
    /// Store and fixtures only; call [`Harness::start_workers`] to run the
    /// coordinator (useful when a test seeds state first).
    pub async fn new(config: Config) -> Self {
        let store = setup_store().await;
        Self {
            store,
            registry: Arc::new(CancelRegistry::new()),
            runner: Arc::new(ScriptedRunner::new()),
            repo_root: tempfile::tempdir().unwrap(),
            config,
            handle: None,
        }
    }

    /// Start all four workers against the scripted runner.
    pub async fn start(config: Config) -> Self {
        let mut harness = Self::new(config).await;
        harness.start_workers().await;
        harness
    }

    /// Run the coordinator (migrate + reconcile + spawn workers).
    pub async fn start_workers(&mut self) {
        let handle = conveyor::coordinator::start(
            self.store.clone(),
            self.runner.clone(),
            self.registry.clone(),
            self.repo_root.path().to_path_buf(),
            &self.config,
        )
        .await
        .unwrap();
        self.handle = Some(handle);
    }

    pub async fn shutdown(self) {
        if let Some(handle) = self.handle {
            handle.shutdown().await;
        }
    }

    pub async fn submit(&self, task_id: &str) -> Task {
        let req = CreateTaskRequest {
            task_id: task_id.to_string(),
            prompt: "p".to_string(),
        };
        let (task, existed) = self.store.create_task(&req, &self.config.retry).await.unwrap();
        assert!(!existed);
        task
    }

    /// Poll the store until the task satisfies `pred` or the timeout hits.
    pub async fn wait_for(&self, task_id: &str, pred: impl Fn(&Task) -> bool) -> Task {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let task = self.store.get_task(task_id).await.unwrap();
            if pred(&task) {
                return task;
            }
            if tokio::time::Instant::now() > deadline {
                panic!(
                    "timed out waiting for task {task_id}; last state: phase={} status={}",
                    task.phase, task.status
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Fast-polling test config with stub stage commands.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.core.poll_interval_ms = 10;
    config.workers.produce_command = vec!["produce".to_string()];
    config.workers.review_command = vec!["review".to_string()];
    config.workers.finalize_command = vec!["publish".to_string()];
    config
}
