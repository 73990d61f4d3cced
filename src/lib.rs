//! # Conveyor
//!
//! A durable multi-stage task orchestrator. Tasks move through a fixed
//! pipeline (prepare workspace → produce → review → finalize) with every
//! state transition persisted, so a process crash recovers cleanly.
//!
//! - **Store**: SQLite rows for tasks and attempts; transactional
//!   transitions, a single-in-flight claim per task, bounded retry budgets,
//!   and startup reconciliation of crashed attempts.
//! - **Workers**: four polling loops, one per stage, that claim tasks in
//!   their phase, run an external command in the task's workspace, stream
//!   artifacts to disk, and advance / retry / loop back / fail the task.
//! - **Cancellation**: cooperative. An external cancel flips the stored
//!   status and triggers the running attempt's in-process handle, so the
//!   child command is interrupted within milliseconds.
//!
//! The HTTP surface lives in `conveyor-server`; the thin client in
//! `conveyor-cli`.

pub mod api;
pub mod cancel;
pub mod config;
pub mod coordinator;
pub mod exec;
pub mod paths;
pub mod store;
pub mod telemetry;
pub mod worker;
pub mod workspace;

pub use api::{Attempt, AttemptStatus, CreateTaskRequest, Phase, Role, Task, TaskStatus};
pub use cancel::CancelRegistry;
pub use config::Config;
pub use coordinator::{open_store, start, CoordinatorHandle};
pub use exec::{CommandRunner, ExecError, TokioCommandRunner};
pub use store::{SqliteStore, StartedAttempt, StoreError};
pub use worker::WorkerDeps;
