//! Thin client for the orchestrator HTTP API.

use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

#[derive(Parser)]
#[command(name = "conveyor", version, about = "Client for the conveyor orchestrator")]
struct Cli {
    /// Base URL of the orchestrator server.
    #[arg(long, global = true, default_value = "http://127.0.0.1:7077")]
    server: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a new task.
    Submit {
        #[arg(long)]
        task_id: String,
        #[arg(long)]
        prompt: String,
    },
    /// Show one task.
    Status { task_id: String },
    /// List tasks, newest first.
    List {
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Cancel a task; interrupts any in-flight attempt.
    Cancel { task_id: String },
    /// Fetch an attempt's log.
    Logs {
        task_id: String,
        /// Latest attempt of this role (prepare|produce|review|finalize).
        #[arg(long)]
        role: Option<String>,
        /// A specific attempt id; wins over --role.
        #[arg(long)]
        attempt_id: Option<i64>,
        /// Only the last N lines.
        #[arg(long)]
        tail: Option<u32>,
    },
    /// Delete a task's workspace and artifacts.
    Cleanup { task_id: String },
    /// Check the local environment without contacting the server.
    Doctor {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("build http client")?;
    let base = cli.server.trim_end_matches('/');

    match cli.command {
        Command::Submit { task_id, prompt } => {
            let response = client
                .post(format!("{base}/v1/tasks"))
                .json(&json!({"task_id": task_id, "prompt": prompt}))
                .send()
                .await
                .context("submit task")?;
            print_json_response(response).await
        }
        Command::Status { task_id } => {
            let response = client
                .get(format!("{base}/v1/tasks/{task_id}"))
                .send()
                .await
                .context("get task")?;
            print_json_response(response).await
        }
        Command::List { limit } => {
            let mut request = client.get(format!("{base}/v1/tasks"));
            if let Some(limit) = limit {
                request = request.query(&[("limit", limit)]);
            }
            let response = request.send().await.context("list tasks")?;
            print_json_response(response).await
        }
        Command::Cancel { task_id } => {
            let response = client
                .post(format!("{base}/v1/tasks/{task_id}/cancel"))
                .send()
                .await
                .context("cancel task")?;
            print_text_response(response).await
        }
        Command::Logs {
            task_id,
            role,
            attempt_id,
            tail,
        } => {
            let mut request = client.get(format!("{base}/v1/tasks/{task_id}/logs"));
            if let Some(id) = attempt_id {
                request = request.query(&[("attempt_id", id)]);
            } else if let Some(role) = role {
                request = request.query(&[("role", role)]);
            }
            if let Some(tail) = tail {
                request = request.query(&[("tail", tail)]);
            }
            let response = request.send().await.context("fetch logs")?;
            print_text_response(response).await
        }
        Command::Cleanup { task_id } => {
            let response = client
                .post(format!("{base}/v1/tasks/{task_id}/cleanup"))
                .send()
                .await
                .context("cleanup task")?;
            print_text_response(response).await
        }
        Command::Doctor { json } => Ok(doctor(json)),
    }
}

async fn print_json_response(response: reqwest::Response) -> Result<ExitCode> {
    let status = response.status();
    let body = response.text().await.context("read response body")?;
    if !status.is_success() {
        eprintln!("{}: {}", status, body.trim());
        return Ok(ExitCode::from(1));
    }
    match body.parse::<serde_json::Value>() {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Err(_) => println!("{body}"),
    }
    Ok(ExitCode::SUCCESS)
}

async fn print_text_response(response: reqwest::Response) -> Result<ExitCode> {
    let status = response.status();
    let body = response.text().await.context("read response body")?;
    if !status.is_success() {
        eprintln!("{}: {}", status, body.trim());
        return Ok(ExitCode::from(1));
    }
    print!("{body}");
    if !body.ends_with('\n') {
        println!();
    }
    Ok(ExitCode::SUCCESS)
}

struct DoctorCheck {
    name: &'static str,
    ok: bool,
    required: bool,
    detail: String,
}

/// Local environment checks; exit 0 when everything required passes.
fn doctor(as_json: bool) -> ExitCode {
    let mut checks = Vec::new();

    checks.push(DoctorCheck {
        name: "git",
        ok: command_exists("git"),
        required: true,
        detail: "required for workspaces and finalize".to_string(),
    });
    checks.push(DoctorCheck {
        name: "gh",
        ok: command_exists("gh"),
        required: false,
        detail: "optional, used by typical finalize commands".to_string(),
    });

    let config = Path::new(".conveyor/config.toml");
    checks.push(DoctorCheck {
        name: "config",
        ok: config.is_file(),
        required: false,
        detail: format!("{} present", config.display()),
    });

    for hook in [".conveyor/prepare.sh", ".conveyor/finalize.sh"] {
        let path = Path::new(hook);
        let ok = path.is_file() && is_executable(path);
        checks.push(DoctorCheck {
            name: if hook.contains("prepare") {
                "prepare hook"
            } else {
                "finalize hook"
            },
            ok,
            required: false,
            detail: format!("{hook} present and executable"),
        });
    }

    let problems = checks.iter().filter(|c| c.required && !c.ok).count();

    if as_json {
        let report: Vec<_> = checks
            .iter()
            .map(|c| {
                json!({
                    "name": c.name,
                    "ok": c.ok,
                    "required": c.required,
                    "detail": c.detail,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({"checks": report, "problems": problems}))
                .expect("report serializes")
        );
    } else {
        for check in &checks {
            let mark = if check.ok {
                "ok  "
            } else if check.required {
                "FAIL"
            } else {
                "warn"
            };
            println!("{mark} {:<14} {}", check.name, check.detail);
        }
    }

    if problems > 0 {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}

fn command_exists(name: &str) -> bool {
    std::process::Command::new(name)
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    false
}
