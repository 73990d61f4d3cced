//! Configuration stored under `.conveyor/config.toml`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::paths::DOT_DIR;

/// Top-level configuration (TOML). Missing sections and fields fall back to
/// defaults, so a partial file is always valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub core: CoreConfig,
    pub retry: RetryConfig,
    pub workers: WorkersConfig,
    pub hooks: HooksConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Worker polling interval in milliseconds.
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Failed produce attempts allowed before the task fails.
    pub produce_budget: i64,
    /// Failed review attempts (command errors) allowed before the task fails.
    pub review_stage_budget: i64,
    /// `changes_requested` loop-backs allowed before the task fails.
    pub review_loop_budget: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    /// Argv for the produce stage command, run in the task workspace.
    pub produce_command: Vec<String>,
    /// Argv for the review stage command; stdout carries the decision JSON.
    pub review_command: Vec<String>,
    /// Argv for the finalize stage publish command.
    pub finalize_command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    pub enabled: bool,
    /// Repo-relative path of the prepare hook script.
    pub prepare_path: String,
    /// Repo-relative path of the finalize hook script.
    pub finalize_path: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            produce_budget: 3,
            review_stage_budget: 3,
            review_loop_budget: 2,
        }
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            produce_command: vec!["echo".into(), "produce-stub".into()],
            review_command: vec!["echo".into(), r#"{"decision":"approved"}"#.into()],
            finalize_command: vec!["echo".into(), "finalize-stub".into()],
        }
    }
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prepare_path: format!("{DOT_DIR}/prepare.sh"),
            finalize_path: format!("{DOT_DIR}/finalize.sh"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            core: CoreConfig::default(),
            retry: RetryConfig::default(),
            workers: WorkersConfig::default(),
            hooks: HooksConfig::default(),
        }
    }
}

impl Config {
    /// Worker polling interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.core.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.core.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("core.poll_interval_ms must be > 0"));
        }
        if self.retry.produce_budget <= 0 {
            return Err(ConfigError::Invalid("retry.produce_budget must be > 0"));
        }
        if self.retry.review_stage_budget <= 0 {
            return Err(ConfigError::Invalid(
                "retry.review_stage_budget must be > 0",
            ));
        }
        if self.retry.review_loop_budget <= 0 {
            return Err(ConfigError::Invalid("retry.review_loop_budget must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(&'static str),

    #[error("read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Load config from `<repo_root>/.conveyor/config.toml`.
///
/// A missing file yields `Config::default()`; a present-but-broken file is
/// an error so a typo never silently reverts to defaults.
pub fn load(repo_root: &Path) -> Result<Config, ConfigError> {
    let path = repo_root.join(DOT_DIR).join("config.toml");
    let display = path.display().to_string();
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let cfg = Config::default();
            cfg.validate()?;
            return Ok(cfg);
        }
        Err(err) => {
            return Err(ConfigError::Read {
                path: display,
                source: err,
            })
        }
    };
    let cfg: Config = toml::from_str(&contents).map_err(|err| ConfigError::Parse {
        path: display,
        source: err,
    })?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load(temp.path()).expect("load");
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join(DOT_DIR);
        std::fs::create_dir_all(&dir).expect("mkdir");
        std::fs::write(
            dir.join("config.toml"),
            "[retry]\nproduce_budget = 5\n\n[workers]\nproduce_command = [\"false\"]\n",
        )
        .expect("write");

        let cfg = load(temp.path()).expect("load");
        assert_eq!(cfg.retry.produce_budget, 5);
        assert_eq!(cfg.retry.review_loop_budget, 2);
        assert_eq!(cfg.workers.produce_command, vec!["false".to_string()]);
        assert_eq!(cfg.core.poll_interval_ms, 50);
    }

    #[test]
    fn broken_file_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join(DOT_DIR);
        std::fs::create_dir_all(&dir).expect("mkdir");
        std::fs::write(dir.join("config.toml"), "retry = \"nope\"").expect("write");
        assert!(load(temp.path()).is_err());
    }

    #[test]
    fn zero_poll_interval_rejected() {
        let mut cfg = Config::default();
        cfg.core.poll_interval_ms = 0;
        assert!(cfg.validate().is_err());
    }
}
