use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StepwiseError};

/// Top-level stepwise configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub storage: Option<StorageConfig>,
    #[serde(default)]
    pub log: LogConfig,
}

/// What to do with an error event no edge handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnroutedErrorPolicy {
    /// Log at warn level and drop the event.
    #[default]
    LogAndDrop,
    /// Abort the run with `UnroutedError`.
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Maximum supersteps per run session.
    #[serde(default = "default_max_supersteps")]
    pub max_supersteps: usize,
    /// Bound on keep-alive waits for external input (None = wait until cancelled).
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
    #[serde(default)]
    pub unrouted_errors: UnroutedErrorPolicy,
    /// Maximum concurrent instances of a map step.
    #[serde(default = "default_map_concurrency")]
    pub map_concurrency: usize,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            max_supersteps: default_max_supersteps(),
            idle_timeout_secs: None,
            unrouted_errors: UnroutedErrorPolicy::default(),
            map_concurrency: default_map_concurrency(),
        }
    }
}

impl ProcessConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}

fn default_max_supersteps() -> usize { 100 }
fn default_map_concurrency() -> usize { 8 }

/// Storage backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Database path for the sqlite backend.
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
}

impl StorageConfig {
    /// Resolve the database path (expand ~).
    pub fn resolved_path(&self) -> Option<PathBuf> {
        let path = self.path.as_deref()?;
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return Some(home.join(rest));
            }
        }
        Some(PathBuf::from(path))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String { "stepwise=info,warn".to_string() }

impl RuntimeConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StepwiseError::ConfigNotFound(path.display().to_string()))?;

        Self::parse(&content)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn parse(content: &str) -> Result<Self> {
        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| StepwiseError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.process.max_supersteps == 0 {
            return Err(StepwiseError::Config(
                "process.max_supersteps must be at least 1".into(),
            ));
        }
        if self.process.map_concurrency == 0 {
            return Err(StepwiseError::Config(
                "process.map_concurrency must be at least 1".into(),
            ));
        }
        if let Some(storage) = &self.storage {
            if storage.backend == StorageBackend::Sqlite && storage.path.is_none() {
                return Err(StepwiseError::Config(
                    "storage.path is required for the sqlite backend".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_STEPWISE_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_STEPWISE_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_STEPWISE_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_STEPWISE_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_STEPWISE_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = RuntimeConfig::parse("").unwrap();
        assert_eq!(config.process.max_supersteps, 100);
        assert_eq!(config.process.map_concurrency, 8);
        assert_eq!(config.process.unrouted_errors, UnroutedErrorPolicy::LogAndDrop);
        assert!(config.process.idle_timeout().is_none());
        assert!(config.storage.is_none());
        assert_eq!(config.log.filter, "stepwise=info,warn");
    }

    #[test]
    fn test_full_config() {
        let toml_str = r#"
[process]
max_supersteps = 12
idle_timeout_secs = 5
unrouted_errors = "fail"
map_concurrency = 2

[storage]
backend = "sqlite"
path = "/tmp/stepwise.db"

[log]
filter = "debug"
"#;
        let config = RuntimeConfig::parse(toml_str).unwrap();
        assert_eq!(config.process.max_supersteps, 12);
        assert_eq!(config.process.idle_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.process.unrouted_errors, UnroutedErrorPolicy::Fail);
        let storage = config.storage.unwrap();
        assert_eq!(storage.backend, StorageBackend::Sqlite);
        assert_eq!(
            storage.resolved_path(),
            Some(PathBuf::from("/tmp/stepwise.db"))
        );
    }

    #[test]
    fn test_sqlite_requires_path() {
        let err = RuntimeConfig::parse("[storage]\nbackend = \"sqlite\"\n").unwrap_err();
        assert!(matches!(err, StepwiseError::Config(_)));
    }

    #[test]
    fn test_zero_supersteps_rejected() {
        let err = RuntimeConfig::parse("[process]\nmax_supersteps = 0\n").unwrap_err();
        assert!(matches!(err, StepwiseError::Config(_)));
    }
}
