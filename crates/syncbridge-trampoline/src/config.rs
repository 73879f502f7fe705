//! Trampoline configuration.

use serde::{Deserialize, Serialize};
use syncbridge_core::error::{ConfigError, Error, Result};

/// Configuration for the worker threads that host bridge contexts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrampolineConfig {
    /// Worker threads kept alive even when no context is running
    pub min_threads: usize,
    /// Upper bound on worker threads, and so on simultaneously live contexts
    pub max_threads: usize,
    /// How long a surplus worker may sit idle before it exits, in milliseconds
    pub idle_timeout_ms: u64,
    /// Prefix of worker thread names, visible in debuggers and panics
    pub thread_name: String,
}

impl Default for TrampolineConfig {
    fn default() -> Self {
        Self {
            min_threads: 0,
            max_threads: 512,
            idle_timeout_ms: 10_000, // 10 seconds
            thread_name: "syncbridge-ctx".to_string(),
        }
    }
}

impl TrampolineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads kept alive.
    pub fn min_threads(mut self, n: usize) -> Self {
        self.min_threads = n;
        self
    }

    /// Set the maximum number of worker threads.
    pub fn max_threads(mut self, n: usize) -> Self {
        self.max_threads = n;
        self
    }

    /// Set the idle timeout in milliseconds.
    pub fn idle_timeout(mut self, ms: u64) -> Self {
        self.idle_timeout_ms = ms;
        self
    }

    /// Set the worker thread name prefix.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    #[allow(clippy::result_large_err)]
    pub fn validate(&self) -> Result<()> {
        if self.max_threads == 0 {
            return Err(config_error("max_threads must be at least 1".to_string()));
        }
        if self.min_threads > self.max_threads {
            return Err(config_error(format!(
                "min_threads ({}) exceeds max_threads ({})",
                self.min_threads, self.max_threads
            )));
        }
        Ok(())
    }
}

fn config_error(message: String) -> Error {
    Error::Config(ConfigError {
        message,
        source: None,
    })
}
