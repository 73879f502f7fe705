//! Engine configuration.

use serde::{Deserialize, Serialize};
use syncbridge_core::error::{ConfigError, Error, Result};
use syncbridge_pool::PoolConfig;
use syncbridge_session::SessionConfig;
use syncbridge_trampoline::TrampolineConfig;

/// Everything an [`AsyncEngine`](crate::AsyncEngine) needs to start.
///
/// Every section has defaults, so a partial document is enough:
///
/// ```rust,ignore
/// let config = EngineConfig::from_json(r#"{"pool": {"max_connections": 2}, "echo": true}"#)?;
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub trampoline: TrampolineConfig,
    /// Defaults for sessions created by the engine
    pub session: SessionConfig,
    /// Log every statement at info level under the `syncbridge::echo` target
    pub echo: bool,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn trampoline(mut self, trampoline: TrampolineConfig) -> Self {
        self.trampoline = trampoline;
        self
    }

    pub fn session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn echo(mut self, enabled: bool) -> Self {
        self.echo = enabled;
        self
    }

    /// Parse a JSON document.
    #[allow(clippy::result_large_err)]
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| {
            Error::Config(ConfigError {
                message: format!("invalid engine configuration: {e}"),
                source: Some(Box::new(e)),
            })
        })?;
        config.validate()?;
        Ok(config)
    }

    #[allow(clippy::result_large_err)]
    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        self.trampoline.validate()
    }
}
