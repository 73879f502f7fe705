//! Pool configuration and statistics.

use serde::{Deserialize, Serialize};
use syncbridge_core::error::{ConfigError, Error, Result};

/// Pooling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    /// Bounded pool that keeps idle connections for reuse.
    #[default]
    Queue,
    /// No reuse: every acquisition opens a fresh connection and every
    /// release closes it. Safe to share across contexts that cannot
    /// coordinate affinity.
    Null,
}

/// Connection pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Pooling policy
    pub kind: PoolKind,
    /// Connections kept open for reuse
    pub max_connections: usize,
    /// Extra connections allowed under load, closed on release
    pub max_overflow: usize,
    /// Maximum time to wait for a connection in milliseconds
    pub acquire_timeout_ms: u64,
    /// Maximum lifetime of a connection in milliseconds (0 disables recycling)
    pub max_lifetime_ms: u64,
    /// Test idle connections before handing them out
    pub pre_ping: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            kind: PoolKind::Queue,
            max_connections: 10,
            max_overflow: 0,
            acquire_timeout_ms: 30_000, // 30 seconds
            max_lifetime_ms: 1_800_000, // 30 minutes
            pre_ping: false,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with the given max connections.
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            ..Default::default()
        }
    }

    /// A configuration that disables pooling.
    pub fn null() -> Self {
        Self {
            kind: PoolKind::Null,
            ..Default::default()
        }
    }

    /// Set the pooling policy.
    pub fn kind(mut self, kind: PoolKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set the overflow allowance.
    pub fn max_overflow(mut self, n: usize) -> Self {
        self.max_overflow = n;
        self
    }

    /// Set acquire timeout.
    pub fn acquire_timeout(mut self, ms: u64) -> Self {
        self.acquire_timeout_ms = ms;
        self
    }

    /// Set max lifetime.
    pub fn max_lifetime(mut self, ms: u64) -> Self {
        self.max_lifetime_ms = ms;
        self
    }

    /// Enable/disable pre-ping on checkout.
    pub fn pre_ping(mut self, enabled: bool) -> Self {
        self.pre_ping = enabled;
        self
    }

    /// Upper bound on connections open at once, or `None` when unbounded.
    pub fn capacity(&self) -> Option<usize> {
        match self.kind {
            PoolKind::Queue => Some(self.max_connections + self.max_overflow),
            PoolKind::Null => None,
        }
    }

    #[allow(clippy::result_large_err)]
    pub fn validate(&self) -> Result<()> {
        if self.kind == PoolKind::Queue && self.max_connections == 0 {
            return Err(Error::Config(ConfigError {
                message: "max_connections must be at least 1 for a queue pool".to_string(),
                source: None,
            }));
        }
        Ok(())
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total number of connections (active + idle + being opened)
    pub total_connections: usize,
    /// Number of idle connections
    pub idle_connections: usize,
    /// Number of active connections
    pub active_connections: usize,
    /// Number of pending acquire requests
    pub pending_requests: usize,
    /// Connections above `max_connections`
    pub overflow_connections: usize,
    /// Connections opened over the pool's lifetime
    pub connections_created: u64,
    /// Connections closed over the pool's lifetime
    pub connections_closed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.kind, PoolKind::Queue);
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.max_overflow, 0);
        assert_eq!(config.acquire_timeout_ms, 30_000);
        assert!(!config.pre_ping);
        assert_eq!(config.capacity(), Some(10));
    }

    #[test]
    fn test_pool_config_builder() {
        let config = PoolConfig::new(2)
            .max_overflow(3)
            .acquire_timeout(50)
            .max_lifetime(0)
            .pre_ping(true);
        assert_eq!(config.capacity(), Some(5));
        assert_eq!(config.acquire_timeout_ms, 50);
        assert_eq!(config.max_lifetime_ms, 0);
        assert!(config.pre_ping);
    }

    #[test]
    fn test_null_pool_is_unbounded() {
        let config = PoolConfig::null();
        assert_eq!(config.capacity(), None);
        assert!(PoolConfig::null().kind(PoolKind::Null).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_queue_pool() {
        assert!(matches!(
            PoolConfig::new(0).validate(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_config_from_json() {
        let config: PoolConfig =
            serde_json::from_str(r#"{"kind": "null", "acquire_timeout_ms": 5}"#).unwrap();
        assert_eq!(config.kind, PoolKind::Null);
        assert_eq!(config.acquire_timeout_ms, 5);
        assert_eq!(config.max_connections, 10);
    }
}
