//! Shared directory configuration
//!
//! Connection timeouts and pool sizing used by every directory backend.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{DirectoryError, DirectoryResult};

/// Common connection and pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Connection timeout in seconds.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Per-operation timeout in seconds.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Connections opened eagerly when the pool is built.
    #[serde(default = "default_pool_min")]
    pub pool_min_size: u32,

    /// Upper bound on concurrently checked-out connections.
    #[serde(default = "default_pool_max")]
    pub pool_max_size: u32,

    /// How long a checkout waits for a free connection, in milliseconds.
    #[serde(default = "default_checkout_timeout_ms")]
    pub checkout_timeout_ms: u64,
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_read_timeout() -> u64 {
    60
}

fn default_pool_min() -> u32 {
    1
}

fn default_pool_max() -> u32 {
    10
}

fn default_checkout_timeout_ms() -> u64 {
    5_000
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connection_timeout_secs: default_connection_timeout(),
            read_timeout_secs: default_read_timeout(),
            pool_min_size: default_pool_min(),
            pool_max_size: default_pool_max(),
            checkout_timeout_ms: default_checkout_timeout_ms(),
        }
    }
}

impl ConnectionSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection timeout.
    pub fn with_connection_timeout(mut self, secs: u64) -> Self {
        self.connection_timeout_secs = secs;
        self
    }

    /// Set the read timeout.
    pub fn with_read_timeout(mut self, secs: u64) -> Self {
        self.read_timeout_secs = secs;
        self
    }

    /// Set the pool bounds.
    pub fn with_pool_size(mut self, min: u32, max: u32) -> Self {
        self.pool_min_size = min;
        self.pool_max_size = max;
        self
    }

    pub fn with_checkout_timeout_ms(mut self, ms: u64) -> Self {
        self.checkout_timeout_ms = ms;
        self
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_millis(self.checkout_timeout_ms)
    }

    /// Validate pool bounds and timeouts.
    pub fn validate(&self) -> DirectoryResult<()> {
        if self.pool_max_size == 0 {
            return Err(DirectoryError::invalid_configuration(
                "pool_max_size must be greater than zero",
            ));
        }
        if self.pool_min_size > self.pool_max_size {
            return Err(DirectoryError::invalid_configuration(format!(
                "pool_min_size ({}) exceeds pool_max_size ({})",
                self.pool_min_size, self.pool_max_size
            )));
        }
        if self.connection_timeout_secs == 0 {
            return Err(DirectoryError::invalid_configuration(
                "connection_timeout_secs must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_json() {
        let settings: ConnectionSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings, ConnectionSettings::default());
        assert_eq!(settings.checkout_timeout(), Duration::from_secs(5));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_pool_bounds_validation() {
        assert!(ConnectionSettings::new()
            .with_pool_size(0, 0)
            .validate()
            .is_err());
        assert!(ConnectionSettings::new()
            .with_pool_size(5, 2)
            .validate()
            .is_err());
        assert!(ConnectionSettings::new()
            .with_pool_size(2, 2)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_zero_connect_timeout_rejected() {
        assert!(ConnectionSettings::new()
            .with_connection_timeout(0)
            .validate()
            .is_err());
    }
}
