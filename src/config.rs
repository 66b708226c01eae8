//! Server configuration

use crate::storage::ExpiryConfig;
use crate::{DEFAULT_HOST, DEFAULT_PORT};
use std::time::Duration;

/// Default limit on concurrently served connections
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;

/// Default time active connections get to finish during shutdown
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything needed to start a [`Server`](crate::server::Server).
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on (0 picks a free port)
    pub port: u16,

    /// Connections beyond this are answered with an error and closed
    pub max_connections: usize,

    /// How long shutdown waits for connections before aborting them
    pub shutdown_timeout: Duration,

    /// Key limit; inserting past it evicts the least recently used key.
    /// `None` leaves the store unbounded.
    pub max_keys: Option<usize>,

    /// Background expiry sweeper settings
    pub expiry: ExpiryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            max_keys: None,
            expiry: ExpiryConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Returns the bind address as a string
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_address(), "127.0.0.1:8080");
        assert_eq!(config.max_connections, 1024);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(config.max_keys, None);
    }

    #[test]
    fn test_bind_address() {
        let config = ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 9000,
            ..Default::default()
        };
        assert_eq!(config.bind_address(), "0.0.0.0:9000");
    }
}
