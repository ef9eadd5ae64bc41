//! Server and client configuration.

use std::time::Duration;

/// Transport server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen endpoint, an address the connection manager can bind.
    pub listen_addr: String,
    /// Maximum concurrent connections; further requests are rejected
    /// (default: 10).
    pub max_connections: usize,
    /// Fixed size in bytes of the send and receive buffers (default: 1024).
    pub buffer_size: usize,
    /// Completion queue depth per connection (default: 10).
    pub cq_depth: usize,
    /// Send/receive work queue depth per connection (default: 10).
    pub queue_depth: u32,
    /// Maximum completions drained per poll call (default: 16).
    pub poll_batch: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:20079".to_string(),
            max_connections: 10,
            buffer_size: 1024,
            cq_depth: 10,
            queue_depth: 10,
            poll_batch: 16,
        }
    }
}

/// Transport client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Fixed size in bytes of the send and receive buffers (default: 1024).
    pub buffer_size: usize,
    /// Completion queue depth (default: 10).
    pub cq_depth: usize,
    /// Send/receive work queue depth (default: 10).
    pub queue_depth: u32,
    /// Maximum completions drained per poll call (default: 16).
    pub poll_batch: usize,
    /// How long to wait for handshake events and echo responses
    /// (default: 5s).
    pub response_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1024,
            cq_depth: 10,
            queue_depth: 10,
            poll_batch: 16,
            response_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.max_connections, 10);
        assert_eq!(cfg.buffer_size, 1024);
        assert_eq!(cfg.cq_depth, 10);
        assert_eq!(cfg.poll_batch, 16);
    }

    #[test]
    fn test_client_config_default() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.buffer_size, 1024);
        assert_eq!(cfg.response_timeout, Duration::from_secs(5));
    }
}
