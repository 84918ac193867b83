//! Server configuration.

use std::time::Duration;

/// Tunables for a [`Server`](crate::Server).
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// How long the teardown of a transport-removed handler waits for
    /// in-flight deliveries to settle before forcibly cancelling the
    /// remaining calls. Server-initiated shutdown carries its own deadline;
    /// see [`Server::shutdown_deadline`](crate::Server::shutdown_deadline).
    pub drain_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(3),
        }
    }
}
