//! Server configuration.

use std::sync::Arc;
use std::time::Duration;

/// Tunables for a [`Server`](crate::Server).
///
/// Values that affect worker pool sizing are read once, when the
/// first server in the process starts. Everything else is read per
/// exchange.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub(crate) max_request_head_size: usize,
    pub(crate) max_error_recovery_attempts: u32,
    pub(crate) worker_pool_size: Option<usize>,
    pub(crate) reject_http_1_0: bool,
    pub(crate) head_timeout: Duration,
    pub(crate) body_timeout: Duration,
    pub(crate) response_timeout: Duration,
    pub(crate) ignore_rejected_interim: bool,
}

impl ServerConfig {
    /// A config with the defaults.
    pub fn new() -> ServerConfig {
        ServerConfig {
            max_request_head_size: 8_000,
            max_error_recovery_attempts: 5,
            worker_pool_size: None,
            reject_http_1_0: false,
            head_timeout: Duration::from_secs(30),
            body_timeout: Duration::from_secs(30),
            response_timeout: Duration::from_secs(30),
            ignore_rejected_interim: true,
        }
    }

    /// Byte cap for parsing a request head.
    pub fn max_request_head_size(&mut self, value: usize) -> &mut Self {
        self.max_request_head_size = value;
        self
    }

    /// Per-exchange cap on error-handler invocations.
    pub fn max_error_recovery_attempts(&mut self, value: u32) -> &mut Self {
        self.max_error_recovery_attempts = value;
        self
    }

    /// Workers in the process-wide pool; defaults to the core count.
    /// Only the first server started in the process decides this.
    pub fn worker_pool_size(&mut self, value: usize) -> &mut Self {
        self.worker_pool_size = Some(value);
        self
    }

    /// Responds `426 Upgrade Required` to HTTP/1.0 requests.
    pub fn reject_http_1_0(&mut self, value: bool) -> &mut Self {
        self.reject_http_1_0 = value;
        self
    }

    /// Idle-read deadline while parsing a request head.
    pub fn head_timeout(&mut self, value: Duration) -> &mut Self {
        self.head_timeout = value;
        self
    }

    /// Idle-read deadline between request body chunks.
    pub fn body_timeout(&mut self, value: Duration) -> &mut Self {
        self.body_timeout = value;
        self
    }

    /// Idle-write deadline while a response is on the wire.
    pub fn response_timeout(&mut self, value: Duration) -> &mut Self {
        self.response_timeout = value;
        self
    }

    /// Silently drops interim responses the client's HTTP version
    /// cannot carry, instead of rejecting the submission.
    pub fn ignore_rejected_interim(&mut self, value: bool) -> &mut Self {
        self.ignore_rejected_interim = value;
        self
    }

    /// An `Arc`'d clone to hand to [`Server::new`](crate::Server::new).
    pub fn done(&mut self) -> Arc<ServerConfig> {
        Arc::new(self.clone())
    }
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig::new()
    }
}
